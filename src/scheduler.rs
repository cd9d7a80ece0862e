//! The scheduler owns a keyed collection of tasks and runs the selection
//! loop.
//!
//! The loop picks the task with the soonest planned fire, sleeps until that
//! instant, and dispatches the fire on a fresh worker. Tasks report timer
//! changes over a buffered update channel; the loop is the only writer of
//! its own run queue, so a reschedule is just a stable re-sort. Tasks whose
//! next run is unset sort to the end and are skipped, not removed; they
//! re-enter naturally once their timer is refreshed.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::Utc;
use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::errors::{SchedulerError, SchedulerResult};
use crate::job::JobFn;
use crate::metrics;
use crate::options::{SchedulerOptions, TaskOptions};
use crate::task::Task;
use crate::timer::Timer;

/// Capacity of the reschedule mailbox. Generous so a task's fire pass does
/// not block reporting a timer change under normal load; a full channel is
/// backpressure, not an error.
const UPDATE_CHANNEL_CAPACITY: usize = 128;

/// A reschedule notification from a task to the selection loop.
#[derive(Debug, Clone)]
pub(crate) struct UpdateSignal {
    /// Id of the task whose timer changed.
    pub(crate) id: String,
}

struct SchedulerInner {
    tasks: RwLock<HashMap<String, Arc<Task>>>,
    run_queue: RwLock<Vec<Arc<Task>>>,
    update_tx: async_channel::Sender<UpdateSignal>,
    options: SchedulerOptions,
}

/// Manages named tasks: registration, activation, and the global selection
/// loop that drives [`Task::run`] fires.
pub struct Scheduler {
    inner: Arc<SchedulerInner>,
}

impl Scheduler {
    /// Create a scheduler and spawn its selection loop. Options apply to
    /// every task subsequently added.
    pub fn new(options: SchedulerOptions) -> Self {
        let (update_tx, update_rx) = async_channel::bounded(UPDATE_CHANNEL_CAPACITY);
        let inner = Arc::new(SchedulerInner {
            tasks: RwLock::new(HashMap::new()),
            run_queue: RwLock::new(Vec::new()),
            update_tx,
            options,
        });

        tokio::spawn(schedule_loop(Arc::downgrade(&inner), update_rx));
        Self { inner }
    }

    /// Register a task under `id`, driven by `timer`, running `job`.
    ///
    /// `ctx` is handed to every job instance; cancelling it terminates
    /// current runs cooperatively and prevents future ones from doing work.
    /// `extra` options are appended after the scheduler-level options.
    pub async fn add<F, Fut>(
        &self,
        ctx: CancellationToken,
        id: impl Into<String>,
        timer: Box<dyn Timer>,
        job: F,
        extra: TaskOptions,
    ) -> SchedulerResult<()>
    where
        F: Fn(CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let id = id.into();
        let mut tasks = self.inner.tasks.write().await;
        if tasks.contains_key(&id) {
            return Err(SchedulerError::ScheduleExists(id));
        }

        let job_fn: JobFn = Arc::new(move |ctx| -> BoxFuture<'static, ()> { job(ctx).boxed() });
        let options = self.inner.options.task_options.clone().merge(extra);
        let task = Task::new(
            ctx,
            id.clone(),
            timer,
            job_fn,
            options,
            self.inner.update_tx.clone(),
        );
        tasks.insert(id.clone(), task);
        metrics::JOBS.set(tasks.len() as i64);
        info!(taskid = %id, "added new task");
        Ok(())
    }

    /// Activate the task with `id` and enqueue it for selection.
    pub async fn start(&self, id: &str) -> SchedulerResult<()> {
        let task = self.lookup(id).await?;
        task.start().await;

        {
            let mut queue = self.inner.run_queue.write().await;
            if !queue.iter().any(|t| t.get_id() == id) {
                queue.push(Arc::clone(&task));
            }
        }
        if self
            .inner
            .update_tx
            .send(UpdateSignal { id: id.to_string() })
            .await
            .is_err()
        {
            error!(taskid = %id, "selection loop is gone");
        }
        info!(taskid = %id, "started task");
        Ok(())
    }

    /// Activate every registered task.
    pub async fn start_all(&self) {
        info!("starting all tasks");
        let ids: Vec<String> = {
            let tasks = self.inner.tasks.read().await;
            tasks.keys().cloned().collect()
        };
        for id in ids {
            if let Err(e) = self.start(&id).await {
                error!(taskid = %id, error = %e, "failed to start task");
            }
        }
    }

    /// Remove the task with `id` from selection and block until its
    /// in-flight job instances have returned.
    pub async fn stop(&self, id: &str) -> SchedulerResult<()> {
        let task = self.lookup(id).await?;
        self.inner
            .run_queue
            .write()
            .await
            .retain(|t| t.get_id() != id);
        task.stop().await;
        Ok(())
    }

    /// Stop every task concurrently; returns once all of them have stopped.
    pub async fn stop_all(&self) {
        info!("stopping all tasks");
        self.inner.run_queue.write().await.clear();
        let tasks: Vec<Arc<Task>> = {
            let tasks = self.inner.tasks.read().await;
            tasks.values().cloned().collect()
        };
        futures::future::join_all(tasks.iter().map(|t| t.stop())).await;
    }

    /// Look up one task.
    pub async fn get_schedule(&self, id: &str) -> SchedulerResult<Arc<Task>> {
        self.lookup(id).await
    }

    /// Snapshot of every registered task.
    pub async fn get_all_schedules(&self) -> HashMap<String, Arc<Task>> {
        self.inner.tasks.read().await.clone()
    }

    async fn lookup(&self, id: &str) -> SchedulerResult<Arc<Task>> {
        self.inner
            .tasks
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| SchedulerError::ScheduleNotFound(id.to_string()))
    }
}

impl SchedulerInner {
    /// First queue entry with a planned fire. The queue is kept sorted
    /// ascending with unscheduled tasks at the end, so scanning in order
    /// finds the soonest one.
    async fn next_due_task(&self) -> Option<Arc<Task>> {
        let queue = self.run_queue.read().await;
        queue.iter().find(|t| t.get_next_run().is_some()).cloned()
    }

    /// Stable sort: ascending by next run, unscheduled entries last, ties
    /// kept in registration order.
    async fn resort_run_queue(&self) {
        let mut queue = self.run_queue.write().await;
        queue.sort_by(|a, b| match (a.get_next_run(), b.get_next_run()) {
            (None, None) => std::cmp::Ordering::Equal,
            (None, Some(_)) => std::cmp::Ordering::Greater,
            (Some(_), None) => std::cmp::Ordering::Less,
            (Some(x), Some(y)) => x.cmp(&y),
        });
        for task in queue.iter() {
            debug!(
                taskid = %task.get_id(),
                next = ?task.get_next_run(),
                "run queue entry"
            );
        }
    }
}

async fn schedule_loop(
    inner: Weak<SchedulerInner>,
    update_rx: async_channel::Receiver<UpdateSignal>,
) {
    debug!("selection loop started");
    loop {
        let next = match inner.upgrade() {
            Some(strong) => strong.next_due_task().await,
            None => break,
        };

        match next {
            Some(task) => {
                let at = match task.get_next_run() {
                    Some(at) => at,
                    // refreshed concurrently; re-select
                    None => continue,
                };
                // a past instant is fired now, not dropped
                let wait = (at - Utc::now()).to_std().unwrap_or(Duration::ZERO);
                debug!(taskid = %task.get_id(), wait = ?wait, "next scheduler fire");

                tokio::select! {
                    _ = tokio::time::sleep(wait) => {
                        debug!(taskid = %task.get_id(), "dispatching fire");
                        task.clear_next_run();
                        tokio::spawn(Arc::clone(&task).run());
                    }
                    signal = update_rx.recv() => {
                        match signal {
                            Ok(signal) => {
                                debug!(taskid = %signal.id, "reschedule signal");
                                match inner.upgrade() {
                                    Some(strong) => strong.resort_run_queue().await,
                                    None => break,
                                }
                            }
                            Err(_) => break,
                        }
                    }
                }
            }
            None => match update_rx.recv().await {
                Ok(signal) => {
                    debug!(taskid = %signal.id, "reschedule signal");
                    match inner.upgrade() {
                        Some(strong) => strong.resort_run_queue().await,
                        None => break,
                    }
                }
                Err(_) => break,
            },
        }
    }
    debug!("selection loop ended");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::timer::{Fixed, Once};
    use serial_test::serial;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    #[serial]
    async fn jobs_gauge_tracks_registrations() {
        let sched = Scheduler::new(SchedulerOptions::new());
        for id in ["g-a", "g-b", "g-c"] {
            sched
                .add(
                    CancellationToken::new(),
                    id,
                    Box::new(Once::new(Duration::from_secs(3600))),
                    |_ctx| async {},
                    TaskOptions::new(),
                )
                .await
                .expect("add");
        }
        assert_eq!(metrics::JOBS.get(), 3);
    }

    #[tokio::test]
    #[serial]
    async fn add_rejects_duplicate_ids() {
        let sched = Scheduler::new(SchedulerOptions::new());
        sched
            .add(
                CancellationToken::new(),
                "dup",
                Box::new(Once::new(Duration::from_secs(3600))),
                |_ctx| async {},
                TaskOptions::new(),
            )
            .await
            .expect("first add succeeds");

        let err = sched
            .add(
                CancellationToken::new(),
                "dup",
                Box::new(Once::new(Duration::from_secs(3600))),
                |_ctx| async {},
                TaskOptions::new(),
            )
            .await
            .expect_err("duplicate id rejected");
        assert!(matches!(err, SchedulerError::ScheduleExists(_)));
    }

    #[tokio::test]
    #[serial]
    async fn unknown_ids_are_not_found() {
        let sched = Scheduler::new(SchedulerOptions::new());
        assert!(matches!(
            sched.start("ghost").await,
            Err(SchedulerError::ScheduleNotFound(_))
        ));
        assert!(matches!(
            sched.stop("ghost").await,
            Err(SchedulerError::ScheduleNotFound(_))
        ));
        assert!(matches!(
            sched.get_schedule("ghost").await,
            Err(SchedulerError::ScheduleNotFound(_))
        ));
    }

    #[tokio::test]
    #[serial]
    async fn once_task_fires_exactly_once() {
        let fired = Arc::new(AtomicUsize::new(0));
        let fired2 = Arc::clone(&fired);

        let sched = Scheduler::new(SchedulerOptions::new());
        sched
            .add(
                CancellationToken::new(),
                "once",
                Box::new(Once::new(Duration::from_millis(50))),
                move |_ctx| {
                    let fired = Arc::clone(&fired2);
                    async move {
                        fired.fetch_add(1, Ordering::SeqCst);
                    }
                },
                TaskOptions::new(),
            )
            .await
            .expect("add");
        sched.start("once").await.expect("start");

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        sched.stop("once").await.expect("stop");
    }

    #[tokio::test]
    #[serial]
    async fn fixed_task_fires_repeatedly() {
        let fired = Arc::new(AtomicUsize::new(0));
        let fired2 = Arc::clone(&fired);

        let sched = Scheduler::new(SchedulerOptions::new());
        sched
            .add(
                CancellationToken::new(),
                "ticker",
                Box::new(Fixed::new(Duration::from_millis(100))),
                move |_ctx| {
                    let fired = Arc::clone(&fired2);
                    async move {
                        fired.fetch_add(1, Ordering::SeqCst);
                    }
                },
                TaskOptions::new(),
            )
            .await
            .expect("add");
        sched.start("ticker").await.expect("start");

        tokio::time::sleep(Duration::from_millis(550)).await;
        sched.stop("ticker").await.expect("stop");

        let count = fired.load(Ordering::SeqCst);
        assert!((3..=8).contains(&count), "fired {count} times");
    }

    #[tokio::test]
    #[serial]
    async fn get_all_schedules_is_a_snapshot() {
        let sched = Scheduler::new(SchedulerOptions::new());
        sched
            .add(
                CancellationToken::new(),
                "a",
                Box::new(Once::new(Duration::from_secs(3600))),
                |_ctx| async {},
                TaskOptions::new(),
            )
            .await
            .expect("add");

        let snapshot = sched.get_all_schedules().await;
        assert_eq!(snapshot.len(), 1);
        assert!(snapshot.contains_key("a"));
    }
}
