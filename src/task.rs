//! A task couples a timer, a job factory, and middleware chains.
//!
//! The scheduler invokes [`Task::run`] once per fire. One pass walks the
//! pre-execution chain, dispatches a job instance on its own worker if the
//! chain lets it through, re-arms the timer immediately (this is what makes
//! overlapping instances possible when no middleware forbids them), awaits
//! the attempt, and walks the post-execution and retry chains.
//!
//! Lock discipline: the task never holds any of its locks while running user
//! code or middleware. `next_run` has its own lock so the scheduler's
//! selection loop can read it without contending with a pass in progress.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use tokio::sync::{oneshot, Mutex, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::errors::JobFailure;
use crate::extensions::Extensions;
use crate::job::{Job, JobFn, JobRegistry, JobState};
use crate::metrics;
use crate::middleware::{
    ExecDecision, ExecOutcome, ExecutionMiddleware, RetryDecision, RetryMiddleware, RetryPhase,
};
use crate::options::TaskOptions;
use crate::scheduler::UpdateSignal;
use crate::timer::Timer;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    New,
    Active,
    Stopped,
}

/// Counts in-flight job workers so stop can join them.
struct WaitGroup {
    count: AtomicUsize,
    zero: Notify,
}

impl WaitGroup {
    fn new() -> Self {
        Self {
            count: AtomicUsize::new(0),
            zero: Notify::new(),
        }
    }

    fn add(&self) {
        self.count.fetch_add(1, Ordering::SeqCst);
    }

    fn done(&self) {
        if self.count.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.zero.notify_waiters();
        }
    }

    async fn wait(&self) {
        loop {
            let notified = self.zero.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.count.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }
}

/// A named schedulable unit owned by a [`Scheduler`](crate::Scheduler).
pub struct Task {
    id: String,
    job_fn: JobFn,
    ctx: CancellationToken,
    timer: Mutex<Box<dyn Timer>>,
    next_run: RwLock<Option<DateTime<Utc>>>,
    update_tx: async_channel::Sender<UpdateSignal>,
    exec_middlewares: Vec<Arc<dyn ExecutionMiddleware>>,
    retry_middlewares: Vec<Arc<dyn RetryMiddleware>>,
    active_jobs: JobRegistry,
    extensions: Mutex<Extensions>,
    lifecycle: Mutex<Lifecycle>,
    wait: WaitGroup,
}

impl Task {
    pub(crate) fn new(
        ctx: CancellationToken,
        id: String,
        mut timer: Box<dyn Timer>,
        job_fn: JobFn,
        options: TaskOptions,
        update_tx: async_channel::Sender<UpdateSignal>,
    ) -> Arc<Self> {
        let first = timer.next();
        Arc::new(Self {
            id,
            job_fn,
            ctx,
            timer: Mutex::new(timer),
            next_run: RwLock::new(first),
            update_tx,
            exec_middlewares: options.execution_middlewares,
            retry_middlewares: options.retry_middlewares,
            active_jobs: JobRegistry::default(),
            extensions: Mutex::new(Extensions::new()),
            lifecycle: Mutex::new(Lifecycle::New),
            wait: WaitGroup::new(),
        })
    }

    /// The task's id, stable for its lifetime.
    pub fn get_id(&self) -> &str {
        &self.id
    }

    /// The next planned dispatch instant; `None` means "not scheduled" and
    /// the selection loop skips the task until the timer is refreshed.
    pub fn get_next_run(&self) -> Option<DateTime<Utc>> {
        *self.next_run.read().expect("next_run lock poisoned")
    }

    /// Number of job instances currently running.
    pub fn active_jobs(&self) -> usize {
        self.active_jobs.len()
    }

    /// Run `f` against this task's type-keyed sidecar. Middleware keep their
    /// per-task state here.
    pub async fn with_extensions<R>(&self, f: impl FnOnce(&mut Extensions) -> R) -> R {
        let mut ext = self.extensions.lock().await;
        f(&mut ext)
    }

    /// Activate the task: initialize every middleware and mark it up.
    ///
    /// Dispatching is driven by the scheduler; start itself neither blocks
    /// nor spawns. Starting an already active task is a no-op with a
    /// warning.
    pub async fn start(&self) {
        {
            let mut lc = self.lifecycle.lock().await;
            if *lc == Lifecycle::Active {
                warn!(taskid = %self.id, "task already started");
                return;
            }
            *lc = Lifecycle::Active;
        }
        info!(taskid = %self.id, "task started");
        metrics::UP.with_label_values(&[&self.id]).set(1);

        for mw in &self.exec_middlewares {
            debug!(taskid = %self.id, middleware = mw.name(), "initializing execution middleware");
            mw.initialize(self).await;
        }
        for mw in &self.retry_middlewares {
            debug!(taskid = %self.id, middleware = mw.name(), "initializing retry middleware");
            mw.initialize(self).await;
        }
    }

    /// Deactivate the task and block until every in-flight job instance has
    /// returned. Idempotent; does not cancel the user context.
    pub async fn stop(&self) {
        {
            let mut lc = self.lifecycle.lock().await;
            if *lc != Lifecycle::Active {
                debug!(taskid = %self.id, "stop on inactive task");
                return;
            }
            *lc = Lifecycle::Stopped;
        }
        info!(taskid = %self.id, "stopping task");
        metrics::STOPS.with_label_values(&[&self.id]).inc();

        let active = self.active_jobs.len();
        if active > 0 {
            info!(taskid = %self.id, jobs = active, "waiting for active jobs");
        }
        self.wait.wait().await;

        metrics::UP.with_label_values(&[&self.id]).set(0);
        info!(taskid = %self.id, "task stopped");
    }

    /// One scheduler-triggered fire.
    pub(crate) async fn run(self: Arc<Self>) {
        debug!(taskid = %self.id, "checking pre-execution middleware");
        let outcome = self.run_pre_chain().await;
        match outcome.decision {
            ExecDecision::Cancel => {
                debug!(taskid = %self.id, "fire cancelled by middleware");
                self.refresh_next_run().await;
                self.signal_reschedule().await;
                return;
            }
            ExecDecision::Defer => {
                debug!(taskid = %self.id, "fire deferred, consulting retry middleware");
                self.run_retry_chain(RetryPhase::PreRun, outcome.failure.as_ref())
                    .await;
                self.refresh_next_run().await;
                self.signal_reschedule().await;
                return;
            }
            ExecDecision::NextMw => {}
        }

        debug!(taskid = %self.id, "dispatching job");
        let job = Job::new(self.ctx.clone(), Arc::clone(&self.job_fn));
        let (result_tx, result_rx) = oneshot::channel();
        self.wait.add();
        tokio::spawn(Arc::clone(&self).run_job_instance(Arc::clone(&job), result_tx));

        // Re-arm before the attempt finishes; overlap policy belongs to
        // middleware, not to the core.
        self.refresh_next_run().await;
        self.signal_reschedule().await;

        match result_rx.await {
            Ok(Some(failure)) => {
                metrics::FAILED_JOBS.with_label_values(&[&self.id]).inc();
                let decision = self.run_post_chain(Some(&failure)).await;
                if decision == ExecDecision::Defer {
                    debug!(taskid = %self.id, "post-execution chain requested retry");
                    self.run_retry_chain(RetryPhase::PostRun, Some(&failure))
                        .await;
                }
            }
            Ok(None) => {
                metrics::SUCCEEDED_JOBS.with_label_values(&[&self.id]).inc();
                self.run_post_chain(None).await;
            }
            Err(_) => {
                error!(taskid = %self.id, "job worker dropped without reporting a result");
            }
        }

        self.refresh_next_run().await;
        self.signal_reschedule().await;
    }

    async fn run_job_instance(
        self: Arc<Self>,
        job: Arc<Job>,
        result_tx: oneshot::Sender<Option<JobFailure>>,
    ) {
        debug!(taskid = %self.id, jobid = %job.id(), "job run starting");
        self.active_jobs.add(Arc::clone(&job));
        metrics::RUNS.with_label_values(&[&self.id]).inc();
        if self.active_jobs.len() > 1 {
            metrics::OVERLAPPING_RUNS
                .with_label_values(&[&self.id])
                .inc();
        }

        let result = job.run().await;

        self.active_jobs.remove(job.id());
        if job.state() == JobState::Cancelled {
            metrics::CONTEXT_CANCELS.with_label_values(&[&self.id]).inc();
        }

        let duration = job.actual_elapsed().unwrap_or_default();
        match result {
            Err(failure) => {
                metrics::RUN_ERRORS.with_label_values(&[&self.id]).inc();
                error!(
                    taskid = %self.id,
                    jobid = %job.id(),
                    duration = ?duration,
                    state = %job.state(),
                    error = %failure,
                    "job error"
                );
                let _ = result_tx.send(Some(failure));
            }
            Ok(()) => {
                info!(
                    taskid = %self.id,
                    jobid = %job.id(),
                    duration = ?duration,
                    state = %job.state(),
                    "job finished"
                );
                let _ = result_tx.send(None);
            }
        }
        self.wait.done();
    }

    async fn run_pre_chain(&self) -> ExecOutcome {
        for mw in &self.exec_middlewares {
            debug!(taskid = %self.id, middleware = mw.name(), "running pre-execution handler");
            metrics::PRE_EXECUTION_RUNS
                .with_label_values(&[&self.id, mw.name()])
                .inc();

            let outcome = match AssertUnwindSafe(mw.pre_handler(self)).catch_unwind().await {
                Ok(outcome) => outcome,
                Err(_) => {
                    error!(taskid = %self.id, middleware = mw.name(), "pre-execution handler panicked");
                    return ExecOutcome::cancel();
                }
            };
            if let Some(failure) = &outcome.failure {
                debug!(
                    taskid = %self.id,
                    middleware = mw.name(),
                    result = ?outcome.decision,
                    error = %failure,
                    "pre-execution handler reported failure"
                );
            }

            match outcome.decision {
                ExecDecision::NextMw => continue,
                ExecDecision::Defer => {
                    metrics::DEFERRED_JOBS.with_label_values(&[&self.id]).inc();
                    return outcome;
                }
                ExecDecision::Cancel => return outcome,
            }
        }
        ExecOutcome::next_mw()
    }

    async fn run_post_chain(&self, failure: Option<&JobFailure>) -> ExecDecision {
        for mw in &self.exec_middlewares {
            debug!(taskid = %self.id, middleware = mw.name(), "running post-execution handler");
            metrics::POST_EXECUTION_RUNS
                .with_label_values(&[&self.id, mw.name()])
                .inc();

            let decision = match AssertUnwindSafe(mw.post_handler(self, failure))
                .catch_unwind()
                .await
            {
                Ok(decision) => decision,
                Err(_) => {
                    error!(taskid = %self.id, middleware = mw.name(), "post-execution handler panicked");
                    return ExecDecision::Cancel;
                }
            };

            match decision {
                ExecDecision::NextMw => continue,
                ExecDecision::Defer => return ExecDecision::Defer,
                ExecDecision::Cancel => return ExecDecision::Cancel,
            }
        }
        ExecDecision::NextMw
    }

    async fn run_retry_chain(&self, phase: RetryPhase, failure: Option<&JobFailure>) {
        for mw in &self.retry_middlewares {
            debug!(taskid = %self.id, middleware = mw.name(), phase = phase.as_str(), "running retry handler");
            metrics::RETRY_RUNS
                .with_label_values(&[&self.id, mw.name(), phase.as_str()])
                .inc();

            let handled = match AssertUnwindSafe(mw.handler(self, phase, failure))
                .catch_unwind()
                .await
            {
                Ok(handled) => handled,
                Err(_) => {
                    error!(taskid = %self.id, middleware = mw.name(), "retry handler panicked");
                    return;
                }
            };

            let decision = match handled {
                Ok(decision) => decision,
                Err(mw_failure) => {
                    error!(
                        taskid = %self.id,
                        middleware = mw.name(),
                        error = %mw_failure,
                        "retry middleware misconfigured"
                    );
                    metrics::RETRY_SKIPS
                        .with_label_values(&[&self.id, mw.name(), phase.as_str()])
                        .inc();
                    continue;
                }
            };

            match decision {
                RetryDecision::Retry(delay) => {
                    debug!(
                        taskid = %self.id,
                        middleware = mw.name(),
                        duration = ?delay,
                        result = "retry",
                        "retry middleware re-armed the timer"
                    );
                    metrics::RETRY_RETRIES
                        .with_label_values(&[&self.id, mw.name(), phase.as_str()])
                        .inc();
                    self.reschedule_timer(delay).await;
                    return;
                }
                RetryDecision::NoRetry => {
                    debug!(
                        taskid = %self.id,
                        middleware = mw.name(),
                        result = "no-retry",
                        "retry middleware stopped the chain"
                    );
                    metrics::RETRY_NORETRIES
                        .with_label_values(&[&self.id, mw.name(), phase.as_str()])
                        .inc();
                    return;
                }
                RetryDecision::NextMw => {
                    metrics::RETRY_SKIPS
                        .with_label_values(&[&self.id, mw.name(), phase.as_str()])
                        .inc();
                    continue;
                }
            }
        }
    }

    async fn reschedule_timer(&self, delay: Duration) {
        self.timer.lock().await.reschedule(delay);
        metrics::RESCHEDULES.with_label_values(&[&self.id]).inc();
    }

    async fn refresh_next_run(&self) {
        let next = self.timer.lock().await.next();
        *self.next_run.write().expect("next_run lock poisoned") = next;
    }

    /// Mark the task "not scheduled" while a fire is in flight; the fire
    /// itself re-populates `next_run` and signals the scheduler.
    pub(crate) fn clear_next_run(&self) {
        *self.next_run.write().expect("next_run lock poisoned") = None;
    }

    async fn signal_reschedule(&self) {
        debug!(taskid = %self.id, "sending reschedule signal");
        let signal = UpdateSignal {
            id: self.id.clone(),
        };
        if self.update_tx.send(signal).await.is_err() {
            debug!(taskid = %self.id, "scheduler update channel closed");
        }
    }
}

#[cfg(test)]
pub(crate) fn test_task(
    id: &str,
    options: TaskOptions,
) -> (Arc<Task>, async_channel::Receiver<UpdateSignal>) {
    use crate::timer::Once;

    let (tx, rx) = async_channel::bounded(16);
    let task = Task::new(
        CancellationToken::new(),
        id.to_string(),
        Box::new(Once::new(Duration::from_secs(3600))),
        Arc::new(|_ctx| futures::future::ready(()).boxed()),
        options,
        tx,
    );
    (task, rx)
}
