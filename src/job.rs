//! A job instance is a single invocation attempt of the user function.
//!
//! The instance owns panic isolation: a panic inside the user future is
//! trapped here and surfaces as a [`JobFailure`] of kind `Panic`, never as an
//! unwind through the worker. Cancellation is cooperative; the token handed
//! to the user future is the one supplied when the task was added.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::errors::JobFailure;

/// The user function a task dispatches: takes the cancellation token, returns
/// a future that completes when the work is done.
pub type JobFn = Arc<dyn Fn(CancellationToken) -> BoxFuture<'static, ()> + Send + Sync>;

/// Lifecycle of one job instance. Transitions are monotonic:
/// `Created → Running → {Succeeded, Failed, Panicked, Cancelled}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobState {
    /// Instance constructed, not yet entered.
    Created,
    /// User function in progress.
    Running,
    /// User function returned normally.
    Succeeded,
    /// User function reported failure.
    Failed,
    /// User function panicked; the panic was captured.
    Panicked,
    /// Cancellation was observed before or during the run.
    Cancelled,
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobState::Created => "created",
            JobState::Running => "running",
            JobState::Succeeded => "succeeded",
            JobState::Failed => "failed",
            JobState::Panicked => "panicked",
            JobState::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

struct JobProgress {
    state: JobState,
    started_at: Option<Instant>,
    finished_at: Option<Instant>,
}

/// One invocation attempt of the user function.
pub struct Job {
    id: Uuid,
    func: JobFn,
    ctx: CancellationToken,
    created_at: Instant,
    progress: Mutex<JobProgress>,
}

impl Job {
    /// Create a fresh attempt bound to `ctx`.
    pub(crate) fn new(ctx: CancellationToken, func: JobFn) -> Arc<Self> {
        Arc::new(Self {
            id: Uuid::new_v4(),
            func,
            ctx,
            created_at: Instant::now(),
            progress: Mutex::new(JobProgress {
                state: JobState::Created,
                started_at: None,
                finished_at: None,
            }),
        })
    }

    /// Unique id of this attempt.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Current lifecycle state.
    pub fn state(&self) -> JobState {
        self.progress.lock().expect("job progress lock poisoned").state
    }

    /// Wall time spent inside the user function, once the run has finished.
    pub fn actual_elapsed(&self) -> Option<Duration> {
        let p = self.progress.lock().expect("job progress lock poisoned");
        match (p.started_at, p.finished_at) {
            (Some(start), Some(end)) => Some(end.duration_since(start)),
            _ => None,
        }
    }

    /// Wall time since the attempt was created, once the run has finished.
    pub fn total_elapsed(&self) -> Option<Duration> {
        let p = self.progress.lock().expect("job progress lock poisoned");
        p.finished_at.map(|end| end.duration_since(self.created_at))
    }

    /// Execute the user function on the calling worker.
    ///
    /// Never propagates a panic: a panicking user future resolves to a
    /// `Panic`-kind [`JobFailure`]. A cancellation observed before entry or
    /// across the run resolves to state `Cancelled` with no error, because
    /// cancellation is not a failure.
    pub(crate) async fn run(&self) -> Result<(), JobFailure> {
        {
            let mut p = self.progress.lock().expect("job progress lock poisoned");
            if self.ctx.is_cancelled() {
                p.state = JobState::Cancelled;
                p.finished_at = Some(Instant::now());
                return Ok(());
            }
            p.state = JobState::Running;
            p.started_at = Some(Instant::now());
        }

        let fut = (self.func)(self.ctx.clone());
        let outcome = std::panic::AssertUnwindSafe(fut).catch_unwind().await;

        let mut p = self.progress.lock().expect("job progress lock poisoned");
        p.finished_at = Some(Instant::now());
        match outcome {
            Ok(()) => {
                p.state = if self.ctx.is_cancelled() {
                    JobState::Cancelled
                } else {
                    JobState::Succeeded
                };
                Ok(())
            }
            Err(payload) => {
                p.state = JobState::Panicked;
                Err(JobFailure::panic(panic_message(&*payload)))
            }
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// The set of currently running job instances for one task.
///
/// Many readers (overlap checks, stop logging), single writer (the worker
/// inserting or removing its own instance).
#[derive(Default)]
pub(crate) struct JobRegistry {
    jobs: RwLock<HashMap<Uuid, Arc<Job>>>,
}

impl JobRegistry {
    pub(crate) fn add(&self, job: Arc<Job>) {
        self.jobs
            .write()
            .expect("job registry lock poisoned")
            .insert(job.id(), job);
    }

    pub(crate) fn remove(&self, id: Uuid) {
        self.jobs
            .write()
            .expect("job registry lock poisoned")
            .remove(&id);
    }

    pub(crate) fn len(&self) -> usize {
        self.jobs.read().expect("job registry lock poisoned").len()
    }
}
