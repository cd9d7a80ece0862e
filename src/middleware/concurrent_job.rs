//! Execution middleware that defers a fire while an instance is running.

use async_trait::async_trait;
use tracing::{debug, error};

use crate::errors::JobFailure;
use crate::metrics;
use crate::middleware::{ExecDecision, ExecOutcome, ExecutionMiddleware};
use crate::task::Task;

/// Per-task lock state, kept in the task's extensions.
struct ConcurrentLock {
    running: bool,
}

/// Defers a fire when the previous job instance of the task has not finished
/// yet. The deferred fire carries a `ConcurrentJob` failure, so retry
/// middleware with overlap handling enabled can re-arm the timer.
#[derive(Default)]
pub struct ConcurrentJobGate;

impl ConcurrentJobGate {
    /// Create the gate. One instance may guard any number of tasks.
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ExecutionMiddleware for ConcurrentJobGate {
    fn name(&self) -> &'static str {
        "concurrent-job-gate"
    }

    async fn pre_handler(&self, task: &Task) -> ExecOutcome {
        let taken = task
            .with_extensions(|ext| match ext.get_mut::<ConcurrentLock>() {
                Some(lock) if lock.running => Some(false),
                Some(lock) => {
                    lock.running = true;
                    Some(true)
                }
                None => None,
            })
            .await;

        match taken {
            Some(true) => ExecOutcome::next_mw(),
            Some(false) => {
                debug!(taskid = %task.get_id(), middleware = self.name(), "job already running");
                metrics::MW_CONCURRENT_JOB_BLOCKED
                    .with_label_values(&[task.get_id()])
                    .inc();
                ExecOutcome::defer(JobFailure::concurrent_job("job already running"))
            }
            None => {
                error!(taskid = %task.get_id(), middleware = self.name(), "gate not initialized");
                ExecOutcome::next_mw()
                    .with_failure(JobFailure::middleware("concurrent-job gate not initialized"))
            }
        }
    }

    async fn post_handler(&self, task: &Task, _failure: Option<&JobFailure>) -> ExecDecision {
        task.with_extensions(|ext| {
            if let Some(lock) = ext.get_mut::<ConcurrentLock>() {
                lock.running = false;
            }
        })
        .await;
        ExecDecision::NextMw
    }

    async fn initialize(&self, task: &Task) {
        task.with_extensions(|ext| ext.insert(ConcurrentLock { running: false }))
            .await;
    }

    async fn reset(&self, task: &Task) {
        task.with_extensions(|ext| {
            if let Some(lock) = ext.get_mut::<ConcurrentLock>() {
                lock.running = false;
            }
        })
        .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::FailureKind;
    use crate::options::TaskOptions;
    use crate::task::test_task;

    #[tokio::test]
    async fn uninitialized_gate_passes_with_middleware_failure() {
        let (task, _rx) = test_task("cj-uninit", TaskOptions::new());
        let gate = ConcurrentJobGate::new();

        let outcome = gate.pre_handler(&task).await;
        assert_eq!(outcome.decision, ExecDecision::NextMw);
        assert_eq!(
            outcome.failure.expect("reports itself").kind,
            FailureKind::Middleware
        );
    }

    #[tokio::test]
    async fn second_fire_is_deferred_until_post_releases() {
        let (task, _rx) = test_task("cj-defer", TaskOptions::new());
        let gate = ConcurrentJobGate::new();
        gate.initialize(&task).await;

        let first = gate.pre_handler(&task).await;
        assert_eq!(first.decision, ExecDecision::NextMw);
        assert!(first.failure.is_none());

        let second = gate.pre_handler(&task).await;
        assert_eq!(second.decision, ExecDecision::Defer);
        assert_eq!(
            second.failure.expect("overlap failure").kind,
            FailureKind::ConcurrentJob
        );

        assert_eq!(gate.post_handler(&task, None).await, ExecDecision::NextMw);

        let third = gate.pre_handler(&task).await;
        assert_eq!(third.decision, ExecDecision::NextMw);
    }

    #[tokio::test]
    async fn reset_releases_a_stuck_lock() {
        let (task, _rx) = test_task("cj-reset", TaskOptions::new());
        let gate = ConcurrentJobGate::new();
        gate.initialize(&task).await;

        assert_eq!(gate.pre_handler(&task).await.decision, ExecDecision::NextMw);
        gate.reset(&task).await;
        assert_eq!(gate.pre_handler(&task).await.decision, ExecDecision::NextMw);
    }
}
