//! Retry middleware with a constant delay.

use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, error};

use crate::errors::JobFailure;
use crate::metrics;
use crate::middleware::{RetryDecision, RetryFilter, RetryMiddleware, RetryPhase};
use crate::task::Task;

/// Marker in the task's extensions proving the policy was initialized for
/// this task.
struct ConstantBackoffState;

/// Re-arms the timer a fixed interval after every covered failure.
///
/// Covers panics, overlap refusals, and deferred fires by default; narrow
/// the scope with the `handle_*` builder methods.
pub struct ConstantBackoff {
    interval: Duration,
    filter: RetryFilter,
}

impl Default for ConstantBackoff {
    fn default() -> Self {
        Self::new(Duration::from_secs(1))
    }
}

impl ConstantBackoff {
    /// A constant backoff of `interval`.
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            filter: RetryFilter::default(),
        }
    }

    /// Cover (or stop covering) panicked jobs.
    pub fn handle_panic(mut self, v: bool) -> Self {
        self.filter.handle_panic(v);
        self
    }

    /// Cover (or stop covering) overlap refusals.
    pub fn handle_overlap(mut self, v: bool) -> Self {
        self.filter.handle_overlap(v);
        self
    }

    /// Cover (or stop covering) deferred fires.
    pub fn handle_deferred(mut self, v: bool) -> Self {
        self.filter.handle_deferred(v);
        self
    }
}

#[async_trait]
impl RetryMiddleware for ConstantBackoff {
    fn name(&self) -> &'static str {
        "constant-backoff"
    }

    async fn handler(
        &self,
        task: &Task,
        _phase: RetryPhase,
        failure: Option<&JobFailure>,
    ) -> Result<RetryDecision, JobFailure> {
        let initialized = task
            .with_extensions(|ext| ext.contains::<ConstantBackoffState>())
            .await;
        if !initialized {
            error!(taskid = %task.get_id(), middleware = self.name(), "not initialized");
            return Err(JobFailure::middleware("constant backoff not initialized"));
        }

        if self.filter.should_handle(failure) {
            debug!(
                taskid = %task.get_id(),
                middleware = self.name(),
                duration = ?self.interval,
                "retrying job"
            );
            metrics::MW_CONSTANT_BACKOFF_RETRIES
                .with_label_values(&[task.get_id()])
                .inc();
            return Ok(RetryDecision::Retry(self.interval));
        }
        Ok(RetryDecision::NextMw)
    }

    async fn initialize(&self, task: &Task) {
        self.reset(task).await;
    }

    async fn reset(&self, task: &Task) {
        task.with_extensions(|ext| ext.insert(ConstantBackoffState))
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
    async fn uninitialized_policy_reports_itself() {
        let (task, _rx) = test_task("const-uninit", TaskOptions::new());
        let policy = ConstantBackoff::new(Duration::from_millis(10));

        let err = policy
            .handler(&task, RetryPhase::PostRun, Some(&JobFailure::panic("p")))
            .await
            .expect_err("uninitialized");
        assert_eq!(err.kind, FailureKind::Middleware);
    }

    #[tokio::test]
    async fn covered_failure_yields_constant_delay() {
        let (task, _rx) = test_task("const-delay", TaskOptions::new());
        let policy = ConstantBackoff::new(Duration::from_millis(250));
        policy.initialize(&task).await;

        for _ in 0..3 {
            let decision = policy
                .handler(&task, RetryPhase::PostRun, Some(&JobFailure::panic("p")))
                .await
                .expect("initialized");
            assert_eq!(decision, RetryDecision::Retry(Duration::from_millis(250)));
        }
    }

    #[tokio::test]
    async fn uncovered_failure_passes_to_next_link() {
        let (task, _rx) = test_task("const-skip", TaskOptions::new());
        let policy = ConstantBackoff::new(Duration::from_millis(250)).handle_panic(false);
        policy.initialize(&task).await;

        let decision = policy
            .handler(&task, RetryPhase::PreRun, Some(&JobFailure::panic("p")))
            .await
            .expect("initialized");
        assert_eq!(decision, RetryDecision::NextMw);
    }
}
