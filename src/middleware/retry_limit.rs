//! Retry middleware that caps the number of attempts.

use async_trait::async_trait;
use tracing::{debug, error, warn};

use crate::errors::JobFailure;
use crate::metrics;
use crate::middleware::{RetryDecision, RetryFilter, RetryMiddleware, RetryPhase};
use crate::task::Task;

/// Per-task attempt counter, kept in the task's extensions.
struct RetryCount {
    attempts: u32,
}

/// Counts covered failures and stops the retry chain once a limit is
/// exceeded; below the limit it passes to the next link.
///
/// This policy gates but never delays, so it composes in front of a backoff
/// policy: `[RetryLimit, ExponentialBackoff]` retries with growing delays
/// until the limit is hit.
pub struct RetryLimit {
    max: u32,
    filter: RetryFilter,
}

impl Default for RetryLimit {
    fn default() -> Self {
        Self::new(10)
    }
}

impl RetryLimit {
    /// Allow up to `max` covered failures before giving up.
    pub fn new(max: u32) -> Self {
        Self {
            max,
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
impl RetryMiddleware for RetryLimit {
    fn name(&self) -> &'static str {
        "retry-limit"
    }

    async fn handler(
        &self,
        task: &Task,
        _phase: RetryPhase,
        failure: Option<&JobFailure>,
    ) -> Result<RetryDecision, JobFailure> {
        if !self.filter.should_handle(failure) {
            return Ok(RetryDecision::NextMw);
        }

        let attempts = task
            .with_extensions(|ext| {
                ext.get_mut::<RetryCount>().map(|count| {
                    count.attempts += 1;
                    count.attempts
                })
            })
            .await;

        let attempts = match attempts {
            Some(attempts) => attempts,
            None => {
                error!(taskid = %task.get_id(), middleware = self.name(), "not initialized");
                return Err(JobFailure::middleware("retry limit not initialized"));
            }
        };

        if attempts > self.max {
            warn!(
                taskid = %task.get_id(),
                middleware = self.name(),
                attempts,
                limit = self.max,
                "exceeded max attempts"
            );
            metrics::MW_RETRY_LIMIT_HIT
                .with_label_values(&[task.get_id()])
                .inc();
            return Ok(RetryDecision::NoRetry);
        }
        debug!(
            taskid = %task.get_id(),
            middleware = self.name(),
            attempts,
            limit = self.max,
            "retry allowed"
        );
        Ok(RetryDecision::NextMw)
    }

    async fn initialize(&self, task: &Task) {
        self.reset(task).await;
    }

    async fn reset(&self, task: &Task) {
        task.with_extensions(|ext| match ext.get_mut::<RetryCount>() {
            Some(count) => count.attempts = 0,
            None => ext.insert(RetryCount { attempts: 0 }),
        })
        .await;
    }
}
