//! Middleware capability sets.
//!
//! Two kinds of middleware guard a task. Execution middleware run around each
//! dispatch: the pre chain may cancel or defer the fire, the post chain may
//! escalate a finished attempt to the retry chain. Retry middleware run after
//! a failure (or a deferred fire) and decide whether the timer should be
//! re-armed sooner than its natural cadence.
//!
//! Middleware are shared values; per-task state belongs in the task's
//! [`Extensions`](crate::extensions::Extensions) sidecar so one policy
//! instance can serve any number of tasks.

use std::time::Duration;

use async_trait::async_trait;

use crate::errors::{FailureKind, JobFailure};
use crate::task::Task;

mod concurrent_job;
mod constant_backoff;
mod exponential_backoff;
mod has_tag;
mod retry_limit;

pub use concurrent_job::ConcurrentJobGate;
pub use constant_backoff::ConstantBackoff;
pub use exponential_backoff::ExponentialBackoff;
pub use has_tag::HasTagGate;
pub use retry_limit::RetryLimit;

/// Verdict of one execution-middleware handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecDecision {
    /// Pass to the next link; past the last link, dispatch proceeds.
    NextMw,
    /// Skip this fire and consult the retry chain.
    Defer,
    /// Skip this fire and leave the timer on its natural cadence.
    Cancel,
}

/// An [`ExecDecision`] together with the classified failure that motivated
/// it, if any. A `NextMw` can carry a failure too (an uninitialized
/// middleware reports itself and lets the chain continue).
#[derive(Debug)]
pub struct ExecOutcome {
    /// The chain-control verdict.
    pub decision: ExecDecision,
    /// Classification handed to the post/retry chains.
    pub failure: Option<JobFailure>,
}

impl ExecOutcome {
    /// Pass to the next link.
    pub fn next_mw() -> Self {
        Self {
            decision: ExecDecision::NextMw,
            failure: None,
        }
    }

    /// Skip this fire; `failure` tells the retry chain why.
    pub fn defer(failure: JobFailure) -> Self {
        Self {
            decision: ExecDecision::Defer,
            failure: Some(failure),
        }
    }

    /// Abort this fire entirely.
    pub fn cancel() -> Self {
        Self {
            decision: ExecDecision::Cancel,
            failure: None,
        }
    }

    /// Attach a failure classification to this outcome.
    pub fn with_failure(mut self, failure: JobFailure) -> Self {
        self.failure = Some(failure);
        self
    }
}

/// Gate around each dispatch of a task.
#[async_trait]
pub trait ExecutionMiddleware: Send + Sync {
    /// Short stable name used as the `middleware` log field and metric label.
    fn name(&self) -> &'static str;

    /// Runs before dispatch, in registration order. The first `Defer` or
    /// `Cancel` stops the chain.
    async fn pre_handler(&self, task: &Task) -> ExecOutcome;

    /// Runs after a job attempt, in registration order. `Defer` escalates to
    /// the retry chain; `Cancel` stops the post chain.
    async fn post_handler(&self, task: &Task, failure: Option<&JobFailure>) -> ExecDecision;

    /// Called on every start of the task.
    async fn initialize(&self, task: &Task) {
        let _ = task;
    }

    /// Clear per-task state. Never called by the core loop; policies and
    /// embedders call it.
    async fn reset(&self, task: &Task) {
        let _ = task;
    }
}

/// Which side of the dispatch a retry consultation came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryPhase {
    /// The pre-execution chain deferred; no job instance ran.
    PreRun,
    /// The post-execution chain deferred after a job attempt.
    PostRun,
}

impl RetryPhase {
    /// Metric label value.
    pub fn as_str(&self) -> &'static str {
        match self {
            RetryPhase::PreRun => "pre",
            RetryPhase::PostRun => "post",
        }
    }
}

/// Verdict of one retry-middleware handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Re-arm the timer to fire after this delay; stops the retry chain.
    Retry(Duration),
    /// Leave the timer on its natural cadence; stops the retry chain.
    NoRetry,
    /// Pass to the next retry middleware.
    NextMw,
}

/// Decides whether and when a failed or deferred fire is re-armed.
#[async_trait]
pub trait RetryMiddleware: Send + Sync {
    /// Short stable name used as the `middleware` log field and metric label.
    fn name(&self) -> &'static str;

    /// Consulted once per pass, in registration order. An `Err` marks the
    /// middleware itself as misconfigured; the chain logs it and continues
    /// as if the link returned [`RetryDecision::NextMw`].
    async fn handler(
        &self,
        task: &Task,
        phase: RetryPhase,
        failure: Option<&JobFailure>,
    ) -> Result<RetryDecision, JobFailure>;

    /// Called on every start of the task.
    async fn initialize(&self, task: &Task) {
        let _ = task;
    }

    /// Clear per-task state (retry counters, backoff intervals).
    async fn reset(&self, task: &Task) {
        let _ = task;
    }
}

/// Which failure kinds a retry policy covers. Kinds outside the filter
/// always yield [`RetryDecision::NextMw`].
#[derive(Debug, Clone, Copy)]
pub struct RetryFilter {
    handle_panic: bool,
    handle_overlap: bool,
    handle_deferred: bool,
}

impl Default for RetryFilter {
    fn default() -> Self {
        Self {
            handle_panic: true,
            handle_overlap: true,
            handle_deferred: true,
        }
    }
}

impl RetryFilter {
    /// Cover (or stop covering) panicked jobs.
    pub fn handle_panic(&mut self, v: bool) {
        self.handle_panic = v;
    }

    /// Cover (or stop covering) fires refused by an overlap gate.
    pub fn handle_overlap(&mut self, v: bool) {
        self.handle_overlap = v;
    }

    /// Cover (or stop covering) fires deferred by a precondition gate.
    pub fn handle_deferred(&mut self, v: bool) {
        self.handle_deferred = v;
    }

    /// Whether `failure` is in scope for the owning policy.
    pub fn should_handle(&self, failure: Option<&JobFailure>) -> bool {
        match failure {
            Some(f) => match f.kind {
                FailureKind::Panic => self.handle_panic,
                FailureKind::ConcurrentJob => self.handle_overlap,
                FailureKind::DeferredJob => self.handle_deferred,
                FailureKind::Middleware => false,
            },
            None => false,
        }
    }
}
