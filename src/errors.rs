//! Error taxonomy for the scheduler.
//!
//! Two families live here: [`JobFailure`], the in-band classification that
//! flows from job instances and gating middleware into the post/retry chains,
//! and [`SchedulerError`], the errors returned directly from registry
//! operations on the [`Scheduler`](crate::Scheduler).

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Classification of a failed or refused job attempt.
///
/// Retry middleware use the kind (never the message) to decide whether a
/// failure is in scope for them. Success is represented by the absence of a
/// [`JobFailure`], not by a kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FailureKind {
    /// The user function panicked; the panic message is captured.
    Panic,
    /// A gating middleware refused the fire because an instance of the job
    /// is already running.
    ConcurrentJob,
    /// A gating middleware deferred the fire because a precondition (for
    /// example a required tag) is unmet.
    DeferredJob,
    /// The middleware itself is misconfigured or was invoked before
    /// `initialize`.
    Middleware,
}

/// A classified failure produced by a job attempt or a middleware decision.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct JobFailure {
    /// What class of failure this is.
    pub kind: FailureKind,
    /// Human-readable detail, e.g. the captured panic message.
    pub message: String,
}

impl JobFailure {
    /// A captured panic from the user function.
    pub fn panic(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Panic,
            message: message.into(),
        }
    }

    /// A fire refused because the previous instance is still running.
    pub fn concurrent_job(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::ConcurrentJob,
            message: message.into(),
        }
    }

    /// A fire deferred because a precondition is unmet.
    pub fn deferred_job(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::DeferredJob,
            message: message.into(),
        }
    }

    /// A misconfigured or uninitialized middleware.
    pub fn middleware(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Middleware,
            message: message.into(),
        }
    }
}

/// Errors surfaced from [`Scheduler`](crate::Scheduler) registry operations
/// and timer constructors.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// A task with this id is already registered.
    #[error("schedule already exists: {0}")]
    ScheduleExists(String),

    /// No task with this id is registered.
    #[error("schedule not found: {0}")]
    ScheduleNotFound(String),

    /// The cron expression was rejected by the parser.
    #[error("invalid cron expression: {0}")]
    InvalidCronExpression(#[from] cron::error::Error),
}

/// Result alias for scheduler operations.
pub type SchedulerResult<T> = Result<T, SchedulerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failure_kinds_are_distinct() {
        assert_ne!(
            JobFailure::panic("a").kind,
            JobFailure::concurrent_job("a").kind
        );
        assert_ne!(
            JobFailure::deferred_job("a").kind,
            JobFailure::middleware("a").kind
        );
    }

    #[test]
    fn failure_displays_message() {
        let f = JobFailure::panic("boom");
        assert_eq!(f.to_string(), "boom");
    }

    #[test]
    fn scheduler_errors_name_the_id() {
        let e = SchedulerError::ScheduleNotFound("reaper".into());
        assert!(e.to_string().contains("reaper"));
    }
}
