//! taskmill - in-process task scheduler
//!
//! Drives user-supplied job futures according to pluggable timing policies,
//! guarded by a composable chain of execution middleware (gates that run
//! before and after each dispatch) and retry middleware (deciding whether
//! and when to re-arm the timer after a failed or deferred fire).
//!
//! ## Key components
//!
//! - **Timers** ([`Once`], [`Fixed`], [`Cron`]): produce the next fire
//!   instant for one task and honor one-shot reschedule overrides.
//! - **Job instance** ([`Job`]): a single attempt of the user function, with
//!   panic isolation and cooperative cancellation.
//! - **Execution middleware** ([`ExecutionMiddleware`]): may cancel or defer
//!   a fire before dispatch, and escalate a finished attempt to the retry
//!   chain.
//! - **Retry middleware** ([`RetryMiddleware`]): decides whether a failed or
//!   deferred fire re-arms the timer sooner than its natural cadence.
//! - **Task** ([`Task`]): couples a timer, a job factory, and the chains.
//! - **Scheduler** ([`Scheduler`]): owns named tasks and runs the selection
//!   loop that fires whichever task is due next.
//!
//! Structured logs are emitted through [`tracing`]; counters and gauges are
//! registered against the default [`prometheus`] registry (see
//! [`metrics::export`]).
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use taskmill::{
//!     ConcurrentJobGate, ExponentialBackoff, Fixed, RetryLimit, Scheduler, SchedulerOptions,
//!     TaskOptions,
//! };
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let scheduler = Scheduler::new(SchedulerOptions::new());
//!
//!     let options = TaskOptions::new()
//!         .with_execution_middleware(Arc::new(ConcurrentJobGate::new()))
//!         .with_retry_middleware(Arc::new(RetryLimit::new(3)))
//!         .with_retry_middleware(Arc::new(ExponentialBackoff::new()));
//!
//!     scheduler
//!         .add(
//!             CancellationToken::new(),
//!             "heartbeat",
//!             Box::new(Fixed::new(Duration::from_secs(30))),
//!             |_ctx| async {
//!                 // the job body
//!             },
//!             options,
//!         )
//!         .await?;
//!
//!     scheduler.start("heartbeat").await?;
//!     tokio::time::sleep(Duration::from_secs(300)).await;
//!     scheduler.stop_all().await;
//!     Ok(())
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod errors;
pub mod extensions;
pub mod job;
pub mod metrics;
pub mod middleware;
pub mod options;
pub mod scheduler;
pub mod task;
pub mod timer;

pub use errors::{FailureKind, JobFailure, SchedulerError, SchedulerResult};
pub use job::{Job, JobFn, JobState};
pub use middleware::{
    ConcurrentJobGate, ConstantBackoff, ExecDecision, ExecOutcome, ExecutionMiddleware,
    ExponentialBackoff, HasTagGate, RetryDecision, RetryFilter, RetryLimit, RetryMiddleware,
    RetryPhase,
};
pub use options::{SchedulerOptions, TaskOptions};
pub use scheduler::Scheduler;
pub use task::Task;
pub use timer::{Cron, Fixed, Once, Timer};
