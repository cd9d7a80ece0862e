//! Option sets applied at scheduler construction and at task registration.
//!
//! Options given to [`Scheduler::new`](crate::Scheduler::new) apply to every
//! task the scheduler creates; options given to
//! [`Scheduler::add`](crate::Scheduler::add) apply to that task only and win
//! on collisions (they are appended after the scheduler-level set, so their
//! middleware run later in the chains).

use std::sync::Arc;

use crate::middleware::{ExecutionMiddleware, RetryMiddleware};

/// Per-task options: the middleware chains.
#[derive(Clone, Default)]
pub struct TaskOptions {
    pub(crate) execution_middlewares: Vec<Arc<dyn ExecutionMiddleware>>,
    pub(crate) retry_middlewares: Vec<Arc<dyn RetryMiddleware>>,
}

impl TaskOptions {
    /// An empty option set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an execution middleware; chains run in registration order.
    pub fn with_execution_middleware(mut self, mw: Arc<dyn ExecutionMiddleware>) -> Self {
        self.execution_middlewares.push(mw);
        self
    }

    /// Append a retry middleware; the chain runs in registration order.
    pub fn with_retry_middleware(mut self, mw: Arc<dyn RetryMiddleware>) -> Self {
        self.retry_middlewares.push(mw);
        self
    }

    /// Scheduler-level options first, per-task extras after.
    pub(crate) fn merge(mut self, extra: TaskOptions) -> Self {
        self.execution_middlewares
            .extend(extra.execution_middlewares);
        self.retry_middlewares.extend(extra.retry_middlewares);
        self
    }
}

/// Options applied to every task a scheduler creates.
#[derive(Clone, Default)]
pub struct SchedulerOptions {
    pub(crate) task_options: TaskOptions,
}

impl SchedulerOptions {
    /// An empty option set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an execution middleware to every task's chain.
    pub fn with_execution_middleware(mut self, mw: Arc<dyn ExecutionMiddleware>) -> Self {
        self.task_options = self.task_options.with_execution_middleware(mw);
        self
    }

    /// Append a retry middleware to every task's chain.
    pub fn with_retry_middleware(mut self, mw: Arc<dyn RetryMiddleware>) -> Self {
        self.task_options = self.task_options.with_retry_middleware(mw);
        self
    }
}
