//! Retry middleware with an exponential backoff schedule.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use rand::Rng;
use tracing::{debug, error};

use crate::errors::JobFailure;
use crate::metrics;
use crate::middleware::{RetryDecision, RetryFilter, RetryMiddleware, RetryPhase};
use crate::task::Task;

/// Per-task backoff progress, kept in the task's extensions.
struct ExpBackoffState {
    current_interval: Duration,
    started: Instant,
}

/// Re-arms the timer with exponentially growing delays.
///
/// Each covered failure yields the current interval (randomized by the
/// randomization factor), then multiplies the interval, capped at the max
/// interval. Once the total elapsed time since the first consultation
/// exceeds the ceiling, the policy gives up and stops the retry chain.
pub struct ExponentialBackoff {
    initial_interval: Duration,
    randomization_factor: f64,
    multiplier: f64,
    max_interval: Duration,
    max_elapsed: Option<Duration>,
    filter: RetryFilter,
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self {
            initial_interval: Duration::from_millis(500),
            randomization_factor: 0.5,
            multiplier: 1.5,
            max_interval: Duration::from_secs(60),
            max_elapsed: Some(Duration::from_secs(15 * 60)),
            filter: RetryFilter::default(),
        }
    }
}

impl ExponentialBackoff {
    /// The default schedule: 500ms initial, ×1.5, ±50% jitter, 60s cap,
    /// 15min total ceiling.
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay before the first retry.
    pub fn with_initial_interval(mut self, v: Duration) -> Self {
        self.initial_interval = v;
        self
    }

    /// Jitter as a fraction of the current interval, in `[0.0, 1.0]`.
    pub fn with_randomization_factor(mut self, v: f64) -> Self {
        self.randomization_factor = v.clamp(0.0, 1.0);
        self
    }

    /// Factor the interval grows by after each retry.
    pub fn with_multiplier(mut self, v: f64) -> Self {
        self.multiplier = v.max(1.0);
        self
    }

    /// Upper bound on a single delay.
    pub fn with_max_interval(mut self, v: Duration) -> Self {
        self.max_interval = v;
        self
    }

    /// Total time budget across retries; `None` retries forever.
    pub fn with_max_elapsed(mut self, v: Option<Duration>) -> Self {
        self.max_elapsed = v;
        self
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

    /// Advance the schedule: the delay to use now, or `None` once the
    /// elapsed ceiling is exhausted.
    fn next_delay(&self, state: &mut ExpBackoffState) -> Option<Duration> {
        if let Some(ceiling) = self.max_elapsed {
            if state.started.elapsed() > ceiling {
                return None;
            }
        }

        let interval = state.current_interval;
        let next = interval.as_secs_f64() * self.multiplier;
        state.current_interval = Duration::from_secs_f64(next.min(self.max_interval.as_secs_f64()));

        if self.randomization_factor > 0.0 {
            let delta = self.randomization_factor * interval.as_secs_f64();
            let jittered = rand::thread_rng()
                .gen_range(interval.as_secs_f64() - delta..=interval.as_secs_f64() + delta);
            Some(Duration::from_secs_f64(jittered.max(0.0)))
        } else {
            Some(interval)
        }
    }
}

#[async_trait]
impl RetryMiddleware for ExponentialBackoff {
    fn name(&self) -> &'static str {
        "exponential-backoff"
    }

    async fn handler(
        &self,
        task: &Task,
        _phase: RetryPhase,
        failure: Option<&JobFailure>,
    ) -> Result<RetryDecision, JobFailure> {
        let initialized = task
            .with_extensions(|ext| ext.contains::<ExpBackoffState>())
            .await;
        if !initialized {
            error!(taskid = %task.get_id(), middleware = self.name(), "not initialized");
            return Err(JobFailure::middleware("exponential backoff not initialized"));
        }
        if !self.filter.should_handle(failure) {
            return Ok(RetryDecision::NextMw);
        }

        let delay = task
            .with_extensions(|ext| {
                ext.get_mut::<ExpBackoffState>()
                    .map(|state| self.next_delay(state))
            })
            .await
            .flatten();

        match delay {
            None => {
                debug!(taskid = %task.get_id(), middleware = self.name(), "elapsed ceiling reached");
                Ok(RetryDecision::NoRetry)
            }
            Some(delay) => {
                debug!(
                    taskid = %task.get_id(),
                    middleware = self.name(),
                    duration = ?delay,
                    "retrying job"
                );
                metrics::MW_EXPONENTIAL_BACKOFF_RETRIES
                    .with_label_values(&[task.get_id()])
                    .inc();
                Ok(RetryDecision::Retry(delay))
            }
        }
    }

    async fn initialize(&self, task: &Task) {
        self.reset(task).await;
    }

    async fn reset(&self, task: &Task) {
        let state = ExpBackoffState {
            current_interval: self.initial_interval,
            started: Instant::now(),
        };
        task.with_extensions(|ext| ext.insert(state)).await;
    }
}
