//! Central catalog of scheduler metrics.
//!
//! Every counter and gauge the scheduler emits is registered here, against
//! the default prometheus registry, so embedding applications can scrape
//! them alongside their own. No other module registers or names a metric;
//! the rest of the crate only increments entries from this catalog.

use lazy_static::lazy_static;
use prometheus::{
    register_int_counter_vec, register_int_gauge, register_int_gauge_vec, Encoder, IntCounterVec,
    IntGauge, IntGaugeVec, TextEncoder,
};

lazy_static! {
    /// 1 while a task is started, 0 after stop.
    pub(crate) static ref UP: IntGaugeVec = register_int_gauge_vec!(
        "sched_up",
        "Whether the task with this id is active",
        &["id"]
    ).expect("Can't create sched_up metric");

    /// Number of tasks registered with the scheduler.
    pub(crate) static ref JOBS: IntGauge = register_int_gauge!(
        "sched_jobs",
        "Number of tasks registered with the scheduler"
    ).expect("Can't create sched_jobs metric");

    pub(crate) static ref RUNS: IntCounterVec = register_int_counter_vec!(
        "sched_runs_total",
        "Number of job instances dispatched",
        &["id"]
    ).expect("Can't create sched_runs_total metric");

    pub(crate) static ref OVERLAPPING_RUNS: IntCounterVec = register_int_counter_vec!(
        "sched_overlapping_runs_total",
        "Number of job instances that overlapped a still-running instance",
        &["id"]
    ).expect("Can't create sched_overlapping_runs_total metric");

    pub(crate) static ref RUN_ERRORS: IntCounterVec = register_int_counter_vec!(
        "sched_run_errors_total",
        "Number of job instances that returned an error",
        &["id"]
    ).expect("Can't create sched_run_errors_total metric");

    pub(crate) static ref FAILED_JOBS: IntCounterVec = register_int_counter_vec!(
        "sched_failed_jobs_total",
        "Number of failed job runs",
        &["id"]
    ).expect("Can't create sched_failed_jobs_total metric");

    pub(crate) static ref SUCCEEDED_JOBS: IntCounterVec = register_int_counter_vec!(
        "sched_succeeded_jobs_total",
        "Number of successful job runs",
        &["id"]
    ).expect("Can't create sched_succeeded_jobs_total metric");

    pub(crate) static ref DEFERRED_JOBS: IntCounterVec = register_int_counter_vec!(
        "sched_deferred_jobs_total",
        "Number of fires deferred by execution middleware",
        &["id"]
    ).expect("Can't create sched_deferred_jobs_total metric");

    pub(crate) static ref CONTEXT_CANCELS: IntCounterVec = register_int_counter_vec!(
        "sched_context_cancels_total",
        "Number of job instances terminated by context cancellation",
        &["id"]
    ).expect("Can't create sched_context_cancels_total metric");

    pub(crate) static ref STOPS: IntCounterVec = register_int_counter_vec!(
        "sched_stops_total",
        "Number of times a task was stopped",
        &["id"]
    ).expect("Can't create sched_stops_total metric");

    pub(crate) static ref RESCHEDULES: IntCounterVec = register_int_counter_vec!(
        "sched_reschedules_total",
        "Number of one-shot timer overrides installed by retry middleware",
        &["id"]
    ).expect("Can't create sched_reschedules_total metric");

    pub(crate) static ref PRE_EXECUTION_RUNS: IntCounterVec = register_int_counter_vec!(
        "sched_pre_execution_middleware_runs_total",
        "Number of pre-execution middleware handler invocations",
        &["id", "middleware"]
    ).expect("Can't create sched_pre_execution_middleware_runs_total metric");

    pub(crate) static ref POST_EXECUTION_RUNS: IntCounterVec = register_int_counter_vec!(
        "sched_post_execution_middleware_runs_total",
        "Number of post-execution middleware handler invocations",
        &["id", "middleware"]
    ).expect("Can't create sched_post_execution_middleware_runs_total metric");

    pub(crate) static ref RETRY_RUNS: IntCounterVec = register_int_counter_vec!(
        "sched_retry_middleware_runs_total",
        "Number of retry middleware handler invocations",
        &["id", "middleware", "phase"]
    ).expect("Can't create sched_retry_middleware_runs_total metric");

    pub(crate) static ref RETRY_RETRIES: IntCounterVec = register_int_counter_vec!(
        "sched_retry_middleware_retries_total",
        "Number of retry middleware decisions that installed a retry delay",
        &["id", "middleware", "phase"]
    ).expect("Can't create sched_retry_middleware_retries_total metric");

    pub(crate) static ref RETRY_NORETRIES: IntCounterVec = register_int_counter_vec!(
        "sched_retry_middleware_noretries_total",
        "Number of retry middleware decisions that stopped the retry chain",
        &["id", "middleware", "phase"]
    ).expect("Can't create sched_retry_middleware_noretries_total metric");

    pub(crate) static ref RETRY_SKIPS: IntCounterVec = register_int_counter_vec!(
        "sched_retry_middleware_skips_total",
        "Number of retry middleware decisions that passed to the next link",
        &["id", "middleware", "phase"]
    ).expect("Can't create sched_retry_middleware_skips_total metric");

    pub(crate) static ref MW_CONCURRENT_JOB_BLOCKED: IntCounterVec = register_int_counter_vec!(
        "sched_middleware_concurrent_job_blocked_total",
        "Number of fires the concurrent-job gate deferred",
        &["id"]
    ).expect("Can't create sched_middleware_concurrent_job_blocked_total metric");

    pub(crate) static ref MW_HAS_TAGS_BLOCKED: IntCounterVec = register_int_counter_vec!(
        "sched_middleware_has_tags_blocked_total",
        "Number of fires the tag gate deferred",
        &["id"]
    ).expect("Can't create sched_middleware_has_tags_blocked_total metric");

    pub(crate) static ref MW_CONSTANT_BACKOFF_RETRIES: IntCounterVec = register_int_counter_vec!(
        "sched_middleware_constant_backoff_retries_total",
        "Number of retry delays installed by the constant backoff policy",
        &["id"]
    ).expect("Can't create sched_middleware_constant_backoff_retries_total metric");

    pub(crate) static ref MW_EXPONENTIAL_BACKOFF_RETRIES: IntCounterVec = register_int_counter_vec!(
        "sched_middleware_exponential_backoff_retries_total",
        "Number of retry delays installed by the exponential backoff policy",
        &["id"]
    ).expect("Can't create sched_middleware_exponential_backoff_retries_total metric");

    pub(crate) static ref MW_RETRY_LIMIT_HIT: IntCounterVec = register_int_counter_vec!(
        "sched_middleware_retry_limit_hit_total",
        "Number of times the retry-count limit stopped further retries",
        &["id"]
    ).expect("Can't create sched_middleware_retry_limit_hit_total metric");
}

/// Encode every metric in the default registry in the prometheus text
/// exposition format.
///
/// Convenience for embedders that serve a `/metrics` endpoint without a
/// registry of their own.
pub fn export() -> String {
    let encoder = TextEncoder::new();
    let families = prometheus::gather();
    let mut buf = Vec::new();
    if let Err(e) = encoder.encode(&families, &mut buf) {
        tracing::error!(error = %e, "failed to encode metrics");
        return String::new();
    }
    String::from_utf8(buf).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn export_contains_registered_families() {
        RUNS.with_label_values(&["metrics-test"]).inc();
        let text = export();
        assert!(text.contains("sched_runs_total"));
    }

    #[test]
    fn counters_accumulate_per_label() {
        let before = DEFERRED_JOBS.with_label_values(&["metrics-acc"]).get();
        DEFERRED_JOBS.with_label_values(&["metrics-acc"]).inc();
        DEFERRED_JOBS.with_label_values(&["metrics-acc"]).inc();
        let after = DEFERRED_JOBS.with_label_values(&["metrics-acc"]).get();
        assert_eq!(after - before, 2);
    }
}
