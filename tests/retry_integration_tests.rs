//! Retry-chain scenarios: backoff composition, chain ordering, and the
//! reschedule override.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use common::counter_value;
use taskmill::{
    ConstantBackoff, ExecDecision, ExecOutcome, ExecutionMiddleware, ExponentialBackoff,
    JobFailure, Once, RetryLimit, Scheduler, SchedulerOptions, Task, TaskOptions,
};
use tokio_util::sync::CancellationToken;

/// Escalates every failed attempt to the retry chain.
struct DeferOnFailure;

#[async_trait]
impl ExecutionMiddleware for DeferOnFailure {
    fn name(&self) -> &'static str {
        "defer-on-failure"
    }

    async fn pre_handler(&self, _task: &Task) -> ExecOutcome {
        ExecOutcome::next_mw()
    }

    async fn post_handler(&self, _task: &Task, failure: Option<&JobFailure>) -> ExecDecision {
        if failure.is_some() {
            ExecDecision::Defer
        } else {
            ExecDecision::NextMw
        }
    }
}

/// Records which handlers ran, for chain-ordering assertions.
struct RecordingMiddleware {
    label: &'static str,
    decision: ExecDecision,
    calls: Arc<Mutex<Vec<&'static str>>>,
}

#[async_trait]
impl ExecutionMiddleware for RecordingMiddleware {
    fn name(&self) -> &'static str {
        self.label
    }

    async fn pre_handler(&self, _task: &Task) -> ExecOutcome {
        self.calls.lock().expect("calls lock").push(self.label);
        match self.decision {
            ExecDecision::NextMw => ExecOutcome::next_mw(),
            ExecDecision::Defer => ExecOutcome::defer(JobFailure::deferred_job("recorded defer")),
            ExecDecision::Cancel => ExecOutcome::cancel(),
        }
    }

    async fn post_handler(&self, _task: &Task, _failure: Option<&JobFailure>) -> ExecDecision {
        ExecDecision::NextMw
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn retry_limit_and_exponential_backoff_compose() {
    common::init_tracing();
    let id = "limit-then-backoff";
    let attempts = Arc::new(AtomicUsize::new(0));
    let stamps: Arc<Mutex<Vec<Instant>>> = Arc::new(Mutex::new(Vec::new()));

    let attempts2 = Arc::clone(&attempts);
    let stamps2 = Arc::clone(&stamps);

    let scheduler = Scheduler::new(SchedulerOptions::new());
    let options = TaskOptions::new()
        .with_execution_middleware(Arc::new(DeferOnFailure))
        .with_retry_middleware(Arc::new(RetryLimit::new(3)))
        .with_retry_middleware(Arc::new(
            ExponentialBackoff::new()
                .with_initial_interval(Duration::from_millis(50))
                .with_multiplier(2.0)
                .with_randomization_factor(0.0)
                .with_max_elapsed(None),
        ));
    scheduler
        .add(
            CancellationToken::new(),
            id,
            Box::new(Once::new(Duration::ZERO)),
            move |_ctx| {
                let attempts = Arc::clone(&attempts2);
                let stamps = Arc::clone(&stamps2);
                async move {
                    attempts.fetch_add(1, Ordering::SeqCst);
                    stamps.lock().expect("stamps lock").push(Instant::now());
                    panic!("always failing");
                }
            },
            options,
        )
        .await
        .expect("add");
    scheduler.start(id).await.expect("start");

    // initial attempt plus retries at ~50, 100, 200ms, then the limit hits
    tokio::time::sleep(Duration::from_millis(900)).await;
    scheduler.stop(id).await.expect("stop");

    assert_eq!(
        attempts.load(Ordering::SeqCst),
        4,
        "initial attempt plus exactly three retries"
    );
    assert_eq!(counter_value("sched_middleware_retry_limit_hit_total", &[("id", id)]), 1);
    assert_eq!(
        counter_value(
            "sched_middleware_exponential_backoff_retries_total",
            &[("id", id)]
        ),
        3
    );
    assert_eq!(counter_value("sched_failed_jobs_total", &[("id", id)]), 4);

    let stamps = stamps.lock().expect("stamps lock");
    let gaps: Vec<Duration> = stamps.windows(2).map(|w| w[1] - w[0]).collect();
    assert!(gaps[0] >= Duration::from_millis(40), "first gap {:?}", gaps[0]);
    assert!(gaps[1] >= Duration::from_millis(80), "second gap {:?}", gaps[1]);
    assert!(gaps[2] >= Duration::from_millis(160), "third gap {:?}", gaps[2]);
    assert!(gaps[2] <= Duration::from_millis(450), "third gap {:?}", gaps[2]);
}

#[tokio::test(flavor = "multi_thread")]
async fn panicking_job_does_not_take_down_the_scheduler() {
    common::init_tracing();
    let id_bad = "panic-isolation-bad";
    let id_good = "panic-isolation-good";
    let good_runs = Arc::new(AtomicUsize::new(0));
    let good_runs2 = Arc::clone(&good_runs);

    let scheduler = Scheduler::new(SchedulerOptions::new());
    scheduler
        .add(
            CancellationToken::new(),
            id_bad,
            Box::new(Once::new(Duration::from_millis(20))),
            |_ctx| async {
                panic!("poison");
            },
            TaskOptions::new(),
        )
        .await
        .expect("add bad");
    scheduler
        .add(
            CancellationToken::new(),
            id_good,
            Box::new(Once::new(Duration::from_millis(200))),
            move |_ctx| {
                let good_runs = Arc::clone(&good_runs2);
                async move {
                    good_runs.fetch_add(1, Ordering::SeqCst);
                }
            },
            TaskOptions::new(),
        )
        .await
        .expect("add good");
    scheduler.start_all().await;

    tokio::time::sleep(Duration::from_millis(500)).await;
    scheduler.stop_all().await;

    assert_eq!(counter_value("sched_run_errors_total", &[("id", id_bad)]), 1);
    assert_eq!(
        good_runs.load(Ordering::SeqCst),
        1,
        "a later task must still fire after another task panicked"
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn deferring_link_short_circuits_the_pre_chain() {
    common::init_tracing();
    let id = "pre-chain-order";
    let calls: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));
    let ran = Arc::new(AtomicUsize::new(0));
    let ran2 = Arc::clone(&ran);

    let scheduler = Scheduler::new(SchedulerOptions::new());
    let options = TaskOptions::new()
        .with_execution_middleware(Arc::new(RecordingMiddleware {
            label: "a",
            decision: ExecDecision::NextMw,
            calls: Arc::clone(&calls),
        }))
        .with_execution_middleware(Arc::new(RecordingMiddleware {
            label: "b",
            decision: ExecDecision::Defer,
            calls: Arc::clone(&calls),
        }))
        .with_execution_middleware(Arc::new(RecordingMiddleware {
            label: "c",
            decision: ExecDecision::NextMw,
            calls: Arc::clone(&calls),
        }));
    scheduler
        .add(
            CancellationToken::new(),
            id,
            Box::new(Once::new(Duration::from_millis(20))),
            move |_ctx| {
                let ran = Arc::clone(&ran2);
                async move {
                    ran.fetch_add(1, Ordering::SeqCst);
                }
            },
            options,
        )
        .await
        .expect("add");
    scheduler.start(id).await.expect("start");

    tokio::time::sleep(Duration::from_millis(300)).await;
    scheduler.stop(id).await.expect("stop");

    assert_eq!(*calls.lock().expect("calls lock"), vec!["a", "b"]);
    assert_eq!(ran.load(Ordering::SeqCst), 0, "deferred fire must not dispatch");
    assert_eq!(counter_value("sched_deferred_jobs_total", &[("id", id)]), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn constant_backoff_rearms_a_deferred_once_timer() {
    common::init_tracing();
    let id = "retry-override";
    let ran = Arc::new(AtomicUsize::new(0));
    let ran2 = Arc::clone(&ran);

    // defers the first fire only, so the retry chain installs one override
    struct DeferFirst {
        remaining: AtomicUsize,
    }

    #[async_trait]
    impl ExecutionMiddleware for DeferFirst {
        fn name(&self) -> &'static str {
            "defer-first"
        }

        async fn pre_handler(&self, _task: &Task) -> ExecOutcome {
            if self
                .remaining
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                ExecOutcome::defer(JobFailure::deferred_job("warm-up"))
            } else {
                ExecOutcome::next_mw()
            }
        }

        async fn post_handler(&self, _task: &Task, _failure: Option<&JobFailure>) -> ExecDecision {
            ExecDecision::NextMw
        }
    }

    let scheduler = Scheduler::new(SchedulerOptions::new());
    let options = TaskOptions::new()
        .with_execution_middleware(Arc::new(DeferFirst {
            remaining: AtomicUsize::new(1),
        }))
        .with_retry_middleware(Arc::new(ConstantBackoff::new(Duration::from_millis(150))));
    scheduler
        .add(
            CancellationToken::new(),
            id,
            Box::new(Once::new(Duration::from_millis(20))),
            move |_ctx| {
                let ran = Arc::clone(&ran2);
                async move {
                    ran.fetch_add(1, Ordering::SeqCst);
                }
            },
            options,
        )
        .await
        .expect("add");

    let begin = Instant::now();
    scheduler.start(id).await.expect("start");

    tokio::time::sleep(Duration::from_millis(600)).await;
    scheduler.stop(id).await.expect("stop");

    assert_eq!(
        ran.load(Ordering::SeqCst),
        1,
        "the deferred Once timer must fire exactly once after the override"
    );
    assert!(begin.elapsed() >= Duration::from_millis(170));
    assert_eq!(
        counter_value(
            "sched_middleware_constant_backoff_retries_total",
            &[("id", id)]
        ),
        1
    );
    assert_eq!(counter_value("sched_reschedules_total", &[("id", id)]), 1);
}
