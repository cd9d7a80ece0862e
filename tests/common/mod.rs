//! Shared helpers for the integration tests.

use prometheus::proto::MetricType;

/// Install a tracing subscriber once per test binary so `RUST_LOG` controls
/// scheduler log output during test runs. Safe to call from every test; only
/// the first call wins.
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;

    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Current value of a counter in the default registry, matched by family
/// name and label set. Missing series read as zero.
#[allow(dead_code)]
pub fn counter_value(name: &str, labels: &[(&str, &str)]) -> u64 {
    metric_value(name, labels, MetricType::COUNTER) as u64
}

/// Current value of a gauge in the default registry.
#[allow(dead_code)]
pub fn gauge_value(name: &str, labels: &[(&str, &str)]) -> i64 {
    metric_value(name, labels, MetricType::GAUGE) as i64
}

fn metric_value(name: &str, labels: &[(&str, &str)], kind: MetricType) -> f64 {
    for family in prometheus::gather() {
        if family.get_name() != name {
            continue;
        }
        for metric in family.get_metric() {
            let pairs: Vec<(&str, &str)> = metric
                .get_label()
                .iter()
                .map(|l| (l.get_name(), l.get_value()))
                .collect();
            let matches = labels
                .iter()
                .all(|(k, v)| pairs.iter().any(|(pk, pv)| pk == k && pv == v));
            if matches {
                return match kind {
                    MetricType::COUNTER => metric.get_counter().get_value(),
                    MetricType::GAUGE => metric.get_gauge().get_value(),
                    _ => 0.0,
                };
            }
        }
    }
    0.0
}
