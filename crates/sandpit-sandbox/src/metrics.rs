//! Prometheus metrics for sandpit.
//!
//! This module is only compiled when the `metrics` feature is enabled.

use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::Histogram;
use prometheus_client::registry::Registry;
use std::sync::atomic::AtomicI64;

use crate::audit::TestOutcomeKind;
use crate::bundle::ExecutionMode;

/// Label set keyed by execution mode.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ModeLabels {
    /// "vanilla-dom", "react-component" or "pure-logic".
    pub mode: String,
}

/// Label set for test outcomes.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct OutcomeLabels {
    /// "passed", "wrong_output", "timeout" or "error".
    pub outcome: String,
}

/// Prometheus metrics for contexts and grading.
pub struct SandboxMetrics {
    /// Contexts launched, by mode.
    pub contexts_launched_total: Family<ModeLabels, Counter>,
    /// Contexts currently alive.
    pub live_contexts: Gauge<i64, AtomicI64>,
    /// Finished test cases, by outcome.
    pub test_outcomes_total: Family<OutcomeLabels, Counter>,
    /// Test case duration in seconds, by mode.
    pub test_duration_seconds: Family<ModeLabels, Histogram>,
}

impl SandboxMetrics {
    /// Create the metrics and register them with the given registry.
    pub fn new(registry: &mut Registry) -> Self {
        let contexts_launched_total = Family::default();
        registry.register(
            "sandpit_contexts_launched_total",
            "Isolated contexts launched",
            contexts_launched_total.clone(),
        );

        let live_contexts = Gauge::default();
        registry.register(
            "sandpit_live_contexts",
            "Isolated contexts currently alive",
            live_contexts.clone(),
        );

        let test_outcomes_total = Family::default();
        registry.register(
            "sandpit_test_outcomes_total",
            "Finished test cases by outcome",
            test_outcomes_total.clone(),
        );

        let test_duration_seconds = Family::<ModeLabels, Histogram>::new_with_constructor(|| {
            Histogram::new([0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 2.5, 5.0, 10.0, 15.0].into_iter())
        });
        registry.register(
            "sandpit_test_duration_seconds",
            "Test case duration",
            test_duration_seconds.clone(),
        );

        Self {
            contexts_launched_total,
            live_contexts,
            test_outcomes_total,
            test_duration_seconds,
        }
    }

    /// Record a context launch.
    pub fn record_launch(&self, mode: ExecutionMode) {
        self.contexts_launched_total
            .get_or_create(&ModeLabels {
                mode: mode.as_str().to_string(),
            })
            .inc();
        self.live_contexts.inc();
    }

    /// Record a context disposal.
    pub fn record_dispose(&self) {
        self.live_contexts.dec();
    }

    /// Record a finished test case.
    pub fn record_test(&self, mode: ExecutionMode, outcome: TestOutcomeKind, duration_secs: f64) {
        self.test_outcomes_total
            .get_or_create(&OutcomeLabels {
                outcome: outcome.as_str().to_string(),
            })
            .inc();
        self.test_duration_seconds
            .get_or_create(&ModeLabels {
                mode: mode.as_str().to_string(),
            })
            .observe(duration_secs);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prometheus_client::encoding::text::encode;

    #[test]
    fn launch_and_dispose_track_live_gauge() {
        let mut registry = Registry::default();
        let metrics = SandboxMetrics::new(&mut registry);
        metrics.record_launch(ExecutionMode::ReactComponent);
        metrics.record_launch(ExecutionMode::ReactComponent);
        metrics.record_dispose();

        let labels = ModeLabels {
            mode: "react-component".into(),
        };
        assert_eq!(metrics.contexts_launched_total.get_or_create(&labels).get(), 2);
        assert_eq!(metrics.live_contexts.get(), 1);
    }

    #[test]
    fn test_outcomes_are_counted_by_kind() {
        let mut registry = Registry::default();
        let metrics = SandboxMetrics::new(&mut registry);
        metrics.record_test(ExecutionMode::VanillaDom, TestOutcomeKind::Timeout, 10.0);
        metrics.record_test(ExecutionMode::VanillaDom, TestOutcomeKind::Timeout, 10.0);
        metrics.record_test(ExecutionMode::VanillaDom, TestOutcomeKind::Passed, 0.01);

        let labels = OutcomeLabels {
            outcome: "timeout".into(),
        };
        assert_eq!(metrics.test_outcomes_total.get_or_create(&labels).get(), 2);
    }

    #[test]
    fn metrics_encode_to_text() {
        let mut registry = Registry::default();
        let metrics = SandboxMetrics::new(&mut registry);
        metrics.record_launch(ExecutionMode::VanillaDom);
        metrics.record_test(ExecutionMode::VanillaDom, TestOutcomeKind::Passed, 0.2);

        let mut buf = String::new();
        encode(&mut buf, &registry).unwrap();
        assert!(buf.contains("sandpit_contexts_launched_total"), "{buf}");
        assert!(buf.contains("sandpit_test_duration_seconds"), "{buf}");
    }
}
