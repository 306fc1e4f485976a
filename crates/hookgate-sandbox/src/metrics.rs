//! Prometheus metrics for guarded hook dispatch.
//!
//! This module is only compiled when the `metrics` feature is enabled.

use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::histogram::Histogram;
use prometheus_client::registry::Registry;

/// Label set for guarded call outcomes.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct OutcomeLabels {
    /// Plugin slug, or "core".
    pub plugin: String,
    /// "ok", "failed", "skipped_blocked", "skipped_open", "skipped_rate".
    pub outcome: String,
}

/// Label set for violations.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ViolationLabels {
    /// Plugin slug.
    pub plugin: String,
    /// Violation type name.
    pub violation_type: String,
}

/// Label set for callback timings.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct PluginLabels {
    /// Plugin slug, or "core".
    pub plugin: String,
}

/// Prometheus metrics for the hookgate guard.
pub struct GuardMetrics {
    /// Guarded calls by outcome.
    pub calls_total: Family<OutcomeLabels, Counter>,
    /// Sandbox violations by type.
    pub violations_total: Family<ViolationLabels, Counter>,
    /// Callback duration in seconds.
    pub callback_duration_seconds: Family<PluginLabels, Histogram>,
}

impl GuardMetrics {
    /// Create metrics and register them with `registry`.
    pub fn new(registry: &mut Registry) -> Self {
        let calls_total = Family::default();
        registry.register(
            "hookgate_calls_total",
            "Guarded hook callback invocations by outcome",
            calls_total.clone(),
        );

        let violations_total = Family::default();
        registry.register(
            "hookgate_violations_total",
            "Sandbox violations by type",
            violations_total.clone(),
        );

        let callback_duration_seconds =
            Family::<PluginLabels, Histogram>::new_with_constructor(|| {
                Histogram::new([0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 30.0].into_iter())
            });
        registry.register(
            "hookgate_callback_duration_seconds",
            "Plugin callback duration",
            callback_duration_seconds.clone(),
        );

        Self {
            calls_total,
            violations_total,
            callback_duration_seconds,
        }
    }

    /// Record a guarded call outcome.
    pub fn record_call(&self, plugin: &str, outcome: &str) {
        self.calls_total
            .get_or_create(&OutcomeLabels {
                plugin: plugin.to_string(),
                outcome: outcome.to_string(),
            })
            .inc();
    }

    /// Record a violation.
    pub fn record_violation(&self, plugin: &str, violation_type: &str) {
        self.violations_total
            .get_or_create(&ViolationLabels {
                plugin: plugin.to_string(),
                violation_type: violation_type.to_string(),
            })
            .inc();
    }

    /// Record a callback duration.
    pub fn observe_duration(&self, plugin: &str, seconds: f64) {
        self.callback_duration_seconds
            .get_or_create(&PluginLabels {
                plugin: plugin.to_string(),
            })
            .observe(seconds);
    }
}
