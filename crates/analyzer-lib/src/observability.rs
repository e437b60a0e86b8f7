//! Observability infrastructure for the analyzer
//!
//! Provides:
//! - Prometheus metrics (cycle latency, detour counters, active rules, switch loads)
//! - Structured JSON logging of control-loop events with tracing

use crate::models::{FlowKey, SwitchId};
use prometheus::{
    register_gauge_vec, register_histogram, register_int_counter, register_int_gauge, GaugeVec,
    Histogram, IntCounter, IntGauge,
};
use std::sync::OnceLock;
use tracing::{info, warn};

/// Histogram buckets for cycle latency (in seconds); a cycle includes
/// controller round trips so it can take several seconds
const CYCLE_LATENCY_BUCKETS: &[f64] = &[0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0];

static GLOBAL_METRICS: OnceLock<AnalyzerMetricsInner> = OnceLock::new();

struct AnalyzerMetricsInner {
    cycle_latency_seconds: Histogram,
    cycles_completed: IntCounter,
    cycles_skipped: IntCounter,
    detours_requested: IntCounter,
    detours_created: IntCounter,
    detours_failed: IntCounter,
    rules_removed: IntCounter,
    active_rules: IntGauge,
    switch_load: GaugeVec,
}

impl AnalyzerMetricsInner {
    fn new() -> Self {
        Self {
            cycle_latency_seconds: register_histogram!(
                "int_analyzer_cycle_latency_seconds",
                "Time spent in one analysis cycle",
                CYCLE_LATENCY_BUCKETS.to_vec()
            )
            .expect("Failed to register cycle_latency_seconds"),

            cycles_completed: register_int_counter!(
                "int_analyzer_cycles_completed_total",
                "Analysis cycles that scored a full snapshot"
            )
            .expect("Failed to register cycles_completed"),

            cycles_skipped: register_int_counter!(
                "int_analyzer_cycles_skipped_total",
                "Analysis cycles skipped for lack of data or a store error"
            )
            .expect("Failed to register cycles_skipped"),

            detours_requested: register_int_counter!(
                "int_analyzer_detours_requested_total",
                "Detour requests sent to the controller"
            )
            .expect("Failed to register detours_requested"),

            detours_created: register_int_counter!(
                "int_analyzer_detours_created_total",
                "Detour requests acknowledged with success"
            )
            .expect("Failed to register detours_created"),

            detours_failed: register_int_counter!(
                "int_analyzer_detours_failed_total",
                "Detour requests that failed or could not be sent"
            )
            .expect("Failed to register detours_failed"),

            rules_removed: register_int_counter!(
                "int_analyzer_rules_removed_total",
                "Detour rules removed from the controller"
            )
            .expect("Failed to register rules_removed"),

            active_rules: register_int_gauge!(
                "int_analyzer_active_rules",
                "Detour rules currently tracked as installed"
            )
            .expect("Failed to register active_rules"),

            switch_load: register_gauge_vec!(
                "int_analyzer_switch_load",
                "MCDA load of each switch in the last completed cycle",
                &["switch_id"]
            )
            .expect("Failed to register switch_load"),
        }
    }
}

/// Handle to the process-wide analyzer metrics
///
/// Clones share the same underlying collectors.
#[derive(Clone)]
pub struct AnalyzerMetrics {
    _private: (),
}

impl Default for AnalyzerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl AnalyzerMetrics {
    pub fn new() -> Self {
        GLOBAL_METRICS.get_or_init(AnalyzerMetricsInner::new);
        Self { _private: () }
    }

    fn inner(&self) -> &AnalyzerMetricsInner {
        GLOBAL_METRICS.get_or_init(AnalyzerMetricsInner::new)
    }

    pub fn observe_cycle_latency(&self, duration_secs: f64) {
        self.inner().cycle_latency_seconds.observe(duration_secs);
    }

    pub fn inc_cycles_completed(&self) {
        self.inner().cycles_completed.inc();
    }

    pub fn inc_cycles_skipped(&self) {
        self.inner().cycles_skipped.inc();
    }

    pub fn inc_detours_requested(&self) {
        self.inner().detours_requested.inc();
    }

    pub fn inc_detours_created(&self) {
        self.inner().detours_created.inc();
    }

    pub fn inc_detours_failed(&self) {
        self.inner().detours_failed.inc();
    }

    pub fn inc_rules_removed(&self) {
        self.inner().rules_removed.inc();
    }

    pub fn set_active_rules(&self, count: usize) {
        self.inner().active_rules.set(count as i64);
    }

    /// Replace the per-switch load series with the latest snapshot
    pub fn set_switch_loads(&self, loads: impl IntoIterator<Item = (SwitchId, f64)>) {
        let gauge = &self.inner().switch_load;
        gauge.reset();
        for (switch_id, load) in loads {
            gauge.with_label_values(&[&switch_id.to_string()]).set(load);
        }
    }
}

/// Structured logger for control-loop events
///
/// Every event carries an `event` field so that the JSON log can be filtered
/// without parsing messages.
#[derive(Clone)]
pub struct StructuredLogger {
    routing: String,
}

impl StructuredLogger {
    pub fn new(routing: impl Into<String>) -> Self {
        Self {
            routing: routing.into(),
        }
    }

    pub fn routing(&self) -> &str {
        &self.routing
    }

    pub fn log_startup(&self, version: &str, iterations: u32) {
        info!(
            event = "analyzer_started",
            routing = %self.routing,
            version = %version,
            iterations,
            "Traffic analyzer started"
        );
    }

    pub fn log_shutdown(&self, reason: &str) {
        info!(
            event = "analyzer_shutdown",
            routing = %self.routing,
            reason = %reason,
            "Traffic analyzer shutting down"
        );
    }

    pub fn log_cycle_skipped(&self, cycle: u64, reason: &str) {
        warn!(
            event = "cycle_skipped",
            routing = %self.routing,
            cycle,
            reason = %reason,
            "Analysis cycle skipped"
        );
    }

    pub fn log_switch_overloaded(&self, switch_id: SwitchId, load: f64, threshold: f64) {
        warn!(
            event = "switch_overloaded",
            routing = %self.routing,
            switch_id,
            load,
            threshold,
            "Switch crossed the overload threshold"
        );
    }

    pub fn log_switch_recovered(&self, switch_id: SwitchId, load: f64, threshold: f64) {
        info!(
            event = "switch_recovered",
            routing = %self.routing,
            switch_id,
            load,
            threshold,
            "Switch dropped below the recovery threshold"
        );
    }

    pub fn log_detour_created(&self, switch_id: SwitchId, flow: &FlowKey, device_id: &str) {
        info!(
            event = "detour_created",
            routing = %self.routing,
            switch_id,
            flow = %flow,
            device_id = %device_id,
            "Detour rule installed"
        );
    }

    pub fn log_detour_failed(&self, switch_id: SwitchId, flow: &FlowKey, reason: &str) {
        warn!(
            event = "detour_failed",
            routing = %self.routing,
            switch_id,
            flow = %flow,
            reason = %reason,
            "Detour request failed"
        );
    }

    pub fn log_rule_removed(&self, switch_id: SwitchId, flow: &FlowKey, device_id: &str) {
        info!(
            event = "detour_rule_removed",
            routing = %self.routing,
            switch_id,
            flow = %flow,
            device_id = %device_id,
            "Detour rule removed"
        );
    }

    pub fn log_iteration_reset(&self, iteration: u32, rules_removed: usize) {
        info!(
            event = "iteration_reset",
            routing = %self.routing,
            iteration,
            rules_removed,
            "Iteration finished, network state reset"
        );
    }
}
