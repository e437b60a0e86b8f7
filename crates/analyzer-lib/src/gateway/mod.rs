//! Windowed aggregate queries against the telemetry store
//!
//! The control loop never talks to the store directly. Every query goes
//! through [`MetricsGateway`], which distinguishes "no data in this window"
//! (`Ok(None)` or an empty vector) from transport failures (`Err`).

mod influx;

pub use influx::{InfluxConfig, InfluxGateway};

use crate::models::{FlowKey, FlowStats, SwitchId, SwitchStats};
use anyhow::Result;
use chrono::{DateTime, Utc};
use std::time::Duration;

pub use async_trait::async_trait;

/// Timestamp layout used in store queries
const WINDOW_TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%SZ";

/// Rolling analysis window, closed at `end`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeWindow {
    /// Window of `length` ending now
    pub fn trailing(length: Duration) -> Self {
        Self::ending_at(Utc::now(), length)
    }

    /// Window of `length` ending at `end`
    pub fn ending_at(end: DateTime<Utc>, length: Duration) -> Self {
        let length = chrono::Duration::milliseconds(length.as_millis() as i64);
        Self {
            start: end - length,
            end,
        }
    }

    /// Lower bound formatted the way the store expects it in a WHERE clause
    pub fn start_timestamp(&self) -> String {
        self.start.format(WINDOW_TIMESTAMP_FORMAT).to_string()
    }
}

/// Aggregate queries consumed by the control loop
#[async_trait]
pub trait MetricsGateway: Send + Sync {
    /// Packet count, mean size and mean processing time grouped by switch
    async fn switch_stats(&self, window: &TimeWindow) -> Result<Option<Vec<SwitchStats>>>;

    /// The given percentile of per-hop processing time across all switches
    async fn latency_percentile(&self, window: &TimeWindow, percentile: f64)
        -> Result<Option<f64>>;

    /// Largest processing time that does not exceed `ceiling`
    async fn max_latency_at_or_below(
        &self,
        window: &TimeWindow,
        ceiling: f64,
    ) -> Result<Option<f64>>;

    /// Total number of packets observed across all flows
    async fn total_packets(&self, window: &TimeWindow) -> Result<Option<u64>>;

    /// Per-flow aggregates for every flow that crossed `switch_id`
    async fn flow_stats_on_switch(
        &self,
        window: &TimeWindow,
        switch_id: SwitchId,
    ) -> Result<Vec<FlowStats>>;

    /// Most recent path of `flow` as `-`-separated switch ids
    async fn current_path(&self, flow: &FlowKey) -> Result<Option<String>>;
}
