//! Per-window normalization bounds
//!
//! Bounds are recomputed at the start of every cycle. `packet_size` is fixed
//! to `[0, MTU]`; `num_packets` and `processing_time` follow the current
//! window, the latter trimmed by an [`OutlierFilter`] so that a handful of
//! pathological samples cannot compress every other switch towards zero.

use crate::gateway::{MetricsGateway, TimeWindow};
use crate::models::{FlowStats, SwitchStats};
use anyhow::Result;
use serde::Serialize;
use tracing::debug;

/// Default percentile used to trim processing-time outliers
pub const DEFAULT_OUTLIER_PERCENTILE: f64 = 85.0;

/// Default network MTU in bytes
pub const DEFAULT_MTU_BYTES: u32 = 1500;

/// Round to three decimals
pub fn round3(value: f64) -> f64 {
    (value * 1000.0).round() / 1000.0
}

/// Min-max normalization rounded to three decimals
///
/// Returns `None` when the bounds are degenerate (`max <= min`, or NaN).
pub fn normalize(value: f64, min: f64, max: f64) -> Option<f64> {
    if !(max > min) {
        return None;
    }
    Some(round3((value - min) / (max - min)))
}

/// Closed `[min, max]` interval for one metric
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Bounds {
    pub min: f64,
    pub max: f64,
}

impl Bounds {
    pub fn new(min: f64, max: f64) -> Self {
        Self { min, max }
    }

    pub fn is_degenerate(&self) -> bool {
        !(self.max > self.min)
    }

    /// Normalize into `[0, 1]`
    ///
    /// Degenerate bounds yield 0.0 so the metric contributes nothing this
    /// cycle. Values beyond `max` saturate at 1.0.
    pub fn scale(&self, value: f64) -> f64 {
        normalize(value, self.min, self.max)
            .map(|v| v.clamp(0.0, 1.0))
            .unwrap_or(0.0)
    }
}

/// Percentile cut applied before taking the processing-time maximum
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OutlierFilter {
    pub percentile: f64,
}

impl Default for OutlierFilter {
    fn default() -> Self {
        Self {
            percentile: DEFAULT_OUTLIER_PERCENTILE,
        }
    }
}

/// Normalized inputs for the MCDA scorer
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NormalizedMetrics {
    pub num_packets: f64,
    pub packet_size: f64,
    pub processing_time: f64,
}

/// Bounds for every scored metric in the current window
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct NormalizationBounds {
    pub num_packets: Bounds,
    pub packet_size: Bounds,
    pub processing_time: Bounds,
}

impl NormalizationBounds {
    fn scale(&self, num_packets: u64, avg_size: f64, avg_processing_time: f64) -> NormalizedMetrics {
        NormalizedMetrics {
            num_packets: self.num_packets.scale(num_packets as f64),
            packet_size: self.packet_size.scale(avg_size),
            processing_time: self.processing_time.scale(avg_processing_time),
        }
    }

    pub fn normalize_switch(&self, stats: &SwitchStats) -> NormalizedMetrics {
        self.scale(stats.num_packets, stats.avg_size, stats.avg_processing_time)
    }

    pub fn normalize_flow(&self, stats: &FlowStats) -> NormalizedMetrics {
        self.scale(stats.num_packets, stats.avg_size, stats.avg_processing_time)
    }
}

/// Owns the bounds of the current cycle
#[derive(Debug, Clone)]
pub struct Normalizer {
    mtu: u32,
    filter: OutlierFilter,
    current: Option<NormalizationBounds>,
}

impl Normalizer {
    pub fn new(mtu: u32, filter: OutlierFilter) -> Self {
        Self {
            mtu,
            filter,
            current: None,
        }
    }

    /// Recompute bounds for `window`
    ///
    /// Returns `Ok(false)` when the store has no data for the window. Previous
    /// bounds are discarded before querying, so a failed refresh never leaves
    /// stale values behind.
    pub async fn refresh(
        &mut self,
        gateway: &dyn MetricsGateway,
        window: &TimeWindow,
    ) -> Result<bool> {
        self.current = None;

        let Some(cutoff) = gateway
            .latency_percentile(window, self.filter.percentile)
            .await?
        else {
            return Ok(false);
        };

        let Some(max_latency) = gateway.max_latency_at_or_below(window, cutoff).await? else {
            return Ok(false);
        };

        let Some(total_packets) = gateway.total_packets(window).await? else {
            return Ok(false);
        };

        let bounds = NormalizationBounds {
            num_packets: Bounds::new(0.0, total_packets as f64),
            packet_size: Bounds::new(0.0, self.mtu as f64),
            processing_time: Bounds::new(0.0, max_latency),
        };

        for (metric, b) in [
            ("num_packets", bounds.num_packets),
            ("processing_time", bounds.processing_time),
        ] {
            if b.is_degenerate() {
                debug!(metric, min = b.min, max = b.max, "Degenerate bounds, metric neutral this cycle");
            }
        }

        debug!(
            percentile = self.filter.percentile,
            cutoff,
            max_processing_time = max_latency,
            total_packets,
            "Refreshed normalization bounds"
        );

        self.current = Some(bounds);
        Ok(true)
    }

    /// Bounds of the last successful refresh
    pub fn bounds(&self) -> Option<&NormalizationBounds> {
        self.current.as_ref()
    }

    pub fn filter(&self) -> OutlierFilter {
        self.filter
    }
}
