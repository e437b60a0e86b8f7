//! Weighted-sum MCDA load scoring

use super::normalization::{round3, NormalizationBounds, NormalizedMetrics};
use crate::models::{FlowStats, SwitchId, SwitchLoad, SwitchStats};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use thiserror::Error;

/// Allowed deviation of the weight sum from 1.0
const WEIGHT_SUM_TOLERANCE: f64 = 1e-6;

/// Weight set validation failures
#[derive(Debug, Error, PartialEq)]
pub enum WeightsError {
    #[error("weight `{name}` is negative ({value})")]
    Negative { name: &'static str, value: f64 },
    #[error("weights must sum to 1.0, got {0}")]
    BadSum(f64),
}

/// Relative importance of each criterion
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct McdaWeights {
    /// Weight of the "not a static infrastructure switch" flag
    pub non_infra: f64,
    pub num_packets: f64,
    pub packet_size: f64,
    pub processing_time: f64,
}

impl Default for McdaWeights {
    fn default() -> Self {
        Self {
            non_infra: 0.30,
            num_packets: 0.10,
            packet_size: 0.10,
            processing_time: 0.50,
        }
    }
}

impl McdaWeights {
    pub fn validate(&self) -> Result<(), WeightsError> {
        for (name, value) in [
            ("non_infra", self.non_infra),
            ("num_packets", self.num_packets),
            ("packet_size", self.packet_size),
            ("processing_time", self.processing_time),
        ] {
            if !(value >= 0.0) {
                return Err(WeightsError::Negative { name, value });
            }
        }

        let sum = self.non_infra + self.num_packets + self.packet_size + self.processing_time;
        if (sum - 1.0).abs() > WEIGHT_SUM_TOLERANCE {
            return Err(WeightsError::BadSum(sum));
        }
        Ok(())
    }
}

/// Scores switches and flows with a validated weight set
#[derive(Debug, Clone)]
pub struct LoadScorer {
    weights: McdaWeights,
    infra_switches: HashSet<SwitchId>,
}

impl LoadScorer {
    pub fn new(
        weights: McdaWeights,
        infra_switches: impl IntoIterator<Item = SwitchId>,
    ) -> Result<Self, WeightsError> {
        weights.validate()?;
        Ok(Self {
            weights,
            infra_switches: infra_switches.into_iter().collect(),
        })
    }

    pub fn weights(&self) -> McdaWeights {
        self.weights
    }

    pub fn is_infrastructure(&self, switch_id: SwitchId) -> bool {
        self.infra_switches.contains(&switch_id)
    }

    /// Weighted sum of the criteria, rounded to three decimals
    pub fn score(&self, non_infra: bool, num_packets: f64, packet_size: f64, processing_time: f64) -> f64 {
        let w = &self.weights;
        let flag = if non_infra { 1.0 } else { 0.0 };
        round3(
            w.non_infra * flag
                + w.num_packets * num_packets
                + w.packet_size * packet_size
                + w.processing_time * processing_time,
        )
    }

    pub fn score_metrics(&self, non_infra: bool, metrics: &NormalizedMetrics) -> f64 {
        self.score(
            non_infra,
            metrics.num_packets,
            metrics.packet_size,
            metrics.processing_time,
        )
    }

    /// Load of every switch in the snapshot, in snapshot order
    pub fn switch_loads(&self, stats: &[SwitchStats], bounds: &NormalizationBounds) -> Vec<SwitchLoad> {
        stats
            .iter()
            .map(|s| {
                let non_infra = !self.is_infrastructure(s.switch_id);
                let load = self.score_metrics(non_infra, &bounds.normalize_switch(s));
                SwitchLoad::new(s.switch_id, load)
            })
            .collect()
    }

    /// Load of a single flow; flows are always scored as non-infrastructure
    pub fn flow_load(&self, stats: &FlowStats, bounds: &NormalizationBounds) -> f64 {
        self.score_metrics(true, &bounds.normalize_flow(stats))
    }
}
