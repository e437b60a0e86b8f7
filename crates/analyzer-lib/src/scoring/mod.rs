//! Congestion scoring
//!
//! - Normalization of raw window aggregates into `[0, 1]`
//! - Weighted-sum MCDA load per switch and per flow

mod mcda;
mod normalization;

pub use mcda::{LoadScorer, McdaWeights, WeightsError};
pub use normalization::{
    normalize, round3, Bounds, NormalizationBounds, NormalizedMetrics, Normalizer, OutlierFilter,
    DEFAULT_MTU_BYTES, DEFAULT_OUTLIER_PERCENTILE,
};
