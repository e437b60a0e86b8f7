//! Alternating scan phases and the overload/recovery hysteresis band

use crate::models::{SwitchId, SwitchLoad};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

pub const DEFAULT_ENTER_THRESHOLD: f64 = 0.70;
pub const DEFAULT_EXIT_THRESHOLD: f64 = 0.60;

/// What the next completed cycle looks for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    #[default]
    ScanningForOverload,
    ScanningForRecovery,
}

impl Phase {
    pub fn next(self) -> Self {
        match self {
            Phase::ScanningForOverload => Phase::ScanningForRecovery,
            Phase::ScanningForRecovery => Phase::ScanningForOverload,
        }
    }
}

#[derive(Debug, Error, PartialEq)]
#[error("thresholds must satisfy 0 <= exit < enter <= 1 (enter {enter}, exit {exit})")]
pub struct ThresholdError {
    pub enter: f64,
    pub exit: f64,
}

/// Enter/exit thresholds with a dead band between them
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Hysteresis {
    enter: f64,
    exit: f64,
}

impl Default for Hysteresis {
    fn default() -> Self {
        Self {
            enter: DEFAULT_ENTER_THRESHOLD,
            exit: DEFAULT_EXIT_THRESHOLD,
        }
    }
}

impl Hysteresis {
    pub fn new(enter: f64, exit: f64) -> Result<Self, ThresholdError> {
        if !(0.0 <= exit && exit < enter && enter <= 1.0) {
            return Err(ThresholdError { enter, exit });
        }
        Ok(Self { enter, exit })
    }

    pub fn enter(&self) -> f64 {
        self.enter
    }

    pub fn exit(&self) -> f64 {
        self.exit
    }

    pub fn is_overloaded(&self, load: f64) -> bool {
        load >= self.enter
    }

    pub fn is_recovered(&self, load: f64) -> bool {
        load <= self.exit
    }

    /// Switches at or above the enter threshold, in snapshot order
    pub fn overloaded(&self, loads: &[SwitchLoad]) -> Vec<SwitchLoad> {
        loads
            .iter()
            .filter(|s| self.is_overloaded(s.load))
            .copied()
            .collect()
    }

    /// Tracked switches at or below the exit threshold
    ///
    /// A tracked switch missing from the snapshot counts as load 0.
    pub fn recovered(&self, tracked: &[SwitchId], loads: &[SwitchLoad]) -> Vec<SwitchLoad> {
        let by_id: HashMap<SwitchId, f64> = loads.iter().map(|s| (s.switch_id, s.load)).collect();
        tracked
            .iter()
            .map(|id| SwitchLoad::new(*id, by_id.get(id).copied().unwrap_or(0.0)))
            .filter(|s| self.is_recovered(s.load))
            .collect()
    }
}
