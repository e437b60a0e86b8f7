//! Overload detection and detour decisions
//!
//! The loop alternates between scanning for overloaded switches and scanning
//! for recovered ones. Overloaded switches shed their heaviest, least
//! protected flow onto a detour; recovered switches get their detours back.

mod phase;
mod r#loop;
mod selector;

#[cfg(test)]
mod tests;

pub use phase::{Hysteresis, Phase, ThresholdError, DEFAULT_ENTER_THRESHOLD, DEFAULT_EXIT_THRESHOLD};
pub use r#loop::{
    ActiveRule, ControlConfig, ControlLoop, CycleOutcome, LoopStatus, RunBudget, RunSummary,
};
pub use selector::{
    FlowCandidate, FlowSelector, QosPriorityTable, SelectionPolicy, DEFAULT_ENDPOINT_SEGMENT,
    DEFAULT_QOS_RANK,
};
