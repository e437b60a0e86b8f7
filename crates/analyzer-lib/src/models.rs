//! Core data models for the traffic-engineering analyzer

use serde::{Deserialize, Serialize};
use std::fmt;

/// Numeric switch identifier as tagged in the telemetry store
pub type SwitchId = u32;

/// Source mask installed on every detour rule
pub const DEFAULT_SRC_MASK: u8 = 128;
/// Destination mask installed on every detour rule
pub const DEFAULT_DST_MASK: u8 = 128;
/// Flow label mask installed on every detour rule
pub const DEFAULT_FLOW_LABEL_MASK: u8 = 255;

/// Identity of a flow across the whole network
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FlowKey {
    pub src_ip: String,
    pub dst_ip: String,
    pub flow_label: String,
}

impl FlowKey {
    pub fn new(
        src_ip: impl Into<String>,
        dst_ip: impl Into<String>,
        flow_label: impl Into<String>,
    ) -> Self {
        Self {
            src_ip: src_ip.into(),
            dst_ip: dst_ip.into(),
            flow_label: flow_label.into(),
        }
    }
}

impl fmt::Display for FlowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {}, {})", self.src_ip, self.dst_ip, self.flow_label)
    }
}

/// Per-switch aggregates for one analysis window
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SwitchStats {
    pub switch_id: SwitchId,
    pub num_packets: u64,
    /// Mean packet size in bytes
    pub avg_size: f64,
    /// Mean per-hop processing time in nanoseconds
    pub avg_processing_time: f64,
}

/// Per-flow aggregates on a single switch for one analysis window
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowStats {
    pub flow: FlowKey,
    /// DSCP marking, 0 (best effort) when the store has none
    pub dscp: u8,
    pub num_packets: u64,
    pub avg_size: f64,
    pub avg_processing_time: f64,
}

/// MCDA load of one switch in the current cycle
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SwitchLoad {
    pub switch_id: SwitchId,
    pub load: f64,
}

impl SwitchLoad {
    pub fn new(switch_id: SwitchId, load: f64) -> Self {
        Self { switch_id, load }
    }
}

/// Reroute rule installed by the controller on behalf of an overloaded switch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DetourRule {
    /// Device that injects the segment list (the flow's ingress switch)
    pub device_id: String,
    pub flow: FlowKey,
    pub src_mask: u8,
    pub dst_mask: u8,
    pub flow_label_mask: u8,
}

impl DetourRule {
    /// Exact-match rule for `flow` injected at `device_id`
    pub fn new(device_id: impl Into<String>, flow: FlowKey) -> Self {
        Self {
            device_id: device_id.into(),
            flow,
            src_mask: DEFAULT_SRC_MASK,
            dst_mask: DEFAULT_DST_MASK,
            flow_label_mask: DEFAULT_FLOW_LABEL_MASK,
        }
    }
}
