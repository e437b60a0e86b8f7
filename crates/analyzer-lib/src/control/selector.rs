//! Choice of which flow to detour away from an overloaded switch

use crate::models::{FlowKey, FlowStats, SwitchId};
use crate::scoring::{LoadScorer, NormalizationBounds};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::net::Ipv6Addr;

/// Address group (0-based, 16-bit) that carries the switch id of a host
pub const DEFAULT_ENDPOINT_SEGMENT: usize = 2;

/// Rank given to a DSCP value missing from the table
pub const DEFAULT_QOS_RANK: u8 = 1;

/// Candidate ordering policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionPolicy {
    /// Heaviest flow first
    Load,
    /// Least protected class first, heaviest first within a class
    #[default]
    QosAware,
}

/// DSCP to protection rank; lower ranks are detoured first
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QosPriorityTable {
    ranks: BTreeMap<u8, u8>,
}

impl Default for QosPriorityTable {
    fn default() -> Self {
        // BE, CS, AF, EF (by precedence and by the EF code point)
        Self::new([(0, 1), (3, 2), (5, 3), (7, 4), (46, 4)])
    }
}

impl QosPriorityTable {
    pub fn new(ranks: impl IntoIterator<Item = (u8, u8)>) -> Self {
        Self {
            ranks: ranks.into_iter().collect(),
        }
    }

    /// Add or replace the rank of `dscp`
    pub fn insert(&mut self, dscp: u8, rank: u8) {
        self.ranks.insert(dscp, rank);
    }

    pub fn rank(&self, dscp: u8) -> u8 {
        self.ranks.get(&dscp).copied().unwrap_or(DEFAULT_QOS_RANK)
    }
}

/// A flow eligible for detouring, with its load on the switch
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FlowCandidate {
    pub flow: FlowKey,
    pub dscp: u8,
    pub load: f64,
}

#[derive(Debug, Clone)]
pub struct FlowSelector {
    policy: SelectionPolicy,
    qos: QosPriorityTable,
    endpoint_segment: usize,
}

impl Default for FlowSelector {
    fn default() -> Self {
        Self::new(SelectionPolicy::default(), QosPriorityTable::default())
    }
}

impl FlowSelector {
    pub fn new(policy: SelectionPolicy, qos: QosPriorityTable) -> Self {
        Self {
            policy,
            qos,
            endpoint_segment: DEFAULT_ENDPOINT_SEGMENT,
        }
    }

    pub fn with_endpoint_segment(mut self, segment: usize) -> Self {
        self.endpoint_segment = segment;
        self
    }

    pub fn policy(&self) -> SelectionPolicy {
        self.policy
    }

    /// Whether `address` belongs to a host attached to `switch_id`
    pub fn is_endpoint(&self, address: &str, switch_id: SwitchId) -> bool {
        address
            .parse::<Ipv6Addr>()
            .ok()
            .and_then(|addr| addr.segments().get(self.endpoint_segment).copied())
            .map(|segment| u32::from(segment) == switch_id)
            .unwrap_or(false)
    }

    /// Eligible flows on `switch_id` in the order they should be tried
    ///
    /// Flows that start or end at the switch cannot be steered around it and
    /// are dropped, as are flows already attempted this cycle.
    pub fn rank_candidates(
        &self,
        switch_id: SwitchId,
        flows: &[FlowStats],
        bounds: &NormalizationBounds,
        scorer: &LoadScorer,
        attempted: &HashSet<FlowKey>,
    ) -> Vec<FlowCandidate> {
        let mut candidates: Vec<FlowCandidate> = flows
            .iter()
            .filter(|f| !attempted.contains(&f.flow))
            .filter(|f| {
                !self.is_endpoint(&f.flow.src_ip, switch_id)
                    && !self.is_endpoint(&f.flow.dst_ip, switch_id)
            })
            .map(|f| FlowCandidate {
                flow: f.flow.clone(),
                dscp: f.dscp,
                load: scorer.flow_load(f, bounds),
            })
            .collect();

        candidates.sort_by(|a, b| b.load.total_cmp(&a.load));
        if self.policy == SelectionPolicy::QosAware {
            candidates.sort_by_key(|c| self.qos.rank(c.dscp));
        }
        candidates
    }

    /// Best candidate, if any flow is eligible
    pub fn select_worst_flow(
        &self,
        switch_id: SwitchId,
        flows: &[FlowStats],
        bounds: &NormalizationBounds,
        scorer: &LoadScorer,
        attempted: &HashSet<FlowKey>,
    ) -> Option<FlowCandidate> {
        self.rank_candidates(switch_id, flows, bounds, scorer, attempted)
            .into_iter()
            .next()
    }
}
