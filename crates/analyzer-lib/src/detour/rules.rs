//! Active detour rules and their lifecycle on the controller

use super::audit::{AuditLog, RuleAction};
use super::protocol::{self, ControllerChannel, DetourOutcome};
use crate::models::{DetourRule, FlowKey, SwitchId, SwitchLoad};
use crate::observability::{AnalyzerMetrics, StructuredLogger};
use anyhow::Result;
use std::collections::BTreeMap;
use tracing::warn;

/// Installed rules keyed by the overloaded switch that triggered them
///
/// At most one rule exists per [`FlowKey`] across all switches.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RuleSet {
    rules: BTreeMap<SwitchId, Vec<DetourRule>>,
}

impl RuleSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, switch_id: SwitchId) -> Option<&[DetourRule]> {
        self.rules.get(&switch_id).map(Vec::as_slice)
    }

    /// Owning switch and rule for `flow`
    pub fn find(&self, flow: &FlowKey) -> Option<(SwitchId, &DetourRule)> {
        self.rules.iter().find_map(|(switch_id, rules)| {
            rules
                .iter()
                .find(|rule| &rule.flow == flow)
                .map(|rule| (*switch_id, rule))
        })
    }

    /// Switches that currently own at least one rule
    pub fn switches(&self) -> Vec<SwitchId> {
        self.rules.keys().copied().collect()
    }

    /// Total number of rules
    pub fn len(&self) -> usize {
        self.rules.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Insert `rule` under `switch_id`, evicting any rule for the same flow
    ///
    /// Returns the evicted rule and its previous owner.
    pub fn insert(&mut self, switch_id: SwitchId, rule: DetourRule) -> Option<(SwitchId, DetourRule)> {
        let evicted = self.evict(&rule.flow);
        self.rules.entry(switch_id).or_default().push(rule);
        evicted
    }

    fn evict(&mut self, flow: &FlowKey) -> Option<(SwitchId, DetourRule)> {
        let (owner, index) = self.rules.iter().find_map(|(switch_id, rules)| {
            rules
                .iter()
                .position(|rule| &rule.flow == flow)
                .map(|index| (*switch_id, index))
        })?;

        let rules = self.rules.get_mut(&owner)?;
        let rule = rules.remove(index);
        if rules.is_empty() {
            self.rules.remove(&owner);
        }
        Some((owner, rule))
    }

    /// Remove and return every rule owned by `switch_id`
    pub fn take(&mut self, switch_id: SwitchId) -> Vec<DetourRule> {
        self.rules.remove(&switch_id).unwrap_or_default()
    }

    pub fn iter(&self) -> impl Iterator<Item = (SwitchId, &DetourRule)> {
        self.rules
            .iter()
            .flat_map(|(switch_id, rules)| rules.iter().map(move |rule| (*switch_id, rule)))
    }
}

/// Owns the controller session and the set of installed detours
///
/// Every mutation goes to the controller first, then to the local set, the
/// audit log and the metrics.
pub struct DetourRuleManager {
    channel: Box<dyn ControllerChannel>,
    rules: RuleSet,
    audit: AuditLog,
    logger: StructuredLogger,
    metrics: AnalyzerMetrics,
}

impl DetourRuleManager {
    pub fn new(
        channel: Box<dyn ControllerChannel>,
        audit: AuditLog,
        logger: StructuredLogger,
        metrics: AnalyzerMetrics,
    ) -> Self {
        Self {
            channel,
            rules: RuleSet::new(),
            audit,
            logger,
            metrics,
        }
    }

    pub fn rules(&self) -> &RuleSet {
        &self.rules
    }

    pub fn logger(&self) -> &StructuredLogger {
        &self.logger
    }

    pub fn set_iteration(&mut self, iteration: u32) {
        self.audit.set_iteration(iteration);
    }

    pub fn set_cycle(&mut self, cycle: u64) {
        self.audit.set_cycle(cycle);
    }

    /// Ask the controller to steer `flow` around `congested`
    pub async fn request_detour(
        &mut self,
        flow: &FlowKey,
        path: &str,
        congested: &[SwitchLoad],
    ) -> Result<DetourOutcome> {
        self.metrics.inc_detours_requested();
        protocol::request_detour(self.channel.as_mut(), flow, path, congested).await
    }

    /// Track a rule the controller accepted on behalf of `switch_id`
    ///
    /// An older rule for the same flow is dropped locally; the controller
    /// already replaced that flow's steering when it accepted the new detour.
    pub async fn create(&mut self, switch_id: SwitchId, rule: DetourRule) {
        self.logger.log_detour_created(switch_id, &rule.flow, &rule.device_id);
        audit_rule(&self.audit, RuleAction::Created, switch_id, &rule).await;

        if let Some((owner, evicted)) = self.rules.insert(switch_id, rule) {
            tracing::info!(
                flow = %evicted.flow,
                previous_owner = owner,
                new_owner = switch_id,
                "Replaced detour rule for flow"
            );
            audit_rule(&self.audit, RuleAction::Evicted, owner, &evicted).await;
        }

        self.metrics.inc_detours_created();
        self.metrics.set_active_rules(self.rules.len());
    }

    /// Remove every rule owned by `switch_id` from the controller
    ///
    /// The entry is dropped before any command is sent, so a failed removal is
    /// logged and never retried. Returns the number of rules processed.
    pub async fn remove_all(&mut self, switch_id: SwitchId) -> usize {
        let owned = self.rules.take(switch_id);

        for rule in &owned {
            if let Err(e) = protocol::remove_rule(self.channel.as_mut(), rule).await {
                warn!(
                    switch_id,
                    flow = %rule.flow,
                    error = %e,
                    "Failed to remove detour rule, dropping it locally"
                );
            }
            self.logger.log_rule_removed(switch_id, &rule.flow, &rule.device_id);
            audit_rule(&self.audit, RuleAction::Removed, switch_id, rule).await;
            self.metrics.inc_rules_removed();
        }

        self.metrics.set_active_rules(self.rules.len());
        owned.len()
    }

    /// Remove every installed rule
    pub async fn remove_everything(&mut self) -> usize {
        let mut removed = 0;
        for switch_id in self.rules.switches() {
            removed += self.remove_all(switch_id).await;
        }
        removed
    }
}

async fn audit_rule(audit: &AuditLog, action: RuleAction, switch_id: SwitchId, rule: &DetourRule) {
    if let Err(e) = audit.record_rule(action, switch_id, rule).await {
        warn!(error = %e, "Failed to write audit log entry");
    }
}
