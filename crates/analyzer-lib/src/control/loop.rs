//! The adaptive traffic-engineering loop
//!
//! Each cycle refreshes the normalization bounds, scores every switch and then,
//! depending on the phase, either detours flows away from overloaded switches
//! or withdraws the detours of switches that recovered. Phases alternate on
//! every completed cycle.

use super::phase::{Hysteresis, Phase, DEFAULT_ENTER_THRESHOLD, DEFAULT_EXIT_THRESHOLD};
use super::selector::{
    FlowCandidate, FlowSelector, QosPriorityTable, SelectionPolicy, DEFAULT_ENDPOINT_SEGMENT,
};
use crate::detour::DetourRuleManager;
use crate::gateway::{MetricsGateway, TimeWindow};
use crate::health::{components, HealthRegistry};
use crate::models::{DetourRule, FlowKey, SwitchId, SwitchLoad};
use crate::observability::AnalyzerMetrics;
use crate::scoring::{
    LoadScorer, McdaWeights, NormalizationBounds, Normalizer, OutlierFilter, DEFAULT_MTU_BYTES,
};
use anyhow::{Context, Result};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Control loop settings
#[derive(Debug, Clone)]
pub struct ControlConfig {
    /// Pause between cycles (default: 15 seconds)
    pub poll_interval: Duration,
    /// Length of the trailing analysis window (default: 15 seconds)
    pub window: Duration,
    pub enter_threshold: f64,
    pub exit_threshold: f64,
    pub weights: McdaWeights,
    /// Static infrastructure switches, scored without the non-infra bonus
    pub infra_switches: Vec<SwitchId>,
    pub mtu: u32,
    pub outlier_filter: OutlierFilter,
    pub selection_policy: SelectionPolicy,
    pub qos: QosPriorityTable,
    pub endpoint_segment: usize,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(15),
            window: Duration::from_secs(15),
            enter_threshold: DEFAULT_ENTER_THRESHOLD,
            exit_threshold: DEFAULT_EXIT_THRESHOLD,
            weights: McdaWeights::default(),
            infra_switches: (9..=14).collect(),
            mtu: DEFAULT_MTU_BYTES,
            outlier_filter: OutlierFilter::default(),
            selection_policy: SelectionPolicy::default(),
            qos: QosPriorityTable::default(),
            endpoint_segment: DEFAULT_ENDPOINT_SEGMENT,
        }
    }
}

/// How long the loop runs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunBudget {
    pub iterations: u32,
    /// Wall-clock length of one iteration; `None` runs a single unbounded one
    pub iteration_length: Option<Duration>,
}

impl RunBudget {
    pub fn unbounded() -> Self {
        Self {
            iterations: 1,
            iteration_length: None,
        }
    }
}

/// What a single cycle did
#[derive(Debug, Clone, PartialEq)]
pub enum CycleOutcome {
    /// No usable data; state untouched
    Skipped { reason: String },
    Scanned {
        overloaded: Vec<SwitchLoad>,
        detoured: Vec<(SwitchId, FlowKey)>,
    },
    Recovered {
        switches: Vec<SwitchId>,
        rules_removed: usize,
    },
}

/// Totals over a whole run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub iterations_completed: u32,
    pub cycles: u64,
    pub cycles_skipped: u64,
    pub detours_created: u64,
    pub rules_removed: u64,
    pub interrupted: bool,
}

impl RunSummary {
    fn record(&mut self, outcome: &CycleOutcome) {
        self.cycles += 1;
        match outcome {
            CycleOutcome::Skipped { .. } => self.cycles_skipped += 1,
            CycleOutcome::Scanned { detoured, .. } => self.detours_created += detoured.len() as u64,
            CycleOutcome::Recovered { rules_removed, .. } => {
                self.rules_removed += *rules_removed as u64
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ActiveRule {
    pub switch_id: SwitchId,
    pub rule: DetourRule,
}

/// Snapshot published after every cycle
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LoopStatus {
    pub iteration: u32,
    pub cycle: u64,
    pub phase: Phase,
    pub loads: Vec<SwitchLoad>,
    pub active_rules: Vec<ActiveRule>,
    pub last_skip_reason: Option<String>,
}

pub struct ControlLoop {
    gateway: Arc<dyn MetricsGateway>,
    rules: DetourRuleManager,
    config: ControlConfig,
    hysteresis: Hysteresis,
    scorer: LoadScorer,
    selector: FlowSelector,
    normalizer: Normalizer,
    phase: Phase,
    iteration: u32,
    cycle: u64,
    loads: Vec<SwitchLoad>,
    metrics: AnalyzerMetrics,
    health: Option<HealthRegistry>,
    status: Option<watch::Sender<LoopStatus>>,
}

impl ControlLoop {
    /// Validates thresholds and weights; both are fatal at startup
    pub fn new(
        gateway: Arc<dyn MetricsGateway>,
        rules: DetourRuleManager,
        config: ControlConfig,
    ) -> Result<Self> {
        let hysteresis = Hysteresis::new(config.enter_threshold, config.exit_threshold)
            .context("Invalid overload thresholds")?;
        let scorer = LoadScorer::new(config.weights, config.infra_switches.iter().copied())
            .context("Invalid MCDA weights")?;
        let selector = FlowSelector::new(config.selection_policy, config.qos.clone())
            .with_endpoint_segment(config.endpoint_segment);
        let normalizer = Normalizer::new(config.mtu, config.outlier_filter);

        Ok(Self {
            gateway,
            rules,
            config,
            hysteresis,
            scorer,
            selector,
            normalizer,
            phase: Phase::default(),
            iteration: 0,
            cycle: 0,
            loads: Vec::new(),
            metrics: AnalyzerMetrics::new(),
            health: None,
            status: None,
        })
    }

    pub fn with_health(mut self, health: HealthRegistry) -> Self {
        self.health = Some(health);
        self
    }

    /// Publish a [`LoopStatus`] after every cycle
    pub fn with_status(mut self, status: watch::Sender<LoopStatus>) -> Self {
        self.status = Some(status);
        self
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn rules(&self) -> &DetourRuleManager {
        &self.rules
    }

    pub fn config(&self) -> &ControlConfig {
        &self.config
    }

    /// Run one analysis cycle over `window`
    pub async fn run_cycle(&mut self, window: &TimeWindow) -> CycleOutcome {
        self.cycle += 1;
        self.rules.set_cycle(self.cycle);
        let started = Instant::now();

        let (loads, bounds) = match self.snapshot(window).await {
            Ok(Some(snapshot)) => snapshot,
            Ok(None) => return self.skip("no data in analysis window"),
            Err(e) => {
                self.set_degraded(components::METRICS_GATEWAY, format!("{:#}", e))
                    .await;
                return self.skip(&format!("metrics gateway error: {:#}", e));
            }
        };
        self.set_healthy(components::METRICS_GATEWAY).await;

        self.metrics
            .set_switch_loads(loads.iter().map(|s| (s.switch_id, s.load)));
        self.loads = loads;

        let outcome = match self.phase {
            Phase::ScanningForOverload => self.scan_for_overload(window, &bounds).await,
            Phase::ScanningForRecovery => self.scan_for_recovery().await,
        };
        self.phase = self.phase.next();

        self.metrics.inc_cycles_completed();
        self.metrics
            .observe_cycle_latency(started.elapsed().as_secs_f64());
        self.set_healthy(components::CONTROL_LOOP).await;
        if let Some(health) = &self.health {
            health.set_ready(true).await;
        }
        self.publish_status(None);

        debug!(cycle = self.cycle, outcome = ?outcome, "Cycle complete");
        outcome
    }

    /// Normalized switch loads for `window`, `None` when the store is empty
    async fn snapshot(
        &mut self,
        window: &TimeWindow,
    ) -> Result<Option<(Vec<SwitchLoad>, NormalizationBounds)>> {
        if !self.normalizer.refresh(self.gateway.as_ref(), window).await? {
            return Ok(None);
        }
        let Some(bounds) = self.normalizer.bounds().copied() else {
            return Ok(None);
        };

        let stats = match self.gateway.switch_stats(window).await? {
            Some(stats) if !stats.is_empty() => stats,
            _ => return Ok(None),
        };

        Ok(Some((self.scorer.switch_loads(&stats, &bounds), bounds)))
    }

    fn skip(&mut self, reason: &str) -> CycleOutcome {
        self.rules.logger().log_cycle_skipped(self.cycle, reason);
        self.metrics.inc_cycles_skipped();
        self.publish_status(Some(reason.to_string()));
        CycleOutcome::Skipped {
            reason: reason.to_string(),
        }
    }

    async fn scan_for_overload(
        &mut self,
        window: &TimeWindow,
        bounds: &NormalizationBounds,
    ) -> CycleOutcome {
        let overloaded = self.hysteresis.overloaded(&self.loads);
        let mut attempted: HashSet<FlowKey> = HashSet::new();
        let mut detoured = Vec::new();

        for switch in &overloaded {
            self.rules.logger().log_switch_overloaded(
                switch.switch_id,
                switch.load,
                self.hysteresis.enter(),
            );

            let flows = match self
                .gateway
                .flow_stats_on_switch(window, switch.switch_id)
                .await
            {
                Ok(flows) => flows,
                Err(e) => {
                    warn!(switch_id = switch.switch_id, error = %e, "Failed to query flows on switch");
                    continue;
                }
            };

            let candidates = self.selector.rank_candidates(
                switch.switch_id,
                &flows,
                bounds,
                &self.scorer,
                &attempted,
            );
            if candidates.is_empty() {
                info!(switch_id = switch.switch_id, "No eligible flow to detour");
                continue;
            }

            for candidate in candidates {
                attempted.insert(candidate.flow.clone());
                if self.try_detour(switch.switch_id, &candidate, &overloaded).await {
                    detoured.push((switch.switch_id, candidate.flow));
                    break;
                }
            }
        }

        CycleOutcome::Scanned {
            overloaded,
            detoured,
        }
    }

    /// One detour attempt; `true` when the controller accepted it
    async fn try_detour(
        &mut self,
        switch_id: SwitchId,
        candidate: &FlowCandidate,
        congested: &[SwitchLoad],
    ) -> bool {
        let path = match self.gateway.current_path(&candidate.flow).await {
            Ok(Some(path)) => path,
            Ok(None) => {
                self.detour_failed(switch_id, &candidate.flow, "no recorded path");
                return false;
            }
            Err(e) => {
                self.detour_failed(switch_id, &candidate.flow, &format!("{:#}", e));
                return false;
            }
        };

        match self
            .rules
            .request_detour(&candidate.flow, &path, congested)
            .await
        {
            Ok(outcome) if outcome.success => {
                self.set_healthy(components::CONTROLLER).await;
                let rule = DetourRule::new(outcome.source_device, candidate.flow.clone());
                self.rules.create(switch_id, rule).await;
                true
            }
            Ok(outcome) => {
                self.set_healthy(components::CONTROLLER).await;
                self.detour_failed(switch_id, &candidate.flow, &outcome.message);
                false
            }
            Err(e) => {
                self.set_degraded(components::CONTROLLER, format!("{:#}", e))
                    .await;
                self.detour_failed(switch_id, &candidate.flow, &format!("{:#}", e));
                false
            }
        }
    }

    fn detour_failed(&self, switch_id: SwitchId, flow: &FlowKey, reason: &str) {
        self.metrics.inc_detours_failed();
        self.rules.logger().log_detour_failed(switch_id, flow, reason);
    }

    async fn scan_for_recovery(&mut self) -> CycleOutcome {
        let tracked = self.rules.rules().switches();
        let recovered = self.hysteresis.recovered(&tracked, &self.loads);

        let mut rules_removed = 0;
        for switch in &recovered {
            self.rules.logger().log_switch_recovered(
                switch.switch_id,
                switch.load,
                self.hysteresis.exit(),
            );
            rules_removed += self.rules.remove_all(switch.switch_id).await;
        }

        CycleOutcome::Recovered {
            switches: recovered.iter().map(|s| s.switch_id).collect(),
            rules_removed,
        }
    }

    /// Withdraw every detour and start over in the overload phase
    pub async fn reset(&mut self) -> usize {
        let removed = self.rules.remove_everything().await;
        self.phase = Phase::default();
        self.publish_status(None);
        removed
    }

    /// Run until the budget is spent or `shutdown` fires
    pub async fn run(
        mut self,
        budget: RunBudget,
        mut shutdown: broadcast::Receiver<()>,
    ) -> RunSummary {
        info!(
            poll_interval_secs = self.config.poll_interval.as_secs(),
            iterations = budget.iterations,
            iteration_length_secs = budget.iteration_length.map(|d| d.as_secs()),
            "Starting control loop"
        );

        let mut summary = RunSummary::default();
        let iterations = if budget.iteration_length.is_some() {
            budget.iterations.max(1)
        } else {
            1
        };

        // Iterations are numbered from 1, as they appear in the audit log
        for iteration in 1..=iterations {
            self.iteration = iteration;
            self.rules.set_iteration(iteration);
            let deadline = budget.iteration_length.map(|length| Instant::now() + length);

            if !self.run_iteration(deadline, &mut shutdown, &mut summary).await {
                summary.interrupted = true;
                break;
            }

            // Idle until the iteration boundary
            if let Some(deadline) = deadline {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if !sleep_or_shutdown(remaining, &mut shutdown).await {
                    summary.interrupted = true;
                    break;
                }
            }

            let removed = self.reset().await;
            summary.rules_removed += removed as u64;
            summary.iterations_completed += 1;
            self.rules.logger().log_iteration_reset(iteration, removed);
        }

        if summary.interrupted {
            info!("Shutting down control loop, withdrawing detours");
            summary.rules_removed += self.reset().await as u64;
        }

        summary
    }

    /// Cycles until the deadline; `false` when shutdown was requested
    async fn run_iteration(
        &mut self,
        deadline: Option<Instant>,
        shutdown: &mut broadcast::Receiver<()>,
        summary: &mut RunSummary,
    ) -> bool {
        let poll = self.config.poll_interval;
        loop {
            if let Some(deadline) = deadline {
                if Instant::now() + poll >= deadline {
                    return true;
                }
            }

            let window = TimeWindow::trailing(self.config.window);
            let outcome = self.run_cycle(&window).await;
            summary.record(&outcome);

            let pause = deadline
                .map(|d| poll.min(d.saturating_duration_since(Instant::now())))
                .unwrap_or(poll);
            if !sleep_or_shutdown(pause, shutdown).await {
                return false;
            }
        }
    }

    fn publish_status(&self, last_skip_reason: Option<String>) {
        let Some(status) = &self.status else {
            return;
        };
        let snapshot = LoopStatus {
            iteration: self.iteration,
            cycle: self.cycle,
            phase: self.phase,
            loads: self.loads.clone(),
            active_rules: self
                .rules
                .rules()
                .iter()
                .map(|(switch_id, rule)| ActiveRule {
                    switch_id,
                    rule: rule.clone(),
                })
                .collect(),
            last_skip_reason,
        };
        status.send_replace(snapshot);
    }

    async fn set_healthy(&self, component: &str) {
        if let Some(health) = &self.health {
            health.set_healthy(component).await;
        }
    }

    async fn set_degraded(&self, component: &str, message: String) {
        if let Some(health) = &self.health {
            health.set_degraded(component, message).await;
        }
    }
}

/// Sleep for `duration`; `false` if shutdown arrived first
async fn sleep_or_shutdown(duration: Duration, shutdown: &mut broadcast::Receiver<()>) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(duration) => true,
        _ = shutdown.recv() => false,
    }
}
