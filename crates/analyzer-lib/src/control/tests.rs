//! Control loop scenarios against in-memory store and controller mocks

#[cfg(test)]
mod scenario_tests {
    use crate::control::{
        ControlConfig, ControlLoop, CycleOutcome, LoopStatus, Phase, RunBudget, SelectionPolicy,
    };
    use crate::detour::{AuditLog, ControllerChannel, DetourRuleManager};
    use crate::gateway::{async_trait, MetricsGateway, TimeWindow};
    use crate::health::{components, ComponentStatus, HealthRegistry};
    use crate::models::{FlowKey, FlowStats, SwitchId, SwitchLoad, SwitchStats};
    use crate::observability::{AnalyzerMetrics, StructuredLogger};
    use anyhow::Result;
    use std::collections::{HashMap, VecDeque};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;
    use tokio::sync::{broadcast, watch};

    const SUCCESS_REPLY: &str = "Path-Detour-SRv6 ...\r\nComputing\r\nInstalling\r\nSuccess\r\n";
    const FAILURE_REPLY: &str = "Path-Detour-SRv6 ...\r\nComputing\r\n\r\nFailure: no alternate path\r\n";

    #[derive(Default)]
    struct GatewayState {
        switches: Option<Vec<SwitchStats>>,
        flows: HashMap<SwitchId, Vec<FlowStats>>,
        paths: HashMap<FlowKey, String>,
        unreachable: bool,
        flow_queries: Vec<SwitchId>,
    }

    /// Store mock with fixed bounds: 1000 packets, 1500 byte MTU, 1000 ns
    #[derive(Default)]
    struct MockGateway {
        state: Mutex<GatewayState>,
    }

    impl MockGateway {
        fn set_switches(&self, switches: Vec<SwitchStats>) {
            self.state.lock().unwrap().switches = Some(switches);
        }

        fn add_flow(&self, switch_id: SwitchId, flow: FlowStats, path: &str) {
            let mut state = self.state.lock().unwrap();
            state.paths.insert(flow.flow.clone(), path.to_string());
            state.flows.entry(switch_id).or_default().push(flow);
        }

        fn check(&self) -> Result<bool> {
            let state = self.state.lock().unwrap();
            if state.unreachable {
                anyhow::bail!("connection refused");
            }
            Ok(state.switches.is_some())
        }
    }

    #[async_trait]
    impl MetricsGateway for MockGateway {
        async fn switch_stats(&self, _: &TimeWindow) -> Result<Option<Vec<SwitchStats>>> {
            self.check()?;
            Ok(self.state.lock().unwrap().switches.clone())
        }

        async fn latency_percentile(&self, _: &TimeWindow, _: f64) -> Result<Option<f64>> {
            Ok(self.check()?.then_some(1000.0))
        }

        async fn max_latency_at_or_below(&self, _: &TimeWindow, ceiling: f64) -> Result<Option<f64>> {
            Ok(self.check()?.then_some(ceiling))
        }

        async fn total_packets(&self, _: &TimeWindow) -> Result<Option<u64>> {
            Ok(self.check()?.then_some(1000))
        }

        async fn flow_stats_on_switch(&self, _: &TimeWindow, switch_id: SwitchId) -> Result<Vec<FlowStats>> {
            let mut state = self.state.lock().unwrap();
            state.flow_queries.push(switch_id);
            Ok(state.flows.get(&switch_id).cloned().unwrap_or_default())
        }

        async fn current_path(&self, flow: &FlowKey) -> Result<Option<String>> {
            Ok(self.state.lock().unwrap().paths.get(flow).cloned())
        }
    }

    #[derive(Default)]
    struct ControllerState {
        sent: Vec<String>,
        /// Replies to detour requests, in order; success once exhausted
        detour_replies: VecDeque<&'static str>,
    }

    #[derive(Clone, Default)]
    struct MockController {
        state: Arc<Mutex<ControllerState>>,
    }

    impl MockController {
        fn script(&self, replies: &[&'static str]) {
            self.state.lock().unwrap().detour_replies = replies.iter().copied().collect();
        }

        fn sent(&self) -> Vec<String> {
            self.state.lock().unwrap().sent.clone()
        }

        fn sent_with(&self, prefix: &str) -> Vec<String> {
            self.sent().into_iter().filter(|c| c.starts_with(prefix)).collect()
        }
    }

    #[async_trait]
    impl ControllerChannel for MockController {
        async fn send(&mut self, command: &str) -> Result<String> {
            let mut state = self.state.lock().unwrap();
            state.sent.push(command.to_string());
            if command.starts_with("Path-Detour-SRv6") {
                return Ok(state.detour_replies.pop_front().unwrap_or(SUCCESS_REPLY).to_string());
            }
            Ok(String::new())
        }
    }

    /// Raw switch aggregates that score to `load` under the default weights
    fn switch_with_load(switch_id: SwitchId, load: f64, infra: bool) -> SwitchStats {
        let rest = load - if infra { 0.0 } else { 0.3 };
        let time = (rest / 0.5).min(1.0);
        let extra = ((rest - 0.5 * time) / 0.2).max(0.0);
        SwitchStats {
            switch_id,
            num_packets: (extra * 1000.0).round() as u64,
            avg_size: (extra * 1500.0).round(),
            avg_processing_time: (time * 1000.0).round(),
        }
    }

    fn flow(label: &str) -> FlowKey {
        FlowKey::new("2001:1:1::1", "2001:1:5::1", label)
    }

    fn flow_stats(label: &str, dscp: u8, processing_time: f64) -> FlowStats {
        FlowStats {
            flow: flow(label),
            dscp,
            num_packets: 100,
            avg_size: 600.0,
            avg_processing_time: processing_time,
        }
    }

    fn build(gateway: &Arc<MockGateway>, controller: &MockController, config: ControlConfig) -> ControlLoop {
        let manager = DetourRuleManager::new(
            Box::new(controller.clone()),
            AuditLog::disabled(),
            StructuredLogger::new("test"),
            AnalyzerMetrics::new(),
        );
        ControlLoop::new(gateway.clone(), manager, config).unwrap()
    }

    fn window() -> TimeWindow {
        TimeWindow::trailing(Duration::from_secs(15))
    }

    #[tokio::test]
    async fn test_only_non_infrastructure_overload_is_detoured() {
        let gateway = Arc::new(MockGateway::default());
        gateway.set_switches(vec![
            switch_with_load(9, 0.55, true),
            switch_with_load(12, 0.82, false),
        ]);
        gateway.add_flow(12, flow_stats("3", 0, 700.0), "1-12-5");
        let controller = MockController::default();
        let config = ControlConfig {
            infra_switches: vec![9],
            ..ControlConfig::default()
        };
        let mut control = build(&gateway, &controller, config);

        let outcome = control.run_cycle(&window()).await;

        assert_eq!(
            outcome,
            CycleOutcome::Scanned {
                overloaded: vec![SwitchLoad::new(12, 0.82)],
                detoured: vec![(12, flow("3"))],
            }
        );
        assert_eq!(gateway.state.lock().unwrap().flow_queries, vec![12]);
        assert_eq!(
            controller.sent(),
            vec!["Path-Detour-SRv6 device:r1 device:r5 2001:1:1::1 2001:1:5::1 3 12-5 12 0.82"]
        );

        let (owner, rule) = control.rules().rules().find(&flow("3")).unwrap();
        assert_eq!(owner, 12);
        assert_eq!(rule.device_id, "1");
        assert_eq!(control.phase(), Phase::ScanningForRecovery);
    }

    #[tokio::test]
    async fn test_switch_missing_from_snapshot_recovers() {
        let gateway = Arc::new(MockGateway::default());
        gateway.set_switches(vec![switch_with_load(12, 0.82, false)]);
        gateway.add_flow(12, flow_stats("3", 0, 700.0), "1-12-5");
        let controller = MockController::default();
        let config = ControlConfig {
            infra_switches: vec![9],
            ..ControlConfig::default()
        };
        let mut control = build(&gateway, &controller, config);

        control.run_cycle(&window()).await;
        assert_eq!(control.rules().rules().get(12).map(|r| r.len()), Some(1));

        gateway.set_switches(vec![switch_with_load(4, 0.4, false)]);
        let outcome = control.run_cycle(&window()).await;

        assert_eq!(
            outcome,
            CycleOutcome::Recovered {
                switches: vec![12],
                rules_removed: 1,
            }
        );
        assert!(control.rules().rules().get(12).is_none());
        assert_eq!(
            controller.sent_with("srv6-remove"),
            vec!["srv6-remove device:r1 2001:1:1::1 2001:1:5::1 3 128 128 255"]
        );
    }

    #[tokio::test]
    async fn test_dead_band_never_creates_or_removes() {
        let gateway = Arc::new(MockGateway::default());
        gateway.set_switches(vec![switch_with_load(4, 0.82, false)]);
        gateway.add_flow(4, flow_stats("3", 0, 700.0), "1-4-5");
        gateway.add_flow(4, flow_stats("7", 0, 600.0), "1-4-5");
        let controller = MockController::default();
        let mut control = build(&gateway, &controller, ControlConfig::default());

        control.run_cycle(&window()).await;
        let rules_before = control.rules().rules().clone();
        let sent_before = controller.sent().len();

        for load in [0.61, 0.69, 0.65, 0.61, 0.69, 0.62] {
            gateway.set_switches(vec![switch_with_load(4, load, false)]);
            let outcome = control.run_cycle(&window()).await;
            assert!(!matches!(outcome, CycleOutcome::Skipped { .. }));
        }

        assert_eq!(control.rules().rules(), &rules_before);
        assert_eq!(controller.sent().len(), sent_before);
    }

    #[tokio::test]
    async fn test_expedited_forwarding_flow_detoured_last() {
        let gateway = Arc::new(MockGateway::default());
        gateway.set_switches(vec![switch_with_load(4, 0.9, false)]);
        for (label, dscp) in [("ef", 7), ("af", 5), ("cs", 3), ("be", 0)] {
            gateway.add_flow(4, flow_stats(label, dscp, 500.0), "1-4-5");
        }
        let controller = MockController::default();
        controller.script(&[FAILURE_REPLY, FAILURE_REPLY, FAILURE_REPLY]);
        let mut control = build(&gateway, &controller, ControlConfig::default());

        let outcome = control.run_cycle(&window()).await;

        let labels: Vec<String> = controller
            .sent()
            .iter()
            .map(|c| c.split(' ').nth(5).unwrap().to_string())
            .collect();
        assert_eq!(labels, vec!["be", "cs", "af", "ef"]);
        assert!(matches!(
            outcome,
            CycleOutcome::Scanned { ref detoured, .. } if detoured == &vec![(4, flow("ef"))]
        ));
    }

    #[tokio::test]
    async fn test_load_policy_detours_heaviest_flow() {
        let gateway = Arc::new(MockGateway::default());
        gateway.set_switches(vec![switch_with_load(4, 0.9, false)]);
        gateway.add_flow(4, flow_stats("be", 0, 200.0), "1-4-5");
        gateway.add_flow(4, flow_stats("ef", 46, 900.0), "1-4-5");
        let controller = MockController::default();
        let config = ControlConfig {
            selection_policy: SelectionPolicy::Load,
            ..ControlConfig::default()
        };
        let mut control = build(&gateway, &controller, config);

        control.run_cycle(&window()).await;

        assert!(control.rules().rules().find(&flow("ef")).is_some());
        assert!(control.rules().rules().find(&flow("be")).is_none());
    }

    #[tokio::test]
    async fn test_failed_request_tries_next_candidate() {
        let gateway = Arc::new(MockGateway::default());
        gateway.set_switches(vec![switch_with_load(4, 0.9, false)]);
        gateway.add_flow(4, flow_stats("heavy", 0, 900.0), "1-4-5");
        gateway.add_flow(4, flow_stats("medium", 0, 600.0), "2-4-5");
        gateway.add_flow(4, flow_stats("light", 0, 300.0), "3-4-5");
        // No path recorded for the medium flow
        gateway.state.lock().unwrap().paths.remove(&flow("medium"));
        let controller = MockController::default();
        controller.script(&[FAILURE_REPLY]);
        let mut control = build(&gateway, &controller, ControlConfig::default());

        control.run_cycle(&window()).await;

        assert_eq!(controller.sent().len(), 2);
        let (_, rule) = control.rules().rules().find(&flow("light")).unwrap();
        assert_eq!(rule.device_id, "3");
        assert_eq!(control.rules().rules().len(), 1);
    }

    #[tokio::test]
    async fn test_switch_stays_overloaded_when_every_attempt_fails() {
        let gateway = Arc::new(MockGateway::default());
        gateway.set_switches(vec![switch_with_load(4, 0.9, false)]);
        gateway.add_flow(4, flow_stats("a", 0, 900.0), "1-4-5");
        gateway.add_flow(4, flow_stats("b", 0, 600.0), "1-4-5");
        let controller = MockController::default();
        controller.script(&[FAILURE_REPLY, FAILURE_REPLY]);
        let mut control = build(&gateway, &controller, ControlConfig::default());

        let outcome = control.run_cycle(&window()).await;

        assert!(matches!(outcome, CycleOutcome::Scanned { ref detoured, .. } if detoured.is_empty()));
        assert!(control.rules().rules().is_empty());
        assert_eq!(control.phase(), Phase::ScanningForRecovery);
    }

    #[tokio::test]
    async fn test_one_rule_per_flow_across_switches() {
        let gateway = Arc::new(MockGateway::default());
        gateway.set_switches(vec![
            switch_with_load(4, 0.9, false),
            switch_with_load(6, 0.9, false),
        ]);
        gateway.add_flow(4, flow_stats("3", 0, 700.0), "1-4-6-5");
        gateway.add_flow(6, flow_stats("3", 0, 700.0), "1-4-6-5");
        let controller = MockController::default();
        let mut control = build(&gateway, &controller, ControlConfig::default());

        // Flow already attempted for switch 4 is not retried for 6
        let outcome = control.run_cycle(&window()).await;
        assert!(matches!(
            outcome,
            CycleOutcome::Scanned { ref detoured, .. } if detoured == &vec![(4, flow("3"))]
        ));

        // Recovery phase: nothing recovered
        control.run_cycle(&window()).await;
        assert_eq!(control.rules().rules().len(), 1);

        // Next overload scan hands the flow to switch 6
        gateway.set_switches(vec![
            switch_with_load(4, 0.65, false),
            switch_with_load(6, 0.9, false),
        ]);
        control.run_cycle(&window()).await;

        let rules = control.rules().rules();
        assert_eq!(rules.len(), 1);
        assert_eq!(rules.find(&flow("3")).map(|(owner, _)| owner), Some(6));
        assert!(rules.get(4).is_none());
    }

    #[tokio::test]
    async fn test_no_data_skips_without_flipping_phase() {
        let gateway = Arc::new(MockGateway::default());
        let controller = MockController::default();
        let health = HealthRegistry::with_all_components().await;
        let mut control =
            build(&gateway, &controller, ControlConfig::default()).with_health(health.clone());

        let outcome = control.run_cycle(&window()).await;
        assert!(matches!(outcome, CycleOutcome::Skipped { .. }));
        assert_eq!(control.phase(), Phase::ScanningForOverload);

        gateway.set_switches(vec![]);
        assert!(matches!(control.run_cycle(&window()).await, CycleOutcome::Skipped { .. }));
        assert_eq!(control.phase(), Phase::ScanningForOverload);
        assert!(!health.readiness().await.ready);
        assert!(controller.sent().is_empty());
    }

    #[tokio::test]
    async fn test_gateway_error_degrades_health() {
        let gateway = Arc::new(MockGateway::default());
        gateway.set_switches(vec![switch_with_load(4, 0.4, false)]);
        gateway.state.lock().unwrap().unreachable = true;
        let controller = MockController::default();
        let health = HealthRegistry::with_all_components().await;
        let mut control =
            build(&gateway, &controller, ControlConfig::default()).with_health(health.clone());

        let outcome = control.run_cycle(&window()).await;
        assert!(
            matches!(outcome, CycleOutcome::Skipped { ref reason } if reason.contains("connection refused"))
        );
        let report = health.health().await;
        assert_eq!(
            report.components[components::METRICS_GATEWAY].status,
            ComponentStatus::Degraded
        );

        gateway.state.lock().unwrap().unreachable = false;
        control.run_cycle(&window()).await;
        assert_eq!(health.health().await.status, ComponentStatus::Healthy);
        assert!(health.readiness().await.ready);
    }

    #[tokio::test]
    async fn test_status_snapshot_published() {
        let gateway = Arc::new(MockGateway::default());
        gateway.set_switches(vec![switch_with_load(4, 0.9, false)]);
        gateway.add_flow(4, flow_stats("3", 0, 700.0), "1-4-5");
        let controller = MockController::default();
        let (tx, rx) = watch::channel(LoopStatus::default());
        let mut control = build(&gateway, &controller, ControlConfig::default()).with_status(tx);

        control.run_cycle(&window()).await;

        let status = rx.borrow().clone();
        assert_eq!(status.cycle, 1);
        assert_eq!(status.phase, Phase::ScanningForRecovery);
        assert_eq!(status.loads, vec![SwitchLoad::new(4, 0.9)]);
        assert_eq!(status.active_rules.len(), 1);
        assert_eq!(status.active_rules[0].switch_id, 4);
    }

    #[tokio::test]
    async fn test_reset_withdraws_everything() {
        let gateway = Arc::new(MockGateway::default());
        gateway.set_switches(vec![
            switch_with_load(4, 0.9, false),
            switch_with_load(6, 0.8, false),
        ]);
        gateway.add_flow(4, flow_stats("3", 0, 700.0), "1-4-5");
        gateway.add_flow(6, flow_stats("8", 0, 700.0), "2-6-5");
        let controller = MockController::default();
        let mut control = build(&gateway, &controller, ControlConfig::default());

        control.run_cycle(&window()).await;
        assert_eq!(control.rules().rules().len(), 2);

        assert_eq!(control.reset().await, 2);
        assert!(control.rules().rules().is_empty());
        assert_eq!(control.phase(), Phase::ScanningForOverload);
        assert_eq!(controller.sent_with("srv6-remove").len(), 2);
    }

    #[test]
    fn test_invalid_configuration_is_rejected() {
        let gateway: Arc<MockGateway> = Arc::new(MockGateway::default());
        let controller = MockController::default();
        let manager = || {
            DetourRuleManager::new(
                Box::new(controller.clone()),
                AuditLog::disabled(),
                StructuredLogger::new("test"),
                AnalyzerMetrics::new(),
            )
        };

        let thresholds = ControlConfig {
            enter_threshold: 0.6,
            exit_threshold: 0.7,
            ..ControlConfig::default()
        };
        assert!(ControlLoop::new(gateway.clone(), manager(), thresholds).is_err());

        let mut weights = ControlConfig::default();
        weights.weights.processing_time = 0.9;
        assert!(ControlLoop::new(gateway, manager(), weights).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_iteration_budget() {
        let gateway = Arc::new(MockGateway::default());
        gateway.set_switches(vec![switch_with_load(4, 0.9, false)]);
        gateway.add_flow(4, flow_stats("3", 0, 700.0), "1-4-5");
        let controller = MockController::default();
        let control = build(&gateway, &controller, ControlConfig::default());
        let (_shutdown_tx, shutdown_rx) = broadcast::channel(1);

        let budget = RunBudget {
            iterations: 2,
            iteration_length: Some(Duration::from_secs(60)),
        };
        let started = tokio::time::Instant::now();
        let summary = control.run(budget, shutdown_rx).await;

        // Cycles at 0s, 15s and 30s; the 45s slot would overrun the boundary
        assert_eq!(summary.iterations_completed, 2);
        assert_eq!(summary.cycles, 6);
        assert_eq!(summary.detours_created, 4);
        assert!(!summary.interrupted);
        assert_eq!(started.elapsed(), Duration::from_secs(120));
        // The single tracked rule is withdrawn at each iteration boundary
        assert_eq!(summary.rules_removed, 2);
        assert_eq!(controller.sent_with("srv6-remove").len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_iterations_numbered_from_one_in_audit_log() {
        let dir = tempfile::TempDir::new().unwrap();
        let audit = AuditLog::for_routing(dir.path(), "ecmp").await.unwrap();
        let path = audit.path().unwrap().to_path_buf();

        let gateway = Arc::new(MockGateway::default());
        gateway.set_switches(vec![switch_with_load(4, 0.9, false)]);
        gateway.add_flow(4, flow_stats("3", 0, 700.0), "1-4-5");
        let controller = MockController::default();
        let manager = DetourRuleManager::new(
            Box::new(controller.clone()),
            audit,
            StructuredLogger::new("ecmp"),
            AnalyzerMetrics::new(),
        );
        let control = ControlLoop::new(gateway.clone(), manager, ControlConfig::default()).unwrap();
        let (_shutdown_tx, shutdown_rx) = broadcast::channel(1);

        let budget = RunBudget {
            iterations: 2,
            iteration_length: Some(Duration::from_secs(60)),
        };
        let summary = control.run(budget, shutdown_rx).await;
        assert_eq!(summary.iterations_completed, 2);

        let content = std::fs::read_to_string(path).unwrap();
        let prefixes: std::collections::BTreeSet<&str> = content
            .lines()
            .map(|line| line.split(" - ").next().unwrap())
            .collect();
        assert_eq!(prefixes.into_iter().collect::<Vec<_>>(), vec!["1", "2"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_withdraws_detours() {
        let gateway = Arc::new(MockGateway::default());
        gateway.set_switches(vec![switch_with_load(4, 0.9, false)]);
        gateway.add_flow(4, flow_stats("3", 0, 700.0), "1-4-5");
        let controller = MockController::default();
        let control = build(&gateway, &controller, ControlConfig::default());
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(20)).await;
            let _ = shutdown_tx.send(());
        });
        let summary = control.run(RunBudget::unbounded(), shutdown_rx).await;

        assert!(summary.interrupted);
        assert_eq!(summary.cycles, 2);
        assert_eq!(summary.rules_removed, 1);
        assert_eq!(controller.sent_with("srv6-remove").len(), 1);
    }
}
