//! INT analyzer - adaptive traffic engineering for SRv6 networks
//!
//! Periodically scores every switch from in-band telemetry, detours flows
//! away from overloaded switches through the network controller and withdraws
//! the detours once the switches recover.

use analyzer_lib::{
    control::{ControlLoop, LoopStatus},
    detour::{AuditLog, ControllerSession, DetourRuleManager},
    gateway::InfluxGateway,
    health::{components, HealthRegistry},
    observability::{AnalyzerMetrics, StructuredLogger},
};
use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod api;
mod config;

const ANALYZER_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Routing label used in logs when none was given
const UNLABELLED_ROUTING: &str = "unlabelled";

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().json())
        .init();

    let cli = config::Cli::parse();
    let budget = cli.budget()?;
    let config = config::AnalyzerConfig::load()?;
    let control_config = config.control()?;

    let routing = cli.routing.as_deref().unwrap_or(UNLABELLED_ROUTING);
    let logger = StructuredLogger::new(routing);
    logger.log_startup(ANALYZER_VERSION, budget.iterations);

    let health_registry = HealthRegistry::with_all_components().await;
    let metrics = AnalyzerMetrics::new();

    let session = ControllerSession::connect(config.session())
        .await
        .context("Failed to open controller session")?;

    let gateway = Arc::new(InfluxGateway::new(&config.influx())?);

    let audit = match &cli.routing {
        Some(label) => AuditLog::for_routing(&config.audit_dir, label).await?,
        None => AuditLog::disabled(),
    };
    if let Some(path) = audit.path() {
        info!(path = %path.display(), "Recording rule changes");
    }

    let rules = DetourRuleManager::new(Box::new(session), audit, logger.clone(), metrics);
    let (status_tx, status_rx) = watch::channel(LoopStatus::default());
    let control = ControlLoop::new(gateway, rules, control_config)?
        .with_health(health_registry.clone())
        .with_status(status_tx);

    let app_state = Arc::new(api::AppState::new(health_registry.clone(), status_rx));
    let api_handle = api::spawn(config.api_port, app_state);

    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let mut loop_handle = tokio::spawn(control.run(budget, shutdown_rx));

    let summary = tokio::select! {
        result = &mut loop_handle => result?,
        _ = tokio::signal::ctrl_c() => {
            logger.log_shutdown("SIGINT received");
            let _ = shutdown_tx.send(());
            // The loop withdraws its detours before returning
            loop_handle.await?
        }
    };

    if !summary.interrupted {
        logger.log_shutdown("iteration budget exhausted");
    }
    info!(
        iterations_completed = summary.iterations_completed,
        cycles = summary.cycles,
        cycles_skipped = summary.cycles_skipped,
        detours_created = summary.detours_created,
        rules_removed = summary.rules_removed,
        "Analyzer finished"
    );

    health_registry
        .set_unhealthy(components::CONTROL_LOOP, "stopped")
        .await;
    api_handle.abort();
    if let Err(e) = api_handle.await {
        if !e.is_cancelled() {
            error!(error = %e, "API server task failed");
        }
    }

    Ok(())
}
