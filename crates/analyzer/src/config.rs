//! Analyzer configuration
//!
//! Settings come from built-in defaults, an optional file named by
//! `ANALYZER_CONFIG`, then `ANALYZER_*` environment variables (nested keys use
//! `__`, e.g. `ANALYZER_WEIGHTS__PROCESSING_TIME=0.5`). Run-shape flags come
//! from the command line.

use analyzer_lib::control::{ControlConfig, QosPriorityTable, RunBudget, SelectionPolicy};
use analyzer_lib::detour::SessionConfig;
use analyzer_lib::gateway::InfluxConfig;
use analyzer_lib::models::SwitchId;
use analyzer_lib::scoring::{McdaWeights, OutlierFilter};
use clap::Parser;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Environment variable naming an optional configuration file
pub const CONFIG_FILE_ENV: &str = "ANALYZER_CONFIG";
const ENV_PREFIX: &str = "ANALYZER";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),
    #[error("QoS table key `{0}` is not a DSCP value (0-63)")]
    InvalidDscp(String),
    #[error("{0} must be greater than zero")]
    ZeroDuration(&'static str),
    #[error("running {0} iterations requires --iterations-timer")]
    IterationsWithoutTimer(u32),
}

/// Command line
#[derive(Debug, Parser)]
#[command(name = "int-analyzer", version, about = "Adaptive INT traffic-engineering analyzer")]
pub struct Cli {
    /// Routing label of the experiment (e.g. Medium-ECMP); names the audit
    /// log `<label>-SRv6_rules.log`. No audit log without it.
    #[arg(long)]
    pub routing: Option<String>,

    /// Number of iterations to run
    #[arg(
        long,
        alias = "num_iterations",
        default_value_t = 1,
        value_parser = clap::value_parser!(u32).range(1..)
    )]
    pub num_iterations: u32,

    /// Length of each iteration in seconds, 0 runs forever
    #[arg(long, alias = "iterations_timer", default_value_t = 0)]
    pub iterations_timer: u64,
}

impl Cli {
    pub fn budget(&self) -> Result<RunBudget, ConfigError> {
        if self.iterations_timer == 0 {
            if self.num_iterations > 1 {
                return Err(ConfigError::IterationsWithoutTimer(self.num_iterations));
            }
            return Ok(RunBudget::unbounded());
        }

        Ok(RunBudget {
            iterations: self.num_iterations,
            iteration_length: Some(Duration::from_secs(self.iterations_timer)),
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct InfluxSettings {
    pub url: String,
    pub database: String,
    pub timeout_secs: u64,
}

impl Default for InfluxSettings {
    fn default() -> Self {
        let defaults = InfluxConfig::default();
        Self {
            url: defaults.url,
            database: defaults.database,
            timeout_secs: defaults.timeout.as_secs(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ControllerSettings {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub connect_timeout_secs: u64,
    pub settle_delay_ms: u64,
    pub read_timeout_ms: u64,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        let defaults = SessionConfig::default();
        Self {
            host: defaults.host,
            port: defaults.port,
            username: defaults.username,
            password: defaults.password,
            connect_timeout_secs: defaults.connect_timeout.as_secs(),
            settle_delay_ms: defaults.settle_delay.as_millis() as u64,
            read_timeout_ms: defaults.read_timeout.as_millis() as u64,
        }
    }
}

/// Analyzer settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AnalyzerConfig {
    /// Seconds between cycles
    pub poll_interval_secs: u64,
    /// Length of the trailing analysis window in seconds
    pub window_secs: u64,
    pub enter_threshold: f64,
    pub exit_threshold: f64,
    pub weights: McdaWeights,
    pub infra_switches: Vec<SwitchId>,
    /// DSCP -> protection rank entries layered over the built-in table
    pub qos: BTreeMap<String, u8>,
    pub mtu: u32,
    pub outlier_percentile: f64,
    pub selection_policy: SelectionPolicy,
    pub endpoint_segment: usize,
    pub influx: InfluxSettings,
    pub controller: ControllerSettings,
    /// Port of the health/metrics API
    pub api_port: u16,
    /// Directory receiving the audit log
    pub audit_dir: PathBuf,
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        let control = ControlConfig::default();
        Self {
            poll_interval_secs: control.poll_interval.as_secs(),
            window_secs: control.window.as_secs(),
            enter_threshold: control.enter_threshold,
            exit_threshold: control.exit_threshold,
            weights: control.weights,
            infra_switches: control.infra_switches,
            qos: BTreeMap::new(),
            mtu: control.mtu,
            outlier_percentile: control.outlier_filter.percentile,
            selection_policy: control.selection_policy,
            endpoint_segment: control.endpoint_segment,
            influx: InfluxSettings::default(),
            controller: ControllerSettings::default(),
            api_port: 8080,
            audit_dir: PathBuf::from("."),
        }
    }
}

impl AnalyzerConfig {
    /// Load from the optional file and the process environment
    pub fn load() -> Result<Self, ConfigError> {
        let file = std::env::var(CONFIG_FILE_ENV).ok().map(PathBuf::from);
        Self::from_sources(file, environment())
    }

    fn from_sources(
        file: Option<PathBuf>,
        env: config::Environment,
    ) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder();
        if let Some(path) = file {
            builder = builder.add_source(config::File::from(path));
        }

        let config: Self = builder.add_source(env).build()?.try_deserialize()?;
        config.control()?;
        Ok(config)
    }

    /// Settings for the control loop
    ///
    /// Threshold and weight validation happens when the loop is built.
    pub fn control(&self) -> Result<ControlConfig, ConfigError> {
        if self.poll_interval_secs == 0 {
            return Err(ConfigError::ZeroDuration("poll_interval_secs"));
        }
        if self.window_secs == 0 {
            return Err(ConfigError::ZeroDuration("window_secs"));
        }

        let mut qos = QosPriorityTable::default();
        for (key, rank) in &self.qos {
            let dscp = key
                .trim()
                .parse::<u8>()
                .ok()
                .filter(|dscp| *dscp < 64)
                .ok_or_else(|| ConfigError::InvalidDscp(key.clone()))?;
            qos.insert(dscp, *rank);
        }

        Ok(ControlConfig {
            poll_interval: Duration::from_secs(self.poll_interval_secs),
            window: Duration::from_secs(self.window_secs),
            enter_threshold: self.enter_threshold,
            exit_threshold: self.exit_threshold,
            weights: self.weights,
            infra_switches: self.infra_switches.clone(),
            mtu: self.mtu,
            outlier_filter: OutlierFilter {
                percentile: self.outlier_percentile,
            },
            selection_policy: self.selection_policy,
            qos,
            endpoint_segment: self.endpoint_segment,
        })
    }

    pub fn session(&self) -> SessionConfig {
        let c = &self.controller;
        SessionConfig {
            host: c.host.clone(),
            port: c.port,
            username: c.username.clone(),
            password: c.password.clone(),
            connect_timeout: Duration::from_secs(c.connect_timeout_secs),
            settle_delay: Duration::from_millis(c.settle_delay_ms),
            read_timeout: Duration::from_millis(c.read_timeout_ms),
        }
    }

    pub fn influx(&self) -> InfluxConfig {
        InfluxConfig {
            url: self.influx.url.clone(),
            database: self.influx.database.clone(),
            timeout: Duration::from_secs(self.influx.timeout_secs),
        }
    }
}

fn environment() -> config::Environment {
    config::Environment::with_prefix(ENV_PREFIX)
        .prefix_separator("_")
        .separator("__")
        .list_separator(",")
        .with_list_parse_key("infra_switches")
        .try_parsing(true)
}
