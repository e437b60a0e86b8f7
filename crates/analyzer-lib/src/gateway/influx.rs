//! InfluxDB (InfluxQL over HTTP) implementation of the metrics gateway

use super::{async_trait, MetricsGateway, TimeWindow};
use crate::models::{FlowKey, FlowStats, SwitchId, SwitchStats};
use anyhow::{Context, Result};
use reqwest::Client;
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;
use tracing::debug;
use url::Url;

/// Connection settings for the telemetry store
#[derive(Debug, Clone)]
pub struct InfluxConfig {
    /// Base URL, e.g. "http://localhost:8086"
    pub url: String,
    /// Database holding `switch_stats` and `flow_stats`
    pub database: String,
    /// Per-query timeout
    pub timeout: Duration,
}

impl Default for InfluxConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:8086".to_string(),
            database: "int".to_string(),
            timeout: Duration::from_secs(10),
        }
    }
}

/// Metrics gateway backed by the InfluxDB `/query` endpoint
pub struct InfluxGateway {
    client: Client,
    query_url: Url,
    database: String,
}

impl InfluxGateway {
    pub fn new(config: &InfluxConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .context("Failed to create HTTP client")?;

        let base_url = Url::parse(&config.url)
            .with_context(|| format!("Invalid metrics store URL: {}", config.url))?;
        let query_url = base_url.join("query").context("Invalid query path")?;

        Ok(Self {
            client,
            query_url,
            database: config.database.clone(),
        })
    }

    async fn query(&self, statement: &str) -> Result<Vec<Series>> {
        debug!(query = %statement, "Querying metrics store");

        let response = self
            .client
            .get(self.query_url.clone())
            .query(&[("db", self.database.as_str()), ("q", statement)])
            .send()
            .await
            .context("Failed to send query to metrics store")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("Metrics store error ({}): {}", status, body);
        }

        let body: QueryResponse = response
            .json()
            .await
            .context("Failed to parse metrics store response")?;

        body.into_series()
    }
}

#[async_trait]
impl MetricsGateway for InfluxGateway {
    async fn switch_stats(&self, window: &TimeWindow) -> Result<Option<Vec<SwitchStats>>> {
        let statement = format!(
            r#"SELECT COUNT("latency") AS num_packets, MEAN("latency") AS average_latency, MEAN("size") AS average_size FROM switch_stats WHERE time >= '{}' GROUP BY "switch_id""#,
            window.start_timestamp()
        );
        let stats = parse_switch_stats(&self.query(&statement).await?);
        Ok(if stats.is_empty() { None } else { Some(stats) })
    }

    async fn latency_percentile(
        &self,
        window: &TimeWindow,
        percentile: f64,
    ) -> Result<Option<f64>> {
        let statement = format!(
            r#"SELECT PERCENTILE("latency", {}) AS p_latency FROM switch_stats WHERE time >= '{}'"#,
            percentile,
            window.start_timestamp()
        );
        Ok(first_f64(&self.query(&statement).await?, "p_latency"))
    }

    async fn max_latency_at_or_below(
        &self,
        window: &TimeWindow,
        ceiling: f64,
    ) -> Result<Option<f64>> {
        let statement = format!(
            r#"SELECT MAX("latency") AS max_latency FROM switch_stats WHERE time >= '{}' AND "latency" <= {}"#,
            window.start_timestamp(),
            ceiling
        );
        Ok(first_f64(&self.query(&statement).await?, "max_latency"))
    }

    async fn total_packets(&self, window: &TimeWindow) -> Result<Option<u64>> {
        let statement = format!(
            r#"SELECT COUNT("latency") AS total_num_packets FROM flow_stats WHERE time >= '{}'"#,
            window.start_timestamp()
        );
        Ok(first_f64(&self.query(&statement).await?, "total_num_packets").map(|v| v as u64))
    }

    async fn flow_stats_on_switch(
        &self,
        window: &TimeWindow,
        switch_id: SwitchId,
    ) -> Result<Vec<FlowStats>> {
        let statement = format!(
            r#"SELECT COUNT("latency") AS num_packets, MEAN("size") AS avg_size, MEAN("latency") AS avg_latency FROM switch_stats WHERE time >= '{}' AND "switch_id" = '{}' GROUP BY "src_ip", "dst_ip", "flow_label", "dscp""#,
            window.start_timestamp(),
            switch_id
        );
        Ok(parse_flow_stats(&self.query(&statement).await?))
    }

    async fn current_path(&self, flow: &FlowKey) -> Result<Option<String>> {
        let statement = format!(
            r#"SELECT "path" FROM flow_stats WHERE "src_ip" = '{}' AND "dst_ip" = '{}' AND "flow_label" = '{}' ORDER BY time DESC LIMIT 1"#,
            quote(&flow.src_ip),
            quote(&flow.dst_ip),
            quote(&flow.flow_label)
        );
        let series = self.query(&statement).await?;
        Ok(series
            .iter()
            .find_map(|s| s.field("path").and_then(Value::as_str).map(str::to_string)))
    }
}

/// Escape a tag value for use inside single quotes
fn quote(value: &str) -> String {
    value.replace('\\', "\\\\").replace('\'', "\\'")
}

#[derive(Debug, Deserialize)]
struct QueryResponse {
    #[serde(default)]
    results: Vec<StatementResult>,
    #[serde(default)]
    error: Option<String>,
}

impl QueryResponse {
    fn into_series(self) -> Result<Vec<Series>> {
        if let Some(error) = self.error {
            anyhow::bail!("Metrics store rejected query: {}", error);
        }

        let mut series = Vec::new();
        for result in self.results {
            if let Some(error) = result.error {
                anyhow::bail!("Metrics store rejected statement: {}", error);
            }
            series.extend(result.series);
        }
        Ok(series)
    }
}

#[derive(Debug, Deserialize)]
struct StatementResult {
    #[serde(default)]
    series: Vec<Series>,
    #[serde(default)]
    error: Option<String>,
}

/// One result series; aggregate queries return a single row per series
#[derive(Debug, Clone, Deserialize)]
struct Series {
    #[serde(default)]
    tags: HashMap<String, String>,
    columns: Vec<String>,
    #[serde(default)]
    values: Vec<Vec<Value>>,
}

impl Series {
    /// Non-null value of `column` in the first row
    fn field(&self, column: &str) -> Option<&Value> {
        let idx = self.columns.iter().position(|c| c == column)?;
        self.values
            .first()?
            .get(idx)
            .filter(|value| !value.is_null())
    }

    fn f64_field(&self, column: &str) -> Option<f64> {
        self.field(column)?.as_f64()
    }

    fn tag(&self, name: &str) -> Option<&str> {
        self.tags.get(name).map(String::as_str)
    }
}

fn first_f64(series: &[Series], column: &str) -> Option<f64> {
    series.iter().find_map(|s| s.f64_field(column))
}

fn parse_switch_stats(series: &[Series]) -> Vec<SwitchStats> {
    series
        .iter()
        .filter_map(|s| {
            let switch_id = match s.tag("switch_id").map(str::parse::<SwitchId>) {
                Some(Ok(id)) => id,
                _ => {
                    debug!(tags = ?s.tags, "Skipping series without a numeric switch_id");
                    return None;
                }
            };

            Some(SwitchStats {
                switch_id,
                num_packets: s.f64_field("num_packets")? as u64,
                avg_size: s.f64_field("average_size")?,
                avg_processing_time: s.f64_field("average_latency")?,
            })
        })
        .collect()
}

fn parse_flow_stats(series: &[Series]) -> Vec<FlowStats> {
    series
        .iter()
        .filter_map(|s| {
            let flow = FlowKey::new(s.tag("src_ip")?, s.tag("dst_ip")?, s.tag("flow_label")?);
            // DSCP is a tag; untagged points are best effort
            let dscp = s
                .tag("dscp")
                .and_then(|d| d.trim().parse::<u8>().ok())
                .filter(|d| *d < 64)
                .unwrap_or(0);

            Some(FlowStats {
                flow,
                dscp,
                num_packets: s.f64_field("num_packets")? as u64,
                avg_size: s.f64_field("avg_size")?,
                avg_processing_time: s.f64_field("avg_latency")?,
            })
        })
        .collect()
}
