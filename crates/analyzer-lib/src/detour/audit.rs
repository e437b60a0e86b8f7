//! Append-only log of every rule mutation
//!
//! One line per create/remove: `<iteration> - <YYYY-mm-dd HH:MM:SS> - <message>`.
//! The file is truncated when the analyzer starts.

use crate::models::{DetourRule, SwitchId};
use anyhow::{Context, Result};
use chrono::Local;
use serde_json::json;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;

const AUDIT_FILE_SUFFIX: &str = "-SRv6_rules.log";

/// Kind of mutation recorded in the audit log
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleAction {
    Created,
    Removed,
    Evicted,
}

impl RuleAction {
    fn as_str(&self) -> &'static str {
        match self {
            RuleAction::Created => "created",
            RuleAction::Removed => "removed",
            RuleAction::Evicted => "evicted",
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct AuditLog {
    path: Option<PathBuf>,
    iteration: u32,
    cycle: u64,
}

impl AuditLog {
    /// Audit log that records nothing
    pub fn disabled() -> Self {
        Self::default()
    }

    /// Create (or truncate) the audit file at `path`
    pub async fn create(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        tokio::fs::File::create(&path)
            .await
            .with_context(|| format!("Failed to create audit log {}", path.display()))?;
        Ok(Self {
            path: Some(path),
            iteration: 0,
            cycle: 0,
        })
    }

    /// Audit file named after the routing label, inside `dir`
    pub async fn for_routing(dir: impl AsRef<Path>, routing: &str) -> Result<Self> {
        Self::create(dir.as_ref().join(format!("{}{}", routing, AUDIT_FILE_SUFFIX))).await
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn set_iteration(&mut self, iteration: u32) {
        self.iteration = iteration;
    }

    pub fn set_cycle(&mut self, cycle: u64) {
        self.cycle = cycle;
    }

    /// Record a rule mutation with the rule as a JSON payload
    pub async fn record_rule(
        &self,
        action: RuleAction,
        switch_id: SwitchId,
        rule: &DetourRule,
    ) -> Result<()> {
        let payload = json!({
            "switch_id": switch_id,
            "rule": rule,
        });
        self.record(&format!("{} {}", action.as_str(), payload)).await
    }

    /// Append one line; a no-op when the log is disabled
    pub async fn record(&self, message: &str) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        let line = format!(
            "{} - {} - cycle {}: {}\n",
            self.iteration,
            Local::now().format("%Y-%m-%d %H:%M:%S"),
            self.cycle,
            message
        );

        let mut file = tokio::fs::OpenOptions::new()
            .append(true)
            .create(true)
            .open(path)
            .await
            .with_context(|| format!("Failed to open audit log {}", path.display()))?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }
}
