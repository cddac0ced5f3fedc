//! Operator configuration, read once from the environment at startup.

use std::time::Duration;

use anyhow::{Context as _, Result};
use tracing::warn;

/// Immutable operator-wide settings.
#[derive(Debug, Clone)]
pub struct OperatorConfig {
    /// Container image for workspace pods.
    pub workspace_image: String,
    /// Default egress namespaces when the Workspace spec names none.
    pub llm_namespaces: Vec<String>,
    /// Default external egress ports when the Workspace spec names none.
    /// Empty means the built-in default list applies.
    pub egress_ports: Vec<i32>,
    /// Evict a Running workspace to `Stopped` after this much inactivity.
    /// `None` disables idle eviction.
    pub idle_timeout: Option<Duration>,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            workspace_image: "workspace:latest".to_string(),
            llm_namespaces: Vec::new(),
            egress_ports: Vec::new(),
            idle_timeout: None,
        }
    }
}

impl OperatorConfig {
    /// Reads `WORKSPACE_IMAGE`, `LLM_NAMESPACES`, `EGRESS_PORTS`, and
    /// `IDLE_TIMEOUT`. All are optional; invalid list entries are skipped
    /// with a warning, while a malformed `IDLE_TIMEOUT` is a startup error.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(image) = std::env::var("WORKSPACE_IMAGE") {
            if !image.is_empty() {
                config.workspace_image = image;
            }
        }

        if let Ok(raw) = std::env::var("LLM_NAMESPACES") {
            config.llm_namespaces = raw
                .split(',')
                .map(str::trim)
                .filter(|ns| !ns.is_empty())
                .map(str::to_string)
                .collect();
        }

        // Comma-separated TCP ports workspace pods may reach on external IPs,
        // e.g. "22,80,443,8000,11434".
        if let Ok(raw) = std::env::var("EGRESS_PORTS") {
            config.egress_ports = parse_egress_ports(&raw);
        }

        if let Ok(raw) = std::env::var("IDLE_TIMEOUT") {
            if !raw.is_empty() {
                let timeout: Duration = humantime::parse_duration(&raw)
                    .with_context(|| format!("parse IDLE_TIMEOUT {raw:?}"))?;
                config.idle_timeout = (!timeout.is_zero()).then_some(timeout);
            }
        }

        Ok(config)
    }
}

fn parse_egress_ports(raw: &str) -> Vec<i32> {
    raw.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .filter_map(|entry| match entry.parse::<i32>() {
            Ok(port) if (1..=65535).contains(&port) => Some(port),
            _ => {
                warn!(value = entry, "Ignoring invalid EGRESS_PORTS entry");
                None
            }
        })
        .collect()
}
