/// Configuration management for the Flowline engine
///
/// Handles server binding, engine behaviour and background triggering.

use crate::runtime::branch::BranchPolicy;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Main application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Server configuration
    pub server: ServerConfig,
    /// Run execution settings
    pub engine: EngineConfig,
    /// Background schedule triggers
    pub scheduler: SchedulerConfig,
    /// Optional JSON file (array of flows) loaded at start-up
    pub flows_file: Option<String>,
}

/// HTTP server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Server bind address (e.g., "0.0.0.0")
    pub host: String,
    /// Server port number
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// What a condition outcome does to the rest of the order
    pub branch_policy: BranchPolicy,
    /// Upper bound on a single node execution; `None` = unbounded
    pub node_timeout_secs: Option<u64>,
    /// Request timeout for `http_request` actions
    pub http_timeout_secs: u64,
}

impl EngineConfig {
    pub fn node_timeout(&self) -> Option<Duration> {
        self.node_timeout_secs.map(Duration::from_secs)
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    pub enabled: bool,
}

fn env_flag(name: &str, default: bool) -> bool {
    match std::env::var(name) {
        Ok(value) => !matches!(value.trim().to_ascii_lowercase().as_str(), "off" | "false" | "0" | "no"),
        Err(_) => default,
    }
}

impl Config {
    /// Read the environment, rejecting a malformed `FLOWLINE_BRANCH_POLICY`
    pub fn from_env() -> anyhow::Result<Self> {
        let branch_policy = match std::env::var("FLOWLINE_BRANCH_POLICY") {
            Ok(raw) => raw
                .parse()
                .map_err(|e| anyhow::anyhow!("FLOWLINE_BRANCH_POLICY: {}", e))?,
            Err(_) => BranchPolicy::default(),
        };
        Ok(Self::with_branch_policy(branch_policy))
    }

    fn with_branch_policy(branch_policy: BranchPolicy) -> Self {
        Self {
            server: ServerConfig {
                host: std::env::var("FLOWLINE_HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
                port: std::env::var("FLOWLINE_PORT")
                    .unwrap_or_else(|_| "3004".to_string())
                    .parse()
                    .unwrap_or(3004),
            },
            engine: EngineConfig {
                branch_policy,
                node_timeout_secs: std::env::var("FLOWLINE_NODE_TIMEOUT_SECS")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .filter(|secs| *secs > 0),
                http_timeout_secs: std::env::var("FLOWLINE_HTTP_TIMEOUT_SECS")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(30),
            },
            scheduler: SchedulerConfig {
                enabled: env_flag("FLOWLINE_SCHEDULER", true),
            },
            flows_file: std::env::var("FLOWLINE_FLOWS_FILE")
                .ok()
                .filter(|path| !path.trim().is_empty()),
        }
    }
}

impl Default for Config {
    /// Default configuration with ENV_VAR support for container deployment
    ///
    /// An unparsable branch policy falls back to full traversal.
    fn default() -> Self {
        let branch_policy: BranchPolicy = std::env::var("FLOWLINE_BRANCH_POLICY")
            .ok()
            .and_then(|raw| raw.parse().ok())
            .unwrap_or_default();
        Self::with_branch_policy(branch_policy)
    }
}
