mod agent;
mod client;
mod gate;
mod server;
mod sessions;
mod storage;
mod tasks;

pub use agent::*;
pub use client::*;
pub use gate::*;
pub use server::*;
pub use sessions::*;
pub use storage::*;
pub use tasks::*;

use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Top-level config
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Immutable runtime configuration, loaded once at startup and threaded
/// through construction. Never mutated afterwards.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub sessions: SessionsConfig,
    #[serde(default)]
    pub tasks: TasksConfig,
    #[serde(default)]
    pub gate: GateConfig,
    #[serde(default)]
    pub agent: AgentConfig,
    /// The external agent client process.
    #[serde(default)]
    pub client: ClientConfig,
    /// Named model endpoints the gateway can route sessions to.
    #[serde(default)]
    pub endpoints: Vec<EndpointConfig>,
}

impl Config {
    /// Load configuration from a TOML file. A missing file yields defaults.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::info!(path = %path.display(), "no config file, using defaults");
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)?;
        toml::from_str(&raw).map_err(|e| Error::Config(format!("{}: {e}", path.display())))
    }

    /// Look up an endpoint by name.
    pub fn endpoint(&self, name: &str) -> Option<&EndpointConfig> {
        self.endpoints.iter().find(|e| e.name == name)
    }

    /// Validate the configuration, returning all issues found.
    pub fn validate(&self) -> Vec<ConfigIssue> {
        let mut issues = Vec::new();

        if self.server.port == 0 {
            issues.push(ConfigIssue::error("server.port must be non-zero"));
        }
        if self.gate.ask_timeout_secs >= 60 {
            issues.push(ConfigIssue::error(
                "gate.ask_timeout_secs must stay below the upstream 60s budget",
            ));
        }
        if self.tasks.subscriber_buffer < 1024 {
            issues.push(ConfigIssue::warning(
                "tasks.subscriber_buffer below 1024 — slow subscribers will drop events early",
            ));
        }
        for endpoint in &self.endpoints {
            if endpoint.name.is_empty() {
                issues.push(ConfigIssue::error("endpoints[].name must not be empty"));
            }
        }

        issues
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Validation issues
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigSeverity {
    Warning,
    Error,
}

#[derive(Debug, Clone)]
pub struct ConfigIssue {
    pub severity: ConfigSeverity,
    pub message: String,
}

impl ConfigIssue {
    fn warning(message: impl Into<String>) -> Self {
        Self {
            severity: ConfigSeverity::Warning,
            message: message.into(),
        }
    }

    fn error(message: impl Into<String>) -> Self {
        Self {
            severity: ConfigSeverity::Error,
            message: message.into(),
        }
    }
}

impl fmt::Display for ConfigIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}
