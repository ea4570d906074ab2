//! Run configuration — one file bundling the worker, the optional checker,
//! the task, and the session options.

use std::path::Path;

use serde::{Deserialize, Serialize};

use ov_domain::error::{Error, Result};

use crate::models::{SessionOptions, TaskDefinition, WorkerConfig};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    pub worker: WorkerConfig,
    #[serde(default)]
    pub checker: Option<WorkerConfig>,
    pub task: TaskDefinition,
    #[serde(default)]
    pub session: SessionOptions,
}

impl RunConfig {
    /// Load from TOML or JSON, decided by the file extension.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(Error::Config(format!("config not found: {}", path.display())));
        }
        let raw = std::fs::read_to_string(path)?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Ok(serde_json::from_str(&raw)?),
            _ => toml::from_str(&raw)
                .map_err(|e| Error::Config(format!("{}: {e}", path.display()))),
        }
    }
}
