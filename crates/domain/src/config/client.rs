use std::collections::HashMap;

use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Agent client process
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// How to launch the external agent client process. The gateway speaks
/// line-delimited JSON to it over stdio; everything model-side lives in
/// that process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    #[serde(default = "d_command")]
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// Extra environment for the process (endpoint URLs, key variables).
    #[serde(default)]
    pub env: HashMap<String, String>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            command: d_command(),
            args: Vec::new(),
            env: HashMap::new(),
        }
    }
}

fn d_command() -> String {
    "overseer-agent".into()
}
