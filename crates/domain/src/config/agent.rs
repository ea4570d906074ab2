use std::collections::HashMap;

use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Permission mode
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// How the LLM client resolves tool permissions.
///
/// Only `default` routes tool calls through the host's permission callback;
/// the other modes are handled inside the client.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum PermissionMode {
    #[default]
    #[serde(rename = "default")]
    Default,
    #[serde(rename = "acceptEdits")]
    AcceptEdits,
    #[serde(rename = "bypassPermissions")]
    BypassPermissions,
    #[serde(rename = "plan")]
    Plan,
}

impl PermissionMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Default => "default",
            Self::AcceptEdits => "acceptEdits",
            Self::BypassPermissions => "bypassPermissions",
            Self::Plan => "plan",
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Endpoints
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A named model endpoint. The base URL and key environment variable are
/// passed through to the LLM client opaquely.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointConfig {
    pub name: String,
    #[serde(default)]
    pub base_url: Option<String>,
    /// Environment variable holding the API key for this endpoint.
    #[serde(default)]
    pub api_key_env: Option<String>,
    #[serde(default)]
    pub default_model: Option<String>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tool servers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// An opaque tool-protocol server descriptor forwarded to the LLM client.
/// The core never interprets these beyond enable filtering.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolServerConfig {
    pub name: String,
    #[serde(default = "d_transport")]
    pub transport: String,
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "d_true")]
    pub enabled: bool,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Agent defaults
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Per-session agent configuration defaults. Overridable per query.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Endpoint used when a query carries no override.
    #[serde(default)]
    pub default_endpoint: Option<String>,
    #[serde(default)]
    pub allowed_tools: Vec<String>,
    #[serde(default)]
    pub disallowed_tools: Vec<String>,
    #[serde(default = "d_max_turns")]
    pub max_turns: u32,
    /// 0 means no explicit bound.
    #[serde(default)]
    pub max_output_tokens: u64,
    /// 0 means no explicit bound.
    #[serde(default)]
    pub max_thinking_tokens: u64,
    #[serde(default)]
    pub permission_mode: PermissionMode,
    #[serde(default)]
    pub default_workdir: Option<String>,
    #[serde(default)]
    pub tool_servers: Vec<ToolServerConfig>,
}

impl AgentConfig {
    /// Tool servers that are enabled, in declaration order.
    pub fn enabled_tool_servers(&self) -> impl Iterator<Item = &ToolServerConfig> {
        self.tool_servers.iter().filter(|s| s.enabled)
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            default_endpoint: None,
            allowed_tools: Vec::new(),
            disallowed_tools: Vec::new(),
            max_turns: d_max_turns(),
            max_output_tokens: 0,
            max_thinking_tokens: 0,
            permission_mode: PermissionMode::Default,
            default_workdir: None,
            tool_servers: Vec::new(),
        }
    }
}

// ── serde default helpers ───────────────────────────────────────────

fn d_transport() -> String {
    "stdio".into()
}
fn d_true() -> bool {
    true
}
fn d_max_turns() -> u32 {
    50
}
