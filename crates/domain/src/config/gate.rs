use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Interaction gate
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Deadlines for user-interaction suspensions.
///
/// The ask-user deadline must stay strictly below the LLM client's own 60 s
/// budget for the question tool, so the gate always resolves first.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateConfig {
    #[serde(default = "d_ask_timeout")]
    pub ask_timeout_secs: u64,
    #[serde(default = "d_permission_timeout")]
    pub permission_timeout_secs: u64,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            ask_timeout_secs: d_ask_timeout(),
            permission_timeout_secs: d_permission_timeout(),
        }
    }
}

fn d_ask_timeout() -> u64 {
    55
}
fn d_permission_timeout() -> u64 {
    120
}
