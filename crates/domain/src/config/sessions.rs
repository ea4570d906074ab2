use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Session lifecycle
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// In-memory session lifecycle rules. A managed client session is closed
/// once it has been idle longer than `idle_timeout_secs`, unless the
/// session still has a running background task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionsConfig {
    #[serde(default = "d_idle_timeout")]
    pub idle_timeout_secs: u64,
    /// Period of the idle sweeper task.
    #[serde(default = "d_cleanup_interval")]
    pub cleanup_interval_secs: u64,
}

impl Default for SessionsConfig {
    fn default() -> Self {
        Self {
            idle_timeout_secs: d_idle_timeout(),
            cleanup_interval_secs: d_cleanup_interval(),
        }
    }
}

fn d_idle_timeout() -> u64 {
    300
}
fn d_cleanup_interval() -> u64 {
    60
}
