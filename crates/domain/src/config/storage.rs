use std::path::PathBuf;

use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Durable state layout
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Root of all durable state:
///
/// - `sessions/<session_id>.json` — interactive session transcripts
/// - `tasks/<session_id>/`        — task execution state + event log
/// - `workspace/<session_id>/`    — per-session working directories
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "d_state_path")]
    pub state_path: PathBuf,
}

impl StorageConfig {
    pub fn sessions_dir(&self) -> PathBuf {
        self.state_path.join("sessions")
    }

    pub fn tasks_dir(&self) -> PathBuf {
        self.state_path.join("tasks")
    }

    pub fn workspace_dir(&self) -> PathBuf {
        self.state_path.join("workspace")
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            state_path: d_state_path(),
        }
    }
}

fn d_state_path() -> PathBuf {
    PathBuf::from("./data")
}
