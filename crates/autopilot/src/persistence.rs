//! Workspace layout and durable state for autonomous sessions.
//!
//! Per session: `workspace/<session_id>/state/session.json` holds the
//! [`SessionState`], `outputs/cycle_NNNN.json` archives each cycle record,
//! and `logs/events.log` is an append-only line log.

use std::path::{Path, PathBuf};

use ov_domain::error::{Error, Result};

use crate::models::{CycleRecord, SessionState};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Layout
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone)]
pub struct WorkspaceLayout {
    pub base_dir: PathBuf,
}

impl WorkspaceLayout {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    /// The session's working directory — where the worker runs and where
    /// the sentinel `__output.json` is expected.
    pub fn session_dir(&self, session_id: &str) -> PathBuf {
        self.base_dir.join(session_id)
    }

    pub fn outputs_dir(&self, session_id: &str) -> PathBuf {
        self.session_dir(session_id).join("outputs")
    }

    pub fn logs_dir(&self, session_id: &str) -> PathBuf {
        self.session_dir(session_id).join("logs")
    }

    pub fn state_dir(&self, session_id: &str) -> PathBuf {
        self.session_dir(session_id).join("state")
    }

    pub fn session_state_path(&self, session_id: &str) -> PathBuf {
        self.state_dir(session_id).join("session.json")
    }

    pub fn cycle_result_path(&self, session_id: &str, cycle_index: u32) -> PathBuf {
        self.outputs_dir(session_id)
            .join(format!("cycle_{cycle_index:04}.json"))
    }

    pub fn log_path(&self, session_id: &str) -> PathBuf {
        self.logs_dir(session_id).join("events.log")
    }

    pub fn ensure(&self, session_id: &str) -> Result<()> {
        std::fs::create_dir_all(self.outputs_dir(session_id))?;
        std::fs::create_dir_all(self.logs_dir(session_id))?;
        std::fs::create_dir_all(self.state_dir(session_id))?;
        Ok(())
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Store
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct StateStore {
    pub layout: WorkspaceLayout,
}

impl StateStore {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            layout: WorkspaceLayout::new(base_dir),
        }
    }

    pub fn save_session(&self, session: &SessionState) -> Result<()> {
        self.layout.ensure(&session.session_id)?;
        let path = self.layout.session_state_path(&session.session_id);
        write_atomic(&path, &serde_json::to_string_pretty(session)?)
    }

    pub fn load_session(&self, session_id: &str) -> Result<SessionState> {
        let path = self.layout.session_state_path(session_id);
        if !path.exists() {
            return Err(Error::SessionNotFound(session_id.to_owned()));
        }
        let raw = std::fs::read_to_string(&path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    pub fn save_cycle(&self, session_id: &str, record: &CycleRecord) -> Result<()> {
        self.layout.ensure(session_id)?;
        let path = self.layout.cycle_result_path(session_id, record.cycle_index);
        write_atomic(&path, &serde_json::to_string_pretty(record)?)
    }

    pub fn append_log(&self, session_id: &str, line: &str) {
        if self.layout.ensure(session_id).is_err() {
            return;
        }
        let path = self.layout.log_path(session_id);
        use std::io::Write;
        let result = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .and_then(|mut f| writeln!(f, "{}", line.trim_end()));
        if let Err(e) = result {
            tracing::warn!(session_id, error = %e, "failed to append session log");
        }
    }
}

fn write_atomic(path: &Path, content: &str) -> Result<()> {
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, content)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}
