//! File-per-session JSON store.
//!
//! Each session lives at `<sessions_dir>/<session_id>.json`. Writes go
//! through a temp-file-then-rename so a crash mid-write never corrupts a
//! previously persisted session. Mutations of a single session are
//! serialized by a per-session lock at the store boundary.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;

use ov_domain::error::{Error, Result};

use crate::model::{Session, SessionMessage, SessionSummary};

pub struct SessionStore {
    dir: PathBuf,
    /// Per-session write locks.
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl SessionStore {
    /// Open (creating if needed) the store at `state_path/sessions`.
    pub fn new(state_path: &Path) -> Result<Self> {
        let dir = state_path.join("sessions");
        std::fs::create_dir_all(&dir)?;
        tracing::info!(path = %dir.display(), "session store ready");
        Ok(Self {
            dir,
            locks: Mutex::new(HashMap::new()),
        })
    }

    fn session_path(&self, session_id: &str) -> PathBuf {
        self.dir.join(format!("{session_id}.json"))
    }

    fn lock_for(&self, session_id: &str) -> Arc<Mutex<()>> {
        self.locks
            .lock()
            .entry(session_id.to_owned())
            .or_default()
            .clone()
    }

    /// Create a new session and persist it immediately.
    pub fn create(&self, title: impl Into<String>) -> Result<Session> {
        let session = Session::create(title);
        self.save(&session)?;
        tracing::info!(session_id = %session.id, title = %session.title, "session created");
        Ok(session)
    }

    /// List metadata summaries sorted by updated-timestamp, newest first.
    /// Malformed files are logged and skipped, never abort the listing.
    pub fn list(&self) -> Vec<SessionSummary> {
        let mut summaries = Vec::new();
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) => {
                tracing::warn!(error = %e, "failed to read sessions directory");
                return summaries;
            }
        };

        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match std::fs::read_to_string(&path)
                .map_err(Error::Io)
                .and_then(|raw| serde_json::from_str::<Session>(&raw).map_err(Error::Json))
            {
                Ok(session) => summaries.push(session.to_summary()),
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "skipping malformed session file");
                }
            }
        }

        summaries.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        summaries
    }

    /// Load a full session, transcript included.
    pub fn load(&self, session_id: &str) -> Result<Session> {
        let path = self.session_path(session_id);
        if !path.exists() {
            return Err(Error::SessionNotFound(session_id.to_owned()));
        }
        let raw = std::fs::read_to_string(&path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    /// Persist a session with a rename-after-write.
    pub fn save(&self, session: &Session) -> Result<()> {
        let path = self.session_path(&session.id);
        let tmp = path.with_extension("json.tmp");
        let json = serde_json::to_string_pretty(session)?;
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, &path)?;
        Ok(())
    }

    /// Delete a session file. Returns false when it did not exist.
    pub fn delete(&self, session_id: &str) -> Result<bool> {
        let path = self.session_path(session_id);
        if !path.exists() {
            return Ok(false);
        }
        std::fs::remove_file(&path)?;
        self.locks.lock().remove(session_id);
        tracing::info!(session_id, "session deleted");
        Ok(true)
    }

    /// Append a message: load, append, bump timestamp, write back. The only
    /// transcript mutator.
    pub fn append_message(&self, session_id: &str, message: SessionMessage) -> Result<Session> {
        let lock = self.lock_for(session_id);
        let _guard = lock.lock();
        let mut session = self.load(session_id)?;
        session.add_message(message);
        self.save(&session)?;
        Ok(session)
    }

    /// Apply a metadata mutation (config snapshot, resume token) under the
    /// per-session lock.
    pub fn update<F>(&self, session_id: &str, f: F) -> Result<Session>
    where
        F: FnOnce(&mut Session),
    {
        let lock = self.lock_for(session_id);
        let _guard = lock.lock();
        let mut session = self.load(session_id)?;
        f(&mut session);
        session.touch();
        self.save(&session)?;
        Ok(session)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
