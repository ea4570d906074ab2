//! Background task execution — one long-lived task per session, decoupled
//! from any client connection.
//!
//! Each session has at most one running [`TaskExecution`]. The worker
//! consumes the turn's event stream and appends every event to the
//! [`EventBuffer`]; a terminal `done` or `error` event flips the execution
//! status. State is persisted to `<tasks>/<session_id>/current.json` so a
//! restart can recover (a task that was `running` when the process died is
//! promoted to `error`).

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use ov_domain::error::{Error, Result};
use ov_domain::event::{BufferedEvent, EventType, StreamEvent};

use super::events::EventBuffer;
use super::{EventSink, EventStream, Interruptible};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Task status
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Idle,
    Running,
    Completed,
    Error,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Error)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Task execution record
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskExecution {
    pub task_id: String,
    pub session_id: String,
    pub prompt: String,
    pub status: TaskStatus,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub was_viewed: bool,
    #[serde(default)]
    pub event_count: usize,
}

impl TaskExecution {
    pub fn has_unread(&self) -> bool {
        self.status.is_terminal() && !self.was_viewed
    }
}

/// Per-session status as exposed to clients.
#[derive(Debug, Clone, Serialize)]
pub struct StatusSummary {
    pub status: TaskStatus,
    pub has_unread: bool,
    pub task_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

struct SessionTaskState {
    execution: TaskExecution,
    worker: Option<JoinHandle<()>>,
    /// Graceful cancellation: the worker selects the stream against this
    /// token and records "Task was cancelled" on the cancel branch.
    cancel: CancellationToken,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Task runner
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Cloning is cheap: clones share the same execution map, event buffer,
/// and interrupt seam.
#[derive(Clone)]
pub struct TaskRunner {
    storage: PathBuf,
    events: Arc<EventBuffer>,
    sessions: Arc<Mutex<HashMap<String, SessionTaskState>>>,
    /// Set after construction (the session manager is built later); used to
    /// deliver native interrupts before falling back to worker abort.
    interrupter: Arc<Mutex<Option<Arc<dyn Interruptible>>>>,
}

impl TaskRunner {
    pub fn new(tasks_dir: PathBuf, events: Arc<EventBuffer>) -> Self {
        Self {
            storage: tasks_dir,
            events,
            sessions: Arc::new(Mutex::new(HashMap::new())),
            interrupter: Arc::new(Mutex::new(None)),
        }
    }

    pub fn set_interrupter(&self, interrupter: Arc<dyn Interruptible>) {
        *self.interrupter.lock() = Some(interrupter);
    }

    pub fn events(&self) -> &Arc<EventBuffer> {
        &self.events
    }

    fn state_path(&self, session_id: &str) -> PathBuf {
        self.storage.join(session_id).join("current.json")
    }

    fn save_execution(&self, execution: &TaskExecution) -> Result<()> {
        let path = self.state_path(&execution.session_id);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_string_pretty(execution)?)?;
        std::fs::rename(&tmp, &path)?;
        Ok(())
    }

    /// Restore task state from disk on startup. A task that was `running`
    /// when the previous process died is promoted to `error` with its
    /// viewed flag cleared.
    pub fn restore(&self) {
        let entries = match std::fs::read_dir(&self.storage) {
            Ok(entries) => entries,
            Err(_) => return,
        };

        for entry in entries.flatten() {
            if !entry.path().is_dir() {
                continue;
            }
            let state_file = entry.path().join("current.json");
            if !state_file.exists() {
                continue;
            }

            let mut execution: TaskExecution = match std::fs::read_to_string(&state_file)
                .map_err(Error::Io)
                .and_then(|raw| serde_json::from_str(&raw).map_err(Error::Json))
            {
                Ok(execution) => execution,
                Err(e) => {
                    tracing::warn!(path = %state_file.display(), error = %e, "failed to restore task state");
                    continue;
                }
            };

            if execution.status == TaskStatus::Running {
                execution.status = TaskStatus::Error;
                execution.error = Some("Server restarted during execution".into());
                execution.completed_at = Some(Utc::now());
                execution.was_viewed = false;
                if let Err(e) = self.save_execution(&execution) {
                    tracing::warn!(session_id = %execution.session_id, error = %e, "failed to persist restart recovery");
                }
                tracing::warn!(
                    session_id = %execution.session_id,
                    "task marked as error (server restarted during execution)"
                );
            }

            let loaded = self.events.load_from_disk(&execution.session_id);
            tracing::info!(
                session_id = %execution.session_id,
                status = ?execution.status,
                events = loaded,
                "restored session task state"
            );

            self.sessions.lock().insert(
                execution.session_id.clone(),
                SessionTaskState {
                    execution,
                    worker: None,
                    cancel: CancellationToken::new(),
                },
            );
        }
    }

    /// Start a new background task for a session.
    ///
    /// Fails with [`Error::SessionBusy`] when the session already has a
    /// running execution. Clears the prior event log, persists the fresh
    /// execution, then spawns a worker consuming `stream`.
    pub fn start(&self, session_id: &str, prompt: &str, stream: EventStream) -> Result<String> {
        let task_id = Uuid::new_v4().to_string();
        let execution = TaskExecution {
            task_id: task_id.clone(),
            session_id: session_id.to_owned(),
            prompt: prompt.to_owned(),
            status: TaskStatus::Running,
            started_at: Utc::now(),
            completed_at: None,
            error: None,
            was_viewed: false,
            event_count: 0,
        };

        let cancel = CancellationToken::new();
        {
            let mut sessions = self.sessions.lock();
            if let Some(state) = sessions.get(session_id) {
                if state.execution.status == TaskStatus::Running {
                    return Err(Error::SessionBusy(session_id.to_owned()));
                }
            }
            self.events.clear(session_id);
            self.save_execution(&execution)?;
            sessions.insert(
                session_id.to_owned(),
                SessionTaskState {
                    execution,
                    worker: None,
                    cancel: cancel.clone(),
                },
            );
        }

        let runner = self.clone();
        let sid = session_id.to_owned();
        let handle = tokio::spawn(async move {
            runner.run_worker(&sid, stream, cancel).await;
        });

        if let Some(state) = self.sessions.lock().get_mut(session_id) {
            state.worker = Some(handle);
        }

        tracing::info!(session_id, task_id = %task_id, "task started");
        Ok(task_id)
    }

    async fn run_worker(&self, session_id: &str, mut stream: EventStream, cancel: CancellationToken) {
        loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => {
                    // A task that already reached a terminal status has
                    // nothing left to record.
                    if !self.is_running(session_id) {
                        return;
                    }
                    // Cancellation is an error outcome: one synthesized
                    // event so subscribers observe termination.
                    self.append(session_id, StreamEvent::error("Task was cancelled"));
                    self.finish(session_id, TaskStatus::Error, Some("Task was cancelled".into()));
                    tracing::info!(session_id, "task cancelled");
                    return;
                }
                next = stream.next() => next,
            };
            let Some(event) = next else {
                return;
            };

            let kind = event.kind;
            let content = event.content.clone();
            self.append(session_id, event);

            match kind {
                EventType::Done => {
                    self.finish(session_id, TaskStatus::Completed, None);
                    tracing::info!(session_id, "task completed");
                }
                EventType::Error => {
                    let message = match content {
                        Value::String(s) => s,
                        other => other.to_string(),
                    };
                    self.finish(session_id, TaskStatus::Error, Some(message.clone()));
                    tracing::error!(session_id, error = %message, "task errored");
                }
                _ => {}
            }
        }
    }

    /// Stop the runner (process shutdown): cancel every running worker and
    /// wait for each to record its terminal state. Cancelled tasks end as
    /// error "Task was cancelled".
    pub async fn shutdown(&self) {
        let running: Vec<(String, CancellationToken, JoinHandle<()>)> = {
            let mut sessions = self.sessions.lock();
            sessions
                .iter_mut()
                .filter(|(_, state)| state.execution.status == TaskStatus::Running)
                .filter_map(|(session_id, state)| {
                    state
                        .worker
                        .take()
                        .map(|worker| (session_id.clone(), state.cancel.clone(), worker))
                })
                .collect()
        };

        for (session_id, cancel, worker) in running {
            cancel.cancel();
            let _ = worker.await;
            tracing::info!(session_id = %session_id, "worker stopped on shutdown");
        }
    }

    /// Flip the execution to a terminal status, unless it already is
    /// terminal (an interrupt or an earlier error wins).
    fn finish(&self, session_id: &str, status: TaskStatus, error: Option<String>) {
        let execution = {
            let mut sessions = self.sessions.lock();
            let Some(state) = sessions.get_mut(session_id) else {
                return;
            };
            if state.execution.status.is_terminal() {
                return;
            }
            state.execution.status = status;
            state.execution.error = error;
            state.execution.completed_at = Some(Utc::now());
            state.execution.was_viewed = false;
            state.execution.clone()
        };
        if let Err(e) = self.save_execution(&execution) {
            tracing::warn!(session_id, error = %e, "failed to persist terminal status");
        }
    }

    /// Interrupt a running task: deliver the client's native interrupt,
    /// stop the worker, then record the user-initiated completion with one
    /// synthetic `system` and one synthetic `done` event.
    ///
    /// Returns false (no-op) when the session has no running task.
    pub async fn interrupt(&self, session_id: &str) -> bool {
        if !self.is_running(session_id) {
            return false;
        }

        let interrupter = self.interrupter.lock().clone();
        let delivered = match interrupter {
            Some(interrupter) => interrupter.interrupt(session_id).await,
            None => false,
        };
        if !delivered {
            tracing::warn!(session_id, "native interrupt unavailable, cancelling worker");
        }

        // Stop the worker before appending the synthetic tail so no
        // residual stream events land after it.
        let handle = self.sessions.lock().get_mut(session_id).and_then(|s| s.worker.take());
        if let Some(handle) = handle {
            handle.abort();
            let _ = handle.await;
        }

        let execution = {
            let mut sessions = self.sessions.lock();
            let Some(state) = sessions.get_mut(session_id) else {
                return false;
            };
            state.execution.status = TaskStatus::Completed;
            state.execution.completed_at = Some(Utc::now());
            state.execution.error = None;
            state.execution.clone()
        };
        if let Err(e) = self.save_execution(&execution) {
            tracing::warn!(session_id, error = %e, "failed to persist interrupt");
        }

        self.append(
            session_id,
            StreamEvent::new(EventType::System, json!("Task interrupted by user")),
        );
        self.append(
            session_id,
            StreamEvent::new(EventType::Done, json!({"interrupted": true})),
        );

        tracing::info!(session_id, "task interrupted by user");
        true
    }

    pub fn mark_viewed(&self, session_id: &str) {
        let execution = {
            let mut sessions = self.sessions.lock();
            let Some(state) = sessions.get_mut(session_id) else {
                return;
            };
            state.execution.was_viewed = true;
            state.execution.clone()
        };
        if let Err(e) = self.save_execution(&execution) {
            tracing::warn!(session_id, error = %e, "failed to persist viewed flag");
        }
    }

    pub fn is_running(&self, session_id: &str) -> bool {
        self.sessions
            .lock()
            .get(session_id)
            .map(|s| s.execution.status == TaskStatus::Running)
            .unwrap_or(false)
    }

    pub fn status(&self, session_id: &str) -> Option<TaskExecution> {
        self.sessions
            .lock()
            .get(session_id)
            .map(|s| s.execution.clone())
    }

    pub fn all_status(&self) -> HashMap<String, StatusSummary> {
        self.sessions
            .lock()
            .iter()
            .map(|(session_id, state)| {
                (
                    session_id.clone(),
                    StatusSummary {
                        status: state.execution.status,
                        has_unread: state.execution.has_unread(),
                        task_id: state.execution.task_id.clone(),
                        error: state.execution.error.clone(),
                    },
                )
            })
            .collect()
    }

    /// Subscribe to a session's events: the cached prefix plus, for a
    /// non-terminal execution, a live receiver. Implicitly marks viewed.
    pub fn subscribe(
        &self,
        session_id: &str,
    ) -> (
        Vec<BufferedEvent>,
        Option<tokio::sync::mpsc::Receiver<BufferedEvent>>,
    ) {
        self.mark_viewed(session_id);
        let terminal = self
            .sessions
            .lock()
            .get(session_id)
            .map(|s| s.execution.status.is_terminal())
            .unwrap_or(false);
        if terminal {
            (self.events.cached(session_id), None)
        } else {
            let (cached, rx) = self.events.subscribe(session_id);
            (cached, Some(rx))
        }
    }

    /// Clear all task state for a session (session deletion): cancel the
    /// worker, drop in-memory state, remove the on-disk task directory.
    pub fn clear(&self, session_id: &str) {
        if let Some(state) = self.sessions.lock().remove(session_id) {
            if let Some(worker) = state.worker {
                worker.abort();
            }
        }
        self.events.clear(session_id);
        let dir = self.storage.join(session_id);
        if dir.exists() {
            if let Err(e) = std::fs::remove_dir_all(&dir) {
                tracing::warn!(session_id, error = %e, "failed to remove task directory");
            }
        }
        tracing::info!(session_id, "task state cleared");
    }
}

impl EventSink for TaskRunner {
    fn append(&self, session_id: &str, event: StreamEvent) -> BufferedEvent {
        let buffered = self.events.append(session_id, event);
        let execution = {
            let mut sessions = self.sessions.lock();
            sessions.get_mut(session_id).map(|state| {
                state.execution.event_count = self.events.event_count(session_id);
                state.execution.clone()
            })
        };
        if let Some(execution) = execution {
            if let Err(e) = self.save_execution(&execution) {
                tracing::warn!(session_id, error = %e, "failed to persist event count");
            }
        }
        buffered
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
