use std::sync::Arc;

use ov_autopilot::orchestrator::Orchestrator;
use ov_autopilot::worker::ClientWorker;
use ov_client::ClientFactory;
use ov_domain::config::Config;
use ov_domain::error::Result;
use ov_sessions::SessionStore;

use crate::runtime::{EventBuffer, InteractionGate, SessionManager, TaskRunner};

/// Shared application state passed to all handlers. One value, constructed
/// at startup — no ambient singletons.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,

    // ── Interactive runtime ───────────────────────────────────────────
    pub sessions: Arc<SessionStore>,
    pub manager: Arc<SessionManager>,
    pub tasks: Arc<TaskRunner>,
    pub gate: Arc<InteractionGate>,

    // ── Autonomous runtime ────────────────────────────────────────────
    pub autopilot: Arc<Orchestrator>,
}

/// Wire up every component in dependency order:
/// EventBuffer → TaskRunner → InteractionGate → SessionManager, then close
/// the interrupt seam, then the autopilot orchestrator.
pub fn build_state(config: Arc<Config>, factory: ClientFactory) -> Result<AppState> {
    std::fs::create_dir_all(&config.storage.state_path)?;

    let sessions = Arc::new(SessionStore::new(&config.storage.state_path)?);

    let events = Arc::new(EventBuffer::new(
        config.storage.tasks_dir(),
        config.tasks.subscriber_buffer,
    ));
    let tasks = Arc::new(TaskRunner::new(config.storage.tasks_dir(), events));
    tasks.restore();

    let gate = Arc::new(InteractionGate::new(config.gate.clone(), tasks.clone()));
    let manager = Arc::new(SessionManager::new(
        config.clone(),
        factory.clone(),
        gate.clone(),
    ));
    tasks.set_interrupter(manager.clone());

    let worker = Arc::new(ClientWorker::new(factory, config.endpoints.clone()));
    let autopilot = Arc::new(Orchestrator::new(config.storage.workspace_dir(), worker));

    Ok(AppState {
        config,
        sessions,
        manager,
        tasks,
        gate,
        autopilot,
    })
}
