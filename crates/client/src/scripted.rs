//! A deterministic, in-process agent client.
//!
//! Each query pops the next scripted turn and replays its steps as client
//! messages. Permission steps consult the configured [`PermissionHandler`]
//! exactly like a real client would, so the suspend/resume path is exercised
//! end-to-end without a model or a subprocess.

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;

use ov_domain::config::PermissionMode;
use ov_domain::error::Result;

use crate::{
    AgentClient, ClientFactory, ClientMessage, ClientOptions, InterruptHandle,
    PermissionDecision, TurnResult,
};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Script model
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// One step of a scripted turn.
#[derive(Debug, Clone)]
pub enum ScriptStep {
    /// Deliver a message verbatim.
    Emit(ClientMessage),
    /// Consult the permission handler for `tool_name`, then deliver either
    /// branch. With no handler configured the deny branch is taken.
    Permission {
        tool_name: String,
        input: Value,
        on_allow: Vec<ClientMessage>,
        on_deny: Vec<ClientMessage>,
    },
    /// Block until the test notifies, for controlling mid-turn timing.
    Pause(Arc<tokio::sync::Notify>),
    /// Fail the turn with a client error.
    Fail(String),
}

/// Convenience: wrap plain messages as emit steps.
pub fn emit_all(messages: Vec<ClientMessage>) -> Vec<ScriptStep> {
    messages.into_iter().map(ScriptStep::Emit).collect()
}

/// Observable record of what the client was asked to do.
#[derive(Default)]
pub struct ScriptedLog {
    pub queries: Mutex<Vec<String>>,
    pub modes: Mutex<Vec<PermissionMode>>,
    pub interrupts: Mutex<usize>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Builder
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Default)]
pub struct ScriptedClientBuilder {
    session_token: Option<String>,
    turns: Vec<Vec<ScriptStep>>,
    fail_connect: bool,
    log: Arc<ScriptedLog>,
}

impl ScriptedClientBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Token the client advertises in its init message (overridden by a
    /// resume token in the options).
    pub fn session_token(mut self, token: impl Into<String>) -> Self {
        self.session_token = Some(token.into());
        self
    }

    pub fn turn(mut self, steps: Vec<ScriptStep>) -> Self {
        self.turns.push(steps);
        self
    }

    /// Make `connect` fail, for exercising client-start failure paths.
    pub fn fail_connect(mut self) -> Self {
        self.fail_connect = true;
        self
    }

    /// Shared log across every client the factory creates.
    pub fn log(&self) -> Arc<ScriptedLog> {
        self.log.clone()
    }

    pub fn build(self, options: ClientOptions) -> ScriptedClient {
        let token = options
            .resume_token
            .clone()
            .or(self.session_token)
            .unwrap_or_else(|| format!("tok-{}", uuid::Uuid::new_v4().simple()));
        ScriptedClient {
            options,
            session_token: token,
            turns: self.turns.into(),
            pending: VecDeque::new(),
            steps: VecDeque::new(),
            connected: false,
            fail_connect: self.fail_connect,
            in_turn: false,
            interrupt: InterruptHandle::new(),
            log: self.log,
        }
    }

    /// Factory handing out one client per call, each replaying this script
    /// from the beginning and sharing the same log.
    pub fn into_factory(self) -> ClientFactory {
        let token = self.session_token;
        let turns = self.turns;
        let fail_connect = self.fail_connect;
        let log = self.log;
        Arc::new(move |options: ClientOptions| {
            let builder = ScriptedClientBuilder {
                session_token: token.clone(),
                turns: turns.clone(),
                fail_connect,
                log: log.clone(),
            };
            Box::new(builder.build(options)) as Box<dyn AgentClient>
        })
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Client
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct ScriptedClient {
    options: ClientOptions,
    session_token: String,
    turns: VecDeque<Vec<ScriptStep>>,
    /// Remaining steps of the in-flight turn.
    steps: VecDeque<ScriptStep>,
    /// Messages expanded from steps, delivered before the next step runs.
    pending: VecDeque<ClientMessage>,
    connected: bool,
    fail_connect: bool,
    in_turn: bool,
    interrupt: InterruptHandle,
    pub log: Arc<ScriptedLog>,
}

impl ScriptedClient {
    fn finish_turn(&mut self, result: TurnResult) -> ClientMessage {
        self.in_turn = false;
        self.steps.clear();
        self.pending.clear();
        ClientMessage::Result(result)
    }
}

#[async_trait]
impl AgentClient for ScriptedClient {
    async fn connect(&mut self) -> Result<()> {
        if self.fail_connect {
            return Err(ov_domain::error::Error::Client(
                "scripted connect failure".into(),
            ));
        }
        self.connected = true;
        Ok(())
    }

    async fn set_permission_mode(&mut self, mode: PermissionMode) -> Result<()> {
        self.log.modes.lock().push(mode);
        Ok(())
    }

    async fn query(&mut self, prompt: &str) -> Result<()> {
        self.log.queries.lock().push(prompt.to_owned());
        self.steps = self.turns.pop_front().unwrap_or_default().into();
        self.pending.clear();
        self.pending.push_back(ClientMessage::Init {
            session_token: self.session_token.clone(),
            slash_commands: Vec::new(),
        });
        self.in_turn = true;
        Ok(())
    }

    async fn next_message(&mut self) -> Result<Option<ClientMessage>> {
        if !self.in_turn {
            return Ok(None);
        }
        if self.interrupt.is_interrupted() {
            *self.log.interrupts.lock() += 1;
            self.interrupt.rearm();
            return Ok(Some(self.finish_turn(TurnResult::default())));
        }

        loop {
            if let Some(message) = self.pending.pop_front() {
                if matches!(message, ClientMessage::Result(_)) {
                    self.in_turn = false;
                }
                return Ok(Some(message));
            }

            let Some(step) = self.steps.pop_front() else {
                // Script ran dry without a terminal message.
                return Ok(Some(self.finish_turn(TurnResult::default())));
            };

            match step {
                ScriptStep::Emit(message) => self.pending.push_back(message),
                ScriptStep::Permission {
                    tool_name,
                    input,
                    on_allow,
                    on_deny,
                } => {
                    let decision = match &self.options.permission_handler {
                        Some(handler) => handler.can_use_tool(&tool_name, &input).await,
                        None => PermissionDecision::deny("no permission handler configured"),
                    };
                    let branch = match decision {
                        PermissionDecision::Allow { .. } => on_allow,
                        PermissionDecision::Deny { .. } => on_deny,
                    };
                    self.pending.extend(branch);
                }
                ScriptStep::Pause(notify) => {
                    notify.notified().await;
                }
                ScriptStep::Fail(message) => {
                    self.in_turn = false;
                    return Err(ov_domain::error::Error::Client(message));
                }
            }
        }
    }

    fn interrupt_handle(&self) -> InterruptHandle {
        self.interrupt.clone()
    }

    async fn close(&mut self) -> Result<()> {
        self.connected = false;
        Ok(())
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
