//! Session manager — owns one agent client per session id.
//!
//! Reuses an existing client while the endpoint and model are unchanged,
//! recreates it (propagating the stored resume token) when they differ, and
//! closes idle clients. [`SessionManager::stream`] drives a single turn,
//! translating the client's message surface into the canonical event
//! taxonomy through a per-turn block-index state machine.
//!
//! The "client channel" of a managed session is the session's buffered
//! event stream: the permission/ask callback emits through the interaction
//! gate into the event sink, so a reconnecting subscriber re-sees pending
//! prompts without any per-connection rebinding.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::{json, Value};
use uuid::Uuid;

use ov_client::{
    AgentClient, AssistantBlock, BlockOpen, ClientFactory, ClientMessage, ClientOptions,
    ContentDelta, InterruptHandle, PermissionDecision, PermissionHandler, ASK_USER_TOOL,
};
use ov_domain::config::{Config, PermissionMode};
use ov_domain::event::{EventType, StreamEvent, Usage};

use super::gate::InteractionGate;
use super::{EventStream, Interruptible};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Managed session
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

struct SessionMeta {
    permission_mode: Option<PermissionMode>,
    resume_token: Option<String>,
    slash_commands: Vec<String>,
    last_active: Instant,
    started: bool,
}

/// One live agent client bound to a session id. Exclusively owned by the
/// [`SessionManager`]; destroyed on config change, idle timeout, or session
/// deletion.
pub struct ManagedSession {
    pub session_id: String,
    pub endpoint_name: Option<String>,
    pub model_name: Option<String>,
    client: tokio::sync::Mutex<Box<dyn AgentClient>>,
    interrupt: InterruptHandle,
    meta: parking_lot::Mutex<SessionMeta>,
}

impl ManagedSession {
    pub fn update_activity(&self) {
        self.meta.lock().last_active = Instant::now();
    }

    pub fn is_idle(&self, max_idle: Duration) -> bool {
        self.meta.lock().last_active.elapsed() > max_idle
    }

    /// The external resume token captured from the last init message.
    pub fn resume_token(&self) -> Option<String> {
        self.meta.lock().resume_token.clone()
    }

    pub fn slash_commands(&self) -> Vec<String> {
        self.meta.lock().slash_commands.clone()
    }

    fn is_started(&self) -> bool {
        self.meta.lock().started
    }
}

/// Parameters for [`SessionManager::get_or_create`].
#[derive(Debug, Clone, Default)]
pub struct SessionRequest {
    pub session_id: String,
    pub endpoint: Option<String>,
    pub model: Option<String>,
    /// Stored token of the conversation to continue after a recreate.
    pub resume_token: Option<String>,
    pub cwd: Option<String>,
    pub permission_mode: Option<PermissionMode>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Permission / ask callback
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Turns the client's mid-turn tool consultations into gate suspensions.
struct GateHandler {
    session_id: String,
    gate: Arc<InteractionGate>,
}

#[async_trait]
impl PermissionHandler for GateHandler {
    async fn can_use_tool(&self, tool_name: &str, input: &Value) -> PermissionDecision {
        let request_id = Uuid::new_v4().to_string();

        if tool_name == ASK_USER_TOOL {
            let questions = input.get("questions").cloned().unwrap_or_else(|| json!([]));
            tracing::info!(request_id, session_id = %self.session_id, "agent is asking the user");
            return match self
                .gate
                .request_user_input(&request_id, &self.session_id, questions.clone())
                .await
            {
                Some(answers) => PermissionDecision::Allow {
                    updated_input: Some(json!({
                        "questions": questions,
                        "answers": answers,
                    })),
                },
                None => PermissionDecision::deny("User did not provide an answer"),
            };
        }

        tracing::info!(request_id, session_id = %self.session_id, tool_name, "tool permission requested");
        let approved = self
            .gate
            .request_permission(&request_id, &self.session_id, tool_name, input.clone())
            .await;
        if approved {
            PermissionDecision::allow()
        } else {
            PermissionDecision::deny(format!("User denied permission for {tool_name}"))
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Session manager
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

type SessionMap = Arc<tokio::sync::Mutex<HashMap<String, Arc<ManagedSession>>>>;

pub struct SessionManager {
    config: Arc<Config>,
    factory: ClientFactory,
    gate: Arc<InteractionGate>,
    sessions: SessionMap,
}

impl SessionManager {
    pub fn new(config: Arc<Config>, factory: ClientFactory, gate: Arc<InteractionGate>) -> Self {
        Self {
            config,
            factory,
            gate,
            sessions: Arc::new(tokio::sync::Mutex::new(HashMap::new())),
        }
    }

    /// Get the existing managed session or create a new one.
    ///
    /// An existing session is reused iff endpoint and model are unchanged;
    /// the requested permission mode is applied on the next turn. On a
    /// config change the old client is closed and a fresh one is created
    /// with the stored resume token so the conversation continues.
    pub async fn get_or_create(&self, req: SessionRequest) -> Arc<ManagedSession> {
        let mut sessions = self.sessions.lock().await;

        if let Some(existing) = sessions.get(&req.session_id) {
            if existing.endpoint_name == req.endpoint && existing.model_name == req.model {
                existing.update_activity();
                tracing::info!(
                    session_id = %req.session_id,
                    pending_mode = ?req.permission_mode,
                    "reusing managed session"
                );
                return existing.clone();
            }
            tracing::info!(
                session_id = %req.session_id,
                endpoint = ?req.endpoint,
                model = ?req.model,
                "config changed, recreating managed session"
            );
            if let Some(old) = sessions.remove(&req.session_id) {
                Self::close_managed(old).await;
            }
        }

        let session = self.create_session(&req);
        sessions.insert(req.session_id.clone(), session.clone());
        session
    }

    fn create_session(&self, req: &SessionRequest) -> Arc<ManagedSession> {
        let agent = &self.config.agent;
        let endpoint = req
            .endpoint
            .as_deref()
            .or(agent.default_endpoint.as_deref())
            .and_then(|name| self.config.endpoint(name))
            .cloned();
        let model = req
            .model
            .clone()
            .or_else(|| endpoint.as_ref().and_then(|e| e.default_model.clone()));
        let permission_mode = req.permission_mode.unwrap_or(agent.permission_mode);

        let handler = Arc::new(GateHandler {
            session_id: req.session_id.clone(),
            gate: self.gate.clone(),
        });

        let options = ClientOptions {
            endpoint,
            model: model.clone(),
            cwd: req.cwd.clone().or_else(|| agent.default_workdir.clone()),
            system_prompt: None,
            permission_mode,
            resume_token: req.resume_token.clone(),
            allowed_tools: agent.allowed_tools.clone(),
            disallowed_tools: agent.disallowed_tools.clone(),
            max_turns: agent.max_turns,
            max_output_tokens: agent.max_output_tokens,
            max_thinking_tokens: agent.max_thinking_tokens,
            tool_servers: agent.enabled_tool_servers().cloned().collect(),
            include_partial_messages: true,
            permission_handler: Some(handler),
        };

        let client = (self.factory)(options);
        let interrupt = client.interrupt_handle();

        tracing::info!(
            session_id = %req.session_id,
            endpoint = ?req.endpoint,
            model = ?model,
            resume = req.resume_token.is_some(),
            "created managed session"
        );

        Arc::new(ManagedSession {
            session_id: req.session_id.clone(),
            endpoint_name: req.endpoint.clone(),
            model_name: req.model.clone(),
            client: tokio::sync::Mutex::new(client),
            interrupt,
            meta: parking_lot::Mutex::new(SessionMeta {
                permission_mode: Some(permission_mode),
                resume_token: req.resume_token.clone(),
                slash_commands: Vec::new(),
                last_active: Instant::now(),
                started: false,
            }),
        })
    }

    /// Drive one turn, yielding canonical events.
    ///
    /// The stream lazily starts the client, pushes a changed permission
    /// mode (best-effort), sends the prompt, and translates every client
    /// message. It terminates with exactly one `done` event, or a single
    /// `error` event when the client fails.
    pub fn stream(
        &self,
        session: Arc<ManagedSession>,
        message: String,
        permission_mode: Option<PermissionMode>,
    ) -> EventStream {
        let sessions = self.sessions.clone();
        Box::pin(async_stream::stream! {
            let session_id = session.session_id.clone();
            let mut client = session.client.lock().await;

            // Lazy start. A failed start is fatal for this turn and the
            // half-initialized session is not kept around.
            if !session.is_started() {
                if let Err(e) = client.connect().await {
                    tracing::error!(session_id = %session_id, error = %e, "client start failed");
                    drop(client);
                    sessions.lock().await.remove(&session_id);
                    yield StreamEvent::error(format!("failed to start agent client: {e}"))
                        .with_session(&session_id);
                    return;
                }
                session.meta.lock().started = true;
            }

            // Apply a changed permission mode before the prompt. Failure is
            // logged and the turn proceeds with the previous mode.
            if let Some(mode) = permission_mode {
                let current = session.meta.lock().permission_mode;
                if current != Some(mode) {
                    match client.set_permission_mode(mode).await {
                        Ok(()) => {
                            session.meta.lock().permission_mode = Some(mode);
                            tracing::info!(session_id = %session_id, mode = mode.as_str(), "permission mode updated");
                        }
                        Err(e) => {
                            tracing::warn!(session_id = %session_id, error = %e, "failed to set permission mode");
                        }
                    }
                }
            }

            if let Err(e) = client.query(&message).await {
                yield StreamEvent::error(e.to_string()).with_session(&session_id);
                return;
            }
            session.update_activity();

            let turn_tag = Uuid::new_v4().simple().to_string();
            let mut tracker = BlockTracker::new(turn_tag);
            let mut turn_count: u32 = 0;
            let mut outcome: Option<ov_client::TurnResult> = None;

            loop {
                let msg = match client.next_message().await {
                    Ok(Some(msg)) => msg,
                    Ok(None) => break,
                    Err(e) => {
                        tracing::error!(session_id = %session_id, error = %e, "stream error");
                        yield StreamEvent::error(e.to_string())
                            .with_meta("error_type", json!("client"))
                            .with_session(&session_id);
                        return;
                    }
                };

                match msg {
                    ClientMessage::Init { session_token, slash_commands } => {
                        {
                            let mut meta = session.meta.lock();
                            meta.resume_token = Some(session_token.clone());
                            if !slash_commands.is_empty() {
                                meta.slash_commands = slash_commands.clone();
                            }
                        }
                        tracing::info!(session_id = %session_id, token = %session_token, "captured session token");
                        yield StreamEvent::new(
                            EventType::System,
                            json!({
                                "session_token": session_token,
                                "slash_commands": slash_commands,
                            }),
                        )
                        .with_meta("subtype", json!("init"))
                        .with_session(&session_id);
                    }
                    ClientMessage::BlockStart { index, block } => {
                        for event in tracker.start(index, block) {
                            yield event.with_session(&session_id);
                        }
                    }
                    ClientMessage::BlockDelta { index, delta } => {
                        for event in tracker.delta(index, delta) {
                            yield event.with_session(&session_id);
                        }
                    }
                    ClientMessage::BlockStop { index } => {
                        for event in tracker.stop(index) {
                            yield event.with_session(&session_id);
                        }
                    }
                    ClientMessage::Assistant { blocks } => {
                        turn_count += 1;
                        for block in blocks {
                            match block {
                                AssistantBlock::Text { text } => {
                                    // Aggregated text comes from the block
                                    // machine when the client streamed it.
                                    if !tracker.streamed_text && !text.is_empty() {
                                        yield StreamEvent::new(EventType::Text, json!(text))
                                            .with_meta("turn", json!(turn_count))
                                            .with_session(&session_id);
                                    }
                                }
                                AssistantBlock::Thinking { thinking } => {
                                    if !tracker.streamed_thinking && !thinking.is_empty() {
                                        yield StreamEvent::new(EventType::Thinking, json!(thinking))
                                            .with_meta("turn", json!(turn_count))
                                            .with_session(&session_id);
                                    }
                                }
                                AssistantBlock::ToolUse { id, name, input } => {
                                    yield StreamEvent::new(
                                        EventType::ToolUse,
                                        json!({"id": id, "name": name, "input": input}),
                                    )
                                    .with_meta("turn", json!(turn_count))
                                    .with_session(&session_id);
                                }
                            }
                        }
                    }
                    ClientMessage::ToolResult { tool_use_id, content, is_error } => {
                        yield StreamEvent::new(
                            EventType::ToolResult,
                            json!({
                                "tool_use_id": tool_use_id,
                                "content": content,
                                "is_error": is_error,
                            }),
                        )
                        .with_meta("turn", json!(turn_count))
                        .with_session(&session_id);
                    }
                    ClientMessage::Todos { todos } => {
                        yield StreamEvent::new(EventType::Todos, json!({"todos": todos}))
                            .with_session(&session_id);
                    }
                    ClientMessage::Result(result) => {
                        if result.is_error {
                            let message = result
                                .error
                                .clone()
                                .unwrap_or_else(|| "Unknown error".into());
                            yield StreamEvent::error(message)
                                .with_meta("source", json!("result"))
                                .with_session(&session_id);
                        }
                        outcome = Some(result);
                        break;
                    }
                }
            }

            session.update_activity();

            let mut content = json!({"total_turns": turn_count});
            let mut usage: Option<Usage> = None;
            if let Some(result) = outcome {
                if let Some(cost) = result.cost_usd {
                    content["cost_usd"] = json!(cost);
                }
                if let Some(duration) = result.duration_ms {
                    content["duration_ms"] = json!(duration);
                }
                usage = result.usage;
            }
            let mut done = StreamEvent::new(EventType::Done, content).with_session(&session_id);
            if let Some(usage) = usage {
                done = done.with_usage(usage);
            }
            yield done;
        })
    }

    /// Close and remove a session's client.
    pub async fn close_session(&self, session_id: &str) {
        let session = self.sessions.lock().await.remove(session_id);
        if let Some(session) = session {
            Self::close_managed(session).await;
        }
    }

    async fn close_managed(session: Arc<ManagedSession>) {
        let started = session.is_started();
        let mut client = session.client.lock().await;
        if started {
            if let Err(e) = client.close().await {
                tracing::error!(session_id = %session.session_id, error = %e, "error closing client");
            }
        }
        tracing::info!(session_id = %session.session_id, "closed managed session");
    }

    /// Close every managed session (shutdown).
    pub async fn close_all(&self) {
        let sessions: Vec<_> = self.sessions.lock().await.drain().map(|(_, s)| s).collect();
        for session in sessions {
            Self::close_managed(session).await;
        }
    }

    /// Session ids idle longer than `max_idle`. The sweeper filters out
    /// sessions with a running task before closing.
    pub async fn idle_sessions(&self, max_idle: Duration) -> Vec<String> {
        self.sessions
            .lock()
            .await
            .iter()
            .filter(|(_, s)| s.is_idle(max_idle))
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub async fn get_session(&self, session_id: &str) -> Option<Arc<ManagedSession>> {
        self.sessions.lock().await.get(session_id).cloned()
    }

    pub async fn active_count(&self) -> usize {
        self.sessions.lock().await.len()
    }
}

#[async_trait]
impl Interruptible for SessionManager {
    async fn interrupt(&self, session_id: &str) -> bool {
        let session = self.sessions.lock().await.get(session_id).cloned();
        match session {
            Some(session) if session.is_started() => {
                session.interrupt.interrupt();
                tracing::info!(session_id, "native interrupt delivered");
                true
            }
            _ => false,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Block state machine
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

enum TrackKind {
    Text,
    Thinking,
    Tool,
}

struct BlockTrack {
    kind: TrackKind,
    id: String,
    content: String,
}

/// Routes partial-content deltas to the block they extend, keyed by the
/// client's block index. Reset per turn.
struct BlockTracker {
    turn_tag: String,
    blocks: HashMap<usize, BlockTrack>,
    streamed_text: bool,
    streamed_thinking: bool,
}

impl BlockTracker {
    fn new(turn_tag: String) -> Self {
        Self {
            turn_tag,
            blocks: HashMap::new(),
            streamed_text: false,
            streamed_thinking: false,
        }
    }

    fn start(&mut self, index: usize, block: BlockOpen) -> Vec<StreamEvent> {
        match block {
            BlockOpen::Text => {
                let id = format!("text_{}_{index}", self.turn_tag);
                self.streamed_text = true;
                self.blocks.insert(
                    index,
                    BlockTrack {
                        kind: TrackKind::Text,
                        id: id.clone(),
                        content: String::new(),
                    },
                );
                vec![StreamEvent::new(EventType::TextStart, Value::Null).with_id(id)]
            }
            BlockOpen::Thinking => {
                let id = format!("thinking_{index}");
                self.streamed_thinking = true;
                self.blocks.insert(
                    index,
                    BlockTrack {
                        kind: TrackKind::Thinking,
                        id: id.clone(),
                        content: String::new(),
                    },
                );
                vec![StreamEvent::new(EventType::ThinkingStart, Value::Null).with_id(id)]
            }
            BlockOpen::ToolUse { id, name } => {
                self.blocks.insert(
                    index,
                    BlockTrack {
                        kind: TrackKind::Tool,
                        id: id.clone(),
                        content: String::new(),
                    },
                );
                vec![
                    StreamEvent::new(EventType::ToolInputStart, json!({"name": name})).with_id(id),
                ]
            }
        }
    }

    fn delta(&mut self, index: usize, delta: ContentDelta) -> Vec<StreamEvent> {
        let Some(block) = self.blocks.get_mut(&index) else {
            // Delta for an unknown block: the client skipped the start.
            return Vec::new();
        };
        match (delta, &block.kind) {
            (ContentDelta::Text(text), TrackKind::Text) => {
                block.content.push_str(&text);
                vec![StreamEvent::new(EventType::TextDelta, json!(text)).with_id(block.id.clone())]
            }
            (ContentDelta::Thinking(text), TrackKind::Thinking) => {
                block.content.push_str(&text);
                vec![
                    StreamEvent::new(EventType::ThinkingDelta, json!(text))
                        .with_id(block.id.clone()),
                ]
            }
            (ContentDelta::InputJson(partial), TrackKind::Tool) => {
                block.content.push_str(&partial);
                vec![
                    StreamEvent::new(EventType::ToolInputDelta, json!(partial))
                        .with_id(block.id.clone()),
                ]
            }
            _ => Vec::new(),
        }
    }

    fn stop(&mut self, index: usize) -> Vec<StreamEvent> {
        let Some(block) = self.blocks.remove(&index) else {
            return Vec::new();
        };
        match block.kind {
            TrackKind::Text => {
                let mut events =
                    vec![StreamEvent::new(EventType::TextEnd, Value::Null).with_id(block.id)];
                if !block.content.is_empty() {
                    events.push(StreamEvent::new(EventType::Text, json!(block.content)));
                }
                events
            }
            TrackKind::Thinking => {
                let mut events =
                    vec![StreamEvent::new(EventType::ThinkingEnd, Value::Null).with_id(block.id)];
                if !block.content.is_empty() {
                    events.push(StreamEvent::new(EventType::Thinking, json!(block.content)));
                }
                events
            }
            TrackKind::Tool => {
                vec![StreamEvent::new(EventType::ToolInputEnd, Value::Null).with_id(block.id)]
            }
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::EventSink;
    use futures_util::StreamExt;
    use ov_client::scripted::{emit_all, ScriptStep, ScriptedClientBuilder};
    use ov_client::TurnResult;
    use ov_domain::config::GateConfig;
    use ov_domain::event::BufferedEvent;

    #[derive(Default)]
    struct NullSink;

    impl EventSink for NullSink {
        fn append(&self, session_id: &str, event: StreamEvent) -> BufferedEvent {
            BufferedEvent::stamp(event.with_session(session_id))
        }
    }

    fn make_manager(builder: ScriptedClientBuilder) -> Arc<SessionManager> {
        let gate = Arc::new(InteractionGate::new(
            GateConfig::default(),
            Arc::new(NullSink),
        ));
        Arc::new(SessionManager::new(
            Arc::new(Config::default()),
            builder.into_factory(),
            gate,
        ))
    }

    fn text_turn(token_text: &str) -> Vec<ScriptStep> {
        emit_all(vec![
            ClientMessage::BlockStart {
                index: 0,
                block: BlockOpen::Text,
            },
            ClientMessage::BlockDelta {
                index: 0,
                delta: ContentDelta::Text(token_text.into()),
            },
            ClientMessage::BlockStop { index: 0 },
            ClientMessage::Assistant {
                blocks: vec![AssistantBlock::Text {
                    text: token_text.into(),
                }],
            },
            ClientMessage::Result(TurnResult {
                usage: Some(Usage {
                    input_tokens: 10,
                    output_tokens: 4,
                    total_tokens: 14,
                }),
                cost_usd: Some(0.01),
                duration_ms: Some(120),
                ..Default::default()
            }),
        ])
    }

    async fn collect(stream: EventStream) -> Vec<StreamEvent> {
        stream.collect::<Vec<_>>().await
    }

    fn request(session_id: &str) -> SessionRequest {
        SessionRequest {
            session_id: session_id.into(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn turn_emits_canonical_sequence() {
        let manager = make_manager(
            ScriptedClientBuilder::new()
                .session_token("tok-seq")
                .turn(text_turn("hello")),
        );
        let session = manager.get_or_create(request("s1")).await;
        let events = collect(manager.stream(session, "hi".into(), None)).await;

        let kinds: Vec<EventType> = events.iter().map(|e| e.kind).collect();
        assert_eq!(
            kinds,
            vec![
                EventType::System,
                EventType::TextStart,
                EventType::TextDelta,
                EventType::TextEnd,
                EventType::Text,
                EventType::Done,
            ]
        );

        // Every event carries the session id; the system event carries the
        // token; done aggregates usage.
        assert!(events.iter().all(|e| e.session_id() == Some("s1")));
        assert_eq!(events[0].content["session_token"], "tok-seq");
        let done = events.last().unwrap();
        assert_eq!(done.content["total_turns"], 1);
        assert_eq!(done.usage.as_ref().unwrap().total_tokens, 14);
        assert_eq!(done.content["cost_usd"], 0.01);
    }

    #[tokio::test]
    async fn aggregated_text_not_duplicated_when_streamed() {
        let manager = make_manager(ScriptedClientBuilder::new().turn(text_turn("hello")));
        let session = manager.get_or_create(request("s1")).await;
        let events = collect(manager.stream(session, "hi".into(), None)).await;
        let text_count = events
            .iter()
            .filter(|e| e.kind == EventType::Text)
            .count();
        assert_eq!(text_count, 1);
    }

    #[tokio::test]
    async fn unstreamed_assistant_text_is_aggregated() {
        // A client that only sends the aggregated assistant message.
        let manager = make_manager(ScriptedClientBuilder::new().turn(emit_all(vec![
            ClientMessage::Assistant {
                blocks: vec![AssistantBlock::Text {
                    text: "plain".into(),
                }],
            },
            ClientMessage::Result(TurnResult::default()),
        ])));
        let session = manager.get_or_create(request("s1")).await;
        let events = collect(manager.stream(session, "hi".into(), None)).await;
        assert!(events
            .iter()
            .any(|e| e.kind == EventType::Text && e.content == json!("plain")));
    }

    #[tokio::test]
    async fn reuse_same_config_recreate_on_model_change() {
        let builder = ScriptedClientBuilder::new()
            .session_token("tok-1")
            .turn(text_turn("a"))
            .turn(text_turn("b"));
        let log = builder.log();
        let manager = make_manager(builder);

        let first = manager
            .get_or_create(SessionRequest {
                session_id: "s1".into(),
                model: Some("m1".into()),
                ..Default::default()
            })
            .await;
        let again = manager
            .get_or_create(SessionRequest {
                session_id: "s1".into(),
                model: Some("m1".into()),
                ..Default::default()
            })
            .await;
        assert!(Arc::ptr_eq(&first, &again));

        // Run a turn so the token is captured.
        let events = collect(manager.stream(first.clone(), "hi".into(), None)).await;
        assert_eq!(events[0].content["session_token"], "tok-1");

        // Model change: recreated with the stored resume token.
        let recreated = manager
            .get_or_create(SessionRequest {
                session_id: "s1".into(),
                model: Some("m2".into()),
                resume_token: first.resume_token(),
                ..Default::default()
            })
            .await;
        assert!(!Arc::ptr_eq(&first, &recreated));

        let events = collect(manager.stream(recreated, "again".into(), None)).await;
        // The fresh client advertises the same token (resumed conversation).
        assert_eq!(events[0].content["session_token"], "tok-1");
        assert_eq!(log.queries.lock().len(), 2);
    }

    #[tokio::test]
    async fn permission_mode_pushed_once_per_change() {
        let builder = ScriptedClientBuilder::new()
            .turn(text_turn("a"))
            .turn(text_turn("b"));
        let log = builder.log();
        let manager = make_manager(builder);
        let session = manager.get_or_create(request("s1")).await;

        // Same as the creation mode: no push.
        collect(manager.stream(session.clone(), "one".into(), Some(PermissionMode::Default))).await;
        assert!(log.modes.lock().is_empty());

        // Changed mode: pushed before the prompt.
        collect(
            manager.stream(
                session,
                "two".into(),
                Some(PermissionMode::BypassPermissions),
            ),
        )
        .await;
        assert_eq!(
            log.modes.lock().as_slice(),
            [PermissionMode::BypassPermissions]
        );
    }

    #[tokio::test]
    async fn client_error_emits_single_error_without_done() {
        let manager = make_manager(
            ScriptedClientBuilder::new().turn(vec![ScriptStep::Fail("connection reset".into())]),
        );
        let session = manager.get_or_create(request("s1")).await;
        let events = collect(manager.stream(session, "hi".into(), None)).await;
        assert_eq!(events.len(), 2); // init + error
        assert_eq!(events[1].kind, EventType::Error);
        assert!(events[1].content.as_str().unwrap().contains("connection reset"));
    }

    #[tokio::test]
    async fn result_error_emits_error_then_done() {
        let manager = make_manager(ScriptedClientBuilder::new().turn(emit_all(vec![
            ClientMessage::Result(TurnResult {
                is_error: true,
                error: Some("max turns exceeded".into()),
                ..Default::default()
            }),
        ])));
        let session = manager.get_or_create(request("s1")).await;
        let events = collect(manager.stream(session, "hi".into(), None)).await;
        let kinds: Vec<EventType> = events.iter().map(|e| e.kind).collect();
        assert_eq!(
            kinds,
            vec![EventType::System, EventType::Error, EventType::Done]
        );
    }

    #[tokio::test]
    async fn failed_connect_is_fatal_and_uncached() {
        let manager = make_manager(ScriptedClientBuilder::new().fail_connect());
        let session = manager.get_or_create(request("s1")).await;
        let events = collect(manager.stream(session, "hi".into(), None)).await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, EventType::Error);
        // The half-initialized session was dropped.
        assert!(manager.get_session("s1").await.is_none());
    }

    #[tokio::test]
    async fn idle_sessions_reported() {
        let manager = make_manager(ScriptedClientBuilder::new());
        manager.get_or_create(request("s1")).await;
        assert!(manager
            .idle_sessions(Duration::from_secs(300))
            .await
            .is_empty());
        assert_eq!(
            manager.idle_sessions(Duration::from_nanos(0)).await,
            vec!["s1".to_string()]
        );

        manager.close_session("s1").await;
        assert_eq!(manager.active_count().await, 0);
    }

    #[tokio::test]
    async fn tool_input_streaming_routes_by_block_index() {
        let manager = make_manager(ScriptedClientBuilder::new().turn(emit_all(vec![
            ClientMessage::BlockStart {
                index: 1,
                block: BlockOpen::ToolUse {
                    id: "toolu_1".into(),
                    name: "Write".into(),
                },
            },
            ClientMessage::BlockDelta {
                index: 1,
                delta: ContentDelta::InputJson("{\"file_path\":".into()),
            },
            ClientMessage::BlockDelta {
                index: 1,
                delta: ContentDelta::InputJson("\"hello.py\"}".into()),
            },
            ClientMessage::BlockStop { index: 1 },
            ClientMessage::Assistant {
                blocks: vec![AssistantBlock::ToolUse {
                    id: "toolu_1".into(),
                    name: "Write".into(),
                    input: json!({"file_path": "hello.py"}),
                }],
            },
            ClientMessage::ToolResult {
                tool_use_id: "toolu_1".into(),
                content: json!("ok"),
                is_error: false,
            },
            ClientMessage::Result(TurnResult::default()),
        ])));
        let session = manager.get_or_create(request("s1")).await;
        let events = collect(manager.stream(session, "write it".into(), None)).await;

        let kinds: Vec<EventType> = events.iter().map(|e| e.kind).collect();
        assert_eq!(
            kinds,
            vec![
                EventType::System,
                EventType::ToolInputStart,
                EventType::ToolInputDelta,
                EventType::ToolInputDelta,
                EventType::ToolInputEnd,
                EventType::ToolUse,
                EventType::ToolResult,
                EventType::Done,
            ]
        );
        // The deltas carry the tool id and concatenate to the full input.
        let joined: String = events
            .iter()
            .filter(|e| e.kind == EventType::ToolInputDelta)
            .map(|e| e.content.as_str().unwrap())
            .collect();
        assert_eq!(joined, "{\"file_path\":\"hello.py\"}");
        assert!(events
            .iter()
            .filter(|e| e.kind == EventType::ToolInputDelta)
            .all(|e| e.id.as_deref() == Some("toolu_1")));
    }
}
