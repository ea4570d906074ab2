//! The LLM-client boundary.
//!
//! The actual agent client (the process that talks to the model and runs
//! tools) is an external collaborator. This crate defines the interface the
//! runtime consumes: a streaming query→message channel ([`AgentClient`]),
//! the message surface it delivers ([`ClientMessage`]), the options used to
//! construct one ([`ClientOptions`]), and the host callback the client uses
//! to ask for tool permission mid-turn ([`PermissionHandler`]).
//!
//! [`scripted::ScriptedClient`] is a deterministic in-process implementation
//! used by tests and dry runs.

pub mod scripted;
pub mod subprocess;

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use ov_domain::config::{EndpointConfig, PermissionMode, ToolServerConfig};
use ov_domain::error::Result;
use ov_domain::event::Usage;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Client options
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Everything needed to construct one agent client instance.
///
/// Built by the session manager (interactive mode) or the autopilot worker
/// (autonomous mode) from the per-session configuration.
#[derive(Clone, Default)]
pub struct ClientOptions {
    pub endpoint: Option<EndpointConfig>,
    pub model: Option<String>,
    pub cwd: Option<String>,
    pub system_prompt: Option<String>,
    pub permission_mode: PermissionMode,
    /// Opaque token of a previous conversation to resume.
    pub resume_token: Option<String>,
    pub allowed_tools: Vec<String>,
    pub disallowed_tools: Vec<String>,
    pub max_turns: u32,
    /// 0 means no explicit bound.
    pub max_output_tokens: u64,
    /// 0 means no explicit bound.
    pub max_thinking_tokens: u64,
    pub tool_servers: Vec<ToolServerConfig>,
    /// Emit incremental block deltas in addition to aggregated messages.
    pub include_partial_messages: bool,
    /// Host callback consulted for tool permission when the permission mode
    /// is `default`, and for the ask-user tool in every mode.
    pub permission_handler: Option<Arc<dyn PermissionHandler>>,
}

impl std::fmt::Debug for ClientOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientOptions")
            .field("endpoint", &self.endpoint.as_ref().map(|e| &e.name))
            .field("model", &self.model)
            .field("cwd", &self.cwd)
            .field("permission_mode", &self.permission_mode)
            .field("resume_token", &self.resume_token)
            .field("max_turns", &self.max_turns)
            .field("has_permission_handler", &self.permission_handler.is_some())
            .finish()
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Permission handler
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Decision returned by the host when the client asks to use a tool.
#[derive(Debug, Clone)]
pub enum PermissionDecision {
    Allow {
        /// Replacement input, e.g. the user's answers merged into the
        /// ask-user tool invocation.
        updated_input: Option<Value>,
    },
    Deny { message: String },
}

impl PermissionDecision {
    pub fn allow() -> Self {
        Self::Allow { updated_input: None }
    }

    pub fn deny(message: impl Into<String>) -> Self {
        Self::Deny {
            message: message.into(),
        }
    }
}

/// Host-side callback the client consults mid-turn.
#[async_trait]
pub trait PermissionHandler: Send + Sync {
    async fn can_use_tool(&self, tool_name: &str, input: &Value) -> PermissionDecision;
}

/// Tool name the client uses when the agent asks the end user a question.
pub const ASK_USER_TOOL: &str = "AskUserQuestion";

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Client messages
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Opening of a streamed content block.
#[derive(Debug, Clone)]
pub enum BlockOpen {
    Text,
    Thinking,
    ToolUse { id: String, name: String },
}

/// Incremental content for an open block.
#[derive(Debug, Clone)]
pub enum ContentDelta {
    Text(String),
    Thinking(String),
    /// Partial JSON fragment of a tool invocation's arguments.
    InputJson(String),
}

/// A complete block inside an aggregated assistant message.
#[derive(Debug, Clone)]
pub enum AssistantBlock {
    Text { text: String },
    Thinking { thinking: String },
    ToolUse { id: String, name: String, input: Value },
}

/// Terminal message of a turn.
#[derive(Debug, Clone, Default)]
pub struct TurnResult {
    pub is_error: bool,
    pub error: Option<String>,
    pub usage: Option<Usage>,
    pub cost_usd: Option<f64>,
    pub duration_ms: Option<u64>,
}

/// One message delivered by the client during a turn.
#[derive(Debug, Clone)]
pub enum ClientMessage {
    /// First message of a turn: the client's session token (the resumption
    /// identity of this conversation) and any advertised slash commands.
    Init {
        session_token: String,
        slash_commands: Vec<String>,
    },
    /// Streamed block lifecycle, keyed by block index within the turn.
    BlockStart { index: usize, block: BlockOpen },
    BlockDelta { index: usize, delta: ContentDelta },
    BlockStop { index: usize },
    /// Aggregated assistant message (always sent, even when streamed).
    Assistant { blocks: Vec<AssistantBlock> },
    /// Result of a tool execution, referencing the originating call.
    ToolResult {
        tool_use_id: String,
        content: Value,
        is_error: bool,
    },
    /// Structured plan / todo-list update.
    Todos { todos: Value },
    /// End of turn.
    Result(TurnResult),
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Agent client trait
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A handle to interrupt an in-flight turn from another task, without
/// holding the client itself.
///
/// The handle stays valid across turns: after servicing an interrupt the
/// client re-arms it, so a later turn starts uncancelled.
#[derive(Clone, Default)]
pub struct InterruptHandle {
    inner: Arc<parking_lot::Mutex<CancellationToken>>,
}

impl InterruptHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn interrupt(&self) {
        self.inner.lock().cancel();
    }

    pub fn is_interrupted(&self) -> bool {
        self.inner.lock().is_cancelled()
    }

    /// Replace the cancelled token so the next turn starts fresh. Called by
    /// the client once an interrupt has been serviced.
    pub fn rearm(&self) {
        *self.inner.lock() = CancellationToken::new();
    }

    /// Wait until an interrupt is requested.
    pub async fn cancelled(&self) {
        let token = self.inner.lock().clone();
        token.cancelled().await;
    }
}

/// A streaming agent client: `query` sends a prompt, then `next_message`
/// yields the turn's messages until the terminal [`ClientMessage::Result`],
/// after which it returns `None` until the next query.
#[async_trait]
pub trait AgentClient: Send {
    /// Establish the underlying connection. Must be called before the first
    /// query; calling it again is a no-op.
    async fn connect(&mut self) -> Result<()>;

    /// Push a new permission mode to the client, applied from the next
    /// message on.
    async fn set_permission_mode(&mut self, mode: PermissionMode) -> Result<()>;

    /// Send a user prompt, starting a turn.
    async fn query(&mut self, prompt: &str) -> Result<()>;

    /// Receive the next message of the in-flight turn.
    async fn next_message(&mut self) -> Result<Option<ClientMessage>>;

    /// Handle that interrupts the in-flight turn from another task.
    fn interrupt_handle(&self) -> InterruptHandle;

    /// Tear down the connection.
    async fn close(&mut self) -> Result<()>;
}

/// Factory constructing client instances; injected at startup so the
/// runtime never names a concrete client implementation.
pub type ClientFactory = Arc<dyn Fn(ClientOptions) -> Box<dyn AgentClient> + Send + Sync>;
