//! Canonical event model — the single event vocabulary shared by the
//! interactive stream, the task runner's event log, and the client channel.
//!
//! Every turn is translated into this taxonomy regardless of how the
//! underlying LLM client delivered it. Streaming clients receive the
//! incremental `*_start` / `*_delta` / `*_end` triples; the aggregated
//! fallbacks (`text`, `thinking`, `tool_use`, `tool_result`) are always
//! emitted afterwards so clients that ignore deltas still see whole blocks.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Event type
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    /// Turn startup: carries the external session token and any
    /// server-advertised slash commands.
    System,

    // Incremental text events.
    TextStart,
    TextDelta,
    TextEnd,

    // Incremental thinking events.
    ThinkingStart,
    ThinkingDelta,
    ThinkingEnd,

    // Incremental tool-argument events (streaming JSON fragments).
    ToolInputStart,
    ToolInputDelta,
    ToolInputEnd,

    // Aggregated fallbacks — always emitted, even when deltas were sent.
    Text,
    Thinking,
    ToolUse,
    ToolResult,

    /// Structured plan / todo-list update.
    Todos,

    /// Suspension: the agent is asking the user a question.
    AskUser,
    /// Outcome of an `ask_user` suspension (answered / timeout / skipped).
    AskUserResult,
    /// Suspension: the agent wants to invoke a tool.
    PermissionRequest,

    /// Terminal error for this turn.
    Error,
    /// Terminal success for this turn; carries aggregated usage.
    Done,
}

impl EventType {
    /// Terminal events end a turn and flip the task execution status.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Error)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Usage
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Token usage aggregated over a turn.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    #[serde(default)]
    pub total_tokens: u64,
}

impl Usage {
    pub fn add(&mut self, other: &Usage) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
        self.total_tokens += other.total_tokens;
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Stream event
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// One event in a session's stream.
///
/// Wire shape: `{type, content, metadata, id?, usage?}`. On multiplexed
/// channels `metadata.session_id` is always present.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamEvent {
    #[serde(rename = "type")]
    pub kind: EventType,
    #[serde(default)]
    pub content: Value,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
}

impl StreamEvent {
    pub fn new(kind: EventType, content: Value) -> Self {
        Self {
            kind,
            content,
            metadata: Map::new(),
            id: None,
            usage: None,
        }
    }

    /// Shorthand for a terminal error event.
    pub fn error(message: impl Into<String>) -> Self {
        Self::new(EventType::Error, Value::String(message.into()))
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_usage(mut self, usage: Usage) -> Self {
        self.usage = Some(usage);
        self
    }

    pub fn with_meta(mut self, key: &str, value: Value) -> Self {
        self.metadata.insert(key.to_owned(), value);
        self
    }

    /// Stamp the owning session id into the event metadata.
    pub fn with_session(mut self, session_id: &str) -> Self {
        self.metadata
            .insert("session_id".into(), Value::String(session_id.to_owned()));
        self
    }

    pub fn session_id(&self) -> Option<&str> {
        self.metadata.get("session_id").and_then(Value::as_str)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Buffered event
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A stream event as stored in the per-session event log, stamped with a
/// server-assigned millisecond timestamp at append time. Never mutated once
/// appended.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BufferedEvent {
    #[serde(flatten)]
    pub event: StreamEvent,
    pub timestamp: i64,
}

impl BufferedEvent {
    pub fn stamp(event: StreamEvent) -> Self {
        Self {
            event,
            timestamp: Utc::now().timestamp_millis(),
        }
    }

    pub fn kind(&self) -> EventType {
        self.event.kind
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
