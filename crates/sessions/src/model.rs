//! Session and message data model for multi-turn conversations.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use ov_domain::config::PermissionMode;

/// Title sentinel for freshly created sessions. While a session still
/// carries this title, it is auto-derived from the first user message.
pub const DEFAULT_TITLE: &str = "New Chat";

const TITLE_MAX_CHARS: usize = 50;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Blocks
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolStatus {
    Running,
    Success,
    Error,
}

/// A typed element of an assistant turn, kept in emission order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Block {
    Text { text: String },
    Thinking { thinking: String },
    ToolUse {
        id: String,
        name: String,
        input: Value,
        #[serde(skip_serializing_if = "Option::is_none")]
        result: Option<Value>,
        status: ToolStatus,
    },
    Plan { todos: Value },
    AskUser {
        request_id: String,
        questions: Value,
    },
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Messages
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
}

/// A single message in a session. Immutable once stored.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionMessage {
    pub id: String,
    pub role: Role,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    /// Structured rendering of an assistant turn (tool use, thinking, …).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub blocks: Option<Vec<Block>>,
}

impl SessionMessage {
    pub fn new(role: Role, content: impl Into<String>, blocks: Option<Vec<Block>>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            role,
            content: content.into(),
            timestamp: Utc::now(),
            blocks,
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content, None)
    }

    pub fn assistant(content: impl Into<String>, blocks: Vec<Block>) -> Self {
        let blocks = if blocks.is_empty() { None } else { Some(blocks) };
        Self::new(Role::Assistant, content, blocks)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Session
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A durable conversation: ordered transcript plus the configuration
/// snapshot and resumption token of the last turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub title: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub messages: Vec<SessionMessage>,
    /// Opaque client token identifying the continuable conversation.
    #[serde(default)]
    pub resume_token: Option<String>,
    #[serde(default)]
    pub last_model_name: Option<String>,
    #[serde(default)]
    pub last_endpoint_name: Option<String>,
    #[serde(default)]
    pub last_permission_mode: Option<PermissionMode>,
}

impl Session {
    pub fn create(title: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            title: title.into(),
            created_at: now,
            updated_at: now,
            messages: Vec::new(),
            resume_token: None,
            last_model_name: None,
            last_endpoint_name: None,
            last_permission_mode: None,
        }
    }

    /// Append a message and bump the updated timestamp (monotonically).
    ///
    /// While the title still equals the default sentinel, the first user
    /// message derives it.
    pub fn add_message(&mut self, message: SessionMessage) {
        if self.title == DEFAULT_TITLE
            && message.role == Role::User
            && !message.content.is_empty()
        {
            self.title = derive_title(&message.content);
        }
        self.messages.push(message);
        self.touch();
    }

    /// Bump `updated_at`, never moving it backwards.
    pub fn touch(&mut self) {
        self.updated_at = self.updated_at.max(Utc::now());
    }

    /// Metadata summary without the transcript, for list views.
    pub fn to_summary(&self) -> SessionSummary {
        SessionSummary {
            id: self.id.clone(),
            title: self.title.clone(),
            created_at: self.created_at,
            updated_at: self.updated_at,
            message_count: self.messages.len(),
            last_model_name: self.last_model_name.clone(),
            last_endpoint_name: self.last_endpoint_name.clone(),
            last_permission_mode: self.last_permission_mode,
        }
    }
}

fn derive_title(content: &str) -> String {
    let mut title: String = content.chars().take(TITLE_MAX_CHARS).collect();
    title = title.trim().to_owned();
    // The suffix is gated on the raw length, so a message that only shrank
    // under the cap by trimming still reads as truncated.
    if content.chars().count() > TITLE_MAX_CHARS {
        title.push_str("...");
    }
    title
}

/// Session metadata returned by `list` — never includes the transcript.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSummary {
    pub id: String,
    pub title: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub message_count: usize,
    #[serde(default)]
    pub last_model_name: Option<String>,
    #[serde(default)]
    pub last_endpoint_name: Option<String>,
    #[serde(default)]
    pub last_permission_mode: Option<PermissionMode>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn title_derives_from_first_user_message() {
        let mut session = Session::create(DEFAULT_TITLE);
        session.add_message(SessionMessage::user("Write a haiku about rain"));
        assert_eq!(session.title, "Write a haiku about rain");

        // A second user message does not re-derive.
        session.add_message(SessionMessage::user("Another topic entirely"));
        assert_eq!(session.title, "Write a haiku about rain");
    }

    #[test]
    fn long_title_is_truncated() {
        let mut session = Session::create(DEFAULT_TITLE);
        session.add_message(SessionMessage::user("x".repeat(80)));
        assert!(session.title.ends_with("..."));
        assert!(session.title.chars().count() <= TITLE_MAX_CHARS + 3);
    }

    #[test]
    fn trailing_whitespace_counts_toward_truncation() {
        // 58 raw chars, but only 48 survive the trim: still truncated.
        let mut session = Session::create(DEFAULT_TITLE);
        let content = format!("{}{}", "y".repeat(48), " ".repeat(10));
        session.add_message(SessionMessage::user(content));
        assert_eq!(session.title, format!("{}...", "y".repeat(48)));
    }

    #[test]
    fn custom_title_is_never_derived() {
        let mut session = Session::create("My project");
        session.add_message(SessionMessage::user("hello"));
        assert_eq!(session.title, "My project");
    }

    #[test]
    fn assistant_title_does_not_derive() {
        let mut session = Session::create(DEFAULT_TITLE);
        session.add_message(SessionMessage::assistant("hi there", vec![]));
        assert_eq!(session.title, DEFAULT_TITLE);
    }

    #[test]
    fn updated_at_is_monotonic() {
        let mut session = Session::create(DEFAULT_TITLE);
        let before = session.updated_at;
        session.add_message(SessionMessage::user("hello"));
        assert!(session.updated_at >= before);
    }

    #[test]
    fn session_serde_roundtrip() {
        let mut session = Session::create(DEFAULT_TITLE);
        session.resume_token = Some("tok-abc".into());
        session.last_model_name = Some("claude-sonnet-4-5".into());
        session.add_message(SessionMessage::user("hello"));
        session.add_message(SessionMessage::assistant(
            "done",
            vec![Block::ToolUse {
                id: "t1".into(),
                name: "Write".into(),
                input: json!({"file_path": "hello.py"}),
                result: Some(json!("ok")),
                status: ToolStatus::Success,
            }],
        ));

        let raw = serde_json::to_string(&session).unwrap();
        let back: Session = serde_json::from_str(&raw).unwrap();
        let raw_again = serde_json::to_string(&back).unwrap();
        assert_eq!(raw, raw_again);
    }

    #[test]
    fn block_kind_tags() {
        let block = Block::AskUser {
            request_id: "r1".into(),
            questions: json!([{"question": "Which file?"}]),
        };
        let value = serde_json::to_value(&block).unwrap();
        assert_eq!(value["kind"], "ask_user");
    }
}
