//! Turn assembler — folds a turn's aggregated events into the ordered block
//! list stored on the assistant message.
//!
//! Only aggregated events participate; the incremental `*_start/delta/end`
//! triples are a client-rendering concern and never reach the transcript.

use serde_json::Value;

use ov_domain::event::{EventType, StreamEvent};

use crate::model::{Block, SessionMessage, ToolStatus};

/// Accumulates one assistant turn. Feed it every event of the turn, then
/// call [`TurnAssembler::into_message`].
#[derive(Default)]
pub struct TurnAssembler {
    text: String,
    blocks: Vec<Block>,
}

impl TurnAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ingest one canonical event. Non-aggregated events are ignored.
    pub fn apply(&mut self, event: &StreamEvent) {
        match event.kind {
            EventType::Text => {
                if let Some(text) = event.content.as_str() {
                    if !self.text.is_empty() {
                        self.text.push('\n');
                    }
                    self.text.push_str(text);
                    self.blocks.push(Block::Text { text: text.to_owned() });
                }
            }
            EventType::Thinking => {
                if let Some(thinking) = event.content.as_str() {
                    self.blocks.push(Block::Thinking {
                        thinking: thinking.to_owned(),
                    });
                }
            }
            EventType::ToolUse => {
                let id = str_field(&event.content, "id");
                let name = str_field(&event.content, "name");
                let input = event.content.get("input").cloned().unwrap_or(Value::Null);
                self.blocks.push(Block::ToolUse {
                    id,
                    name,
                    input,
                    result: None,
                    status: ToolStatus::Running,
                });
            }
            EventType::ToolResult => {
                let tool_use_id = str_field(&event.content, "tool_use_id");
                let result = event.content.get("content").cloned().unwrap_or(Value::Null);
                let is_error = event
                    .content
                    .get("is_error")
                    .and_then(Value::as_bool)
                    .unwrap_or(false);
                self.apply_tool_result(&tool_use_id, result, is_error);
            }
            EventType::Todos => {
                let todos = event.content.get("todos").cloned().unwrap_or(Value::Null);
                self.blocks.push(Block::Plan { todos });
            }
            EventType::AskUser => {
                let request_id = str_field(&event.content, "request_id");
                let questions = event
                    .content
                    .get("questions")
                    .cloned()
                    .unwrap_or(Value::Null);
                self.blocks.push(Block::AskUser {
                    request_id,
                    questions,
                });
            }
            _ => {}
        }
    }

    /// A result mutates exactly the running tool block whose id matches.
    /// Orphan results (no matching call) append a new block.
    fn apply_tool_result(&mut self, tool_use_id: &str, result_value: Value, is_error: bool) {
        let status = if is_error {
            ToolStatus::Error
        } else {
            ToolStatus::Success
        };

        for block in self.blocks.iter_mut().rev() {
            if let Block::ToolUse { id, result, status: s, .. } = block {
                if id == tool_use_id {
                    *result = Some(result_value);
                    *s = status;
                    return;
                }
            }
        }

        self.blocks.push(Block::ToolUse {
            id: tool_use_id.to_owned(),
            name: "unknown".into(),
            input: Value::Null,
            result: Some(result_value),
            status,
        });
    }

    pub fn is_empty(&self) -> bool {
        self.text.is_empty() && self.blocks.is_empty()
    }

    /// Produce the assistant message for this turn, or `None` when the turn
    /// contributed nothing worth persisting.
    pub fn into_message(self) -> Option<SessionMessage> {
        if self.is_empty() {
            return None;
        }
        Some(SessionMessage::assistant(self.text, self.blocks))
    }
}

fn str_field(content: &Value, key: &str) -> String {
    content
        .get(key)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_owned()
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
