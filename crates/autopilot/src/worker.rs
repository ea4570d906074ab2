//! Worker implementations.
//!
//! A [`Worker`] runs one LLM invocation against a workspace and returns the
//! raw [`LlmResult`]. [`ClientWorker`] drives a real agent client through
//! the shared [`ov_client`] boundary; [`StubWorker`] is deterministic, for
//! tests and dry runs. The Checker is a Worker with its own configuration.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};

use ov_client::{
    AgentClient, AssistantBlock, ClientFactory, ClientMessage, ClientOptions,
};
use ov_domain::config::{EndpointConfig, PermissionMode};
use ov_domain::error::Result;

use crate::events::{emit, AutopilotEvent, EmitFn};
use crate::models::{LlmResult, WorkerConfig};

const TOOL_INPUT_PREVIEW_CHARS: usize = 500;
const TOOL_RESULT_PREVIEW_CHARS: usize = 1000;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Worker trait
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[async_trait]
pub trait Worker: Send + Sync {
    /// Run one invocation. `resume_token` continues a previous conversation
    /// instead of starting a new one.
    async fn run(
        &self,
        config: &WorkerConfig,
        prompt: &str,
        workspace: &Path,
        emitter: &Option<EmitFn>,
        resume_token: Option<&str>,
    ) -> Result<LlmResult>;
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Placeholder replacement
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Replace `{{TIME}}` and `{{CWD}}` in the prompt. Literal substring
/// replacement, performed exactly once before dispatch.
pub fn replace_placeholders(prompt: &str, config: &WorkerConfig, workspace: &Path) -> String {
    let cwd = config
        .cwd
        .clone()
        .unwrap_or_else(|| workspace.display().to_string());
    let now = Utc::now().format("%Y-%m-%d %H:%M UTC").to_string();
    prompt.replace("{{TIME}}", &now).replace("{{CWD}}", &cwd)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Stub worker
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Deterministic worker echoing the resume token, for exercising the cycle
/// loop without a model.
pub struct StubWorker;

#[async_trait]
impl Worker for StubWorker {
    async fn run(
        &self,
        _config: &WorkerConfig,
        prompt: &str,
        _workspace: &Path,
        _emitter: &Option<EmitFn>,
        resume_token: Option<&str>,
    ) -> Result<LlmResult> {
        let preview: String = prompt.chars().take(100).collect();
        let session_token = resume_token
            .map(str::to_owned)
            .unwrap_or_else(|| format!("stub-session-{}", Utc::now().timestamp_millis()));
        Ok(LlmResult {
            text: format!("Stub response for prompt: {preview}..."),
            session_token: Some(session_token),
            ..Default::default()
        })
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Client-backed worker
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Runs the invocation through an agent client built by the injected
/// factory. The autonomous path threads the session token inside the
/// [`LlmResult`]; it never surfaces it as a `system` event.
pub struct ClientWorker {
    factory: ClientFactory,
    endpoints: Vec<EndpointConfig>,
}

impl ClientWorker {
    pub fn new(factory: ClientFactory, endpoints: Vec<EndpointConfig>) -> Self {
        Self { factory, endpoints }
    }

    fn build_options(
        &self,
        config: &WorkerConfig,
        workspace: &Path,
        resume_token: Option<&str>,
    ) -> ClientOptions {
        let endpoint = config
            .endpoint
            .as_deref()
            .and_then(|name| self.endpoints.iter().find(|e| e.name == name))
            .cloned();
        ClientOptions {
            endpoint,
            model: config.model.clone(),
            cwd: Some(
                config
                    .cwd
                    .clone()
                    .unwrap_or_else(|| workspace.display().to_string()),
            ),
            system_prompt: config.system_prompt.clone(),
            // Autonomous workers run unattended; there is no user to ask.
            permission_mode: config
                .permission_mode
                .unwrap_or(PermissionMode::BypassPermissions),
            resume_token: resume_token.map(str::to_owned),
            allowed_tools: config.tools_allow.clone(),
            disallowed_tools: config.tools_block.clone(),
            max_turns: config.max_turns,
            max_output_tokens: config.max_output_tokens,
            max_thinking_tokens: config.max_thinking_tokens,
            tool_servers: config.tool_servers.clone(),
            include_partial_messages: false,
            permission_handler: None,
        }
    }
}

#[async_trait]
impl Worker for ClientWorker {
    async fn run(
        &self,
        config: &WorkerConfig,
        prompt: &str,
        workspace: &Path,
        emitter: &Option<EmitFn>,
        resume_token: Option<&str>,
    ) -> Result<LlmResult> {
        let options = self.build_options(config, workspace, resume_token);
        let final_prompt = replace_placeholders(prompt, config, workspace);

        if let Some(token) = resume_token {
            tracing::info!(worker = %config.id, token, "resuming worker conversation");
        }

        let mut client: Box<dyn AgentClient> = (self.factory)(options);
        client.connect().await?;
        tracing::info!(
            worker = %config.id,
            prompt_chars = final_prompt.len(),
            resume = resume_token.is_some(),
            "worker query dispatched"
        );
        client.query(&final_prompt).await?;

        let mut text_parts: Vec<String> = Vec::new();
        let mut tool_calls: Vec<Value> = Vec::new();
        let mut tool_results: Vec<Value> = Vec::new();
        let mut session_token = resume_token.map(str::to_owned);
        let mut usage = None;

        while let Some(message) = client.next_message().await? {
            match message {
                ClientMessage::Init { session_token: token, .. } => {
                    session_token = Some(token);
                }
                ClientMessage::Assistant { blocks } => {
                    for block in blocks {
                        match block {
                            AssistantBlock::Text { text } => text_parts.push(text),
                            AssistantBlock::Thinking { .. } => {}
                            AssistantBlock::ToolUse { id, name, input } => {
                                tracing::info!(worker = %config.id, tool = %name, "worker tool call");
                                emit(
                                    emitter,
                                    AutopilotEvent::WorkerToolCall {
                                        tool_name: name.clone(),
                                        tool_id: id.clone(),
                                        input: preview_value(&input, TOOL_INPUT_PREVIEW_CHARS),
                                    },
                                );
                                tool_calls.push(json!({
                                    "id": id,
                                    "name": name,
                                    "input": input,
                                }));
                            }
                        }
                    }
                }
                ClientMessage::ToolResult {
                    tool_use_id,
                    content,
                    is_error,
                } => {
                    emit(
                        emitter,
                        AutopilotEvent::WorkerToolResult {
                            tool_id: tool_use_id.clone(),
                            content: preview_value(&content, TOOL_RESULT_PREVIEW_CHARS),
                            is_error,
                        },
                    );
                    tool_results.push(json!({
                        "tool_use_id": tool_use_id,
                        "content": content,
                        "is_error": is_error,
                    }));
                }
                ClientMessage::Result(result) => {
                    usage = result.usage;
                    break;
                }
                // Streaming deltas and todos are not collected in
                // autonomous mode.
                _ => {}
            }
        }
        client.close().await?;

        let text = text_parts.concat().trim().to_owned();
        tracing::info!(
            worker = %config.id,
            tool_calls = tool_calls.len(),
            output_chars = text.len(),
            "worker completed"
        );

        Ok(LlmResult {
            text,
            tool_calls,
            tool_results,
            session_token,
            usage,
            error: None,
        })
    }
}

/// Truncate string values for event previews; other values pass through.
fn preview_value(value: &Value, max_chars: usize) -> Value {
    match value {
        Value::String(s) if s.chars().count() > max_chars => {
            let truncated: String = s.chars().take(max_chars).collect();
            Value::String(format!("{truncated}..."))
        }
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), preview_value(v, max_chars)))
                .collect(),
        ),
        other => other.clone(),
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
