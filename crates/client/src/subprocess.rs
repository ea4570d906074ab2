//! Agent client backed by an external process speaking line-delimited JSON
//! over stdio.
//!
//! The gateway writes control lines (`initialize`, `query`,
//! `set_permission_mode`, `interrupt`, `permission_response`, `shutdown`)
//! to the process's stdin and reads one JSON message per stdout line. A
//! `permission_request` line is answered inline by consulting the
//! configured [`PermissionHandler`]; every other line maps onto a
//! [`ClientMessage`].

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdout, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use ov_domain::config::{ClientConfig, PermissionMode};
use ov_domain::error::{Error, Result};
use ov_domain::event::Usage;

use crate::{
    AgentClient, AssistantBlock, BlockOpen, ClientFactory, ClientMessage, ClientOptions,
    ContentDelta, InterruptHandle, PermissionDecision, TurnResult,
};

const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Wire protocol
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WireMessage {
    Init {
        #[serde(default)]
        session_token: String,
        #[serde(default)]
        slash_commands: Vec<String>,
    },
    BlockStart {
        index: usize,
        block: WireBlock,
    },
    BlockDelta {
        index: usize,
        delta: WireDelta,
    },
    BlockStop {
        index: usize,
    },
    Assistant {
        #[serde(default)]
        blocks: Vec<WireAssistantBlock>,
    },
    ToolResult {
        tool_use_id: String,
        #[serde(default)]
        content: Value,
        #[serde(default)]
        is_error: bool,
    },
    Todos {
        todos: Value,
    },
    Result {
        #[serde(default)]
        is_error: bool,
        #[serde(default)]
        error: Option<String>,
        #[serde(default)]
        usage: Option<Usage>,
        #[serde(default)]
        cost_usd: Option<f64>,
        #[serde(default)]
        duration_ms: Option<u64>,
    },
    /// The process asks the host whether a tool may run.
    PermissionRequest {
        id: u64,
        tool_name: String,
        #[serde(default)]
        input: Value,
    },
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WireBlock {
    Text,
    Thinking,
    ToolUse { id: String, name: String },
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WireDelta {
    TextDelta { text: String },
    ThinkingDelta { thinking: String },
    InputJsonDelta { partial_json: String },
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WireAssistantBlock {
    Text { text: String },
    Thinking { thinking: String },
    ToolUse { id: String, name: String, input: Value },
}

/// Subset of the options shipped in the `initialize` control line.
#[derive(Serialize)]
struct WireOptions<'a> {
    model: &'a Option<String>,
    endpoint: Option<&'a str>,
    api_key_env: Option<&'a str>,
    cwd: &'a Option<String>,
    system_prompt: &'a Option<String>,
    permission_mode: &'a str,
    resume: &'a Option<String>,
    allowed_tools: &'a [String],
    disallowed_tools: &'a [String],
    max_turns: u32,
    max_output_tokens: u64,
    max_thinking_tokens: u64,
    tool_servers: &'a [ov_domain::config::ToolServerConfig],
    include_partial_messages: bool,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Client
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct SubprocessClient {
    config: ClientConfig,
    options: ClientOptions,
    child: Option<Child>,
    control: Option<mpsc::UnboundedSender<String>>,
    lines: Option<Lines<BufReader<ChildStdout>>>,
    writer: Option<JoinHandle<()>>,
    watcher: Option<JoinHandle<()>>,
    interrupt: InterruptHandle,
    in_turn: bool,
}

impl SubprocessClient {
    pub fn new(config: ClientConfig, options: ClientOptions) -> Self {
        Self {
            config,
            options,
            child: None,
            control: None,
            lines: None,
            writer: None,
            watcher: None,
            interrupt: InterruptHandle::new(),
            in_turn: false,
        }
    }

    /// Factory for [`crate::ClientFactory`] injection.
    pub fn factory(config: ClientConfig) -> ClientFactory {
        std::sync::Arc::new(move |options: ClientOptions| {
            Box::new(SubprocessClient::new(config.clone(), options)) as Box<dyn AgentClient>
        })
    }

    fn send_control(&self, value: Value) -> Result<()> {
        let control = self
            .control
            .as_ref()
            .ok_or_else(|| Error::Client("agent process not started".into()))?;
        control
            .send(value.to_string())
            .map_err(|_| Error::Client("agent process stdin closed".into()))
    }

    fn initialize_line(&self) -> Value {
        let endpoint = self.options.endpoint.as_ref();
        json!({
            "type": "initialize",
            "options": WireOptions {
                model: &self.options.model,
                endpoint: endpoint.and_then(|e| e.base_url.as_deref()),
                api_key_env: endpoint.and_then(|e| e.api_key_env.as_deref()),
                cwd: &self.options.cwd,
                system_prompt: &self.options.system_prompt,
                permission_mode: self.options.permission_mode.as_str(),
                resume: &self.options.resume_token,
                allowed_tools: &self.options.allowed_tools,
                disallowed_tools: &self.options.disallowed_tools,
                max_turns: self.options.max_turns,
                max_output_tokens: self.options.max_output_tokens,
                max_thinking_tokens: self.options.max_thinking_tokens,
                tool_servers: &self.options.tool_servers,
                include_partial_messages: self.options.include_partial_messages,
            },
        })
    }

    async fn answer_permission_request(
        &mut self,
        id: u64,
        tool_name: &str,
        input: &Value,
    ) -> Result<()> {
        let decision = match &self.options.permission_handler {
            Some(handler) => handler.can_use_tool(tool_name, input).await,
            None => PermissionDecision::deny("no permission handler configured"),
        };
        let decision_json = match decision {
            PermissionDecision::Allow { updated_input } => json!({
                "behavior": "allow",
                "updated_input": updated_input,
            }),
            PermissionDecision::Deny { message } => json!({
                "behavior": "deny",
                "message": message,
            }),
        };
        self.send_control(json!({
            "type": "permission_response",
            "id": id,
            "decision": decision_json,
        }))
    }
}

fn map_wire(message: WireMessage) -> ClientMessage {
    match message {
        WireMessage::Init {
            session_token,
            slash_commands,
        } => ClientMessage::Init {
            session_token,
            slash_commands,
        },
        WireMessage::BlockStart { index, block } => ClientMessage::BlockStart {
            index,
            block: match block {
                WireBlock::Text => BlockOpen::Text,
                WireBlock::Thinking => BlockOpen::Thinking,
                WireBlock::ToolUse { id, name } => BlockOpen::ToolUse { id, name },
            },
        },
        WireMessage::BlockDelta { index, delta } => ClientMessage::BlockDelta {
            index,
            delta: match delta {
                WireDelta::TextDelta { text } => ContentDelta::Text(text),
                WireDelta::ThinkingDelta { thinking } => ContentDelta::Thinking(thinking),
                WireDelta::InputJsonDelta { partial_json } => {
                    ContentDelta::InputJson(partial_json)
                }
            },
        },
        WireMessage::BlockStop { index } => ClientMessage::BlockStop { index },
        WireMessage::Assistant { blocks } => ClientMessage::Assistant {
            blocks: blocks
                .into_iter()
                .map(|block| match block {
                    WireAssistantBlock::Text { text } => AssistantBlock::Text { text },
                    WireAssistantBlock::Thinking { thinking } => {
                        AssistantBlock::Thinking { thinking }
                    }
                    WireAssistantBlock::ToolUse { id, name, input } => {
                        AssistantBlock::ToolUse { id, name, input }
                    }
                })
                .collect(),
        },
        WireMessage::ToolResult {
            tool_use_id,
            content,
            is_error,
        } => ClientMessage::ToolResult {
            tool_use_id,
            content,
            is_error,
        },
        WireMessage::Todos { todos } => ClientMessage::Todos { todos },
        WireMessage::Result {
            is_error,
            error,
            usage,
            cost_usd,
            duration_ms,
        } => ClientMessage::Result(TurnResult {
            is_error,
            error,
            usage,
            cost_usd,
            duration_ms,
        }),
        // Handled before mapping; unreachable by construction.
        WireMessage::PermissionRequest { .. } => ClientMessage::Result(TurnResult::default()),
    }
}

#[async_trait]
impl AgentClient for SubprocessClient {
    async fn connect(&mut self) -> Result<()> {
        if self.child.is_some() {
            return Ok(());
        }

        let mut command = Command::new(&self.config.command);
        command
            .args(&self.config.args)
            .envs(&self.config.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        if let Some(cwd) = &self.options.cwd {
            command.current_dir(cwd);
        }

        let mut child = command.spawn().map_err(|e| {
            Error::Client(format!("failed to spawn {}: {e}", self.config.command))
        })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::Client("agent process has no stdin".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Client("agent process has no stdout".into()))?;
        self.lines = Some(BufReader::new(stdout).lines());

        // Writer task owns stdin; all control lines funnel through it.
        let (control_tx, mut control_rx) = mpsc::unbounded_channel::<String>();
        let mut stdin = stdin;
        self.writer = Some(tokio::spawn(async move {
            while let Some(line) = control_rx.recv().await {
                if stdin.write_all(line.as_bytes()).await.is_err() {
                    break;
                }
                if stdin.write_all(b"\n").await.is_err() {
                    break;
                }
            }
        }));

        // Watcher forwards interrupts to the process.
        let interrupt = self.interrupt.clone();
        let control_for_watcher = control_tx.clone();
        self.watcher = Some(tokio::spawn(async move {
            loop {
                interrupt.cancelled().await;
                if control_for_watcher
                    .send(json!({"type": "interrupt"}).to_string())
                    .is_err()
                {
                    break;
                }
                interrupt.rearm();
            }
        }));

        self.control = Some(control_tx);
        self.child = Some(child);
        self.send_control(self.initialize_line())?;
        tracing::info!(command = %self.config.command, "agent process started");
        Ok(())
    }

    async fn set_permission_mode(&mut self, mode: PermissionMode) -> Result<()> {
        self.send_control(json!({
            "type": "set_permission_mode",
            "mode": mode.as_str(),
        }))
    }

    async fn query(&mut self, prompt: &str) -> Result<()> {
        self.send_control(json!({"type": "query", "prompt": prompt}))?;
        self.in_turn = true;
        Ok(())
    }

    async fn next_message(&mut self) -> Result<Option<ClientMessage>> {
        if !self.in_turn {
            return Ok(None);
        }

        loop {
            let line = {
                let lines = self
                    .lines
                    .as_mut()
                    .ok_or_else(|| Error::Client("agent process not started".into()))?;
                lines.next_line().await?
            };
            let Some(line) = line else {
                self.in_turn = false;
                return Err(Error::Client("agent process closed its output".into()));
            };
            if line.trim().is_empty() {
                continue;
            }

            let wire = match serde_json::from_str::<WireMessage>(&line) {
                Ok(wire) => wire,
                Err(e) => {
                    tracing::warn!(error = %e, "skipping malformed agent message");
                    continue;
                }
            };

            if let WireMessage::PermissionRequest {
                id,
                tool_name,
                input,
            } = wire
            {
                self.answer_permission_request(id, &tool_name, &input).await?;
                continue;
            }

            let message = map_wire(wire);
            if matches!(message, ClientMessage::Result(_)) {
                self.in_turn = false;
            }
            return Ok(Some(message));
        }
    }

    fn interrupt_handle(&self) -> InterruptHandle {
        self.interrupt.clone()
    }

    async fn close(&mut self) -> Result<()> {
        if let Some(control) = &self.control {
            let _ = control.send(json!({"type": "shutdown"}).to_string());
        }
        if let Some(watcher) = self.watcher.take() {
            watcher.abort();
        }
        if let Some(mut child) = self.child.take() {
            match tokio::time::timeout(SHUTDOWN_GRACE, child.wait()).await {
                Ok(_) => {}
                Err(_) => {
                    tracing::warn!("agent process did not exit, killing");
                    let _ = child.kill().await;
                }
            }
        }
        if let Some(writer) = self.writer.take() {
            writer.abort();
        }
        self.control = None;
        self.lines = None;
        self.in_turn = false;
        Ok(())
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_messages_parse() {
        let init: WireMessage = serde_json::from_str(
            r#"{"type": "init", "session_token": "tok-1", "slash_commands": ["/help"]}"#,
        )
        .unwrap();
        assert!(matches!(
            init,
            WireMessage::Init { ref session_token, .. } if session_token == "tok-1"
        ));

        let delta: WireMessage = serde_json::from_str(
            r#"{"type": "block_delta", "index": 0, "delta": {"type": "text_delta", "text": "hi"}}"#,
        )
        .unwrap();
        assert!(matches!(
            delta,
            WireMessage::BlockDelta { index: 0, delta: WireDelta::TextDelta { .. } }
        ));

        let result: WireMessage =
            serde_json::from_str(r#"{"type": "result", "is_error": false}"#).unwrap();
        assert!(matches!(result, WireMessage::Result { is_error: false, .. }));
    }

    #[test]
    fn permission_request_parses_with_defaults() {
        let wire: WireMessage = serde_json::from_str(
            r#"{"type": "permission_request", "id": 3, "tool_name": "Bash"}"#,
        )
        .unwrap();
        assert!(matches!(
            wire,
            WireMessage::PermissionRequest { id: 3, ref tool_name, .. } if tool_name == "Bash"
        ));
    }

    #[test]
    fn initialize_line_carries_options() {
        let client = SubprocessClient::new(
            ClientConfig::default(),
            ClientOptions {
                model: Some("claude-sonnet-4-5".into()),
                resume_token: Some("tok-9".into()),
                max_turns: 25,
                ..Default::default()
            },
        );
        let line = client.initialize_line();
        assert_eq!(line["type"], "initialize");
        assert_eq!(line["options"]["model"], "claude-sonnet-4-5");
        assert_eq!(line["options"]["resume"], "tok-9");
        assert_eq!(line["options"]["max_turns"], 25);
        assert_eq!(line["options"]["permission_mode"], "default");
    }

    #[test]
    fn map_wire_round_trips_tool_use() {
        let wire: WireMessage = serde_json::from_str(
            r#"{"type": "assistant", "blocks": [{"type": "tool_use", "id": "t1", "name": "Write", "input": {"file_path": "hello.py"}}]}"#,
        )
        .unwrap();
        let message = map_wire(wire);
        match message {
            ClientMessage::Assistant { blocks } => match &blocks[0] {
                AssistantBlock::ToolUse { id, name, input } => {
                    assert_eq!(id, "t1");
                    assert_eq!(name, "Write");
                    assert_eq!(input["file_path"], "hello.py");
                }
                other => panic!("unexpected block: {other:?}"),
            },
            other => panic!("unexpected message: {other:?}"),
        }
    }
}
