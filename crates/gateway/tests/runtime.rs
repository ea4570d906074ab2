//! End-to-end scenarios over the full runtime: store + manager + task
//! runner + gate + multiplexer frame protocol, driven by a scripted agent
//! client. No sockets involved — [`ClientConn`] is exercised directly.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::mpsc;

use ov_client::scripted::{emit_all, ScriptStep, ScriptedClientBuilder};
use ov_client::{AssistantBlock, ClientMessage, TurnResult};
use ov_domain::config::Config;
use ov_gateway::api::ws::ClientConn;
use ov_gateway::runtime::tasks::TaskStatus;
use ov_gateway::state::{build_state, AppState};
use ov_sessions::{Block, Role, ToolStatus, DEFAULT_TITLE};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Helpers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn make_state(dir: &tempfile::TempDir, builder: ScriptedClientBuilder) -> AppState {
    let mut config = Config::default();
    config.storage.state_path = dir.path().to_path_buf();
    build_state(Arc::new(config), builder.into_factory()).unwrap()
}

struct TestClient {
    conn: ClientConn,
    rx: mpsc::Receiver<Value>,
}

impl TestClient {
    fn connect(state: &AppState) -> Self {
        let (tx, rx) = mpsc::channel(256);
        Self {
            conn: ClientConn::new(state.clone(), tx),
            rx,
        }
    }

    async fn send(&mut self, frame: Value) {
        self.conn.handle_text(&frame.to_string()).await;
    }

    async fn recv(&mut self) -> Value {
        tokio::time::timeout(Duration::from_secs(5), self.rx.recv())
            .await
            .expect("timed out waiting for a frame")
            .expect("channel closed")
    }

    /// Collect frames until (and including) the first `done` event.
    async fn recv_until_done(&mut self) -> Vec<Value> {
        let mut frames = Vec::new();
        loop {
            let frame = self.recv().await;
            let done = frame["type"] == "done";
            frames.push(frame);
            if done {
                return frames;
            }
        }
    }

    /// Collect frames until one matches the predicate; returns all frames
    /// seen, the matching one last.
    async fn recv_until(&mut self, pred: impl Fn(&Value) -> bool) -> Vec<Value> {
        let mut frames = Vec::new();
        loop {
            let frame = self.recv().await;
            let hit = pred(&frame);
            frames.push(frame);
            if hit {
                return frames;
            }
        }
    }

    fn disconnect(&mut self) {
        self.conn.disconnect();
    }
}

async fn wait_terminal(state: &AppState, session_id: &str) {
    for _ in 0..200 {
        if let Some(execution) = state.tasks.status(session_id) {
            if execution.status.is_terminal() {
                return;
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("task for {session_id} never reached a terminal status");
}

fn query_frame(session_id: &str, prompt: &str) -> Value {
    json!({"type": "query", "session_id": session_id, "prompt": prompt})
}

fn hello_turn() -> Vec<ScriptStep> {
    emit_all(vec![
        ClientMessage::Assistant {
            blocks: vec![AssistantBlock::ToolUse {
                id: "toolu_1".into(),
                name: "Write".into(),
                input: json!({"file_path": "hello.py", "content": "print('hi')\n"}),
            }],
        },
        ClientMessage::ToolResult {
            tool_use_id: "toolu_1".into(),
            content: json!("File created successfully"),
            is_error: false,
        },
        ClientMessage::Assistant {
            blocks: vec![AssistantBlock::Text {
                text: "Created hello.py.".into(),
            }],
        },
        ClientMessage::Result(TurnResult::default()),
    ])
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Scenario: happy path
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[tokio::test]
async fn happy_path_query_to_done() {
    let dir = tempfile::tempdir().unwrap();
    // Hold the turn open until the querying client has subscribed, so the
    // implicit view happens while the task is still running.
    let finish = Arc::new(tokio::sync::Notify::new());
    let mut steps = hello_turn();
    let result = steps.pop().unwrap();
    steps.push(ScriptStep::Pause(finish.clone()));
    steps.push(result);

    let state = make_state(
        &dir,
        ScriptedClientBuilder::new()
            .session_token("tok-1")
            .turn(steps),
    );
    let session = state.sessions.create(DEFAULT_TITLE).unwrap();

    let mut client = TestClient::connect(&state);
    client
        .send(query_frame(&session.id, "Write hello.py"))
        .await;
    let mut frames = client.recv_until(|f| f["type"] == "text").await;
    finish.notify_one();
    frames.extend(client.recv_until_done().await);

    assert_eq!(frames[0]["type"], "task_started");
    assert!(frames[0]["content"]["task_id"].is_string());

    // The event tail: tool_use → tool_result → (text) → done, every event
    // stamped with the session id.
    let kinds: Vec<&str> = frames[1..]
        .iter()
        .map(|f| f["type"].as_str().unwrap())
        .collect();
    assert_eq!(kinds, ["system", "tool_use", "tool_result", "text", "done"]);
    let tool_use = &frames[2];
    assert_eq!(tool_use["content"]["name"], "Write");
    assert_eq!(tool_use["content"]["input"]["file_path"], "hello.py");
    let tool_result = &frames[3];
    assert_eq!(tool_result["content"]["tool_use_id"], "toolu_1");
    assert_eq!(tool_result["content"]["is_error"], false);
    for frame in &frames[1..] {
        assert_eq!(frame["metadata"]["session_id"], json!(session.id));
    }

    // Terminal status with unread flag (the terminal transition clears the
    // implicit subscribe-view).
    wait_terminal(&state, &session.id).await;
    let execution = state.tasks.status(&session.id).unwrap();
    assert_eq!(execution.status, TaskStatus::Completed);
    assert!(execution.has_unread());

    // A fresh client replays the whole cached stream and clears unread.
    let mut fresh = TestClient::connect(&state);
    fresh
        .send(json!({"type": "subscribe", "session_id": session.id}))
        .await;
    let replay = fresh.recv_until_done().await;
    let replay_kinds: Vec<&str> = replay.iter().map(|f| f["type"].as_str().unwrap()).collect();
    assert_eq!(
        replay_kinds,
        ["system", "tool_use", "tool_result", "text", "done"]
    );
    assert!(!state.tasks.status(&session.id).unwrap().has_unread());

    // The transcript got the user message, then the assistant message with
    // the tool block updated in place.
    let stored = state.sessions.load(&session.id).unwrap();
    assert_eq!(stored.messages.len(), 2);
    assert_eq!(stored.messages[0].role, Role::User);
    assert_eq!(stored.title, "Write hello.py");
    let blocks = stored.messages[1].blocks.as_ref().unwrap();
    match &blocks[0] {
        Block::ToolUse { id, result, status, .. } => {
            assert_eq!(id, "toolu_1");
            assert_eq!(result.as_ref().unwrap(), &json!("File created successfully"));
            assert_eq!(*status, ToolStatus::Success);
        }
        other => panic!("expected tool_use block, got {other:?}"),
    }
    assert_eq!(stored.resume_token.as_deref(), Some("tok-1"));
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Scenario: reconnect mid-turn
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[tokio::test]
async fn reconnect_mid_turn_replays_everything_once() {
    let dir = tempfile::tempdir().unwrap();
    let resume = Arc::new(tokio::sync::Notify::new());
    let state = make_state(
        &dir,
        ScriptedClientBuilder::new().turn(vec![
            ScriptStep::Emit(ClientMessage::Assistant {
                blocks: vec![AssistantBlock::Text {
                    text: "working on it".into(),
                }],
            }),
            ScriptStep::Pause(resume.clone()),
            ScriptStep::Emit(ClientMessage::Assistant {
                blocks: vec![AssistantBlock::Text {
                    text: "finished".into(),
                }],
            }),
            ScriptStep::Emit(ClientMessage::Result(TurnResult::default())),
        ]),
    );
    let session = state.sessions.create(DEFAULT_TITLE).unwrap();

    // First client sees the early events, then disconnects mid-turn.
    let mut first = TestClient::connect(&state);
    first.send(query_frame(&session.id, "long task")).await;
    first.recv_until(|f| f["type"] == "text").await;
    first.disconnect();

    // The background task keeps producing after the disconnect.
    resume.notify_one();
    wait_terminal(&state, &session.id).await;

    // A reconnecting client receives every event appended, in order,
    // exactly once, terminating with done.
    let mut second = TestClient::connect(&state);
    second
        .send(json!({"type": "subscribe", "session_id": session.id}))
        .await;
    let frames = second.recv_until_done().await;
    let kinds: Vec<&str> = frames.iter().map(|f| f["type"].as_str().unwrap()).collect();
    assert_eq!(kinds, ["system", "text", "text", "done"]);
    assert_eq!(frames[1]["content"], "working on it");
    assert_eq!(frames[2]["content"], "finished");
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Scenario: busy session
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[tokio::test]
async fn query_on_running_session_is_rejected_without_events() {
    let dir = tempfile::tempdir().unwrap();
    let resume = Arc::new(tokio::sync::Notify::new());
    let state = make_state(
        &dir,
        ScriptedClientBuilder::new().turn(vec![
            ScriptStep::Pause(resume.clone()),
            ScriptStep::Emit(ClientMessage::Result(TurnResult::default())),
        ]),
    );
    let session = state.sessions.create(DEFAULT_TITLE).unwrap();

    let mut client = TestClient::connect(&state);
    client.send(query_frame(&session.id, "first")).await;
    // Wait for the turn's system event so the event count is stable (the
    // script is paused right after it).
    client.recv_until(|f| f["type"] == "system").await;

    let count_before = state.tasks.events().event_count(&session.id);
    client.send(query_frame(&session.id, "second")).await;
    let frames = client
        .recv_until(|f| f["type"] == "error" && f["metadata"]["code"] == "session_busy")
        .await;
    assert_eq!(
        frames.last().unwrap()["metadata"]["session_id"],
        json!(session.id)
    );
    // The rejection appended nothing to the event stream.
    assert_eq!(state.tasks.events().event_count(&session.id), count_before);

    resume.notify_one();
    wait_terminal(&state, &session.id).await;
}

#[tokio::test]
async fn query_on_unknown_session_reports_not_found() {
    let dir = tempfile::tempdir().unwrap();
    let state = make_state(&dir, ScriptedClientBuilder::new());

    let mut client = TestClient::connect(&state);
    client.send(query_frame("ghost", "hello")).await;
    let frames = client.recv_until(|f| f["type"] == "error").await;
    assert_eq!(frames.last().unwrap()["metadata"]["code"], "session_not_found");
}

#[tokio::test]
async fn malformed_frame_is_reported_and_channel_survives() {
    let dir = tempfile::tempdir().unwrap();
    let state = make_state(
        &dir,
        ScriptedClientBuilder::new().turn(hello_turn()),
    );
    let session = state.sessions.create(DEFAULT_TITLE).unwrap();

    let mut client = TestClient::connect(&state);
    client.conn.handle_text("{not json at all").await;
    let frame = client.recv().await;
    assert_eq!(frame["type"], "error");
    assert_eq!(frame["metadata"]["code"], "invalid_frame");

    // The channel is still usable.
    client.send(query_frame(&session.id, "still works")).await;
    let frames = client.recv_until_done().await;
    assert_eq!(frames[0]["type"], "task_started");
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Scenario: permission denial
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[tokio::test]
async fn permission_denial_roundtrip() {
    let dir = tempfile::tempdir().unwrap();
    let state = make_state(
        &dir,
        ScriptedClientBuilder::new().turn(vec![
            ScriptStep::Permission {
                tool_name: "Bash".into(),
                input: json!({"command": "rm -rf build"}),
                on_allow: vec![
                    ClientMessage::ToolResult {
                        tool_use_id: "toolu_1".into(),
                        content: json!("removed"),
                        is_error: false,
                    },
                    ClientMessage::Result(TurnResult::default()),
                ],
                on_deny: vec![
                    ClientMessage::Assistant {
                        blocks: vec![AssistantBlock::Text {
                            text: "Understood — permission was denied, so I stopped.".into(),
                        }],
                    },
                    ClientMessage::Result(TurnResult::default()),
                ],
            },
        ]),
    );
    let session = state.sessions.create(DEFAULT_TITLE).unwrap();

    let mut client = TestClient::connect(&state);
    client.send(query_frame(&session.id, "clean the build dir")).await;

    let frames = client
        .recv_until(|f| f["type"] == "permission_request")
        .await;
    let request = frames.last().unwrap();
    assert_eq!(request["content"]["tool_name"], "Bash");
    let request_id = request["content"]["request_id"].as_str().unwrap().to_owned();

    client
        .send(json!({
            "type": "permission_response",
            "request_id": request_id,
            "approved": false,
        }))
        .await;

    let frames = client.recv_until_done().await;
    // The denial rationale shows up as assistant text, and done fires
    // normally.
    assert!(frames.iter().any(|f| {
        f["type"] == "text"
            && f["content"]
                .as_str()
                .map(|t| t.contains("denied"))
                .unwrap_or(false)
    }));

    // Both the request and its resolution are in the durable event log.
    wait_terminal(&state, &session.id).await;
    let cached = state.tasks.events().cached(&session.id);
    let kinds: Vec<String> = cached
        .iter()
        .map(|e| serde_json::to_value(e).unwrap()["type"].as_str().unwrap().to_owned())
        .collect();
    assert!(kinds.contains(&"permission_request".to_owned()));
    let result_event = cached
        .iter()
        .find(|e| {
            serde_json::to_value(e).unwrap()["type"] == "ask_user_result"
        })
        .expect("ask_user_result missing from event log");
    assert_eq!(result_event.event.content["status"], "answered");
    assert_eq!(result_event.event.content["approved"], false);
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Scenario: ask-user answered
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[tokio::test]
async fn ask_user_answered_roundtrip() {
    let dir = tempfile::tempdir().unwrap();
    let state = make_state(
        &dir,
        ScriptedClientBuilder::new().turn(vec![
            ScriptStep::Permission {
                tool_name: "AskUserQuestion".into(),
                input: json!({"questions": [{"question": "Which directory?"}]}),
                on_allow: vec![
                    ClientMessage::Assistant {
                        blocks: vec![AssistantBlock::Text {
                            text: "Thanks, proceeding with src/.".into(),
                        }],
                    },
                    ClientMessage::Result(TurnResult::default()),
                ],
                on_deny: vec![
                    ClientMessage::Assistant {
                        blocks: vec![AssistantBlock::Text {
                            text: "No answer received.".into(),
                        }],
                    },
                    ClientMessage::Result(TurnResult::default()),
                ],
            },
        ]),
    );
    let session = state.sessions.create(DEFAULT_TITLE).unwrap();

    let mut client = TestClient::connect(&state);
    client.send(query_frame(&session.id, "refactor")).await;

    let frames = client.recv_until(|f| f["type"] == "ask_user").await;
    let request = frames.last().unwrap();
    assert_eq!(
        request["content"]["questions"][0]["question"],
        "Which directory?"
    );
    let request_id = request["content"]["request_id"].as_str().unwrap().to_owned();

    client
        .send(json!({
            "type": "user_response",
            "request_id": request_id,
            "answers": {"Which directory?": "src/"},
        }))
        .await;

    let frames = client.recv_until_done().await;
    assert!(frames
        .iter()
        .any(|f| f["type"] == "text" && f["content"] == "Thanks, proceeding with src/."));

    // The answered result event is in the log.
    let cached = state.tasks.events().cached(&session.id);
    let answered = cached
        .iter()
        .find(|e| serde_json::to_value(e).unwrap()["type"] == "ask_user_result")
        .unwrap();
    assert_eq!(answered.event.content["status"], "answered");
    assert_eq!(
        answered.event.content["answers"]["Which directory?"],
        "src/"
    );
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Scenario: config switch carries the resume token
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[tokio::test]
async fn model_switch_resumes_conversation() {
    let dir = tempfile::tempdir().unwrap();
    let state = make_state(
        &dir,
        ScriptedClientBuilder::new()
            .session_token("tok-first")
            .turn(hello_turn())
            .turn(hello_turn()),
    );
    let session = state.sessions.create(DEFAULT_TITLE).unwrap();

    let mut client = TestClient::connect(&state);
    client
        .send(json!({
            "type": "query",
            "session_id": session.id,
            "prompt": "first",
            "model": "claude-sonnet-4-5",
        }))
        .await;
    client.recv_until_done().await;
    wait_terminal(&state, &session.id).await;

    // The stored session captured the client's token.
    let stored = state.sessions.load(&session.id).unwrap();
    assert_eq!(stored.resume_token.as_deref(), Some("tok-first"));
    assert_eq!(stored.last_model_name.as_deref(), Some("claude-sonnet-4-5"));

    // Switching the model recreates the client; the fresh client's first
    // system event advertises the stored token.
    client
        .send(json!({
            "type": "query",
            "session_id": session.id,
            "prompt": "second",
            "model": "claude-opus-4-5",
        }))
        .await;
    let frames = client.recv_until_done().await;
    let system = frames.iter().find(|f| f["type"] == "system").unwrap();
    assert_eq!(system["content"]["session_token"], "tok-first");

    let managed = state.manager.get_session(&session.id).await.unwrap();
    assert_eq!(managed.model_name.as_deref(), Some("claude-opus-4-5"));
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Scenario: interrupt
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[tokio::test]
async fn interrupt_running_task_completes_with_synthetic_tail() {
    let dir = tempfile::tempdir().unwrap();
    let never = Arc::new(tokio::sync::Notify::new());
    let state = make_state(
        &dir,
        ScriptedClientBuilder::new().turn(vec![
            ScriptStep::Emit(ClientMessage::Assistant {
                blocks: vec![AssistantBlock::Text {
                    text: "starting".into(),
                }],
            }),
            ScriptStep::Pause(never.clone()),
        ]),
    );
    let session = state.sessions.create(DEFAULT_TITLE).unwrap();

    let mut client = TestClient::connect(&state);
    client.send(query_frame(&session.id, "endless")).await;
    client.recv_until(|f| f["type"] == "text").await;

    assert!(state.tasks.interrupt(&session.id).await);
    let execution = state.tasks.status(&session.id).unwrap();
    assert_eq!(execution.status, TaskStatus::Completed);

    let cached = state.tasks.events().cached(&session.id);
    let tail: Vec<String> = cached[cached.len() - 2..]
        .iter()
        .map(|e| {
            serde_json::to_value(e).unwrap()["type"]
                .as_str()
                .unwrap()
                .to_owned()
        })
        .collect();
    assert_eq!(tail, ["system", "done"]);
    assert_eq!(
        cached[cached.len() - 2].event.content,
        json!("Task interrupted by user")
    );
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Scenario: restart recovery
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[tokio::test]
async fn restart_recovery_promotes_running_task() {
    let dir = tempfile::tempdir().unwrap();
    let session_id;

    // First process: a task is mid-flight when the process "dies".
    {
        let never = Arc::new(tokio::sync::Notify::new());
        let state = make_state(
            &dir,
            ScriptedClientBuilder::new().turn(vec![
                ScriptStep::Emit(ClientMessage::Assistant {
                    blocks: vec![AssistantBlock::Text {
                        text: "partial progress".into(),
                    }],
                }),
                ScriptStep::Pause(never.clone()),
            ]),
        );
        let session = state.sessions.create(DEFAULT_TITLE).unwrap();
        session_id = session.id.clone();

        let mut client = TestClient::connect(&state);
        client.send(query_frame(&session.id, "long job")).await;
        client.recv_until(|f| f["type"] == "text").await;
        assert!(state.tasks.is_running(&session.id));
        // State dropped here without completing the task.
    }

    // Second process over the same storage directory.
    let state = make_state(&dir, ScriptedClientBuilder::new());
    let execution = state.tasks.status(&session_id).unwrap();
    assert_eq!(execution.status, TaskStatus::Error);
    assert_eq!(
        execution.error.as_deref(),
        Some("Server restarted during execution")
    );
    assert!(execution.has_unread());

    // The event log is intact and replayable.
    let mut client = TestClient::connect(&state);
    client
        .send(json!({"type": "subscribe", "session_id": session_id}))
        .await;
    let frames = client
        .recv_until(|f| f["type"] == "text" && f["content"] == "partial progress")
        .await;
    assert_eq!(frames[0]["type"], "system");
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Scenario: multiple subscriptions per client
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[tokio::test]
async fn one_client_subscribes_to_two_sessions() {
    let dir = tempfile::tempdir().unwrap();
    let state = make_state(
        &dir,
        ScriptedClientBuilder::new().turn(hello_turn()).turn(hello_turn()),
    );
    let a = state.sessions.create(DEFAULT_TITLE).unwrap();
    let b = state.sessions.create(DEFAULT_TITLE).unwrap();

    let mut client = TestClient::connect(&state);
    client.send(query_frame(&a.id, "task a")).await;
    client.recv_until_done().await;
    wait_terminal(&state, &a.id).await;

    client.send(query_frame(&b.id, "task b")).await;
    client.recv_until_done().await;
    wait_terminal(&state, &b.id).await;

    // Re-subscribe to both; each replay is tagged with its session id.
    client
        .send(json!({"type": "subscribe", "session_id": a.id}))
        .await;
    let replay_a = client.recv_until_done().await;
    assert!(replay_a
        .iter()
        .all(|f| f["metadata"]["session_id"] == json!(a.id)));

    client
        .send(json!({"type": "subscribe", "session_id": b.id}))
        .await;
    let replay_b = client.recv_until_done().await;
    assert!(replay_b
        .iter()
        .all(|f| f["metadata"]["session_id"] == json!(b.id)));
}
