//! User-interaction gate — correlates an outbound ask-user or permission
//! request with an inbound reply.
//!
//! Each pending request is a single-shot rendezvous keyed by request id.
//! Both the request event and its eventual outcome (answered / timeout /
//! skipped) are appended to the session's event stream, so a client that
//! reconnects mid-suspension still sees the prompt and its resolution.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::oneshot;

use ov_domain::config::GateConfig;
use ov_domain::event::{EventType, StreamEvent};

use super::EventSink;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Types
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// The reply a pending request resolves with.
#[derive(Debug)]
enum GateReply {
    Answers(Value),
    Approved(bool),
    Skipped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RequestKind {
    AskUser,
    Permission,
}

struct PendingRequest {
    kind: RequestKind,
    respond: oneshot::Sender<GateReply>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Gate
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct InteractionGate {
    config: GateConfig,
    sink: Arc<dyn EventSink>,
    pending: Mutex<HashMap<String, PendingRequest>>,
}

impl InteractionGate {
    pub fn new(config: GateConfig, sink: Arc<dyn EventSink>) -> Self {
        Self {
            config,
            sink,
            pending: Mutex::new(HashMap::new()),
        }
    }

    fn register(&self, request_id: &str, kind: RequestKind) -> oneshot::Receiver<GateReply> {
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(
            request_id.to_owned(),
            PendingRequest { kind, respond: tx },
        );
        rx
    }

    fn take(&self, request_id: &str) -> Option<PendingRequest> {
        self.pending.lock().remove(request_id)
    }

    fn emit_result(&self, session_id: &str, request_id: &str, mut content: Value) {
        if let Value::Object(map) = &mut content {
            map.insert("request_id".into(), json!(request_id));
        }
        self.sink
            .append(session_id, StreamEvent::new(EventType::AskUserResult, content));
    }

    /// Ask the end user the agent's questions and wait for answers.
    ///
    /// Emits an `ask_user` event, then suspends until `respond` or the
    /// deadline. Returns `None` on timeout or skip.
    pub async fn request_user_input(
        &self,
        request_id: &str,
        session_id: &str,
        questions: Value,
    ) -> Option<Value> {
        let timeout = Duration::from_secs(self.config.ask_timeout_secs);
        let rx = self.register(request_id, RequestKind::AskUser);

        self.sink.append(
            session_id,
            StreamEvent::new(
                EventType::AskUser,
                json!({
                    "request_id": request_id,
                    "questions": questions,
                    "timeout": timeout.as_secs(),
                }),
            ),
        );
        tracing::info!(request_id, session_id, "ask_user request sent");

        let outcome = tokio::time::timeout(timeout, rx).await;
        self.take(request_id);

        match outcome {
            Ok(Ok(GateReply::Answers(answers))) => {
                self.emit_result(
                    session_id,
                    request_id,
                    json!({"status": "answered", "answers": answers}),
                );
                tracing::info!(request_id, "ask_user answered");
                Some(answers)
            }
            Ok(Ok(GateReply::Skipped)) => {
                self.emit_result(session_id, request_id, json!({"status": "skipped"}));
                tracing::info!(request_id, "ask_user skipped");
                None
            }
            Ok(Ok(GateReply::Approved(_))) | Ok(Err(_)) => {
                // Mismatched or dropped resolver; treat as skipped.
                self.emit_result(session_id, request_id, json!({"status": "skipped"}));
                None
            }
            Err(_) => {
                self.emit_result(session_id, request_id, json!({"status": "timeout"}));
                tracing::warn!(request_id, "ask_user timed out");
                None
            }
        }
    }

    /// Ask the end user to approve a tool invocation. Returns false on
    /// denial, timeout, or skip.
    pub async fn request_permission(
        &self,
        request_id: &str,
        session_id: &str,
        tool_name: &str,
        input: Value,
    ) -> bool {
        let timeout = Duration::from_secs(self.config.permission_timeout_secs);
        let rx = self.register(request_id, RequestKind::Permission);

        self.sink.append(
            session_id,
            StreamEvent::new(
                EventType::PermissionRequest,
                json!({
                    "request_id": request_id,
                    "tool_name": tool_name,
                    "input": input,
                }),
            ),
        );
        tracing::info!(request_id, session_id, tool_name, "permission request sent");

        let outcome = tokio::time::timeout(timeout, rx).await;
        self.take(request_id);

        match outcome {
            Ok(Ok(GateReply::Approved(approved))) => {
                self.emit_result(
                    session_id,
                    request_id,
                    json!({"status": "answered", "approved": approved}),
                );
                tracing::info!(request_id, approved, "permission resolved");
                approved
            }
            Ok(Ok(GateReply::Skipped)) => {
                self.emit_result(session_id, request_id, json!({"status": "skipped"}));
                false
            }
            Ok(Ok(GateReply::Answers(_))) | Ok(Err(_)) => {
                self.emit_result(session_id, request_id, json!({"status": "skipped"}));
                false
            }
            Err(_) => {
                self.emit_result(session_id, request_id, json!({"status": "timeout"}));
                tracing::warn!(request_id, tool_name, "permission request timed out");
                false
            }
        }
    }

    /// Deliver the user's answers for a pending ask-user request. Returns
    /// false when the request is unknown or already resolved.
    pub fn respond(&self, request_id: &str, answers: Value) -> bool {
        let Some(pending) = self.take(request_id) else {
            tracing::warn!(request_id, "no pending request for response");
            return false;
        };
        if pending.kind != RequestKind::AskUser {
            tracing::warn!(request_id, "response kind mismatch");
            return false;
        }
        pending.respond.send(GateReply::Answers(answers)).is_ok()
    }

    /// Deliver the user's approval decision for a pending permission
    /// request. Returns false when unknown or already resolved.
    pub fn respond_permission(&self, request_id: &str, approved: bool) -> bool {
        let Some(pending) = self.take(request_id) else {
            tracing::warn!(request_id, "no pending permission request");
            return false;
        };
        if pending.kind != RequestKind::Permission {
            tracing::warn!(request_id, "response kind mismatch");
            return false;
        }
        pending.respond.send(GateReply::Approved(approved)).is_ok()
    }

    /// Resolve a pending request with the skipped sentinel (user dismissed
    /// the prompt).
    pub fn cancel(&self, request_id: &str) -> bool {
        let Some(pending) = self.take(request_id) else {
            return false;
        };
        pending.respond.send(GateReply::Skipped).is_ok()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
