//! Autopilot data model: worker/task configuration, per-cycle records, and
//! durable session state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use ov_domain::config::{PermissionMode, ToolServerConfig};
use ov_domain::event::Usage;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Worker configuration
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Configuration of one worker role (the Worker proper, or the Checker run
/// through the same implementation).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub model: Option<String>,
    /// Named endpoint resolved against the gateway's endpoint table.
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub system_prompt: Option<String>,
    /// Template appended to the built user prompt each cycle.
    #[serde(default)]
    pub user_prompt: Option<String>,
    #[serde(default)]
    pub tools_allow: Vec<String>,
    #[serde(default)]
    pub tools_block: Vec<String>,
    #[serde(default)]
    pub cwd: Option<String>,
    #[serde(default = "d_max_turns")]
    pub max_turns: u32,
    /// 0 means no explicit bound.
    #[serde(default)]
    pub max_output_tokens: u64,
    /// 0 means no explicit bound.
    #[serde(default)]
    pub max_thinking_tokens: u64,
    #[serde(default)]
    pub permission_mode: Option<PermissionMode>,
    #[serde(default)]
    pub tool_servers: Vec<ToolServerConfig>,
}

fn d_max_turns() -> u32 {
    10
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Task definition
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskDefinition {
    pub task_id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub objective: String,
    /// Initial input payload for cycle 1 (restored on a budget reset).
    #[serde(default = "d_object")]
    pub inputs: Value,
    /// Free-form description of what "passed" looks like, shown to the
    /// Checker.
    #[serde(default = "d_object")]
    pub expected_output: Value,
}

fn d_object() -> Value {
    json!({})
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// LLM result
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Raw output of one Worker invocation, before any orchestration logic.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LlmResult {
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub tool_calls: Vec<Value>,
    #[serde(default)]
    pub tool_results: Vec<Value>,
    /// External session token for resuming the conversation next cycle.
    #[serde(default)]
    pub session_token: Option<String>,
    #[serde(default)]
    pub usage: Option<Usage>,
    #[serde(default)]
    pub error: Option<String>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Checker outcome
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Parsed Checker decision. `passed` is the only success state; failures
/// carry the next cycle's input payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckerOutcome {
    pub passed: bool,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub next_input: Option<Value>,
}

impl CheckerOutcome {
    pub fn passed(reason: impl Into<String>) -> Self {
        Self {
            passed: true,
            reason: Some(reason.into()),
            next_input: None,
        }
    }

    pub fn failed(reason: impl Into<String>, next_input: Option<Value>) -> Self {
        Self {
            passed: false,
            reason: Some(reason.into()),
            next_input,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Cycle record
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Record of a single Worker→Checker pass.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CycleRecord {
    /// 1-based cycle index.
    pub cycle_index: u32,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub input_payload: Value,
    pub llm_result: LlmResult,
    pub passed: bool,
    #[serde(default)]
    pub checker_reason: Option<String>,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub artifacts: Vec<String>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Session state
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl SessionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// Options controlling the cycle budget and the optional reset policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionOptions {
    #[serde(default = "d_max_cycles")]
    pub max_cycles: u32,
    /// When the budget is exhausted, restore the initial input and start
    /// over instead of failing — at most `max_resets` times.
    #[serde(default)]
    pub reset_on_max_cycles: bool,
    #[serde(default)]
    pub max_resets: u32,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            max_cycles: d_max_cycles(),
            reset_on_max_cycles: false,
            max_resets: 0,
        }
    }
}

fn d_max_cycles() -> u32 {
    3
}

/// Durable state of one autonomous session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionState {
    pub session_id: String,
    pub status: SessionStatus,
    pub worker_config: WorkerConfig,
    /// Checker configuration for this session; falls back to the
    /// orchestrator's default, then to the worker config.
    #[serde(default)]
    pub checker_config: Option<WorkerConfig>,
    pub task: TaskDefinition,
    pub cycle_count: u32,
    pub max_cycles: u32,
    pub input_payload: Value,
    #[serde(default)]
    pub last_result: Option<LlmResult>,
    #[serde(default)]
    pub history: Vec<CycleRecord>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub reset_on_max_cycles: bool,
    #[serde(default)]
    pub reset_count: u32,
    #[serde(default)]
    pub max_resets: u32,
    #[serde(default)]
    pub last_error: Option<String>,
}

impl SessionState {
    /// Resume token of the previous cycle, threaded to the next Worker
    /// invocation so the conversation continues instead of restarting.
    pub fn resume_token(&self) -> Option<&str> {
        self.last_result
            .as_ref()
            .and_then(|r| r.session_token.as_deref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_serde_and_terminality() {
        assert_eq!(
            serde_json::to_string(&SessionStatus::Completed).unwrap(),
            "\"completed\""
        );
        assert!(SessionStatus::Completed.is_terminal());
        assert!(SessionStatus::Failed.is_terminal());
        assert!(SessionStatus::Cancelled.is_terminal());
        assert!(!SessionStatus::Pending.is_terminal());
        assert!(!SessionStatus::Running.is_terminal());
    }

    #[test]
    fn worker_config_minimal_toml() {
        let raw = r#"
            id = "coder"
            model = "claude-sonnet-4-5"
        "#;
        let config: WorkerConfig = toml::from_str(raw).unwrap();
        assert_eq!(config.id, "coder");
        assert_eq!(config.max_turns, 10);
        assert!(config.permission_mode.is_none());
    }

    #[test]
    fn resume_token_comes_from_last_result() {
        let mut state = SessionState {
            session_id: "s".into(),
            status: SessionStatus::Pending,
            worker_config: toml::from_str("id = \"w\"").unwrap(),
            checker_config: None,
            task: TaskDefinition {
                task_id: "t".into(),
                name: String::new(),
                objective: String::new(),
                inputs: json!({}),
                expected_output: json!({}),
            },
            cycle_count: 0,
            max_cycles: 3,
            input_payload: json!({}),
            last_result: None,
            history: Vec::new(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
            reset_on_max_cycles: false,
            reset_count: 0,
            max_resets: 0,
            last_error: None,
        };
        assert!(state.resume_token().is_none());
        state.last_result = Some(LlmResult {
            session_token: Some("tok-9".into()),
            ..Default::default()
        });
        assert_eq!(state.resume_token(), Some("tok-9"));
    }
}
