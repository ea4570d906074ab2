//! The Worker–Checker cycle loop.
//!
//! One cycle: build the user prompt from the task and the current input
//! payload, run the Worker (resuming its conversation when a token from the
//! previous cycle exists), ingest the sentinel `__output.json`, run the
//! Checker over the claimed output, parse its verdict, and record the
//! cycle. `passed` completes the session; anything else feeds the review
//! back into the next cycle until the budget runs out.
//!
//! Cycles are strictly sequential: cycle `n+1` starts only after cycle `n`
//! is fully recorded, and a cycle's Worker events always precede its
//! Checker events.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::{json, Value};
use uuid::Uuid;

use ov_domain::error::Result;

use crate::events::{emit, AutopilotEvent, EmitFn};
use crate::models::{
    CheckerOutcome, CycleRecord, LlmResult, SessionOptions, SessionState, SessionStatus,
    TaskDefinition, WorkerConfig,
};
use crate::persistence::StateStore;
use crate::verdict::{parse_checker_verdict, repair_json};
use crate::worker::Worker;

/// Sentinel file the Worker writes structured output to.
const OUTPUT_SENTINEL: &str = "__output.json";

pub struct Orchestrator {
    store: StateStore,
    worker: Arc<dyn Worker>,
    checker_config: Option<WorkerConfig>,
    cycle_wait: Duration,
    emitter: Option<EmitFn>,
}

impl Orchestrator {
    pub fn new(base_dir: impl Into<PathBuf>, worker: Arc<dyn Worker>) -> Self {
        Self {
            store: StateStore::new(base_dir),
            worker,
            checker_config: None,
            cycle_wait: Duration::ZERO,
            emitter: None,
        }
    }

    /// Use a dedicated Checker configuration instead of reusing the
    /// Worker's.
    pub fn with_checker_config(mut self, config: WorkerConfig) -> Self {
        self.checker_config = Some(config);
        self
    }

    pub fn with_emitter(mut self, emitter: EmitFn) -> Self {
        self.emitter = Some(emitter);
        self
    }

    /// Pause between cycles (rate limiting for long runs).
    pub fn with_cycle_wait(mut self, wait: Duration) -> Self {
        self.cycle_wait = wait;
        self
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    // Session lifecycle
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    pub fn create_session(
        &self,
        task: TaskDefinition,
        worker_config: WorkerConfig,
        checker_config: Option<WorkerConfig>,
        input_payload: Option<Value>,
        options: SessionOptions,
    ) -> Result<SessionState> {
        let session_id = new_session_id();
        let now = Utc::now();
        let session = SessionState {
            session_id: session_id.clone(),
            status: SessionStatus::Pending,
            input_payload: input_payload.unwrap_or_else(|| task.inputs.clone()),
            worker_config,
            checker_config,
            task,
            cycle_count: 0,
            max_cycles: options.max_cycles,
            last_result: None,
            history: Vec::new(),
            created_at: now,
            updated_at: now,
            reset_on_max_cycles: options.reset_on_max_cycles,
            reset_count: 0,
            max_resets: options.max_resets,
            last_error: None,
        };
        self.store.save_session(&session)?;
        self.store
            .append_log(&session_id, &format!("{now} session created"));
        tracing::info!(session_id = %session_id, "autopilot session created");
        Ok(session)
    }

    pub fn session(&self, session_id: &str) -> Result<SessionState> {
        self.store.load_session(session_id)
    }

    /// Cancel a non-terminal session. Idempotent on terminal sessions.
    pub fn cancel(&self, session_id: &str) -> Result<SessionState> {
        let mut session = self.store.load_session(session_id)?;
        if !session.status.is_terminal() {
            session.status = SessionStatus::Cancelled;
            session.updated_at = Utc::now();
            self.store.save_session(&session)?;
            self.store
                .append_log(session_id, &format!("{} cancelled", session.updated_at));
            tracing::info!(session_id, "autopilot session cancelled");
        }
        Ok(session)
    }

    /// Drive the session until it reaches a terminal status.
    pub async fn run(&self, session_id: &str) -> Result<SessionState> {
        let mut session = self.store.load_session(session_id)?;
        while !session.status.is_terminal() {
            session = self.run_once(session_id).await?;
            if self.cycle_wait > Duration::ZERO && !session.status.is_terminal() {
                tokio::time::sleep(self.cycle_wait).await;
            }
        }
        Ok(session)
    }

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    // One cycle
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    /// Advance the session by exactly one cycle.
    pub async fn run_once(&self, session_id: &str) -> Result<SessionState> {
        let mut session = self.store.load_session(session_id)?;
        if session.status.is_terminal() {
            return Ok(session);
        }
        if session.cycle_count >= session.max_cycles {
            return self.handle_max_cycles(session);
        }

        session.status = SessionStatus::Running;
        session.updated_at = Utc::now();
        self.store.save_session(&session)?;

        let cycle_index = session.cycle_count + 1;
        let started_at = Utc::now();
        self.store.layout.ensure(&session.session_id)?;
        let workspace = self.store.layout.session_dir(&session.session_id);

        tracing::info!(
            session_id = %session.session_id,
            cycle = cycle_index,
            max_cycles = session.max_cycles,
            "starting cycle"
        );
        emit(
            &self.emitter,
            AutopilotEvent::CycleStart {
                cycle_index,
                max_cycles: session.max_cycles,
                objective: truncate(&session.task.objective, 100),
            },
        );

        // Remove a stale sentinel so we only ingest this cycle's output.
        let output_file = workspace.join(OUTPUT_SENTINEL);
        if output_file.exists() {
            let _ = std::fs::remove_file(&output_file);
        }

        let prompt = build_user_prompt(&session.worker_config, &session.task, &session.input_payload);
        let resume_token = session.resume_token().map(str::to_owned);
        if let Some(token) = &resume_token {
            tracing::info!(session_id = %session.session_id, token = %token, "resuming worker conversation");
        }

        emit(
            &self.emitter,
            AutopilotEvent::WorkerStart {
                cycle_index,
                model: session.worker_config.model.clone(),
                max_turns: session.worker_config.max_turns,
                resume: resume_token.clone(),
                cwd: Some(workspace.display().to_string()),
            },
        );

        let worker_run = self
            .worker
            .run(
                &session.worker_config,
                &prompt,
                &workspace,
                &self.emitter,
                resume_token.as_deref(),
            )
            .await;

        let mut llm_result = match worker_run {
            Ok(result) => result,
            Err(exc) => {
                // Worker exception: synthesize a failed cycle and end the run.
                return self.fail_on_worker_exception(session, cycle_index, started_at, exc);
            }
        };

        let mut summary = llm_result
            .text
            .lines()
            .next()
            .filter(|l| !l.is_empty())
            .unwrap_or("no text output")
            .to_owned();
        let mut artifacts: Vec<String> = Vec::new();

        emit(
            &self.emitter,
            AutopilotEvent::WorkerComplete {
                cycle_index,
                summary: summary.clone(),
                error: llm_result.error.clone(),
            },
        );

        // Ingest & archive the sentinel output, when present.
        if output_file.exists() {
            self.ingest_sentinel(
                &session.session_id,
                cycle_index,
                &workspace,
                &mut llm_result,
                &mut summary,
                &mut artifacts,
            );
        }

        let ended_at = Utc::now();

        // Run the Checker (its own config, never resumed). A checker
        // failure fails the cycle, not the session.
        let checker_config = session
            .checker_config
            .clone()
            .or_else(|| self.checker_config.clone())
            .unwrap_or_else(|| session.worker_config.clone());
        let checker_prompt = build_checker_prompt(&session.task, &llm_result);

        emit(
            &self.emitter,
            AutopilotEvent::CheckerStart {
                cycle_index,
                model: checker_config.model.clone(),
                prompt_chars: checker_prompt.len(),
            },
        );

        let outcome = match self
            .worker
            .run(&checker_config, &checker_prompt, &workspace, &self.emitter, None)
            .await
        {
            Ok(checker_result) => parse_checker_verdict(&checker_result),
            Err(exc) => CheckerOutcome::failed(
                format!("checker_error: {exc}"),
                Some(json!({"error_feedback": format!("Checker failed: {exc}")})),
            ),
        };

        emit(
            &self.emitter,
            AutopilotEvent::CheckerComplete {
                cycle_index,
                passed: outcome.passed,
                reason: outcome.reason.clone(),
            },
        );
        tracing::info!(
            session_id = %session.session_id,
            cycle = cycle_index,
            passed = outcome.passed,
            reason = ?outcome.reason,
            "checker verdict"
        );

        let record = CycleRecord {
            cycle_index,
            started_at,
            ended_at,
            input_payload: session.input_payload.clone(),
            llm_result: llm_result.clone(),
            passed: outcome.passed,
            checker_reason: outcome.reason.clone(),
            summary,
            artifacts,
        };
        session.history.push(record.clone());
        session.cycle_count = cycle_index;
        session.last_result = Some(llm_result);
        session.updated_at = Utc::now();

        if outcome.passed {
            session.status = SessionStatus::Completed;
        } else {
            session.status = SessionStatus::Running;
            if let Some(next_input) = outcome.next_input {
                session.input_payload = next_input;
            }
        }

        self.store.save_cycle(&session.session_id, &record)?;
        self.store.save_session(&session)?;

        emit(
            &self.emitter,
            AutopilotEvent::CycleEnd {
                cycle_index,
                passed: outcome.passed,
                status: format!("{:?}", session.status).to_lowercase(),
            },
        );

        if session.status == SessionStatus::Completed {
            tracing::info!(session_id = %session.session_id, cycles = cycle_index, "session completed");
            self.store
                .append_log(&session.session_id, &format!("{} completed", session.updated_at));
        } else {
            tracing::info!(session_id = %session.session_id, cycle = cycle_index, "cycle failed, will retry");
        }
        Ok(session)
    }

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    // Helpers
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    fn handle_max_cycles(&self, mut session: SessionState) -> Result<SessionState> {
        if session.reset_on_max_cycles && can_reset(&session) {
            session.reset_count += 1;
            session.cycle_count = 0;
            session.status = SessionStatus::Pending;
            session.input_payload = session.task.inputs.clone();
            session.updated_at = Utc::now();
            self.store.save_session(&session)?;
            self.store
                .append_log(&session.session_id, &format!("{} reset max_cycles", session.updated_at));
            tracing::info!(
                session_id = %session.session_id,
                reset_count = session.reset_count,
                "cycle budget exhausted, resetting"
            );
            return Ok(session);
        }
        session.status = SessionStatus::Failed;
        session.last_error = Some("max_cycles".into());
        session.updated_at = Utc::now();
        self.store.save_session(&session)?;
        self.store
            .append_log(&session.session_id, &format!("{} failed max_cycles", session.updated_at));
        tracing::warn!(session_id = %session.session_id, "cycle budget exhausted");
        Ok(session)
    }

    fn fail_on_worker_exception(
        &self,
        mut session: SessionState,
        cycle_index: u32,
        started_at: chrono::DateTime<Utc>,
        exc: ov_domain::error::Error,
    ) -> Result<SessionState> {
        tracing::error!(
            session_id = %session.session_id,
            cycle = cycle_index,
            error = %exc,
            "worker exception"
        );
        let llm_result = LlmResult {
            error: Some(exc.to_string()),
            ..Default::default()
        };
        let record = CycleRecord {
            cycle_index,
            started_at,
            ended_at: Utc::now(),
            input_payload: session.input_payload.clone(),
            llm_result: llm_result.clone(),
            passed: false,
            checker_reason: Some("worker_exception".into()),
            summary: "worker exception".into(),
            artifacts: Vec::new(),
        };
        session.history.push(record.clone());
        session.cycle_count = cycle_index;
        session.last_result = Some(llm_result);
        session.last_error = Some(exc.to_string());
        session.status = SessionStatus::Failed;
        session.updated_at = Utc::now();
        self.store.save_cycle(&session.session_id, &record)?;
        self.store.save_session(&session)?;
        self.store
            .append_log(&session.session_id, &format!("{} failed worker_exception", session.updated_at));
        Ok(session)
    }

    /// Read the sentinel output, repairing malformed JSON best-effort,
    /// overwrite the worker text with its canonical serialization, and
    /// archive a per-cycle copy.
    fn ingest_sentinel(
        &self,
        session_id: &str,
        cycle_index: u32,
        workspace: &std::path::Path,
        llm_result: &mut LlmResult,
        summary: &mut String,
        artifacts: &mut Vec<String>,
    ) {
        let output_file = workspace.join(OUTPUT_SENTINEL);
        tracing::info!(session_id, cycle = cycle_index, "ingesting sentinel output");

        let content = match std::fs::read_to_string(&output_file) {
            Ok(content) => content,
            Err(e) => {
                tracing::error!(session_id, error = %e, "failed to read sentinel output");
                llm_result.error = Some(format!("Failed to process {OUTPUT_SENTINEL}: {e}"));
                return;
            }
        };

        let data = match serde_json::from_str::<Value>(&content) {
            Ok(data) => data,
            Err(parse_err) => {
                tracing::warn!(session_id, error = %parse_err, "sentinel JSON malformed, attempting repair");
                match serde_json::from_str::<Value>(&repair_json(&content)) {
                    Ok(data) => {
                        tracing::info!(session_id, "sentinel JSON repair successful");
                        data
                    }
                    Err(repair_err) => {
                        tracing::error!(session_id, error = %repair_err, "sentinel JSON repair failed");
                        llm_result.error =
                            Some(format!("Failed to process {OUTPUT_SENTINEL}: {parse_err}"));
                        return;
                    }
                }
            }
        };

        // Canonical serialization replaces the worker's free text.
        match serde_json::to_string(&data) {
            Ok(canonical) => llm_result.text = canonical,
            Err(e) => {
                llm_result.error = Some(format!("Failed to process {OUTPUT_SENTINEL}: {e}"));
                return;
            }
        }

        if let Some(files) = data.get("files").and_then(Value::as_array) {
            for file in files {
                if let Some(name) = file.as_str() {
                    artifacts.push(name.to_owned());
                }
            }
        }
        summary.push_str(" [structured output ingested]");

        let archive_name = format!("__output_cycle_{cycle_index:04}.json");
        match std::fs::copy(&output_file, workspace.join(&archive_name)) {
            Ok(_) => artifacts.push(archive_name),
            Err(e) => {
                tracing::warn!(session_id, error = %e, "failed to archive sentinel output");
            }
        }
    }
}

fn can_reset(session: &SessionState) -> bool {
    session.max_resets > 0 && session.reset_count < session.max_resets
}

fn new_session_id() -> String {
    let hex = Uuid::new_v4().simple().to_string();
    format!("session-{}", &hex[..12])
}

fn truncate(s: &str, max_chars: usize) -> String {
    s.chars().take(max_chars).collect()
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Prompt building
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// The context preamble carries the `{{TIME}}` / `{{CWD}}` placeholders the
/// worker replaces just before dispatch.
fn build_user_prompt(config: &WorkerConfig, task: &TaskDefinition, input_payload: &Value) -> String {
    let mut sections: Vec<String> = Vec::new();

    sections.push(
        "Current Time: {{TIME}}\n\
         Current Working Directory: {{CWD}}\n\
         IMPORTANT: Use the current time for any date-related tasks. \
         Ensure all file operations are performed strictly within the \
         Current Working Directory."
            .to_owned(),
    );

    if !task.objective.trim().is_empty() {
        sections.push(task.objective.trim().to_owned());
    }
    if let Some(user_prompt) = &config.user_prompt {
        if !user_prompt.trim().is_empty() {
            sections.push(user_prompt.trim().to_owned());
        }
    }
    if !is_empty_payload(input_payload) {
        let dump = serde_json::to_string_pretty(input_payload)
            .unwrap_or_else(|_| input_payload.to_string());
        sections.push(format!("Input:\n{dump}"));
    }

    let text = sections.join("\n\n");
    if text.trim().is_empty() {
        " ".to_owned()
    } else {
        text.trim().to_owned()
    }
}

/// The Checker only sees the objective, the expected outcome, and the
/// Worker's claimed output — never the Worker's conversation.
fn build_checker_prompt(task: &TaskDefinition, result: &LlmResult) -> String {
    let output_data = match serde_json::from_str::<Value>(&result.text) {
        Ok(parsed @ Value::Object(_)) => serde_json::to_string_pretty(&parsed)
            .unwrap_or_else(|_| result.text.clone()),
        _ => result.text.clone(),
    };

    let expected = if is_empty_payload(&task.expected_output) {
        "Not specified - use your judgment based on the objective.".to_owned()
    } else {
        serde_json::to_string_pretty(&task.expected_output)
            .unwrap_or_else(|_| task.expected_output.to_string())
    };

    format!(
        "# Task Objective\n{}\n\n\
         # Expected Outcome\n{}\n\n\
         # Worker's Claimed Output\n{}\n\n\
         Error reported: {}\n\n\
         Please verify the Worker's claims using available tools and render \
         your verdict as JSON.",
        task.objective,
        expected,
        output_data,
        result.error.as_deref().unwrap_or("None"),
    )
}

fn is_empty_payload(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Object(map) => map.is_empty(),
        _ => false,
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> WorkerConfig {
        toml::from_str("id = \"coder\"").unwrap()
    }

    fn task() -> TaskDefinition {
        TaskDefinition {
            task_id: "t1".into(),
            name: "demo".into(),
            objective: "Write hello.py".into(),
            inputs: json!({"language": "python"}),
            expected_output: json!({}),
        }
    }

    #[test]
    fn user_prompt_sections_in_order() {
        let mut cfg = config();
        cfg.user_prompt = Some("Respond in JSON.".into());
        let prompt = build_user_prompt(&cfg, &task(), &json!({"language": "python"}));

        let time_pos = prompt.find("{{TIME}}").unwrap();
        let objective_pos = prompt.find("Write hello.py").unwrap();
        let template_pos = prompt.find("Respond in JSON.").unwrap();
        let input_pos = prompt.find("Input:").unwrap();
        assert!(time_pos < objective_pos);
        assert!(objective_pos < template_pos);
        assert!(template_pos < input_pos);
        assert!(prompt.contains("\"language\": \"python\""));
    }

    #[test]
    fn empty_input_payload_is_omitted() {
        let prompt = build_user_prompt(&config(), &task(), &json!({}));
        assert!(!prompt.contains("Input:"));
    }

    #[test]
    fn checker_prompt_pretty_prints_object_output() {
        let result = LlmResult {
            text: "{\"files\":[\"hello.py\"]}".into(),
            ..Default::default()
        };
        let prompt = build_checker_prompt(&task(), &result);
        assert!(prompt.contains("# Task Objective"));
        assert!(prompt.contains("\"files\": [\n"));
        assert!(prompt.contains("Not specified - use your judgment"));
        assert!(prompt.contains("Error reported: None"));
    }

    #[test]
    fn checker_prompt_reports_worker_error() {
        let result = LlmResult {
            text: "partial".into(),
            error: Some("tool crashed".into()),
            ..Default::default()
        };
        let prompt = build_checker_prompt(&task(), &result);
        assert!(prompt.contains("Error reported: tool crashed"));
    }

    #[test]
    fn session_ids_are_prefixed_and_short() {
        let id = new_session_id();
        assert!(id.starts_with("session-"));
        assert_eq!(id.len(), "session-".len() + 12);
    }
}
