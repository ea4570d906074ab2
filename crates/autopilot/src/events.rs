//! Progress events emitted during an autonomous run.
//!
//! The orchestrator and workers call an [`EmitFn`] callback; the gateway
//! bridges it onto whatever transport it serves progress over. Emission is
//! always best-effort and never affects the cycle loop.

use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;

/// Event callback injected into the orchestrator and workers.
pub type EmitFn = Arc<dyn Fn(AutopilotEvent) + Send + Sync>;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AutopilotEvent {
    CycleStart {
        cycle_index: u32,
        max_cycles: u32,
        objective: String,
    },
    WorkerStart {
        cycle_index: u32,
        model: Option<String>,
        max_turns: u32,
        resume: Option<String>,
        cwd: Option<String>,
    },
    WorkerToolCall {
        tool_name: String,
        tool_id: String,
        input: Value,
    },
    WorkerToolResult {
        tool_id: String,
        content: Value,
        is_error: bool,
    },
    WorkerComplete {
        cycle_index: u32,
        summary: String,
        error: Option<String>,
    },
    CheckerStart {
        cycle_index: u32,
        model: Option<String>,
        prompt_chars: usize,
    },
    CheckerComplete {
        cycle_index: u32,
        passed: bool,
        reason: Option<String>,
    },
    CycleEnd {
        cycle_index: u32,
        passed: bool,
        status: String,
    },
}

/// Invoke the emitter if one is configured.
pub(crate) fn emit(emitter: &Option<EmitFn>, event: AutopilotEvent) {
    if let Some(emit) = emitter {
        emit(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_serialize_with_snake_case_tags() {
        let event = AutopilotEvent::CycleEnd {
            cycle_index: 2,
            passed: true,
            status: "completed".into(),
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "cycle_end");
        assert_eq!(value["cycle_index"], 2);
        assert_eq!(value["passed"], true);
    }
}
