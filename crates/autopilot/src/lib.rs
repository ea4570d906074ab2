//! Autonomous mode ("autopilot"): a Worker–Checker loop that iterates
//! cycle-by-cycle until the Checker declares the task passed or the cycle
//! budget is exhausted.
//!
//! Each cycle runs the Worker against the session workspace, ingests the
//! sentinel `__output.json` it may have produced, then runs the Checker (a
//! Worker with its own configuration, never resumed) over the claimed
//! output and parses its JSON verdict. The Worker's conversation is resumed
//! across cycles via the external session token.

pub mod config;
pub mod events;
pub mod models;
pub mod orchestrator;
pub mod persistence;
pub mod verdict;
pub mod worker;

pub use models::{
    CheckerOutcome, CycleRecord, LlmResult, SessionOptions, SessionState, SessionStatus,
    TaskDefinition, WorkerConfig,
};
pub use orchestrator::Orchestrator;
pub use worker::{ClientWorker, StubWorker, Worker};
