//! Durable interactive sessions: the session/message/block model, the
//! file-per-session JSON store, and the turn assembler that folds a turn's
//! aggregated events into transcript blocks.

pub mod model;
pub mod store;
pub mod transcript;

pub use model::{Block, Role, Session, SessionMessage, SessionSummary, ToolStatus, DEFAULT_TITLE};
pub use store::SessionStore;
pub use transcript::TurnAssembler;
