//! Core runtime — session management, background task execution, event
//! buffering, and the user-interaction gate.
//!
//! Two seams break the reference cycle between the components: the
//! [`SessionManager`] implements [`Interruptible`] (consumed by the task
//! runner when a user interrupts), and the [`TaskRunner`] implements
//! [`EventSink`] (consumed by the interaction gate and the turn glue to
//! append events to a session's stream).

pub mod events;
pub mod gate;
pub mod manager;
pub mod tasks;
pub mod turn;

pub use events::EventBuffer;
pub use gate::InteractionGate;
pub use manager::{ManagedSession, SessionManager};
pub use tasks::{TaskExecution, TaskRunner, TaskStatus};
pub use turn::{run_session_turn, TurnRequest};

use std::pin::Pin;

use async_trait::async_trait;

use ov_domain::event::{BufferedEvent, StreamEvent};

/// A lazy sequence of canonical events produced by one turn.
pub type EventStream = Pin<Box<dyn futures_core::Stream<Item = StreamEvent> + Send>>;

/// Appends events to a session's buffered stream.
pub trait EventSink: Send + Sync {
    fn append(&self, session_id: &str, event: StreamEvent) -> BufferedEvent;
}

/// Delivers a native interrupt to a session's in-flight turn.
#[async_trait]
pub trait Interruptible: Send + Sync {
    async fn interrupt(&self, session_id: &str) -> bool;
}
