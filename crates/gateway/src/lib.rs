//! The Overseer gateway: session and task runtime plus its WebSocket/REST
//! surface.
//!
//! Everything shared lives in one [`state::AppState`] value constructed at
//! startup and injected into every handler; there are no ambient singletons.

pub mod api;
pub mod runtime;
pub mod state;
