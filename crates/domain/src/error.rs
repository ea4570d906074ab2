/// Shared error type used across all Overseer crates.
///
/// Each variant maps to an error kind that clients can distinguish; none of
/// them abort the process.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error("session {0} already has a running task")]
    SessionBusy(String),

    #[error("invalid frame: {0}")]
    InvalidFrame(String),

    #[error("stream: {0}")]
    Stream(String),

    #[error("client: {0}")]
    Client(String),

    #[error("config: {0}")]
    Config(String),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;
