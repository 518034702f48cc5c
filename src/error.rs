use serde::{Deserialize, Serialize};

/// Error kind surfaced to the listener on a terminal `Error` event.
///
/// Mirrors the closed taxonomy from the host-facing event set: argument
/// errors never reach here (they are rejected synchronously at the API
/// boundary), everything else funnels through one of these four kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Success,
    Failed,
    Media,
    Network,
}

/// Errors rejected synchronously at the public API boundary.
#[derive(Debug, thiserror::Error)]
pub enum VoiceError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("session not initialized")]
    NotInitialized,
    #[error("engine loop has shut down")]
    EngineGone,
    #[error("missing or empty credential field: {0}")]
    InvalidAuth(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors produced inside an engine backend (recognition or realtime).
/// These never cross the public API synchronously — they are converted
/// into a single terminal `SessionEvent::Error` by the session bus.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("focus/recorder resource error: {0}")]
    Media(String),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("backend reported failure: {0}")]
    Backend(String),
    #[error("outbound buffer full, enqueue rejected")]
    Backpressure,
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::Media(_) => ErrorKind::Media,
            EngineError::Transport(_) | EngineError::Backpressure => ErrorKind::Network,
            EngineError::Backend(_) => ErrorKind::Failed,
        }
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for EngineError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        EngineError::Transport(e.to_string())
    }
}
