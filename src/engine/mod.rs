//! Engine plugin interface.
//!
//! A uniform contract that hides backend specifics: one trait object is
//! constructed per session (`init`), and a single event sink receives the
//! closed set of backend event kinds for the session's lifetime.

pub mod realtime;
pub mod recognition;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::UnboundedSender;

use crate::error::EngineError;

/// Audio container/format the caller would like capture to use, honored
/// only when the active engine does not force its own format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioHint {
    pub format: String,
}

/// What an engine actually needs from capture.
#[derive(Debug, Clone)]
pub struct EngineEnv {
    pub preferred_format: String,
    pub force_format: bool,
}

/// The closed set of event kinds a backend may emit. Translated from the
/// plugin's internal protocol into this narrow, application-facing shape
/// before it ever reaches the session bus.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    Start,
    PartialText(String),
    FinalText(String),
    Audio(Vec<u8>),
    Complete,
    Error(EngineError),
    Stop,
}

/// Uniform contract implemented by each backend (recognition, realtime
/// conversation, or a future substitute). `write_audio` must be cheap and
/// non-blocking: it is called from the engine loop on every capture buffer.
#[async_trait]
pub trait VoiceEngine: Send {
    /// Begin a streaming session. The engine has already been constructed
    /// with its event sink; `start` performs any network/handshake work.
    async fn start(&mut self, hint: Option<AudioHint>) -> Result<(), EngineError>;

    /// Ingest one PCM chunk verbatim from capture.
    fn write_audio(&mut self, bytes: &[u8]) -> Result<(), EngineError>;

    /// Signal end-of-input; the backend must eventually emit exactly one
    /// terminal event (`Complete` or `Error`).
    async fn finish(&mut self) -> Result<(), EngineError>;

    /// Abort without awaiting a final result; still emits exactly one
    /// terminal event.
    async fn cancel(&mut self) -> Result<(), EngineError>;

    /// Format/negotiation hints for the capture pipeline.
    fn env(&self) -> EngineEnv;

    /// Release resources. Default no-op; backends with handshake
    /// state (sockets, tasks) override to tear them down.
    async fn uninit(&mut self) {}
}

/// The event sink handed to a backend at construction time — replaces the
/// source's registered function-pointer callback with a typed channel end.
pub type EventSink = UnboundedSender<EngineEvent>;

/// Which backend a session selects. Constructed through this explicit
/// registry rather than a global function-pointer table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BackendKind {
    Recognition,
    RealtimeConversation,
}
