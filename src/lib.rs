//! Client-side voice-interaction runtime: session state machine, capture
//! pipeline, and the recognition / realtime-conversation engines that sit
//! behind it.
//!
//! The public surface is [`session::VoiceSession`]; everything else is a
//! seam (`VoiceEngine`, `Recorder`, `FocusManager`, `CredentialStore`) a
//! host can substitute its own implementation for.

pub mod capture;
pub mod credentials;
pub mod engine;
pub mod error;
pub mod ring_buffer;
pub mod session;
pub mod silence;

pub use engine::realtime::RealtimeAuth;
pub use error::{EngineError, ErrorKind, VoiceError};
pub use session::{EventSender, SessionEvent, SessionParams, SessionState, VoiceSession};
