//! Capture pipeline: focus acquisition, recorder lifecycle, PCM pipe.
//!
//! The host media subsystem (recorder open/prepare/start/close, the focus
//! manager) is an external collaborator — this module only defines the
//! seam ([`FocusManager`], [`Recorder`]) and the orchestration on top of
//! it. [`cpal_backend`] supplies a concrete, microphone-based default
//! [`Recorder`].

pub mod cpal_backend;

use async_trait::async_trait;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};

use crate::engine::EngineEnv;
use crate::error::EngineError;

/// PCM chunks flow from the recorder's audio thread into the engine loop
/// over this channel; the engine loop is the only place `write_audio` is
/// ever called, per the concurrency model.
pub type PcmSender = UnboundedSender<Vec<u8>>;
pub type PcmReceiver = UnboundedReceiver<Vec<u8>>;

/// The focus manager's suggestion for a scenario request. Only `Play`
/// grants capture; anything else aborts (initial request) or preempts
/// (later notification) the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FocusSuggestion {
    Play,
    Other(String),
}

/// A live focus reservation: the initial suggestion plus a stream of
/// subsequent changes (preemption by another app, headset unplug, etc).
pub struct FocusLease {
    pub initial: FocusSuggestion,
    pub changes: UnboundedReceiver<FocusSuggestion>,
}

#[async_trait]
pub trait FocusManager: Send + Sync {
    /// Request exclusive capture focus for `scenario` (e.g. "tts").
    async fn request(&self, scenario: &str) -> FocusLease;
    /// Release a previously granted lease.
    async fn abandon(&self);
}

#[derive(Debug, Clone)]
pub struct NegotiatedFormat {
    pub container: String,
}

#[async_trait]
pub trait Recorder: Send {
    /// Open, prepare, and start capture at `format`. Pushes raw PCM chunks
    /// onto `sink` verbatim until `close` is called.
    async fn start(&mut self, format: &str, sink: PcmSender) -> Result<NegotiatedFormat, EngineError>;

    /// Idempotent asynchronous teardown.
    async fn close(&mut self);
}

/// Live capture resources held by a started session.
pub struct CaptureState {
    pub recorder: Box<dyn Recorder>,
    pub focus: std::sync::Arc<dyn FocusManager>,
    pub format: NegotiatedFormat,
}

/// Step 1 of `start_l`: pick the format capture should request, honoring
/// `force_format` from the active engine.
pub fn negotiate_format(env: &EngineEnv, caller_format: Option<&str>) -> String {
    if !env.force_format {
        if let Some(f) = caller_format {
            if !f.is_empty() {
                return f.to_string();
            }
        }
    }
    env.preferred_format.clone()
}

/// Runs the capture start sequence: negotiate
/// format, request focus, open+start the recorder. Returns `Err(Media)`
/// without ever starting the recorder if focus is denied.
pub async fn start_capture(
    focus: std::sync::Arc<dyn FocusManager>,
    mut recorder: Box<dyn Recorder>,
    env: &EngineEnv,
    caller_format: Option<&str>,
    pcm_sink: PcmSender,
) -> Result<(CaptureState, UnboundedReceiver<FocusSuggestion>), EngineError> {
    let format = negotiate_format(env, caller_format);

    let lease = focus.request("tts").await;
    if lease.initial != FocusSuggestion::Play {
        focus.abandon().await;
        return Err(EngineError::Media("audio focus request denied".to_string()));
    }

    let negotiated = match recorder.start(&format, pcm_sink).await {
        Ok(n) => n,
        Err(e) => {
            focus.abandon().await;
            return Err(e);
        }
    };

    Ok((
        CaptureState {
            recorder,
            focus,
            format: negotiated,
        },
        lease.changes,
    ))
}

/// Idempotent two-phase-safe teardown: close the
/// recorder, then abandon focus. The session layer guards against
/// calling this more than once per session.
pub async fn teardown_capture(mut state: CaptureState) {
    state.recorder.close().await;
    state.focus.abandon().await;
}

/// A focus manager that always grants immediately and never preempts.
/// Default for hosts/tests that don't model audio-focus arbitration.
pub struct AlwaysGrantFocusManager;

#[async_trait]
impl FocusManager for AlwaysGrantFocusManager {
    async fn request(&self, _scenario: &str) -> FocusLease {
        let (_tx, rx) = tokio::sync::mpsc::unbounded_channel();
        FocusLease {
            initial: FocusSuggestion::Play,
            changes: rx,
        }
    }

    async fn abandon(&self) {}
}
