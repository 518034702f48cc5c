//! Silence / duplicate-final gate.
//!
//! Terminates a recognition-mode session when the final transcript stops
//! changing for `silence_timeout`. Grounded on `ai_asr.c`'s
//! `last_result`/`last_result_time` fields and its three timeout
//! constants; bypassed entirely in realtime-conversation mode (that
//! backend has no notion of a repeating final transcript — the
//! conversation's own `response.done` is the terminal signal instead).

use std::time::{Duration, Instant};

pub const DEFAULT_SILENCE_TIMEOUT: Duration = Duration::from_millis(3000);
pub const MIN_SILENCE_TIMEOUT: Duration = Duration::from_millis(300);
pub const MAX_SILENCE_TIMEOUT: Duration = Duration::from_millis(15000);

/// Clamp a caller-supplied timeout (0 meaning "use the default") into
/// `[MIN_SILENCE_TIMEOUT, MAX_SILENCE_TIMEOUT]`.
pub fn clamp_silence_timeout(requested_ms: u64) -> Duration {
    if requested_ms == 0 {
        return DEFAULT_SILENCE_TIMEOUT;
    }
    let requested = Duration::from_millis(requested_ms);
    requested.clamp(MIN_SILENCE_TIMEOUT, MAX_SILENCE_TIMEOUT)
}

/// Outcome of feeding a final transcript into the gate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateOutcome {
    /// Text changed (or this is the first final seen): forward it as-is.
    Forward,
    /// Text repeated past the timeout: synthesize a local `complete` and
    /// suppress the incoming result.
    SynthesizeComplete,
}

/// Tracks the last observed final transcript and when it was first seen,
/// so repeated identical finals can be turned into a soft timeout.
pub struct SilenceGate {
    timeout: Duration,
    last_text: Option<String>,
    last_seen: Option<Instant>,
}

impl SilenceGate {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            last_text: None,
            last_seen: None,
        }
    }

    /// Feed a final transcript observed at `now`. Only finals go through
    /// this gate — partials bypass it entirely (see DESIGN.md for why).
    pub fn observe_final(&mut self, text: &str, now: Instant) -> GateOutcome {
        match (&self.last_text, self.last_seen) {
            (Some(last), Some(seen)) if last == text => {
                if now.duration_since(seen) >= self.timeout {
                    GateOutcome::SynthesizeComplete
                } else {
                    GateOutcome::Forward
                }
            }
            _ => {
                self.last_text = Some(text.to_string());
                self.last_seen = Some(now);
                GateOutcome::Forward
            }
        }
    }
}
