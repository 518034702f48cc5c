//! Init parameters and their normalization/clamping.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::engine::BackendKind;
use crate::silence::clamp_silence_timeout;

/// Host-supplied init parameters. `silence_timeout_ms` is
/// raw milliseconds as received from the host; call [`SessionParams::silence_timeout`]
/// (done automatically by `VoiceSession::create`) to get the clamped
/// [`Duration`] actually used by the silence gate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionParams {
    pub backend: BackendKind,
    #[serde(default = "default_locate")]
    pub locate: String,
    #[serde(default = "default_rec_mode")]
    pub rec_mode: String,
    #[serde(default = "default_language")]
    pub language: String,
    /// Raw milliseconds; 0 means "use the default". Clamped to
    /// [300, 15000] by [`SessionParams::silence_timeout`].
    #[serde(default)]
    pub silence_timeout_ms: u64,
}

fn default_locate() -> String {
    "CN".to_string()
}

fn default_rec_mode() -> String {
    "short".to_string()
}

fn default_language() -> String {
    "zh-CN".to_string()
}

impl Default for SessionParams {
    fn default() -> Self {
        Self {
            backend: BackendKind::Recognition,
            locate: default_locate(),
            rec_mode: default_rec_mode(),
            language: default_language(),
            silence_timeout_ms: 0,
        }
    }
}

impl SessionParams {
    pub fn silence_timeout(&self) -> Duration {
        clamp_silence_timeout(self.silence_timeout_ms)
    }
}
