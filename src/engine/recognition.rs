//! Streaming recognition engine.
//!
//! Symmetric to the realtime conversation engine but without audio output:
//! ingests PCM chunks and emits partial/final transcripts. Grounded on
//! `ai_asr.c`'s message table and default silence-timeout constants (300 /
//! 3000 / 15000 ms), which live in [`crate::silence`] rather than here —
//! this module only owns the transcript production side.

use async_trait::async_trait;

use super::{AudioHint, EngineEnv, EngineEvent, EventSink, VoiceEngine};
use crate::error::EngineError;

/// Adapter seam for a production streaming-ASR backend (vendor HTTP/WS
/// client). The crate ships [`MockRecognitionEngine`] as the default local
/// implementation; a host can substitute a real backend by implementing
/// this trait and handing it to `RecognitionEngine::with_backend`.
#[async_trait]
pub trait RecognitionBackend: Send {
    async fn start(&mut self) -> Result<(), EngineError>;
    fn feed(&mut self, bytes: &[u8]) -> Result<(), EngineError>;
    async fn finish(&mut self) -> Result<(), EngineError>;
    async fn cancel(&mut self) -> Result<(), EngineError>;
}

/// Deterministic in-process backend used as the default recognition engine
/// and as the fixture for session/state-machine tests. Echoes back a fixed
/// transcript derived from how many bytes it has seen, so tests can drive
/// exact partial/final sequences without a real vendor dependency.
pub struct MockRecognitionEngine {
    sink: EventSink,
    bytes_seen: usize,
    finished: bool,
}

impl MockRecognitionEngine {
    pub fn new(sink: EventSink) -> Self {
        Self {
            sink,
            bytes_seen: 0,
            finished: false,
        }
    }
}

#[async_trait]
impl VoiceEngine for MockRecognitionEngine {
    async fn start(&mut self, _hint: Option<AudioHint>) -> Result<(), EngineError> {
        // The session layer emits `Start` itself once this call returns
        // `Ok`; this backend has no further connect-phase event to report.
        Ok(())
    }

    fn write_audio(&mut self, bytes: &[u8]) -> Result<(), EngineError> {
        self.bytes_seen += bytes.len();
        let partial = format!("<{} bytes>", self.bytes_seen);
        let _ = self.sink.send(EngineEvent::PartialText(partial));
        Ok(())
    }

    async fn finish(&mut self) -> Result<(), EngineError> {
        if self.finished {
            return Ok(());
        }
        self.finished = true;
        let final_text = format!("final:{}", self.bytes_seen);
        let _ = self.sink.send(EngineEvent::FinalText(final_text));
        let _ = self.sink.send(EngineEvent::Complete);
        Ok(())
    }

    async fn cancel(&mut self) -> Result<(), EngineError> {
        if self.finished {
            return Ok(());
        }
        self.finished = true;
        let _ = self.sink.send(EngineEvent::Complete);
        Ok(())
    }

    fn env(&self) -> EngineEnv {
        EngineEnv {
            preferred_format: "s16le, 16 kHz, mono".to_string(),
            force_format: false,
        }
    }
}

/// Wraps any [`RecognitionBackend`] as a [`VoiceEngine`]; the backend is
/// responsible for calling back into the sink via whatever async mechanism
/// it uses internally (mirrors how the realtime engine owns its socket
/// task). Kept separate from `MockRecognitionEngine` so a production
/// backend never needs to touch engine-loop plumbing directly.
pub struct RecognitionEngine<B: RecognitionBackend> {
    backend: B,
}

impl<B: RecognitionBackend> RecognitionEngine<B> {
    pub fn with_backend(backend: B) -> Self {
        Self { backend }
    }
}

#[async_trait]
impl<B: RecognitionBackend + 'static> VoiceEngine for RecognitionEngine<B> {
    async fn start(&mut self, _hint: Option<AudioHint>) -> Result<(), EngineError> {
        self.backend.start().await
    }

    fn write_audio(&mut self, bytes: &[u8]) -> Result<(), EngineError> {
        self.backend.feed(bytes)
    }

    async fn finish(&mut self) -> Result<(), EngineError> {
        self.backend.finish().await
    }

    async fn cancel(&mut self) -> Result<(), EngineError> {
        self.backend.cancel().await
    }

    fn env(&self) -> EngineEnv {
        EngineEnv {
            preferred_format: "s16le, 16 kHz, mono".to_string(),
            force_format: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn emits_partial_then_terminal_on_finish() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut engine = MockRecognitionEngine::new(tx);
        engine.start(None).await.unwrap();
        engine.write_audio(&[0u8; 10]).unwrap();
        engine.finish().await.unwrap();

        assert!(matches!(rx.recv().await, Some(EngineEvent::PartialText(_))));
        assert!(matches!(rx.recv().await, Some(EngineEvent::FinalText(_))));
        assert!(matches!(rx.recv().await, Some(EngineEvent::Complete)));
    }

    #[tokio::test]
    async fn cancel_is_terminal_and_idempotent() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut engine = MockRecognitionEngine::new(tx);
        engine.start(None).await.unwrap();
        engine.cancel().await.unwrap();
        engine.cancel().await.unwrap(); // idempotent, no second Complete
        drop(engine);

        assert!(matches!(rx.recv().await, Some(EngineEvent::Complete)));
        assert!(rx.recv().await.is_none());
    }
}
