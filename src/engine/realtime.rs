//! Realtime WebSocket conversation engine.
//!
//! Full-duplex JSON-over-WebSocket client, grounded on
//! `examples/original_source/src/conversation/volc/ai_volc_conversation.c`
//! for the protocol shape, state machine, and constants (128 KiB send
//! buffer, 1 s connect timeout, fixed `/v1/realtime` path), reimplemented
//! over `tokio-tungstenite` the way `examples/zouwei-moraya` talks to its
//! own websocket backend.

use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;

use super::{AudioHint, EngineEnv, EngineEvent, EventSink, VoiceEngine};
use crate::error::EngineError;
use crate::ring_buffer::RingBuffer;

/// Default realtime base URL; callers can point elsewhere via
/// [`RealtimeConfig::endpoint`] (e.g. in tests, a local echo server).
pub const DEFAULT_REALTIME_ENDPOINT: &str = "wss://ai-gateway.vei.volces.com/v1/realtime";

/// Outbound send-buffer capacity, matching the original `VOLC_BUFFER_MAX_SIZE`.
pub const OUTBOUND_BUFFER_CAPACITY: usize = 128 * 1024;

/// Connect timeout, matching the original `VOLC_TIMEOUT` of 1000 ms.
pub const CONNECT_TIMEOUT: Duration = Duration::from_millis(1000);

/// Max bytes drained into a single WebSocket frame per writable wakeup.
const FRAME_BUDGET: usize = 16 * 1024;

/// Credentials for the realtime backend. Both fields must be non-empty or
/// session creation is rejected synchronously (argument error).
#[derive(Debug, Clone, Default)]
pub struct RealtimeAuth {
    pub app_id: String,
    pub app_key: String,
    pub model: String,
}

impl RealtimeAuth {
    pub fn validate(&self) -> Result<(), String> {
        if self.app_id.trim().is_empty() {
            return Err("app_id".to_string());
        }
        if self.app_key.trim().is_empty() {
            return Err("app_key".to_string());
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct RealtimeConfig {
    pub endpoint: String,
    pub auth: RealtimeAuth,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RealtimeState {
    Disconnected,
    Connecting,
    Connected,
    SessionCreated,
    Listening,
    Processing,
    Speaking,
    Error,
}

// ── Wire protocol ──

#[derive(Debug, Serialize)]
#[serde(tag = "type")]
enum Outgoing {
    #[serde(rename = "session.update")]
    SessionUpdate { session: SessionUpdateBody },
    #[serde(rename = "input_audio_buffer.append")]
    InputAudioBufferAppend { audio: String },
    #[serde(rename = "input_audio_buffer.commit")]
    InputAudioBufferCommit {},
    #[serde(rename = "input_audio_buffer.clear")]
    InputAudioBufferClear {},
    #[serde(rename = "response.create")]
    ResponseCreate { response: ResponseCreateBody },
    #[serde(rename = "response.cancel")]
    ResponseCancel {},
}

#[derive(Debug, Serialize)]
struct SessionUpdateBody {
    modalities: Vec<String>,
}

#[derive(Debug, Serialize)]
struct ResponseCreateBody {
    modalities: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum Incoming {
    #[serde(rename = "session.created")]
    SessionCreated {},
    #[serde(rename = "input_audio_buffer.committed")]
    InputAudioBufferCommitted {},
    #[serde(rename = "conversation.item.input_audio_transcription.completed")]
    TranscriptionCompleted { transcript: String },
    #[serde(rename = "response.created")]
    ResponseCreated { response: ResponseRef },
    #[serde(rename = "response.audio.delta")]
    ResponseAudioDelta { delta: String },
    #[serde(rename = "response.audio_transcript.delta")]
    ResponseAudioTranscriptDelta { delta: String },
    #[serde(rename = "response.done")]
    ResponseDone {},
    #[serde(rename = "error")]
    Error { error: ErrorBody },
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Deserialize)]
struct ResponseRef {
    id: String,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    message: String,
}

/// Length-prefix one JSON-encoded frame into the outbound ring buffer.
fn enqueue_frame(rb: &mut RingBuffer, payload: &[u8]) -> Result<(), EngineError> {
    let len = payload.len() as u32;
    let mut framed = Vec::with_capacity(4 + payload.len());
    framed.extend_from_slice(&len.to_be_bytes());
    framed.extend_from_slice(payload);
    rb.push(&framed).map_err(|_| EngineError::Backpressure)
}

/// Pop one complete frame off the front of the buffer, if any.
fn try_drain_frame(rb: &mut RingBuffer) -> Option<Vec<u8>> {
    let header = rb.peek(4)?;
    let len = u32::from_be_bytes([header[0], header[1], header[2], header[3]]) as usize;
    if rb.len() < 4 + len {
        return None;
    }
    rb.drain(4);
    Some(rb.drain(len))
}

pub struct RealtimeEngine {
    config: RealtimeConfig,
    sink: EventSink,
    outbound: Arc<StdMutex<RingBuffer>>,
    notify: Arc<Notify>,
    response_id: Arc<Mutex<Option<String>>>,
    connected: Arc<Mutex<bool>>,
    state: Arc<Mutex<RealtimeState>>,
    task: Option<JoinHandle<()>>,
}

impl RealtimeEngine {
    pub fn new(config: RealtimeConfig, sink: EventSink) -> Self {
        Self {
            config,
            sink,
            outbound: Arc::new(StdMutex::new(RingBuffer::new(OUTBOUND_BUFFER_CAPACITY))),
            notify: Arc::new(Notify::new()),
            response_id: Arc::new(Mutex::new(None)),
            connected: Arc::new(Mutex::new(false)),
            state: Arc::new(Mutex::new(RealtimeState::Disconnected)),
            task: None,
        }
    }

    /// Current position in the connection state machine (spec.md §4.2).
    pub async fn connection_state(&self) -> RealtimeState {
        *self.state.lock().await
    }

    fn enqueue(&self, payload: &[u8]) -> Result<(), EngineError> {
        let mut rb = self.outbound.lock().expect("outbound ring buffer poisoned");
        enqueue_frame(&mut rb, payload)?;
        drop(rb);
        self.notify.notify_one();
        Ok(())
    }

    fn send_outgoing_sync(&self, msg: &Outgoing) -> Result<(), EngineError> {
        let payload =
            serde_json::to_vec(msg).map_err(|e| EngineError::Backend(e.to_string()))?;
        self.enqueue(&payload)
    }
}

#[async_trait]
impl VoiceEngine for RealtimeEngine {
    async fn start(&mut self, _hint: Option<AudioHint>) -> Result<(), EngineError> {
        *self.state.lock().await = RealtimeState::Connecting;
        let mut request = self
            .config
            .endpoint
            .clone()
            .into_client_request()
            .map_err(|e| EngineError::Transport(e.to_string()))?;
        request.headers_mut().insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {}", self.config.auth.app_key))
                .map_err(|e| EngineError::Transport(e.to_string()))?,
        );

        let connect = tokio_tungstenite::connect_async(request);
        let (ws_stream, _response) = match tokio::time::timeout(CONNECT_TIMEOUT, connect).await {
            Ok(Ok(pair)) => pair,
            Ok(Err(e)) => {
                *self.state.lock().await = RealtimeState::Error;
                return Err(EngineError::from(e));
            }
            Err(_) => {
                *self.state.lock().await = RealtimeState::Error;
                return Err(EngineError::Transport("connect timed out".to_string()));
            }
        };

        *self.connected.lock().await = true;
        *self.state.lock().await = RealtimeState::Connected;
        let (mut write, mut read) = ws_stream.split();

        let outbound = self.outbound.clone();
        let notify = self.notify.clone();
        let response_id = self.response_id.clone();
        let connected = self.connected.clone();
        let state = self.state.clone();
        let sink = self.sink.clone();

        let task = tokio::spawn(async move {
            // The session layer emits `Start` itself once `start` returns
            // `Ok`; subsequent `Start`-mapped events below come from actual
            // protocol milestones (session.created, committed, response.created).
            loop {
                tokio::select! {
                    inbound = read.next() => {
                        match inbound {
                            Some(Ok(Message::Text(text))) => {
                                handle_inbound(&text, &sink, &response_id, &state).await;
                            }
                            Some(Ok(Message::Close(_))) | None => {
                                *connected.lock().await = false;
                                *state.lock().await = RealtimeState::Disconnected;
                                break;
                            }
                            Some(Err(e)) => {
                                let _ = sink.send(EngineEvent::Error(EngineError::from(e)));
                                *connected.lock().await = false;
                                *state.lock().await = RealtimeState::Error;
                                break;
                            }
                            _ => {}
                        }
                    }
                    _ = notify.notified() => {
                        let mut budget = FRAME_BUDGET;
                        loop {
                            let frame = {
                                let mut rb = outbound.lock().expect("outbound ring buffer poisoned");
                                try_drain_frame(&mut rb)
                            };
                            let Some(frame) = frame else { break };
                            let frame_len = frame.len();
                            if let Err(e) = write.send(Message::text(
                                String::from_utf8_lossy(&frame).into_owned(),
                            )).await {
                                let _ = sink.send(EngineEvent::Error(EngineError::from(e)));
                                *connected.lock().await = false;
                                *state.lock().await = RealtimeState::Error;
                                return;
                            }
                            // One full frame is always sent whole; the budget only
                            // bounds how many frames this wakeup drains before
                            // yielding back to the select (re-arming itself if more
                            // remain), matching "drains up to one frame per callback,
                            // bounded by frame budget, re-arms while data remains".
                            if frame_len >= budget {
                                notify.notify_one();
                                break;
                            }
                            budget -= frame_len;
                        }
                    }
                }
            }
        });
        self.task = Some(task);

        self.send_outgoing_sync(&Outgoing::SessionUpdate {
            session: SessionUpdateBody {
                modalities: vec!["text".to_string(), "audio".to_string()],
            },
        })
    }

    fn write_audio(&mut self, bytes: &[u8]) -> Result<(), EngineError> {
        use base64::Engine;
        let audio = base64::engine::general_purpose::STANDARD.encode(bytes);
        self.send_outgoing_sync(&Outgoing::InputAudioBufferAppend { audio })
    }

    async fn finish(&mut self) -> Result<(), EngineError> {
        self.send_outgoing_sync(&Outgoing::InputAudioBufferCommit {})?;
        self.send_outgoing_sync(&Outgoing::ResponseCreate {
            response: ResponseCreateBody {
                modalities: vec!["text".to_string(), "audio".to_string()],
            },
        })
    }

    async fn cancel(&mut self) -> Result<(), EngineError> {
        if self.response_id.lock().await.is_some() {
            self.send_outgoing_sync(&Outgoing::ResponseCancel {})?;
        }
        Ok(())
    }

    fn env(&self) -> EngineEnv {
        EngineEnv {
            preferred_format: "s16le, 16 kHz, mono".to_string(),
            force_format: true,
        }
    }

    async fn uninit(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl RealtimeEngine {
    /// Whether the socket task believes it still has a live connection.
    pub async fn is_connected(&self) -> bool {
        *self.connected.lock().await
    }
}

async fn handle_inbound(
    text: &str,
    sink: &EventSink,
    response_id: &Arc<Mutex<Option<String>>>,
    state: &Arc<Mutex<RealtimeState>>,
) {
    let parsed: Result<Incoming, _> = serde_json::from_str(text);
    match parsed {
        Ok(Incoming::SessionCreated {}) => {
            *state.lock().await = RealtimeState::SessionCreated;
            let _ = sink.send(EngineEvent::Start);
        }
        Ok(Incoming::InputAudioBufferCommitted {}) => {
            *state.lock().await = RealtimeState::Processing;
            let _ = sink.send(EngineEvent::Start);
        }
        Ok(Incoming::TranscriptionCompleted { transcript }) => {
            let _ = sink.send(EngineEvent::FinalText(transcript));
        }
        Ok(Incoming::ResponseCreated { response }) => {
            *response_id.lock().await = Some(response.id);
            *state.lock().await = RealtimeState::Speaking;
            let _ = sink.send(EngineEvent::Start);
        }
        Ok(Incoming::ResponseAudioDelta { delta }) => {
            use base64::Engine;
            match base64::engine::general_purpose::STANDARD.decode(delta) {
                Ok(bytes) => {
                    let _ = sink.send(EngineEvent::Audio(bytes));
                }
                Err(e) => {
                    let _ = sink.send(EngineEvent::Error(EngineError::Backend(e.to_string())));
                }
            }
        }
        Ok(Incoming::ResponseAudioTranscriptDelta { delta }) => {
            let _ = sink.send(EngineEvent::PartialText(delta));
        }
        Ok(Incoming::ResponseDone {}) => {
            *response_id.lock().await = None;
            *state.lock().await = RealtimeState::SessionCreated;
            let _ = sink.send(EngineEvent::Complete);
        }
        Ok(Incoming::Error { error }) => {
            *state.lock().await = RealtimeState::Error;
            let _ = sink.send(EngineEvent::Error(EngineError::Backend(error.message)));
        }
        Ok(Incoming::Unknown) => {}
        Err(e) => {
            log::warn!("realtime: failed to parse inbound frame: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_round_trip_through_ring_buffer() {
        let mut rb = RingBuffer::new(4096);
        enqueue_frame(&mut rb, b"hello").unwrap();
        enqueue_frame(&mut rb, b"world!").unwrap();
        assert_eq!(try_drain_frame(&mut rb).unwrap(), b"hello".to_vec());
        assert_eq!(try_drain_frame(&mut rb).unwrap(), b"world!".to_vec());
        assert!(try_drain_frame(&mut rb).is_none());
    }

    #[test]
    fn enqueue_past_capacity_is_rejected() {
        let mut rb = RingBuffer::new(16);
        // 4-byte header + 20-byte payload exceeds capacity
        let err = enqueue_frame(&mut rb, &vec![0u8; 20]);
        assert!(matches!(err, Err(EngineError::Backpressure)));
    }

    #[tokio::test]
    async fn inbound_messages_drive_the_connection_state_machine() {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let response_id = Arc::new(Mutex::new(None));
        let state = Arc::new(Mutex::new(RealtimeState::Connected));

        handle_inbound(r#"{"type":"session.created"}"#, &tx, &response_id, &state).await;
        assert_eq!(*state.lock().await, RealtimeState::SessionCreated);

        handle_inbound(
            r#"{"type":"input_audio_buffer.committed"}"#,
            &tx,
            &response_id,
            &state,
        )
        .await;
        assert_eq!(*state.lock().await, RealtimeState::Processing);

        handle_inbound(
            r#"{"type":"response.created","response":{"id":"resp-1"}}"#,
            &tx,
            &response_id,
            &state,
        )
        .await;
        assert_eq!(*state.lock().await, RealtimeState::Speaking);
        assert_eq!(response_id.lock().await.as_deref(), Some("resp-1"));

        handle_inbound(r#"{"type":"response.done"}"#, &tx, &response_id, &state).await;
        assert_eq!(*state.lock().await, RealtimeState::SessionCreated);
        assert!(response_id.lock().await.is_none());

        handle_inbound(
            r#"{"type":"error","error":{"message":"boom"}}"#,
            &tx,
            &response_id,
            &state,
        )
        .await;
        assert_eq!(*state.lock().await, RealtimeState::Error);

        drop(tx);
        let mut seen = Vec::new();
        while let Some(ev) = rx.recv().await {
            seen.push(ev);
        }
        assert!(seen.len() >= 5);
    }

    #[test]
    fn incoming_message_kinds_deserialize() {
        let msg: Incoming = serde_json::from_str(r#"{"type":"response.done"}"#).unwrap();
        assert!(matches!(msg, Incoming::ResponseDone {}));

        let msg: Incoming = serde_json::from_str(
            r#"{"type":"conversation.item.input_audio_transcription.completed","transcript":"hello"}"#,
        )
        .unwrap();
        match msg {
            Incoming::TranscriptionCompleted { transcript } => assert_eq!(transcript, "hello"),
            _ => panic!("wrong variant"),
        }

        let msg: Incoming = serde_json::from_str(r#"{"type":"something.unrecognized"}"#).unwrap();
        assert!(matches!(msg, Incoming::Unknown));
    }

    #[test]
    fn base64_round_trip_arbitrary_bytes() {
        use base64::Engine;
        let samples: &[&[u8]] = &[b"", b"\x00\x01\x02", b"hello world", &[0xffu8; 37]];
        for &s in samples {
            let encoded = base64::engine::general_purpose::STANDARD.encode(s);
            let decoded = base64::engine::general_purpose::STANDARD
                .decode(encoded)
                .unwrap();
            assert_eq!(decoded, s);
        }
    }

    #[test]
    fn auth_rejects_empty_fields() {
        let auth = RealtimeAuth {
            app_id: String::new(),
            app_key: "key".to_string(),
            model: "model".to_string(),
        };
        assert_eq!(auth.validate(), Err("app_id".to_string()));
    }
}
