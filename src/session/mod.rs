//! Session state machine and cross-loop message bus.
//!
//! One Tokio task per session (the "engine loop") owns all mutable session
//! state and drains a single `mpsc::UnboundedReceiver<Command>`. Commands
//! arrive from the public [`VoiceSession`] handle (any thread may send;
//! only this task receives), and the active [`VoiceEngine`]'s own events
//! are relayed back onto the *same* queue as `Command::EngineCallback`,
//! so there is one message bus rather than two.

pub mod params;

use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{mpsc, oneshot};

pub use params::SessionParams;

use crate::capture::cpal_backend::CpalRecorder;
use crate::capture::{
    self, AlwaysGrantFocusManager, CaptureState, FocusManager, FocusSuggestion, PcmReceiver,
    Recorder,
};
use crate::credentials::{CredentialStore, EnvCredentialStore};
use crate::engine::realtime::{RealtimeAuth, RealtimeConfig, RealtimeEngine, DEFAULT_REALTIME_ENDPOINT};
use crate::engine::recognition::MockRecognitionEngine;
use crate::engine::{AudioHint, BackendKind, EngineEvent, VoiceEngine};
use crate::error::{ErrorKind, VoiceError};
use crate::silence::{GateOutcome, SilenceGate};

/// Session lifecycle state. Transitions are monotonic:
/// INIT → STARTED → (FINISHING|CANCELLED) → CLOSED. No backward edges.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Init,
    Started,
    Finishing,
    Cancelled,
    Closed,
}

/// The closed event set delivered to the listener.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    Start,
    Text { text: String, is_final: bool },
    Audio(Vec<u8>),
    Complete,
    Error { kind: ErrorKind, message: String },
    Stop,
    Closed,
}

/// Where listener callbacks land. If the host never calls
/// [`VoiceSession::set_listener`], events are produced and dropped — the
/// lifecycle still progresses regardless.
pub type EventSender = mpsc::UnboundedSender<SessionEvent>;

enum Command {
    SetListener {
        listener: EventSender,
        reply: oneshot::Sender<Result<(), VoiceError>>,
    },
    Start {
        hint: Option<AudioHint>,
        reply: oneshot::Sender<Result<(), VoiceError>>,
    },
    Finish {
        reply: oneshot::Sender<Result<(), VoiceError>>,
    },
    Cancel {
        reply: oneshot::Sender<Result<(), VoiceError>>,
    },
    IsBusy {
        reply: oneshot::Sender<bool>,
    },
    Close {
        reply: oneshot::Sender<Result<(), VoiceError>>,
    },
    GetState {
        reply: oneshot::Sender<SessionState>,
    },
    EngineCallback(EngineEvent),
}

/// Constructs a fresh [`Recorder`] for each `start`; production sessions use
/// a factory that builds [`CpalRecorder`], tests substitute a fake.
type RecorderFactory = Arc<dyn Fn() -> Box<dyn Recorder> + Send + Sync>;

/// Public, cloneable handle to a session. Every method serializes a
/// command onto the engine loop and awaits its reply.
#[derive(Clone)]
pub struct VoiceSession {
    tx: mpsc::UnboundedSender<Command>,
}

impl VoiceSession {
    /// Create a session using whatever credentials
    /// [`EnvCredentialStore`] finds for a realtime backend, or no
    /// credentials at all for recognition mode.
    pub async fn create(params: SessionParams) -> Result<Self, VoiceError> {
        let auth = match params.backend {
            BackendKind::RealtimeConversation => {
                let store = EnvCredentialStore;
                Some(
                    store
                        .get("realtime")
                        .ok_or_else(|| VoiceError::InvalidAuth("app_id".to_string()))?,
                )
            }
            BackendKind::Recognition => None,
        };
        Self::spawn(params, auth).await
    }

    /// Create a session with explicit realtime credentials. Always
    /// selects the realtime-conversation backend. Rejects synchronously
    /// on empty `app_id`/`app_key`.
    pub async fn create_with_auth(
        mut params: SessionParams,
        auth: RealtimeAuth,
    ) -> Result<Self, VoiceError> {
        auth.validate().map_err(VoiceError::InvalidAuth)?;
        params.backend = BackendKind::RealtimeConversation;
        Self::spawn(params, Some(auth)).await
    }

    async fn spawn(params: SessionParams, auth: Option<RealtimeAuth>) -> Result<Self, VoiceError> {
        let recorder_factory: RecorderFactory =
            Arc::new(|| Box::new(CpalRecorder::default()) as Box<dyn Recorder>);
        let focus: Arc<dyn FocusManager> = Arc::new(AlwaysGrantFocusManager);
        Self::spawn_inner(params, auth, recorder_factory, focus).await
    }

    /// Test-only entry point: substitutes the recorder and focus manager so
    /// the full engine-loop lifecycle (start → capture → silence-gate →
    /// teardown) can be exercised without real microphone hardware, mirroring
    /// the `FailingRecorder`/`AlwaysGrantFocusManager` fakes already used to
    /// unit-test `capture::start_capture` directly.
    #[cfg(test)]
    async fn spawn_for_test(
        params: SessionParams,
        recorder_factory: RecorderFactory,
        focus: Arc<dyn FocusManager>,
    ) -> Result<Self, VoiceError> {
        Self::spawn_inner(params, None, recorder_factory, focus).await
    }

    async fn spawn_inner(
        params: SessionParams,
        auth: Option<RealtimeAuth>,
        recorder_factory: RecorderFactory,
        focus: Arc<dyn FocusManager>,
    ) -> Result<Self, VoiceError> {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (engine_event_tx, engine_event_rx) = mpsc::unbounded_channel();

        let engine: Box<dyn VoiceEngine> = match params.backend {
            BackendKind::Recognition => Box::new(MockRecognitionEngine::new(engine_event_tx)),
            BackendKind::RealtimeConversation => {
                let auth = auth.ok_or_else(|| VoiceError::InvalidAuth("app_id".to_string()))?;
                auth.validate().map_err(VoiceError::InvalidAuth)?;
                let endpoint = format!("{DEFAULT_REALTIME_ENDPOINT}?model={}", auth.model);
                Box::new(RealtimeEngine::new(
                    RealtimeConfig { endpoint, auth },
                    engine_event_tx,
                ))
            }
        };

        // Relay the engine's own event sink onto the single command queue
        // as `Command::EngineCallback` — one queue, every message kind.
        let relay_tx = cmd_tx.clone();
        tokio::spawn(async move {
            let mut rx = engine_event_rx;
            while let Some(ev) = rx.recv().await {
                if relay_tx.send(Command::EngineCallback(ev)).is_err() {
                    break;
                }
            }
        });

        let inner = SessionInner::new(engine, params, recorder_factory, focus);
        tokio::spawn(run_engine_loop(inner, cmd_rx));

        Ok(Self { tx: cmd_tx })
    }

    pub async fn set_listener(&self, listener: EventSender) -> Result<(), VoiceError> {
        self.call(|reply| Command::SetListener { listener, reply }).await
    }

    pub async fn start(&self, hint: Option<AudioHint>) -> Result<(), VoiceError> {
        self.call(|reply| Command::Start { hint, reply }).await
    }

    pub async fn finish(&self) -> Result<(), VoiceError> {
        self.call_idempotent(|reply| Command::Finish { reply }).await
    }

    pub async fn cancel(&self) -> Result<(), VoiceError> {
        self.call_idempotent(|reply| Command::Cancel { reply }).await
    }

    /// No-op if the session is already closed (spec.md §4.6 guard). The
    /// engine loop exits once it reaches `Closed` (see `run_engine_loop`),
    /// so a second `close()` finds the command channel gone rather than a
    /// live task to ask — that is itself proof the session is closed, not
    /// a failure, so it's treated as the same `Ok(())` a live `Close`
    /// command would have returned.
    pub async fn close(&self) -> Result<(), VoiceError> {
        self.call_idempotent(|reply| Command::Close { reply }).await
    }

    pub async fn is_busy(&self) -> bool {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self.tx.send(Command::IsBusy { reply: reply_tx }).is_err() {
            return false;
        }
        reply_rx.await.unwrap_or(false)
    }

    pub async fn state(&self) -> SessionState {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self.tx.send(Command::GetState { reply: reply_tx }).is_err() {
            return SessionState::Closed;
        }
        reply_rx.await.unwrap_or(SessionState::Closed)
    }

    async fn call<F>(&self, f: F) -> Result<(), VoiceError>
    where
        F: FnOnce(oneshot::Sender<Result<(), VoiceError>>) -> Command,
    {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx.send(f(reply_tx)).map_err(|_| VoiceError::EngineGone)?;
        reply_rx.await.map_err(|_| VoiceError::EngineGone)?
    }

    /// Like [`Self::call`], but for commands that are guard-no-ops once the
    /// session is closed (`finish`/`cancel`/`close`): a gone engine loop is
    /// indistinguishable from "already closed" from the caller's side, so
    /// it is reported the same way, as `Ok(())`, rather than `EngineGone`.
    async fn call_idempotent<F>(&self, f: F) -> Result<(), VoiceError>
    where
        F: FnOnce(oneshot::Sender<Result<(), VoiceError>>) -> Command,
    {
        match self.call(f).await {
            Err(VoiceError::EngineGone) => Ok(()),
            other => other,
        }
    }
}

/// Everything the engine loop owns exclusively; never shared with another
/// task except through the channels threaded into [`run_engine_loop`].
struct SessionInner {
    id: uuid::Uuid,
    backend: BackendKind,
    engine: Box<dyn VoiceEngine>,
    state: SessionState,
    listener: Option<EventSender>,
    capture: Option<CaptureState>,
    pcm_rx: Option<PcmReceiver>,
    focus_rx: Option<mpsc::UnboundedReceiver<FocusSuggestion>>,
    focus: Arc<dyn FocusManager>,
    recorder_factory: RecorderFactory,
    dedup: SilenceGate,
    terminal_sent: bool,
    closing: bool,
}

impl SessionInner {
    fn new(
        engine: Box<dyn VoiceEngine>,
        params: SessionParams,
        recorder_factory: RecorderFactory,
        focus: Arc<dyn FocusManager>,
    ) -> Self {
        let dedup = SilenceGate::new(params.silence_timeout());
        let id = uuid::Uuid::new_v4();
        log::info!("session {id}: created ({:?} backend)", params.backend);
        Self {
            id,
            backend: params.backend,
            engine,
            state: SessionState::Init,
            listener: None,
            capture: None,
            pcm_rx: None,
            focus_rx: None,
            focus,
            recorder_factory,
            dedup,
            terminal_sent: false,
            closing: false,
        }
    }

    fn emit(&mut self, event: SessionEvent) {
        if let Some(listener) = &self.listener {
            let _ = listener.send(event);
        }
    }

    /// Release capture, deliver the single terminal event for this
    /// session, then walk deterministically to CLOSED. No-op if a terminal
    /// event (or a prior teardown) already happened — at most one terminal
    /// event ever reaches the listener. Capture is torn down *before* the
    /// terminal event is emitted (spec.md §3 invariant 4: "capture
    /// resources are released before a terminal event is published") so a
    /// host reacting to `complete`/`error` by re-acquiring the microphone
    /// never races the still-open recorder or focus lease.
    async fn finish_with_terminal(&mut self, event: SessionEvent) {
        if self.terminal_sent {
            return;
        }
        self.terminal_sent = true;
        if self.state == SessionState::Started {
            self.state = SessionState::Finishing;
        }
        self.begin_teardown().await;
        self.emit(event);
        self.state = SessionState::Closed;
        self.emit(SessionEvent::Closed);
    }

    /// Two-phase-safe teardown: engine close and capture close run
    /// concurrently (mirrors the source's "whichever finishes second wins"
    /// rendezvous) via a join — both must complete before this returns.
    async fn begin_teardown(&mut self) {
        if self.closing {
            return;
        }
        self.closing = true;
        let capture = self.capture.take();
        self.pcm_rx = None;
        self.focus_rx = None;
        log::info!("session {}: tearing down (engine + capture)", self.id);
        tokio::join!(self.engine.uninit(), async move {
            if let Some(state) = capture {
                capture::teardown_capture(state).await;
            }
        });
        log::debug!("session {}: teardown complete", self.id);
    }

    async fn handle_start(&mut self, hint: Option<AudioHint>) -> Result<(), VoiceError> {
        match self.state {
            SessionState::Started => return Ok(()), // no-op, already started
            SessionState::Init => {}
            _ => {
                return Err(VoiceError::InvalidArgument(format!(
                    "cannot start from state {:?}",
                    self.state
                )))
            }
        }
        self.state = SessionState::Started;
        log::info!("session {}: starting", self.id);

        if let Err(e) = self.engine.start(hint.clone()).await {
            let kind = e.kind();
            let message = e.to_string();
            self.finish_with_terminal(SessionEvent::Error { kind, message }).await;
            return Ok(());
        }
        self.emit(SessionEvent::Start);

        let env = self.engine.env();
        let (pcm_tx, pcm_rx) = mpsc::unbounded_channel();
        let recorder: Box<dyn Recorder> = (self.recorder_factory)();
        match capture::start_capture(
            self.focus.clone(),
            recorder,
            &env,
            hint.as_ref().map(|h| h.format.as_str()),
            pcm_tx,
        )
        .await
        {
            Ok((state, changes)) => {
                self.capture = Some(state);
                self.pcm_rx = Some(pcm_rx);
                self.focus_rx = Some(changes);
            }
            Err(e) => {
                let kind = e.kind();
                let message = e.to_string();
                self.finish_with_terminal(SessionEvent::Error { kind, message }).await;
            }
        }
        Ok(())
    }

    async fn handle_finish(&mut self) -> Result<(), VoiceError> {
        if self.state != SessionState::Started {
            return Ok(()); // no-op unless STARTED
        }
        if let Err(e) = self.engine.finish().await {
            let kind = e.kind();
            let message = e.to_string();
            self.finish_with_terminal(SessionEvent::Error { kind, message }).await;
            return Ok(());
        }
        self.state = SessionState::Finishing;
        Ok(())
    }

    async fn handle_cancel(&mut self) -> Result<(), VoiceError> {
        if self.state != SessionState::Started {
            return Ok(()); // no-op unless STARTED
        }
        // Cancel suppresses whatever terminal event the backend would have
        // produced and substitutes a single neutral `Complete`; cancel
        // never surfaces as `Error`.
        let _ = self.engine.cancel().await;
        self.state = SessionState::Cancelled;
        self.finish_with_terminal(SessionEvent::Complete).await;
        Ok(())
    }

    async fn handle_close(&mut self) -> Result<(), VoiceError> {
        match self.state {
            SessionState::Closed => Ok(()), // no-op, already closed
            SessionState::Started => {
                // Closing a live session tears it down (cancel semantics)
                // rather than no-op'ing — see DESIGN.md.
                self.handle_cancel().await
            }
            _ => {
                self.finish_with_terminal(SessionEvent::Complete).await;
                Ok(())
            }
        }
    }

    fn handle_engine_event_sync(&mut self, event: EngineEvent) -> Option<SessionEvent> {
        match event {
            EngineEvent::Start => Some(SessionEvent::Start),
            EngineEvent::PartialText(text) => Some(SessionEvent::Text { text, is_final: false }),
            EngineEvent::Audio(bytes) => Some(SessionEvent::Audio(bytes)),
            EngineEvent::Stop => Some(SessionEvent::Stop),
            EngineEvent::FinalText(_) | EngineEvent::Complete | EngineEvent::Error(_) => None,
        }
    }

    async fn handle_engine_event(&mut self, event: EngineEvent) {
        match event {
            EngineEvent::FinalText(text) => {
                if self.backend == BackendKind::Recognition {
                    match self.dedup.observe_final(&text, Instant::now()) {
                        GateOutcome::Forward => {
                            self.emit(SessionEvent::Text { text, is_final: true });
                        }
                        GateOutcome::SynthesizeComplete => {
                            self.finish_with_terminal(SessionEvent::Complete).await;
                        }
                    }
                } else {
                    self.emit(SessionEvent::Text { text, is_final: true });
                }
            }
            EngineEvent::Complete => {
                self.finish_with_terminal(SessionEvent::Complete).await;
            }
            EngineEvent::Error(e) => {
                let kind = e.kind();
                let message = e.to_string();
                self.finish_with_terminal(SessionEvent::Error { kind, message }).await;
            }
            other => {
                if let Some(mapped) = self.handle_engine_event_sync(other) {
                    self.emit(mapped);
                }
            }
        }
    }

    async fn on_pcm(&mut self, chunk: Vec<u8>) {
        if self.state != SessionState::Started {
            return;
        }
        if let Err(e) = self.engine.write_audio(&chunk) {
            log::warn!("session {}: write_audio failed: {e}", self.id);
            let kind = e.kind();
            let message = e.to_string();
            self.finish_with_terminal(SessionEvent::Error { kind, message }).await;
        }
    }

    async fn on_focus_change(&mut self, suggestion: FocusSuggestion) {
        if suggestion != FocusSuggestion::Play && self.state == SessionState::Started {
            self.finish_with_terminal(SessionEvent::Complete).await;
        }
    }
}

async fn recv_optional<T>(rx: &mut Option<mpsc::UnboundedReceiver<T>>) -> Option<T> {
    match rx {
        Some(r) => r.recv().await,
        None => std::future::pending().await,
    }
}

async fn run_engine_loop(mut inner: SessionInner, mut cmd_rx: mpsc::UnboundedReceiver<Command>) {
    loop {
        if inner.state == SessionState::Closed {
            break;
        }
        tokio::select! {
            cmd = cmd_rx.recv() => {
                match cmd {
                    Some(cmd) => dispatch(&mut inner, cmd).await,
                    None => break,
                }
            }
            chunk = recv_optional(&mut inner.pcm_rx) => {
                match chunk {
                    Some(bytes) => inner.on_pcm(bytes).await,
                    None => inner.pcm_rx = None,
                }
            }
            suggestion = recv_optional(&mut inner.focus_rx) => {
                match suggestion {
                    Some(s) => inner.on_focus_change(s).await,
                    None => inner.focus_rx = None,
                }
            }
        }
    }
}

async fn dispatch(inner: &mut SessionInner, cmd: Command) {
    match cmd {
        Command::SetListener { listener, reply } => {
            inner.listener = Some(listener);
            let _ = reply.send(Ok(()));
        }
        Command::Start { hint, reply } => {
            let result = inner.handle_start(hint).await;
            let _ = reply.send(result);
        }
        Command::Finish { reply } => {
            let result = inner.handle_finish().await;
            let _ = reply.send(result);
        }
        Command::Cancel { reply } => {
            let result = inner.handle_cancel().await;
            let _ = reply.send(result);
        }
        Command::Close { reply } => {
            let result = inner.handle_close().await;
            let _ = reply.send(result);
        }
        Command::IsBusy { reply } => {
            let _ = reply.send(inner.state == SessionState::Started);
        }
        Command::GetState { reply } => {
            let _ = reply.send(inner.state);
        }
        Command::EngineCallback(event) => {
            inner.handle_engine_event(event).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::{FocusLease, NegotiatedFormat, PcmSender};
    use crate::error::EngineError;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex as StdMutex;

    fn recognition_params() -> SessionParams {
        SessionParams {
            backend: BackendKind::Recognition,
            ..SessionParams::default()
        }
    }

    /// Hands its `PcmSender` out through a shared slot so a test can push
    /// capture buffers into the running engine loop after `start` returns,
    /// and records whether `close` was ever called.
    #[derive(Clone, Default)]
    struct FakeRecorder {
        sink_slot: Arc<StdMutex<Option<PcmSender>>>,
        closed: Arc<AtomicBool>,
    }

    #[async_trait::async_trait]
    impl Recorder for FakeRecorder {
        async fn start(
            &mut self,
            _format: &str,
            sink: PcmSender,
        ) -> Result<NegotiatedFormat, EngineError> {
            *self.sink_slot.lock().unwrap() = Some(sink);
            Ok(NegotiatedFormat {
                container: "s16le, 16 kHz, mono".to_string(),
            })
        }

        async fn close(&mut self) {
            self.closed.store(true, Ordering::SeqCst);
            *self.sink_slot.lock().unwrap() = None;
        }
    }

    /// A recorder whose `start` must never be called — used to assert that
    /// focus denial aborts the pipeline before the recorder is ever opened.
    struct PanicsIfStarted;

    #[async_trait::async_trait]
    impl Recorder for PanicsIfStarted {
        async fn start(
            &mut self,
            _format: &str,
            _sink: PcmSender,
        ) -> Result<NegotiatedFormat, EngineError> {
            panic!("recorder.start must not be called when focus is denied");
        }
        async fn close(&mut self) {}
    }

    /// Grants (or denies) the initial request as configured, and hands its
    /// change channel's sender out through a shared slot so a test can
    /// simulate a later preemption notification.
    #[derive(Clone)]
    struct FakeFocusManager {
        initial: FocusSuggestion,
        changes_tx: Arc<StdMutex<Option<mpsc::UnboundedSender<FocusSuggestion>>>>,
    }

    impl FakeFocusManager {
        fn granting() -> Self {
            Self {
                initial: FocusSuggestion::Play,
                changes_tx: Arc::new(StdMutex::new(None)),
            }
        }

        fn denying() -> Self {
            Self {
                initial: FocusSuggestion::Other("pause".to_string()),
                changes_tx: Arc::new(StdMutex::new(None)),
            }
        }

        /// Push a later focus-change notification (e.g. preemption by
        /// another app). Panics if no session has requested focus yet.
        fn preempt(&self, suggestion: FocusSuggestion) {
            self.changes_tx
                .lock()
                .unwrap()
                .as_ref()
                .expect("focus not yet requested")
                .send(suggestion)
                .unwrap();
        }
    }

    #[async_trait::async_trait]
    impl FocusManager for FakeFocusManager {
        async fn request(&self, _scenario: &str) -> FocusLease {
            let (tx, rx) = mpsc::unbounded_channel();
            *self.changes_tx.lock().unwrap() = Some(tx);
            FocusLease {
                initial: self.initial.clone(),
                changes: rx,
            }
        }
        async fn abandon(&self) {}
    }

    /// Spawns a recognition-mode session wired to a [`FakeRecorder`] and the
    /// given focus manager, so `start`/capture/teardown can be driven without
    /// real microphone hardware.
    async fn spawn_recognition_with_fakes(
        focus: FakeFocusManager,
    ) -> (VoiceSession, FakeRecorder) {
        let recorder = FakeRecorder::default();
        let recorder_for_factory = recorder.clone();
        let factory: RecorderFactory =
            Arc::new(move || Box::new(recorder_for_factory.clone()) as Box<dyn Recorder>);
        let session = VoiceSession::spawn_for_test(recognition_params(), factory, Arc::new(focus))
            .await
            .unwrap();
        (session, recorder)
    }

    #[tokio::test]
    async fn fresh_session_is_init_and_not_busy() {
        let _ = env_logger::try_init();
        let session = VoiceSession::create(recognition_params()).await.unwrap();
        assert!(matches!(session.state().await, SessionState::Init));
        assert!(!session.is_busy().await);
    }

    #[tokio::test]
    async fn finish_and_cancel_are_no_ops_before_start() {
        let session = VoiceSession::create(recognition_params()).await.unwrap();
        session.finish().await.unwrap();
        assert!(matches!(session.state().await, SessionState::Init));
        session.cancel().await.unwrap();
        assert!(matches!(session.state().await, SessionState::Init));
    }

    #[tokio::test]
    async fn close_before_start_reaches_closed_and_emits_closed_event() {
        let session = VoiceSession::create(recognition_params()).await.unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        session.set_listener(tx).await.unwrap();

        session.close().await.unwrap();

        assert!(matches!(rx.recv().await, Some(SessionEvent::Complete)));
        assert!(matches!(rx.recv().await, Some(SessionEvent::Closed)));
        assert!(matches!(session.state().await, SessionState::Closed));
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        // Regression test: the engine loop task exits once it reaches
        // `Closed`, so a second `close()` finds the command channel gone
        // rather than a live task to ask. That must still read as the
        // no-op `Ok(())` spec.md §4.6 requires, not `Err(EngineGone)`.
        let session = VoiceSession::create(recognition_params()).await.unwrap();
        session.close().await.unwrap();
        session.close().await.unwrap();
        session.close().await.unwrap();
        assert!(matches!(session.state().await, SessionState::Closed));
        assert!(!session.is_busy().await);
        session.finish().await.unwrap();
        session.cancel().await.unwrap();
    }

    #[tokio::test]
    async fn create_with_auth_rejects_empty_credentials() {
        let auth = RealtimeAuth {
            app_id: String::new(),
            app_key: String::new(),
            model: "model".to_string(),
        };
        let result = VoiceSession::create_with_auth(SessionParams::default(), auth).await;
        assert!(matches!(result, Err(VoiceError::InvalidAuth(_))));
    }

    #[tokio::test]
    async fn create_recognition_session_without_credentials_succeeds() {
        assert!(VoiceSession::create(recognition_params()).await.is_ok());
    }

    // spec.md §8 end-to-end scenario 1 (happy-path recognition, abbreviated:
    // the silence-gate's own repeated-final timing is already covered by
    // silence::tests; this exercises start → capture → partial → finish →
    // complete → closed through the real engine loop).
    #[tokio::test]
    async fn happy_path_recognition_reaches_complete_then_closed() {
        let (session, recorder) = spawn_recognition_with_fakes(FakeFocusManager::granting()).await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        session.set_listener(tx).await.unwrap();

        session.start(None).await.unwrap();
        assert!(matches!(rx.recv().await, Some(SessionEvent::Start)));
        assert!(session.is_busy().await);

        let pcm_sink = recorder
            .sink_slot
            .lock()
            .unwrap()
            .clone()
            .expect("capture started, sink must be set");
        pcm_sink.send(vec![0u8; 320]).unwrap();
        assert!(matches!(
            rx.recv().await,
            Some(SessionEvent::Text { is_final: false, .. })
        ));

        session.finish().await.unwrap();
        assert!(matches!(
            rx.recv().await,
            Some(SessionEvent::Text { is_final: true, .. })
        ));
        assert!(matches!(rx.recv().await, Some(SessionEvent::Complete)));
        // Invariant 4 (spec.md §3): capture is released *before* the
        // terminal event is published, not merely before `closed`.
        assert!(
            recorder.closed.load(Ordering::SeqCst),
            "capture must be torn down before the terminal event, not just before closed"
        );
        assert!(matches!(rx.recv().await, Some(SessionEvent::Closed)));
        assert!(matches!(session.state().await, SessionState::Closed));
    }

    // spec.md §8 end-to-end scenario 2: cancel during streaming delivers
    // start, then exactly one terminal event (never Error — cancel is a
    // deliberate caller action), then closed.
    #[tokio::test]
    async fn cancel_during_streaming_emits_single_terminal_then_closed() {
        let (session, recorder) = spawn_recognition_with_fakes(FakeFocusManager::granting()).await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        session.set_listener(tx).await.unwrap();

        session.start(None).await.unwrap();
        assert!(matches!(rx.recv().await, Some(SessionEvent::Start)));

        let pcm_sink = recorder.sink_slot.lock().unwrap().clone().unwrap();
        pcm_sink.send(vec![0u8; 160]).unwrap();
        assert!(matches!(
            rx.recv().await,
            Some(SessionEvent::Text { is_final: false, .. })
        ));

        session.cancel().await.unwrap();
        assert!(matches!(rx.recv().await, Some(SessionEvent::Complete)));
        assert!(matches!(rx.recv().await, Some(SessionEvent::Closed)));
        assert!(matches!(session.state().await, SessionState::Cancelled | SessionState::Closed));

        // No further events arrive even if the backend kept pushing audio.
        drop(pcm_sink);
        assert!(rx.recv().await.is_none());
    }

    // spec.md §8 end-to-end scenario 3: focus preemption. Initial denial
    // aborts before the recorder ever opens; a later preemption after a
    // granted start tears capture down and synthesizes `complete`.
    #[tokio::test]
    async fn focus_denied_at_start_surfaces_media_error_without_opening_recorder() {
        let factory: RecorderFactory = Arc::new(|| Box::new(PanicsIfStarted) as Box<dyn Recorder>);
        let session = VoiceSession::spawn_for_test(
            recognition_params(),
            factory,
            Arc::new(FakeFocusManager::denying()),
        )
        .await
        .unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        session.set_listener(tx).await.unwrap();

        session.start(None).await.unwrap();

        assert!(matches!(rx.recv().await, Some(SessionEvent::Start)));
        assert!(matches!(
            rx.recv().await,
            Some(SessionEvent::Error { kind: ErrorKind::Media, .. })
        ));
        assert!(matches!(rx.recv().await, Some(SessionEvent::Closed)));
        assert!(matches!(session.state().await, SessionState::Closed));
    }

    #[tokio::test]
    async fn focus_preempted_mid_session_tears_down_and_completes() {
        let focus = FakeFocusManager::granting();
        let (session, recorder) = spawn_recognition_with_fakes(focus.clone()).await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        session.set_listener(tx).await.unwrap();

        session.start(None).await.unwrap();
        assert!(matches!(rx.recv().await, Some(SessionEvent::Start)));
        assert!(session.is_busy().await);

        focus.preempt(FocusSuggestion::Other("duck".to_string()));
        assert!(matches!(rx.recv().await, Some(SessionEvent::Complete)));
        assert!(matches!(rx.recv().await, Some(SessionEvent::Closed)));
        assert!(recorder.closed.load(Ordering::SeqCst));
    }
}
