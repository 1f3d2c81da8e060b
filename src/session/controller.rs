//! The top-level session controller.
//!
//! Composes capture, segmentation, transport, playback and transcript
//! reconciliation behind the pure state machine in [`super::state`]. All
//! coordination happens on one event-loop thread over crossbeam channels;
//! the audio hot paths (capture polling, playback pacing) run on their own
//! threads and touch the loop only through messages and the two shared
//! atomics (`muted`, `outputting`).

use crate::audio::capture::CaptureSource;
use crate::audio::codec;
use crate::audio::encoder::{self, CaptureEvent, CaptureHandle};
use crate::audio::segmenter::{SegmenterEvent, SystemClock, UtteranceSegmenter};
use crate::config::{Config, SessionMode};
use crate::error::{Result, VoxcallError};
use crate::playback::{self, PlaybackEvent, PlaybackHandle, PlaybackSink};
use crate::session::state::{
    SessionInput, SessionState, SideEffect, can_toggle_mute, transition,
};
use crate::transcript::TranscriptReconciler;
use crate::transcription::TranscriptionBackend;
use crate::transport::channel::{Transport, TransportConnector, TransportEvent};
use crate::transport::protocol::{ClientEvent, ServerEvent};
use crate::transport::reconnect::ReconnectPolicy;
use crossbeam_channel::{Receiver, Sender, bounded, select, unbounded};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Host application callbacks.
///
/// `on_transcript` fires exactly once per turn; `on_fatal_error` only for
/// the failures the error policy actually surfaces (device unavailable,
/// exhausted reconnection, server-fatal errors).
pub trait SessionObserver: Send + Sync {
    fn on_transcript(&self, user_text: &str, ai_text: &str);
    fn on_state_change(&self, state: SessionState);
    fn on_fatal_error(&self, error: &VoxcallError);
}

/// Observer recording everything it sees, for tests and diagnostics.
#[derive(Default)]
pub struct CollectingObserver {
    pub transcripts: Mutex<Vec<(String, String)>>,
    pub states: Mutex<Vec<SessionState>>,
    pub fatal_errors: Mutex<Vec<String>>,
}

impl CollectingObserver {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn transcripts(&self) -> Vec<(String, String)> {
        self.transcripts.lock().map(|t| t.clone()).unwrap_or_default()
    }

    pub fn states(&self) -> Vec<SessionState> {
        self.states.lock().map(|s| s.clone()).unwrap_or_default()
    }

    pub fn fatal_errors(&self) -> Vec<String> {
        self.fatal_errors.lock().map(|e| e.clone()).unwrap_or_default()
    }

    pub fn last_state(&self) -> Option<SessionState> {
        self.states().last().copied()
    }
}

impl SessionObserver for CollectingObserver {
    fn on_transcript(&self, user_text: &str, ai_text: &str) {
        if let Ok(mut t) = self.transcripts.lock() {
            t.push((user_text.to_string(), ai_text.to_string()));
        }
    }

    fn on_state_change(&self, state: SessionState) {
        if let Ok(mut s) = self.states.lock() {
            s.push(state);
        }
    }

    fn on_fatal_error(&self, error: &VoxcallError) {
        if let Ok(mut e) = self.fatal_errors.lock() {
            e.push(error.to_string());
        }
    }
}

/// One session per host application instance.
static SESSION_ACTIVE: AtomicBool = AtomicBool::new(false);

enum HostCommand {
    End,
}

/// The engine's public handle: start/stop/mute operations for the host.
pub struct VoiceSessionController {
    cmd_tx: Sender<HostCommand>,
    state: Arc<Mutex<SessionState>>,
    muted: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl VoiceSessionController {
    /// Starts a session with explicit collaborators.
    ///
    /// # Errors
    /// Fails on invalid configuration or when a session is already active;
    /// everything after this point is reported through the observer.
    pub fn start(
        config: Config,
        connector: Box<dyn TransportConnector>,
        capture: Box<dyn CaptureSource>,
        sink: Box<dyn PlaybackSink>,
        transcription: Option<Arc<dyn TranscriptionBackend>>,
        observer: Arc<dyn SessionObserver>,
    ) -> Result<Self> {
        config.validate()?;
        if SESSION_ACTIVE
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(VoxcallError::Other(
                "a voice session is already active".to_string(),
            ));
        }

        let (cmd_tx, cmd_rx) = unbounded();
        let state = Arc::new(Mutex::new(SessionState::Idle));
        let muted = Arc::new(AtomicBool::new(false));

        let (frames_tx, frames_rx) = bounded(256);
        let (stt_tx, stt_rx) = unbounded();

        let playback = playback::spawn(config.playback_config(), sink, Arc::new(SystemClock));

        let response_pending = Arc::new(AtomicBool::new(false));
        let segmenter = match config.transport.mode {
            SessionMode::Chunked => Some(UtteranceSegmenter::new(
                config.segmenter_config(),
                response_pending.clone(),
            )),
            SessionMode::Streaming => None,
        };

        // Keepalive pair so the select loop never sees a dead channel while
        // no transport is installed.
        let (idle_tx, idle_rx) = unbounded();

        let event_loop = EventLoop {
            config,
            connector,
            observer,
            state: state.clone(),
            muted: muted.clone(),
            outputting: playback.outputting_flag(),
            response_pending,
            cmd_rx,
            frames_rx,
            _frames_tx: frames_tx.clone(),
            stt_rx,
            stt_tx,
            playback_events: playback.events(),
            playback,
            transport: None,
            transport_events: idle_rx,
            idle_events_tx: idle_tx,
            capture_source: Some(capture),
            capture_frames_tx: frames_tx,
            capture_handle: None,
            segmenter,
            reconciler: TranscriptReconciler::new(),
            transcription,
            recording: Vec::new(),
            recording_active: false,
            pending_user_audio: None,
            pending_user_text: None,
            audio_done: false,
            last_capture_error: None,
        };

        let thread = thread::spawn(move || {
            event_loop.run();
            SESSION_ACTIVE.store(false, Ordering::Release);
        });

        Ok(Self {
            cmd_tx,
            state,
            muted,
            thread: Some(thread),
        })
    }

    /// Current session state.
    pub fn state(&self) -> SessionState {
        self.state.lock().map(|s| *s).unwrap_or(SessionState::Idle)
    }

    /// Whether the microphone is muted.
    pub fn is_muted(&self) -> bool {
        self.muted.load(Ordering::Acquire)
    }

    /// Sets the mute gate. Valid in any state except `Connecting`.
    pub fn set_muted(&self, muted: bool) {
        if can_toggle_mute(self.state()) {
            self.muted.store(muted, Ordering::Release);
        }
    }

    /// Flips the mute gate and returns the new value.
    ///
    /// A no-op while `Connecting`; the session state never changes either
    /// way.
    pub fn toggle_mute(&self) -> bool {
        if can_toggle_mute(self.state()) {
            !self.muted.fetch_xor(true, Ordering::AcqRel)
        } else {
            self.is_muted()
        }
    }

    /// Ends the session: cancels timers, stops capture and playback
    /// synchronously, closes the transport, and joins the event loop.
    pub fn end(&mut self) {
        let _ = self.cmd_tx.send(HostCommand::End);
        if let Some(handle) = self.thread.take()
            && handle.join().is_err()
        {
            tracing::error!("session event loop panicked");
        }
    }

    /// Starts a session against real devices and the WebSocket transport.
    #[cfg(all(feature = "cpal-audio", feature = "rodio-audio"))]
    pub fn start_with_devices(
        config: Config,
        observer: Arc<dyn SessionObserver>,
    ) -> Result<Self> {
        use crate::audio::capture::CpalCaptureSource;
        use crate::playback::RodioPlaybackSink;
        use crate::transport::channel::WsConnector;

        let connector = WsConnector::new(
            config.transport.wire,
            Duration::from_secs(config.transport.heartbeat_secs),
        )?;
        let capture = CpalCaptureSource::new(config.audio.device.as_deref())?;
        let sink = RodioPlaybackSink::new()?;

        #[cfg(feature = "http-transcription")]
        let transcription: Option<Arc<dyn TranscriptionBackend>> =
            match &config.transcription.endpoint {
                Some(endpoint) => Some(Arc::new(crate::transcription::HttpTranscriptionBackend::new(
                    endpoint,
                    config.transcription.api_key.as_deref(),
                )?)),
                None => None,
            };
        #[cfg(not(feature = "http-transcription"))]
        let transcription: Option<Arc<dyn TranscriptionBackend>> = None;

        Self::start(
            config,
            Box::new(connector),
            Box::new(capture),
            Box::new(sink),
            transcription,
            observer,
        )
    }
}

impl Drop for VoiceSessionController {
    fn drop(&mut self) {
        self.end();
    }
}

struct EventLoop {
    config: Config,
    connector: Box<dyn TransportConnector>,
    observer: Arc<dyn SessionObserver>,
    state: Arc<Mutex<SessionState>>,
    muted: Arc<AtomicBool>,
    outputting: Arc<AtomicBool>,
    response_pending: Arc<AtomicBool>,

    cmd_rx: Receiver<HostCommand>,
    frames_rx: Receiver<CaptureEvent>,
    // Keeps the frames channel connected even after the encoder exits.
    _frames_tx: Sender<CaptureEvent>,
    stt_rx: Receiver<(u64, Option<String>)>,
    stt_tx: Sender<(u64, Option<String>)>,
    playback_events: Receiver<PlaybackEvent>,
    playback: PlaybackHandle,

    transport: Option<Box<dyn Transport>>,
    transport_events: Receiver<TransportEvent>,
    idle_events_tx: Sender<TransportEvent>,

    capture_source: Option<Box<dyn CaptureSource>>,
    capture_frames_tx: Sender<CaptureEvent>,
    capture_handle: Option<CaptureHandle>,

    segmenter: Option<UtteranceSegmenter>,
    reconciler: TranscriptReconciler,
    transcription: Option<Arc<dyn TranscriptionBackend>>,

    /// Streaming mode: utterance audio recorded between the server's
    /// speech-start and speech-stop signals.
    recording: Vec<i16>,
    recording_active: bool,
    /// Utterance audio awaiting its turn, for batch transcription.
    pending_user_audio: Option<Vec<i16>>,
    /// Inline user transcript that arrived before the turn opened.
    pending_user_text: Option<String>,
    /// The open turn has received `audio.done`.
    audio_done: bool,
    last_capture_error: Option<String>,
}

impl EventLoop {
    fn run(mut self) {
        self.apply(SessionInput::StartRequested);
        if !self.connect_with_backoff() {
            self.teardown();
            return;
        }

        let tick = Duration::from_millis(50);
        loop {
            // Clone the receivers so the select arms can borrow self
            // mutably; clones are cheap and transport_events may be swapped
            // by a reconnect inside a handler.
            let cmd_rx = self.cmd_rx.clone();
            let transport_rx = self.transport_events.clone();
            let frames_rx = self.frames_rx.clone();
            let playback_rx = self.playback_events.clone();
            let stt_rx = self.stt_rx.clone();

            select! {
                recv(cmd_rx) -> msg => match msg {
                    Ok(HostCommand::End) | Err(_) => self.apply(SessionInput::EndRequested),
                },
                recv(transport_rx) -> msg => match msg {
                    Ok(event) => self.handle_transport_event(event),
                    Err(_) => self.handle_transport_gone(),
                },
                recv(frames_rx) -> msg => {
                    if let Ok(event) = msg {
                        self.handle_capture_event(event);
                    }
                },
                recv(playback_rx) -> msg => {
                    if let Ok(PlaybackEvent::Drained) = msg {
                        self.apply(SessionInput::PlaybackDrained);
                    }
                },
                recv(stt_rx) -> msg => {
                    if let Ok((seq, result)) = msg {
                        self.handle_transcription_result(seq, result);
                    }
                },
                default(tick) => {
                    self.poll_segmenter();
                }
            }

            if self.current_state() == SessionState::Idle {
                break;
            }
        }

        self.teardown();
    }

    fn current_state(&self) -> SessionState {
        self.state.lock().map(|s| *s).unwrap_or(SessionState::Idle)
    }

    /// Run one transition through the pure state machine and execute its
    /// effects.
    fn apply(&mut self, input: SessionInput) {
        let current = self.current_state();
        let t = transition(current, input);
        if let Ok(mut state) = self.state.lock() {
            *state = t.next;
        }
        for effect in t.effects {
            self.run_effect(effect, t.next);
        }
    }

    fn run_effect(&mut self, effect: SideEffect, next: SessionState) {
        match effect {
            SideEffect::NotifyState => self.observer.on_state_change(next),
            SideEffect::ArmCapture => self.arm_capture(),
            SideEffect::ReleaseCapture => {
                if let Some(mut handle) = self.capture_handle.take() {
                    handle.stop();
                }
            }
            SideEffect::EngageGate => self.outputting.store(true, Ordering::Release),
            SideEffect::BeginTurn => self.begin_turn(),
            SideEffect::FinalizeTurn => self.finalize_turn(),
            SideEffect::InterruptPlayback => {
                self.playback.interrupt();
                // A following EngageGate re-arms the flag when the
                // interrupt opens a new turn; teardown paths leave it off.
                self.playback.clear_outputting();
            }
            SideEffect::StopPlayback => {
                self.playback.interrupt();
                self.playback.clear_outputting();
            }
            SideEffect::CloseTransport => self.drop_transport(true),
            SideEffect::Reconnect => {
                self.drop_transport(false);
                self.connect_with_backoff();
            }
            SideEffect::SurfaceReconnectExhausted => {
                self.observer.on_fatal_error(&VoxcallError::ReconnectExhausted {
                    attempts: self.config.transport.reconnect_max_attempts,
                });
            }
            SideEffect::SurfaceCaptureFailure => {
                let message = self
                    .last_capture_error
                    .take()
                    .unwrap_or_else(|| "capture failed".to_string());
                self.observer
                    .on_fatal_error(&VoxcallError::DeviceUnavailable { message });
            }
        }
    }

    // ── connection ───────────────────────────────────────────────────

    /// Connect, retrying per the policy. Returns false when the session is
    /// over (exhausted attempts or an End during backoff).
    fn connect_with_backoff(&mut self) -> bool {
        let mut policy: ReconnectPolicy = self.config.reconnect_policy();
        let url = self.config.transport.url.clone();

        loop {
            match self.connector.connect(&url) {
                Ok(transport) => {
                    // Any successful connection resets the attempt counter.
                    policy.reset();
                    self.transport_events = transport.events();
                    self.transport = Some(transport);
                    return true;
                }
                Err(e) if e.is_retryable_connect() => {
                    tracing::warn!("connect failed (attempt {}): {}", policy.attempt() + 1, e);
                    match policy.next_delay() {
                        Some(delay) => {
                            if self.sleep_interrupted_by_end(delay) {
                                self.apply(SessionInput::EndRequested);
                                return false;
                            }
                        }
                        None => {
                            self.apply(SessionInput::ReconnectExhausted);
                            return false;
                        }
                    }
                }
                Err(e) => {
                    // Not a connection-establishment failure; nothing the
                    // retry policy can do.
                    tracing::error!("connect failed fatally: {}", e);
                    self.observer.on_fatal_error(&e);
                    self.apply(SessionInput::EndRequested);
                    return false;
                }
            }
        }
    }

    /// Sleeps out a backoff delay, returning true if End arrived.
    fn sleep_interrupted_by_end(&self, delay: Duration) -> bool {
        matches!(self.cmd_rx.recv_timeout(delay), Ok(HostCommand::End))
    }

    fn drop_transport(&mut self, request_close: bool) {
        if let Some(transport) = self.transport.take() {
            if request_close {
                transport.close();
            }
            // Swap in a keepalive channel so select never spins on a dead
            // receiver.
            let (tx, rx) = unbounded();
            self.idle_events_tx = tx;
            self.transport_events = rx;
        }
    }

    fn handle_transport_gone(&mut self) {
        if self.transport.is_some() {
            tracing::warn!("transport event stream ended without a close frame");
            self.apply(SessionInput::TransportClosed { requested: false });
        }
    }

    // ── transport events ─────────────────────────────────────────────

    fn handle_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Control(control) => self.handle_control(control),
            TransportEvent::Audio(bytes) => match codec::pcm_from_bytes(&bytes) {
                Ok(pcm) => self.on_assistant_audio(pcm),
                Err(e) => tracing::warn!("undecodable binary audio frame: {}", e),
            },
            TransportEvent::Closed { code, requested } => {
                tracing::info!(?code, requested, "transport closed");
                self.apply(SessionInput::TransportClosed { requested });
            }
        }
    }

    fn handle_control(&mut self, event: ServerEvent) {
        match event {
            ServerEvent::SessionReady => self.apply(SessionInput::SessionReady),
            ServerEvent::SpeechStarted => {
                if self.config.transport.mode == SessionMode::Streaming {
                    self.recording.clear();
                    self.recording_active = true;
                }
            }
            ServerEvent::SpeechStopped => {
                if self.config.transport.mode == SessionMode::Streaming {
                    self.recording_active = false;
                    if !self.recording.is_empty() {
                        self.pending_user_audio = Some(std::mem::take(&mut self.recording));
                    }
                }
            }
            ServerEvent::InputTranscript { transcript } => {
                match self.reconciler.open_seq() {
                    Some(seq) => {
                        self.reconciler.set_user_transcript(seq, &transcript);
                    }
                    None => self.pending_user_text = Some(transcript),
                }
            }
            ServerEvent::AudioDelta { delta } => match codec::decode_base64(&delta) {
                Ok(pcm) => self.on_assistant_audio(pcm),
                Err(e) => tracing::warn!("undecodable audio delta: {}", e),
            },
            ServerEvent::AudioDone => {
                self.audio_done = true;
                self.playback.finish_turn();
            }
            ServerEvent::TranscriptDelta { delta } => self.reconciler.push_ai_delta(&delta),
            ServerEvent::TranscriptDone { transcript } => {
                self.reconciler.set_ai_final(&transcript)
            }
            ServerEvent::Error { code, message } => {
                if ServerEvent::is_recoverable_error(&code) {
                    tracing::info!(code, message, "recoverable server error, ignored");
                    // The abandoned commit will never get a response.
                    self.response_pending.store(false, Ordering::Release);
                } else {
                    tracing::error!(code, message, "server error");
                    self.observer
                        .on_fatal_error(&VoxcallError::ServerFatal { code, message });
                }
            }
            ServerEvent::Unknown => {
                tracing::debug!("unrecognized server event, skipped");
            }
        }
    }

    /// Route one decoded assistant audio delta through the state machine.
    fn on_assistant_audio(&mut self, pcm: Vec<i16>) {
        match self.current_state() {
            SessionState::Listening => {
                // First delta of a new turn
                self.apply(SessionInput::NewTurnAudio);
            }
            SessionState::Speaking if self.audio_done => {
                // A new response began while the previous turn was still
                // draining.
                self.apply(SessionInput::TurnInterrupted);
            }
            SessionState::Speaking => {}
            _ => {
                tracing::debug!("assistant audio outside a turn, dropped");
                return;
            }
        }
        self.playback.push_delta(pcm);
    }

    // ── capture events ───────────────────────────────────────────────

    fn arm_capture(&mut self) {
        if self.capture_handle.is_some() {
            return;
        }
        let Some(source) = self.capture_source.take() else {
            return;
        };
        self.capture_handle = Some(encoder::spawn(
            source,
            self.muted.clone(),
            self.outputting.clone(),
            self.capture_frames_tx.clone(),
            self.config.encoder_config(),
        ));
    }

    fn handle_capture_event(&mut self, event: CaptureEvent) {
        match event {
            CaptureEvent::Frame(pcm) => self.on_capture_frame(pcm),
            CaptureEvent::Failed { message } => {
                self.last_capture_error = Some(message);
                self.apply(SessionInput::CaptureFailed);
            }
        }
    }

    fn on_capture_frame(&mut self, pcm: Vec<i16>) {
        // Frames arriving here already passed the half-duplex gate.
        if let Some(transport) = &self.transport
            && let Err(e) = transport.send_audio(&pcm)
        {
            tracing::warn!("failed to send audio frame: {}", e);
        }

        if self.recording_active {
            self.recording.extend_from_slice(&pcm);
        }

        if let Some(segmenter) = self.segmenter.as_mut() {
            let event = segmenter.process(&pcm);
            self.handle_segmenter_event(event);
        }
    }

    fn poll_segmenter(&mut self) {
        if let Some(segmenter) = self.segmenter.as_mut() {
            let event = segmenter.poll();
            self.handle_segmenter_event(event);
        }
    }

    fn handle_segmenter_event(&mut self, event: Option<SegmenterEvent>) {
        match event {
            Some(SegmenterEvent::SpeechStart) => {
                tracing::debug!("utterance started");
            }
            Some(SegmenterEvent::Commit {
                samples,
                duration_ms,
            }) => self.send_commit(samples, duration_ms),
            None => {}
        }
    }

    fn send_commit(&mut self, samples: Vec<i16>, duration_ms: u32) {
        let Some(transport) = &self.transport else {
            tracing::warn!("commit ready but no transport; utterance dropped");
            return;
        };
        match transport.send_control(ClientEvent::InputAudioCommit) {
            Ok(()) => {
                tracing::debug!(duration_ms, "utterance committed");
                self.response_pending.store(true, Ordering::Release);
                self.pending_user_audio = Some(samples);
            }
            Err(e) => tracing::warn!("failed to send commit: {}", e),
        }
    }

    // ── turns and transcripts ────────────────────────────────────────

    fn begin_turn(&mut self) {
        self.audio_done = false;
        self.response_pending.store(true, Ordering::Release);
        let seq = self.reconciler.begin_turn();

        if let Some(text) = self.pending_user_text.take() {
            self.reconciler.set_user_transcript(seq, &text);
        }

        // Kick off batch transcription of the recorded utterance unless an
        // inline transcript already resolved.
        if self.reconciler.has_user_transcript() {
            self.pending_user_audio = None;
            return;
        }
        let (Some(audio), Some(backend)) =
            (self.pending_user_audio.take(), self.transcription.clone())
        else {
            return;
        };

        let wav = match codec::to_wav(&audio, self.config.audio.sample_rate) {
            Ok(wav) => wav,
            Err(e) => {
                tracing::warn!("failed to encode utterance WAV: {}", e);
                return;
            }
        };
        let language = self.config.transcription.language.clone();
        let stt_tx = self.stt_tx.clone();
        thread::spawn(move || {
            let result = match backend.transcribe(&wav, &language) {
                Ok(text) => Some(text),
                Err(e) => {
                    // Non-fatal: the reconciler substitutes its placeholder.
                    tracing::warn!("batch transcription failed: {}", e);
                    None
                }
            };
            let _ = stt_tx.send((seq, result));
        });
    }

    fn handle_transcription_result(&mut self, seq: u64, result: Option<String>) {
        if let Some(text) = result
            && !self.reconciler.set_user_transcript(seq, &text)
        {
            tracing::debug!(seq, "transcription resolved after its turn closed, discarded");
        }
    }

    fn finalize_turn(&mut self) {
        self.audio_done = false;
        self.response_pending.store(false, Ordering::Release);
        if let Some(pair) = self.reconciler.finalize() {
            self.observer.on_transcript(&pair.user_text, &pair.ai_text);
        }
    }

    // ── shutdown ─────────────────────────────────────────────────────

    fn teardown(&mut self) {
        if let Some(mut handle) = self.capture_handle.take() {
            handle.stop();
        }
        self.playback.shutdown();
        self.drop_transport(true);
        self.reconciler.abandon();
        self.outputting.store(false, Ordering::Release);
        self.response_pending.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::capture::MockCaptureSource;
    use crate::playback::MockPlaybackSink;
    use crate::transport::channel::MockConnector;

    // One active session per process: serialize the tests that start one.
    static TEST_GATE: Mutex<()> = Mutex::new(());

    fn serial() -> std::sync::MutexGuard<'static, ()> {
        TEST_GATE.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn test_config(mode: SessionMode) -> Config {
        let mut config = Config::default();
        config.transport.url = "wss://relay.test/voice".to_string();
        config.transport.mode = mode;
        config.transport.reconnect_base_delay_ms = 10;
        config.transport.reconnect_max_delay_ms = 50;
        config
    }

    fn silent_capture() -> Box<dyn CaptureSource> {
        Box::new(MockCaptureSource::new().with_frames(vec![vec![0.0f32; 480]]))
    }

    fn wait_for<F: Fn() -> bool>(predicate: F, timeout: Duration) -> bool {
        let deadline = std::time::Instant::now() + timeout;
        while std::time::Instant::now() < deadline {
            if predicate() {
                return true;
            }
            thread::sleep(Duration::from_millis(10));
        }
        predicate()
    }

    #[test]
    fn test_session_reaches_listening_and_ends_cleanly() {
        let _guard = serial();
        let connector = MockConnector::new();
        let probe = connector.push_transport();
        let observer = CollectingObserver::new();

        let mut controller = VoiceSessionController::start(
            test_config(SessionMode::Streaming),
            Box::new(connector),
            silent_capture(),
            Box::new(MockPlaybackSink::new()),
            None,
            observer.clone(),
        )
        .expect("session should start");

        probe
            .inject
            .send(TransportEvent::Control(ServerEvent::SessionReady))
            .unwrap();

        assert!(wait_for(
            || controller.state() == SessionState::Listening,
            Duration::from_secs(2)
        ));

        controller.end();
        assert_eq!(controller.state(), SessionState::Idle);
        assert!(probe.close_requested.load(Ordering::Acquire));
        let states = observer.states();
        assert_eq!(states.first(), Some(&SessionState::Connecting));
        assert_eq!(states.last(), Some(&SessionState::Idle));
    }

    #[test]
    fn test_second_session_is_rejected_while_first_active() {
        let _guard = serial();
        let connector = MockConnector::new();
        let _probe = connector.push_transport();
        let observer = CollectingObserver::new();

        let controller = VoiceSessionController::start(
            test_config(SessionMode::Streaming),
            Box::new(connector),
            silent_capture(),
            Box::new(MockPlaybackSink::new()),
            None,
            observer.clone(),
        )
        .expect("first session starts");

        let second = VoiceSessionController::start(
            test_config(SessionMode::Streaming),
            Box::new(MockConnector::new()),
            silent_capture(),
            Box::new(MockPlaybackSink::new()),
            None,
            observer,
        );
        assert!(second.is_err(), "only one session may be active");
        drop(controller);
    }

    #[test]
    fn test_invalid_config_is_rejected_before_any_work() {
        let observer = CollectingObserver::new();
        let result = VoiceSessionController::start(
            Config::default(), // empty URL
            Box::new(MockConnector::new()),
            silent_capture(),
            Box::new(MockPlaybackSink::new()),
            None,
            observer,
        );
        assert!(matches!(
            result,
            Err(VoxcallError::ConfigInvalidValue { .. })
        ));
    }

    #[test]
    fn test_reconnect_exhaustion_surfaces_fatal_error() {
        let _guard = serial();
        let connector = MockConnector::new();
        for _ in 0..6 {
            connector.push_failure(VoxcallError::ConnectUnreachable {
                message: "down".to_string(),
            });
        }
        let observer = CollectingObserver::new();

        let controller = VoiceSessionController::start(
            test_config(SessionMode::Streaming),
            Box::new(connector),
            silent_capture(),
            Box::new(MockPlaybackSink::new()),
            None,
            observer.clone(),
        )
        .expect("start succeeds; failures surface async");

        assert!(wait_for(
            || !observer.fatal_errors().is_empty(),
            Duration::from_secs(5)
        ));
        assert!(
            observer.fatal_errors()[0].contains("5 attempts"),
            "got: {:?}",
            observer.fatal_errors()
        );
        assert!(wait_for(
            || controller.state() == SessionState::Idle,
            Duration::from_secs(2)
        ));
        drop(controller);
    }

    #[test]
    fn test_mute_toggle_is_rejected_while_connecting() {
        let _guard = serial();
        let connector = MockConnector::new();
        // Never connects within the test window
        for _ in 0..6 {
            connector.push_failure(VoxcallError::ConnectUnreachable {
                message: "down".to_string(),
            });
        }
        let mut config = test_config(SessionMode::Streaming);
        config.transport.reconnect_base_delay_ms = 200;
        config.transport.reconnect_max_delay_ms = 400;
        let observer = CollectingObserver::new();

        let controller = VoiceSessionController::start(
            config,
            Box::new(connector),
            silent_capture(),
            Box::new(MockPlaybackSink::new()),
            None,
            observer,
        )
        .expect("session starts");

        assert!(wait_for(
            || controller.state() == SessionState::Connecting,
            Duration::from_secs(1)
        ));
        assert!(!controller.toggle_mute(), "toggle must be a no-op");
        assert!(!controller.is_muted());
        drop(controller);
    }
}
