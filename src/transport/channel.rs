//! Duplex transport to the relay endpoint.
//!
//! [`Transport`] is the seam the session controller talks through; the real
//! implementation is a WebSocket ([`WsTransport`]) whose reader, writer and
//! heartbeat run as tasks on a runtime owned by [`WsConnector`]. Inbound
//! traffic surfaces on a crossbeam channel so the controller thread can
//! consume it without touching async code.

use crate::audio::codec;
use crate::defaults;
use crate::error::{Result, VoxcallError};
use crate::transport::protocol::{ClientEvent, ServerEvent};
use crossbeam_channel::{Receiver, Sender, unbounded};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::{self, Message};

/// How encoded audio rides the wire, negotiated per endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AudioWireMode {
    /// Raw little-endian PCM16 in binary frames.
    Binary,
    /// Base64 PCM16 wrapped in `input_audio_buffer.append` control messages.
    Base64,
}

/// Inbound events from the transport.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// A parsed control message.
    Control(ServerEvent),
    /// A raw binary audio payload (little-endian PCM16 bytes).
    Audio(Vec<u8>),
    /// The connection closed. `requested` is true when this side asked.
    Closed { code: Option<u16>, requested: bool },
}

/// One live duplex connection.
///
/// The events receiver is a lazy, non-restartable stream: once `Closed`
/// arrives nothing follows, and a replacement connection means a new
/// `Transport` from the connector.
pub trait Transport: Send {
    /// Send a control message.
    fn send_control(&self, event: ClientEvent) -> Result<()>;

    /// Send one encoded audio frame, in the negotiated wire mode.
    fn send_audio(&self, pcm: &[i16]) -> Result<()>;

    /// The inbound event stream.
    fn events(&self) -> Receiver<TransportEvent>;

    /// Request an orderly close. The eventual `Closed` event carries
    /// `requested: true`.
    fn close(&self);
}

/// Creates connections; the seam that lets reconnection be driven by the
/// session controller and faked in tests.
pub trait TransportConnector: Send {
    /// Establish a connection, blocking the calling thread.
    ///
    /// # Errors
    /// `ConnectUnreachable` for network-level failures, `ConnectRejected`
    /// when the endpoint actively refuses the session.
    fn connect(&self, url: &str) -> Result<Box<dyn Transport>>;
}

// ── WebSocket implementation ─────────────────────────────────────────

enum OutboundFrame {
    Text(String),
    Binary(Vec<u8>),
    Close,
}

/// WebSocket transport: writer, reader and heartbeat tasks over one socket.
pub struct WsTransport {
    outbound_tx: mpsc::UnboundedSender<OutboundFrame>,
    events_rx: Receiver<TransportEvent>,
    requested_close: Arc<AtomicBool>,
    wire_mode: AudioWireMode,
}

impl WsTransport {
    /// Connect and spawn the socket tasks on the current runtime.
    pub async fn connect(
        url: &str,
        wire_mode: AudioWireMode,
        heartbeat: Duration,
    ) -> Result<Self> {
        let connect_timeout = Duration::from_secs(defaults::CONNECT_TIMEOUT_SECS);
        let (ws, _response) =
            tokio::time::timeout(connect_timeout, tokio_tungstenite::connect_async(url))
                .await
                .map_err(|_| VoxcallError::ConnectUnreachable {
                    message: format!("connect timed out after {:?}", connect_timeout),
                })?
                .map_err(classify_connect_error)?;

        tracing::info!(url, "transport connected");

        let (mut sink, mut stream) = ws.split();
        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<OutboundFrame>();
        let (events_tx, events_rx) = unbounded();
        let requested_close = Arc::new(AtomicBool::new(false));

        // Writer: drains the outbound queue into the socket.
        tokio::spawn(async move {
            while let Some(frame) = outbound_rx.recv().await {
                let message = match frame {
                    OutboundFrame::Text(text) => Message::Text(text.into()),
                    OutboundFrame::Binary(bytes) => Message::Binary(bytes.into()),
                    OutboundFrame::Close => {
                        let _ = sink.send(Message::Close(None)).await;
                        break;
                    }
                };
                if sink.send(message).await.is_err() {
                    break;
                }
            }
        });

        // Reader: control JSON and binary audio in, close notification out.
        let reader_events = events_tx.clone();
        let reader_requested = requested_close.clone();
        tokio::spawn(async move {
            let requested = || reader_requested.load(Ordering::Acquire);
            while let Some(message) = stream.next().await {
                match message {
                    Ok(Message::Text(text)) => match ServerEvent::from_json(&text) {
                        Ok(event) => {
                            let _ = reader_events.send(TransportEvent::Control(event));
                        }
                        Err(e) => {
                            tracing::warn!("unparseable control message: {}", e);
                        }
                    },
                    Ok(Message::Binary(bytes)) => {
                        let _ = reader_events.send(TransportEvent::Audio(bytes));
                    }
                    Ok(Message::Close(frame)) => {
                        let code = frame.map(|f| u16::from(f.code));
                        let _ = reader_events.send(TransportEvent::Closed {
                            code,
                            requested: requested(),
                        });
                        return;
                    }
                    Ok(_) => {
                        // websocket-level ping/pong/fragments
                    }
                    Err(e) => {
                        tracing::warn!("transport read error: {}", e);
                        let _ = reader_events.send(TransportEvent::Closed {
                            code: None,
                            requested: requested(),
                        });
                        return;
                    }
                }
            }
            // Stream ended without a close frame
            let _ = reader_events.send(TransportEvent::Closed {
                code: None,
                requested: requested(),
            });
        });

        // Heartbeat: control ping on a fixed interval so idle-timeout
        // proxies keep the connection alive between turns. Stops when the
        // outbound queue closes.
        let heartbeat_tx = outbound_tx.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(heartbeat);
            ticker.tick().await; // immediate first tick is not a heartbeat
            loop {
                ticker.tick().await;
                let Ok(json) = ClientEvent::Ping.to_json() else {
                    continue;
                };
                if heartbeat_tx.send(OutboundFrame::Text(json)).is_err() {
                    break;
                }
            }
        });

        Ok(Self {
            outbound_tx,
            events_rx,
            requested_close,
            wire_mode,
        })
    }
}

impl Transport for WsTransport {
    fn send_control(&self, event: ClientEvent) -> Result<()> {
        let json = event.to_json().map_err(|e| VoxcallError::Protocol {
            message: format!("failed to serialize control message: {}", e),
        })?;
        self.outbound_tx
            .send(OutboundFrame::Text(json))
            .map_err(|_| VoxcallError::Transport {
                message: "connection closed".to_string(),
            })
    }

    fn send_audio(&self, pcm: &[i16]) -> Result<()> {
        let frame = match self.wire_mode {
            AudioWireMode::Binary => OutboundFrame::Binary(codec::pcm_to_bytes(pcm)),
            AudioWireMode::Base64 => {
                let event = ClientEvent::InputAudioAppend {
                    audio: codec::encode_base64(pcm),
                };
                let json = event.to_json().map_err(|e| VoxcallError::Protocol {
                    message: format!("failed to serialize audio append: {}", e),
                })?;
                OutboundFrame::Text(json)
            }
        };
        self.outbound_tx
            .send(frame)
            .map_err(|_| VoxcallError::Transport {
                message: "connection closed".to_string(),
            })
    }

    fn events(&self) -> Receiver<TransportEvent> {
        self.events_rx.clone()
    }

    fn close(&self) {
        self.requested_close.store(true, Ordering::Release);
        let _ = self.outbound_tx.send(OutboundFrame::Close);
    }
}

fn classify_connect_error(error: tungstenite::Error) -> VoxcallError {
    match error {
        tungstenite::Error::Http(response) => VoxcallError::ConnectRejected {
            message: format!("endpoint returned HTTP {}", response.status()),
        },
        other => VoxcallError::ConnectUnreachable {
            message: other.to_string(),
        },
    }
}

/// Blocking connector owning the tokio runtime the socket tasks run on.
pub struct WsConnector {
    runtime: tokio::runtime::Runtime,
    wire_mode: AudioWireMode,
    heartbeat: Duration,
}

impl WsConnector {
    /// Creates a connector with its own two-worker runtime.
    pub fn new(wire_mode: AudioWireMode, heartbeat: Duration) -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build()
            .map_err(|e| VoxcallError::Transport {
                message: format!("failed to build transport runtime: {}", e),
            })?;
        Ok(Self {
            runtime,
            wire_mode,
            heartbeat,
        })
    }
}

impl TransportConnector for WsConnector {
    fn connect(&self, url: &str) -> Result<Box<dyn Transport>> {
        let transport = self
            .runtime
            .block_on(WsTransport::connect(url, self.wire_mode, self.heartbeat))?;
        Ok(Box::new(transport))
    }
}

// ── Mocks ────────────────────────────────────────────────────────────

/// Test double for [`Transport`]: records sends, lets tests inject inbound
/// events through a [`MockTransportProbe`].
pub struct MockTransport {
    controls: Arc<Mutex<Vec<ClientEvent>>>,
    audio: Arc<Mutex<Vec<Vec<i16>>>>,
    events_tx: Sender<TransportEvent>,
    events_rx: Receiver<TransportEvent>,
    close_requested: Arc<AtomicBool>,
}

/// Shared view into a [`MockTransport`] held by the test while the engine
/// owns the transport itself.
#[derive(Clone)]
pub struct MockTransportProbe {
    /// Injects inbound events as if the server sent them.
    pub inject: Sender<TransportEvent>,
    /// Control messages the engine sent.
    pub controls: Arc<Mutex<Vec<ClientEvent>>>,
    /// Audio frames the engine sent.
    pub audio: Arc<Mutex<Vec<Vec<i16>>>>,
    /// Set when the engine requested the close.
    pub close_requested: Arc<AtomicBool>,
}

impl MockTransportProbe {
    /// Number of audio frames sent so far.
    pub fn audio_frames(&self) -> usize {
        self.audio.lock().map(|a| a.len()).unwrap_or(0)
    }

    /// Number of commit control messages sent so far.
    pub fn commit_count(&self) -> usize {
        self.controls
            .lock()
            .map(|c| {
                c.iter()
                    .filter(|e| matches!(e, ClientEvent::InputAudioCommit))
                    .count()
            })
            .unwrap_or(0)
    }

    /// Simulate the server closing the connection.
    pub fn drop_connection(&self, code: Option<u16>) {
        let _ = self.inject.send(TransportEvent::Closed {
            code,
            requested: false,
        });
    }
}

impl MockTransport {
    /// Creates a transport and its probe.
    pub fn new() -> (Self, MockTransportProbe) {
        let (events_tx, events_rx) = unbounded();
        let controls = Arc::new(Mutex::new(Vec::new()));
        let audio = Arc::new(Mutex::new(Vec::new()));
        let close_requested = Arc::new(AtomicBool::new(false));
        let probe = MockTransportProbe {
            inject: events_tx.clone(),
            controls: controls.clone(),
            audio: audio.clone(),
            close_requested: close_requested.clone(),
        };
        (
            Self {
                controls,
                audio,
                events_tx,
                events_rx,
                close_requested,
            },
            probe,
        )
    }
}

impl Transport for MockTransport {
    fn send_control(&self, event: ClientEvent) -> Result<()> {
        self.controls
            .lock()
            .map_err(|_| VoxcallError::Transport {
                message: "mock poisoned".to_string(),
            })?
            .push(event);
        Ok(())
    }

    fn send_audio(&self, pcm: &[i16]) -> Result<()> {
        self.audio
            .lock()
            .map_err(|_| VoxcallError::Transport {
                message: "mock poisoned".to_string(),
            })?
            .push(pcm.to_vec());
        Ok(())
    }

    fn events(&self) -> Receiver<TransportEvent> {
        self.events_rx.clone()
    }

    fn close(&self) {
        self.close_requested.store(true, Ordering::Release);
        let _ = self.events_tx.send(TransportEvent::Closed {
            code: Some(1000),
            requested: true,
        });
    }
}

enum MockOutcome {
    Transport(MockTransport),
    Failure(VoxcallError),
}

/// Test double for [`TransportConnector`]: hands out scripted outcomes in
/// order, recording every attempted URL.
pub struct MockConnector {
    outcomes: Arc<Mutex<VecDeque<MockOutcome>>>,
    attempts: Arc<Mutex<Vec<String>>>,
}

impl MockConnector {
    pub fn new() -> Self {
        Self {
            outcomes: Arc::new(Mutex::new(VecDeque::new())),
            attempts: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Queue a successful connection; returns its probe.
    pub fn push_transport(&self) -> MockTransportProbe {
        let (transport, probe) = MockTransport::new();
        if let Ok(mut q) = self.outcomes.lock() {
            q.push_back(MockOutcome::Transport(transport));
        }
        probe
    }

    /// Queue a connection failure.
    pub fn push_failure(&self, error: VoxcallError) {
        if let Ok(mut q) = self.outcomes.lock() {
            q.push_back(MockOutcome::Failure(error));
        }
    }

    /// URLs of every connect attempt so far.
    pub fn attempts(&self) -> Vec<String> {
        self.attempts.lock().map(|a| a.clone()).unwrap_or_default()
    }
}

impl Default for MockConnector {
    fn default() -> Self {
        Self::new()
    }
}

impl TransportConnector for MockConnector {
    fn connect(&self, url: &str) -> Result<Box<dyn Transport>> {
        if let Ok(mut attempts) = self.attempts.lock() {
            attempts.push(url.to_string());
        }
        let outcome = self
            .outcomes
            .lock()
            .ok()
            .and_then(|mut q| q.pop_front())
            .unwrap_or_else(|| {
                MockOutcome::Failure(VoxcallError::ConnectUnreachable {
                    message: "no scripted outcome".to_string(),
                })
            });
        match outcome {
            MockOutcome::Transport(t) => Ok(Box::new(t)),
            MockOutcome::Failure(e) => Err(e),
        }
    }
}
