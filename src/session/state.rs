//! The session state machine as a pure function.
//!
//! `transition` maps (state, input) to (state, side-effect list) with no
//! I/O, so every turn-taking rule is testable without audio hardware or a
//! network. The controller owns execution of the effects.

/// Lifecycle states of a voice session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No connection, no capture.
    Idle,
    /// Connection establishment or reconnection in flight.
    Connecting,
    /// Microphone armed (subject to mute), playback idle.
    Listening,
    /// Assistant audio playing; microphone gated off.
    Speaking,
}

/// Inputs driving the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionInput {
    /// Host asked the session to start.
    StartRequested,
    /// The endpoint confirmed the session is established.
    SessionReady,
    /// First audio delta of a new assistant turn arrived.
    NewTurnAudio,
    /// A new assistant turn began while the previous one was still draining.
    TurnInterrupted,
    /// The playback queue and in-flight output fully drained.
    PlaybackDrained,
    /// The transport closed; `requested` is true for caller-initiated closes.
    TransportClosed { requested: bool },
    /// The reconnect policy ran out of attempts.
    ReconnectExhausted,
    /// Capture failed fatally (device unavailable).
    CaptureFailed,
    /// Host asked the session to end.
    EndRequested,
}

/// Side effects the controller must execute after a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SideEffect {
    /// Report the new state to the observer.
    NotifyState,
    /// Start the capture encoder (idempotent).
    ArmCapture,
    /// Stop the capture encoder and release the device.
    ReleaseCapture,
    /// Set the half-duplex gate before any assistant audio is accepted.
    EngageGate,
    /// Open a new turn in the reconciler.
    BeginTurn,
    /// Finalize the open turn and emit its transcript pair.
    FinalizeTurn,
    /// Discard all queued and in-flight playback.
    InterruptPlayback,
    /// Stop the playback scheduler.
    StopPlayback,
    /// Close the transport with the caller-requested flag.
    CloseTransport,
    /// Run the reconnection procedure.
    Reconnect,
    /// Surface the exhausted-reconnect fatal error to the host.
    SurfaceReconnectExhausted,
    /// Surface the capture failure to the host.
    SurfaceCaptureFailure,
}

/// A computed transition.
#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub next: SessionState,
    pub effects: Vec<SideEffect>,
}

impl Transition {
    fn new(next: SessionState, effects: Vec<SideEffect>) -> Self {
        Self { next, effects }
    }

    fn stay(state: SessionState) -> Self {
        Self::new(state, Vec::new())
    }
}

use SessionInput as In;
use SessionState as St;
use SideEffect as Fx;

/// Effects shared by every path back to `Idle`.
fn teardown() -> Vec<SideEffect> {
    vec![
        Fx::ReleaseCapture,
        Fx::StopPlayback,
        Fx::CloseTransport,
        Fx::NotifyState,
    ]
}

/// The pure transition function.
pub fn transition(state: SessionState, input: SessionInput) -> Transition {
    match (state, input) {
        (St::Idle, In::StartRequested) => Transition::new(St::Connecting, vec![Fx::NotifyState]),
        (St::Idle, _) => Transition::stay(St::Idle),

        (St::Connecting, In::SessionReady) => {
            Transition::new(St::Listening, vec![Fx::ArmCapture, Fx::NotifyState])
        }
        (St::Connecting, In::ReconnectExhausted) => {
            let mut effects = vec![Fx::SurfaceReconnectExhausted];
            effects.extend(teardown());
            Transition::new(St::Idle, effects)
        }
        (St::Connecting, In::EndRequested) => Transition::new(St::Idle, teardown()),
        (St::Connecting, In::TransportClosed { requested: false }) => {
            // Connection lost before the session became ready
            Transition::new(St::Connecting, vec![Fx::Reconnect])
        }
        (St::Connecting, In::TransportClosed { requested: true }) => {
            Transition::new(St::Idle, teardown())
        }
        (St::Connecting, In::CaptureFailed) => {
            let mut effects = vec![Fx::SurfaceCaptureFailure];
            effects.extend(teardown());
            Transition::new(St::Idle, effects)
        }
        (St::Connecting, _) => Transition::stay(St::Connecting),

        (St::Listening, In::NewTurnAudio) => Transition::new(
            St::Speaking,
            // The gate engages in the same step as the transition so no
            // capture frame can slip out once assistant audio exists.
            vec![Fx::EngageGate, Fx::BeginTurn, Fx::NotifyState],
        ),
        (St::Listening, In::TransportClosed { requested: false }) => {
            Transition::new(St::Connecting, vec![Fx::NotifyState, Fx::Reconnect])
        }
        (St::Listening, In::TransportClosed { requested: true }) => {
            Transition::new(St::Idle, teardown())
        }
        (St::Listening, In::EndRequested) => Transition::new(St::Idle, teardown()),
        (St::Listening, In::CaptureFailed) => {
            let mut effects = vec![Fx::SurfaceCaptureFailure];
            effects.extend(teardown());
            Transition::new(St::Idle, effects)
        }
        (St::Listening, _) => Transition::stay(St::Listening),

        (St::Speaking, In::PlaybackDrained) => {
            Transition::new(St::Listening, vec![Fx::FinalizeTurn, Fx::NotifyState])
        }
        (St::Speaking, In::TurnInterrupted) => Transition::new(
            St::Speaking,
            // Overlapping two turns' audio is a correctness bug: the old
            // output is discarded before the new turn's audio is accepted.
            vec![
                Fx::InterruptPlayback,
                Fx::FinalizeTurn,
                Fx::BeginTurn,
                Fx::EngageGate,
            ],
        ),
        (St::Speaking, In::TransportClosed { requested: false }) => Transition::new(
            St::Connecting,
            vec![
                Fx::InterruptPlayback,
                Fx::FinalizeTurn,
                Fx::NotifyState,
                Fx::Reconnect,
            ],
        ),
        (St::Speaking, In::TransportClosed { requested: true }) => {
            let mut effects = vec![Fx::InterruptPlayback, Fx::FinalizeTurn];
            effects.extend(teardown());
            Transition::new(St::Idle, effects)
        }
        (St::Speaking, In::EndRequested) => {
            let mut effects = vec![Fx::InterruptPlayback, Fx::FinalizeTurn];
            effects.extend(teardown());
            Transition::new(St::Idle, effects)
        }
        (St::Speaking, In::CaptureFailed) => {
            let mut effects = vec![
                Fx::InterruptPlayback,
                Fx::FinalizeTurn,
                Fx::SurfaceCaptureFailure,
            ];
            effects.extend(teardown());
            Transition::new(St::Idle, effects)
        }
        (St::Speaking, _) => Transition::stay(St::Speaking),
    }
}

/// Mute toggling is valid in any state except `Connecting`; it never
/// changes the machine's state.
pub fn can_toggle_mute(state: SessionState) -> bool {
    state != St::Connecting
}
