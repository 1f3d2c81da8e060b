//! Session state machine and top-level controller.

pub mod controller;
pub mod state;

pub use controller::{CollectingObserver, SessionObserver, VoiceSessionController};
pub use state::{SessionInput, SessionState, SideEffect, Transition, can_toggle_mute, transition};
