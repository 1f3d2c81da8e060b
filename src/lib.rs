//! voxcall - Real-time duplex voice session engine
//!
//! Holds a spoken conversation with a remote speech endpoint over a
//! persistent duplex channel: live capture, utterance segmentation,
//! jitter-buffered gapless playback, and per-turn transcript correlation.

// Enforce error handling discipline in non-test code
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]
#![warn(clippy::let_underscore_must_use)]

pub mod audio;
pub mod config;
pub mod defaults;
pub mod error;
pub mod playback;
pub mod session;
pub mod transcript;
pub mod transcription;
pub mod transport;

// Core traits (capture → session → playback)
pub use audio::capture::{CaptureSource, MockCaptureSource};
pub use playback::{MockPlaybackSink, PlaybackSink};
pub use transcription::{MockTranscriptionBackend, TranscriptionBackend};
pub use transport::channel::{MockConnector, Transport, TransportConnector};

// Session
pub use session::{CollectingObserver, SessionObserver, SessionState, VoiceSessionController};

// Error handling
pub use error::{Result, VoxcallError};

// Config
pub use config::{Config, SessionMode};

/// Build version string with optional git commit hash.
///
/// Returns `"0.1.0+abc1234"` when git hash is available, `"0.1.0"` otherwise.
pub fn version_string() -> String {
    let version = env!("CARGO_PKG_VERSION");
    match option_env!("GIT_HASH") {
        Some(hash) if !hash.is_empty() => format!("{}+{}", version, hash),
        _ => version.to_string(),
    }
}
