//! Default configuration constants for voxcall.
//!
//! This module provides shared constants used across different configuration types
//! to ensure consistency and eliminate duplication. The segmentation and playback
//! timings are empirically tuned values carried over from the production system;
//! they are exposed through [`crate::config::Config`] rather than re-derived.

/// Engine-wide audio sample rate in Hz.
///
/// 24kHz 16-bit mono PCM end-to-end matches the remote speech endpoint's native
/// rate, so the hot path resamples exactly once (at capture) and never again.
pub const SAMPLE_RATE: u32 = 24_000;

/// Energy threshold for detecting speech (0.0 to 1.0).
///
/// Normalized mean-magnitude threshold tuned for typical microphone input
/// levels: low enough to catch soft speech onsets, high enough to ignore
/// ambient noise.
pub const SPEECH_THRESHOLD: f32 = 0.02;

/// Silence duration in milliseconds before an utterance is considered ended.
///
/// 1500ms tolerates natural mid-sentence pauses without prematurely splitting
/// one utterance into two.
pub const HANGOVER_MS: u32 = 1500;

/// Delay in milliseconds between speech-end and the commit flush.
///
/// Admits capture frames already in flight through the encoder before the
/// utterance is committed.
pub const SETTLE_MS: u32 = 200;

/// Minimum accumulated utterance duration in milliseconds worth committing.
///
/// Anything shorter is not meaningful speech. A rejected flush keeps its
/// sample tally; only an emitted commit resets it.
pub const MIN_UTTERANCE_MS: u32 = 200;

/// Minimum interval in milliseconds between two commits.
pub const COMMIT_DEBOUNCE_MS: u32 = 1000;

/// Duration of one playback chunk in milliseconds.
pub const PLAYBACK_CHUNK_MS: u32 = 120;

/// Number of chunks the playback queue must hold before output starts.
///
/// The jitter buffer: ~840ms of buffered audio traded for gapless output
/// under bursty network delivery. Starting on the first chunk stutters.
pub const MIN_QUEUE_CHUNKS: usize = 7;

/// Interval in milliseconds between empty-queue checks in the drain loop.
pub const DRAIN_POLL_MS: u64 = 50;

/// Consecutive empty-queue checks before a drain pauses mid-turn.
///
/// 8 checks at 50ms each let a burst arriving 100-400ms late be stitched in
/// without an audible restart.
pub const DRAIN_MAX_EMPTY_POLLS: u32 = 8;

/// Seconds allowed for a connection attempt before it counts as unreachable.
pub const CONNECT_TIMEOUT_SECS: u64 = 15;

/// Interval in seconds between heartbeat pings on the transport.
///
/// Keeps idle-timeout proxies from dropping the connection between turns.
pub const HEARTBEAT_SECS: u64 = 15;

/// Base delay in milliseconds for reconnection backoff.
pub const RECONNECT_BASE_DELAY_MS: u64 = 1000;

/// Upper bound in milliseconds for a single reconnection delay.
///
/// High enough that the full 5-attempt sequence (1s, 2s, 4s, 8s, 16s) is
/// never clipped.
pub const RECONNECT_MAX_DELAY_MS: u64 = 30_000;

/// Maximum reconnection attempts before the session fails fatally.
pub const RECONNECT_MAX_ATTEMPTS: u32 = 5;

/// Interval in milliseconds between capture-source polls.
pub const CAPTURE_POLL_MS: u64 = 16;

/// Capture frames tolerated failing in a row before capture aborts.
pub const CAPTURE_MAX_CONSECUTIVE_ERRORS: u32 = 10;

/// Default language tag sent with transcription requests.
pub const DEFAULT_LANGUAGE: &str = "en";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_size_is_whole_samples() {
        // 24000 * 120 / 1000 must divide evenly; a fractional chunk size would
        // make every chunk boundary drift.
        assert_eq!(SAMPLE_RATE * PLAYBACK_CHUNK_MS % 1000, 0);
        assert_eq!(SAMPLE_RATE * PLAYBACK_CHUNK_MS / 1000, 2880);
    }

    #[test]
    fn reconnect_sequence_fits_under_cap() {
        let last = RECONNECT_BASE_DELAY_MS << (RECONNECT_MAX_ATTEMPTS - 1);
        assert!(last <= RECONNECT_MAX_DELAY_MS);
    }
}
