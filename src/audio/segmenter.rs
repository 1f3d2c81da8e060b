//! Utterance segmentation for chunked-mode turn-taking.
//!
//! Detects speech activity in the encoded capture stream and decides when a
//! complete utterance must be committed to the transport, with hangover,
//! settle, debounce and minimum-duration guards.

use crate::defaults;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

/// Trait for time operations, allowing mock time in tests.
pub trait Clock: Send + Sync {
    /// Returns the current instant.
    fn now(&self) -> Instant;
}

/// Real system clock using `std::time::Instant::now()`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Configuration for utterance segmentation.
#[derive(Debug, Clone, Copy)]
pub struct SegmenterConfig {
    /// Energy threshold for detecting speech (0.0 to 1.0).
    pub speech_threshold: f32,
    /// Silence duration before speech is considered ended (milliseconds).
    pub hangover_ms: u32,
    /// Delay between speech-end and the flush attempt (milliseconds).
    pub settle_ms: u32,
    /// Minimum interval between two commits (milliseconds).
    pub debounce_ms: u32,
    /// Minimum accumulated duration worth committing (milliseconds).
    pub min_utterance_ms: u32,
    /// Sample rate of the frames fed to the segmenter.
    pub sample_rate: u32,
}

impl Default for SegmenterConfig {
    fn default() -> Self {
        Self {
            speech_threshold: defaults::SPEECH_THRESHOLD,
            hangover_ms: defaults::HANGOVER_MS,
            settle_ms: defaults::SETTLE_MS,
            debounce_ms: defaults::COMMIT_DEBOUNCE_MS,
            min_utterance_ms: defaults::MIN_UTTERANCE_MS,
            sample_rate: defaults::SAMPLE_RATE,
        }
    }
}

/// Current state of the segmenter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmenterState {
    /// No speech detected.
    Idle,
    /// Speech is being detected.
    Speaking,
    /// Silence detected, waiting out the hangover window.
    Hangover,
    /// Speech ended, settle delay running before the flush attempt.
    Settling,
}

/// Events emitted by the segmenter.
#[derive(Debug, Clone, PartialEq)]
pub enum SegmenterEvent {
    /// Speech has started.
    SpeechStart,
    /// A complete utterance is ready to commit.
    Commit {
        /// Buffered utterance audio, for batch transcription.
        samples: Vec<i16>,
        /// Accumulated duration in milliseconds.
        duration_ms: u32,
    },
}

/// Utterance segmenter state machine.
///
/// Frames arriving here have already passed the half-duplex gate, so every
/// sample counts toward the commit tally. The tally survives rejected
/// flushes — only an emitted commit resets it — so legitimate speech split
/// across detection boundaries is never silently dropped.
pub struct UtteranceSegmenter<C: Clock = SystemClock> {
    config: SegmenterConfig,
    state: SegmenterState,
    silence_start: Option<Instant>,
    settle_start: Option<Instant>,
    last_commit: Option<Instant>,
    tally_samples: u64,
    utterance: Vec<i16>,
    response_pending: Arc<AtomicBool>,
    clock: C,
}

impl<C: Clock> UtteranceSegmenter<C> {
    /// Creates a segmenter with the given configuration and clock.
    ///
    /// `response_pending` is the cross-task guard: while set (AI speaking or
    /// a commit awaiting its response), flushes are rejected so a second
    /// utterance never interleaves before the first is answered.
    pub fn with_clock(
        config: SegmenterConfig,
        response_pending: Arc<AtomicBool>,
        clock: C,
    ) -> Self {
        Self {
            config,
            state: SegmenterState::Idle,
            silence_start: None,
            settle_start: None,
            last_commit: None,
            tally_samples: 0,
            utterance: Vec::new(),
            response_pending,
            clock,
        }
    }

    /// Feed one encoded capture frame; may emit a segmentation event.
    pub fn process(&mut self, frame: &[i16]) -> Option<SegmenterEvent> {
        self.tally_samples += frame.len() as u64;
        self.utterance.extend_from_slice(frame);

        let energy = mean_magnitude(frame);
        let is_speech = energy > self.config.speech_threshold;
        let now = self.clock.now();

        match self.state {
            SegmenterState::Idle => {
                if is_speech {
                    self.state = SegmenterState::Speaking;
                    self.silence_start = None;
                    return Some(SegmenterEvent::SpeechStart);
                }
                None
            }
            SegmenterState::Speaking => {
                if !is_speech {
                    self.state = SegmenterState::Hangover;
                    self.silence_start = Some(now);
                }
                None
            }
            SegmenterState::Hangover => {
                if is_speech {
                    self.state = SegmenterState::Speaking;
                    self.silence_start = None;
                    return None;
                }
                let silent_ms = self
                    .silence_start
                    .map(|start| now.duration_since(start).as_millis() as u32)
                    .unwrap_or(0);
                if silent_ms >= self.config.hangover_ms {
                    self.state = SegmenterState::Settling;
                    self.settle_start = Some(now);
                }
                None
            }
            SegmenterState::Settling => {
                if is_speech {
                    // Speech resumed before the flush fired; fold it back in.
                    self.state = SegmenterState::Speaking;
                    self.settle_start = None;
                    return None;
                }
                self.try_flush(now)
            }
        }
    }

    /// Advance timer-driven transitions when no frames are arriving.
    pub fn poll(&mut self) -> Option<SegmenterEvent> {
        let now = self.clock.now();
        match self.state {
            SegmenterState::Hangover => {
                let silent_ms = self
                    .silence_start
                    .map(|start| now.duration_since(start).as_millis() as u32)
                    .unwrap_or(0);
                if silent_ms >= self.config.hangover_ms {
                    self.state = SegmenterState::Settling;
                    self.settle_start = Some(now);
                }
                None
            }
            SegmenterState::Settling => self.try_flush(now),
            _ => None,
        }
    }

    /// Attempt the guarded flush at the end of the settle window.
    ///
    /// A rejected flush returns to `Idle` without touching the tally or the
    /// utterance buffer.
    fn try_flush(&mut self, now: Instant) -> Option<SegmenterEvent> {
        let settled_ms = self
            .settle_start
            .map(|start| now.duration_since(start).as_millis() as u32)
            .unwrap_or(0);
        if settled_ms < self.config.settle_ms {
            return None;
        }

        self.state = SegmenterState::Idle;
        self.settle_start = None;
        self.silence_start = None;

        let duration_ms =
            (self.tally_samples * 1000 / self.config.sample_rate as u64) as u32;
        if duration_ms < self.config.min_utterance_ms {
            tracing::debug!(duration_ms, "utterance too short, flush rejected");
            return None;
        }
        if let Some(last) = self.last_commit {
            let since_ms = now.duration_since(last).as_millis() as u32;
            if since_ms < self.config.debounce_ms {
                tracing::debug!(since_ms, "commit debounced");
                return None;
            }
        }
        if self.response_pending.load(Ordering::Acquire) {
            tracing::debug!("flush rejected: response pending");
            return None;
        }

        self.last_commit = Some(now);
        self.tally_samples = 0;
        let samples = std::mem::take(&mut self.utterance);
        Some(SegmenterEvent::Commit {
            samples,
            duration_ms,
        })
    }

    /// Returns the current segmenter state.
    pub fn state(&self) -> SegmenterState {
        self.state
    }

    /// Accumulated, uncommitted duration in milliseconds.
    pub fn pending_ms(&self) -> u32 {
        (self.tally_samples * 1000 / self.config.sample_rate as u64) as u32
    }

    /// Resets to idle, dropping the tally and buffered audio.
    pub fn reset(&mut self) {
        self.state = SegmenterState::Idle;
        self.silence_start = None;
        self.settle_start = None;
        self.tally_samples = 0;
        self.utterance.clear();
    }
}

impl UtteranceSegmenter<SystemClock> {
    /// Creates a segmenter using the system clock.
    pub fn new(config: SegmenterConfig, response_pending: Arc<AtomicBool>) -> Self {
        Self::with_clock(config, response_pending, SystemClock)
    }
}

/// Normalized mean magnitude of a PCM16 frame (0.0 to 1.0).
///
/// The amplitude-domain stand-in for the source system's spectrum average;
/// equivalent for a fixed low threshold and free of FFT cost per frame.
pub fn mean_magnitude(samples: &[i16]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum: f64 = samples
        .iter()
        .map(|&s| (s as f64 / i16::MAX as f64).abs())
        .sum();
    (sum / samples.len() as f64) as f32
}
