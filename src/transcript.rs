//! Per-turn transcript correlation.
//!
//! One [`Turn`] is open at a time: assistant deltas accumulate in arrival
//! order, the user's text arrives from whichever source resolves first, and
//! the finalized pair is emitted exactly once. A turn whose user transcript
//! never resolves gets a timestamped placeholder, because losing the
//! assistant's answer from the visible history is worse than an imprecise
//! user-side label. That substitution is deliberate product behavior.

use chrono::{DateTime, Local, Utc};

/// One assistant response cycle, from first audio byte to drained playback.
#[derive(Debug, Clone)]
pub struct Turn {
    /// Monotonic identifier correlating late transcription results.
    pub seq: u64,
    /// The user's recognized text, if any source resolved it.
    pub user_transcript: Option<String>,
    /// Assistant transcript accumulated from deltas.
    pub ai_transcript: String,
    /// Authoritative final transcript, when the endpoint sent one.
    final_transcript: Option<String>,
    /// When the turn opened.
    pub started_at: DateTime<Utc>,
    /// When the turn finalized.
    pub ended_at: Option<DateTime<Utc>>,
}

/// The finalized (user, assistant) text pair handed to the host.
#[derive(Debug, Clone, PartialEq)]
pub struct TranscriptPair {
    pub user_text: String,
    pub ai_text: String,
}

/// Accumulates transcript fragments for the open turn.
#[derive(Debug, Default)]
pub struct TranscriptReconciler {
    current: Option<Turn>,
    next_seq: u64,
}

impl TranscriptReconciler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens a new turn and returns its sequence number.
    ///
    /// An already-open turn is discarded with a warning; the controller
    /// finalizes turns before opening new ones, so this only fires on a
    /// protocol violation by the endpoint.
    pub fn begin_turn(&mut self) -> u64 {
        if self.current.is_some() {
            tracing::warn!("turn opened while previous still pending; discarding stale turn");
        }
        let seq = self.next_seq;
        self.next_seq += 1;
        self.current = Some(Turn {
            seq,
            user_transcript: None,
            ai_transcript: String::new(),
            final_transcript: None,
            started_at: Utc::now(),
            ended_at: None,
        });
        seq
    }

    /// Sequence number of the open turn, if any.
    pub fn open_seq(&self) -> Option<u64> {
        self.current.as_ref().map(|t| t.seq)
    }

    /// Appends one assistant transcript delta in arrival order.
    pub fn push_ai_delta(&mut self, delta: &str) {
        if let Some(turn) = self.current.as_mut() {
            turn.ai_transcript.push_str(delta);
        } else {
            tracing::debug!("assistant transcript delta outside any turn, dropped");
        }
    }

    /// Records the endpoint's final assistant transcript.
    ///
    /// A non-empty final transcript supersedes the delta accumulation;
    /// an empty one leaves the accumulation as the source of truth.
    pub fn set_ai_final(&mut self, transcript: &str) {
        if let Some(turn) = self.current.as_mut()
            && !transcript.is_empty()
        {
            turn.final_transcript = Some(transcript.to_string());
        }
    }

    /// Resolves the user transcript for turn `seq`. First source wins.
    ///
    /// Returns false when the result arrived too late (turn closed) or for
    /// a different turn, or when a transcript was already resolved.
    pub fn set_user_transcript(&mut self, seq: u64, text: &str) -> bool {
        match self.current.as_mut() {
            Some(turn) if turn.seq == seq && turn.user_transcript.is_none() => {
                turn.user_transcript = Some(text.to_string());
                true
            }
            _ => false,
        }
    }

    /// True when the open turn already has a user transcript.
    pub fn has_user_transcript(&self) -> bool {
        self.current
            .as_ref()
            .is_some_and(|t| t.user_transcript.is_some())
    }

    /// Closes the open turn and returns its pair, exactly once.
    ///
    /// The placeholder substitutes for an unresolved user transcript so the
    /// pair is still emitted.
    pub fn finalize(&mut self) -> Option<TranscriptPair> {
        let mut turn = self.current.take()?;
        turn.ended_at = Some(Utc::now());

        let ai_text = turn
            .final_transcript
            .unwrap_or(turn.ai_transcript);
        let user_text = turn
            .user_transcript
            .unwrap_or_else(|| placeholder_transcript(Local::now()));

        Some(TranscriptPair { user_text, ai_text })
    }

    /// Discards the open turn without emitting, e.g. on session teardown.
    pub fn abandon(&mut self) {
        self.current = None;
    }
}

/// The stand-in label for an unresolved user transcript.
pub fn placeholder_transcript(at: DateTime<Local>) -> String {
    format!("voice message ({})", at.format("%H:%M:%S"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ai_deltas_concatenate_in_arrival_order() {
        let mut reconciler = TranscriptReconciler::new();
        let seq = reconciler.begin_turn();
        reconciler.push_ai_delta("Hello");
        reconciler.push_ai_delta(", ");
        reconciler.push_ai_delta("world.");
        reconciler.set_user_transcript(seq, "hi");

        let pair = reconciler.finalize().expect("pair");
        assert_eq!(pair.ai_text, "Hello, world.");
        assert_eq!(pair.user_text, "hi");
    }

    #[test]
    fn test_final_transcript_supersedes_deltas() {
        let mut reconciler = TranscriptReconciler::new();
        let seq = reconciler.begin_turn();
        reconciler.push_ai_delta("Hel");
        reconciler.push_ai_delta("lo");
        reconciler.set_ai_final("Hello there.");
        reconciler.set_user_transcript(seq, "hi");

        let pair = reconciler.finalize().expect("pair");
        assert_eq!(pair.ai_text, "Hello there.");
    }

    #[test]
    fn test_empty_final_transcript_keeps_accumulation() {
        let mut reconciler = TranscriptReconciler::new();
        let seq = reconciler.begin_turn();
        reconciler.push_ai_delta("Hello");
        reconciler.set_ai_final("");
        reconciler.set_user_transcript(seq, "hi");

        let pair = reconciler.finalize().expect("pair");
        assert_eq!(pair.ai_text, "Hello");
    }

    #[test]
    fn test_first_user_transcript_source_wins() {
        let mut reconciler = TranscriptReconciler::new();
        let seq = reconciler.begin_turn();

        assert!(reconciler.set_user_transcript(seq, "inline result"));
        assert!(!reconciler.set_user_transcript(seq, "batch result"));

        let pair = reconciler.finalize().expect("pair");
        assert_eq!(pair.user_text, "inline result");
    }

    #[test]
    fn test_unresolved_user_transcript_gets_placeholder() {
        let mut reconciler = TranscriptReconciler::new();
        reconciler.begin_turn();
        reconciler.push_ai_delta("The answer is 42.");

        let pair = reconciler.finalize().expect("pair still emitted");
        assert!(
            pair.user_text.starts_with("voice message ("),
            "got: {}",
            pair.user_text
        );
        assert!(pair.user_text.ends_with(')'));
        assert_eq!(pair.ai_text, "The answer is 42.");
    }

    #[test]
    fn test_placeholder_format() {
        let at = Local::now();
        let placeholder = placeholder_transcript(at);
        assert_eq!(placeholder, format!("voice message ({})", at.format("%H:%M:%S")));
        // HH:MM:SS inside the parens
        let inner = &placeholder["voice message (".len()..placeholder.len() - 1];
        assert_eq!(inner.len(), 8);
        assert_eq!(inner.matches(':').count(), 2);
    }

    #[test]
    fn test_finalize_emits_exactly_once() {
        let mut reconciler = TranscriptReconciler::new();
        let seq = reconciler.begin_turn();
        reconciler.set_user_transcript(seq, "hi");
        reconciler.push_ai_delta("yo");

        assert!(reconciler.finalize().is_some());
        assert!(reconciler.finalize().is_none(), "pair must not repeat");
    }

    #[test]
    fn test_late_transcription_for_closed_turn_is_discarded() {
        let mut reconciler = TranscriptReconciler::new();
        let seq = reconciler.begin_turn();
        reconciler.finalize();

        assert!(!reconciler.set_user_transcript(seq, "too late"));
    }

    #[test]
    fn test_transcription_for_wrong_turn_is_discarded() {
        let mut reconciler = TranscriptReconciler::new();
        let first = reconciler.begin_turn();
        reconciler.finalize();
        let second = reconciler.begin_turn();

        assert!(!reconciler.set_user_transcript(first, "stale"));
        assert!(reconciler.set_user_transcript(second, "fresh"));
    }

    #[test]
    fn test_turn_sequence_numbers_increase() {
        let mut reconciler = TranscriptReconciler::new();
        let a = reconciler.begin_turn();
        reconciler.finalize();
        let b = reconciler.begin_turn();
        assert!(b > a);
    }

    #[test]
    fn test_delta_outside_turn_is_dropped() {
        let mut reconciler = TranscriptReconciler::new();
        reconciler.push_ai_delta("orphan");
        let seq = reconciler.begin_turn();
        reconciler.set_user_transcript(seq, "hi");
        let pair = reconciler.finalize().expect("pair");
        assert_eq!(pair.ai_text, "");
    }

    #[test]
    fn test_abandon_suppresses_emission() {
        let mut reconciler = TranscriptReconciler::new();
        reconciler.begin_turn();
        reconciler.abandon();
        assert!(reconciler.finalize().is_none());
    }
}
