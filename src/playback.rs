//! Jitter-buffered gapless playback scheduling.
//!
//! Inbound audio deltas coalesce into fixed-duration chunks behind a jitter
//! buffer: output starts only once enough chunks are queued to ride out
//! bursty delivery, and every chunk is scheduled against the previous
//! chunk's end time so output is back-to-back with no gap and no overlap.
//! The scheduler runs on its own thread; the controller talks to it through
//! a command channel and reads the `outputting` atomic for half-duplex
//! gating.

use crate::audio::segmenter::Clock;
use crate::defaults;
use crate::error::Result;
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, bounded, unbounded};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Abstraction over the audio output device.
///
/// `play` is an enqueue, not a blocking render: the scheduler paces calls so
/// a sink that plays immediately still produces gapless output.
pub trait PlaybackSink: Send {
    /// Queue one chunk of mono PCM16 for output.
    fn play(&mut self, samples: &[i16], sample_rate: u32) -> Result<()>;

    /// Stop output immediately and discard anything queued in the device.
    fn stop(&mut self) -> Result<()>;
}

/// One `play` call recorded by [`MockPlaybackSink`].
#[derive(Debug, Clone)]
pub struct PlayedChunk {
    /// When the chunk was handed to the sink.
    pub at: Instant,
    /// Number of samples in the chunk.
    pub samples: usize,
}

/// Test double recording every play and stop.
#[derive(Clone, Default)]
pub struct MockPlaybackSink {
    /// Chunks handed to the sink, in order.
    pub played: Arc<Mutex<Vec<PlayedChunk>>>,
    /// Number of `stop` calls.
    pub stops: Arc<Mutex<u32>>,
}

impl MockPlaybackSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total samples played so far.
    pub fn total_samples(&self) -> usize {
        self.played
            .lock()
            .map(|p| p.iter().map(|c| c.samples).sum())
            .unwrap_or(0)
    }

    /// Number of chunks played so far.
    pub fn chunk_count(&self) -> usize {
        self.played.lock().map(|p| p.len()).unwrap_or(0)
    }
}

impl PlaybackSink for MockPlaybackSink {
    fn play(&mut self, samples: &[i16], _sample_rate: u32) -> Result<()> {
        if let Ok(mut played) = self.played.lock() {
            played.push(PlayedChunk {
                at: Instant::now(),
                samples: samples.len(),
            });
        }
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        if let Ok(mut stops) = self.stops.lock() {
            *stops += 1;
        }
        Ok(())
    }
}

/// Configuration for the playback scheduler.
#[derive(Debug, Clone, Copy)]
pub struct PlaybackConfig {
    /// Sample rate of inbound audio in Hz.
    pub sample_rate: u32,
    /// Duration of one coalesced chunk in milliseconds.
    pub chunk_ms: u32,
    /// Chunks required in the queue before a turn's output starts.
    pub min_queue_chunks: usize,
    /// Interval between drain-loop ticks in milliseconds.
    pub poll_ms: u64,
    /// Consecutive empty checks before a mid-turn drain pauses.
    pub max_empty_polls: u32,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            sample_rate: defaults::SAMPLE_RATE,
            chunk_ms: defaults::PLAYBACK_CHUNK_MS,
            min_queue_chunks: defaults::MIN_QUEUE_CHUNKS,
            poll_ms: defaults::DRAIN_POLL_MS,
            max_empty_polls: defaults::DRAIN_MAX_EMPTY_POLLS,
        }
    }
}

impl PlaybackConfig {
    fn chunk_samples(&self) -> usize {
        (self.sample_rate as u64 * self.chunk_ms as u64 / 1000) as usize
    }
}

enum PlaybackCommand {
    Delta(Vec<i16>),
    Finish,
    Interrupt,
    Shutdown,
}

/// Events emitted by the scheduler thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackEvent {
    /// The finished turn's queue and in-flight output have fully drained.
    Drained,
}

/// Handle to a running playback scheduler.
pub struct PlaybackHandle {
    cmd_tx: Sender<PlaybackCommand>,
    events_rx: Receiver<PlaybackEvent>,
    outputting: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl PlaybackHandle {
    /// Append one decoded audio delta to the current turn.
    pub fn push_delta(&self, samples: Vec<i16>) {
        let _ = self.cmd_tx.send(PlaybackCommand::Delta(samples));
    }

    /// Signal end-of-turn: flush the remainder and drain to completion.
    ///
    /// A `Drained` event follows once all output has audibly finished.
    pub fn finish_turn(&self) {
        let _ = self.cmd_tx.send(PlaybackCommand::Finish);
    }

    /// Discard all queued and in-flight output immediately.
    ///
    /// The `outputting` flag is left untouched (the caller decides whether
    /// the interrupting turn keeps the gate engaged); clear it with
    /// [`clear_outputting`](Self::clear_outputting) when the interrupt is
    /// not followed by a new turn.
    pub fn interrupt(&self) {
        let _ = self.cmd_tx.send(PlaybackCommand::Interrupt);
    }

    /// Clears the gating flag after an interrupt that ends output for good.
    pub fn clear_outputting(&self) {
        self.outputting.store(false, Ordering::Release);
    }

    /// The shared gating flag read by the capture encoder.
    pub fn outputting_flag(&self) -> Arc<AtomicBool> {
        self.outputting.clone()
    }

    /// True while assistant audio for the current turn is being output.
    pub fn is_outputting(&self) -> bool {
        self.outputting.load(Ordering::Acquire)
    }

    /// The scheduler's event stream.
    pub fn events(&self) -> Receiver<PlaybackEvent> {
        self.events_rx.clone()
    }

    /// Stops the scheduler thread and the sink synchronously.
    pub fn shutdown(&mut self) {
        let _ = self.cmd_tx.send(PlaybackCommand::Shutdown);
        if let Some(handle) = self.thread.take()
            && handle.join().is_err()
        {
            tracing::error!("playback scheduler thread panicked");
        }
    }
}

impl Drop for PlaybackHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Spawns the scheduler thread.
pub fn spawn(
    config: PlaybackConfig,
    sink: Box<dyn PlaybackSink>,
    clock: Arc<dyn Clock>,
) -> PlaybackHandle {
    let (cmd_tx, cmd_rx) = unbounded();
    let (events_tx, events_rx) = bounded(16);
    let outputting = Arc::new(AtomicBool::new(false));

    let scheduler = Scheduler {
        config,
        sink,
        clock,
        events_tx,
        outputting: outputting.clone(),
        pending: Vec::new(),
        queue: VecDeque::new(),
        draining: false,
        turn_started: false,
        finishing: false,
        playhead: None,
        empty_polls: 0,
    };

    let thread = thread::spawn(move || scheduler.run(cmd_rx));

    PlaybackHandle {
        cmd_tx,
        events_rx,
        outputting,
        thread: Some(thread),
    }
}

struct Scheduler {
    config: PlaybackConfig,
    sink: Box<dyn PlaybackSink>,
    clock: Arc<dyn Clock>,
    events_tx: Sender<PlaybackEvent>,
    outputting: Arc<AtomicBool>,
    /// Samples not yet large enough to cut a whole chunk.
    pending: Vec<i16>,
    /// Whole chunks awaiting output, FIFO.
    queue: VecDeque<Vec<i16>>,
    /// True while the drain is actively pacing chunks out.
    draining: bool,
    /// True once this turn's drain has started at least once; a drain
    /// paused by an underrun resumes without re-filling the jitter buffer.
    turn_started: bool,
    /// True between `Finish` and the `Drained` event.
    finishing: bool,
    /// Scheduled end time of the last chunk handed to the sink.
    playhead: Option<Instant>,
    empty_polls: u32,
}

impl Scheduler {
    fn run(mut self, cmd_rx: Receiver<PlaybackCommand>) {
        let tick = Duration::from_millis(self.config.poll_ms);
        loop {
            match cmd_rx.recv_timeout(tick) {
                Ok(PlaybackCommand::Delta(samples)) => self.on_delta(samples),
                Ok(PlaybackCommand::Finish) => self.on_finish(),
                Ok(PlaybackCommand::Interrupt) => self.on_interrupt(),
                Ok(PlaybackCommand::Shutdown) => break,
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
            self.pump();
        }
        if let Err(e) = self.sink.stop() {
            tracing::warn!("failed to stop playback sink: {}", e);
        }
        self.outputting.store(false, Ordering::Release);
    }

    fn on_delta(&mut self, samples: Vec<i16>) {
        self.pending.extend(samples);
        let chunk_samples = self.config.chunk_samples();
        while self.pending.len() >= chunk_samples {
            let chunk: Vec<i16> = self.pending.drain(..chunk_samples).collect();
            self.queue.push_back(chunk);
        }
    }

    fn on_finish(&mut self) {
        // The final chunk of a turn may be shorter than the fixed size.
        if !self.pending.is_empty() {
            let remainder = std::mem::take(&mut self.pending);
            self.queue.push_back(remainder);
        }
        self.finishing = true;
    }

    fn on_interrupt(&mut self) {
        self.pending.clear();
        self.queue.clear();
        if let Err(e) = self.sink.stop() {
            tracing::warn!("failed to stop playback sink: {}", e);
        }
        self.playhead = None;
        self.draining = false;
        self.turn_started = false;
        self.finishing = false;
        self.empty_polls = 0;
        // The gate is deliberately NOT cleared here: an interrupt is
        // processed asynchronously and the session layer may already have
        // re-engaged the gate for the interrupting turn. The caller owns
        // the flag on this path; `Drained` and shutdown still clear it.
    }

    fn reset_turn(&mut self) {
        self.draining = false;
        self.turn_started = false;
        self.finishing = false;
        self.empty_polls = 0;
        self.outputting.store(false, Ordering::Release);
    }

    fn maybe_start(&mut self) {
        if self.draining {
            return;
        }
        let jitter_buffer_full = self.queue.len() >= self.config.min_queue_chunks;
        let resume = self.turn_started && !self.queue.is_empty();
        let forced = self.finishing && !self.queue.is_empty();
        if jitter_buffer_full || resume || forced {
            self.draining = true;
            self.turn_started = true;
            self.empty_polls = 0;
            self.outputting.store(true, Ordering::Release);
        }
    }

    fn pump(&mut self) {
        self.maybe_start();

        if self.draining {
            self.play_due_chunks();
        }

        if !self.queue.is_empty() {
            return;
        }

        let now = self.clock.now();
        let in_flight_done = self.playhead.is_none_or(|end| now >= end);

        if self.finishing {
            // End-of-turn: the turn completes only when the queue is empty
            // AND the scheduled playhead has elapsed, so the host never
            // unmutes while audio is still audible.
            if in_flight_done {
                let _ = self.events_tx.send(PlaybackEvent::Drained);
                self.playhead = None;
                self.reset_turn();
            }
        } else if self.draining {
            // Mid-turn underrun: poll a bounded number of times so a burst
            // arriving late is stitched in, then pause the drain. The
            // outputting gate stays set until the turn actually ends.
            self.empty_polls += 1;
            if self.empty_polls >= self.config.max_empty_polls && in_flight_done {
                self.draining = false;
                self.empty_polls = 0;
            }
        }
    }

    /// Hand queued chunks to the sink, keeping at most one chunk of lead
    /// over real time. Each chunk starts exactly at the previous chunk's
    /// scheduled end, never "now", even when decode runs early.
    fn play_due_chunks(&mut self) {
        let rate = self.config.sample_rate;
        let lead = Duration::from_millis(self.config.chunk_ms as u64);

        loop {
            let now = self.clock.now();
            let start = match self.playhead {
                Some(end) if end > now => end,
                _ => now,
            };
            if start > now + lead {
                break;
            }
            let Some(chunk) = self.queue.pop_front() else {
                break;
            };
            let chunk_duration =
                Duration::from_micros(chunk.len() as u64 * 1_000_000 / rate as u64);
            if let Err(e) = self.sink.play(&chunk, rate) {
                tracing::warn!("playback sink rejected chunk: {}", e);
            }
            self.playhead = Some(start + chunk_duration);
            self.empty_polls = 0;
        }
    }
}

#[cfg(feature = "rodio-audio")]
pub use rodio_sink::RodioPlaybackSink;

#[cfg(feature = "rodio-audio")]
mod rodio_sink {
    use super::PlaybackSink;
    use crate::error::{Result, VoxcallError};
    use rodio::buffer::SamplesBuffer;
    use rodio::{OutputStream, OutputStreamHandle, Sink};

    /// Speaker output via rodio.
    ///
    /// The scheduler already paces chunks, so this sink only appends them to
    /// the device queue.
    pub struct RodioPlaybackSink {
        // Held for the lifetime of the sink; dropping it kills the device.
        _stream: OutputStream,
        handle: OutputStreamHandle,
        sink: Option<Sink>,
    }

    impl RodioPlaybackSink {
        /// Opens the default output device.
        pub fn new() -> Result<Self> {
            let (stream, handle) =
                OutputStream::try_default().map_err(|e| VoxcallError::Playback {
                    message: format!("failed to open output device: {}", e),
                })?;
            Ok(Self {
                _stream: stream,
                handle,
                sink: None,
            })
        }

        fn ensure_sink(&mut self) -> Result<&Sink> {
            if self.sink.is_none() {
                let sink = Sink::try_new(&self.handle).map_err(|e| VoxcallError::Playback {
                    message: format!("failed to create playback sink: {}", e),
                })?;
                self.sink = Some(sink);
            }
            self.sink.as_ref().ok_or_else(|| VoxcallError::Playback {
                message: "playback sink unavailable".to_string(),
            })
        }
    }

    impl PlaybackSink for RodioPlaybackSink {
        fn play(&mut self, samples: &[i16], sample_rate: u32) -> Result<()> {
            let buffer = SamplesBuffer::new(1, sample_rate, samples.to_vec());
            self.ensure_sink()?.append(buffer);
            Ok(())
        }

        fn stop(&mut self) -> Result<()> {
            if let Some(sink) = self.sink.take() {
                sink.stop();
            }
            Ok(())
        }
    }

    // SAFETY: rodio's OutputStream is !Send on some platforms; the scheduler
    // confines the sink to its single thread after construction.
    unsafe impl Send for RodioPlaybackSink {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::segmenter::SystemClock;

    const RATE: u32 = 24_000;

    /// 10ms chunks, 3-chunk jitter buffer: small enough for fast tests.
    fn test_config() -> PlaybackConfig {
        PlaybackConfig {
            sample_rate: RATE,
            chunk_ms: 10,
            min_queue_chunks: 3,
            poll_ms: 2,
            max_empty_polls: 3,
        }
    }

    fn chunk_samples() -> usize {
        test_config().chunk_samples()
    }

    fn start_scheduler() -> (PlaybackHandle, MockPlaybackSink) {
        let sink = MockPlaybackSink::new();
        let handle = spawn(
            test_config(),
            Box::new(sink.clone()),
            Arc::new(SystemClock),
        );
        (handle, sink)
    }

    fn wait_drained(handle: &PlaybackHandle, timeout: Duration) -> bool {
        matches!(
            handle.events().recv_timeout(timeout),
            Ok(PlaybackEvent::Drained)
        )
    }

    #[test]
    fn test_no_output_before_jitter_buffer_fills() {
        let (mut handle, sink) = start_scheduler();

        // Two whole chunks: one short of the threshold
        handle.push_delta(vec![100i16; chunk_samples() * 2]);
        thread::sleep(Duration::from_millis(80));
        assert_eq!(sink.chunk_count(), 0, "output started before MIN_QUEUE");
        assert!(!handle.is_outputting());

        // Third chunk tips it over
        handle.push_delta(vec![100i16; chunk_samples()]);
        thread::sleep(Duration::from_millis(80));
        assert!(sink.chunk_count() >= 1, "output never started");
        assert!(handle.is_outputting());

        handle.shutdown();
    }

    #[test]
    fn test_total_played_equals_total_input() {
        let (mut handle, sink) = start_scheduler();

        // 5.5 chunks of audio in odd-sized deltas
        let total = chunk_samples() * 5 + chunk_samples() / 2;
        let mut sent = 0;
        for delta in [700usize, 1100, 400, total - 2200] {
            handle.push_delta(vec![7i16; delta]);
            sent += delta;
        }
        assert_eq!(sent, total);
        handle.finish_turn();

        assert!(wait_drained(&handle, Duration::from_secs(3)), "no Drained");
        assert_eq!(sink.total_samples(), total);
        handle.shutdown();
    }

    #[test]
    fn test_chunks_are_fixed_size_except_final_flush() {
        let (mut handle, sink) = start_scheduler();

        handle.push_delta(vec![1i16; chunk_samples() * 4 + 100]);
        handle.finish_turn();
        assert!(wait_drained(&handle, Duration::from_secs(3)));

        let played = sink.played.lock().unwrap();
        assert_eq!(played.len(), 5);
        for chunk in &played[..4] {
            assert_eq!(chunk.samples, chunk_samples());
        }
        assert_eq!(played[4].samples, 100);
        drop(played);
        handle.shutdown();
    }

    #[test]
    fn test_drained_waits_for_in_flight_audio() {
        let (mut handle, sink) = start_scheduler();

        // 6 chunks = 60ms of audio
        handle.push_delta(vec![1i16; chunk_samples() * 6]);
        let started = Instant::now();
        handle.finish_turn();
        assert!(wait_drained(&handle, Duration::from_secs(3)));
        let elapsed = started.elapsed();

        assert_eq!(sink.total_samples(), chunk_samples() * 6);
        assert!(
            elapsed >= Duration::from_millis(50),
            "Drained after {:?}, before the audio could have finished",
            elapsed
        );
        assert!(!handle.is_outputting(), "gate must clear after the turn");
        handle.shutdown();
    }

    #[test]
    fn test_finish_without_audio_still_drains() {
        let (mut handle, _sink) = start_scheduler();
        handle.finish_turn();
        assert!(wait_drained(&handle, Duration::from_secs(2)));
        handle.shutdown();
    }

    #[test]
    fn test_interrupt_discards_queue_and_pending() {
        let (mut handle, sink) = start_scheduler();

        handle.push_delta(vec![1i16; chunk_samples() * 20]);
        thread::sleep(Duration::from_millis(30));
        handle.interrupt();
        thread::sleep(Duration::from_millis(30));

        let played_at_interrupt = sink.total_samples();
        assert!(
            played_at_interrupt < chunk_samples() * 20,
            "interrupt must discard queued audio"
        );
        assert!(*sink.stops.lock().unwrap() >= 1, "sink.stop not called");
        handle.clear_outputting();
        assert!(!handle.is_outputting());

        // A fresh turn starts cleanly after the interrupt
        handle.push_delta(vec![2i16; chunk_samples() * 3]);
        handle.finish_turn();
        assert!(wait_drained(&handle, Duration::from_secs(3)));
        assert_eq!(
            sink.total_samples(),
            played_at_interrupt + chunk_samples() * 3
        );
        handle.shutdown();
    }

    #[test]
    fn test_late_burst_is_stitched_into_the_turn() {
        let (mut handle, sink) = start_scheduler();

        // Start the turn, then let the queue run dry
        handle.push_delta(vec![1i16; chunk_samples() * 3]);
        thread::sleep(Duration::from_millis(60));
        assert!(sink.chunk_count() >= 1);
        assert!(handle.is_outputting(), "gate holds across an underrun");

        // Late burst mid-turn: plays without re-filling the jitter buffer
        handle.push_delta(vec![2i16; chunk_samples() * 2]);
        handle.finish_turn();
        assert!(wait_drained(&handle, Duration::from_secs(3)));
        assert_eq!(sink.total_samples(), chunk_samples() * 5);
        handle.shutdown();
    }

    #[test]
    fn test_chunks_scheduled_back_to_back() {
        let (mut handle, sink) = start_scheduler();

        handle.push_delta(vec![1i16; chunk_samples() * 5]);
        handle.finish_turn();
        assert!(wait_drained(&handle, Duration::from_secs(3)));

        // With a one-chunk lead, consecutive play calls may run early but
        // never drift later than the scheduled chain allows.
        let played = sink.played.lock().unwrap();
        let first = played.first().unwrap().at;
        let last = played.last().unwrap().at;
        let span = last.duration_since(first);
        // 5 chunks of 10ms scheduled back-to-back: the last hand-off happens
        // within the turn's duration plus scheduling slack.
        assert!(
            span <= Duration::from_millis(120),
            "hand-offs spread over {:?}",
            span
        );
        drop(played);
        handle.shutdown();
    }

    #[test]
    fn test_shutdown_is_synchronous_and_idempotent() {
        let (mut handle, sink) = start_scheduler();
        handle.push_delta(vec![1i16; chunk_samples() * 10]);
        handle.shutdown();
        handle.shutdown();
        assert!(*sink.stops.lock().unwrap() >= 1);
        assert!(!handle.is_outputting());
    }
}
