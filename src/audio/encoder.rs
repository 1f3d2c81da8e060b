//! Capture encoding stage: the half-duplex gate and the resample hot path.
//!
//! A dedicated thread polls the capture source, discards frames while the
//! microphone is muted or the assistant's audio is playing, and forwards
//! everything else as engine-rate PCM16 over a bounded channel. The gate is
//! two atomics read per frame; nothing here ever blocks the capture device.

use crate::audio::capture::CaptureSource;
use crate::audio::codec;
use crate::defaults;
use crossbeam_channel::Sender;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Messages produced by the capture encoder thread.
#[derive(Debug, Clone, PartialEq)]
pub enum CaptureEvent {
    /// One encoded frame at the engine sample rate, already past the gate.
    Frame(Vec<i16>),
    /// Capture failed repeatedly and the thread gave up. Fatal.
    Failed { message: String },
}

/// Configuration for the capture encoder.
#[derive(Debug, Clone, Copy)]
pub struct EncoderConfig {
    /// Engine sample rate frames are resampled to.
    pub target_rate: u32,
    /// Poll interval for the capture source in milliseconds.
    pub poll_ms: u64,
    /// Consecutive read failures tolerated before aborting.
    pub max_consecutive_errors: u32,
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            target_rate: defaults::SAMPLE_RATE,
            poll_ms: defaults::CAPTURE_POLL_MS,
            max_consecutive_errors: defaults::CAPTURE_MAX_CONSECUTIVE_ERRORS,
        }
    }
}

/// Handle to a running capture encoder.
pub struct CaptureHandle {
    running: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl CaptureHandle {
    /// Signals the thread to stop, waits for it, and releases the device.
    ///
    /// Idempotent; safe to call after the thread already exited.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.thread.take()
            && handle.join().is_err()
        {
            tracing::error!("capture encoder thread panicked");
        }
    }

    /// Returns true while the encoder thread is running.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

impl Drop for CaptureHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Spawns the capture encoder thread.
///
/// * `muted` - host-controlled mute flag
/// * `outputting` - playback gating flag (set while assistant audio plays)
/// * `frames_tx` - bounded channel of [`CaptureEvent`]s; a full channel
///   drops the frame rather than block the poll loop
///
/// The source must already be constructed but not started; start failures
/// surface as a `Failed` event carrying the device error.
pub fn spawn(
    mut source: Box<dyn CaptureSource>,
    muted: Arc<AtomicBool>,
    outputting: Arc<AtomicBool>,
    frames_tx: Sender<CaptureEvent>,
    config: EncoderConfig,
) -> CaptureHandle {
    let running = Arc::new(AtomicBool::new(true));
    let thread_running = running.clone();

    let thread = thread::spawn(move || {
        if let Err(e) = source.start() {
            let _ = frames_tx.send(CaptureEvent::Failed {
                message: e.to_string(),
            });
            thread_running.store(false, Ordering::SeqCst);
            return;
        }

        let native_rate = source.sample_rate();
        let channels = source.channels();
        let poll_interval = Duration::from_millis(config.poll_ms);
        let mut consecutive_errors: u32 = 0;

        while thread_running.load(Ordering::SeqCst) {
            let samples = match source.read_samples() {
                Ok(s) => {
                    consecutive_errors = 0;
                    s
                }
                Err(e) => {
                    consecutive_errors += 1;
                    if consecutive_errors >= config.max_consecutive_errors {
                        tracing::error!(
                            "capture failed {} times in a row: {}",
                            consecutive_errors,
                            e
                        );
                        let _ = frames_tx.send(CaptureEvent::Failed {
                            message: e.to_string(),
                        });
                        break;
                    }
                    thread::sleep(poll_interval);
                    continue;
                }
            };

            if samples.is_empty() {
                thread::sleep(poll_interval);
                continue;
            }

            // Half-duplex gate: while muted or the assistant is audible, the
            // frame is dropped before any encoding or transmission.
            if muted.load(Ordering::Acquire) || outputting.load(Ordering::Acquire) {
                thread::sleep(poll_interval);
                continue;
            }

            let mono = codec::mix_to_mono(&samples, channels);
            let encoded = codec::resample(&mono, native_rate, config.target_rate);
            if encoded.is_empty() {
                thread::sleep(poll_interval);
                continue;
            }

            // Full channel means the consumer is behind; dropping one frame
            // is better than stalling the capture loop.
            if frames_tx.try_send(CaptureEvent::Frame(encoded)).is_err()
                && !thread_running.load(Ordering::SeqCst)
            {
                break;
            }

            thread::sleep(poll_interval);
        }

        if let Err(e) = source.stop() {
            tracing::warn!("failed to stop capture source: {}", e);
        }
        thread_running.store(false, Ordering::SeqCst);
    });

    CaptureHandle {
        running,
        thread: Some(thread),
    }
}
