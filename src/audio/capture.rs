//! Microphone capture boundary.
//!
//! [`CaptureSource`] abstracts the capture device so the engine can run
//! against a mock in tests and CPAL in production. Sources deliver raw
//! float samples at their native rate and channel count; downmixing and
//! resampling happen in the encoder, never in the device callback.

use crate::error::{Result, VoxcallError};

/// Trait for capture devices.
///
/// This trait allows swapping implementations (real audio device vs mock).
pub trait CaptureSource: Send {
    /// Start capturing audio from the source.
    ///
    /// # Errors
    /// Returns `VoxcallError::DeviceUnavailable` when no usable device
    /// exists — fatal for the session, never retried.
    fn start(&mut self) -> Result<()>;

    /// Stop capturing and release the device. Idempotent.
    fn stop(&mut self) -> Result<()>;

    /// Read whatever samples have accumulated since the last read.
    ///
    /// Returns interleaved float samples at [`sample_rate`](Self::sample_rate)
    /// and [`channels`](Self::channels); empty when nothing is ready yet.
    fn read_samples(&mut self) -> Result<Vec<f32>>;

    /// Native sample rate of the captured audio in Hz.
    fn sample_rate(&self) -> u32;

    /// Number of interleaved channels in the captured audio.
    fn channels(&self) -> usize;
}

/// Mock capture source for testing.
#[derive(Debug, Clone)]
pub struct MockCaptureSource {
    is_started: bool,
    frames: Vec<Vec<f32>>,
    next_frame: usize,
    sample_rate: u32,
    channels: usize,
    should_fail_start: bool,
    should_fail_read: bool,
    error_message: String,
}

impl MockCaptureSource {
    /// Create a mock that yields silence frames at 24kHz mono.
    pub fn new() -> Self {
        Self {
            is_started: false,
            frames: vec![vec![0.0f32; 480]],
            next_frame: 0,
            sample_rate: 24_000,
            channels: 1,
            should_fail_start: false,
            should_fail_read: false,
            error_message: "mock capture error".to_string(),
        }
    }

    /// Configure the frames returned by successive reads.
    ///
    /// Reads cycle through the list; an empty list yields empty reads.
    pub fn with_frames(mut self, frames: Vec<Vec<f32>>) -> Self {
        self.frames = frames;
        self
    }

    /// Configure the native sample rate reported by the mock.
    pub fn with_sample_rate(mut self, sample_rate: u32) -> Self {
        self.sample_rate = sample_rate;
        self
    }

    /// Configure the channel count reported by the mock.
    pub fn with_channels(mut self, channels: usize) -> Self {
        self.channels = channels;
        self
    }

    /// Configure the mock to fail on start with `DeviceUnavailable`.
    pub fn with_start_failure(mut self) -> Self {
        self.should_fail_start = true;
        self
    }

    /// Configure the mock to fail on read.
    pub fn with_read_failure(mut self) -> Self {
        self.should_fail_read = true;
        self
    }

    /// Configure the error message for failures.
    pub fn with_error_message(mut self, message: &str) -> Self {
        self.error_message = message.to_string();
        self
    }

    /// Check if the capture source is started.
    pub fn is_started(&self) -> bool {
        self.is_started
    }
}

impl Default for MockCaptureSource {
    fn default() -> Self {
        Self::new()
    }
}

impl CaptureSource for MockCaptureSource {
    fn start(&mut self) -> Result<()> {
        if self.should_fail_start {
            Err(VoxcallError::DeviceUnavailable {
                message: self.error_message.clone(),
            })
        } else {
            self.is_started = true;
            Ok(())
        }
    }

    fn stop(&mut self) -> Result<()> {
        self.is_started = false;
        Ok(())
    }

    fn read_samples(&mut self) -> Result<Vec<f32>> {
        if self.should_fail_read {
            return Err(VoxcallError::Capture {
                message: self.error_message.clone(),
            });
        }
        if self.frames.is_empty() {
            return Ok(Vec::new());
        }
        let frame = self.frames[self.next_frame % self.frames.len()].clone();
        self.next_frame += 1;
        Ok(frame)
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn channels(&self) -> usize {
        self.channels
    }
}

#[cfg(feature = "cpal-audio")]
pub use cpal_source::{CpalCaptureSource, list_devices, suppress_audio_warnings};

#[cfg(feature = "cpal-audio")]
mod cpal_source {
    use super::CaptureSource;
    use crate::error::{Result, VoxcallError};
    use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
    use std::sync::{Arc, Mutex};

    /// Run a closure with stderr temporarily redirected to /dev/null.
    ///
    /// Suppresses noisy ALSA/JACK/PipeWire messages that CPAL triggers when
    /// probing audio backends; they are harmless but confusing to users.
    ///
    /// # Safety
    /// Uses `libc::dup`/`libc::dup2` to save and restore file descriptor 2.
    /// Safe as long as no other thread is concurrently manipulating fd 2.
    fn with_suppressed_stderr<F, R>(f: F) -> R
    where
        F: FnOnce() -> R,
    {
        unsafe {
            let saved_fd = libc::dup(2);
            let devnull = libc::open(c"/dev/null".as_ptr(), libc::O_WRONLY);
            if saved_fd >= 0 && devnull >= 0 {
                libc::dup2(devnull, 2);
                libc::close(devnull);
            }

            let result = f();

            if saved_fd >= 0 {
                libc::dup2(saved_fd, 2);
                libc::close(saved_fd);
            }

            result
        }
    }

    /// Suppress noisy JACK/ALSA messages emitted during backend probing.
    ///
    /// # Safety
    /// Modifies environment variables, which is safe when called before
    /// spawning threads.
    pub fn suppress_audio_warnings() {
        // SAFETY: Called at startup before any threads are spawned
        unsafe {
            std::env::set_var("JACK_NO_START_SERVER", "1");
            std::env::set_var("JACK_NO_AUDIO_RESERVATION", "1");
            std::env::set_var("PIPEWIRE_DEBUG", "0");
            std::env::set_var("ALSA_DEBUG", "0");
            std::env::set_var("PW_LOG", "0");
        }
    }

    /// List all available audio input devices.
    ///
    /// # Errors
    /// Returns `VoxcallError::Capture` if device enumeration fails.
    pub fn list_devices() -> Result<Vec<String>> {
        let (host, devices) = with_suppressed_stderr(|| {
            let host = cpal::default_host();
            let devices = host.input_devices();
            (host, devices)
        });
        let _ = host; // keep host alive while iterating devices
        let devices = devices.map_err(|e| VoxcallError::Capture {
            message: format!("Failed to enumerate input devices: {}", e),
        })?;

        let mut device_names = Vec::new();
        for device in devices {
            if let Ok(name) = device.name() {
                device_names.push(name);
            }
        }

        Ok(device_names)
    }

    /// Wrapper for cpal::Stream to make it Send.
    ///
    /// SAFETY: The stream is only accessed from a single thread at a time
    /// through the Mutex wrapper in CpalCaptureSource; its methods are called
    /// synchronously and don't cross thread boundaries unsafely.
    struct SendableStream(cpal::Stream);

    unsafe impl Send for SendableStream {}

    /// Real microphone capture via CPAL.
    ///
    /// Captures at the device's default config; the callback only appends raw
    /// float samples into a shared buffer. Format conversion belongs to the
    /// encoder thread, keeping the callback fast enough that the platform
    /// never drops frames.
    pub struct CpalCaptureSource {
        device: cpal::Device,
        stream: Arc<Mutex<Option<SendableStream>>>,
        buffer: Arc<Mutex<Vec<f32>>>,
        sample_rate: u32,
        channels: usize,
    }

    impl CpalCaptureSource {
        /// Create a new CPAL capture source.
        ///
        /// # Arguments
        /// * `device_name` - Optional device name; `None` uses the default
        ///   input device.
        ///
        /// # Errors
        /// Returns `VoxcallError::DeviceUnavailable` when the device is
        /// missing or exposes no usable input config.
        pub fn new(device_name: Option<&str>) -> Result<Self> {
            let device = with_suppressed_stderr(|| {
                let host = cpal::default_host();

                if let Some(name) = device_name {
                    let devices = host.input_devices().map_err(|e| {
                        VoxcallError::DeviceUnavailable {
                            message: format!("Failed to enumerate devices: {}", e),
                        }
                    })?;

                    for dev in devices {
                        if let Ok(dev_name) = dev.name()
                            && dev_name == name
                        {
                            return Ok(dev);
                        }
                    }

                    Err(VoxcallError::DeviceUnavailable {
                        message: format!("input device not found: {}", name),
                    })
                } else {
                    host.default_input_device()
                        .ok_or_else(|| VoxcallError::DeviceUnavailable {
                            message: "no default input device".to_string(),
                        })
                }
            })?;

            let default_config =
                device
                    .default_input_config()
                    .map_err(|e| VoxcallError::DeviceUnavailable {
                        message: format!("Failed to query default input config: {}", e),
                    })?;

            let sample_rate = default_config.sample_rate().0;
            let channels = default_config.channels() as usize;

            Ok(Self {
                device,
                stream: Arc::new(Mutex::new(None)),
                buffer: Arc::new(Mutex::new(Vec::new())),
                sample_rate,
                channels,
            })
        }

        fn build_stream(&self) -> Result<cpal::Stream> {
            use cpal::SampleFormat;

            let default_config = self.device.default_input_config().map_err(|e| {
                VoxcallError::DeviceUnavailable {
                    message: format!("Failed to query default input config: {}", e),
                }
            })?;
            let stream_config: cpal::StreamConfig = default_config.clone().into();

            let err_callback = |err| {
                tracing::warn!("audio capture stream error: {}", err);
            };

            let buffer = Arc::clone(&self.buffer);
            match default_config.sample_format() {
                SampleFormat::F32 => self
                    .device
                    .build_input_stream(
                        &stream_config,
                        move |data: &[f32], _: &cpal::InputCallbackInfo| {
                            if let Ok(mut buf) = buffer.lock() {
                                buf.extend_from_slice(data);
                            }
                        },
                        err_callback,
                        None,
                    )
                    .map_err(|e| VoxcallError::DeviceUnavailable {
                        message: format!("Failed to build f32 input stream: {}", e),
                    }),
                SampleFormat::I16 => self
                    .device
                    .build_input_stream(
                        &stream_config,
                        move |data: &[i16], _: &cpal::InputCallbackInfo| {
                            if let Ok(mut buf) = buffer.lock() {
                                buf.extend(data.iter().map(|&s| s as f32 / i16::MAX as f32));
                            }
                        },
                        err_callback,
                        None,
                    )
                    .map_err(|e| VoxcallError::DeviceUnavailable {
                        message: format!("Failed to build i16 input stream: {}", e),
                    }),
                fmt => Err(VoxcallError::DeviceUnavailable {
                    message: format!("Unsupported native sample format: {:?}", fmt),
                }),
            }
        }
    }

    impl CaptureSource for CpalCaptureSource {
        fn start(&mut self) -> Result<()> {
            let stream = self.build_stream()?;
            stream.play().map_err(|e| VoxcallError::DeviceUnavailable {
                message: format!("Failed to start input stream: {}", e),
            })?;

            if let Ok(mut slot) = self.stream.lock() {
                *slot = Some(SendableStream(stream));
            }
            Ok(())
        }

        fn stop(&mut self) -> Result<()> {
            if let Ok(mut slot) = self.stream.lock() {
                // Dropping the stream releases the device
                *slot = None;
            }
            if let Ok(mut buf) = self.buffer.lock() {
                buf.clear();
            }
            Ok(())
        }

        fn read_samples(&mut self) -> Result<Vec<f32>> {
            let mut buf = self.buffer.lock().map_err(|_| VoxcallError::Capture {
                message: "capture buffer poisoned".to_string(),
            })?;
            Ok(std::mem::take(&mut *buf))
        }

        fn sample_rate(&self) -> u32 {
            self.sample_rate
        }

        fn channels(&self) -> usize {
            self.channels
        }
    }
}
