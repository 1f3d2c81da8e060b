//! Batch transcription collaborator.
//!
//! When no inline user transcript arrives over the transport, the utterance
//! audio recorded during the listening phase is sent to a transcription
//! endpoint as a WAV blob. Failures here are never fatal to the session;
//! the reconciler falls back to its placeholder.

use crate::error::{Result, VoxcallError};
use std::sync::{Arc, Mutex};

/// Trait for speech-to-text transcription of a recorded utterance.
///
/// This trait allows swapping implementations (remote HTTP service vs mock).
pub trait TranscriptionBackend: Send + Sync {
    /// Transcribe a mono 16-bit WAV blob.
    ///
    /// # Arguments
    /// * `wav` - complete WAV container bytes
    /// * `language` - locale hint, e.g. "en"
    ///
    /// # Returns
    /// The recognized text, or a non-fatal error.
    fn transcribe(&self, wav: &[u8], language: &str) -> Result<String>;
}

/// Implement for Arc<T> so one backend is shared across turns.
impl<T: TranscriptionBackend> TranscriptionBackend for Arc<T> {
    fn transcribe(&self, wav: &[u8], language: &str) -> Result<String> {
        (**self).transcribe(wav, language)
    }
}

/// Mock transcription backend for testing.
#[derive(Debug, Clone)]
pub struct MockTranscriptionBackend {
    result: String,
    should_fail: bool,
    requests: Arc<Mutex<Vec<(usize, String)>>>,
}

impl MockTranscriptionBackend {
    /// Creates a mock returning the given text.
    pub fn new(result: &str) -> Self {
        Self {
            result: result.to_string(),
            should_fail: false,
            requests: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Configure the mock to fail every request.
    pub fn with_failure(mut self) -> Self {
        self.should_fail = true;
        self
    }

    /// Recorded (wav byte length, language) pairs.
    pub fn requests(&self) -> Vec<(usize, String)> {
        self.requests.lock().map(|r| r.clone()).unwrap_or_default()
    }
}

impl TranscriptionBackend for MockTranscriptionBackend {
    fn transcribe(&self, wav: &[u8], language: &str) -> Result<String> {
        if let Ok(mut requests) = self.requests.lock() {
            requests.push((wav.len(), language.to_string()));
        }
        if self.should_fail {
            Err(VoxcallError::Transcription {
                message: "mock transcription failure".to_string(),
            })
        } else {
            Ok(self.result.clone())
        }
    }
}

#[cfg(feature = "http-transcription")]
pub use http_backend::HttpTranscriptionBackend;

#[cfg(feature = "http-transcription")]
mod http_backend {
    use super::TranscriptionBackend;
    use crate::error::{Result, VoxcallError};
    use serde::Deserialize;
    use std::time::Duration;

    #[derive(Deserialize)]
    struct TranscriptionResponse {
        text: String,
    }

    /// Remote transcription over HTTP multipart.
    ///
    /// Posts the WAV blob with a language hint and expects `{"text": ...}`.
    pub struct HttpTranscriptionBackend {
        client: reqwest::blocking::Client,
        endpoint: String,
        api_key: Option<String>,
    }

    impl HttpTranscriptionBackend {
        /// Creates a backend for the given endpoint URL.
        pub fn new(endpoint: &str, api_key: Option<&str>) -> Result<Self> {
            let client = reqwest::blocking::Client::builder()
                .timeout(Duration::from_secs(30))
                .build()
                .map_err(|e| VoxcallError::Transcription {
                    message: format!("failed to build HTTP client: {}", e),
                })?;
            Ok(Self {
                client,
                endpoint: endpoint.to_string(),
                api_key: api_key.map(str::to_string),
            })
        }
    }

    impl TranscriptionBackend for HttpTranscriptionBackend {
        fn transcribe(&self, wav: &[u8], language: &str) -> Result<String> {
            let part = reqwest::blocking::multipart::Part::bytes(wav.to_vec())
                .file_name("utterance.wav")
                .mime_str("audio/wav")
                .map_err(|e| VoxcallError::Transcription {
                    message: format!("failed to build multipart body: {}", e),
                })?;
            let form = reqwest::blocking::multipart::Form::new()
                .part("file", part)
                .text("language", language.to_string());

            let mut request = self.client.post(&self.endpoint).multipart(form);
            if let Some(key) = &self.api_key {
                request = request.bearer_auth(key);
            }

            let response = request.send().map_err(|e| VoxcallError::Transcription {
                message: format!("transcription request failed: {}", e),
            })?;

            if !response.status().is_success() {
                return Err(VoxcallError::Transcription {
                    message: format!("transcription endpoint returned {}", response.status()),
                });
            }

            let body: TranscriptionResponse =
                response.json().map_err(|e| VoxcallError::Transcription {
                    message: format!("unparseable transcription response: {}", e),
                })?;
            Ok(body.text)
        }
    }
}
