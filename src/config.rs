use crate::audio::encoder::EncoderConfig;
use crate::audio::segmenter::SegmenterConfig;
use crate::defaults;
use crate::error::{Result, VoxcallError};
use crate::playback::PlaybackConfig;
use crate::transport::channel::AudioWireMode;
use crate::transport::reconnect::ReconnectPolicy;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Turn-taking protocol of the session.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SessionMode {
    /// Client-side segmentation with explicit commit messages.
    Chunked,
    /// Server-side voice activity detection delimits utterances.
    Streaming,
}

/// Root configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    pub transport: TransportConfig,
    pub audio: AudioConfig,
    pub segmenter: SegmenterSettings,
    pub playback: PlaybackSettings,
    pub transcription: TranscriptionConfig,
}

/// Transport and reconnection configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TransportConfig {
    /// WebSocket URL of the relay endpoint.
    pub url: String,
    pub mode: SessionMode,
    pub wire: AudioWireMode,
    pub heartbeat_secs: u64,
    pub reconnect_max_attempts: u32,
    pub reconnect_base_delay_ms: u64,
    pub reconnect_max_delay_ms: u64,
}

/// Audio capture configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AudioConfig {
    pub device: Option<String>,
    /// Engine sample rate; the remote endpoint's native rate.
    pub sample_rate: u32,
}

/// Utterance segmentation configuration (chunked mode)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SegmenterSettings {
    pub speech_threshold: f32,
    pub hangover_ms: u32,
    pub settle_ms: u32,
    pub debounce_ms: u32,
    pub min_utterance_ms: u32,
}

/// Playback scheduling configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PlaybackSettings {
    pub chunk_ms: u32,
    pub min_queue_chunks: usize,
}

/// Batch transcription collaborator configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TranscriptionConfig {
    /// Endpoint URL; `None` disables batch transcription entirely.
    pub endpoint: Option<String>,
    pub api_key: Option<String>,
    pub language: String,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            mode: SessionMode::Streaming,
            wire: AudioWireMode::Base64,
            heartbeat_secs: defaults::HEARTBEAT_SECS,
            reconnect_max_attempts: defaults::RECONNECT_MAX_ATTEMPTS,
            reconnect_base_delay_ms: defaults::RECONNECT_BASE_DELAY_MS,
            reconnect_max_delay_ms: defaults::RECONNECT_MAX_DELAY_MS,
        }
    }
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            device: None,
            sample_rate: defaults::SAMPLE_RATE,
        }
    }
}

impl Default for SegmenterSettings {
    fn default() -> Self {
        Self {
            speech_threshold: defaults::SPEECH_THRESHOLD,
            hangover_ms: defaults::HANGOVER_MS,
            settle_ms: defaults::SETTLE_MS,
            debounce_ms: defaults::COMMIT_DEBOUNCE_MS,
            min_utterance_ms: defaults::MIN_UTTERANCE_MS,
        }
    }
}

impl Default for PlaybackSettings {
    fn default() -> Self {
        Self {
            chunk_ms: defaults::PLAYBACK_CHUNK_MS,
            min_queue_chunks: defaults::MIN_QUEUE_CHUNKS,
        }
    }
}

impl Default for TranscriptionConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            api_key: None,
            language: defaults::DEFAULT_LANGUAGE.to_string(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// Returns an error if the file contains invalid TOML.
    /// Missing fields will use default values.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Load configuration from a file or return defaults if file doesn't exist
    ///
    /// Only returns defaults if the file is missing.
    /// Returns errors for invalid TOML.
    pub fn load_or_default(path: &Path) -> anyhow::Result<Self> {
        match Self::load(path) {
            Ok(config) => Ok(config),
            Err(e) => {
                if e.downcast_ref::<std::io::Error>()
                    .map(|io_err| io_err.kind() == std::io::ErrorKind::NotFound)
                    .unwrap_or(false)
                {
                    Ok(Self::default())
                } else {
                    Err(e)
                }
            }
        }
    }

    /// Apply environment variable overrides
    ///
    /// Supported environment variables:
    /// - VOXCALL_URL → transport.url
    /// - VOXCALL_LANGUAGE → transcription.language
    /// - VOXCALL_AUDIO_DEVICE → audio.device
    /// - VOXCALL_TRANSCRIPTION_KEY → transcription.api_key
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(url) = std::env::var("VOXCALL_URL")
            && !url.is_empty()
        {
            self.transport.url = url;
        }

        if let Ok(language) = std::env::var("VOXCALL_LANGUAGE")
            && !language.is_empty()
        {
            self.transcription.language = language;
        }

        if let Ok(device) = std::env::var("VOXCALL_AUDIO_DEVICE")
            && !device.is_empty()
        {
            self.audio.device = Some(device);
        }

        if let Ok(key) = std::env::var("VOXCALL_TRANSCRIPTION_KEY")
            && !key.is_empty()
        {
            self.transcription.api_key = Some(key);
        }

        self
    }

    /// Get the default configuration file path
    ///
    /// Returns ~/.config/voxcall/config.toml on Linux
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("voxcall")
            .join("config.toml")
    }

    /// Reject value combinations the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.transport.url.is_empty() {
            return Err(VoxcallError::ConfigInvalidValue {
                key: "transport.url".to_string(),
                message: "must not be empty".to_string(),
            });
        }
        if self.audio.sample_rate == 0 {
            return Err(VoxcallError::ConfigInvalidValue {
                key: "audio.sample_rate".to_string(),
                message: "must be positive".to_string(),
            });
        }
        if !(0.0..1.0).contains(&self.segmenter.speech_threshold) {
            return Err(VoxcallError::ConfigInvalidValue {
                key: "segmenter.speech_threshold".to_string(),
                message: "must be in [0, 1)".to_string(),
            });
        }
        if self.playback.chunk_ms == 0 {
            return Err(VoxcallError::ConfigInvalidValue {
                key: "playback.chunk_ms".to_string(),
                message: "must be positive".to_string(),
            });
        }
        if self.playback.min_queue_chunks == 0 {
            return Err(VoxcallError::ConfigInvalidValue {
                key: "playback.min_queue_chunks".to_string(),
                message: "must be at least 1".to_string(),
            });
        }
        if self.transport.reconnect_base_delay_ms > self.transport.reconnect_max_delay_ms {
            return Err(VoxcallError::ConfigInvalidValue {
                key: "transport.reconnect_base_delay_ms".to_string(),
                message: "must not exceed reconnect_max_delay_ms".to_string(),
            });
        }
        Ok(())
    }

    /// Segmenter settings at the engine sample rate.
    pub fn segmenter_config(&self) -> SegmenterConfig {
        SegmenterConfig {
            speech_threshold: self.segmenter.speech_threshold,
            hangover_ms: self.segmenter.hangover_ms,
            settle_ms: self.segmenter.settle_ms,
            debounce_ms: self.segmenter.debounce_ms,
            min_utterance_ms: self.segmenter.min_utterance_ms,
            sample_rate: self.audio.sample_rate,
        }
    }

    /// Playback scheduler settings.
    pub fn playback_config(&self) -> PlaybackConfig {
        PlaybackConfig {
            sample_rate: self.audio.sample_rate,
            chunk_ms: self.playback.chunk_ms,
            min_queue_chunks: self.playback.min_queue_chunks,
            poll_ms: defaults::DRAIN_POLL_MS,
            max_empty_polls: defaults::DRAIN_MAX_EMPTY_POLLS,
        }
    }

    /// Capture encoder settings.
    pub fn encoder_config(&self) -> EncoderConfig {
        EncoderConfig {
            target_rate: self.audio.sample_rate,
            poll_ms: defaults::CAPTURE_POLL_MS,
            max_consecutive_errors: defaults::CAPTURE_MAX_CONSECUTIVE_ERRORS,
        }
    }

    /// A fresh reconnect policy from the configured bounds.
    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy::new(
            self.transport.reconnect_max_attempts,
            self.transport.reconnect_base_delay_ms,
            self.transport.reconnect_max_delay_ms,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::sync::Mutex;
    use tempfile::NamedTempFile;

    // Mutex to serialize tests that modify environment variables
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    // SAFETY: These helpers are only used in tests with ENV_LOCK held,
    // ensuring no concurrent access to environment variables.
    fn set_env(key: &str, value: &str) {
        unsafe { std::env::set_var(key, value) }
    }

    fn remove_env(key: &str) {
        unsafe { std::env::remove_var(key) }
    }

    fn clear_voxcall_env() {
        remove_env("VOXCALL_URL");
        remove_env("VOXCALL_LANGUAGE");
        remove_env("VOXCALL_AUDIO_DEVICE");
        remove_env("VOXCALL_TRANSCRIPTION_KEY");
    }

    #[test]
    fn test_default_config_has_engine_constants() {
        let config = Config::default();

        assert_eq!(config.transport.url, "");
        assert_eq!(config.transport.mode, SessionMode::Streaming);
        assert_eq!(config.transport.wire, AudioWireMode::Base64);
        assert_eq!(config.transport.heartbeat_secs, 15);
        assert_eq!(config.transport.reconnect_max_attempts, 5);
        assert_eq!(config.transport.reconnect_base_delay_ms, 1000);

        assert_eq!(config.audio.device, None);
        assert_eq!(config.audio.sample_rate, 24_000);

        assert_eq!(config.segmenter.speech_threshold, 0.02);
        assert_eq!(config.segmenter.hangover_ms, 1500);
        assert_eq!(config.segmenter.settle_ms, 200);
        assert_eq!(config.segmenter.debounce_ms, 1000);
        assert_eq!(config.segmenter.min_utterance_ms, 200);

        assert_eq!(config.playback.chunk_ms, 120);
        assert_eq!(config.playback.min_queue_chunks, 7);

        assert_eq!(config.transcription.endpoint, None);
        assert_eq!(config.transcription.language, "en");
    }

    #[test]
    fn test_load_from_toml_file() {
        let toml_content = r#"
            [transport]
            url = "wss://relay.example/voice"
            mode = "chunked"
            wire = "binary"
            heartbeat_secs = 20

            [audio]
            device = "pipewire"
            sample_rate = 16000

            [segmenter]
            speech_threshold = 0.05
            hangover_ms = 2000

            [playback]
            chunk_ms = 100
            min_queue_chunks = 5

            [transcription]
            endpoint = "https://stt.example/transcribe"
            language = "de"
        "#;

        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(toml_content.as_bytes()).unwrap();

        let config = Config::load(temp_file.path()).unwrap();

        assert_eq!(config.transport.url, "wss://relay.example/voice");
        assert_eq!(config.transport.mode, SessionMode::Chunked);
        assert_eq!(config.transport.wire, AudioWireMode::Binary);
        assert_eq!(config.transport.heartbeat_secs, 20);
        assert_eq!(config.audio.device, Some("pipewire".to_string()));
        assert_eq!(config.audio.sample_rate, 16000);
        assert_eq!(config.segmenter.speech_threshold, 0.05);
        assert_eq!(config.segmenter.hangover_ms, 2000);
        assert_eq!(config.playback.chunk_ms, 100);
        assert_eq!(config.playback.min_queue_chunks, 5);
        assert_eq!(
            config.transcription.endpoint,
            Some("https://stt.example/transcribe".to_string())
        );
        assert_eq!(config.transcription.language, "de");
    }

    #[test]
    fn test_load_partial_config_uses_defaults() {
        let toml_content = r#"
            [transport]
            url = "wss://relay.example/voice"
        "#;

        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(toml_content.as_bytes()).unwrap();

        let config = Config::load(temp_file.path()).unwrap();

        assert_eq!(config.transport.url, "wss://relay.example/voice");
        // Everything else stays at the defaults
        assert_eq!(config.transport.heartbeat_secs, 15);
        assert_eq!(config.audio.sample_rate, 24_000);
        assert_eq!(config.segmenter.hangover_ms, 1500);
        assert_eq!(config.playback.min_queue_chunks, 7);
    }

    #[test]
    fn test_invalid_toml_returns_error() {
        let invalid_toml = r#"
            [transport
            url = "broken
        "#;

        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(invalid_toml.as_bytes()).unwrap();

        assert!(Config::load(temp_file.path()).is_err());
        assert!(Config::load_or_default(temp_file.path()).is_err());
    }

    #[test]
    fn test_load_or_default_for_missing_file() {
        let missing = Path::new("/tmp/nonexistent_voxcall_config_12345.toml");
        let config = Config::load_or_default(missing).unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_env_overrides() {
        let _lock = ENV_LOCK.lock().unwrap();
        clear_voxcall_env();

        set_env("VOXCALL_URL", "wss://other.example/voice");
        set_env("VOXCALL_LANGUAGE", "fr");
        set_env("VOXCALL_AUDIO_DEVICE", "hw:1,0");
        set_env("VOXCALL_TRANSCRIPTION_KEY", "secret");

        let config = Config::default().with_env_overrides();

        assert_eq!(config.transport.url, "wss://other.example/voice");
        assert_eq!(config.transcription.language, "fr");
        assert_eq!(config.audio.device, Some("hw:1,0".to_string()));
        assert_eq!(config.transcription.api_key, Some("secret".to_string()));

        clear_voxcall_env();
    }

    #[test]
    fn test_env_override_empty_string_ignored() {
        let _lock = ENV_LOCK.lock().unwrap();
        clear_voxcall_env();

        set_env("VOXCALL_URL", "");
        let config = Config::default().with_env_overrides();
        assert_eq!(config.transport.url, "");

        clear_voxcall_env();
    }

    #[test]
    fn test_validate_rejects_empty_url() {
        let config = Config::default();
        match config.validate() {
            Err(VoxcallError::ConfigInvalidValue { key, .. }) => {
                assert_eq!(key, "transport.url");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    fn valid_config() -> Config {
        let mut config = Config::default();
        config.transport.url = "wss://relay.example/voice".to_string();
        config
    }

    #[test]
    fn test_validate_accepts_defaults_with_url() {
        assert!(valid_config().validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_threshold() {
        let mut config = valid_config();
        config.segmenter.speech_threshold = 1.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_chunk() {
        let mut config = valid_config();
        config.playback.chunk_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_inverted_reconnect_delays() {
        let mut config = valid_config();
        config.transport.reconnect_base_delay_ms = 60_000;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_derived_configs_carry_sample_rate() {
        let mut config = valid_config();
        config.audio.sample_rate = 16_000;

        assert_eq!(config.segmenter_config().sample_rate, 16_000);
        assert_eq!(config.playback_config().sample_rate, 16_000);
        assert_eq!(config.encoder_config().target_rate, 16_000);
    }

    #[test]
    fn test_reconnect_policy_from_config() {
        let mut config = valid_config();
        config.transport.reconnect_max_attempts = 3;
        let mut policy = config.reconnect_policy();
        assert!(policy.next_delay().is_some());
        assert!(policy.next_delay().is_some());
        assert!(policy.next_delay().is_some());
        assert!(policy.next_delay().is_none());
    }

    #[test]
    fn test_config_round_trips_through_toml() {
        let mut config = valid_config();
        config.transport.mode = SessionMode::Chunked;
        config.transcription.endpoint = Some("https://stt.example".to_string());

        let serialized = toml::to_string(&config).unwrap();
        let restored: Config = toml::from_str(&serialized).unwrap();
        assert_eq!(restored, config);
    }

    #[test]
    fn test_default_path_is_xdg_compliant() {
        let path = Config::default_path();
        let path_str = path.to_string_lossy();
        assert!(path_str.contains("voxcall"));
        assert!(path_str.ends_with("config.toml"));
    }
}
