//! Error types for voxcall.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum VoxcallError {
    // Configuration errors
    #[error("Configuration file not found at {path}")]
    ConfigFileNotFound { path: String },

    #[error("Invalid configuration value for {key}: {message}")]
    ConfigInvalidValue { key: String, message: String },

    #[error("Configuration error: {0}")]
    Config(#[from] toml::de::Error),

    // Capture errors — fatal for the session, never retried
    #[error("Capture device unavailable: {message}")]
    DeviceUnavailable { message: String },

    #[error("Audio capture failed: {message}")]
    Capture { message: String },

    // Codec errors
    #[error("Audio codec error: {message}")]
    Codec { message: String },

    // Connection errors — retried per the reconnect policy
    #[error("Endpoint unreachable: {message}")]
    ConnectUnreachable { message: String },

    #[error("Connection rejected by endpoint: {message}")]
    ConnectRejected { message: String },

    #[error("Reconnection failed after {attempts} attempts")]
    ReconnectExhausted { attempts: u32 },

    // Transport errors after a connection is established
    #[error("Transport error: {message}")]
    Transport { message: String },

    #[error("Transport protocol error: {message}")]
    Protocol { message: String },

    // Server-reported error that abandons the triggering operation
    #[error("Server error {code}: {message}")]
    ServerFatal { code: String, message: String },

    // Batch transcription failure — recovered locally, never fatal
    #[error("Transcription failed: {message}")]
    Transcription { message: String },

    #[error("Playback error: {message}")]
    Playback { message: String },

    // General I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Generic error for cases not covered above
    #[error("{0}")]
    Other(String),
}

impl VoxcallError {
    /// True for connection-establishment failures that the reconnect policy
    /// retries; everything else either surfaces or is absorbed locally.
    pub fn is_retryable_connect(&self) -> bool {
        matches!(
            self,
            VoxcallError::ConnectUnreachable { .. } | VoxcallError::ConnectRejected { .. }
        )
    }
}

// Type alias for convenience
pub type Result<T> = std::result::Result<T, VoxcallError>;
