//! Error types for Beacon Live

use thiserror::Error;

/// Result type alias for Beacon Live operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in Beacon Live
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Audio stream error
    #[error("audio error: {0}")]
    Audio(String),

    /// No usable audio device could be acquired
    #[error("audio device unavailable: {0}")]
    DeviceUnavailable(String),

    /// Capture permission was refused by the platform
    #[error("microphone permission denied")]
    PermissionDenied,

    /// Wire protocol error
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The session controller is no longer running
    #[error("session controller has shut down")]
    SessionClosed,

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// TOML parsing error
    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),
}

impl Error {
    /// Short message suitable for showing to the person using the assistant
    #[must_use]
    pub fn user_message(&self) -> String {
        match self {
            Self::PermissionDenied => {
                "Microphone permission denied. Please enable microphone access and try again."
                    .to_string()
            }
            Self::DeviceUnavailable(detail) => format!("Audio device unavailable: {detail}"),
            Self::Audio(_) => "Audio device error. Please check your microphone and speakers."
                .to_string(),
            Self::Config(detail) => format!("Invalid configuration: {detail}"),
            _ => "Connection error. Please try again.".to_string(),
        }
    }
}
