//! TOML configuration file loading
//!
//! Supports `~/.config/omni/beacon-live/config.toml` as a persistent config source.
//! All fields are optional, the file is a partial overlay on top of defaults.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::Result;

/// Top-level TOML configuration file schema
#[derive(Debug, Default, Deserialize)]
pub struct LiveConfigFile {
    /// Remote inference service settings
    #[serde(default)]
    pub live: LiveFileConfig,

    /// Capture/playback settings
    #[serde(default)]
    pub audio: AudioFileConfig,

    /// Reconnect policy
    #[serde(default)]
    pub retry: RetryFileConfig,
}

/// Remote inference service configuration
#[derive(Debug, Default, Deserialize)]
pub struct LiveFileConfig {
    /// WebSocket endpoint of the live service
    pub url: Option<String>,

    /// API key (prefer the environment for secrets)
    pub api_key: Option<String>,

    /// Model identifier
    pub model: Option<String>,

    /// Prebuilt voice name
    pub voice: Option<String>,

    /// System instruction sent at setup
    pub system_instruction: Option<String>,

    /// Request transcription of the user's speech
    pub input_transcription: Option<bool>,

    /// Request transcription of the assistant's speech
    pub output_transcription: Option<bool>,

    /// Outbound frame queue depth
    pub outbound_frames: Option<usize>,
}

/// Audio configuration
#[derive(Debug, Default, Deserialize)]
pub struct AudioFileConfig {
    pub input_sample_rate: Option<u32>,
    pub output_sample_rate: Option<u32>,
    pub frame_size: Option<usize>,
    pub speech_threshold: Option<f32>,
    pub speech_release_ms: Option<u64>,
    pub noise_suppression: Option<bool>,
    pub echo_cancellation: Option<bool>,
    pub auto_gain: Option<bool>,
}

/// Retry configuration
#[derive(Debug, Default, Deserialize)]
pub struct RetryFileConfig {
    pub max_attempts: Option<u32>,
    pub base_delay_ms: Option<u64>,
    pub multiplier: Option<f64>,
    pub max_delay_ms: Option<u64>,
}

/// Load the TOML config file from the standard path
///
/// Returns `LiveConfigFile::default()` if the file doesn't exist or can't be parsed.
pub fn load_config_file() -> LiveConfigFile {
    config_file_path().map_or_else(LiveConfigFile::default, |path| load_config_file_from(&path))
}

/// Load a TOML config file from an explicit path
///
/// Missing or unparseable files yield the defaults.
pub fn load_config_file_from(path: &Path) -> LiveConfigFile {
    if !path.exists() {
        return LiveConfigFile::default();
    }

    match read_config_file(path) {
        Ok(config) => {
            tracing::info!(path = %path.display(), "loaded config file");
            config
        }
        Err(e) => {
            tracing::warn!(
                path = %path.display(),
                error = %e,
                "failed to load config file, using defaults"
            );
            LiveConfigFile::default()
        }
    }
}

/// Read and parse a TOML config file
///
/// # Errors
///
/// Returns error if the file can't be read or isn't valid TOML
pub fn read_config_file(path: &Path) -> Result<LiveConfigFile> {
    let content = std::fs::read_to_string(path)?;
    Ok(toml::from_str(&content)?)
}

/// Return the config file path: `~/.config/omni/beacon-live/config.toml`
pub fn config_file_path() -> Option<PathBuf> {
    directories::BaseDirs::new().map(|d| {
        d.config_dir()
            .join("omni")
            .join("beacon-live")
            .join("config.toml")
    })
}
