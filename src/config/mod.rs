//! Configuration management for Beacon Live

pub mod file;

use std::sync::Arc;
use std::time::Duration;

use secrecy::SecretString;

use crate::{Error, Result};

/// Default live service endpoint
pub const DEFAULT_LIVE_URL: &str = "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent";

/// Default model for native-audio conversations
pub const DEFAULT_MODEL: &str = "models/gemini-2.5-flash-native-audio-preview-09-2025";

/// Default prebuilt voice
pub const DEFAULT_VOICE: &str = "Zephyr";

/// Default system instruction
pub const DEFAULT_SYSTEM_INSTRUCTION: &str = "You are a friendly and helpful conversation partner. \
Keep your responses concise and natural.";

/// Beacon Live configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Remote inference service configuration
    pub live: Arc<LiveConfig>,

    /// Capture/playback configuration
    pub audio: AudioConfig,

    /// Reconnect configuration
    pub retry: RetryConfig,
}

/// Remote inference service configuration
#[derive(Debug)]
pub struct LiveConfig {
    /// WebSocket endpoint
    pub url: String,

    /// API key, appended to the endpoint as `key=`
    pub api_key: Option<SecretString>,

    /// Model identifier
    pub model: String,

    /// Prebuilt voice name
    pub voice: String,

    /// System instruction sent with the setup message
    pub system_instruction: String,

    /// Ask the service to transcribe the user's speech
    pub input_transcription: bool,

    /// Ask the service to transcribe its own speech
    pub output_transcription: bool,

    /// Depth of the outbound frame queue; frames beyond it are dropped
    pub outbound_frames: usize,
}

impl Default for LiveConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_LIVE_URL.to_string(),
            api_key: None,
            model: DEFAULT_MODEL.to_string(),
            voice: DEFAULT_VOICE.to_string(),
            system_instruction: DEFAULT_SYSTEM_INSTRUCTION.to_string(),
            input_transcription: true,
            output_transcription: true,
            outbound_frames: 32,
        }
    }
}

/// Audio capture and playback configuration
///
/// Fixed for the lifetime of one session.
#[derive(Debug, Clone)]
pub struct AudioConfig {
    /// Capture sample rate sent to the service (Hz)
    pub input_sample_rate: u32,

    /// Playback sample rate of synthesized speech (Hz)
    pub output_sample_rate: u32,

    /// Samples per captured frame
    pub frame_size: usize,

    /// RMS level above which the user is considered speaking
    pub speech_threshold: f32,

    /// Quiet period before the user-speaking flag clears
    pub speech_release: Duration,

    /// Request noise suppression from the input device
    pub noise_suppression: bool,

    /// Request echo cancellation from the input device
    pub echo_cancellation: bool,

    /// Request automatic gain control from the input device
    pub auto_gain: bool,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            input_sample_rate: 16_000,
            output_sample_rate: 24_000,
            frame_size: 4096,
            speech_threshold: 0.02,
            speech_release: Duration::from_millis(500),
            noise_suppression: true,
            echo_cancellation: true,
            auto_gain: true,
        }
    }
}

/// Reconnect configuration
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Automatic reconnect attempts before the failure is treated as fatal
    pub max_attempts: u32,

    /// Delay before the first reconnect
    pub base_delay: Duration,

    /// Growth factor applied after each attempt
    pub multiplier: f64,

    /// Delay cap
    pub max_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(500),
            multiplier: 2.0,
            max_delay: Duration::from_secs(30),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            live: Arc::new(LiveConfig::default()),
            audio: AudioConfig::default(),
            retry: RetryConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration (env > toml > default)
    ///
    /// # Errors
    ///
    /// Returns error if the resulting configuration is invalid
    pub fn load() -> Result<Self> {
        let fc = file::load_config_file();
        let config = Self::resolve(fc, |key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Merge a config file with an environment lookup
    pub fn resolve(fc: file::LiveConfigFile, env: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let live_default = LiveConfig::default();
        let flag = |key: &str| env(key).map(|v| v == "1" || v.eq_ignore_ascii_case("true"));
        let number = |key: &str| env(key).and_then(|s| s.parse::<u64>().ok());

        let api_key = env("BEACON_LIVE_API_KEY")
            .or_else(|| env("GEMINI_API_KEY"))
            .or(fc.live.api_key)
            .filter(|k| !k.trim().is_empty())
            .map(SecretString::from);

        let live = LiveConfig {
            url: env("BEACON_LIVE_URL")
                .or(fc.live.url)
                .unwrap_or(live_default.url),
            api_key,
            model: env("BEACON_LIVE_MODEL")
                .or(fc.live.model)
                .unwrap_or(live_default.model),
            voice: env("BEACON_LIVE_VOICE")
                .or(fc.live.voice)
                .unwrap_or(live_default.voice),
            system_instruction: env("BEACON_LIVE_SYSTEM_INSTRUCTION")
                .or(fc.live.system_instruction)
                .unwrap_or(live_default.system_instruction),
            input_transcription: flag("BEACON_LIVE_INPUT_TRANSCRIPTION")
                .or(fc.live.input_transcription)
                .unwrap_or(live_default.input_transcription),
            output_transcription: flag("BEACON_LIVE_OUTPUT_TRANSCRIPTION")
                .or(fc.live.output_transcription)
                .unwrap_or(live_default.output_transcription),
            outbound_frames: fc
                .live
                .outbound_frames
                .unwrap_or(live_default.outbound_frames),
        };

        let audio = AudioConfig {
            input_sample_rate: env("BEACON_INPUT_SAMPLE_RATE")
                .and_then(|s| s.parse().ok())
                .or(fc.audio.input_sample_rate)
                .unwrap_or(defaults.audio.input_sample_rate),
            output_sample_rate: env("BEACON_OUTPUT_SAMPLE_RATE")
                .and_then(|s| s.parse().ok())
                .or(fc.audio.output_sample_rate)
                .unwrap_or(defaults.audio.output_sample_rate),
            frame_size: fc.audio.frame_size.unwrap_or(defaults.audio.frame_size),
            speech_threshold: env("BEACON_SPEECH_THRESHOLD")
                .and_then(|s| s.parse().ok())
                .or(fc.audio.speech_threshold)
                .unwrap_or(defaults.audio.speech_threshold),
            speech_release: number("BEACON_SPEECH_RELEASE_MS")
                .or(fc.audio.speech_release_ms)
                .map_or(defaults.audio.speech_release, Duration::from_millis),
            noise_suppression: fc
                .audio
                .noise_suppression
                .unwrap_or(defaults.audio.noise_suppression),
            echo_cancellation: fc
                .audio
                .echo_cancellation
                .unwrap_or(defaults.audio.echo_cancellation),
            auto_gain: fc.audio.auto_gain.unwrap_or(defaults.audio.auto_gain),
        };

        let retry = RetryConfig {
            max_attempts: env("BEACON_RETRY_MAX_ATTEMPTS")
                .and_then(|s| s.parse().ok())
                .or(fc.retry.max_attempts)
                .unwrap_or(defaults.retry.max_attempts),
            base_delay: number("BEACON_RETRY_BASE_DELAY_MS")
                .or(fc.retry.base_delay_ms)
                .map_or(defaults.retry.base_delay, Duration::from_millis),
            multiplier: fc.retry.multiplier.unwrap_or(defaults.retry.multiplier),
            max_delay: fc
                .retry
                .max_delay_ms
                .map_or(defaults.retry.max_delay, Duration::from_millis),
        };

        Self {
            live: Arc::new(live),
            audio,
            retry,
        }
    }

    /// Reject values that would make a session impossible to run
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` describing the first invalid field
    pub fn validate(&self) -> Result<()> {
        if self.live.url.trim().is_empty() {
            return Err(Error::Config("live.url must not be empty".to_string()));
        }
        if self.live.outbound_frames == 0 {
            return Err(Error::Config("live.outbound_frames must be non-zero".to_string()));
        }
        if self.audio.input_sample_rate == 0 || self.audio.output_sample_rate == 0 {
            return Err(Error::Config("sample rates must be non-zero".to_string()));
        }
        if self.audio.frame_size == 0 {
            return Err(Error::Config("audio.frame_size must be non-zero".to_string()));
        }
        if !(f32::EPSILON..1.0).contains(&self.audio.speech_threshold) {
            return Err(Error::Config(
                "audio.speech_threshold must be between 0 and 1".to_string(),
            ));
        }
        if self.retry.multiplier.is_nan() || self.retry.multiplier <= 1.0 {
            return Err(Error::Config("retry.multiplier must be greater than 1".to_string()));
        }
        if self.retry.base_delay.is_zero() {
            return Err(Error::Config("retry.base_delay must be non-zero".to_string()));
        }
        if self.retry.base_delay >= self.retry.max_delay {
            return Err(Error::Config(
                "retry.base_delay must be less than retry.max_delay".to_string(),
            ));
        }
        Ok(())
    }
}
