//! Beacon Live - Real-time duplex voice sessions for AI assistants
//!
//! This library provides the streaming core behind a voice assistant:
//! - Microphone capture with speech activity detection
//! - A duplex connection to a remote conversational-inference service
//! - Gapless playback of streamed response audio with interruption support
//! - Fault classification and bounded reconnect backoff
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                      Caller                          │
//! │      start / stop  │  status watch  │  transcripts   │
//! └────────────────────┬────────────────────────────────┘
//!                      │
//! ┌────────────────────▼────────────────────────────────┐
//! │               Session Controller                     │
//! │   State machine  │  Fault handler  │  Retry policy   │
//! └──────┬──────────────────┬──────────────────┬────────┘
//!        │                  │                  │
//! ┌──────▼──────┐   ┌───────▼───────┐   ┌──────▼────────┐
//! │   Capture   │──▶│   Transport   │──▶│   Playback    │
//! │  + speech   │   │  (WebSocket)  │   │   scheduler   │
//! └─────────────┘   └───────────────┘   └───────────────┘
//! ```

pub mod config;
pub mod error;
pub mod fault;
pub mod session;
pub mod transport;
pub mod voice;

pub use config::Config;
pub use error::{Error, Result};
pub use session::{Backends, Session, SessionState, SessionStatus, Speaker, TranscriptEntry};
