//! Fault classification and reconnect backoff
//!
//! Every transport or device failure is collapsed into a [`Fault`] before it
//! reaches the session state machine, so callers only ever see a short
//! human-readable message.

use std::time::Duration;

use crate::Error;
use crate::config::RetryConfig;
use crate::transport::{FailureKind, TransportFailure};

/// How the session reacts to a failure
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fault {
    /// Surface to the caller, no retry
    Fatal {
        /// User-facing message
        message: String,
    },
    /// Release resources and reconnect after a backoff delay
    Retryable {
        /// User-facing message, surfaced if retries run out
        message: String,
    },
    /// Not an error; handled as a normal stop
    Benign,
}

impl Fault {
    /// User-facing message, if this fault carries one
    #[must_use]
    pub fn message(&self) -> Option<&str> {
        match self {
            Self::Fatal { message } | Self::Retryable { message } => Some(message),
            Self::Benign => None,
        }
    }

    /// Escalate a fault to fatal, keeping its message
    #[must_use]
    pub fn into_fatal(self) -> Self {
        match self {
            Self::Retryable { message } => Self::Fatal { message },
            other => other,
        }
    }
}

/// Classify a transport failure
#[must_use]
pub fn classify_failure(failure: &TransportFailure) -> Fault {
    let detail = failure.message.trim();
    let with_detail = |summary: &str| {
        if detail.is_empty() {
            summary.to_string()
        } else {
            format!("{summary} ({detail})")
        }
    };

    match failure.kind {
        FailureKind::Unauthorized => Fault::Fatal {
            message: with_detail("Invalid API key. Please check your credentials"),
        },
        FailureKind::InvalidRequest => Fault::Fatal {
            message: with_detail("The service rejected the session configuration"),
        },
        FailureKind::Protocol => Fault::Fatal {
            message: with_detail("Unexpected response from the service"),
        },
        FailureKind::Conflict
        | FailureKind::Unavailable
        | FailureKind::RateLimited
        | FailureKind::Network
        | FailureKind::GoingAway => Fault::Retryable {
            message: "Connection error. Please try again.".to_string(),
        },
    }
}

/// Classify a local error raised while starting a session
///
/// Device and configuration errors are never retried.
#[must_use]
pub fn classify_error(error: &Error) -> Fault {
    Fault::Fatal {
        message: error.user_message(),
    }
}

/// Bounded exponential backoff for one `start` call chain
///
/// Created fresh for each user-initiated start and discarded on the first
/// successful connection.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    remaining: u32,
    delay: Duration,
    multiplier: f64,
    max_delay: Duration,
    attempt: u32,
}

impl RetryPolicy {
    /// Build a policy from configuration
    #[must_use]
    pub const fn from_config(config: &RetryConfig) -> Self {
        Self {
            remaining: config.max_attempts,
            delay: config.base_delay,
            multiplier: config.multiplier,
            max_delay: config.max_delay,
            attempt: 0,
        }
    }

    /// Consume one attempt and return the delay to wait before it
    ///
    /// Returns `None` once the attempts are exhausted.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;
        self.attempt += 1;

        let delay = self.delay.min(self.max_delay);
        self.delay = self.delay.mul_f64(self.multiplier).min(self.max_delay);
        Some(delay)
    }

    /// Attempts left before the failure escalates
    #[must_use]
    pub const fn remaining(&self) -> u32 {
        self.remaining
    }

    /// Attempts consumed so far
    #[must_use]
    pub const fn attempt(&self) -> u32 {
        self.attempt
    }
}
