//! Duplex channel to the remote inference service
//!
//! A [`Transport`] opens one [`Connection`] per session attempt. Outbound
//! capture frames flow through a bounded [`FrameSender`]; inbound traffic is
//! reported as [`TransportEvent`]s through the [`EventSink`] supplied at open
//! time.

pub mod protocol;
mod websocket;

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use tokio::sync::mpsc;

use crate::voice::{EncodedFrame, WireFormat};

pub use websocket::WebSocketTransport;

/// Inbound event from the remote service
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// Handshake acknowledged, audio may flow
    Opened,
    /// One chunk of synthesized speech (16-bit PCM at the output rate)
    AudioFragment(Vec<u8>),
    /// Partial transcription of the user's speech
    InputTranscription(String),
    /// Partial transcription of the assistant's speech
    OutputTranscription(String),
    /// The assistant finished its turn
    TurnComplete,
    /// In-flight response audio should be discarded
    Interrupted,
    /// The connection failed
    Errored(TransportFailure),
    /// The remote peer closed cleanly
    Closed,
}

/// Structured failure category, independent of the provider
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Credentials missing or rejected
    Unauthorized,
    /// The service rejected the session configuration
    InvalidRequest,
    /// The service is temporarily unavailable
    Unavailable,
    /// Another session holds the resource
    Conflict,
    /// Too many requests
    RateLimited,
    /// Network-level failure
    Network,
    /// The service announced it is going away
    GoingAway,
    /// The peer sent something we cannot interpret
    Protocol,
}

/// A transport failure with a human-readable detail
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportFailure {
    /// Category used for classification
    pub kind: FailureKind,
    /// Detail reported by the service or the network stack
    pub message: String,
}

impl TransportFailure {
    /// Build a failure
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Map an HTTP status from a failed handshake
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        Self::new(kind_for_status(status), message)
    }

    /// Map a WebSocket close code
    ///
    /// Returns `None` for a normal closure, which is not a failure.
    pub fn from_close_code(code: u16, reason: impl Into<String>) -> Option<Self> {
        let kind = match code {
            1000 | 1005 => return None,
            1001 => FailureKind::GoingAway,
            1006 => FailureKind::Network,
            1007 | 1009 => FailureKind::InvalidRequest,
            1008 => FailureKind::Unauthorized,
            1011..=1014 => FailureKind::Unavailable,
            4000..=4999 => kind_for_status(code - 4000),
            _ => FailureKind::Protocol,
        };
        Some(Self::new(kind, reason))
    }
}

impl fmt::Display for TransportFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

/// Status-code table shared by the handshake and in-session close paths
const fn kind_for_status(status: u16) -> FailureKind {
    match status {
        401 | 403 => FailureKind::Unauthorized,
        408 | 503 | 504 => FailureKind::Unavailable,
        409 => FailureKind::Conflict,
        429 => FailureKind::RateLimited,
        500..=599 => FailureKind::Unavailable,
        _ => FailureKind::InvalidRequest,
    }
}

/// Delivers transport events into the session
#[derive(Clone)]
pub struct EventSink(Arc<dyn Fn(TransportEvent) + Send + Sync>);

impl EventSink {
    /// Wrap a delivery function
    pub fn new(deliver: impl Fn(TransportEvent) + Send + Sync + 'static) -> Self {
        Self(Arc::new(deliver))
    }

    /// Deliver one event
    pub fn emit(&self, event: TransportEvent) {
        (self.0)(event);
    }
}

impl fmt::Debug for EventSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("EventSink")
    }
}

/// Why a frame was not handed to the transport
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendError {
    /// No connection is open
    Closed,
    /// The outbound queue is full
    Full,
}

/// Non-blocking send path for capture frames
///
/// Frames are only accepted while the gate is open and the bounded queue has
/// room; everything else is dropped and counted.
#[derive(Debug, Clone)]
pub struct FrameSender {
    tx: mpsc::Sender<EncodedFrame>,
    open: Arc<AtomicBool>,
    dropped: Arc<AtomicU64>,
}

/// Receiving half of the outbound frame queue
pub type FrameReceiver = mpsc::Receiver<EncodedFrame>;

/// Create a bounded outbound frame queue, initially closed
#[must_use]
pub fn frame_channel(capacity: usize) -> (FrameSender, FrameReceiver) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let sender = FrameSender {
        tx,
        open: Arc::new(AtomicBool::new(false)),
        dropped: Arc::new(AtomicU64::new(0)),
    };
    (sender, rx)
}

impl FrameSender {
    /// Hand a frame to the transport without blocking
    ///
    /// # Errors
    ///
    /// Returns why the frame was dropped
    pub fn send(&self, frame: EncodedFrame) -> Result<(), SendError> {
        if !self.is_open() {
            return Err(SendError::Closed);
        }
        match self.tx.try_send(frame) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                Err(SendError::Full)
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(SendError::Closed),
        }
    }

    /// Whether frames are currently accepted
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire) && !self.tx.is_closed()
    }

    /// Open or close the gate
    pub fn set_open(&self, open: bool) {
        self.open.store(open, Ordering::Release);
    }

    /// Frames dropped because the queue was full
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Everything a transport needs to open a connection
#[derive(Debug)]
pub struct OpenRequest {
    /// Format of outbound capture frames
    pub input: WireFormat,
    /// Format of inbound response audio
    pub output: WireFormat,
    /// Outbound capture frames
    pub frames: FrameReceiver,
    /// Inbound event delivery
    pub events: EventSink,
}

/// Opens connections to the remote inference service
pub trait Transport: Send + Sync {
    /// Begin opening a connection
    ///
    /// Returns immediately. The handshake outcome is reported through
    /// `request.events` as `Opened` or `Errored`.
    fn open(&self, request: OpenRequest) -> Box<dyn Connection>;
}

/// One live (or opening) connection
pub trait Connection: Send {
    /// Close the connection, cancelling an in-flight handshake
    ///
    /// Best-effort: failures are swallowed.
    fn close(&mut self);
}
