//! Shared test utilities
//!
//! In-memory stand-ins for the transport and audio devices so sessions can be
//! driven without network access or audio hardware.

#![allow(dead_code)]

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use beacon_live::config::{AudioConfig, Config, LiveConfig, RetryConfig};
use beacon_live::transport::{
    Connection, EventSink, FailureKind, FrameReceiver, OpenRequest, Transport, TransportEvent,
    TransportFailure,
};
use beacon_live::voice::{
    AudioOutput, CaptureSettings, FinishedCallback, InputDevice, InputStream, OutputDevice,
    SampleCallback, UnitId, WireFormat,
};
use beacon_live::{Backends, Error, Result, Session, SessionStatus};

/// Output rate used by the fake speaker
pub const OUTPUT_RATE: u32 = 24_000;

/// Configuration with small frames and short backoff
#[must_use]
pub fn test_config() -> Config {
    Config {
        live: Arc::new(LiveConfig::default()),
        audio: AudioConfig {
            frame_size: 4,
            output_sample_rate: OUTPUT_RATE,
            speech_release: Duration::from_millis(500),
            ..AudioConfig::default()
        },
        retry: RetryConfig {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
            multiplier: 2.0,
            max_delay: Duration::from_secs(10),
        },
    }
}

/// Let the controller drain everything already posted to it
pub async fn settle() {
    for _ in 0..32 {
        tokio::task::yield_now().await;
    }
}

/// Wait until the session status satisfies `f`
pub async fn wait_for(session: &Session, f: impl FnMut(&SessionStatus) -> bool) -> SessionStatus {
    let mut rx = session.subscribe();
    let status = rx.wait_for(f).await.expect("controller stopped");
    status.clone()
}

/// `frames` of 16-bit mono PCM silence
#[must_use]
pub fn pcm_fragment(frames: usize) -> Vec<u8> {
    vec![0; frames * 2]
}

// -- Transport ----------------------------------------------------------------

#[derive(Default)]
struct TransportInner {
    opens: Vec<tokio::time::Instant>,
    events: Option<EventSink>,
    frames: Option<FrameReceiver>,
    fail_next: usize,
    fail_always: Option<FailureKind>,
    open_immediately: bool,
}

/// Transport that records opens and lets the test emit events
#[derive(Default)]
pub struct FakeTransport {
    inner: Mutex<TransportInner>,
    live: Arc<AtomicUsize>,
}

impl FakeTransport {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Fail every future open with `kind`
    pub fn fail_always(&self, kind: FailureKind) {
        self.inner.lock().unwrap().fail_always = Some(kind);
    }

    /// Fail the next `n` opens as unavailable, then acknowledge
    pub fn fail_next(&self, n: usize) {
        let mut inner = self.inner.lock().unwrap();
        inner.fail_next = n;
        inner.open_immediately = true;
    }

    /// Acknowledge every future open immediately
    pub fn open_immediately(&self) {
        self.inner.lock().unwrap().open_immediately = true;
    }

    /// Deliver an event on the most recent connection
    pub fn emit(&self, event: TransportEvent) {
        let sink = self.inner.lock().unwrap().events.clone();
        sink.expect("no connection opened").emit(event);
    }

    /// Sink of the most recent connection, kept past its close
    #[must_use]
    pub fn sink(&self) -> EventSink {
        self.inner.lock().unwrap().events.clone().expect("no connection opened")
    }

    /// Outbound frame queue of the most recent connection
    #[must_use]
    pub fn take_frames(&self) -> FrameReceiver {
        self.inner.lock().unwrap().frames.take().expect("no connection opened")
    }

    #[must_use]
    pub fn open_count(&self) -> usize {
        self.inner.lock().unwrap().opens.len()
    }

    #[must_use]
    pub fn open_times(&self) -> Vec<tokio::time::Instant> {
        self.inner.lock().unwrap().opens.clone()
    }

    /// Connections opened and not yet closed
    #[must_use]
    pub fn live_connections(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }
}

impl Transport for FakeTransport {
    fn open(&self, request: OpenRequest) -> Box<dyn Connection> {
        let mut inner = self.inner.lock().unwrap();
        inner.opens.push(tokio::time::Instant::now());
        inner.events = Some(request.events.clone());
        inner.frames = Some(request.frames);

        let outcome = if let Some(kind) = inner.fail_always {
            Some(TransportEvent::Errored(TransportFailure::new(kind, "fake failure")))
        } else if inner.fail_next > 0 {
            inner.fail_next -= 1;
            Some(TransportEvent::Errored(TransportFailure::new(
                FailureKind::Unavailable,
                "fake outage",
            )))
        } else if inner.open_immediately {
            Some(TransportEvent::Opened)
        } else {
            None
        };
        drop(inner);

        self.live.fetch_add(1, Ordering::SeqCst);
        if let Some(event) = outcome {
            request.events.emit(event);
        }

        Box::new(FakeConnection {
            live: Arc::clone(&self.live),
            closed: false,
        })
    }
}

struct FakeConnection {
    live: Arc<AtomicUsize>,
    closed: bool,
}

impl Connection for FakeConnection {
    fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.live.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

// -- Microphone ---------------------------------------------------------------

/// Microphone whose samples are pushed by the test
#[derive(Default)]
pub struct FakeInput {
    callback: Arc<Mutex<Option<SampleCallback>>>,
    deny: AtomicBool,
    opens: AtomicUsize,
    live: Arc<AtomicUsize>,
}

impl FakeInput {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Refuse capture access on every open
    pub fn deny_permission(&self) {
        self.deny.store(true, Ordering::SeqCst);
    }

    /// Grant capture access again
    pub fn allow_permission(&self) {
        self.deny.store(false, Ordering::SeqCst);
    }

    /// Deliver samples as if from the device callback
    ///
    /// Returns `false` if no stream is open.
    pub fn push(&self, samples: &[f32]) -> bool {
        match self.callback.lock().unwrap().as_mut() {
            Some(callback) => {
                callback(samples);
                true
            }
            None => false,
        }
    }

    #[must_use]
    pub fn open_count(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn live_streams(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }
}

impl InputDevice for FakeInput {
    fn open(
        &self,
        _settings: &CaptureSettings,
        on_samples: SampleCallback,
    ) -> Result<Box<dyn InputStream>> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        if self.deny.load(Ordering::SeqCst) {
            return Err(Error::PermissionDenied);
        }

        *self.callback.lock().unwrap() = Some(on_samples);
        self.live.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeInputStream {
            callback: Arc::clone(&self.callback),
            live: Arc::clone(&self.live),
            closed: false,
        }))
    }
}

struct FakeInputStream {
    callback: Arc<Mutex<Option<SampleCallback>>>,
    live: Arc<AtomicUsize>,
    closed: bool,
}

impl InputStream for FakeInputStream {
    fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            *self.callback.lock().unwrap() = None;
            self.live.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

// -- Speaker ------------------------------------------------------------------

/// One unit handed to the fake speaker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Scheduled {
    pub unit: UnitId,
    pub start: u64,
    pub frames: u64,
}

impl Scheduled {
    #[must_use]
    pub const fn end(&self) -> u64 {
        self.start + self.frames
    }
}

#[derive(Default)]
struct SpeakerLog {
    scheduled: Vec<Scheduled>,
    cancelled: HashSet<UnitId>,
    finished: HashSet<UnitId>,
    on_finished: Option<FinishedCallback>,
}

/// Speaker with a clock the test advances by hand
#[derive(Default)]
pub struct FakeOutput {
    clock: Arc<AtomicU64>,
    log: Arc<Mutex<SpeakerLog>>,
    fail: AtomicBool,
    live: Arc<AtomicUsize>,
}

impl FakeOutput {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Fail every future open
    pub fn fail_open(&self) {
        self.fail.store(true, Ordering::SeqCst);
    }

    /// Move the device clock to `position`, completing every unit that ends
    /// at or before it
    pub fn advance_to(&self, position: u64) {
        self.clock.store(position, Ordering::SeqCst);

        let (done, callback) = {
            let mut log = self.log.lock().unwrap();
            let done: Vec<UnitId> = log
                .scheduled
                .iter()
                .filter(|s| s.end() <= position)
                .map(|s| s.unit)
                .filter(|u| !log.cancelled.contains(u) && !log.finished.contains(u))
                .collect();
            log.finished.extend(done.iter().copied());
            (done, log.on_finished.clone())
        };

        if let Some(callback) = callback {
            for unit in done {
                callback(unit);
            }
        }
    }

    #[must_use]
    pub fn position(&self) -> u64 {
        self.clock.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn scheduled(&self) -> Vec<Scheduled> {
        self.log.lock().unwrap().scheduled.clone()
    }

    #[must_use]
    pub fn cancelled(&self) -> usize {
        self.log.lock().unwrap().cancelled.len()
    }

    #[must_use]
    pub fn live_outputs(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }
}

impl OutputDevice for FakeOutput {
    fn open(
        &self,
        _format: WireFormat,
        on_finished: FinishedCallback,
    ) -> Result<Box<dyn AudioOutput>> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(Error::DeviceUnavailable("no speaker".to_string()));
        }

        self.log.lock().unwrap().on_finished = Some(on_finished);
        self.live.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeAudioOutput {
            clock: Arc::clone(&self.clock),
            log: Arc::clone(&self.log),
            live: Arc::clone(&self.live),
            closed: false,
        }))
    }
}

struct FakeAudioOutput {
    clock: Arc<AtomicU64>,
    log: Arc<Mutex<SpeakerLog>>,
    live: Arc<AtomicUsize>,
    closed: bool,
}

impl AudioOutput for FakeAudioOutput {
    fn position(&self) -> u64 {
        self.clock.load(Ordering::SeqCst)
    }

    fn schedule(&mut self, unit: UnitId, start: u64, samples: Vec<f32>) -> Result<u64> {
        if self.closed {
            return Err(Error::Audio("output closed".to_string()));
        }
        let start = start.max(self.clock.load(Ordering::SeqCst));
        self.log.lock().unwrap().scheduled.push(Scheduled {
            unit,
            start,
            frames: samples.len() as u64,
        });
        Ok(start)
    }

    fn cancel(&mut self, unit: UnitId) {
        self.log.lock().unwrap().cancelled.insert(unit);
    }

    fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            let mut log = self.log.lock().unwrap();
            log.on_finished = None;
            drop(log);
            self.live.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

// -- Harness ------------------------------------------------------------------

/// A session wired to fakes
pub struct Harness {
    pub session: Session,
    pub transport: Arc<FakeTransport>,
    pub input: Arc<FakeInput>,
    pub output: Arc<FakeOutput>,
}

impl Harness {
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(test_config())
    }

    #[must_use]
    pub fn with_config(config: Config) -> Self {
        let transport = FakeTransport::new();
        let input = FakeInput::new();
        let output = FakeOutput::new();
        let backends = Backends {
            transport: transport.clone(),
            input: input.clone(),
            output: output.clone(),
        };

        Self {
            session: Session::spawn(config, backends),
            transport,
            input,
            output,
        }
    }

    /// Start and complete the handshake
    pub async fn connect(&self) {
        self.session.start().await.unwrap();
        self.transport.emit(TransportEvent::Opened);
        wait_for(&self.session, |s| {
            s.state == beacon_live::SessionState::Connected
        })
        .await;
    }

    /// Nothing the session acquired is still held
    #[must_use]
    pub fn fully_released(&self) -> bool {
        self.transport.live_connections() == 0
            && self.input.live_streams() == 0
            && self.output.live_outputs() == 0
    }
}
