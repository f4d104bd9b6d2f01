//! Live session controller
//!
//! One tokio task owns all session state. Commands from the [`Session`]
//! handle, capture levels from the audio thread, playback completions from
//! the output device and events from the transport are all posted into that
//! task and applied one at a time.
//!
//! Every message from a device or connection carries the generation it was
//! created under. Releasing a session bumps the generation, so anything still
//! in flight from a torn-down session is ignored.

mod state;
mod transcript;

pub use state::{SessionState, SessionStatus};
pub use transcript::{Speaker, TranscriptEntry, TurnTranscript};

use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep_until};
use uuid::Uuid;

use crate::config::Config;
use crate::fault::{Fault, RetryPolicy, classify_error, classify_failure};
use crate::transport::{
    Connection, EventSink, FrameSender, OpenRequest, Transport, TransportEvent,
    WebSocketTransport, frame_channel,
};
use crate::voice::{
    CapturePipeline, CaptureSettings, CpalInput, CpalOutput, FinishedCallback, InputDevice,
    InputStream, OutputDevice, PlaybackScheduler, SpeechActivity, SpeechDetector, UnitId,
    WireFormat,
};
use crate::{Error, Result};

const TRANSCRIPT_CAPACITY: usize = 64;

/// External collaborators a session drives
#[derive(Clone)]
pub struct Backends {
    /// Remote inference service
    pub transport: Arc<dyn Transport>,
    /// Microphone
    pub input: Arc<dyn InputDevice>,
    /// Speaker
    pub output: Arc<dyn OutputDevice>,
}

impl Backends {
    /// The Live API over WebSocket with the default system audio devices
    #[must_use]
    pub fn system(config: &Config) -> Self {
        Self {
            transport: Arc::new(WebSocketTransport::new(Arc::clone(&config.live))),
            input: Arc::new(CpalInput),
            output: Arc::new(CpalOutput),
        }
    }
}

impl std::fmt::Debug for Backends {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Backends").finish_non_exhaustive()
    }
}

enum Command {
    Start(oneshot::Sender<()>),
    Stop(oneshot::Sender<()>),
}

enum SessionEvent {
    Transport(TransportEvent),
    Level(f32),
    UnitFinished(UnitId),
}

struct Envelope {
    generation: u64,
    event: SessionEvent,
}

/// Handle to a running session controller
///
/// Dropping the handle stops the controller and releases every device.
#[derive(Debug)]
pub struct Session {
    commands: mpsc::Sender<Command>,
    status: watch::Receiver<SessionStatus>,
    transcripts: broadcast::Sender<TranscriptEntry>,
    task: JoinHandle<()>,
}

impl Session {
    /// Spawn a controller on the current tokio runtime
    #[must_use]
    pub fn spawn(config: Config, backends: Backends) -> Self {
        let (commands_tx, commands_rx) = mpsc::channel(16);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(SessionStatus::default());
        let (transcripts_tx, _) = broadcast::channel(TRANSCRIPT_CAPACITY);

        let speech = SpeechDetector::new(config.audio.speech_threshold, config.audio.speech_release);
        let controller = Controller {
            config,
            backends,
            session_id: Uuid::nil(),
            generation: 0,
            events: events_tx,
            status: status_tx,
            transcripts: transcripts_tx.clone(),
            state: SessionState::Disconnected,
            last_error: None,
            live: None,
            retry: None,
            retry_at: None,
            speech,
            remote: SpeechActivity::default(),
            turn: TurnTranscript::default(),
        };

        let task = tokio::spawn(controller.run(commands_rx, events_rx));

        Self {
            commands: commands_tx,
            status: status_rx,
            transcripts: transcripts_tx,
            task,
        }
    }

    /// Begin a conversation
    ///
    /// A no-op unless the session is `Disconnected` or `Error`. Returns once
    /// the controller has acted on the request; the handshake completes
    /// asynchronously.
    ///
    /// # Errors
    ///
    /// Returns `Error::SessionClosed` if the controller has stopped
    pub async fn start(&self) -> Result<()> {
        self.request(Command::Start).await
    }

    /// End the conversation and release every device
    ///
    /// Idempotent and safe from any state, including mid-handshake.
    ///
    /// # Errors
    ///
    /// Returns `Error::SessionClosed` if the controller has stopped
    pub async fn stop(&self) -> Result<()> {
        self.request(Command::Stop).await
    }

    async fn request(&self, make: fn(oneshot::Sender<()>) -> Command) -> Result<()> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.commands
            .send(make(ack_tx))
            .await
            .map_err(|_| Error::SessionClosed)?;
        ack_rx.await.map_err(|_| Error::SessionClosed)
    }

    /// Current status snapshot
    #[must_use]
    pub fn status(&self) -> SessionStatus {
        self.status.borrow().clone()
    }

    /// Current connection state
    #[must_use]
    pub fn state(&self) -> SessionState {
        self.status.borrow().state
    }

    /// Whether the local user is speaking
    #[must_use]
    pub fn is_user_speaking(&self) -> bool {
        self.status.borrow().user_speaking
    }

    /// Whether response audio is scheduled or playing
    #[must_use]
    pub fn is_remote_speaking(&self) -> bool {
        self.status.borrow().remote_speaking
    }

    /// User-facing description of the last failure
    #[must_use]
    pub fn last_error(&self) -> Option<String> {
        self.status.borrow().last_error.clone()
    }

    /// Watch status changes
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<SessionStatus> {
        self.status.clone()
    }

    /// Receive finished transcript entries
    #[must_use]
    pub fn transcripts(&self) -> broadcast::Receiver<TranscriptEntry> {
        self.transcripts.subscribe()
    }

    /// Stop the controller and wait for it to release everything
    pub async fn shutdown(self) {
        let Self { commands, task, .. } = self;
        drop(commands);
        if let Err(e) = task.await {
            tracing::warn!(error = %e, "session controller exited abnormally");
        }
    }
}

/// Resources that exist only while a session is live
struct Live {
    capture: Box<dyn InputStream>,
    playback: PlaybackScheduler,
    connection: Box<dyn Connection>,
    frames: FrameSender,
}

struct Controller {
    config: Config,
    backends: Backends,
    session_id: Uuid,
    generation: u64,
    events: mpsc::UnboundedSender<Envelope>,
    status: watch::Sender<SessionStatus>,
    transcripts: broadcast::Sender<TranscriptEntry>,
    state: SessionState,
    last_error: Option<String>,
    live: Option<Live>,
    retry: Option<RetryPolicy>,
    retry_at: Option<Instant>,
    speech: SpeechDetector,
    remote: SpeechActivity,
    turn: TurnTranscript,
}

impl Controller {
    async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        mut events: mpsc::UnboundedReceiver<Envelope>,
    ) {
        loop {
            let speech_deadline = self.speech.deadline();
            let retry_deadline = self.retry_at;

            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Start(ack)) => {
                        self.start();
                        let _ = ack.send(());
                    }
                    Some(Command::Stop(ack)) => {
                        self.stop();
                        let _ = ack.send(());
                    }
                    None => break,
                },
                Some(envelope) = events.recv() => self.dispatch(envelope),
                () = wait_until(speech_deadline) => {
                    if self.speech.poll(Instant::now()) {
                        self.publish();
                    }
                }
                () = wait_until(retry_deadline) => self.retry_now(),
            }
        }

        self.stop();
        tracing::debug!("session controller stopped");
    }

    fn start(&mut self) {
        if !self.state.accepts_start() {
            tracing::debug!(state = %self.state, "start ignored");
            return;
        }

        self.retry = Some(RetryPolicy::from_config(&self.config.retry));
        self.retry_at = None;
        self.begin();
    }

    fn stop(&mut self) {
        self.retry = None;
        self.retry_at = None;
        self.release();
        self.transition(SessionState::Disconnected);
        self.publish();
    }

    /// Acquire devices and open the transport under a fresh generation
    fn begin(&mut self) {
        self.session_id = Uuid::new_v4();
        self.last_error = None;
        self.turn.reset();
        self.transition(SessionState::Connecting);

        match self.open_live() {
            Ok(live) => self.live = Some(live),
            Err(e) => {
                tracing::error!(session = %self.session_id, error = %e, "failed to acquire audio devices");
                self.fail(classify_error(&e));
            }
        }
    }

    fn open_live(&self) -> Result<Live> {
        let generation = self.generation;
        let audio = &self.config.audio;
        let input_format = WireFormat::mono(audio.input_sample_rate);
        let output_format = WireFormat::mono(audio.output_sample_rate);
        let (frames, frame_rx) = frame_channel(self.config.live.outbound_frames);

        let levels = self.events.clone();
        let pipeline = CapturePipeline::new(
            input_format,
            audio.frame_size,
            frames.clone(),
            move |level| {
                let _ = levels.send(Envelope {
                    generation,
                    event: SessionEvent::Level(level),
                });
            },
        );
        let mut capture = self
            .backends
            .input
            .open(&CaptureSettings::from_config(audio), pipeline.into_callback())?;

        let finished = self.events.clone();
        let on_finished: FinishedCallback = Arc::new(move |unit| {
            let _ = finished.send(Envelope {
                generation,
                event: SessionEvent::UnitFinished(unit),
            });
        });
        let output = match self.backends.output.open(output_format, on_finished) {
            Ok(output) => output,
            Err(e) => {
                capture.close();
                return Err(e);
            }
        };
        let playback = PlaybackScheduler::new(output, output_format);

        let inbound = self.events.clone();
        let events = EventSink::new(move |event| {
            let _ = inbound.send(Envelope {
                generation,
                event: SessionEvent::Transport(event),
            });
        });
        let connection = self.backends.transport.open(OpenRequest {
            input: input_format,
            output: output_format,
            frames: frame_rx,
            events,
        });

        tracing::debug!(
            session = %self.session_id,
            input_rate = input_format.sample_rate,
            output_rate = output_format.sample_rate,
            "session resources acquired"
        );

        Ok(Live {
            capture,
            playback,
            connection,
            frames,
        })
    }

    fn dispatch(&mut self, envelope: Envelope) {
        if envelope.generation != self.generation || self.live.is_none() {
            return;
        }

        match envelope.event {
            SessionEvent::Transport(event) => self.on_transport(event),
            SessionEvent::Level(level) => {
                if self.speech.observe(level, Instant::now()) {
                    self.publish();
                }
            }
            SessionEvent::UnitFinished(unit) => {
                if let Some(live) = self.live.as_mut() {
                    live.playback.complete(unit);
                }
                self.sync_remote();
            }
        }
    }

    fn on_transport(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Opened => {
                if self.state != SessionState::Connecting {
                    return;
                }
                self.retry = None;
                if let Some(live) = self.live.as_ref() {
                    live.frames.set_open(true);
                }
                self.transition(SessionState::Connected);
            }
            TransportEvent::AudioFragment(fragment) => {
                let Some(live) = self.live.as_mut() else {
                    return;
                };
                if let Err(e) = live.playback.enqueue(&fragment) {
                    tracing::warn!(session = %self.session_id, error = %e, "dropping response audio");
                }
                self.sync_remote();
            }
            TransportEvent::InputTranscription(text) => self.turn.push_user(&text),
            TransportEvent::OutputTranscription(text) => self.turn.push_assistant(&text),
            TransportEvent::TurnComplete => {
                for entry in self.turn.take() {
                    // No subscribers is fine
                    let _ = self.transcripts.send(entry);
                }
            }
            TransportEvent::Interrupted => {
                if let Some(live) = self.live.as_mut() {
                    live.playback.flush();
                }
                self.sync_remote();
            }
            TransportEvent::Errored(failure) => {
                tracing::warn!(session = %self.session_id, %failure, "transport failure");
                self.fail(classify_failure(&failure));
            }
            TransportEvent::Closed => self.fail(Fault::Benign),
        }
    }

    /// Route every failure through the single release path
    fn fail(&mut self, fault: Fault) {
        self.release();

        let fault = match fault {
            Fault::Retryable { .. } => self.schedule_retry(fault),
            other => other,
        };

        match fault {
            Fault::Benign => {
                self.retry = None;
                self.transition(SessionState::Disconnected);
            }
            Fault::Fatal { message } => {
                tracing::error!(session = %self.session_id, %message, "session failed");
                self.retry = None;
                self.last_error = Some(message);
                self.transition(SessionState::Error);
            }
            Fault::Retryable { message } => {
                self.last_error = Some(message);
                self.transition(SessionState::Error);
            }
        }

        self.publish();
    }

    /// Arm the reconnect deadline, escalating to fatal once the budget is spent
    fn schedule_retry(&mut self, fault: Fault) -> Fault {
        let retry = self
            .retry
            .get_or_insert_with(|| RetryPolicy::from_config(&self.config.retry));

        let Some(delay) = retry.next_delay() else {
            tracing::warn!(session = %self.session_id, "reconnect attempts exhausted");
            return fault.into_fatal();
        };

        tracing::warn!(
            session = %self.session_id,
            attempt = retry.attempt(),
            remaining = retry.remaining(),
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            "reconnecting"
        );
        self.retry_at = Some(Instant::now() + delay);
        fault
    }

    fn retry_now(&mut self) {
        self.retry_at = None;
        if self.state == SessionState::Error {
            self.begin();
        }
    }

    /// Tear down everything a live session holds
    fn release(&mut self) {
        if let Some(mut live) = self.live.take() {
            live.frames.set_open(false);
            live.connection.close();
            live.capture.close();
            live.playback.close();

            let dropped = live.frames.dropped();
            if dropped > 0 {
                tracing::warn!(session = %self.session_id, dropped, "capture frames dropped under backpressure");
            }
            tracing::debug!(session = %self.session_id, "session resources released");
        }

        self.generation += 1;
        self.speech.reset();
        self.remote.clear();
    }

    fn sync_remote(&mut self) {
        let playing = self
            .live
            .as_ref()
            .is_some_and(|live| live.playback.is_playing());

        if playing {
            self.remote.mark(Instant::now());
        } else {
            self.remote.clear();
        }
        self.publish();
    }

    fn transition(&mut self, next: SessionState) {
        if self.state == next {
            return;
        }
        if !self.state.can_transition_to(next) {
            tracing::warn!(from = %self.state, to = %next, "illegal state transition ignored");
            return;
        }

        tracing::info!(session = %self.session_id, from = %self.state, to = %next, "session state changed");
        self.state = next;
        self.publish();
    }

    fn publish(&self) {
        let next = SessionStatus {
            state: self.state,
            user_speaking: self.speech.is_active(),
            remote_speaking: self.remote.active,
            last_error: self.last_error.clone(),
            reconnecting: self.retry_at.is_some(),
        };
        self.status.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
