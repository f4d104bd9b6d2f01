//! Audio device seams and their cpal implementations
//!
//! cpal streams are not `Send`, so each opened stream lives on its own thread
//! and is dropped there when the handle is closed. Closing joins the thread,
//! so no device context outlives the handle.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc as std_mpsc;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleRate, Stream, StreamConfig};
use tokio::runtime::RuntimeFlavor;

use super::format::WireFormat;
use super::playback::{Mixer, UnitId};
use crate::config::AudioConfig;
use crate::{Error, Result};

/// Receives raw captured samples on the device's own cadence
pub type SampleCallback = Box<dyn FnMut(&[f32]) + Send + 'static>;

/// Notified when a scheduled unit finishes playing naturally
pub type FinishedCallback = Arc<dyn Fn(UnitId) + Send + Sync + 'static>;

/// What the capture side asks of the input device
#[derive(Debug, Clone)]
pub struct CaptureSettings {
    /// Requested sample rate
    pub sample_rate: u32,
    /// Noise suppression capability flag
    pub noise_suppression: bool,
    /// Echo cancellation capability flag
    pub echo_cancellation: bool,
    /// Automatic gain capability flag
    pub auto_gain: bool,
}

impl CaptureSettings {
    /// Settings for the configured capture rate
    #[must_use]
    pub const fn from_config(audio: &AudioConfig) -> Self {
        Self {
            sample_rate: audio.input_sample_rate,
            noise_suppression: audio.noise_suppression,
            echo_cancellation: audio.echo_cancellation,
            auto_gain: audio.auto_gain,
        }
    }
}

/// A microphone that can be opened for streaming capture
pub trait InputDevice: Send + Sync {
    /// Acquire the microphone and start delivering mono samples
    ///
    /// # Errors
    ///
    /// `Error::PermissionDenied` if capture access is refused,
    /// `Error::DeviceUnavailable` or `Error::Audio` for device failures
    fn open(
        &self,
        settings: &CaptureSettings,
        on_samples: SampleCallback,
    ) -> Result<Box<dyn InputStream>>;
}

/// An open capture stream
pub trait InputStream: Send {
    /// Halt the device and detach the callback
    fn close(&mut self);
}

/// A speaker that can be opened for scheduled playback
pub trait OutputDevice: Send + Sync {
    /// Open an output context at the given format
    ///
    /// # Errors
    ///
    /// Returns error if no output device is usable
    fn open(&self, format: WireFormat, on_finished: FinishedCallback)
    -> Result<Box<dyn AudioOutput>>;
}

/// Schedulable output with its own clock
pub trait AudioOutput: Send {
    /// Device clock: frames rendered since the output opened
    fn position(&self) -> u64;

    /// Play `samples` starting at frame `start`, or at the current clock if
    /// `start` has already been rendered
    ///
    /// Returns the frame the unit actually starts at.
    ///
    /// # Errors
    ///
    /// Returns error if the output has been closed
    fn schedule(&mut self, unit: UnitId, start: u64, samples: Vec<f32>) -> Result<u64>;

    /// Stop a unit immediately without a completion notification
    fn cancel(&mut self, unit: UnitId);

    /// Release the output context
    fn close(&mut self);
}

/// Keeps a device stream alive on a dedicated thread
struct StreamThread {
    stop: Option<std_mpsc::Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl StreamThread {
    /// Build a stream on a new thread and wait until it is running
    fn spawn<S, F>(name: &str, build: F) -> Result<Self>
    where
        S: 'static,
        F: FnOnce() -> Result<S> + Send + 'static,
    {
        let (ready_tx, ready_rx) = std_mpsc::channel::<Result<()>>();
        let (stop_tx, stop_rx) = std_mpsc::channel::<()>();

        let thread = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                let stream = match build() {
                    Ok(stream) => stream,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                let _ = ready_tx.send(Ok(()));

                // Parked until the handle closes or is dropped
                let _ = stop_rx.recv();
                drop(stream);
            })?;

        let started = off_runtime(|| ready_rx.recv())
            .map_err(|_| Error::Audio("audio thread exited before starting".to_string()))
            .and_then(|r| r);

        let mut handle = Self {
            stop: Some(stop_tx),
            thread: Some(thread),
        };
        if let Err(e) = started {
            handle.close();
            return Err(e);
        }
        Ok(handle)
    }

    fn close(&mut self) {
        drop(self.stop.take());
        if let Some(thread) = self.thread.take()
            && off_runtime(|| thread.join()).is_err()
        {
            tracing::warn!("audio thread panicked");
        }
    }
}

impl Drop for StreamThread {
    fn drop(&mut self) {
        self.close();
    }
}

/// Run a blocking wait without stalling the other tasks of a multi-threaded
/// runtime
///
/// Device drivers can take a long time to open or release a stream, and the
/// session's network task shares the runtime with the caller.
fn off_runtime<T>(wait: impl FnOnce() -> T) -> T {
    match tokio::runtime::Handle::try_current() {
        Ok(handle) if handle.runtime_flavor() == RuntimeFlavor::MultiThread => {
            tokio::task::block_in_place(wait)
        }
        _ => wait(),
    }
}

/// Start a built stream
fn play(stream: Stream) -> Result<Stream> {
    stream.play().map_err(|e| Error::Audio(e.to_string()))?;
    Ok(stream)
}

/// Default system microphone via cpal
#[derive(Debug, Default, Clone, Copy)]
pub struct CpalInput;

impl InputDevice for CpalInput {
    fn open(
        &self,
        settings: &CaptureSettings,
        on_samples: SampleCallback,
    ) -> Result<Box<dyn InputStream>> {
        let settings = settings.clone();
        let thread = StreamThread::spawn("beacon-capture", move || {
            build_input_stream(&settings, on_samples).and_then(play)
        })?;

        tracing::debug!("audio capture started");
        Ok(Box::new(CpalInputStream { thread }))
    }
}

struct CpalInputStream {
    thread: StreamThread,
}

impl InputStream for CpalInputStream {
    fn close(&mut self) {
        self.thread.close();
        tracing::debug!("audio capture stopped");
    }
}

fn build_input_stream(settings: &CaptureSettings, mut on_samples: SampleCallback) -> Result<Stream> {
    let host = cpal::default_host();
    let device = host
        .default_input_device()
        .ok_or_else(|| Error::DeviceUnavailable("no input device available".to_string()))?;

    let rate = SampleRate(settings.sample_rate);
    let supported = device
        .supported_input_configs()
        .map_err(|e| Error::DeviceUnavailable(e.to_string()))?
        .filter(|c| c.min_sample_rate() <= rate && c.max_sample_rate() >= rate)
        .min_by_key(cpal::SupportedStreamConfigRange::channels)
        .ok_or_else(|| Error::Audio("no suitable input config found".to_string()))?;

    let config: StreamConfig = supported.with_sample_rate(rate).config();
    let channels = usize::from(config.channels.max(1));

    tracing::debug!(
        device = device.name().unwrap_or_default(),
        sample_rate = settings.sample_rate,
        channels,
        noise_suppression = settings.noise_suppression,
        echo_cancellation = settings.echo_cancellation,
        auto_gain = settings.auto_gain,
        "audio capture initialized"
    );

    let mut mono = Vec::new();
    device
        .build_input_stream(
            &config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| {
                if channels == 1 {
                    on_samples(data);
                } else {
                    mono.clear();
                    #[allow(clippy::cast_precision_loss)]
                    mono.extend(
                        data.chunks(channels)
                            .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32),
                    );
                    on_samples(&mono);
                }
            },
            |err| {
                tracing::error!(error = %err, "audio capture error");
            },
            None,
        )
        .map_err(|e| match e {
            cpal::BuildStreamError::DeviceNotAvailable => {
                Error::DeviceUnavailable("input device not available".to_string())
            }
            other => Error::Audio(other.to_string()),
        })
}

/// Default system speaker via cpal
#[derive(Debug, Default, Clone, Copy)]
pub struct CpalOutput;

impl OutputDevice for CpalOutput {
    fn open(
        &self,
        format: WireFormat,
        on_finished: FinishedCallback,
    ) -> Result<Box<dyn AudioOutput>> {
        let mixer = Arc::new(Mutex::new(Mixer::new()));
        let clock = Arc::new(AtomicU64::new(0));

        let render_mixer = Arc::clone(&mixer);
        let render_clock = Arc::clone(&clock);
        let thread = StreamThread::spawn("beacon-playback", move || {
            build_output_stream(format, render_mixer, render_clock, on_finished).and_then(play)
        })?;

        tracing::debug!(sample_rate = format.sample_rate, "audio playback started");
        Ok(Box::new(CpalAudioOutput {
            mixer,
            clock,
            thread: Some(thread),
        }))
    }
}

struct CpalAudioOutput {
    mixer: Arc<Mutex<Mixer>>,
    clock: Arc<AtomicU64>,
    thread: Option<StreamThread>,
}

impl AudioOutput for CpalAudioOutput {
    fn position(&self) -> u64 {
        self.clock.load(Ordering::Acquire)
    }

    fn schedule(&mut self, unit: UnitId, start: u64, samples: Vec<f32>) -> Result<u64> {
        if self.thread.is_none() {
            return Err(Error::Audio("output closed".to_string()));
        }
        // The render callback may have advanced past `start` since it was read
        let start = self
            .mixer
            .lock()
            .map_err(|_| Error::Audio("mixer lock poisoned".to_string()))?
            .schedule(unit, start, samples);
        Ok(start)
    }

    fn cancel(&mut self, unit: UnitId) {
        if let Ok(mut mixer) = self.mixer.lock() {
            mixer.cancel(unit);
        }
    }

    fn close(&mut self) {
        if let Ok(mut mixer) = self.mixer.lock() {
            mixer.clear();
        }
        if let Some(mut thread) = self.thread.take() {
            thread.close();
            tracing::debug!("audio playback stopped");
        }
    }
}

fn build_output_stream(
    format: WireFormat,
    mixer: Arc<Mutex<Mixer>>,
    clock: Arc<AtomicU64>,
    on_finished: FinishedCallback,
) -> Result<Stream> {
    let host = cpal::default_host();
    let device = host
        .default_output_device()
        .ok_or_else(|| Error::DeviceUnavailable("no output device available".to_string()))?;

    let rate = SampleRate(format.sample_rate);
    let supported_config = device
        .supported_output_configs()
        .map_err(|e| Error::DeviceUnavailable(e.to_string()))?
        .find(|c| c.channels() == 1 && c.min_sample_rate() <= rate && c.max_sample_rate() >= rate)
        .or_else(|| {
            // Fallback: try stereo
            device.supported_output_configs().ok()?.find(|c| {
                c.channels() == 2 && c.min_sample_rate() <= rate && c.max_sample_rate() >= rate
            })
        })
        .ok_or_else(|| Error::Audio("no suitable output config found".to_string()))?;

    let config = supported_config.with_sample_rate(rate).config();
    let channels = usize::from(config.channels);

    tracing::debug!(
        device = device.name().unwrap_or_default(),
        sample_rate = format.sample_rate,
        channels,
        "audio playback initialized"
    );

    device
        .build_output_stream(
            &config,
            move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                let finished = match mixer.lock() {
                    Ok(mut mixer) => {
                        let finished = mixer.render(data, channels);
                        clock.store(mixer.position(), Ordering::Release);
                        finished
                    }
                    Err(_) => {
                        data.fill(0.0);
                        return;
                    }
                };
                for unit in finished {
                    on_finished(unit);
                }
            },
            |err| {
                tracing::error!(error = %err, "audio playback error");
            },
            None,
        )
        .map_err(|e| match e {
            cpal::BuildStreamError::DeviceNotAvailable => {
                Error::DeviceUnavailable("output device not available".to_string())
            }
            other => Error::Audio(other.to_string()),
        })
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize};
    use std::time::Duration;

    use super::*;

    /// Sets a flag when dropped on the stream thread
    struct DropFlag(Arc<AtomicBool>);

    impl Drop for DropFlag {
        fn drop(&mut self) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    #[test]
    fn close_drops_the_stream_before_returning() {
        let dropped = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&dropped);

        let mut thread = StreamThread::spawn("test-stream", move || Ok(DropFlag(flag))).unwrap();
        assert!(!dropped.load(Ordering::SeqCst));

        thread.close();
        assert!(dropped.load(Ordering::SeqCst));
    }

    #[test]
    fn build_failure_is_reported() {
        let result = StreamThread::spawn("test-stream", || {
            Err::<(), _>(Error::DeviceUnavailable("no device".to_string()))
        });
        assert!(matches!(result, Err(Error::DeviceUnavailable(_))));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn slow_open_does_not_stall_the_runtime() {
        let ticks = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&ticks);
        let ticker = tokio::spawn(async move {
            loop {
                counter.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        });

        let progressed = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&progressed);
        let opener = tokio::spawn(async move {
            StreamThread::spawn("test-slow-open", move || {
                let before = ticks.load(Ordering::SeqCst);
                std::thread::sleep(Duration::from_millis(200));
                seen.store(ticks.load(Ordering::SeqCst) - before, Ordering::SeqCst);
                Ok(())
            })
            .map(|mut thread| thread.close())
        });

        opener.await.unwrap().unwrap();
        ticker.abort();
        assert!(progressed.load(Ordering::SeqCst) > 0);
    }
}
