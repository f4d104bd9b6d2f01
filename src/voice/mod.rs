//! Voice processing module
//!
//! Handles microphone capture, speech activity detection, and gapless
//! playback of streamed response audio.

mod activity;
mod capture;
mod device;
mod format;
mod playback;

pub use activity::{SpeechActivity, SpeechDetector, rms};
pub use capture::CapturePipeline;
pub use device::{
    AudioOutput, CaptureSettings, CpalInput, CpalOutput, FinishedCallback, InputDevice,
    InputStream, OutputDevice, SampleCallback,
};
pub use format::{AudioFrame, EncodedFrame, WireFormat, decode_pcm16, f32_to_i16, samples_to_wav};
pub use playback::{Mixer, PlaybackScheduler, PlaybackUnit, UnitId};
