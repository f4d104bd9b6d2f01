//! Capture pipeline
//!
//! Runs inside the input device callback: slices the incoming sample stream
//! into fixed-size frames, reports each frame's level for speech detection,
//! and hands encoded frames to the transport without ever blocking.

use super::activity::rms;
use super::device::SampleCallback;
use super::format::{AudioFrame, WireFormat};
use crate::transport::FrameSender;

/// Turns raw device samples into wire frames
pub struct CapturePipeline {
    format: WireFormat,
    frame_size: usize,
    pending: Vec<f32>,
    frames: FrameSender,
    on_level: Box<dyn FnMut(f32) + Send>,
}

impl CapturePipeline {
    /// Create a pipeline emitting `frame_size`-sample frames in `format`
    pub fn new(
        format: WireFormat,
        frame_size: usize,
        frames: FrameSender,
        on_level: impl FnMut(f32) + Send + 'static,
    ) -> Self {
        Self {
            format,
            frame_size: frame_size.max(1),
            pending: Vec::with_capacity(frame_size * 2),
            frames,
            on_level: Box::new(on_level),
        }
    }

    /// Accept samples from the device callback
    pub fn push(&mut self, samples: &[f32]) {
        self.pending.extend_from_slice(samples);

        while self.pending.len() >= self.frame_size {
            let frame: Vec<f32> = self.pending.drain(..self.frame_size).collect();
            self.process(&frame);
        }
    }

    fn process(&mut self, raw: &[f32]) {
        (self.on_level)(rms(raw));

        // Frames outside an open connection are dropped, never queued
        if !self.frames.is_open() {
            return;
        }

        let encoded = AudioFrame::from_f32(raw, self.format).encode();
        if self.frames.send(encoded).is_err() {
            tracing::trace!("capture frame dropped");
        }
    }

    /// Convert into a device callback
    #[must_use]
    pub fn into_callback(mut self) -> SampleCallback {
        Box::new(move |samples| self.push(samples))
    }
}
