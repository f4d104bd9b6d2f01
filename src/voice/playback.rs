//! Gapless playback scheduling
//!
//! Response audio arrives as independent fragments. Each one is decoded and
//! placed on the output device's timeline at `max(now, next_start)`, so
//! consecutive fragments play back-to-back without the sender having to pace
//! delivery. An interruption flushes everything that is scheduled or playing.

use std::collections::HashMap;

use super::device::AudioOutput;
use super::format::{WireFormat, decode_pcm16};
use crate::Result;

/// Identifier of a scheduled unit, doubles as its cancellation handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UnitId(pub u64);

/// One scheduled fragment on the playback timeline
///
/// Positions are in sample frames of the output device clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlaybackUnit {
    /// Cancellation handle
    pub id: UnitId,
    /// First frame of the unit on the device timeline
    pub start: u64,
    /// Length in frames
    pub frames: u64,
}

impl PlaybackUnit {
    /// Frame at which the unit finishes
    #[must_use]
    pub const fn end(&self) -> u64 {
        self.start + self.frames
    }
}

/// Schedules decoded fragments back-to-back on an output device
pub struct PlaybackScheduler {
    output: Box<dyn AudioOutput>,
    format: WireFormat,
    next_start: u64,
    next_id: u64,
    active: HashMap<UnitId, PlaybackUnit>,
}

impl PlaybackScheduler {
    /// Create a scheduler over an opened output
    #[must_use]
    pub fn new(output: Box<dyn AudioOutput>, format: WireFormat) -> Self {
        let next_start = output.position();
        Self {
            output,
            format,
            next_start,
            next_id: 0,
            active: HashMap::new(),
        }
    }

    /// Decode a PCM fragment and schedule it after everything already queued
    ///
    /// Returns `None` for fragments that contain no whole sample frame.
    ///
    /// # Errors
    ///
    /// Returns error if the output device rejects the unit
    pub fn enqueue(&mut self, fragment: &[u8]) -> Result<Option<PlaybackUnit>> {
        let samples = decode_pcm16(fragment);
        let frames = (samples.len() / usize::from(self.format.channels.max(1))) as u64;
        if frames == 0 {
            return Ok(None);
        }

        let start = self.output.position().max(self.next_start);
        let id = UnitId(self.next_id);
        self.next_id += 1;

        let start = self.output.schedule(id, start, samples)?;

        let unit = PlaybackUnit { id, start, frames };
        self.next_start = unit.end();
        self.active.insert(id, unit);

        tracing::trace!(
            unit = id.0,
            start,
            frames,
            active = self.active.len(),
            "fragment scheduled"
        );
        Ok(Some(unit))
    }

    /// Record that a unit finished playing naturally
    ///
    /// Returns `true` if the unit was still active.
    pub fn complete(&mut self, id: UnitId) -> bool {
        self.active.remove(&id).is_some()
    }

    /// Stop every scheduled or playing unit and restart the timeline at the
    /// current device position
    ///
    /// Returns the number of units cancelled.
    pub fn flush(&mut self) -> usize {
        let cancelled = self.active.len();
        for id in self.active.keys() {
            self.output.cancel(*id);
        }
        self.active.clear();
        self.next_start = self.output.position();

        if cancelled > 0 {
            tracing::debug!(cancelled, "playback flushed");
        }
        cancelled
    }

    /// Flush and release the output device
    pub fn close(&mut self) {
        self.flush();
        self.output.close();
    }

    /// Whether any unit is scheduled or playing
    #[must_use]
    pub fn is_playing(&self) -> bool {
        !self.active.is_empty()
    }

    /// Frame at which the next fragment would start if the clock stood still
    #[must_use]
    pub const fn next_start(&self) -> u64 {
        self.next_start
    }

    /// Current device clock in frames
    #[must_use]
    pub fn position(&self) -> u64 {
        self.output.position()
    }

    /// Units still scheduled or playing, in start order
    #[must_use]
    pub fn active_units(&self) -> Vec<PlaybackUnit> {
        let mut units: Vec<_> = self.active.values().copied().collect();
        units.sort_by_key(|u| u.start);
        units
    }

    /// Output format
    #[must_use]
    pub const fn format(&self) -> WireFormat {
        self.format
    }
}

impl std::fmt::Debug for PlaybackScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlaybackScheduler")
            .field("format", &self.format)
            .field("next_start", &self.next_start)
            .field("active", &self.active.len())
            .finish_non_exhaustive()
    }
}

/// Renders scheduled units onto an output buffer
///
/// Owned by the device side. Its position is the output clock: it only
/// advances as frames are rendered.
#[derive(Debug, Default)]
pub struct Mixer {
    position: u64,
    units: Vec<MixerUnit>,
}

#[derive(Debug)]
struct MixerUnit {
    id: UnitId,
    start: u64,
    samples: Vec<f32>,
}

impl MixerUnit {
    fn end(&self) -> u64 {
        self.start + self.samples.len() as u64
    }
}

impl Mixer {
    /// Create an idle mixer at position zero
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Frames rendered so far
    #[must_use]
    pub const fn position(&self) -> u64 {
        self.position
    }

    /// Queue mono samples to start at frame `start`
    ///
    /// A start that has already been rendered moves up to the current
    /// position so the unit still plays from its first sample. Returns the
    /// effective start.
    pub fn schedule(&mut self, id: UnitId, start: u64, samples: Vec<f32>) -> u64 {
        let start = start.max(self.position);
        self.units.push(MixerUnit { id, start, samples });
        start
    }

    /// Drop a unit without reporting completion
    pub fn cancel(&mut self, id: UnitId) -> bool {
        let before = self.units.len();
        self.units.retain(|u| u.id != id);
        self.units.len() != before
    }

    /// Drop every unit
    pub fn clear(&mut self) {
        self.units.clear();
    }

    /// Number of units not yet finished
    #[must_use]
    pub fn pending(&self) -> usize {
        self.units.len()
    }

    /// Fill an interleaved buffer with `channels` channels and advance the clock
    ///
    /// Returns the units that finished within this buffer.
    #[allow(clippy::cast_possible_truncation)]
    pub fn render(&mut self, out: &mut [f32], channels: usize) -> Vec<UnitId> {
        let channels = channels.max(1);
        out.fill(0.0);

        let frames = (out.len() / channels) as u64;
        let begin = self.position;
        let end = begin + frames;

        for unit in &self.units {
            if unit.end() <= begin || unit.start >= end {
                continue;
            }
            let from = unit.start.max(begin);
            let to = unit.end().min(end);
            for frame in from..to {
                let sample = unit.samples[(frame - unit.start) as usize];
                let offset = (frame - begin) as usize * channels;
                for slot in &mut out[offset..offset + channels] {
                    *slot += sample;
                }
            }
        }

        for slot in out.iter_mut() {
            *slot = slot.clamp(-1.0, 1.0);
        }

        self.position = end;

        let mut finished = Vec::new();
        self.units.retain(|u| {
            if u.end() <= end {
                finished.push(u.id);
                false
            } else {
                true
            }
        });
        finished
    }
}
