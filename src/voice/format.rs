//! Audio frame types and PCM conversion

use crate::{Error, Result};

/// Fixed wire format of one direction of the audio stream
///
/// Agreed when the connection opens and never renegotiated mid-session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WireFormat {
    /// Samples per second
    pub sample_rate: u32,
    /// Interleaved channel count
    pub channels: u16,
}

impl WireFormat {
    /// Mono 16-bit PCM at the given rate
    #[must_use]
    pub const fn mono(sample_rate: u32) -> Self {
        Self {
            sample_rate,
            channels: 1,
        }
    }

    /// MIME tag used on the wire, e.g. `audio/pcm;rate=16000`
    #[must_use]
    pub fn mime_type(&self) -> String {
        format!("audio/pcm;rate={}", self.sample_rate)
    }

    /// Duration in seconds of `frames` sample frames
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn seconds(&self, frames: u64) -> f64 {
        frames as f64 / f64::from(self.sample_rate)
    }
}

/// One captured buffer of signed 16-bit samples
#[derive(Debug, Clone)]
pub struct AudioFrame {
    /// Interleaved samples
    pub samples: Vec<i16>,
    /// Format of `samples`
    pub format: WireFormat,
}

impl AudioFrame {
    /// Convert floating-point samples to a clipped 16-bit frame
    #[must_use]
    pub fn from_f32(samples: &[f32], format: WireFormat) -> Self {
        Self {
            samples: samples.iter().copied().map(f32_to_i16).collect(),
            format,
        }
    }

    /// Encode for the wire as little-endian PCM
    #[must_use]
    pub fn encode(&self) -> EncodedFrame {
        let mut payload = Vec::with_capacity(self.samples.len() * 2);
        for sample in &self.samples {
            payload.extend_from_slice(&sample.to_le_bytes());
        }
        EncodedFrame {
            payload,
            format: self.format,
        }
    }
}

/// Wire-ready capture frame
#[derive(Debug, Clone)]
pub struct EncodedFrame {
    /// Little-endian 16-bit PCM bytes
    pub payload: Vec<u8>,
    /// Format tag
    pub format: WireFormat,
}

/// Convert one f32 sample in [-1.0, 1.0] to i16, clipping out-of-range input
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub fn f32_to_i16(sample: f32) -> i16 {
    (sample * 32768.0).clamp(-32768.0, 32767.0) as i16
}

/// Decode little-endian 16-bit PCM into f32 samples
///
/// A trailing odd byte is ignored.
#[must_use]
pub fn decode_pcm16(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(2)
        .map(|pair| f32::from(i16::from_le_bytes([pair[0], pair[1]])) / 32768.0)
        .collect()
}

/// Convert f32 samples to WAV bytes
///
/// # Errors
///
/// Returns error if WAV encoding fails
pub fn samples_to_wav(samples: &[f32], sample_rate: u32) -> Result<Vec<u8>> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };

    let mut cursor = std::io::Cursor::new(Vec::new());
    {
        let mut writer =
            hound::WavWriter::new(&mut cursor, spec).map_err(|e| Error::Audio(e.to_string()))?;

        for &sample in samples {
            writer
                .write_sample(f32_to_i16(sample))
                .map_err(|e| Error::Audio(e.to_string()))?;
        }

        writer.finalize().map_err(|e| Error::Audio(e.to_string()))?;
    }

    Ok(cursor.into_inner())
}
