//! PCM16 conversions between device floats and the wire format

use base64::Engine as _;

use crate::{Error, Result};

/// Convert one float sample to signed 16-bit PCM
///
/// The sample is clamped to `[-1.0, 1.0]`; negative values scale by 32768,
/// non-negative values by 32767.
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub fn f32_to_i16(sample: f32) -> i16 {
    let s = if sample.is_nan() { 0.0 } else { sample.clamp(-1.0, 1.0) };
    if s < 0.0 {
        (s * 32768.0) as i16
    } else {
        (s * 32767.0) as i16
    }
}

/// Convert float samples to little-endian PCM16 bytes
#[must_use]
pub fn encode_pcm16(samples: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(samples.len() * 2);
    for &s in samples {
        bytes.extend_from_slice(&f32_to_i16(s).to_le_bytes());
    }
    bytes
}

/// Convert float samples to base64-encoded PCM16 for realtime input
#[must_use]
pub fn encode_frame(samples: &[f32]) -> String {
    base64::engine::general_purpose::STANDARD.encode(encode_pcm16(samples))
}

/// Decode little-endian PCM16 bytes into float samples in `[-1.0, 1.0)`
///
/// # Errors
///
/// Returns error if the byte count is odd
pub fn decode_pcm16(bytes: &[u8]) -> Result<Vec<f32>> {
    if bytes.len() % 2 != 0 {
        return Err(Error::Decode(format!(
            "PCM16 payload has odd length {}",
            bytes.len()
        )));
    }
    Ok(bytes
        .chunks_exact(2)
        .map(|c| f32::from(i16::from_le_bytes([c[0], c[1]])) / 32768.0)
        .collect())
}

/// Mime descriptor for raw PCM16 at the given rate
#[must_use]
pub fn pcm_mime(sample_rate: u32) -> String {
    format!("audio/pcm;rate={sample_rate}")
}

/// Mono PCM16 WAV spec
#[must_use]
pub const fn wav_spec(sample_rate: u32) -> hound::WavSpec {
    hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    }
}
