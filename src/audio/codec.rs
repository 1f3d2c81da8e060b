//! Pure sample-format conversions for the audio hot path.
//!
//! Everything here is stateless: float/PCM16 scaling, box resampling,
//! base64 wire encoding, and the WAV container used for batch
//! transcription requests.

use crate::error::{Result, VoxcallError};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use std::io::Cursor;

/// Convert one float sample in [-1.0, 1.0] to signed 16-bit PCM.
///
/// Negative values scale by 0x8000 and non-negative by 0x7FFF so that both
/// ends of the float range map onto the full i16 range exactly.
#[inline]
fn pcm16_sample(sample: f32) -> i16 {
    let s = sample.clamp(-1.0, 1.0);
    if s < 0.0 {
        (s * 0x8000 as f32) as i16
    } else {
        (s * 0x7FFF as f32) as i16
    }
}

/// Convert float samples to 16-bit PCM.
///
/// Deterministic, no error case: out-of-range input is clamped.
pub fn pcm16_from_float(samples: &[f32]) -> Vec<i16> {
    samples.iter().map(|&s| pcm16_sample(s)).collect()
}

/// Convert 16-bit PCM back to float samples in [-1.0, 1.0].
///
/// Inverse of [`pcm16_from_float`] up to one quantization step.
pub fn float_from_pcm16(samples: &[i16]) -> Vec<f32> {
    samples
        .iter()
        .map(|&s| {
            if s < 0 {
                s as f32 / 0x8000 as f32
            } else {
                s as f32 / 0x7FFF as f32
            }
        })
        .collect()
}

/// Resample float audio to `out_rate` and convert to 16-bit PCM.
///
/// Equal rates reduce to [`pcm16_from_float`]. Otherwise each output sample
/// averages the source samples its fractional span covers (box resampling),
/// which tames aliasing on downsampling without a filter-bank dependency.
/// Output length is `floor(in_len / (in_rate / out_rate))`.
pub fn resample(samples: &[f32], in_rate: u32, out_rate: u32) -> Vec<i16> {
    if in_rate == out_rate {
        return pcm16_from_float(samples);
    }

    let ratio = in_rate as f64 / out_rate as f64;
    let out_len = (samples.len() as f64 / ratio).floor() as usize;
    let mut out = Vec::with_capacity(out_len);

    for i in 0..out_len {
        let span_start = i as f64 * ratio;
        let span_end = span_start + ratio;
        let first = span_start.floor() as usize;
        let last = (span_end.ceil() as usize).min(samples.len());

        let mut acc = 0.0f64;
        let mut weight = 0.0f64;
        for (offset, &s) in samples[first..last].iter().enumerate() {
            let idx = (first + offset) as f64;
            let covered = (idx + 1.0).min(span_end) - idx.max(span_start);
            if covered > 0.0 {
                acc += s as f64 * covered;
                weight += covered;
            }
        }

        let averaged = if weight > 0.0 { (acc / weight) as f32 } else { 0.0 };
        out.push(pcm16_sample(averaged));
    }

    out
}

/// Mix interleaved multi-channel float audio down to mono by averaging.
pub fn mix_to_mono(samples: &[f32], channels: usize) -> Vec<f32> {
    if channels <= 1 {
        return samples.to_vec();
    }
    samples
        .chunks_exact(channels)
        .map(|frame| frame.iter().sum::<f32>() / channels as f32)
        .collect()
}

/// Encode 16-bit PCM as base64 over little-endian bytes.
pub fn encode_base64(samples: &[i16]) -> String {
    BASE64.encode(pcm_to_bytes(samples))
}

/// Decode base64 back into 16-bit PCM.
///
/// # Errors
/// Returns `VoxcallError::Codec` for invalid base64 or an odd byte count.
pub fn decode_base64(encoded: &str) -> Result<Vec<i16>> {
    let bytes = BASE64.decode(encoded).map_err(|e| VoxcallError::Codec {
        message: format!("invalid base64 audio payload: {}", e),
    })?;
    pcm_from_bytes(&bytes)
}

/// Serialize 16-bit PCM to little-endian bytes.
pub fn pcm_to_bytes(samples: &[i16]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(samples.len() * 2);
    for &s in samples {
        bytes.extend_from_slice(&s.to_le_bytes());
    }
    bytes
}

/// Parse little-endian bytes into 16-bit PCM.
///
/// # Errors
/// Returns `VoxcallError::Codec` for an odd byte count.
pub fn pcm_from_bytes(bytes: &[u8]) -> Result<Vec<i16>> {
    if bytes.len() % 2 != 0 {
        return Err(VoxcallError::Codec {
            message: format!("PCM16 payload has odd length {}", bytes.len()),
        });
    }
    Ok(bytes
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
        .collect())
}

/// Wrap 16-bit mono PCM in a canonical 44-byte-header WAV container.
///
/// Used only for batch transcription requests; streamed audio never touches
/// a container.
pub fn to_wav(samples: &[i16], sample_rate: u32) -> Result<Vec<u8>> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };

    let mut cursor = Cursor::new(Vec::new());
    {
        let mut writer =
            hound::WavWriter::new(&mut cursor, spec).map_err(|e| VoxcallError::Codec {
                message: format!("failed to create WAV writer: {}", e),
            })?;
        for &s in samples {
            writer.write_sample(s).map_err(|e| VoxcallError::Codec {
                message: format!("failed to write WAV sample: {}", e),
            })?;
        }
        writer.finalize().map_err(|e| VoxcallError::Codec {
            message: format!("failed to finalize WAV: {}", e),
        })?;
    }

    Ok(cursor.into_inner())
}
