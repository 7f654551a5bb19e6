// src/convert/sample.rs

use crate::error::{AeError, AeResult};
use crate::format::DataFormat;

/// Decodes interleaved `bytes` in `format` into floats appended to `out`.
/// Trailing bytes that don't make up a whole sample are ignored.
pub fn to_float(format: DataFormat, bytes: &[u8], out: &mut Vec<f32>) -> AeResult<()> {
    let bps = format.bytes_per_sample();
    out.reserve(bytes.len() / bps);
    match format {
        DataFormat::U8 => {
            out.extend(bytes.iter().map(|b| (*b as f32 - 128.0) / 128.0));
        }
        DataFormat::S16LE => {
            out.extend(
                bytes
                    .chunks_exact(2)
                    .map(|c| i16::from_le_bytes([c[0], c[1]]) as f32 / 32768.0),
            );
        }
        DataFormat::S16BE => {
            out.extend(
                bytes
                    .chunks_exact(2)
                    .map(|c| i16::from_be_bytes([c[0], c[1]]) as f32 / 32768.0),
            );
        }
        DataFormat::S24LE3 => {
            out.extend(bytes.chunks_exact(3).map(|c| {
                // sign-extend through the top byte of an i32
                let v = i32::from_le_bytes([0, c[0], c[1], c[2]]) >> 8;
                v as f32 / 8_388_608.0
            }));
        }
        DataFormat::S32LE => {
            out.extend(
                bytes
                    .chunks_exact(4)
                    .map(|c| i32::from_le_bytes([c[0], c[1], c[2], c[3]]) as f32 / 2_147_483_648.0),
            );
        }
        DataFormat::FloatLE => {
            out.extend(
                bytes
                    .chunks_exact(4)
                    .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]])),
            );
        }
        DataFormat::Raw | DataFormat::Iec61937 => return Err(AeError::UnsupportedFormat(format)),
    }
    Ok(())
}

/// Encodes `samples` into `format`, appending to `out`. Values are clamped
/// to [-1, 1] first.
pub fn from_float(format: DataFormat, samples: &[f32], out: &mut Vec<u8>) -> AeResult<()> {
    out.reserve(samples.len() * format.bytes_per_sample());
    match format {
        DataFormat::U8 => {
            out.extend(
                samples
                    .iter()
                    .map(|s| (s.clamp(-1.0, 1.0) * 127.0 + 128.0).round() as u8),
            );
        }
        DataFormat::S16LE => {
            for s in samples {
                out.extend_from_slice(&quantize(*s, i16::MAX as f32).to_le_bytes()[..2]);
            }
        }
        DataFormat::S16BE => {
            for s in samples {
                let v = quantize(*s, i16::MAX as f32) as i16;
                out.extend_from_slice(&v.to_be_bytes());
            }
        }
        DataFormat::S24LE3 => {
            for s in samples {
                out.extend_from_slice(&quantize(*s, 8_388_607.0).to_le_bytes()[..3]);
            }
        }
        DataFormat::S32LE => {
            for s in samples {
                let v = (s.clamp(-1.0, 1.0) as f64 * i32::MAX as f64).round() as i32;
                out.extend_from_slice(&v.to_le_bytes());
            }
        }
        DataFormat::FloatLE => {
            for s in samples {
                out.extend_from_slice(&s.clamp(-1.0, 1.0).to_le_bytes());
            }
        }
        DataFormat::Raw | DataFormat::Iec61937 => return Err(AeError::UnsupportedFormat(format)),
    }
    Ok(())
}

#[inline]
fn quantize(s: f32, max: f32) -> i32 {
    (s.clamp(-1.0, 1.0) * max).round() as i32
}
