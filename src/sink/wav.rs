// src/sink/wav.rs

use hound::{SampleFormat, WavSpec, WavWriter};
use std::fs::File;
use std::io::BufWriter;
use std::path::PathBuf;

use crate::error::{AeError, AeResult};
use crate::format::{AudioFormat, DataFormat};
use crate::sink::{DeviceSpec, Sink};

/// Writes everything the engine outputs to a WAV file.
///
/// Integer and float PCM are written as-is. Passthrough carriers are written
/// as 16-bit words, which is how an IEC61937 stream looks on an S/PDIF link.
pub struct WavSink {
    writer: Option<WavWriter<BufWriter<File>>>,
    format: Option<AudioFormat>,
    path: PathBuf,
    frames_written: u64,
}

impl WavSink {
    pub fn new() -> Self {
        Self {
            writer: None,
            format: None,
            path: PathBuf::new(),
            frames_written: 0,
        }
    }

    pub fn frames_written(&self) -> u64 {
        self.frames_written
    }
}

impl Default for WavSink {
    fn default() -> Self {
        Self::new()
    }
}

/// Format actually written for a requested one; the spec describing it.
fn negotiate(format: &AudioFormat) -> (DataFormat, WavSpec) {
    let channels = format.channel_count() as u16;
    let spec = |bits, sample_format| WavSpec {
        channels,
        sample_rate: format.sample_rate,
        bits_per_sample: bits,
        sample_format,
    };
    match format.data_format {
        DataFormat::FloatLE => (DataFormat::FloatLE, spec(32, SampleFormat::Float)),
        DataFormat::S32LE => (DataFormat::S32LE, spec(32, SampleFormat::Int)),
        DataFormat::S24LE3 => (DataFormat::S24LE3, spec(24, SampleFormat::Int)),
        DataFormat::Raw | DataFormat::Iec61937 => (format.data_format, spec(16, SampleFormat::Int)),
        DataFormat::U8 | DataFormat::S16LE | DataFormat::S16BE => {
            (DataFormat::S16LE, spec(16, SampleFormat::Int))
        }
    }
}

fn write_all(
    writer: &mut WavWriter<BufWriter<File>>,
    format: DataFormat,
    data: &[u8],
) -> hound::Result<()> {
    match format {
        DataFormat::FloatLE => {
            for c in data.chunks_exact(4) {
                writer.write_sample(f32::from_le_bytes([c[0], c[1], c[2], c[3]]))?;
            }
        }
        DataFormat::S32LE => {
            for c in data.chunks_exact(4) {
                writer.write_sample(i32::from_le_bytes([c[0], c[1], c[2], c[3]]))?;
            }
        }
        DataFormat::S24LE3 => {
            for c in data.chunks_exact(3) {
                writer.write_sample(i32::from_le_bytes([0, c[0], c[1], c[2]]) >> 8)?;
            }
        }
        _ => {
            for c in data.chunks_exact(2) {
                writer.write_sample(i16::from_le_bytes([c[0], c[1]]))?;
            }
        }
    }
    Ok(())
}

impl Sink for WavSink {
    fn name(&self) -> &str {
        "wav"
    }

    fn initialize(&mut self, format: &mut AudioFormat, device: &str) -> AeResult<()> {
        self.deinitialize();
        let path = match DeviceSpec::parse(device)? {
            DeviceSpec::Wav(path) => PathBuf::from(path),
            _ => {
                return Err(AeError::SinkOpen {
                    device: device.to_string(),
                    reason: "not a wav device".to_string(),
                });
            }
        };

        let (data_format, spec) = negotiate(format);
        let open_err = |reason: String| AeError::SinkOpen {
            device: device.to_string(),
            reason,
        };
        let file = File::create(&path).map_err(|e| open_err(e.to_string()))?;
        let writer = WavWriter::new(BufWriter::new(file), spec).map_err(|e| open_err(e.to_string()))?;

        *format = AudioFormat::new(
            data_format,
            format.sample_rate,
            format.channel_layout.clone(),
            format.frames_per_period,
        );
        self.writer = Some(writer);
        self.format = Some(format.clone());
        self.path = path;
        self.frames_written = 0;
        Ok(())
    }

    fn deinitialize(&mut self) {
        if let Some(writer) = self.writer.take() {
            if let Err(e) = writer.finalize() {
                log::error!("finalizing {}: {e}", self.path.display());
            }
        }
        self.format = None;
    }

    fn add_packets(&mut self, data: &[u8], frames: usize) -> AeResult<usize> {
        let (Some(writer), Some(format)) = (self.writer.as_mut(), self.format.as_ref()) else {
            return Err(AeError::NotRunning);
        };
        let len = (frames * format.frame_size).min(data.len());
        write_all(writer, format.data_format, &data[..len])
            .map_err(|e| AeError::SinkWrite(e.to_string()))?;
        let written = len / format.frame_size.max(1);
        self.frames_written += written as u64;
        Ok(written)
    }

    fn delay(&self) -> f32 {
        0.0
    }

    fn drain(&mut self) {
        if let Some(writer) = self.writer.as_mut() {
            if let Err(e) = writer.flush() {
                log::warn!("flushing {}: {e}", self.path.display());
            }
        }
    }
}

impl Drop for WavSink {
    fn drop(&mut self) {
        self.deinitialize();
    }
}
