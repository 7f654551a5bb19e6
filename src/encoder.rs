// src/encoder.rs

use crate::bitstream::StreamInfo;
use crate::error::AeResult;
use crate::format::AudioFormat;

/// Compresses the final PCM mix for a passthrough sink.
///
/// The engine hands over one finalized period at a time and forwards every
/// unit the encoder emits to the bitstream packer.
pub trait Encoder: Send {
    fn name(&self) -> &str;

    /// Prepares for `format`, adjusting it to the PCM the encoder consumes.
    /// The engine mixes in whatever format is left here.
    fn initialize(&mut self, format: &mut AudioFormat) -> AeResult<()>;

    /// Carrier description of the emitted units.
    fn stream_info(&self) -> StreamInfo;

    /// Consumes `pcm` and appends zero or more complete units to `units`.
    fn encode(&mut self, pcm: &[u8], units: &mut Vec<Vec<u8>>) -> AeResult<()>;

    /// Seconds of audio held inside the encoder.
    fn delay(&self) -> f32 {
        0.0
    }

    fn reset(&mut self) {}
}

/// Builds an encoder whenever the engine opens in transcode mode.
pub trait EncoderFactory: Send + Sync {
    fn create(&self) -> AeResult<Box<dyn Encoder>>;
}

impl<F> EncoderFactory for F
where
    F: Fn() -> AeResult<Box<dyn Encoder>> + Send + Sync,
{
    fn create(&self) -> AeResult<Box<dyn Encoder>> {
        self()
    }
}
