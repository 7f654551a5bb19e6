// src/sink/null.rs

use crate::error::AeResult;
use crate::format::AudioFormat;
use crate::sink::Sink;

/// Accepts any format and throws the data away.
#[derive(Debug, Default)]
pub struct NullSink {
    frames_written: u64,
}

impl NullSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn frames_written(&self) -> u64 {
        self.frames_written
    }
}

impl Sink for NullSink {
    fn name(&self) -> &str {
        "null"
    }

    fn initialize(&mut self, _format: &mut AudioFormat, _device: &str) -> AeResult<()> {
        self.frames_written = 0;
        Ok(())
    }

    fn deinitialize(&mut self) {}

    fn add_packets(&mut self, _data: &[u8], frames: usize) -> AeResult<usize> {
        self.frames_written += frames as u64;
        Ok(frames)
    }

    fn delay(&self) -> f32 {
        0.0
    }

    fn drain(&mut self) {}
}
