// src/config.rs

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{AeError, AeResult};
use crate::format::{AudioFormat, ChannelLayout, DataFormat, StdLayout};

/// Engine settings. Everything has a default so a partial JSON file is fine.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    /// Device string for PCM output, e.g. `cpal:default`, `wav:/tmp/out.wav`, `null`.
    pub device: String,
    /// Device string used when a raw or transcoded stream is playing.
    pub passthrough_device: String,
    pub channel_layout: StdLayout,
    pub sample_rate: u32,
    pub frames_per_period: usize,
    /// Sample format requested from the PCM sink.
    pub sink_format: DataFormat,
    /// Encode multichannel PCM for passthrough when an encoder is available.
    pub transcode: bool,
    /// Gain applied to sound effects on top of each sound's own volume.
    pub sound_gain: f32,
    /// Capacity of each stream's packet queue.
    pub stream_buffer_ms: u32,
    /// Fraction of the stream capacity under which the producer gets called back.
    pub water_level: f32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            device: "cpal:default".to_string(),
            passthrough_device: "null".to_string(),
            channel_layout: StdLayout::Stereo,
            sample_rate: 48_000,
            frames_per_period: 1024,
            sink_format: DataFormat::FloatLE,
            transcode: false,
            sound_gain: 1.0,
            stream_buffer_ms: 500,
            water_level: 0.5,
        }
    }
}

impl EngineConfig {
    pub fn load(path: impl AsRef<Path>) -> AeResult<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    pub fn from_json_str(text: &str) -> AeResult<Self> {
        let cfg: Self =
            serde_json::from_str(text).map_err(|e| AeError::Config(e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn to_json(&self) -> AeResult<String> {
        serde_json::to_string_pretty(self).map_err(|e| AeError::Config(e.to_string()))
    }

    pub fn validate(&self) -> AeResult<()> {
        if self.sample_rate == 0 {
            return Err(AeError::Config("sample_rate must be non-zero".into()));
        }
        if self.frames_per_period == 0 {
            return Err(AeError::Config("frames_per_period must be non-zero".into()));
        }
        if self.sink_format.is_raw() {
            return Err(AeError::Config(format!(
                "sink_format {:?} is not a PCM format",
                self.sink_format
            )));
        }
        if !(0.0..=1.0).contains(&self.water_level) {
            return Err(AeError::Config("water_level must be within 0..=1".into()));
        }
        if self.stream_buffer_ms == 0 {
            return Err(AeError::Config("stream_buffer_ms must be non-zero".into()));
        }
        Ok(())
    }

    /// PCM format the engine asks the sink for before any negotiation.
    pub fn desired_format(&self) -> AudioFormat {
        AudioFormat::new(
            self.sink_format,
            self.sample_rate,
            ChannelLayout::from_std(self.channel_layout),
            self.frames_per_period,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_json_keeps_defaults() {
        let cfg = EngineConfig::from_json_str(r#"{ "device": "null", "channel_layout": "5.1" }"#)
            .unwrap();
        assert_eq!(cfg.device, "null");
        assert_eq!(cfg.channel_layout, StdLayout::FiveOne);
        assert_eq!(cfg.sample_rate, 48_000);
        assert_eq!(cfg.desired_format().channel_count(), 6);
    }

    #[test]
    fn rejects_raw_sink_format() {
        let err = EngineConfig::from_json_str(r#"{ "sink_format": "Raw" }"#).unwrap_err();
        assert!(matches!(err, AeError::Config(_)));
    }

    #[test]
    fn round_trips_through_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine.json");
        let cfg = EngineConfig {
            transcode: true,
            sound_gain: 0.5,
            ..Default::default()
        };
        std::fs::write(&path, cfg.to_json().unwrap()).unwrap();
        assert_eq!(EngineConfig::load(&path).unwrap(), cfg);
    }
}
