// src/sink/mod.rs

pub mod output;
pub mod null;
pub mod wav;

pub use output::CpalSink;
pub use null::NullSink;
pub use wav::WavSink;

use crate::error::{AeError, AeResult};
use crate::format::AudioFormat;

/// Output device the engine writes finished periods to.
///
/// `add_packets` may block until the device has room; that is what paces the
/// mixing loop when a real device is attached.
pub trait Sink: Send {
    fn name(&self) -> &str;

    /// Opens the device. `format` is the requested format on entry and what
    /// the device actually accepted on return.
    fn initialize(&mut self, format: &mut AudioFormat, device: &str) -> AeResult<()>;

    fn deinitialize(&mut self);

    /// Writes `frames` frames of `data` in the negotiated format and returns
    /// how many were consumed.
    fn add_packets(&mut self, data: &[u8], frames: usize) -> AeResult<usize>;

    /// Seconds between a frame being written and being heard.
    fn delay(&self) -> f32;

    /// Blocks until everything written has been played.
    fn drain(&mut self);
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeviceInfo {
    /// Device string accepted by [`SinkFactory::open`].
    pub name: String,
    pub display_name: String,
}

/// Opens sinks by device string and lists what can be opened.
pub trait SinkFactory: Send + Sync {
    fn open(&self, device: &str, format: &mut AudioFormat) -> AeResult<Box<dyn Sink>>;

    fn enumerate(&self, passthrough: bool) -> Vec<DeviceInfo>;
}

/// Parsed form of a device string.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeviceSpec<'a> {
    /// `cpal:<name>`; `cpal:default` or `cpal:` pick the host default.
    Cpal(Option<&'a str>),
    /// `wav:<path>`
    Wav(&'a str),
    Null,
}

impl<'a> DeviceSpec<'a> {
    pub fn parse(device: &'a str) -> AeResult<Self> {
        if device == "null" {
            return Ok(DeviceSpec::Null);
        }
        match device.split_once(':') {
            Some(("cpal", "" | "default")) => Ok(DeviceSpec::Cpal(None)),
            Some(("cpal", name)) => Ok(DeviceSpec::Cpal(Some(name))),
            Some(("wav", path)) if !path.is_empty() => Ok(DeviceSpec::Wav(path)),
            _ => Err(AeError::SinkOpen {
                device: device.to_string(),
                reason: "expected cpal:<name>, wav:<path> or null".to_string(),
            }),
        }
    }
}

/// Factory for the built-in sinks.
#[derive(Clone, Copy, Debug, Default)]
pub struct DefaultSinkFactory;

impl SinkFactory for DefaultSinkFactory {
    fn open(&self, device: &str, format: &mut AudioFormat) -> AeResult<Box<dyn Sink>> {
        let mut sink: Box<dyn Sink> = match DeviceSpec::parse(device)? {
            DeviceSpec::Cpal(_) => Box::new(CpalSink::new()),
            DeviceSpec::Wav(_) => Box::new(WavSink::new()),
            DeviceSpec::Null => Box::new(NullSink::new()),
        };
        sink.initialize(format, device)?;
        log::info!("opened {} sink '{device}' as {format}", sink.name());
        Ok(sink)
    }

    fn enumerate(&self, passthrough: bool) -> Vec<DeviceInfo> {
        let mut devices = Vec::new();
        if !passthrough {
            devices.extend(output::enumerate());
        }
        devices.push(DeviceInfo {
            name: "null".to_string(),
            display_name: "Null output".to_string(),
        });
        devices
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::{ChannelLayout, DataFormat, StdLayout};

    #[test]
    fn device_strings() {
        assert_eq!(DeviceSpec::parse("null").unwrap(), DeviceSpec::Null);
        assert_eq!(DeviceSpec::parse("cpal:default").unwrap(), DeviceSpec::Cpal(None));
        assert_eq!(DeviceSpec::parse("cpal:HDMI 1").unwrap(), DeviceSpec::Cpal(Some("HDMI 1")));
        assert_eq!(DeviceSpec::parse("wav:/tmp/a.wav").unwrap(), DeviceSpec::Wav("/tmp/a.wav"));
        assert!(DeviceSpec::parse("wav:").is_err());
        assert!(DeviceSpec::parse("alsa:hw0").is_err());
    }

    #[test]
    fn factory_opens_null_sink() {
        let mut format = AudioFormat::new(
            DataFormat::S16LE,
            48_000,
            ChannelLayout::from_std(StdLayout::Stereo),
            256,
        );
        let mut sink = DefaultSinkFactory.open("null", &mut format).unwrap();
        assert_eq!(sink.name(), "null");
        assert_eq!(sink.add_packets(&[0u8; 1024], 256).unwrap(), 256);
    }

    #[test]
    fn passthrough_enumeration_has_no_cpal_devices() {
        let devices = DefaultSinkFactory.enumerate(true);
        assert!(devices.iter().all(|d| !d.name.starts_with("cpal:")));
        assert!(devices.iter().any(|d| d.name == "null"));
    }
}
