// tests/engine.rs
//
// End-to-end runs of the mixing thread against an in-memory sink.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use softae::bitstream::{StreamInfo, StreamType};
use softae::encoder::{Encoder, EncoderFactory};
use softae::sink::{DeviceInfo, Sink, SinkFactory};
use softae::{
    AeResult, AudioFormat, ChannelLayout, DataFormat, Engine, EngineConfig, StdLayout,
    StreamOptions, StreamStage,
};

#[derive(Default)]
struct CaptureLog {
    opened: Vec<(String, AudioFormat)>,
    written: HashMap<String, Vec<u8>>,
}

struct CaptureSink {
    device: String,
    log: Arc<Mutex<CaptureLog>>,
}

impl Sink for CaptureSink {
    fn name(&self) -> &str {
        "capture"
    }

    fn initialize(&mut self, _format: &mut AudioFormat, _device: &str) -> AeResult<()> {
        Ok(())
    }

    fn deinitialize(&mut self) {}

    fn add_packets(&mut self, data: &[u8], frames: usize) -> AeResult<usize> {
        self.log
            .lock()
            .written
            .entry(self.device.clone())
            .or_default()
            .extend_from_slice(data);
        Ok(frames)
    }

    fn delay(&self) -> f32 {
        0.0
    }

    fn drain(&mut self) {}
}

#[derive(Default)]
struct CaptureFactory {
    log: Arc<Mutex<CaptureLog>>,
}

impl SinkFactory for CaptureFactory {
    fn open(&self, device: &str, format: &mut AudioFormat) -> AeResult<Box<dyn Sink>> {
        self.log.lock().opened.push((device.to_string(), format.clone()));
        Ok(Box::new(CaptureSink {
            device: device.to_string(),
            log: self.log.clone(),
        }))
    }

    fn enumerate(&self, _passthrough: bool) -> Vec<DeviceInfo> {
        vec![DeviceInfo {
            name: "capture:pcm".to_string(),
            display_name: "Capture".to_string(),
        }]
    }
}

fn config() -> EngineConfig {
    EngineConfig {
        device: "capture:pcm".to_string(),
        passthrough_device: "capture:raw".to_string(),
        frames_per_period: 256,
        ..Default::default()
    }
}

fn wait_for(what: &str, mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        std::thread::sleep(Duration::from_millis(5));
    }
}

fn floats(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect()
}

fn float_stereo() -> AudioFormat {
    AudioFormat::new(DataFormat::FloatLE, 48_000, ChannelLayout::from_std(StdLayout::Stereo), 0)
}

fn constant(value: f32, frames: usize) -> Vec<u8> {
    std::iter::repeat_n(value, frames * 2).flat_map(f32::to_le_bytes).collect()
}

fn pcm_written(factory: &CaptureFactory) -> Vec<f32> {
    floats(factory.log.lock().written.get("capture:pcm").map_or(&[][..], |v| v.as_slice()))
}

#[test]
fn stream_reaches_the_sink() {
    let factory = Arc::new(CaptureFactory::default());
    let mut engine = Engine::new(config(), factory.clone(), None).unwrap();
    engine.initialize().unwrap();

    let stream = engine.make_stream(float_stereo(), StreamOptions::default()).unwrap();
    assert_eq!(stream.add_data(&constant(0.25, 4800)), 4800);

    wait_for("mixed samples", || {
        pcm_written(&factory).iter().any(|s| (s - 0.25).abs() < 1e-6)
    });
    engine.shutdown();
}

#[test]
fn summed_streams_are_normalized() {
    let factory = Arc::new(CaptureFactory::default());
    let mut engine = Engine::new(config(), factory.clone(), None).unwrap();
    engine.initialize().unwrap();

    let a = engine.make_stream(float_stereo(), StreamOptions::default()).unwrap();
    let b = engine.make_stream(float_stereo(), StreamOptions::default()).unwrap();
    a.add_data(&constant(0.8, 4800));
    b.add_data(&constant(0.8, 4800));

    wait_for("summed samples", || pcm_written(&factory).iter().any(|s| *s > 0.5));
    engine.shutdown();
    assert!(pcm_written(&factory).iter().all(|s| s.abs() <= 1.0));
}

#[test]
fn engine_volume_scales_the_mix() {
    let factory = Arc::new(CaptureFactory::default());
    let mut engine = Engine::new(config(), factory.clone(), None).unwrap();
    engine.set_volume(0.5);
    engine.initialize().unwrap();

    let stream = engine.make_stream(float_stereo(), StreamOptions::default()).unwrap();
    stream.add_data(&constant(0.5, 4800));

    wait_for("scaled samples", || {
        pcm_written(&factory).iter().any(|s| (s - 0.25).abs() < 1e-6)
    });
    engine.shutdown();
    assert!(pcm_written(&factory).iter().all(|s| *s <= 0.25 + 1e-6));
}

#[test]
fn raw_stream_switches_to_passthrough_and_back() {
    let factory = Arc::new(CaptureFactory::default());
    let mut engine = Engine::new(config(), factory.clone(), None).unwrap();
    engine.initialize().unwrap();
    assert_eq!(engine.stream_stage(), StreamStage::Pcm);

    let raw_format =
        AudioFormat::new(DataFormat::Raw, 48_000, ChannelLayout::from_std(StdLayout::Stereo), 0);
    let raw = engine.make_stream(raw_format, StreamOptions::default()).unwrap();
    assert!(raw.is_raw());
    raw.add_data(&[0xAB; 4096]);

    wait_for("passthrough", || engine.stream_stage() == StreamStage::Raw);
    wait_for("raw bytes", || {
        factory
            .log
            .lock()
            .written
            .get("capture:raw")
            .is_some_and(|v| v.contains(&0xAB))
    });
    assert!(
        factory
            .log
            .lock()
            .opened
            .iter()
            .any(|(dev, f)| dev == "capture:raw" && f.data_format == DataFormat::Raw)
    );

    engine.free_stream(&raw);
    wait_for("pcm again", || engine.stream_stage() == StreamStage::Pcm);
    engine.shutdown();
}

#[test]
fn raw_stream_behind_a_pcm_stream_still_takes_over() {
    let factory = Arc::new(CaptureFactory::default());
    let mut engine = Engine::new(config(), factory.clone(), None).unwrap();
    engine.initialize().unwrap();

    let pcm = engine.make_stream(float_stereo(), StreamOptions::default()).unwrap();
    pcm.add_data(&constant(0.25, 4800));

    let raw_format =
        AudioFormat::new(DataFormat::Raw, 48_000, ChannelLayout::from_std(StdLayout::Stereo), 0);
    let raw = engine.make_stream(raw_format, StreamOptions::default()).unwrap();
    raw.add_data(&[0xAB; 4096]);

    wait_for("passthrough", || engine.stream_stage() == StreamStage::Raw);
    wait_for("raw bytes", || {
        factory
            .log
            .lock()
            .written
            .get("capture:raw")
            .is_some_and(|v| v.contains(&0xAB))
    });
    assert_eq!(engine.stream_count(), 2);

    engine.free_stream(&raw);
    wait_for("pcm again", || engine.stream_stage() == StreamStage::Pcm);
    engine.shutdown();
}

#[test]
fn sound_plays_once() {
    let factory = Arc::new(CaptureFactory::default());
    let mut engine = Engine::new(config(), factory.clone(), None).unwrap();
    engine.initialize().unwrap();

    let sound = engine
        .make_sound_from_samples(vec![0.5; 2 * 512], 48_000, 2)
        .unwrap();
    engine.play_sound(&sound);
    assert!(sound.is_playing());

    wait_for("sound finished", || !sound.is_playing());
    engine.shutdown();

    let written = pcm_written(&factory);
    let hits = written.iter().filter(|s| (*s - 0.5).abs() < 1e-6).count();
    assert_eq!(hits, 2 * 512);
}

#[test]
fn callback_keeps_the_stream_fed() {
    let factory = Arc::new(CaptureFactory::default());
    let mut engine = Engine::new(config(), factory.clone(), None).unwrap();
    engine.initialize().unwrap();

    let stream = engine.make_stream(float_stereo(), StreamOptions::default()).unwrap();
    let fed = Arc::new(Mutex::new(0usize));
    let counter = fed.clone();
    stream
        .register_callback(move |s, space| {
            let taken = s.add_data(&constant(0.1, space.min(2400)));
            *counter.lock() += taken;
        })
        .unwrap();

    // more than the 24000 frame buffer means the callback refilled it
    wait_for("refills", || *fed.lock() > 30_000);
    stream.unregister_callback();
    engine.free_stream(&stream);
    engine.shutdown();
}

/// Emits one fixed AC3-sized unit per encoded period.
struct FakeAc3;

impl Encoder for FakeAc3 {
    fn name(&self) -> &str {
        "fake-ac3"
    }

    fn initialize(&mut self, format: &mut AudioFormat) -> AeResult<()> {
        *format = AudioFormat::new(
            DataFormat::FloatLE,
            48_000,
            ChannelLayout::from_std(StdLayout::FiveOne),
            1536,
        );
        Ok(())
    }

    fn stream_info(&self) -> StreamInfo {
        StreamInfo {
            data_type: StreamType::Ac3,
            output_rate: 48_000,
            output_channels: 2,
            dts_blocks: 0,
        }
    }

    fn encode(&mut self, _pcm: &[u8], units: &mut Vec<Vec<u8>>) -> AeResult<()> {
        units.push(vec![0x0B, 0x77, 1, 2, 3, 4]);
        Ok(())
    }
}

#[test]
fn transcoded_output_carries_ac3_bursts() {
    let factory = Arc::new(CaptureFactory::default());
    let encoders: Arc<dyn EncoderFactory> =
        Arc::new(|| -> AeResult<Box<dyn Encoder>> { Ok(Box::new(FakeAc3)) });
    let cfg = EngineConfig {
        channel_layout: StdLayout::FiveOne,
        transcode: true,
        ..config()
    };
    let mut engine = Engine::new(cfg, factory.clone(), Some(encoders)).unwrap();
    engine.initialize().unwrap();
    assert!(engine.is_transcoding());
    assert_eq!(engine.output_format().data_format, DataFormat::Iec61937);
    assert_eq!(engine.output_format().period_bytes(), 6144);
    assert_eq!(engine.mix_format().channel_count(), 6);

    wait_for("a burst", || {
        factory
            .log
            .lock()
            .written
            .get("capture:raw")
            .is_some_and(|v| v.len() >= 6144)
    });
    engine.shutdown();

    let log = factory.log.lock();
    let burst = &log.written["capture:raw"][..6144];
    assert_eq!(&burst[..4], &[0x72, 0xF8, 0x1F, 0x4E]);
    // Pc = AC3, Pd = 6 bytes in bits
    assert_eq!(&burst[4..8], &[0x01, 0x00, 0x30, 0x00]);
    assert_eq!(&burst[8..10], &[0x77, 0x0B]);
}

#[test]
fn stereo_layout_never_transcodes() {
    let factory = Arc::new(CaptureFactory::default());
    let encoders: Arc<dyn EncoderFactory> =
        Arc::new(|| -> AeResult<Box<dyn Encoder>> { Ok(Box::new(FakeAc3)) });
    let cfg = EngineConfig {
        transcode: true,
        ..config()
    };
    let mut engine = Engine::new(cfg, factory, Some(encoders)).unwrap();
    engine.initialize().unwrap();
    assert!(!engine.is_transcoding());
    assert_eq!(engine.output_format().data_format, DataFormat::FloatLE);
    engine.shutdown();
}
