// src/engine/mod.rs

pub mod metering;
pub mod mixer;
mod worker;

pub use metering::{ChannelMeter, MeterReading, OutputMeters};

use parking_lot::{Mutex, RwLock};
use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::bitstream::BitstreamPacker;
use crate::config::EngineConfig;
use crate::encoder::{Encoder, EncoderFactory};
use crate::error::{AeError, AeResult};
use crate::format::{AudioFormat, ChannelLayout, DataFormat, StdLayout};
use crate::sink::{DefaultSinkFactory, DeviceInfo, Sink, SinkFactory};
use crate::sound::{Sound, SoundInstance};
use crate::stream::{Buffering, Stream, StreamId, StreamOptions};

/// Which stream stage the mixing loop runs.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamStage {
    /// Mix every PCM stream and the playing sounds.
    Pcm,
    /// Pass the head raw stream straight through to the sink.
    Raw,
}

/// Output configuration. The mixing loop holds it shared for a whole
/// period; reopening and volume changes take it exclusively.
struct Output {
    open: bool,
    stage: StreamStage,
    /// Float format PCM streams and sounds are converted into.
    mix_format: AudioFormat,
    /// Sample format the final mix is converted to before the sink or encoder.
    final_format: DataFormat,
    /// What the sink accepted.
    sink_format: AudioFormat,
    transcoding: bool,
    /// Format of the raw stream the passthrough sink was opened for.
    raw_source: Option<AudioFormat>,
    volume: f32,
}

impl Output {
    fn period(&self) -> Duration {
        match self.stage {
            StreamStage::Pcm => self.mix_format.period_duration(),
            StreamStage::Raw => self.sink_format.period_duration(),
        }
    }
}

/// Everything that talks to the device. Only the mixing loop and reopen
/// touch it.
struct SinkSlot {
    sink: Option<Box<dyn Sink>>,
    encoder: Option<Box<dyn Encoder>>,
    packer: BitstreamPacker,
    /// Packed bursts waiting for their carrier period.
    packed: VecDeque<u8>,
}

impl SinkSlot {
    fn close(&mut self) {
        if let Some(mut sink) = self.sink.take() {
            sink.drain();
            sink.deinitialize();
            log::info!("closed {} sink", sink.name());
        }
        if let Some(mut encoder) = self.encoder.take() {
            encoder.reset();
        }
        self.packer = BitstreamPacker::new();
        self.packed.clear();
    }
}

/// State shared between the engine handle and the mixing thread.
///
/// Lock order: `output` → `sink` → `streams` → `sounds` → `playing`.
struct Shared {
    config: EngineConfig,
    sink_factory: Arc<dyn SinkFactory>,
    encoder_factory: Option<Arc<dyn EncoderFactory>>,
    output: RwLock<Output>,
    sink: Mutex<SinkSlot>,
    streams: Mutex<Vec<Arc<Stream>>>,
    sounds: Mutex<Vec<Arc<Sound>>>,
    playing: Mutex<Vec<SoundInstance>>,
    running: AtomicBool,
    sink_delay: AtomicU32,
    next_stream_id: AtomicU32,
    meters: Arc<OutputMeters>,
}

fn float_format(format: &AudioFormat) -> AudioFormat {
    AudioFormat::new(
        DataFormat::FloatLE,
        format.sample_rate,
        format.channel_layout.clone(),
        format.frames_per_period,
    )
}

impl Shared {
    fn buffering(&self) -> Buffering {
        Buffering {
            buffer_ms: self.config.stream_buffer_ms,
            water_level: self.config.water_level,
        }
    }

    /// Internal format a stream of `format` is converted into.
    fn stream_target(&self, out: &Output, format: &AudioFormat) -> AudioFormat {
        if format.is_raw() {
            AudioFormat {
                frames_per_period: self.config.frames_per_period,
                ..format.clone()
            }
        } else {
            out.mix_format.clone()
        }
    }

    /// Closes whatever is open and opens the output the current stream list
    /// calls for. Buffered stream data survives.
    fn reopen(&self) -> AeResult<()> {
        let mut out = self.output.write();
        let mut slot = self.sink.lock();
        slot.close();
        out.open = false;

        let raw_head = self
            .streams
            .lock()
            .iter()
            .find(|s| s.is_raw() && !s.is_destroyed())
            .map(|s| s.format().clone());

        let opened = match &raw_head {
            Some(raw) => self.open_passthrough(&mut out, &mut slot, raw),
            None => self.open_pcm(&mut out, &mut slot),
        };
        if let Err(e) = opened {
            log::error!("cannot open output: {e}");
            return Err(e);
        }
        out.open = true;
        self.meters.reset();

        for stream in self.streams.lock().iter() {
            if !stream.is_raw() && out.stage == StreamStage::Raw {
                continue;
            }
            let target = self.stream_target(&out, stream.format());
            if let Err(e) = stream.initialize(&target) {
                log::warn!("stream {:?} unusable after reopen: {e}", stream.id());
            }
        }

        if out.stage == StreamStage::Pcm {
            for sound in self.sounds.lock().iter() {
                if let Err(e) = sound.initialize(&out.mix_format) {
                    log::warn!("cannot convert sound for {}: {e}", out.mix_format);
                }
            }
            // instances still point at samples in the old format
            self.playing.lock().clear();
        }
        Ok(())
    }

    fn open_pcm(&self, out: &mut Output, slot: &mut SinkSlot) -> AeResult<()> {
        let desired = self.config.desired_format();
        if self.config.transcode && desired.channel_count() > 2 {
            if let Some(factory) = &self.encoder_factory {
                match self.open_transcode(out, slot, factory.as_ref(), &desired) {
                    Ok(()) => return Ok(()),
                    Err(e) => log::warn!("transcoding unavailable, using PCM output: {e}"),
                }
            }
        }

        let mut format = desired;
        let sink = self.sink_factory.open(&self.config.device, &mut format)?;
        if format.is_raw() {
            return Err(AeError::UnsupportedFormat(format.data_format));
        }
        out.mix_format = float_format(&format);
        out.final_format = format.data_format;
        out.sink_format = format;
        out.stage = StreamStage::Pcm;
        out.transcoding = false;
        out.raw_source = None;
        slot.sink = Some(sink);
        Ok(())
    }

    fn open_transcode(
        &self,
        out: &mut Output,
        slot: &mut SinkSlot,
        factory: &dyn EncoderFactory,
        desired: &AudioFormat,
    ) -> AeResult<()> {
        let mut encoder = factory.create()?;
        let mut input = desired.clone();
        encoder.initialize(&mut input)?;
        if input.is_raw() || input.sample_rate == 0 {
            return Err(AeError::Encoder(format!(
                "{} asked for unusable input {input}",
                encoder.name()
            )));
        }
        let info = encoder.stream_info();

        // one carrier period lasts as long as one mixed period
        let frames = input.frames_per_period as u64 * info.output_rate as u64 / input.sample_rate as u64;
        let mut carrier = AudioFormat::new(
            DataFormat::Iec61937,
            info.output_rate,
            ChannelLayout::from_std(StdLayout::Stereo),
            (frames as usize).max(1),
        );
        let sink = self
            .sink_factory
            .open(&self.config.passthrough_device, &mut carrier)?;

        log::info!(
            "transcoding {} to {:?} through {}",
            input,
            info.data_type,
            encoder.name()
        );
        out.mix_format = float_format(&input);
        out.final_format = input.data_format;
        out.sink_format = carrier;
        out.stage = StreamStage::Pcm;
        out.transcoding = true;
        out.raw_source = None;
        slot.sink = Some(sink);
        slot.encoder = Some(encoder);
        Ok(())
    }

    fn open_passthrough(
        &self,
        out: &mut Output,
        slot: &mut SinkSlot,
        raw: &AudioFormat,
    ) -> AeResult<()> {
        let mut format = AudioFormat {
            frames_per_period: self.config.frames_per_period,
            ..raw.clone()
        };
        let sink = self
            .sink_factory
            .open(&self.config.passthrough_device, &mut format)?;
        out.sink_format = format;
        out.stage = StreamStage::Raw;
        out.transcoding = false;
        out.raw_source = Some(raw.clone());
        slot.sink = Some(sink);
        Ok(())
    }
}

/// The software mixing engine.
///
/// Owns the sink, the mixing thread, every stream and every sound. Producers
/// get `Arc<Stream>` handles from [`Engine::make_stream`] and feed them from
/// any thread.
pub struct Engine {
    shared: Arc<Shared>,
    worker: Option<JoinHandle<()>>,
}

impl Engine {
    pub fn new(
        config: EngineConfig,
        sink_factory: Arc<dyn SinkFactory>,
        encoder_factory: Option<Arc<dyn EncoderFactory>>,
    ) -> AeResult<Self> {
        config.validate()?;
        let desired = config.desired_format();
        let output = Output {
            open: false,
            stage: StreamStage::Pcm,
            mix_format: float_format(&desired),
            final_format: desired.data_format,
            sink_format: desired,
            transcoding: false,
            raw_source: None,
            volume: 1.0,
        };
        let shared = Shared {
            config,
            sink_factory,
            encoder_factory,
            output: RwLock::new(output),
            sink: Mutex::new(SinkSlot {
                sink: None,
                encoder: None,
                packer: BitstreamPacker::new(),
                packed: VecDeque::new(),
            }),
            streams: Mutex::new(Vec::new()),
            sounds: Mutex::new(Vec::new()),
            playing: Mutex::new(Vec::new()),
            running: AtomicBool::new(false),
            sink_delay: AtomicU32::new(0f32.to_bits()),
            next_stream_id: AtomicU32::new(1),
            meters: OutputMeters::new(),
        };
        Ok(Self {
            shared: Arc::new(shared),
            worker: None,
        })
    }

    /// Engine on the built-in cpal/wav/null sinks, without transcoding.
    pub fn with_default_sinks(config: EngineConfig) -> AeResult<Self> {
        Self::new(config, Arc::new(DefaultSinkFactory), None)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.shared.config
    }

    /// Opens the output and starts the mixing thread. On error nothing is
    /// running and streams keep whatever they buffered.
    pub fn initialize(&mut self) -> AeResult<()> {
        if self.worker.is_some() {
            return Ok(());
        }
        self.shared.reopen()?;
        self.shared.running.store(true, Ordering::Release);
        let shared = self.shared.clone();
        let worker = thread::Builder::new()
            .name("ae-mixer".to_string())
            .spawn(move || worker::run(shared));
        match worker {
            Ok(handle) => {
                self.worker = Some(handle);
                log::info!("engine running on {}", self.output_format());
                Ok(())
            }
            Err(e) => {
                self.shared.running.store(false, Ordering::Release);
                self.shared.sink.lock().close();
                Err(AeError::Io(e))
            }
        }
    }

    /// Stops the mixing thread and closes the sink.
    pub fn shutdown(&mut self) {
        self.shared.running.store(false, Ordering::Release);
        let Some(worker) = self.worker.take() else {
            return;
        };
        if worker.join().is_err() {
            log::error!("mixing thread panicked");
        }
        let mut out = self.shared.output.write();
        self.shared.sink.lock().close();
        out.open = false;
        log::info!("engine stopped");
    }

    pub fn is_running(&self) -> bool {
        self.worker.is_some() && self.shared.running.load(Ordering::Acquire)
    }

    /// What the sink was opened with.
    pub fn output_format(&self) -> AudioFormat {
        self.shared.output.read().sink_format.clone()
    }

    /// Float format PCM streams are mixed in.
    pub fn mix_format(&self) -> AudioFormat {
        self.shared.output.read().mix_format.clone()
    }

    pub fn stream_stage(&self) -> StreamStage {
        self.shared.output.read().stage
    }

    pub fn is_transcoding(&self) -> bool {
        self.shared.output.read().transcoding
    }

    /// Creates a stream producers push `format` data into. A raw stream goes
    /// to the head of the list, which makes the mixing loop reopen the output
    /// for passthrough.
    pub fn make_stream(&self, format: AudioFormat, options: StreamOptions) -> AeResult<Arc<Stream>> {
        let out = self.shared.output.read();
        let target = self.shared.stream_target(&out, &format);
        let id = StreamId(self.shared.next_stream_id.fetch_add(1, Ordering::Relaxed));
        let stream = Arc::new(Stream::new(id, format, options, &target, self.shared.buffering()));
        if !stream.is_valid() {
            return Err(AeError::StreamInit(format!(
                "cannot convert {} to {}",
                stream.format(),
                target
            )));
        }
        {
            let mut streams = self.shared.streams.lock();
            // the newest raw stream takes over the output
            if stream.is_raw() {
                streams.insert(0, stream.clone());
            } else {
                streams.push(stream.clone());
            }
        }
        log::info!("created stream {:?}: {}", id, stream.format());
        Ok(stream)
    }

    /// Detaches a stream. Its handle stays usable but is never mixed again.
    pub fn free_stream(&self, stream: &Arc<Stream>) {
        stream.destroy();
        self.shared.streams.lock().retain(|s| !Arc::ptr_eq(s, stream));
        log::info!("freed stream {:?}", stream.id());
    }

    pub fn stream_count(&self) -> usize {
        self.shared.streams.lock().len()
    }

    /// Decodes an audio file into a sound in the current mix format.
    pub fn make_sound(&self, path: impl AsRef<Path>) -> AeResult<Arc<Sound>> {
        let target = self.shared.output.read().mix_format.clone();
        let sound = Arc::new(Sound::load(path.as_ref(), &target)?);
        self.shared.sounds.lock().push(sound.clone());
        log::debug!("loaded sound {}", path.as_ref().display());
        Ok(sound)
    }

    /// Builds a sound from interleaved float samples.
    pub fn make_sound_from_samples(
        &self,
        samples: Vec<f32>,
        sample_rate: u32,
        channels: usize,
    ) -> AeResult<Arc<Sound>> {
        let target = self.shared.output.read().mix_format.clone();
        let sound = Arc::new(Sound::from_samples(samples, sample_rate, channels, &target)?);
        self.shared.sounds.lock().push(sound.clone());
        Ok(sound)
    }

    pub fn play_sound(&self, sound: &Arc<Sound>) {
        self.shared.playing.lock().push(SoundInstance::new(sound.clone()));
    }

    /// Stops every playing instance of `sound`.
    pub fn stop_sound(&self, sound: &Arc<Sound>) {
        self.shared
            .playing
            .lock()
            .retain(|inst| !Arc::ptr_eq(inst.owner(), sound));
    }

    pub fn free_sound(&self, sound: &Arc<Sound>) {
        self.stop_sound(sound);
        self.shared.sounds.lock().retain(|s| !Arc::ptr_eq(s, sound));
    }

    /// Drops sounds that only the engine still references and that are not
    /// playing.
    pub fn garbage_collect(&self) {
        let mut sounds = self.shared.sounds.lock();
        let before = sounds.len();
        sounds.retain(|s| Arc::strong_count(s) > 1 || s.is_playing());
        if sounds.len() != before {
            log::debug!("collected {} unused sounds", before - sounds.len());
        }
    }

    pub fn sound_count(&self) -> usize {
        self.shared.sounds.lock().len()
    }

    pub fn set_volume(&self, volume: f32) {
        self.shared.output.write().volume = volume.clamp(0.0, 1.0);
    }

    pub fn volume(&self) -> f32 {
        self.shared.output.read().volume
    }

    /// Seconds of audio between the end of the mix and the speaker.
    pub fn delay(&self) -> f32 {
        f32::from_bits(self.shared.sink_delay.load(Ordering::Relaxed))
    }

    pub fn enumerate_output_devices(&self, passthrough: bool) -> Vec<DeviceInfo> {
        self.shared.sink_factory.enumerate(passthrough)
    }

    pub fn output_meters(&self) -> Arc<OutputMeters> {
        self.shared.meters.clone()
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.shutdown();
    }
}
