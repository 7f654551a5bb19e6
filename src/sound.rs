// src/sound.rs

use anyhow::{anyhow, Context};
use parking_lot::RwLock;
use std::fs::File;
use std::path::Path;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::DecoderOptions;
use symphonia::core::formats::FormatOptions;
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::default::{get_codecs, get_probe};

use crate::convert::{RemapMatrix, StreamResampler};
use crate::error::{AeError, AeResult};
use crate::format::{AudioFormat, ChannelLayout, DataFormat};

/// Decodes the default track of an audio file to interleaved f32.
/// Returns `(samples, sample_rate, channels)`.
pub fn decode_file(path: &Path) -> anyhow::Result<(Vec<f32>, u32, usize)> {
    let file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
    let mss = MediaSourceStream::new(Box::new(file), Default::default());
    let probed = get_probe().format(
        &Default::default(),
        mss,
        &FormatOptions::default(),
        &MetadataOptions::default(),
    )?;
    let mut format = probed.format;
    let track = format
        .default_track()
        .ok_or_else(|| anyhow!("no default audio track"))?;
    let track_id = track.id;
    let codec_params = track.codec_params.clone();

    let mut decoder = get_codecs().make(&codec_params, &DecoderOptions::default())?;
    let mut sample_buf: Option<SampleBuffer<f32>> = None;
    let mut out = Vec::<f32>::new();
    let mut locked: Option<(u32, usize)> = None;

    while let Ok(packet) = format.next_packet() {
        if packet.track_id() != track_id {
            continue;
        }
        let decoded = match decoder.decode(&packet) {
            Ok(d) => d,
            Err(e) => {
                log::debug!("skipping undecodable packet in {}: {e}", path.display());
                continue;
            }
        };
        if decoded.frames() == 0 {
            continue;
        }

        let spec = *decoded.spec();
        let (rate, channels) = *locked.get_or_insert((spec.rate, spec.channels.count()));
        if spec.rate != rate || spec.channels.count() != channels {
            log::warn!("{} changes format mid-stream; stopping there", path.display());
            break;
        }

        if sample_buf.as_ref().is_none_or(|b| b.capacity() < decoded.capacity()) {
            sample_buf = Some(SampleBuffer::<f32>::new(decoded.capacity() as u64, spec));
        }
        let Some(buf) = sample_buf.as_mut() else {
            continue;
        };
        buf.copy_interleaved_ref(decoded);
        out.extend_from_slice(buf.samples());
    }

    let (rate, channels) = locked.ok_or_else(|| anyhow!("no audio decoded"))?;
    log::debug!("decoded {} ({rate}Hz, {channels}ch, {} samples)", path.display(), out.len());
    Ok((out, rate, channels))
}

/// Converts interleaved float audio from `source` into `target` layout and rate.
fn convert(source: &AudioFormat, samples: &[f32], target: &AudioFormat) -> AeResult<Vec<f32>> {
    let remap = RemapMatrix::new(&source.channel_layout, &target.channel_layout)?;
    let mut remapped = Vec::with_capacity(samples.len());
    remap.remap_into(samples, &mut remapped);

    match StreamResampler::build(source.sample_rate, target.sample_rate, target.channel_count(), false)? {
        None => Ok(remapped),
        Some(mut resampler) => {
            let mut out = Vec::new();
            resampler.process(&remapped, &mut out)?;
            resampler.flush(&mut out)?;
            Ok(out)
        }
    }
}

/// A short, fully decoded clip that can be played any number of times at once.
pub struct Sound {
    source: AudioFormat,
    source_samples: Vec<f32>,
    converted: RwLock<Arc<Vec<f32>>>,
    volume: AtomicU32,
    playing: AtomicUsize,
}

impl Sound {
    pub(crate) fn from_samples(
        samples: Vec<f32>,
        sample_rate: u32,
        channels: usize,
        target: &AudioFormat,
    ) -> AeResult<Self> {
        if channels == 0 || sample_rate == 0 {
            return Err(AeError::Decode(format!(
                "sound with {channels} channels at {sample_rate}Hz"
            )));
        }
        let source = AudioFormat::new(
            DataFormat::FloatLE,
            sample_rate,
            ChannelLayout::for_count(channels),
            0,
        );
        let sound = Self {
            source,
            source_samples: samples,
            converted: RwLock::new(Arc::new(Vec::new())),
            volume: AtomicU32::new(1.0f32.to_bits()),
            playing: AtomicUsize::new(0),
        };
        sound.initialize(target)?;
        Ok(sound)
    }

    pub(crate) fn load(path: &Path, target: &AudioFormat) -> AeResult<Self> {
        let (samples, rate, channels) =
            decode_file(path).map_err(|e| AeError::Decode(format!("{e:#}")))?;
        Self::from_samples(samples, rate, channels, target)
    }

    /// Re-converts the clip for a new engine format.
    pub(crate) fn initialize(&self, target: &AudioFormat) -> AeResult<()> {
        if target.is_raw() {
            *self.converted.write() = Arc::new(Vec::new());
            return Ok(());
        }
        let converted = convert(&self.source, &self.source_samples, target)?;
        *self.converted.write() = Arc::new(converted);
        Ok(())
    }

    pub fn source_format(&self) -> &AudioFormat {
        &self.source
    }

    /// Length in seconds.
    pub fn duration(&self) -> f32 {
        let frames = self.source_samples.len() / self.source.channel_count().max(1);
        frames as f32 / self.source.sample_rate as f32
    }

    pub fn volume(&self) -> f32 {
        f32::from_bits(self.volume.load(Ordering::Relaxed))
    }

    pub fn set_volume(&self, volume: f32) {
        self.volume
            .store(volume.clamp(0.0, 1.0).to_bits(), Ordering::Relaxed);
    }

    pub fn is_playing(&self) -> bool {
        self.playing.load(Ordering::Acquire) > 0
    }
}

/// One playback of a [`Sound`], owned by the engine's playing list.
pub struct SoundInstance {
    owner: Arc<Sound>,
    samples: Arc<Vec<f32>>,
    pos: usize,
}

impl SoundInstance {
    pub(crate) fn new(owner: Arc<Sound>) -> Self {
        owner.playing.fetch_add(1, Ordering::AcqRel);
        let samples = owner.converted.read().clone();
        Self {
            owner,
            samples,
            pos: 0,
        }
    }

    pub fn owner(&self) -> &Arc<Sound> {
        &self.owner
    }

    pub fn remaining(&self) -> usize {
        self.samples.len() - self.pos
    }

    pub fn is_finished(&self) -> bool {
        self.remaining() == 0
    }

    /// Adds the next chunk into `out` at `gain` times the sound's volume.
    pub fn mix_into(&mut self, out: &mut [f32], gain: f32) {
        let n = self.remaining().min(out.len());
        let g = gain * self.owner.volume();
        for (o, s) in out[..n].iter_mut().zip(&self.samples[self.pos..self.pos + n]) {
            *o += s * g;
        }
        self.pos += n;
    }
}

impl Drop for SoundInstance {
    fn drop(&mut self) {
        self.owner.playing.fetch_sub(1, Ordering::AcqRel);
    }
}
