// src/stream/mod.rs

pub mod event;
pub mod fade;

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

pub use event::{EventNotifier, NotifierState, StreamCallback};
use fade::Fade;

use crate::convert::{dsp, sample, RemapMatrix, StreamResampler};
use crate::error::{AeError, AeResult};
use crate::format::AudioFormat;

/// Identifier handed out by the engine.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct StreamId(pub u32);

#[derive(Clone, Copy, Debug, Default)]
pub struct StreamOptions {
    /// Run the resampler even when the rates match, so the ratio can be nudged later.
    pub force_resample: bool,
    pub pause_on_create: bool,
}

/// How much a stream buffers and when it asks its producer for more.
#[derive(Clone, Copy, Debug)]
pub struct Buffering {
    pub buffer_ms: u32,
    /// Fraction of capacity under which the producer callback fires.
    pub water_level: f32,
}

impl Default for Buffering {
    fn default() -> Self {
        Self { buffer_ms: 500, water_level: 0.5 }
    }
}

/// One period worth of stream data, in the engine's format.
#[derive(Clone, Debug, PartialEq)]
pub enum Packet {
    /// Interleaved float samples, `frames_per_period * channels` long.
    Pcm(Vec<f32>),
    /// Opaque passthrough bytes, `frames_per_period * frame_size` long.
    Raw(Vec<u8>),
}

/// A packet plus the gain the mixer should apply to it.
#[derive(Clone, Debug)]
pub struct StreamFrame {
    pub packet: Packet,
    pub gain: f32,
}

enum Pipeline {
    Pcm {
        remap: RemapMatrix,
        resampler: Option<StreamResampler>,
        convert_buf: Vec<f32>,
        remap_buf: Vec<f32>,
    },
    Raw,
}

/// Buffered data lifted out of a stream while it is re-initialised.
enum Carried {
    Pcm(Vec<f32>),
    Raw(Vec<u8>),
}

struct StreamState {
    /// Live internal format: what the packets in `queue` are made of.
    format: AudioFormat,
    pipeline: Pipeline,
    queue: VecDeque<Packet>,
    pending_pcm: Vec<f32>,
    pending_raw: Vec<u8>,
    capacity_frames: usize,
    water_level_frames: usize,
    slack_frames: usize,
    volume: f32,
    replay_gain: f32,
    fade: Fade,
    draining: bool,
    force_resample: bool,
    requested_ratio: Option<f64>,
}

impl StreamState {
    fn ratio(&self) -> f64 {
        match &self.pipeline {
            Pipeline::Pcm { resampler: Some(r), .. } => r.ratio(),
            _ => 1.0,
        }
    }

    fn queued_frames(&self) -> usize {
        self.queue.len() * self.format.frames_per_period
    }

    fn pending_frames(&self) -> usize {
        match &self.pipeline {
            Pipeline::Pcm { resampler, .. } => {
                let channels = self.format.channel_count().max(1);
                let staged = resampler
                    .as_ref()
                    .map(|r| (r.pending_frames() as f64 * r.ratio()).ceil() as usize)
                    .unwrap_or(0);
                self.pending_pcm.len() / channels + staged
            }
            Pipeline::Raw => self.pending_raw.len() / self.format.frame_size.max(1),
        }
    }

    fn buffered_frames(&self) -> usize {
        self.queued_frames() + self.pending_frames()
    }

    /// Free space in frames of the producer's format.
    fn space(&self) -> usize {
        let used = self.buffered_frames() + self.slack_frames;
        let free = self.capacity_frames.saturating_sub(used);
        let ratio = self.ratio();
        if (ratio - 1.0).abs() < f64::EPSILON {
            free
        } else {
            (free as f64 / ratio).floor() as usize
        }
    }

    fn configure_capacity(&mut self, rate: u32, buffering: Buffering) {
        let period = self.format.frames_per_period.max(1);
        self.slack_frames = match &self.pipeline {
            Pipeline::Pcm { resampler: Some(r), .. } => r.output_frames_max() * 2,
            _ => 0,
        };
        let wanted = dsp::frames_for_ms(rate, buffering.buffer_ms).max(self.slack_frames + 2 * period);
        self.capacity_frames = wanted.div_ceil(period) * period;
        self.water_level_frames = (self.capacity_frames as f32 * buffering.water_level) as usize;
    }

    fn packetize(&mut self) {
        match self.pipeline {
            Pipeline::Pcm { .. } => {
                let packet_samples = self.format.frames_per_period * self.format.channel_count();
                if packet_samples == 0 {
                    return;
                }
                while self.pending_pcm.len() >= packet_samples {
                    let rest = self.pending_pcm.split_off(packet_samples);
                    let samples = std::mem::replace(&mut self.pending_pcm, rest);
                    self.queue.push_back(Packet::Pcm(samples));
                }
            }
            Pipeline::Raw => {
                let packet_bytes = self.format.period_bytes();
                if packet_bytes == 0 {
                    return;
                }
                while self.pending_raw.len() >= packet_bytes {
                    let rest = self.pending_raw.split_off(packet_bytes);
                    let bytes = std::mem::replace(&mut self.pending_raw, rest);
                    self.queue.push_back(Packet::Raw(bytes));
                }
            }
        }
    }

    fn push_pcm(&mut self, input: &AudioFormat, bytes: &[u8]) -> AeResult<()> {
        let Pipeline::Pcm { remap, resampler, convert_buf, remap_buf } = &mut self.pipeline else {
            return Err(AeError::UnsupportedFormat(input.data_format));
        };
        convert_buf.clear();
        sample::to_float(input.data_format, bytes, convert_buf)?;
        remap_buf.clear();
        remap.remap_into(convert_buf, remap_buf);
        match resampler {
            Some(r) => {
                r.process(remap_buf, &mut self.pending_pcm)?;
            }
            None => self.pending_pcm.extend_from_slice(remap_buf),
        }
        self.packetize();
        Ok(())
    }

    /// Pushes the resampler tail through and pads the last partial packet
    /// with silence.
    fn finish_pending(&mut self) {
        if let Pipeline::Pcm { resampler: Some(r), .. } = &mut self.pipeline {
            if let Err(e) = r.flush(&mut self.pending_pcm) {
                log::warn!("dropping resampler tail: {e}");
            }
        }
        self.packetize();
        match self.pipeline {
            Pipeline::Pcm { .. } if !self.pending_pcm.is_empty() => {
                let packet_samples = self.format.frames_per_period * self.format.channel_count();
                self.pending_pcm.resize(packet_samples, 0.0);
            }
            Pipeline::Raw if !self.pending_raw.is_empty() => {
                let packet_bytes = self.format.period_bytes();
                self.pending_raw.resize(packet_bytes, 0);
            }
            _ => {}
        }
        self.packetize();
    }

    fn clear(&mut self) {
        self.queue.clear();
        self.pending_pcm.clear();
        self.pending_raw.clear();
        if let Pipeline::Pcm { resampler: Some(r), .. } = &mut self.pipeline {
            r.reset();
        }
    }

    fn take_buffered(&mut self) -> Carried {
        let carried = match self.pipeline {
            Pipeline::Pcm { .. } => {
                let mut samples = Vec::with_capacity(self.buffered_frames() * self.format.channel_count());
                for packet in self.queue.drain(..) {
                    if let Packet::Pcm(s) = packet {
                        samples.extend_from_slice(&s);
                    }
                }
                samples.append(&mut self.pending_pcm);
                Carried::Pcm(samples)
            }
            Pipeline::Raw => {
                let mut bytes = Vec::new();
                for packet in self.queue.drain(..) {
                    if let Packet::Raw(b) = packet {
                        bytes.extend_from_slice(&b);
                    }
                }
                bytes.append(&mut self.pending_raw);
                Carried::Raw(bytes)
            }
        };
        self.clear();
        carried
    }

    /// Puts carried audio back in the live format: remapped, resampled when
    /// the rate changed, and cut to the new capacity.
    fn restore(&mut self, carried: Carried, old_format: &AudioFormat) {
        match carried {
            Carried::Pcm(samples) if !samples.is_empty() => {
                let samples = if old_format.channel_layout == self.format.channel_layout {
                    samples
                } else {
                    match RemapMatrix::new(&old_format.channel_layout, &self.format.channel_layout) {
                        Ok(m) => {
                            let mut remapped = Vec::with_capacity(samples.len());
                            m.remap_into(&samples, &mut remapped);
                            remapped
                        }
                        Err(e) => {
                            log::warn!("discarding buffered audio on re-init: {e}");
                            Vec::new()
                        }
                    }
                };
                self.pending_pcm = match resample_carried(samples, old_format, &self.format) {
                    Ok(s) => s,
                    Err(e) => {
                        log::warn!("discarding buffered audio on re-init: {e}");
                        Vec::new()
                    }
                };
                let max_samples = self.capacity_frames * self.format.channel_count();
                if self.pending_pcm.len() > max_samples {
                    log::debug!(
                        "re-init drops {} frames over capacity",
                        (self.pending_pcm.len() - max_samples) / self.format.channel_count().max(1)
                    );
                    self.pending_pcm.truncate(max_samples);
                }
            }
            Carried::Raw(mut bytes) if !bytes.is_empty() => {
                bytes.truncate(self.capacity_frames * self.format.frame_size);
                self.pending_raw = bytes;
            }
            _ => {}
        }
        self.packetize();
    }
}

/// Converts carried samples, already in the live layout, from the old rate.
fn resample_carried(samples: Vec<f32>, old: &AudioFormat, live: &AudioFormat) -> AeResult<Vec<f32>> {
    if samples.is_empty() || old.sample_rate == live.sample_rate {
        return Ok(samples);
    }
    let mut resampler = StreamResampler::new(old.sample_rate, live.sample_rate, live.channel_count())?;
    let mut out = Vec::with_capacity(
        (samples.len() as f64 * live.sample_rate as f64 / old.sample_rate.max(1) as f64) as usize,
    );
    resampler.process(&samples, &mut out)?;
    resampler.flush(&mut out)?;
    Ok(out)
}

fn build_pipeline(input: &AudioFormat, target: &AudioFormat, force_resample: bool) -> AeResult<Pipeline> {
    if input.is_raw() {
        return Ok(Pipeline::Raw);
    }
    let remap = RemapMatrix::new(&input.channel_layout, &target.channel_layout)?;
    let resampler = StreamResampler::build(
        input.sample_rate,
        target.sample_rate,
        target.channel_count(),
        force_resample,
    )
    .map_err(|e| AeError::StreamInit(e.to_string()))?;
    Ok(Pipeline::Pcm {
        remap,
        resampler,
        convert_buf: Vec::new(),
        remap_buf: Vec::new(),
    })
}

/// A producer-facing audio stream.
///
/// Producers push bytes in the stream's initial format with [`Stream::add_data`];
/// the engine pulls converted, period-sized packets with [`Stream::get_frame`].
pub struct Stream {
    id: StreamId,
    init_format: AudioFormat,
    buffering: Buffering,
    state: Mutex<StreamState>,
    notifier: Mutex<Option<EventNotifier>>,
    valid: AtomicBool,
    paused: AtomicBool,
    deleted: AtomicBool,
    sink_delay: AtomicU32,
}

impl Stream {
    /// Builds a stream converting `format` into `target`. Check
    /// [`Stream::is_valid`]: a stream whose resampler or remap matrix could
    /// not be built is kept around but refuses data.
    pub fn new(
        id: StreamId,
        format: AudioFormat,
        options: StreamOptions,
        target: &AudioFormat,
        buffering: Buffering,
    ) -> Self {
        let state = StreamState {
            format: target.clone(),
            pipeline: Pipeline::Raw,
            queue: VecDeque::new(),
            pending_pcm: Vec::new(),
            pending_raw: Vec::new(),
            capacity_frames: 0,
            water_level_frames: 0,
            slack_frames: 0,
            volume: 1.0,
            replay_gain: 1.0,
            fade: Fade::default(),
            draining: false,
            force_resample: options.force_resample,
            requested_ratio: None,
        };
        let stream = Self {
            id,
            init_format: format,
            buffering,
            state: Mutex::new(state),
            notifier: Mutex::new(None),
            valid: AtomicBool::new(false),
            paused: AtomicBool::new(options.pause_on_create),
            deleted: AtomicBool::new(false),
            sink_delay: AtomicU32::new(0f32.to_bits()),
        };
        if let Err(e) = stream.initialize(target) {
            log::error!("stream {:?} ({}) is unusable: {e}", id, stream.init_format);
        }
        stream
    }

    /// (Re)builds the conversion pipeline for a new engine format. Buffered
    /// audio survives; it is remapped when the channel layout changes.
    pub fn initialize(&self, target: &AudioFormat) -> AeResult<()> {
        let mut st = self.state.lock();
        let pipeline = match build_pipeline(&self.init_format, target, st.force_resample) {
            Ok(p) => p,
            Err(e) => {
                self.valid.store(false, Ordering::Release);
                return Err(e);
            }
        };

        let old_format = st.format.clone();
        let carried = st.take_buffered();

        st.pipeline = pipeline;
        st.format = if self.init_format.is_raw() {
            AudioFormat {
                frames_per_period: target.frames_per_period,
                ..self.init_format.clone()
            }
        } else {
            target.clone()
        };
        if let (Some(ratio), Pipeline::Pcm { resampler: Some(r), .. }) =
            (st.requested_ratio, &mut st.pipeline)
        {
            if let Err(e) = r.set_ratio(ratio) {
                log::warn!("stream {:?}: dropping resample ratio {ratio}: {e}", self.id);
            }
        }
        let rate = if self.init_format.is_raw() {
            self.init_format.sample_rate
        } else {
            target.sample_rate
        };
        st.configure_capacity(rate, self.buffering);
        st.restore(carried, &old_format);

        self.valid.store(true, Ordering::Release);
        Ok(())
    }

    pub fn id(&self) -> StreamId {
        self.id
    }

    pub fn format(&self) -> &AudioFormat {
        &self.init_format
    }

    /// The engine-side format packets are produced in.
    pub fn internal_format(&self) -> AudioFormat {
        self.state.lock().format.clone()
    }

    pub fn is_valid(&self) -> bool {
        self.valid.load(Ordering::Acquire)
    }

    pub fn is_raw(&self) -> bool {
        self.init_format.is_raw()
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    pub fn is_destroyed(&self) -> bool {
        self.deleted.load(Ordering::Acquire)
    }

    /// Free space in frames of the stream's own format.
    pub fn space(&self) -> usize {
        if !self.is_valid() || self.is_destroyed() {
            return 0;
        }
        self.state.lock().space()
    }

    /// Accepts up to [`Stream::space`] frames from `data` and returns how many
    /// were taken. Never blocks; the rest is the caller's to retry.
    pub fn add_data(&self, data: &[u8]) -> usize {
        if !self.is_valid() || self.is_destroyed() {
            return 0;
        }
        let frame_size = self.init_format.frame_size;
        if frame_size == 0 {
            return 0;
        }

        let mut st = self.state.lock();
        let frames = (data.len() / frame_size).min(st.space());
        if frames == 0 {
            return 0;
        }
        let bytes = &data[..frames * frame_size];

        if self.init_format.is_raw() {
            st.pending_raw.extend_from_slice(bytes);
            st.packetize();
        } else if let Err(e) = st.push_pcm(&self.init_format, bytes) {
            log::warn!("stream {:?}: dropping {frames} frames: {e}", self.id);
            return 0;
        }
        st.draining = false;
        frames
    }

    /// Engine side: next packet, or `None` if nothing is ready or the stream
    /// is paused. Wakes the producer when the fill level drops below the
    /// water level.
    pub fn get_frame(&self) -> Option<StreamFrame> {
        if self.is_paused() || self.is_destroyed() {
            return None;
        }

        let (frame, wants_data) = {
            let mut st = self.state.lock();
            let packet = st.queue.pop_front();
            if st.fade.is_running() && (packet.is_some() || st.draining) {
                let period = st.format.frames_per_period;
                st.volume = st.fade.advance(period);
            }
            let gain = st.volume * st.replay_gain;
            let wants_data = !st.draining && st.buffered_frames() < st.water_level_frames;
            (packet.map(|packet| StreamFrame { packet, gain }), wants_data)
        };

        if wants_data {
            self.trigger();
        }
        frame
    }

    pub fn pause(&self) {
        self.paused.store(true, Ordering::Release);
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::Release);
    }

    /// Play out what is buffered, then stop.
    pub fn drain(&self) {
        let mut st = self.state.lock();
        if st.draining {
            return;
        }
        st.finish_pending();
        st.draining = true;
    }

    pub fn is_draining(&self) -> bool {
        self.state.lock().draining
    }

    pub fn is_drained(&self) -> bool {
        let st = self.state.lock();
        st.draining && st.queue.is_empty() && st.pending_frames() == 0 && !st.fade.is_running()
    }

    /// Throws away everything buffered and resets the resampler.
    pub fn flush(&self) {
        let mut st = self.state.lock();
        st.clear();
        st.draining = false;
    }

    pub fn volume(&self) -> f32 {
        self.state.lock().volume
    }

    /// Cancels a running fade.
    pub fn set_volume(&self, volume: f32) {
        let mut st = self.state.lock();
        st.fade = Fade::default();
        st.volume = volume.clamp(0.0, 1.0);
    }

    pub fn replay_gain(&self) -> f32 {
        self.state.lock().replay_gain
    }

    pub fn set_replay_gain(&self, factor: f32) {
        self.state.lock().replay_gain = factor.clamp(-1.0, 1.0);
    }

    /// Linear ramp from `from` to `to` over `duration_ms`, advanced one
    /// period at a time as the engine mixes the stream.
    pub fn fade_volume(&self, from: f32, to: f32, duration_ms: u32) {
        let mut st = self.state.lock();
        let rate = st.format.sample_rate;
        st.fade = Fade::start(from.clamp(0.0, 1.0), to.clamp(0.0, 1.0), duration_ms, rate);
        st.volume = if st.fade.is_running() {
            from.clamp(0.0, 1.0)
        } else {
            st.fade.target()
        };
    }

    pub fn is_fading(&self) -> bool {
        self.state.lock().fade.is_running()
    }

    pub fn resample_ratio(&self) -> f64 {
        self.state.lock().ratio()
    }

    /// Adjusts the conversion ratio (output/input). Builds a resampler when
    /// the stream had none.
    pub fn set_resample_ratio(&self, ratio: f64) -> AeResult<()> {
        if self.is_raw() {
            return Err(AeError::UnsupportedFormat(self.init_format.data_format));
        }
        let mut guard = self.state.lock();
        let st = &mut *guard;
        let (rate, channels) = (st.format.sample_rate, st.format.channel_count());
        let created = match &mut st.pipeline {
            Pipeline::Pcm { resampler, .. } if resampler.is_none() => {
                *resampler = Some(StreamResampler::new(self.init_format.sample_rate, rate, channels)?);
                true
            }
            _ => false,
        };
        if created {
            st.force_resample = true;
            st.configure_capacity(rate, self.buffering);
        }
        if let Pipeline::Pcm { resampler: Some(r), .. } = &mut st.pipeline {
            r.set_ratio(ratio)?;
        }
        st.requested_ratio = Some(ratio);
        Ok(())
    }

    /// Seconds until data added now is heard.
    pub fn delay(&self) -> f32 {
        self.cache_time() + f32::from_bits(self.sink_delay.load(Ordering::Relaxed))
    }

    /// Seconds of audio buffered in the stream.
    pub fn cache_time(&self) -> f32 {
        let st = self.state.lock();
        st.buffered_frames() as f32 / st.format.sample_rate.max(1) as f32
    }

    /// Seconds of audio the stream can hold.
    pub fn cache_total(&self) -> f32 {
        let st = self.state.lock();
        st.capacity_frames as f32 / st.format.sample_rate.max(1) as f32
    }

    pub(crate) fn set_sink_delay(&self, secs: f32) {
        self.sink_delay.store(secs.to_bits(), Ordering::Relaxed);
    }

    /// Installs the producer callback, starting the event thread on first use,
    /// and fires it once so the producer can fill the stream.
    pub fn register_callback<F>(self: &Arc<Self>, callback: F) -> AeResult<()>
    where
        F: Fn(&Stream, usize) + Send + Sync + 'static,
    {
        let callback: StreamCallback = Arc::new(callback);
        {
            let mut slot = self.notifier.lock();
            match slot.as_ref() {
                Some(notifier) => notifier.set_callback(Some(callback)),
                None => {
                    *slot = Some(EventNotifier::spawn(Arc::downgrade(self), Some(callback))?);
                }
            }
        }
        self.trigger();
        Ok(())
    }

    /// Stops the event thread. Safe to call from inside the callback.
    pub fn unregister_callback(&self) {
        let notifier = self.notifier.lock().take();
        drop(notifier);
    }

    /// Wakes the producer callback, if one is registered.
    pub fn trigger(&self) {
        if let Some(notifier) = self.notifier.lock().as_ref() {
            notifier.trigger();
        }
    }

    /// Marks the stream for removal; the mixing loop drops it on its next pass.
    pub(crate) fn destroy(&self) {
        self.deleted.store(true, Ordering::Release);
        self.unregister_callback();
        self.flush();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::{ChannelLayout, DataFormat, StdLayout};
    use approx::assert_relative_eq;

    fn target(rate: u32, layout: StdLayout, frames: usize) -> AudioFormat {
        AudioFormat::new(DataFormat::FloatLE, rate, ChannelLayout::from_std(layout), frames)
    }

    fn s16_stereo(rate: u32) -> AudioFormat {
        AudioFormat::new(DataFormat::S16LE, rate, ChannelLayout::from_std(StdLayout::Stereo), 0)
    }

    fn pcm_stream(rate: u32) -> Stream {
        Stream::new(
            StreamId(1),
            s16_stereo(rate),
            StreamOptions::default(),
            &target(48_000, StdLayout::Stereo, 1000),
            Buffering::default(),
        )
    }

    fn silence(frames: usize, frame_size: usize) -> Vec<u8> {
        vec![0u8; frames * frame_size]
    }

    /// Fills `stream` until exactly `left` frames of space remain.
    fn fill_to_space(stream: &Stream, left: usize) {
        let fs = stream.format().frame_size;
        let space = stream.space();
        assert_eq!(stream.add_data(&silence(space - left, fs)), space - left);
        assert_eq!(stream.space(), left);
    }

    #[test]
    fn capacity_rounds_to_whole_packets() {
        let stream = pcm_stream(48_000);
        assert!(stream.is_valid());
        assert_eq!(stream.space(), 24_000);
        assert_relative_eq!(stream.cache_total(), 0.5);
    }

    #[test]
    fn add_data_is_capped_by_space() {
        let streams: Vec<Stream> = (0..3).map(|_| pcm_stream(48_000)).collect();
        fill_to_space(&streams[0], 100);
        fill_to_space(&streams[1], 0);
        fill_to_space(&streams[2], 50);

        let fs = streams[0].format().frame_size;
        let accepted: Vec<usize> = streams
            .iter()
            .zip([200usize, 10, 10])
            .map(|(s, frames)| s.add_data(&silence(frames, fs)))
            .collect();
        assert_eq!(accepted, vec![100, 0, 10]);
    }

    #[test]
    fn resampled_stream_never_overfills() {
        let stream = pcm_stream(44_100);
        assert!((stream.resample_ratio() - 48_000.0 / 44_100.0).abs() < 1e-9);
        let fs = stream.format().frame_size;
        for _ in 0..200 {
            let before = stream.space();
            let accepted = stream.add_data(&silence(777, fs));
            assert!(accepted <= before);
        }
        let st = stream.state.lock();
        assert!(st.queued_frames() <= st.capacity_frames);
    }

    #[test]
    fn packets_are_converted_to_engine_format() {
        let stream = Stream::new(
            StreamId(2),
            AudioFormat::new(DataFormat::S16LE, 48_000, ChannelLayout::from_std(StdLayout::Mono), 0),
            StreamOptions::default(),
            &target(48_000, StdLayout::Stereo, 4),
            Buffering::default(),
        );
        // 0.5 in S16LE
        let bytes: Vec<u8> = std::iter::repeat([0x00u8, 0x40]).take(4).flatten().collect();
        assert_eq!(stream.add_data(&bytes), 4);
        let frame = stream.get_frame().unwrap();
        assert_eq!(frame.packet, Packet::Pcm(vec![0.5; 8]));
        assert_relative_eq!(frame.gain, 1.0);
        assert!(stream.get_frame().is_none());
    }

    #[test]
    fn paused_stream_keeps_its_data() {
        let stream = pcm_stream(48_000);
        stream.add_data(&silence(2000, 4));
        stream.pause();
        assert!(stream.get_frame().is_none());
        stream.resume();
        assert!(stream.get_frame().is_some());
        assert!(stream.get_frame().is_some());
        assert!(stream.get_frame().is_none());
    }

    #[test]
    fn drain_pads_and_reports_drained() {
        let stream = pcm_stream(48_000);
        stream.add_data(&silence(1500, 4));
        assert!(!stream.is_drained());
        stream.drain();
        assert!(stream.is_draining());
        assert!(stream.get_frame().is_some());
        assert!(stream.get_frame().is_some());
        assert!(stream.is_drained());
    }

    #[test]
    fn flush_discards_everything() {
        let stream = pcm_stream(44_100);
        stream.add_data(&silence(10_000, 4));
        stream.flush();
        assert_relative_eq!(stream.cache_time(), 0.0);
        assert!(stream.get_frame().is_none());
    }

    #[test]
    fn fade_advances_per_pulled_period() {
        let stream = pcm_stream(48_000);
        stream.add_data(&silence(24_000, 4));
        stream.fade_volume(0.0, 1.0, 1000);
        assert!(stream.is_fading());

        let mut last = None;
        for _ in 0..24 {
            last = stream.get_frame();
        }
        // 24 periods of 1000 frames is the midpoint of 48000 frames
        assert_relative_eq!(last.unwrap().gain, 0.5, epsilon = 1e-5);

        stream.add_data(&silence(24_000, 4));
        for _ in 0..23 {
            stream.get_frame();
        }
        assert!(stream.is_fading());
        stream.get_frame();
        assert!(!stream.is_fading());
        assert_relative_eq!(stream.volume(), 1.0);
    }

    #[test]
    fn volume_and_replay_gain_are_clamped() {
        let stream = pcm_stream(48_000);
        stream.set_volume(1.5);
        stream.set_replay_gain(-3.0);
        assert_relative_eq!(stream.volume(), 1.0);
        assert_relative_eq!(stream.replay_gain(), -1.0);
        stream.set_replay_gain(0.5);
        stream.add_data(&silence(1000, 4));
        assert_relative_eq!(stream.get_frame().unwrap().gain, 0.5);
    }

    #[test]
    fn raw_stream_queues_opaque_periods() {
        let raw = AudioFormat::new(DataFormat::Raw, 48_000, ChannelLayout::from_std(StdLayout::Stereo), 0);
        let stream = Stream::new(
            StreamId(3),
            raw,
            StreamOptions::default(),
            &target(48_000, StdLayout::FiveOne, 8),
            Buffering::default(),
        );
        assert!(stream.is_raw());
        let data: Vec<u8> = (0..48).collect();
        assert_eq!(stream.add_data(&data), 12);
        match stream.get_frame().unwrap().packet {
            Packet::Raw(bytes) => assert_eq!(bytes, (0..32).collect::<Vec<u8>>()),
            other => panic!("expected raw packet, got {other:?}"),
        }
        assert!(stream.get_frame().is_none());
    }

    #[test]
    fn invalid_stream_refuses_data() {
        let empty = AudioFormat::new(DataFormat::S16LE, 48_000, ChannelLayout::new(Vec::new()), 0);
        let stream = Stream::new(
            StreamId(4),
            empty,
            StreamOptions::default(),
            &target(48_000, StdLayout::Stereo, 1000),
            Buffering::default(),
        );
        assert!(!stream.is_valid());
        assert_eq!(stream.space(), 0);
        assert_eq!(stream.add_data(&[0u8; 64]), 0);
    }

    #[test]
    fn reinitialize_keeps_buffered_audio() {
        let stream = pcm_stream(48_000);
        stream.add_data(&silence(3000, 4));
        stream
            .initialize(&target(48_000, StdLayout::FiveOne, 500))
            .unwrap();
        assert_eq!(stream.internal_format().channel_count(), 6);
        let mut packets = 0;
        while let Some(frame) = stream.get_frame() {
            match frame.packet {
                Packet::Pcm(s) => assert_eq!(s.len(), 500 * 6),
                Packet::Raw(_) => panic!("pcm stream produced raw data"),
            }
            packets += 1;
        }
        assert_eq!(packets, 6);
    }

    #[test]
    fn reinitialize_resamples_buffered_audio_to_the_new_rate() {
        let stream = pcm_stream(48_000);
        stream.add_data(&silence(4800, 4));
        assert_relative_eq!(stream.cache_time(), 0.1);

        stream.initialize(&target(24_000, StdLayout::Stereo, 1000)).unwrap();
        // 0.1s of audio plus the filter tail, not 4800 frames played at 24kHz
        let cached = stream.cache_time();
        assert!((0.09..0.15).contains(&cached), "cached {cached}s");
    }

    #[test]
    fn reinitialize_never_exceeds_the_new_capacity() {
        let stream = Stream::new(
            StreamId(2),
            s16_stereo(48_000),
            StreamOptions::default(),
            &target(48_000, StdLayout::Stereo, 1024),
            Buffering::default(),
        );
        fill_to_space(&stream, 0);
        assert_eq!(stream.state.lock().buffered_frames(), 24_576);

        stream.initialize(&target(48_000, StdLayout::Stereo, 1000)).unwrap();
        let st = stream.state.lock();
        assert_eq!(st.capacity_frames, 24_000);
        assert_eq!(st.buffered_frames(), 24_000);
        assert_eq!(st.queue.len(), 24);
        drop(st);
        assert_eq!(stream.space(), 0);
    }

    #[test]
    fn resample_ratio_can_be_forced() {
        let stream = pcm_stream(48_000);
        assert_relative_eq!(stream.resample_ratio(), 1.0);
        stream.set_resample_ratio(1.002).unwrap();
        assert!((stream.resample_ratio() - 1.002).abs() < 1e-9);
        assert!(stream.set_resample_ratio(5.0).is_err());
    }
}
