// src/engine/worker.rs

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use super::metering::MeterState;
use super::mixer;
use super::{Output, Shared, SinkSlot, StreamStage};
use crate::convert::sample;
use crate::error::AeResult;
use crate::format::DataFormat;
use crate::stream::{Packet, StreamFrame};

const REOPEN_RETRY: Duration = Duration::from_secs(1);

/// What one pass of the loop ended with.
enum Step {
    /// A period went to the sink, which now holds `buffered` of audio.
    Written { period: Duration, buffered: Duration },
    /// The stream list no longer fits the open output.
    Restart(String),
    /// No output is open.
    Closed(Duration),
}

/// Buffers reused from period to period.
struct LoopState {
    mix: Vec<f32>,
    bytes: Vec<u8>,
    units: Vec<Vec<u8>>,
    meter: MeterState,
}

pub(super) fn run(shared: Arc<Shared>) {
    log::debug!("mixing thread started");
    let mut state = LoopState {
        mix: Vec::new(),
        bytes: Vec::new(),
        units: Vec::new(),
        meter: MeterState::new(shared.config.sample_rate),
    };
    let mut deadline = Instant::now();
    let mut last_reopen: Option<Instant> = None;

    while shared.running.load(Ordering::Acquire) {
        let period = shared.output.read().period();
        match mix_period(&shared, &mut state) {
            Ok(Step::Written { period, buffered }) => pace(&mut deadline, period, buffered),
            Ok(Step::Restart(reason)) => {
                log::info!("reopening output: {reason}");
                if let Err(e) = shared.reopen() {
                    log::error!("reopen failed: {e}");
                }
                last_reopen = Some(Instant::now());
                deadline = Instant::now();
            }
            Ok(Step::Closed(period)) => {
                if last_reopen.is_none_or(|t| t.elapsed() >= REOPEN_RETRY) {
                    last_reopen = Some(Instant::now());
                    if let Err(e) = shared.reopen() {
                        log::warn!("output still unavailable: {e}");
                    }
                }
                pace(&mut deadline, period, Duration::ZERO);
            }
            Err(e) => {
                log::warn!("mixing period failed: {e}");
                write_silence(&shared);
                pace(&mut deadline, period, Duration::ZERO);
            }
        }
    }
    log::debug!("mixing thread stopped");
}

/// Keeps the loop on its period clock. A sink that already holds a couple of
/// periods paces the loop itself by blocking in `add_packets`.
fn pace(deadline: &mut Instant, period: Duration, buffered: Duration) {
    let now = Instant::now();
    if buffered >= period * 2 {
        *deadline = now;
        return;
    }
    *deadline += period;
    if *deadline > now {
        thread::sleep(*deadline - now);
    } else if now - *deadline > period * 4 {
        // too far behind to catch up
        *deadline = now;
    }
}

fn mix_period(shared: &Shared, st: &mut LoopState) -> AeResult<Step> {
    let out = shared.output.read();
    if !out.open {
        return Ok(Step::Closed(out.period()));
    }
    match out.stage {
        StreamStage::Pcm => mix_pcm(shared, &out, st),
        StreamStage::Raw => pass_raw(shared, &out, st),
    }
}

fn mix_pcm(shared: &Shared, out: &Output, st: &mut LoopState) -> AeResult<Step> {
    let format = &out.mix_format;
    let channels = format.channel_count();
    let frames = format.frames_per_period;
    let sink_delay = f32::from_bits(shared.sink_delay.load(Ordering::Relaxed));

    st.mix.clear();
    st.mix.resize(frames * channels, 0.0);

    {
        let mut streams = shared.streams.lock();
        streams.retain(|s| !s.is_destroyed());
        if streams.iter().any(|s| s.is_raw()) {
            return Ok(Step::Restart("raw stream waiting for passthrough".to_string()));
        }
        for stream in streams.iter() {
            stream.set_sink_delay(sink_delay);
            if let Some(StreamFrame {
                packet: Packet::Pcm(samples),
                gain,
            }) = stream.get_frame()
            {
                mixer::mul_add(&mut st.mix, &samples, gain);
            }
        }
    }

    {
        let mut playing = shared.playing.lock();
        for instance in playing.iter_mut() {
            instance.mix_into(&mut st.mix, shared.config.sound_gain);
        }
        playing.retain(|i| !i.is_finished());
    }

    mixer::normalize(&mut st.mix);
    mixer::finalize(&mut st.mix, out.volume);

    if st.meter.sample_rate() != format.sample_rate {
        st.meter = MeterState::new(format.sample_rate);
    }
    st.meter.process_block(&st.mix, channels, &shared.meters);

    st.bytes.clear();
    sample::from_float(out.final_format, &st.mix, &mut st.bytes)?;

    let mut guard = shared.sink.lock();
    let slot = &mut *guard;
    let frames = if slot.encoder.is_some() {
        transcode(slot, out, st)?
    } else {
        frames
    };
    write_sink(shared, slot, out, &st.bytes, frames)
}

/// Encodes the finalized period and replaces `st.bytes` with one carrier
/// period of packed bursts, or a pause when none is ready yet.
fn transcode(slot: &mut SinkSlot, out: &Output, st: &mut LoopState) -> AeResult<usize> {
    let SinkSlot {
        encoder: Some(encoder),
        packer,
        packed,
        ..
    } = slot
    else {
        return Ok(out.mix_format.frames_per_period);
    };

    st.units.clear();
    encoder.encode(&st.bytes, &mut st.units)?;
    let info = encoder.stream_info();
    for unit in &st.units {
        // failures are logged by the packer and only lose this unit
        if packer.pack(&info, unit).is_ok() && packer.size() > 0 {
            packed.extend(packer.buffer());
        }
    }

    let carrier_bytes = out.sink_format.period_bytes();
    st.bytes.clear();
    if packed.len() >= carrier_bytes {
        st.bytes.extend(packed.drain(..carrier_bytes));
    } else {
        st.bytes.resize(carrier_bytes, 0);
    }
    Ok(out.sink_format.frames_per_period)
}

fn pass_raw(shared: &Shared, out: &Output, st: &mut LoopState) -> AeResult<Step> {
    let sink_delay = f32::from_bits(shared.sink_delay.load(Ordering::Relaxed));
    let frame = {
        let mut streams = shared.streams.lock();
        streams.retain(|s| !s.is_destroyed());
        match streams.first() {
            None => return Ok(Step::Restart("no stream left for passthrough".to_string())),
            Some(s) if !s.is_raw() => {
                return Ok(Step::Restart("pcm stream at the head of the list".to_string()));
            }
            Some(s) if out.raw_source.as_ref() != Some(s.format()) => {
                return Ok(Step::Restart("raw stream with a different format".to_string()));
            }
            Some(s) => {
                s.set_sink_delay(sink_delay);
                s.get_frame()
            }
        }
    };

    st.bytes.clear();
    if let Some(StreamFrame {
        packet: Packet::Raw(bytes),
        ..
    }) = frame
    {
        st.bytes.extend_from_slice(&bytes);
    }
    st.bytes.resize(out.sink_format.period_bytes(), 0);

    let mut guard = shared.sink.lock();
    write_sink(shared, &mut guard, out, &st.bytes, out.sink_format.frames_per_period)
}

fn write_sink(
    shared: &Shared,
    slot: &mut SinkSlot,
    out: &Output,
    bytes: &[u8],
    frames: usize,
) -> AeResult<Step> {
    let Some(sink) = slot.sink.as_mut() else {
        return Ok(Step::Restart("sink went away".to_string()));
    };
    if let Err(e) = sink.add_packets(bytes, frames) {
        return Ok(Step::Restart(format!("sink write failed: {e}")));
    }
    let sink_delay = sink.delay().max(0.0);
    let encoder_delay = slot.encoder.as_ref().map_or(0.0, |e| e.delay());
    shared
        .sink_delay
        .store((sink_delay + encoder_delay).to_bits(), Ordering::Relaxed);
    Ok(Step::Written {
        period: out.period(),
        buffered: Duration::from_secs_f32(sink_delay),
    })
}

/// Keeps the device fed when a period could not be mixed.
fn write_silence(shared: &Shared) {
    let out = shared.output.read();
    if !out.open {
        return;
    }
    let format = &out.sink_format;
    let fill = if format.data_format == DataFormat::U8 { 0x80 } else { 0 };
    let silence = vec![fill; format.period_bytes()];
    if let Some(sink) = shared.sink.lock().sink.as_mut() {
        if let Err(e) = sink.add_packets(&silence, format.frames_per_period) {
            log::warn!("cannot write silence: {e}");
        }
    }
}
