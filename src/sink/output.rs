// src/sink/output.rs

use anyhow::{anyhow, Context};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{BufferSize, Device, SampleFormat, SampleRate, SizedSample, StreamConfig};
use ringbuf::traits::{Consumer, Observer, Producer, Split};
use ringbuf::{HeapCons, HeapProd, HeapRb};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::convert::sample;
use crate::error::{AeError, AeResult};
use crate::format::{AudioFormat, ChannelLayout, DataFormat};
use crate::sink::{DeviceInfo, DeviceSpec, Sink};

/// Periods of headroom in the ring between the engine and the device callback.
const RING_PERIODS: usize = 4;
const STALL_TIMEOUT: Duration = Duration::from_secs(1);

struct Opened {
    producer: HeapProd<f32>,
    channels: u16,
    sample_rate: u32,
}

/// Float PCM output through cpal.
///
/// The cpal stream is not `Send`, so it lives on its own thread; the engine
/// side only holds the producer half of the ring the device callback reads.
pub struct CpalSink {
    producer: Option<HeapProd<f32>>,
    worker: Option<JoinHandle<()>>,
    stop: Arc<AtomicBool>,
    failed: Arc<AtomicBool>,
    channels: usize,
    sample_rate: u32,
    scratch: Vec<f32>,
}

impl CpalSink {
    pub fn new() -> Self {
        Self {
            producer: None,
            worker: None,
            stop: Arc::new(AtomicBool::new(false)),
            failed: Arc::new(AtomicBool::new(false)),
            channels: 0,
            sample_rate: 0,
            scratch: Vec::new(),
        }
    }
}

impl Default for CpalSink {
    fn default() -> Self {
        Self::new()
    }
}

/// Every output device the default host reports, plus the host default.
pub fn enumerate() -> Vec<DeviceInfo> {
    let mut devices = vec![DeviceInfo {
        name: "cpal:default".to_string(),
        display_name: "Default output".to_string(),
    }];
    let host = cpal::default_host();
    match host.output_devices() {
        Ok(list) => {
            for device in list {
                if let Ok(name) = device.name() {
                    devices.push(DeviceInfo {
                        name: format!("cpal:{name}"),
                        display_name: name,
                    });
                }
            }
        }
        Err(e) => log::warn!("cannot list output devices: {e}"),
    }
    devices
}

fn find_device(name: Option<&str>) -> anyhow::Result<Device> {
    let host = cpal::default_host();
    match name {
        None => host
            .default_output_device()
            .ok_or_else(|| anyhow!("no default output device")),
        Some(wanted) => host
            .output_devices()?
            .find(|d| d.name().map(|n| n == wanted).unwrap_or(false))
            .ok_or_else(|| anyhow!("no output device named '{wanted}'")),
    }
}

fn build_stream<T>(
    device: &Device,
    config: &StreamConfig,
    mut consumer: HeapCons<f32>,
    failed: Arc<AtomicBool>,
) -> anyhow::Result<cpal::Stream>
where
    T: cpal::Sample + cpal::FromSample<f32> + SizedSample,
{
    let err_fn = move |err: cpal::StreamError| {
        log::error!("output stream error: {err}");
        failed.store(true, Ordering::Release);
    };
    device
        .build_output_stream(
            config,
            move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
                for out in data.iter_mut() {
                    *out = T::from_sample(consumer.try_pop().unwrap_or(0.0));
                }
            },
            err_fn,
            None,
        )
        .map_err(Into::into)
}

fn open_with(
    device: &Device,
    config: &StreamConfig,
    sample_format: SampleFormat,
    period_frames: usize,
    failed: &Arc<AtomicBool>,
) -> anyhow::Result<(cpal::Stream, HeapProd<f32>)> {
    let capacity = period_frames.max(256) * config.channels as usize * RING_PERIODS;
    let (producer, consumer) = HeapRb::<f32>::new(capacity).split();
    let failed = failed.clone();
    let stream = match sample_format {
        SampleFormat::F32 => build_stream::<f32>(device, config, consumer, failed)?,
        SampleFormat::I16 => build_stream::<i16>(device, config, consumer, failed)?,
        SampleFormat::U16 => build_stream::<u16>(device, config, consumer, failed)?,
        SampleFormat::I32 => build_stream::<i32>(device, config, consumer, failed)?,
        other => return Err(anyhow!("unsupported device sample format {other:?}")),
    };
    Ok((stream, producer))
}

/// Body of the worker thread: opens the stream, reports back, then keeps the
/// stream alive until told to stop.
fn run_output(
    device_name: Option<String>,
    requested: StreamConfig,
    period_frames: usize,
    stop: Arc<AtomicBool>,
    failed: Arc<AtomicBool>,
    ready: mpsc::Sender<Result<Opened, String>>,
) {
    let opened = (|| -> anyhow::Result<(cpal::Stream, Opened)> {
        let device = find_device(device_name.as_deref())?;
        let supported = device
            .default_output_config()
            .context("querying default output config")?;
        let sample_format = supported.sample_format();

        let (stream, producer, config) =
            match open_with(&device, &requested, sample_format, period_frames, &failed) {
                Ok((s, p)) => (s, p, requested.clone()),
                Err(e) => {
                    log::warn!("device rejected {requested:?} ({e}); using its default config");
                    let fallback = supported.config();
                    let (s, p) = open_with(&device, &fallback, sample_format, period_frames, &failed)?;
                    (s, p, fallback)
                }
            };
        stream.play().context("starting output stream")?;
        Ok((
            stream,
            Opened {
                producer,
                channels: config.channels,
                sample_rate: config.sample_rate.0,
            },
        ))
    })();

    match opened {
        Ok((stream, opened)) => {
            if ready.send(Ok(opened)).is_err() {
                return;
            }
            while !stop.load(Ordering::Acquire) {
                thread::park_timeout(Duration::from_millis(100));
            }
            drop(stream);
        }
        Err(e) => {
            let _ = ready.send(Err(format!("{e:#}")));
        }
    }
}

impl Sink for CpalSink {
    fn name(&self) -> &str {
        "cpal"
    }

    fn initialize(&mut self, format: &mut AudioFormat, device: &str) -> AeResult<()> {
        if format.is_raw() {
            return Err(AeError::UnsupportedFormat(format.data_format));
        }
        self.deinitialize();

        let device_name = match DeviceSpec::parse(device)? {
            DeviceSpec::Cpal(name) => name.map(str::to_string),
            _ => {
                return Err(AeError::SinkOpen {
                    device: device.to_string(),
                    reason: "not a cpal device".to_string(),
                });
            }
        };
        let requested = StreamConfig {
            channels: format.channel_count() as u16,
            sample_rate: SampleRate(format.sample_rate),
            buffer_size: BufferSize::Default,
        };

        self.stop.store(false, Ordering::Release);
        self.failed.store(false, Ordering::Release);
        let (ready_tx, ready_rx) = mpsc::channel();
        let stop = self.stop.clone();
        let failed = self.failed.clone();
        let period_frames = format.frames_per_period;
        let worker = thread::Builder::new()
            .name("ae-cpal-sink".to_string())
            .spawn(move || run_output(device_name, requested, period_frames, stop, failed, ready_tx))?;

        let opened = ready_rx
            .recv()
            .map_err(|_| "output thread exited".to_string())
            .and_then(|r| r);
        let opened = match opened {
            Ok(o) => o,
            Err(reason) => {
                let _ = worker.join();
                return Err(AeError::SinkOpen {
                    device: device.to_string(),
                    reason,
                });
            }
        };

        let channels = opened.channels as usize;
        let layout = if channels == format.channel_count() {
            format.channel_layout.clone()
        } else {
            ChannelLayout::for_count(channels)
        };
        *format = AudioFormat::new(
            DataFormat::FloatLE,
            opened.sample_rate,
            layout,
            format.frames_per_period,
        );

        self.channels = channels;
        self.sample_rate = opened.sample_rate;
        self.producer = Some(opened.producer);
        self.worker = Some(worker);
        Ok(())
    }

    fn deinitialize(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(worker) = self.worker.take() {
            worker.thread().unpark();
            let _ = worker.join();
        }
        self.producer = None;
    }

    fn add_packets(&mut self, data: &[u8], frames: usize) -> AeResult<usize> {
        let Some(producer) = self.producer.as_mut() else {
            return Err(AeError::NotRunning);
        };
        let len = (frames * self.channels * 4).min(data.len());
        self.scratch.clear();
        sample::to_float(DataFormat::FloatLE, &data[..len], &mut self.scratch)?;

        let mut idx = 0usize;
        let mut last_progress = Instant::now();
        while idx < self.scratch.len() {
            if self.failed.load(Ordering::Acquire) {
                return Err(AeError::SinkWrite("output device failed".to_string()));
            }
            let pushed = producer.push_slice(&self.scratch[idx..]);
            if pushed > 0 {
                idx += pushed;
                last_progress = Instant::now();
            } else if last_progress.elapsed() > STALL_TIMEOUT {
                return Err(AeError::SinkWrite("output device stalled".to_string()));
            } else {
                thread::park_timeout(Duration::from_micros(500));
            }
        }
        Ok(idx / self.channels.max(1))
    }

    fn delay(&self) -> f32 {
        match &self.producer {
            Some(p) if self.sample_rate > 0 && self.channels > 0 => {
                p.occupied_len() as f32 / self.channels as f32 / self.sample_rate as f32
            }
            _ => 0.0,
        }
    }

    fn drain(&mut self) {
        let Some(producer) = self.producer.as_ref() else {
            return;
        };
        let deadline = Instant::now() + Duration::from_secs_f32(self.delay()) + Duration::from_millis(100);
        while !producer.is_empty() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
    }
}

impl Drop for CpalSink {
    fn drop(&mut self) {
        self.deinitialize();
    }
}
