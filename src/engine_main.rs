// src/engine_main.rs

use anyhow::{bail, Context};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

use softae::sound::decode_file;
use softae::{AudioFormat, ChannelLayout, DataFormat, Engine, EngineConfig, Stream, StreamOptions};

use crossterm::{
    event::{self, Event, KeyCode, KeyEventKind},
    terminal::{disable_raw_mode, enable_raw_mode},
};

/// Decoded file being fed to the stream, as FloatLE bytes.
struct Feeder {
    bytes: Vec<u8>,
    pos: usize,
    frame_size: usize,
}

impl Feeder {
    fn feed(&mut self, stream: &Stream, space: usize) {
        if self.pos >= self.bytes.len() {
            stream.drain();
            return;
        }
        let end = (self.pos + space * self.frame_size).min(self.bytes.len());
        let taken = stream.add_data(&self.bytes[self.pos..end]);
        self.pos += taken * self.frame_size;
    }
}

struct Args {
    file: String,
    config: Option<String>,
    effect: Option<String>,
}

fn parse_args() -> anyhow::Result<Args> {
    let mut file = None;
    let mut config = None;
    let mut effect = None;
    let mut it = std::env::args().skip(1);
    while let Some(arg) = it.next() {
        match arg.as_str() {
            "--config" => config = Some(it.next().context("--config needs a path")?),
            "--sound" => effect = Some(it.next().context("--sound needs a path")?),
            _ if file.is_none() => file = Some(arg),
            other => bail!("unexpected argument '{other}'"),
        }
    }
    let Some(file) = file else {
        bail!("usage: engine_player <file> [--config engine.json] [--sound effect.wav]");
    };
    Ok(Args { file, config, effect })
}

fn main() -> Result<(), anyhow::Error> {
    env_logger::init();
    let args = parse_args()?;

    let config = match &args.config {
        Some(path) => EngineConfig::load(path).with_context(|| format!("loading {path}"))?,
        None => EngineConfig::default(),
    };
    let mut engine = Engine::with_default_sinks(config)?;
    engine.initialize().context("opening output")?;

    let (samples, rate, channels) = decode_file(args.file.as_ref())?;
    let format = AudioFormat::new(DataFormat::FloatLE, rate, ChannelLayout::for_count(channels), 0);
    let feeder = Arc::new(Mutex::new(Feeder {
        bytes: samples.iter().flat_map(|s| s.to_le_bytes()).collect(),
        pos: 0,
        frame_size: format.frame_size,
    }));

    let stream = engine.make_stream(format, StreamOptions::default())?;
    let cb_feeder = feeder.clone();
    stream.register_callback(move |s, space| cb_feeder.lock().feed(s, space))?;

    let effect = match &args.effect {
        Some(path) => Some(engine.make_sound(path)?),
        None => None,
    };

    enable_raw_mode()?;
    println!("Engine player: {} -> {}\r", args.file, engine.output_format());
    println!("  SPACE = Pause/Resume   F = Fade out/in   +/- = Volume\r");
    println!("  E     = Sound effect   M = Meters        Q = Quit\r");

    let result = run_input_loop(&engine, &stream, effect.as_ref());
    disable_raw_mode()?;

    stream.unregister_callback();
    engine.free_stream(&stream);
    engine.shutdown();
    result
}

fn run_input_loop(
    engine: &Engine,
    stream: &Arc<Stream>,
    effect: Option<&Arc<softae::Sound>>,
) -> Result<(), anyhow::Error> {
    let mut faded_out = false;
    loop {
        if stream.is_drained() {
            println!("Playback finished\r");
            break;
        }
        if !event::poll(Duration::from_millis(50))? {
            continue;
        }
        let Event::Key(ev) = event::read()? else {
            continue;
        };
        if ev.kind != KeyEventKind::Press {
            continue;
        }

        match ev.code {
            KeyCode::Char('q') | KeyCode::Char('Q') => break,
            KeyCode::Char(' ') => {
                if stream.is_paused() {
                    stream.resume();
                    println!("Resumed\r");
                } else {
                    stream.pause();
                    println!("Paused\r");
                }
            }
            KeyCode::Char('f') | KeyCode::Char('F') => {
                let (from, to) = if faded_out { (0.0, 1.0) } else { (1.0, 0.0) };
                stream.fade_volume(from, to, 2000);
                faded_out = !faded_out;
                println!("Fading {from} -> {to}\r");
            }
            KeyCode::Char('+') => {
                engine.set_volume(engine.volume() + 0.1);
                println!("Volume {:.1}\r", engine.volume());
            }
            KeyCode::Char('-') => {
                engine.set_volume(engine.volume() - 0.1);
                println!("Volume {:.1}\r", engine.volume());
            }
            KeyCode::Char('e') | KeyCode::Char('E') => match effect {
                Some(sound) => engine.play_sound(sound),
                None => println!("No sound effect loaded (use --sound)\r"),
            },
            KeyCode::Char('m') | KeyCode::Char('M') => {
                let meters = engine.output_meters();
                let (l, r) = (meters.left.reading(), meters.right.reading());
                println!(
                    "L peak {:.2} rms {:.2} | R peak {:.2} rms {:.2} | delay {:.0}ms\r",
                    l.hold,
                    l.rms,
                    r.hold,
                    r.rms,
                    stream.delay() * 1000.0
                );
            }
            _ => {}
        }
    }
    Ok(())
}
