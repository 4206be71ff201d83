//! `streamer`: command-line front end for the audio-streamer library.
//!
//! ## Modes
//! - `play`: stream a URL (or play a local file) while it downloads into the cache. Reads
//!   simple commands from stdin: `p` pause/resume, `s <ms>` seek, `v <0..1>` volume,
//!   `i`/`r` begin/end an interruption, `q` quit.
//! - `devices`: list output devices.
//! - `cache`: list, clean, clear, remove or promote cached downloads.

mod cli;
mod config;

use std::io::BufRead;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use audio_streamer::output::device;
use audio_streamer::{
    AudioSource, AudioStreamer, CacheStore, CpalOutput, StreamerConfig, StreamerContext,
    StreamerEvent, StreamerStatus, UreqTransport,
};
use clap::Parser;
use crossbeam_channel::Receiver;
use tracing_subscriber::EnvFilter;

const STATUS_INTERVAL: Duration = Duration::from_secs(2);

fn main() -> Result<()> {
    let args = cli::Args::parse();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new("info,audio_streamer=info")
        }))
        .init();

    let mut cfg = config::load(args.config.as_deref())?;
    config::apply_args(&mut cfg, &args);

    match &args.cmd {
        cli::Command::Devices => list_devices(),
        cli::Command::Cache { cmd } => run_cache(&cfg, cmd),
        cli::Command::Play {
            source,
            seek_ms,
            volume,
            device,
            sha256,
            ext,
            ..
        } => {
            let mut source = AudioSource::parse(source);
            if let Some(digest) = sha256 {
                source = source.with_sha256(digest.clone());
            }
            if let Some(ext) = ext {
                source = source.with_extension_hint(ext.clone());
            }
            play(cfg, source, *seek_ms, *volume, device.clone())
        }
    }
}

fn list_devices() -> Result<()> {
    for info in device::list_devices()? {
        println!(
            "{}{} ({}-{} Hz, up to {} ch)",
            if info.default { "* " } else { "  " },
            info.name,
            info.min_rate,
            info.max_rate,
            info.max_channels
        );
    }
    Ok(())
}

fn run_cache(cfg: &StreamerConfig, cmd: &cli::CacheCommand) -> Result<()> {
    let store = CacheStore::open(&cfg.cache)?;
    match cmd {
        cli::CacheCommand::List => {
            println!("{}", serde_json::to_string_pretty(&store.entries())?);
        }
        cli::CacheCommand::Clean => {
            let removed = store.clean_useless()?;
            tracing::info!(removed, "cache cleaned");
        }
        cli::CacheCommand::Clear => {
            let removed = store.remove_all();
            tracing::info!(removed, "cache cleared");
        }
        cli::CacheCommand::Remove { url } => {
            let identity = AudioSource::parse(url).identity();
            if !store.remove(&identity) {
                return Err(anyhow!("{url} is not cached"));
            }
        }
        cli::CacheCommand::Promote { url, to } => {
            store.add_search_path(to.clone());
            let identity = AudioSource::parse(url).identity();
            let dest = store
                .move_to_additional_path(&identity)
                .with_context(|| format!("promote {url}"))?;
            println!("{}", dest.display());
        }
    }
    Ok(())
}

fn play(
    cfg: StreamerConfig,
    source: AudioSource,
    seek_ms: Option<u64>,
    volume: Option<f32>,
    device: Option<String>,
) -> Result<()> {
    let transport = Arc::new(UreqTransport::new(&cfg.transport));
    let output = Arc::new(CpalOutput::new(device));
    let ctx = StreamerContext::new(cfg, transport, output)?;
    if let Some(v) = volume {
        ctx.settings.set_volume(v);
    }

    let streamer = AudioStreamer::new(source, &ctx)?;
    let events = streamer.subscribe();
    if let Some(ms) = seek_ms {
        streamer.seek(ms);
    }
    streamer.play();

    let (quit_tx, quit_rx) = crossbeam_channel::bounded::<()>(1);
    let _ = ctrlc::set_handler(move || {
        let _ = quit_tx.try_send(());
    });
    let commands = spawn_stdin_reader();

    let result = drive(&streamer, &events, &quit_rx, &commands);
    let snapshot = streamer.snapshot();
    tracing::info!(
        status = ?snapshot.status,
        time_ms = snapshot.current_time_ms,
        underruns = snapshot.underrun_events,
        "playback ended"
    );
    result
}

/// Forward stdin lines to the control loop.
fn spawn_stdin_reader() -> Receiver<String> {
    let (tx, rx) = crossbeam_channel::unbounded();
    std::thread::spawn(move || {
        let stdin = std::io::stdin();
        for line in stdin.lock().lines() {
            let Ok(line) = line else { break };
            if tx.send(line).is_err() {
                break;
            }
        }
    });
    rx
}

fn drive(
    streamer: &AudioStreamer,
    events: &Receiver<StreamerEvent>,
    quit: &Receiver<()>,
    commands: &Receiver<String>,
) -> Result<()> {
    let ticker = crossbeam_channel::tick(STATUS_INTERVAL);
    let mut stdin_open = true;
    let closed = crossbeam_channel::never::<String>();
    loop {
        let commands_rx = if stdin_open { commands } else { &closed };
        crossbeam_channel::select! {
            recv(quit) -> _ => {
                tracing::info!("interrupted; stopping");
                streamer.stop();
                return Ok(());
            },
            recv(events) -> event => match event {
                Ok(StreamerEvent::StatusChanged { status: StreamerStatus::Finished }) => return Ok(()),
                Ok(StreamerEvent::Error { error }) => return Err(error.into()),
                Ok(StreamerEvent::DurationChanged { duration_ms }) => {
                    tracing::info!(duration_ms, "duration");
                }
                Ok(_) => {}
                Err(_) => return Err(anyhow!("streamer went away")),
            },
            recv(commands_rx) -> line => match line {
                Ok(line) => {
                    if !handle_line(streamer, line.trim()) {
                        streamer.stop();
                        return Ok(());
                    }
                }
                Err(_) => stdin_open = false,
            },
            recv(ticker) -> _ => {
                let s = streamer.snapshot();
                tracing::info!(
                    status = ?s.status,
                    time_ms = s.current_time_ms,
                    duration_ms = ?s.duration_ms,
                    buffering = s.buffering_ratio,
                    received = s.received_length,
                    expected = ?s.expected_length,
                    speed_bps = s.download_speed,
                    "status"
                );
            },
        }
    }
}

/// Apply one stdin command. Returns `false` to quit.
fn handle_line(streamer: &AudioStreamer, line: &str) -> bool {
    let mut parts = line.split_whitespace();
    match (parts.next(), parts.next()) {
        (Some("q"), _) => return false,
        (Some("p"), _) => match streamer.status() {
            StreamerStatus::Paused | StreamerStatus::Idle | StreamerStatus::Finished => {
                streamer.play()
            }
            _ => streamer.pause(),
        },
        (Some("s"), Some(ms)) => match ms.parse::<u64>() {
            Ok(ms) => streamer.seek(ms),
            Err(_) => tracing::warn!(input = ms, "seek expects milliseconds"),
        },
        (Some("v"), Some(v)) => match v.parse::<f32>() {
            Ok(v) => streamer.set_volume(v),
            Err(_) => tracing::warn!(input = v, "volume expects a number in [0, 1]"),
        },
        (Some("i"), _) => streamer.begin_interruption(),
        (Some("r"), _) => streamer.end_interruption(),
        (None, _) => {}
        (Some(other), _) => tracing::warn!(command = other, "unknown command"),
    }
    true
}
