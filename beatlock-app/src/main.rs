//! beatlock - two-deck tempo/phase lock session
//!
//! Plays two synthetic click tracks at different tempos, locks the target
//! deck onto the master and reports how far the beat phase drifts.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Context};
use beatlock_analysis::BeatGrid;
use beatlock_audio::{
    AudioEngine, Config, ControlLoop, DeckId, EngineCommand, EngineEvent,
    EngineState, MasterClock, QualityMode, SourceFeed, SyncMode,
};
use crossbeam_channel::{Receiver, Sender};
use ringbuf::HeapProd;
use tracing_subscriber::EnvFilter;

const MASTER: DeckId = DeckId(0);
const TARGET: DeckId = DeckId(1);

/// Frames rendered per audio block
const BLOCK_FRAMES: usize = 256;

/// Control loop period
const CONTROL_PERIOD: Duration = Duration::from_millis(50);

/// Largest phase drift range (beats) that still counts as a stable lock
const MAX_DRIFT_RANGE: f64 = 0.01;

/// Source ring capacity per deck, in frames
const FEED_FRAMES: usize = 16384;

struct Args {
    duration: Duration,
    config: Option<PathBuf>,
    quality: Option<QualityMode>,
    master_bpm: f64,
    target_bpm: f64,
    offset_beats: f64,
}

impl Args {
    fn parse() -> anyhow::Result<Self> {
        let mut args = Self {
            duration: Duration::from_secs(30),
            config: None,
            quality: None,
            master_bpm: 128.0,
            target_bpm: 127.0,
            offset_beats: 0.2,
        };

        let mut iter = std::env::args().skip(1);
        while let Some(flag) = iter.next() {
            if flag == "-h" || flag == "--help" {
                println!(
                    "usage: beatlock [--duration SECS] [--config PATH] [--quality high_quality|fallback]\n\
                     \x20               [--master-bpm BPM] [--target-bpm BPM] [--offset BEATS]"
                );
                std::process::exit(0);
            }
            let value = iter
                .next()
                .ok_or_else(|| anyhow!("missing value for {flag}"))?;
            match flag.as_str() {
                "--duration" => args.duration = Duration::from_secs_f64(value.parse()?),
                "--config" => args.config = Some(PathBuf::from(value)),
                "--quality" => {
                    args.quality = Some(
                        QualityMode::from_name(&value)
                            .ok_or_else(|| anyhow!("unknown quality mode {value:?}"))?,
                    )
                }
                "--master-bpm" => args.master_bpm = value.parse()?,
                "--target-bpm" => args.target_bpm = value.parse()?,
                "--offset" => args.offset_beats = value.parse()?,
                other => bail!("unknown argument {other:?}"),
            }
        }
        Ok(args)
    }
}

fn main() -> anyhow::Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new("beatlock=info")?,
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let args = Args::parse()?;
    let mut config = match &args.config {
        Some(path) => Config::load_from(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => Config::load()?,
    };
    if let Some(mode) = args.quality {
        config.stretch.quality_mode = mode;
    }
    let sample_rate = config.sample_rate;

    let master_grid = BeatGrid::new(args.master_bpm, 0, sample_rate, 1.0)?;
    // Target's first beat lands `offset` beats late
    let target_first_beat =
        (args.offset_beats.rem_euclid(1.0) * 60.0 / args.target_bpm * sample_rate as f64) as u64;
    let target_grid = BeatGrid::new(args.target_bpm, target_first_beat, sample_rate, 1.0)?;

    // Create audio channels
    let (cmd_tx, cmd_rx, evt_tx, evt_rx) = AudioEngine::create_channels();
    let engine = AudioEngine::new(cmd_tx, evt_rx);
    let shutdown = engine.shutdown_flag();

    let (_clock, driver) = MasterClock::new(args.master_bpm, sample_rate);
    let mut state = EngineState::new(&config, 2, driver)?;
    let handles = state.handles();
    engine.register_decks(&handles);

    let mut producers = Vec::new();
    for id in [MASTER, TARGET] {
        let (producer, consumer) = SourceFeed::channel(FEED_FRAMES);
        state.attach_feed(id, consumer);
        producers.push(producer);
    }

    let control = ControlLoop::new(Arc::clone(state.clock()), &handles, CONTROL_PERIOD);
    let drift = control
        .drift_monitor(TARGET)
        .ok_or_else(|| anyhow!("no drift monitor for deck {TARGET}"))?;

    // Spawn feeder thread
    let feeder = {
        let shutdown = Arc::clone(&shutdown);
        let grids = [master_grid.clone(), target_grid.clone()];
        thread::Builder::new()
            .name("beatlock-feeder".into())
            .spawn(move || run_feeder(producers, grids, shutdown))?
    };

    // Spawn audio thread
    let audio = {
        let shutdown = Arc::clone(&shutdown);
        thread::Builder::new()
            .name("beatlock-audio".into())
            .spawn(move || run_audio_thread(state, cmd_rx, evt_tx, shutdown, sample_rate))?
    };

    let control_handle = control.spawn(Arc::clone(&shutdown))?;

    engine.send(EngineCommand::LoadGrid(MASTER, master_grid));
    engine.send(EngineCommand::LoadGrid(TARGET, target_grid));
    engine.send(EngineCommand::Play(MASTER));
    engine.send(EngineCommand::Play(TARGET));
    engine.send(EngineCommand::EnableSync {
        target: TARGET,
        master: MASTER,
        enabled: true,
    });

    tracing::info!(
        master_bpm = args.master_bpm,
        target_bpm = args.target_bpm,
        offset = args.offset_beats,
        quality = config.stretch.quality_mode.name(),
        seconds = args.duration.as_secs_f64(),
        "session started"
    );

    let result = run_session(&engine, args.duration);

    engine.shutdown();
    let _ = audio.join();
    let _ = control_handle.join();
    let _ = feeder.join();
    result?;

    let final_state = engine
        .sync_state(TARGET)
        .ok_or_else(|| anyhow!("deck {TARGET} not registered"))?;
    let stats = drift.lock().statistics();
    let slope = drift.lock().drift_beats_per_min();

    println!("sync mode:        {:?}", final_state.mode);
    println!("phase offset:     {:+.5} beats", final_state.phase_offset_beats);
    println!("correction:       {:.5}", final_state.tempo_correction_factor);
    println!("tempo ratio:      {:.5}", final_state.tempo_ratio);
    println!("sync quality:     {:.3} ({})", final_state.sync_quality, final_state.grade().label());
    println!(
        "drift window:     {} samples, mean {:+.5}, std {:.5}, range {:.5} beats",
        stats.count, stats.mean, stats.std_dev, stats.range
    );
    println!("drift slope:      {slope:+.6} beats/min");

    if final_state.mode != SyncMode::Locked {
        bail!("lock not held at end of session ({:?})", final_state.mode);
    }
    if stats.count == 0 || stats.range > MAX_DRIFT_RANGE {
        bail!(
            "phase drift range {:.5} beats exceeds {MAX_DRIFT_RANGE}",
            stats.range
        );
    }
    println!("PASS");
    Ok(())
}

/// Wait out the session, logging engine events and the lock once a second
fn run_session(engine: &AudioEngine, duration: Duration) -> anyhow::Result<()> {
    let start = Instant::now();
    let mut last_report = Instant::now();

    while start.elapsed() < duration && !engine.is_shutdown() {
        match engine.event_rx.recv_timeout(Duration::from_millis(100)) {
            Ok(EngineEvent::Error(message)) => tracing::error!(%message, "engine error"),
            Ok(EngineEvent::StretchConfigured { deck, status }) => {
                tracing::info!(%deck, mode = status.active_mode.name(), "stretch reconfigured")
            }
            Ok(EngineEvent::StateUpdate { underruns, .. }) => {
                if underruns.iter().any(|&n| n > 0) {
                    tracing::debug!(?underruns, "source underruns");
                }
            }
            Err(_) => {}
        }

        if last_report.elapsed() >= Duration::from_secs(1) {
            if let Some(state) = engine.sync_state(TARGET) {
                tracing::info!(
                    mode = ?state.mode,
                    offset = state.phase_offset_beats,
                    factor = state.tempo_correction_factor,
                    quality = state.sync_quality,
                    "sync"
                );
            }
            last_report = Instant::now();
        }
    }
    Ok(())
}

/// Render blocks paced against the wall clock
fn run_audio_thread(
    mut state: EngineState,
    cmd_rx: Receiver<EngineCommand>,
    evt_tx: Sender<EngineEvent>,
    shutdown: Arc<AtomicBool>,
    sample_rate: u32,
) {
    let mut output = vec![0.0f32; BLOCK_FRAMES * 2];
    let block_duration = Duration::from_secs_f64(BLOCK_FRAMES as f64 / sample_rate as f64);
    let state_update_interval = Duration::from_millis(33);

    let start = Instant::now();
    let mut blocks: u32 = 0;
    let mut last_state_update = Instant::now();

    while !shutdown.load(Ordering::Relaxed) {
        if state.drain_commands(&cmd_rx, &evt_tx) {
            break;
        }
        state.process(&mut output);
        blocks = blocks.wrapping_add(1);

        // Send state updates periodically
        if last_state_update.elapsed() >= state_update_interval {
            let _ = evt_tx.try_send(state.get_state());
            last_state_update = Instant::now();
        }

        let deadline = start + block_duration * blocks;
        if let Some(wait) = deadline.checked_duration_since(Instant::now()) {
            thread::sleep(wait);
        }
    }
    tracing::info!(underruns = ?state.underruns(), "audio thread stopped");
}

/// Keep each deck's source ring topped up with a click on every beat
fn run_feeder(mut producers: Vec<HeapProd<f32>>, grids: [BeatGrid; 2], shutdown: Arc<AtomicBool>) {
    let mut chunk = vec![0.0f32; 2048];
    let mut positions = [0u64; 2];

    while !shutdown.load(Ordering::Relaxed) {
        for ((producer, grid), position) in producers.iter_mut().zip(&grids).zip(&mut positions) {
            let click_frames = grid.sample_rate as u64 / 100;
            let frames = chunk.len() / 2;
            for i in 0..frames {
                let frame = *position + i as u64;
                let phase = grid.phase_at_position(frame as f64);
                let since_beat = (phase * grid.frames_per_beat()) as u64;
                let s = if since_beat < click_frames { 0.5 } else { 0.0 };
                chunk[2 * i] = s;
                chunk[2 * i + 1] = s;
            }
            let written = SourceFeed::push_frames(producer, &chunk);
            *position += (written / 2) as u64;
        }
        thread::sleep(Duration::from_millis(5));
    }
}
