//! Audio engine - orchestrates decks, the master clock and the sync loops
//!
//! Three kinds of threads meet here:
//! - the audio thread owns `EngineState` and renders blocks
//! - the control thread runs `ControlLoop`, stepping every sync pair
//! - the UI/main thread talks to the audio thread through `AudioEngine`
//!
//! Source audio reaches each deck through a lock-free SPSC ring
//! (`SourceFeed`), deck positions reach the control thread through
//! `DeckProbe`s, and sync state reaches the audio thread as published
//! snapshots. Nothing on the audio path takes a lock.

use crate::clock::{ClockDriver, ClockSnapshot, MasterClock};
use crate::config::{Config, ConfigError};
use crate::deck::{Deck, DeckProbe, DeckState, PlaybackState};
use crate::sync::{DeckId, SyncMode, SyncState, TempoPhaseSync};
use crate::timestretcher::{QualityMode, StretchStatus, TimeStretchEngine};
use beatlock_analysis::{BeatGrid, DriftMonitor};
use crossbeam_channel::{bounded, Receiver, Sender};
use parking_lot::Mutex;
use ringbuf::traits::{Consumer, Observer, Producer, Split};
use ringbuf::{HeapCons, HeapProd, HeapRb};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Commands sent to the audio thread
#[derive(Debug, Clone)]
pub enum EngineCommand {
    LoadGrid(DeckId, BeatGrid),
    Play(DeckId),
    Pause(DeckId),
    Stop(DeckId),
    /// Jump to a source frame
    Seek(DeckId, u64),
    SetTempo(DeckId, f64),
    EnableSync {
        target: DeckId,
        master: DeckId,
        enabled: bool,
    },
    ConfigureStretch {
        deck: DeckId,
        mode: QualityMode,
        block_size: usize,
    },
    Shutdown,
}

/// Events sent from the audio thread
#[derive(Debug, Clone)]
pub enum EngineEvent {
    /// State update for UI rendering
    StateUpdate {
        decks: Vec<DeckState>,
        underruns: Vec<u64>,
        clock: ClockSnapshot,
    },
    StretchConfigured {
        deck: DeckId,
        status: StretchStatus,
    },
    Error(String),
}

/// Interleaved stereo samples kept buffered in each deck's stretcher
const TARGET_BUFFERED_FRAMES: usize = 8192;

/// Scratch size for moving samples out of a feed
const FEED_CHUNK: usize = 4096;

/// Producer and consumer ends of a deck's source ring
pub struct SourceFeed;

impl SourceFeed {
    /// Create a ring holding `capacity_frames` stereo frames
    pub fn channel(capacity_frames: usize) -> (HeapProd<f32>, HeapCons<f32>) {
        HeapRb::<f32>::new(capacity_frames.max(1) * 2).split()
    }

    /// Push whole frames only; returns samples written
    pub fn push_frames(producer: &mut HeapProd<f32>, samples: &[f32]) -> usize {
        let whole = producer.vacant_len().min(samples.len()) & !1;
        producer.push_slice(&samples[..whole])
    }
}

/// Lock-free view of one deck for other threads
#[derive(Clone)]
pub struct DeckHandle {
    pub id: DeckId,
    pub sync: Arc<TempoPhaseSync>,
    pub probe: Arc<DeckProbe>,
}

/// Audio engine state (held in audio thread)
pub struct EngineState {
    decks: Vec<Deck>,
    feeds: Vec<Option<HeapCons<f32>>>,
    underruns: Vec<u64>,
    driver: ClockDriver,
    // Pre-allocated processing buffers (avoids allocation in audio callback)
    render_buffer: Vec<f32>,
    feed_buffer: Vec<f32>,
}

impl EngineState {
    /// Create `deck_count` decks, each with its own stretcher and sync loop
    pub fn new(
        config: &Config,
        deck_count: usize,
        driver: ClockDriver,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let clock = Arc::clone(driver.clock());

        let mut decks = Vec::with_capacity(deck_count);
        for i in 0..deck_count {
            let id = DeckId(i as u8);
            let stretcher = TimeStretchEngine::from_config(&config.stretch)?;
            let mut deck = Deck::new(id, config.sample_rate, stretcher);
            let sync = TempoPhaseSync::with_config(Arc::clone(&clock), config.sync.clone())?;
            deck.attach_sync(Arc::new(sync));
            decks.push(deck);
        }

        Ok(Self {
            feeds: (0..deck_count).map(|_| None).collect(),
            underruns: vec![0; deck_count],
            decks,
            driver,
            render_buffer: vec![0.0; 4096],
            feed_buffer: vec![0.0; FEED_CHUNK],
        })
    }

    /// Handles other threads use to reach each deck
    pub fn handles(&self) -> Vec<DeckHandle> {
        self.decks
            .iter()
            .filter_map(|d| {
                Some(DeckHandle {
                    id: d.id(),
                    sync: Arc::clone(d.sync()?),
                    probe: d.probe(),
                })
            })
            .collect()
    }

    pub fn clock(&self) -> &Arc<MasterClock> {
        self.driver.clock()
    }

    /// Connect a source ring to a deck
    pub fn attach_feed(&mut self, deck: DeckId, consumer: HeapCons<f32>) {
        if let Some(slot) = self.feeds.get_mut(deck.0 as usize) {
            *slot = Some(consumer);
        }
    }

    pub fn deck(&self, id: DeckId) -> Option<&Deck> {
        self.decks.get(id.0 as usize)
    }

    fn deck_mut(&mut self, id: DeckId) -> Result<&mut Deck, String> {
        self.decks
            .get_mut(id.0 as usize)
            .ok_or_else(|| format!("no deck {id}"))
    }

    /// Reset every sync loop that follows `master` after its stream restarted
    fn restart_followers(&self, master: DeckId) {
        for deck in &self.decks {
            if let Some(sync) = deck.sync() {
                let following = sync.decks().1 == Some(master);
                if following && sync.get_sync_state().mode != SyncMode::Disabled {
                    sync.reset_for_stream_restart();
                }
            }
        }
    }

    /// Process a command
    pub fn handle_command(&mut self, cmd: EngineCommand) -> Option<EngineEvent> {
        let result = match cmd {
            EngineCommand::LoadGrid(id, grid) => {
                self.deck_mut(id).map(|d| d.load_grid(grid)).map(|_| {
                    self.restart_followers(id);
                    None
                })
            }
            EngineCommand::Play(id) => self.deck_mut(id).map(|d| {
                d.play();
                None
            }),
            EngineCommand::Pause(id) => self.deck_mut(id).map(|d| {
                d.pause();
                None
            }),
            EngineCommand::Stop(id) => self.deck_mut(id).map(|d| d.stop()).map(|_| {
                self.restart_followers(id);
                None
            }),
            EngineCommand::Seek(id, frame) => self.deck_mut(id).map(|d| d.seek(frame)).map(|_| {
                self.restart_followers(id);
                None
            }),
            EngineCommand::SetTempo(id, tempo) => self.deck_mut(id).map(|d| {
                d.set_tempo(tempo);
                None
            }),
            EngineCommand::EnableSync {
                target,
                master,
                enabled,
            } => self.deck_mut(target).and_then(|d| {
                d.enable_tempo_phase_sync(master, enabled)
                    .map(|_| None)
                    .map_err(|e| e.to_string())
            }),
            EngineCommand::ConfigureStretch {
                deck,
                mode,
                block_size,
            } => self.deck_mut(deck).and_then(|d| {
                d.configure_stretch(mode, block_size)
                    .map(|status| Some(EngineEvent::StretchConfigured { deck, status }))
                    .map_err(|e| e.to_string())
            }),
            EngineCommand::Shutdown => Ok(None), // Handled at higher level
        };

        match result {
            Ok(event) => event,
            Err(message) => {
                tracing::warn!(%message, "engine command failed");
                Some(EngineEvent::Error(message))
            }
        }
    }

    /// Apply every queued command. Returns true once shutdown was requested.
    pub fn drain_commands(
        &mut self,
        commands: &Receiver<EngineCommand>,
        events: &Sender<EngineEvent>,
    ) -> bool {
        while let Ok(cmd) = commands.try_recv() {
            if matches!(cmd, EngineCommand::Shutdown) {
                return true;
            }
            if let Some(event) = self.handle_command(cmd) {
                let _ = events.try_send(event);
            }
        }
        false
    }

    /// Move source audio from the rings into the decks' stretchers
    fn fill_from_feeds(&mut self) {
        for (deck, feed) in self.decks.iter_mut().zip(self.feeds.iter_mut()) {
            let Some(feed) = feed else { continue };

            let buffered = deck.stretch_status().buffered_input;
            let mut wanted = TARGET_BUFFERED_FRAMES.saturating_sub(buffered) * 2;
            while wanted > 0 {
                let chunk = wanted.min(self.feed_buffer.len()).min(feed.occupied_len()) & !1;
                if chunk == 0 {
                    break;
                }
                let read = feed.pop_slice(&mut self.feed_buffer[..chunk]);
                if deck.push_source(&self.feed_buffer[..read]).is_err() {
                    break;
                }
                wanted -= read;
            }
        }
    }

    /// Render one block of interleaved stereo and advance the clock
    pub fn process(&mut self, output: &mut [f32]) {
        let len = output.len() & !1;
        output.fill(0.0);

        // Ensure pre-allocated buffer is large enough
        // This should rarely happen after the first call
        if len > self.render_buffer.len() {
            self.render_buffer.resize(len, 0.0);
        }

        self.fill_from_feeds();

        let gain = 1.0 / self.decks.len().max(1) as f32;
        for (i, deck) in self.decks.iter_mut().enumerate() {
            let buf = &mut self.render_buffer[..len];
            let pull = deck.process(buf);
            if pull.is_underrun() && deck.playback_state() == PlaybackState::Playing {
                self.underruns[i] += 1;
            }
            let delivered = pull.frames() * 2;
            for (out, s) in output[..delivered].iter_mut().zip(&buf[..delivered]) {
                *out += s * gain;
            }
        }

        self.driver.advance_frames((len / 2) as u64);
    }

    /// Generate current state for UI
    pub fn get_state(&self) -> EngineEvent {
        EngineEvent::StateUpdate {
            decks: self.decks.iter().map(|d| d.state()).collect(),
            underruns: self.underruns.clone(),
            clock: self.clock().now(),
        }
    }

    pub fn underruns(&self) -> &[u64] {
        &self.underruns
    }
}

/// One sync loop as seen by the control thread
struct ControlledPair {
    handle: DeckHandle,
    drift: Arc<Mutex<DriftMonitor>>,
}

/// Control-rate driver for every deck's sync loop
pub struct ControlLoop {
    clock: Arc<MasterClock>,
    pairs: Vec<ControlledPair>,
    probes: Vec<(DeckId, Arc<DeckProbe>)>,
    period: Duration,
}

impl ControlLoop {
    pub fn new(clock: Arc<MasterClock>, handles: &[DeckHandle], period: Duration) -> Self {
        Self {
            clock,
            pairs: handles
                .iter()
                .map(|h| ControlledPair {
                    handle: h.clone(),
                    drift: Arc::new(Mutex::new(DriftMonitor::default())),
                })
                .collect(),
            probes: handles.iter().map(|h| (h.id, Arc::clone(&h.probe))).collect(),
            period,
        }
    }

    /// Drift monitor fed by `target`'s sync loop
    pub fn drift_monitor(&self, target: DeckId) -> Option<Arc<Mutex<DriftMonitor>>> {
        self.pairs
            .iter()
            .find(|p| p.handle.id == target)
            .map(|p| Arc::clone(&p.drift))
    }

    fn probe(&self, id: DeckId) -> Option<&Arc<DeckProbe>> {
        self.probes.iter().find(|(d, _)| *d == id).map(|(_, p)| p)
    }

    /// Step every bound sync loop once
    pub fn tick(&self) -> Vec<(DeckId, SyncState)> {
        let now = self.clock.now();
        let mut stepped = Vec::new();

        for pair in &self.pairs {
            let sync = &pair.handle.sync;
            let (Some(target), Some(master)) = sync.decks() else {
                continue;
            };
            let readings = self
                .probe(target)
                .and_then(|p| p.read())
                .zip(self.probe(master).and_then(|p| p.read()));

            let state = match readings {
                Some((t, m)) => sync.update(
                    t.beat_position,
                    t.base_bpm,
                    m.beat_position,
                    m.effective_bpm,
                    now,
                ),
                // No fresh positions: still let a ramp-out finish
                None => sync.update(f64::NAN, 0.0, f64::NAN, 0.0, now),
            };

            if state.mode != SyncMode::Disabled {
                pair.drift
                    .lock()
                    .push(now.time_seconds, state.phase_offset_beats);
            }
            stepped.push((target, state));
        }

        stepped
    }

    /// Run on a dedicated thread until `shutdown` is set
    pub fn spawn(self, shutdown: Arc<AtomicBool>) -> std::io::Result<JoinHandle<()>> {
        thread::Builder::new()
            .name("beatlock-control".into())
            .spawn(move || {
                tracing::info!(period_ms = self.period.as_millis() as u64, "control loop started");
                while !shutdown.load(Ordering::Relaxed) {
                    self.tick();
                    thread::sleep(self.period);
                }
                tracing::info!("control loop stopped");
            })
    }
}

/// Handle to communicate with the audio engine
pub struct AudioEngine {
    /// Send commands to audio thread
    pub command_tx: Sender<EngineCommand>,
    /// Receive events from audio thread
    pub event_rx: Receiver<EngineEvent>,
    /// Deck registry for lock-free state reads
    decks: Mutex<Vec<DeckHandle>>,
    /// Shutdown flag
    shutdown: Arc<AtomicBool>,
}

impl AudioEngine {
    /// Create channels for engine communication
    /// Buffer size of 1024 provides headroom for command bursts without saturation
    pub fn create_channels() -> (
        Sender<EngineCommand>,
        Receiver<EngineCommand>,
        Sender<EngineEvent>,
        Receiver<EngineEvent>,
    ) {
        let (cmd_tx, cmd_rx) = bounded(1024);
        let (evt_tx, evt_rx) = bounded(1024);
        (cmd_tx, cmd_rx, evt_tx, evt_rx)
    }

    /// Create a new engine handle
    pub fn new(command_tx: Sender<EngineCommand>, event_rx: Receiver<EngineEvent>) -> Self {
        Self {
            command_tx,
            event_rx,
            decks: Mutex::new(Vec::new()),
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn register_decks(&self, handles: &[DeckHandle]) {
        self.decks.lock().extend(handles.iter().cloned());
    }

    /// Last published sync state of `target`
    pub fn sync_state(&self, target: DeckId) -> Option<SyncState> {
        self.decks
            .lock()
            .iter()
            .find(|h| h.id == target)
            .map(|h| h.sync.get_sync_state())
    }

    /// Send a command to the audio engine
    pub fn send(&self, cmd: EngineCommand) {
        let _ = self.command_tx.try_send(cmd);
    }

    /// Shared flag for worker threads
    pub fn shutdown_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shutdown)
    }

    /// Check if shutdown was requested
    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Relaxed)
    }

    /// Request shutdown
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
        let _ = self.command_tx.try_send(EngineCommand::Shutdown);
    }
}
