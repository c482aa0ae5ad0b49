//! Deck implementation - beat-gridded playback through the time stretcher
//!
//! A deck does not decode audio. Its source arrives through `push_source`
//! and its position is the number of source frames the stretcher consumed.
//! With tempo/phase sync enabled the deck plays at
//! `tempo * tempo_ratio * correction`, latched into the stretcher before
//! every block.

use crate::clock::ClockSnapshot;
use crate::sync::{DeckId, SyncError, SyncMode, SyncState, SyncStatus, TempoPhaseSync};
use crate::timestretcher::{Pull, QualityMode, StretchError, StretchStatus, TimeStretchEngine};
use beatlock_analysis::BeatGrid;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

/// Playback state for a deck
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PlaybackState {
    #[default]
    Stopped,
    Playing,
    Paused,
}

/// Beat position and tempo published by the audio thread for the control thread
#[derive(Debug, Default)]
pub struct DeckProbe {
    beat_position: AtomicU64,
    base_bpm: AtomicU64,
    effective_bpm: AtomicU64,
    valid: AtomicBool,
}

/// One reading of a `DeckProbe`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProbeReading {
    pub beat_position: f64,
    /// Grid BPM times the user tempo, before sync correction
    pub base_bpm: f64,
    /// BPM actually playing
    pub effective_bpm: f64,
}

impl DeckProbe {
    fn publish(&self, reading: Option<ProbeReading>) {
        match reading {
            Some(r) => {
                self.beat_position
                    .store(r.beat_position.to_bits(), Ordering::Relaxed);
                self.base_bpm.store(r.base_bpm.to_bits(), Ordering::Relaxed);
                self.effective_bpm
                    .store(r.effective_bpm.to_bits(), Ordering::Relaxed);
                self.valid.store(true, Ordering::Release);
            }
            None => self.valid.store(false, Ordering::Release),
        }
    }

    /// Latest reading, or None while the deck is not playing a gridded track
    pub fn read(&self) -> Option<ProbeReading> {
        if !self.valid.load(Ordering::Acquire) {
            return None;
        }
        Some(ProbeReading {
            beat_position: f64::from_bits(self.beat_position.load(Ordering::Relaxed)),
            base_bpm: f64::from_bits(self.base_bpm.load(Ordering::Relaxed)),
            effective_bpm: f64::from_bits(self.effective_bpm.load(Ordering::Relaxed)),
        })
    }
}

/// Complete deck state for UI rendering
#[derive(Debug, Clone, PartialEq)]
pub struct DeckState {
    pub id: DeckId,
    pub playback: PlaybackState,
    /// Source frames played since the start of the track
    pub position_frames: u64,
    pub tempo: f64,
    /// BPM actually playing (None without a grid)
    pub bpm: Option<f64>,
    pub beat_phase: Option<f64>,
    pub sync: SyncStatus,
    pub stretch: StretchStatus,
}

/// A single deck
pub struct Deck {
    id: DeckId,
    sample_rate: u32,
    grid: Option<BeatGrid>,
    /// User tempo (1.0 = native speed)
    tempo: f64,
    state: PlaybackState,
    /// Source frame the current stream started from
    start_frame: u64,
    stretcher: TimeStretchEngine,
    /// Sync with this deck as target
    sync: Option<Arc<TempoPhaseSync>>,
    probe: Arc<DeckProbe>,
}

impl Deck {
    pub fn new(id: DeckId, sample_rate: u32, stretcher: TimeStretchEngine) -> Self {
        Self {
            id,
            sample_rate,
            grid: None,
            tempo: 1.0,
            state: PlaybackState::Stopped,
            start_frame: 0,
            stretcher,
            sync: None,
            probe: Arc::new(DeckProbe::default()),
        }
    }

    pub fn id(&self) -> DeckId {
        self.id
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Attach the sync instance that drives this deck as a target
    pub fn attach_sync(&mut self, sync: Arc<TempoPhaseSync>) {
        self.sync = Some(sync);
    }

    pub fn sync(&self) -> Option<&Arc<TempoPhaseSync>> {
        self.sync.as_ref()
    }

    pub fn probe(&self) -> Arc<DeckProbe> {
        Arc::clone(&self.probe)
    }

    /// Set the beat grid of the loaded track
    pub fn load_grid(&mut self, grid: BeatGrid) {
        tracing::info!(deck = %self.id, bpm = grid.bpm, "beat grid loaded");
        self.grid = Some(grid);
        self.restart_stream(0);
    }

    pub fn beat_grid(&self) -> Option<&BeatGrid> {
        self.grid.as_ref()
    }

    pub fn play(&mut self) {
        self.state = PlaybackState::Playing;
    }

    pub fn pause(&mut self) {
        self.state = PlaybackState::Paused;
    }

    /// Stop playback and return to the start of the track
    pub fn stop(&mut self) {
        self.state = PlaybackState::Stopped;
        self.restart_stream(0);
    }

    /// Jump to a source frame. The source provider must resume from there.
    pub fn seek(&mut self, frame: u64) {
        self.restart_stream(frame);
    }

    fn restart_stream(&mut self, frame: u64) {
        self.start_frame = frame;
        self.stretcher.reset();
        if let Some(sync) = &self.sync {
            sync.reset_for_stream_restart();
        }
        self.probe.publish(None);
    }

    pub fn playback_state(&self) -> PlaybackState {
        self.state
    }

    pub fn set_tempo(&mut self, tempo: f64) {
        if tempo.is_finite() && tempo > 0.0 {
            self.tempo = tempo.clamp(0.5, 2.0);
        } else {
            tracing::warn!(deck = %self.id, tempo, "ignoring invalid tempo");
        }
    }

    pub fn tempo(&self) -> f64 {
        self.tempo
    }

    /// Source frame currently being played
    pub fn position_frames(&self) -> u64 {
        self.start_frame + self.stretcher.input_frames_consumed()
    }

    pub fn beat_position(&self) -> Option<f64> {
        let grid = self.grid.as_ref()?;
        Some(grid.beat_at_position(self.position_frames() as f64))
    }

    /// Phase within the current beat, in [0, 1)
    pub fn beat_phase(&self) -> Option<f64> {
        let grid = self.grid.as_ref()?;
        Some(grid.phase_at_position(self.position_frames() as f64))
    }

    /// Grid BPM at the user tempo, before sync correction
    pub fn base_bpm(&self) -> Option<f64> {
        self.grid.as_ref().map(|g| g.bpm_at_rate(self.tempo))
    }

    /// BPM actually playing, including sync correction
    pub fn effective_bpm(&self) -> Option<f64> {
        self.grid.as_ref().map(|g| g.bpm_at_rate(self.playback_rate()))
    }

    /// Rate handed to the stretcher
    pub fn playback_rate(&self) -> f64 {
        match &self.sync {
            Some(sync) => self.tempo * sync.get_sync_state().playback_rate(),
            None => self.tempo,
        }
    }

    /// Bind this deck as target of `master` and switch sync on or off
    pub fn enable_tempo_phase_sync(
        &mut self,
        master: DeckId,
        enabled: bool,
    ) -> Result<(), SyncError> {
        let sync = self.sync.as_ref().ok_or_else(|| {
            SyncError::InvalidConfiguration(format!("deck {} has no sync attached", self.id))
        })?;

        if enabled && sync.decks() != (Some(self.id), Some(master)) {
            sync.set_decks(self.id, master)?;
        }
        sync.enable_sync(enabled);
        Ok(())
    }

    pub fn get_tempo_phase_sync_state(&self) -> SyncStatus {
        self.sync
            .as_ref()
            .map(|s| s.get_sync_state().status())
            .unwrap_or_default()
    }

    /// Run one control step against `master` on the calling thread.
    /// Returns None if either deck has no grid or sync is not attached.
    pub fn sync_tick(&self, master: &Deck, now: ClockSnapshot) -> Option<SyncState> {
        let sync = self.sync.as_ref()?;
        let state = sync.update(
            self.beat_position()?,
            self.base_bpm()?,
            master.beat_position()?,
            master.effective_bpm()?,
            now,
        );
        Some(state)
    }

    /// Queue interleaved stereo source audio
    pub fn push_source(&mut self, samples: &[f32]) -> Result<(), StretchError> {
        self.stretcher.push_input(samples)
    }

    /// Render one block. Silence while not playing.
    pub fn process(&mut self, output: &mut [f32]) -> Pull {
        if self.state != PlaybackState::Playing {
            output.fill(0.0);
            return Pull::Complete(output.len() / 2);
        }

        let rate = self.playback_rate();
        if let Err(e) = self.stretcher.set_rate(rate) {
            tracing::warn!(deck = %self.id, error = %e, "keeping previous stretch rate");
        }
        let pull = self.stretcher.pull_output(output);

        self.probe.publish(self.probe_reading());
        pull
    }

    fn probe_reading(&self) -> Option<ProbeReading> {
        Some(ProbeReading {
            beat_position: self.beat_position()?,
            base_bpm: self.base_bpm()?,
            effective_bpm: self.effective_bpm()?,
        })
    }

    /// Switch stretch quality or block size. Restarts the stream.
    pub fn configure_stretch(
        &mut self,
        mode: QualityMode,
        block_size: usize,
    ) -> Result<StretchStatus, StretchError> {
        let frame = self.position_frames();
        let status = self.stretcher.configure(mode, block_size)?;
        self.restart_stream(frame);
        Ok(status)
    }

    pub fn stretch_status(&self) -> StretchStatus {
        self.stretcher.status()
    }

    /// Whether sync is currently steering this deck
    pub fn is_syncing(&self) -> bool {
        self.sync
            .as_ref()
            .is_some_and(|s| s.get_sync_state().mode != SyncMode::Disabled)
    }

    pub fn state(&self) -> DeckState {
        DeckState {
            id: self.id,
            playback: self.state,
            position_frames: self.position_frames(),
            tempo: self.tempo,
            bpm: self.effective_bpm(),
            beat_phase: self.beat_phase(),
            sync: self.get_tempo_phase_sync_state(),
            stretch: self.stretcher.status(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::MasterClock;

    const SR: u32 = 48000;

    fn deck(id: u8, bpm: f64) -> Deck {
        let stretcher = TimeStretchEngine::new(QualityMode::Fallback, 256).unwrap();
        let mut deck = Deck::new(DeckId(id), SR, stretcher);
        deck.load_grid(BeatGrid::new(bpm, 0, SR, 1.0).unwrap());
        deck
    }

    fn silence(frames: usize) -> Vec<f32> {
        vec![0.0; frames * 2]
    }

    #[test]
    fn test_position_follows_consumed_frames() {
        let mut d = deck(0, 120.0);
        d.push_source(&silence(48000)).unwrap();
        d.play();

        let mut block = vec![0.0; 2 * 256];
        for _ in 0..94 {
            d.process(&mut block);
        }
        // 94 * 256 frames at unity rate = 24064 frames, just past one beat at 120 BPM
        assert_eq!(d.position_frames(), 24064);
        assert!((d.beat_position().unwrap() - 24064.0 / 24000.0).abs() < 1e-12);
        assert!(d.probe().read().is_some());
    }

    #[test]
    fn test_paused_deck_outputs_silence() {
        let mut d = deck(0, 120.0);
        d.push_source(&vec![0.5; 2 * 1024]).unwrap();
        let mut block = vec![1.0; 2 * 256];
        assert_eq!(d.process(&mut block), Pull::Complete(256));
        assert!(block.iter().all(|&s| s == 0.0));
        assert_eq!(d.position_frames(), 0);
    }

    #[test]
    fn test_sync_requires_attachment() {
        let mut d = deck(1, 127.0);
        assert!(d.enable_tempo_phase_sync(DeckId(0), true).is_err());
        assert_eq!(d.get_tempo_phase_sync_state().mode, SyncMode::Disabled);
    }

    #[test]
    fn test_enable_and_stop_resets_sync() {
        let (clock, _driver) = MasterClock::new(128.0, SR);
        let mut d = deck(1, 127.0);
        d.attach_sync(Arc::new(TempoPhaseSync::new(clock)));

        assert!(d.enable_tempo_phase_sync(DeckId(1), true).is_err());
        d.enable_tempo_phase_sync(DeckId(0), true).unwrap();
        assert_eq!(d.get_tempo_phase_sync_state().mode, SyncMode::Locking);
        assert!(d.is_syncing());

        d.stop();
        assert_eq!(d.get_tempo_phase_sync_state().mode, SyncMode::Disabled);
        assert_eq!(d.stretch_status().buffered_input, 0);
    }

    #[test]
    fn test_sync_tick_tempo_matches_target() {
        let (clock, mut driver) = MasterClock::new(128.0, SR);
        let mut master = deck(0, 128.0);
        let mut target = deck(1, 127.0);
        target.attach_sync(Arc::new(TempoPhaseSync::new(Arc::clone(&clock))));
        target.enable_tempo_phase_sync(DeckId(0), true).unwrap();

        for d in [&mut master, &mut target] {
            d.push_source(&silence(SR as usize * 4)).unwrap();
            d.play();
        }

        let mut block = vec![0.0; 2 * 256];
        for _ in 0..20 {
            master.process(&mut block);
            target.process(&mut block);
            driver.advance_frames(256);
            target.sync_tick(&master, clock.now());
        }

        let state = target.get_tempo_phase_sync_state();
        assert_ne!(state.mode, SyncMode::Disabled);
        let bpm = target.effective_bpm().unwrap();
        // Tempo matched to within the correction band
        assert!((bpm - 128.0).abs() <= 128.0 * 0.005 + 1e-9);
    }
}
