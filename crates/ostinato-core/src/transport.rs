//! Musical transport: tempo, time signature, position, looping.
//!
//! The transport is the authoritative musical clock. Control threads mutate
//! it through atomics; the render thread reads a consistent view once per
//! block in [`Transport::advance`], so no block ever observes a half-applied
//! transition.

use crate::error::{Error, Result};
use crate::lockfree::{AtomicDouble, AtomicFlag};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};
use tracing::{debug, warn};

const MIN_TEMPO: f64 = 1.0;
const MAX_TEMPO: f64 = 999.0;

/// Playback state machine:
/// `Stopped -(play)-> Playing -(pause)-> Paused -(play)-> Playing -(stop)-> Stopped`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    Stopped,
    Playing,
    Paused,
}

impl TransportState {
    fn to_u8(self) -> u8 {
        match self {
            TransportState::Stopped => 0,
            TransportState::Playing => 1,
            TransportState::Paused => 2,
        }
    }

    fn from_u8(val: u8) -> Self {
        match val {
            1 => TransportState::Playing,
            2 => TransportState::Paused,
            _ => TransportState::Stopped,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeSignature {
    pub numerator: u32,
    pub denominator: u32,
}

impl Default for TimeSignature {
    fn default() -> Self {
        Self {
            numerator: 4,
            denominator: 4,
        }
    }
}

/// Loop wrap details for a block that crossed the loop end.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LoopWrap {
    pub loop_start: f64,
    pub loop_end: f64,
    /// Samples rendered before the wrap point.
    pub pre_wrap_samples: usize,
}

/// The beat span covered by one render block.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BlockWindow {
    pub playing: bool,
    pub start_beat: f64,
    pub end_beat: f64,
    pub wrap: Option<LoopWrap>,
}

impl BlockWindow {
    fn idle(beat: f64) -> Self {
        Self {
            playing: false,
            start_beat: beat,
            end_beat: beat,
            wrap: None,
        }
    }
}

pub struct Transport {
    state: AtomicU8,
    position_samples: AtomicU64,
    /// Where `stop` returns to when not looping. Updated by seeks.
    region_start_beats: AtomicDouble,
    tempo: AtomicDouble,
    timesig_numerator: AtomicU32,
    timesig_denominator: AtomicU32,
    looping: AtomicFlag,
    loop_start_beats: AtomicDouble,
    loop_end_beats: AtomicDouble,
    sample_rate: f64,
    block_size: usize,
}

impl Transport {
    pub fn new(sample_rate: f64, block_size: usize) -> Self {
        Self {
            state: AtomicU8::new(TransportState::Stopped.to_u8()),
            position_samples: AtomicU64::new(0),
            region_start_beats: AtomicDouble::new(0.0),
            tempo: AtomicDouble::new(120.0),
            timesig_numerator: AtomicU32::new(4),
            timesig_denominator: AtomicU32::new(4),
            looping: AtomicFlag::new(false),
            loop_start_beats: AtomicDouble::new(0.0),
            loop_end_beats: AtomicDouble::new(0.0),
            sample_rate,
            block_size,
        }
    }

    // --- State control ---

    pub fn play(&self) {
        self.state
            .store(TransportState::Playing.to_u8(), Ordering::Release);
        debug!("transport: play");
    }

    /// Pause, preserving position. No-op unless playing.
    pub fn pause(&self) {
        let _ = self.state.compare_exchange(
            TransportState::Playing.to_u8(),
            TransportState::Paused.to_u8(),
            Ordering::AcqRel,
            Ordering::Relaxed,
        );
        debug!(beat = self.position_beats(), "transport: pause");
    }

    /// Stop and reset position to the loop start when looping, otherwise to
    /// the region start (beat 0 unless seeked).
    pub fn stop(&self) {
        self.state
            .store(TransportState::Stopped.to_u8(), Ordering::Release);
        let home = if self.looping.get() {
            self.loop_start_beats.get()
        } else {
            self.region_start_beats.get()
        };
        self.position_samples
            .store(self.beats_to_samples(home), Ordering::Release);
        debug!(beat = home, "transport: stop");
    }

    pub fn state(&self) -> TransportState {
        TransportState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_playing(&self) -> bool {
        self.state() == TransportState::Playing
    }

    // --- Tempo and time signature ---

    /// Set tempo in BPM. Takes effect immediately; clamped to [1, 999].
    pub fn set_tempo(&self, bpm: f64) -> Result<()> {
        if !bpm.is_finite() || bpm <= 0.0 {
            return Err(Error::InvalidTempo(bpm));
        }
        self.tempo.set(bpm.clamp(MIN_TEMPO, MAX_TEMPO));
        Ok(())
    }

    pub fn tempo(&self) -> f64 {
        self.tempo.get()
    }

    /// Numerator 1..=32, power-of-two denominator up to 32.
    pub fn set_time_signature(&self, numerator: u32, denominator: u32) -> Result<()> {
        let valid_denominator = matches!(denominator, 1 | 2 | 4 | 8 | 16 | 32);
        if numerator == 0 || numerator > 32 || !valid_denominator {
            return Err(Error::InvalidTimeSignature {
                numerator,
                denominator,
            });
        }
        self.timesig_numerator.store(numerator, Ordering::Release);
        self.timesig_denominator.store(denominator, Ordering::Release);
        Ok(())
    }

    pub fn time_signature(&self) -> TimeSignature {
        TimeSignature {
            numerator: self.timesig_numerator.load(Ordering::Acquire),
            denominator: self.timesig_denominator.load(Ordering::Acquire),
        }
    }

    // --- Position ---

    pub fn seek_beats(&self, beats: f64) {
        let beats = beats.max(0.0);
        self.region_start_beats.set(beats);
        self.position_samples
            .store(self.beats_to_samples(beats), Ordering::Release);
        debug!(beat = beats, "transport: seek");
    }

    pub fn seek_samples(&self, samples: u64) {
        self.region_start_beats.set(self.samples_to_beats(samples));
        self.position_samples.store(samples, Ordering::Release);
    }

    pub fn position_samples(&self) -> u64 {
        self.position_samples.load(Ordering::Acquire)
    }

    pub fn position_beats(&self) -> f64 {
        self.samples_to_beats(self.position_samples())
    }

    pub fn position_seconds(&self) -> f64 {
        self.position_samples() as f64 / self.sample_rate
    }

    pub fn bar_count(&self) -> u64 {
        let per_bar = self.beats_per_bar();
        if per_bar <= 0.0 {
            return 0;
        }
        (self.position_beats() / per_bar).floor() as u64
    }

    /// Quarter notes per bar from the time signature.
    pub fn beats_per_bar(&self) -> f64 {
        let sig = self.time_signature();
        sig.numerator as f64 * (4.0 / sig.denominator as f64)
    }

    // --- Looping ---

    /// Set loop points in beats. Rejects end <= start; the region takes
    /// effect once looping is enabled.
    pub fn set_loop_points(&self, start_beats: f64, end_beats: f64) -> Result<()> {
        if !(end_beats > start_beats) || start_beats < 0.0 {
            return Err(Error::InvalidLoopRange {
                start: start_beats,
                end: end_beats,
            });
        }
        self.loop_start_beats.set(start_beats);
        self.loop_end_beats.set(end_beats);
        Ok(())
    }

    /// Enable or disable looping. Enabling is refused (returning false) when
    /// no loop points are set or the region is shorter than one block.
    pub fn set_looping(&self, enabled: bool) -> bool {
        if !enabled {
            self.looping.set(false);
            return true;
        }
        let start = self.loop_start_beats.get();
        let end = self.loop_end_beats.get();
        if end <= start {
            debug!("transport: looping not enabled, no valid loop points");
            return false;
        }
        let len_samples = self.beats_to_samples(end) - self.beats_to_samples(start);
        if len_samples < self.block_size as u64 {
            warn!(
                len_samples,
                block = self.block_size,
                "transport: loop too short, not enabling"
            );
            return false;
        }
        self.looping.set(true);
        // Snap the playhead into the region.
        let pos = self.position_samples();
        let start_samples = self.beats_to_samples(start);
        let end_samples = self.beats_to_samples(end);
        if pos >= end_samples {
            let len = end_samples - start_samples;
            self.position_samples
                .store(start_samples + (pos - start_samples) % len, Ordering::Release);
        } else if pos < start_samples {
            self.position_samples.store(start_samples, Ordering::Release);
        }
        true
    }

    pub fn is_looping(&self) -> bool {
        self.looping.get()
    }

    pub fn loop_range(&self) -> Option<(f64, f64)> {
        self.looping
            .get()
            .then(|| (self.loop_start_beats.get(), self.loop_end_beats.get()))
    }

    // --- Conversions ---

    pub fn sample_rate(&self) -> f64 {
        self.sample_rate
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn beats_to_samples(&self, beats: f64) -> u64 {
        let tempo = self.tempo.get();
        (beats * 60.0 / tempo * self.sample_rate).round().max(0.0) as u64
    }

    pub fn samples_to_beats(&self, samples: u64) -> f64 {
        samples as f64 / self.sample_rate * (self.tempo.get() / 60.0)
    }

    pub fn beats_to_seconds(&self, beats: f64) -> f64 {
        beats * 60.0 / self.tempo.get()
    }

    pub fn samples_per_beat(&self) -> f64 {
        self.sample_rate * 60.0 / self.tempo.get()
    }

    // --- Render thread ---

    /// Advance by one block and return the beat span it covers.
    ///
    /// Reads the transport state once, so a control-thread transition lands
    /// between blocks, never inside one. When the span crosses the loop end
    /// the window carries a [`LoopWrap`] so callers can dispatch the pre-wrap
    /// tail and the post-wrap head separately.
    pub fn advance(&self, num_samples: usize) -> BlockWindow {
        let start_beat = self.position_beats();
        if self.state() != TransportState::Playing || num_samples == 0 {
            return BlockWindow::idle(start_beat);
        }

        let pos = self.position_samples();
        let mut new_pos = pos + num_samples as u64;
        let mut wrap = None;

        if self.looping.get() {
            let loop_start = self.loop_start_beats.get();
            let loop_end = self.loop_end_beats.get();
            let start_samples = self.beats_to_samples(loop_start);
            let end_samples = self.beats_to_samples(loop_end);
            if end_samples > start_samples && new_pos >= end_samples {
                let len = end_samples - start_samples;
                let pre = end_samples.saturating_sub(pos) as usize;
                new_pos = start_samples + (new_pos - start_samples) % len;
                wrap = Some(LoopWrap {
                    loop_start,
                    loop_end,
                    pre_wrap_samples: pre,
                });
            }
        }

        self.position_samples.store(new_pos, Ordering::Release);
        BlockWindow {
            playing: true,
            start_beat,
            end_beat: self.samples_to_beats(new_pos),
            wrap,
        }
    }
}
