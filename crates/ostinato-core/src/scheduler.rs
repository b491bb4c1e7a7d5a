//! Sample-accurate event scheduler.
//!
//! Control and clock threads enqueue timestamped events; the render thread
//! drains them into private staging and resolves the ones whose beat falls
//! inside the current block window. Application is at-most-once and never
//! retroactive: an event behind the playhead is dropped at enqueue (unless it
//! sits inside an active loop region, where the playhead will come around
//! again), and staged events left far behind are expired, not replayed.

use crate::event::{EventPayload, ResolvedEvent, ScheduledEvent};
use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{trace, warn};

/// Queue capacity between control threads and the render thread.
const QUEUE_CAPACITY: usize = 4096;

/// Events this far behind the block window are expired from staging.
const EXPIRY_BEATS: f64 = 16.0;

/// Loop state relevant to the enqueue-side late check.
#[derive(Debug, Clone, Copy)]
pub struct LoopContext {
    pub enabled: bool,
    pub start: f64,
    pub end: f64,
}

impl LoopContext {
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            start: 0.0,
            end: 0.0,
        }
    }

    fn contains(&self, beat: f64) -> bool {
        self.enabled && beat >= self.start && beat < self.end
    }
}

/// Control-side handle: enqueues events toward the render thread.
pub struct EventScheduler {
    tx: Sender<ScheduledEvent>,
    seq: AtomicU64,
}

/// Render-side half: staging storage drained only by the render thread.
pub struct EventStaging {
    rx: Receiver<ScheduledEvent>,
    staged: Vec<ScheduledEvent>,
    matched: Vec<ScheduledEvent>,
}

/// Create a connected scheduler pair.
pub fn event_queue() -> (EventScheduler, EventStaging) {
    let (tx, rx) = bounded(QUEUE_CAPACITY);
    (
        EventScheduler {
            tx,
            seq: AtomicU64::new(0),
        },
        EventStaging {
            rx,
            staged: Vec::with_capacity(QUEUE_CAPACITY),
            matched: Vec::new(),
        },
    )
}

impl EventScheduler {
    /// Enqueue an event. Returns false when the beat is invalid, already
    /// behind `playhead` (outside an active loop region), or the queue is
    /// full. Late events are dropped here by design, never applied
    /// retroactively.
    pub fn schedule(
        &self,
        target: u32,
        beat: f64,
        payload: EventPayload,
        playhead: f64,
        loop_ctx: LoopContext,
    ) -> bool {
        if !beat.is_finite() || beat < 0.0 {
            warn!(beat, "scheduler: discarding event with invalid beat");
            return false;
        }
        if beat < playhead && !loop_ctx.contains(beat) {
            trace!(beat, playhead, "scheduler: dropping late event");
            return false;
        }
        let event = ScheduledEvent {
            target,
            beat,
            seq: self.seq.fetch_add(1, Ordering::Relaxed),
            payload,
        };
        match self.tx.try_send(event) {
            Ok(()) => true,
            Err(TrySendError::Full(ev)) => {
                warn!(beat = ev.beat, target = ev.target, "scheduler: queue full, dropping event");
                false
            }
            Err(TrySendError::Disconnected(_)) => false,
        }
    }
}

impl EventStaging {
    /// Pull queued events into staging (render thread).
    pub fn drain_incoming(&mut self) {
        while let Ok(event) = self.rx.try_recv() {
            if self.staged.len() >= QUEUE_CAPACITY {
                warn!(beat = event.beat, "scheduler: staging full, dropping event");
                continue;
            }
            self.staged.push(event);
        }
    }

    /// Resolve events with beat in `[window_start, window_end)` against a
    /// span of `num_samples` starting at `base_offset` within the block.
    ///
    /// Matched events are appended to `out` in increasing beat order, ties
    /// broken by insertion order, and removed from staging. Events expired
    /// far behind the window are discarded.
    pub fn retrieve(
        &mut self,
        window_start: f64,
        window_end: f64,
        base_offset: usize,
        num_samples: usize,
        samples_per_beat: f64,
        out: &mut Vec<ResolvedEvent>,
    ) {
        if num_samples == 0 || window_end <= window_start {
            return;
        }

        self.matched.clear();
        let mut i = 0;
        while i < self.staged.len() {
            let beat = self.staged[i].beat;
            if beat < window_start - EXPIRY_BEATS {
                warn!(
                    beat,
                    window_start, "scheduler: expiring stale event"
                );
                self.staged.swap_remove(i);
                continue;
            }
            if beat >= window_start && beat < window_end {
                self.matched.push(self.staged.swap_remove(i));
                continue;
            }
            i += 1;
        }

        self.matched
            .sort_by(|a, b| a.beat.total_cmp(&b.beat).then(a.seq.cmp(&b.seq)));

        for event in self.matched.drain(..) {
            let offset = ((event.beat - window_start) * samples_per_beat).round() as usize;
            out.push(ResolvedEvent {
                sample_offset: base_offset + offset.min(num_samples - 1),
                target: event.target,
                payload: event.payload,
            });
        }
    }

    /// Discard everything, both queued and staged.
    pub fn clear(&mut self) {
        while self.rx.try_recv().is_ok() {}
        self.staged.clear();
        trace!("scheduler: cleared");
    }

    pub fn staged_len(&self) -> usize {
        self.staged.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn note_on(note: u8) -> EventPayload {
        EventPayload::NoteOn {
            channel: 1,
            note,
            velocity: 0.8,
        }
    }

    fn no_loop() -> LoopContext {
        LoopContext::disabled()
    }

    #[test]
    fn test_schedule_and_retrieve() {
        let (sched, mut staging) = event_queue();
        assert!(sched.schedule(1, 2.0, note_on(60), 0.0, no_loop()));

        staging.drain_incoming();
        let mut out = Vec::new();
        // 120 BPM at 48kHz: 24000 samples per beat; window [1.5, 2.5)
        staging.retrieve(1.5, 2.5, 0, 24000, 24000.0, &mut out);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].sample_offset, 12000);
        assert_eq!(staging.staged_len(), 0);
    }

    #[test]
    fn test_event_outside_window_stays_staged() {
        let (sched, mut staging) = event_queue();
        assert!(sched.schedule(1, 8.0, note_on(60), 0.0, no_loop()));
        staging.drain_incoming();

        let mut out = Vec::new();
        staging.retrieve(0.0, 1.0, 0, 512, 24000.0, &mut out);
        assert!(out.is_empty());
        assert_eq!(staging.staged_len(), 1);
    }

    #[test]
    fn test_late_event_dropped_at_enqueue() {
        let (sched, _staging) = event_queue();
        assert!(!sched.schedule(1, 1.0, note_on(60), 2.0, no_loop()));
        // Exactly at the playhead is not late.
        assert!(sched.schedule(1, 2.0, note_on(60), 2.0, no_loop()));
    }

    #[test]
    fn test_invalid_beat_rejected() {
        let (sched, _staging) = event_queue();
        assert!(!sched.schedule(1, f64::NAN, note_on(60), 0.0, no_loop()));
        assert!(!sched.schedule(1, -1.0, note_on(60), 0.0, no_loop()));
    }

    #[test]
    fn test_loop_region_allows_wrapped_beats() {
        let (sched, _staging) = event_queue();
        let ctx = LoopContext {
            enabled: true,
            start: 0.0,
            end: 4.0,
        };
        // Playhead at 3.9, event at 0.5: behind linearly, but inside the
        // loop region so the playhead will come around again.
        assert!(sched.schedule(1, 0.5, note_on(60), 3.9, ctx));
        // Outside the region it is still late.
        assert!(!sched.schedule(1, 0.5, note_on(60), 3.9, no_loop()));
    }

    #[test]
    fn test_same_beat_insertion_order() {
        let (sched, mut staging) = event_queue();
        for note in [60, 61, 62] {
            assert!(sched.schedule(1, 1.0, note_on(note), 0.0, no_loop()));
        }
        staging.drain_incoming();

        let mut out = Vec::new();
        staging.retrieve(0.5, 1.5, 0, 48000, 48000.0, &mut out);
        let notes: Vec<u8> = out
            .iter()
            .map(|e| match e.payload {
                EventPayload::NoteOn { note, .. } => note,
                _ => unreachable!(),
            })
            .collect();
        assert_eq!(notes, vec![60, 61, 62]);
    }

    #[test]
    fn test_beat_order_across_insertion_order() {
        let (sched, mut staging) = event_queue();
        assert!(sched.schedule(1, 1.5, note_on(61), 0.0, no_loop()));
        assert!(sched.schedule(1, 1.0, note_on(60), 0.0, no_loop()));
        staging.drain_incoming();

        let mut out = Vec::new();
        staging.retrieve(0.0, 2.0, 0, 48000, 24000.0, &mut out);
        assert_eq!(out.len(), 2);
        assert!(out[0].sample_offset < out[1].sample_offset);
    }

    #[test]
    fn test_offset_clamped_to_block() {
        let (sched, mut staging) = event_queue();
        assert!(sched.schedule(1, 0.99999, note_on(60), 0.0, no_loop()));
        staging.drain_incoming();

        let mut out = Vec::new();
        staging.retrieve(0.0, 1.0, 0, 512, 512.0, &mut out);
        assert_eq!(out.len(), 1);
        assert!(out[0].sample_offset < 512);
    }

    #[test]
    fn test_base_offset_applied() {
        let (sched, mut staging) = event_queue();
        assert!(sched.schedule(1, 0.0, note_on(60), 0.0, no_loop()));
        staging.drain_incoming();

        let mut out = Vec::new();
        staging.retrieve(0.0, 1.0, 100, 412, 412.0, &mut out);
        assert_eq!(out[0].sample_offset, 100);
    }

    #[test]
    fn test_stale_event_expired() {
        let (sched, mut staging) = event_queue();
        assert!(sched.schedule(1, 1.0, note_on(60), 0.0, no_loop()));
        staging.drain_incoming();

        let mut out = Vec::new();
        // Window far past the event: expired, not applied.
        staging.retrieve(100.0, 101.0, 0, 512, 24000.0, &mut out);
        assert!(out.is_empty());
        assert_eq!(staging.staged_len(), 0);
    }

    #[test]
    fn test_clear_discards_everything() {
        let (sched, mut staging) = event_queue();
        assert!(sched.schedule(1, 1.0, note_on(60), 0.0, no_loop()));
        staging.drain_incoming();
        assert!(sched.schedule(1, 2.0, note_on(61), 0.0, no_loop()));

        staging.clear();
        assert_eq!(staging.staged_len(), 0);
        let mut out = Vec::new();
        staging.retrieve(0.0, 4.0, 0, 48000, 24000.0, &mut out);
        assert!(out.is_empty());
    }
}
