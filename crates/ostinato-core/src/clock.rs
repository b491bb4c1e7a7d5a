//! Beat clock dispatch: lookahead callbacks on a dedicated thread.
//!
//! Subscribers register a beat resolution, a lookahead in milliseconds, and a
//! callback. The render path pushes the beat range it just covered through an
//! SPSC ring; the dispatch thread shifts that window forward by the lookahead
//! and fires the callback once per crossed resolution boundary with the
//! *future* beat value. Callbacks therefore always see a beat that has not
//! been rendered yet and can schedule events that land on it in time.
//!
//! Callbacks run on the clock thread, never the render thread.

use crate::error::{Error, Result};
use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use ringbuf::traits::{Consumer, Producer, Split};
use ringbuf::{HeapCons, HeapProd, HeapRb};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{debug, warn};

/// Updates the render thread can queue without blocking the dispatcher.
const UPDATE_CAPACITY: usize = 256;

/// Beat span covered by one render block, plus the loop state needed to
/// split lookahead windows across the seam.
#[derive(Debug, Clone, Copy, Default)]
pub struct BeatRangeUpdate {
    pub old_beat: f64,
    /// Unwrapped end of the block span (may lie past the loop end).
    pub new_beat: f64,
    pub tempo: f64,
    pub looping: bool,
    pub loop_start: f64,
    pub loop_end: f64,
}

pub type ClockCallback = Box<dyn Fn(f64) + Send + 'static>;

struct ClockSubscription {
    id: u32,
    resolution: f64,
    lookahead_ms: f64,
    callback: ClockCallback,
}

#[derive(Debug, Clone, Copy)]
struct PrimeRequest {
    start_beat: f64,
    tempo: f64,
    looping: bool,
    loop_start: f64,
    loop_end: f64,
}

struct ClockShared {
    subscriptions: Mutex<Vec<ClockSubscription>>,
    next_id: AtomicU32,
    running: AtomicBool,
    notify_tx: Sender<()>,
    prime: Mutex<Option<PrimeRequest>>,
    stop_pending: AtomicBool,
}

/// Render-side producer half: pushes beat ranges and wakes the dispatcher.
pub struct ClockUpdateTx {
    producer: HeapProd<BeatRangeUpdate>,
    notify: Sender<()>,
}

impl ClockUpdateTx {
    /// RT-safe: bounded push plus a channel wakeup; drops on overflow.
    pub fn push(&mut self, update: BeatRangeUpdate) {
        if self.producer.try_push(update).is_err() {
            warn!("clock: update queue overflow, dropping beat range");
            return;
        }
        let _ = self.notify.try_send(());
    }
}

/// Subscription handle. `destroy` is idempotent; dropping the handle also
/// unsubscribes.
pub struct ClockHandle {
    id: u32,
    shared: Arc<ClockShared>,
    destroyed: AtomicBool,
}

impl ClockHandle {
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Unsubscribe and stop callbacks. Safe to call multiple times; the
    /// second call is a no-op.
    pub fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::AcqRel) {
            return;
        }
        let mut subs = self.shared.subscriptions.lock();
        if let Some(pos) = subs.iter().position(|s| s.id == self.id) {
            subs.remove(pos);
            debug!(clock = self.id, "clock: destroyed");
        }
    }
}

impl Drop for ClockHandle {
    fn drop(&mut self) {
        self.destroy();
    }
}

/// Owns the dispatch thread. Dropping it joins the thread.
pub struct ClockDispatch {
    shared: Arc<ClockShared>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl ClockDispatch {
    /// Build the dispatcher plus the producer half handed to the render
    /// state.
    pub fn new() -> (Self, ClockUpdateTx) {
        let (notify_tx, notify_rx) = unbounded();
        let (producer, consumer) = HeapRb::<BeatRangeUpdate>::new(UPDATE_CAPACITY).split();

        let shared = Arc::new(ClockShared {
            subscriptions: Mutex::new(Vec::new()),
            next_id: AtomicU32::new(1),
            running: AtomicBool::new(true),
            notify_tx: notify_tx.clone(),
            prime: Mutex::new(None),
            stop_pending: AtomicBool::new(false),
        });

        let thread_shared = Arc::clone(&shared);
        let thread = std::thread::Builder::new()
            .name("ostinato-clock".into())
            .spawn(move || dispatch_loop(thread_shared, notify_rx, consumer))
            .expect("failed to spawn clock dispatch thread");

        debug!("clock: dispatch thread started");
        (
            Self {
                shared,
                thread: Mutex::new(Some(thread)),
            },
            ClockUpdateTx {
                producer,
                notify: notify_tx,
            },
        )
    }

    /// Subscribe a callback. `resolution_beats` must be > 0 and
    /// `lookahead_ms` >= 0; invalid values fail with `InvalidConfig`, no
    /// defaulting.
    pub fn create_clock(
        &self,
        resolution_beats: f64,
        lookahead_ms: f64,
        callback: ClockCallback,
    ) -> Result<ClockHandle> {
        if !resolution_beats.is_finite() || resolution_beats <= 0.0 {
            return Err(Error::InvalidConfig(format!(
                "clock resolution must be > 0, got {resolution_beats}"
            )));
        }
        if !lookahead_ms.is_finite() || lookahead_ms < 0.0 {
            return Err(Error::InvalidConfig(format!(
                "clock lookahead must be >= 0 ms, got {lookahead_ms}"
            )));
        }

        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        self.shared.subscriptions.lock().push(ClockSubscription {
            id,
            resolution: resolution_beats,
            lookahead_ms,
            callback,
        });
        debug!(clock = id, resolution_beats, lookahead_ms, "clock: created");
        Ok(ClockHandle {
            id,
            shared: Arc::clone(&self.shared),
            destroyed: AtomicBool::new(false),
        })
    }

    /// Pre-fire boundaries inside the initial lookahead window. Called on
    /// transport play and seek so callbacks get their lead time from the
    /// first block.
    pub fn prime(&self, start_beat: f64, tempo: f64, loop_range: Option<(f64, f64)>) {
        let (looping, loop_start, loop_end) = match loop_range {
            Some((s, e)) => (true, s, e),
            None => (false, 0.0, 0.0),
        };
        *self.shared.prime.lock() = Some(PrimeRequest {
            start_beat,
            tempo,
            looping,
            loop_start,
            loop_end,
        });
        let _ = self.shared.notify_tx.try_send(());
    }

    /// Transport stopped: clear any pending prime.
    pub fn on_transport_stop(&self) {
        self.shared.stop_pending.store(true, Ordering::Release);
        let _ = self.shared.notify_tx.try_send(());
    }

    pub fn subscription_count(&self) -> usize {
        self.shared.subscriptions.lock().len()
    }
}

impl Drop for ClockDispatch {
    fn drop(&mut self) {
        self.shared.running.store(false, Ordering::Release);
        let _ = self.shared.notify_tx.try_send(());
        if let Some(thread) = self.thread.lock().take() {
            let _ = thread.join();
        }
        debug!("clock: dispatch thread stopped");
    }
}

fn dispatch_loop(
    shared: Arc<ClockShared>,
    notify_rx: Receiver<()>,
    mut updates: HeapCons<BeatRangeUpdate>,
) {
    while shared.running.load(Ordering::Acquire) {
        if notify_rx.recv().is_err() {
            break;
        }
        if !shared.running.load(Ordering::Acquire) {
            break;
        }

        if shared.stop_pending.swap(false, Ordering::AcqRel) {
            shared.prime.lock().take();
        }

        let prime = shared.prime.lock().take();
        if let Some(req) = prime {
            handle_prime(&shared, req);
        }

        while let Some(update) = updates.try_pop() {
            process_update(&shared, &update);
        }
    }
}

fn process_update(shared: &ClockShared, update: &BeatRangeUpdate) {
    let subs = shared.subscriptions.lock();
    for sub in subs.iter() {
        let lookahead_beats = sub.lookahead_ms * update.tempo / 60_000.0;
        let window_start = update.old_beat + lookahead_beats;
        let window_end = update.new_beat + lookahead_beats;
        fire_window(
            sub,
            window_start,
            window_end,
            update.looping,
            update.loop_start,
            update.loop_end,
        );
    }
}

fn handle_prime(shared: &ClockShared, req: PrimeRequest) {
    let subs = shared.subscriptions.lock();
    for sub in subs.iter() {
        let lookahead_beats = sub.lookahead_ms * req.tempo / 60_000.0;
        if lookahead_beats <= 0.0 {
            continue;
        }
        fire_window(
            sub,
            req.start_beat,
            req.start_beat + lookahead_beats,
            req.looping,
            req.loop_start,
            req.loop_end,
        );
    }
}

/// Fire boundaries in `(window_start, window_end]`, splitting the window at
/// the loop seam when it extends past the loop end.
fn fire_window(
    sub: &ClockSubscription,
    window_start: f64,
    window_end: f64,
    looping: bool,
    loop_start: f64,
    loop_end: f64,
) {
    if !looping || window_end <= loop_end {
        fire_boundaries(sub, window_start, window_end);
        return;
    }

    if window_start < loop_end {
        // Partial wrap: tail of this pass, then the head of the next.
        fire_boundaries(sub, window_start, loop_end);
        let overflow = window_end - loop_end;
        fire_boundaries(sub, loop_start, loop_start + overflow);
    } else {
        // Both endpoints past the loop end.
        let loop_len = loop_end - loop_start;
        if loop_len <= 0.0 {
            return;
        }
        let wrapped_start = loop_start + (window_start - loop_end) % loop_len;
        let wrapped_end = loop_start + (window_end - loop_end) % loop_len;
        if wrapped_start < wrapped_end {
            fire_boundaries(sub, wrapped_start, wrapped_end);
        } else {
            fire_boundaries(sub, wrapped_start, loop_end);
            fire_boundaries(sub, loop_start, wrapped_end);
        }
    }
}

fn fire_boundaries(sub: &ClockSubscription, window_start: f64, window_end: f64) {
    for beat in boundary_beats(window_start, window_end, sub.resolution) {
        let result = catch_unwind(AssertUnwindSafe(|| (sub.callback)(beat)));
        if result.is_err() {
            warn!(clock = sub.id, beat, "clock: callback panicked, skipping");
        }
    }
}

/// Resolution boundaries in `(window_start, window_end]`.
fn boundary_beats(window_start: f64, window_end: f64, resolution: f64) -> Vec<f64> {
    let first = (window_start / resolution).floor() as i64 + 1;
    let last = (window_end / resolution).floor() as i64;
    (first..=last).map(|t| t as f64 * resolution).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    fn collect_beats() -> (Arc<Mutex<Vec<f64>>>, ClockCallback) {
        let beats = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&beats);
        (beats, Box::new(move |beat| sink.lock().push(beat)))
    }

    fn wait_for<F: Fn() -> bool>(cond: F) {
        let deadline = Instant::now() + Duration::from_secs(2);
        while !cond() {
            assert!(Instant::now() < deadline, "timed out waiting for clock");
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn test_boundary_beats() {
        assert_eq!(boundary_beats(0.0, 2.0, 1.0), vec![1.0, 2.0]);
        assert_eq!(boundary_beats(0.5, 0.9, 1.0), Vec::<f64>::new());
        assert_eq!(boundary_beats(0.9, 1.1, 0.5), vec![1.0]);
        // Start boundary itself is excluded.
        assert_eq!(boundary_beats(1.0, 1.5, 1.0), Vec::<f64>::new());
    }

    #[test]
    fn test_invalid_config_rejected() {
        let (dispatch, _tx) = ClockDispatch::new();
        assert!(dispatch.create_clock(0.0, 0.0, Box::new(|_| {})).is_err());
        assert!(dispatch.create_clock(-1.0, 0.0, Box::new(|_| {})).is_err());
        assert!(dispatch.create_clock(1.0, -5.0, Box::new(|_| {})).is_err());
        assert!(dispatch.create_clock(1.0, 0.0, Box::new(|_| {})).is_ok());
    }

    #[test]
    fn test_fires_on_beat_boundary() {
        let (dispatch, mut tx) = ClockDispatch::new();
        let (beats, callback) = collect_beats();
        let _clock = dispatch.create_clock(1.0, 0.0, callback).unwrap();

        tx.push(BeatRangeUpdate {
            old_beat: 0.9,
            new_beat: 1.1,
            tempo: 120.0,
            ..Default::default()
        });
        wait_for(|| !beats.lock().is_empty());
        assert_eq!(*beats.lock(), vec![1.0]);
    }

    #[test]
    fn test_no_fire_before_boundary() {
        let (dispatch, mut tx) = ClockDispatch::new();
        let (beats, callback) = collect_beats();
        let _clock = dispatch.create_clock(1.0, 0.0, callback).unwrap();

        tx.push(BeatRangeUpdate {
            old_beat: 0.0,
            new_beat: 0.99,
            tempo: 120.0,
            ..Default::default()
        });
        // Give the dispatcher a moment, then confirm silence.
        std::thread::sleep(Duration::from_millis(50));
        assert!(beats.lock().is_empty());
    }

    #[test]
    fn test_lookahead_shifts_window() {
        let (dispatch, mut tx) = ClockDispatch::new();
        let (beats, callback) = collect_beats();
        // 500ms at 120 BPM = 1 beat of lookahead.
        let _clock = dispatch.create_clock(1.0, 500.0, callback).unwrap();

        tx.push(BeatRangeUpdate {
            old_beat: 0.0,
            new_beat: 0.1,
            tempo: 120.0,
            ..Default::default()
        });
        wait_for(|| !beats.lock().is_empty());
        // Render covered [0, 0.1) but the callback already sees beat 1.0.
        assert_eq!(*beats.lock(), vec![1.0]);
    }

    #[test]
    fn test_loop_seam_fires_both_sides() {
        let (dispatch, mut tx) = ClockDispatch::new();
        let (beats, callback) = collect_beats();
        let _clock = dispatch.create_clock(1.0, 0.0, callback).unwrap();

        tx.push(BeatRangeUpdate {
            old_beat: 3.9,
            new_beat: 4.2,
            tempo: 120.0,
            looping: true,
            loop_start: 0.0,
            loop_end: 4.0,
        });
        wait_for(|| beats.lock().len() >= 1);
        // Boundary 4.0 fires from the pre-wrap tail; the wrapped head
        // (0.0..0.2) contains no boundary for resolution 1.0.
        assert_eq!(*beats.lock(), vec![4.0]);
    }

    #[test]
    fn test_prime_fires_lookahead_window() {
        let (dispatch, _tx) = ClockDispatch::new();
        let (beats, callback) = collect_beats();
        // 1 beat of lookahead at 120 BPM.
        let _clock = dispatch.create_clock(0.5, 500.0, callback).unwrap();

        dispatch.prime(0.0, 120.0, None);
        wait_for(|| beats.lock().len() >= 2);
        assert_eq!(*beats.lock(), vec![0.5, 1.0]);
    }

    #[test]
    fn test_destroy_idempotent() {
        let (dispatch, mut tx) = ClockDispatch::new();
        let (beats, callback) = collect_beats();
        let clock = dispatch.create_clock(1.0, 0.0, callback).unwrap();
        assert_eq!(dispatch.subscription_count(), 1);

        clock.destroy();
        clock.destroy();
        assert_eq!(dispatch.subscription_count(), 0);

        tx.push(BeatRangeUpdate {
            old_beat: 0.0,
            new_beat: 2.0,
            tempo: 120.0,
            ..Default::default()
        });
        std::thread::sleep(Duration::from_millis(50));
        assert!(beats.lock().is_empty());
    }

    #[test]
    fn test_drop_joins_thread() {
        let (dispatch, _tx) = ClockDispatch::new();
        drop(dispatch);
    }

    #[test]
    fn test_callback_panic_does_not_kill_dispatch() {
        let (dispatch, mut tx) = ClockDispatch::new();
        let _bad = dispatch
            .create_clock(1.0, 0.0, Box::new(|_| panic!("boom")))
            .unwrap();
        let (beats, callback) = collect_beats();
        let _good = dispatch.create_clock(1.0, 0.0, callback).unwrap();

        tx.push(BeatRangeUpdate {
            old_beat: 0.0,
            new_beat: 1.0,
            tempo: 120.0,
            ..Default::default()
        });
        wait_for(|| !beats.lock().is_empty());
        assert_eq!(*beats.lock(), vec![1.0]);
    }
}
