//! Render-path performance monitoring.
//!
//! Wraps the render entry point: wall-clock duration per block, windowed
//! average and running peak, cpu load against the real-time budget, and xrun
//! detection with a clamped threshold. Disabled monitoring is a true no-op;
//! every hook branches before touching a clock source.

use crate::lockfree::{AtomicDouble, AtomicFlag, AtomicFloat};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Instant;
use tracing::warn;

/// Hard cap on profiled mixer slots per block.
pub const MAX_SLOTS: usize = 256;

const MIN_XRUN_THRESHOLD: f32 = 0.1;
const MAX_XRUN_THRESHOLD: f32 = 2.0;

/// Per-slot (source/bus) timing, keyed by mixer handle.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SlotPerf {
    pub handle: u32,
    pub avg_us: f64,
    pub peak_us: f64,
}

/// Control-thread-readable performance data.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PerfSnapshot {
    pub callback_avg_us: f64,
    pub callback_peak_us: f64,
    pub cpu_load_percent: f64,
    pub xrun_count: u32,
    pub callback_count: u64,
    pub sample_rate: f64,
    pub block_size: usize,
    pub budget_us: f64,
    pub slots: Vec<SlotPerf>,
}

#[derive(Debug, Clone, Copy, Default)]
struct SlotAcc {
    handle: u32,
    sum_us: f64,
    peak_us: f64,
    started: Option<Instant>,
}

#[derive(Debug, Default)]
struct Accumulator {
    sum_us: f64,
    peak_us: f64,
    count: u32,
    block_start: Option<Instant>,
    slots: Vec<SlotAcc>,
}

impl Accumulator {
    fn reset_window(&mut self) {
        self.sum_us = 0.0;
        self.peak_us = 0.0;
        self.count = 0;
        self.slots.clear();
    }
}

/// RT-safe render instrumentation.
///
/// The accumulator lives in an `UnsafeCell` and is touched only by the
/// render thread through the `begin_*`/`end_*` hooks; everything the control
/// side reads is atomics or a briefly-locked slot list.
pub struct PerfMonitor {
    enabled: AtomicFlag,
    slot_profiling: AtomicFlag,
    xrun_threshold: AtomicFloat,

    xrun_count: AtomicU32,
    callback_count: AtomicU64,

    avg_us: AtomicDouble,
    peak_us: AtomicDouble,
    cpu_load: AtomicDouble,
    published_slots: Mutex<Vec<SlotPerf>>,

    sample_rate: f64,
    block_size: usize,
    budget_us: f64,
    /// Callbacks per publish window (~100 ms).
    window_len: u32,

    accumulator: UnsafeCell<Accumulator>,
}

// SAFETY: the accumulator is only accessed from the render thread via the
// begin/end hooks; all cross-thread state is atomic or mutex-guarded.
unsafe impl Send for PerfMonitor {}
unsafe impl Sync for PerfMonitor {}

impl PerfMonitor {
    pub fn new(sample_rate: f64, block_size: usize) -> Self {
        let budget_us = if sample_rate > 0.0 {
            block_size as f64 / sample_rate * 1e6
        } else {
            0.0
        };
        let window_len = if sample_rate > 0.0 && block_size > 0 {
            ((sample_rate / block_size as f64 / 10.0) as u32).max(1)
        } else {
            1
        };

        Self {
            enabled: AtomicFlag::new(false),
            slot_profiling: AtomicFlag::new(false),
            xrun_threshold: AtomicFloat::new(1.0),
            xrun_count: AtomicU32::new(0),
            callback_count: AtomicU64::new(0),
            avg_us: AtomicDouble::new(0.0),
            peak_us: AtomicDouble::new(0.0),
            cpu_load: AtomicDouble::new(0.0),
            published_slots: Mutex::new(Vec::new()),
            sample_rate,
            block_size,
            budget_us,
            window_len,
            accumulator: UnsafeCell::new(Accumulator::default()),
        }
    }

    // --- Control thread ---

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.set(enabled);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.get()
    }

    pub fn set_slot_profiling(&self, enabled: bool) {
        self.slot_profiling.set(enabled);
    }

    pub fn is_slot_profiling(&self) -> bool {
        self.slot_profiling.get()
    }

    /// Clamped to [0.1, 2.0]; out-of-range values are clamped, not rejected.
    pub fn set_xrun_threshold(&self, factor: f64) {
        let clamped = (factor as f32).clamp(MIN_XRUN_THRESHOLD, MAX_XRUN_THRESHOLD);
        self.xrun_threshold.set(clamped);
    }

    pub fn xrun_threshold(&self) -> f64 {
        self.xrun_threshold.get() as f64
    }

    pub fn budget_us(&self) -> f64 {
        self.budget_us
    }

    pub fn snapshot(&self) -> PerfSnapshot {
        PerfSnapshot {
            callback_avg_us: self.avg_us.get(),
            callback_peak_us: self.peak_us.get(),
            cpu_load_percent: self.cpu_load.get(),
            xrun_count: self.xrun_count.load(Ordering::Relaxed),
            callback_count: self.callback_count.load(Ordering::Relaxed),
            sample_rate: self.sample_rate,
            block_size: self.block_size,
            budget_us: self.budget_us,
            slots: self.published_slots.lock().clone(),
        }
    }

    /// Zero cumulative counters. Configuration (enabled flags, threshold)
    /// is untouched.
    pub fn reset(&self) {
        self.xrun_count.store(0, Ordering::Relaxed);
        self.callback_count.store(0, Ordering::Relaxed);
        self.avg_us.set(0.0);
        self.peak_us.set(0.0);
        self.cpu_load.set(0.0);
        self.published_slots.lock().clear();
    }

    // --- Render thread ---

    #[allow(clippy::mut_from_ref)]
    unsafe fn acc(&self) -> &mut Accumulator {
        &mut *self.accumulator.get()
    }

    pub fn begin_block(&self) {
        if !self.enabled.get() {
            return;
        }
        // SAFETY: render thread only.
        let acc = unsafe { self.acc() };
        acc.block_start = Some(Instant::now());
    }

    pub fn end_block(&self) {
        if !self.enabled.get() {
            return;
        }
        // SAFETY: render thread only.
        let acc = unsafe { self.acc() };
        let Some(start) = acc.block_start.take() else {
            return;
        };
        let duration_us = start.elapsed().as_secs_f64() * 1e6;

        acc.sum_us += duration_us;
        if duration_us > acc.peak_us {
            acc.peak_us = duration_us;
        }
        acc.count += 1;

        self.callback_count.fetch_add(1, Ordering::Relaxed);

        if self.budget_us > 0.0 {
            let limit = self.budget_us * self.xrun_threshold.get() as f64;
            if duration_us > limit {
                let total = self.xrun_count.fetch_add(1, Ordering::Relaxed) + 1;
                warn!(
                    duration_us,
                    budget_us = self.budget_us,
                    total,
                    "perf: xrun"
                );
            }
        }

        // Running peak survives across windows until reset.
        if duration_us > self.peak_us.get() {
            self.peak_us.set(duration_us);
        }

        if acc.count >= self.window_len {
            self.publish();
        }
    }

    pub fn begin_slot(&self, slot_index: usize, handle: u32) {
        if !self.enabled.get() || !self.slot_profiling.get() || slot_index >= MAX_SLOTS {
            return;
        }
        // SAFETY: render thread only.
        let acc = unsafe { self.acc() };
        if acc.slots.len() <= slot_index {
            acc.slots.resize(slot_index + 1, SlotAcc::default());
        }
        acc.slots[slot_index].handle = handle;
        acc.slots[slot_index].started = Some(Instant::now());
    }

    pub fn end_slot(&self, slot_index: usize) {
        if !self.enabled.get() || !self.slot_profiling.get() || slot_index >= MAX_SLOTS {
            return;
        }
        // SAFETY: render thread only.
        let acc = unsafe { self.acc() };
        let Some(slot) = acc.slots.get_mut(slot_index) else {
            return;
        };
        let Some(start) = slot.started.take() else {
            return;
        };
        let duration_us = start.elapsed().as_secs_f64() * 1e6;
        slot.sum_us += duration_us;
        if duration_us > slot.peak_us {
            slot.peak_us = duration_us;
        }
    }

    fn publish(&self) {
        // SAFETY: render thread only.
        let acc = unsafe { self.acc() };
        if acc.count == 0 {
            return;
        }
        let avg = acc.sum_us / acc.count as f64;
        self.avg_us.set(avg);
        self.cpu_load.set(if self.budget_us > 0.0 {
            avg / self.budget_us * 100.0
        } else {
            0.0
        });

        if self.slot_profiling.get() {
            // try_lock: if the control thread is mid-snapshot, skip this
            // publish rather than stall the render thread.
            if let Some(mut published) = self.published_slots.try_lock() {
                published.clear();
                published.extend(acc.slots.iter().map(|s| SlotPerf {
                    handle: s.handle,
                    avg_us: s.sum_us / acc.count as f64,
                    peak_us: s.peak_us,
                }));
            }
        }

        acc.reset_window();
    }
}
