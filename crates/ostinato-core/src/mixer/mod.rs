//! Mixer-level state: strips, sends, and block meters.
//!
//! Sources and buses are graph nodes with an attached [`Strip`] (gain, pan,
//! bypass), an insert [`Chain`], and zero or more [`AuxSend`] records. Strips
//! and meters are shared atomics so control-thread writes land without a
//! snapshot rebuild; structural changes (chains, sends, routes) go through
//! the snapshot path.

mod chain;

pub use chain::{Chain, ProcessorHandle, ProcessorSlot};

use crate::lockfree::{AtomicFlag, AtomicFloat};
use crate::graph::NodeId;
use std::sync::Arc;

/// Where a send taps the signal relative to the fader.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendTap {
    PreFader,
    PostFader,
}

/// A parallel weighted path from a source/bus into a bus.
///
/// Sends are evaluated during bus mixdown; they do not create graph
/// connections.
#[derive(Debug, Clone)]
pub struct AuxSend {
    pub id: u32,
    pub dest: NodeId,
    pub level_db: f32,
    pub tap: SendTap,
}

/// Gain/pan/bypass state shared between control threads and the render path.
#[derive(Debug)]
pub struct Strip {
    gain: AtomicFloat,
    pan: AtomicFloat,
    bypassed: AtomicFlag,
}

impl Strip {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            gain: AtomicFloat::new(1.0),
            pan: AtomicFloat::new(0.0),
            bypassed: AtomicFlag::new(false),
        })
    }

    pub fn gain(&self) -> f32 {
        self.gain.get()
    }

    pub fn set_gain(&self, linear: f32) {
        self.gain.set(linear.max(0.0));
    }

    pub fn pan(&self) -> f32 {
        self.pan.get()
    }

    pub fn set_pan(&self, pan: f32) {
        self.pan.set(pan.clamp(-1.0, 1.0));
    }

    pub fn bypassed(&self) -> bool {
        self.bypassed.get()
    }

    pub fn set_bypassed(&self, bypassed: bool) {
        self.bypassed.set(bypassed);
    }
}

/// Per-bus block meter. Written by the render thread, read anywhere.
///
/// Values reflect the most recent render block only; [`BusMeter::reset`]
/// zeroes them when the engine goes idle.
#[derive(Debug, Default)]
pub struct BusMeter {
    peak: AtomicFloat,
    rms: AtomicFloat,
}

impl BusMeter {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn peak(&self) -> f32 {
        self.peak.get()
    }

    pub fn rms(&self) -> f32 {
        self.rms.get()
    }

    pub fn update(&self, peak: f32, rms: f32) {
        self.peak.set(peak);
        self.rms.set(rms);
    }

    pub fn reset(&self) {
        self.peak.set(0.0);
        self.rms.set(0.0);
    }
}
