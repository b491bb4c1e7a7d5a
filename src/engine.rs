//! High-level engine facade.
//!
//! Wraps [`ostinato_core::System`] behind a cloneable handle, adds
//! convenience constructors for the built-in processors, and exposes a
//! fluent transport control.

use crate::error::Result;
use crate::EngineBuilder;
use ostinato_core::{
    AudioBuffer, AuxSend, ClockCallback, ClockHandle, NodeGraph, NodeId, ParamDescriptor,
    PerfMonitor, ProcessorHandle, SendTap, System, TimeSignature, TransportState,
};
use ostinato_core::processor::Processor;
use ostinato_dsp::{ConstGenerator, TestSynth};
use std::sync::Arc;

/// The engine: a mixer over a node graph, a musical transport, a
/// sample-accurate event scheduler, lookahead clocks, and a performance
/// monitor.
///
/// Cheap to clone; clones share the same engine.
#[derive(Clone)]
pub struct Engine {
    system: Arc<System>,
}

impl Engine {
    pub fn builder() -> EngineBuilder {
        EngineBuilder::default()
    }

    pub(crate) fn from_system(system: System) -> Self {
        Self {
            system: Arc::new(system),
        }
    }

    /// Engine version string.
    pub fn version(&self) -> &'static str {
        System::version()
    }

    /// The underlying system, for anything the facade does not cover.
    pub fn system(&self) -> &Arc<System> {
        &self.system
    }

    pub fn sample_rate(&self) -> f64 {
        self.system.sample_rate()
    }

    pub fn block_size(&self) -> usize {
        self.system.block_size()
    }

    // --- Sources and buses ---

    /// Add a source around a caller-supplied generator. New sources route to
    /// the master bus.
    pub fn add_source(&self, name: &str, generator: Box<dyn Processor>) -> NodeId {
        self.system.add_source(name, generator)
    }

    /// Add a source backed by the built-in polyphonic sine synth.
    pub fn add_test_synth(&self, name: &str) -> NodeId {
        self.system.add_source(name, Box::new(TestSynth::new()))
    }

    /// Add a source emitting a constant level (useful for routing tests).
    pub fn add_const_source(&self, name: &str, level: f32) -> NodeId {
        self.system
            .add_source(name, Box::new(ConstGenerator::new(level)))
    }

    pub fn remove_source(&self, id: NodeId) -> bool {
        self.system.remove_source(id)
    }

    pub fn add_bus(&self, name: &str) -> NodeId {
        self.system.add_bus(name)
    }

    pub fn remove_bus(&self, id: NodeId) -> bool {
        self.system.remove_bus(id)
    }

    pub fn master(&self) -> NodeId {
        self.system.master()
    }

    pub fn source_count(&self) -> usize {
        self.system.source_count()
    }

    pub fn bus_count(&self) -> usize {
        self.system.bus_count()
    }

    pub fn name(&self, id: NodeId) -> String {
        self.system.name(id)
    }

    // --- Routing ---

    pub fn route(&self, from: NodeId, to: NodeId) -> Result<()> {
        Ok(self.system.route(from, to)?)
    }

    pub fn send(&self, from: NodeId, to: NodeId, level_db: f32, tap: SendTap) -> Result<u32> {
        Ok(self.system.add_send(from, to, level_db, tap)?)
    }

    pub fn remove_send(&self, from: NodeId, send_id: u32) -> bool {
        self.system.remove_send(from, send_id)
    }

    pub fn set_send_level(&self, from: NodeId, send_id: u32, level_db: f32) -> bool {
        self.system.set_send_level(from, send_id, level_db)
    }

    pub fn sends(&self, from: NodeId) -> Vec<AuxSend> {
        self.system.sends(from)
    }

    // --- Strips, chains, parameters ---

    pub fn set_gain(&self, id: NodeId, linear: f32) {
        self.system.set_gain(id, linear);
    }

    pub fn set_pan(&self, id: NodeId, pan: f32) {
        self.system.set_pan(id, pan);
    }

    pub fn set_bypassed(&self, id: NodeId, bypassed: bool) {
        self.system.set_bypassed(id, bypassed);
    }

    pub fn chain_append(&self, owner: NodeId, processor: Box<dyn Processor>) -> Result<ProcessorHandle> {
        Ok(self.system.chain_append(owner, processor)?)
    }

    pub fn chain_len(&self, owner: NodeId) -> usize {
        self.system.chain_len(owner)
    }

    pub fn generator(&self, source: NodeId) -> Option<ProcessorHandle> {
        self.system.generator(source)
    }

    pub fn param(&self, handle: ProcessorHandle, name: &str) -> f32 {
        self.system.param(handle, name)
    }

    pub fn set_param(&self, handle: ProcessorHandle, name: &str, value: f32) -> bool {
        self.system.set_param(handle, name, value)
    }

    pub fn param_descriptors(&self, handle: ProcessorHandle) -> Vec<ParamDescriptor> {
        self.system.param_descriptors(handle)
    }

    // --- Metering ---

    pub fn bus_peak(&self, id: NodeId) -> f32 {
        self.system.bus_peak(id)
    }

    pub fn bus_rms(&self, id: NodeId) -> f32 {
        self.system.bus_rms(id)
    }

    // --- Graph, batch ---

    /// Operate directly on the node graph (connections, render order).
    pub fn graph<F, R>(&self, f: F) -> R
    where
        F: FnOnce(&mut NodeGraph) -> R,
    {
        self.system.graph(f)
    }

    /// Apply a burst of mutations as one atomic topology swap.
    ///
    /// # Example
    /// ```ignore
    /// engine.batch(|e| {
    ///     let a = e.add_test_synth("A");
    ///     let b = e.add_test_synth("B");
    ///     e.route(a, e.master())?;
    ///     e.route(b, e.master())
    /// })?;
    /// ```
    pub fn batch<F, R>(&self, f: F) -> R
    where
        F: FnOnce(&Engine) -> R,
    {
        let engine = self.clone();
        self.system.batch(move |_| f(&engine))
    }

    // --- Transport ---

    /// Fluent transport control.
    ///
    /// # Example
    /// ```ignore
    /// engine.transport()
    ///     .tempo(128.0)
    ///     .loop_range(0.0, 16.0)
    ///     .enable_loop()
    ///     .play();
    /// ```
    pub fn transport(&self) -> TransportControl {
        TransportControl {
            system: Arc::clone(&self.system),
        }
    }

    // --- Scheduling ---

    pub fn schedule_note_on(
        &self,
        source: NodeId,
        beat: f64,
        channel: u8,
        note: u8,
        velocity: f32,
    ) -> bool {
        self.system
            .schedule_note_on(source, beat, channel, note, velocity)
    }

    pub fn schedule_note_off(&self, source: NodeId, beat: f64, channel: u8, note: u8) -> bool {
        self.system.schedule_note_off(source, beat, channel, note)
    }

    pub fn schedule_cc(
        &self,
        source: NodeId,
        beat: f64,
        channel: u8,
        controller: u8,
        value: u8,
    ) -> bool {
        self.system
            .schedule_cc(source, beat, channel, controller, value)
    }

    pub fn schedule_param_change(
        &self,
        handle: ProcessorHandle,
        beat: f64,
        name: &str,
        value: f32,
    ) -> bool {
        self.system.schedule_param_change(handle, beat, name, value)
    }

    // --- Clocks ---

    /// Subscribe a lookahead beat clock. The callback runs on the clock
    /// thread with the *future* beat value, so scheduling calls made inside
    /// it land before the render thread reaches that beat.
    pub fn clock(
        &self,
        resolution_beats: f64,
        lookahead_ms: f64,
        callback: impl Fn(f64) + Send + 'static,
    ) -> Result<ClockHandle> {
        Ok(self
            .system
            .create_clock(resolution_beats, lookahead_ms, Box::new(callback))?)
    }

    /// Trait-object variant of [`Engine::clock`].
    pub fn clock_boxed(
        &self,
        resolution_beats: f64,
        lookahead_ms: f64,
        callback: ClockCallback,
    ) -> Result<ClockHandle> {
        Ok(self
            .system
            .create_clock(resolution_beats, lookahead_ms, callback)?)
    }

    // --- Monitoring ---

    pub fn perf(&self) -> &Arc<PerfMonitor> {
        self.system.perf()
    }

    // --- Render (test-mode driver) ---

    /// Render one block, discarding audio. Drive this from exactly one
    /// thread.
    pub fn render(&self, num_samples: usize) {
        self.system.render(num_samples);
    }

    /// Render one block into a caller buffer.
    pub fn render_into(&self, out: &mut AudioBuffer) {
        self.system.render_into(out);
    }
}

/// Fluent playback control over the shared transport.
pub struct TransportControl {
    system: Arc<System>,
}

impl TransportControl {
    pub fn tempo(&self, bpm: f64) -> &Self {
        if let Err(err) = self.system.transport().set_tempo(bpm) {
            tracing::debug!(%err, "transport: tempo rejected");
        }
        self
    }

    pub fn time_signature(&self, numerator: u32, denominator: u32) -> &Self {
        if let Err(err) = self.system.transport().set_time_signature(numerator, denominator) {
            tracing::debug!(%err, "transport: time signature rejected");
        }
        self
    }

    pub fn loop_range(&self, start_beats: f64, end_beats: f64) -> &Self {
        if let Err(err) = self.system.transport().set_loop_points(start_beats, end_beats) {
            tracing::debug!(%err, "transport: loop range rejected");
        }
        self
    }

    pub fn enable_loop(&self) -> &Self {
        self.system.transport().set_looping(true);
        self
    }

    pub fn disable_loop(&self) -> &Self {
        self.system.transport().set_looping(false);
        self
    }

    pub fn seek(&self, beats: f64) -> &Self {
        self.system.seek_beats(beats);
        self
    }

    pub fn play(&self) {
        self.system.play();
    }

    pub fn pause(&self) {
        self.system.pause();
    }

    pub fn stop(&self) {
        self.system.stop();
    }

    // --- Queries ---

    pub fn state(&self) -> TransportState {
        self.system.transport().state()
    }

    pub fn is_playing(&self) -> bool {
        self.system.transport().is_playing()
    }

    pub fn position(&self) -> f64 {
        self.system.transport().position_beats()
    }

    pub fn current_tempo(&self) -> f64 {
        self.system.transport().tempo()
    }

    pub fn current_time_signature(&self) -> TimeSignature {
        self.system.transport().time_signature()
    }

    pub fn loop_enabled(&self) -> bool {
        self.system.transport().is_looping()
    }
}
