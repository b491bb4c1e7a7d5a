//! Engine assembly: graph + mixer + transport + scheduler + clock + perf.
//!
//! Control threads mutate the mixer through [`System`] methods; every
//! structural change rebuilds a [`MixSnapshot`] and ships it to the render
//! thread over a command channel. The render thread owns the live snapshot
//! exclusively, so buffers inside it are mutated without locks; retired
//! snapshots travel back over a garbage channel and are freed on the next
//! control-thread call, never while a render pass might still hold them.
//!
//! A [`System::batch`] scope defers snapshot publication so a burst of
//! mutations commits as one swap.

use crate::buffer::{db_to_linear, pan_gains, AudioBuffer};
use crate::clock::{BeatRangeUpdate, ClockCallback, ClockDispatch, ClockHandle, ClockUpdateTx};
use crate::error::{Error, Result};
use crate::event::{EventPayload, ResolvedEvent, TimedEvent};
use crate::graph::{ConnectionId, NodeGraph, NodeId, NodeKind, PortSpec};
use crate::mixer::{AuxSend, BusMeter, Chain, ProcessorHandle, ProcessorSlot, SendTap, Strip};
use crate::perf::PerfMonitor;
use crate::processor::{ParamDescriptor, Processor};
use crate::scheduler::{event_queue, EventScheduler, EventStaging, LoopContext};
use crate::transport::{BlockWindow, Transport};
use arc_swap::ArcSwap;
use crossbeam_channel::{unbounded, Receiver, Sender};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::cell::UnsafeCell;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// A resolved send inside a snapshot lane. `bus` indexes the snapshot's bus
/// vector.
struct LaneSend {
    bus: usize,
    gain: f32,
    tap: SendTap,
}

struct SourceLane {
    handle: u32,
    strip: Arc<Strip>,
    generator: Arc<ProcessorSlot>,
    chain: Vec<Arc<ProcessorSlot>>,
    sends: Vec<LaneSend>,
    route: Option<usize>,
    buffer: AudioBuffer,
}

struct BusLane {
    handle: u32,
    strip: Arc<Strip>,
    meter: Arc<BusMeter>,
    chain: Vec<Arc<ProcessorSlot>>,
    sends: Vec<LaneSend>,
    route: Option<usize>,
    is_master: bool,
    buffer: AudioBuffer,
}

/// Immutable-topology view of the mixer, owned by the render thread.
/// Buses are in dependency order, master last.
struct MixSnapshot {
    sources: Vec<SourceLane>,
    buses: Vec<BusLane>,
}

enum Command {
    SwapSnapshot(Box<MixSnapshot>),
    ClearEvents,
}

/// State owned by the render thread, reached through an `UnsafeCell`.
struct RenderState {
    snapshot: Option<Box<MixSnapshot>>,
    staging: EventStaging,
    resolved: Vec<ResolvedEvent>,
    lane_events: Vec<TimedEvent>,
    clock_tx: ClockUpdateTx,
    output: AudioBuffer,
    cmd_rx: Receiver<Command>,
    garbage_tx: Sender<Box<MixSnapshot>>,
}

struct SourceRecord {
    id: NodeId,
    name: String,
    strip: Arc<Strip>,
    generator: Arc<ProcessorSlot>,
    chain: Chain,
    sends: Vec<AuxSend>,
    next_send_id: u32,
    route: Option<NodeId>,
    route_conn: Option<ConnectionId>,
}

struct BusRecord {
    id: NodeId,
    name: String,
    strip: Arc<Strip>,
    meter: Arc<BusMeter>,
    chain: Chain,
    sends: Vec<AuxSend>,
    next_send_id: u32,
    route: Option<NodeId>,
    route_conn: Option<ConnectionId>,
    is_master: bool,
}

struct EngineState {
    graph: NodeGraph,
    sources: Vec<SourceRecord>,
    buses: Vec<BusRecord>,
    master: NodeId,
    batching: bool,
    dirty: bool,
}

impl EngineState {
    fn source(&self, id: NodeId) -> Option<&SourceRecord> {
        self.sources.iter().find(|s| s.id == id)
    }

    fn source_mut(&mut self, id: NodeId) -> Option<&mut SourceRecord> {
        self.sources.iter_mut().find(|s| s.id == id)
    }

    fn bus(&self, id: NodeId) -> Option<&BusRecord> {
        self.buses.iter().find(|b| b.id == id)
    }

    fn bus_mut(&mut self, id: NodeId) -> Option<&mut BusRecord> {
        self.buses.iter_mut().find(|b| b.id == id)
    }

    /// Would routing or sending `from` into `to` close a mixdown cycle?
    /// BFS downstream from `to` over bus routes and sends.
    fn bus_cycle(&self, from: NodeId, to: NodeId) -> bool {
        if from == to {
            return true;
        }
        let mut frontier = VecDeque::from([to]);
        let mut visited = HashSet::from([to]);
        while let Some(current) = frontier.pop_front() {
            let Some(bus) = self.bus(current) else { continue };
            let downstream = bus
                .route
                .into_iter()
                .chain(bus.sends.iter().map(|s| s.dest));
            for next in downstream {
                if next == from {
                    return true;
                }
                if visited.insert(next) {
                    frontier.push_back(next);
                }
            }
        }
        false
    }
}

/// The assembled engine core.
///
/// All mutation methods are callable from any control thread. `render` must
/// only be invoked by one thread at a time (the audio device callback or a
/// test-mode driver); everything it touches beyond the shared atomics lives
/// in render-owned state.
pub struct System {
    state: Mutex<EngineState>,
    registry: DashMap<ProcessorHandle, Arc<ProcessorSlot>>,
    /// Valid note/CC schedule targets, swapped on source add/remove so the
    /// enqueue path stays lock-free.
    source_directory: ArcSwap<HashSet<u32>>,
    transport: Arc<Transport>,
    scheduler: EventScheduler,
    perf: Arc<PerfMonitor>,
    clock: ClockDispatch,
    cmd_tx: Sender<Command>,
    garbage_rx: Receiver<Box<MixSnapshot>>,
    render_state: UnsafeCell<RenderState>,
    next_handle: AtomicU32,
    sample_rate: f64,
    block_size: usize,
}

// SAFETY: `render_state` is only accessed inside `render`/`render_into`,
// which the caller contract restricts to a single render thread; every other
// field is Sync (mutex, atomics, channels, DashMap, ArcSwap).
unsafe impl Send for System {}
unsafe impl Sync for System {}

impl System {
    pub fn builder() -> SystemBuilder {
        SystemBuilder::default()
    }

    pub fn version() -> &'static str {
        env!("CARGO_PKG_VERSION")
    }

    pub fn sample_rate(&self) -> f64 {
        self.sample_rate
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn transport(&self) -> &Arc<Transport> {
        &self.transport
    }

    pub fn perf(&self) -> &Arc<PerfMonitor> {
        &self.perf
    }

    // --- Graph access ---

    /// Operate on the node graph directly. The mixer snapshot is republished
    /// when the closure returns (deferred inside a batch).
    pub fn graph<F, R>(&self, f: F) -> R
    where
        F: FnOnce(&mut NodeGraph) -> R,
    {
        self.collect_garbage();
        let mut state = self.state.lock();
        let result = f(&mut state.graph);
        self.publish(&mut state);
        result
    }

    // --- Sources and buses ---

    pub fn add_source(&self, name: &str, generator: Box<dyn Processor>) -> NodeId {
        self.collect_garbage();
        let mut state = self.state.lock();

        let id = state.graph.add_node(
            NodeKind::Source,
            name,
            vec![PortSpec::midi_in("midi"), PortSpec::audio_out("out", 2)],
        );
        let slot = self.register(generator);
        let master = state.master;
        let route_conn = self.connect_route(&mut state, id, master);

        state.sources.push(SourceRecord {
            id,
            name: name.to_string(),
            strip: Strip::new(),
            generator: slot,
            chain: Chain::new(),
            sends: Vec::new(),
            next_send_id: 1,
            route: Some(master),
            route_conn,
        });
        debug!(source = id.0, name, "system: add source");

        self.republish_directory(&state);
        self.publish(&mut state);
        id
    }

    pub fn remove_source(&self, id: NodeId) -> bool {
        self.collect_garbage();
        let mut state = self.state.lock();
        let Some(pos) = state.sources.iter().position(|s| s.id == id) else {
            return false;
        };
        let record = state.sources.remove(pos);
        self.registry.remove(&record.generator.handle());
        for slot in record.chain.slots() {
            self.registry.remove(&slot.handle());
        }
        state.graph.remove_node(id);
        debug!(source = id.0, "system: remove source");

        self.republish_directory(&state);
        self.publish(&mut state);
        true
    }

    pub fn add_bus(&self, name: &str) -> NodeId {
        self.collect_garbage();
        let mut state = self.state.lock();
        let id = self.add_bus_locked(&mut state, name, false);
        self.publish(&mut state);
        id
    }

    fn add_bus_locked(&self, state: &mut EngineState, name: &str, is_master: bool) -> NodeId {
        let id = state.graph.add_node(
            NodeKind::Bus,
            name,
            vec![PortSpec::audio_in("in", 2), PortSpec::audio_out("out", 2)],
        );
        let (route, route_conn) = if is_master {
            let output = state.graph.output_node();
            let conn = state.graph.connect(id, "out", output, "in").ok();
            (None, conn)
        } else {
            let master = state.master;
            let conn = self.connect_route(state, id, master);
            (Some(master), conn)
        };
        state.buses.push(BusRecord {
            id,
            name: name.to_string(),
            strip: Strip::new(),
            meter: BusMeter::new(),
            chain: Chain::new(),
            sends: Vec::new(),
            next_send_id: 1,
            route,
            route_conn,
            is_master,
        });
        debug!(bus = id.0, name, is_master, "system: add bus");
        id
    }

    /// Remove a bus. The master bus is refused; sources and buses that fed
    /// the removed bus are re-routed to master, and sends targeting it are
    /// dropped.
    pub fn remove_bus(&self, id: NodeId) -> bool {
        self.collect_garbage();
        let mut state = self.state.lock();
        let Some(pos) = state.buses.iter().position(|b| b.id == id) else {
            return false;
        };
        if state.buses[pos].is_master {
            warn!(bus = id.0, "system: master bus cannot be removed");
            return false;
        }

        let record = state.buses.remove(pos);
        for slot in record.chain.slots() {
            self.registry.remove(&slot.handle());
        }

        let master = state.master;
        let orphaned_sources: Vec<NodeId> = state
            .sources
            .iter()
            .filter(|s| s.route == Some(id))
            .map(|s| s.id)
            .collect();
        let orphaned_buses: Vec<NodeId> = state
            .buses
            .iter()
            .filter(|b| b.route == Some(id))
            .map(|b| b.id)
            .collect();

        // Removing the graph node cascades the orphans' route connections.
        state.graph.remove_node(id);

        for sid in orphaned_sources {
            let conn = self.connect_route(&mut state, sid, master);
            let src = state.source_mut(sid).unwrap();
            src.route = Some(master);
            src.route_conn = conn;
        }
        for bid in orphaned_buses {
            let conn = self.connect_route(&mut state, bid, master);
            let bus = state.bus_mut(bid).unwrap();
            bus.route = Some(master);
            bus.route_conn = conn;
        }
        for src in &mut state.sources {
            src.sends.retain(|s| s.dest != id);
        }
        for bus in &mut state.buses {
            bus.sends.retain(|s| s.dest != id);
        }

        debug!(bus = id.0, "system: remove bus");
        self.publish(&mut state);
        true
    }

    pub fn master(&self) -> NodeId {
        self.state.lock().master
    }

    pub fn source_count(&self) -> usize {
        self.state.lock().sources.len()
    }

    pub fn bus_count(&self) -> usize {
        self.state.lock().buses.len()
    }

    pub fn sources(&self) -> Vec<NodeId> {
        self.state.lock().sources.iter().map(|s| s.id).collect()
    }

    pub fn buses(&self) -> Vec<NodeId> {
        self.state.lock().buses.iter().map(|b| b.id).collect()
    }

    /// Name lookup; empty string for unknown handles.
    pub fn name(&self, id: NodeId) -> String {
        let state = self.state.lock();
        state
            .source(id)
            .map(|s| s.name.clone())
            .or_else(|| state.bus(id).map(|b| b.name.clone()))
            .unwrap_or_default()
    }

    /// Generator processor handle of a source, or None.
    pub fn generator(&self, source: NodeId) -> Option<ProcessorHandle> {
        self.state
            .lock()
            .source(source)
            .map(|s| s.generator.handle())
    }

    // --- Strip state ---

    /// Shared gain/pan/bypass state for a source or bus.
    pub fn strip(&self, id: NodeId) -> Option<Arc<Strip>> {
        let state = self.state.lock();
        state
            .source(id)
            .map(|s| Arc::clone(&s.strip))
            .or_else(|| state.bus(id).map(|b| Arc::clone(&b.strip)))
    }

    pub fn set_gain(&self, id: NodeId, linear: f32) {
        if let Some(strip) = self.strip(id) {
            strip.set_gain(linear);
        }
    }

    pub fn gain(&self, id: NodeId) -> f32 {
        self.strip(id).map(|s| s.gain()).unwrap_or(0.0)
    }

    pub fn set_pan(&self, id: NodeId, pan: f32) {
        if let Some(strip) = self.strip(id) {
            strip.set_pan(pan);
        }
    }

    pub fn pan(&self, id: NodeId) -> f32 {
        self.strip(id).map(|s| s.pan()).unwrap_or(0.0)
    }

    pub fn set_bypassed(&self, id: NodeId, bypassed: bool) {
        if let Some(strip) = self.strip(id) {
            strip.set_bypassed(bypassed);
        }
    }

    pub fn bypassed(&self, id: NodeId) -> bool {
        self.strip(id).map(|s| s.bypassed()).unwrap_or(false)
    }

    // --- Routing and sends ---

    /// Set the main signal path from a source or bus into a destination bus,
    /// replacing any previous route.
    pub fn route(&self, from: NodeId, to: NodeId) -> Result<()> {
        self.collect_garbage();
        let mut state = self.state.lock();
        if state.bus(to).is_none() {
            return Err(Error::InvalidNode(to.0));
        }

        if state.source(from).is_some() {
            let old_conn = state.source(from).unwrap().route_conn;
            if let Some(conn) = old_conn {
                state.graph.disconnect(conn);
            }
            let conn = Some(state.graph.connect(from, "out", to, "in")?);
            let src = state.source_mut(from).unwrap();
            src.route = Some(to);
            src.route_conn = conn;
        } else if let Some(bus) = state.bus(from) {
            if bus.is_master {
                return Err(Error::MasterImmutable);
            }
            if state.bus_cycle(from, to) {
                warn!(from = from.0, to = to.0, "system: route would create cycle");
                return Err(Error::CycleDetected);
            }
            let old_conn = state.bus(from).unwrap().route_conn;
            if let Some(conn) = old_conn {
                state.graph.disconnect(conn);
            }
            let conn = Some(state.graph.connect(from, "out", to, "in")?);
            let bus = state.bus_mut(from).unwrap();
            bus.route = Some(to);
            bus.route_conn = conn;
        } else {
            return Err(Error::InvalidNode(from.0));
        }

        debug!(from = from.0, to = to.0, "system: route");
        self.publish(&mut state);
        Ok(())
    }

    /// Add a parallel weighted path into a bus. `tap` picks the signal
    /// before or after the sender's fader.
    pub fn add_send(&self, from: NodeId, to: NodeId, level_db: f32, tap: SendTap) -> Result<u32> {
        self.collect_garbage();
        let mut state = self.state.lock();
        if state.bus(to).is_none() {
            return Err(Error::InvalidNode(to.0));
        }

        let id = if state.source(from).is_some() {
            let src = state.source_mut(from).unwrap();
            let id = src.next_send_id;
            src.next_send_id += 1;
            src.sends.push(AuxSend {
                id,
                dest: to,
                level_db,
                tap,
            });
            id
        } else if state.bus(from).is_some() {
            if state.bus_cycle(from, to) {
                warn!(from = from.0, to = to.0, "system: send would create cycle");
                return Err(Error::CycleDetected);
            }
            let bus = state.bus_mut(from).unwrap();
            let id = bus.next_send_id;
            bus.next_send_id += 1;
            bus.sends.push(AuxSend {
                id,
                dest: to,
                level_db,
                tap,
            });
            id
        } else {
            return Err(Error::InvalidNode(from.0));
        };

        debug!(from = from.0, to = to.0, send = id, level_db, "system: add send");
        self.publish(&mut state);
        Ok(id)
    }

    pub fn remove_send(&self, from: NodeId, send_id: u32) -> bool {
        self.collect_garbage();
        let mut state = self.state.lock();
        let sends = match Self::sends_mut(&mut state, from) {
            Some(sends) => sends,
            None => return false,
        };
        let before = sends.len();
        sends.retain(|s| s.id != send_id);
        let removed = sends.len() != before;
        if removed {
            self.publish(&mut state);
        }
        removed
    }

    pub fn set_send_level(&self, from: NodeId, send_id: u32, level_db: f32) -> bool {
        self.collect_garbage();
        let mut state = self.state.lock();
        let Some(send) = Self::send_mut(&mut state, from, send_id) else {
            return false;
        };
        send.level_db = level_db;
        self.publish(&mut state);
        true
    }

    pub fn set_send_tap(&self, from: NodeId, send_id: u32, tap: SendTap) -> bool {
        self.collect_garbage();
        let mut state = self.state.lock();
        let Some(send) = Self::send_mut(&mut state, from, send_id) else {
            return false;
        };
        send.tap = tap;
        self.publish(&mut state);
        true
    }

    pub fn sends(&self, from: NodeId) -> Vec<AuxSend> {
        let state = self.state.lock();
        state
            .source(from)
            .map(|s| s.sends.clone())
            .or_else(|| state.bus(from).map(|b| b.sends.clone()))
            .unwrap_or_default()
    }

    fn sends_mut(state: &mut EngineState, from: NodeId) -> Option<&mut Vec<AuxSend>> {
        if state.source(from).is_some() {
            state.source_mut(from).map(|s| &mut s.sends)
        } else {
            state.bus_mut(from).map(|b| &mut b.sends)
        }
    }

    fn send_mut(state: &mut EngineState, from: NodeId, send_id: u32) -> Option<&mut AuxSend> {
        Self::sends_mut(state, from)?.iter_mut().find(|s| s.id == send_id)
    }

    // --- Insert chains ---

    pub fn chain_append(&self, owner: NodeId, processor: Box<dyn Processor>) -> Result<ProcessorHandle> {
        self.chain_insert(owner, usize::MAX, processor)
    }

    pub fn chain_insert(
        &self,
        owner: NodeId,
        index: usize,
        processor: Box<dyn Processor>,
    ) -> Result<ProcessorHandle> {
        self.collect_garbage();
        let mut state = self.state.lock();
        let slot = self.register(processor);
        let handle = slot.handle();
        if let Some(src) = state.source_mut(owner) {
            src.chain.insert(index, slot);
        } else if let Some(bus) = state.bus_mut(owner) {
            bus.chain.insert(index, slot);
        } else {
            self.registry.remove(&handle);
            return Err(Error::InvalidNode(owner.0));
        }
        debug!(owner = owner.0, proc = handle, "system: chain insert");
        self.publish(&mut state);
        Ok(handle)
    }

    pub fn chain_remove(&self, owner: NodeId, index: usize) -> bool {
        self.collect_garbage();
        let mut state = self.state.lock();
        let removed = if let Some(src) = state.source_mut(owner) {
            src.chain.remove(index)
        } else if let Some(bus) = state.bus_mut(owner) {
            bus.chain.remove(index)
        } else {
            None
        };
        match removed {
            Some(slot) => {
                self.registry.remove(&slot.handle());
                self.publish(&mut state);
                true
            }
            None => false,
        }
    }

    pub fn chain_move(&self, owner: NodeId, from: usize, to: usize) -> bool {
        self.collect_garbage();
        let mut state = self.state.lock();
        let moved = if let Some(src) = state.source_mut(owner) {
            src.chain.shift(from, to)
        } else if let Some(bus) = state.bus_mut(owner) {
            bus.chain.shift(from, to)
        } else {
            false
        };
        if moved {
            self.publish(&mut state);
        }
        moved
    }

    /// Drop every processor in the owner's chain.
    pub fn chain_clear(&self, owner: NodeId) -> bool {
        self.collect_garbage();
        let mut state = self.state.lock();
        let cleared = if let Some(src) = state.source_mut(owner) {
            Some(src.chain.clear())
        } else if let Some(bus) = state.bus_mut(owner) {
            Some(bus.chain.clear())
        } else {
            None
        };
        match cleared {
            Some(slots) => {
                for slot in &slots {
                    self.registry.remove(&slot.handle());
                }
                self.publish(&mut state);
                true
            }
            None => false,
        }
    }

    pub fn chain_len(&self, owner: NodeId) -> usize {
        let state = self.state.lock();
        state
            .source(owner)
            .map(|s| s.chain.len())
            .or_else(|| state.bus(owner).map(|b| b.chain.len()))
            .unwrap_or(0)
    }

    /// Processor handle at a chain position, or None.
    pub fn chain_at(&self, owner: NodeId, index: usize) -> Option<ProcessorHandle> {
        let state = self.state.lock();
        let chain = state
            .source(owner)
            .map(|s| &s.chain)
            .or_else(|| state.bus(owner).map(|b| &b.chain))?;
        chain.at(index).map(|slot| slot.handle())
    }

    // --- Parameters ---

    /// Parameter read; 0.0 for unknown handles or names, so UI code can poll
    /// opportunistically.
    pub fn param(&self, handle: ProcessorHandle, name: &str) -> f32 {
        self.registry
            .get(&handle)
            .map(|slot| slot.lock().param(name))
            .unwrap_or(0.0)
    }

    /// Parameter write; false for unknown handles. Last write wins against
    /// the render thread, visible by the next block start.
    pub fn set_param(&self, handle: ProcessorHandle, name: &str, value: f32) -> bool {
        match self.registry.get(&handle) {
            Some(slot) => {
                slot.lock().set_param(name, value);
                true
            }
            None => false,
        }
    }

    pub fn param_text(&self, handle: ProcessorHandle, name: &str) -> String {
        self.registry
            .get(&handle)
            .map(|slot| slot.lock().param_text(name))
            .unwrap_or_default()
    }

    pub fn param_descriptors(&self, handle: ProcessorHandle) -> Vec<ParamDescriptor> {
        self.registry
            .get(&handle)
            .map(|slot| slot.lock().param_descriptors())
            .unwrap_or_default()
    }

    pub fn processor_name(&self, handle: ProcessorHandle) -> String {
        self.registry
            .get(&handle)
            .map(|slot| slot.name().to_string())
            .unwrap_or_default()
    }

    // --- Metering ---

    /// Peak of the most recent render block; 0.0 for unknown handles or an
    /// idle engine.
    pub fn bus_peak(&self, id: NodeId) -> f32 {
        self.state.lock().bus(id).map(|b| b.meter.peak()).unwrap_or(0.0)
    }

    pub fn bus_rms(&self, id: NodeId) -> f32 {
        self.state.lock().bus(id).map(|b| b.meter.rms()).unwrap_or(0.0)
    }

    // --- Batching ---

    /// Defer snapshot publication across a burst of mutations. The batch
    /// commits as one atomic swap when the closure returns.
    pub fn batch<F, R>(&self, f: F) -> R
    where
        F: FnOnce(&Self) -> R,
    {
        {
            let mut state = self.state.lock();
            state.batching = true;
            state.graph.begin_batch();
        }
        let result = f(self);
        let mut state = self.state.lock();
        state.batching = false;
        state.graph.commit_batch();
        if state.dirty {
            self.publish(&mut state);
        }
        debug!("system: batch committed");
        result
    }

    // --- Transport forwarding ---

    pub fn play(&self) {
        self.transport.play();
        self.clock.prime(
            self.transport.position_beats(),
            self.transport.tempo(),
            self.transport.loop_range(),
        );
    }

    pub fn pause(&self) {
        self.transport.pause();
    }

    /// Stop playback: position returns home, meters clear, generator voices
    /// reset.
    pub fn stop(&self) {
        self.transport.stop();
        self.clock.on_transport_stop();
        let state = self.state.lock();
        for bus in &state.buses {
            bus.meter.reset();
        }
        for src in &state.sources {
            src.generator.lock().reset();
        }
    }

    pub fn seek_beats(&self, beats: f64) {
        self.transport.seek_beats(beats);
        if self.transport.is_playing() {
            self.clock.prime(
                self.transport.position_beats(),
                self.transport.tempo(),
                self.transport.loop_range(),
            );
        }
    }

    // --- Event scheduling ---

    pub fn schedule_note_on(
        &self,
        source: NodeId,
        beat: f64,
        channel: u8,
        note: u8,
        velocity: f32,
    ) -> bool {
        self.schedule_to_source(
            source,
            beat,
            EventPayload::NoteOn {
                channel,
                note,
                velocity,
            },
        )
    }

    pub fn schedule_note_off(&self, source: NodeId, beat: f64, channel: u8, note: u8) -> bool {
        self.schedule_to_source(source, beat, EventPayload::NoteOff { channel, note })
    }

    pub fn schedule_cc(
        &self,
        source: NodeId,
        beat: f64,
        channel: u8,
        controller: u8,
        value: u8,
    ) -> bool {
        self.schedule_to_source(
            source,
            beat,
            EventPayload::ControlChange {
                channel,
                controller,
                value,
            },
        )
    }

    pub fn schedule_param_change(
        &self,
        handle: ProcessorHandle,
        beat: f64,
        name: &str,
        value: f32,
    ) -> bool {
        if !self.registry.contains_key(&handle) {
            return false;
        }
        self.scheduler.schedule(
            handle,
            beat,
            EventPayload::ParamChange {
                name: name.to_string(),
                value,
            },
            self.transport.position_beats(),
            self.loop_context(),
        )
    }

    fn schedule_to_source(&self, source: NodeId, beat: f64, payload: EventPayload) -> bool {
        if !self.source_directory.load().contains(&source.0) {
            return false;
        }
        self.scheduler.schedule(
            source.0,
            beat,
            payload,
            self.transport.position_beats(),
            self.loop_context(),
        )
    }

    fn loop_context(&self) -> LoopContext {
        match self.transport.loop_range() {
            Some((start, end)) => LoopContext {
                enabled: true,
                start,
                end,
            },
            None => LoopContext::disabled(),
        }
    }

    /// Drop all pending scheduled events.
    pub fn clear_events(&self) {
        let _ = self.cmd_tx.send(Command::ClearEvents);
    }

    // --- Clocks ---

    /// Subscribe a lookahead beat clock. See [`ClockDispatch::create_clock`].
    pub fn create_clock(
        &self,
        resolution_beats: f64,
        lookahead_ms: f64,
        callback: ClockCallback,
    ) -> Result<ClockHandle> {
        self.clock.create_clock(resolution_beats, lookahead_ms, callback)
    }

    // --- Render (audio thread) ---

    /// Render one block in test mode, discarding the audio (meters and perf
    /// still update). Must be driven by a single render thread.
    pub fn render(&self, num_samples: usize) {
        // SAFETY: caller contract, see struct docs.
        let rs = unsafe { &mut *self.render_state.get() };
        self.render_block(rs, num_samples);
    }

    /// Render one block into `out` (planar, any channel count; the master
    /// mix is copied across the overlapping channels).
    pub fn render_into(&self, out: &mut AudioBuffer) {
        let frames = out.frames();
        // SAFETY: caller contract, see struct docs.
        let rs = unsafe { &mut *self.render_state.get() };
        self.render_block(rs, frames);
        out.copy_from(&rs.output);
    }

    fn render_block(&self, rs: &mut RenderState, num_samples: usize) {
        self.perf.begin_block();

        while let Ok(cmd) = rs.cmd_rx.try_recv() {
            match cmd {
                Command::SwapSnapshot(snapshot) => {
                    if let Some(old) = rs.snapshot.replace(snapshot) {
                        let _ = rs.garbage_tx.send(old);
                    }
                }
                Command::ClearEvents => rs.staging.clear(),
            }
        }

        rs.output.ensure_frames(num_samples);
        if let Some(snapshot) = rs.snapshot.as_deref_mut() {
            for lane in &mut snapshot.sources {
                lane.buffer.ensure_frames(num_samples);
            }
            for lane in &mut snapshot.buses {
                lane.buffer.ensure_frames(num_samples);
            }
        }

        let window = self.transport.advance(num_samples);
        rs.resolved.clear();
        if window.playing {
            let samples_per_beat = self.transport.samples_per_beat();
            rs.staging.drain_incoming();
            match window.wrap {
                None => rs.staging.retrieve(
                    window.start_beat,
                    window.end_beat,
                    0,
                    num_samples,
                    samples_per_beat,
                    &mut rs.resolved,
                ),
                Some(wrap) => {
                    // Two passes across the seam: pre-wrap tail, then the
                    // post-wrap head, so no event starves at the boundary.
                    rs.staging.retrieve(
                        window.start_beat,
                        wrap.loop_end,
                        0,
                        wrap.pre_wrap_samples.max(1),
                        samples_per_beat,
                        &mut rs.resolved,
                    );
                    rs.staging.retrieve(
                        wrap.loop_start,
                        window.end_beat,
                        wrap.pre_wrap_samples,
                        num_samples - wrap.pre_wrap_samples.min(num_samples),
                        samples_per_beat,
                        &mut rs.resolved,
                    );
                }
            }

            // Parameter changes land before any DSP runs for the block.
            for event in &rs.resolved {
                if let EventPayload::ParamChange { name, value } = &event.payload {
                    if let Some(slot) = self.registry.get(&event.target) {
                        slot.lock().set_param(name, *value);
                    }
                }
            }
        }

        match rs.snapshot.as_deref_mut() {
            Some(snapshot) => {
                Self::mixdown(
                    snapshot,
                    &rs.resolved,
                    &mut rs.lane_events,
                    &mut rs.output,
                    &self.perf,
                );
            }
            None => rs.output.clear(),
        }

        self.perf.end_block();

        if window.playing {
            rs.clock_tx.push(self.beat_range(&window, num_samples));
        }
    }

    fn beat_range(&self, window: &BlockWindow, num_samples: usize) -> BeatRangeUpdate {
        let tempo = self.transport.tempo();
        // Unwrapped end: the dispatcher handles loop folding itself.
        let new_beat = window.start_beat + num_samples as f64 / self.transport.samples_per_beat();
        let (looping, loop_start, loop_end) = match self.transport.loop_range() {
            Some((s, e)) => (true, s, e),
            None => (false, 0.0, 0.0),
        };
        BeatRangeUpdate {
            old_beat: window.start_beat,
            new_beat,
            tempo,
            looping,
            loop_start,
            loop_end,
        }
    }

    fn mixdown(
        snapshot: &mut MixSnapshot,
        resolved: &[ResolvedEvent],
        lane_events: &mut Vec<TimedEvent>,
        output: &mut AudioBuffer,
        perf: &PerfMonitor,
    ) {
        let MixSnapshot { sources, buses } = snapshot;

        for bus in buses.iter_mut() {
            bus.buffer.clear();
        }

        // Sources: generator -> chain -> pre sends -> fader -> post sends
        // -> routed bus.
        for (slot_index, lane) in sources.iter_mut().enumerate() {
            perf.begin_slot(slot_index, lane.handle);
            lane.buffer.clear();

            if !lane.strip.bypassed() {
                lane_events.clear();
                lane_events.extend(
                    resolved
                        .iter()
                        .filter(|e| {
                            e.target == lane.handle
                                && !matches!(e.payload, EventPayload::ParamChange { .. })
                        })
                        .map(|e| TimedEvent {
                            sample_offset: e.sample_offset,
                            payload: e.payload.clone(),
                        }),
                );
                lane.generator
                    .lock()
                    .process_with_events(&mut lane.buffer, lane_events);
                for slot in &lane.chain {
                    slot.lock().process(&mut lane.buffer);
                }
            }

            for send in lane.sends.iter().filter(|s| s.tap == SendTap::PreFader) {
                buses[send.bus].buffer.add_from(&lane.buffer, send.gain);
            }

            lane.buffer.apply_gain(lane.strip.gain());
            let pan = lane.strip.pan();
            if pan != 0.0 && lane.buffer.num_channels() >= 2 {
                let (left, right) = pan_gains(pan);
                lane.buffer.apply_channel_gain(0, left);
                lane.buffer.apply_channel_gain(1, right);
            }

            for send in lane.sends.iter().filter(|s| s.tap == SendTap::PostFader) {
                buses[send.bus].buffer.add_from(&lane.buffer, send.gain);
            }

            if let Some(route) = lane.route {
                buses[route].buffer.add_from(&lane.buffer, 1.0);
            }
            perf.end_slot(slot_index);
        }

        // Buses in dependency order; every send/route targets a later lane.
        let source_slots = sources.len();
        for i in 0..buses.len() {
            let (current, downstream) = buses[i..].split_first_mut().unwrap();
            perf.begin_slot(source_slots + i, current.handle);

            if !current.strip.bypassed() {
                for slot in &current.chain {
                    slot.lock().process(&mut current.buffer);
                }
            }

            for send in current.sends.iter().filter(|s| s.tap == SendTap::PreFader) {
                if let Some(j) = send.bus.checked_sub(i + 1) {
                    if let Some(target) = downstream.get_mut(j) {
                        target.buffer.add_from(&current.buffer, send.gain);
                    }
                }
            }

            current.buffer.apply_gain(current.strip.gain());
            let pan = current.strip.pan();
            if pan != 0.0 && current.buffer.num_channels() >= 2 {
                let (left, right) = pan_gains(pan);
                current.buffer.apply_channel_gain(0, left);
                current.buffer.apply_channel_gain(1, right);
            }

            for send in current.sends.iter().filter(|s| s.tap == SendTap::PostFader) {
                if let Some(j) = send.bus.checked_sub(i + 1) {
                    if let Some(target) = downstream.get_mut(j) {
                        target.buffer.add_from(&current.buffer, send.gain);
                    }
                }
            }

            current
                .meter
                .update(current.buffer.peak(), current.buffer.rms());

            if let Some(j) = current.route.and_then(|r| r.checked_sub(i + 1)) {
                if let Some(target) = downstream.get_mut(j) {
                    target.buffer.add_from(&current.buffer, 1.0);
                }
            }

            if current.is_master {
                output.copy_from(&current.buffer);
            }
            perf.end_slot(source_slots + i);
        }
    }

    // --- Internals ---

    fn register(&self, mut processor: Box<dyn Processor>) -> Arc<ProcessorSlot> {
        processor.prepare(self.sample_rate, self.block_size);
        let handle = self.next_handle.fetch_add(1, Ordering::Relaxed);
        let slot = ProcessorSlot::new(handle, processor);
        self.registry.insert(handle, Arc::clone(&slot));
        slot
    }

    fn connect_route(
        &self,
        state: &mut EngineState,
        from: NodeId,
        to: NodeId,
    ) -> Option<ConnectionId> {
        match state.graph.connect(from, "out", to, "in") {
            Ok(conn) => Some(conn),
            Err(err) => {
                warn!(from = from.0, to = to.0, %err, "system: route connection failed");
                None
            }
        }
    }

    fn republish_directory(&self, state: &EngineState) {
        let directory: HashSet<u32> = state.sources.iter().map(|s| s.id.0).collect();
        self.source_directory.store(Arc::new(directory));
    }

    fn collect_garbage(&self) {
        while self.garbage_rx.try_recv().is_ok() {}
    }

    /// Rebuild and ship the snapshot, or just mark dirty inside a batch.
    fn publish(&self, state: &mut EngineState) {
        if state.batching {
            state.dirty = true;
            return;
        }
        state.dirty = false;
        let snapshot = self.build_snapshot(state);
        let _ = self.cmd_tx.send(Command::SwapSnapshot(snapshot));
    }

    fn build_snapshot(&self, state: &EngineState) -> Box<MixSnapshot> {
        // Bus dependency order via Kahn's algorithm over routes and sends.
        let mut in_degree: HashMap<NodeId, usize> =
            state.buses.iter().map(|b| (b.id, 0)).collect();
        let mut feeds: HashMap<NodeId, Vec<NodeId>> =
            state.buses.iter().map(|b| (b.id, Vec::new())).collect();
        for bus in &state.buses {
            let downstream = bus
                .route
                .into_iter()
                .chain(bus.sends.iter().map(|s| s.dest));
            for next in downstream {
                if in_degree.contains_key(&next) {
                    feeds.get_mut(&bus.id).unwrap().push(next);
                    *in_degree.get_mut(&next).unwrap() += 1;
                }
            }
        }
        let mut ready: VecDeque<NodeId> = state
            .buses
            .iter()
            .filter(|b| in_degree[&b.id] == 0)
            .map(|b| b.id)
            .collect();
        let mut order = Vec::with_capacity(state.buses.len());
        while let Some(current) = ready.pop_front() {
            order.push(current);
            for &next in &feeds[&current] {
                let deg = in_degree.get_mut(&next).unwrap();
                *deg -= 1;
                if *deg == 0 {
                    ready.push_back(next);
                }
            }
        }

        let bus_index: HashMap<NodeId, usize> =
            order.iter().enumerate().map(|(i, &id)| (id, i)).collect();

        let resolve_sends = |sends: &[AuxSend]| -> Vec<LaneSend> {
            sends
                .iter()
                .filter_map(|s| {
                    bus_index.get(&s.dest).map(|&bus| LaneSend {
                        bus,
                        gain: db_to_linear(s.level_db),
                        tap: s.tap,
                    })
                })
                .collect()
        };

        let sources = state
            .sources
            .iter()
            .map(|src| SourceLane {
                handle: src.id.0,
                strip: Arc::clone(&src.strip),
                generator: Arc::clone(&src.generator),
                chain: src.chain.slots().to_vec(),
                sends: resolve_sends(&src.sends),
                route: src.route.and_then(|r| bus_index.get(&r).copied()),
                buffer: AudioBuffer::new(2, self.block_size),
            })
            .collect();

        let buses = order
            .iter()
            .map(|id| {
                let bus = state.bus(*id).unwrap();
                BusLane {
                    handle: bus.id.0,
                    strip: Arc::clone(&bus.strip),
                    meter: Arc::clone(&bus.meter),
                    chain: bus.chain.slots().to_vec(),
                    sends: resolve_sends(&bus.sends),
                    route: bus.route.and_then(|r| bus_index.get(&r).copied()),
                    is_master: bus.is_master,
                    buffer: AudioBuffer::new(2, self.block_size),
                }
            })
            .collect();

        debug!(
            sources = state.sources.len(),
            buses = state.buses.len(),
            "system: snapshot built"
        );
        Box::new(MixSnapshot { sources, buses })
    }
}

/// Builder for [`System`].
pub struct SystemBuilder {
    sample_rate: f64,
    block_size: usize,
}

impl Default for SystemBuilder {
    fn default() -> Self {
        Self {
            sample_rate: 44100.0,
            block_size: 512,
        }
    }
}

impl SystemBuilder {
    pub fn sample_rate(mut self, rate: f64) -> Self {
        self.sample_rate = rate;
        self
    }

    pub fn block_size(mut self, size: usize) -> Self {
        self.block_size = size;
        self
    }

    pub fn build(self) -> Result<System> {
        if self.sample_rate <= 0.0 || self.block_size == 0 {
            return Err(Error::InvalidConfig(format!(
                "sample_rate={}, block_size={}",
                self.sample_rate, self.block_size
            )));
        }

        let transport = Arc::new(Transport::new(self.sample_rate, self.block_size));
        let perf = Arc::new(PerfMonitor::new(self.sample_rate, self.block_size));
        let (scheduler, staging) = event_queue();
        let (clock, clock_tx) = ClockDispatch::new();
        let (cmd_tx, cmd_rx) = unbounded();
        let (garbage_tx, garbage_rx) = unbounded();

        let system = System {
            state: Mutex::new(EngineState {
                graph: NodeGraph::new(),
                sources: Vec::new(),
                buses: Vec::new(),
                master: NodeId(0),
                batching: false,
                dirty: false,
            }),
            registry: DashMap::new(),
            source_directory: ArcSwap::from_pointee(HashSet::new()),
            transport,
            scheduler,
            perf,
            clock,
            cmd_tx,
            garbage_rx,
            render_state: UnsafeCell::new(RenderState {
                snapshot: None,
                staging,
                resolved: Vec::new(),
                lane_events: Vec::new(),
                clock_tx,
                output: AudioBuffer::new(2, self.block_size),
                cmd_rx,
                garbage_tx,
            }),
            next_handle: AtomicU32::new(1),
            sample_rate: self.sample_rate,
            block_size: self.block_size,
        };

        {
            let mut state = system.state.lock();
            let master = system.add_bus_locked(&mut state, "Master", true);
            state.master = master;
            system.publish(&mut state);
        }
        debug!(
            sample_rate = self.sample_rate,
            block_size = self.block_size,
            "system: built"
        );
        Ok(system)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Writes a constant level; the simplest possible generator.
    struct ConstGen {
        level: f32,
    }

    impl Processor for ConstGen {
        fn name(&self) -> &str {
            "ConstGen"
        }
        fn process(&mut self, buffer: &mut AudioBuffer) {
            for ch in 0..buffer.num_channels() {
                buffer.channel_mut(ch).fill(self.level);
            }
        }
        fn param_descriptors(&self) -> Vec<ParamDescriptor> {
            vec![ParamDescriptor::continuous("level", 0.5, 0.0, 1.0)]
        }
        fn param(&self, name: &str) -> f32 {
            if name == "level" {
                self.level
            } else {
                0.0
            }
        }
        fn set_param(&mut self, name: &str, value: f32) {
            if name == "level" {
                self.level = value;
            }
        }
    }

    /// Counts note events it receives; silent output.
    struct NoteCounter {
        note_ons: Arc<AtomicU32>,
        note_offs: Arc<AtomicU32>,
    }

    impl Processor for NoteCounter {
        fn name(&self) -> &str {
            "NoteCounter"
        }
        fn process(&mut self, _buffer: &mut AudioBuffer) {}
        fn process_with_events(&mut self, _buffer: &mut AudioBuffer, events: &[TimedEvent]) {
            for event in events {
                match event.payload {
                    EventPayload::NoteOn { .. } => {
                        self.note_ons.fetch_add(1, Ordering::Relaxed);
                    }
                    EventPayload::NoteOff { .. } => {
                        self.note_offs.fetch_add(1, Ordering::Relaxed);
                    }
                    _ => {}
                }
            }
        }
    }

    fn system() -> System {
        System::builder()
            .sample_rate(44100.0)
            .block_size(512)
            .build()
            .unwrap()
    }

    fn const_gen(level: f32) -> Box<dyn Processor> {
        Box::new(ConstGen { level })
    }

    #[test]
    fn test_builder_defaults_and_master() {
        let sys = system();
        assert_eq!(sys.sample_rate(), 44100.0);
        assert_eq!(sys.block_size(), 512);
        assert_eq!(sys.bus_count(), 1);
        assert_eq!(sys.source_count(), 0);
        assert_eq!(sys.name(sys.master()), "Master");
    }

    #[test]
    fn test_builder_rejects_bad_config() {
        assert!(System::builder().sample_rate(0.0).build().is_err());
        assert!(System::builder().block_size(0).build().is_err());
    }

    #[test]
    fn test_add_remove_source() {
        let sys = system();
        let lead = sys.add_source("Lead", const_gen(0.5));
        assert_eq!(sys.source_count(), 1);
        assert_eq!(sys.name(lead), "Lead");
        // Auto-routed to master.
        assert!(sys.graph(|g| !g.connections_for(lead).is_empty()));

        assert!(sys.remove_source(lead));
        assert_eq!(sys.source_count(), 0);
        assert!(!sys.remove_source(lead));
        // Cascade: no connections touch the removed handle.
        assert!(sys.graph(|g| g.connections_for(lead).is_empty()));
    }

    #[test]
    fn test_master_not_removable() {
        let sys = system();
        assert!(!sys.remove_bus(sys.master()));
        assert_eq!(sys.bus_count(), 1);
    }

    #[test]
    fn test_remove_bus_reroutes_to_master() {
        let sys = system();
        let aux = sys.add_bus("Aux");
        let lead = sys.add_source("Lead", const_gen(0.5));
        sys.route(lead, aux).unwrap();

        assert!(sys.remove_bus(aux));
        let state = sys.state.lock();
        assert_eq!(state.source(lead).unwrap().route, Some(state.master));
    }

    #[test]
    fn test_remove_bus_drops_sends_targeting_it() {
        let sys = system();
        let aux = sys.add_bus("Aux");
        let lead = sys.add_source("Lead", const_gen(0.5));
        sys.add_send(lead, aux, -6.0, SendTap::PostFader).unwrap();
        assert_eq!(sys.sends(lead).len(), 1);

        sys.remove_bus(aux);
        assert!(sys.sends(lead).is_empty());
    }

    #[test]
    fn test_bus_route_cycle_rejected() {
        let sys = system();
        let a = sys.add_bus("A");
        let b = sys.add_bus("B");
        sys.route(a, b).unwrap();
        let err = sys.route(b, a).unwrap_err();
        assert!(matches!(err, Error::CycleDetected));
        // Topology unchanged: B still routes to master.
        let state = sys.state.lock();
        assert_eq!(state.bus(b).unwrap().route, Some(state.master));
    }

    #[test]
    fn test_send_cycle_rejected() {
        let sys = system();
        let a = sys.add_bus("A");
        let b = sys.add_bus("B");
        sys.route(a, b).unwrap();
        assert!(matches!(
            sys.add_send(b, a, 0.0, SendTap::PostFader),
            Err(Error::CycleDetected)
        ));
        // Self-send is a cycle too.
        assert!(matches!(
            sys.add_send(a, a, 0.0, SendTap::PostFader),
            Err(Error::CycleDetected)
        ));
    }

    #[test]
    fn test_master_cannot_route(){
        let sys = system();
        let aux = sys.add_bus("Aux");
        assert!(matches!(
            sys.route(sys.master(), aux),
            Err(Error::MasterImmutable)
        ));
    }

    #[test]
    fn test_send_management() {
        let sys = system();
        let aux = sys.add_bus("Aux");
        let lead = sys.add_source("Lead", const_gen(0.5));

        let send = sys.add_send(lead, aux, -6.0, SendTap::PreFader).unwrap();
        assert!(sys.set_send_level(lead, send, -3.0));
        assert!(sys.set_send_tap(lead, send, SendTap::PostFader));
        let sends = sys.sends(lead);
        assert_eq!(sends.len(), 1);
        assert_eq!(sends[0].level_db, -3.0);
        assert_eq!(sends[0].tap, SendTap::PostFader);

        assert!(sys.remove_send(lead, send));
        assert!(!sys.remove_send(lead, send));
        assert!(!sys.set_send_level(lead, send, 0.0));
    }

    #[test]
    fn test_chain_operations() {
        let sys = system();
        let lead = sys.add_source("Lead", const_gen(0.5));
        let first = sys.chain_append(lead, const_gen(0.1)).unwrap();
        let second = sys.chain_append(lead, const_gen(0.2)).unwrap();
        assert_eq!(sys.chain_len(lead), 2);
        assert_eq!(sys.chain_at(lead, 0), Some(first));

        let inserted = sys.chain_insert(lead, 0, const_gen(0.3)).unwrap();
        assert_eq!(sys.chain_at(lead, 0), Some(inserted));
        assert!(sys.chain_move(lead, 0, 2));
        assert_eq!(sys.chain_at(lead, 0), Some(first));
        assert_eq!(sys.chain_at(lead, 2), Some(inserted));

        assert!(sys.chain_remove(lead, 0));
        assert_eq!(sys.chain_len(lead), 2);
        // Removed processor is gone from the registry.
        assert_eq!(sys.param_descriptors(first).len(), 0);
        assert_eq!(sys.chain_at(lead, 0), Some(second));
    }

    #[test]
    fn test_chain_clear() {
        let sys = system();
        let lead = sys.add_source("Lead", const_gen(0.5));
        let a = sys.chain_append(lead, const_gen(0.1)).unwrap();
        let b = sys.chain_append(lead, const_gen(0.2)).unwrap();

        assert!(sys.chain_clear(lead));
        assert_eq!(sys.chain_len(lead), 0);
        assert!(sys.param_descriptors(a).is_empty());
        assert!(sys.param_descriptors(b).is_empty());
        assert!(!sys.chain_clear(NodeId(99)));
    }

    #[test]
    fn test_chain_on_unknown_owner() {
        let sys = system();
        assert!(sys.chain_append(NodeId(99), const_gen(0.5)).is_err());
        assert_eq!(sys.chain_len(NodeId(99)), 0);
    }

    #[test]
    fn test_params_degrade_to_defaults() {
        let sys = system();
        let lead = sys.add_source("Lead", const_gen(0.5));
        let gen = sys.generator(lead).unwrap();

        assert_eq!(sys.param(gen, "level"), 0.5);
        assert!(sys.set_param(gen, "level", 0.8));
        assert_eq!(sys.param(gen, "level"), 0.8);
        assert_eq!(sys.param(gen, "nope"), 0.0);

        // Unknown handle: benign defaults on reads, false on writes.
        assert_eq!(sys.param(9999, "level"), 0.0);
        assert!(!sys.set_param(9999, "level", 1.0));
        assert_eq!(sys.param_text(9999, "level"), "");
        assert!(sys.param_descriptors(9999).is_empty());
    }

    #[test]
    fn test_strip_defaults_on_unknown() {
        let sys = system();
        assert_eq!(sys.gain(NodeId(99)), 0.0);
        assert_eq!(sys.pan(NodeId(99)), 0.0);
        assert!(!sys.bypassed(NodeId(99)));
        assert_eq!(sys.name(NodeId(99)), "");
    }

    #[test]
    fn test_render_produces_signal_on_master() {
        let sys = system();
        let lead = sys.add_source("Lead", const_gen(0.5));
        sys.render(512);
        assert!(sys.bus_peak(sys.master()) > 0.0);
        assert!(sys.bus_rms(sys.master()) > 0.0);

        // Bypass silences the source.
        sys.set_bypassed(lead, true);
        sys.render(512);
        assert_eq!(sys.bus_peak(sys.master()), 0.0);
    }

    #[test]
    fn test_gain_scales_signal() {
        let sys = system();
        let lead = sys.add_source("Lead", const_gen(0.5));
        sys.render(512);
        let unity = sys.bus_peak(sys.master());

        sys.set_gain(lead, 0.5);
        sys.render(512);
        let halved = sys.bus_peak(sys.master());
        assert!((halved - unity * 0.5).abs() < 1e-4);
    }

    #[test]
    fn test_send_feeds_second_bus() {
        let sys = system();
        let aux = sys.add_bus("Aux");
        let lead = sys.add_source("Lead", const_gen(0.5));
        // -20 dB = 0.1 linear.
        sys.add_send(lead, aux, -20.0, SendTap::PostFader).unwrap();

        sys.render(512);
        let aux_peak = sys.bus_peak(aux);
        assert!((aux_peak - 0.05).abs() < 1e-3, "aux peak {aux_peak}");
    }

    #[test]
    fn test_pre_fader_send_ignores_gain() {
        let sys = system();
        let aux = sys.add_bus("Aux");
        // Route the aux somewhere harmless and mute the source's main path.
        let lead = sys.add_source("Lead", const_gen(0.5));
        sys.add_send(lead, aux, 0.0, SendTap::PreFader).unwrap();
        sys.set_gain(lead, 0.0);

        sys.render(512);
        // The pre-fader tap carries the un-faded signal even with gain 0.
        assert!((sys.bus_peak(aux) - 0.5).abs() < 1e-4);
    }

    #[test]
    fn test_meters_reset_on_stop() {
        let sys = system();
        let _lead = sys.add_source("Lead", const_gen(0.5));
        sys.render(512);
        assert!(sys.bus_peak(sys.master()) > 0.0);
        sys.stop();
        assert_eq!(sys.bus_peak(sys.master()), 0.0);
        assert_eq!(sys.bus_rms(sys.master()), 0.0);
    }

    #[test]
    fn test_batch_publishes_once() {
        let sys = system();
        let (a, b) = sys.batch(|sys| {
            let a = sys.add_source("A", const_gen(0.2));
            let b = sys.add_source("B", const_gen(0.2));
            sys.route(a, sys.master()).unwrap();
            sys.route(b, sys.master()).unwrap();
            (a, b)
        });
        assert_eq!(sys.source_count(), 2);
        sys.render(512);
        // Both routes are live in the swapped snapshot.
        assert!(sys.bus_peak(sys.master()) > 0.3);
        assert_ne!(a, b);
    }

    #[test]
    fn test_schedule_validates_target_and_time() {
        let sys = system();
        let lead = sys.add_source("Lead", const_gen(0.0));
        assert!(sys.schedule_note_on(lead, 1.0, 1, 60, 0.8));
        assert!(!sys.schedule_note_on(NodeId(99), 1.0, 1, 60, 0.8));

        sys.transport().seek_beats(4.0);
        assert!(!sys.schedule_note_on(lead, 1.0, 1, 60, 0.8));
        assert!(sys.schedule_note_on(lead, 4.0, 1, 60, 0.8));
    }

    #[test]
    fn test_schedule_param_change_applies_during_render() {
        let sys = system();
        let lead = sys.add_source("Lead", const_gen(0.5));
        let gen = sys.generator(lead).unwrap();

        assert!(sys.schedule_param_change(gen, 0.0, "level", 0.9));
        assert!(!sys.schedule_param_change(9999, 0.0, "level", 0.9));

        sys.play();
        sys.render(512);
        assert_eq!(sys.param(gen, "level"), 0.9);
    }

    #[test]
    fn test_note_events_dispatched_exactly_once() {
        let sys = system();
        let ons = Arc::new(AtomicU32::new(0));
        let offs = Arc::new(AtomicU32::new(0));
        let lead = sys.add_source(
            "Lead",
            Box::new(NoteCounter {
                note_ons: Arc::clone(&ons),
                note_offs: Arc::clone(&offs),
            }),
        );

        sys.transport().set_tempo(120.0).unwrap();
        assert!(sys.schedule_note_on(lead, 2.0, 1, 60, 0.8));
        assert!(sys.schedule_note_off(lead, 3.0, 1, 60));
        sys.play();

        // Two beats at 120 BPM, 44.1kHz = 44100 samples; render well past.
        for _ in 0..200 {
            sys.render(512);
        }
        assert_eq!(ons.load(Ordering::Relaxed), 1);
        assert_eq!(offs.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_note_not_dispatched_before_its_beat() {
        let sys = system();
        let ons = Arc::new(AtomicU32::new(0));
        let lead = sys.add_source(
            "Lead",
            Box::new(NoteCounter {
                note_ons: Arc::clone(&ons),
                note_offs: Arc::new(AtomicU32::new(0)),
            }),
        );

        assert!(sys.schedule_note_on(lead, 2.0, 1, 60, 0.8));
        sys.play();
        // Beat 2 at 120 BPM = 1 second = 44100 samples. Render only half.
        for _ in 0..43 {
            sys.render(512);
        }
        assert_eq!(ons.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_events_dispatch_across_loop_seam() {
        let sys = system();
        let ons = Arc::new(AtomicU32::new(0));
        let lead = sys.add_source(
            "Lead",
            Box::new(NoteCounter {
                note_ons: Arc::clone(&ons),
                note_offs: Arc::new(AtomicU32::new(0)),
            }),
        );

        let transport = sys.transport();
        transport.set_loop_points(0.0, 2.0).unwrap();
        assert!(transport.set_looping(true));
        sys.play();

        // Render one beat in, then schedule an event just after the seam.
        for _ in 0..44 {
            sys.render(512);
        }
        assert!(sys.schedule_note_on(lead, 0.05, 1, 60, 0.8));
        // Render across the wrap and into the next pass.
        for _ in 0..90 {
            sys.render(512);
        }
        assert_eq!(ons.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_clear_events() {
        let sys = system();
        let ons = Arc::new(AtomicU32::new(0));
        let lead = sys.add_source(
            "Lead",
            Box::new(NoteCounter {
                note_ons: Arc::clone(&ons),
                note_offs: Arc::new(AtomicU32::new(0)),
            }),
        );
        assert!(sys.schedule_note_on(lead, 0.5, 1, 60, 0.8));
        sys.clear_events();
        sys.play();
        for _ in 0..100 {
            sys.render(512);
        }
        assert_eq!(ons.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_render_into_copies_master() {
        let sys = system();
        let _lead = sys.add_source("Lead", const_gen(0.25));
        let mut out = AudioBuffer::new(2, 512);
        sys.render_into(&mut out);
        assert!((out.peak() - 0.25).abs() < 1e-4);
    }

    #[test]
    fn test_perf_wraps_render() {
        let sys = system();
        sys.perf().set_enabled(true);
        let _lead = sys.add_source("Lead", const_gen(0.5));
        for _ in 0..10 {
            sys.render(512);
        }
        let snap = sys.perf().snapshot();
        assert_eq!(snap.callback_count, 10);
        assert!(snap.callback_peak_us > 0.0);
    }

    #[test]
    fn test_slot_profiling_keys_by_handle() {
        let sys = system();
        sys.perf().set_enabled(true);
        sys.perf().set_slot_profiling(true);
        let lead = sys.add_source("Lead", const_gen(0.5));
        // Render enough blocks to cross the ~100ms publish window.
        for _ in 0..10 {
            sys.render(512);
        }
        let snap = sys.perf().snapshot();
        let handles: Vec<u32> = snap.slots.iter().map(|s| s.handle).collect();
        assert!(handles.contains(&lead.0));
        assert!(handles.contains(&sys.master().0));
    }

    #[test]
    fn test_version() {
        assert!(!System::version().is_empty());
    }
}
