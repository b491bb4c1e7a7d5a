//! Real-time audio mixing and routing engine core.
//!
//! A graph of sound-generating and sound-processing nodes, organized into a
//! mixer (sources, buses, sends, insert chains), driven by a musical
//! transport that schedules events with sample accuracy, observed through a
//! performance monitor.
//!
//! # Primary API
//!
//! - [`System`] / [`SystemBuilder`]: engine assembly and entry point
//! - [`NodeGraph`]: port-level graph manipulation
//! - [`Transport`]: playback control (play/pause/stop/seek/loop)
//! - [`ClockDispatch`] / [`ClockHandle`]: lookahead beat callbacks
//! - [`PerfMonitor`]: render budget measurement and xrun detection
//! - [`Processor`]: the capability trait hosted processors implement
//!
//! # Example
//!
//! ```ignore
//! use ostinato_core::System;
//!
//! let system = System::builder().sample_rate(44100.0).build()?;
//! let lead = system.add_source("Lead", my_generator());
//! system.schedule_note_on(lead, 0.0, 1, 60, 0.8);
//! system.play();
//! system.render(512);
//! ```

pub mod error;
pub use error::{Error, Result};

pub(crate) mod lockfree;
pub use lockfree::{AtomicDouble, AtomicFlag, AtomicFloat};

mod buffer;
pub use buffer::{db_to_linear, pan_gains, AudioBuffer};

mod event;
pub use event::{EventPayload, ResolvedEvent, ScheduledEvent, TimedEvent};

pub mod processor;
pub use processor::{ParamDescriptor, Processor};

mod graph;
pub use graph::{
    Connection, ConnectionId, NodeGraph, NodeId, NodeKind, PortDirection, PortSpec, SignalKind,
};

pub(crate) mod mixer;
pub use mixer::{AuxSend, BusMeter, Chain, ProcessorHandle, ProcessorSlot, SendTap, Strip};

mod transport;
pub use transport::{BlockWindow, LoopWrap, TimeSignature, Transport, TransportState};

mod scheduler;
pub use scheduler::{EventScheduler, EventStaging, LoopContext};

mod clock;
pub use clock::{BeatRangeUpdate, ClockCallback, ClockDispatch, ClockHandle, ClockUpdateTx};

mod perf;
pub use perf::{PerfMonitor, PerfSnapshot, SlotPerf, MAX_SLOTS};

mod system;
pub use system::{System, SystemBuilder};
