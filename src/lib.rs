//! # Ostinato - Real-time Audio Mixing Engine
//!
//! A programmable signal router with tempo-synchronized event playback: the
//! core of a lightweight DAW engine.
//!
//! ## Architecture
//!
//! Ostinato is an umbrella crate coordinating:
//! - **ostinato-core** - node graph, mixer (sources/buses/sends/chains),
//!   transport, sample-accurate event scheduler, lookahead clock dispatch,
//!   performance monitor
//! - **ostinato-dsp** - built-in processors (gain, constant generator,
//!   polyphonic test synth)
//!
//! ## Quick Start
//!
//! ```ignore
//! use ostinato::prelude::*;
//!
//! let engine = Engine::builder().sample_rate(44100.0).build()?;
//!
//! let lead = engine.add_test_synth("Lead");
//! engine.route(lead, engine.master())?;
//!
//! engine.schedule_note_on(lead, 0.0, 1, 60, 0.8);
//! engine.schedule_note_off(lead, 1.0, 1, 60);
//!
//! engine.transport().tempo(120.0).play();
//! engine.render(512);
//! ```

/// Re-export of ostinato-core for direct access.
pub use ostinato_core as core;

// Core types
pub use ostinato_core::{
    AudioBuffer,
    AuxSend,
    // Lock-free primitives
    AtomicDouble,
    AtomicFlag,
    AtomicFloat,
    BeatRangeUpdate,
    BlockWindow,
    BusMeter,
    ClockDispatch,
    ClockHandle,
    Connection,
    ConnectionId,
    // Graph
    NodeGraph,
    NodeId,
    NodeKind,
    ParamDescriptor,
    // Monitoring
    PerfMonitor,
    PerfSnapshot,
    PortDirection,
    PortSpec,
    Processor,
    ProcessorHandle,
    SendTap,
    SignalKind,
    SlotPerf,
    Strip,
    System,
    SystemBuilder,
    TimeSignature,
    // Transport
    Transport,
    TransportState,
};

// Built-in processors
pub use ostinato_dsp as dsp;
pub use ostinato_dsp::{ConstGenerator, GainProcessor, TestSynth};

mod builder;
mod engine;
mod error;

pub use builder::EngineBuilder;
pub use engine::{Engine, TransportControl};
pub use error::{Error, Result};

/// Convenience prelude for common imports.
pub mod prelude {
    pub use crate::{Engine, EngineBuilder};

    pub use crate::{NodeId, ProcessorHandle, SendTap, TransportState};

    pub use crate::{ConstGenerator, GainProcessor, TestSynth};

    pub use crate::core::Processor;
}
