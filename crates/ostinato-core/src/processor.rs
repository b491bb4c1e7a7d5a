//! Processor capability trait and parameter metadata.
//!
//! Concrete DSP lives behind this interface; the engine only sequences and
//! parameterizes processors, never inspects their internals. Built-in
//! implementations ship in `ostinato-dsp`; hosts may supply their own.

use crate::buffer::AudioBuffer;
use crate::event::TimedEvent;
use serde::{Deserialize, Serialize};

/// Static metadata for one processor parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamDescriptor {
    pub name: String,
    pub default: f32,
    pub min: f32,
    pub max: f32,
    /// 0 = continuous, >0 = stepped.
    pub steps: u32,
    pub automatable: bool,
    pub boolean: bool,
    /// Unit label: "dB", "Hz", "%", "".
    pub unit: String,
    /// "" = ungrouped.
    pub group: String,
}

impl ParamDescriptor {
    /// A continuous, automatable parameter with no unit or group.
    pub fn continuous(name: &str, default: f32, min: f32, max: f32) -> Self {
        Self {
            name: name.to_string(),
            default,
            min,
            max,
            steps: 0,
            automatable: true,
            boolean: false,
            unit: String::new(),
            group: String::new(),
        }
    }
}

/// A computational unit hosted by the engine.
///
/// `prepare` and parameter setters run on control threads; `process*` runs on
/// the render thread. Implementations must not block or allocate in
/// `process*`.
pub trait Processor: Send {
    fn name(&self) -> &str;

    /// Called before processing starts and whenever sample rate or block size
    /// changes.
    fn prepare(&mut self, _sample_rate: f64, _block_size: usize) {}

    /// Drop voices, clear delay lines. Does not reset parameters.
    fn reset(&mut self) {}

    /// Process one block in place.
    fn process(&mut self, buffer: &mut AudioBuffer);

    /// Process one block with note/CC events resolved to sample offsets.
    ///
    /// The default ignores events; generators that consume MIDI override it.
    fn process_with_events(&mut self, buffer: &mut AudioBuffer, _events: &[TimedEvent]) {
        self.process(buffer);
    }

    fn param_descriptors(&self) -> Vec<ParamDescriptor> {
        Vec::new()
    }

    /// Returns 0.0 for unknown parameter names.
    fn param(&self, _name: &str) -> f32 {
        0.0
    }

    fn set_param(&mut self, _name: &str, _value: f32) {}

    /// Display text for a parameter value; empty for unknown names.
    fn param_text(&self, name: &str) -> String {
        let descriptors = self.param_descriptors();
        if descriptors.iter().any(|d| d.name == name) {
            format!("{:.3}", self.param(name))
        } else {
            String::new()
        }
    }
}
