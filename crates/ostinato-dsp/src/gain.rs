//! Plain gain stage.

use ostinato_core::processor::{ParamDescriptor, Processor};
use ostinato_core::AudioBuffer;

pub struct GainProcessor {
    gain: f32,
}

impl GainProcessor {
    pub fn new() -> Self {
        Self { gain: 1.0 }
    }
}

impl Default for GainProcessor {
    fn default() -> Self {
        Self::new()
    }
}

impl Processor for GainProcessor {
    fn name(&self) -> &str {
        "Gain"
    }

    fn process(&mut self, buffer: &mut AudioBuffer) {
        buffer.apply_gain(self.gain);
    }

    fn param_descriptors(&self) -> Vec<ParamDescriptor> {
        vec![ParamDescriptor::continuous("gain", 1.0, 0.0, 1.0)]
    }

    fn param(&self, name: &str) -> f32 {
        if name == "gain" {
            self.gain
        } else {
            0.0
        }
    }

    fn set_param(&mut self, name: &str, value: f32) {
        if name == "gain" {
            self.gain = value.clamp(0.0, 1.0);
        }
    }
}
