//! Constant-level generator for tests and signal tracing.

use ostinato_core::processor::{ParamDescriptor, Processor};
use ostinato_core::AudioBuffer;

/// Writes a constant sample value to every channel.
pub struct ConstGenerator {
    level: f32,
}

impl ConstGenerator {
    pub fn new(level: f32) -> Self {
        Self { level }
    }
}

impl Default for ConstGenerator {
    fn default() -> Self {
        Self::new(0.5)
    }
}

impl Processor for ConstGenerator {
    fn name(&self) -> &str {
        "ConstGenerator"
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_writes_level() {
        let mut generator = ConstGenerator::new(0.25);
        let mut buffer = AudioBuffer::new(2, 4);
        generator.process(&mut buffer);
        assert!(buffer.channel(0).iter().all(|&s| s == 0.25));
        assert!(buffer.channel(1).iter().all(|&s| s == 0.25));
    }
}
