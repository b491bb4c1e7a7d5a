//! Engine builder.

use crate::engine::Engine;
use crate::error::Result;
use ostinato_core::System;

/// Builder for [`Engine`].
///
/// # Example
/// ```ignore
/// let engine = Engine::builder()
///     .sample_rate(48000.0)
///     .block_size(256)
///     .build()?;
/// ```
pub struct EngineBuilder {
    sample_rate: f64,
    block_size: usize,
}

impl Default for EngineBuilder {
    fn default() -> Self {
        Self {
            sample_rate: 44100.0,
            block_size: 512,
        }
    }
}

impl EngineBuilder {
    pub fn sample_rate(mut self, rate: f64) -> Self {
        self.sample_rate = rate;
        self
    }

    pub fn block_size(mut self, size: usize) -> Self {
        self.block_size = size;
        self
    }

    pub fn build(self) -> Result<Engine> {
        let system = System::builder()
            .sample_rate(self.sample_rate)
            .block_size(self.block_size)
            .build()?;
        Ok(Engine::from_system(system))
    }
}
