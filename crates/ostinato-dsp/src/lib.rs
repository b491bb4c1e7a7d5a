//! Built-in processors for the ostinato engine.
//!
//! These are the units the engine ships for tests, demos, and simple
//! projects: a gain stage, a constant generator, and a polyphonic sine test
//! synth. Anything fancier is expected to come from the host through the
//! [`Processor`](ostinato_core::Processor) trait.

mod gain;
mod synth;
mod test;

pub use gain::GainProcessor;
pub use synth::TestSynth;
pub use test::ConstGenerator;
