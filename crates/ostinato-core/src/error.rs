//! Error types for ostinato-core.

use thiserror::Error;

/// Error type for ostinato-core operations.
///
/// Structural graph mutations surface these explicitly; transient read
/// accessors degrade to benign defaults instead (see module docs on
/// [`System`](crate::System)).
#[derive(Error, Debug)]
pub enum Error {
    #[error("Invalid config: {0}")]
    InvalidConfig(String),

    #[error("Invalid handle: {0}")]
    InvalidHandle(u32),

    #[error("Invalid node: {0}")]
    InvalidNode(u32),

    #[error("Invalid port '{port}' on node {node}")]
    InvalidPort { node: u32, port: String },

    #[error("Signal type mismatch: cannot connect '{src_port}' to '{dst_port}'")]
    TypeMismatch { src_port: String, dst_port: String },

    #[error("Connection would create a cycle")]
    CycleDetected,

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid tempo: {0}. Must be between 1.0 and 999.0 BPM")]
    InvalidTempo(f64),

    #[error("Invalid loop range: start={start}, end={end}")]
    InvalidLoopRange { start: f64, end: f64 },

    #[error("Invalid time signature: {numerator}/{denominator}")]
    InvalidTimeSignature { numerator: u32, denominator: u32 },

    #[error("Audio device not available: {0}")]
    DeviceUnavailable(String),

    #[error("Master bus cannot be removed or re-routed")]
    MasterImmutable,
}

/// Result type alias.
pub type Result<T> = core::result::Result<T, Error>;
