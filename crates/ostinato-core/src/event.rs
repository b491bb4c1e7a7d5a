//! Scheduled event payloads shared by the scheduler and processors.

/// What a scheduled event does when it reaches its target.
#[derive(Debug, Clone, PartialEq)]
pub enum EventPayload {
    NoteOn { channel: u8, note: u8, velocity: f32 },
    NoteOff { channel: u8, note: u8 },
    ControlChange { channel: u8, controller: u8, value: u8 },
    ParamChange { name: String, value: f32 },
}

/// An event waiting in the scheduler, stamped with its musical time.
#[derive(Debug, Clone)]
pub struct ScheduledEvent {
    /// Handle of the source or processor this event targets.
    pub target: u32,
    /// Musical time in beats (quarter notes from origin).
    pub beat: f64,
    /// Insertion sequence, breaks ties between events at the same beat.
    pub seq: u64,
    pub payload: EventPayload,
}

/// An event resolved against the current render block.
#[derive(Debug, Clone)]
pub struct ResolvedEvent {
    /// Sample position within the block, `[0, num_samples)`.
    pub sample_offset: usize,
    pub target: u32,
    pub payload: EventPayload,
}

/// Processor-facing view of an event: block offset plus payload.
#[derive(Debug, Clone)]
pub struct TimedEvent {
    pub sample_offset: usize,
    pub payload: EventPayload,
}
