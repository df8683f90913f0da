//! Messages crossing the realtime boundary. Commands flow from the
//! control thread into the audio callback over a lock-free ring; reports
//! come back over a channel. Everything here is Copy so the callback
//! never allocates.

use crate::patterns::PatternKind;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RealtimeCommand {
    /// Rebuild the processor's oscillators for a new pattern.
    Configure { kind: PatternKind, base_hz: f32 },
    Start,
    Stop,
    /// Scale the processor's complexity down. The scale persists across
    /// later Configure commands.
    ReduceComplexity { factor: f32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RealtimeReport {
    /// The output peak crossed the overrun threshold (true) or dropped
    /// back below the recovery threshold (false).
    BufferStatus { overrun: bool },
}
