//! Error types for the kernel

use thiserror::Error;

use crate::queue::Instant;

/// An event was requested at a timestamp earlier than the current clock value.
///
/// This aborts the offending scheduling call only; the queue itself stays
/// consistent and the clock is unchanged.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("cannot schedule an event at t={at}: clock is already at t={now}")]
pub struct InvalidScheduling {
    /// Requested timestamp
    pub at: Instant,
    /// Clock value at the time of the call
    pub now: Instant,
}
