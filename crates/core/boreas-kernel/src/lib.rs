//! Boreas Kernel - Virtual clock and event queue
//!
//! This crate defines the discrete-event core shared by the simulation
//! applications:
//! - A virtual clock measured in integer ticks
//! - A cancellable event queue with a deterministic total order
//!
//! Events are ordered by `(timestamp, sequence)`: the sequence counter is
//! assigned at scheduling time, so events scheduled for the same tick fire
//! in submission order. The queue carries no callbacks of its own; the
//! embedding simulator pops payloads and dispatches them.

pub mod error;
pub mod queue;

pub use error::InvalidScheduling;
pub use queue::{EventHandle, EventQueue, Instant};
