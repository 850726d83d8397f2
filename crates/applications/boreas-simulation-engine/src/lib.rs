//! Boreas Simulation Engine
//!
//! Discrete-event simulator for datacenter compute infrastructure: physical
//! hosts, the servers placed on them, and how contended CPU capacity is
//! shared under interference and power behavior, all on a virtual clock.

pub mod types;
pub mod error;
pub mod flow;
pub mod interference;
pub mod power;
pub mod checkpoint;
pub mod host;
pub mod workload;
pub mod scheduler;
pub mod telemetry;
pub mod simulator;
