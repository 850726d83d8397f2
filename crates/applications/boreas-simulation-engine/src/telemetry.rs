//! Telemetry output interfaces
//!
//! Hosts push slice reports and power samples through a [`TelemetrySink`];
//! the engine never blocks on, or polls, a consumer. The in-memory sink is
//! what the CLI and the tests use; anything heavier (export, rendering)
//! belongs to external collaborators.

use std::cell::RefCell;
use std::rc::Rc;

use serde::{Deserialize, Serialize};

use boreas_kernel::Instant;

use crate::types::HostId;

/// Per-host summary emitted at the end of every scheduling slice.
///
/// CPU time figures are MHz-tick integrals accumulated since the previous
/// report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SliceReport {
    pub time: Instant,
    pub host: HostId,
    /// Requested CPU time over the slice, in MHz-ticks
    pub total_requested_cpu_time: u64,
    /// Available CPU time over the slice, in MHz-ticks
    pub total_cpu_time_capacity: u64,
    pub hosted_count: usize,
}

/// One point of a host's power draw stream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PowerSample {
    pub time: Instant,
    pub host: HostId,
    pub watts: f64,
}

/// Push-based consumer of simulation telemetry
pub trait TelemetrySink {
    fn record_slice(&mut self, report: SliceReport);
    fn record_power(&mut self, sample: PowerSample);
}

/// Sink that discards everything
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSink;

impl TelemetrySink for NullSink {
    fn record_slice(&mut self, _report: SliceReport) {}
    fn record_power(&mut self, _sample: PowerSample) {}
}

#[derive(Debug, Default)]
struct TelemetryLog {
    slices: Vec<SliceReport>,
    power: Vec<PowerSample>,
}

/// Collecting sink backed by shared storage.
///
/// Cloning yields a second handle onto the same log, so a caller can hand
/// one clone to the simulator and read the records through the other once
/// the run is over. Timelines are single-threaded; the handle is not `Send`.
#[derive(Debug, Clone, Default)]
pub struct InMemorySink {
    log: Rc<RefCell<TelemetryLog>>,
}

impl InMemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn slices(&self) -> Vec<SliceReport> {
        self.log.borrow().slices.clone()
    }

    pub fn power_samples(&self) -> Vec<PowerSample> {
        self.log.borrow().power.clone()
    }
}

impl TelemetrySink for InMemorySink {
    fn record_slice(&mut self, report: SliceReport) {
        self.log.borrow_mut().slices.push(report);
    }

    fn record_power(&mut self, sample: PowerSample) {
        self.log.borrow_mut().power.push(sample);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clone_shares_the_log() {
        let sink = InMemorySink::new();
        let mut writer = sink.clone();

        writer.record_power(PowerSample {
            time: 5,
            host: HostId(0),
            watts: 120.0,
        });
        writer.record_slice(SliceReport {
            time: 300,
            host: HostId(0),
            total_requested_cpu_time: 600_000,
            total_cpu_time_capacity: 1_200_000,
            hosted_count: 1,
        });

        assert_eq!(sink.power_samples().len(), 1);
        assert_eq!(sink.slices().len(), 1);
        assert_eq!(sink.slices()[0].hosted_count, 1);
    }
}
