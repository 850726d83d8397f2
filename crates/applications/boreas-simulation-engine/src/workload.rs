//! Workload traces
//!
//! A trace is a stream of server arrivals ordered by submit time. The
//! simulator pulls one arrival at a time, so the stream can be a replayed
//! static list or a seeded synthetic generator producing servers on the fly.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Exp};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

use boreas_kernel::Instant;

use crate::checkpoint::CheckpointPolicy;
use crate::error::{Result, SimulationError};
use crate::types::{Fragment, ServerSpec};

/// A server plus the compute it will run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerRequest {
    /// Display name carried into logs and results
    pub name: String,
    pub spec: ServerSpec,
    /// Fragments executed back to back; an empty list completes immediately
    pub fragments: Vec<Fragment>,
}

/// One entry of a trace
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Arrival {
    pub submit_at: Instant,
    pub server: ServerRequest,
}

/// Stream of arrivals with non-decreasing `submit_at`
pub trait WorkloadTrace {
    fn next_arrival(&mut self) -> Option<Arrival>;
}

/// Replays a fixed list of arrivals, sorted by submit time on construction
pub struct StaticTrace {
    arrivals: VecDeque<Arrival>,
}

impl StaticTrace {
    pub fn new(mut arrivals: Vec<Arrival>) -> Self {
        arrivals.sort_by_key(|a| a.submit_at);
        StaticTrace {
            arrivals: arrivals.into(),
        }
    }
}

impl WorkloadTrace for StaticTrace {
    fn next_arrival(&mut self) -> Option<Arrival> {
        self.arrivals.pop_front()
    }
}

/// Knobs for the synthetic generator
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyntheticConfig {
    /// How many servers to emit before the trace ends
    pub servers: usize,
    /// Mean of the exponential inter-arrival gap
    pub mean_interarrival_ticks: f64,
    /// Core footprints are drawn uniformly from 1..=max_cores
    pub max_cores: u32,
    pub min_fragment_ticks: u64,
    pub max_fragment_ticks: u64,
    /// Fragment counts are drawn uniformly from 1..=max_fragments
    pub max_fragments: usize,
    /// Memory footprint per requested core
    pub memory_per_core_mb: u64,
    /// Checkpoint policy stamped onto every generated server, if any
    pub checkpoint: Option<CheckpointPolicy>,
}

impl Default for SyntheticConfig {
    fn default() -> Self {
        SyntheticConfig {
            servers: 200,
            mean_interarrival_ticks: 120.0,
            max_cores: 4,
            min_fragment_ticks: 60,
            max_fragment_ticks: 3_600,
            max_fragments: 4,
            memory_per_core_mb: 2_048,
            checkpoint: None,
        }
    }
}

/// Seeded generator of Poisson arrivals with uniform footprints
pub struct SyntheticWorkload {
    config: SyntheticConfig,
    rng: StdRng,
    interarrival: Exp<f64>,
    clock: f64,
    emitted: usize,
}

impl SyntheticWorkload {
    pub fn new(config: SyntheticConfig, seed: u64) -> Result<Self> {
        if config.min_fragment_ticks > config.max_fragment_ticks {
            return Err(SimulationError::invalid_argument(
                "min_fragment_ticks exceeds max_fragment_ticks",
            ));
        }
        if config.max_cores == 0 || config.max_fragments == 0 {
            return Err(SimulationError::invalid_argument(
                "max_cores and max_fragments must be at least 1",
            ));
        }
        let interarrival =
            exp_from_mean(config.mean_interarrival_ticks, "mean_interarrival_ticks")?;
        Ok(SyntheticWorkload {
            config,
            rng: StdRng::seed_from_u64(seed),
            interarrival,
            clock: 0.0,
            emitted: 0,
        })
    }
}

impl WorkloadTrace for SyntheticWorkload {
    fn next_arrival(&mut self) -> Option<Arrival> {
        if self.emitted >= self.config.servers {
            return None;
        }
        self.clock += self.interarrival.sample(&mut self.rng);

        let cores = self.rng.gen_range(1..=self.config.max_cores);
        let fragment_count = self.rng.gen_range(1..=self.config.max_fragments);
        let fragments: Vec<Fragment> = (0..fragment_count)
            .map(|_| {
                let duration = self
                    .rng
                    .gen_range(self.config.min_fragment_ticks..=self.config.max_fragment_ticks);
                // Batch compute rarely idles below half a core
                let usage = self.rng.gen_range(0.5..1.0);
                Fragment {
                    // Nominal work at a 2.4 GHz core, scaled by utilization
                    flops: (duration as f64 * f64::from(cores) * 2_400.0 * usage) as u64,
                    usage,
                    cores,
                    duration_ticks: duration,
                }
            })
            .collect();

        let mut spec = ServerSpec::new(cores, u64::from(cores) * self.config.memory_per_core_mb);
        spec.checkpoint = self.config.checkpoint;

        let index = self.emitted;
        self.emitted += 1;
        Some(Arrival {
            submit_at: self.clock as Instant,
            server: ServerRequest {
                name: format!("synthetic-{index}"),
                spec,
                fragments,
            },
        })
    }
}

/// Exponential host failure and repair process
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct FaultProfile {
    pub mean_time_to_fail_ticks: f64,
    pub mean_time_to_repair_ticks: f64,
}

/// Exponential sampler with the given mean.
///
/// `Exp::new` itself accepts an infinite rate, so a zero or negative mean has
/// to be caught before taking the reciprocal.
pub(crate) fn exp_from_mean(mean: f64, what: &str) -> Result<Exp<f64>> {
    if mean.is_finite() && mean > 0.0 {
        if let Ok(dist) = Exp::new(1.0 / mean) {
            return Ok(dist);
        }
    }
    Err(SimulationError::invalid_argument(format!(
        "{what} must be positive and finite"
    )))
}
