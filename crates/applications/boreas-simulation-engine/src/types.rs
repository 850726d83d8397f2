//! Core types for the datacenter simulation

use serde::{Deserialize, Serialize};

/// Unique identifier for a physical host
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct HostId(pub u32);

impl std::fmt::Display for HostId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "host-{}", self.0)
    }
}

/// Unique identifier for a server (a placed VM or function)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ServerId(pub u64);

impl std::fmt::Display for ServerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "server-{}", self.0)
    }
}

/// Host occupancy state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HostState {
    /// Not yet seen a boot event
    Unknown,
    /// Boot in progress
    Boot,
    /// Accepting and running servers
    Active,
    /// Gracefully powered down
    Shutoff,
    /// Down due to an injected fault
    Error,
}

/// Static description of a physical host, consumed once at start-of-run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostSpec {
    pub cores: u32,
    pub core_rate_mhz: u64,
    pub memory_mb: u64,
    /// Free-form labels matched against a server's required tags
    pub tags: Vec<String>,
}

impl HostSpec {
    pub fn new(cores: u32, core_rate_mhz: u64, memory_mb: u64) -> Self {
        HostSpec {
            cores,
            core_rate_mhz,
            memory_mb,
            tags: Vec::new(),
        }
    }

    pub fn with_tags(mut self, tags: Vec<String>) -> Self {
        self.tags = tags;
        self
    }

    /// Aggregate CPU capacity across all cores, in MHz
    pub fn total_capacity_mhz(&self) -> u64 {
        self.cores as u64 * self.core_rate_mhz
    }
}

/// Static footprint and placement constraints of a server
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSpec {
    pub cores: u32,
    pub memory_mb: u64,
    /// Tags a host must carry for this server to land on it
    pub required_tags: Vec<String>,
    /// Anti-affinity group; two servers of the same group never share a host
    pub group: Option<String>,
    /// Interference domain membership, `None` means not subject to interference
    pub interference_key: Option<crate::interference::InterferenceKey>,
    /// Periodic checkpoint overhead, `None` disables checkpointing
    pub checkpoint: Option<crate::checkpoint::CheckpointPolicy>,
}

impl ServerSpec {
    pub fn new(cores: u32, memory_mb: u64) -> Self {
        ServerSpec {
            cores,
            memory_mb,
            required_tags: Vec::new(),
            group: None,
            interference_key: None,
            checkpoint: None,
        }
    }
}

/// One CPU burst of a server's workload.
///
/// Fragments play back on a fixed duration; the granted rate shapes how much
/// of the demand was actually served, not how long the fragment runs.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Fragment {
    /// Work volume of the burst, informational
    pub flops: u64,
    /// Fraction of the demanded cores actually used, in `[0, 1]`
    pub usage: f64,
    /// Number of cores the burst runs on
    pub cores: u32,
    /// Playback duration in ticks
    pub duration_ticks: u64,
}

impl Fragment {
    /// CPU rate this fragment demands on a host with the given per-core rate
    pub fn demand_mhz(&self, core_rate_mhz: u64) -> u64 {
        (self.usage * (self.cores as u64 * core_rate_mhz) as f64).round() as u64
    }
}
