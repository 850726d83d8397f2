//! Placement policies
//!
//! The main policy is a filter + weigh pipeline: pure predicates prune the
//! host pool, weighted scorers rank the survivors, and the maximum wins with
//! ties broken by the lowest host id so replays place identically. Simpler
//! single-shot policies (random, round-robin) sit behind the same
//! [`PlacementPolicy`] trait and the same failure contract.
//!
//! A policy never retries: placement failure is a value returned to the
//! caller, and requeue/backoff is the caller's decision.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use thiserror::Error;

use crate::host::HostView;
use crate::types::{HostId, HostState, ServerSpec};

/// Core oversubscription allowed by the stock pipeline
pub const DEFAULT_CORE_ALLOCATION_RATIO: f64 = 16.0;

/// Typed failure returned to whoever submitted the request
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulingFailure {
    /// Every host was eliminated by the filters (or nothing was viable)
    #[error("no host passed every filter")]
    NoEligibleHost,
}

/// Outcome of one placement decision
pub type SchedulingResult = std::result::Result<HostId, SchedulingFailure>;

/// Pure predicate deciding whether a host stays in the candidate pool
pub trait HostFilter {
    fn test(&self, host: &HostView, server: &ServerSpec) -> bool;

    /// Filter name for logs
    fn name(&self) -> &str;
}

/// Pure scorer ranking a surviving host; higher is better
pub trait HostWeigher {
    fn weigh(&self, host: &HostView, server: &ServerSpec) -> f64;

    /// Weigher name for logs
    fn name(&self) -> &str;
}

/// Strategy choosing a host for a server, or failing with a typed value
pub trait PlacementPolicy {
    fn select(&mut self, hosts: &[HostView], server: &ServerSpec) -> SchedulingResult;

    /// Policy name for logs and result tables
    fn name(&self) -> &str;
}

// ============================================================================
// Filters
// ============================================================================

/// Keeps only hosts that are accepting servers
pub struct HostStateFilter;

impl HostFilter for HostStateFilter {
    fn test(&self, host: &HostView, _server: &ServerSpec) -> bool {
        host.state == HostState::Active
    }

    fn name(&self) -> &str {
        "host-state"
    }
}

/// Keeps hosts whose provisioned cores stay within `cores * allocation_ratio`
/// after the server lands. The server must also fit the physical machine.
pub struct CoreCapacityFilter {
    allocation_ratio: f64,
}

impl CoreCapacityFilter {
    pub fn new(allocation_ratio: f64) -> Self {
        CoreCapacityFilter { allocation_ratio }
    }
}

impl HostFilter for CoreCapacityFilter {
    fn test(&self, host: &HostView, server: &ServerSpec) -> bool {
        if server.cores > host.cores {
            return false;
        }
        let limit = f64::from(host.cores) * self.allocation_ratio;
        limit - f64::from(host.provisioned_cores) >= f64::from(server.cores)
    }

    fn name(&self) -> &str {
        "core-capacity"
    }
}

/// Keeps hosts with enough free memory for the server's footprint
pub struct MemoryCapacityFilter;

impl HostFilter for MemoryCapacityFilter {
    fn test(&self, host: &HostView, server: &ServerSpec) -> bool {
        host.memory_available_mb >= server.memory_mb
    }

    fn name(&self) -> &str {
        "memory-capacity"
    }
}

/// Keeps hosts carrying every tag the server requires
pub struct RequiredTagsFilter;

impl HostFilter for RequiredTagsFilter {
    fn test(&self, host: &HostView, server: &ServerSpec) -> bool {
        server
            .required_tags
            .iter()
            .all(|tag| host.tags.contains(tag))
    }

    fn name(&self) -> &str {
        "required-tags"
    }
}

/// Rejects hosts already hosting a server of the same anti-affinity group
pub struct AntiAffinityFilter;

impl HostFilter for AntiAffinityFilter {
    fn test(&self, host: &HostView, server: &ServerSpec) -> bool {
        match &server.group {
            Some(group) => !host.hosted_groups.contains(group),
            None => true,
        }
    }

    fn name(&self) -> &str {
        "anti-affinity"
    }
}

// ============================================================================
// Weighers
// ============================================================================

/// Prefers hosts with more core headroom under the allocation ratio
pub struct CoreHeadroomWeigher {
    allocation_ratio: f64,
}

impl CoreHeadroomWeigher {
    pub fn new(allocation_ratio: f64) -> Self {
        CoreHeadroomWeigher { allocation_ratio }
    }
}

impl HostWeigher for CoreHeadroomWeigher {
    fn weigh(&self, host: &HostView, _server: &ServerSpec) -> f64 {
        f64::from(host.cores) * self.allocation_ratio - f64::from(host.provisioned_cores)
    }

    fn name(&self) -> &str {
        "core-headroom"
    }
}

/// Prefers hosts with more free memory
pub struct AvailableMemoryWeigher;

impl HostWeigher for AvailableMemoryWeigher {
    fn weigh(&self, host: &HostView, _server: &ServerSpec) -> f64 {
        host.memory_available_mb as f64
    }

    fn name(&self) -> &str {
        "available-memory"
    }
}

/// Prefers emptier hosts (spreading)
pub struct HostedCountWeigher;

impl HostWeigher for HostedCountWeigher {
    fn weigh(&self, host: &HostView, _server: &ServerSpec) -> f64 {
        -(host.hosted_count as f64)
    }

    fn name(&self) -> &str {
        "hosted-count"
    }
}

// ============================================================================
// Policies
// ============================================================================

/// Filter + weigh pipeline
pub struct FilterWeighPolicy {
    filters: Vec<Box<dyn HostFilter>>,
    /// Weighers with their configurable multipliers (1.0 by default)
    weighers: Vec<(Box<dyn HostWeigher>, f64)>,
}

impl FilterWeighPolicy {
    pub fn new(
        filters: Vec<Box<dyn HostFilter>>,
        weighers: Vec<(Box<dyn HostWeigher>, f64)>,
    ) -> Self {
        FilterWeighPolicy { filters, weighers }
    }

    /// The stock pipeline: state, capacity, tag and anti-affinity filters,
    /// spreading weighers at multiplier 1.0
    pub fn standard() -> Self {
        FilterWeighPolicy::new(
            vec![
                Box::new(HostStateFilter),
                Box::new(CoreCapacityFilter::new(DEFAULT_CORE_ALLOCATION_RATIO)),
                Box::new(MemoryCapacityFilter),
                Box::new(RequiredTagsFilter),
                Box::new(AntiAffinityFilter),
            ],
            vec![
                (
                    Box::new(CoreHeadroomWeigher::new(DEFAULT_CORE_ALLOCATION_RATIO)),
                    1.0,
                ),
                (Box::new(AvailableMemoryWeigher), 1.0),
                (Box::new(HostedCountWeigher), 1.0),
            ],
        )
    }
}

impl PlacementPolicy for FilterWeighPolicy {
    fn select(&mut self, hosts: &[HostView], server: &ServerSpec) -> SchedulingResult {
        // Ascending id order makes the tie-break independent of caller order
        let mut ordered: Vec<&HostView> = hosts.iter().collect();
        ordered.sort_by_key(|host| host.id);

        let mut best: Option<(HostId, f64)> = None;
        for host in ordered {
            if !self.filters.iter().all(|f| f.test(host, server)) {
                continue;
            }
            let weight: f64 = self
                .weighers
                .iter()
                .map(|(weigher, multiplier)| multiplier * weigher.weigh(host, server))
                .sum();
            // Strictly greater keeps the lowest id on equal weights
            match best {
                Some((_, best_weight)) if weight <= best_weight => {}
                _ => best = Some((host.id, weight)),
            }
        }

        best.map(|(id, _)| id)
            .ok_or(SchedulingFailure::NoEligibleHost)
    }

    fn name(&self) -> &str {
        "FilterWeigh"
    }
}

/// Uniformly random choice among the viable hosts, seeded for replay
pub struct RandomPolicy {
    rng: StdRng,
}

impl RandomPolicy {
    pub fn new(seed: u64) -> Self {
        RandomPolicy {
            rng: StdRng::seed_from_u64(seed),
        }
    }
}

impl PlacementPolicy for RandomPolicy {
    fn select(&mut self, hosts: &[HostView], server: &ServerSpec) -> SchedulingResult {
        let mut eligible: Vec<&HostView> =
            hosts.iter().filter(|h| h.can_host(server)).collect();
        eligible.sort_by_key(|host| host.id);

        if eligible.is_empty() {
            return Err(SchedulingFailure::NoEligibleHost);
        }
        Ok(eligible[self.rng.gen_range(0..eligible.len())].id)
    }

    fn name(&self) -> &str {
        "Random"
    }
}

/// Cycles through the viable hosts in id order
pub struct RoundRobinPolicy {
    cursor: usize,
}

impl RoundRobinPolicy {
    pub fn new() -> Self {
        RoundRobinPolicy { cursor: 0 }
    }
}

impl Default for RoundRobinPolicy {
    fn default() -> Self {
        Self::new()
    }
}

impl PlacementPolicy for RoundRobinPolicy {
    fn select(&mut self, hosts: &[HostView], server: &ServerSpec) -> SchedulingResult {
        let mut eligible: Vec<&HostView> =
            hosts.iter().filter(|h| h.can_host(server)).collect();
        eligible.sort_by_key(|host| host.id);

        if eligible.is_empty() {
            return Err(SchedulingFailure::NoEligibleHost);
        }
        let chosen = eligible[self.cursor % eligible.len()].id;
        self.cursor += 1;
        Ok(chosen)
    }

    fn name(&self) -> &str {
        "RoundRobin"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn view(id: u32, provisioned_cores: u32, memory_available_mb: u64) -> HostView {
        HostView {
            id: HostId(id),
            state: HostState::Active,
            cores: 8,
            provisioned_cores,
            memory_mb: 16_384,
            memory_available_mb,
            capacity_mhz: 8 * 2000,
            requested_mhz: 0,
            hosted_count: provisioned_cores.div_ceil(2) as usize,
            tags: Vec::new(),
            hosted_groups: Vec::new(),
        }
    }

    #[test]
    fn test_impossible_request_fails_for_every_host() {
        let mut policy = FilterWeighPolicy::standard();
        let hosts = vec![view(0, 4, 8192), view(1, 0, 16_384)];
        // Wider than any machine in the pool
        let server = ServerSpec::new(16, 1024);

        assert_eq!(
            policy.select(&hosts, &server),
            Err(SchedulingFailure::NoEligibleHost)
        );
    }

    #[test]
    fn test_exactly_one_fit_returns_that_host() {
        let mut policy = FilterWeighPolicy::standard();
        // Only host 1 has the memory
        let hosts = vec![view(0, 2, 512), view(1, 6, 8192), view(2, 2, 512)];
        let server = ServerSpec::new(4, 1024);

        assert_eq!(policy.select(&hosts, &server), Ok(HostId(1)));
    }

    #[test]
    fn test_ties_break_to_lowest_host_id() {
        let mut policy = FilterWeighPolicy::standard();
        // Identical hosts handed over in descending order
        let hosts = vec![view(5, 4, 8192), view(2, 4, 8192), view(9, 4, 8192)];
        let server = ServerSpec::new(1, 512);

        assert_eq!(policy.select(&hosts, &server), Ok(HostId(2)));
    }

    #[test]
    fn test_core_filter_allows_oversubscription_up_to_ratio() {
        // Physically full, but well under 8 * 16 provisionable cores
        let saturated = view(0, 8, 16_384);
        let server = ServerSpec::new(2, 512);

        assert!(CoreCapacityFilter::new(16.0).test(&saturated, &server));
        assert!(!CoreCapacityFilter::new(1.0).test(&saturated, &server));
    }

    #[test]
    fn test_state_filter_drops_down_hosts() {
        let mut policy = FilterWeighPolicy::standard();
        let mut down = view(0, 0, 16_384);
        down.state = HostState::Error;
        let hosts = vec![down, view(1, 6, 4096)];

        assert_eq!(
            policy.select(&hosts, &ServerSpec::new(1, 512)),
            Ok(HostId(1))
        );
    }

    #[test]
    fn test_required_tags_filter() {
        let mut policy = FilterWeighPolicy::standard();
        let mut tagged = view(1, 4, 8192);
        tagged.tags = vec!["gpu".to_string()];
        let hosts = vec![view(0, 0, 16_384), tagged];

        let mut server = ServerSpec::new(1, 512);
        server.required_tags = vec!["gpu".to_string()];

        assert_eq!(policy.select(&hosts, &server), Ok(HostId(1)));
    }

    #[test]
    fn test_anti_affinity_filter() {
        let mut policy = FilterWeighPolicy::standard();
        let mut occupied = view(0, 0, 16_384);
        occupied.hosted_groups = vec!["db".to_string()];
        let hosts = vec![occupied, view(1, 6, 4096)];

        let mut server = ServerSpec::new(1, 512);
        server.group = Some("db".to_string());

        assert_eq!(policy.select(&hosts, &server), Ok(HostId(1)));
    }

    #[test]
    fn test_weigher_multiplier_reweighs_choice() {
        // Host 0 leads on core headroom, host 1 on memory
        let hosts = vec![view(0, 2, 2048), view(1, 6, 12_288)];
        let server = ServerSpec::new(1, 512);

        let mut cores_first = FilterWeighPolicy::new(
            vec![Box::new(HostStateFilter)],
            vec![
                (Box::new(CoreHeadroomWeigher::new(1.0)), 1.0),
                (Box::new(AvailableMemoryWeigher), 0.0),
            ],
        );
        assert_eq!(cores_first.select(&hosts, &server), Ok(HostId(0)));

        let mut memory_first = FilterWeighPolicy::new(
            vec![Box::new(HostStateFilter)],
            vec![
                (Box::new(CoreHeadroomWeigher::new(1.0)), 0.0),
                (Box::new(AvailableMemoryWeigher), 1.0),
            ],
        );
        assert_eq!(memory_first.select(&hosts, &server), Ok(HostId(1)));
    }

    #[test]
    fn test_random_policy_replays_with_same_seed() {
        let hosts = vec![view(0, 0, 16_384), view(1, 0, 16_384), view(2, 0, 16_384)];
        let server = ServerSpec::new(1, 512);

        let picks = |seed: u64| -> Vec<HostId> {
            let mut policy = RandomPolicy::new(seed);
            (0..10)
                .map(|_| policy.select(&hosts, &server).unwrap())
                .collect()
        };

        assert_eq!(picks(7), picks(7));
    }

    #[test]
    fn test_random_policy_respects_viability() {
        let mut policy = RandomPolicy::new(1);
        let mut full = view(0, 0, 16_384);
        full.memory_available_mb = 0;
        let hosts = vec![full, view(1, 4, 16_384)];
        let server = ServerSpec::new(2, 512);

        for _ in 0..10 {
            assert_eq!(policy.select(&hosts, &server), Ok(HostId(1)));
        }

        assert_eq!(
            policy.select(&hosts, &ServerSpec::new(16, 512)),
            Err(SchedulingFailure::NoEligibleHost)
        );
    }

    #[test]
    fn test_round_robin_cycles_in_id_order() {
        let mut policy = RoundRobinPolicy::new();
        let hosts = vec![view(1, 0, 16_384), view(0, 0, 16_384)];
        let server = ServerSpec::new(1, 512);

        assert_eq!(policy.select(&hosts, &server), Ok(HostId(0)));
        assert_eq!(policy.select(&hosts, &server), Ok(HostId(1)));
        assert_eq!(policy.select(&hosts, &server), Ok(HostId(0)));
    }
}
