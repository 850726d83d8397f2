//! Physical host model
//!
//! A host owns its static capacity, its occupancy state, the footprints of
//! the servers placed on it, and the [`FlowStage`] their demand contends on.
//! Core and memory bookkeeping is static (counts, independent of flow
//! rates); CPU sharing is the stage's business. Cores are time-shared, so a
//! host accepts any server whose core count fits the physical machine and
//! tracks the oversubscribed total; memory is partitioned and never
//! overcommitted.
//!
//! The host also integrates the CPU-time and energy figures that feed slice
//! reports and the end-of-run summary. `accrue` folds the elapsed interval
//! into those accumulators and must run before any state or flow mutation.

use std::collections::BTreeMap;

use boreas_kernel::Instant;

use crate::error::{PlacementError, Result};
use crate::flow::FlowStage;
use crate::interference::InterferenceDomain;
use crate::telemetry::SliceReport;
use crate::types::{HostId, HostSpec, HostState, ServerId, ServerSpec};

/// Static footprint held by one hosted server
#[derive(Debug, Clone)]
struct ServerFootprint {
    cores: u32,
    memory_mb: u64,
    group: Option<String>,
}

/// Immutable scheduler-facing snapshot of a host.
///
/// The scheduler never mutates a host; it reads views and the simulator
/// applies the decision through [`Host::deploy`].
#[derive(Debug, Clone)]
pub struct HostView {
    pub id: HostId,
    pub state: HostState,
    /// Physical core count
    pub cores: u32,
    /// Sum of hosted core footprints; exceeds `cores` under oversubscription
    pub provisioned_cores: u32,
    pub memory_mb: u64,
    pub memory_available_mb: u64,
    /// Raw CPU capacity in MHz
    pub capacity_mhz: u64,
    /// Total requested rate as of the last resolution
    pub requested_mhz: u64,
    pub hosted_count: usize,
    pub tags: Vec<String>,
    /// Anti-affinity groups of the hosted servers
    pub hosted_groups: Vec<String>,
}

impl HostView {
    /// Viability check used by the single-shot placement policies: the
    /// machine can physically run the server, with memory actually free
    pub fn can_host(&self, server: &ServerSpec) -> bool {
        self.state == HostState::Active
            && server.cores <= self.cores
            && self.memory_available_mb >= server.memory_mb
    }
}

/// A physical host and everything placed on it
#[derive(Debug)]
pub struct Host {
    id: HostId,
    spec: HostSpec,
    state: HostState,
    stage: FlowStage,
    hosted: BTreeMap<ServerId, ServerFootprint>,
    provisioned_cores: u32,
    memory_used_mb: u64,

    // Telemetry accumulators (MHz-tick integrals)
    last_accrual: Instant,
    slice_requested_area: u64,
    slice_capacity_area: u64,
    total_requested_area: u64,
    total_granted_area: u64,
    energy: f64,
    last_power_w: f64,
    last_utilization: f64,
}

impl Host {
    /// Build a host from topology data; it starts in `Unknown` until booted
    pub fn new(id: HostId, spec: HostSpec) -> Self {
        let capacity = spec.total_capacity_mhz();
        Host {
            id,
            spec,
            state: HostState::Unknown,
            stage: FlowStage::new(id, capacity),
            hosted: BTreeMap::new(),
            provisioned_cores: 0,
            memory_used_mb: 0,
            last_accrual: 0,
            slice_requested_area: 0,
            slice_capacity_area: 0,
            total_requested_area: 0,
            total_granted_area: 0,
            energy: 0.0,
            last_power_w: 0.0,
            last_utilization: f64::NAN,
        }
    }

    pub fn id(&self) -> HostId {
        self.id
    }

    pub fn state(&self) -> HostState {
        self.state
    }

    pub fn spec(&self) -> &HostSpec {
        &self.spec
    }

    pub fn hosted_count(&self) -> usize {
        self.hosted.len()
    }

    /// Sum of hosted core footprints, unbounded by the physical count
    pub fn provisioned_cores(&self) -> u32 {
        self.provisioned_cores
    }

    pub fn memory_available_mb(&self) -> u64 {
        self.spec.memory_mb - self.memory_used_mb
    }

    /// Granted-over-capacity ratio as of the last resolution
    pub fn utilization(&self) -> f64 {
        let capacity = self.stage.effective_capacity_mhz();
        if capacity == 0 {
            0.0
        } else {
            self.stage.total_granted_mhz() as f64 / capacity as f64
        }
    }

    pub fn granted_mhz(&self, server: ServerId) -> Option<u64> {
        self.stage.granted_mhz(server)
    }

    /// Boot is underway; the host is not accepting servers yet
    pub fn mark_booting(&mut self, now: Instant) {
        self.accrue(now);
        self.state = HostState::Boot;
    }

    /// Transition into `Active`, from fresh boot or from a restart
    pub fn mark_active(&mut self, now: Instant) {
        self.accrue(now);
        self.state = HostState::Active;
    }

    /// Leave `Active` for `Shutoff` or `Error`.
    ///
    /// The caller must have evicted every hosted server first.
    pub fn mark_down(&mut self, state: HostState, now: Instant) {
        self.accrue(now);
        self.state = state;
    }

    /// Check the static footprint without placing anything.
    ///
    /// Cores are checked against the physical machine, not against what is
    /// already provisioned, so the CPU can be oversubscribed; memory must
    /// actually be free.
    pub fn can_fit(&self, server: &ServerSpec) -> std::result::Result<(), PlacementError> {
        if self.state != HostState::Active {
            return Err(PlacementError::HostNotActive(self.state));
        }
        if server.cores > self.spec.cores {
            return Err(PlacementError::InsufficientCores {
                need: server.cores,
                have: self.spec.cores,
            });
        }
        if server.memory_mb > self.memory_available_mb() {
            return Err(PlacementError::InsufficientMemory {
                need: server.memory_mb,
                have: self.memory_available_mb(),
            });
        }
        Ok(())
    }

    /// Place a server: reserve its footprint and attach its flow source.
    ///
    /// Fails with a typed [`PlacementError`] when the footprint does not fit;
    /// nothing is reserved in that case.
    pub fn deploy(
        &mut self,
        server: ServerId,
        spec: &ServerSpec,
        demand_mhz: u64,
        domain: &dyn InterferenceDomain,
        now: Instant,
    ) -> Result<()> {
        self.can_fit(spec)?;
        self.accrue(now);

        self.provisioned_cores += spec.cores;
        self.memory_used_mb += spec.memory_mb;
        self.hosted.insert(
            server,
            ServerFootprint {
                cores: spec.cores,
                memory_mb: spec.memory_mb,
                group: spec.group.clone(),
            },
        );
        self.stage
            .attach(server, demand_mhz, spec.interference_key.clone());
        self.stage.resolve(domain)
    }

    /// Remove one server, freeing its footprint. `false` if it was not here.
    pub fn detach(
        &mut self,
        server: ServerId,
        domain: &dyn InterferenceDomain,
        now: Instant,
    ) -> Result<bool> {
        let Some(footprint) = self.hosted.remove(&server) else {
            return Ok(false);
        };
        self.accrue(now);
        self.provisioned_cores -= footprint.cores;
        self.memory_used_mb -= footprint.memory_mb;
        self.stage.detach(server);
        self.stage.resolve(domain)?;
        Ok(true)
    }

    /// Change a hosted server's requested rate (next fragment starting)
    pub fn set_demand(
        &mut self,
        server: ServerId,
        demand_mhz: u64,
        domain: &dyn InterferenceDomain,
        now: Instant,
    ) -> Result<()> {
        self.accrue(now);
        self.stage.set_request(server, demand_mhz);
        self.stage.resolve(domain)
    }

    /// Detach every hosted server and return their ids, ascending.
    ///
    /// The host is still `Active` while this runs; the simulator notifies
    /// each returned server before flipping the state, so none is silently
    /// dropped.
    pub fn evict_all(
        &mut self,
        domain: &dyn InterferenceDomain,
        now: Instant,
    ) -> Result<Vec<ServerId>> {
        self.accrue(now);
        let evicted: Vec<ServerId> = self.hosted.keys().copied().collect();
        for server in &evicted {
            self.stage.detach(*server);
        }
        self.hosted.clear();
        self.provisioned_cores = 0;
        self.memory_used_mb = 0;
        self.stage.resolve(domain)?;
        Ok(evicted)
    }

    /// Snapshot for the placement pipeline
    pub fn view(&self) -> HostView {
        HostView {
            id: self.id,
            state: self.state,
            cores: self.spec.cores,
            provisioned_cores: self.provisioned_cores,
            memory_mb: self.spec.memory_mb,
            memory_available_mb: self.memory_available_mb(),
            capacity_mhz: self.spec.total_capacity_mhz(),
            requested_mhz: self.stage.total_requested_mhz(),
            hosted_count: self.hosted.len(),
            tags: self.spec.tags.clone(),
            hosted_groups: self
                .hosted
                .values()
                .filter_map(|f| f.group.clone())
                .collect(),
        }
    }

    /// Fold the interval since the last accrual into the CPU-time and
    /// energy accumulators. Capacity and demand only count while `Active`.
    pub fn accrue(&mut self, now: Instant) {
        let dt = now.saturating_sub(self.last_accrual);
        if dt > 0 {
            if self.state == HostState::Active {
                let requested = self.stage.total_requested_mhz() * dt;
                self.slice_requested_area += requested;
                self.total_requested_area += requested;
                self.slice_capacity_area += self.stage.effective_capacity_mhz() * dt;
                self.total_granted_area += self.stage.total_granted_mhz() * dt;
            }
            self.energy += self.last_power_w * dt as f64;
        }
        self.last_accrual = now;
    }

    /// True when the next power sample would differ from the last one
    /// emitted. The first comparison always reports a change.
    pub fn power_changed(&self, utilization: f64, watts: f64) -> bool {
        self.last_utilization != utilization || self.last_power_w != watts
    }

    /// Record the power sample the simulator just emitted
    pub fn record_power(&mut self, utilization: f64, watts: f64) {
        self.last_utilization = utilization;
        self.last_power_w = watts;
    }

    /// Drain the slice accumulators into a report
    pub fn take_slice_report(&mut self, now: Instant) -> SliceReport {
        self.accrue(now);
        let report = SliceReport {
            time: now,
            host: self.id,
            total_requested_cpu_time: self.slice_requested_area,
            total_cpu_time_capacity: self.slice_capacity_area,
            hosted_count: self.hosted.len(),
        };
        self.slice_requested_area = 0;
        self.slice_capacity_area = 0;
        report
    }

    /// Lifetime requested CPU time, in MHz-ticks
    pub fn total_requested_area(&self) -> u64 {
        self.total_requested_area
    }

    /// Lifetime granted CPU time, in MHz-ticks
    pub fn total_granted_area(&self) -> u64 {
        self.total_granted_area
    }

    /// Integrated power draw, in watt-ticks
    pub fn energy(&self) -> f64 {
        self.energy
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SimulationError;
    use crate::interference::NoInterference;

    fn active_host(id: u32) -> Host {
        let mut host = Host::new(HostId(id), HostSpec::new(4, 1000, 8192));
        host.mark_active(0);
        host
    }

    #[test]
    fn test_deploy_reserves_footprint() {
        let mut host = active_host(0);
        let spec = ServerSpec::new(2, 2048);

        host.deploy(ServerId(1), &spec, 2000, &NoInterference, 0)
            .unwrap();

        assert_eq!(host.provisioned_cores(), 2);
        assert_eq!(host.memory_available_mb(), 6144);
        assert_eq!(host.hosted_count(), 1);
        assert_eq!(host.granted_mhz(ServerId(1)), Some(2000));
    }

    #[test]
    fn test_cores_oversubscribe_memory_does_not() {
        let mut host = active_host(0);

        // Three 2-core servers on a 4-core machine: fine, CPU is time-shared
        for id in 1..=3 {
            host.deploy(ServerId(id), &ServerSpec::new(2, 1024), 2000, &NoInterference, 0)
                .unwrap();
        }
        assert_eq!(host.provisioned_cores(), 6);
        assert_eq!(host.granted_mhz(ServerId(1)), Some(1333));

        // Memory is partitioned: 5120 free, 6000 requested
        assert!(matches!(
            host.can_fit(&ServerSpec::new(1, 6000)),
            Err(PlacementError::InsufficientMemory { need: 6000, have: 5120 })
        ));
    }

    #[test]
    fn test_deploy_rejections_are_typed() {
        let mut host = Host::new(HostId(0), HostSpec::new(4, 1000, 8192));
        let spec = ServerSpec::new(2, 2048);

        // Not booted yet
        let err = host.deploy(ServerId(1), &spec, 2000, &NoInterference, 0);
        assert!(matches!(
            err,
            Err(SimulationError::Placement(PlacementError::HostNotActive(
                HostState::Unknown
            )))
        ));

        host.mark_active(0);
        // Wider than the physical machine
        let wide = ServerSpec::new(8, 1024);
        assert!(matches!(
            host.can_fit(&wide),
            Err(PlacementError::InsufficientCores { need: 8, have: 4 })
        ));

        let heavy = ServerSpec::new(2, 100_000);
        assert!(matches!(
            host.can_fit(&heavy),
            Err(PlacementError::InsufficientMemory { need: 100_000, .. })
        ));
        // Nothing was reserved by the failed attempts
        assert_eq!(host.provisioned_cores(), 0);
        assert_eq!(host.hosted_count(), 0);
    }

    #[test]
    fn test_detach_frees_footprint() {
        let mut host = active_host(0);
        let spec = ServerSpec::new(2, 2048);
        host.deploy(ServerId(1), &spec, 2000, &NoInterference, 0)
            .unwrap();

        assert!(host.detach(ServerId(1), &NoInterference, 5).unwrap());
        assert_eq!(host.provisioned_cores(), 0);
        assert_eq!(host.memory_available_mb(), 8192);
        assert!(!host.detach(ServerId(1), &NoInterference, 5).unwrap());
    }

    #[test]
    fn test_evict_all_returns_every_hosted_server() {
        let mut host = active_host(0);
        let spec = ServerSpec::new(1, 1024);
        for id in [3, 1, 2] {
            host.deploy(ServerId(id), &spec, 500, &NoInterference, 0)
                .unwrap();
        }

        let evicted = host.evict_all(&NoInterference, 10).unwrap();
        assert_eq!(evicted, vec![ServerId(1), ServerId(2), ServerId(3)]);
        assert_eq!(host.hosted_count(), 0);
        assert_eq!(host.provisioned_cores(), 0);
        // Eviction itself does not change the occupancy state
        assert_eq!(host.state(), HostState::Active);
    }

    #[test]
    fn test_view_reflects_bookkeeping() {
        let mut host = active_host(7);
        let mut spec = ServerSpec::new(2, 2048);
        spec.group = Some("db".to_string());
        host.deploy(ServerId(1), &spec, 2000, &NoInterference, 0)
            .unwrap();

        let view = host.view();
        assert_eq!(view.id, HostId(7));
        assert_eq!(view.provisioned_cores, 2);
        assert_eq!(view.memory_available_mb, 6144);
        assert_eq!(view.requested_mhz, 2000);
        assert_eq!(view.hosted_groups, vec!["db".to_string()]);
        assert!(view.can_host(&ServerSpec::new(4, 1024)));
        assert!(!view.can_host(&ServerSpec::new(5, 1024)));
        assert!(!view.can_host(&ServerSpec::new(1, 7000)));
    }

    #[test]
    fn test_slice_report_integrates_and_resets() {
        let mut host = active_host(0);
        let spec = ServerSpec::new(2, 2048);
        host.deploy(ServerId(1), &spec, 2000, &NoInterference, 0)
            .unwrap();

        let report = host.take_slice_report(100);
        assert_eq!(report.total_requested_cpu_time, 2000 * 100);
        assert_eq!(report.total_cpu_time_capacity, 4000 * 100);
        assert_eq!(report.hosted_count, 1);

        // Accumulators reset after the report
        let next = host.take_slice_report(100);
        assert_eq!(next.total_requested_cpu_time, 0);
        assert_eq!(host.total_requested_area(), 2000 * 100);
    }

    #[test]
    fn test_utilization_tracks_grants() {
        let mut host = active_host(0);
        assert_eq!(host.utilization(), 0.0);

        host.deploy(ServerId(1), &ServerSpec::new(2, 1024), 2000, &NoInterference, 0)
            .unwrap();
        assert_eq!(host.utilization(), 0.5);
    }
}
