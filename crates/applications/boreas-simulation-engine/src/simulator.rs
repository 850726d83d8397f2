//! Discrete-event datacenter simulator
//!
//! The simulator wires the kernel's event queue to the host, flow, placement,
//! power and checkpoint models. Every state change happens inside an event
//! handler; a handler runs to completion and expresses any waiting by
//! scheduling a future event, so one timeline is strictly sequential and
//! replays identically for the same inputs and seed.
//!
//! Placement failure is not fatal: the server parks in a FIFO pending queue
//! and the queue drains whenever capacity frees up (a completion, a host
//! boot or a repair). The policies themselves never retry.

use std::collections::{BTreeMap, VecDeque};

use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Exp};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use boreas_kernel::{EventHandle, EventQueue, Instant};

use crate::error::{Result, SimulationError};
use crate::host::{Host, HostView};
use crate::interference::InterferenceDomain;
use crate::power::PowerModel;
use crate::scheduler::PlacementPolicy;
use crate::telemetry::{PowerSample, TelemetrySink};
use crate::types::{Fragment, HostId, HostSpec, HostState, ServerId, ServerSpec};
use crate::workload::{Arrival, FaultProfile, ServerRequest, WorkloadTrace, exp_from_mean};

/// Everything that can happen on the timeline
#[derive(Debug, Clone, Copy)]
enum SimEvent {
    /// A directly submitted server becomes due for placement
    ServerSubmit { server: ServerId },
    /// The buffered trace arrival is due
    TraceArrival,
    /// The current fragment finishes its playback
    FragmentDone { server: ServerId },
    /// Productive time crossed a checkpoint boundary
    CheckpointBegin { server: ServerId },
    /// Checkpoint writeback finished, productive playback resumes
    CheckpointEnd { server: ServerId },
    /// A host finishes booting
    HostBoot { host: HostId },
    /// Operator-initiated graceful power-down
    HostShutdown { host: HostId },
    /// Injected failure takes a host down
    HostFault { host: HostId },
    /// A downed host comes back
    HostRestart { host: HostId },
    /// Periodic telemetry boundary
    SliceReport,
}

/// Knobs for one simulation timeline
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulatorConfig {
    /// Width of a telemetry slice; must be positive
    pub slice_ticks: u64,
    /// Delay between start-of-run and hosts turning `Active`
    pub boot_delay_ticks: u64,
    /// Stochastic host failure/repair process, `None` disables it
    pub fault_profile: Option<FaultProfile>,
    /// Seed for the fault process
    pub seed: u64,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        SimulatorConfig {
            slice_ticks: 300,
            boot_delay_ticks: 0,
            fault_profile: None,
            seed: 0,
        }
    }
}

/// Execution state of one submitted server
struct ServerRuntime {
    name: String,
    spec: ServerSpec,
    /// Fragments not started yet
    fragments: VecDeque<Fragment>,
    /// Fragment currently playing, or parked with the server while pending
    current: Option<Fragment>,
    /// Ticks of the current fragment still to play
    fragment_remaining: u64,
    /// Productive ticks across the server lifetime; drives checkpoint
    /// boundaries and survives evictions
    productive_ticks: u64,
    submitted_at: Instant,
    completed_at: Option<Instant>,
    placed_on: Option<HostId>,
    /// When the current run segment (productive or checkpoint) started
    segment_started: Instant,
    in_checkpoint: bool,
    completion_event: Option<EventHandle>,
    checkpoint_event: Option<EventHandle>,
    evictions: u64,
    checkpoints: u64,
}

/// End-of-run summary for one timeline
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulationResult {
    pub policy_name: String,
    pub total_servers: usize,
    pub completed_servers: usize,
    /// Failed placement attempts, retries included
    pub placement_failures: u64,
    pub total_evictions: u64,
    pub checkpoints_taken: u64,
    pub average_turnaround_ticks: f64,
    pub p99_turnaround_ticks: u64,
    /// Lifetime requested CPU time over all hosts, in MHz-ticks
    pub requested_cpu_time: u64,
    /// Lifetime granted CPU time over all hosts, in MHz-ticks
    pub granted_cpu_time: u64,
    /// Integrated power draw over all hosts, in watt-ticks
    pub total_energy: f64,
}

/// One simulation timeline: clock, hosts, servers and the models around them
pub struct Simulator {
    queue: EventQueue<SimEvent>,
    hosts: BTreeMap<HostId, Host>,
    servers: BTreeMap<ServerId, ServerRuntime>,
    /// Servers waiting for capacity, in arrival order
    pending: VecDeque<ServerId>,
    policy: Box<dyn PlacementPolicy>,
    interference: Box<dyn InterferenceDomain>,
    power: Box<dyn PowerModel>,
    sink: Box<dyn TelemetrySink>,
    trace: Option<Box<dyn WorkloadTrace>>,
    buffered_arrival: Option<Arrival>,
    config: SimulatorConfig,
    rng: StdRng,
    fail_dist: Option<Exp<f64>>,
    repair_dist: Option<Exp<f64>>,
    /// Armed failure timer of each host, at most one per host
    fault_events: BTreeMap<HostId, EventHandle>,
    next_server_id: u64,
    placement_failures: u64,
    total_evictions: u64,
    checkpoints_taken: u64,
}

impl Simulator {
    /// Build a timeline from topology data. Hosts boot `boot_delay_ticks`
    /// into the run; the first telemetry slice closes after `slice_ticks`.
    pub fn new(
        topology: Vec<HostSpec>,
        policy: Box<dyn PlacementPolicy>,
        interference: Box<dyn InterferenceDomain>,
        power: Box<dyn PowerModel>,
        sink: Box<dyn TelemetrySink>,
        config: SimulatorConfig,
    ) -> Result<Self> {
        if config.slice_ticks == 0 {
            return Err(SimulationError::invalid_argument(
                "slice_ticks must be positive",
            ));
        }
        let (fail_dist, repair_dist) = match &config.fault_profile {
            Some(profile) => (
                Some(exp_from_mean(
                    profile.mean_time_to_fail_ticks,
                    "mean_time_to_fail_ticks",
                )?),
                Some(exp_from_mean(
                    profile.mean_time_to_repair_ticks,
                    "mean_time_to_repair_ticks",
                )?),
            ),
            None => (None, None),
        };

        let mut queue = EventQueue::new();
        let mut hosts = BTreeMap::new();
        for (index, spec) in topology.into_iter().enumerate() {
            let id = HostId(index as u32);
            let mut host = Host::new(id, spec);
            host.mark_booting(0);
            hosts.insert(id, host);
            // Boots are scheduled before anything else, so a submission at
            // the same instant already sees the hosts Active
            queue.schedule_after(config.boot_delay_ticks, SimEvent::HostBoot { host: id });
        }
        queue.schedule_after(config.slice_ticks, SimEvent::SliceReport);

        let mut sim = Simulator {
            queue,
            hosts,
            servers: BTreeMap::new(),
            pending: VecDeque::new(),
            policy,
            interference,
            power,
            sink,
            trace: None,
            buffered_arrival: None,
            rng: StdRng::seed_from_u64(config.seed),
            config,
            fail_dist,
            repair_dist,
            fault_events: BTreeMap::new(),
            next_server_id: 0,
            placement_failures: 0,
            total_evictions: 0,
            checkpoints_taken: 0,
        };
        if sim.fail_dist.is_some() {
            let ids: Vec<HostId> = sim.hosts.keys().copied().collect();
            for id in ids {
                sim.schedule_next_fault(id);
            }
        }
        Ok(sim)
    }

    /// Current virtual time
    pub fn now(&self) -> Instant {
        self.queue.now()
    }

    /// Submit one server for placement at `at`; its id is returned
    /// immediately, placement happens when the clock gets there
    pub fn submit(&mut self, request: ServerRequest, at: Instant) -> Result<ServerId> {
        if at < self.queue.now() {
            return Err(boreas_kernel::InvalidScheduling {
                at,
                now: self.queue.now(),
            }
            .into());
        }
        let id = self.register(request, at);
        self.queue.schedule_at(at, SimEvent::ServerSubmit { server: id })?;
        Ok(id)
    }

    /// Feed a workload trace; arrivals are pulled lazily, one ahead
    pub fn attach_trace(&mut self, mut trace: Box<dyn WorkloadTrace>) -> Result<()> {
        if let Some(first) = trace.next_arrival() {
            self.queue.schedule_at(first.submit_at, SimEvent::TraceArrival)?;
            self.buffered_arrival = Some(first);
        }
        self.trace = Some(trace);
        Ok(())
    }

    /// Gracefully power a host down at `at`, evicting whatever it hosts
    pub fn schedule_host_shutdown(&mut self, host: HostId, at: Instant) -> Result<EventHandle> {
        Ok(self.queue.schedule_at(at, SimEvent::HostShutdown { host })?)
    }

    /// Inject a host failure at `at`
    pub fn schedule_host_fault(&mut self, host: HostId, at: Instant) -> Result<EventHandle> {
        Ok(self.queue.schedule_at(at, SimEvent::HostFault { host })?)
    }

    /// Bring a `SHUTOFF` or `ERROR` host back at `at`
    pub fn schedule_host_restart(&mut self, host: HostId, at: Instant) -> Result<EventHandle> {
        Ok(self.queue.schedule_at(at, SimEvent::HostRestart { host })?)
    }

    /// Fire the single earliest pending event; `false` when the queue is empty
    pub fn step(&mut self) -> Result<bool> {
        let Some((_, event)) = self.queue.pop() else {
            return Ok(false);
        };
        self.process_event(event)?;
        Ok(true)
    }

    /// Step while the next event's timestamp is within the deadline
    pub fn run_until(&mut self, deadline: Instant) -> Result<()> {
        while let Some(at) = self.queue.peek_time() {
            if at > deadline {
                break;
            }
            self.step()?;
        }
        Ok(())
    }

    /// Run to the deadline and build the end-of-run summary
    pub fn run(&mut self, deadline: Instant) -> Result<SimulationResult> {
        self.run_until(deadline)?;
        Ok(self.collect_results(deadline))
    }

    /// Granted CPU rate of a placed server, as of the last resolution
    pub fn granted_mhz(&self, server: ServerId) -> Option<u64> {
        let runtime = self.servers.get(&server)?;
        self.hosts.get(&runtime.placed_on?)?.granted_mhz(server)
    }

    pub fn host_state(&self, host: HostId) -> Option<HostState> {
        self.hosts.get(&host).map(Host::state)
    }

    pub fn server_completed_at(&self, server: ServerId) -> Option<Instant> {
        self.servers.get(&server).and_then(|s| s.completed_at)
    }

    /// Servers currently parked waiting for capacity
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    fn process_event(&mut self, event: SimEvent) -> Result<()> {
        match event {
            SimEvent::ServerSubmit { server } => self.admit(server),
            SimEvent::TraceArrival => self.handle_trace_arrival(),
            SimEvent::FragmentDone { server } => self.handle_fragment_done(server),
            SimEvent::CheckpointBegin { server } => self.handle_checkpoint_begin(server),
            SimEvent::CheckpointEnd { server } => self.handle_checkpoint_end(server),
            SimEvent::HostBoot { host } => self.handle_host_boot(host),
            SimEvent::HostShutdown { host } => self.take_down_host(host, HostState::Shutoff),
            SimEvent::HostFault { host } => self.handle_host_fault(host),
            SimEvent::HostRestart { host } => self.handle_host_restart(host),
            SimEvent::SliceReport => self.handle_slice_report(),
        }
    }

    // ------------------------------------------------------------------
    // Arrival and placement
    // ------------------------------------------------------------------

    fn register(&mut self, request: ServerRequest, submitted_at: Instant) -> ServerId {
        let id = ServerId(self.next_server_id);
        self.next_server_id += 1;

        let mut fragments: VecDeque<Fragment> = request.fragments.into();
        // Zero-length fragments complete instantly; skip straight to real work
        let mut current = None;
        while let Some(fragment) = fragments.pop_front() {
            if fragment.duration_ticks > 0 {
                current = Some(fragment);
                break;
            }
        }
        let fragment_remaining = current.map_or(0, |f| f.duration_ticks);

        self.servers.insert(
            id,
            ServerRuntime {
                name: request.name,
                spec: request.spec,
                fragments,
                current,
                fragment_remaining,
                productive_ticks: 0,
                submitted_at,
                completed_at: None,
                placed_on: None,
                segment_started: submitted_at,
                in_checkpoint: false,
                completion_event: None,
                checkpoint_event: None,
                evictions: 0,
                checkpoints: 0,
            },
        );
        id
    }

    /// Entry point shared by direct submissions and trace arrivals
    fn admit(&mut self, server_id: ServerId) -> Result<()> {
        let now = self.queue.now();
        let empty = match self.servers.get_mut(&server_id) {
            Some(server) if server.current.is_none() => {
                server.completed_at = Some(now);
                true
            }
            Some(_) => false,
            None => return Ok(()),
        };
        if empty {
            info!(server = %server_id, "no compute attached, completed at submit");
            return Ok(());
        }
        if !self.try_place(server_id)? {
            debug!(server = %server_id, "parked until capacity frees up");
            self.pending.push_back(server_id);
        }
        Ok(())
    }

    fn handle_trace_arrival(&mut self) -> Result<()> {
        let Some(arrival) = self.buffered_arrival.take() else {
            return Ok(());
        };
        let now = self.queue.now();
        let id = self.register(arrival.server, now);
        self.admit(id)?;

        // Pull the next arrival so the trace stays one event ahead
        let next = self.trace.as_mut().and_then(|t| t.next_arrival());
        if let Some(next) = next {
            self.queue.schedule_at(next.submit_at, SimEvent::TraceArrival)?;
            self.buffered_arrival = Some(next);
        }
        Ok(())
    }

    /// One placement attempt. `false` means the caller should park the
    /// server; fatal flow errors propagate.
    fn try_place(&mut self, server_id: ServerId) -> Result<bool> {
        let now = self.queue.now();
        let (spec, fragment) = match self.servers.get(&server_id) {
            Some(server) => (server.spec.clone(), server.current),
            None => return Ok(false),
        };

        let views: Vec<HostView> = self.hosts.values().map(Host::view).collect();
        let target = match self.policy.select(&views, &spec) {
            Ok(host) => host,
            Err(failure) => {
                self.placement_failures += 1;
                debug!(server = %server_id, %failure, "placement failed");
                return Ok(false);
            }
        };

        {
            let Some(host) = self.hosts.get_mut(&target) else {
                return Ok(false);
            };
            let demand = fragment.map_or(0, |f| f.demand_mhz(host.spec().core_rate_mhz));
            match host.deploy(server_id, &spec, demand, self.interference.as_ref(), now) {
                Ok(()) => {}
                Err(SimulationError::Placement(reason)) => {
                    // The policy raced ahead of the host's own bookkeeping
                    self.placement_failures += 1;
                    warn!(server = %server_id, host = %target, %reason, "deploy rejected");
                    return Ok(false);
                }
                Err(fatal) => return Err(fatal),
            }
        }

        if let Some(server) = self.servers.get_mut(&server_id) {
            server.placed_on = Some(target);
            server.in_checkpoint = false;
        }
        info!(server = %server_id, host = %target, "server placed");
        self.begin_segment(server_id)?;
        self.sample_power(target)?;
        Ok(true)
    }

    /// Retry every parked server, keeping the ones that still do not fit
    fn place_pending(&mut self) -> Result<()> {
        let mut waiting = std::mem::take(&mut self.pending);
        while let Some(server_id) = waiting.pop_front() {
            if !self.try_place(server_id)? {
                self.pending.push_back(server_id);
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Execution and checkpoints
    // ------------------------------------------------------------------

    /// Schedule the events that end the run segment starting now: the next
    /// checkpoint boundary (if one falls inside the current fragment) and
    /// the fragment completion. The boundary is scheduled first, so at a tie
    /// the checkpoint wins.
    fn begin_segment(&mut self, server_id: ServerId) -> Result<()> {
        let now = self.queue.now();
        let Some(server) = self.servers.get_mut(&server_id) else {
            return Ok(());
        };
        server.segment_started = now;
        let remaining = server.fragment_remaining;

        if let Some(policy) = server.spec.checkpoint {
            if policy.wait_ticks > 0 {
                let delta = policy.next_boundary(server.productive_ticks) - server.productive_ticks;
                if delta <= remaining {
                    let handle = self
                        .queue
                        .schedule_after(delta, SimEvent::CheckpointBegin { server: server_id });
                    server.checkpoint_event = Some(handle);
                }
            }
        }
        let handle = self
            .queue
            .schedule_after(remaining, SimEvent::FragmentDone { server: server_id });
        server.completion_event = Some(handle);
        Ok(())
    }

    fn handle_fragment_done(&mut self, server_id: ServerId) -> Result<()> {
        let now = self.queue.now();
        let (next, placed_on) = {
            let Some(server) = self.servers.get_mut(&server_id) else {
                return Ok(());
            };
            server.completion_event = None;
            if let Some(handle) = server.checkpoint_event.take() {
                self.queue.cancel(handle);
            }
            server.productive_ticks += server.fragment_remaining;
            server.fragment_remaining = 0;

            let next = loop {
                match server.fragments.pop_front() {
                    Some(f) if f.duration_ticks == 0 => continue,
                    other => break other,
                }
            };
            match next {
                Some(fragment) => {
                    server.current = Some(fragment);
                    server.fragment_remaining = fragment.duration_ticks;
                }
                None => {
                    server.current = None;
                    server.completed_at = Some(now);
                }
            }
            (next, server.placed_on)
        };

        match (next, placed_on) {
            (Some(fragment), Some(host_id)) => {
                // Same host, new demand
                let Some(host) = self.hosts.get_mut(&host_id) else {
                    return Ok(());
                };
                let demand = fragment.demand_mhz(host.spec().core_rate_mhz);
                host.set_demand(server_id, demand, self.interference.as_ref(), now)?;
                self.begin_segment(server_id)?;
                self.sample_power(host_id)
            }
            (None, Some(host_id)) => {
                if let Some(host) = self.hosts.get_mut(&host_id) {
                    host.detach(server_id, self.interference.as_ref(), now)?;
                }
                if let Some(server) = self.servers.get_mut(&server_id) {
                    server.placed_on = None;
                    info!(server = %server_id, name = %server.name, host = %host_id, "server completed");
                }
                self.sample_power(host_id)?;
                self.place_pending()
            }
            // Fragments only play while placed
            (_, None) => Ok(()),
        }
    }

    fn handle_checkpoint_begin(&mut self, server_id: ServerId) -> Result<()> {
        let now = self.queue.now();
        let Some(server) = self.servers.get_mut(&server_id) else {
            return Ok(());
        };
        server.checkpoint_event = None;
        let Some(policy) = server.spec.checkpoint else {
            return Ok(());
        };
        if server.placed_on.is_none() {
            return Ok(());
        }

        // Commit the productive run that led to this boundary
        let progress = now.saturating_sub(server.segment_started);
        server.productive_ticks += progress;
        server.fragment_remaining = server.fragment_remaining.saturating_sub(progress);
        if let Some(handle) = server.completion_event.take() {
            self.queue.cancel(handle);
        }
        server.in_checkpoint = true;
        server.segment_started = now;
        server.checkpoint_event = Some(
            self.queue
                .schedule_after(policy.time_ticks, SimEvent::CheckpointEnd { server: server_id }),
        );
        debug!(server = %server_id, productive = server.productive_ticks, "checkpoint started");
        Ok(())
    }

    fn handle_checkpoint_end(&mut self, server_id: ServerId) -> Result<()> {
        let finished = match self.servers.get_mut(&server_id) {
            Some(server) if server.in_checkpoint => {
                server.checkpoint_event = None;
                server.in_checkpoint = false;
                server.checkpoints += 1;
                debug!(server = %server_id, taken = server.checkpoints, "checkpoint finished");
                true
            }
            _ => false,
        };
        if finished {
            self.checkpoints_taken += 1;
            self.begin_segment(server_id)?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Host lifecycle
    // ------------------------------------------------------------------

    fn handle_host_boot(&mut self, host_id: HostId) -> Result<()> {
        let now = self.queue.now();
        let Some(host) = self.hosts.get_mut(&host_id) else {
            return Ok(());
        };
        // Boot is the only way out of Unknown
        if !matches!(host.state(), HostState::Unknown | HostState::Boot) {
            return Ok(());
        }
        host.mark_active(now);
        info!(host = %host_id, "host active");
        self.sample_power(host_id)?;
        self.place_pending()
    }

    /// Evict everything, notify each server while the host is still
    /// `Active`, then flip the occupancy state
    fn take_down_host(&mut self, host_id: HostId, to_state: HostState) -> Result<()> {
        let now = self.queue.now();
        let evicted = {
            let Some(host) = self.hosts.get_mut(&host_id) else {
                return Ok(());
            };
            if host.state() != HostState::Active {
                return Ok(());
            }
            host.evict_all(self.interference.as_ref(), now)?
        };
        for server in &evicted {
            self.interrupt_server(*server, now);
        }
        if let Some(host) = self.hosts.get_mut(&host_id) {
            host.mark_down(to_state, now);
        }
        self.total_evictions += evicted.len() as u64;
        self.sample_power(host_id)?;
        if !evicted.is_empty() {
            info!(host = %host_id, count = evicted.len(), state = ?to_state, "host down, requeueing servers");
            self.place_pending()?;
        }
        Ok(())
    }

    /// Commit an evicted server's progress, drop its scheduled events and
    /// park it for re-placement. A checkpoint cut short is abandoned, not
    /// redone on resume.
    fn interrupt_server(&mut self, server_id: ServerId, now: Instant) {
        let Some(server) = self.servers.get_mut(&server_id) else {
            return;
        };
        if let Some(handle) = server.completion_event.take() {
            self.queue.cancel(handle);
        }
        if let Some(handle) = server.checkpoint_event.take() {
            self.queue.cancel(handle);
        }
        if server.in_checkpoint {
            server.in_checkpoint = false;
        } else if server.current.is_some() {
            let progress = now.saturating_sub(server.segment_started);
            server.productive_ticks += progress;
            server.fragment_remaining = server.fragment_remaining.saturating_sub(progress);
        }
        server.placed_on = None;
        server.evictions += 1;
        debug!(
            server = %server_id,
            remaining = server.fragment_remaining,
            evictions = server.evictions,
            "server evicted"
        );
        self.pending.push_back(server_id);
    }

    fn handle_host_fault(&mut self, host_id: HostId) -> Result<()> {
        let active = self
            .hosts
            .get(&host_id)
            .is_some_and(|h| h.state() == HostState::Active);
        if !active {
            // Nothing to break; re-arm the failure clock
            self.schedule_next_fault(host_id);
            return Ok(());
        }
        warn!(host = %host_id, "host fault injected");
        self.take_down_host(host_id, HostState::Error)?;
        if let Some(dist) = self.repair_dist {
            let delay = (dist.sample(&mut self.rng).round() as u64).max(1);
            self.queue
                .schedule_after(delay, SimEvent::HostRestart { host: host_id });
        }
        Ok(())
    }

    fn handle_host_restart(&mut self, host_id: HostId) -> Result<()> {
        let now = self.queue.now();
        let Some(host) = self.hosts.get_mut(&host_id) else {
            return Ok(());
        };
        if !matches!(host.state(), HostState::Shutoff | HostState::Error) {
            return Ok(());
        }
        host.mark_active(now);
        info!(host = %host_id, "host restarted");
        self.sample_power(host_id)?;
        self.schedule_next_fault(host_id);
        self.place_pending()
    }

    fn schedule_next_fault(&mut self, host_id: HostId) {
        let Some(dist) = self.fail_dist else {
            return;
        };
        let delay = (dist.sample(&mut self.rng).round() as u64).max(1);
        let handle = self
            .queue
            .schedule_after(delay, SimEvent::HostFault { host: host_id });
        // One failure timer per host; re-arming replaces the previous one
        if let Some(stale) = self.fault_events.insert(host_id, handle) {
            self.queue.cancel(stale);
        }
    }

    // ------------------------------------------------------------------
    // Telemetry
    // ------------------------------------------------------------------

    /// Emit a power sample if the host's draw changed since the last one
    fn sample_power(&mut self, host_id: HostId) -> Result<()> {
        let now = self.queue.now();
        let Some(host) = self.hosts.get_mut(&host_id) else {
            return Ok(());
        };
        let (utilization, watts) = if host.state() == HostState::Active {
            let utilization = host.utilization();
            (utilization, self.power.compute_cpu_power(utilization)?)
        } else {
            // A host that is not running draws nothing
            (0.0, 0.0)
        };
        if host.power_changed(utilization, watts) {
            host.accrue(now);
            host.record_power(utilization, watts);
            self.sink.record_power(PowerSample {
                time: now,
                host: host_id,
                watts,
            });
        }
        Ok(())
    }

    fn handle_slice_report(&mut self) -> Result<()> {
        let now = self.queue.now();
        for host in self.hosts.values_mut() {
            let report = host.take_slice_report(now);
            self.sink.record_slice(report);
        }
        self.queue
            .schedule_after(self.config.slice_ticks, SimEvent::SliceReport);
        Ok(())
    }

    /// Fold host accumulators up to `as_of` and summarize the run
    fn collect_results(&mut self, as_of: Instant) -> SimulationResult {
        let as_of = as_of.max(self.queue.now());
        for host in self.hosts.values_mut() {
            host.accrue(as_of);
        }

        let mut turnarounds: Vec<u64> = self
            .servers
            .values()
            .filter_map(|s| s.completed_at.map(|done| done - s.submitted_at))
            .collect();
        turnarounds.sort_unstable();
        let average = if turnarounds.is_empty() {
            0.0
        } else {
            turnarounds.iter().sum::<u64>() as f64 / turnarounds.len() as f64
        };
        let p99 = if turnarounds.is_empty() {
            0
        } else {
            let idx = ((turnarounds.len() as f64 * 0.99) as usize).min(turnarounds.len() - 1);
            turnarounds[idx]
        };

        SimulationResult {
            policy_name: self.policy.name().to_string(),
            total_servers: self.servers.len(),
            completed_servers: turnarounds.len(),
            placement_failures: self.placement_failures,
            total_evictions: self.total_evictions,
            checkpoints_taken: self.checkpoints_taken,
            average_turnaround_ticks: average,
            p99_turnaround_ticks: p99,
            requested_cpu_time: self.hosts.values().map(Host::total_requested_area).sum(),
            granted_cpu_time: self.hosts.values().map(Host::total_granted_area).sum(),
            total_energy: self.hosts.values().map(Host::energy).sum(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::CheckpointPolicy;
    use crate::interference::{InterferenceGroup, InterferenceKey, InterferenceModel, NoInterference};
    use crate::power::{ConstantPowerModel, LinearPowerModel};
    use crate::scheduler::FilterWeighPolicy;
    use crate::telemetry::{InMemorySink, NullSink};
    use crate::workload::{StaticTrace, SyntheticConfig, SyntheticWorkload};

    fn simulator(topology: Vec<HostSpec>) -> Simulator {
        Simulator::new(
            topology,
            Box::new(FilterWeighPolicy::standard()),
            Box::new(NoInterference),
            Box::new(ConstantPowerModel { watts: 150.0 }),
            Box::new(NullSink),
            SimulatorConfig::default(),
        )
        .unwrap()
    }

    fn burst(name: &str, cores: u32, duration_ticks: u64) -> ServerRequest {
        ServerRequest {
            name: name.to_string(),
            spec: ServerSpec::new(cores, 1024),
            fragments: vec![Fragment {
                flops: 0,
                usage: 1.0,
                cores,
                duration_ticks,
            }],
        }
    }

    #[test]
    fn test_saturated_stage_shares_equally() {
        // 4 cores at 1000 MHz; two full-rate 2-core servers fill it exactly,
        // a third oversubscribes it at t=20
        let mut sim = simulator(vec![HostSpec::new(4, 1000, 16_384)]);
        let a = sim.submit(burst("a", 2, 1000), 0).unwrap();
        let b = sim.submit(burst("b", 2, 1000), 10).unwrap();
        let c = sim.submit(burst("c", 2, 1000), 20).unwrap();

        sim.run_until(15).unwrap();
        assert_eq!(sim.granted_mhz(a), Some(2000));
        assert_eq!(sim.granted_mhz(b), Some(2000));

        sim.run_until(25).unwrap();
        assert_eq!(sim.granted_mhz(a), Some(1333));
        assert_eq!(sim.granted_mhz(b), Some(1333));
        assert_eq!(sim.granted_mhz(c), Some(1333));

        let result = sim.run(2000).unwrap();
        assert_eq!(result.completed_servers, 3);
        assert_eq!(result.placement_failures, 0);
        // Playback is duration-driven: contention shapes grants, not runtime
        assert_eq!(sim.server_completed_at(a), Some(1000));
        assert_eq!(sim.server_completed_at(c), Some(1020));
    }

    #[test]
    fn test_parked_server_places_after_completion() {
        // Host memory fits one server at a time
        let mut sim = simulator(vec![HostSpec::new(2, 1000, 1024)]);
        let a = sim.submit(burst("a", 1, 50), 0).unwrap();
        let b = sim.submit(burst("b", 1, 50), 5).unwrap();

        sim.run_until(10).unwrap();
        assert_eq!(sim.pending_count(), 1);

        let result = sim.run(1000).unwrap();
        assert_eq!(sim.server_completed_at(a), Some(50));
        // B waited for A's memory, then ran 50 ticks
        assert_eq!(sim.server_completed_at(b), Some(100));
        assert_eq!(sim.pending_count(), 0);
        assert_eq!(result.completed_servers, 2);
        assert_eq!(result.placement_failures, 1);
    }

    #[test]
    fn test_checkpoint_overhead_extends_completion() {
        let mut sim = simulator(vec![HostSpec::new(4, 1000, 16_384)]);
        let policy = CheckpointPolicy::new(30, 5);
        let mut request = burst("ckpt", 1, 100);
        request.spec.checkpoint = Some(policy);
        let id = sim.submit(request, 0).unwrap();

        let result = sim.run(1000).unwrap();
        // Boundaries at productive 30, 60 and 90: completion slips by 15,
        // matching the planner's closed form
        assert_eq!(policy.overhead_for(100), 15);
        assert_eq!(sim.server_completed_at(id), Some(100 + policy.overhead_for(100)));
        assert_eq!(result.checkpoints_taken, 3);
    }

    #[test]
    fn test_checkpoint_at_exact_fragment_end_still_runs() {
        let mut sim = simulator(vec![HostSpec::new(4, 1000, 16_384)]);
        let policy = CheckpointPolicy::new(30, 5);
        let mut request = burst("ckpt", 1, 60);
        request.spec.checkpoint = Some(policy);
        let id = sim.submit(request, 0).unwrap();

        let result = sim.run(1000).unwrap();
        // The boundary at productive 60 ties with the fragment end and wins
        assert_eq!(sim.server_completed_at(id), Some(60 + policy.overhead_for(60)));
        assert_eq!(result.checkpoints_taken, 2);
    }

    #[test]
    fn test_shutdown_evicts_and_requeues() {
        let mut sim = simulator(vec![
            HostSpec::new(4, 1000, 8192),
            HostSpec::new(4, 1000, 8192),
        ]);
        let a = sim.submit(burst("a", 2, 100), 0).unwrap();
        sim.schedule_host_shutdown(HostId(0), 30).unwrap();

        sim.run_until(40).unwrap();
        assert_eq!(sim.host_state(HostId(0)), Some(HostState::Shutoff));
        // Migrated to host 1 with its remaining 70 ticks intact
        assert_eq!(sim.granted_mhz(a), Some(2000));

        let result = sim.run(1000).unwrap();
        assert_eq!(sim.server_completed_at(a), Some(100));
        assert_eq!(result.total_evictions, 1);
    }

    #[test]
    fn test_fault_and_operator_restart() {
        let mut sim = simulator(vec![
            HostSpec::new(4, 1000, 8192),
            HostSpec::new(4, 1000, 8192),
        ]);
        let a = sim.submit(burst("a", 2, 200), 0).unwrap();
        sim.schedule_host_fault(HostId(0), 50).unwrap();
        sim.schedule_host_restart(HostId(0), 300).unwrap();

        sim.run_until(60).unwrap();
        assert_eq!(sim.host_state(HostId(0)), Some(HostState::Error));
        assert_eq!(sim.granted_mhz(a), Some(2000));

        sim.run_until(310).unwrap();
        assert_eq!(sim.host_state(HostId(0)), Some(HostState::Active));
        assert_eq!(sim.server_completed_at(a), Some(200));

        // Restarted host takes new work again (lowest id on the tie)
        let b = sim.submit(burst("b", 4, 100), 310).unwrap();
        let result = sim.run(1000).unwrap();
        assert_eq!(sim.server_completed_at(b), Some(410));
        assert_eq!(result.total_evictions, 1);
        assert_eq!(result.completed_servers, 2);
    }

    #[test]
    fn test_operator_cycles_do_not_stack_fault_timers() {
        let mut sim = Simulator::new(
            vec![HostSpec::new(4, 1000, 16_384)],
            Box::new(FilterWeighPolicy::standard()),
            Box::new(NoInterference),
            Box::new(ConstantPowerModel { watts: 150.0 }),
            Box::new(NullSink),
            SimulatorConfig {
                fault_profile: Some(FaultProfile {
                    mean_time_to_fail_ticks: 1.0e9,
                    mean_time_to_repair_ticks: 5_000.0,
                }),
                seed: 3,
                ..SimulatorConfig::default()
            },
        )
        .unwrap();

        sim.schedule_host_shutdown(HostId(0), 10).unwrap();
        sim.schedule_host_restart(HostId(0), 20).unwrap();
        sim.schedule_host_shutdown(HostId(0), 30).unwrap();
        sim.schedule_host_restart(HostId(0), 40).unwrap();
        sim.run_until(50).unwrap();

        assert_eq!(sim.host_state(HostId(0)), Some(HostState::Active));
        // Each restart replaced the armed failure timer rather than adding
        // one; that timer and the next slice boundary are all that remain
        assert_eq!(sim.queue.len(), 2);
    }

    #[test]
    fn test_bad_fault_profile_is_rejected() {
        let result = Simulator::new(
            vec![HostSpec::new(4, 1000, 16_384)],
            Box::new(FilterWeighPolicy::standard()),
            Box::new(NoInterference),
            Box::new(ConstantPowerModel { watts: 150.0 }),
            Box::new(NullSink),
            SimulatorConfig {
                fault_profile: Some(FaultProfile {
                    mean_time_to_fail_ticks: 0.0,
                    mean_time_to_repair_ticks: 5_000.0,
                }),
                ..SimulatorConfig::default()
            },
        );
        assert!(matches!(result, Err(SimulationError::InvalidArgument(_))));
    }

    #[test]
    fn test_power_samples_and_slice_reports() {
        let sink = InMemorySink::new();
        let mut sim = Simulator::new(
            vec![HostSpec::new(2, 1000, 8192)],
            Box::new(FilterWeighPolicy::standard()),
            Box::new(NoInterference),
            Box::new(LinearPowerModel::new(100.0, 300.0)),
            Box::new(sink.clone()),
            SimulatorConfig {
                slice_ticks: 50,
                ..SimulatorConfig::default()
            },
        )
        .unwrap();

        sim.submit(burst("a", 2, 100), 0).unwrap();
        let result = sim.run(200).unwrap();

        // Idle at boot, full load at placement, idle again at completion;
        // unchanged draw in between emits nothing
        let watts: Vec<f64> = sink.power_samples().iter().map(|s| s.watts).collect();
        assert_eq!(watts, vec![100.0, 300.0, 100.0]);

        let slices = sink.slices();
        assert_eq!(slices.len(), 4);
        assert_eq!(slices[0].time, 50);
        assert_eq!(slices[0].total_requested_cpu_time, 2000 * 50);
        assert_eq!(slices[0].total_cpu_time_capacity, 2000 * 50);
        assert_eq!(slices[0].hosted_count, 1);
        // The server detached at t=100 before the slice closed
        assert_eq!(slices[1].total_requested_cpu_time, 2000 * 50);
        assert_eq!(slices[1].hosted_count, 0);
        assert_eq!(slices[2].total_requested_cpu_time, 0);

        // 100 ticks at 300 W plus 100 ticks at 100 W
        assert_eq!(result.total_energy, 40_000.0);
        assert_eq!(result.requested_cpu_time, 2000 * 100);
        assert_eq!(result.granted_cpu_time, 2000 * 100);
    }

    #[test]
    fn test_interference_degrades_saturated_stage() {
        let domain = InterferenceModel::new(vec![InterferenceGroup {
            key: InterferenceKey::new("noisy"),
            min_load: 0.8,
            score: 0.5,
        }]);
        let mut sim = Simulator::new(
            vec![HostSpec::new(4, 1000, 16_384)],
            Box::new(FilterWeighPolicy::standard()),
            Box::new(domain),
            Box::new(ConstantPowerModel { watts: 150.0 }),
            Box::new(NullSink),
            SimulatorConfig::default(),
        )
        .unwrap();

        let noisy = |name: &str| {
            let mut request = burst(name, 2, 1000);
            request.spec.interference_key = Some(InterferenceKey::new("noisy"));
            request
        };
        let a = sim.submit(noisy("a"), 0).unwrap();
        let b = sim.submit(noisy("b"), 10).unwrap();

        sim.run_until(5).unwrap();
        // Load 0.5 stays under the trigger threshold
        assert_eq!(sim.granted_mhz(a), Some(2000));

        sim.run_until(15).unwrap();
        // Load 1.0 halves the stage capacity; 4000 requested on 2000
        assert_eq!(sim.granted_mhz(a), Some(1000));
        assert_eq!(sim.granted_mhz(b), Some(1000));
    }

    #[test]
    fn test_empty_fragment_list_completes_at_submit() {
        let mut sim = simulator(vec![HostSpec::new(4, 1000, 16_384)]);
        let request = ServerRequest {
            name: "noop".to_string(),
            spec: ServerSpec::new(1, 512),
            fragments: Vec::new(),
        };
        let id = sim.submit(request, 7).unwrap();

        let result = sim.run(100).unwrap();
        assert_eq!(sim.server_completed_at(id), Some(7));
        assert_eq!(result.completed_servers, 1);
        assert_eq!(result.average_turnaround_ticks, 0.0);
    }

    #[test]
    fn test_submit_in_the_past_is_rejected() {
        let mut sim = simulator(vec![HostSpec::new(4, 1000, 16_384)]);
        sim.submit(burst("a", 1, 10), 50).unwrap();
        sim.run_until(60).unwrap();

        assert!(matches!(
            sim.submit(burst("late", 1, 10), 40),
            Err(SimulationError::InvalidScheduling(_))
        ));
    }

    #[test]
    fn test_static_trace_feeds_the_timeline() {
        let mut sim = simulator(vec![HostSpec::new(4, 1000, 16_384)]);
        let trace = StaticTrace::new(vec![
            Arrival {
                submit_at: 10,
                server: burst("second", 1, 20),
            },
            Arrival {
                submit_at: 0,
                server: burst("first", 1, 20),
            },
        ]);
        sim.attach_trace(Box::new(trace)).unwrap();

        let result = sim.run(500).unwrap();
        assert_eq!(result.total_servers, 2);
        assert_eq!(result.completed_servers, 2);
        assert_eq!(result.average_turnaround_ticks, 20.0);
    }

    #[test]
    fn test_synthetic_workload_drains_completely() {
        let config = SyntheticConfig {
            servers: 25,
            mean_interarrival_ticks: 60.0,
            max_cores: 4,
            min_fragment_ticks: 20,
            max_fragment_ticks: 400,
            max_fragments: 3,
            memory_per_core_mb: 1_024,
            checkpoint: None,
        };
        let trace = SyntheticWorkload::new(config, 11).unwrap();

        let mut sim = simulator(vec![
            HostSpec::new(8, 2400, 32_768),
            HostSpec::new(8, 2400, 32_768),
            HostSpec::new(8, 2400, 32_768),
            HostSpec::new(8, 2400, 32_768),
        ]);
        sim.attach_trace(Box::new(trace)).unwrap();

        // Horizon far beyond the worst-case serial runtime of the batch
        let result = sim.run(1_000_000).unwrap();
        assert_eq!(result.total_servers, 25);
        assert_eq!(result.completed_servers, 25);
        assert_eq!(result.total_evictions, 0);
        assert!(result.granted_cpu_time <= result.requested_cpu_time);
        assert!(result.total_energy > 0.0);
    }
}
