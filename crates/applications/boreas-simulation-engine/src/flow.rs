//! Flow graph engine: max-min fair sharing of host CPU capacity
//!
//! Every host owns one [`FlowStage`]; every placed server drives one
//! [`FlowSource`] attached to it. The stage recomputes grants whenever
//! membership, a requested rate, or its interference-adjusted capacity
//! changes. Resolution is scoped to the stage, never the whole simulation.
//!
//! Rates are integer MHz. Under saturation the water-filling level is
//! floored, so the sum of grants never exceeds capacity; the sub-MHz
//! remainder is dropped, not distributed.

use std::collections::BTreeMap;

use crate::error::{Result, SimulationError};
use crate::interference::{InterferenceDomain, InterferenceKey};
use crate::types::{HostId, ServerId};

/// A demand producer attached to a stage
#[derive(Debug, Clone)]
pub struct FlowSource {
    requested_mhz: u64,
    granted_mhz: u64,
    key: Option<InterferenceKey>,
}

impl FlowSource {
    pub fn requested_mhz(&self) -> u64 {
        self.requested_mhz
    }

    pub fn granted_mhz(&self) -> u64 {
        self.granted_mhz
    }
}

/// Capacity-bounded shared resource owning its attached sources.
///
/// Sources are keyed by server id; iteration order is ascending id, which
/// keeps resolution deterministic across runs.
#[derive(Debug)]
pub struct FlowStage {
    host: HostId,
    raw_capacity_mhz: u64,
    effective_capacity_mhz: u64,
    sources: BTreeMap<ServerId, FlowSource>,
}

impl FlowStage {
    pub fn new(host: HostId, raw_capacity_mhz: u64) -> Self {
        FlowStage {
            host,
            raw_capacity_mhz,
            effective_capacity_mhz: raw_capacity_mhz,
            sources: BTreeMap::new(),
        }
    }

    /// Attach a source with an initial requested rate.
    ///
    /// The caller re-resolves afterwards; attaching alone does not grant.
    pub fn attach(&mut self, id: ServerId, requested_mhz: u64, key: Option<InterferenceKey>) {
        self.sources.insert(
            id,
            FlowSource {
                requested_mhz,
                granted_mhz: 0,
                key,
            },
        );
    }

    /// Detach a source. Returns `false` if it was not attached.
    pub fn detach(&mut self, id: ServerId) -> bool {
        self.sources.remove(&id).is_some()
    }

    /// Change a source's requested rate. Returns `false` if it is not attached.
    pub fn set_request(&mut self, id: ServerId, requested_mhz: u64) -> bool {
        match self.sources.get_mut(&id) {
            Some(source) => {
                source.requested_mhz = requested_mhz;
                true
            }
            None => false,
        }
    }

    pub fn source_count(&self) -> usize {
        self.sources.len()
    }

    pub fn raw_capacity_mhz(&self) -> u64 {
        self.raw_capacity_mhz
    }

    /// Capacity after the interference multiplier, as of the last resolution
    pub fn effective_capacity_mhz(&self) -> u64 {
        self.effective_capacity_mhz
    }

    pub fn total_requested_mhz(&self) -> u64 {
        self.sources.values().map(|s| s.requested_mhz).sum()
    }

    pub fn total_granted_mhz(&self) -> u64 {
        self.sources.values().map(|s| s.granted_mhz).sum()
    }

    pub fn granted_mhz(&self, id: ServerId) -> Option<u64> {
        self.sources.get(&id).map(|s| s.granted_mhz)
    }

    /// Recompute the effective capacity and every source's granted rate.
    ///
    /// Max-min fair share: under capacity everyone gets their request;
    /// saturated, sources are satisfied in ascending-demand order and all
    /// still-unsatisfied sources receive one identical floored level, so a
    /// source never out-grants another with equal or lower demand.
    pub fn resolve(&mut self, domain: &dyn InterferenceDomain) -> Result<()> {
        let total_requested = self.total_requested_mhz();
        let load = if self.raw_capacity_mhz > 0 {
            total_requested as f64 / self.raw_capacity_mhz as f64
        } else {
            0.0
        };

        // Worst multiplier over the participating sources
        let mut score: Option<f64> = None;
        for source in self.sources.values() {
            if source.key.is_some() {
                let multiplier = domain.apply(source.key.as_ref(), load);
                score = Some(match score {
                    Some(current) => current.min(multiplier),
                    None => multiplier,
                });
            }
        }

        let effective = self.raw_capacity_mhz as f64 * score.unwrap_or(1.0);
        if !effective.is_finite() || effective < 0.0 {
            return Err(SimulationError::inconsistent_flow(
                self.host,
                format!("interference-adjusted capacity is {effective}"),
            ));
        }
        self.effective_capacity_mhz = effective as u64;

        if total_requested <= self.effective_capacity_mhz {
            for source in self.sources.values_mut() {
                source.granted_mhz = source.requested_mhz;
            }
            return Ok(());
        }

        // Water-filling over sources sorted by (demand, id)
        let mut order: Vec<(ServerId, u64)> = self
            .sources
            .iter()
            .map(|(id, s)| (*id, s.requested_mhz))
            .collect();
        order.sort_by_key(|&(id, requested)| (requested, id));

        let mut remaining = self.effective_capacity_mhz;
        let mut contenders = order.len() as u64;
        let mut level: Option<u64> = None;

        for (id, requested) in order {
            let granted = match level {
                // Once one source exceeds the floor level, every remaining
                // source has equal-or-higher demand and gets the same level.
                Some(level) => level,
                None => {
                    let fair = remaining / contenders;
                    if requested <= fair {
                        remaining -= requested;
                        contenders -= 1;
                        requested
                    } else {
                        level = Some(fair);
                        fair
                    }
                }
            };
            if let Some(source) = self.sources.get_mut(&id) {
                source.granted_mhz = granted;
            }
        }

        Ok(())
    }
}
