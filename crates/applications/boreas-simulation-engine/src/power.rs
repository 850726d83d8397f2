//! CPU power draw models
//!
//! A power model converts resolved utilization into instantaneous watts.
//! Samples are event-driven: the simulator pushes a new `(time, watts)` pair
//! to the telemetry sink only when a host's utilization actually changes.

use crate::error::{Result, SimulationError};

/// Utilization-to-watts conversion
pub trait PowerModel {
    /// Power draw in watts for a utilization in `[0, 1]`.
    ///
    /// Fails with `InvalidArgument` outside that range; host state is not
    /// touched by a failed call.
    fn compute_cpu_power(&self, utilization: f64) -> Result<f64>;
}

fn check_utilization(utilization: f64) -> Result<()> {
    if !utilization.is_finite() || !(0.0..=1.0).contains(&utilization) {
        return Err(SimulationError::invalid_argument(format!(
            "utilization {utilization} outside [0, 1]"
        )));
    }
    Ok(())
}

/// Fixed draw regardless of load
#[derive(Debug, Clone, Copy)]
pub struct ConstantPowerModel {
    pub watts: f64,
}

impl PowerModel for ConstantPowerModel {
    fn compute_cpu_power(&self, utilization: f64) -> Result<f64> {
        check_utilization(utilization)?;
        Ok(self.watts)
    }
}

/// Linear interpolation between idle and full-load draw
#[derive(Debug, Clone, Copy)]
pub struct LinearPowerModel {
    pub idle_w: f64,
    pub max_w: f64,
}

impl LinearPowerModel {
    pub fn new(idle_w: f64, max_w: f64) -> Self {
        LinearPowerModel { idle_w, max_w }
    }
}

impl PowerModel for LinearPowerModel {
    fn compute_cpu_power(&self, utilization: f64) -> Result<f64> {
        check_utilization(utilization)?;
        Ok(self.idle_w + (self.max_w - self.idle_w) * utilization)
    }
}
