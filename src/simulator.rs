//! The interface to the simulation engine.
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::SweepError;
use crate::model::Topology;
use crate::DEFAULT_CELSIUS;

/// Relative tolerance for a ratio to be considered a whole number.
pub const STEP_TOLERANCE: f64 = 1e-9;

/// Time discretization and global conditions shared by every run of a sweep.
#[derive(Debug, PartialEq, Clone, Copy, Serialize, Deserialize)]
pub struct SimulationContext {
    /// Integration step (ms).
    dt: f64,
    /// Stop time (ms).
    tstop: f64,
    /// Temperature (°C).
    celsius: f64,
}

fn is_whole(x: f64) -> bool {
    (x - x.round()).abs() <= STEP_TOLERANCE * x.abs().max(1.0)
}

impl SimulationContext {
    /// Create a context with the default temperature.
    /// Returns an error unless `dt` divides both one millisecond and `tstop`.
    pub fn build(dt: f64, tstop: f64) -> Result<Self, SweepError> {
        Self::build_at(dt, tstop, DEFAULT_CELSIUS)
    }

    pub fn build_at(dt: f64, tstop: f64, celsius: f64) -> Result<Self, SweepError> {
        if !(dt > 0.0) || !dt.is_finite() || !(tstop > 0.0) || !tstop.is_finite() {
            return Err(SweepError::InvalidTimeStep { dt, tstop });
        }
        if !is_whole(1.0 / dt) || !is_whole(tstop / dt) {
            return Err(SweepError::InvalidTimeStep { dt, tstop });
        }
        if !celsius.is_finite() {
            return Err(SweepError::InvalidParameter(format!(
                "temperature must be finite, got {}",
                celsius
            )));
        }
        Ok(SimulationContext { dt, tstop, celsius })
    }

    pub fn dt(&self) -> f64 {
        self.dt
    }

    pub fn tstop(&self) -> f64 {
        self.tstop
    }

    pub fn celsius(&self) -> f64 {
        self.celsius
    }

    /// Returns the number of integration steps per millisecond.
    pub fn steps_per_ms(&self) -> usize {
        (1.0 / self.dt).round() as usize
    }

    /// Returns the number of time points of a stored trace.
    pub fn num_timepoints(&self) -> usize {
        (self.tstop / self.dt).round() as usize
    }
}

/// The vectors recorded during one run, keyed by probe name.
#[derive(Debug, PartialEq, Clone, Default, Serialize, Deserialize)]
pub struct Recording {
    traces: BTreeMap<String, Vec<f64>>,
}

impl Recording {
    pub fn new() -> Self {
        Recording::default()
    }

    pub fn insert(&mut self, name: &str, values: Vec<f64>) {
        self.traces.insert(name.to_string(), values);
    }

    pub fn get(&self, name: &str) -> Option<&[f64]> {
        self.traces.get(name).map(|values| values.as_slice())
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.traces.keys().map(|name| name.as_str())
    }

    pub fn len(&self) -> usize {
        self.traces.len()
    }

    pub fn is_empty(&self) -> bool {
        self.traces.is_empty()
    }

    /// Returns the first `num_timepoints` values of the voltage trace.
    pub fn voltage(&self, num_timepoints: usize) -> Result<&[f64], SweepError> {
        let v = self.get("v").ok_or_else(|| {
            SweepError::SimulationError("the engine did not record the voltage".to_string())
        })?;
        if v.len() < num_timepoints {
            return Err(SweepError::SimulationError(format!(
                "the engine recorded {} voltage samples, expected at least {}",
                v.len(),
                num_timepoints
            )));
        }
        Ok(&v[..num_timepoints])
    }
}

/// A compartmental simulation engine.
///
/// Implementations build the cell described by the topology, drive its stimulus target with
/// the waveform sampled every `ctx.dt()` ms, advance to `ctx.tstop()` and return every probe.
pub trait Simulator {
    fn run(
        &mut self,
        ctx: &SimulationContext,
        topology: &Topology,
        stim: &[f64],
    ) -> Result<Recording, SweepError>;
}
