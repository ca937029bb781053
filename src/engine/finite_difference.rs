//! Gradients by central finite differences over an energy-only function

use super::{Evaluation, Evaluator, EvaluatorError};
use crate::molecule::Geometry;
use log::debug;
use nalgebra::DVector;
use rayon::prelude::*;

/// Default displacement in Bohr
pub const DEFAULT_STEP: f64 = 1e-4;

/// Something that only knows how to compute an energy
pub trait EnergyFunction: Send + Sync {
    /// Name used in logs
    fn name(&self) -> &str;

    /// Energy in Hartree at `geometry`
    fn energy(&self, geometry: &Geometry) -> Result<f64, EvaluatorError>;
}

/// Evaluator that differentiates an [`EnergyFunction`] numerically.
///
/// The 6N displaced energies are computed in parallel with rayon.
#[derive(Debug, Clone)]
pub struct FiniteDifference<F> {
    function: F,
    step: f64,
}

impl<F: EnergyFunction> FiniteDifference<F> {
    /// Wrap `function` with the default displacement
    pub fn new(function: F) -> Self {
        Self::with_step(function, DEFAULT_STEP)
    }

    /// Wrap `function` with a custom displacement in Bohr
    pub fn with_step(function: F, step: f64) -> Self {
        Self { function, step }
    }

    /// The wrapped function
    pub fn function(&self) -> &F {
        &self.function
    }
}

impl<F: EnergyFunction> Evaluator for FiniteDifference<F> {
    fn name(&self) -> &str {
        "finite-difference"
    }

    fn evaluate(&self, geometry: &Geometry) -> Result<Evaluation, EvaluatorError> {
        let energy = self.function.energy(geometry)?;
        let h = self.step;
        debug!(
            "Finite-difference gradient of {} over {} coordinates",
            self.function.name(),
            geometry.coords.len()
        );
        let components = (0..geometry.coords.len())
            .into_par_iter()
            .map(|k| {
                let mut plus = geometry.clone();
                let mut minus = geometry.clone();
                plus.coords[k] += h;
                minus.coords[k] -= h;
                let forward = self.function.energy(&plus)?;
                let backward = self.function.energy(&minus)?;
                Ok((forward - backward) / (2.0 * h))
            })
            .collect::<Result<Vec<f64>, EvaluatorError>>()?;
        Ok(Evaluation {
            energy,
            gradient: DVector::from_vec(components),
        })
    }
}
