//! Energy and gradient evaluators
//!
//! The optimizer only talks to an [`Evaluator`]: given a geometry, return
//! the energy (Hartree) and Cartesian gradient (Hartree/Bohr). Built-in
//! evaluators cover a valence force field, finite differences over an
//! energy-only function, and a timeout wrapper.

pub mod finite_difference;
pub mod timeout;
pub mod valence;

pub use finite_difference::{EnergyFunction, FiniteDifference};
pub use timeout::Timeout;
pub use valence::ValenceForceField;

use crate::molecule::{Geometry, Topology};
use log::warn;
use nalgebra::DVector;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Errors reported by evaluators
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EvaluatorError {
    #[error("{0}")]
    Failed(String),

    #[error("Evaluation timed out after {0:?}")]
    Timeout(Duration),

    #[error("Gradient has {found} components, expected {expected}")]
    GradientShape { expected: usize, found: usize },

    #[error("Evaluator returned a non-finite energy or gradient")]
    NonFinite,

    #[error("Unsupported method {method:?} for program {program:?}")]
    Unsupported { program: String, method: String },
}

/// Energy and Cartesian gradient at one geometry
#[derive(Debug, Clone, PartialEq)]
pub struct Evaluation {
    /// Energy in Hartree
    pub energy: f64,

    /// Flat gradient in Hartree/Bohr
    pub gradient: DVector<f64>,
}

impl Evaluation {
    /// Check shape and finiteness against the geometry it was computed for
    pub fn validate(&self, geometry: &Geometry) -> Result<(), EvaluatorError> {
        if self.gradient.len() != geometry.coords.len() {
            return Err(EvaluatorError::GradientShape {
                expected: geometry.coords.len(),
                found: self.gradient.len(),
            });
        }
        if !self.energy.is_finite() || self.gradient.iter().any(|g| !g.is_finite()) {
            return Err(EvaluatorError::NonFinite);
        }
        Ok(())
    }
}

/// Something that computes energies and gradients.
/// The Send + Sync bounds let evaluators run on worker threads.
pub trait Evaluator: Send + Sync {
    /// Name used in logs
    fn name(&self) -> &str;

    /// Energy and gradient at `geometry`
    fn evaluate(&self, geometry: &Geometry) -> Result<Evaluation, EvaluatorError>;
}

impl<E: Evaluator + ?Sized> Evaluator for Box<E> {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn evaluate(&self, geometry: &Geometry) -> Result<Evaluation, EvaluatorError> {
        (**self).evaluate(geometry)
    }
}

impl<E: Evaluator + ?Sized> Evaluator for Arc<E> {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn evaluate(&self, geometry: &Geometry) -> Result<Evaluation, EvaluatorError> {
        (**self).evaluate(geometry)
    }
}

/// Evaluator that always fails, standing in for an unknown program or method
#[derive(Debug, Clone)]
pub struct Unsupported {
    program: String,
    method: String,
}

impl Unsupported {
    pub fn new(program: &str, method: &str) -> Self {
        Self {
            program: program.to_string(),
            method: method.to_string(),
        }
    }
}

impl Evaluator for Unsupported {
    fn name(&self) -> &str {
        "unsupported"
    }

    fn evaluate(&self, _geometry: &Geometry) -> Result<Evaluation, EvaluatorError> {
        Err(EvaluatorError::Unsupported {
            program: self.program.clone(),
            method: self.method.clone(),
        })
    }
}

/// Default program name
pub const DEFAULT_PROGRAM: &str = "valence";

/// Pick a built-in evaluator by program and method name.
///
/// Unknown combinations yield an [`Unsupported`] evaluator, so the failure
/// surfaces at the first evaluation rather than at setup.
pub fn from_model(
    program: &str,
    method: &str,
    geometry: &Geometry,
    topology: &Topology,
) -> Arc<dyn Evaluator> {
    let program = if program.is_empty() { DEFAULT_PROGRAM } else { program };
    match (program.to_lowercase().as_str(), method.to_lowercase().as_str()) {
        ("valence", "" | "valence" | "morse") => {
            Arc::new(ValenceForceField::from_topology(geometry, topology))
        }
        ("valence", "numerical" | "finite-difference") => Arc::new(FiniteDifference::new(
            ValenceForceField::from_topology(geometry, topology),
        )),
        _ => {
            warn!("No built-in evaluator for program {:?} method {:?}", program, method);
            Arc::new(Unsupported::new(program, method))
        }
    }
}
