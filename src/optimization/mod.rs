//! Constrained geometry optimization
//!
//! The driver ([`Optimizer`]) alternates between asking the evaluator for an
//! energy and gradient, proposing a step in constrained delocalized internal
//! coordinates ([`step::propose`]) and judging the outcome with a trust
//! radius controller ([`trust::assess`]). Every accepted point is recorded
//! in a [`Trajectory`].

pub mod driver;
pub mod hessian;
pub mod scan;
pub mod step;
pub mod trust;

pub use driver::Optimizer;
pub use scan::{run_scan, ScanResult};

use crate::constraints::bind::BindingError;
use crate::constraints::SchemaError;
use crate::coords::{CoordSystemKind, CoordinateError, CoordinateSystem};
use crate::engine::{Evaluation, EvaluatorError};
use crate::math::max_atom_norm;
use crate::molecule::{Geometry, MoleculeError};
use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;

/// Errors detected before the first evaluation
#[derive(Error, Debug, Clone, PartialEq)]
pub enum OptimizationError {
    #[error("Invalid constraints: {0}")]
    Schema(#[from] SchemaError),

    #[error("Constraint binding failed: {0}")]
    Binding(#[from] BindingError),

    #[error("Invalid molecule: {0}")]
    Molecule(#[from] MoleculeError),

    #[error("Coordinate system error: {0}")]
    Coordinates(#[from] CoordinateError),

    #[error("Invalid parameters: {0}")]
    InvalidParameters(String),

    #[error("Scan constraints must be run through the scan driver")]
    UnexpectedScan,
}

/// Why a run stopped without converging
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RunFailure {
    #[error("evaluator failure at iteration {iteration}: {source}")]
    Evaluator {
        iteration: usize,
        source: EvaluatorError,
    },

    #[error("step degeneracy at iteration {iteration}: {reason}")]
    StepDegeneracy { iteration: usize, reason: String },

    #[error("no convergence after {iterations} iterations")]
    NonConvergence { iterations: usize },

    #[error("cancelled at iteration {iteration}")]
    Cancelled { iteration: usize },
}

/// Convergence thresholds (Hartree, Hartree/Bohr, Bohr)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Thresholds {
    /// Energy change between accepted steps
    pub energy: f64,
    /// RMS gradient
    pub grms: f64,
    /// Largest per-atom gradient
    pub gmax: f64,
    /// RMS displacement
    pub drms: f64,
    /// Largest per-atom displacement
    pub dmax: f64,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            energy: 1e-6,
            grms: 3e-4,
            gmax: 4.5e-4,
            drms: 1.2e-3,
            dmax: 1.8e-3,
        }
    }
}

/// Optimizer settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizerParams {
    /// Internal coordinate family
    pub coordsys: CoordSystemKind,

    /// Maximum number of evaluations after the first
    #[serde(alias = "maxiter")]
    pub max_iterations: usize,

    /// Convergence thresholds
    #[serde(alias = "convergence")]
    pub thresholds: Thresholds,

    /// Initial trust radius (Bohr)
    pub trust: f64,

    /// Largest trust radius
    #[serde(alias = "tmax")]
    pub trust_max: f64,

    /// Smallest trust radius; steps at this size are always accepted
    #[serde(alias = "tmin")]
    pub trust_min: f64,

    /// Set constraints count as met within this distance of their target
    pub constraint_tolerance: f64,

    /// Bend angle in degrees above which angles become linear bends
    pub linear_angle_threshold: f64,

    /// RMS Cartesian change that ends the back-transformation
    pub backtransform_tolerance: f64,

    /// Iteration limit of the back-transformation
    pub backtransform_max_iterations: usize,

    /// Consecutive failed step proposals tolerated before giving up
    pub max_step_retries: usize,

    /// Times the coordinate system may be rebuilt in one run
    pub max_rebuilds: usize,
}

impl Default for OptimizerParams {
    fn default() -> Self {
        Self {
            coordsys: CoordSystemKind::Tric,
            max_iterations: 300,
            thresholds: Thresholds::default(),
            trust: 0.1,
            trust_max: 0.3,
            trust_min: 1.2e-3,
            constraint_tolerance: 1e-4,
            linear_angle_threshold: 175.0,
            backtransform_tolerance: 1e-6,
            backtransform_max_iterations: 50,
            max_step_retries: 5,
            max_rebuilds: 5,
        }
    }
}

impl OptimizerParams {
    /// Reject settings the optimizer cannot work with
    pub fn validate(&self) -> Result<(), OptimizationError> {
        let positive = [
            ("trust", self.trust),
            ("trust_max", self.trust_max),
            ("trust_min", self.trust_min),
            ("constraint_tolerance", self.constraint_tolerance),
            ("backtransform_tolerance", self.backtransform_tolerance),
        ];
        if let Some((name, value)) = positive.iter().find(|(_, v)| !(v.is_finite() && *v > 0.0)) {
            return Err(OptimizationError::InvalidParameters(format!(
                "{} must be positive, got {}",
                name, value
            )));
        }
        if self.trust_min > self.trust_max {
            return Err(OptimizationError::InvalidParameters(format!(
                "trust_min {} exceeds trust_max {}",
                self.trust_min, self.trust_max
            )));
        }
        if !(90.0..180.0).contains(&self.linear_angle_threshold) {
            return Err(OptimizationError::InvalidParameters(format!(
                "linear_angle_threshold must lie in [90, 180), got {}",
                self.linear_angle_threshold
            )));
        }
        Ok(())
    }
}

/// Shared flag checked between iterations
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask the running optimization to stop
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// One recorded point of a run
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Snapshot {
    pub geometry: Geometry,
    /// `None` when the evaluation failed
    pub energy: Option<f64>,
    pub gradient: Option<DVector<f64>>,
    pub success: bool,
}

impl Snapshot {
    /// Snapshot of a successful evaluation
    pub fn evaluated(geometry: Geometry, evaluation: &Evaluation) -> Self {
        Self {
            geometry,
            energy: Some(evaluation.energy),
            gradient: Some(evaluation.gradient.clone()),
            success: true,
        }
    }

    /// Snapshot of a geometry whose evaluation failed
    pub fn failed(geometry: Geometry) -> Self {
        Self {
            geometry,
            energy: None,
            gradient: None,
            success: false,
        }
    }

    /// Largest per-atom gradient norm
    pub fn gradient_norm(&self) -> Option<f64> {
        self.gradient.as_ref().map(max_atom_norm)
    }
}

/// Ordered record of accepted points, in evaluation order
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Trajectory {
    snapshots: Vec<Snapshot>,
}

impl Trajectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, snapshot: Snapshot) {
        self.snapshots.push(snapshot);
    }

    pub fn len(&self) -> usize {
        self.snapshots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
    }

    pub fn snapshots(&self) -> &[Snapshot] {
        &self.snapshots
    }

    pub fn last(&self) -> Option<&Snapshot> {
        self.snapshots.last()
    }

    /// Energies of the successful snapshots
    pub fn energies(&self) -> Vec<f64> {
        self.snapshots.iter().filter_map(|s| s.energy).collect()
    }

    /// Last successfully evaluated snapshot
    pub fn last_success(&self) -> Option<&Snapshot> {
        self.snapshots.iter().rev().find(|s| s.success)
    }

    /// Lowest-energy snapshot
    pub fn best(&self) -> Option<&Snapshot> {
        self.snapshots
            .iter()
            .filter(|s| s.energy.is_some())
            .min_by(|a, b| a.energy.unwrap_or(f64::INFINITY).total_cmp(&b.energy.unwrap_or(f64::INFINITY)))
    }
}

/// Outcome of a single optimization
#[derive(Debug, Clone, PartialEq)]
pub struct OptimizationResult {
    pub trajectory: Trajectory,
    /// `None` when the run converged
    pub failure: Option<RunFailure>,
    /// Number of evaluations after the first
    pub iterations: usize,
    /// Times the coordinate system was rebuilt during the run
    pub rebuilds: usize,
}

impl OptimizationResult {
    pub fn success(&self) -> bool {
        self.failure.is_none()
    }

    /// Failure message, if any
    pub fn error_message(&self) -> Option<String> {
        self.failure.as_ref().map(|f| f.to_string())
    }

    /// Geometry of the last successful snapshot
    pub fn final_geometry(&self) -> Option<&Geometry> {
        self.trajectory.last_success().map(|s| &s.geometry)
    }

    /// Energy of the last successful snapshot
    pub fn final_energy(&self) -> Option<f64> {
        self.trajectory.last_success().and_then(|s| s.energy)
    }

    /// Lowest-energy geometry of the run, the one to report after a failure
    pub fn best_geometry(&self) -> Option<&Geometry> {
        self.trajectory.best().map(|s| &s.geometry)
    }
}

/// Everything the step engine needs about the current point.
///
/// States are replaced, not mutated: each accepted step or trust change
/// produces a new value.
#[derive(Debug, Clone)]
pub struct OptimizationState {
    pub geometry: Geometry,
    pub energy: f64,
    /// Cartesian gradient
    pub gradient: DVector<f64>,
    /// Primitive values, periodic ones unwrapped along the path
    pub values: DVector<f64>,
    /// Gradient in primitive coordinates
    pub primitive_gradient: DVector<f64>,
    /// Hessian approximation in primitive coordinates
    pub hessian: DMatrix<f64>,
    pub trust: f64,
    /// Energy change of the last accepted step
    pub last_energy_change: Option<f64>,
    /// Evaluations after the first
    pub iteration: usize,
}

impl OptimizationState {
    /// State at the starting point with a fresh Hessian guess
    pub fn initial(
        system: &CoordinateSystem,
        geometry: Geometry,
        evaluation: Evaluation,
        trust: f64,
    ) -> Self {
        let wilson = system.wilson_matrix(&geometry);
        Self {
            values: system.values(&geometry),
            primitive_gradient: system.primitive_gradient(&wilson, &evaluation.gradient),
            hessian: hessian::guess(system),
            geometry,
            energy: evaluation.energy,
            gradient: evaluation.gradient,
            trust,
            last_energy_change: None,
            iteration: 0,
        }
    }

    /// Same point after a rejected step or a failed proposal
    pub fn with_trust(&self, trust: f64, evaluated: bool) -> Self {
        Self {
            trust,
            iteration: self.iteration + usize::from(evaluated),
            ..self.clone()
        }
    }

    /// Move to an accepted point, updating the Hessian by BFGS
    pub fn advance(
        &self,
        system: &CoordinateSystem,
        geometry: Geometry,
        values: DVector<f64>,
        evaluation: Evaluation,
        trust: f64,
    ) -> Self {
        let wilson = system.wilson_matrix(&geometry);
        let primitive_gradient = system.primitive_gradient(&wilson, &evaluation.gradient);
        let s = system.difference(&values, &self.values);
        let y = &primitive_gradient - &self.primitive_gradient;
        let hessian = hessian::update_bfgs(&self.hessian, &s, &y);
        Self {
            geometry,
            energy: evaluation.energy,
            gradient: evaluation.gradient,
            values,
            primitive_gradient,
            hessian,
            trust,
            last_energy_change: Some(evaluation.energy - self.energy),
            iteration: self.iteration + 1,
        }
    }

    /// Same point expressed in a rebuilt coordinate system, with a fresh Hessian
    pub fn rebased(&self, system: &CoordinateSystem) -> Self {
        let wilson = system.wilson_matrix(&self.geometry);
        Self {
            values: system.values(&self.geometry),
            primitive_gradient: system.primitive_gradient(&wilson, &self.gradient),
            hessian: hessian::guess(system),
            ..self.clone()
        }
    }
}
