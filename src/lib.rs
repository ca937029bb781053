//! geomopt: constrained geometry optimization in internal coordinates
//!
//! This library optimizes molecular geometries with a trust-region
//! quasi-Newton method in delocalized internal coordinates, honouring
//! freeze, set and scan constraints on distances, angles, dihedrals,
//! Cartesian positions and fragment translations and rotations.

pub mod atom;
pub mod constraints;
pub mod coords;
pub mod engine;
pub mod io;
pub mod math;
pub mod molecule;
pub mod optimization;

// Re-export commonly used types and functions
pub use constraints::ConstraintSet;
pub use engine::{Evaluation, Evaluator, EvaluatorError};
pub use molecule::{Geometry, Topology};
pub use optimization::{run_scan, OptimizationResult, Optimizer, OptimizerParams};

/// Version of the library
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
