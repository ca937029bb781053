//! Constrained delocalized internal coordinates
//!
//! The nonredundant coordinates `y = Vᵀ q` are built from the Wilson
//! matrix each step. The first columns of `V` are the projections of the
//! constrained primitives onto the active space, orthonormalized in order;
//! the remaining columns span the rest of the active space and are
//! orthogonal to every constrained primitive direction.

use super::{CoordinateError, CoordinateSystem};
use crate::math::{column_basis, rms, symmetric_pinv, EIGEN_CUTOFF};
use crate::molecule::Geometry;
use log::{debug, trace, warn};
use nalgebra::{DMatrix, DVector};

/// Projections shorter than this mark a constraint as redundant
const PROJECTION_CUTOFF: f64 = 1e-6;

/// Nonredundant coordinate basis for one step
#[derive(Debug, Clone)]
pub struct DelocalizedBasis {
    /// Basis vectors as columns, constrained ones first
    pub vectors: DMatrix<f64>,
    /// Primitive index of each constrained column
    pub constrained: Vec<usize>,
    /// Constrained primitives dropped as linearly dependent
    pub dropped: Vec<usize>,
    /// `Mᵢⱼ = Cⱼ[constrained[i]]`, lower triangular
    pub constraint_map: DMatrix<f64>,
}

impl DelocalizedBasis {
    /// Build the basis from the Wilson matrix and constrained primitive indices
    pub fn build(wilson: &DMatrix<f64>, constrained: &[usize]) -> Result<Self, CoordinateError> {
        let n = wilson.nrows();
        let active = column_basis(wilson, EIGEN_CUTOFF);
        let projector = &active * active.transpose();

        let mut columns: Vec<DVector<f64>> = Vec::new();
        let mut kept = Vec::new();
        let mut dropped = Vec::new();
        for &p in constrained {
            let mut v = projector.column(p).into_owned();
            for c in &columns {
                let overlap = c.dot(&v);
                v -= c * overlap;
            }
            let norm = v.norm();
            if norm < PROJECTION_CUTOFF {
                warn!("Constrained coordinate {} is redundant and will be ignored", p);
                dropped.push(p);
                continue;
            }
            columns.push(v / norm);
            kept.push(p);
        }

        let k = columns.len();
        let mut free_projector = projector;
        for c in &columns {
            free_projector -= c * c.transpose();
        }
        let free = free_projector.symmetric_eigen();
        let mut order: Vec<usize> = (0..n).filter(|&i| free.eigenvalues[i] > 0.5).collect();
        order.sort_by(|&a, &b| free.eigenvalues[b].total_cmp(&free.eigenvalues[a]));
        columns.extend(order.iter().map(|&i| free.eigenvectors.column(i).into_owned()));

        let vectors = if columns.is_empty() {
            DMatrix::zeros(n, 0)
        } else {
            DMatrix::from_columns(&columns)
        };
        let constraint_map = DMatrix::from_fn(k, k, |i, j| vectors[(kept[i], j)]);
        if (0..k).any(|i| constraint_map[(i, i)].abs() < PROJECTION_CUTOFF) {
            return Err(CoordinateError::SingularConstraints);
        }

        debug!(
            "Delocalized basis: {} coordinates ({} constrained) from {} primitives",
            vectors.ncols(),
            k,
            n
        );
        Ok(Self {
            vectors,
            constrained: kept,
            dropped,
            constraint_map,
        })
    }

    /// Total number of delocalized coordinates
    pub fn len(&self) -> usize {
        self.vectors.ncols()
    }

    /// Is the basis empty?
    pub fn is_empty(&self) -> bool {
        self.vectors.ncols() == 0
    }

    /// Number of constrained coordinates
    pub fn num_constrained(&self) -> usize {
        self.constrained.len()
    }

    /// Wilson matrix of the delocalized coordinates, `Vᵀ B`
    pub fn wilson(&self, wilson: &DMatrix<f64>) -> DMatrix<f64> {
        self.vectors.transpose() * wilson
    }

    /// Cartesian gradient transformed to delocalized coordinates
    pub fn gradient(&self, wilson: &DMatrix<f64>, gradient: &DVector<f64>) -> DVector<f64> {
        let by = self.wilson(wilson);
        let g = &by * by.transpose();
        symmetric_pinv(&g) * (by * gradient)
    }

    /// Primitive-space Hessian transformed to delocalized coordinates
    pub fn hessian(&self, hessian: &DMatrix<f64>) -> DMatrix<f64> {
        self.vectors.transpose() * hessian * &self.vectors
    }
}

/// Find Cartesian coordinates whose delocalized displacement from `start` is `target`.
///
/// Iterates `x += Byᵀ (By Byᵀ)⁻ (target - Vᵀ Δq(x))` until the RMS Cartesian
/// update drops below `tolerance`.
pub fn back_transform(
    system: &CoordinateSystem,
    vectors: &DMatrix<f64>,
    start: &Geometry,
    target: &DVector<f64>,
    tolerance: f64,
    max_iterations: usize,
) -> Result<Geometry, CoordinateError> {
    let q0 = system.values(start);
    let mut geometry = start.clone();
    let mut best_residual = f64::INFINITY;
    let mut residual = f64::INFINITY;

    for iteration in 0..max_iterations {
        let q = system.values_near(&geometry, &q0);
        let dq = system.difference(&q, &q0);
        let r = target - vectors.transpose() * dq;
        residual = r.norm();
        trace!("Back-transformation iteration {}: residual {:.3e}", iteration, residual);

        if residual > 10.0 * best_residual && residual > tolerance {
            debug!("Back-transformation diverging at iteration {}", iteration);
            return Err(CoordinateError::BackTransformation {
                iterations: iteration,
                residual,
            });
        }
        best_residual = best_residual.min(residual);

        let b = system.wilson_matrix(&geometry);
        let by = vectors.transpose() * b;
        let g = &by * by.transpose();
        let dx = by.transpose() * (symmetric_pinv(&g) * r);
        if !dx.iter().all(|v| v.is_finite()) {
            break;
        }
        geometry.coords += &dx;
        if rms(&dx) < tolerance {
            return Ok(geometry);
        }
    }

    Err(CoordinateError::BackTransformation {
        iterations: max_iterations,
        residual,
    })
}
