//! Constrained quasi-Newton steps in delocalized internal coordinates
//!
//! Each proposal rebuilds the delocalized basis at the current geometry.
//! Constrained coordinates take a forced step toward their targets; the
//! free coordinates take a trust-region step on the quadratic model with
//! the constrained displacement held fixed.

use super::{OptimizationState, OptimizerParams};
use crate::constraints::bind::BoundConstraint;
use crate::coords::{back_transform, CoordinateSystem, DelocalizedBasis};
use crate::math::max_abs;
use crate::molecule::Geometry;
use log::{debug, trace};
use nalgebra::{DMatrix, DVector};
use std::collections::HashMap;
use thiserror::Error;

/// Smallest eigenvalue treated as positive when taking a plain Newton step
const NEWTON_FLOOR: f64 = 1e-8;

/// A step could not be turned into a new geometry
#[derive(Error, Debug, Clone, PartialEq)]
#[error("{0}")]
pub struct StepDegeneracy(pub String);

/// A proposed step and everything needed to judge it
#[derive(Debug, Clone)]
pub struct Proposal {
    /// Geometry after the step
    pub geometry: Geometry,
    /// Primitive values there, periodic ones unwrapped next to the current values
    pub values: DVector<f64>,
    /// Energy change predicted by the quadratic model
    pub predicted_change: f64,
    /// Length of the step in delocalized coordinates
    pub step_norm: f64,
    /// Flat Cartesian displacement
    pub displacement: DVector<f64>,
    /// Cartesian gradient with the constrained directions removed, at the current point
    pub projected_gradient: DVector<f64>,
    /// Are all constraints within tolerance at the current point?
    pub constraints_met: bool,
    /// Largest remaining constraint deviation at the current point
    pub max_constraint_deviation: f64,
}

/// Propose the next step from `state`
pub fn propose(
    state: &OptimizationState,
    system: &CoordinateSystem,
    constraints: &[BoundConstraint],
    params: &OptimizerParams,
) -> Result<Proposal, StepDegeneracy> {
    let wilson = system.wilson_matrix(&state.geometry);
    let indices: Vec<usize> = constraints.iter().map(|c| c.primitive).collect();
    let basis = DelocalizedBasis::build(&wilson, &indices).map_err(|e| StepDegeneracy(e.to_string()))?;
    let targets: HashMap<usize, f64> = constraints.iter().map(|c| (c.primitive, c.target)).collect();

    let n = basis.len();
    let k = basis.num_constrained();
    let free = n - k;
    let gy = basis.gradient(&wilson, &state.gradient);
    let hy = basis.hessian(&state.hessian);

    // Remaining displacement of each constrained primitive
    let primitives = system.primitives();
    let mut deviation = DVector::zeros(k);
    for (i, &p) in basis.constrained.iter().enumerate() {
        let target = targets.get(&p).copied().unwrap_or(state.values[p]);
        let diff = primitives[p].difference(target, state.values[p]);
        if diff.abs() > params.constraint_tolerance {
            deviation[i] = diff;
        }
    }
    let max_constraint_deviation = max_abs(&deviation);
    let constraints_met = max_constraint_deviation == 0.0;
    if deviation.norm() > state.trust {
        deviation *= state.trust / deviation.norm();
    }
    let dy_constrained = if k > 0 {
        basis
            .constraint_map
            .solve_lower_triangular(&deviation)
            .ok_or_else(|| StepDegeneracy("constraint map is singular".into()))?
    } else {
        DVector::zeros(0)
    };

    let g_free = gy.rows(k, free).into_owned();
    let h_ff = hy.view((k, k), (free, free)).into_owned();
    let h_fc = hy.view((k, 0), (free, k)).into_owned();
    let shifted_gradient = &g_free + &h_fc * &dy_constrained;
    let dy_free = trust_region_step(&h_ff, &shifted_gradient, state.trust);

    let mut dy = DVector::zeros(n);
    dy.rows_mut(0, k).copy_from(&dy_constrained);
    dy.rows_mut(k, free).copy_from(&dy_free);
    let predicted_change = gy.dot(&dy) + 0.5 * dy.dot(&(&hy * &dy));
    trace!(
        "Step: |dy_c| = {:.3e}, |dy_f| = {:.3e}, predicted dE = {:.3e}",
        dy_constrained.norm(),
        dy_free.norm(),
        predicted_change
    );

    let geometry = back_transform(
        system,
        &basis.vectors,
        &state.geometry,
        &dy,
        params.backtransform_tolerance,
        params.backtransform_max_iterations,
    )
    .map_err(|e| StepDegeneracy(e.to_string()))?;
    let values = system.values_near(&geometry, &state.values);
    let displacement = &geometry.coords - &state.geometry.coords;

    let by_free = basis.wilson(&wilson).rows(k, free).into_owned();
    let projected_gradient = by_free.transpose() * &g_free;

    debug!(
        "Proposed step of {:.4} ({} free, {} constrained coordinates)",
        dy.norm(),
        free,
        k
    );
    Ok(Proposal {
        geometry,
        values,
        predicted_change,
        step_norm: dy.norm(),
        displacement,
        projected_gradient,
        constraints_met,
        max_constraint_deviation,
    })
}

/// Minimize `gᵀx + ½xᵀHx` subject to `|x| <= radius`.
///
/// Takes the Newton step when `H` is positive definite and the step fits,
/// otherwise finds the level shift that puts the step on the boundary.
pub fn trust_region_step(hessian: &DMatrix<f64>, gradient: &DVector<f64>, radius: f64) -> DVector<f64> {
    let n = gradient.len();
    if n == 0 || gradient.norm() == 0.0 {
        return DVector::zeros(n);
    }
    let eig = hessian.clone().symmetric_eigen();
    let components = eig.eigenvectors.transpose() * gradient;
    let step_for = |shift: f64| -> DVector<f64> {
        let scaled = DVector::from_fn(n, |i, _| -components[i] / (eig.eigenvalues[i] + shift));
        &eig.eigenvectors * scaled
    };

    let lowest = eig.eigenvalues.min();
    if lowest > NEWTON_FLOOR {
        let newton = step_for(0.0);
        if newton.norm() <= radius {
            return newton;
        }
    }

    // Shifts above `low` keep every denominator positive; at `high` the step is inside
    let mut low = (-lowest).max(0.0) + NEWTON_FLOOR;
    let mut high = low + gradient.norm() / radius;
    let at_low = step_for(low);
    if at_low.norm() <= radius {
        // Gradient has no component along the lowest mode
        return at_low;
    }
    for _ in 0..200 {
        let mid = 0.5 * (low + high);
        let norm = step_for(mid).norm();
        if (norm - radius).abs() < 1e-8 * radius {
            return step_for(mid);
        }
        if norm > radius {
            low = mid;
        } else {
            high = mid;
        }
    }
    step_for(high)
}
