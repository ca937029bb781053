//! Trust radius control and convergence checks

use super::{OptimizerParams, Thresholds};
use crate::math::{max_atom_norm, rms};
use nalgebra::DVector;
use serde::Serialize;

/// Outcome of judging one step
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Assessment {
    pub accept: bool,
    /// Trust radius for the next step
    pub trust: f64,
    /// Actual over predicted energy change
    pub ratio: f64,
}

/// Judge a step from its predicted and actual energy change.
///
/// A step that raised the energy is rejected when the quadratic model was
/// badly wrong, unless the trust radius is already at its floor. Good
/// full-length steps grow the radius, poor ones shrink it.
pub fn assess(
    predicted: f64,
    actual: f64,
    step_norm: f64,
    trust: f64,
    params: &OptimizerParams,
) -> Assessment {
    let ratio = if predicted.abs() < 1e-12 {
        1.0
    } else {
        actual / predicted
    };

    let bad_model = ratio < 0.0 || ratio > 3.0;
    let at_floor = trust <= params.trust_min * (1.0 + 1e-9);
    if actual > params.thresholds.energy && bad_model && !at_floor {
        return Assessment {
            accept: false,
            trust: params.trust_min.max(0.5 * trust.min(step_norm)),
            ratio,
        };
    }

    let trust = if ratio < 0.25 {
        params.trust_min.max(0.5 * trust)
    } else if (ratio - 1.0).abs() < 0.25 && step_norm >= 0.8 * trust {
        params.trust_max.min(2.0 * trust)
    } else {
        trust
    };
    Assessment {
        accept: true,
        trust,
        ratio,
    }
}

/// Which convergence criteria are met
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ConvergenceStatus {
    pub energy: bool,
    pub grms: bool,
    pub gmax: bool,
    pub drms: bool,
    pub dmax: bool,
    pub constraints: bool,
}

impl ConvergenceStatus {
    pub fn is_converged(&self) -> bool {
        self.energy && self.grms && self.gmax && self.drms && self.dmax && self.constraints
    }
}

/// Compare an iteration's measures against the thresholds.
///
/// `gradient` is the constraint-projected Cartesian gradient and
/// `displacement` the Cartesian step, both flat.
pub fn check_convergence(
    energy_change: f64,
    gradient: &DVector<f64>,
    displacement: &DVector<f64>,
    constraints_met: bool,
    thresholds: &Thresholds,
) -> ConvergenceStatus {
    ConvergenceStatus {
        energy: energy_change.abs() < thresholds.energy,
        grms: rms(gradient) < thresholds.grms,
        gmax: max_atom_norm(gradient) < thresholds.gmax,
        drms: rms(displacement) < thresholds.drms,
        dmax: max_atom_norm(displacement) < thresholds.dmax,
        constraints: constraints_met,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;

    #[test]
    fn test_good_full_step_grows_trust() {
        let params = OptimizerParams::default();
        let a = assess(-0.01, -0.0095, 0.1, 0.1, &params);
        assert!(a.accept);
        assert_approx_eq!(a.trust, 0.2, 1e-12);
        let capped = assess(-0.01, -0.01, 0.2, 0.2, &params);
        assert_approx_eq!(capped.trust, params.trust_max, 1e-12);
    }

    #[test]
    fn test_short_step_keeps_trust() {
        let params = OptimizerParams::default();
        let a = assess(-0.01, -0.01, 0.02, 0.1, &params);
        assert!(a.accept);
        assert_approx_eq!(a.trust, 0.1, 1e-12);
    }

    #[test]
    fn test_poor_ratio_shrinks_trust() {
        let params = OptimizerParams::default();
        let a = assess(-0.01, -0.001, 0.1, 0.1, &params);
        assert!(a.accept);
        assert_approx_eq!(a.trust, 0.05, 1e-12);
    }

    #[test]
    fn test_energy_rise_is_rejected() {
        let params = OptimizerParams::default();
        let a = assess(-0.01, 0.02, 0.08, 0.1, &params);
        assert!(!a.accept);
        assert_approx_eq!(a.trust, 0.04, 1e-12);
        assert!(a.ratio < 0.0);
    }

    #[test]
    fn test_rise_at_trust_floor_is_accepted() {
        let params = OptimizerParams::default();
        let a = assess(-1e-4, 1e-3, params.trust_min, params.trust_min, &params);
        assert!(a.accept);
        assert_approx_eq!(a.trust, params.trust_min, 1e-15);
    }

    #[test]
    fn test_tiny_prediction_counts_as_exact() {
        let params = OptimizerParams::default();
        let a = assess(1e-14, 1e-9, 1e-6, 0.1, &params);
        assert!(a.accept);
        assert_eq!(a.ratio, 1.0);
    }

    #[test]
    fn test_convergence_status() {
        let thresholds = Thresholds::default();
        let small = DVector::from_vec(vec![1e-5, 0.0, 0.0, -1e-5, 0.0, 0.0]);
        let status = check_convergence(-1e-7, &small, &small, true, &thresholds);
        assert!(status.is_converged());

        let large = DVector::from_vec(vec![1e-2, 0.0, 0.0, -1e-2, 0.0, 0.0]);
        let status = check_convergence(-1e-7, &large, &small, true, &thresholds);
        assert!(!status.grms && !status.gmax && status.drms);
        assert!(!status.is_converged());

        let status = check_convergence(-1e-7, &small, &small, false, &thresholds);
        assert!(!status.is_converged());
    }
}
