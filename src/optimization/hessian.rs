//! Hessian guess and quasi-Newton update in primitive coordinates

use crate::coords::{CoordinateSystem, Primitive};
use log::trace;
use nalgebra::{DMatrix, DVector};

/// Curvatures below this skip the update
const SMALL: f64 = 1e-14;

/// Diagonal force constant guess for one primitive (Hartree per unit²)
fn force_constant(primitive: &Primitive) -> f64 {
    match primitive {
        Primitive::Distance { .. } => 0.5,
        Primitive::Angle { .. } => 0.2,
        Primitive::LinearBend { .. } => 0.1,
        Primitive::Dihedral { .. } | Primitive::OutOfPlane { .. } => 0.1,
        Primitive::Cartesian { .. } => 0.5,
        Primitive::Translation { .. } | Primitive::Rotation { .. } => 0.05,
    }
}

/// Diagonal starting Hessian for a coordinate system
pub fn guess(system: &CoordinateSystem) -> DMatrix<f64> {
    let diagonal = DVector::from_iterator(
        system.len(),
        system.primitives().iter().map(force_constant),
    );
    DMatrix::from_diagonal(&diagonal)
}

/// BFGS update:
///
/// ```text
/// H' = H + (y yᵀ)/(s·y) - (H s)(H s)ᵀ/(sᵀ H s)
/// ```
///
/// Skipped unless the curvature `s·y` is positive, which keeps a positive
/// definite Hessian positive definite.
pub fn update_bfgs(hessian: &DMatrix<f64>, s: &DVector<f64>, y: &DVector<f64>) -> DMatrix<f64> {
    if !s.iter().chain(y.iter()).all(|v| v.is_finite()) {
        return hessian.clone();
    }
    let sy = s.dot(y);
    if sy <= SMALL {
        trace!("Skipping BFGS update, curvature {:.3e}", sy);
        return hessian.clone();
    }
    let hs = hessian * s;
    let shs = s.dot(&hs);
    if shs.abs() <= SMALL {
        return hessian.clone();
    }
    hessian + (y * y.transpose()) / sy - (&hs * hs.transpose()) / shs
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coords::CoordSystemKind;
    use crate::molecule::{Geometry, Topology};
    use assert_approx_eq::assert_approx_eq;

    #[test]
    fn test_guess_diagonal() {
        let geometry = Geometry::new(
            vec!["O".into(), "H".into(), "H".into()],
            vec![0.0, 0.0, -0.1294769, 0.0, -1.4941873, 1.0274465, 0.0, 1.4941873, 1.0274465],
        )
        .unwrap();
        let topology = Topology::infer(&geometry).unwrap();
        let system =
            CoordinateSystem::build(&geometry, &topology, CoordSystemKind::Tric, &[], 175.0).unwrap();
        let h = guess(&system);
        assert_eq!(h.nrows(), 9);
        assert_eq!(h[(0, 0)], 0.5);
        assert_eq!(h[(2, 2)], 0.2);
        assert_eq!(h[(8, 8)], 0.05);
        assert_eq!(h[(0, 1)], 0.0);
    }

    #[test]
    fn test_bfgs_satisfies_secant_condition() {
        let h = DMatrix::identity(3, 3);
        let s = DVector::from_vec(vec![0.1, -0.05, 0.02]);
        let y = DVector::from_vec(vec![0.3, -0.1, 0.05]);
        let updated = update_bfgs(&h, &s, &y);
        let hs = &updated * &s;
        for k in 0..3 {
            assert_approx_eq!(hs[k], y[k], 1e-12);
        }
        assert_approx_eq!(updated[(0, 1)], updated[(1, 0)], 1e-14);
    }

    #[test]
    fn test_bfgs_skips_negative_curvature() {
        let h = DMatrix::identity(2, 2);
        let s = DVector::from_vec(vec![0.1, 0.0]);
        let y = DVector::from_vec(vec![-0.2, 0.0]);
        assert_eq!(update_bfgs(&h, &s, &y), h);
    }
}
