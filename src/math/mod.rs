//! Unit conversions and small numerical helpers shared by the optimizer

use nalgebra::{DMatrix, DVector, Vector3};
use std::f64::consts::PI;

/// Bohr radius in Angstroms (CODATA 2018)
pub const BOHR_TO_ANGSTROM: f64 = 0.529177210903;
/// Inverse of [`BOHR_TO_ANGSTROM`]
pub const ANGSTROM_TO_BOHR: f64 = 1.0 / BOHR_TO_ANGSTROM;

/// Eigenvalues below this are treated as zero when inverting symmetric matrices
pub const EIGEN_CUTOFF: f64 = 1e-6;

/// Wrap an angle into (-π, π]
pub fn wrap_angle(angle: f64) -> f64 {
    let mut a = angle % (2.0 * PI);
    if a > PI {
        a -= 2.0 * PI;
    } else if a <= -PI {
        a += 2.0 * PI;
    }
    a
}

/// Shift `angle` by a multiple of 2π so that it lies nearest to `reference`
pub fn nearest_periodic(angle: f64, reference: f64) -> f64 {
    reference + wrap_angle(angle - reference)
}

/// Root-mean-square of the vector entries
pub fn rms(v: &DVector<f64>) -> f64 {
    if v.is_empty() {
        return 0.0;
    }
    v.norm() / (v.len() as f64).sqrt()
}

/// Largest absolute entry
pub fn max_abs(v: &DVector<f64>) -> f64 {
    v.iter().fold(0.0, |acc: f64, x| acc.max(x.abs()))
}

/// Largest per-atom displacement length of a flat Cartesian vector
pub fn max_atom_norm(v: &DVector<f64>) -> f64 {
    (0..v.len() / 3)
        .map(|i| atom_vector(v, i).norm())
        .fold(0.0, f64::max)
}

/// Extract the 3-vector of atom `i` from a flat coordinate vector
pub fn atom_vector(coords: &DVector<f64>, i: usize) -> Vector3<f64> {
    Vector3::new(coords[3 * i], coords[3 * i + 1], coords[3 * i + 2])
}

/// Generalized inverse of a symmetric matrix through its eigendecomposition.
///
/// Eigenvalues with magnitude below [`EIGEN_CUTOFF`] are dropped.
pub fn symmetric_pinv(m: &DMatrix<f64>) -> DMatrix<f64> {
    let n = m.nrows();
    let eig = m.clone().symmetric_eigen();
    let mut inv = DMatrix::zeros(n, n);
    for k in 0..n {
        let lambda = eig.eigenvalues[k];
        if lambda.abs() > EIGEN_CUTOFF {
            let v = eig.eigenvectors.column(k);
            inv += (v * v.transpose()) / lambda;
        }
    }
    inv
}

/// Orthonormal basis for the column span of `m`, dropping directions whose
/// Gram eigenvalue falls below `threshold`.
pub fn column_basis(m: &DMatrix<f64>, threshold: f64) -> DMatrix<f64> {
    let gram = m * m.transpose();
    let eig = gram.symmetric_eigen();
    let mut order: Vec<usize> = (0..eig.eigenvalues.len())
        .filter(|&k| eig.eigenvalues[k] > threshold)
        .collect();
    // Largest eigenvalues first gives a deterministic column order
    order.sort_by(|&a, &b| {
        eig.eigenvalues[b]
            .partial_cmp(&eig.eigenvalues[a])
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    let columns: Vec<DVector<f64>> = order
        .iter()
        .map(|&k| eig.eigenvectors.column(k).into_owned())
        .collect();
    if columns.is_empty() {
        DMatrix::zeros(m.nrows(), 0)
    } else {
        DMatrix::from_columns(&columns)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;

    #[test]
    fn test_unit_conversion() {
        assert_approx_eq!(ANGSTROM_TO_BOHR * BOHR_TO_ANGSTROM, 1.0, 1e-12);
        assert_approx_eq!(ANGSTROM_TO_BOHR, 1.8897261, 1e-6);
    }

    #[test]
    fn test_wrap_angle() {
        assert_approx_eq!(wrap_angle(0.5), 0.5, 1e-12);
        assert_approx_eq!(wrap_angle(PI + 0.1), -PI + 0.1, 1e-12);
        assert_approx_eq!(wrap_angle(-PI - 0.1), PI - 0.1, 1e-12);
        assert_approx_eq!(wrap_angle(4.0 * PI + 0.3), 0.3, 1e-12);
    }

    #[test]
    fn test_nearest_periodic_crosses_branch_cut() {
        // -179 degrees seen from +179 degrees is +181 degrees
        let reference = 179f64.to_radians();
        let value = nearest_periodic((-179f64).to_radians(), reference);
        assert_approx_eq!(value, 181f64.to_radians(), 1e-12);
    }

    #[test]
    fn test_rms_and_max() {
        let v = DVector::from_vec(vec![3.0, -4.0]);
        assert_approx_eq!(rms(&v), (12.5f64).sqrt(), 1e-12);
        assert_approx_eq!(max_abs(&v), 4.0, 1e-12);
        assert_eq!(rms(&DVector::zeros(0)), 0.0);
    }

    #[test]
    fn test_max_atom_norm() {
        let v = DVector::from_vec(vec![0.0, 3.0, 4.0, 1.0, 0.0, 0.0]);
        assert_approx_eq!(max_atom_norm(&v), 5.0, 1e-12);
    }

    #[test]
    fn test_symmetric_pinv_of_singular_matrix() {
        let m = DMatrix::from_row_slice(2, 2, &[1.0, 1.0, 1.0, 1.0]);
        let inv = symmetric_pinv(&m);
        // Moore-Penrose identity: M M+ M = M
        let back = &m * &inv * &m;
        for (a, b) in back.iter().zip(m.iter()) {
            assert_approx_eq!(a, b, 1e-10);
        }
    }

    #[test]
    fn test_column_basis_drops_dependent_columns() {
        let m = DMatrix::from_row_slice(3, 3, &[1.0, 2.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 1.0]);
        let basis = column_basis(&m, 1e-8);
        assert_eq!(basis.ncols(), 2);
        let gram = basis.transpose() * &basis;
        assert_approx_eq!(gram[(0, 0)], 1.0, 1e-10);
        assert_approx_eq!(gram[(0, 1)], 0.0, 1e-10);
    }
}
