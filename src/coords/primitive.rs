//! Primitive internal coordinates and their Cartesian derivatives

use crate::math::{atom_vector, wrap_angle};
use nalgebra::{DVector, Vector3};
use std::fmt;

/// Hashable identity of a primitive, independent of reference data
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PrimitiveKey {
    Distance(usize, usize),
    Angle(usize, usize, usize),
    LinearBend(usize, usize, usize, usize),
    Dihedral(usize, usize, usize, usize),
    OutOfPlane(usize, usize, usize, usize),
    Cartesian(usize, usize),
    Translation(Vec<usize>, usize),
    Rotation(Vec<usize>, usize),
}

impl PrimitiveKey {
    /// Distance key with canonical atom order
    pub fn distance(a: usize, b: usize) -> Self {
        PrimitiveKey::Distance(a.min(b), a.max(b))
    }

    /// Angle key with canonical atom order (outer atoms ascending)
    pub fn angle(a: usize, b: usize, c: usize) -> Self {
        PrimitiveKey::Angle(a.min(c), b, a.max(c))
    }

    /// Dihedral key with canonical atom order (first outer atom lowest)
    pub fn dihedral(a: usize, b: usize, c: usize, d: usize) -> Self {
        if a <= d {
            PrimitiveKey::Dihedral(a, b, c, d)
        } else {
            PrimitiveKey::Dihedral(d, c, b, a)
        }
    }

    /// Translation key over a sorted atom list
    pub fn translation(atoms: &[usize], axis: usize) -> Self {
        PrimitiveKey::Translation(sorted(atoms), axis)
    }

    /// Rotation key over a sorted atom list
    pub fn rotation(atoms: &[usize], axis: usize) -> Self {
        PrimitiveKey::Rotation(sorted(atoms), axis)
    }

    /// Atoms the primitive depends on
    pub fn atoms(&self) -> Vec<usize> {
        match self {
            PrimitiveKey::Distance(a, b) => vec![*a, *b],
            PrimitiveKey::Angle(a, b, c) | PrimitiveKey::LinearBend(a, b, c, _) => vec![*a, *b, *c],
            PrimitiveKey::Dihedral(a, b, c, d) | PrimitiveKey::OutOfPlane(a, b, c, d) => {
                vec![*a, *b, *c, *d]
            }
            PrimitiveKey::Cartesian(a, _) => vec![*a],
            PrimitiveKey::Translation(atoms, _) | PrimitiveKey::Rotation(atoms, _) => atoms.clone(),
        }
    }
}

fn sorted(atoms: &[usize]) -> Vec<usize> {
    let mut atoms = atoms.to_vec();
    atoms.sort_unstable();
    atoms.dedup();
    atoms
}

/// A primitive internal coordinate.
///
/// Distances are in Bohr, angles in radians. Rigid-body coordinates of a
/// fragment keep the reference positions they were built from.
#[derive(Debug, Clone, PartialEq)]
pub enum Primitive {
    Distance {
        a: usize,
        b: usize,
    },
    Angle {
        a: usize,
        b: usize,
        c: usize,
    },
    /// One component of a near-linear bend, measured along a fixed direction
    /// perpendicular to the a-c axis
    LinearBend {
        a: usize,
        b: usize,
        c: usize,
        component: usize,
        direction: Vector3<f64>,
    },
    Dihedral {
        a: usize,
        b: usize,
        c: usize,
        d: usize,
    },
    /// Out-of-plane displacement at a three-coordinate centre `b`
    OutOfPlane {
        a: usize,
        b: usize,
        c: usize,
        d: usize,
    },
    Cartesian {
        atom: usize,
        axis: usize,
    },
    /// Centroid of a fragment along one axis
    Translation {
        atoms: Vec<usize>,
        axis: usize,
    },
    /// Linearized rotation of a fragment about one axis
    Rotation {
        atoms: Vec<usize>,
        axis: usize,
        reference: Vec<Vector3<f64>>,
        scale: f64,
    },
}

impl Primitive {
    /// Build the primitive for `key`, taking reference data from `coords`
    pub fn from_key(key: &PrimitiveKey, coords: &DVector<f64>) -> Self {
        match key.clone() {
            PrimitiveKey::Distance(a, b) => Primitive::Distance { a, b },
            PrimitiveKey::Angle(a, b, c) => Primitive::Angle { a, b, c },
            PrimitiveKey::LinearBend(a, b, c, component) => Primitive::LinearBend {
                a,
                b,
                c,
                component,
                direction: linear_bend_direction(coords, a, c, component),
            },
            PrimitiveKey::Dihedral(a, b, c, d) => Primitive::Dihedral { a, b, c, d },
            PrimitiveKey::OutOfPlane(a, b, c, d) => Primitive::OutOfPlane { a, b, c, d },
            PrimitiveKey::Cartesian(atom, axis) => Primitive::Cartesian { atom, axis },
            PrimitiveKey::Translation(atoms, axis) => Primitive::Translation { atoms, axis },
            PrimitiveKey::Rotation(atoms, axis) => {
                let (reference, scale) = rotation_reference(coords, &atoms);
                Primitive::Rotation {
                    atoms,
                    axis,
                    reference,
                    scale,
                }
            }
        }
    }

    /// Identity of the primitive
    pub fn key(&self) -> PrimitiveKey {
        match self {
            Primitive::Distance { a, b } => PrimitiveKey::Distance(*a, *b),
            Primitive::Angle { a, b, c } => PrimitiveKey::Angle(*a, *b, *c),
            Primitive::LinearBend {
                a, b, c, component, ..
            } => PrimitiveKey::LinearBend(*a, *b, *c, *component),
            Primitive::Dihedral { a, b, c, d } => PrimitiveKey::Dihedral(*a, *b, *c, *d),
            Primitive::OutOfPlane { a, b, c, d } => PrimitiveKey::OutOfPlane(*a, *b, *c, *d),
            Primitive::Cartesian { atom, axis } => PrimitiveKey::Cartesian(*atom, *axis),
            Primitive::Translation { atoms, axis } => PrimitiveKey::Translation(atoms.clone(), *axis),
            Primitive::Rotation { atoms, axis, .. } => PrimitiveKey::Rotation(atoms.clone(), *axis),
        }
    }

    /// Is the coordinate an angle defined modulo 2π?
    pub fn is_periodic(&self) -> bool {
        matches!(self, Primitive::Dihedral { .. } | Primitive::OutOfPlane { .. })
    }

    /// Short label of the coordinate type
    pub fn label(&self) -> &'static str {
        match self {
            Primitive::Distance { .. } => "distance",
            Primitive::Angle { .. } => "angle",
            Primitive::LinearBend { .. } => "linear-bend",
            Primitive::Dihedral { .. } => "dihedral",
            Primitive::OutOfPlane { .. } => "out-of-plane",
            Primitive::Cartesian { .. } => "cartesian",
            Primitive::Translation { .. } => "translation",
            Primitive::Rotation { .. } => "rotation",
        }
    }

    /// Value of the coordinate at `coords`
    pub fn value(&self, coords: &DVector<f64>) -> f64 {
        let p = |i: usize| atom_vector(coords, i);
        match self {
            Primitive::Distance { a, b } => (p(*a) - p(*b)).norm(),
            Primitive::Angle { a, b, c } => {
                let u = p(*a) - p(*b);
                let v = p(*c) - p(*b);
                (u.dot(&v) / (u.norm() * v.norm())).clamp(-1.0, 1.0).acos()
            }
            Primitive::LinearBend {
                a, b, c, direction, ..
            } => {
                let u = (p(*a) - p(*b)).normalize();
                let v = (p(*c) - p(*b)).normalize();
                direction.dot(&(u + v))
            }
            Primitive::Dihedral { a, b, c, d } | Primitive::OutOfPlane { a, b, c, d } => {
                dihedral_angle(&p(*a), &p(*b), &p(*c), &p(*d))
            }
            Primitive::Cartesian { atom, axis } => coords[3 * atom + axis],
            Primitive::Translation { atoms, axis } => {
                atoms.iter().map(|&i| coords[3 * i + axis]).sum::<f64>() / atoms.len() as f64
            }
            Primitive::Rotation {
                atoms,
                axis,
                reference,
                scale,
            } => {
                let total: f64 = atoms
                    .iter()
                    .zip(reference)
                    .map(|(&i, r)| r.cross(&p(i))[*axis])
                    .sum();
                total / scale
            }
        }
    }

    /// Sparse Cartesian gradient as `(atom, d value / d position)` pairs
    pub fn derivatives(&self, coords: &DVector<f64>) -> Vec<(usize, Vector3<f64>)> {
        let p = |i: usize| atom_vector(coords, i);
        match self {
            Primitive::Distance { a, b } => {
                let u = p(*a) - p(*b);
                let r = u.norm();
                if r < 1e-12 {
                    return vec![];
                }
                let du = u / r;
                vec![(*a, du), (*b, -du)]
            }
            Primitive::Angle { a, b, c } => {
                let u = p(*a) - p(*b);
                let v = p(*c) - p(*b);
                let (lu, lv) = (u.norm(), v.norm());
                let (u, v) = (u / lu, v / lv);
                let cos = u.dot(&v).clamp(-1.0, 1.0);
                let sin = (1.0 - cos * cos).sqrt();
                if sin < 1e-8 {
                    return vec![];
                }
                let da = (cos * u - v) / (lu * sin);
                let dc = (cos * v - u) / (lv * sin);
                vec![(*a, da), (*b, -(da + dc)), (*c, dc)]
            }
            Primitive::LinearBend {
                a, b, c, direction, ..
            } => {
                let u = p(*a) - p(*b);
                let v = p(*c) - p(*b);
                let (lu, lv) = (u.norm(), v.norm());
                let (u, v) = (u / lu, v / lv);
                let da = (direction - u * u.dot(direction)) / lu;
                let dc = (direction - v * v.dot(direction)) / lv;
                vec![(*a, da), (*b, -(da + dc)), (*c, dc)]
            }
            Primitive::Dihedral { a, b, c, d } | Primitive::OutOfPlane { a, b, c, d } => {
                dihedral_derivatives(&p(*a), &p(*b), &p(*c), &p(*d))
                    .map(|[da, db, dc, dd]| vec![(*a, da), (*b, db), (*c, dc), (*d, dd)])
                    .unwrap_or_default()
            }
            Primitive::Cartesian { atom, axis } => vec![(*atom, unit(*axis))],
            Primitive::Translation { atoms, axis } => {
                let d = unit(*axis) / atoms.len() as f64;
                atoms.iter().map(|&i| (i, d)).collect()
            }
            Primitive::Rotation {
                atoms,
                axis,
                reference,
                scale,
            } => {
                let e = unit(*axis);
                atoms
                    .iter()
                    .zip(reference)
                    .map(|(&i, r)| (i, e.cross(r) / *scale))
                    .collect()
            }
        }
    }

    /// Dense Wilson B-matrix row of length `3 * num_atoms`
    pub fn wilson_row(&self, coords: &DVector<f64>) -> DVector<f64> {
        let mut row = DVector::zeros(coords.len());
        for (atom, d) in self.derivatives(coords) {
            for k in 0..3 {
                row[3 * atom + k] += d[k];
            }
        }
        row
    }

    /// Difference `q1 - q0`, wrapped into (-π, π] for periodic coordinates
    pub fn difference(&self, q1: f64, q0: f64) -> f64 {
        if self.is_periodic() {
            wrap_angle(q1 - q0)
        } else {
            q1 - q0
        }
    }
}

impl fmt::Display for Primitive {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const AXES: [char; 3] = ['x', 'y', 'z'];
        let atoms = self
            .key()
            .atoms()
            .iter()
            .map(|i| (i + 1).to_string())
            .collect::<Vec<_>>()
            .join("-");
        match self {
            Primitive::LinearBend { component, .. } => {
                write!(f, "{} {} ({})", self.label(), atoms, component)
            }
            Primitive::Cartesian { axis, .. }
            | Primitive::Translation { axis, .. }
            | Primitive::Rotation { axis, .. } => {
                write!(f, "{}-{} {}", self.label(), AXES[*axis], atoms)
            }
            _ => write!(f, "{} {}", self.label(), atoms),
        }
    }
}

fn unit(axis: usize) -> Vector3<f64> {
    let mut e = Vector3::zeros();
    e[axis] = 1.0;
    e
}

/// Signed dihedral angle a-b-c-d in (-π, π]
pub fn dihedral_angle(a: &Vector3<f64>, b: &Vector3<f64>, c: &Vector3<f64>, d: &Vector3<f64>) -> f64 {
    let b1 = b - a;
    let b2 = c - b;
    let b3 = d - c;
    let n1 = b1.cross(&b2);
    let n2 = b2.cross(&b3);
    let x = n1.dot(&n2);
    let y = b2.norm() * b1.dot(&n2);
    y.atan2(x)
}

/// Cartesian derivatives of the dihedral angle; `None` when either plane is undefined
fn dihedral_derivatives(
    a: &Vector3<f64>,
    b: &Vector3<f64>,
    c: &Vector3<f64>,
    d: &Vector3<f64>,
) -> Option<[Vector3<f64>; 4]> {
    let b1 = b - a;
    let b2 = c - b;
    let b3 = d - c;
    let n1 = b1.cross(&b2);
    let n2 = b2.cross(&b3);
    let (nn1, nn2) = (n1.norm_squared(), n2.norm_squared());
    let l2 = b2.norm();
    if nn1 < 1e-16 || nn2 < 1e-16 || l2 < 1e-12 {
        return None;
    }
    let da = -n1 * (l2 / nn1);
    let dd = n2 * (l2 / nn2);
    let k1 = b1.dot(&b2) / (l2 * l2);
    let k3 = b3.dot(&b2) / (l2 * l2);
    let db = dd * k3 - da * (k1 + 1.0);
    let dc = da * k1 - dd * (k3 + 1.0);
    Some([da, db, dc, dd])
}

/// Unit direction perpendicular to the a-c axis used by a linear bend component
fn linear_bend_direction(coords: &DVector<f64>, a: usize, c: usize, component: usize) -> Vector3<f64> {
    let axis = atom_vector(coords, c) - atom_vector(coords, a);
    let axis = if axis.norm() > 1e-12 {
        axis.normalize()
    } else {
        Vector3::z()
    };
    // Start from the Cartesian axis least aligned with the bond axis
    let seed = (0..3)
        .min_by(|&i, &j| axis[i].abs().total_cmp(&axis[j].abs()))
        .map(unit)
        .unwrap_or_else(Vector3::x);
    let first = axis.cross(&seed).normalize();
    if component == 0 {
        first
    } else {
        axis.cross(&first)
    }
}

/// Centred reference positions and normalization of a rotation coordinate
fn rotation_reference(coords: &DVector<f64>, atoms: &[usize]) -> (Vec<Vector3<f64>>, f64) {
    let n = atoms.len() as f64;
    let centroid = atoms
        .iter()
        .map(|&i| atom_vector(coords, i))
        .fold(Vector3::zeros(), |acc, p| acc + p)
        / n;
    let reference: Vec<Vector3<f64>> = atoms
        .iter()
        .map(|&i| atom_vector(coords, i) - centroid)
        .collect();
    let gyration = (reference.iter().map(|r| r.norm_squared()).sum::<f64>() / n).sqrt();
    let scale = (n * gyration).max(1e-8);
    (reference, scale)
}
