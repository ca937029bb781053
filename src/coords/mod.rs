//! Redundant internal coordinate systems
//!
//! A [`CoordinateSystem`] is the ordered list of primitive coordinates used
//! to describe a molecule: bonds, angles (or linear bend pairs), dihedrals
//! and out-of-plane coordinates generated from the topology, plus rigid-body
//! coordinates per fragment for the `tric` kind. Primitives required by
//! constraints are always present.

pub mod dlc;
pub mod primitive;

pub use dlc::{back_transform, DelocalizedBasis};
pub use primitive::{Primitive, PrimitiveKey};

use crate::math::{nearest_periodic, symmetric_pinv};
use crate::molecule::{Geometry, MoleculeError, Topology};
use log::{debug, info};
use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::f64::consts::PI;
use std::fmt;
use thiserror::Error;

/// Errors raised while building or using internal coordinates
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CoordinateError {
    #[error("Molecule error: {0}")]
    Molecule(#[from] MoleculeError),

    #[error("Coordinate system is empty")]
    Empty,

    #[error("Required coordinate {0} refers to atoms outside the molecule")]
    InvalidRequired(String),

    #[error("Back-transformation failed after {iterations} iterations (residual {residual:.3e})")]
    BackTransformation { iterations: usize, residual: f64 },

    #[error("Constraint map is singular")]
    SingularConstraints,
}

/// Which family of coordinates to build
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CoordSystemKind {
    /// Primitive internals plus per-fragment translation and rotation
    #[default]
    Tric,
    /// Primitive internals with fragments joined by their closest atom pair
    Prim,
    /// Plain Cartesian coordinates
    Cart,
}

impl fmt::Display for CoordSystemKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CoordSystemKind::Tric => "tric",
            CoordSystemKind::Prim => "prim",
            CoordSystemKind::Cart => "cart",
        })
    }
}

/// Ordered set of primitive coordinates for one molecule
#[derive(Debug, Clone)]
pub struct CoordinateSystem {
    kind: CoordSystemKind,
    num_atoms: usize,
    primitives: Vec<Primitive>,
    index: HashMap<PrimitiveKey, usize>,
    required: HashSet<PrimitiveKey>,
    /// Angles treated as linear when the system was built
    linear: HashSet<PrimitiveKey>,
    linear_threshold: f64,
}

impl CoordinateSystem {
    /// Build a coordinate system.
    ///
    /// `linear_threshold_deg` is the bend angle above which an angle is
    /// replaced by a pair of linear bend coordinates.
    pub fn build(
        geometry: &Geometry,
        topology: &Topology,
        kind: CoordSystemKind,
        required: &[PrimitiveKey],
        linear_threshold_deg: f64,
    ) -> Result<Self, CoordinateError> {
        let n = geometry.num_atoms();
        if topology.num_atoms() != n {
            return Err(MoleculeError::ShapeMismatch {
                atoms: topology.num_atoms(),
                coords: geometry.coords.len(),
            }
            .into());
        }
        if let Some(bad) = required.iter().find(|k| k.atoms().iter().any(|&a| a >= n)) {
            return Err(CoordinateError::InvalidRequired(format!("{:?}", bad)));
        }

        let mut system = Self {
            kind,
            num_atoms: n,
            primitives: Vec::new(),
            index: HashMap::new(),
            required: required.iter().cloned().collect(),
            linear: HashSet::new(),
            linear_threshold: linear_threshold_deg.to_radians(),
        };
        let coords = &geometry.coords;

        match kind {
            CoordSystemKind::Cart => {
                for atom in 0..n {
                    for axis in 0..3 {
                        system.add(PrimitiveKey::Cartesian(atom, axis), coords);
                    }
                }
            }
            CoordSystemKind::Tric | CoordSystemKind::Prim => {
                let mut connected = topology.clone();
                let fragments = topology.fragments();
                if kind == CoordSystemKind::Prim {
                    join_fragments(geometry, &mut connected, &fragments)?;
                }
                system.add_internals(geometry, &connected);

                if kind == CoordSystemKind::Tric {
                    let pinned: HashSet<usize> = required
                        .iter()
                        .filter_map(|k| match k {
                            PrimitiveKey::Cartesian(atom, _) => Some(*atom),
                            _ => None,
                        })
                        .collect();
                    for fragment in &fragments {
                        system.add_rigid_body(fragment, &pinned, coords);
                    }
                }
            }
        }

        for key in required {
            system.add(key.clone(), coords);
        }
        if system.primitives.is_empty() {
            return Err(CoordinateError::Empty);
        }

        info!(
            "Built {} coordinate system with {} primitives ({} linear angles)",
            kind,
            system.primitives.len(),
            system.linear.len()
        );
        Ok(system)
    }

    fn add(&mut self, key: PrimitiveKey, coords: &DVector<f64>) {
        if self.index.contains_key(&key) {
            return;
        }
        let primitive = Primitive::from_key(&key, coords);
        debug!("Adding primitive {}", primitive);
        self.index.insert(key, self.primitives.len());
        self.primitives.push(primitive);
    }

    /// Translation and rotation of one fragment. A fragment holding an atom
    /// with Cartesian constraints is placed by the Cartesian coordinates of
    /// all its atoms instead.
    fn add_rigid_body(&mut self, fragment: &[usize], pinned: &HashSet<usize>, coords: &DVector<f64>) {
        if fragment.iter().any(|atom| pinned.contains(atom)) {
            for &atom in fragment {
                for axis in 0..3 {
                    self.add(PrimitiveKey::Cartesian(atom, axis), coords);
                }
            }
            return;
        }
        for axis in 0..3 {
            self.add(PrimitiveKey::translation(fragment, axis), coords);
        }
        if fragment.len() > 1 {
            for axis in 0..3 {
                self.add(PrimitiveKey::rotation(fragment, axis), coords);
            }
        }
    }

    fn add_internals(&mut self, geometry: &Geometry, topology: &Topology) {
        let coords = &geometry.coords;
        for bond in topology.bonds() {
            self.add(PrimitiveKey::distance(bond.atom1_idx, bond.atom2_idx), coords);
        }

        for b in 0..self.num_atoms {
            let neighbors = topology.neighbors(b);
            for (i, &a) in neighbors.iter().enumerate() {
                for &c in &neighbors[i + 1..] {
                    let key = PrimitiveKey::angle(a, b, c);
                    if self.is_linear(coords, a, b, c) && !self.required.contains(&key) {
                        self.linear.insert(key);
                        for component in 0..2 {
                            self.add(PrimitiveKey::LinearBend(a, b, c, component), coords);
                        }
                    } else {
                        self.add(key, coords);
                    }
                }
            }
        }

        for bond in topology.bonds() {
            let (b, c) = (bond.atom1_idx, bond.atom2_idx);
            for &a in topology.neighbors(b) {
                if a == c || self.is_linear(coords, a, b, c) {
                    continue;
                }
                for &d in topology.neighbors(c) {
                    if d == b || d == a || self.is_linear(coords, b, c, d) {
                        continue;
                    }
                    self.add(PrimitiveKey::dihedral(a, b, c, d), coords);
                }
            }
        }

        for b in 0..self.num_atoms {
            if let [a, c, d] = *topology.neighbors(b) {
                if !self.is_linear(coords, a, b, c)
                    && !self.is_linear(coords, a, b, d)
                    && !self.is_linear(coords, c, b, d)
                {
                    self.add(PrimitiveKey::OutOfPlane(b, a, c, d), coords);
                }
            }
        }
    }

    fn bend(coords: &DVector<f64>, a: usize, b: usize, c: usize) -> f64 {
        Primitive::Angle { a, b, c }.value(coords)
    }

    fn is_linear(&self, coords: &DVector<f64>, a: usize, b: usize, c: usize) -> bool {
        let theta = Self::bend(coords, a, b, c);
        theta > self.linear_threshold || theta < PI - self.linear_threshold
    }

    /// Coordinate family
    pub fn kind(&self) -> CoordSystemKind {
        self.kind
    }

    /// Number of atoms the system describes
    pub fn num_atoms(&self) -> usize {
        self.num_atoms
    }

    /// Primitives in order
    pub fn primitives(&self) -> &[Primitive] {
        &self.primitives
    }

    /// Number of primitives
    pub fn len(&self) -> usize {
        self.primitives.len()
    }

    /// Is the system empty?
    pub fn is_empty(&self) -> bool {
        self.primitives.is_empty()
    }

    /// Position of a primitive in the system
    pub fn index_of(&self, key: &PrimitiveKey) -> Option<usize> {
        self.index.get(key).copied()
    }

    /// Primitive values at `geometry`
    pub fn values(&self, geometry: &Geometry) -> DVector<f64> {
        DVector::from_iterator(
            self.primitives.len(),
            self.primitives.iter().map(|p| p.value(&geometry.coords)),
        )
    }

    /// Primitive values with periodic coordinates unwrapped next to `previous`
    pub fn values_near(&self, geometry: &Geometry, previous: &DVector<f64>) -> DVector<f64> {
        DVector::from_iterator(
            self.primitives.len(),
            self.primitives.iter().zip(previous.iter()).map(|(p, &prev)| {
                let value = p.value(&geometry.coords);
                if p.is_periodic() {
                    nearest_periodic(value, prev)
                } else {
                    value
                }
            }),
        )
    }

    /// `q1 - q0` with periodic components wrapped
    pub fn difference(&self, q1: &DVector<f64>, q0: &DVector<f64>) -> DVector<f64> {
        DVector::from_iterator(
            self.primitives.len(),
            self.primitives
                .iter()
                .enumerate()
                .map(|(i, p)| p.difference(q1[i], q0[i])),
        )
    }

    /// Wilson B matrix (primitives × 3N)
    pub fn wilson_matrix(&self, geometry: &Geometry) -> DMatrix<f64> {
        let cols = 3 * self.num_atoms;
        let mut b = DMatrix::zeros(self.primitives.len(), cols);
        for (i, primitive) in self.primitives.iter().enumerate() {
            for (atom, d) in primitive.derivatives(&geometry.coords) {
                for k in 0..3 {
                    b[(i, 3 * atom + k)] += d[k];
                }
            }
        }
        b
    }

    /// Gradient in primitive coordinates, `G⁻ B g_x`
    pub fn primitive_gradient(&self, wilson: &DMatrix<f64>, gradient: &DVector<f64>) -> DVector<f64> {
        let g = wilson * wilson.transpose();
        symmetric_pinv(&g) * (wilson * gradient)
    }

    /// Bond angles of the system beyond the linear threshold at `geometry`.
    ///
    /// Angles required by constraints are never reported.
    pub fn near_linear_angles(&self, geometry: &Geometry) -> HashSet<PrimitiveKey> {
        let coords = &geometry.coords;
        let bent = self.primitives.iter().filter_map(|p| match p {
            Primitive::Angle { a, b, c } if !self.required.contains(&p.key()) => Some((*a, *b, *c)),
            _ => None,
        });
        let linear = self.linear.iter().filter_map(|key| match key {
            PrimitiveKey::Angle(a, b, c) => Some((*a, *b, *c)),
            _ => None,
        });
        bent.chain(linear)
            .filter(|&(a, b, c)| self.is_linear(coords, a, b, c))
            .map(|(a, b, c)| PrimitiveKey::angle(a, b, c))
            .collect()
    }

    /// Has any angle crossed the linear threshold since the system was built?
    pub fn linearity_changed(&self, geometry: &Geometry) -> bool {
        self.near_linear_angles(geometry) != self.linear
    }
}

/// Connect each fragment to the ones before it through its closest atom pair
fn join_fragments(
    geometry: &Geometry,
    topology: &mut Topology,
    fragments: &[Vec<usize>],
) -> Result<(), MoleculeError> {
    for (k, fragment) in fragments.iter().enumerate().skip(1) {
        let mut best: Option<(usize, usize, f64)> = None;
        for earlier in &fragments[..k] {
            for &i in earlier {
                for &j in fragment {
                    let r = geometry.distance(i, j);
                    if best.map_or(true, |(_, _, d)| r < d) {
                        best = Some((i, j, r));
                    }
                }
            }
        }
        if let Some((i, j, r)) = best {
            debug!("Joining fragments through atoms {} and {} ({:.3} Bohr)", i + 1, j + 1, r);
            topology.add_bond(i, j, 0.0)?;
        }
    }
    Ok(())
}
