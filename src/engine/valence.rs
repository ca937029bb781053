//! Valence force field: Morse bonds, harmonic angles and cosine torsions
//!
//! Terms are evaluated through the same primitive coordinates the optimizer
//! uses, so their analytic gradients come from the Wilson rows.

use super::{EnergyFunction, Evaluation, Evaluator, EvaluatorError};
use crate::atom::Element;
use crate::coords::Primitive;
use crate::math::ANGSTROM_TO_BOHR;
use crate::molecule::{Geometry, Topology};
use nalgebra::DVector;
use serde::{Deserialize, Serialize};

/// Default Morse well depth (Hartree)
const BOND_DEPTH: f64 = 0.15;
/// Default Morse width (1/Bohr)
const BOND_WIDTH: f64 = 1.0;
/// Default angle force constant (Hartree/rad²)
const ANGLE_FORCE: f64 = 0.15;
/// Default torsion barrier (Hartree)
const TORSION_BARRIER: f64 = 0.002;

/// Morse potential parameters
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MorseParams {
    /// Well depth in Hartree
    pub depth: f64,
    /// Width in 1/Bohr
    pub width: f64,
    /// Equilibrium distance in Bohr
    pub r0: f64,
}

impl MorseParams {
    fn energy_and_slope(&self, r: f64) -> (f64, f64) {
        let e = (-self.width * (r - self.r0)).exp();
        let energy = self.depth * (1.0 - e).powi(2);
        let slope = 2.0 * self.depth * self.width * (1.0 - e) * e;
        (energy, slope)
    }
}

#[derive(Debug, Clone)]
struct BondTerm {
    coordinate: Primitive,
    params: MorseParams,
}

#[derive(Debug, Clone)]
struct AngleTerm {
    coordinate: Primitive,
    force: f64,
    theta0: f64,
}

#[derive(Debug, Clone)]
struct TorsionTerm {
    coordinate: Primitive,
    barrier: f64,
    periodicity: f64,
}

/// Simple analytic force field for testing and demonstration
#[derive(Debug, Clone, Default)]
pub struct ValenceForceField {
    bonds: Vec<BondTerm>,
    angles: Vec<AngleTerm>,
    torsions: Vec<TorsionTerm>,
}

impl ValenceForceField {
    /// Force field without terms
    pub fn new() -> Self {
        Self::default()
    }

    /// Terms for every bond, angle and torsion of `topology`, with defaults
    /// derived from covalent radii and coordination
    pub fn from_topology(geometry: &Geometry, topology: &Topology) -> Self {
        let elements: Vec<Option<Element>> = geometry
            .symbols
            .iter()
            .map(|s| Element::from_symbol(s).ok())
            .collect();
        let radius = |i: usize| elements[i].map_or(0.75, |e| e.covalent_radius());

        let mut ff = Self::new();
        for bond in topology.bonds() {
            let (i, j) = (bond.atom1_idx, bond.atom2_idx);
            ff = ff.with_bond(
                i,
                j,
                MorseParams {
                    depth: BOND_DEPTH,
                    width: BOND_WIDTH,
                    r0: (radius(i) + radius(j)) * ANGSTROM_TO_BOHR,
                },
            );
        }

        for b in 0..topology.num_atoms() {
            let neighbors = topology.neighbors(b);
            let theta0 = match (elements[b], neighbors.len()) {
                (Some(Element::Oxygen | Element::Sulfur), 2) => 104.5,
                (Some(Element::Nitrogen), 3) => 107.0,
                (Some(Element::Carbon | Element::Boron), 3) => 120.0,
                _ => 109.47,
            };
            for (k, &a) in neighbors.iter().enumerate() {
                for &c in &neighbors[k + 1..] {
                    ff = ff.with_angle(a, b, c, ANGLE_FORCE, theta0);
                }
            }
        }

        for bond in topology.bonds() {
            let (b, c) = (bond.atom1_idx, bond.atom2_idx);
            for &a in topology.neighbors(b).iter().filter(|&&a| a != c) {
                for &d in topology.neighbors(c).iter().filter(|&&d| d != b && d != a) {
                    ff = ff.with_torsion(a, b, c, d, TORSION_BARRIER, 3);
                }
            }
        }
        ff
    }

    /// Add a Morse bond between atoms `i` and `j`
    pub fn with_bond(mut self, i: usize, j: usize, params: MorseParams) -> Self {
        self.bonds.push(BondTerm {
            coordinate: Primitive::Distance { a: i, b: j },
            params,
        });
        self
    }

    /// Add a harmonic angle a-b-c; `theta0` in degrees
    pub fn with_angle(mut self, a: usize, b: usize, c: usize, force: f64, theta0: f64) -> Self {
        self.angles.push(AngleTerm {
            coordinate: Primitive::Angle { a, b, c },
            force,
            theta0: theta0.to_radians(),
        });
        self
    }

    /// Add a cosine torsion `V/2 (1 + cos nφ)` over a-b-c-d
    pub fn with_torsion(
        mut self,
        a: usize,
        b: usize,
        c: usize,
        d: usize,
        barrier: f64,
        periodicity: u32,
    ) -> Self {
        self.torsions.push(TorsionTerm {
            coordinate: Primitive::Dihedral { a, b, c, d },
            barrier,
            periodicity: periodicity as f64,
        });
        self
    }

    /// Number of terms
    pub fn num_terms(&self) -> usize {
        self.bonds.len() + self.angles.len() + self.torsions.len()
    }

    fn check_atoms(&self, geometry: &Geometry) -> Result<(), EvaluatorError> {
        let n = geometry.num_atoms();
        let all_atoms = self
            .bonds
            .iter()
            .map(|t| &t.coordinate)
            .chain(self.angles.iter().map(|t| &t.coordinate))
            .chain(self.torsions.iter().map(|t| &t.coordinate))
            .flat_map(|p| p.key().atoms());
        if let Some(bad) = all_atoms.into_iter().find(|&a| a >= n) {
            return Err(EvaluatorError::Failed(format!(
                "force field term refers to atom {} but the geometry has {} atoms",
                bad + 1,
                n
            )));
        }
        Ok(())
    }

    fn compute(&self, geometry: &Geometry, with_gradient: bool) -> (f64, DVector<f64>) {
        let x = &geometry.coords;
        let mut energy = 0.0;
        let mut gradient = DVector::zeros(x.len());
        let mut accumulate = |coordinate: &Primitive, slope: f64| {
            if with_gradient {
                for (atom, d) in coordinate.derivatives(x) {
                    for k in 0..3 {
                        gradient[3 * atom + k] += slope * d[k];
                    }
                }
            }
        };

        for term in &self.bonds {
            let (e, slope) = term.params.energy_and_slope(term.coordinate.value(x));
            energy += e;
            accumulate(&term.coordinate, slope);
        }
        for term in &self.angles {
            let delta = term.coordinate.value(x) - term.theta0;
            energy += 0.5 * term.force * delta * delta;
            accumulate(&term.coordinate, term.force * delta);
        }
        for term in &self.torsions {
            let phi = term.coordinate.value(x);
            let n = term.periodicity;
            energy += 0.5 * term.barrier * (1.0 + (n * phi).cos());
            accumulate(&term.coordinate, -0.5 * term.barrier * n * (n * phi).sin());
        }
        (energy, gradient)
    }
}

impl Evaluator for ValenceForceField {
    fn name(&self) -> &str {
        "valence"
    }

    fn evaluate(&self, geometry: &Geometry) -> Result<Evaluation, EvaluatorError> {
        self.check_atoms(geometry)?;
        let (energy, gradient) = self.compute(geometry, true);
        Ok(Evaluation { energy, gradient })
    }
}

impl EnergyFunction for ValenceForceField {
    fn name(&self) -> &str {
        "valence"
    }

    fn energy(&self, geometry: &Geometry) -> Result<f64, EvaluatorError> {
        self.check_atoms(geometry)?;
        Ok(self.compute(geometry, false).0)
    }
}
