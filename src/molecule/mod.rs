//! Molecular geometry and bonding topology

use crate::atom::{Element, ElementError};
use crate::math::{atom_vector, ANGSTROM_TO_BOHR, BOHR_TO_ANGSTROM};
use nalgebra::{DVector, Vector3};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Bonds are inferred when the distance is below this multiple of the summed covalent radii
const BOND_SCALE: f64 = 1.2;

/// Errors that can occur when working with molecules
#[derive(Error, Debug, Clone, PartialEq)]
pub enum MoleculeError {
    #[error("Coordinate count {coords} does not match {atoms} atoms")]
    ShapeMismatch { atoms: usize, coords: usize },

    #[error("Invalid bond: atoms {0} and {1} not found")]
    InvalidBond(usize, usize),

    #[error("Invalid bond: atom {0} bonded to itself")]
    SelfBond(usize),

    #[error("Invalid atom index: {0}")]
    InvalidAtomIndex(usize),

    #[error("No atoms in molecule")]
    EmptyMolecule,

    #[error("Non-finite coordinate for atom {0}")]
    NonFinite(usize),

    #[error(transparent)]
    Element(#[from] ElementError),
}

/// Cartesian geometry of a molecule.
///
/// Coordinates are stored flat as `[x1, y1, z1, x2, ...]` in Bohr.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Geometry {
    /// Element symbols, one per atom
    pub symbols: Vec<String>,

    /// Flattened Cartesian coordinates in Bohr
    pub coords: DVector<f64>,
}

impl Geometry {
    /// Create a geometry from symbols and flat Bohr coordinates
    pub fn new(symbols: Vec<String>, coords: Vec<f64>) -> Result<Self, MoleculeError> {
        if symbols.is_empty() {
            return Err(MoleculeError::EmptyMolecule);
        }
        if coords.len() != symbols.len() * 3 {
            return Err(MoleculeError::ShapeMismatch {
                atoms: symbols.len(),
                coords: coords.len(),
            });
        }
        if let Some(bad) = coords.iter().position(|c| !c.is_finite()) {
            return Err(MoleculeError::NonFinite(bad / 3));
        }
        Ok(Self {
            symbols,
            coords: DVector::from_vec(coords),
        })
    }

    /// Create a geometry from flat coordinates given in Angstroms
    pub fn from_angstrom(symbols: Vec<String>, coords: Vec<f64>) -> Result<Self, MoleculeError> {
        let bohr = coords.into_iter().map(|c| c * ANGSTROM_TO_BOHR).collect();
        Self::new(symbols, bohr)
    }

    /// Same atoms at new coordinates
    pub fn with_coords(&self, coords: DVector<f64>) -> Self {
        debug_assert_eq!(coords.len(), self.coords.len());
        Self {
            symbols: self.symbols.clone(),
            coords,
        }
    }

    /// Number of atoms
    pub fn num_atoms(&self) -> usize {
        self.symbols.len()
    }

    /// Position of atom `i` in Bohr
    pub fn position(&self, i: usize) -> Vector3<f64> {
        atom_vector(&self.coords, i)
    }

    /// Distance between two atoms in Bohr
    pub fn distance(&self, i: usize, j: usize) -> f64 {
        (self.position(i) - self.position(j)).norm()
    }

    /// Flat coordinates in Angstroms
    pub fn to_angstrom(&self) -> Vec<f64> {
        self.coords.iter().map(|c| c * BOHR_TO_ANGSTROM).collect()
    }

    /// Parse every symbol into an element
    pub fn elements(&self) -> Result<Vec<Element>, MoleculeError> {
        self.symbols
            .iter()
            .map(|s| Element::from_symbol(s).map_err(MoleculeError::from))
            .collect()
    }
}

/// A bond between two atoms; the order only records connectivity
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bond {
    /// Index of the first atom
    pub atom1_idx: usize,

    /// Index of the second atom
    pub atom2_idx: usize,

    /// Bond order as given by the caller
    pub order: f64,
}

/// Bonding topology of a molecule
#[derive(Debug, Clone, PartialEq)]
pub struct Topology {
    num_atoms: usize,
    bonds: Vec<Bond>,
    neighbors: Vec<Vec<usize>>,
}

impl Topology {
    /// Create a topology without bonds
    pub fn new(num_atoms: usize) -> Self {
        Self {
            num_atoms,
            bonds: Vec::new(),
            neighbors: vec![Vec::new(); num_atoms],
        }
    }

    /// Build a topology from `(i, j, order)` triples
    pub fn from_bonds(
        num_atoms: usize,
        bonds: impl IntoIterator<Item = (usize, usize, f64)>,
    ) -> Result<Self, MoleculeError> {
        let mut topology = Self::new(num_atoms);
        for (i, j, order) in bonds {
            topology.add_bond(i, j, order)?;
        }
        Ok(topology)
    }

    /// Infer bonds from covalent radii
    pub fn infer(geometry: &Geometry) -> Result<Self, MoleculeError> {
        let elements = geometry.elements()?;
        let n = geometry.num_atoms();
        let mut topology = Self::new(n);
        for i in 0..n {
            for j in (i + 1)..n {
                let cutoff = BOND_SCALE
                    * (elements[i].covalent_radius() + elements[j].covalent_radius())
                    * ANGSTROM_TO_BOHR;
                if geometry.distance(i, j) < cutoff {
                    topology.add_bond(i, j, 1.0)?;
                }
            }
        }
        Ok(topology)
    }

    /// Add a bond; duplicates are ignored
    pub fn add_bond(&mut self, i: usize, j: usize, order: f64) -> Result<(), MoleculeError> {
        if i >= self.num_atoms || j >= self.num_atoms {
            return Err(MoleculeError::InvalidBond(i, j));
        }
        if i == j {
            return Err(MoleculeError::SelfBond(i));
        }
        if self.is_bonded(i, j) {
            return Ok(());
        }
        let (a, b) = if i < j { (i, j) } else { (j, i) };
        self.bonds.push(Bond {
            atom1_idx: a,
            atom2_idx: b,
            order,
        });
        self.neighbors[a].push(b);
        self.neighbors[b].push(a);
        self.neighbors[a].sort_unstable();
        self.neighbors[b].sort_unstable();
        Ok(())
    }

    /// Number of atoms
    pub fn num_atoms(&self) -> usize {
        self.num_atoms
    }

    /// Bonds in insertion order, each stored with `atom1_idx < atom2_idx`
    pub fn bonds(&self) -> &[Bond] {
        &self.bonds
    }

    /// Sorted neighbour list of atom `i`
    pub fn neighbors(&self, i: usize) -> &[usize] {
        &self.neighbors[i]
    }

    /// Are atoms `i` and `j` bonded?
    pub fn is_bonded(&self, i: usize, j: usize) -> bool {
        self.neighbors
            .get(i)
            .map_or(false, |list| list.binary_search(&j).is_ok())
    }

    /// Connected components, each sorted, ordered by their lowest atom index
    pub fn fragments(&self) -> Vec<Vec<usize>> {
        let mut seen = vec![false; self.num_atoms];
        let mut fragments = Vec::new();
        for start in 0..self.num_atoms {
            if seen[start] {
                continue;
            }
            let mut stack = vec![start];
            let mut fragment = Vec::new();
            seen[start] = true;
            while let Some(atom) = stack.pop() {
                fragment.push(atom);
                for &next in &self.neighbors[atom] {
                    if !seen[next] {
                        seen[next] = true;
                        stack.push(next);
                    }
                }
            }
            fragment.sort_unstable();
            fragments.push(fragment);
        }
        fragments
    }
}
