//! Binding constraint records to primitives of a coordinate system

use super::{ConstraintKind, ConstraintRecord, ConstraintSet, Policy, RecordRef};
use crate::coords::{CoordinateSystem, PrimitiveKey};
use crate::math::{wrap_angle, ANGSTROM_TO_BOHR, BOHR_TO_ANGSTROM};
use crate::molecule::Geometry;
use std::collections::HashSet;
use thiserror::Error;

/// Errors raised while matching constraints against a molecule
#[derive(Error, Debug, Clone, PartialEq)]
pub enum BindingError {
    #[error("{record}: atom index {index} out of range for {num_atoms} atoms")]
    IndexOutOfRange {
        record: RecordRef,
        index: usize,
        num_atoms: usize,
    },

    #[error("{record}: atom index {index} appears more than once")]
    RepeatedIndex { record: RecordRef, index: usize },

    #[error("{record}: coordinate {coordinate} is missing from the coordinate system")]
    MissingCoordinate { record: RecordRef, coordinate: String },

    #[error("{record}: coordinate {coordinate} is already constrained by an earlier record")]
    DuplicateCoordinate { record: RecordRef, coordinate: String },
}

/// Whether a bound target came from a freeze or a set record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetKind {
    Frozen,
    Set,
}

/// A constraint attached to one primitive, with its target in internal units
#[derive(Debug, Clone, PartialEq)]
pub struct BoundConstraint {
    pub record: RecordRef,
    pub key: PrimitiveKey,
    /// Position of the primitive in the coordinate system
    pub primitive: usize,
    /// Target value in Bohr or radians
    pub target: f64,
    pub kind: TargetKind,
}

/// Check every record's atom indices against the molecule size
pub fn validate_indices(constraints: &ConstraintSet, num_atoms: usize) -> Result<(), BindingError> {
    for (record_ref, record) in constraints.records() {
        let mut seen = HashSet::new();
        for &index in &record.indices {
            if index >= num_atoms {
                return Err(BindingError::IndexOutOfRange {
                    record: record_ref,
                    index,
                    num_atoms,
                });
            }
            if !seen.insert(index) {
                return Err(BindingError::RepeatedIndex {
                    record: record_ref,
                    index,
                });
            }
        }
    }
    Ok(())
}

/// Primitives a record acts on
pub fn record_keys(record: &ConstraintRecord) -> Vec<PrimitiveKey> {
    let i = &record.indices;
    match record.kind {
        ConstraintKind::Xyz => i
            .iter()
            .flat_map(|&atom| (0..3).map(move |axis| PrimitiveKey::Cartesian(atom, axis)))
            .collect(),
        ConstraintKind::Distance => vec![PrimitiveKey::distance(i[0], i[1])],
        ConstraintKind::Angle => vec![PrimitiveKey::angle(i[0], i[1], i[2])],
        ConstraintKind::Dihedral => vec![PrimitiveKey::dihedral(i[0], i[1], i[2], i[3])],
        ConstraintKind::Translation => (0..3).map(|axis| PrimitiveKey::translation(i, axis)).collect(),
        ConstraintKind::Rotation => (0..3).map(|axis| PrimitiveKey::rotation(i, axis)).collect(),
    }
}

/// Primitives every record needs, scan records included, without duplicates
pub fn required_primitives(constraints: &ConstraintSet) -> Vec<PrimitiveKey> {
    let mut seen = HashSet::new();
    constraints
        .records()
        .flat_map(|(_, record)| record_keys(record))
        .filter(|key| seen.insert(key.clone()))
        .collect()
}

/// Convert a description value (Angstroms or degrees) to Bohr or radians
pub fn to_internal(kind: ConstraintKind, value: f64) -> f64 {
    match kind {
        ConstraintKind::Distance => value * ANGSTROM_TO_BOHR,
        ConstraintKind::Angle => value.to_radians(),
        ConstraintKind::Dihedral => wrap_angle(value.to_radians()),
        _ => value,
    }
}

/// Convert an internal value back to Angstroms or degrees
pub fn to_external(kind: ConstraintKind, value: f64) -> f64 {
    match kind {
        ConstraintKind::Distance => value * BOHR_TO_ANGSTROM,
        ConstraintKind::Angle | ConstraintKind::Dihedral => value.to_degrees(),
        _ => value,
    }
}

/// Bind freeze and set records to primitives of `system`.
///
/// Frozen targets take their values from `geometry`. Scan records are
/// skipped; bind a set produced by [`ConstraintSet::with_scan_point`] instead.
pub fn bind(
    constraints: &ConstraintSet,
    system: &CoordinateSystem,
    geometry: &Geometry,
) -> Result<Vec<BoundConstraint>, BindingError> {
    validate_indices(constraints, geometry.num_atoms())?;

    let mut seen = HashSet::new();
    let mut bound = Vec::new();
    for (record_ref, record) in constraints.records() {
        let kind = match record.policy {
            Policy::Freeze => TargetKind::Frozen,
            Policy::Set { .. } => TargetKind::Set,
            Policy::Scan { .. } => continue,
        };
        for key in record_keys(record) {
            let primitive = system
                .index_of(&key)
                .ok_or_else(|| BindingError::MissingCoordinate {
                    record: record_ref,
                    coordinate: format!("{:?}", key),
                })?;
            if !seen.insert(key.clone()) {
                return Err(BindingError::DuplicateCoordinate {
                    record: record_ref,
                    coordinate: system.primitives()[primitive].to_string(),
                });
            }
            let target = match record.policy {
                Policy::Set { value } => to_internal(record.kind, value.value()),
                _ => system.primitives()[primitive].value(&geometry.coords),
            };
            bound.push(BoundConstraint {
                record: record_ref,
                key,
                primitive,
                target,
                kind,
            });
        }
    }
    Ok(bound)
}

/// Re-attach bound constraints to a rebuilt coordinate system, keeping their targets
pub fn rebind(
    bound: &[BoundConstraint],
    system: &CoordinateSystem,
) -> Result<Vec<BoundConstraint>, BindingError> {
    bound
        .iter()
        .map(|c| {
            let primitive = system
                .index_of(&c.key)
                .ok_or_else(|| BindingError::MissingCoordinate {
                    record: c.record,
                    coordinate: format!("{:?}", c.key),
                })?;
            Ok(BoundConstraint {
                primitive,
                ..c.clone()
            })
        })
        .collect()
}

/// Evenly spaced values from `start` to `stop` inclusive
pub fn scan_values(start: f64, stop: f64, steps: usize) -> Vec<f64> {
    match steps {
        0 => Vec::new(),
        1 => vec![start],
        _ => {
            let step = (stop - start) / (steps - 1) as f64;
            (0..steps).map(|i| start + step * i as f64).collect()
        }
    }
}

/// Every combination of scan values; the first scan record varies slowest
pub fn scan_points(constraints: &ConstraintSet) -> Vec<Vec<f64>> {
    let mut points: Vec<Vec<f64>> = vec![Vec::new()];
    for record in constraints.group(super::Group::Scan) {
        let values = match record.policy {
            Policy::Scan { start, stop, steps } => {
                scan_values(start.value(), stop.value(), steps)
            }
            _ => continue,
        };
        points = points
            .into_iter()
            .flat_map(|prefix| {
                values.iter().map(move |&v| {
                    let mut point = prefix.clone();
                    point.push(v);
                    point
                })
            })
            .collect();
    }
    points
}
