//! Integration tests for the geomopt optimization library

use assert_approx_eq::assert_approx_eq;
use geomopt::constraints::{ConstraintSet, SchemaError};
use geomopt::coords::primitive::dihedral_angle;
use geomopt::engine::valence::MorseParams;
use geomopt::engine::{Evaluator, Unsupported, ValenceForceField};
use geomopt::io::{read_input, run_json, write_output, IoError, OUTPUT_SCHEMA};
use geomopt::math::ANGSTROM_TO_BOHR;
use geomopt::molecule::{Geometry, Topology};
use geomopt::optimization::{run_scan, OptimizationError, Optimizer};
use serde_json::{json, Value};
use std::f64::consts::PI;
use std::path::PathBuf;
use tempfile::tempdir;

/// Get the path to test data directory
fn test_data_dir() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("tests")
        .join("test_data")
}

fn load(name: &str) -> Value {
    read_input(test_data_dir().join(name)).expect("Failed to read test input")
}

fn h2(separation: f64) -> (Geometry, Topology) {
    let geometry = Geometry::new(
        vec!["H".into(), "H".into()],
        vec![0.0, 0.0, -0.5 * separation, 0.0, 0.0, 0.5 * separation],
    )
    .unwrap();
    let topology = Topology::from_bonds(2, [(0, 1, 1.0)]).unwrap();
    (geometry, topology)
}

fn morse_h2() -> ValenceForceField {
    ValenceForceField::new().with_bond(
        0,
        1,
        MorseParams {
            depth: 0.17,
            width: 1.0,
            r0: 1.4,
        },
    )
}

fn water() -> (Geometry, Topology) {
    let geometry = Geometry::new(
        vec!["O".into(), "H".into(), "H".into()],
        vec![
            0.0, 0.0, -0.1294769411935893, 0.0, -1.494187339479985, 1.0274465079245698, 0.0,
            1.494187339479985, 1.0274465079245698,
        ],
    )
    .unwrap();
    let topology = Topology::infer(&geometry).unwrap();
    (geometry, topology)
}

fn bend(geometry: &Geometry, a: usize, b: usize, c: usize) -> f64 {
    let u = geometry.position(a) - geometry.position(b);
    let v = geometry.position(c) - geometry.position(b);
    u.angle(&v)
}

#[test]
fn test_constraint_text_round_trip() {
    let description = json!({
        "freeze": [{"type": "xyz", "indices": [0, 1, 2, 3, 4]}],
        "set": [{"type": "angle", "indices": [1, 0, 4], "value": 110.0}],
        "scan": [
            {"type": "distance", "indices": [1, 0], "start": 1.0, "stop": 1.2, "steps": 3},
            {"type": "dihedral", "indices": [0, 4, 5, 6], "start": 110.0, "stop": 150.0, "steps": 3}
        ]
    });
    let constraints = ConstraintSet::parse(&description).unwrap();
    let text = constraints.render();
    assert_eq!(
        text,
        "$freeze\nxyz 1 2 3 4 5\n$set\nangle 2 1 5 110.0\n$scan\ndistance 2 1 1.0 1.2 3\ndihedral 1 5 6 7 110.0 150.0 3"
    );
    assert_eq!(ConstraintSet::parse_text(&text).unwrap(), constraints);
}

#[test]
fn test_constraint_text_file() {
    let text = std::fs::read_to_string(test_data_dir().join("constraints.txt")).unwrap();
    let constraints = ConstraintSet::parse_text(&text).unwrap();
    assert_eq!(constraints.len(), 2);
    assert_eq!(constraints.render(), "$freeze\nxyz 1\n$set\nangle 2 1 3 110.0");
}

#[test]
fn test_unknown_group_key_is_rejected() {
    let err = ConstraintSet::parse(&json!({"freeze": [], "fix": []})).unwrap_err();
    assert_eq!(err, SchemaError::UnknownKey("fix".into()));
}

#[test]
fn test_tuple_type_scan_is_rejected_before_evaluation() {
    let mut input = json!({
        "initial_molecule": {
            "geometry": [0.0, 0.0, -0.5, 0.0, 0.0, 0.5],
            "symbols": ["H", "H"],
            "connectivity": [[0, 1, 1]]
        },
        "keywords": {"program": "valence"},
        "input_specification": {"model": {"method": "cookiemonster"}}
    });
    input["keywords"]["constraints"] = json!({
        "scan": [{"type": ["bond", [0, 1]], "start": 0.8, "stop": 1.2, "steps": 4}]
    });
    let err = run_json(&input).unwrap_err();
    assert!(matches!(
        err,
        IoError::Constraints(SchemaError::InvalidType { .. })
    ));
}

#[test]
fn test_h2_converges_to_bond_length() {
    let (geometry, topology) = h2(1.0);
    let ff = morse_h2();
    let result = Optimizer::new(&ff)
        .optimize(&geometry, &topology, &ConstraintSet::new())
        .unwrap();
    assert!(result.success(), "{:?}", result.failure);
    assert_approx_eq!(result.final_geometry().unwrap().distance(0, 1), 1.4, 5e-3);
    let last = result.trajectory.last().unwrap();
    assert!(last.success);
    assert!(last.gradient_norm().unwrap() < 4.5e-4);
}

#[test]
fn test_set_distance_costs_energy() {
    let (geometry, topology) = h2(1.0);
    let ff = morse_h2();
    let optimizer = Optimizer::new(&ff);
    let free = optimizer
        .optimize(&geometry, &topology, &ConstraintSet::new())
        .unwrap();
    let constraints = ConstraintSet::parse(&json!({
        "set": [{"type": "distance", "indices": [0, 1], "value": 0.9}]
    }))
    .unwrap();
    let constrained = optimizer.optimize(&geometry, &topology, &constraints).unwrap();
    assert!(constrained.success(), "{:?}", constrained.failure);
    assert_approx_eq!(
        constrained.final_geometry().unwrap().distance(0, 1),
        0.9 * ANGSTROM_TO_BOHR,
        1e-3
    );
    assert!(constrained.final_energy().unwrap() >= free.final_energy().unwrap());
}

#[test]
fn test_water_converges() {
    let (geometry, topology) = water();
    let ff = ValenceForceField::from_topology(&geometry, &topology);
    let result = Optimizer::new(&ff)
        .optimize(&geometry, &topology, &ConstraintSet::new())
        .unwrap();
    assert!(result.success(), "{:?}", result.failure);
    let last = result.final_geometry().unwrap();
    assert_approx_eq!(last.distance(0, 1), last.distance(0, 2), 1e-3);
    assert_approx_eq!(bend(last, 1, 0, 2), 104.5f64.to_radians(), 1e-2);
}

#[test]
fn test_water_with_frozen_oxygen_and_set_angle() {
    let (geometry, topology) = water();
    let text = std::fs::read_to_string(test_data_dir().join("constraints.txt")).unwrap();
    let constraints = ConstraintSet::parse_text(&text).unwrap();
    let ff = ValenceForceField::from_topology(&geometry, &topology);
    let result = Optimizer::new(&ff)
        .optimize(&geometry, &topology, &constraints)
        .unwrap();
    assert!(result.success(), "{:?}", result.failure);
    let last = result.final_geometry().unwrap();
    assert_approx_eq!(bend(last, 1, 0, 2), 110f64.to_radians(), 1e-3);
    for k in 0..3 {
        assert_approx_eq!(last.coords[k], geometry.coords[k], 1e-4);
    }
}

#[test]
fn test_hooh_dihedral_set_to_trans() {
    let output = run_json(&load("hooh.json")).unwrap();
    assert_eq!(output["success"], true, "{}", output["error_message"]);
    let coords: Vec<f64> = serde_json::from_value(output["final_molecule"]["geometry"].clone()).unwrap();
    let last = Geometry::new(vec!["H".into(), "O".into(), "O".into(), "H".into()], coords).unwrap();
    let dihedral = dihedral_angle(
        &last.position(0),
        &last.position(1),
        &last.position(2),
        &last.position(3),
    );
    assert_approx_eq!(dihedral.abs(), PI, 1e-3);
}

#[test]
fn test_failing_evaluator_reports_failure() {
    let (geometry, topology) = h2(1.0);
    let evaluator = Unsupported::new("valence", "cookiemonster");
    assert!(evaluator.evaluate(&geometry).is_err());
    let result = Optimizer::new(&evaluator)
        .optimize(&geometry, &topology, &ConstraintSet::new())
        .unwrap();
    assert!(!result.success());
    assert!(!result.trajectory.is_empty());
    assert!(!result.trajectory.last().unwrap().success);
    assert!(result.error_message().unwrap().contains("evaluator failure"));
}

#[test]
fn test_out_of_range_index_fails_at_setup() {
    let (geometry, topology) = water();
    let ff = ValenceForceField::from_topology(&geometry, &topology);
    let constraints = ConstraintSet::parse(&json!({
        "freeze": [{"type": "angle", "indices": [0, 1, 7]}]
    }))
    .unwrap();
    let err = Optimizer::new(&ff)
        .optimize(&geometry, &topology, &constraints)
        .unwrap_err();
    assert!(matches!(err, OptimizationError::Binding(_)));
}

#[test]
fn test_rerun_from_converged_geometry_stops_immediately() {
    let (geometry, topology) = h2(1.0);
    let ff = morse_h2();
    let optimizer = Optimizer::new(&ff);
    let first = optimizer
        .optimize(&geometry, &topology, &ConstraintSet::new())
        .unwrap();
    let converged = first.final_geometry().unwrap().clone();
    let second = optimizer
        .optimize(&converged, &topology, &ConstraintSet::new())
        .unwrap();
    assert!(second.success());
    assert!(second.iterations <= 1);
    let last = second.final_geometry().unwrap();
    assert_approx_eq!(last.distance(0, 1), converged.distance(0, 1), 1e-3);
}

#[test]
fn test_rerun_is_deterministic() {
    let first = run_json(&load("water.json")).unwrap();
    let second = run_json(&load("water.json")).unwrap();
    assert_eq!(first["energies"], second["energies"]);
    assert_eq!(first["final_molecule"], second["final_molecule"]);
}

#[test]
fn test_scan_chains_points() {
    let (geometry, topology) = h2(1.4);
    let ff = morse_h2();
    let constraints = ConstraintSet::parse(&json!({
        "scan": [{"type": "distance", "indices": [0, 1], "start": 0.6, "stop": 1.0, "steps": 5}]
    }))
    .unwrap();
    let results = run_scan(&Optimizer::new(&ff), &geometry, &topology, &constraints).unwrap();
    let points: Vec<f64> = results.iter().map(|s| s.point[0]).collect();
    assert_eq!(points.len(), 5);
    for (point, expected) in points.iter().zip([0.6, 0.7, 0.8, 0.9, 1.0]) {
        assert_approx_eq!(*point, expected, 1e-12);
    }
    for scan in &results {
        assert!(scan.result.success(), "{:?}", scan.result.failure);
        assert_approx_eq!(
            scan.result.final_geometry().unwrap().distance(0, 1),
            scan.point[0] * ANGSTROM_TO_BOHR,
            1e-3
        );
    }
}

#[test]
fn test_run_json_water_output() {
    let dir = tempdir().unwrap();
    let output = run_json(&load("water.json")).unwrap();
    assert_eq!(output["schema_name"], OUTPUT_SCHEMA);
    assert_eq!(output["success"], true);
    let energies = output["energies"].as_array().unwrap();
    let trajectory = output["trajectory"].as_array().unwrap();
    assert_eq!(energies.len(), trajectory.len());
    assert_eq!(trajectory.last().unwrap()["success"], true);
    assert_eq!(output["final_molecule"]["geometry"].as_array().unwrap().len(), 9);

    let path = dir.path().join("out.json");
    write_output(&path, &output).unwrap();
    let written = read_input(&path).unwrap();
    assert_eq!(written["success"], true);
    assert_eq!(written["final_molecule"]["symbols"], json!(["O", "H", "H"]));
}

#[test]
fn test_run_json_scan_output() {
    let input = json!({
        "initial_molecule": {
            "geometry": [0.0, 0.0, -0.7, 0.0, 0.0, 0.7],
            "symbols": ["H", "H"],
            "connectivity": [[0, 1, 1]]
        },
        "keywords": {
            "constraints": {
                "scan": [{"type": "distance", "indices": [0, 1], "start": 0.7, "stop": 0.9, "steps": 3}]
            }
        }
    });
    let output = run_json(&input).unwrap();
    assert_eq!(output["success"], true);
    let scan = output["scan"].as_array().unwrap();
    assert_eq!(scan.len(), 3);
    assert_eq!(scan[0]["point"], json!([0.7]));
    assert_eq!(output["energies"].as_array().unwrap().len(), 3);
}

#[test]
fn test_run_json_unsupported_method() {
    let mut input = load("water.json");
    input["input_specification"]["model"]["method"] = json!("cookiemonster");
    let output = run_json(&input).unwrap();
    assert_eq!(output["success"], false);
    assert!(output["error_message"]
        .as_str()
        .unwrap()
        .contains("run_json error"));
    let trajectory = output["trajectory"].as_array().unwrap();
    assert_eq!(trajectory.last().unwrap()["success"], false);
}
