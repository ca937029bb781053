//! JSON driver for optimization requests
//!
//! Reads a QCSchema-like optimization input (`initial_molecule`, `keywords`,
//! `input_specification`), runs a single optimization or a scan with a
//! built-in evaluator and returns a QCSchema-like optimization output.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::constraints::{ConstraintSet, SchemaError};
use crate::engine::{self, Evaluator, Timeout};
use crate::molecule::{Geometry, MoleculeError, Topology};
use crate::optimization::{
    run_scan, OptimizationError, OptimizationResult, Optimizer, OptimizerParams, ScanResult,
};

/// Schema name of every output document
pub const OUTPUT_SCHEMA: &str = "qc_schema_optimization_output";

/// Errors that can occur while reading, running or writing a request
#[derive(Error, Debug)]
pub enum IoError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid input document: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid molecule: {0}")]
    Molecule(#[from] MoleculeError),

    #[error("Invalid constraints: {0}")]
    Constraints(#[from] SchemaError),

    #[error(transparent)]
    Optimization(#[from] OptimizationError),

    #[error("Invalid keyword {name}: {message}")]
    Keyword { name: String, message: String },
}

/// Molecule section of the input, coordinates in Bohr
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MoleculeInput {
    pub symbols: Vec<String>,
    pub geometry: Vec<f64>,
    /// `(i, j, order)` triples; inferred from covalent radii when absent
    #[serde(default)]
    pub connectivity: Option<Vec<(usize, usize, f64)>>,
}

/// Optimizer keywords
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Keywords {
    /// Evaluator program
    #[serde(default = "default_program")]
    pub program: String,

    /// Constraint description, either JSON groups or the text block format
    #[serde(default)]
    pub constraints: Option<Value>,

    /// Wall-clock limit per evaluation, in seconds
    #[serde(default)]
    pub timeout: Option<f64>,

    #[serde(flatten)]
    pub params: OptimizerParams,
}

fn default_program() -> String {
    engine::DEFAULT_PROGRAM.to_string()
}

impl Default for Keywords {
    fn default() -> Self {
        Self {
            program: default_program(),
            constraints: None,
            timeout: None,
            params: OptimizerParams::default(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct Model {
    #[serde(default)]
    pub method: String,
    #[serde(default)]
    pub basis: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct InputSpecification {
    #[serde(default)]
    pub model: Model,
}

/// A complete optimization request
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct OptimizationInput {
    #[serde(default)]
    pub schema_name: Option<String>,
    pub initial_molecule: MoleculeInput,
    #[serde(default)]
    pub keywords: Keywords,
    #[serde(default)]
    pub input_specification: InputSpecification,
}

impl OptimizationInput {
    pub fn geometry(&self) -> Result<Geometry, MoleculeError> {
        Geometry::new(
            self.initial_molecule.symbols.clone(),
            self.initial_molecule.geometry.clone(),
        )
    }

    /// Given connectivity, or bonds inferred from the geometry
    pub fn topology(&self, geometry: &Geometry) -> Result<Topology, MoleculeError> {
        match &self.initial_molecule.connectivity {
            Some(bonds) => Topology::from_bonds(geometry.num_atoms(), bonds.iter().copied()),
            None => Topology::infer(geometry),
        }
    }

    /// Parsed constraint description; a string is read as the text block format
    pub fn constraints(&self) -> Result<ConstraintSet, SchemaError> {
        match &self.keywords.constraints {
            None => Ok(ConstraintSet::new()),
            Some(Value::String(text)) => ConstraintSet::parse_text(text),
            Some(value) => ConstraintSet::parse(value),
        }
    }

    /// Built-in evaluator selected by the keywords and model
    pub fn evaluator(
        &self,
        geometry: &Geometry,
        topology: &Topology,
    ) -> Result<Arc<dyn Evaluator>, IoError> {
        let evaluator = engine::from_model(
            &self.keywords.program,
            &self.input_specification.model.method,
            geometry,
            topology,
        );
        match self.keywords.timeout {
            None => Ok(evaluator),
            Some(seconds) if seconds.is_finite() && seconds > 0.0 => Ok(Arc::new(
                Timeout::shared(evaluator, Duration::from_secs_f64(seconds)),
            )),
            Some(seconds) => Err(IoError::Keyword {
                name: "timeout".into(),
                message: format!("must be a positive number of seconds, got {}", seconds),
            }),
        }
    }
}

/// Read an input document from a file
pub fn read_input<P: AsRef<Path>>(path: P) -> Result<Value, IoError> {
    let file = File::open(path.as_ref())?;
    Ok(serde_json::from_reader(BufReader::new(file))?)
}

/// Write an output document to a file
pub fn write_output<P: AsRef<Path>>(path: P, output: &Value) -> Result<(), IoError> {
    let file = File::create(path.as_ref())?;
    let mut writer = BufWriter::new(file);
    serde_json::to_writer_pretty(&mut writer, output)?;
    writeln!(writer)?;
    writer.flush()?;
    Ok(())
}

/// Run an optimization request and build the output document.
///
/// Problems with the request itself (malformed document, bad constraints,
/// out-of-range indices) are returned as errors before any evaluation.
/// Failures during the run are reported in the output with
/// `success: false` and an `error_message`.
pub fn run_json(input: &Value) -> Result<Value, IoError> {
    let input: OptimizationInput = serde_json::from_value(input.clone())?;
    let geometry = input.geometry()?;
    let topology = input.topology(&geometry)?;
    let constraints = input.constraints()?;
    let evaluator = input.evaluator(&geometry, &topology)?;
    let optimizer = Optimizer::with_params(evaluator.as_ref(), input.keywords.params.clone());

    if constraints.has_scan() {
        let results = run_scan(&optimizer, &geometry, &topology, &constraints)?;
        Ok(scan_output(&geometry, &constraints, &results))
    } else {
        let result = optimizer.optimize(&geometry, &topology, &constraints)?;
        let mut output = result_output(&geometry, &result);
        output["schema_name"] = json!(OUTPUT_SCHEMA);
        output["provenance"] = provenance();
        output["keywords"] = json!({ "constraints": constraints.to_value() });
        Ok(output)
    }
}

fn provenance() -> Value {
    json!({ "creator": "geomopt", "version": crate::VERSION })
}

fn molecule_value(geometry: &Geometry) -> Value {
    json!({
        "symbols": geometry.symbols,
        "geometry": geometry.coords.as_slice(),
    })
}

/// Output fields of a single optimization
fn result_output(initial: &Geometry, result: &OptimizationResult) -> Value {
    let trajectory: Vec<Value> = result
        .trajectory
        .snapshots()
        .iter()
        .map(|s| {
            json!({
                "molecule": molecule_value(&s.geometry),
                "energy": s.energy,
                "gradient_norm": s.gradient_norm(),
                "success": s.success,
            })
        })
        .collect();
    let final_molecule = if result.success() {
        result.final_geometry()
    } else {
        result.best_geometry()
    }
    .unwrap_or(initial);
    json!({
        "success": result.success(),
        "error_message": result.error_message().map(|m| format!("run_json error: {}", m)),
        "iterations": result.iterations,
        "energies": result.trajectory.energies(),
        "trajectory": trajectory,
        "final_molecule": molecule_value(final_molecule),
    })
}

fn scan_output(initial: &Geometry, constraints: &ConstraintSet, results: &[ScanResult]) -> Value {
    let points: Vec<Value> = results
        .iter()
        .map(|scan| {
            let mut point = result_output(initial, &scan.result);
            point["point"] = json!(scan.point);
            point
        })
        .collect();
    let failed = results.iter().filter(|s| !s.result.success()).count();
    json!({
        "schema_name": OUTPUT_SCHEMA,
        "provenance": provenance(),
        "success": failed == 0,
        "error_message": (failed > 0).then(|| format!("{} of {} scan points failed", failed, results.len())),
        "keywords": { "constraints": constraints.to_value() },
        "energies": results.iter().map(|s| s.result.final_energy()).collect::<Vec<_>>(),
        "scan": points,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn h2_input(method: &str) -> Value {
        json!({
            "schema_name": "qc_schema_optimization_input",
            "initial_molecule": {
                "geometry": [0.0, 0.0, -0.7, 0.0, 0.0, 0.7],
                "symbols": ["H", "H"],
                "connectivity": [[0, 1, 1]]
            },
            "keywords": {"coordsys": "tric", "maxiter": 100, "program": "valence"},
            "input_specification": {"model": {"method": method}}
        })
    }

    #[test]
    fn test_keywords_flatten_params() {
        let mut raw = h2_input("");
        raw["keywords"]["tmax"] = json!(0.2);
        raw["keywords"]["convergence"] = json!({"gmax": 1e-5});
        raw["keywords"]["timeout"] = json!(30);
        let input: OptimizationInput = serde_json::from_value(raw).unwrap();
        assert_eq!(input.keywords.program, "valence");
        assert_eq!(input.keywords.params.max_iterations, 100);
        assert_eq!(input.keywords.params.trust_max, 0.2);
        assert_eq!(input.keywords.params.thresholds.gmax, 1e-5);
        assert_eq!(input.keywords.params.thresholds.grms, 3e-4);
        assert_eq!(input.keywords.timeout, Some(30.0));
    }

    #[test]
    fn test_missing_keywords_use_defaults() {
        let input: OptimizationInput = serde_json::from_value(json!({
            "initial_molecule": {"geometry": [0.0, 0.0, 0.0, 0.0, 0.0, 1.3], "symbols": ["H", "H"]}
        }))
        .unwrap();
        assert_eq!(input.keywords, Keywords::default());
        let geometry = input.geometry().unwrap();
        assert_eq!(input.topology(&geometry).unwrap().bonds().len(), 1);
        assert!(input.constraints().unwrap().is_empty());
    }

    #[test]
    fn test_text_constraints_are_accepted() {
        let mut raw = h2_input("");
        raw["keywords"]["constraints"] = json!("$freeze\ndistance 1 2\n");
        let input: OptimizationInput = serde_json::from_value(raw).unwrap();
        assert_eq!(input.constraints().unwrap().len(), 1);
    }

    #[test]
    fn test_run_json_h2() {
        let output = run_json(&h2_input("")).unwrap();
        assert_eq!(output["schema_name"], OUTPUT_SCHEMA);
        assert_eq!(output["success"], true);
        assert!(output["error_message"].is_null());
        let trajectory = output["trajectory"].as_array().unwrap();
        assert_eq!(trajectory.len(), output["energies"].as_array().unwrap().len());
        assert_eq!(trajectory.last().unwrap()["success"], true);
        assert_eq!(output["final_molecule"]["symbols"], json!(["H", "H"]));
    }

    #[test]
    fn test_run_json_unknown_method_fails_in_output() {
        let output = run_json(&h2_input("cookiemonster")).unwrap();
        assert_eq!(output["success"], false);
        let message = output["error_message"].as_str().unwrap();
        assert!(message.contains("run_json error"));
        assert!(message.contains("cookiemonster"));
        let trajectory = output["trajectory"].as_array().unwrap();
        assert_eq!(trajectory.last().unwrap()["success"], false);
    }

    #[test]
    fn test_run_json_rejects_bad_timeout() {
        let mut raw = h2_input("");
        raw["keywords"]["timeout"] = json!(-1.0);
        assert!(matches!(run_json(&raw), Err(IoError::Keyword { .. })));
    }

    #[test]
    fn test_read_and_write_files() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("in.json");
        std::fs::write(&path, h2_input("").to_string()).unwrap();
        let input = read_input(&path).unwrap();
        assert_eq!(input, h2_input(""));

        let out = dir.path().join("out.json");
        write_output(&out, &json!({"success": true})).unwrap();
        let written: Value = serde_json::from_str(&std::fs::read_to_string(&out).unwrap()).unwrap();
        assert_eq!(written["success"], true);
        assert!(read_input(dir.path().join("missing.json")).is_err());
    }
}
