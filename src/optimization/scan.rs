//! Constrained scans: one optimization per grid point, chained

use super::{OptimizationError, OptimizationResult, Optimizer};
use crate::constraints::bind::scan_points;
use crate::constraints::ConstraintSet;
use crate::molecule::{Geometry, Topology};
use log::info;

/// Result of one scan point
#[derive(Debug, Clone, PartialEq)]
pub struct ScanResult {
    /// Scan values in description units (Angstroms, degrees), one per scan record
    pub point: Vec<f64>,
    pub result: OptimizationResult,
}

/// Optimize at every point of the scan grid.
///
/// Points are visited with the first scan record varying slowest. Each run
/// starts from the final geometry of the last converged point. Every
/// point is checked before the first evaluation, so a bad description never
/// reaches the evaluator. Without scan records this is a single optimization.
pub fn run_scan(
    optimizer: &Optimizer<'_>,
    geometry: &Geometry,
    topology: &Topology,
    constraints: &ConstraintSet,
) -> Result<Vec<ScanResult>, OptimizationError> {
    let points = scan_points(constraints);
    let point_constraints: Vec<(Vec<f64>, ConstraintSet)> = points
        .into_iter()
        .map(|point| {
            let fixed = constraints.with_scan_point(&point);
            (point, fixed)
        })
        .collect();
    for (_, fixed) in &point_constraints {
        optimizer.check(geometry, topology, fixed)?;
    }

    let total = point_constraints.len();
    let mut results = Vec::with_capacity(total);
    let mut start = geometry.clone();
    for (n, (point, fixed)) in point_constraints.into_iter().enumerate() {
        info!("Scan point {}/{}: {:?}", n + 1, total, point);
        let result = optimizer.optimize(&start, topology, &fixed)?;
        if result.success() {
            if let Some(last) = result.final_geometry() {
                start = last.clone();
            }
        }
        results.push(ScanResult { point, result });
    }
    Ok(results)
}
