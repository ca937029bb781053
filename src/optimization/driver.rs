//! Optimization driver

use super::step::{self, Proposal};
use super::trust::{self, ConvergenceStatus};
use super::{
    CancelToken, OptimizationError, OptimizationResult, OptimizationState, OptimizerParams,
    RunFailure, Snapshot, Trajectory,
};
use crate::constraints::bind::{self, BoundConstraint};
use crate::constraints::ConstraintSet;
use crate::coords::CoordinateSystem;
use crate::engine::{Evaluation, Evaluator, EvaluatorError};
use crate::math::{max_atom_norm, rms};
use crate::molecule::{Geometry, MoleculeError, Topology};
use log::{debug, info, warn};

/// Everything a run needs once setup has succeeded
struct Setup {
    system: CoordinateSystem,
    constraints: Vec<BoundConstraint>,
}

/// Constrained geometry optimizer
pub struct Optimizer<'a> {
    evaluator: &'a dyn Evaluator,
    params: OptimizerParams,
    cancel: Option<CancelToken>,
}

impl<'a> Optimizer<'a> {
    /// Create an optimizer with default parameters
    pub fn new(evaluator: &'a dyn Evaluator) -> Self {
        Self::with_params(evaluator, OptimizerParams::default())
    }

    /// Create an optimizer with custom parameters
    pub fn with_params(evaluator: &'a dyn Evaluator, params: OptimizerParams) -> Self {
        Self {
            evaluator,
            params,
            cancel: None,
        }
    }

    /// Stop between iterations once `token` is cancelled
    pub fn with_cancel(mut self, token: CancelToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub fn params(&self) -> &OptimizerParams {
        &self.params
    }

    pub fn evaluator(&self) -> &dyn Evaluator {
        self.evaluator
    }

    fn cancelled(&self) -> bool {
        self.cancel.as_ref().map_or(false, CancelToken::is_cancelled)
    }

    /// Validate inputs and build coordinates without evaluating anything
    pub fn check(
        &self,
        geometry: &Geometry,
        topology: &Topology,
        constraints: &ConstraintSet,
    ) -> Result<(), OptimizationError> {
        self.setup(geometry, topology, constraints).map(|_| ())
    }

    fn setup(
        &self,
        geometry: &Geometry,
        topology: &Topology,
        constraints: &ConstraintSet,
    ) -> Result<Setup, OptimizationError> {
        self.params.validate()?;
        if constraints.has_scan() {
            return Err(OptimizationError::UnexpectedScan);
        }
        if topology.num_atoms() != geometry.num_atoms() {
            return Err(MoleculeError::ShapeMismatch {
                atoms: topology.num_atoms(),
                coords: geometry.coords.len(),
            }
            .into());
        }
        bind::validate_indices(constraints, geometry.num_atoms())?;
        let system = self.build_system(geometry, topology, constraints)?;
        let bound = bind::bind(constraints, &system, geometry)?;
        Ok(Setup {
            system,
            constraints: bound,
        })
    }

    fn build_system(
        &self,
        geometry: &Geometry,
        topology: &Topology,
        constraints: &ConstraintSet,
    ) -> Result<CoordinateSystem, OptimizationError> {
        let required = bind::required_primitives(constraints);
        Ok(CoordinateSystem::build(
            geometry,
            topology,
            self.params.coordsys,
            &required,
            self.params.linear_angle_threshold,
        )?)
    }

    fn evaluate(&self, geometry: &Geometry) -> Result<Evaluation, EvaluatorError> {
        let evaluation = self.evaluator.evaluate(geometry)?;
        evaluation.validate(geometry)?;
        Ok(evaluation)
    }

    /// Optimize `geometry` under `constraints`.
    ///
    /// Setup problems (bad constraints, indices, parameters) are returned as
    /// errors before the evaluator is called. Problems during the run are
    /// reported in the result, together with the trajectory so far.
    pub fn optimize(
        &self,
        geometry: &Geometry,
        topology: &Topology,
        constraints: &ConstraintSet,
    ) -> Result<OptimizationResult, OptimizationError> {
        let Setup {
            mut system,
            constraints: mut bound,
        } = self.setup(geometry, topology, constraints)?;
        info!(
            "Optimizing {} atoms with {} ({} constrained coordinates)",
            geometry.num_atoms(),
            self.evaluator.name(),
            bound.len()
        );

        let mut trajectory = Trajectory::new();
        let finish = |trajectory: Trajectory,
                      failure: Option<RunFailure>,
                      iterations: usize,
                      rebuilds: usize|
         -> Result<OptimizationResult, OptimizationError> {
            match &failure {
                None => info!("Converged after {} iterations", iterations),
                Some(f) => warn!("Optimization stopped: {}", f),
            }
            Ok(OptimizationResult {
                trajectory,
                failure,
                iterations,
                rebuilds,
            })
        };

        let first = match self.evaluate(geometry) {
            Ok(evaluation) => evaluation,
            Err(source) => {
                trajectory.push(Snapshot::failed(geometry.clone()));
                return finish(trajectory, Some(RunFailure::Evaluator { iteration: 0, source }), 0, 0);
            }
        };
        trajectory.push(Snapshot::evaluated(geometry.clone(), &first));
        let mut state = OptimizationState::initial(&system, geometry.clone(), first, self.params.trust);
        let mut retries = 0;
        let mut rebuilds = 0;

        loop {
            if self.cancelled() {
                let iteration = state.iteration;
                return finish(trajectory, Some(RunFailure::Cancelled { iteration }), iteration, rebuilds);
            }

            if rebuilds < self.params.max_rebuilds && system.linearity_changed(&state.geometry) {
                warn!("Angle linearity changed; rebuilding coordinates and resetting the Hessian");
                rebuilds += 1;
                let rebuilt = self
                    .build_system(&state.geometry, topology, constraints)
                    .and_then(|s| Ok((bind::rebind(&bound, &s)?, s)));
                match rebuilt {
                    Ok((rebound, rebuilt)) => {
                        system = rebuilt;
                        bound = rebound;
                        state = state.rebased(&system);
                    }
                    Err(e) => {
                        let failure = RunFailure::StepDegeneracy {
                            iteration: state.iteration,
                            reason: e.to_string(),
                        };
                        return finish(trajectory, Some(failure), state.iteration, rebuilds);
                    }
                }
            }

            let proposal = match step::propose(&state, &system, &bound, &self.params) {
                Ok(proposal) => proposal,
                Err(degeneracy) => {
                    retries += 1;
                    if retries > self.params.max_step_retries || state.trust <= self.params.trust_min {
                        let failure = RunFailure::StepDegeneracy {
                            iteration: state.iteration,
                            reason: degeneracy.to_string(),
                        };
                        return finish(trajectory, Some(failure), state.iteration, rebuilds);
                    }
                    let trust = self.params.trust_min.max(0.5 * state.trust);
                    debug!("{}; retrying with trust radius {:.4}", degeneracy, trust);
                    state = state.with_trust(trust, false);
                    continue;
                }
            };
            retries = 0;

            let energy_change = state
                .last_energy_change
                .unwrap_or(proposal.predicted_change);
            let status = trust::check_convergence(
                energy_change,
                &proposal.projected_gradient,
                &proposal.displacement,
                proposal.constraints_met,
                &self.params.thresholds,
            );
            log_iteration(&state, &proposal, energy_change, &status);
            if status.is_converged() {
                return finish(trajectory, None, state.iteration, rebuilds);
            }
            if state.iteration >= self.params.max_iterations {
                let iterations = state.iteration;
                return finish(trajectory, Some(RunFailure::NonConvergence { iterations }), iterations, rebuilds);
            }

            let iteration = state.iteration + 1;
            let evaluation = match self.evaluate(&proposal.geometry) {
                Ok(evaluation) => evaluation,
                Err(source) => {
                    trajectory.push(Snapshot::failed(proposal.geometry));
                    return finish(trajectory, Some(RunFailure::Evaluator { iteration, source }), iteration, rebuilds);
                }
            };

            let actual = evaluation.energy - state.energy;
            let assessment = trust::assess(
                proposal.predicted_change,
                actual,
                proposal.step_norm,
                state.trust,
                &self.params,
            );
            if !assessment.accept {
                info!(
                    "Rejecting step: dE = {:.3e}, ratio = {:.3}, trust -> {:.4}",
                    actual, assessment.ratio, assessment.trust
                );
                state = state.with_trust(assessment.trust, true);
                continue;
            }

            trajectory.push(Snapshot::evaluated(proposal.geometry.clone(), &evaluation));
            state = state.advance(
                &system,
                proposal.geometry,
                proposal.values,
                evaluation,
                assessment.trust,
            );
        }
    }
}

fn log_iteration(
    state: &OptimizationState,
    proposal: &Proposal,
    energy_change: f64,
    status: &ConvergenceStatus,
) {
    let mark = |ok: bool| if ok { '*' } else { ' ' };
    info!(
        "Step {:4} E = {:.10} dE = {:+.3e}{} Grms = {:.3e}{} Gmax = {:.3e}{} Drms = {:.3e}{} Dmax = {:.3e}{} trust = {:.4}{}",
        state.iteration,
        state.energy,
        energy_change,
        mark(status.energy),
        rms(&proposal.projected_gradient),
        mark(status.grms),
        max_atom_norm(&proposal.projected_gradient),
        mark(status.gmax),
        rms(&proposal.displacement),
        mark(status.drms),
        max_atom_norm(&proposal.displacement),
        mark(status.dmax),
        state.trust,
        if status.constraints {
            String::new()
        } else {
            format!(" constraint deviation {:.3e}", proposal.max_constraint_deviation)
        }
    );
}
