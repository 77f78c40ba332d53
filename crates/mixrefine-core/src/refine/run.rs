use super::context::RefinementContext;
use super::step::{ContextStep, RefinementStep};
use crate::domain::{RefineError, RefineResult, SolutionVector};
use crate::history::{HistoryScope, RefineHistory, read_history};
use crate::optimizer::{OptimizerError, OptimizerOptions};
use crate::project::RefinableMixture;
use crate::status::{CancelFlag, RefineStatus};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RefinementRunConfig {
    /// Upper bound on step calls per run.
    pub max_steps: usize,
    /// Stop once a step improves the residual by no more than this fraction.
    pub convergence_tolerance: f64,
    pub apply_best: bool,
    pub optimizer: OptimizerOptions,
}

impl Default for RefinementRunConfig {
    fn default() -> Self {
        Self {
            max_steps: 10,
            convergence_tolerance: 1.0e-6,
            apply_best: true,
            optimizer: OptimizerOptions::default(),
        }
    }
}

impl RefinementRunConfig {
    pub fn from_json_str(source: &str) -> Result<Self, RunConfigError> {
        let config: Self =
            serde_json::from_str(source).map_err(|source| RunConfigError::Parse { source })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), RunConfigError> {
        if self.max_steps == 0 {
            return Err(RunConfigError::InvalidSetting {
                reason: "max_steps must be at least 1",
            });
        }
        if !self.convergence_tolerance.is_finite() || self.convergence_tolerance < 0.0 {
            return Err(RunConfigError::InvalidSetting {
                reason: "convergence_tolerance must be finite and non-negative",
            });
        }
        self.optimizer.validate()?;
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RunConfigError {
    #[error("invalid refinement setting: {reason}")]
    InvalidSetting { reason: &'static str },
    #[error("failed to parse refinement settings: {source}")]
    Parse { source: serde_json::Error },
    #[error(transparent)]
    Optimizer(#[from] OptimizerError),
}

impl From<RunConfigError> for RefineError {
    fn from(error: RunConfigError) -> Self {
        match error {
            RunConfigError::Optimizer(source) => source.into(),
            other => RefineError::invalid_state("REFINE.CONFIG", other.to_string()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum StopReason {
    Converged,
    StepLimit,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RefinementOutcome {
    pub best_solution: SolutionVector,
    pub best_residual: f64,
    pub initial_residual: f64,
    pub steps: usize,
    pub stop_reason: StopReason,
}

/// Drives `step` from the initial solution until it converges, exhausts the step
/// budget, is cancelled through the status' flag or fails. Every returned pair is
/// recorded in the status' history, which is closed when the run ends. A cancelled
/// run leaves the step's own state alone and does not apply the best solution.
pub fn run_refinement<S: RefinementStep + ?Sized>(
    step: &mut S,
    initial_solution: &[f64],
    initial_residual: f64,
    config: &RefinementRunConfig,
    status: &RefineStatus,
) -> RefineResult<RefinementOutcome> {
    config.validate()?;
    status.run(|| {
        let history = HistoryScope::open(status.history())?;
        history.set_initial_solution(initial_solution, initial_residual)?;

        let mut current = initial_solution.to_vec();
        let mut current_residual = initial_residual;
        let mut steps = 0;
        let mut stop_reason = StopReason::StepLimit;
        for iteration in (0_i64..).take(config.max_steps) {
            if status.cancel_flag().is_some_and(CancelFlag::is_cancelled) {
                tracing::info!(iteration, "refinement cancelled between steps");
                stop_reason = StopReason::Cancelled;
                break;
            }

            let outcome = step.improve(&current, current_residual)?;
            steps += 1;
            history.register_solution(iteration, &outcome.solution, outcome.residual)?;

            let improvement = current_residual - outcome.residual;
            tracing::info!(
                iteration,
                residual = outcome.residual,
                improvement,
                "refinement step registered"
            );
            if outcome.residual <= current_residual {
                current = outcome.solution;
                current_residual = outcome.residual;
            }
            // Cancellation raised during the step outranks convergence and the step budget.
            if status.cancel_flag().is_some_and(CancelFlag::is_cancelled) {
                tracing::info!(iteration, "refinement cancelled during a step");
                stop_reason = StopReason::Cancelled;
                break;
            }
            if improvement <= config.convergence_tolerance * current_residual.abs().max(1.0) {
                stop_reason = StopReason::Converged;
                break;
            }
        }
        drop(history);

        let (best_solution, best_residual) = {
            let history = read_history(status.history());
            let best = history.best_entry().ok_or_else(|| {
                RefineError::invalid_state("HISTORY.EMPTY", "refinement recorded no samples")
            })?;
            (best.solution.clone(), best.residual)
        };
        if config.apply_best && stop_reason != StopReason::Cancelled {
            step.apply_best(&best_solution)?;
        }

        tracing::info!(steps, best_residual, ?stop_reason, "refinement run complete");
        Ok(RefinementOutcome {
            best_solution,
            best_residual,
            initial_residual,
            steps,
            stop_reason,
        })
    })
}

/// Refines a live mixture in place, starting from its current values.
pub fn refine_mixture<M: RefinableMixture>(
    mixture: &mut M,
    config: &RefinementRunConfig,
    status: &RefineStatus,
) -> RefineResult<RefinementOutcome> {
    mixture.rebuild_refinables();
    let context = mixture.refinement_context()?;
    let initial_solution = context.current_solution();
    let initial_residual = context.residual_for_solution(&initial_solution)?;
    let mut step = ContextStep::new(context, config.optimizer.clone());
    run_refinement(&mut step, &initial_solution, initial_residual, config, status)
}

/// Refinement running on a dedicated worker thread.
#[derive(Debug)]
pub struct RefinementHandle<S> {
    status: Arc<RefineStatus>,
    cancel: CancelFlag,
    worker: JoinHandle<(S, RefineResult<RefinementOutcome>)>,
}

impl<S> RefinementHandle<S> {
    pub fn status(&self) -> &Arc<RefineStatus> {
        &self.status
    }

    /// Requests a stop. The worker checks the flag before and after every step.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.worker.is_finished()
    }

    /// Waits for the worker and hands back the step together with the outcome.
    pub fn join(self) -> RefineResult<(RefinementOutcome, S)> {
        let (step, outcome) = self.worker.join().map_err(|_| {
            RefineError::optimizer_failure("REFINE.WORKER_PANIC", "refinement worker panicked")
        })?;
        outcome.map(|outcome| (outcome, step))
    }
}

pub fn spawn_refinement<S>(
    mut step: S,
    initial_solution: SolutionVector,
    initial_residual: f64,
    config: RefinementRunConfig,
) -> RefineResult<RefinementHandle<S>>
where
    S: RefinementStep + Send + 'static,
{
    config.validate()?;
    let cancel = CancelFlag::new();
    let status = Arc::new(RefineStatus::new(
        RefineHistory::new_shared(),
        Some(cancel.clone()),
    ));
    let worker_status = Arc::clone(&status);

    let worker = thread::Builder::new()
        .name("mixrefine-refinement".to_string())
        .spawn(move || {
            let outcome = run_refinement(
                &mut step,
                &initial_solution,
                initial_residual,
                &config,
                &worker_status,
            );
            (step, outcome)
        })
        .map_err(|error| {
            RefineError::invalid_state(
                "REFINE.SPAWN",
                format!("failed to spawn refinement worker: {error}"),
            )
        })?;

    Ok(RefinementHandle {
        status,
        cancel,
        worker,
    })
}
