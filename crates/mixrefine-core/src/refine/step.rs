use super::context::{RefinementContext, check_solution_shape};
use crate::domain::{RefineError, RefineResult, SolutionVector};
use crate::optimizer::{OptimizerInfo, OptimizerOptions, minimize_bounded};
use crate::project::{DecodeContext, Project, ProjectLoader, RefinableMixture};
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StepOutcome {
    pub solution: SolutionVector,
    pub residual: f64,
    /// `None` when the step returned its input unchanged.
    pub info: Option<OptimizerInfo>,
}

impl StepOutcome {
    pub fn unchanged(solution: &[f64], residual: f64) -> Self {
        Self {
            solution: solution.to_vec(),
            residual,
            info: None,
        }
    }

    pub fn into_pair(self) -> (SolutionVector, f64) {
        (self.solution, self.residual)
    }
}

/// One bounded optimization of `mixture_index` in a freshly decoded snapshot,
/// starting from `solution`. Without a snapshot the input pair is returned as is.
pub fn improve_solution<L: ProjectLoader>(
    loader: &L,
    snapshot: Option<&[u8]>,
    mixture_index: usize,
    solution: &[f64],
    residual: f64,
    options: &OptimizerOptions,
) -> RefineResult<(SolutionVector, f64)> {
    improve_solution_detailed(loader, snapshot, mixture_index, solution, residual, options)
        .map(StepOutcome::into_pair)
}

pub fn improve_solution_detailed<L: ProjectLoader>(
    loader: &L,
    snapshot: Option<&[u8]>,
    mixture_index: usize,
    solution: &[f64],
    residual: f64,
    options: &OptimizerOptions,
) -> RefineResult<StepOutcome> {
    let Some(snapshot) = snapshot else {
        tracing::debug!(mixture_index, residual, "no project snapshot, keeping solution");
        return Ok(StepOutcome::unchanged(solution, residual));
    };

    let mut decode_context = DecodeContext::default();
    let mut project = loader
        .load(snapshot, &mut decode_context)
        .inspect_err(|error| report_failure("load", error))?;
    let mixture = project
        .mixture_by_index(mixture_index)
        .inspect_err(|error| report_failure("lookup", error))?;
    mixture.rebuild_refinables();
    let context = mixture
        .refinement_context()
        .inspect_err(|error| report_failure("context", error))?;

    improve_context_solution(&context, solution, options)
}

/// One bounded optimization against an already-live context. The context is only
/// evaluated, never modified.
pub fn improve_context_solution<C: RefinementContext + ?Sized>(
    context: &C,
    solution: &[f64],
    options: &OptimizerOptions,
) -> RefineResult<StepOutcome> {
    let ranges = context.ranges();
    check_solution_shape(ranges, solution).inspect_err(|error| report_failure("shape", error))?;
    if !options.extra.is_empty() {
        tracing::debug!(
            keys = ?options.extra.keys().collect::<Vec<_>>(),
            "optimizer options carry keys without a local meaning"
        );
    }

    let outcome = minimize_bounded(
        |candidate| context.residual_for_solution(candidate),
        solution,
        ranges,
        options,
    )
    .map_err(RefineError::from)
    .inspect_err(|error| report_failure("optimize", error))?;

    if !outcome.f.is_finite() || outcome.x.iter().any(|value| !value.is_finite()) {
        let error = RefineError::optimizer_failure(
            "REFINE.NON_FINITE",
            format!("optimizer returned a non-finite result (residual {})", outcome.f),
        );
        report_failure("optimize", &error);
        return Err(error);
    }

    tracing::debug!(
        nit = outcome.info.nit,
        funcalls = outcome.info.funcalls,
        warnflag = outcome.info.warnflag(),
        task = outcome.info.task(),
        residual = outcome.f,
        "refinement step finished"
    );
    Ok(StepOutcome {
        solution: outcome.x,
        residual: outcome.f,
        info: Some(outcome.info),
    })
}

fn report_failure(stage: &'static str, error: &RefineError) {
    tracing::error!(
        stage,
        code = error.code(),
        category = error.kind().name(),
        message = error.message(),
        "refinement step failed"
    );
}

/// Source of improved solutions for the refinement driver.
pub trait RefinementStep {
    fn improve(&mut self, solution: &[f64], residual: f64) -> RefineResult<StepOutcome>;

    /// Called once with the best solution when a run completes.
    fn apply_best(&mut self, _solution: &[f64]) -> RefineResult<()> {
        Ok(())
    }
}

/// Step that re-decodes a snapshot for every call.
#[derive(Debug, Clone)]
pub struct SnapshotStep<L> {
    loader: L,
    snapshot: Option<Vec<u8>>,
    mixture_index: usize,
    options: OptimizerOptions,
}

impl<L: ProjectLoader> SnapshotStep<L> {
    pub fn new(
        loader: L,
        snapshot: Option<Vec<u8>>,
        mixture_index: usize,
        options: OptimizerOptions,
    ) -> Self {
        Self {
            loader,
            snapshot,
            mixture_index,
            options,
        }
    }
}

impl<L: ProjectLoader> RefinementStep for SnapshotStep<L> {
    fn improve(&mut self, solution: &[f64], residual: f64) -> RefineResult<StepOutcome> {
        improve_solution_detailed(
            &self.loader,
            self.snapshot.as_deref(),
            self.mixture_index,
            solution,
            residual,
            &self.options,
        )
    }
}

/// Step over a live context; the best solution is applied back to it.
#[derive(Debug, Clone)]
pub struct ContextStep<C> {
    context: C,
    options: OptimizerOptions,
}

impl<C: RefinementContext> ContextStep<C> {
    pub fn new(context: C, options: OptimizerOptions) -> Self {
        Self { context, options }
    }

    pub fn context(&self) -> &C {
        &self.context
    }

    pub fn into_inner(self) -> C {
        self.context
    }
}

impl<C: RefinementContext> RefinementStep for ContextStep<C> {
    fn improve(&mut self, solution: &[f64], _residual: f64) -> RefineResult<StepOutcome> {
        improve_context_solution(&self.context, solution, &self.options)
    }

    fn apply_best(&mut self, solution: &[f64]) -> RefineResult<()> {
        self.context.apply_solution(solution)
    }
}
