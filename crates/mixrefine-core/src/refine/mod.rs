mod context;
mod run;
mod step;

pub use context::{FnContext, RefinementContext};
pub use run::{
    RefinementHandle, RefinementOutcome, RefinementRunConfig, RunConfigError, StopReason,
    refine_mixture, run_refinement, spawn_refinement,
};
pub use step::{
    ContextStep, RefinementStep, SnapshotStep, StepOutcome, improve_context_solution,
    improve_solution, improve_solution_detailed,
};
