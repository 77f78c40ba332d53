use super::gradient::{approx_gradient, project_onto_active_bounds};
use super::{OptimizerError, OptimizerInfo, OptimizerOptions, OptimizerOutcome, Termination};
use crate::domain::{ParameterRange, RefineResult, clamp_to_ranges};
use argmin::core::{CostFunction, Executor, Gradient, State, TerminationReason, TerminationStatus};
use argmin::solver::linesearch::MoreThuenteLineSearch;
use argmin::solver::quasinewton::LBFGS;
use std::cell::{Cell, RefCell};

/// Bookkeeping shared between the argmin problem and the caller. argmin only
/// forwards error messages, so the first typed failure is parked here.
#[derive(Default)]
struct EvaluationLog {
    funcalls: Cell<usize>,
    last: RefCell<Option<(Vec<f64>, f64)>>,
    best: RefCell<Option<(Vec<f64>, f64)>>,
    failure: RefCell<Option<OptimizerError>>,
    budget_exhausted: Cell<bool>,
}

impl EvaluationLog {
    fn cached(&self, x: &[f64]) -> Option<f64> {
        self.last
            .borrow()
            .as_ref()
            .filter(|(point, _)| point.as_slice() == x)
            .map(|(_, value)| *value)
    }

    fn remember(&self, x: Vec<f64>, value: f64) {
        let mut best = self.best.borrow_mut();
        if best.as_ref().is_none_or(|(_, best_value)| value < *best_value) {
            *best = Some((x.clone(), value));
        }
        *self.last.borrow_mut() = Some((x, value));
    }

    fn record_failure(&self, error: OptimizerError) -> argmin::core::Error {
        let message = error.to_string();
        let mut failure = self.failure.borrow_mut();
        if failure.is_none() {
            *failure = Some(error);
        }
        argmin::core::Error::msg(message)
    }
}

/// Box-constrained view of the objective: argmin iterates freely, every evaluation
/// happens at the iterate clamped into `ranges`.
struct BoundedProblem<'a, F> {
    objective: RefCell<F>,
    ranges: &'a [ParameterRange],
    epsilon: f64,
    maxfun: usize,
    log: &'a EvaluationLog,
}

impl<F> BoundedProblem<'_, F>
where
    F: FnMut(&[f64]) -> RefineResult<f64>,
{
    fn call(&self, x: &[f64]) -> Result<f64, OptimizerError> {
        self.log.funcalls.set(self.log.funcalls.get() + 1);
        let mut objective = self.objective.borrow_mut();
        let value = (*objective)(x).map_err(OptimizerError::Objective)?;
        if value.is_nan() {
            return Err(OptimizerError::NonFiniteObjective { value });
        }
        Ok(value)
    }

    fn value_at(&self, clamped: Vec<f64>) -> Result<f64, OptimizerError> {
        if let Some(value) = self.log.cached(&clamped) {
            return Ok(value);
        }
        let value = self.call(&clamped)?;
        self.log.remember(clamped, value);
        Ok(value)
    }
}

impl<F> CostFunction for BoundedProblem<'_, F>
where
    F: FnMut(&[f64]) -> RefineResult<f64>,
{
    type Param = Vec<f64>;
    type Output = f64;

    fn cost(&self, param: &Self::Param) -> Result<Self::Output, argmin::core::Error> {
        let clamped = clamp_to_ranges(param, self.ranges);
        if self.log.cached(&clamped).is_none() && self.log.funcalls.get() >= self.maxfun {
            self.log.budget_exhausted.set(true);
            return Err(argmin::core::Error::msg("function evaluation budget exhausted"));
        }
        self.value_at(clamped).map_err(|error| self.log.record_failure(error))
    }
}

impl<F> Gradient for BoundedProblem<'_, F>
where
    F: FnMut(&[f64]) -> RefineResult<f64>,
{
    type Param = Vec<f64>;
    type Gradient = Vec<f64>;

    fn gradient(&self, param: &Self::Param) -> Result<Self::Gradient, argmin::core::Error> {
        let clamped = clamp_to_ranges(param, self.ranges);
        let value = self
            .value_at(clamped.clone())
            .map_err(|error| self.log.record_failure(error))?;
        let mut gradient = approx_gradient(
            &mut |point: &[f64]| self.call(point),
            &clamped,
            value,
            self.ranges,
            self.epsilon,
        )
        .map_err(|error| self.log.record_failure(error))?;
        if gradient.iter().any(|component| !component.is_finite()) {
            return Err(self.log.record_failure(OptimizerError::NonFiniteGradient));
        }

        project_onto_active_bounds(&clamped, &mut gradient, self.ranges);
        Ok(gradient)
    }
}

/// Limited-memory BFGS with a More-Thuente line search inside the box `ranges`,
/// starting from `x0` clamped into the box. Gradients are approximated by finite
/// differences that stay inside the box.
pub fn minimize_bounded<F>(
    objective: F,
    x0: &[f64],
    ranges: &[ParameterRange],
    options: &OptimizerOptions,
) -> Result<OptimizerOutcome, OptimizerError>
where
    F: FnMut(&[f64]) -> RefineResult<f64>,
{
    options.validate()?;
    if x0.len() != ranges.len() {
        return Err(OptimizerError::DimensionMismatch {
            solution: x0.len(),
            ranges: ranges.len(),
        });
    }
    for (index, &(min, max)) in ranges.iter().enumerate() {
        if min.is_nan() || max.is_nan() || min > max {
            return Err(OptimizerError::InvalidRange { index, min, max });
        }
    }

    let log = EvaluationLog::default();
    let problem = BoundedProblem {
        objective: RefCell::new(objective),
        ranges,
        epsilon: options.epsilon,
        maxfun: options.maxfun,
        log: &log,
    };
    let start = clamp_to_ranges(x0, ranges);
    let initial = problem.value_at(start.clone())?;
    if !initial.is_finite() {
        return Err(OptimizerError::NonFiniteObjective { value: initial });
    }
    if start.is_empty() {
        return Ok(OptimizerOutcome {
            x: start,
            f: initial,
            info: OptimizerInfo {
                grad: Vec::new(),
                termination: Termination::ProjectedGradient,
                funcalls: log.funcalls.get(),
                nit: 0,
            },
        });
    }

    // argmin compares absolute cost changes; factr is relative to the objective scale.
    let cost_tolerance = options.factr * f64::EPSILON * initial.abs().max(1.0);
    let solver = LBFGS::new(MoreThuenteLineSearch::new(), options.m)
        .with_tolerance_grad(options.pgtol)
        .and_then(|solver| solver.with_tolerance_cost(cost_tolerance))
        .map_err(|error| OptimizerError::Solver {
            message: error.to_string(),
        })?;

    let maxiter = u64::try_from(options.maxiter).unwrap_or(u64::MAX);
    let run = Executor::new(problem, solver)
        .configure(|state| state.param(start).max_iters(maxiter))
        .run();
    if let Some(error) = log.failure.take() {
        return Err(error);
    }
    let result = run.map_err(|error| OptimizerError::Solver {
        message: error.to_string(),
    })?;

    let state = result.state();
    let grad = state.get_gradient().cloned().unwrap_or_default();
    let termination = classify_termination(
        state.get_termination_status(),
        &grad,
        options.pgtol,
        log.budget_exhausted.get(),
    );
    let nit = usize::try_from(state.get_iter()).unwrap_or(usize::MAX);
    let funcalls = log.funcalls.get();
    let Some((x, f)) = log.best.take() else {
        return Err(OptimizerError::Solver {
            message: "no point was evaluated".to_string(),
        });
    };

    if options.iprint >= 0 {
        tracing::info!(nit, funcalls, f, task = termination.task(), "L-BFGS-B finished");
    } else {
        tracing::debug!(nit, funcalls, f, task = termination.task(), "L-BFGS-B finished");
    }

    Ok(OptimizerOutcome {
        x,
        f,
        info: OptimizerInfo {
            grad,
            termination,
            funcalls,
            nit,
        },
    })
}

fn classify_termination(
    status: &TerminationStatus,
    gradient: &[f64],
    pgtol: f64,
    budget_exhausted: bool,
) -> Termination {
    let TerminationStatus::Terminated(reason) = status else {
        return Termination::Interrupted;
    };
    match reason {
        TerminationReason::SolverConverged => {
            let norm = gradient.iter().map(|value| value * value).sum::<f64>().sqrt();
            if !gradient.is_empty() && norm < pgtol {
                Termination::ProjectedGradient
            } else {
                Termination::RelativeReduction
            }
        }
        TerminationReason::MaxItersReached => Termination::MaxIterations,
        TerminationReason::SolverExit(_) if budget_exhausted => Termination::MaxFunctionEvaluations,
        TerminationReason::SolverExit(message) => {
            tracing::debug!(%message, "line search stopped the solver");
            Termination::AbnormalLineSearch
        }
        TerminationReason::TargetCostReached
        | TerminationReason::Interrupt
        | TerminationReason::Timeout => Termination::Interrupted,
    }
}

#[cfg(test)]
mod tests {
    use super::minimize_bounded;
    use crate::domain::{RefineError, RefineErrorKind, RefineResult};
    use crate::optimizer::{OptimizerError, OptimizerOptions, Termination};

    fn shifted_parabola(x: &[f64]) -> RefineResult<f64> {
        Ok((x[0] - 3.0).powi(2))
    }

    fn rosenbrock(x: &[f64]) -> RefineResult<f64> {
        Ok(100.0 * (x[1] - x[0] * x[0]).powi(2) + (1.0 - x[0]).powi(2))
    }

    fn unit_box() -> [(f64, f64); 2] {
        [(-2.0, 2.0), (-2.0, 2.0)]
    }

    #[test]
    fn parabola_minimum_is_found_from_lower_bound() {
        let outcome = minimize_bounded(
            shifted_parabola,
            &[0.0],
            &[(0.0, 10.0)],
            &OptimizerOptions::default(),
        )
        .expect("optimization should succeed");

        assert!((outcome.x[0] - 3.0).abs() < 1.0e-4, "x = {}", outcome.x[0]);
        assert!(outcome.f < 1.0e-8, "f = {}", outcome.f);
        assert!(outcome.info.termination.converged());
    }

    #[test]
    fn active_upper_bound_is_respected() {
        let outcome = minimize_bounded(
            shifted_parabola,
            &[0.5],
            &[(0.0, 2.0)],
            &OptimizerOptions::default(),
        )
        .expect("optimization should succeed");

        assert_eq!(outcome.x, vec![2.0]);
        assert!((outcome.f - 1.0).abs() < 1.0e-12);
        assert_eq!(outcome.info.termination, Termination::ProjectedGradient);
        assert_eq!(outcome.info.grad, vec![0.0]);
    }

    #[test]
    fn rosenbrock_valley_is_followed_inside_the_box() {
        let options = OptimizerOptions {
            factr: 10.0,
            pgtol: 1.0e-6,
            ..OptimizerOptions::default()
        };
        let outcome = minimize_bounded(rosenbrock, &[-1.2, 1.0], &unit_box(), &options)
            .expect("optimization should succeed");

        assert!((outcome.x[0] - 1.0).abs() < 1.0e-2, "x = {:?}", outcome.x);
        assert!((outcome.x[1] - 1.0).abs() < 2.0e-2, "x = {:?}", outcome.x);
        assert!(outcome.f < 1.0e-4);
        assert!(outcome.info.nit > 1);
    }

    #[test]
    fn starting_point_outside_the_box_is_clamped() {
        let mut visited_outside = false;
        let objective = |x: &[f64]| -> RefineResult<f64> {
            if x[0] < -1.0 || x[0] > 1.0 {
                visited_outside = true;
            }
            Ok((x[0] - 0.25).powi(2))
        };
        let outcome =
            minimize_bounded(objective, &[5.0], &[(-1.0, 1.0)], &OptimizerOptions::default())
                .expect("optimization should succeed");

        assert!(!visited_outside);
        assert!((outcome.x[0] - 0.25).abs() < 1.0e-4);
    }

    #[test]
    fn fixed_parameters_do_not_move() {
        let objective = |x: &[f64]| -> RefineResult<f64> {
            Ok((x[0] - 1.0).powi(2) + (x[1] - 4.0).powi(2))
        };
        let outcome = minimize_bounded(
            objective,
            &[0.0, 2.0],
            &[(-5.0, 5.0), (2.0, 2.0)],
            &OptimizerOptions::default(),
        )
        .expect("optimization should succeed");

        assert_eq!(outcome.x[1], 2.0);
        assert!((outcome.x[0] - 1.0).abs() < 1.0e-4);
    }

    #[test]
    fn iteration_limit_stops_with_warning_flag() {
        let options = OptimizerOptions {
            maxiter: 1,
            ..OptimizerOptions::default()
        };
        let outcome = minimize_bounded(rosenbrock, &[-1.2, 1.0], &unit_box(), &options)
            .expect("optimization should succeed");

        assert_eq!(outcome.info.nit, 1);
        assert_eq!(outcome.info.termination, Termination::MaxIterations);
        assert_eq!(outcome.info.warnflag(), 1);
        assert!(outcome.f < rosenbrock(&[-1.2, 1.0]).expect("start"));
    }

    #[test]
    fn evaluation_budget_stops_with_warning_flag() {
        let options = OptimizerOptions {
            maxfun: 20,
            ..OptimizerOptions::default()
        };
        let outcome = minimize_bounded(rosenbrock, &[-1.2, 1.0], &unit_box(), &options)
            .expect("optimization should succeed");

        assert_eq!(outcome.info.termination, Termination::MaxFunctionEvaluations);
        assert_eq!(outcome.info.warnflag(), 1);
        assert!(outcome.f <= rosenbrock(&[-1.2, 1.0]).expect("start"));
    }

    #[test]
    fn empty_problem_evaluates_once() {
        let outcome = minimize_bounded(|_: &[f64]| Ok(7.5), &[], &[], &OptimizerOptions::default())
            .expect("optimization should succeed");

        assert!(outcome.x.is_empty());
        assert_eq!(outcome.f, 7.5);
        assert_eq!(outcome.info.funcalls, 1);
    }

    #[test]
    fn shape_and_objective_failures_are_reported() {
        let options = OptimizerOptions::default();
        let error = minimize_bounded(shifted_parabola, &[0.0, 1.0], &[(0.0, 1.0)], &options)
            .expect_err("dimension mismatch");
        assert!(matches!(
            error,
            OptimizerError::DimensionMismatch {
                solution: 2,
                ranges: 1
            }
        ));

        let error = minimize_bounded(|_: &[f64]| Ok(f64::NAN), &[0.0], &[(0.0, 1.0)], &options)
            .expect_err("nan objective");
        assert_eq!(RefineError::from(error).kind(), RefineErrorKind::OptimizerFailure);

        let error = minimize_bounded(
            |_: &[f64]| Err(RefineError::not_found("MIXTURE.INDEX", "gone")),
            &[0.0],
            &[(0.0, 1.0)],
            &options,
        )
        .expect_err("objective failure");
        assert_eq!(RefineError::from(error).kind(), RefineErrorKind::NotFound);
    }

    #[test]
    fn objective_failure_inside_the_search_is_not_swallowed() {
        let mut calls = 0;
        let objective = |x: &[f64]| -> RefineResult<f64> {
            calls += 1;
            if calls > 3 {
                return Err(RefineError::not_found("SPECIMEN.INDEX", "specimen vanished"));
            }
            Ok((x[0] - 3.0).powi(2))
        };
        let options = OptimizerOptions::default();
        let error = minimize_bounded(objective, &[0.0], &[(0.0, 10.0)], &options)
            .expect_err("failure during line search");

        let error = RefineError::from(error);
        assert_eq!(error.kind(), RefineErrorKind::NotFound);
        assert_eq!(error.code(), "SPECIMEN.INDEX");
    }
}
