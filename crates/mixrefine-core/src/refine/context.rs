use crate::domain::{ParameterRange, RefineError, RefineResult, SolutionVector, validate_ranges};

/// Residual evaluator over an ordered set of bounded parameters.
pub trait RefinementContext {
    /// One `(min, max)` per refinable parameter, in solution order.
    fn ranges(&self) -> &[ParameterRange];

    fn residual_for_solution(&self, solution: &[f64]) -> RefineResult<f64>;

    fn current_solution(&self) -> SolutionVector;

    /// Writes `solution` back into the refined object.
    fn apply_solution(&mut self, solution: &[f64]) -> RefineResult<()>;

    fn parameter_count(&self) -> usize {
        self.ranges().len()
    }
}

impl<C: RefinementContext + ?Sized> RefinementContext for &mut C {
    fn ranges(&self) -> &[ParameterRange] {
        (**self).ranges()
    }

    fn residual_for_solution(&self, solution: &[f64]) -> RefineResult<f64> {
        (**self).residual_for_solution(solution)
    }

    fn current_solution(&self) -> SolutionVector {
        (**self).current_solution()
    }

    fn apply_solution(&mut self, solution: &[f64]) -> RefineResult<()> {
        (**self).apply_solution(solution)
    }
}

/// Context backed by a residual function; the applied solution is kept in place.
#[derive(Debug, Clone)]
pub struct FnContext<F> {
    ranges: Vec<ParameterRange>,
    solution: SolutionVector,
    residual: F,
}

impl<F> FnContext<F>
where
    F: Fn(&[f64]) -> RefineResult<f64>,
{
    pub fn new(
        ranges: Vec<ParameterRange>,
        solution: SolutionVector,
        residual: F,
    ) -> RefineResult<Self> {
        validate_ranges(&ranges)?;
        check_solution_shape(&ranges, &solution)?;
        Ok(Self {
            ranges,
            solution,
            residual,
        })
    }
}

impl<F> RefinementContext for FnContext<F>
where
    F: Fn(&[f64]) -> RefineResult<f64>,
{
    fn ranges(&self) -> &[ParameterRange] {
        &self.ranges
    }

    fn residual_for_solution(&self, solution: &[f64]) -> RefineResult<f64> {
        (self.residual)(solution)
    }

    fn current_solution(&self) -> SolutionVector {
        self.solution.clone()
    }

    fn apply_solution(&mut self, solution: &[f64]) -> RefineResult<()> {
        check_solution_shape(&self.ranges, solution)?;
        self.solution = solution.to_vec();
        Ok(())
    }
}

pub(crate) fn check_solution_shape(
    ranges: &[ParameterRange],
    solution: &[f64],
) -> RefineResult<()> {
    if solution.len() == ranges.len() {
        return Ok(());
    }
    Err(RefineError::invalid_state(
        "REFINE.SOLUTION_SHAPE",
        format!(
            "solution has {} parameters but the context defines {} ranges",
            solution.len(),
            ranges.len()
        ),
    ))
}
