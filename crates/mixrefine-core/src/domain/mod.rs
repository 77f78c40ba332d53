pub mod errors;

pub use errors::{RefineError, RefineErrorKind, RefineResult};

/// One `(min, max)` box constraint per refinable parameter.
pub type ParameterRange = (f64, f64);

/// Ordered refinable-parameter values, one entry per range of the owning context.
pub type SolutionVector = Vec<f64>;

pub fn clamp_to_ranges(solution: &[f64], ranges: &[ParameterRange]) -> SolutionVector {
    solution
        .iter()
        .zip(ranges.iter())
        .map(|(&value, &(min, max))| value.clamp(min, max))
        .collect()
}

pub fn validate_ranges(ranges: &[ParameterRange]) -> RefineResult<()> {
    for (index, &(min, max)) in ranges.iter().enumerate() {
        if min.is_nan() || max.is_nan() || min > max {
            return Err(RefineError::invalid_state(
                "REFINE.RANGE",
                format!("parameter {index} has an invalid range ({min}, {max})"),
            ));
        }
    }
    Ok(())
}
