use super::OptimizerError;
use crate::domain::ParameterRange;

/// Forward-difference gradient that never steps outside the box. Components whose
/// range is narrower than the step fall back to a difference across the whole range,
/// and fixed parameters (`min == max`) get a zero component.
pub(crate) fn approx_gradient<F>(
    evaluate: &mut F,
    x: &[f64],
    fx: f64,
    ranges: &[ParameterRange],
    epsilon: f64,
) -> Result<Vec<f64>, OptimizerError>
where
    F: FnMut(&[f64]) -> Result<f64, OptimizerError>,
{
    let mut gradient = vec![0.0; x.len()];
    let mut shifted = x.to_vec();

    for index in 0..x.len() {
        let (min, max) = ranges[index];
        if max - min <= 0.0 {
            continue;
        }

        let step = epsilon * x[index].abs().max(1.0);
        let (base_value, base_x, step_x) = if x[index] + step <= max {
            (fx, x[index], x[index] + step)
        } else if x[index] - step >= min {
            (fx, x[index], x[index] - step)
        } else {
            shifted[index] = min;
            let value = evaluate(&shifted)?;
            (value, min, max)
        };

        shifted[index] = step_x;
        let stepped = evaluate(&shifted)?;
        shifted[index] = x[index];

        gradient[index] = (stepped - base_value) / (step_x - base_x);
    }

    Ok(gradient)
}

/// Zeroes the components that would push a parameter sitting on a bound further out.
pub(crate) fn project_onto_active_bounds(
    x: &[f64],
    gradient: &mut [f64],
    ranges: &[ParameterRange],
) {
    for ((component, &value), &(min, max)) in gradient.iter_mut().zip(x).zip(ranges) {
        if (value <= min && *component > 0.0) || (value >= max && *component < 0.0) {
            *component = 0.0;
        }
    }
}
