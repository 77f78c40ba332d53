use crate::domain::{RefineError, RefineResult};
use serde::{Deserialize, Serialize};

/// Agreement factor used to compare a calculated pattern with experimental data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ResidualKind {
    /// Profile R-factor, `100 * Σ|obs - calc| / Σ|obs|`.
    #[default]
    Rp,
    /// Weighted profile R-factor, `100 * sqrt(Σ w (obs - calc)^2 / Σ w obs^2)`.
    Rwp,
}

impl ResidualKind {
    pub fn evaluate(
        self,
        experimental: &[f64],
        calculated: &[f64],
        weights: Option<&[f64]>,
    ) -> RefineResult<f64> {
        if experimental.len() != calculated.len() {
            return Err(RefineError::invalid_state(
                "RESIDUAL.SHAPE",
                format!(
                    "experimental pattern has {} points, calculated pattern has {}",
                    experimental.len(),
                    calculated.len()
                ),
            ));
        }
        match self {
            Self::Rp => Ok(profile_r_factor(experimental, calculated)),
            Self::Rwp => Ok(weighted_profile_r_factor(experimental, calculated, weights)),
        }
    }
}

pub fn profile_r_factor(experimental: &[f64], calculated: &[f64]) -> f64 {
    let mut difference = 0.0;
    let mut total = 0.0;
    for (&observed, &model) in experimental.iter().zip(calculated) {
        difference += (observed - model).abs();
        total += observed.abs();
    }
    if total > 0.0 {
        100.0 * difference / total
    } else {
        0.0
    }
}

pub fn weighted_profile_r_factor(
    experimental: &[f64],
    calculated: &[f64],
    weights: Option<&[f64]>,
) -> f64 {
    let mut difference = 0.0;
    let mut total = 0.0;
    for (index, (&observed, &model)) in experimental.iter().zip(calculated).enumerate() {
        let weight = weights.and_then(|weights| weights.get(index)).copied().unwrap_or(1.0);
        difference += weight * (observed - model).powi(2);
        total += weight * observed.powi(2);
    }
    if total > 0.0 {
        100.0 * (difference / total).sqrt()
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::{ResidualKind, profile_r_factor, weighted_profile_r_factor};

    #[test]
    fn identical_patterns_have_zero_residual() {
        let pattern = [1.0, 4.0, 9.0];
        assert_eq!(profile_r_factor(&pattern, &pattern), 0.0);
        assert_eq!(weighted_profile_r_factor(&pattern, &pattern, None), 0.0);
    }

    #[test]
    fn profile_r_factor_is_relative_to_observed_intensity() {
        let residual = profile_r_factor(&[10.0, 10.0], &[9.0, 12.0]);
        assert!((residual - 15.0).abs() < 1.0e-12);
    }

    #[test]
    fn weights_scale_the_weighted_residual() {
        let unweighted = weighted_profile_r_factor(&[2.0, 2.0], &[1.0, 2.0], None);
        let weighted = weighted_profile_r_factor(&[2.0, 2.0], &[1.0, 2.0], Some(&[1.0, 3.0]));

        assert!((unweighted - 100.0 * (1.0_f64 / 8.0).sqrt()).abs() < 1.0e-12);
        assert!((weighted - 100.0 * (1.0_f64 / 16.0).sqrt()).abs() < 1.0e-12);
    }

    #[test]
    fn mismatched_patterns_are_rejected() {
        let error = ResidualKind::Rp
            .evaluate(&[1.0, 2.0], &[1.0], None)
            .expect_err("shape mismatch");
        assert_eq!(error.code(), "RESIDUAL.SHAPE");
    }

    #[test]
    fn residual_kind_uses_lowercase_names() {
        let kind: ResidualKind = serde_json::from_str("\"rwp\"").expect("kind should parse");
        assert_eq!(kind, ResidualKind::Rwp);
        assert_eq!(ResidualKind::default(), ResidualKind::Rp);
    }
}
