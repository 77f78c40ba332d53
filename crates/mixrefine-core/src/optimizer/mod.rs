//! Bound-constrained quasi-Newton minimization with approximated gradients, built on
//! argmin's L-BFGS solver.
//!
//! Option names follow the conventional L-BFGS-B keyword set (`m`, `factr`, `pgtol`,
//! `epsilon`, `maxfun`, `maxiter`, `maxls`, `iprint`) so optimizer configuration
//! stored alongside a project can be passed through without translation.

mod gradient;
mod lbfgsb;

pub use lbfgsb::minimize_bounded;

use crate::domain::{RefineError, RefineErrorKind};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizerOptions {
    /// Number of correction pairs kept for the inverse Hessian approximation.
    pub m: usize,
    /// Relative reduction tolerance as a multiple of machine epsilon.
    pub factr: f64,
    /// Projected gradient tolerance (Euclidean norm).
    pub pgtol: f64,
    /// Finite-difference step, scaled by `max(1, |x_i|)`.
    pub epsilon: f64,
    pub maxfun: usize,
    pub maxiter: usize,
    /// Validated but not interpreted; the More-Thuente search has its own stopping rules.
    pub maxls: usize,
    pub iprint: i32,
    pub approx_grad: bool,
    /// Keys this optimizer does not interpret, kept verbatim.
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl Default for OptimizerOptions {
    fn default() -> Self {
        Self {
            m: 10,
            factr: 1.0e7,
            pgtol: 1.0e-5,
            epsilon: 1.0e-8,
            maxfun: 15_000,
            maxiter: 15_000,
            maxls: 20,
            iprint: -1,
            approx_grad: true,
            extra: BTreeMap::new(),
        }
    }
}

impl OptimizerOptions {
    pub fn from_json_str(source: &str) -> Result<Self, OptimizerError> {
        let options: Self = serde_json::from_str(source)
            .map_err(|source| OptimizerError::ParseOptions { source })?;
        options.validate()?;
        Ok(options)
    }

    pub fn validate(&self) -> Result<(), OptimizerError> {
        let reason = if self.m == 0 {
            Some("m must be at least 1")
        } else if !self.factr.is_finite() || self.factr < 0.0 {
            Some("factr must be finite and non-negative")
        } else if !self.pgtol.is_finite() || self.pgtol < 0.0 {
            Some("pgtol must be finite and non-negative")
        } else if !self.epsilon.is_finite() || self.epsilon <= 0.0 {
            Some("epsilon must be finite and positive")
        } else if self.maxls == 0 {
            Some("maxls must be at least 1")
        } else if !self.approx_grad {
            Some("only approximated gradients are supported")
        } else {
            None
        };

        match reason {
            Some(reason) => Err(OptimizerError::InvalidOptions { reason }),
            None => Ok(()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Termination {
    ProjectedGradient,
    RelativeReduction,
    MaxIterations,
    MaxFunctionEvaluations,
    AbnormalLineSearch,
    Interrupted,
}

impl Termination {
    pub const fn task(self) -> &'static str {
        match self {
            Self::ProjectedGradient => "CONVERGENCE: NORM_OF_PROJECTED_GRADIENT_<=_PGTOL",
            Self::RelativeReduction => "CONVERGENCE: REL_REDUCTION_OF_F_<=_FACTR*EPSMCH",
            Self::MaxIterations => "STOP: TOTAL NO. of ITERATIONS REACHED LIMIT",
            Self::MaxFunctionEvaluations => "STOP: TOTAL NO. of f AND g EVALUATIONS EXCEEDS LIMIT",
            Self::AbnormalLineSearch => "ABNORMAL_TERMINATION_IN_LNSRCH",
            Self::Interrupted => "STOP: INTERRUPTED",
        }
    }

    /// `0` converged, `1` evaluation or iteration limit, `2` anything else.
    pub const fn warnflag(self) -> u8 {
        match self {
            Self::ProjectedGradient | Self::RelativeReduction => 0,
            Self::MaxIterations | Self::MaxFunctionEvaluations => 1,
            Self::AbnormalLineSearch | Self::Interrupted => 2,
        }
    }

    pub const fn converged(self) -> bool {
        self.warnflag() == 0
    }
}

impl Display for Termination {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str((*self).task())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OptimizerInfo {
    pub grad: Vec<f64>,
    pub termination: Termination,
    pub funcalls: usize,
    pub nit: usize,
}

impl OptimizerInfo {
    pub fn task(&self) -> &'static str {
        self.termination.task()
    }

    pub fn warnflag(&self) -> u8 {
        self.termination.warnflag()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OptimizerOutcome {
    pub x: Vec<f64>,
    pub f: f64,
    pub info: OptimizerInfo,
}

impl OptimizerOutcome {
    pub fn into_pair(self) -> (Vec<f64>, f64) {
        (self.x, self.f)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum OptimizerError {
    #[error("invalid optimizer options: {reason}")]
    InvalidOptions { reason: &'static str },
    #[error("failed to parse optimizer options: {source}")]
    ParseOptions { source: serde_json::Error },
    #[error("solution has {solution} parameters but {ranges} ranges were supplied")]
    DimensionMismatch { solution: usize, ranges: usize },
    #[error("parameter {index} has an invalid range ({min}, {max})")]
    InvalidRange { index: usize, min: f64, max: f64 },
    #[error("objective returned a non-finite value {value}")]
    NonFiniteObjective { value: f64 },
    #[error("approximated gradient is not finite")]
    NonFiniteGradient,
    #[error("objective evaluation failed: {0}")]
    Objective(#[source] RefineError),
    #[error("L-BFGS solver failed: {message}")]
    Solver { message: String },
}

impl From<OptimizerError> for RefineError {
    fn from(error: OptimizerError) -> Self {
        let message = error.to_string();
        match error {
            OptimizerError::Objective(source) => source,
            OptimizerError::InvalidOptions { .. } | OptimizerError::ParseOptions { .. } => {
                RefineError::new(RefineErrorKind::OptimizerFailure, "OPTIMIZER.OPTIONS", message)
            }
            OptimizerError::DimensionMismatch { .. } | OptimizerError::InvalidRange { .. } => {
                RefineError::invalid_state("OPTIMIZER.SHAPE", message)
            }
            OptimizerError::NonFiniteObjective { .. } | OptimizerError::NonFiniteGradient => {
                RefineError::optimizer_failure("OPTIMIZER.NON_FINITE", message)
            }
            OptimizerError::Solver { .. } => {
                RefineError::optimizer_failure("OPTIMIZER.SOLVER", message)
            }
        }
    }
}
