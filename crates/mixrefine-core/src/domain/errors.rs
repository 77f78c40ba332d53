use std::error::Error;
use std::fmt::{Display, Formatter};

pub type RefineResult<T> = Result<T, RefineError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RefineErrorKind {
    InvalidState,
    NotFound,
    Assertion,
    OptimizerFailure,
    SerializationFailure,
}

impl RefineErrorKind {
    pub const fn name(self) -> &'static str {
        match self {
            Self::InvalidState => "InvalidState",
            Self::NotFound => "NotFound",
            Self::Assertion => "Assertion",
            Self::OptimizerFailure => "OptimizerFailure",
            Self::SerializationFailure => "SerializationFailure",
        }
    }

    /// Contract violations are programming errors: they propagate immediately and are
    /// never retried or masked.
    pub const fn is_contract_violation(self) -> bool {
        matches!(self, Self::InvalidState | Self::NotFound | Self::Assertion)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefineError {
    kind: RefineErrorKind,
    code: &'static str,
    message: String,
}

impl RefineError {
    pub fn new(kind: RefineErrorKind, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            kind,
            code,
            message: message.into(),
        }
    }

    pub fn invalid_state(code: &'static str, message: impl Into<String>) -> Self {
        Self::new(RefineErrorKind::InvalidState, code, message)
    }

    pub fn not_found(code: &'static str, message: impl Into<String>) -> Self {
        Self::new(RefineErrorKind::NotFound, code, message)
    }

    pub fn assertion(code: &'static str, message: impl Into<String>) -> Self {
        Self::new(RefineErrorKind::Assertion, code, message)
    }

    pub fn optimizer_failure(code: &'static str, message: impl Into<String>) -> Self {
        Self::new(RefineErrorKind::OptimizerFailure, code, message)
    }

    pub fn serialization_failure(code: &'static str, message: impl Into<String>) -> Self {
        Self::new(RefineErrorKind::SerializationFailure, code, message)
    }

    pub const fn kind(&self) -> RefineErrorKind {
        self.kind
    }

    pub const fn code(&self) -> &'static str {
        self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub const fn is_contract_violation(&self) -> bool {
        self.kind.is_contract_violation()
    }
}

impl Display for RefineError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} [{}] {}", self.kind.name(), self.code, self.message)
    }
}

impl Error for RefineError {}
