use super::residual::ResidualKind;
use crate::domain::RefineError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ProjectSnapshot {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub settings: RuntimeSettings,
    #[serde(default)]
    pub phases: Vec<PhaseRecord>,
    #[serde(default)]
    pub mixtures: Vec<MixtureRecord>,
}

impl ProjectSnapshot {
    pub fn from_slice(bytes: &[u8]) -> Result<Self, SnapshotDecodeError> {
        serde_json::from_slice(bytes).map_err(|source| SnapshotDecodeError::Parse { source })
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, SnapshotDecodeError> {
        serde_json::to_vec(self).map_err(|source| SnapshotDecodeError::Encode { source })
    }
}

/// Project-wide settings that influence how a decoded mixture evaluates itself.
#[derive(Debug, Clone, Copy, PartialEq, Default, Deserialize, Serialize)]
pub struct RuntimeSettings {
    #[serde(rename = "residualKind", default)]
    pub residual_kind: ResidualKind,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct PhaseRecord {
    pub uuid: String,
    #[serde(default)]
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct MixtureRecord {
    #[serde(default)]
    pub name: String,
    /// Phase UUIDs, one per mixture column.
    pub phases: Vec<String>,
    pub fractions: Vec<f64>,
    #[serde(rename = "refineFractions", default = "default_true")]
    pub refine_fractions: bool,
    #[serde(default)]
    pub specimens: Vec<SpecimenRecord>,
    #[serde(default)]
    pub parameters: Vec<ParameterRecord>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct SpecimenRecord {
    #[serde(default)]
    pub name: String,
    #[serde(rename = "twoTheta")]
    pub two_theta: Vec<f64>,
    pub experimental: Vec<f64>,
    /// Calculated profile of every mixture phase, in mixture phase order.
    pub profiles: Vec<Vec<f64>>,
    #[serde(default = "default_scale")]
    pub scale: f64,
    #[serde(default)]
    pub bgshift: f64,
    #[serde(rename = "refineScale", default = "default_true")]
    pub refine_scale: bool,
    #[serde(rename = "refineBgshift", default)]
    pub refine_bgshift: bool,
    #[serde(rename = "scaleRange", default, skip_serializing_if = "Option::is_none")]
    pub scale_range: Option<[f64; 2]>,
    #[serde(rename = "bgshiftRange", default, skip_serializing_if = "Option::is_none")]
    pub bgshift_range: Option<[f64; 2]>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weights: Option<Vec<f64>>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ParameterRecord {
    #[serde(default)]
    pub name: String,
    pub target: ParameterTarget,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<f64>,
    pub min: f64,
    pub max: f64,
    #[serde(default = "default_true")]
    pub refine: bool,
}

/// Mixture property a refinable parameter writes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ParameterTarget {
    Fraction { phase: usize },
    Scale { specimen: usize },
    Bgshift { specimen: usize },
}

fn default_true() -> bool {
    true
}

fn default_scale() -> f64 {
    1.0
}

#[derive(Debug, thiserror::Error)]
pub enum SnapshotDecodeError {
    #[error("failed to read project snapshot '{}': {source}", path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse project snapshot: {source}")]
    Parse { source: serde_json::Error },
    #[error("failed to encode project snapshot: {source}")]
    Encode { source: serde_json::Error },
    #[error("phase UUID '{uuid}' is registered more than once")]
    DuplicateUuid { uuid: String },
    #[error("mixture '{mixture}' references unknown phase UUID '{uuid}'")]
    UnknownPhase { mixture: String, uuid: String },
    #[error("{context}: expected {expected} values, found {actual}")]
    Shape {
        context: String,
        expected: usize,
        actual: usize,
    },
    #[error("{context}: value is not finite")]
    NonFinite { context: String },
    #[error("{context}: invalid range ({min}, {max})")]
    InvalidRange { context: String, min: f64, max: f64 },
    #[error(
        "parameter '{parameter}' targets {target:?}, which does not exist in mixture '{mixture}'"
    )]
    UnknownTarget {
        mixture: String,
        parameter: String,
        target: ParameterTarget,
    },
}

impl SnapshotDecodeError {
    pub const fn code(&self) -> &'static str {
        match self {
            Self::Read { .. } => "SNAPSHOT.READ",
            Self::Parse { .. } => "SNAPSHOT.PARSE",
            Self::Encode { .. } => "SNAPSHOT.ENCODE",
            Self::DuplicateUuid { .. } => "SNAPSHOT.DUPLICATE_UUID",
            Self::UnknownPhase { .. } => "SNAPSHOT.UNKNOWN_PHASE",
            Self::Shape { .. } => "SNAPSHOT.SHAPE",
            Self::NonFinite { .. } => "SNAPSHOT.NON_FINITE",
            Self::InvalidRange { .. } => "SNAPSHOT.RANGE",
            Self::UnknownTarget { .. } => "SNAPSHOT.TARGET",
        }
    }
}

impl From<SnapshotDecodeError> for RefineError {
    fn from(error: SnapshotDecodeError) -> Self {
        RefineError::serialization_failure(error.code(), error.to_string())
    }
}

pub fn load_snapshot_file(path: impl AsRef<Path>) -> Result<Vec<u8>, SnapshotDecodeError> {
    let path = path.as_ref();
    fs::read(path).map_err(|source| SnapshotDecodeError::Read {
        path: path.to_path_buf(),
        source,
    })
}
