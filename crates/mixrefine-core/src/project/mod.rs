//! Project snapshots and the bundled mixture model.
//!
//! A snapshot is a self-contained JSON document describing phases (with their
//! pre-computed calculated profiles per specimen), mixtures and refinable
//! parameters. Loading always goes through a [`DecodeContext`] owned by the caller,
//! so identity resolution never leaks between loads.

pub mod decode;
pub mod mixture;
pub mod residual;
pub mod snapshot;

pub use decode::{DecodeContext, ObjectPool, PooledPhase, decode_project};
pub use mixture::{Mixture, MixturePhase, Refinable, Specimen};
pub use residual::ResidualKind;
pub use snapshot::{
    MixtureRecord, ParameterRecord, ParameterTarget, PhaseRecord, ProjectSnapshot,
    RuntimeSettings, SnapshotDecodeError, SpecimenRecord, load_snapshot_file,
};

use crate::domain::{RefineError, RefineResult};
use crate::refine::RefinementContext;

/// Turns snapshot bytes into a live project.
pub trait ProjectLoader {
    type Project: Project;

    fn load(&self, bytes: &[u8], context: &mut DecodeContext) -> RefineResult<Self::Project>;
}

pub trait Project {
    type Mixture: RefinableMixture;

    fn mixture_count(&self) -> usize;

    /// Fails with `NotFound` when `index` is out of range.
    fn mixture_by_index(&mut self, index: usize) -> RefineResult<&mut Self::Mixture>;
}

pub trait RefinableMixture {
    type Context<'a>: RefinementContext
    where
        Self: 'a;

    /// Recomputes the refinable-parameter list from the mixture's current state.
    fn rebuild_refinables(&mut self);

    fn refinement_context(&mut self) -> RefineResult<Self::Context<'_>>;
}

#[derive(Debug, Clone)]
pub struct MixtureProject {
    name: String,
    phases: Vec<PhaseRecord>,
    mixtures: Vec<Mixture>,
}

impl MixtureProject {
    pub fn new(name: String, phases: Vec<PhaseRecord>, mixtures: Vec<Mixture>) -> Self {
        Self {
            name,
            phases,
            mixtures,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn phases(&self) -> &[PhaseRecord] {
        &self.phases
    }

    pub fn mixtures(&self) -> &[Mixture] {
        &self.mixtures
    }

    pub fn mixture(&self, index: usize) -> RefineResult<&Mixture> {
        let count = self.mixtures.len();
        self.mixtures
            .get(index)
            .ok_or_else(|| mixture_index_error(index, count))
    }
}

impl Project for MixtureProject {
    type Mixture = Mixture;

    fn mixture_count(&self) -> usize {
        self.mixtures.len()
    }

    fn mixture_by_index(&mut self, index: usize) -> RefineResult<&mut Mixture> {
        let count = self.mixtures.len();
        self.mixtures
            .get_mut(index)
            .ok_or_else(|| mixture_index_error(index, count))
    }
}

fn mixture_index_error(index: usize, count: usize) -> RefineError {
    RefineError::not_found(
        "MIXTURE.INDEX",
        format!("mixture index {index} is out of range for a project with {count} mixtures"),
    )
}

/// Loader for JSON snapshots of the bundled mixture model.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonProjectLoader;

impl ProjectLoader for JsonProjectLoader {
    type Project = MixtureProject;

    fn load(&self, bytes: &[u8], context: &mut DecodeContext) -> RefineResult<MixtureProject> {
        let snapshot = ProjectSnapshot::from_slice(bytes)?;
        Ok(decode_project(snapshot, context)?)
    }
}
