//! Mixture refinement core: bounded optimization of mixture parameters against
//! experimental XRD patterns, with a sorted refinement history and an observable
//! run status.

pub mod domain;
pub mod history;
pub mod optimizer;
pub mod project;
pub mod refine;
pub mod status;
