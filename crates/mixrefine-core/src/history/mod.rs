//! Chronological ledger of the solutions visited during one refinement run.
//!
//! A history is append-only while open and frozen after [`RefineHistory::close`],
//! which orders every sample by iteration index. Mutation after closing and
//! analysis before closing are contract violations reported as
//! [`RefineErrorKind::InvalidState`](crate::domain::RefineErrorKind::InvalidState).

use crate::domain::{RefineError, RefineResult};
use serde::Serialize;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Iteration index of the starting point registered before optimization begins.
pub const INITIAL_ITERATION_INDEX: i64 = -1;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Sample {
    pub iteration: i64,
    pub solution: Vec<f64>,
    pub residual: f64,
}

impl Sample {
    pub fn new(iteration: i64, solution: Vec<f64>, residual: f64) -> Self {
        Self {
            iteration,
            solution,
            residual,
        }
    }

    /// Flat `[iteration] + solution + [residual]` row of length `N + 2`.
    pub fn to_row(&self) -> Vec<f64> {
        let mut row = Vec::with_capacity(self.solution.len() + 2);
        row.push(self.iteration as f64);
        row.extend_from_slice(&self.solution);
        row.push(self.residual);
        row
    }
}

#[derive(Debug, Clone)]
enum Samples {
    Open(Vec<Sample>),
    Closed(Box<[Sample]>),
}

impl Samples {
    fn as_slice(&self) -> &[Sample] {
        match self {
            Self::Open(samples) => samples,
            Self::Closed(samples) => samples,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RefineHistory {
    samples: Samples,
    last_iteration: i64,
    parameter_count: Option<usize>,
}

/// History shared between the refinement worker and status observers.
pub type SharedHistory = Arc<RwLock<RefineHistory>>;

impl Default for RefineHistory {
    fn default() -> Self {
        Self::new()
    }
}

impl RefineHistory {
    pub fn new() -> Self {
        Self {
            samples: Samples::Open(Vec::new()),
            last_iteration: INITIAL_ITERATION_INDEX,
            parameter_count: None,
        }
    }

    pub fn new_shared() -> SharedHistory {
        Arc::new(RwLock::new(Self::new()))
    }

    pub fn is_closed(&self) -> bool {
        matches!(self.samples, Samples::Closed(_))
    }

    pub fn len(&self) -> usize {
        self.samples.as_slice().len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.as_slice().is_empty()
    }

    /// Number of refinable parameters, fixed by the first registered sample.
    pub fn parameter_count(&self) -> Option<usize> {
        self.parameter_count
    }

    /// Highest iteration index registered so far (`-1` until a real iteration arrives).
    pub fn last_iteration(&self) -> i64 {
        self.last_iteration
    }

    pub fn has_iterations(&self) -> bool {
        self.last_iteration > INITIAL_ITERATION_INDEX
    }

    pub fn set_initial_solution(&mut self, solution: &[f64], residual: f64) -> RefineResult<()> {
        if self.initial_entry().is_some() {
            tracing::warn!(
                residual,
                "initial solution registered more than once; the latest one wins"
            );
        }
        self.push(INITIAL_ITERATION_INDEX, solution, residual)
    }

    pub fn register_solution(
        &mut self,
        iteration: i64,
        solution: &[f64],
        residual: f64,
    ) -> RefineResult<()> {
        self.push(iteration, solution, residual)?;
        if iteration > self.last_iteration {
            self.last_iteration = iteration;
        }
        Ok(())
    }

    fn push(&mut self, iteration: i64, solution: &[f64], residual: f64) -> RefineResult<()> {
        let Samples::Open(samples) = &mut self.samples else {
            return Err(RefineError::invalid_state(
                "HISTORY.CLOSED",
                format!("cannot register iteration {iteration}: history is closed"),
            ));
        };

        match self.parameter_count {
            Some(expected) if expected != solution.len() => {
                return Err(RefineError::invalid_state(
                    "HISTORY.SHAPE",
                    format!(
                        "solution for iteration {iteration} has {} parameters, expected {expected}",
                        solution.len()
                    ),
                ));
            }
            Some(_) => {}
            None => self.parameter_count = Some(solution.len()),
        }

        samples.push(Sample::new(iteration, solution.to_vec(), residual));
        Ok(())
    }

    /// Sorts the samples by iteration and freezes them. Equal iteration indices keep
    /// their registration order. Closing twice only re-sorts.
    pub fn close(&mut self) {
        let mut samples = match std::mem::replace(&mut self.samples, Samples::Open(Vec::new())) {
            Samples::Open(samples) => samples,
            Samples::Closed(samples) => samples.into_vec(),
        };
        samples.sort_by_key(|sample| sample.iteration);
        tracing::debug!(
            samples = samples.len(),
            last_iteration = self.last_iteration,
            "refinement history closed"
        );
        self.samples = Samples::Closed(samples.into_boxed_slice());
    }

    /// Sorted samples of a closed history.
    pub fn samples(&self) -> RefineResult<&[Sample]> {
        match &self.samples {
            Samples::Closed(samples) => Ok(samples),
            Samples::Open(_) => Err(RefineError::invalid_state(
                "HISTORY.OPEN",
                "history must be closed before its samples can be analysed",
            )),
        }
    }

    pub fn residual_per_iteration(&self) -> RefineResult<Vec<(i64, f64)>> {
        Ok(self
            .samples()?
            .iter()
            .map(|sample| (sample.iteration, sample.residual))
            .collect())
    }

    /// Sample with the lowest residual. Ties go to the last-occurring sample, so the
    /// most recently recorded of several equally good solutions is reported.
    pub fn best_entry(&self) -> Option<&Sample> {
        let mut best: Option<&Sample> = None;
        for sample in self.samples.as_slice() {
            if sample.residual.is_nan() {
                continue;
            }
            if best.is_none_or(|current| sample.residual <= current.residual) {
                best = Some(sample);
            }
        }
        best
    }

    pub fn initial_entry(&self) -> Option<&Sample> {
        self.last_with_iteration(INITIAL_ITERATION_INDEX)
    }

    /// Sample at the iteration watermark. With only an initial sample registered
    /// this is the initial sample; use [`Self::has_iterations`] to tell them apart.
    pub fn last_entry(&self) -> Option<&Sample> {
        self.last_with_iteration(self.last_iteration)
    }

    fn last_with_iteration(&self, iteration: i64) -> Option<&Sample> {
        self.samples
            .as_slice()
            .iter()
            .rev()
            .find(|sample| sample.iteration == iteration)
    }

    pub fn best_solution(&self) -> Option<&[f64]> {
        self.best_entry().map(|sample| sample.solution.as_slice())
    }

    pub fn best_residual(&self) -> Option<f64> {
        self.best_entry().map(|sample| sample.residual)
    }

    pub fn initial_solution(&self) -> Option<&[f64]> {
        self.initial_entry().map(|sample| sample.solution.as_slice())
    }

    pub fn initial_residual(&self) -> Option<f64> {
        self.initial_entry().map(|sample| sample.residual)
    }

    pub fn last_solution(&self) -> Option<&[f64]> {
        self.last_entry().map(|sample| sample.solution.as_slice())
    }

    pub fn last_residual(&self) -> Option<f64> {
        self.last_entry().map(|sample| sample.residual)
    }
}

pub fn read_history(history: &SharedHistory) -> RwLockReadGuard<'_, RefineHistory> {
    history.read().unwrap_or_else(PoisonError::into_inner)
}

pub fn write_history(history: &SharedHistory) -> RwLockWriteGuard<'_, RefineHistory> {
    history.write().unwrap_or_else(PoisonError::into_inner)
}

/// Scoped acquisition of an open history. Dropping the scope closes the history on
/// every exit path, including `?` propagation and panics.
#[derive(Debug)]
pub struct HistoryScope {
    history: SharedHistory,
}

impl HistoryScope {
    pub fn open(history: &SharedHistory) -> RefineResult<Self> {
        if read_history(history).is_closed() {
            return Err(RefineError::assertion(
                "HISTORY.REOPEN",
                "a closed refinement history cannot be entered again",
            ));
        }
        Ok(Self {
            history: Arc::clone(history),
        })
    }

    pub fn history(&self) -> &SharedHistory {
        &self.history
    }

    pub fn set_initial_solution(&self, solution: &[f64], residual: f64) -> RefineResult<()> {
        write_history(&self.history).set_initial_solution(solution, residual)
    }

    pub fn register_solution(
        &self,
        iteration: i64,
        solution: &[f64],
        residual: f64,
    ) -> RefineResult<()> {
        write_history(&self.history).register_solution(iteration, solution, residual)
    }
}

impl Drop for HistoryScope {
    fn drop(&mut self) {
        write_history(&self.history).close();
    }
}
