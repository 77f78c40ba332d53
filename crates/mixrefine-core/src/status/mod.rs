//! Observable refinement status.
//!
//! [`RefineStatus`] is the handle a UI polls while a refinement runs on a worker
//! thread. The state is a single [`RefineState`] value, so at most one of the
//! running/cancelled/error/finished views can be true at any time.

use crate::domain::{RefineError, RefineResult};
use crate::history::{SharedHistory, read_history};
use serde::Serialize;
use std::fmt::{Display, Formatter};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

pub const MESSAGE_NOT_STARTED: &str = "";
pub const MESSAGE_RUNNING: &str = "Running...";
pub const MESSAGE_ERROR: &str = "Refinement error!";
pub const MESSAGE_CANCELLED: &str = "Refinement cancelled!";
pub const MESSAGE_FINISHED: &str = "Refinement finished!";

const UNSET_TIME: f64 = -1.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
pub enum RefineState {
    #[default]
    NotStarted,
    Running,
    Cancelled,
    Error,
    Finished,
}

impl RefineState {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::NotStarted => "not-started",
            Self::Running => "running",
            Self::Cancelled => "cancelled",
            Self::Error => "error",
            Self::Finished => "finished",
        }
    }

    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Cancelled | Self::Error | Self::Finished)
    }
}

impl Display for RefineState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str((*self).as_str())
    }
}

/// Externally owned cooperative cancellation signal.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Plain copy of a status, safe to hand to observers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusSnapshot {
    pub state: RefineState,
    pub message: String,
    pub start_time: f64,
    pub end_time: f64,
    pub total_time_ms: f64,
    pub current_error: Option<f64>,
}

#[derive(Debug)]
struct StatusInner {
    state: RefineState,
    message: String,
    start_time: f64,
    end_time: f64,
    started_at: Option<Instant>,
    elapsed: Option<Duration>,
}

impl Default for StatusInner {
    fn default() -> Self {
        Self {
            state: RefineState::NotStarted,
            message: MESSAGE_NOT_STARTED.to_string(),
            start_time: UNSET_TIME,
            end_time: UNSET_TIME,
            started_at: None,
            elapsed: None,
        }
    }
}

impl StatusInner {
    fn total_time_ms(&self) -> f64 {
        let elapsed = match (self.state, self.started_at) {
            (RefineState::Running, Some(started_at)) => Some(started_at.elapsed()),
            _ => self.elapsed,
        };
        elapsed.map_or(0.0, |elapsed| elapsed.as_secs_f64() * 1000.0)
    }
}

#[derive(Debug)]
pub struct RefineStatus {
    inner: RwLock<StatusInner>,
    history: SharedHistory,
    cancel: Option<CancelFlag>,
}

impl RefineStatus {
    pub fn new(history: SharedHistory, cancel: Option<CancelFlag>) -> Self {
        Self {
            inner: RwLock::new(StatusInner::default()),
            history,
            cancel,
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, StatusInner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, StatusInner> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn history(&self) -> &SharedHistory {
        &self.history
    }

    pub fn cancel_flag(&self) -> Option<&CancelFlag> {
        self.cancel.as_ref()
    }

    pub fn state(&self) -> RefineState {
        self.read().state
    }

    pub fn set_state(&self, state: RefineState) {
        self.write().state = state;
    }

    pub fn running(&self) -> bool {
        self.state() == RefineState::Running
    }

    pub fn cancelled(&self) -> bool {
        self.state() == RefineState::Cancelled
    }

    pub fn error(&self) -> bool {
        self.state() == RefineState::Error
    }

    pub fn finished(&self) -> bool {
        self.state() == RefineState::Finished
    }

    pub fn message(&self) -> String {
        self.read().message.clone()
    }

    pub fn set_message(&self, message: impl Into<String>) {
        self.write().message = message.into();
    }

    pub fn start_time(&self) -> f64 {
        self.read().start_time
    }

    pub fn end_time(&self) -> f64 {
        self.read().end_time
    }

    /// Residual of the most recent solution in the attached history.
    pub fn current_error(&self) -> RefineResult<f64> {
        read_history(&self.history).last_residual().ok_or_else(|| {
            RefineError::invalid_state(
                "STATUS.NO_SOLUTION",
                "no solution has been registered in the refinement history yet",
            )
        })
    }

    /// Wall time of the current or most recent run in milliseconds.
    pub fn total_time_ms(&self) -> f64 {
        self.read().total_time_ms()
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        let current_error = self.current_error().ok();
        let inner = self.read();
        StatusSnapshot {
            state: inner.state,
            message: inner.message.clone(),
            start_time: inner.start_time,
            end_time: inner.end_time,
            total_time_ms: inner.total_time_ms(),
            current_error,
        }
    }

    /// Marks the status as running and returns the scope whose exit classifies the
    /// run. Entering a status that is already running is rejected.
    pub fn enter(&self) -> RefineResult<StatusScope<'_>> {
        let mut inner = self.write();
        if inner.state == RefineState::Running {
            return Err(RefineError::assertion(
                "STATUS.REENTER",
                "refinement status is already running",
            ));
        }
        inner.state = RefineState::Running;
        inner.message = MESSAGE_RUNNING.to_string();
        inner.start_time = unix_time_seconds();
        inner.end_time = UNSET_TIME;
        inner.started_at = Some(Instant::now());
        inner.elapsed = None;
        tracing::info!(start_time = inner.start_time, "refinement started");
        Ok(StatusScope {
            status: self,
            exited: false,
        })
    }

    /// Runs `body` inside a status scope and classifies the run from its result.
    pub fn run<T, E, F>(&self, body: F) -> Result<T, E>
    where
        F: FnOnce() -> Result<T, E>,
        E: From<RefineError>,
    {
        let scope = self.enter()?;
        scope.finish(body())
    }

    fn exit(&self, failed: bool) {
        let cancelled = self.cancel.as_ref().is_some_and(CancelFlag::is_cancelled);
        let mut inner = self.write();
        inner.end_time = unix_time_seconds();
        inner.elapsed = inner.started_at.take().map(|started_at| started_at.elapsed());
        inner.start_time = UNSET_TIME;

        let (state, message) = if failed {
            (RefineState::Error, MESSAGE_ERROR)
        } else if cancelled {
            (RefineState::Cancelled, MESSAGE_CANCELLED)
        } else {
            (RefineState::Finished, MESSAGE_FINISHED)
        };
        inner.state = state;
        inner.message = message.to_string();

        let total_time_ms = inner.total_time_ms();
        drop(inner);
        if failed {
            tracing::error!(total_time_ms, "refinement ended with an error");
        } else {
            tracing::info!(%state, total_time_ms, "refinement ended");
        }
    }
}

/// Active status scope. Call [`StatusScope::finish`] with the run's result; a scope
/// dropped without a result (early return or panic) classifies the run as an error.
#[derive(Debug)]
pub struct StatusScope<'a> {
    status: &'a RefineStatus,
    exited: bool,
}

impl StatusScope<'_> {
    pub fn status(&self) -> &RefineStatus {
        self.status
    }

    pub fn finish<T, E>(mut self, result: Result<T, E>) -> Result<T, E> {
        self.exited = true;
        self.status.exit(result.is_err());
        result
    }
}

impl Drop for StatusScope<'_> {
    fn drop(&mut self) {
        if !self.exited {
            self.exited = true;
            self.status.exit(true);
        }
    }
}

fn unix_time_seconds() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs_f64())
        .unwrap_or(0.0)
}
