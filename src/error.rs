//! Definition of error and status.

use std::error::Error;
use std::fmt;

/// Failure reported by the stacks and the reclamation machinery.
#[derive(PartialEq, Eq, Copy, Clone, Debug)]
pub enum Status {
    /// Bounded pool has no free slot left
    PoolExhausted,
    /// Hazard slot table is full, more threads than `max_threads` touched the registry
    ThreadNumOverflow,
    /// Current thread already holds a live hazard handle for this registry
    Busy,
    /// Thread local storage of the current thread is already destroyed
    ThreadExiting,
    /// Invalid parameter
    InvalidParam,
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl Error for Status {}

/// Returned by `try_push` when the value could not be stored. The value is handed back.
pub struct PushError<T> {
    pub status: Status,
    pub value: T,
}

impl<T> PushError<T> {
    pub fn new(status: Status, value: T) -> Self {
        PushError { status, value }
    }

    pub fn into_inner(self) -> T {
        self.value
    }
}

impl<T> fmt::Debug for PushError<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("PushError")
            .field("status", &self.status)
            .finish_non_exhaustive()
    }
}

impl<T> fmt::Display for PushError<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "push failed: {}", self.status)
    }
}

impl<T> Error for PushError<T> {}
