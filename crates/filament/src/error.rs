//! Failure and error types
//!
//! Work submitted to a [`FiberManager`](crate::FiberManager) never unwinds into
//! the run loop. A panic inside a task body, a finally continuation, an
//! escaped main-context closure or an await setup closure is captured as a
//! [`TaskFailure`] and handed to the manager's failure callback together with
//! the [`FailurePhase`] it came from.

use std::any::Any;
use std::fmt;

/// A failure captured from user code at a fiber boundary
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct TaskFailure {
    message: String,
}

impl TaskFailure {
    /// Create a failure with the given message
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    /// Build a failure from a panic payload
    ///
    /// `&str` and `String` payloads (what `panic!` produces) keep their text.
    /// A payload that already is a `TaskFailure` is passed through unchanged.
    pub fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let payload = match payload.downcast::<TaskFailure>() {
            Ok(failure) => return *failure,
            Err(other) => other,
        };
        let message = if let Some(s) = payload.downcast_ref::<&'static str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "unknown panic".to_string()
        };
        Self { message }
    }

    /// The failure message
    pub fn message(&self) -> &str {
        &self.message
    }
}

/// Where an isolated failure was raised
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailurePhase {
    /// The body of a submitted task
    Task,

    /// A finally continuation registered with `add_task_finally`
    Finally,

    /// A closure escaped to the main context with `run_in_main_context`
    MainContext,

    /// The setup closure of a fiber suspension (baton wait, promise await)
    AwaitSetup,
}

impl FailurePhase {
    /// Short human-readable description of the phase
    pub fn as_str(self) -> &'static str {
        match self {
            FailurePhase::Task => "task",
            FailurePhase::Finally => "finally",
            FailurePhase::MainContext => "main context",
            FailurePhase::AwaitSetup => "await setup",
        }
    }
}

impl fmt::Display for FailurePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors returned by fiber-level APIs
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FiberError {
    /// The operation needs a running fiber and none is active
    #[error("not running on a fiber")]
    NotOnFiber,

    /// A promise was dropped without being fulfilled
    #[error("promise dropped without a value")]
    BrokenPromise,

    /// The producer delivered a failure instead of a value
    #[error("task failed: {0}")]
    Task(#[from] TaskFailure),
}

/// Result alias for fiber-level APIs
pub type FiberResult<T> = Result<T, FiberError>;
