//! Error types for model construction, machine lifecycle and actions.

use thiserror::Error;

/// Failures detected while building a [`Model`](crate::Model).
///
/// These are programming errors in the model description and are always
/// reported by [`ModelBuilder::build`](crate::ModelBuilder::build), never
/// deferred to the point where events are processed.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ModelError {
    /// The model declares no transitions at all.
    #[error("Model has no transitions")]
    NoTransitions,

    /// A transition was declared without any starting state.
    #[error("Transition '{transition}' has no starting states")]
    EmptyFromStates { transition: String },

    /// Two transitions resolve the same `(from, to)` pair.
    #[error("Transitions '{first}' and '{second}' both move from {from} to {to}")]
    AmbiguousTransition {
        from: String,
        to: String,
        first: String,
        second: String,
    },

    /// More than one entry action was registered for a state.
    #[error("Duplicate entry action for state {state}")]
    DuplicateEntryAction { state: String },

    /// More than one exit action was registered for a state.
    #[error("Duplicate exit action for state {state}")]
    DuplicateExitAction { state: String },

    /// The model requires entry actions and a reachable state has none.
    #[error("State {state} is the target of a transition but has no entry action")]
    MissingEntryAction { state: String },
}

/// Violations of the machine lifecycle (`start` / `stop` ordering).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LifecycleError {
    /// `stop` or `quiesce_then_stop` was called before `start`.
    #[error("Machine '{name}' cannot be stopped because it has never been started")]
    NotStarted { name: String },

    /// `start` was called after the machine was stopped.
    #[error("Machine '{name}' cannot be started because it was stopped")]
    Stopped { name: String },
}

/// Invalid machine configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// No runtime handle was injected and none is current.
    #[error("No Tokio runtime available; inject one with `runtime(handle)`")]
    NoRuntime(#[from] tokio::runtime::TryCurrentError),

    /// A duration string could not be parsed.
    #[error("Invalid duration '{value}': {source}")]
    InvalidDuration {
        value: String,
        #[source]
        source: humantime::DurationError,
    },

    /// Any other inconsistent setting.
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Outcome of a failed transition, entry or exit action.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ActionError {
    /// Abandon the transition. Honoured by transition and exit actions, which
    /// run before the new state is committed; an entry action returning it is
    /// treated as [`ActionError::Failed`].
    #[error("Transition rolled back: {0}")]
    Rollback(String),

    /// The action failed. Handled according to the machine's
    /// [`FailurePolicy`](crate::FailurePolicy).
    #[error("Action failed: {0}")]
    Failed(String),
}

impl ActionError {
    /// Shorthand for [`ActionError::Rollback`].
    pub fn rollback(reason: impl Into<String>) -> Self {
        Self::Rollback(reason.into())
    }

    /// Shorthand for [`ActionError::Failed`].
    pub fn failed(reason: impl Into<String>) -> Self {
        Self::Failed(reason.into())
    }
}

/// Error returned when awaiting the machine's event-loop task.
#[derive(Debug, Error)]
pub enum TaskError {
    /// The event loop panicked or was cancelled.
    #[error("Task join error: {0}")]
    Join(#[from] tokio::task::JoinError),
}
