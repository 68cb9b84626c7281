//! Runtime engine for nbfsm.
//!
//! A [`Model`] describes the transitions and state actions of one kind of
//! machine. A [`FiniteStateMachine`] drives a model on a Tokio runtime:
//! [`Event`]s are submitted without blocking and evaluated one at a time by
//! the machine's event loop, which resolves the transition, runs its actions,
//! commits the new state and notifies listeners.
//!
//! Delayed events can be wrapped in a [`SubsequentEvent`], dropped if another
//! transition happens first, or a [`CoalescedEvent`], of which only one per
//! group is ever evaluated.

mod config;
mod context;
mod engine;
mod error;
mod event;
mod instruction;
mod listener;
mod machine;
mod model;
mod scheduler;

pub use config::{FailurePolicy, MachineConfig, parse_duration};
pub use context::ExecutionContext;
pub use error::{ActionError, ConfigError, LifecycleError, ModelError, TaskError};
pub use event::{
    Admission, CoalescedEvent, CoalescingKey, Event, Process, SubsequentEvent, TransitionTo,
};
pub use instruction::Instruction;
pub use listener::{ListenerId, TransitionListener};
pub use machine::{FiniteStateMachine, FiniteStateMachineBuilder, Lifecycle};
pub use model::{
    Model, ModelBuilder, State, StateEntryAction, StateExitAction, Transition, TransitionAction,
};
pub use scheduler::Termination;
