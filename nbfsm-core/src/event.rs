//! Events submitted to a machine, and the wrappers that change how they are
//! admitted by the scheduler.

use std::any::type_name;
use std::borrow::Cow;
use std::fmt::{self, Debug};

use crate::context::ExecutionContext;
use crate::model::State;

/// Input to a machine: decides which state the machine should move to.
///
/// Only [`desired_state`](Self::desired_state) has to be implemented. The
/// remaining methods have defaults that ordinary events should keep.
///
/// # Example
///
/// ```rust
/// use nbfsm_core::{Event, ExecutionContext};
///
/// #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
/// enum Door {
///     Open,
///     Closed,
/// }
///
/// #[derive(Debug)]
/// struct Toggle;
///
/// impl Event<Door> for Toggle {
///     fn desired_state(&self, current: &Door, _ctx: &ExecutionContext<'_>) -> Option<Door> {
///         Some(match current {
///             Door::Open => Door::Closed,
///             Door::Closed => Door::Open,
///         })
///     }
/// }
/// ```
pub trait Event<S: State>: Debug + Send + 'static {
    /// The state the machine should transition to from `current`.
    ///
    /// Returning `None` means there is nothing to do for this event.
    fn desired_state(&self, current: &S, ctx: &ExecutionContext<'_>) -> Option<S>;

    /// How the scheduler admits this event. Overridden by
    /// [`SubsequentEvent`] and [`CoalescedEvent`].
    fn admission(&self) -> Admission {
        Admission::Immediate
    }

    /// Called when the event is submitted. Returning `false` vetoes it: the
    /// event is neither scheduled nor counted as pending.
    fn on_accept(&self, _ctx: &ExecutionContext<'_>) -> bool {
        true
    }

    /// Called right before the desired state is evaluated.
    fn on_processing(&self, _ctx: &ExecutionContext<'_>) {}

    /// Called once the transition for this event has been committed.
    fn on_processed(&self, _ctx: &ExecutionContext<'_>) {}
}

impl<S: State> Event<S> for Box<dyn Event<S>> {
    fn desired_state(&self, current: &S, ctx: &ExecutionContext<'_>) -> Option<S> {
        (**self).desired_state(current, ctx)
    }

    fn admission(&self) -> Admission {
        (**self).admission()
    }

    fn on_accept(&self, ctx: &ExecutionContext<'_>) -> bool {
        (**self).on_accept(ctx)
    }

    fn on_processing(&self, ctx: &ExecutionContext<'_>) {
        (**self).on_processing(ctx)
    }

    fn on_processed(&self, ctx: &ExecutionContext<'_>) {
        (**self).on_processed(ctx)
    }
}

/// Admission policy the scheduler applies to a submitted event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    /// Processed in submission order (or at its deadline when delayed).
    Immediate,
    /// Dropped if any transition was committed between submission and the
    /// moment it becomes due.
    Subsequent,
    /// Grouped with other pending events sharing `key`; only the member
    /// chosen by `policy` is ever evaluated.
    Coalesced { key: CoalescingKey, policy: Process },
}

/// Which member of a coalescing group gets processed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Process {
    /// The earliest submitted member; later ones are dropped.
    #[default]
    First,
    /// The latest submitted member; earlier ones are superseded.
    MostRecent,
}

/// Identity of a coalescing group. Groups are scoped to one machine.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CoalescingKey(Cow<'static, str>);

impl CoalescingKey {
    pub fn new(key: impl Into<Cow<'static, str>>) -> Self {
        Self(key.into())
    }

    /// The default key: the type name of the wrapped event.
    pub fn of<E: ?Sized>() -> Self {
        Self(Cow::Borrowed(type_name::<E>()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CoalescingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&'static str> for CoalescingKey {
    fn from(value: &'static str) -> Self {
        Self::new(value)
    }
}

impl From<String> for CoalescingKey {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}

/// An event that only makes sense if nothing else happened first.
///
/// The transition count is captured when the event is submitted. When the
/// event becomes due, it is evaluated only if that count is unchanged;
/// otherwise it is dropped without evaluating the wrapped event.
#[derive(Debug, Clone)]
pub struct SubsequentEvent<E> {
    event: E,
}

impl<E> SubsequentEvent<E> {
    pub fn new(event: E) -> Self {
        Self { event }
    }

    pub fn inner(&self) -> &E {
        &self.event
    }
}

impl<S: State, E: Event<S>> Event<S> for SubsequentEvent<E> {
    fn desired_state(&self, current: &S, ctx: &ExecutionContext<'_>) -> Option<S> {
        self.event.desired_state(current, ctx)
    }

    fn admission(&self) -> Admission {
        Admission::Subsequent
    }

    fn on_accept(&self, ctx: &ExecutionContext<'_>) -> bool {
        self.event.on_accept(ctx)
    }

    fn on_processing(&self, ctx: &ExecutionContext<'_>) {
        self.event.on_processing(ctx)
    }

    fn on_processed(&self, ctx: &ExecutionContext<'_>) {
        self.event.on_processed(ctx)
    }
}

/// An event grouped with other pending events of the same key.
///
/// Every submission is accepted, but only one member of a pending group is
/// ever evaluated: the first one with [`Process::First`], the most recent
/// one with [`Process::MostRecent`].
#[derive(Debug, Clone)]
pub struct CoalescedEvent<E> {
    event: E,
    policy: Process,
    key: CoalescingKey,
}

impl<E> CoalescedEvent<E> {
    /// Coalesces with [`Process::First`], keyed by the event type.
    pub fn new(event: E) -> Self {
        Self::with_policy(event, Process::First)
    }

    /// Coalesces with the given policy, keyed by the event type.
    pub fn with_policy(event: E, policy: Process) -> Self {
        Self {
            event,
            policy,
            key: CoalescingKey::of::<E>(),
        }
    }

    /// Overrides the coalescing key.
    pub fn keyed(mut self, key: impl Into<CoalescingKey>) -> Self {
        self.key = key.into();
        self
    }

    pub fn policy(&self) -> Process {
        self.policy
    }

    pub fn key(&self) -> &CoalescingKey {
        &self.key
    }

    pub fn inner(&self) -> &E {
        &self.event
    }
}

impl<S: State, E: Event<S>> Event<S> for CoalescedEvent<E> {
    fn desired_state(&self, current: &S, ctx: &ExecutionContext<'_>) -> Option<S> {
        self.event.desired_state(current, ctx)
    }

    fn admission(&self) -> Admission {
        Admission::Coalesced {
            key: self.key.clone(),
            policy: self.policy,
        }
    }

    fn on_accept(&self, ctx: &ExecutionContext<'_>) -> bool {
        self.event.on_accept(ctx)
    }

    fn on_processing(&self, ctx: &ExecutionContext<'_>) {
        self.event.on_processing(ctx)
    }

    fn on_processed(&self, ctx: &ExecutionContext<'_>) {
        self.event.on_processed(ctx)
    }
}

/// Event that unconditionally asks for a specific state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransitionTo<S>(pub S);

impl<S: State> Event<S> for TransitionTo<S> {
    fn desired_state(&self, _current: &S, _ctx: &ExecutionContext<'_>) -> Option<S> {
        Some(self.0.clone())
    }
}
