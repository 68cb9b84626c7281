use std::time::Duration;

use crate::event::Event;
use crate::model::State;

/// What the engine should do after a state has been entered.
///
/// Returned by state entry actions. Follow-up work is only admitted while the
/// machine still accepts events.
#[derive(Debug)]
pub enum Instruction<S: State> {
    /// Nothing further.
    Nothing,
    /// Stop the machine right away, discarding pending work.
    Stop,
    /// Move to the given state next, before any other queued event can
    /// interleave.
    TransitionTo(S),
    /// Move to the given state after a delay.
    DelayedTransitionTo(S, Duration),
    /// Process the given event next, before any other queued event.
    ProcessEvent(Box<dyn Event<S>>),
    /// Submit the given event after a delay. Subsequent and coalesced
    /// wrappers keep their admission rules.
    ProcessEventLater(Box<dyn Event<S>>, Duration),
}

impl<S: State> Instruction<S> {
    pub fn process(event: impl Event<S>) -> Self {
        Self::ProcessEvent(Box::new(event))
    }

    pub fn process_later(event: impl Event<S>, delay: Duration) -> Self {
        Self::ProcessEventLater(Box::new(event), delay)
    }

    pub fn is_nothing(&self) -> bool {
        matches!(self, Self::Nothing)
    }
}

impl<S: State> Default for Instruction<S> {
    fn default() -> Self {
        Self::Nothing
    }
}
