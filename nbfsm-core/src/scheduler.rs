//! The per-machine event loop and its delay queue.
//!
//! Every machine owns exactly one loop task. Immediate submissions arrive over
//! an unbounded channel and are dispatched in order; delayed, subsequent and
//! coalesced submissions wait in a [`DelayQueue`] until their deadline. Because
//! the loop is the only caller of the [`Engine`], transitions of one machine
//! never overlap.

use std::collections::{BTreeMap, HashMap};
use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, sleep_until};

use crate::engine::{Engine, Outcome};
use crate::event::{Admission, CoalescingKey, Event, Process, TransitionTo};
use crate::instruction::Instruction;
use crate::machine::Shared;
use crate::model::State;

/// How the event loop should wind down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ShutdownMode {
    /// Keep processing until no work is pending, then terminate.
    Graceful,
    /// Terminate right away, discarding pending work.
    Immediate,
}

/// Why a machine's event loop terminated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// `stop` was called.
    Stopped,
    /// All pending work drained after `quiesce_then_stop`.
    Quiesced,
    /// An action failed under [`FailurePolicy::Stop`](crate::FailurePolicy::Stop)
    /// or an entry action returned [`Instruction::Stop`].
    Halted,
    /// The machine handle was dropped.
    Disconnected,
}

pub(crate) enum Command<S: State> {
    /// Enter the initial state.
    Enter(S),
    Submit(Submission<S>),
}

/// An accepted event on its way to the event loop.
pub(crate) struct Submission<S: State> {
    event: Box<dyn Event<S>>,
    admission: Admission,
    deadline: Option<Instant>,
}

impl<S: State> Submission<S> {
    pub(crate) fn new(event: Box<dyn Event<S>>, delay: Option<Duration>) -> Self {
        let admission = event.admission();
        let deadline = match (delay, &admission) {
            (Some(delay), _) => Some(Instant::now() + delay),
            // groups only exist inside the delay queue
            (None, Admission::Coalesced { .. }) => Some(Instant::now()),
            (None, _) => None,
        };
        Self {
            event,
            admission,
            deadline,
        }
    }

    /// Classifies the submission once the loop dequeues it. `transitions` is
    /// the transition count after every earlier submission was handled.
    fn into_parts(self, transitions: u64) -> (Box<dyn Event<S>>, Ticket, Option<Instant>) {
        let ticket = match self.admission {
            Admission::Immediate => Ticket::Plain,
            Admission::Subsequent => Ticket::Subsequent {
                snapshot: transitions,
            },
            Admission::Coalesced { key, policy } => Ticket::Coalesced { key, policy },
        };
        (self.event, ticket, self.deadline)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Ticket {
    Plain,
    Subsequent { snapshot: u64 },
    Coalesced { key: CoalescingKey, policy: Process },
}

struct Delayed<S: State> {
    event: Box<dyn Event<S>>,
    ticket: Ticket,
}

type Slot = (Instant, u64);

/// Events waiting for their deadline, ordered by deadline and then by
/// submission.
///
/// At most one member of each coalescing group is ever queued: with
/// [`Process::First`] later members are dropped on insertion, with
/// [`Process::MostRecent`] they replace the queued one.
pub(crate) struct DelayQueue<S: State> {
    entries: BTreeMap<Slot, Delayed<S>>,
    groups: HashMap<CoalescingKey, Slot>,
    seq: u64,
}

impl<S: State> DelayQueue<S> {
    pub(crate) fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
            groups: HashMap::new(),
            seq: 0,
        }
    }

    /// Queues an event and returns how many queued or offered events were
    /// dropped by coalescing.
    fn insert(&mut self, deadline: Instant, event: Box<dyn Event<S>>, ticket: Ticket) -> usize {
        let slot = (deadline, self.seq);
        self.seq += 1;

        let mut dropped = 0;
        if let Ticket::Coalesced { key, policy } = &ticket {
            if let Some(existing) = self.groups.get(key).copied() {
                match policy {
                    Process::First => return 1,
                    Process::MostRecent => {
                        if self.entries.remove(&existing).is_some() {
                            dropped += 1;
                        }
                    }
                }
            }
            self.groups.insert(key.clone(), slot);
        }

        self.entries.insert(slot, Delayed { event, ticket });
        dropped
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.entries.keys().next().map(|(deadline, _)| *deadline)
    }

    fn pop_due(&mut self, now: Instant) -> Option<Delayed<S>> {
        let slot = *self.entries.keys().next()?;
        if slot.0 > now {
            return None;
        }
        let delayed = self.entries.remove(&slot)?;
        if let Ticket::Coalesced { key, .. } = &delayed.ticket {
            if self.groups.get(key) == Some(&slot) {
                self.groups.remove(key);
            }
        }
        Some(delayed)
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

/// A unit of work run to completion before the loop looks at anything else.
enum Work<S: State> {
    Enter(S),
    Event(Box<dyn Event<S>>),
}

pub(crate) struct EventLoop<S: State> {
    engine: Engine<S>,
    shared: Arc<Shared<S>>,
    commands: mpsc::UnboundedReceiver<Command<S>>,
    shutdown: watch::Receiver<Option<ShutdownMode>>,
    queue: DelayQueue<S>,
    execution_timeout: Duration,
    draining: bool,
}

impl<S: State> EventLoop<S> {
    pub(crate) fn new(
        engine: Engine<S>,
        shared: Arc<Shared<S>>,
        commands: mpsc::UnboundedReceiver<Command<S>>,
        shutdown: watch::Receiver<Option<ShutdownMode>>,
        execution_timeout: Duration,
    ) -> Self {
        Self {
            engine,
            shared,
            commands,
            shutdown,
            queue: DelayQueue::new(),
            execution_timeout,
            draining: false,
        }
    }

    pub(crate) async fn run(mut self) -> Termination {
        tracing::debug!(machine = %self.shared.name, "event loop started");

        let termination = loop {
            if self.draining && self.shared.pending() == 0 {
                break Termination::Quiesced;
            }

            let next = self.queue.next_deadline();
            let flow = tokio::select! {
                biased;
                changed = self.shutdown.changed() => {
                    let mode = changed.map(|()| *self.shutdown.borrow_and_update());
                    match mode {
                        Ok(Some(ShutdownMode::Immediate)) => ControlFlow::Break(Termination::Stopped),
                        Ok(Some(ShutdownMode::Graceful)) => {
                            self.draining = true;
                            ControlFlow::Continue(())
                        }
                        Ok(None) => ControlFlow::Continue(()),
                        Err(_) => ControlFlow::Break(Termination::Disconnected),
                    }
                }
                _ = sleep_until(next.unwrap_or_else(Instant::now)), if next.is_some() => {
                    self.fire_due()
                }
                command = self.commands.recv() => match command {
                    Some(command) => self.handle(command),
                    None => ControlFlow::Break(Termination::Disconnected),
                },
            };

            if let ControlFlow::Break(termination) = flow {
                break termination;
            }
        };

        self.shared.halt();
        let discarded = self.shared.discard_pending();
        tracing::debug!(
            machine = %self.shared.name,
            ?termination,
            discarded,
            delayed = self.queue.len(),
            "event loop terminated"
        );
        termination
    }

    fn handle(&mut self, command: Command<S>) -> ControlFlow<Termination> {
        match command {
            Command::Enter(initial) => self.run_to_completion(Work::Enter(initial)),
            Command::Submit(submission) => {
                let (event, ticket, deadline) =
                    submission.into_parts(self.shared.transition_count());
                match deadline {
                    Some(deadline) => {
                        self.enqueue(deadline, event, ticket);
                        ControlFlow::Continue(())
                    }
                    None => self.admit(event, ticket),
                }
            }
        }
    }

    fn enqueue(&mut self, deadline: Instant, event: Box<dyn Event<S>>, ticket: Ticket) {
        let dropped = self.queue.insert(deadline, event, ticket);
        for _ in 0..dropped {
            tracing::debug!(machine = %self.shared.name, "coalesced event will not be evaluated");
            self.shared.settle();
        }
    }

    fn fire_due(&mut self) -> ControlFlow<Termination> {
        let now = Instant::now();
        while let Some(Delayed { event, ticket }) = self.queue.pop_due(now) {
            self.admit(event, ticket)?;
        }
        ControlFlow::Continue(())
    }

    /// Applies the interleaving check of subsequent events, then runs the
    /// event.
    fn admit(&mut self, event: Box<dyn Event<S>>, ticket: Ticket) -> ControlFlow<Termination> {
        if let Ticket::Subsequent { snapshot } = ticket {
            let current = self.shared.transition_count();
            if current != snapshot {
                tracing::debug!(
                    machine = %self.shared.name,
                    ?event,
                    snapshot,
                    current,
                    "skipping subsequent event, another transition interleaved"
                );
                self.shared.settle();
                return ControlFlow::Continue(());
            }
        }
        self.run_to_completion(Work::Event(event))
    }

    /// Runs `work` and every synchronous follow-up its entry actions ask for.
    fn run_to_completion(&mut self, work: Work<S>) -> ControlFlow<Termination> {
        let mut next = Some(work);
        while let Some(work) = next.take() {
            if !self.shared.transitions_allowed() {
                self.shared.settle();
                return ControlFlow::Break(Termination::Halted);
            }

            let started = Instant::now();
            let outcome = match &work {
                Work::Enter(initial) => self.engine.enter_initial(initial.clone()),
                Work::Event(event) => self.engine.execute(event.as_ref()),
            };
            let elapsed = started.elapsed();
            if elapsed > self.execution_timeout {
                tracing::warn!(
                    machine = %self.shared.name,
                    ?elapsed,
                    timeout = ?self.execution_timeout,
                    "event processing exceeded the execution timeout"
                );
            }

            let flow = match outcome {
                Outcome::Ignored | Outcome::RolledBack => ControlFlow::Continue(()),
                Outcome::Halted => ControlFlow::Break(Termination::Halted),
                Outcome::Committed(instruction) => match self.follow_up(instruction) {
                    ControlFlow::Continue(work) => {
                        next = work;
                        ControlFlow::Continue(())
                    }
                    ControlFlow::Break(termination) => ControlFlow::Break(termination),
                },
            };
            self.shared.settle();
            flow?;
        }
        ControlFlow::Continue(())
    }

    /// Turns an entry action's instruction into the next piece of work, or
    /// schedules it. Follow-ups are admitted only while the machine accepts
    /// events.
    fn follow_up(&mut self, instruction: Instruction<S>) -> ControlFlow<Termination, Option<Work<S>>> {
        let machine = self.shared.name.as_str();
        match instruction {
            Instruction::Nothing => ControlFlow::Continue(None),
            Instruction::Stop => {
                tracing::debug!(machine, "entry action requested stop");
                self.shared.halt();
                ControlFlow::Break(Termination::Halted)
            }
            Instruction::TransitionTo(state) => {
                ControlFlow::Continue(self.admit_follow_up(Box::new(TransitionTo(state))))
            }
            Instruction::ProcessEvent(event) => ControlFlow::Continue(self.admit_follow_up(event)),
            Instruction::DelayedTransitionTo(state, delay) => {
                self.schedule_follow_up(Box::new(TransitionTo(state)), delay);
                ControlFlow::Continue(None)
            }
            Instruction::ProcessEventLater(event, delay) => {
                self.schedule_follow_up(event, delay);
                ControlFlow::Continue(None)
            }
        }
    }

    fn admit_follow_up(&mut self, event: Box<dyn Event<S>>) -> Option<Work<S>> {
        if self.shared.vetoes(event.as_ref()) {
            return None;
        }
        if self.shared.try_admit() {
            Some(Work::Event(event))
        } else {
            tracing::debug!(machine = %self.shared.name, ?event, "dropping follow-up, machine not accepting events");
            None
        }
    }

    fn schedule_follow_up(&mut self, event: Box<dyn Event<S>>, delay: Duration) {
        if self.shared.vetoes(event.as_ref()) {
            return;
        }
        if !self.shared.try_admit() {
            tracing::debug!(machine = %self.shared.name, ?event, "dropping follow-up, machine not accepting events");
            return;
        }
        let (event, ticket, deadline) =
            Submission::new(event, Some(delay)).into_parts(self.shared.transition_count());
        self.enqueue(deadline.unwrap_or_else(Instant::now), event, ticket);
    }
}
