//! Executes one event against one machine.
//!
//! The engine owns the machine's current state. It is driven exclusively by
//! the machine's event loop, so every call here is already serialized and no
//! locking is needed to read or commit the state.

use std::any::Any;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::Ordering;

use tokio::sync::watch;

use crate::config::FailurePolicy;
use crate::context::ExecutionContext;
use crate::error::ActionError;
use crate::event::{Event, TransitionTo};
use crate::instruction::Instruction;
use crate::machine::Shared;
use crate::model::{Model, State};

/// Result of executing a single event.
#[derive(Debug)]
pub(crate) enum Outcome<S: State> {
    /// No desired state, or no transition defined for it.
    Ignored,
    /// A transition or exit action rolled the transition back.
    RolledBack,
    /// The state was committed; the entry action asked for this next.
    Committed(Instruction<S>),
    /// An action failed under [`FailurePolicy::Stop`].
    Halted,
}

pub(crate) struct Engine<S: State> {
    model: Arc<Model<S>>,
    shared: Arc<Shared<S>>,
    policy: FailurePolicy,
    state: Option<S>,
    state_tx: watch::Sender<Option<S>>,
}

impl<S: State> Engine<S> {
    pub(crate) fn new(
        model: Arc<Model<S>>,
        shared: Arc<Shared<S>>,
        policy: FailurePolicy,
        state_tx: watch::Sender<Option<S>>,
    ) -> Self {
        Self {
            model,
            shared,
            policy,
            state: None,
            state_tx,
        }
    }

    /// Enters the initial state: no transition lookup, no transition or exit
    /// action, and the transition count is left alone.
    pub(crate) fn enter_initial(&mut self, initial: S) -> Outcome<S> {
        if let Some(current) = &self.state {
            tracing::debug!(
                machine = %self.shared.name,
                ?current,
                "ignoring initial entry, machine already has a state"
            );
            return Outcome::Ignored;
        }
        let event = TransitionTo(initial.clone());
        self.commit(None, initial, &event)
    }

    pub(crate) fn execute(&mut self, event: &dyn Event<S>) -> Outcome<S> {
        let shared = Arc::clone(&self.shared);
        let model = Arc::clone(&self.model);
        let machine = shared.name.as_str();

        let Some(current) = self.state.clone() else {
            tracing::debug!(machine, ?event, "ignoring event, initial state not entered yet");
            return Outcome::Ignored;
        };

        let ctx = ExecutionContext::new(machine, shared.transitions.load(Ordering::Acquire));
        event.on_processing(&ctx);

        let Some(desired) = event.desired_state(&current, &ctx) else {
            tracing::debug!(machine, ?event, ?current, "ignoring event without a desired state");
            return Outcome::Ignored;
        };

        let Some(transition) = model.transition_for(&current, &desired) else {
            tracing::debug!(
                machine,
                ?event,
                ?current,
                ?desired,
                "ignoring event, no transition defined"
            );
            return Outcome::Ignored;
        };

        if let Some(action) = transition.action() {
            let result = guarded(|| action(&current, &desired, event, &ctx));
            if let Err(error) = result {
                match self.recover(transition.name(), &current, &desired, event, error) {
                    Recovery::Proceed => {}
                    Recovery::Abandon => return Outcome::RolledBack,
                    Recovery::Halt => return Outcome::Halted,
                }
            }
        }

        if let Some(exit) = model.exit_action(&current) {
            let result = guarded(|| exit(&current, event, &ctx));
            if let Err(error) = result {
                match self.recover("exit action", &current, &desired, event, error) {
                    Recovery::Proceed => {}
                    Recovery::Abandon => return Outcome::RolledBack,
                    Recovery::Halt => return Outcome::Halted,
                }
            }
        }

        self.commit(Some(current), desired, event)
    }

    fn commit(&mut self, from: Option<S>, to: S, event: &dyn Event<S>) -> Outcome<S> {
        let shared = Arc::clone(&self.shared);
        let model = Arc::clone(&self.model);
        let machine = shared.name.as_str();

        self.state = Some(to.clone());
        self.state_tx.send_replace(Some(to.clone()));
        if from.is_some() {
            shared.transitions.fetch_add(1, Ordering::AcqRel);
        }
        tracing::debug!(machine, ?from, ?to, ?event, "transition committed");

        let ctx = ExecutionContext::new(machine, shared.transitions.load(Ordering::Acquire));
        event.on_processed(&ctx);

        let mut halted = false;
        let instruction = match model.entry_action(&to) {
            Some(entry) => match guarded(|| entry(from.as_ref(), &to, event, &ctx)) {
                Ok(instruction) => instruction,
                Err(error) => {
                    // the state is already committed, a rollback is just a failure here
                    let error = match error {
                        ActionError::Rollback(reason) => ActionError::Failed(reason),
                        failed => failed,
                    };
                    let from_state = from.as_ref().unwrap_or(&to);
                    halted = matches!(
                        self.recover("entry action", from_state, &to, event, error),
                        Recovery::Halt
                    );
                    Instruction::Nothing
                }
            },
            None => Instruction::Nothing,
        };

        shared.listeners.notify(machine, from.as_ref(), &to);

        if halted {
            Outcome::Halted
        } else {
            Outcome::Committed(instruction)
        }
    }

    fn recover(
        &self,
        stage: &str,
        from: &S,
        to: &S,
        event: &dyn Event<S>,
        error: ActionError,
    ) -> Recovery {
        let machine = self.shared.name.as_str();
        match (error, self.policy) {
            (ActionError::Rollback(reason), _) => {
                tracing::info!(machine, stage, ?event, ?from, ?to, %reason, "transition rolled back");
                Recovery::Abandon
            }
            (ActionError::Failed(reason), FailurePolicy::Continue) => {
                tracing::warn!(
                    machine,
                    stage,
                    ?event,
                    ?from,
                    ?to,
                    %reason,
                    "action failed, continuing with the transition"
                );
                Recovery::Proceed
            }
            (ActionError::Failed(reason), FailurePolicy::Stop) => {
                tracing::error!(
                    machine,
                    stage,
                    ?event,
                    ?from,
                    ?to,
                    %reason,
                    "action failed, stopping the machine"
                );
                self.shared.halt();
                Recovery::Halt
            }
        }
    }
}

enum Recovery {
    Proceed,
    Abandon,
    Halt,
}

/// Runs an action, turning a panic into [`ActionError::Failed`].
fn guarded<T>(action: impl FnOnce() -> Result<T, ActionError>) -> Result<T, ActionError> {
    catch_unwind(AssertUnwindSafe(action))
        .unwrap_or_else(|payload| Err(ActionError::Failed(panic_message(payload.as_ref()))))
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        format!("panicked: {message}")
    } else if let Some(message) = payload.downcast_ref::<String>() {
        format!("panicked: {message}")
    } else {
        "panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::sync::atomic::AtomicUsize;

    use super::*;
    use crate::config::MachineConfig;
    use crate::model::{ModelBuilder, Transition};

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    enum Light {
        Off,
        On,
        Broken,
    }

    fn engine_for(model: Model<Light>, policy: FailurePolicy) -> (Engine<Light>, Arc<Shared<Light>>) {
        let shared = Arc::new(Shared::new(&MachineConfig::named("light")));
        let (state_tx, _state_rx) = watch::channel(None);
        let engine = Engine::new(Arc::new(model), shared.clone(), policy, state_tx);
        (engine, shared)
    }

    #[test]
    fn commits_matching_transitions_in_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let model = {
            let (a, b, c) = (log.clone(), log.clone(), log.clone());
            ModelBuilder::new()
                .transition(Transition::new("turn on", [Light::Off], Light::On).with_action(
                    move |_, _, _, _| {
                        a.lock().unwrap().push("action");
                        Ok(())
                    },
                ))
                .on_exit(Light::Off, move |_, _, _| {
                    b.lock().unwrap().push("exit");
                    Ok(())
                })
                .on_enter(Light::On, move |_, _, _, _| {
                    c.lock().unwrap().push("entry");
                    Ok(Instruction::Nothing)
                })
                .build()
                .unwrap()
        };
        let (mut engine, shared) = engine_for(model, FailurePolicy::Continue);

        assert!(matches!(engine.enter_initial(Light::Off), Outcome::Committed(_)));
        assert_eq!(shared.transitions.load(Ordering::SeqCst), 0);

        assert!(matches!(
            engine.execute(&TransitionTo(Light::On)),
            Outcome::Committed(Instruction::Nothing)
        ));
        assert_eq!(engine.state, Some(Light::On));
        assert_eq!(shared.transitions.load(Ordering::SeqCst), 1);
        assert_eq!(*log.lock().unwrap(), vec!["action", "exit", "entry"]);
    }

    #[test]
    fn unmatched_events_are_ignored() {
        let model = ModelBuilder::new()
            .add("turn on", [Light::Off], Light::On)
            .build()
            .unwrap();
        let (mut engine, shared) = engine_for(model, FailurePolicy::Continue);
        let notified = Arc::new(AtomicUsize::new(0));
        {
            let notified = notified.clone();
            shared.listeners.add(Arc::new(move |_: Option<&Light>, _: &Light| {
                notified.fetch_add(1, Ordering::SeqCst);
            }));
        }

        assert!(matches!(engine.execute(&TransitionTo(Light::On)), Outcome::Ignored));
        engine.enter_initial(Light::Off);
        assert!(matches!(engine.execute(&TransitionTo(Light::Off)), Outcome::Ignored));
        assert!(matches!(engine.execute(&TransitionTo(Light::Broken)), Outcome::Ignored));

        assert_eq!(engine.state, Some(Light::Off));
        assert_eq!(shared.transitions.load(Ordering::SeqCst), 0);
        assert_eq!(notified.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn rollback_leaves_state_untouched() {
        let model = ModelBuilder::new()
            .transition(
                Transition::new("turn on", [Light::Off], Light::On)
                    .with_action(|_, _, _, _| Err(ActionError::rollback("no power"))),
            )
            .build()
            .unwrap();
        let (mut engine, shared) = engine_for(model, FailurePolicy::Stop);
        engine.enter_initial(Light::Off);

        assert!(matches!(
            engine.execute(&TransitionTo(Light::On)),
            Outcome::RolledBack
        ));
        assert_eq!(engine.state, Some(Light::Off));
        assert_eq!(shared.transitions.load(Ordering::SeqCst), 0);
        assert!(shared.transitions_allowed());
    }

    #[test]
    fn failures_follow_the_policy() {
        let build = || {
            ModelBuilder::new()
                .transition(
                    Transition::new("turn on", [Light::Off], Light::On)
                        .with_action(|_, _, _, _| Err(ActionError::failed("flicker"))),
                )
                .build()
                .unwrap()
        };

        let (mut engine, _) = engine_for(build(), FailurePolicy::Continue);
        engine.enter_initial(Light::Off);
        assert!(matches!(
            engine.execute(&TransitionTo(Light::On)),
            Outcome::Committed(_)
        ));
        assert_eq!(engine.state, Some(Light::On));

        let (mut engine, shared) = engine_for(build(), FailurePolicy::Stop);
        engine.enter_initial(Light::Off);
        assert!(matches!(engine.execute(&TransitionTo(Light::On)), Outcome::Halted));
        assert_eq!(engine.state, Some(Light::Off));
        assert!(!shared.transitions_allowed());
    }

    #[test]
    fn panicking_entry_action_keeps_the_committed_state() {
        let model = ModelBuilder::new()
            .add("turn on", [Light::Off], Light::On)
            .on_enter(Light::On, |_, _, _, _| -> Result<Instruction<Light>, ActionError> {
                panic!("bulb exploded")
            })
            .build()
            .unwrap();
        let (mut engine, shared) = engine_for(model, FailurePolicy::Continue);
        engine.enter_initial(Light::Off);

        assert!(matches!(
            engine.execute(&TransitionTo(Light::On)),
            Outcome::Committed(Instruction::Nothing)
        ));
        assert_eq!(engine.state, Some(Light::On));
        assert_eq!(shared.transitions.load(Ordering::SeqCst), 1);
    }
}
