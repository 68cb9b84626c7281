//! Immutable description of a kind of state machine.
//!
//! A [`Model`] lists the transitions between states plus the optional entry
//! and exit actions of each state. It is built once through a
//! [`ModelBuilder`], validated eagerly, and then shared (usually behind an
//! `Arc`) by any number of machines without locking.

use std::collections::{HashMap, HashSet};
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::Arc;

use crate::context::ExecutionContext;
use crate::error::{ActionError, ModelError};
use crate::event::Event;
use crate::instruction::Instruction;

/// Values usable as machine states.
///
/// Implemented for every type with the required bounds; in practice a
/// fieldless `enum` deriving `Debug, Clone, PartialEq, Eq, Hash`.
pub trait State: Clone + Debug + Eq + Hash + Send + Sync + 'static {}

impl<T> State for T where T: Clone + Debug + Eq + Hash + Send + Sync + 'static {}

/// Action run when a transition fires, before the new state is committed.
///
/// Receives the starting state, the ending state, the event being processed
/// and the execution context.
pub type TransitionAction<S> = Arc<
    dyn Fn(&S, &S, &dyn Event<S>, &ExecutionContext<'_>) -> Result<(), ActionError>
        + Send
        + Sync,
>;

/// Action run after a state has been entered. The returned [`Instruction`]
/// tells the engine what to do next.
///
/// The previous state is `None` when entering the initial state.
pub type StateEntryAction<S> = Arc<
    dyn Fn(Option<&S>, &S, &dyn Event<S>, &ExecutionContext<'_>) -> Result<Instruction<S>, ActionError>
        + Send
        + Sync,
>;

/// Action run when leaving a state, before the new state is committed.
pub type StateExitAction<S> =
    Arc<dyn Fn(&S, &dyn Event<S>, &ExecutionContext<'_>) -> Result<(), ActionError> + Send + Sync>;

/// A named rule moving the machine from any of a set of states to one state.
pub struct Transition<S: State> {
    name: String,
    from: Vec<S>,
    to: S,
    action: Option<TransitionAction<S>>,
}

impl<S: State> Transition<S> {
    /// Creates a transition without an action.
    pub fn new(name: impl Into<String>, from: impl IntoIterator<Item = S>, to: S) -> Self {
        let mut states: Vec<S> = Vec::new();
        for state in from {
            if !states.contains(&state) {
                states.push(state);
            }
        }

        Self {
            name: name.into(),
            from: states,
            to,
            action: None,
        }
    }

    /// Attaches the action performed when this transition fires.
    pub fn with_action<F>(mut self, action: F) -> Self
    where
        F: Fn(&S, &S, &dyn Event<S>, &ExecutionContext<'_>) -> Result<(), ActionError>
            + Send
            + Sync
            + 'static,
    {
        self.action = Some(Arc::new(action));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// States from which this transition may start.
    pub fn from_states(&self) -> &[S] {
        &self.from
    }

    pub fn to_state(&self) -> &S {
        &self.to
    }

    /// Whether the transition may start from `state`.
    pub fn is_starting_state(&self, state: &S) -> bool {
        self.from.contains(state)
    }

    pub(crate) fn action(&self) -> Option<&TransitionAction<S>> {
        self.action.as_ref()
    }
}

impl<S: State> Debug for Transition<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transition")
            .field("name", &self.name)
            .field("from", &self.from)
            .field("to", &self.to)
            .field("has_action", &self.action.is_some())
            .finish()
    }
}

/// Immutable, validated set of transitions and state actions.
pub struct Model<S: State> {
    transitions: Vec<Transition<S>>,
    index: HashMap<S, HashMap<S, usize>>,
    entry_actions: HashMap<S, StateEntryAction<S>>,
    exit_actions: HashMap<S, StateExitAction<S>>,
}

impl<S: State> Model<S> {
    /// Starts describing a new model.
    pub fn builder() -> ModelBuilder<S> {
        ModelBuilder::new()
    }

    /// Resolves the transition from `from` to `to`, if the model defines one.
    pub fn transition_for(&self, from: &S, to: &S) -> Option<&Transition<S>> {
        self.index
            .get(from)
            .and_then(|targets| targets.get(to))
            .map(|&position| &self.transitions[position])
    }

    pub fn transitions(&self) -> &[Transition<S>] {
        &self.transitions
    }

    /// Every state mentioned by a transition or a state action.
    pub fn states(&self) -> HashSet<S> {
        let mut states = HashSet::new();
        for transition in &self.transitions {
            states.extend(transition.from.iter().cloned());
            states.insert(transition.to.clone());
        }
        states.extend(self.entry_actions.keys().cloned());
        states.extend(self.exit_actions.keys().cloned());
        states
    }

    pub fn has_entry_action(&self, state: &S) -> bool {
        self.entry_actions.contains_key(state)
    }

    pub fn has_exit_action(&self, state: &S) -> bool {
        self.exit_actions.contains_key(state)
    }

    pub(crate) fn entry_action(&self, state: &S) -> Option<&StateEntryAction<S>> {
        self.entry_actions.get(state)
    }

    pub(crate) fn exit_action(&self, state: &S) -> Option<&StateExitAction<S>> {
        self.exit_actions.get(state)
    }
}

impl<S: State> Debug for Model<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Model")
            .field("transitions", &self.transitions)
            .field("entry_actions", &self.entry_actions.keys().collect::<Vec<_>>())
            .field("exit_actions", &self.exit_actions.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Fluent builder for [`Model`].
///
/// All structural checks happen in [`build`](Self::build).
pub struct ModelBuilder<S: State> {
    transitions: Vec<Transition<S>>,
    entry_actions: Vec<(S, StateEntryAction<S>)>,
    exit_actions: Vec<(S, StateExitAction<S>)>,
    require_entry_actions: bool,
}

impl<S: State> ModelBuilder<S> {
    pub fn new() -> Self {
        Self {
            transitions: Vec::new(),
            entry_actions: Vec::new(),
            exit_actions: Vec::new(),
            require_entry_actions: false,
        }
    }

    /// Adds a transition.
    pub fn transition(mut self, transition: Transition<S>) -> Self {
        self.transitions.push(transition);
        self
    }

    /// Shorthand for a transition without an action.
    pub fn add(self, name: impl Into<String>, from: impl IntoIterator<Item = S>, to: S) -> Self {
        self.transition(Transition::new(name, from, to))
    }

    /// Registers the action run whenever `state` is entered.
    pub fn on_enter<F>(mut self, state: S, action: F) -> Self
    where
        F: Fn(Option<&S>, &S, &dyn Event<S>, &ExecutionContext<'_>) -> Result<Instruction<S>, ActionError>
            + Send
            + Sync
            + 'static,
    {
        self.entry_actions.push((state, Arc::new(action)));
        self
    }

    /// Registers the action run whenever `state` is left.
    pub fn on_exit<F>(mut self, state: S, action: F) -> Self
    where
        F: Fn(&S, &dyn Event<S>, &ExecutionContext<'_>) -> Result<(), ActionError>
            + Send
            + Sync
            + 'static,
    {
        self.exit_actions.push((state, Arc::new(action)));
        self
    }

    /// Makes [`build`](Self::build) reject models where a transition target
    /// has no entry action.
    pub fn require_entry_actions(mut self) -> Self {
        self.require_entry_actions = true;
        self
    }

    /// Validates the description and produces the immutable model.
    pub fn build(self) -> Result<Model<S>, ModelError> {
        if self.transitions.is_empty() {
            return Err(ModelError::NoTransitions);
        }

        let mut index: HashMap<S, HashMap<S, usize>> = HashMap::new();
        for (position, transition) in self.transitions.iter().enumerate() {
            if transition.from.is_empty() {
                return Err(ModelError::EmptyFromStates {
                    transition: transition.name.clone(),
                });
            }

            for from in &transition.from {
                let targets = index.entry(from.clone()).or_default();
                if let Some(&existing) = targets.get(&transition.to) {
                    return Err(ModelError::AmbiguousTransition {
                        from: format!("{from:?}"),
                        to: format!("{:?}", transition.to),
                        first: self.transitions[existing].name.clone(),
                        second: transition.name.clone(),
                    });
                }
                targets.insert(transition.to.clone(), position);
            }
        }

        let mut entry_actions = HashMap::new();
        for (state, action) in self.entry_actions {
            if entry_actions.contains_key(&state) {
                return Err(ModelError::DuplicateEntryAction {
                    state: format!("{state:?}"),
                });
            }
            entry_actions.insert(state, action);
        }

        let mut exit_actions = HashMap::new();
        for (state, action) in self.exit_actions {
            if exit_actions.contains_key(&state) {
                return Err(ModelError::DuplicateExitAction {
                    state: format!("{state:?}"),
                });
            }
            exit_actions.insert(state, action);
        }

        if self.require_entry_actions {
            if let Some(transition) = self
                .transitions
                .iter()
                .find(|t| !entry_actions.contains_key(&t.to))
            {
                return Err(ModelError::MissingEntryAction {
                    state: format!("{:?}", transition.to),
                });
            }
        }

        Ok(Model {
            transitions: self.transitions,
            index,
            entry_actions,
            exit_actions,
        })
    }
}

impl<S: State> Default for ModelBuilder<S> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    enum Light {
        Off,
        On,
        Broken,
    }

    fn light_model() -> Result<Model<Light>, ModelError> {
        ModelBuilder::new()
            .add("turn on", [Light::Off], Light::On)
            .add("turn off", [Light::On], Light::Off)
            .add("break", [Light::Off, Light::On], Light::Broken)
            .build()
    }

    #[test]
    fn resolves_transitions_by_state_pair() {
        let model = light_model().unwrap();

        assert_eq!(
            model.transition_for(&Light::Off, &Light::On).map(Transition::name),
            Some("turn on")
        );
        assert_eq!(
            model.transition_for(&Light::On, &Light::Broken).map(Transition::name),
            Some("break")
        );
        assert!(model.transition_for(&Light::Off, &Light::Off).is_none());
        assert!(model.transition_for(&Light::Broken, &Light::On).is_none());
    }

    #[test]
    fn rejects_ambiguous_transitions() {
        let result = ModelBuilder::new()
            .add("break", [Light::Off, Light::On], Light::Broken)
            .add("smash", [Light::On], Light::Broken)
            .build();

        assert_eq!(
            result.unwrap_err(),
            ModelError::AmbiguousTransition {
                from: "On".into(),
                to: "Broken".into(),
                first: "break".into(),
                second: "smash".into(),
            }
        );
    }

    #[test]
    fn rejects_transitions_without_starting_states() {
        let result = ModelBuilder::new()
            .add("nowhere", Vec::<Light>::new(), Light::On)
            .build();

        assert!(matches!(result, Err(ModelError::EmptyFromStates { .. })));
    }

    #[test]
    fn rejects_empty_models() {
        let result = ModelBuilder::<Light>::new().build();

        assert_eq!(result.unwrap_err(), ModelError::NoTransitions);
    }

    #[test]
    fn rejects_duplicate_state_actions() {
        let result = ModelBuilder::new()
            .add("turn on", [Light::Off], Light::On)
            .on_enter(Light::On, |_, _, _, _| Ok(Instruction::Nothing))
            .on_enter(Light::On, |_, _, _, _| Ok(Instruction::Nothing))
            .build();
        assert!(matches!(result, Err(ModelError::DuplicateEntryAction { .. })));

        let result = ModelBuilder::new()
            .add("turn on", [Light::Off], Light::On)
            .on_exit(Light::Off, |_, _, _| Ok(()))
            .on_exit(Light::Off, |_, _, _| Ok(()))
            .build();
        assert!(matches!(result, Err(ModelError::DuplicateExitAction { .. })));
    }

    #[test]
    fn entry_actions_are_optional_unless_required() {
        let model = ModelBuilder::new()
            .add("turn on", [Light::Off], Light::On)
            .build()
            .unwrap();
        assert!(!model.has_entry_action(&Light::On));

        let result = ModelBuilder::new()
            .add("turn on", [Light::Off], Light::On)
            .require_entry_actions()
            .build();
        assert_eq!(
            result.unwrap_err(),
            ModelError::MissingEntryAction { state: "On".into() }
        );
    }

    #[test]
    fn self_transitions_are_allowed() {
        let model = ModelBuilder::new()
            .add("blink", [Light::On], Light::On)
            .build()
            .unwrap();

        assert!(model.transition_for(&Light::On, &Light::On).is_some());
        assert_eq!(model.states(), HashSet::from([Light::On]));
    }
}
