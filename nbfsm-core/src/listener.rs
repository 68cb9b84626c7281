//! Transition listeners and their copy-on-write registry.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use crate::model::State;

/// Observer notified after every committed transition.
///
/// `from` is `None` for the entry into the initial state. Listeners run on
/// the machine's worker, so they should return quickly.
pub trait TransitionListener<S: State>: Send + Sync + 'static {
    fn on_transition(&self, from: Option<&S>, to: &S);
}

impl<S, F> TransitionListener<S> for F
where
    S: State,
    F: Fn(Option<&S>, &S) + Send + Sync + 'static,
{
    fn on_transition(&self, from: Option<&S>, to: &S) {
        self(from, to)
    }
}

/// Handle returned by `add_listener`, used to remove the listener again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type Entries<S> = Arc<Vec<(ListenerId, Arc<dyn TransitionListener<S>>)>>;

/// Registry read on every transition and written rarely.
///
/// Writers replace the whole list, so a notification in progress keeps
/// iterating its own snapshot.
pub(crate) struct Listeners<S: State> {
    next_id: AtomicU64,
    entries: RwLock<Entries<S>>,
}

impl<S: State> Listeners<S> {
    pub(crate) fn new() -> Self {
        Self {
            next_id: AtomicU64::new(0),
            entries: RwLock::new(Arc::new(Vec::new())),
        }
    }

    pub(crate) fn add(&self, listener: Arc<dyn TransitionListener<S>>) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let mut updated = Vec::with_capacity(entries.len() + 1);
        updated.extend(entries.iter().cloned());
        updated.push((id, listener));
        *entries = Arc::new(updated);
        id
    }

    pub(crate) fn remove(&self, id: ListenerId) -> bool {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        if !entries.iter().any(|(existing, _)| *existing == id) {
            return false;
        }
        let updated = entries
            .iter()
            .filter(|(existing, _)| *existing != id)
            .cloned()
            .collect();
        *entries = Arc::new(updated);
        true
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.snapshot().len()
    }

    fn snapshot(&self) -> Entries<S> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Notifies every registered listener in registration order. A panicking
    /// listener is logged and skipped.
    pub(crate) fn notify(&self, machine: &str, from: Option<&S>, to: &S) {
        for (id, listener) in self.snapshot().iter() {
            let outcome = catch_unwind(AssertUnwindSafe(|| listener.on_transition(from, to)));
            if outcome.is_err() {
                tracing::warn!(
                    machine,
                    listener = id.0,
                    ?from,
                    ?to,
                    "transition listener panicked"
                );
            }
        }
    }
}
