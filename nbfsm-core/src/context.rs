/// Read-only view handed to events and actions while a transition runs.
///
/// A fresh context is created for every evaluation; it never outlives the
/// transition it describes.
#[derive(Debug, Clone, Copy)]
pub struct ExecutionContext<'a> {
    name: &'a str,
    transition_count: u64,
}

impl<'a> ExecutionContext<'a> {
    pub(crate) fn new(name: &'a str, transition_count: u64) -> Self {
        Self {
            name,
            transition_count,
        }
    }

    /// Name of the machine performing the transition.
    pub fn name(&self) -> &'a str {
        self.name
    }

    /// Number of transitions committed so far, not counting the entry into
    /// the initial state.
    pub fn transition_count(&self) -> u64 {
        self.transition_count
    }
}
