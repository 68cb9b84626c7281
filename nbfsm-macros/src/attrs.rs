//! Attribute parsing for the model macro.

use darling::FromMeta;
use syn::{LitStr, Path};

/// Arguments for the `#[model(state = Light)]` attribute.
#[derive(Debug, FromMeta)]
pub struct ModelArgs {
    /// The state type of the model (required).
    pub state: Path,

    /// Reject models where a transition target has no entry action.
    #[darling(default)]
    pub require_entry_actions: bool,
}

/// Arguments for `#[transition(from = Off, from = Dim, to = On)]`.
#[derive(Debug, FromMeta)]
pub struct TransitionAttr {
    /// Starting states; repeat `from` for more than one.
    #[darling(multiple)]
    pub from: Vec<Path>,
    /// Ending state.
    pub to: Path,
    /// Transition name, defaults to the function name.
    #[darling(default)]
    pub name: Option<LitStr>,
}

/// Arguments for `#[on_enter(state = On)]` and `#[on_exit(state = On)]`.
#[derive(Debug, FromMeta)]
pub struct StateActionAttr {
    pub state: Path,
}

pub const TRANSITION: &str = "transition";
pub const ON_ENTER: &str = "on_enter";
pub const ON_EXIT: &str = "on_exit";

/// Whether `attr` is one of the helper attributes consumed by `#[model]`.
pub fn is_helper(attr: &syn::Attribute) -> bool {
    [TRANSITION, ON_ENTER, ON_EXIT]
        .iter()
        .any(|name| attr.path().is_ident(name))
}
