//! Collects and validates the model declared on an impl block.

use std::collections::HashMap;

use darling::FromMeta;
use quote::ToTokens;
use syn::{Error, Ident, ImplItem, ImplItemFn, ItemImpl, Path, parse_quote};

use crate::attrs::{self, ModelArgs, StateActionAttr, TransitionAttr};

/// A transition backed by an associated function.
#[derive(Debug)]
pub struct TransitionDecl {
    pub name: String,
    pub from: Vec<Path>,
    pub to: Path,
    pub action: Ident,
}

/// An entry or exit action backed by an associated function.
#[derive(Debug)]
pub struct StateActionDecl {
    pub state: Path,
    pub action: Ident,
}

/// The complete model after parsing.
#[derive(Debug)]
pub struct ModelStructure {
    pub state_ty: Path,
    pub require_entry_actions: bool,
    pub transitions: Vec<TransitionDecl>,
    pub entry_actions: Vec<StateActionDecl>,
    pub exit_actions: Vec<StateActionDecl>,
}

impl ModelStructure {
    /// Parse the impl block and extract the model.
    pub fn parse(args: ModelArgs, impl_block: &ItemImpl) -> syn::Result<Self> {
        let mut model = Self {
            state_ty: args.state,
            require_entry_actions: args.require_entry_actions,
            transitions: Vec::new(),
            entry_actions: Vec::new(),
            exit_actions: Vec::new(),
        };

        for item in &impl_block.items {
            if let ImplItem::Fn(method) = item {
                model.collect(method)?;
            }
        }

        if model.transitions.is_empty() {
            return Err(Error::new_spanned(
                &impl_block.self_ty,
                "Model declares no transitions; tag at least one function with #[transition(...)]",
            ));
        }

        model.check_unambiguous()?;
        Ok(model)
    }

    fn collect(&mut self, method: &ImplItemFn) -> syn::Result<()> {
        let helpers: Vec<_> = method.attrs.iter().filter(|attr| attrs::is_helper(attr)).collect();
        if helpers.is_empty() {
            return Ok(());
        }

        if let Some(receiver) = method.sig.receiver() {
            return Err(Error::new_spanned(
                receiver,
                "Model actions must be associated functions without a self receiver",
            ));
        }

        let transitions = helpers
            .iter()
            .filter(|attr| attr.path().is_ident(attrs::TRANSITION))
            .count();
        if transitions > 0 && transitions < helpers.len() {
            return Err(Error::new_spanned(
                &method.sig.ident,
                "A function cannot be both a transition action and a state action",
            ));
        }

        let action = method.sig.ident.clone();
        let mut grouped: Vec<TransitionDecl> = Vec::new();

        for attr in helpers {
            if attr.path().is_ident(attrs::TRANSITION) {
                let parsed = TransitionAttr::from_meta(&attr.meta)?;
                if parsed.from.is_empty() {
                    return Err(Error::new_spanned(
                        attr,
                        "#[transition] needs at least one `from` state",
                    ));
                }
                let to = self.resolve(&parsed.to);
                let name = parsed
                    .name
                    .map(|name| name.value())
                    .unwrap_or_else(|| action.to_string());
                let from = parsed.from.iter().map(|state| self.resolve(state));

                // stacked attributes with the same target share one transition
                match grouped
                    .iter_mut()
                    .find(|decl| decl.name == name && same(&decl.to, &to))
                {
                    Some(decl) => decl.from.extend(from),
                    None => grouped.push(TransitionDecl {
                        name,
                        from: from.collect(),
                        to,
                        action: action.clone(),
                    }),
                }
            } else {
                let parsed = StateActionAttr::from_meta(&attr.meta)?;
                let state = self.resolve(&parsed.state);
                let (actions, kind) = if attr.path().is_ident(attrs::ON_ENTER) {
                    (&mut self.entry_actions, "entry")
                } else {
                    (&mut self.exit_actions, "exit")
                };
                if let Some(existing) = actions.iter().find(|decl| same(&decl.state, &state)) {
                    return Err(Error::new_spanned(
                        attr,
                        format!(
                            "Duplicate {kind} action for state {}, already declared by `{}`",
                            display(&state),
                            existing.action
                        ),
                    ));
                }
                actions.push(StateActionDecl {
                    state,
                    action: action.clone(),
                });
            }
        }

        self.transitions.extend(grouped);
        Ok(())
    }

    /// Rejects two transitions covering the same `(from, to)` pair.
    fn check_unambiguous(&self) -> syn::Result<()> {
        let mut seen: HashMap<(String, String), &TransitionDecl> = HashMap::new();
        for decl in &self.transitions {
            for from in &decl.from {
                let key = (display(from), display(&decl.to));
                if let Some(first) = seen.get(&key) {
                    if first.name == decl.name && first.action == decl.action {
                        // the same state listed twice on one transition
                        continue;
                    }
                    return Err(Error::new_spanned(
                        &decl.action,
                        format!(
                            "Transitions `{}` and `{}` both move from {} to {}",
                            first.name, decl.name, key.0, key.1
                        ),
                    ));
                }
                seen.insert(key, decl);
            }
        }
        Ok(())
    }

    /// Qualifies bare variant names with the state type.
    fn resolve(&self, state: &Path) -> Path {
        if state.leading_colon.is_none() && state.segments.len() == 1 {
            let state_ty = &self.state_ty;
            let variant = &state.segments[0];
            parse_quote!(#state_ty::#variant)
        } else {
            state.clone()
        }
    }
}

fn display(path: &Path) -> String {
    path.to_token_stream().to_string().replace(' ', "")
}

fn same(a: &Path, b: &Path) -> bool {
    display(a) == display(b)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(impl_block: ItemImpl) -> syn::Result<ModelStructure> {
        let args = ModelArgs {
            state: parse_quote!(Light),
            require_entry_actions: false,
        };
        ModelStructure::parse(args, &impl_block)
    }

    #[test]
    fn stacked_transition_attributes_share_one_transition() {
        let model = parse(parse_quote! {
            impl LightModel {
                #[transition(from = Off, to = Broken)]
                #[transition(from = On, to = Broken)]
                fn smash(_: &Light, _: &Light, _: &dyn Event<Light>, _: &ExecutionContext) -> Result<(), ActionError> {
                    Ok(())
                }

                #[on_enter(state = Broken)]
                fn broken(_: Option<&Light>, _: &Light, _: &dyn Event<Light>, _: &ExecutionContext) -> Result<Instruction<Light>, ActionError> {
                    Ok(Instruction::Nothing)
                }

                fn helper() {}
            }
        })
        .unwrap();

        assert_eq!(model.transitions.len(), 1);
        let smash = &model.transitions[0];
        assert_eq!(smash.name, "smash");
        assert_eq!(
            smash.from.iter().map(display).collect::<Vec<_>>(),
            vec!["Light::Off", "Light::On"]
        );
        assert_eq!(display(&smash.to), "Light::Broken");
        assert_eq!(model.entry_actions.len(), 1);
        assert!(model.exit_actions.is_empty());
    }

    #[test]
    fn rejects_ambiguous_pairs() {
        let result = parse(parse_quote! {
            impl LightModel {
                #[transition(from = On, to = Broken)]
                fn smash() {}

                #[transition(from = On, to = Light::Broken)]
                fn drop_it() {}
            }
        });

        let message = result.unwrap_err().to_string();
        assert!(message.contains("`smash` and `drop_it`"), "{message}");
    }

    #[test]
    fn rejects_self_receivers_and_missing_from() {
        let result = parse(parse_quote! {
            impl LightModel {
                #[transition(from = Off, to = On)]
                fn switch(&self) {}
            }
        });
        assert!(result.is_err());

        let result = parse(parse_quote! {
            impl LightModel {
                #[transition(to = On)]
                fn switch() {}
            }
        });
        assert!(result.unwrap_err().to_string().contains("at least one `from`"));
    }

    #[test]
    fn rejects_duplicate_state_actions() {
        let result = parse(parse_quote! {
            impl LightModel {
                #[transition(from = Off, to = On)]
                fn switch() {}

                #[on_exit(state = Off)]
                fn leave() {}

                #[on_exit(state = Light::Off)]
                fn leave_again() {}
            }
        });

        assert!(result.unwrap_err().to_string().contains("Duplicate exit action"));
    }

    #[test]
    fn requires_a_transition() {
        let result = parse(parse_quote! {
            impl LightModel {
                #[on_enter(state = On)]
                fn entered() {}
            }
        });

        assert!(result.is_err());
    }
}
