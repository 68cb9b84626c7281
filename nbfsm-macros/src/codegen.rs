//! Code generation for the model constructor.

use proc_macro2::TokenStream;
use quote::quote;
use syn::{ImplItem, ItemImpl};

use crate::attrs;
use crate::validation::{ModelStructure, StateActionDecl};

/// Re-emits the impl block without the helper attributes and adds
/// `pub fn model()`.
pub fn generate(model: &ModelStructure, mut impl_block: ItemImpl) -> TokenStream {
    for item in &mut impl_block.items {
        if let ImplItem::Fn(method) = item {
            method.attrs.retain(|attr| !attrs::is_helper(attr));
        }
    }

    let constructor = render_constructor(model);
    impl_block.items.push(ImplItem::Verbatim(constructor));

    quote! { #impl_block }
}

fn render_constructor(model: &ModelStructure) -> TokenStream {
    let state_ty = &model.state_ty;

    let transitions = model.transitions.iter().map(|decl| {
        let name = &decl.name;
        let from = &decl.from;
        let to = &decl.to;
        let action = &decl.action;
        quote! {
            .transition(
                ::nbfsm::Transition::new(#name, [#(#from),*], #to).with_action(Self::#action)
            )
        }
    });
    let entry_actions = render_state_actions(&model.entry_actions, quote!(on_enter));
    let exit_actions = render_state_actions(&model.exit_actions, quote!(on_exit));
    let require_entry_actions = model
        .require_entry_actions
        .then(|| quote!(.require_entry_actions()));

    quote! {
        /// Builds the model declared by this impl block.
        pub fn model() -> ::core::result::Result<::nbfsm::Model<#state_ty>, ::nbfsm::ModelError> {
            ::nbfsm::ModelBuilder::<#state_ty>::new()
                #(#transitions)*
                #(#entry_actions)*
                #(#exit_actions)*
                #require_entry_actions
                .build()
        }
    }
}

fn render_state_actions(decls: &[StateActionDecl], register: TokenStream) -> Vec<TokenStream> {
    decls
        .iter()
        .map(|decl| {
            let state = &decl.state;
            let action = &decl.action;
            quote! { .#register(#state, Self::#action) }
        })
        .collect()
}
