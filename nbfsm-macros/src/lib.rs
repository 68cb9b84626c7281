//! Proc macro for declaring nbfsm models on plain impl blocks.

use darling::FromMeta;
use darling::ast::NestedMeta;
use proc_macro::TokenStream;
use syn::{ItemImpl, parse_macro_input};

mod attrs;
mod codegen;
mod validation;

/// Declares a model from the associated functions of an impl block.
///
/// Functions tagged `#[transition(from = .., to = ..)]` become transition
/// actions, `#[on_enter(state = ..)]` and `#[on_exit(state = ..)]` become
/// state actions. Bare state names are resolved against the `state` type.
/// The macro adds `pub fn model() -> Result<Model<S>, ModelError>`.
///
/// ```rust,ignore
/// #[model(state = Light)]
/// impl LightModel {
///     #[transition(from = Off, to = On)]
///     fn switch_on(
///         _from: &Light,
///         _to: &Light,
///         _event: &dyn Event<Light>,
///         _ctx: &ExecutionContext<'_>,
///     ) -> Result<(), ActionError> {
///         Ok(())
///     }
/// }
///
/// let model = LightModel::model()?;
/// ```
#[proc_macro_attribute]
pub fn model(args: TokenStream, input: TokenStream) -> TokenStream {
    let input_impl = parse_macro_input!(input as ItemImpl);

    let nested = match NestedMeta::parse_meta_list(args.into()) {
        Ok(nested) => nested,
        Err(e) => return darling::Error::from(e).write_errors().into(),
    };
    let args = match attrs::ModelArgs::from_list(&nested) {
        Ok(args) => args,
        Err(e) => return e.write_errors().into(),
    };

    match generate_model(args, input_impl) {
        Ok(tokens) => tokens.into(),
        Err(e) => e.to_compile_error().into(),
    }
}

fn generate_model(args: attrs::ModelArgs, input: ItemImpl) -> syn::Result<proc_macro2::TokenStream> {
    let model = validation::ModelStructure::parse(args, &input)?;
    Ok(codegen::generate(&model, input))
}
