// These lints are triggered by darling's generated code for
// `#[darling(default)]`.
#![allow(clippy::option_if_let_else)]
#![allow(clippy::needless_continue)]

use darling::{FromDeriveInput, FromField, ast::Data};
use heck::ToKebabCase;
use proc_macro::TokenStream;
use proc_macro2::TokenStream as TokenStream2;
use quote::quote;
use syn::{DeriveInput, Ident, parse_macro_input};

/// Configuration for the `#[entity(...)]` container attribute.
#[derive(Debug, FromDeriveInput)]
#[darling(attributes(entity), supports(struct_named))]
struct EntityArgs {
    ident: Ident,
    generics: syn::Generics,
    data: Data<(), EntityField>,
    #[darling(default)]
    namespace: Option<String>,
}

/// A named field, optionally tagged `#[entity(id)]`.
#[derive(Debug, FromField)]
#[darling(attributes(entity))]
struct EntityField {
    ident: Option<Ident>,
    ty: syn::Type,
    #[darling(default)]
    id: bool,
}

/// Returns the namespace override or the default kebab-case name from the
/// ident.
fn default_namespace(ident: &Ident, namespace: Option<String>) -> String {
    namespace.unwrap_or_else(|| ident.to_string().to_kebab_case())
}

/// Parse derive input with darling and render errors as tokens.
fn parse_or_error<T, F>(input: &DeriveInput, f: F) -> TokenStream2
where
    T: FromDeriveInput,
    F: FnOnce(T) -> TokenStream2,
{
    match T::from_derive_input(input) {
        Ok(args) => f(args),
        Err(err) => err.write_errors(),
    }
}

/// Picks the ID field: the single field tagged `#[entity(id)]`, otherwise a
/// field named `id`.
fn id_field<'a>(ident: &Ident, fields: &'a [EntityField]) -> darling::Result<&'a EntityField> {
    let mut tagged = fields.iter().filter(|field| field.id);
    if let Some(first) = tagged.next() {
        if let Some(second) = tagged.next() {
            let span = second.ident.as_ref().unwrap_or(ident);
            return Err(
                darling::Error::custom("only one field may be marked `#[entity(id)]`").with_span(span),
            );
        }
        return Ok(first);
    }
    fields
        .iter()
        .find(|field| field.ident.as_ref().is_some_and(|name| name == "id"))
        .ok_or_else(|| {
            darling::Error::custom("no ID field: mark one with `#[entity(id)]` or name it `id`")
                .with_span(ident)
        })
}

/// Derives the `Entity` trait for a struct with named fields.
///
/// The ID field is the one marked `#[entity(id)]`, or the field named `id`
/// when none is marked. Its type must implement `memlog::entity::IdField`
/// (`String`, `Option<T>`, `Uuid` and the integer types do), which also
/// decides when the ID counts as absent.
///
/// # Attributes
///
/// ## Optional
/// - `namespace = "name"` - Namespace used by `Repository::new` (default:
///   kebab-case struct name)
///
/// # Example
///
/// ```ignore
/// #[derive(Clone, Serialize, Deserialize, Entity)]
/// #[entity(namespace = "blog-posts")]
/// pub struct BlogPost {
///     #[entity(id)]
///     slug: String,
///     title: String,
/// }
/// ```
#[proc_macro_derive(Entity, attributes(entity))]
pub fn derive_entity(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);

    derive_entity_impl(&input).into()
}

/// Internal entry point that returns tokens for the entity derive.
fn derive_entity_impl(input: &DeriveInput) -> TokenStream2 {
    parse_or_error::<EntityArgs, _>(input, generate_entity_impl)
}

/// Generate the entity derive implementation tokens.
fn generate_entity_impl(args: EntityArgs) -> TokenStream2 {
    let Some(fields) = args.data.take_struct() else {
        return darling::Error::unsupported_shape("enum")
            .with_span(&args.ident)
            .write_errors();
    };
    let fields = fields.fields;
    let field = match id_field(&args.ident, &fields) {
        Ok(field) => field,
        Err(err) => return err.write_errors(),
    };

    let struct_name = &args.ident;
    let namespace = default_namespace(struct_name, args.namespace);
    let (impl_generics, ty_generics, where_clause) = args.generics.split_for_impl();
    let field_name = &field.ident;
    let field_ty = &field.ty;

    quote! {
        impl #impl_generics ::memlog::Entity for #struct_name #ty_generics #where_clause {
            const NAMESPACE: &'static str = #namespace;
            type Id = <#field_ty as ::memlog::entity::IdField>::Id;

            fn id(&self) -> ::core::option::Option<Self::Id> {
                ::memlog::entity::IdField::get(&self.#field_name)
            }

            fn set_id(&mut self, id: Self::Id) {
                ::memlog::entity::IdField::set(&mut self.#field_name, id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use syn::parse_quote;

    use super::*;

    /// Normalise token output by removing whitespace.
    fn compact(tokens: &TokenStream2) -> String {
        tokens
            .to_string()
            .chars()
            .filter(|c| !c.is_whitespace())
            .collect()
    }

    #[test]
    /// Confirms the `id` field and kebab-case namespace are used by default.
    fn generate_entity_impl_uses_id_field_and_default_namespace() {
        let input: DeriveInput = parse_quote! {
            pub struct BlogPost {
                id: String,
                title: String,
            }
        };

        let compact = compact(&derive_entity_impl(&input));

        assert!(compact.contains("impl::memlog::EntityforBlogPost"));
        assert!(compact.contains("constNAMESPACE:&'staticstr=\"blog-post\""));
        assert!(compact.contains("typeId=<Stringas::memlog::entity::IdField>::Id"));
        assert!(compact.contains("IdField::get(&self.id)"));
    }

    #[test]
    /// Confirms `#[entity(id)]` and the namespace override are honored.
    fn generate_entity_impl_respects_tagged_field_and_namespace() {
        let input: DeriveInput = parse_quote! {
            #[entity(namespace = "posts")]
            pub struct BlogPost {
                id: String,
                #[entity(id)]
                slug: Option<u64>,
            }
        };

        let compact = compact(&derive_entity_impl(&input));

        assert!(compact.contains("constNAMESPACE:&'staticstr=\"posts\""));
        assert!(compact.contains("typeId=<Option<u64>as::memlog::entity::IdField>::Id"));
        assert!(compact.contains("IdField::set(&mutself.slug,id)"));
    }

    #[test]
    /// Confirms generics are carried onto the impl.
    fn generate_entity_impl_keeps_generics() {
        let input: DeriveInput = parse_quote! {
            pub struct Wrapper<T: Clone> {
                id: u64,
                value: T,
            }
        };

        let compact = compact(&derive_entity_impl(&input));

        assert!(compact.contains("impl<T:Clone>::memlog::EntityforWrapper<T>"));
        assert!(compact.contains("\"wrapper\""));
    }

    #[test]
    /// Ensures a struct without an ID field yields a compile-time error.
    fn generate_entity_impl_emits_error_without_id_field() {
        let input: DeriveInput = parse_quote! {
            pub struct Note {
                body: String,
            }
        };

        let compact = compact(&derive_entity_impl(&input));

        assert!(compact.contains("compile_error"));
        assert!(compact.contains("noIDfield"));
    }

    #[test]
    /// Ensures two tagged fields yield a compile-time error.
    fn generate_entity_impl_emits_error_on_multiple_id_fields() {
        let input: DeriveInput = parse_quote! {
            pub struct Note {
                #[entity(id)]
                a: String,
                #[entity(id)]
                b: String,
            }
        };

        let compact = compact(&derive_entity_impl(&input));

        assert!(compact.contains("onlyonefieldmaybemarked"));
    }

    #[test]
    /// Ensures enums are rejected.
    fn generate_entity_impl_rejects_enums() {
        let input: DeriveInput = parse_quote! {
            pub enum Note {
                A { id: String },
            }
        };

        let compact = compact(&derive_entity_impl(&input));

        assert!(compact.contains("compile_error"));
        assert!(!compact.contains("impl::memlog::Entity"));
    }
}
