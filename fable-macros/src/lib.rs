//! Proc macros for structured model output.
//!
//! Provides `#[derive(OutputSchema)]`, which generates the JSON schema a
//! structured-extraction call is constrained to, straight from the struct
//! definition and its doc comments.
//!
//! # Example
//!
//! ```ignore
//! /// Entries the model judged relevant to the current turn
//! #[derive(OutputSchema, Deserialize)]
//! #[schema(name = "entry_selection")]
//! struct EntrySelection {
//!     /// Ids of the accepted entries
//!     selected: Vec<String>,
//!     /// Short justification
//!     #[schema(optional)]
//!     reason: String,
//! }
//! ```

use proc_macro::TokenStream;
use proc_macro2::TokenStream as TokenStream2;
use quote::quote;
use syn::{parse_macro_input, DeriveInput, Field, Lit, Meta, Type};

/// Derive macro implementing `fable_core::structured::OutputSchema`.
///
/// # Attributes
///
/// - `#[schema(name = "...")]` - Override the schema name (defaults to snake_case struct name)
/// - `#[schema(optional)]` on fields - Leave the field out of `required`
/// - `#[schema(rename = "...")]` on fields - Override the property name
/// - `#[schema(nested)]` on fields - Embed the field type's own `OutputSchema`
#[proc_macro_derive(OutputSchema, attributes(schema))]
pub fn derive_output_schema(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);
    expand_output_schema(input)
        .unwrap_or_else(|err| err.to_compile_error())
        .into()
}

fn expand_output_schema(input: DeriveInput) -> syn::Result<TokenStream2> {
    let struct_name = &input.ident;
    let schema_name = get_schema_name(&input)?;
    let description = get_doc_comment(&input.attrs);

    let fields = match &input.data {
        syn::Data::Struct(data) => match &data.fields {
            syn::Fields::Named(named) => &named.named,
            _ => {
                return Err(syn::Error::new_spanned(
                    input,
                    "OutputSchema derive only supports structs with named fields",
                ))
            }
        },
        _ => {
            return Err(syn::Error::new_spanned(
                input,
                "OutputSchema derive only supports structs",
            ))
        }
    };

    let mut property_tokens = Vec::new();
    let mut required_fields = Vec::new();

    for field in fields {
        let property_name = get_property_name(field)?;
        let field_desc = get_doc_comment(&field.attrs);
        let flags = field_flags(field)?;
        let field_type = &field.ty;

        let type_schema = if flags.nested {
            nested_schema(field_type)
        } else {
            type_to_schema(field_type)
        };

        let desc_token = if field_desc.is_empty() {
            quote! {}
        } else {
            quote! { property["description"] = serde_json::json!(#field_desc); }
        };

        property_tokens.push(quote! {
            {
                let mut property = #type_schema;
                #desc_token
                properties.insert(#property_name.to_string(), property);
            }
        });

        if !flags.optional && !is_wrapper(field_type, "Option") {
            required_fields.push(property_name);
        }
    }

    Ok(quote! {
        impl ::fable_core::structured::OutputSchema for #struct_name {
            fn schema_name() -> &'static str {
                #schema_name
            }

            fn schema_description() -> &'static str {
                #description
            }

            fn output_schema() -> serde_json::Value {
                let mut properties = serde_json::Map::new();
                #(#property_tokens)*

                let required: Vec<&str> = vec![#(#required_fields),*];

                serde_json::json!({
                    "type": "object",
                    "properties": properties,
                    "required": required,
                    "additionalProperties": false
                })
            }
        }
    })
}

#[derive(Default)]
struct FieldFlags {
    optional: bool,
    nested: bool,
}

fn schema_metas(attrs: &[syn::Attribute]) -> syn::Result<Vec<Meta>> {
    let mut metas = Vec::new();
    for attr in attrs {
        if attr.path().is_ident("schema") {
            let parsed = attr.parse_args_with(
                syn::punctuated::Punctuated::<Meta, syn::Token![,]>::parse_terminated,
            )?;
            metas.extend(parsed);
        }
    }
    Ok(metas)
}

fn string_value(meta: &Meta, key: &str) -> Option<String> {
    if let Meta::NameValue(nv) = meta {
        if nv.path.is_ident(key) {
            if let syn::Expr::Lit(expr_lit) = &nv.value {
                if let Lit::Str(s) = &expr_lit.lit {
                    return Some(s.value());
                }
            }
        }
    }
    None
}

fn get_schema_name(input: &DeriveInput) -> syn::Result<String> {
    for meta in schema_metas(&input.attrs)? {
        if let Some(name) = string_value(&meta, "name") {
            return Ok(name);
        }
    }
    Ok(to_snake_case(&input.ident.to_string()))
}

fn get_property_name(field: &Field) -> syn::Result<String> {
    for meta in schema_metas(&field.attrs)? {
        if let Some(name) = string_value(&meta, "rename") {
            return Ok(name);
        }
    }

    field
        .ident
        .as_ref()
        .map(|ident| ident.to_string())
        .ok_or_else(|| syn::Error::new_spanned(field, "expected a named field"))
}

fn field_flags(field: &Field) -> syn::Result<FieldFlags> {
    let mut flags = FieldFlags::default();
    for meta in schema_metas(&field.attrs)? {
        if let Meta::Path(path) = meta {
            if path.is_ident("optional") {
                flags.optional = true;
            } else if path.is_ident("nested") {
                flags.nested = true;
            } else {
                return Err(syn::Error::new_spanned(path, "unknown schema flag"));
            }
        }
    }
    Ok(flags)
}

fn get_doc_comment(attrs: &[syn::Attribute]) -> String {
    let mut docs = Vec::new();
    for attr in attrs {
        if attr.path().is_ident("doc") {
            if let Meta::NameValue(nv) = &attr.meta {
                if let syn::Expr::Lit(expr_lit) = &nv.value {
                    if let Lit::Str(s) = &expr_lit.lit {
                        docs.push(s.value().trim().to_string());
                    }
                }
            }
        }
    }
    docs.join(" ")
}

/// The single generic argument of `Wrapper<T>`, if `ty` is that wrapper.
fn wrapped_type<'a>(ty: &'a Type, wrapper: &str) -> Option<&'a Type> {
    let Type::Path(type_path) = ty else {
        return None;
    };
    let segment = type_path.path.segments.last()?;
    if segment.ident != wrapper {
        return None;
    }
    if let syn::PathArguments::AngleBracketed(args) = &segment.arguments {
        if let Some(syn::GenericArgument::Type(inner)) = args.args.first() {
            return Some(inner);
        }
    }
    None
}

fn is_wrapper(ty: &Type, wrapper: &str) -> bool {
    matches!(ty, Type::Path(type_path)
        if type_path.path.segments.last().is_some_and(|s| s.ident == wrapper))
}

/// Schema for a field whose (possibly wrapped) type implements `OutputSchema`.
fn nested_schema(ty: &Type) -> TokenStream2 {
    if let Some(inner) = wrapped_type(ty, "Option") {
        return nested_schema(inner);
    }
    if let Some(inner) = wrapped_type(ty, "Vec") {
        let inner_schema = nested_schema(inner);
        return quote! {
            serde_json::json!({
                "type": "array",
                "items": #inner_schema
            })
        };
    }
    quote! { <#ty as ::fable_core::structured::OutputSchema>::output_schema() }
}

fn type_to_schema(ty: &Type) -> TokenStream2 {
    let Type::Path(type_path) = ty else {
        return quote! { serde_json::json!({}) };
    };
    let Some(segment) = type_path.path.segments.last() else {
        return quote! { serde_json::json!({}) };
    };

    match segment.ident.to_string().as_str() {
        "String" | "str" => quote! { serde_json::json!({"type": "string"}) },
        "i8" | "i16" | "i32" | "i64" | "isize" | "u8" | "u16" | "u32" | "u64" | "usize" => {
            quote! { serde_json::json!({"type": "integer"}) }
        }
        "f32" | "f64" => quote! { serde_json::json!({"type": "number"}) },
        "bool" => quote! { serde_json::json!({"type": "boolean"}) },
        "Option" => match wrapped_type(ty, "Option") {
            Some(inner) => type_to_schema(inner),
            None => quote! { serde_json::json!({}) },
        },
        "Vec" => match wrapped_type(ty, "Vec") {
            Some(inner) => {
                let inner_schema = type_to_schema(inner);
                quote! {
                    serde_json::json!({
                        "type": "array",
                        "items": #inner_schema
                    })
                }
            }
            None => quote! { serde_json::json!({"type": "array"}) },
        },
        _ => quote! { serde_json::json!({"type": "object"}) },
    }
}

fn to_snake_case(s: &str) -> String {
    let mut result = String::new();
    for (i, c) in s.chars().enumerate() {
        if c.is_uppercase() {
            if i > 0 {
                result.push('_');
            }
            result.push(c.to_ascii_lowercase());
        } else {
            result.push(c);
        }
    }
    result
}
