//! Implementation of the `#[derive(Record)]` macro.

use convert_case::{Case, Casing};
use proc_macro2::TokenStream;
use quote::quote;
use syn::meta::ParseNestedMeta;
use syn::{Data, DeriveInput, Fields, LitStr, Path, Token, Type};

/// Parse and generate code for the `#[derive(Record)]` macro.
pub fn derive_record_impl(input: &DeriveInput) -> Result<TokenStream, syn::Error> {
    let name = &input.ident;

    let fields = match &input.data {
        Data::Struct(data) => match &data.fields {
            Fields::Named(fields) => &fields.named,
            _ => {
                return Err(syn::Error::new_spanned(
                    input,
                    "Record derive only supports structs with named fields",
                ));
            }
        },
        _ => {
            return Err(syn::Error::new_spanned(
                input,
                "Record derive only supports structs",
            ));
        }
    };

    let struct_attrs = parse_struct_attrs(input)?;
    let krate = struct_attrs
        .crate_path
        .clone()
        .unwrap_or_else(|| syn::parse_quote!(::pgstencil::record));

    let field_infos: Vec<FieldInfo> = fields
        .iter()
        .map(|f| parse_field(f, &struct_attrs))
        .collect::<Result<_, _>>()?;

    let decls: Vec<TokenStream> = field_infos
        .iter()
        .filter_map(|info| match &info.kind {
            FieldKind::Skipped => None,
            FieldKind::Column { alias, optional } => {
                let field_name = &info.name;
                let decl = match alias {
                    Some(alias) => quote! { #krate::FieldDecl::aliased(#field_name, #alias) },
                    None => quote! { #krate::FieldDecl::column(#field_name) },
                };
                Some(if *optional {
                    quote! { #decl.optional() }
                } else {
                    decl
                })
            }
            FieldKind::Base => {
                let ty = &info.ty;
                Some(quote! { #krate::FieldDecl::base::<#ty>() })
            }
        })
        .collect();

    let (impl_generics, ty_generics, where_clause) = input.generics.split_for_impl();

    Ok(quote! {
        impl #impl_generics #krate::Record for #name #ty_generics #where_clause {
            fn declared_fields() -> ::std::vec::Vec<#krate::FieldDecl> {
                ::std::vec![#(#decls),*]
            }
        }
    })
}

/// Struct-level attributes.
#[derive(Debug, Default)]
struct StructAttrs {
    crate_path: Option<Path>,
    rename_all: Option<RenameRule>,
    /// `#[serde(default)]` on the container.
    default: bool,
}

/// Parse `#[record(...)]` and the relevant parts of `#[serde(...)]` on the struct.
fn parse_struct_attrs(input: &DeriveInput) -> Result<StructAttrs, syn::Error> {
    let mut attrs = StructAttrs::default();

    for attr in &input.attrs {
        if attr.path().is_ident("record") {
            attr.parse_nested_meta(|meta| {
                if meta.path.is_ident("crate") {
                    let value: LitStr = meta.value()?.parse()?;
                    attrs.crate_path = Some(value.parse()?);
                    Ok(())
                } else {
                    Err(meta.error("unsupported record attribute"))
                }
            })?;
        } else if attr.path().is_ident("serde") {
            attr.parse_nested_meta(|meta| {
                if meta.path.is_ident("rename_all") {
                    if let Some(rule) = deserialize_name(&meta)? {
                        attrs.rename_all = Some(RenameRule::from_lit(&rule)?);
                    }
                    Ok(())
                } else if meta.path.is_ident("default") {
                    attrs.default = true;
                    skip_meta(&meta)
                } else {
                    skip_meta(&meta)
                }
            })?;
        }
    }

    Ok(attrs)
}

/// How a field takes part in the field list.
#[derive(Debug, PartialEq)]
enum FieldKind {
    Column { alias: Option<String>, optional: bool },
    Base,
    Skipped,
}

/// Information about a field.
#[derive(Debug)]
struct FieldInfo {
    name: String,
    ty: Type,
    kind: FieldKind,
}

/// Parse a field and its `#[serde(...)]` / `#[record(...)]` attributes.
fn parse_field(field: &syn::Field, struct_attrs: &StructAttrs) -> Result<FieldInfo, syn::Error> {
    let ident = field
        .ident
        .as_ref()
        .ok_or_else(|| syn::Error::new_spanned(field, "Fields must be named"))?;
    let name = ident.to_string().trim_start_matches("r#").to_string();

    let mut rename: Option<String> = None;
    let mut flatten = false;
    let mut skip = false;
    let mut default = struct_attrs.default;

    for attr in &field.attrs {
        if attr.path().is_ident("serde") {
            attr.parse_nested_meta(|meta| {
                if meta.path.is_ident("rename") {
                    if let Some(lit) = deserialize_name(&meta)? {
                        rename = Some(lit.value());
                    }
                    Ok(())
                } else if meta.path.is_ident("flatten") {
                    flatten = true;
                    Ok(())
                } else if meta.path.is_ident("skip") || meta.path.is_ident("skip_deserializing") {
                    skip = true;
                    Ok(())
                } else if meta.path.is_ident("default") {
                    default = true;
                    skip_meta(&meta)
                } else {
                    skip_meta(&meta)
                }
            })?;
        } else if attr.path().is_ident("record") {
            attr.parse_nested_meta(|meta| {
                if meta.path.is_ident("skip") {
                    skip = true;
                    Ok(())
                } else {
                    Err(meta.error("unsupported record attribute"))
                }
            })?;
        }
    }

    let kind = if skip {
        FieldKind::Skipped
    } else if flatten {
        FieldKind::Base
    } else {
        let sql_name = match (rename, &struct_attrs.rename_all) {
            (Some(explicit), _) => explicit,
            (None, Some(rule)) => rule.apply(&name),
            (None, None) => name.clone(),
        };
        let alias = (sql_name != name).then_some(sql_name);
        FieldKind::Column {
            alias,
            optional: default || is_option(&field.ty),
        }
    };

    Ok(FieldInfo {
        name,
        ty: field.ty.clone(),
        kind,
    })
}

/// Whether `ty` is spelled `Option<..>`, which serde fills with `None` when
/// the column is missing.
fn is_option(ty: &Type) -> bool {
    match ty {
        Type::Path(path) if path.qself.is_none() => path
            .path
            .segments
            .last()
            .is_some_and(|segment| segment.ident == "Option"),
        Type::Group(group) => is_option(&group.elem),
        _ => false,
    }
}

/// Read `key = "..."` or `key(deserialize = "...")`, returning the name used
/// when deserializing.
fn deserialize_name(meta: &ParseNestedMeta<'_>) -> Result<Option<LitStr>, syn::Error> {
    if meta.input.peek(Token![=]) {
        return Ok(Some(meta.value()?.parse()?));
    }

    let mut found = None;
    meta.parse_nested_meta(|inner| {
        let value: LitStr = inner.value()?.parse()?;
        if inner.path.is_ident("deserialize") {
            found = Some(value);
        }
        Ok(())
    })?;
    Ok(found)
}

/// Consume a serde option this macro does not care about.
fn skip_meta(meta: &ParseNestedMeta<'_>) -> Result<(), syn::Error> {
    if meta.input.peek(Token![=]) {
        let _: syn::Expr = meta.value()?.parse()?;
    } else if meta.input.peek(syn::token::Paren) {
        let content;
        syn::parenthesized!(content in meta.input);
        let _: TokenStream = content.parse()?;
    }
    Ok(())
}

/// Serde's `rename_all` rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RenameRule {
    Lower,
    Upper,
    Pascal,
    Camel,
    Snake,
    ScreamingSnake,
    Kebab,
    ScreamingKebab,
}

impl RenameRule {
    fn from_lit(lit: &LitStr) -> Result<Self, syn::Error> {
        Ok(match lit.value().as_str() {
            "lowercase" => Self::Lower,
            "UPPERCASE" => Self::Upper,
            "PascalCase" => Self::Pascal,
            "camelCase" => Self::Camel,
            "snake_case" => Self::Snake,
            "SCREAMING_SNAKE_CASE" => Self::ScreamingSnake,
            "kebab-case" => Self::Kebab,
            "SCREAMING-KEBAB-CASE" => Self::ScreamingKebab,
            other => {
                return Err(syn::Error::new_spanned(
                    lit,
                    format!("unknown rename_all rule `{other}`"),
                ));
            }
        })
    }

    /// Apply the rule to a snake_case field name.
    fn apply(&self, field: &str) -> String {
        match self {
            Self::Lower | Self::Snake => field.to_string(),
            Self::Upper => field.to_ascii_uppercase(),
            Self::Pascal => field.to_case(Case::Pascal),
            Self::Camel => field.to_case(Case::Camel),
            Self::ScreamingSnake => field.to_case(Case::UpperSnake),
            Self::Kebab => field.to_case(Case::Kebab),
            Self::ScreamingKebab => field.to_case(Case::Cobol),
        }
    }
}
