//! Procedural macros for pgstencil.
//!
//! # Macros
//!
//! - [`Record`] - Derive the declared field list of a row type
//!
//! # Example
//!
//! ```rust,ignore
//! #[derive(serde::Deserialize, pgstencil::Record)]
//! struct Merchant {
//!     id: i64,
//!     #[serde(rename = "name")]
//!     display_name: String,
//!     #[serde(flatten)]
//!     audit: Audit,
//! }
//! ```

use proc_macro::TokenStream;
use syn::{DeriveInput, parse_macro_input};

mod derive;

/// Derive macro implementing `Record` for a struct with named fields.
///
/// The generated field list follows the struct's serde attributes so it
/// always matches what deserialization expects.
///
/// # Attributes
///
/// ## Struct-level
/// - `#[serde(rename_all = "...")]` - Applied to every field without an explicit rename
/// - `#[record(crate = "path")]` - Path to the `record` module (default `::pgstencil::record`)
///
/// ## Field-level
/// - `#[serde(rename = "col")]` - Expose the field to SQL as `col`
/// - `#[serde(flatten)]` - Splice in the fields of an embedded `Record`
/// - `#[serde(skip)]` / `#[serde(skip_deserializing)]` - Leave the field out
/// - `#[record(skip)]` - Leave the field out of the field list only
///
/// # Example
///
/// ```rust,ignore
/// #[derive(serde::Deserialize, pgstencil::Record)]
/// #[serde(rename_all = "camelCase")]
/// struct Merchant {
///     merchant_id: i64,      // "merchantId"
///     #[serde(skip)]
///     cached: Option<String>,
/// }
/// ```
#[proc_macro_derive(Record, attributes(record))]
pub fn derive_record(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);

    match derive::derive_record_impl(&input) {
        Ok(tokens) => tokens.into(),
        Err(err) => err.to_compile_error().into(),
    }
}
