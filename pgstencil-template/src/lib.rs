//! # pgstencil-template
//!
//! SQL templates for pgstencil.
//!
//! This crate provides:
//! - A template language for SQL files (`{{ expr }}`, `{% if %}`, `{% for %}`)
//!   parsed with a pest grammar
//! - A renderer that turns every output into a bound parameter
//! - A caching template store
//! - The [`Record`] trait exposing a type's declared fields to templates
//!
//! ## Example
//!
//! ```rust
//! use pgstencil_template::{Renderer, to_params};
//! use serde_json::json;
//!
//! let params = to_params(&json!({ "active": true, "limit": 3 })).unwrap();
//! let fields = vec!["id".to_string(), "name".to_string()];
//!
//! let stmt = Renderer::new().render(
//!     "SELECT {{ _model_fields_ }} FROM merchants \
//!      WHERE active = {{ active | sqlsafe }} ORDER BY name LIMIT {{ limit }}",
//!     &params,
//!     Some(fields.as_slice()),
//! )?;
//!
//! assert_eq!(
//!     stmt.sql(),
//!     "SELECT id, name FROM merchants WHERE active = true ORDER BY name LIMIT $1"
//! );
//! # Ok::<(), pgstencil_template::TemplateError>(())
//! ```

pub mod ast;
pub mod error;
pub mod parser;
pub mod record;
pub mod render;
pub mod store;

pub use ast::Template;
pub use error::{TemplateError, TemplateResult};
pub use parser::parse_template;
pub use record::{FieldDecl, Record, field_list, fields};
pub use render::{MODEL_FIELDS_VAR, ParamStyle, Params, Renderer, Statement, to_params};
pub use store::{CacheStats, TemplateStore};
