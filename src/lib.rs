//! # pgstencil
//!
//! Run PostgreSQL queries from SQL template files and map the rows onto
//! typed records.
//!
//! pgstencil provides:
//! - SQL templates with `{{ expr }}`, `{% if %}` and `{% for %}`, where every
//!   output becomes a bound parameter unless explicitly marked `sqlsafe`
//! - `#[derive(Record)]`, which exposes a struct's columns to templates as
//!   `_model_fields_`
//! - A lazily opened connection pool with retries on transient failures
//! - Async and blocking clients
//!
//! ## Quick Start
//!
//! `sql/select_merchant.sql`:
//!
//! ```sql
//! SELECT {{ _model_fields_ }} FROM merchants
//! WHERE active = {{ active | sqlsafe }}
//! ORDER BY name LIMIT {{ limit }}
//! ```
//!
//! ```rust,ignore
//! use pgstencil::prelude::*;
//! use serde::Deserialize;
//! use serde_json::json;
//!
//! #[derive(Debug, Deserialize, Record)]
//! struct Merchant {
//!     id: i64,
//!     name: String,
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), pgstencil::Error> {
//!     let settings = Settings::builder()
//!         .user("app")
//!         .password("secret")
//!         .dbname("shop")
//!         .template_dir("sql")
//!         .template_extension(".sql")
//!         .build()?;
//!
//!     let client = Client::new(settings)?;
//!     let merchants: Vec<Merchant> = client
//!         .query("select_merchant", &json!({ "active": true, "limit": 3 }))
//!         .await?;
//!
//!     println!("{merchants:?}");
//!     Ok(())
//! }
//! ```

#![cfg_attr(docsrs, feature(doc_cfg))]
#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]

/// Record reflection. `#[derive(Record)]` expands to paths in this module.
pub mod record {
    pub use pgstencil_template::record::*;
}

/// The template language, renderer and store.
pub mod template {
    pub use pgstencil_template::*;
}

/// Settings, pool, executor and errors.
pub mod postgres {
    pub use pgstencil_postgres::*;
}

pub use pgstencil_codegen::Record;
pub use pgstencil_template::Record;

pub use pgstencil_postgres::{
    Client, DriverError, Error, ErrorKind, Executor, PoolStatus, Result, RetryConfig,
    RetryPredicate, Row, Settings, blocking, logging,
};
pub use pgstencil_template::{
    FieldDecl, ParamStyle, Statement, TemplateError, TemplateStore, field_list, fields,
};

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::Record;
    pub use crate::postgres::{
        Client, Error, ErrorKind, Executor, PoolStatus, RetryConfig, RetryPredicate, Row,
        Settings,
    };
    pub use crate::template::{ParamStyle, Renderer, Statement, TemplateStore};
}
