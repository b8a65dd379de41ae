//! # pgstencil-postgres
//!
//! Runs pgstencil templates against PostgreSQL.
//!
//! This crate provides:
//! - [`Settings`] loaded from code or TOML
//! - A lazily opened `deadpool-postgres` pool ([`PgConnectionManager`])
//! - The [`Executor`] that renders, runs, retries and maps rows
//! - A [`blocking::Client`] with the same semantics
//!
//! ## Example
//!
//! ```rust,ignore
//! use pgstencil_postgres::{Client, Settings};
//! use serde_json::json;
//!
//! let settings = Settings::builder()
//!     .user("app")
//!     .password("secret")
//!     .dbname("shop")
//!     .template_dir("sql")
//!     .template_extension(".sql")
//!     .build()?;
//!
//! let client = Client::new(settings)?;
//! let merchants: Vec<Merchant> = client
//!     .query("select_merchant", &json!({ "active": true, "limit": 3 }))
//!     .await?;
//! ```

pub mod blocking;
pub mod classify;
pub mod config;
pub mod connection;
pub mod error;
pub mod executor;
pub mod logging;
pub mod pool;
pub mod retry;
pub mod row;
pub mod types;

pub use classify::{FailureClass, classify_pg_error, classify_sqlstate};
pub use config::{RetrySettings, Settings, SettingsBuilder};
pub use connection::{Connection, ConnectionSource, PgConnection, PoolStatus};
pub use error::{DriverError, Error, ErrorKind, Result};
pub use executor::{Client, Executor, ExecutorBuilder, QueryState};
pub use pool::PgConnectionManager;
pub use retry::{Backoff, ConstantBackoff, ExponentialBackoff, RetryConfig, RetryPredicate};
pub use row::{ResultSet, Row};
pub use types::SqlParam;
