//! Error types for query execution.

use std::time::Duration;

use deadpool_postgres::{PoolError, TimeoutType};
use pgstencil_template::TemplateError;
use thiserror::Error;

use crate::classify::{FailureClass, classify_pg_error, classify_sqlstate};

/// Result type for executor operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Failures raised by a connection source or connection.
#[derive(Error, Debug)]
pub enum DriverError {
    /// No pooled connection became available in time.
    #[error("timed out after {}ms waiting for a pooled connection", .waited.as_millis())]
    PoolExhausted { waited: Duration },

    /// The connection could not be established or was lost.
    #[error("connection error: {message}")]
    Connection {
        message: String,
        #[source]
        source: Option<tokio_postgres::Error>,
    },

    /// The server rejected the statement.
    #[error("database error [{}]: {message}", .code.as_deref().unwrap_or("-----"))]
    Database {
        code: Option<String>,
        message: String,
        class: FailureClass,
        #[source]
        source: Option<tokio_postgres::Error>,
    },

    /// A result column could not be converted.
    #[error("cannot decode column `{column}` of type {pg_type}: {message}")]
    Decode {
        column: String,
        pg_type: String,
        message: String,
    },

    /// The pool or driver is misconfigured.
    #[error("configuration error: {0}")]
    Configuration(String),
}

impl DriverError {
    /// Create a connection error.
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
            source: None,
        }
    }

    /// Create a database error classified by its SQLSTATE code.
    pub fn database(code: impl Into<String>, message: impl Into<String>) -> Self {
        let code = code.into();
        Self::Database {
            class: classify_sqlstate(&code),
            code: Some(code),
            message: message.into(),
            source: None,
        }
    }

    /// Create a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    /// Create a decode error.
    pub fn decode(
        column: impl Into<String>,
        pg_type: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::Decode {
            column: column.into(),
            pg_type: pg_type.into(),
            message: message.into(),
        }
    }

    /// Convert a pool error, recording how long acquisition waited.
    pub fn from_pool(err: PoolError, waited: Duration) -> Self {
        match err {
            PoolError::Timeout(TimeoutType::Wait) => Self::PoolExhausted { waited },
            PoolError::Timeout(kind) => Self::connection(format!("{kind:?} timeout")),
            PoolError::Backend(e) => e.into(),
            PoolError::Closed => Self::config("connection pool is closed"),
            PoolError::NoRuntimeSpecified => Self::config("no async runtime configured for timeouts"),
            other => Self::connection(other.to_string()),
        }
    }

    /// Whether this failure is worth retrying.
    pub fn class(&self) -> FailureClass {
        match self {
            Self::PoolExhausted { .. } | Self::Connection { .. } => FailureClass::Transient,
            Self::Database { class, .. } => *class,
            Self::Decode { .. } | Self::Configuration(_) => FailureClass::Terminal,
        }
    }

    /// Check if this failure is transient.
    pub fn is_transient(&self) -> bool {
        self.class().is_transient()
    }

    /// Check if this is an acquisition timeout.
    pub fn is_pool_exhausted(&self) -> bool {
        matches!(self, Self::PoolExhausted { .. })
    }

    /// The SQLSTATE code, when the server reported one.
    pub fn code(&self) -> Option<&str> {
        match self {
            Self::Database { code, .. } => code.as_deref(),
            _ => None,
        }
    }
}

impl From<tokio_postgres::Error> for DriverError {
    fn from(err: tokio_postgres::Error) -> Self {
        let class = classify_pg_error(&err);
        match err.as_db_error() {
            Some(db) => Self::Database {
                code: Some(db.code().code().to_string()),
                message: db.message().to_string(),
                class,
                source: Some(err),
            },
            None if class.is_transient() => Self::Connection {
                message: err.to_string(),
                source: Some(err),
            },
            None => Self::Database {
                code: err.code().map(|c| c.code().to_string()),
                message: err.to_string(),
                class,
                source: Some(err),
            },
        }
    }
}

/// Flat classification of [`Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    TemplateNotFound,
    TemplateRead,
    NotARecordType,
    TemplateRender,
    PoolExhausted,
    QueryExecution,
    RowMapping,
    Configuration,
}

/// Errors returned by the executor.
#[derive(Error, Debug)]
pub enum Error {
    /// Loading, reflecting or rendering the template failed.
    #[error(transparent)]
    Template(#[from] TemplateError),

    /// No connection could be acquired, even after retrying.
    #[error("connection pool exhausted after {attempts} attempt(s)")]
    PoolExhausted {
        #[source]
        source: DriverError,
        attempts: u32,
    },

    /// The statement failed terminally or ran out of attempts.
    #[error("query failed after {attempts} attempt(s): {source}")]
    QueryExecution {
        #[source]
        source: DriverError,
        sql: String,
        /// Redacted parameter summary, e.g. `[integer, string]`.
        params: String,
        attempts: u32,
        retries_exhausted: bool,
    },

    /// A row could not be decoded into the target type.
    #[error("cannot map row {row} onto `{type_name}`: {source}")]
    RowMapping {
        row: usize,
        type_name: &'static str,
        #[source]
        source: serde_json::Error,
    },

    /// Settings were invalid.
    #[error("configuration error: {0}")]
    Configuration(String),
}

impl Error {
    /// Create a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    /// The flat kind of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Template(TemplateError::NotFound { .. }) => ErrorKind::TemplateNotFound,
            Self::Template(TemplateError::Read { .. }) => ErrorKind::TemplateRead,
            Self::Template(
                TemplateError::NotARecordType { .. } | TemplateError::ShadowedField { .. },
            ) => ErrorKind::NotARecordType,
            Self::Template(_) => ErrorKind::TemplateRender,
            Self::PoolExhausted { .. } => ErrorKind::PoolExhausted,
            Self::QueryExecution { .. } => ErrorKind::QueryExecution,
            Self::RowMapping { .. } => ErrorKind::RowMapping,
            Self::Configuration(_) => ErrorKind::Configuration,
        }
    }

    /// Number of execution attempts made, when execution was reached.
    pub fn attempts(&self) -> Option<u32> {
        match self {
            Self::PoolExhausted { attempts, .. } | Self::QueryExecution { attempts, .. } => {
                Some(*attempts)
            }
            _ => None,
        }
    }

    /// The driver failure behind this error, if any.
    pub fn driver_error(&self) -> Option<&DriverError> {
        match self {
            Self::PoolExhausted { source, .. } | Self::QueryExecution { source, .. } => Some(source),
            _ => None,
        }
    }
}
