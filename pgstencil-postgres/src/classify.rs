//! Transient vs terminal failure classification.
//!
//! A transient failure is one where running the same statement again on a
//! fresh connection can reasonably succeed. Everything else is terminal and
//! is never retried by default.

use std::error::Error as StdError;

/// Whether a failure is worth retrying.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureClass {
    /// May succeed on a fresh connection.
    Transient,
    /// Will fail the same way again.
    Terminal,
}

impl FailureClass {
    /// Check if this is a transient failure.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient)
    }
}

/// SQLSTATE codes outside class `08` that are treated as transient.
pub const TRANSIENT_SQLSTATES: &[&str] = &[
    "57P01", // admin_shutdown
    "57P02", // crash_shutdown
    "57P03", // cannot_connect_now
    "53300", // too_many_connections
    "40001", // serialization_failure
    "40P01", // deadlock_detected
];

/// Classify a five-character SQLSTATE code.
///
/// Class `08` (connection exception) and [`TRANSIENT_SQLSTATES`] are
/// transient; every other code is terminal.
pub fn classify_sqlstate(code: &str) -> FailureClass {
    if code.starts_with("08") || TRANSIENT_SQLSTATES.contains(&code) {
        FailureClass::Transient
    } else {
        FailureClass::Terminal
    }
}

/// Classify an error reported by the PostgreSQL driver.
pub fn classify_pg_error(err: &tokio_postgres::Error) -> FailureClass {
    if let Some(code) = err.code() {
        return classify_sqlstate(code.code());
    }
    if err.is_closed() || has_io_source(err) {
        return FailureClass::Transient;
    }
    FailureClass::Terminal
}

fn has_io_source(err: &tokio_postgres::Error) -> bool {
    let mut source = err.source();
    while let Some(cause) = source {
        if cause.is::<std::io::Error>() {
            return true;
        }
        source = cause.source();
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_exceptions_are_transient() {
        for code in ["08000", "08003", "08006", "08001", "08P01"] {
            assert_eq!(classify_sqlstate(code), FailureClass::Transient, "{code}");
        }
    }

    #[test]
    fn test_listed_codes_are_transient() {
        for code in TRANSIENT_SQLSTATES {
            assert!(classify_sqlstate(code).is_transient(), "{code}");
        }
    }

    #[test]
    fn test_other_codes_are_terminal() {
        for code in ["28P01", "28000", "42601", "42P01", "42501", "23505", "23503", "22012", "57014"] {
            assert_eq!(classify_sqlstate(code), FailureClass::Terminal, "{code}");
        }
    }
}
