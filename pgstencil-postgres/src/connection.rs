//! Connection source abstraction and the PostgreSQL connection wrapper.
//!
//! The executor only talks to a [`ConnectionSource`]; the production source
//! is [`PgConnectionManager`](crate::pool::PgConnectionManager), and tests
//! plug in scripted sources.

use async_trait::async_trait;
use deadpool_postgres::Object;
use pgstencil_template::{ParamStyle, Statement};
use postgres_types::ToSql;
use tracing::debug;

use crate::error::DriverError;
use crate::row::ResultSet;
use crate::types::{SqlParam, decode_row};

/// Point-in-time pool statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStatus {
    /// Open connections, idle or in use.
    pub size: usize,
    /// Idle connections.
    pub available: usize,
    /// Connections currently handed out.
    pub in_use: usize,
    /// Maximum number of connections.
    pub max_size: usize,
    /// Tasks waiting for a connection.
    pub waiting: usize,
}

/// Hands out connections.
#[async_trait]
pub trait ConnectionSource: Send + Sync + 'static {
    /// The connection type handed out.
    type Connection: Connection;

    /// Acquire a connection, opening the source on first use.
    async fn acquire(&self) -> Result<Self::Connection, DriverError>;

    /// Current pool statistics.
    fn status(&self) -> PoolStatus;

    /// Whether the source has been opened and not closed.
    fn is_open(&self) -> bool;

    /// Close the source; later acquisitions fail.
    fn close(&self);
}

/// A connection borrowed from a [`ConnectionSource`].
///
/// Dropping the connection returns it to its source. [`discard`] removes it
/// instead.
///
/// [`discard`]: Connection::discard
#[async_trait]
pub trait Connection: Send {
    /// Run a statement and return its rows.
    async fn query(&mut self, statement: &Statement) -> Result<ResultSet, DriverError>;

    /// Run a statement and return the number of rows affected.
    async fn execute(&mut self, statement: &Statement) -> Result<u64, DriverError>;

    /// Close this connection instead of returning it to the pool.
    fn discard(self)
    where
        Self: Sized;
}

/// A pooled handle that can be removed from its pool for good.
pub(crate) trait Evict {
    fn evict(self);
}

impl Evict for Object {
    fn evict(self) {
        drop(Object::take(self));
    }
}

/// Owns a pooled handle for the length of a checkout.
///
/// Dropped while a statement is marked in flight, the handle is evicted;
/// otherwise it goes back to the pool.
pub(crate) struct Checkout<T: Evict> {
    handle: Option<T>,
    in_flight: bool,
}

impl<T: Evict> Checkout<T> {
    pub(crate) fn new(handle: T) -> Self {
        Self {
            handle: Some(handle),
            in_flight: false,
        }
    }

    pub(crate) fn get(&self) -> Option<&T> {
        self.handle.as_ref()
    }

    pub(crate) fn begin(&mut self) {
        self.in_flight = true;
    }

    pub(crate) fn finish(&mut self) {
        self.in_flight = false;
    }

    pub(crate) fn evict(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.evict();
        }
    }
}

impl<T: Evict> Drop for Checkout<T> {
    fn drop(&mut self) {
        if self.in_flight && self.handle.is_some() {
            debug!("Evicting connection dropped mid-statement");
            self.evict();
        }
    }
}

/// A pooled PostgreSQL connection.
///
/// If the connection is dropped while a statement is in flight (for example
/// because the query future was cancelled) it is evicted from the pool rather
/// than reused.
pub struct PgConnection {
    checkout: Checkout<Object>,
}

impl PgConnection {
    pub(crate) fn new(client: Object) -> Self {
        Self {
            checkout: Checkout::new(client),
        }
    }

    fn client(&self) -> Result<&Object, DriverError> {
        self.checkout
            .get()
            .ok_or_else(|| DriverError::connection("connection already released"))
    }

    async fn prepare(
        &mut self,
        statement: &Statement,
    ) -> Result<tokio_postgres::Statement, DriverError> {
        if statement.style() != ParamStyle::Numeric {
            return Err(DriverError::config(format!(
                "PostgreSQL requires numeric placeholders, got {:?}",
                statement.style()
            )));
        }

        debug!(sql = %statement.sql(), params = %statement.param_summary(), "Executing statement");
        let prepared = self.client()?.prepare_cached(statement.sql()).await?;
        Ok(prepared)
    }

    async fn run_query(&mut self, statement: &Statement) -> Result<ResultSet, DriverError> {
        let prepared = self.prepare(statement).await?;

        let values: Vec<SqlParam<'_>> = statement.params().iter().map(SqlParam).collect();
        let params: Vec<&(dyn ToSql + Sync)> =
            values.iter().map(|v| v as &(dyn ToSql + Sync)).collect();

        let rows = self.client()?.query(&prepared, &params).await?;

        let columns = prepared
            .columns()
            .iter()
            .map(|c| c.name().to_string())
            .collect();
        let rows = rows.iter().map(decode_row).collect::<Result<Vec<_>, _>>()?;
        Ok(ResultSet::new(columns, rows))
    }

    async fn run_execute(&mut self, statement: &Statement) -> Result<u64, DriverError> {
        let prepared = self.prepare(statement).await?;

        let values: Vec<SqlParam<'_>> = statement.params().iter().map(SqlParam).collect();
        let params: Vec<&(dyn ToSql + Sync)> =
            values.iter().map(|v| v as &(dyn ToSql + Sync)).collect();

        Ok(self.client()?.execute(&prepared, &params).await?)
    }
}

#[async_trait]
impl Connection for PgConnection {
    async fn query(&mut self, statement: &Statement) -> Result<ResultSet, DriverError> {
        self.checkout.begin();
        let result = self.run_query(statement).await;
        self.checkout.finish();
        result
    }

    async fn execute(&mut self, statement: &Statement) -> Result<u64, DriverError> {
        self.checkout.begin();
        let result = self.run_execute(statement).await;
        self.checkout.finish();
        result
    }

    fn discard(mut self) {
        debug!("Discarding connection");
        self.checkout.evict();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct Handle(Arc<AtomicUsize>);

    impl Evict for Handle {
        fn evict(self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn checkout() -> (Checkout<Handle>, Arc<AtomicUsize>) {
        let evicted = Arc::new(AtomicUsize::new(0));
        (Checkout::new(Handle(Arc::clone(&evicted))), evicted)
    }

    #[test]
    fn test_idle_checkout_is_returned() {
        let (mut checkout, evicted) = checkout();
        checkout.begin();
        checkout.finish();
        drop(checkout);
        assert_eq!(evicted.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_checkout_dropped_mid_statement_is_evicted() {
        let (mut checkout, evicted) = checkout();
        checkout.begin();
        drop(checkout);
        assert_eq!(evicted.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_evict_is_idempotent() {
        let (mut checkout, evicted) = checkout();
        checkout.evict();
        assert!(checkout.get().is_none());
        checkout.begin();
        drop(checkout);
        assert_eq!(evicted.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cancelled_statement_evicts_connection() {
        let (mut checkout, evicted) = checkout();
        let statement = async move {
            checkout.begin();
            std::future::pending::<()>().await;
        };

        let outcome = tokio::time::timeout(Duration::from_millis(10), statement).await;
        assert!(outcome.is_err());
        assert_eq!(evicted.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_pool_status_default() {
        let status = PoolStatus::default();
        assert_eq!(status.size, 0);
        assert_eq!(status.in_use, 0);
    }
}
