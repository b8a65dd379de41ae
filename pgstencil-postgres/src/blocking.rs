//! Blocking client.
//!
//! Wraps the async [`Executor`] in a private current-thread runtime. The
//! semantics are identical; each call blocks until the query finishes.
//!
//! Do not call these methods from inside an async runtime.

use pgstencil_template::{Record, Statement};
use serde::Serialize;
use tokio::runtime::{Builder, Runtime};

use crate::config::Settings;
use crate::connection::{ConnectionSource, PoolStatus};
use crate::error::{Error, Result};
use crate::executor::Executor;
use crate::pool::PgConnectionManager;
use crate::row::Row;

/// A blocking client over any connection source.
pub struct Client<S: ConnectionSource = PgConnectionManager> {
    executor: Executor<S>,
    runtime: Runtime,
}

impl Client<PgConnectionManager> {
    /// Create a blocking client from settings.
    pub fn new(settings: Settings) -> Result<Self> {
        Self::from_executor(crate::executor::Client::new(settings)?)
    }
}

impl<S: ConnectionSource> Client<S> {
    /// Wrap an existing executor.
    pub fn from_executor(executor: Executor<S>) -> Result<Self> {
        let runtime = Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| Error::config(format!("failed to start runtime: {e}")))?;
        Ok(Self { executor, runtime })
    }

    /// See [`Executor::query`].
    pub fn query<T, P>(&self, template: &str, params: &P) -> Result<Vec<T>>
    where
        T: Record,
        P: Serialize + ?Sized,
    {
        self.runtime.block_on(self.executor.query(template, params))
    }

    /// See [`Executor::query_rows`].
    pub fn query_rows<P>(&self, template: &str, params: &P) -> Result<Vec<Row>>
    where
        P: Serialize + ?Sized,
    {
        self.runtime.block_on(self.executor.query_rows(template, params))
    }

    /// See [`Executor::execute`].
    pub fn execute<P>(&self, template: &str, params: &P) -> Result<u64>
    where
        P: Serialize + ?Sized,
    {
        self.runtime.block_on(self.executor.execute(template, params))
    }

    /// See [`Executor::render`].
    pub fn render<T, P>(&self, template: &str, params: &P) -> Result<Statement>
    where
        T: Record,
        P: Serialize + ?Sized,
    {
        self.runtime.block_on(self.executor.render::<T, P>(template, params))
    }

    /// See [`Executor::render_rows`].
    pub fn render_rows<P>(&self, template: &str, params: &P) -> Result<Statement>
    where
        P: Serialize + ?Sized,
    {
        self.runtime.block_on(self.executor.render_rows(template, params))
    }

    /// Current pool statistics.
    pub fn pool_status(&self) -> PoolStatus {
        self.executor.pool_status()
    }

    /// Close the pool.
    pub fn close(&self) {
        self.executor.close();
    }

    /// The async executor behind this client.
    pub fn executor(&self) -> &Executor<S> {
        &self.executor
    }
}
