//! The query executor.
//!
//! A query runs through a fixed sequence of states:
//!
//! ```text
//! Idle -> Rendering -> Executing -> Succeeded
//!                          |  ^
//!                          v  |
//!                     RetryPending
//!                          |
//!                          v
//!                        Failed
//! ```
//!
//! Rendering failures never reach the database and are never retried.
//! Execution failures are retried while the [`RetryConfig`] allows it; the
//! connection that failed is discarded before the backoff sleep.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use pgstencil_template::{
    ParamStyle, Params, Record, Renderer, Statement, TemplateStore, fields, to_params,
};
use serde::Serialize;
use tracing::{debug, error, warn};

use crate::config::Settings;
use crate::connection::{Connection, ConnectionSource, PoolStatus};
use crate::error::{DriverError, Error, Result};
use crate::pool::PgConnectionManager;
use crate::retry::RetryConfig;
use crate::row::{ResultSet, Row};

/// A client backed by a PostgreSQL connection pool.
pub type Client = Executor<PgConnectionManager>;

/// Where a query is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryState {
    /// Not started.
    Idle,
    /// Loading and rendering the template.
    Rendering,
    /// Running the statement.
    Executing { attempt: u32 },
    /// Waiting before the next attempt.
    RetryPending { attempt: u32, delay: Duration },
    /// Finished with a result.
    Succeeded { attempts: u32 },
    /// Finished with an error.
    Failed { attempts: u32 },
}

impl fmt::Display for QueryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => f.write_str("idle"),
            Self::Rendering => f.write_str("rendering"),
            Self::Executing { attempt } => write!(f, "executing (attempt {attempt})"),
            Self::RetryPending { attempt, delay } => {
                write!(f, "retry pending after attempt {attempt} ({}ms)", delay.as_millis())
            }
            Self::Succeeded { attempts } => write!(f, "succeeded after {attempts} attempt(s)"),
            Self::Failed { attempts } => write!(f, "failed after {attempts} attempt(s)"),
        }
    }
}

impl QueryState {
    /// Whether a query may move from this state to `next`.
    pub fn can_advance_to(&self, next: &QueryState) -> bool {
        matches!(
            (self, next),
            (Self::Idle, Self::Rendering)
                | (Self::Rendering, Self::Executing { attempt: 1 })
                | (
                    Self::Executing { .. },
                    Self::Succeeded { .. } | Self::RetryPending { .. } | Self::Failed { .. }
                )
                | (Self::RetryPending { .. }, Self::Executing { .. })
        )
    }

    /// Check if the query has finished.
    pub fn is_finished(&self) -> bool {
        matches!(self, Self::Succeeded { .. } | Self::Failed { .. })
    }
}

/// The state of one query call, traced on every transition.
#[derive(Debug)]
struct Lifecycle {
    state: QueryState,
}

impl Lifecycle {
    fn new() -> Self {
        Self {
            state: QueryState::Idle,
        }
    }

    fn advance(&mut self, next: QueryState) {
        debug_assert!(
            self.state.can_advance_to(&next),
            "illegal query state transition: {} -> {next}",
            self.state
        );
        debug!(from = %self.state, to = %next, "Query state");
        self.state = next;
    }
}

#[derive(Debug, Clone, Copy)]
enum Mode {
    Query,
    Execute,
}

enum Outcome {
    Rows(ResultSet),
    Affected(u64),
}

struct Inner<S> {
    source: S,
    store: TemplateStore,
    renderer: Renderer,
    retry: RetryConfig,
}

/// Renders templates and runs them on connections from a
/// [`ConnectionSource`].
///
/// Cloning is cheap; clones share the source and the template cache.
pub struct Executor<S: ConnectionSource> {
    inner: Arc<Inner<S>>,
}

impl<S: ConnectionSource> Clone for Executor<S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl Client {
    /// Create a client from settings. The pool opens on the first query.
    pub fn new(settings: Settings) -> Result<Self> {
        Ok(Self::builder(settings)?.build())
    }

    /// Create a builder from settings.
    pub fn builder(settings: Settings) -> Result<ExecutorBuilder<PgConnectionManager>> {
        settings.validate()?;
        let store = TemplateStore::new(&settings.template_dir, &settings.template_extension);
        let retry = settings.retry.to_retry_config();
        let source = PgConnectionManager::new(Arc::new(settings));
        Ok(ExecutorBuilder::new(source, store).retry(retry))
    }

    /// The settings this client was created with.
    pub fn settings(&self) -> &Settings {
        self.inner.source.settings()
    }
}

impl<S: ConnectionSource> Executor<S> {
    /// Start building an executor over any connection source.
    pub fn with_source(source: S, store: TemplateStore) -> ExecutorBuilder<S> {
        ExecutorBuilder::new(source, store)
    }

    /// Run a template and decode every row into `T`.
    ///
    /// `_model_fields_` is bound to the declared fields of `T`.
    pub async fn query<T, P>(&self, template: &str, params: &P) -> Result<Vec<T>>
    where
        T: Record,
        P: Serialize + ?Sized,
    {
        let mut lifecycle = Lifecycle::new();
        let statement = self
            .statement::<P>(&mut lifecycle, template, params, Some(fields::<T>()?))
            .await?;
        match self.run(&mut lifecycle, &statement, Mode::Query).await? {
            Outcome::Rows(rows) => self.finish(rows.decode::<T>()),
            Outcome::Affected(_) => Ok(Vec::new()),
        }
    }

    /// Run a template and return rows as column maps.
    pub async fn query_rows<P>(&self, template: &str, params: &P) -> Result<Vec<Row>>
    where
        P: Serialize + ?Sized,
    {
        let mut lifecycle = Lifecycle::new();
        let statement = self.statement::<P>(&mut lifecycle, template, params, None).await?;
        match self.run(&mut lifecycle, &statement, Mode::Query).await? {
            Outcome::Rows(rows) => Ok(rows.into_rows()),
            Outcome::Affected(_) => Ok(Vec::new()),
        }
    }

    /// Run a template that returns no rows and report how many rows it
    /// affected.
    pub async fn execute<P>(&self, template: &str, params: &P) -> Result<u64>
    where
        P: Serialize + ?Sized,
    {
        let mut lifecycle = Lifecycle::new();
        let statement = self.statement::<P>(&mut lifecycle, template, params, None).await?;
        match self.run(&mut lifecycle, &statement, Mode::Execute).await? {
            Outcome::Affected(n) => Ok(n),
            Outcome::Rows(rows) => Ok(rows.len() as u64),
        }
    }

    /// Render a template for `T` without touching the database.
    pub async fn render<T, P>(&self, template: &str, params: &P) -> Result<Statement>
    where
        T: Record,
        P: Serialize + ?Sized,
    {
        self.statement::<P>(&mut Lifecycle::new(), template, params, Some(fields::<T>()?))
            .await
    }

    /// Render a template without a target type and without touching the
    /// database.
    pub async fn render_rows<P>(&self, template: &str, params: &P) -> Result<Statement>
    where
        P: Serialize + ?Sized,
    {
        self.statement::<P>(&mut Lifecycle::new(), template, params, None)
            .await
    }

    /// Current pool statistics.
    pub fn pool_status(&self) -> PoolStatus {
        self.inner.source.status()
    }

    /// Whether the pool has been opened and not closed.
    pub fn is_open(&self) -> bool {
        self.inner.source.is_open()
    }

    /// Close the pool. Later queries fail.
    pub fn close(&self) {
        self.inner.source.close();
    }

    /// The connection source.
    pub fn source(&self) -> &S {
        &self.inner.source
    }

    /// The template store.
    pub fn store(&self) -> &TemplateStore {
        &self.inner.store
    }

    /// The retry configuration.
    pub fn retry_config(&self) -> &RetryConfig {
        &self.inner.retry
    }

    async fn statement<P>(
        &self,
        lifecycle: &mut Lifecycle,
        template: &str,
        params: &P,
        fields: Option<Arc<[String]>>,
    ) -> Result<Statement>
    where
        P: Serialize + ?Sized,
    {
        debug!(template, "Rendering template");
        lifecycle.advance(QueryState::Rendering);
        let params: Params = to_params(params)?;
        let body = self.inner.store.load_async(template).await?;
        let statement = self.inner.renderer.render(&body, &params, fields.as_deref())?;
        Ok(statement)
    }

    async fn run(
        &self,
        lifecycle: &mut Lifecycle,
        statement: &Statement,
        mode: Mode,
    ) -> Result<Outcome> {
        let retry = &self.inner.retry;
        let mut attempt = 0;

        loop {
            attempt += 1;
            lifecycle.advance(QueryState::Executing { attempt });

            let err = match self.attempt(statement, mode).await {
                Ok(outcome) => {
                    lifecycle.advance(QueryState::Succeeded { attempts: attempt });
                    return Ok(outcome);
                }
                Err(err) => err,
            };

            if retry.should_retry(&err, attempt) {
                let delay = retry.delay_for_retry(attempt - 1);
                warn!(
                    attempt,
                    max_attempts = retry.max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "Retrying query ({attempt}/{})",
                    retry.max_attempts
                );
                lifecycle.advance(QueryState::RetryPending { attempt, delay });
                tokio::time::sleep(delay).await;
                continue;
            }

            lifecycle.advance(QueryState::Failed { attempts: attempt });
            error!(
                sql = %statement.sql(),
                params = %statement.param_summary(),
                pool = ?self.pool_status(),
                attempts = attempt,
                error = %err,
                "Query failed"
            );

            if err.is_pool_exhausted() {
                return Err(Error::PoolExhausted {
                    source: err,
                    attempts: attempt,
                });
            }

            let retries_exhausted = attempt >= retry.max_attempts && retry.retry_on.should_retry(&err);
            return Err(Error::QueryExecution {
                source: err,
                sql: statement.sql().to_string(),
                params: statement.param_summary(),
                attempts: attempt,
                retries_exhausted,
            });
        }
    }

    /// One acquire-and-run cycle. A connection that failed with a transient
    /// error is discarded; any other connection goes back to the pool.
    async fn attempt(
        &self,
        statement: &Statement,
        mode: Mode,
    ) -> std::result::Result<Outcome, DriverError> {
        let mut conn = self.inner.source.acquire().await?;

        let result = match mode {
            Mode::Query => conn.query(statement).await.map(Outcome::Rows),
            Mode::Execute => conn.execute(statement).await.map(Outcome::Affected),
        };

        match result {
            Err(err) if err.is_transient() => {
                conn.discard();
                Err(err)
            }
            other => other,
        }
    }

    fn finish<T>(&self, decoded: Result<Vec<T>>) -> Result<Vec<T>> {
        if let Err(err) = &decoded {
            error!(error = %err, "Row mapping failed");
        }
        decoded
    }
}

impl<S: ConnectionSource> fmt::Debug for Executor<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Executor")
            .field("templates", &self.inner.store.dir())
            .field("param_style", &self.inner.renderer.style())
            .field("retry", &self.inner.retry)
            .field("pool", &self.pool_status())
            .finish()
    }
}

/// Builder for [`Executor`].
pub struct ExecutorBuilder<S> {
    source: S,
    store: TemplateStore,
    renderer: Renderer,
    retry: RetryConfig,
}

impl<S: ConnectionSource> ExecutorBuilder<S> {
    /// Create a builder with the default renderer and retry policy.
    pub fn new(source: S, store: TemplateStore) -> Self {
        Self {
            source,
            store,
            renderer: Renderer::new(),
            retry: RetryConfig::default(),
        }
    }

    /// Set the retry policy.
    pub fn retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Set the placeholder style.
    pub fn param_style(mut self, style: ParamStyle) -> Self {
        self.renderer = Renderer::with_style(style);
        self
    }

    /// Build the executor.
    pub fn build(self) -> Executor<S> {
        Executor {
            inner: Arc::new(Inner {
                source: self.source,
                store: self.store,
                renderer: self.renderer,
                retry: self.retry,
            }),
        }
    }
}
