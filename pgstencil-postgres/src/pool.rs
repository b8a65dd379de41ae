//! Lazily opened PostgreSQL connection pool.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use deadpool_postgres::{Manager, ManagerConfig, Pool, RecyclingMethod, Runtime};
use futures::future::join_all;
use tokio::sync::OnceCell;
use tokio_postgres::NoTls;
use tracing::{debug, info, warn};

use crate::config::Settings;
use crate::connection::{ConnectionSource, PgConnection, PoolStatus};
use crate::error::DriverError;

/// Owns the connection pool for one client.
///
/// Nothing connects until the first [`acquire`](ConnectionSource::acquire);
/// that call builds the pool and opens `min_size` connections. Concurrent
/// first calls wait for the same initialisation.
pub struct PgConnectionManager {
    settings: Arc<Settings>,
    pool: OnceCell<Pool>,
}

impl PgConnectionManager {
    /// Create a manager. No connection is opened yet.
    pub fn new(settings: Arc<Settings>) -> Self {
        Self {
            settings,
            pool: OnceCell::new(),
        }
    }

    /// The settings this manager connects with.
    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// The libpq connection string. Contains the password.
    pub fn conninfo(&self) -> String {
        self.settings.conninfo()
    }

    async fn open(&self) -> Result<Pool, DriverError> {
        let settings = &self.settings;

        let mgr_config = ManagerConfig {
            recycling_method: RecyclingMethod::Fast,
        };
        let mgr = Manager::from_config(settings.to_pg_config(), NoTls, mgr_config);

        let pool = Pool::builder(mgr)
            .max_size(settings.pool_max_size())
            .wait_timeout(Some(settings.acquire_timeout()))
            .create_timeout(Some(settings.connect_timeout()))
            .runtime(Runtime::Tokio1)
            .build()
            .map_err(|e| DriverError::config(format!("failed to create pool: {e}")))?;

        self.warm(&pool).await?;

        info!(
            database = %settings,
            min_size = settings.min_size,
            max_size = settings.pool_max_size(),
            "PostgreSQL connection pool opened"
        );
        Ok(pool)
    }

    /// Open `min_size` connections up front.
    async fn warm(&self, pool: &Pool) -> Result<(), DriverError> {
        let wanted = self.settings.min_size.min(self.settings.pool_max_size());
        if wanted == 0 {
            return Ok(());
        }

        let started = Instant::now();
        let results = join_all((0..wanted).map(|_| pool.get())).await;

        let mut opened = 0;
        let mut first_error = None;
        for result in results {
            match result {
                Ok(_) => opened += 1,
                Err(e) => {
                    let err = DriverError::from_pool(e, started.elapsed());
                    warn!(error = %err, "Failed to open warm-up connection");
                    first_error.get_or_insert(err);
                }
            }
        }

        match first_error {
            Some(err) if opened == 0 => Err(err),
            _ => {
                debug!(opened, wanted, "Pool warmed");
                Ok(())
            }
        }
    }
}

#[async_trait]
impl ConnectionSource for PgConnectionManager {
    type Connection = PgConnection;

    async fn acquire(&self) -> Result<PgConnection, DriverError> {
        let pool = self.pool.get_or_try_init(|| self.open()).await?;

        debug!("Acquiring connection from pool");
        let started = Instant::now();
        let client = pool
            .get()
            .await
            .map_err(|e| DriverError::from_pool(e, started.elapsed()))?;
        Ok(PgConnection::new(client))
    }

    fn status(&self) -> PoolStatus {
        match self.pool.get() {
            Some(pool) => {
                let status = pool.status();
                PoolStatus {
                    size: status.size,
                    available: status.available,
                    in_use: status.size.saturating_sub(status.available),
                    max_size: status.max_size,
                    waiting: status.waiting,
                }
            }
            None => PoolStatus {
                max_size: self.settings.pool_max_size(),
                ..PoolStatus::default()
            },
        }
    }

    fn is_open(&self) -> bool {
        self.pool.get().is_some_and(|pool| !pool.is_closed())
    }

    fn close(&self) {
        if let Some(pool) = self.pool.get() {
            if !pool.is_closed() {
                pool.close();
                info!(database = %self.settings, "PostgreSQL connection pool closed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn manager() -> PgConnectionManager {
        let settings = Settings::builder()
            .user("app")
            .password("secret")
            .max_size(8)
            .build()
            .unwrap();
        PgConnectionManager::new(Arc::new(settings))
    }

    #[test]
    fn test_unopened_manager() {
        let manager = manager();
        assert!(!manager.is_open());
        assert_eq!(
            manager.status(),
            PoolStatus {
                max_size: 8,
                ..PoolStatus::default()
            }
        );

        // Closing before first use is a no-op.
        manager.close();
        assert!(!manager.is_open());
    }

    /// Settings pointing at a loopback port nothing listens on.
    fn unreachable(min_size: usize) -> PgConnectionManager {
        let settings = Settings::builder()
            .user("app")
            .password("secret")
            .host("127.0.0.1")
            .port(1)
            .min_size(min_size)
            .max_size(4)
            .connect_timeout(Duration::from_millis(500))
            .acquire_timeout(Duration::from_millis(500))
            .build()
            .unwrap();
        PgConnectionManager::new(Arc::new(settings))
    }

    #[tokio::test]
    async fn test_first_acquire_opens_the_pool() {
        let manager = unreachable(0);
        assert!(!manager.is_open());

        assert!(manager.acquire().await.is_err());
        assert!(manager.is_open());
        assert_eq!(manager.status().size, 0);
        assert_eq!(manager.status().in_use, 0);
        assert_eq!(manager.status().max_size, 4);

        // The second acquisition reuses the open pool.
        assert!(manager.acquire().await.is_err());
        assert!(manager.is_open());

        manager.close();
        assert!(!manager.is_open());
        let err = manager.acquire().await.err().unwrap();
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn test_failed_warm_up_leaves_pool_unopened() {
        let manager = unreachable(2);

        assert!(manager.acquire().await.is_err());
        assert!(!manager.is_open());
        assert_eq!(manager.status().size, 0);

        // Nothing is cached, so the next call tries to open again.
        assert!(manager.acquire().await.is_err());
        assert!(!manager.is_open());
    }

    #[test]
    fn test_conninfo_passthrough() {
        let manager = manager();
        assert!(manager.conninfo().contains("user=app"));
        assert!(manager.conninfo().contains("password=secret"));
    }
}
