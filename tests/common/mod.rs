//! Shared fixtures for integration tests.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use pgstencil::postgres::{Connection, ConnectionSource, DriverError, PoolStatus, ResultSet};
use pgstencil::{Statement, TemplateStore};
use serde_json::Value;

/// What the next acquired connection does.
pub enum Step {
    AcquireFails(DriverError),
    Fails(DriverError),
    Rows(ResultSet),
    Affected(u64),
}

/// Connection bookkeeping shared between a source and its connections.
#[derive(Default)]
pub struct Ledger {
    pub acquired: AtomicUsize,
    pub released: AtomicUsize,
    pub discarded: AtomicUsize,
    pub peak_in_use: AtomicUsize,
    pub statements: Mutex<Vec<(String, Vec<Value>)>>,
}

impl Ledger {
    pub fn in_use(&self) -> usize {
        self.acquired.load(Ordering::SeqCst)
            - self.released.load(Ordering::SeqCst)
            - self.discarded.load(Ordering::SeqCst)
    }

    pub fn counts(&self) -> (usize, usize, usize) {
        (
            self.acquired.load(Ordering::SeqCst),
            self.released.load(Ordering::SeqCst),
            self.discarded.load(Ordering::SeqCst),
        )
    }
}

/// A connection source that replays a script and enforces a size limit.
pub struct ScriptedSource {
    steps: Mutex<VecDeque<Step>>,
    fallback: Option<ResultSet>,
    max_size: usize,
    permits: Arc<tokio::sync::Semaphore>,
    pub ledger: Arc<Ledger>,
    delay: Duration,
}

impl ScriptedSource {
    pub fn new(steps: Vec<Step>) -> Self {
        Self {
            steps: Mutex::new(steps.into()),
            fallback: None,
            max_size: 4,
            permits: Arc::new(tokio::sync::Semaphore::new(4)),
            ledger: Arc::default(),
            delay: Duration::ZERO,
        }
    }

    /// Answer every query with `rows` once the script runs out.
    pub fn repeating(rows: ResultSet, max_size: usize, delay: Duration) -> Self {
        Self {
            steps: Mutex::new(VecDeque::new()),
            fallback: Some(rows),
            max_size,
            permits: Arc::new(tokio::sync::Semaphore::new(max_size)),
            ledger: Arc::default(),
            delay,
        }
    }
}

pub struct ScriptedConnection {
    step: Option<Step>,
    ledger: Arc<Ledger>,
    delay: Duration,
    discarded: bool,
    in_flight: bool,
    _permit: tokio::sync::OwnedSemaphorePermit,
}

#[async_trait]
impl ConnectionSource for ScriptedSource {
    type Connection = ScriptedConnection;

    async fn acquire(&self) -> Result<ScriptedConnection, DriverError> {
        let step = self.steps.lock().unwrap().pop_front();
        if let Some(Step::AcquireFails(err)) = step {
            return Err(err);
        }
        let step = step.or_else(|| self.fallback.clone().map(Step::Rows));

        let permit = Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .map_err(|_| DriverError::config("source closed"))?;

        self.ledger.acquired.fetch_add(1, Ordering::SeqCst);
        self.ledger
            .peak_in_use
            .fetch_max(self.ledger.in_use(), Ordering::SeqCst);

        Ok(ScriptedConnection {
            step,
            ledger: Arc::clone(&self.ledger),
            delay: self.delay,
            discarded: false,
            in_flight: false,
            _permit: permit,
        })
    }

    fn status(&self) -> PoolStatus {
        PoolStatus {
            size: self.max_size,
            available: self.max_size - self.ledger.in_use(),
            in_use: self.ledger.in_use(),
            max_size: self.max_size,
            waiting: 0,
        }
    }

    fn is_open(&self) -> bool {
        !self.permits.is_closed()
    }

    fn close(&self) {
        self.permits.close();
    }
}

impl ScriptedConnection {
    async fn next(&mut self, statement: &Statement) -> Result<Step, DriverError> {
        self.ledger
            .statements
            .lock()
            .unwrap()
            .push((statement.sql().to_string(), statement.params().to_vec()));
        self.in_flight = true;
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.in_flight = false;
        match self.step.take() {
            Some(Step::Fails(err)) => Err(err),
            Some(step) => Ok(step),
            None => Err(DriverError::connection("script exhausted")),
        }
    }
}

#[async_trait]
impl Connection for ScriptedConnection {
    async fn query(&mut self, statement: &Statement) -> Result<ResultSet, DriverError> {
        match self.next(statement).await? {
            Step::Rows(rows) => Ok(rows),
            _ => Ok(ResultSet::default()),
        }
    }

    async fn execute(&mut self, statement: &Statement) -> Result<u64, DriverError> {
        match self.next(statement).await? {
            Step::Affected(n) => Ok(n),
            Step::Rows(rows) => Ok(rows.len() as u64),
            _ => Ok(0),
        }
    }

    fn discard(mut self) {
        self.discarded = true;
        self.ledger.discarded.fetch_add(1, Ordering::SeqCst);
    }
}

impl Drop for ScriptedConnection {
    fn drop(&mut self) {
        if self.in_flight {
            // Dropped mid-statement, like a cancelled query.
            self.ledger.discarded.fetch_add(1, Ordering::SeqCst);
        } else if !self.discarded {
            self.ledger.released.fetch_add(1, Ordering::SeqCst);
        }
    }
}

/// Write templates into a fresh directory.
pub fn template_dir(files: &[(&str, &str)]) -> tempfile::TempDir {
    let dir = tempfile::tempdir().unwrap();
    for (name, body) in files {
        write_template(dir.path(), name, body);
    }
    dir
}

pub fn write_template(dir: &Path, name: &str, body: &str) {
    let path = dir.join(name);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).unwrap();
    }
    std::fs::write(path, body).unwrap();
}

pub fn store(dir: &tempfile::TempDir) -> TemplateStore {
    TemplateStore::new(dir.path(), ".sql")
}
