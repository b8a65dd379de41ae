//! Integration tests for the executor over a scripted connection source.

mod common;

use std::time::Duration;

use common::{ScriptedSource, Step, store, template_dir};
use pgstencil::postgres::{ConstantBackoff, DriverError, ResultSet};
use pgstencil::{ErrorKind, Executor, Record, RetryConfig, RetryPredicate, blocking};
use pretty_assertions::assert_eq;
use serde::Deserialize;
use serde_json::{Value, json};

#[derive(Debug, Clone, Deserialize, PartialEq, Record)]
struct Merchant {
    id: i64,
    name: String,
}

const SELECT_MERCHANT: &str = "SELECT {{ _model_fields_ }} FROM merchants \
WHERE active = {{ active | sqlsafe }} ORDER BY name LIMIT {{ limit }}";

fn merchant_rows() -> ResultSet {
    ResultSet::new(
        vec!["id".into(), "name".into()],
        vec![
            vec![json!(3), json!("Acme")],
            vec![json!(1), json!("Globex")],
            vec![json!(2), json!("Initech")],
        ],
    )
}

fn fast_retry() -> RetryConfig {
    RetryConfig::new()
        .max_attempts(3)
        .backoff(ConstantBackoff(Duration::from_millis(1)))
}

#[tokio::test]
async fn test_rows_keep_server_order() {
    let dir = template_dir(&[("select_merchant.sql", SELECT_MERCHANT)]);
    let executor = Executor::with_source(ScriptedSource::new(vec![Step::Rows(merchant_rows())]), store(&dir))
        .build();

    let merchants: Vec<Merchant> = executor
        .query("select_merchant", &json!({ "active": true, "limit": 3 }))
        .await
        .unwrap();

    let ids: Vec<i64> = merchants.iter().map(|m| m.id).collect();
    assert_eq!(ids, vec![3, 1, 2]);

    let statements = executor.source().ledger.statements.lock().unwrap().clone();
    assert_eq!(
        statements,
        vec![(
            "SELECT id, name FROM merchants WHERE active = true ORDER BY name LIMIT $1".to_string(),
            vec![json!(3)]
        )]
    );
}

#[tokio::test]
async fn test_untyped_rows_are_column_maps() {
    let dir = template_dir(&[("all.sql", "SELECT id, name FROM merchants")]);
    let executor = Executor::with_source(ScriptedSource::new(vec![Step::Rows(merchant_rows())]), store(&dir))
        .build();

    let rows = executor.query_rows("all", &Value::Null).await.unwrap();
    assert_eq!(rows.len(), 3);
    assert_eq!(rows[0].keys().collect::<Vec<_>>(), vec!["id", "name"]);
    assert_eq!(rows[2]["name"], json!("Initech"));
}

#[tokio::test]
async fn test_retry_uses_a_fresh_connection() {
    let dir = template_dir(&[("select_merchant.sql", SELECT_MERCHANT)]);
    let source = ScriptedSource::new(vec![
        Step::Fails(DriverError::database("57P01", "terminating connection due to administrator command")),
        Step::Rows(merchant_rows()),
    ]);
    let executor = Executor::with_source(source, store(&dir)).retry(fast_retry()).build();

    let merchants: Vec<Merchant> = executor
        .query("select_merchant", &json!({ "active": true, "limit": 3 }))
        .await
        .unwrap();
    assert_eq!(merchants.len(), 3);

    // acquired, released, discarded
    assert_eq!(executor.source().ledger.counts(), (2, 1, 1));
    assert_eq!(executor.pool_status().in_use, 0);
}

#[tokio::test]
async fn test_terminal_failure_is_reported_with_context() {
    let dir = template_dir(&[("select_merchant.sql", SELECT_MERCHANT)]);
    let source = ScriptedSource::new(vec![Step::Fails(DriverError::database(
        "42P01",
        "relation \"merchants\" does not exist",
    ))]);
    let executor = Executor::with_source(source, store(&dir)).retry(fast_retry()).build();

    let err = executor
        .query::<Merchant, _>("select_merchant", &json!({ "active": true, "limit": 3 }))
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::QueryExecution);
    assert_eq!(err.attempts(), Some(1));
    assert_eq!(err.driver_error().and_then(DriverError::code), Some("42P01"));
    match err {
        pgstencil::Error::QueryExecution { sql, params, .. } => {
            assert!(sql.starts_with("SELECT id, name FROM merchants"));
            assert_eq!(params, "[integer]");
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test]
async fn test_custom_predicate() {
    let dir = template_dir(&[("touch.sql", "UPDATE merchants SET seen = now()")]);
    let source = ScriptedSource::new(vec![
        Step::Fails(DriverError::database("55P03", "lock not available")),
        Step::Affected(12),
    ]);
    let executor = Executor::with_source(source, store(&dir))
        .retry(fast_retry().retry_on(RetryPredicate::custom(|e| e.code() == Some("55P03"))))
        .build();

    let affected = executor.execute("touch", &Value::Null).await.unwrap();
    assert_eq!(affected, 12);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_in_use_never_exceeds_max_size() {
    let dir = template_dir(&[("select_merchant.sql", SELECT_MERCHANT)]);
    let source = ScriptedSource::repeating(merchant_rows(), 2, Duration::from_millis(5));
    let executor = Executor::with_source(source, store(&dir)).build();

    let mut handles = Vec::new();
    for limit in 0..16 {
        let executor = executor.clone();
        handles.push(tokio::spawn(async move {
            executor
                .query::<Merchant, _>("select_merchant", &json!({ "active": true, "limit": limit }))
                .await
        }));
    }
    for handle in handles {
        assert_eq!(handle.await.unwrap().unwrap().len(), 3);
    }

    let ledger = &executor.source().ledger;
    assert!(ledger.peak_in_use.load(std::sync::atomic::Ordering::SeqCst) <= 2);
    assert_eq!(ledger.in_use(), 0);
    assert_eq!(ledger.counts().0, 16);
}

#[tokio::test]
async fn test_cancelled_query_releases_its_connection() {
    let dir = template_dir(&[("select_merchant.sql", SELECT_MERCHANT)]);
    let source = ScriptedSource::repeating(merchant_rows(), 1, Duration::from_millis(200));
    let executor = Executor::with_source(source, store(&dir)).build();
    let params = json!({ "active": true, "limit": 3 });

    let cancelled = tokio::time::timeout(
        Duration::from_millis(20),
        executor.query_rows("select_merchant", &params),
    )
    .await;
    assert!(cancelled.is_err());

    assert_eq!(executor.pool_status().in_use, 0);
    assert_eq!(executor.source().ledger.counts(), (1, 0, 1));

    let rows = executor.query_rows("select_merchant", &params).await.unwrap();
    assert_eq!(rows.len(), 3);
    assert_eq!(executor.pool_status().in_use, 0);
    assert_eq!(executor.source().ledger.counts(), (2, 1, 1));
}

#[tokio::test]
async fn test_closed_source_fails() {
    let dir = template_dir(&[("ping.sql", "SELECT 1")]);
    let executor = Executor::with_source(ScriptedSource::new(vec![]), store(&dir)).build();

    assert!(executor.is_open());
    executor.close();
    assert!(!executor.is_open());

    let err = executor.query_rows("ping", &Value::Null).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::QueryExecution);
}

#[test]
fn test_blocking_client_matches_async() {
    let dir = template_dir(&[("select_merchant.sql", SELECT_MERCHANT)]);
    let executor = Executor::with_source(
        ScriptedSource::new(vec![
            Step::Fails(DriverError::connection("connection reset by peer")),
            Step::Rows(merchant_rows()),
        ]),
        store(&dir),
    )
    .retry(fast_retry())
    .build();
    let client = blocking::Client::from_executor(executor).unwrap();

    let merchants: Vec<Merchant> = client
        .query("select_merchant", &json!({ "active": true, "limit": 3 }))
        .unwrap();
    assert_eq!(merchants[0], Merchant { id: 3, name: "Acme".into() });
    assert_eq!(client.executor().source().ledger.counts(), (2, 1, 1));
}
