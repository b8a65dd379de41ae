//! Query merchants through SQL templates.
//!
//! ```text
//! PGSTENCIL_LOG_LEVEL=debug PGPASSWORD=secret \
//! cargo run --example merchants --features tracing-subscriber
//! ```
//!
//! Expects a `merchants (id bigint, name text, active boolean)` table.

use pgstencil::prelude::*;
use serde::Deserialize;
use serde_json::json;

#[derive(Debug, Deserialize, Record)]
struct Merchant {
    id: i64,
    name: String,
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    pgstencil::logging::init();

    let settings = Settings::builder()
        .user(std::env::var("PGUSER").unwrap_or_else(|_| "postgres".into()))
        .password(std::env::var("PGPASSWORD").unwrap_or_default())
        .dbname(std::env::var("PGDATABASE").unwrap_or_else(|_| "postgres".into()))
        .template_dir(concat!(env!("CARGO_MANIFEST_DIR"), "/demos/templates"))
        .template_extension(".sql")
        .min_size(1)
        .build()?;
    let client = Client::new(settings)?;

    let statement = client
        .render::<Merchant, _>("select_merchant", &json!({ "active": true, "limit": 3 }))
        .await?;
    println!("{statement}  -- {}", statement.param_summary());

    let merchants: Vec<Merchant> = client
        .query("select_merchant", &json!({ "active": true, "limit": 3 }))
        .await?;
    for merchant in &merchants {
        println!("{:>6}  {}", merchant.id, merchant.name);
    }

    let ids: Vec<i64> = merchants.iter().map(|m| m.id).collect();
    if !ids.is_empty() {
        let affected = client
            .execute("deactivate_merchants", &json!({ "ids": ids }))
            .await?;
        println!("deactivated {affected} merchant(s)");
    }

    println!("{:?}", client.pool_status());
    client.close();
    Ok(())
}
