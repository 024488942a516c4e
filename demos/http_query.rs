/// NEON_DATABASE_URL=postgresql://... cargo run --example http_query --features examples
use pgwire_serverless::{
    Executor, IsolationLevel, NeonClient, NeonConfig, QueryOptions, Statement,
    TransactionOptions, Transport,
};
use serde_json::json;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    let dsn = std::env::var("NEON_DATABASE_URL")?;
    let mut config = NeonConfig::new(&dsn)?;
    // Optional JWT for endpoints behind authorization.
    config.auth_token = std::env::var("NEON_AUTH_TOKEN").ok();

    let client = NeonClient::new(config, Transport::Http)?;

    let res = client
        .query(
            "SELECT now() AS ts, $1::text AS greeting",
            &[json!("hello")],
            &QueryOptions::default(),
        )
        .await?;
    println!("{} row(s), command {}", res.rows.len(), res.command);
    for row in &res.rows {
        println!("{row:?}");
    }

    let batch = client
        .transaction(
            &[
                Statement::new("SELECT current_user AS who"),
                Statement::with_params("SELECT $1::int * 2 AS doubled", vec![json!(21)]),
            ],
            &TransactionOptions::new(IsolationLevel::Serializable, true, true)?.array_mode(true),
        )
        .await?;
    for (i, res) in batch.iter().enumerate() {
        println!("statement {i}: {:?}", res.rows);
    }

    Ok(())
}
