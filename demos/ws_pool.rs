/// NEON_DATABASE_URL=postgresql://... POOL_SIZE=4 cargo run --example ws_pool --features examples
use std::time::Instant;

use pgwire_serverless::{Executor, NeonConfig, QueryOptions, WsPool};
use serde_json::json;

fn env(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,pgwire_serverless=debug".into()),
        )
        .init();

    let mut config = NeonConfig::new(&env("NEON_DATABASE_URL", ""))?;
    config.pool_size = env("POOL_SIZE", "4").parse()?;
    let queries: usize = env("QUERIES", "20").parse()?;

    let pool = WsPool::new(config)?;
    let started = Instant::now();

    let tasks = (0..queries).map(|i| {
        let pool = pool.clone();
        tokio::spawn(async move {
            pool.query(
                "SELECT $1::int AS i, pg_backend_pid() AS pid",
                &[json!(i)],
                &QueryOptions::default(),
            )
            .await
        })
    });

    for task in futures_util::future::join_all(tasks).await {
        let res = task??;
        let row = &res.rows[0];
        println!(
            "i={} pid={}",
            row.get("i").unwrap_or(&json!(null)),
            row.get("pid").unwrap_or(&json!(null))
        );
    }

    println!(
        "{queries} queries in {:?}, pool {:?}",
        started.elapsed(),
        pool.status()
    );
    pool.close().await;
    Ok(())
}
