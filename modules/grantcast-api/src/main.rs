use std::sync::Arc;

use anyhow::Result;
use sqlx::postgres::PgPoolOptions;
use tracing::info;
use tracing_subscriber::EnvFilter;

use grantcast_api::{router, AppState};
use grantcast_common::AppConfig;
use grantcast_store::migrate::migrate;
use grantcast_store::queue::PgJobQueue;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = AppConfig::from_env()?;

    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&config.database_url)
        .await?;
    migrate(&pool).await?;

    let state = Arc::new(AppState {
        queue: Arc::new(PgJobQueue::new(pool)),
        api_key: config.job_api_key.clone(),
    });

    let addr = format!("{}:{}", config.api_host, config.api_port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(addr, "api listening");
    axum::serve(listener, router(state)).await?;
    Ok(())
}
