use anyhow::Result;
use tracing::info;
use tracing_subscriber::EnvFilter;

use grantcast_common::AppConfig;
use grantcast_pipeline::{Orchestrator, PipelineDeps};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = AppConfig::from_env()?;

    let deps = PipelineDeps::from_config(&config).await?;
    info!(cache_enabled = config.cache_enabled, "pipeline workers starting");

    Orchestrator::standard(&deps).run().await
}
