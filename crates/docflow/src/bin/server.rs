//! Docflow server binary
//!
//! Run with: cargo run -p docflow --bin docflow-server
//! Set DOCFLOW_CONFIG to a TOML file to override the defaults.

use docflow::{config::DocflowConfig, server::DocflowServer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "docflow=info,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = DocflowConfig::load()?;
    config.validate()?;

    tracing::info!("Configuration loaded");
    tracing::info!("  - Database: {}", config.storage.database_path.display());
    tracing::info!("  - Objects: {}", config.storage.objects_dir.display());
    tracing::info!("  - Search index: {}", config.search.index_path.display());
    tracing::info!("  - Partitions: {}", config.events.partitions);
    tracing::info!(
        "  - Indexer: {} attempts, backoff {}ms..{}ms",
        config.indexer.max_attempts,
        config.indexer.backoff_base_ms,
        config.indexer.backoff_cap_ms
    );
    tracing::info!("  - Job concurrency: {}", config.jobs.concurrency);

    let server = DocflowServer::new(config).await?;

    println!("\nServer starting...");
    println!("  API: http://{}/api", server.address());
    println!("  Health: http://{}/health", server.address());
    println!("  API Info: http://{}/api/info", server.address());
    println!("\nPress Ctrl+C to stop\n");

    server.start().await?;

    Ok(())
}
