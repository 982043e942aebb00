//! # Hydra Node
//!
//! Entry point for one cluster member.
//!
//! ## Startup Sequence
//!
//! 1. Load configuration (`config.toml`, then environment overrides)
//! 2. Initialize logging (`RUST_LOG`, default `info`)
//! 3. Start the bus and register the built-in handlers
//! 4. Serve until Ctrl+C, then shut the bus down

use anyhow::Result;
use tracing::info;
use tracing_subscriber::EnvFilter;

use hydra_node::config::json_logs;
use hydra_node::{load_config, NodeRuntime};

fn init_logging(json: bool) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true);

    if json {
        builder
            .json()
            .try_init()
            .map_err(|e| anyhow::anyhow!("failed to install logger: {e}"))
    } else {
        builder
            .try_init()
            .map_err(|e| anyhow::anyhow!("failed to install logger: {e}"))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let lookup = |key: &str| std::env::var(key).ok();
    init_logging(json_logs(&lookup))?;
    let config = load_config(lookup)?;

    let runtime = NodeRuntime::start(config).await?;

    info!(node = runtime.name(), "Node is running. Press Ctrl+C to stop.");
    runtime
        .run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            }
        })
        .await
}
