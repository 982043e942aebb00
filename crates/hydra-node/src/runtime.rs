//! Node lifecycle: start the bus, serve until told to stop, shut down.

use anyhow::{Context, Result};
use hydra_bus::Bus;
use std::future::Future;
use std::sync::Arc;
use tracing::{error, info};

use crate::config::NodeConfig;
use crate::handlers::register_builtin_handlers;

/// One running cluster member.
pub struct NodeRuntime {
    name: String,
    bus: Arc<Bus>,
}

impl NodeRuntime {
    /// Start the bus and register the built-in handlers.
    ///
    /// # Errors
    ///
    /// If a configured socket cannot be bound.
    pub async fn start(config: NodeConfig) -> Result<Self> {
        info!(node = %config.node_name, "Starting Hydra node");

        let bus = Bus::start(config.bus)
            .await
            .context("Failed to start bus")?;
        let bus = Arc::new(bus);
        register_builtin_handlers(&bus, &config.node_name)?;

        Ok(Self {
            name: config.node_name,
            bus,
        })
    }

    /// The node's bus, for registering application handlers.
    #[must_use]
    pub fn bus(&self) -> Arc<Bus> {
        Arc::clone(&self.bus)
    }

    /// Node name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Serve until `stop` completes or serving fails, then shut the bus down.
    ///
    /// # Errors
    ///
    /// The serving error, if serving ended on its own.
    pub async fn run_until<F>(&self, stop: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let result = tokio::select! {
            result = self.bus.serve_forever() => result.context("Bus stopped serving"),
            () = stop => {
                info!("Shutdown signal received");
                Ok(())
            }
        };

        if let Err(e) = &result {
            error!(error = %e, "Node failed");
        }
        self.bus.shutdown().await;
        info!(node = %self.name, "Node stopped");
        result
    }
}
