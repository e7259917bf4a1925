//! # Matchmaker Node
//!
//! Entry point: initialises telemetry, loads configuration, runs the node
//! until Ctrl+C.

use anyhow::{Context, Result};
use mm_node::{NodeConfig, NodeRuntime};
use mm_telemetry::{init_telemetry, TelemetryConfig};
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    let _telemetry = init_telemetry(&TelemetryConfig::from_env())
        .context("Failed to initialise telemetry")?;

    let config = NodeConfig::from_env();
    if let Err(err) = config.validate_for_production() {
        warn!(error = %err, "Running with development signer");
    }

    let runtime = NodeRuntime::new(config);
    runtime
        .start()
        .await
        .context("Failed to start matchmaker node")?;

    info!("Node is running. Press Ctrl+C to stop.");
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl+C")?;

    runtime.shutdown().await;
    Ok(())
}
