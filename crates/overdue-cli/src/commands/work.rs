//! Long-running worker command.

use anyhow::{Context, Result};
use async_trait::async_trait;
use overdue_config::SystemConfig;
use overdue_core::UnitId;
use overdue_scheduler::{ClaimHandler, ClaimQueue, HandlerError, Worker};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::info;

/// Handler that only reports claimed units.
///
/// Real deployments dispatch the units to whatever performs the stage and
/// later record the outcome with `overdue mark`.
struct LogHandler;

#[async_trait]
impl ClaimHandler for LogHandler {
    async fn handle(&self, units: &[UnitId]) -> Result<(), HandlerError> {
        for unit in units {
            info!(unit = %unit, "Dispatching unit");
        }
        Ok(())
    }
}

/// Run `workers` concurrent workers until Ctrl-C.
pub async fn run(config: &SystemConfig, workers: Option<usize>) -> Result<()> {
    let pool = super::connect(config).await?;
    let queue = Arc::new(ClaimQueue::new(pool, config.claim.clone()));
    let handler: Arc<dyn ClaimHandler> = Arc::new(LogHandler);
    let count = workers.unwrap_or(config.worker.count).max(1);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let handles: Vec<_> = (0..count)
        .map(|i| {
            let worker = Worker::new(
                format!("worker-{}", i),
                queue.clone(),
                handler.clone(),
                config.worker.clone(),
            );
            let shutdown = shutdown_rx.clone();
            tokio::spawn(async move { worker.run(shutdown).await })
        })
        .collect();

    info!(workers = count, stage = %config.claim.stage, "Workers started, press Ctrl-C to stop");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    info!("Shutting down workers");
    let _ = shutdown_tx.send(true);

    for result in futures::future::join_all(handles).await {
        result.context("Worker task panicked")?;
    }

    Ok(())
}
