//! Worker that claims overdue units and hands them to a handler.

use crate::handler::ClaimHandler;
use crate::queue::ClaimQueue;
use crate::QueueResult;
use overdue_config::WorkerConfig;
use overdue_core::UnitId;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::{sleep, timeout};
use tracing::{info, warn};

/// Result of a single claim-and-handle iteration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Nothing was eligible.
    Idle,
    /// The handler accepted the units and the claim was committed.
    Committed(Vec<UnitId>),
    /// The handler failed or timed out; the claim was rolled back.
    RolledBack(Vec<UnitId>),
}

/// A worker that claims units and passes them to its handler.
pub struct Worker {
    id: String,
    queue: Arc<ClaimQueue>,
    handler: Arc<dyn ClaimHandler>,
    config: WorkerConfig,
}

impl Worker {
    pub fn new(
        id: impl Into<String>,
        queue: Arc<ClaimQueue>,
        handler: Arc<dyn ClaimHandler>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            id: id.into(),
            queue,
            handler,
            config,
        }
    }

    /// Claim once, run the handler under the configured timeout, then commit
    /// or roll back.
    pub async fn run_once(&self) -> QueueResult<Outcome> {
        let claim = self.queue.claim().await?;
        if claim.is_empty() {
            claim.commit().await?;
            return Ok(Outcome::Idle);
        }

        let units = claim.units().to_vec();
        info!(worker_id = %self.id, units = ?units, "Claimed units");

        match timeout(self.config.handler_timeout, self.handler.handle(&units)).await {
            Ok(Ok(())) => {
                claim.commit().await?;
                Ok(Outcome::Committed(units))
            }
            Ok(Err(e)) => {
                warn!(
                    worker_id = %self.id,
                    units = ?units,
                    error = %e,
                    "Handler failed, releasing claim"
                );
                claim.rollback().await?;
                Ok(Outcome::RolledBack(units))
            }
            Err(_) => {
                warn!(
                    worker_id = %self.id,
                    units = ?units,
                    timeout = ?self.config.handler_timeout,
                    "Handler timed out, releasing claim"
                );
                claim.rollback().await?;
                Ok(Outcome::RolledBack(units))
            }
        }
    }

    /// Run the worker loop until `shutdown` turns true or its sender is dropped.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(worker_id = %self.id, "Starting worker");

        while !*shutdown.borrow() {
            let pause = match self.run_once().await {
                Ok(Outcome::Idle) => Some(self.config.poll_interval),
                Ok(_) => None,
                Err(e) => {
                    warn!(worker_id = %self.id, error = %e, "Failed to claim units");
                    Some(self.config.error_backoff)
                }
            };

            if let Some(pause) = pause {
                tokio::select! {
                    _ = sleep(pause) => {}
                    changed = shutdown.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
            }
        }

        info!(worker_id = %self.id, "Worker stopped");
    }
}
