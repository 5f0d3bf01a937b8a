//! Handler invoked by a worker while it holds a claim.

use crate::HandlerError;
use async_trait::async_trait;
use overdue_core::UnitId;

/// Receives claimed units while their claim transaction is still open.
///
/// Returning `Ok` commits the claim (the units' records stay `pending`);
/// returning `Err` rolls it back so the units become eligible again.
#[async_trait]
pub trait ClaimHandler: Send + Sync {
    async fn handle(&self, units: &[UnitId]) -> Result<(), HandlerError>;
}
