//! Claim protocol errors.

use overdue_core::UnitId;
use thiserror::Error;

/// Failure of a claim attempt.
///
/// Every variant except `Begin` and `InvalidLimit` is raised after the
/// claiming transaction was opened; by the time the caller sees it the
/// transaction has been rolled back and the store is unchanged.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("candidate limit must be at least 1")]
    InvalidLimit,

    #[error("failed to open claim transaction: {0}")]
    Begin(#[source] sqlx::Error),

    #[error("eligibility query failed: {0}")]
    Select(#[source] sqlx::Error),

    #[error("malformed candidate row: {0}")]
    Decode(String),

    #[error("failed to mark {} unit(s) pending: {source}", .partial.len())]
    Write {
        /// Units that would have been claimed. Never committed.
        partial: Vec<UnitId>,
        #[source]
        source: sqlx::Error,
    },

    #[error("failed to finalize claim: {0}")]
    Finalize(#[source] sqlx::Error),
}

impl QueueError {
    /// Units computed before the failure, for diagnostics only.
    pub fn partial(&self) -> &[UnitId] {
        match self {
            QueueError::Write { partial, .. } => partial,
            _ => &[],
        }
    }
}

pub type QueueResult<T> = std::result::Result<T, QueueError>;

/// Error returned by a [`ClaimHandler`](crate::ClaimHandler) to reject a claim.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct HandlerError(pub String);

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}
