//! Claim policy: the inputs of the eligibility predicate.

use crate::{Error, Result, StageKind};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default staleness threshold: units touched within the last ten minutes
/// are not overdue yet.
pub const DEFAULT_STALENESS: Duration = Duration::from_secs(10 * 60);

/// Describes which units are eligible for claiming and how many to claim at once.
///
/// A unit is eligible when its `last_updated` is older than `staleness`, its
/// `prerequisite` record (if any) is completed, and its `stage` record is
/// either absent or completed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClaimPolicy {
    /// Stage whose record is transitioned to pending by a claim.
    pub stage: StageKind,
    /// Stage that must be completed before `stage` may be claimed.
    pub prerequisite: Option<StageKind>,
    /// Minimum age of `last_updated` for a unit to be overdue.
    pub staleness: Duration,
    /// Upper bound on units claimed by a single call.
    pub batch_size: u32,
}

impl ClaimPolicy {
    pub fn new(stage: StageKind) -> Self {
        Self {
            stage,
            prerequisite: None,
            staleness: DEFAULT_STALENESS,
            batch_size: 1,
        }
    }

    pub fn with_prerequisite(mut self, prerequisite: StageKind) -> Self {
        self.prerequisite = Some(prerequisite);
        self
    }

    pub fn with_staleness(mut self, staleness: Duration) -> Self {
        self.staleness = staleness;
        self
    }

    pub fn with_batch_size(mut self, batch_size: u32) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Check the policy is internally consistent.
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(Error::InvalidInput(
                "batch size must be at least 1".to_string(),
            ));
        }
        if self.prerequisite.as_ref() == Some(&self.stage) {
            return Err(Error::InvalidInput(format!(
                "stage '{}' cannot be its own prerequisite",
                self.stage
            )));
        }
        Ok(())
    }
}
