//! One-shot claim command.

use anyhow::{Context, Result};
use overdue_config::SystemConfig;
use overdue_core::UnitId;
use overdue_scheduler::ClaimQueue;
use serde::Serialize;

#[derive(Serialize)]
struct ClaimReport<'a> {
    stage: &'a str,
    units: &'a [UnitId],
    committed: bool,
}

/// Claim up to `limit` units, then commit (or roll back for a dry run).
pub async fn run(
    config: &SystemConfig,
    limit: Option<u32>,
    dry_run: bool,
    json: bool,
) -> Result<()> {
    let pool = super::connect(config).await?;
    let queue = ClaimQueue::new(pool, config.claim.clone());
    let limit = limit.unwrap_or(config.claim.batch_size);

    let claim = queue
        .claim_next(limit)
        .await
        .context("Failed to claim units")?;
    let units = claim.units().to_vec();

    if dry_run {
        claim.rollback().await.context("Failed to roll back claim")?;
    } else {
        claim.commit().await.context("Failed to commit claim")?;
    }

    if json {
        let report = ClaimReport {
            stage: config.claim.stage.as_str(),
            units: &units,
            committed: !dry_run && !units.is_empty(),
        };
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else if units.is_empty() {
        println!("No overdue units");
    } else {
        let verb = if dry_run { "Would claim" } else { "Claimed" };
        for unit in &units {
            println!("{} {} ({})", verb, unit, config.claim.stage);
        }
    }

    Ok(())
}
