//! Unit management commands.

use anyhow::{Context, Result};
use chrono::Utc;
use overdue_config::SystemConfig;
use overdue_core::UnitId;
use overdue_db::{PgUnitRepo, PgWorkRecordRepo, UnitRepo, WorkRecordRepo};

/// Create or update a unit, optionally backdating its last update by `age`.
pub async fn touch(config: &SystemConfig, id: &str, age: Option<&str>) -> Result<()> {
    let pool = super::connect(config).await?;
    let repo = PgUnitRepo::new(pool);
    let id = UnitId::new(id);

    let last_updated = match age {
        Some(age) => {
            let age = humantime::parse_duration(age)
                .with_context(|| format!("Invalid age '{}', expected e.g. 30s, 10m or 2h", age))?;
            Utc::now() - chrono::Duration::from_std(age)?
        }
        None => Utc::now(),
    };

    let unit = repo.upsert(&id, last_updated).await?;
    println!("{} last updated {}", unit.id, unit.last_updated);
    Ok(())
}

pub async fn delete(config: &SystemConfig, id: &str) -> Result<()> {
    let pool = super::connect(config).await?;
    PgUnitRepo::new(pool)
        .delete(&UnitId::new(id))
        .await
        .with_context(|| format!("Failed to delete unit {}", id))?;
    println!("Deleted {}", id);
    Ok(())
}

pub async fn list(config: &SystemConfig) -> Result<()> {
    let pool = super::connect(config).await?;
    let units = PgUnitRepo::new(pool.clone());
    let records = PgWorkRecordRepo::new(pool);

    let all = units.list().await?;
    if all.is_empty() {
        println!("No units");
        return Ok(());
    }

    for unit in all {
        let stages: Vec<String> = records
            .list_for_unit(&unit.unit_id())
            .await?
            .into_iter()
            .map(|r| format!("{}={}", r.kind, r.status))
            .collect();
        println!("{}  {}  {}", unit.id, unit.last_updated, stages.join(" "));
    }
    Ok(())
}
