//! CLI command implementations.

pub mod claim;
pub mod unit;
pub mod work;

use anyhow::{Context, Result};
use overdue_config::{SystemConfig, load_system_config};
use overdue_core::{StageKind, UnitId, WorkStatus};
use overdue_db::{PgWorkRecordRepo, WorkRecordRepo, create_pool, run_migrations};
use sqlx::PgPool;
use tracing::info;
use url::Url;

/// Load the configuration file, letting `database_url` override its database URL.
pub fn load_config(path: &str, database_url: Option<&str>) -> Result<SystemConfig> {
    let mut config = load_system_config(path)
        .with_context(|| format!("Failed to load configuration: {}", path))?;
    if let Some(url) = database_url {
        config.database.url = url.to_string();
    }
    Ok(config)
}

/// Connect to the configured database.
pub async fn connect(config: &SystemConfig) -> Result<PgPool> {
    info!(url = %redact_url(&config.database.url), "Connecting to database...");
    let pool = create_pool(&config.database)
        .await
        .context("Failed to connect to database")?;
    Ok(pool)
}

pub async fn migrate(config: &SystemConfig) -> Result<()> {
    let pool = connect(config).await?;
    run_migrations(&pool, config.database.schema.as_deref())
        .await
        .context("Failed to run migrations")?;
    println!("Migrations applied");
    Ok(())
}

pub async fn mark(
    config: &SystemConfig,
    unit: &str,
    status: &str,
    stage: Option<&str>,
) -> Result<()> {
    let status: WorkStatus = status.parse()?;
    let stage = match stage {
        Some(stage) => StageKind::new(stage)?,
        None => config.claim.stage.clone(),
    };

    let pool = connect(config).await?;
    let record = PgWorkRecordRepo::new(pool)
        .set_status(&UnitId::new(unit), &stage, status)
        .await
        .with_context(|| format!("Failed to mark {} {} for unit {}", stage, status, unit))?;

    println!("{} {} -> {}", record.unit_id, record.kind, record.status);
    Ok(())
}

pub fn validate(path: &str) -> Result<()> {
    match load_system_config(path) {
        Ok(config) => {
            println!("Configuration is valid");
            println!("  stage:        {}", config.claim.stage);
            if let Some(prerequisite) = &config.claim.prerequisite {
                println!("  prerequisite: {}", prerequisite);
            }
            println!("  staleness:    {:?}", config.claim.staleness);
            println!("  batch size:   {}", config.claim.batch_size);
            Ok(())
        }
        Err(e) => {
            println!("Configuration error: {}", e);
            std::process::exit(1);
        }
    }
}

/// Hide the password of a database URL for logging.
fn redact_url(raw: &str) -> String {
    match Url::parse(raw) {
        Ok(mut url) => {
            if url.password().is_some() {
                let _ = url.set_password(Some("***"));
            }
            url.to_string()
        }
        Err(_) => "<unparseable url>".to_string(),
    }
}
