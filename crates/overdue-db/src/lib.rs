//! Database layer for overdue.
//!
//! Provides pool creation, embedded migrations and the unit/work record
//! repositories.

pub mod error;
pub mod repo;

pub use error::{DbError, DbResult};
pub use repo::*;

use overdue_config::DatabaseConfig;
use sqlx::PgPool;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use std::str::FromStr;
use tracing::debug;

/// Create a new database connection pool.
///
/// `schema` is applied as the connection `search_path`, and
/// `idle_transaction_timeout` makes the server abort claims left open by a
/// stuck caller.
pub async fn create_pool(config: &DatabaseConfig) -> DbResult<PgPool> {
    let mut options = PgConnectOptions::from_str(&config.url)?;

    let mut startup = Vec::new();
    if let Some(schema) = &config.schema {
        startup.push(("search_path", schema.clone()));
    }
    if let Some(timeout) = config.idle_transaction_timeout {
        startup.push((
            "idle_in_transaction_session_timeout",
            format!("{}ms", timeout.as_millis()),
        ));
    }
    if !startup.is_empty() {
        debug!(?startup, "Applying session options");
        options = options.options(startup);
    }

    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .connect_with(options)
        .await?;
    Ok(pool)
}

/// Run database migrations, creating `schema` first when one is given.
pub async fn run_migrations(pool: &PgPool, schema: Option<&str>) -> DbResult<()> {
    if let Some(schema) = schema {
        // Schema names are validated by the config parser; quote anyway.
        sqlx::query(&format!(
            "CREATE SCHEMA IF NOT EXISTS \"{}\"",
            schema.replace('"', "\"\"")
        ))
        .execute(pool)
        .await?;
    }
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}
