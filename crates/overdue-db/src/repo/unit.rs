//! Unit repository.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use overdue_core::UnitId;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;

use crate::{DbError, DbResult};

/// A unit row: something that periodically needs work.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Unit {
    pub id: String,
    pub last_updated: DateTime<Utc>,
}

impl Unit {
    pub fn unit_id(&self) -> UnitId {
        UnitId::new(self.id.clone())
    }
}

#[async_trait]
pub trait UnitRepo: Send + Sync {
    /// Create the unit or move its `last_updated` to the given time.
    async fn upsert(&self, id: &UnitId, last_updated: DateTime<Utc>) -> DbResult<Unit>;
    /// Mark the unit as freshly updated by its owner.
    async fn touch(&self, id: &UnitId) -> DbResult<Unit>;
    async fn get(&self, id: &UnitId) -> DbResult<Unit>;
    async fn list(&self) -> DbResult<Vec<Unit>>;
    /// Delete the unit; its work records go with it.
    async fn delete(&self, id: &UnitId) -> DbResult<()>;
}

/// PostgreSQL implementation of UnitRepo.
pub struct PgUnitRepo {
    pool: PgPool,
}

impl PgUnitRepo {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl UnitRepo for PgUnitRepo {
    async fn upsert(&self, id: &UnitId, last_updated: DateTime<Utc>) -> DbResult<Unit> {
        let unit = sqlx::query_as::<_, Unit>(
            r#"
            INSERT INTO units (id, last_updated)
            VALUES ($1, $2)
            ON CONFLICT (id) DO UPDATE SET last_updated = EXCLUDED.last_updated
            RETURNING *
            "#,
        )
        .bind(id.as_str())
        .bind(last_updated)
        .fetch_one(&self.pool)
        .await?;
        Ok(unit)
    }

    async fn touch(&self, id: &UnitId) -> DbResult<Unit> {
        let unit = sqlx::query_as::<_, Unit>(
            "UPDATE units SET last_updated = NOW() WHERE id = $1 RETURNING *",
        )
        .bind(id.as_str())
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| DbError::NotFound(format!("unit {}", id)))?;
        Ok(unit)
    }

    async fn get(&self, id: &UnitId) -> DbResult<Unit> {
        let unit = sqlx::query_as::<_, Unit>("SELECT * FROM units WHERE id = $1")
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| DbError::NotFound(format!("unit {}", id)))?;
        Ok(unit)
    }

    async fn list(&self) -> DbResult<Vec<Unit>> {
        let units = sqlx::query_as::<_, Unit>("SELECT * FROM units ORDER BY last_updated, id")
            .fetch_all(&self.pool)
            .await?;
        Ok(units)
    }

    async fn delete(&self, id: &UnitId) -> DbResult<()> {
        let result = sqlx::query("DELETE FROM units WHERE id = $1")
            .bind(id.as_str())
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(DbError::NotFound(format!("unit {}", id)));
        }
        Ok(())
    }
}
