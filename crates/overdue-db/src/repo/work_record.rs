//! Work record repository.
//!
//! Used by whatever processes claimed units to record stage outcomes. The
//! claim protocol writes `pending` itself, inside its own transaction.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use overdue_core::{StageKind, UnitId, WorkStatus};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;

use crate::{DbError, DbResult};

/// A work record row.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct WorkRecord {
    pub unit_id: String,
    pub kind: String,
    pub status: String,
    pub updated_at: DateTime<Utc>,
}

impl WorkRecord {
    /// Parse the stored status.
    pub fn status(&self) -> DbResult<WorkStatus> {
        Ok(self.status.parse()?)
    }
}

#[async_trait]
pub trait WorkRecordRepo: Send + Sync {
    async fn get(&self, unit_id: &UnitId, kind: &StageKind) -> DbResult<WorkRecord>;
    async fn list_for_unit(&self, unit_id: &UnitId) -> DbResult<Vec<WorkRecord>>;
    /// Create or overwrite the record for `(unit_id, kind)`.
    async fn set_status(
        &self,
        unit_id: &UnitId,
        kind: &StageKind,
        status: WorkStatus,
    ) -> DbResult<WorkRecord>;
}

/// PostgreSQL implementation of WorkRecordRepo.
pub struct PgWorkRecordRepo {
    pool: PgPool,
}

impl PgWorkRecordRepo {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl WorkRecordRepo for PgWorkRecordRepo {
    async fn get(&self, unit_id: &UnitId, kind: &StageKind) -> DbResult<WorkRecord> {
        let record = sqlx::query_as::<_, WorkRecord>(
            "SELECT * FROM work_records WHERE unit_id = $1 AND kind = $2",
        )
        .bind(unit_id.as_str())
        .bind(kind.as_str())
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| DbError::NotFound(format!("{} record for unit {}", kind, unit_id)))?;
        Ok(record)
    }

    async fn list_for_unit(&self, unit_id: &UnitId) -> DbResult<Vec<WorkRecord>> {
        let records = sqlx::query_as::<_, WorkRecord>(
            "SELECT * FROM work_records WHERE unit_id = $1 ORDER BY kind",
        )
        .bind(unit_id.as_str())
        .fetch_all(&self.pool)
        .await?;
        Ok(records)
    }

    async fn set_status(
        &self,
        unit_id: &UnitId,
        kind: &StageKind,
        status: WorkStatus,
    ) -> DbResult<WorkRecord> {
        let result = sqlx::query_as::<_, WorkRecord>(
            r#"
            INSERT INTO work_records (unit_id, kind, status, updated_at)
            VALUES ($1, $2, $3, NOW())
            ON CONFLICT (unit_id, kind)
            DO UPDATE SET status = EXCLUDED.status, updated_at = EXCLUDED.updated_at
            RETURNING *
            "#,
        )
        .bind(unit_id.as_str())
        .bind(kind.as_str())
        .bind(status.as_str())
        .fetch_one(&self.pool)
        .await;

        match result {
            Ok(record) => Ok(record),
            Err(sqlx::Error::Database(e)) if e.is_foreign_key_violation() => {
                Err(DbError::NotFound(format!("unit {}", unit_id)))
            }
            Err(e) => Err(e.into()),
        }
    }
}
