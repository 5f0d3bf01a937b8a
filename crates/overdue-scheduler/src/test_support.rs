//! Shared database fixture for claim tests.

use crate::ClaimQueue;
use chrono::{Duration, Utc};
use overdue_config::DatabaseConfig;
use overdue_core::{ClaimPolicy, StageKind, UnitId, WorkStatus};
use overdue_db::{
    PgUnitRepo, PgWorkRecordRepo, UnitRepo, WorkRecordRepo, create_pool, run_migrations,
};
use sqlx::PgPool;

pub fn initial() -> StageKind {
    StageKind::new("initial").unwrap()
}

pub fn incremental() -> StageKind {
    StageKind::new("incremental").unwrap()
}

/// Units `one` (2h stale), `two` and `three` (1h stale) in a private schema.
///
/// `one` and `two` have a completed initial stage, `three` a failed one.
pub struct Fixture {
    pub pool: PgPool,
    config: DatabaseConfig,
}

impl Fixture {
    /// Both `one` and `two` already have a completed incremental record.
    pub async fn standard() -> Self {
        let fixture = Self::base().await;
        fixture.set("one", incremental(), WorkStatus::Completed).await;
        fixture.set("two", incremental(), WorkStatus::Completed).await;
        fixture
    }

    /// Like `standard`, but `one` has never had an incremental record.
    pub async fn without_incremental_for_one() -> Self {
        let fixture = Self::base().await;
        fixture.set("two", incremental(), WorkStatus::Completed).await;
        fixture
    }

    async fn base() -> Self {
        let url = std::env::var("TEST_DATABASE_URL")
            .unwrap_or_else(|_| overdue_config::system::DEFAULT_DATABASE_URL.to_string());
        let config = DatabaseConfig {
            url,
            schema: Some(format!("overdue_test_{}", uuid::Uuid::new_v4().simple())),
            ..DatabaseConfig::default()
        };
        let pool = create_pool(&config).await.expect("Failed to connect");
        run_migrations(&pool, config.schema.as_deref())
            .await
            .expect("Failed to migrate");

        let units = PgUnitRepo::new(pool.clone());
        let now = Utc::now();
        for (id, age) in [("one", 2), ("two", 1), ("three", 1)] {
            units
                .upsert(&UnitId::new(id), now - Duration::hours(age))
                .await
                .unwrap();
        }

        let fixture = Self { pool, config };
        fixture.set("one", initial(), WorkStatus::Completed).await;
        fixture.set("two", initial(), WorkStatus::Completed).await;
        fixture.set("three", initial(), WorkStatus::Failed).await;
        fixture
    }

    async fn set(&self, unit: &str, kind: StageKind, status: WorkStatus) {
        PgWorkRecordRepo::new(self.pool.clone())
            .set_status(&UnitId::new(unit), &kind, status)
            .await
            .unwrap();
    }

    /// Incremental after initial, ten minutes staleness, one unit per claim.
    pub fn policy(&self) -> ClaimPolicy {
        ClaimPolicy::new(incremental()).with_prerequisite(initial())
    }

    pub fn queue(&self) -> ClaimQueue {
        ClaimQueue::new(self.pool.clone(), self.policy())
    }

    pub async fn single_connection_pool(&self) -> PgPool {
        let config = DatabaseConfig {
            max_connections: 1,
            ..self.config.clone()
        };
        create_pool(&config).await.expect("Failed to connect")
    }

    /// Status of the unit's incremental record, if any.
    pub async fn status(&self, unit: &str) -> Option<WorkStatus> {
        PgWorkRecordRepo::new(self.pool.clone())
            .list_for_unit(&UnitId::new(unit))
            .await
            .unwrap()
            .into_iter()
            .find(|r| r.kind == "incremental")
            .map(|r| r.status().unwrap())
    }
}
