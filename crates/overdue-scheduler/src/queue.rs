//! Claim protocol backed by PostgreSQL.
//!
//! A claim is a single transaction that
//!
//! 1. selects the most overdue eligible units with `FOR UPDATE ... SKIP LOCKED`,
//!    so units claimed by other open transactions are skipped, not waited on;
//! 2. moves each unit's stage record to `pending` (update if it exists,
//!    insert otherwise);
//! 3. stays open until the caller commits or rolls back the returned [`Claim`].

use crate::{QueueError, QueueResult};
use overdue_core::{ClaimPolicy, UnitId, WorkStatus};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, Row, Transaction};
use std::collections::HashSet;
use tracing::{debug, warn};

/// Upper bound on select/write rounds within one claim.
const MAX_ROUNDS: usize = 3;

/// An eligible unit returned by the locking read.
#[derive(Debug, Clone, PartialEq)]
struct Candidate {
    id: UnitId,
    /// Status of the unit's existing stage record, if it has one.
    existing: Option<WorkStatus>,
}

/// Units claimed by one call, together with the transaction holding their locks.
///
/// The claim must be finalized with [`Claim::commit`] or [`Claim::rollback`].
/// Dropping it without doing either rolls the transaction back.
#[must_use = "a claim holds row locks until it is committed or rolled back"]
pub struct Claim {
    units: Vec<UnitId>,
    tx: Option<Transaction<'static, Postgres>>,
}

impl Claim {
    fn empty() -> Self {
        Self {
            units: Vec::new(),
            tx: None,
        }
    }

    /// Claimed units: records that already existed first, then new ones,
    /// each group oldest first.
    pub fn units(&self) -> &[UnitId] {
        &self.units
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    /// Commit the claim, releasing the locks and keeping the records `pending`.
    ///
    /// A no-op for an empty claim.
    pub async fn commit(mut self) -> QueueResult<Vec<UnitId>> {
        if let Some(tx) = self.tx.take() {
            tx.commit().await.map_err(QueueError::Finalize)?;
            debug!(units = ?self.units, "Committed claim");
        }
        Ok(std::mem::take(&mut self.units))
    }

    /// Abandon the claim, reverting every record it touched.
    pub async fn rollback(mut self) -> QueueResult<()> {
        if let Some(tx) = self.tx.take() {
            tx.rollback().await.map_err(QueueError::Finalize)?;
            debug!(units = ?self.units, "Rolled back claim");
        }
        Ok(())
    }
}

impl std::fmt::Debug for Claim {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Claim")
            .field("units", &self.units)
            .field("open", &self.tx.is_some())
            .finish()
    }
}

impl Drop for Claim {
    fn drop(&mut self) {
        if self.tx.is_some() {
            warn!(units = ?self.units, "Claim dropped without commit, rolling back");
        }
    }
}

/// Claim queue over the `units` and `work_records` tables.
pub struct ClaimQueue {
    pool: PgPool,
    policy: ClaimPolicy,
    select_sql: String,
}

impl ClaimQueue {
    pub fn new(pool: PgPool, policy: ClaimPolicy) -> Self {
        let select_sql = eligibility_query(&policy);
        Self {
            pool,
            policy,
            select_sql,
        }
    }

    /// Claim up to the policy's batch size.
    pub async fn claim(&self) -> QueueResult<Claim> {
        self.claim_next(self.policy.batch_size).await
    }

    /// Claim up to `limit` overdue units.
    ///
    /// On error the transaction has already been rolled back.
    pub async fn claim_next(&self, limit: u32) -> QueueResult<Claim> {
        if limit == 0 {
            return Err(QueueError::InvalidLimit);
        }

        let mut tx = self.pool.begin().await.map_err(QueueError::Begin)?;

        let (updated, inserted) = match self.transition(&mut tx, limit).await {
            Ok(groups) => groups,
            Err(e) => {
                if let Err(rollback_err) = tx.rollback().await {
                    warn!(error = %rollback_err, "Failed to roll back claim");
                }
                warn!(error = %e, partial = ?e.partial(), "Claim failed");
                return Err(e);
            }
        };

        if updated.is_empty() && inserted.is_empty() {
            // Nothing was written; release the connection now.
            tx.commit().await.map_err(QueueError::Finalize)?;
            return Ok(Claim::empty());
        }

        let units: Vec<UnitId> = updated.into_iter().chain(inserted).collect();
        debug!(stage = %self.policy.stage, units = ?units, "Claimed units");

        Ok(Claim {
            units,
            tx: Some(tx),
        })
    }

    /// Run select/write rounds until the batch is full or nothing is left.
    ///
    /// A candidate can lose its race when another claim committed between this
    /// statement's snapshot and the row lock; its record is then no longer
    /// `completed` (or already exists) and the conditional write skips it. The
    /// next round takes a fresh snapshot that no longer sees it as eligible.
    async fn transition(
        &self,
        tx: &mut Transaction<'static, Postgres>,
        limit: u32,
    ) -> QueueResult<(Vec<UnitId>, Vec<UnitId>)> {
        let mut updated = Vec::new();
        let mut inserted = Vec::new();

        for round in 0..MAX_ROUNDS {
            let wanted = limit as usize - updated.len() - inserted.len();
            if wanted == 0 {
                break;
            }

            let candidates = self.select_candidates(tx, wanted).await?;
            if candidates.is_empty() {
                break;
            }

            let (to_update, to_insert) = partition(candidates)?;
            let requested = to_update.len() + to_insert.len();

            let failed = |source| write_error(&updated, &inserted, &to_update, &to_insert, source);
            let done_update = self.mark_existing(tx, &to_update).await.map_err(failed)?;
            let done_insert = self.insert_pending(tx, &to_insert).await.map_err(failed)?;

            let won_update = retain_claimed(to_update, &done_update);
            let won_insert = retain_claimed(to_insert, &done_insert);
            let won = won_update.len() + won_insert.len();
            updated.extend(won_update);
            inserted.extend(won_insert);

            if won == requested {
                break;
            }
            debug!(round, lost = requested - won, "Candidates claimed concurrently, retrying");
        }

        Ok((updated, inserted))
    }

    async fn select_candidates(
        &self,
        tx: &mut Transaction<'static, Postgres>,
        limit: usize,
    ) -> QueueResult<Vec<Candidate>> {
        let mut query = sqlx::query(&self.select_sql)
            .bind(self.policy.stage.as_str())
            .bind(self.policy.staleness.as_secs_f64())
            .bind(limit as i64);
        if let Some(prerequisite) = &self.policy.prerequisite {
            query = query.bind(prerequisite.as_str());
        }

        let rows = query
            .fetch_all(&mut **tx)
            .await
            .map_err(QueueError::Select)?;

        rows.iter().map(decode_candidate).collect()
    }

    async fn mark_existing(
        &self,
        tx: &mut Transaction<'static, Postgres>,
        units: &[UnitId],
    ) -> Result<Vec<String>, sqlx::Error> {
        if units.is_empty() {
            return Ok(Vec::new());
        }
        sqlx::query_scalar::<_, String>(
            r#"
            UPDATE work_records
            SET status = 'pending', updated_at = NOW()
            WHERE kind = $1 AND unit_id = ANY($2) AND status = 'completed'
            RETURNING unit_id
            "#,
        )
        .bind(self.policy.stage.as_str())
        .bind(ids(units))
        .fetch_all(&mut **tx)
        .await
    }

    async fn insert_pending(
        &self,
        tx: &mut Transaction<'static, Postgres>,
        units: &[UnitId],
    ) -> Result<Vec<String>, sqlx::Error> {
        if units.is_empty() {
            return Ok(Vec::new());
        }
        sqlx::query_scalar::<_, String>(
            r#"
            INSERT INTO work_records (unit_id, kind, status, updated_at)
            SELECT unit_id, $1, 'pending', NOW() FROM UNNEST($2::text[]) AS t(unit_id)
            ON CONFLICT (unit_id, kind) DO NOTHING
            RETURNING unit_id
            "#,
        )
        .bind(self.policy.stage.as_str())
        .bind(ids(units))
        .fetch_all(&mut **tx)
        .await
    }
}

/// Build the locking eligibility read for a policy.
///
/// Parameters: `$1` stage, `$2` staleness in seconds, `$3` limit and, when a
/// prerequisite is configured, `$4` prerequisite stage. Only `units` and the
/// prerequisite record are locked; the stage record sits on the nullable side
/// of an outer join, which Postgres cannot lock.
fn eligibility_query(policy: &ClaimPolicy) -> String {
    let (prerequisite_join, prerequisite_filter, lock_targets) = match policy.prerequisite {
        Some(_) => (
            "INNER JOIN work_records pre ON pre.unit_id = u.id AND pre.kind = $4",
            "AND pre.status = 'completed'",
            "u, pre",
        ),
        None => ("", "", "u"),
    };

    format!(
        r#"
        SELECT u.id, target.status AS target_status
        FROM units u
        {prerequisite_join}
        LEFT JOIN work_records target ON target.unit_id = u.id AND target.kind = $1
        WHERE u.last_updated < NOW() - make_interval(secs => $2)
        {prerequisite_filter}
        AND (target.status = 'completed' OR target.status IS NULL)
        ORDER BY u.last_updated ASC, u.id ASC
        LIMIT $3
        FOR UPDATE OF {lock_targets} SKIP LOCKED
        "#
    )
}

fn decode_candidate(row: &PgRow) -> QueueResult<Candidate> {
    let id: String = row
        .try_get("id")
        .map_err(|e| QueueError::Decode(e.to_string()))?;
    let status: Option<String> = row
        .try_get("target_status")
        .map_err(|e| QueueError::Decode(e.to_string()))?;
    let existing = status
        .map(|s| s.parse::<WorkStatus>())
        .transpose()
        .map_err(|e| QueueError::Decode(format!("unit {}: {}", id, e)))?;

    Ok(Candidate {
        id: UnitId::new(id),
        existing,
    })
}

/// Split candidates into those with a record to update and those needing an
/// insert, preserving their order.
///
/// A candidate whose record is not ready to be claimed again means the read
/// returned a row it should have filtered out.
fn partition(candidates: Vec<Candidate>) -> QueueResult<(Vec<UnitId>, Vec<UnitId>)> {
    let mut to_update = Vec::new();
    let mut to_insert = Vec::new();
    for candidate in candidates {
        match candidate.existing {
            Some(status) if status.is_ready() => to_update.push(candidate.id),
            Some(status) => {
                return Err(QueueError::Decode(format!(
                    "unit {} has a {} record and is not eligible",
                    candidate.id, status
                )));
            }
            None => to_insert.push(candidate.id),
        }
    }
    Ok((to_update, to_insert))
}

/// Keep the units whose write took effect, in their original order.
fn retain_claimed(units: Vec<UnitId>, written: &[String]) -> Vec<UnitId> {
    let written: HashSet<&str> = written.iter().map(String::as_str).collect();
    units
        .into_iter()
        .filter(|id| written.contains(id.as_str()))
        .collect()
}

fn ids(units: &[UnitId]) -> Vec<String> {
    units.iter().map(|id| id.as_str().to_string()).collect()
}

fn write_error(
    updated: &[UnitId],
    inserted: &[UnitId],
    to_update: &[UnitId],
    to_insert: &[UnitId],
    source: sqlx::Error,
) -> QueueError {
    let partial = updated
        .iter()
        .chain(to_update)
        .chain(inserted)
        .chain(to_insert)
        .cloned()
        .collect();
    QueueError::Write { partial, source }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{Fixture, initial, incremental};
    use overdue_db::{PgUnitRepo, PgWorkRecordRepo, UnitRepo, WorkRecordRepo};
    use std::time::Duration;

    fn candidate(id: &str, existing: Option<WorkStatus>) -> Candidate {
        Candidate {
            id: UnitId::new(id),
            existing,
        }
    }

    fn names(units: &[UnitId]) -> Vec<&str> {
        units.iter().map(|u| u.as_str()).collect()
    }

    #[test]
    fn test_query_with_prerequisite_locks_units_and_prerequisite() {
        let policy = ClaimPolicy::new(incremental()).with_prerequisite(initial());
        let sql = eligibility_query(&policy);

        assert!(sql.contains("INNER JOIN work_records pre"));
        assert!(sql.contains("pre.kind = $4"));
        assert!(sql.contains("pre.status = 'completed'"));
        assert!(sql.contains("FOR UPDATE OF u, pre SKIP LOCKED"));
        assert!(sql.contains("ORDER BY u.last_updated ASC"));
    }

    #[test]
    fn test_query_without_prerequisite() {
        let policy = ClaimPolicy::new(incremental());
        let sql = eligibility_query(&policy);

        assert!(!sql.contains("pre."));
        assert!(!sql.contains("$4"));
        assert!(sql.contains("FOR UPDATE OF u SKIP LOCKED"));
        assert!(sql.contains("target.status IS NULL"));
    }

    #[test]
    fn test_partition_keeps_order_within_groups() {
        let (update, insert) = partition(vec![
            candidate("a", None),
            candidate("b", Some(WorkStatus::Completed)),
            candidate("c", None),
            candidate("d", Some(WorkStatus::Completed)),
        ])
        .unwrap();
        assert_eq!(names(&update), vec!["b", "d"]);
        assert_eq!(names(&insert), vec!["a", "c"]);
    }

    #[test]
    fn test_partition_rejects_records_not_ready() {
        for status in [WorkStatus::Pending, WorkStatus::Failed] {
            let result = partition(vec![
                candidate("a", Some(WorkStatus::Completed)),
                candidate("b", Some(status)),
            ]);
            assert!(matches!(result, Err(QueueError::Decode(msg)) if msg.contains("unit b")));
        }
    }

    #[test]
    fn test_retain_claimed_drops_lost_candidates() {
        let units = vec![UnitId::new("a"), UnitId::new("b"), UnitId::new("c")];
        let written = vec!["c".to_string(), "a".to_string()];
        assert_eq!(names(&retain_claimed(units, &written)), vec!["a", "c"]);
    }

    #[test]
    fn test_write_error_lists_every_computed_unit() {
        let err = write_error(
            &[UnitId::new("a")],
            &[],
            &[UnitId::new("b")],
            &[UnitId::new("c")],
            sqlx::Error::PoolClosed,
        );
        assert_eq!(names(err.partial()), vec!["a", "b", "c"]);
    }

    /// Claim and commit one unit at a time until the queue is drained.
    async fn assert_drains_in_order(fixture: &Fixture) {
        let queue = fixture.queue();

        let claim = queue.claim().await.unwrap();
        assert_eq!(names(claim.units()), vec!["one"]);
        claim.commit().await.unwrap();

        let claim = queue.claim().await.unwrap();
        assert_eq!(names(claim.units()), vec!["two"]);
        claim.commit().await.unwrap();

        let claim = queue.claim().await.unwrap();
        assert!(claim.is_empty());
        claim.commit().await.unwrap();

        assert_eq!(fixture.status("one").await, Some(WorkStatus::Pending));
        assert_eq!(fixture.status("two").await, Some(WorkStatus::Pending));
        assert_eq!(fixture.status("three").await, None);
    }

    /// Twenty callers racing for the fixture claim each unit exactly once.
    async fn assert_race_claims_each_once(fixture: &Fixture) {
        let queue = std::sync::Arc::new(fixture.queue());

        let tasks = (0..20).map(|_| {
            let queue = queue.clone();
            tokio::spawn(async move {
                let claim = queue.claim().await.unwrap();
                claim.commit().await.unwrap()
            })
        });

        let mut all: Vec<String> = futures::future::join_all(tasks)
            .await
            .into_iter()
            .flat_map(|r| r.unwrap())
            .map(UnitId::into_inner)
            .collect();
        all.sort();

        assert_eq!(all, vec!["one", "two"]);
        assert_eq!(fixture.status("one").await, Some(WorkStatus::Pending));
        assert_eq!(fixture.status("two").await, Some(WorkStatus::Pending));
    }

    #[tokio::test]
    #[ignore] // Run with: cargo test -- --ignored
    async fn test_sequential_claims_then_empty() {
        assert_drains_in_order(&Fixture::without_incremental_for_one().await).await;
    }

    #[tokio::test]
    #[ignore]
    async fn test_sequential_claims_with_existing_records() {
        assert_drains_in_order(&Fixture::standard().await).await;
    }

    #[tokio::test]
    #[ignore]
    async fn test_unit_without_record_is_inserted() {
        let fixture = Fixture::without_incremental_for_one().await;
        let queue = fixture.queue();

        let claim = queue.claim().await.unwrap();
        assert_eq!(names(claim.units()), vec!["one"]);
        claim.commit().await.unwrap();

        assert_eq!(fixture.status("one").await, Some(WorkStatus::Pending));
    }

    #[tokio::test]
    #[ignore]
    async fn test_interleaved_claims_do_not_compete() {
        let fixture = Fixture::standard().await;
        let queue = fixture.queue();

        let first = queue.claim().await.unwrap();
        assert_eq!(names(first.units()), vec!["one"]);

        // "one" is still locked by the open claim; this must skip it, not wait.
        let second = tokio::time::timeout(Duration::from_secs(5), queue.claim())
            .await
            .expect("claim blocked on a locked unit")
            .unwrap();
        assert_eq!(names(second.units()), vec!["two"]);

        first.commit().await.unwrap();
        second.commit().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    #[ignore]
    async fn test_concurrent_claims_never_duplicate() {
        assert_race_claims_each_once(&Fixture::without_incremental_for_one().await).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    #[ignore]
    async fn test_concurrent_claims_with_existing_records_never_duplicate() {
        assert_race_claims_each_once(&Fixture::standard().await).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    #[ignore]
    async fn test_concurrent_inserts_never_duplicate() {
        // Every unit lacks a record, so each claim goes through the insert path.
        let fixture = Fixture::without_incremental_for_one().await;
        let units = PgUnitRepo::new(fixture.pool.clone());
        let records = PgWorkRecordRepo::new(fixture.pool.clone());
        let stale = chrono::Utc::now() - chrono::Duration::hours(3);
        for i in 0..30 {
            let id = UnitId::new(format!("bulk-{:02}", i));
            units.upsert(&id, stale).await.unwrap();
            records
                .set_status(&id, &initial(), WorkStatus::Completed)
                .await
                .unwrap();
        }
        let queue = std::sync::Arc::new(fixture.queue());

        let tasks = (0..20).map(|_| {
            let queue = queue.clone();
            tokio::spawn(async move {
                let mut mine = Vec::new();
                loop {
                    let claimed = queue.claim_next(3).await.unwrap().commit().await.unwrap();
                    if claimed.is_empty() {
                        break mine;
                    }
                    mine.extend(claimed.into_iter().map(UnitId::into_inner));
                }
            })
        });

        let mut all: Vec<String> = futures::future::join_all(tasks)
            .await
            .into_iter()
            .flat_map(|r| r.unwrap())
            .collect();
        all.sort();

        let mut expected: Vec<String> = (0..30).map(|i| format!("bulk-{:02}", i)).collect();
        expected.extend(["one".to_string(), "two".to_string()]);
        expected.sort();
        assert_eq!(all, expected);
    }

    #[tokio::test]
    #[ignore]
    async fn test_rollback_restores_eligibility() {
        let fixture = Fixture::standard().await;
        let queue = fixture.queue();

        let claim = queue.claim().await.unwrap();
        assert_eq!(names(claim.units()), vec!["one"]);
        claim.rollback().await.unwrap();
        assert_eq!(fixture.status("one").await, Some(WorkStatus::Completed));

        let claim = queue.claim().await.unwrap();
        assert_eq!(names(claim.units()), vec!["one"]);
        claim.commit().await.unwrap();
    }

    #[tokio::test]
    #[ignore]
    async fn test_dropped_claim_rolls_back() {
        let fixture = Fixture::without_incremental_for_one().await;
        // One connection, so the next claim runs after the queued rollback.
        let pool = fixture.single_connection_pool().await;
        let queue = ClaimQueue::new(pool, fixture.policy());

        {
            let claim = queue.claim().await.unwrap();
            assert_eq!(names(claim.units()), vec!["one"]);
        }

        let claim = queue.claim().await.unwrap();
        assert_eq!(names(claim.units()), vec!["one"]);
        claim.commit().await.unwrap();
    }

    #[tokio::test]
    #[ignore]
    async fn test_failed_prerequisite_is_never_claimed() {
        let fixture = Fixture::standard().await;
        let queue = fixture.queue();

        let claim = queue.claim_next(10).await.unwrap();
        assert_eq!(names(claim.units()), vec!["one", "two"]);
        claim.commit().await.unwrap();

        assert!(queue.claim_next(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    #[ignore]
    async fn test_batch_orders_updates_before_inserts() {
        let fixture = Fixture::without_incremental_for_one().await;
        let queue = fixture.queue();

        // "one" is older but needs an insert; "two" has a record to update.
        let claim = queue.claim_next(10).await.unwrap();
        assert_eq!(names(claim.units()), vec!["two", "one"]);
        claim.commit().await.unwrap();
    }

    #[tokio::test]
    #[ignore]
    async fn test_fresh_units_are_not_overdue() {
        let fixture = Fixture::standard().await;
        let queue = ClaimQueue::new(
            fixture.pool.clone(),
            ClaimPolicy::new(incremental())
                .with_prerequisite(initial())
                .with_staleness(Duration::from_secs(3 * 3600)),
        );

        assert!(queue.claim().await.unwrap().is_empty());
    }

    #[tokio::test]
    #[ignore]
    async fn test_without_prerequisite() {
        let fixture = Fixture::standard().await;
        let queue = ClaimQueue::new(fixture.pool.clone(), ClaimPolicy::new(incremental()));

        // Without the initial-stage gate "three" becomes eligible too.
        let claim = queue.claim_next(10).await.unwrap();
        assert_eq!(names(claim.units()), vec!["one", "two", "three"]);
        claim.commit().await.unwrap();
    }

    #[tokio::test]
    #[ignore]
    async fn test_zero_limit_rejected() {
        let fixture = Fixture::standard().await;
        let queue = fixture.queue();
        assert!(matches!(
            queue.claim_next(0).await,
            Err(QueueError::InvalidLimit)
        ));
    }

    #[tokio::test]
    #[ignore]
    async fn test_empty_claim_commit_is_noop() {
        let fixture = Fixture::standard().await;
        let queue = fixture.queue();

        queue.claim_next(10).await.unwrap().commit().await.unwrap();

        let claim = queue.claim().await.unwrap();
        assert!(claim.is_empty());
        assert!(claim.commit().await.unwrap().is_empty());
    }
}
