//! Postgres-backed lease store.
//!
//! Claims use `FOR UPDATE SKIP LOCKED` inside a single `UPDATE ... FROM (CTE)`
//! statement, so concurrent claimers skip each other's rows instead of waiting,
//! and selection plus marking happen atomically. Every other job mutation is a
//! conditional `UPDATE ... WHERE status = $expected AND owner = $expected`
//! whose affected-row count says whether the caller still held the lease.
//!
//! ## Error Mapping
//!
//! | SQLx Error | LeaseError | Scenario |
//! |------------|------------|----------|
//! | Database (unique violation `23505`) on lock insert | `Ok(false)` | Another owner created the lock row first |
//! | Database (any other) | `StoreUnavailable` | Server-side failure, serialization failure, etc. |
//! | Io / Tls / PoolTimedOut / PoolClosed | `StoreUnavailable` | Store unreachable |
//! | ColumnDecode / Decode / ColumnNotFound | `Corrupt` | Row shape does not match this schema |
//! | Other | `StoreUnavailable` | Anything else; lease state must be presumed unknown |
//!
//! Timestamps are bound from the caller's clock rather than `NOW()`, so every
//! worker judges expiry with the same clock it used to grant leases.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use tracing::{Span, instrument};

use workhorse_core::{
    ClaimPredicate, ClaimedJob, JobId, JobItem, JobPatch, JobStatus, LeaseError, LeaseGrant,
    LeaseResult, LedgerStats, OwnerId, ResourceLock,
};

use super::r#trait::{LeaseStore, LockStore};

/// Schema bootstrap, embedded at compile time.
pub const SCHEMA: &str = include_str!("../../migrations/0001_lease_queue.sql");

const JOB_COLUMNS: &str = "j.id, j.payload_key, j.status, j.owner, j.lease_expires_at, \
     j.leased_at, j.attempt_count, j.retry_pending, j.last_error, j.created_at, j.updated_at";

/// Postgres-backed job ledger and resource lock table.
///
/// Cheap to clone; all clones share one connection pool.
#[derive(Debug, Clone)]
pub struct PostgresLeaseStore {
    pool: Arc<PgPool>,
}

impl PostgresLeaseStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    /// Connect with a small pool sized for one worker process.
    pub async fn connect(database_url: &str, max_connections: u32) -> LeaseResult<Self> {
        let pool = sqlx::postgres::PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .map_err(|e| map_sqlx_error("connect", e))?;
        Ok(Self::new(pool))
    }

    /// Create tables and indexes if missing.
    #[instrument(skip(self), err)]
    pub async fn ensure_schema(&self) -> LeaseResult<()> {
        sqlx::raw_sql(SCHEMA)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("ensure_schema", e))?;
        Ok(())
    }
}

#[async_trait]
impl LeaseStore for PostgresLeaseStore {
    #[instrument(
        skip(self, payload_keys),
        fields(requested = payload_keys.len(), inserted = tracing::field::Empty),
        err
    )]
    async fn enqueue(
        &self,
        payload_keys: &[String],
        now: DateTime<Utc>,
    ) -> LeaseResult<Vec<JobItem>> {
        let mut keys: Vec<String> = Vec::with_capacity(payload_keys.len());
        for key in payload_keys {
            if !keys.contains(key) {
                keys.push(key.clone());
            }
        }
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let ids: Vec<uuid::Uuid> = keys.iter().map(|_| *JobId::new().as_uuid()).collect();

        let sql = format!(
            r#"
            INSERT INTO lease_jobs AS j (id, payload_key, status, attempt_count, created_at, updated_at)
            SELECT u.id, u.payload_key, 'pending', 0, $3, $3
            FROM UNNEST($1::uuid[], $2::text[]) AS u(id, payload_key)
            ON CONFLICT (payload_key) DO NOTHING
            RETURNING {JOB_COLUMNS}
            "#
        );
        let rows = sqlx::query(&sql)
            .bind(ids)
            .bind(keys)
            .bind(now)
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("enqueue", e))?;

        let mut items = rows
            .iter()
            .map(job_from_row)
            .collect::<LeaseResult<Vec<_>>>()?;
        items.sort_by_key(|j| j.id);

        Span::current().record("inserted", items.len());
        Ok(items)
    }

    #[instrument(
        skip(self, predicate, grant),
        fields(owner = %grant.owner),
        err
    )]
    async fn claim_batch(
        &self,
        predicate: &ClaimPredicate,
        limit: usize,
        grant: &LeaseGrant,
    ) -> LeaseResult<Vec<ClaimedJob>> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        let (strategy, base_ms, max_ms) = match predicate.requeue_delay {
            Some(curve) => (
                Some(curve.strategy.as_str()),
                curve.base.as_millis() as f64,
                curve.max.as_millis() as f64,
            ),
            None => (None, 0.0, 0.0),
        };

        // Pending rows (requeued ones only once past their delay), plus leased rows whose expiry
        // has passed. Mirrors `ClaimPredicate::matches`.
        let sql = format!(
            r#"
            WITH candidates AS (
                SELECT id, status AS previous_status, owner AS previous_owner,
                       updated_at AS previous_updated_at
                FROM lease_jobs
                WHERE (
                    status = 'pending'
                    AND (
                        $5::text IS NULL
                        OR NOT retry_pending
                        OR updated_at + (
                            CASE $5::text
                                WHEN 'fixed' THEN $6::double precision
                                WHEN 'linear' THEN LEAST($7::double precision, $6::double precision * attempt_count)
                                ELSE LEAST(
                                    $7::double precision,
                                    $6::double precision
                                        * power(2.0::double precision, LEAST(attempt_count - 1, 62)::double precision)
                                )
                            END
                        ) * INTERVAL '1 millisecond' <= $1
                    )
                ) OR (
                    status = 'leased'
                    AND (lease_expires_at IS NULL OR lease_expires_at < $1)
                )
                ORDER BY updated_at ASC, created_at ASC, id ASC
                LIMIT $2
                FOR UPDATE SKIP LOCKED
            )
            UPDATE lease_jobs AS j
            SET status = 'leased',
                owner = $3,
                lease_expires_at = $4,
                leased_at = $1,
                attempt_count = j.attempt_count + 1,
                retry_pending = FALSE,
                updated_at = $1
            FROM candidates c
            WHERE j.id = c.id
            RETURNING {JOB_COLUMNS}, c.previous_status, c.previous_owner, c.previous_updated_at
            "#
        );

        let rows = sqlx::query(&sql)
            .bind(predicate.now)
            .bind(limit as i64)
            .bind(grant.owner.as_str())
            .bind(grant.expires_at)
            .bind(strategy)
            .bind(base_ms)
            .bind(max_ms)
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("claim_batch", e))?;

        let mut claimed = Vec::with_capacity(rows.len());
        for row in &rows {
            let item = job_from_row(row)?;
            let previous_status: String = row
                .try_get("previous_status")
                .map_err(|e| map_sqlx_error("claim_batch", e))?;
            let previous_owner: Option<String> = row
                .try_get("previous_owner")
                .map_err(|e| map_sqlx_error("claim_batch", e))?;
            let previous_updated_at: DateTime<Utc> = row
                .try_get("previous_updated_at")
                .map_err(|e| map_sqlx_error("claim_batch", e))?;
            let previous_owner = match JobStatus::parse(&previous_status)? {
                JobStatus::Leased => previous_owner.map(OwnerId::from),
                _ => None,
            };
            claimed.push((
                (previous_updated_at, item.created_at, item.id),
                ClaimedJob {
                    item,
                    previous_owner,
                },
            ));
        }
        // Report in selection order; RETURNING does not preserve it.
        claimed.sort_by_key(|(key, _)| *key);

        Ok(claimed.into_iter().map(|(_, c)| c).collect())
    }

    #[instrument(
        skip(self, patch),
        fields(job_id = %id, owner = %expected_owner, to = %patch.status),
        err
    )]
    async fn conditional_update(
        &self,
        id: JobId,
        expected_status: JobStatus,
        expected_owner: &OwnerId,
        patch: &JobPatch,
        now: DateTime<Utc>,
    ) -> LeaseResult<bool> {
        if !expected_status.can_transition(patch.status) {
            return Err(LeaseError::invalid(format!(
                "job {id}: transition {expected_status} -> {} is not allowed",
                patch.status
            )));
        }

        let result = sqlx::query(
            r#"
            UPDATE lease_jobs
            SET status = $4,
                owner = $5,
                lease_expires_at = $6,
                leased_at = CASE WHEN $4 = 'leased' THEN leased_at ELSE NULL END,
                last_error = COALESCE($7, last_error),
                retry_pending = $9,
                updated_at = $8
            WHERE id = $1 AND status = $2 AND owner = $3
            "#,
        )
        .bind(*id.as_uuid())
        .bind(expected_status.as_str())
        .bind(expected_owner.as_str())
        .bind(patch.status.as_str())
        .bind(patch.owner.as_ref().map(|o| o.as_str()))
        .bind(patch.lease_expires_at)
        .bind(patch.last_error.as_deref())
        .bind(now)
        .bind(patch.retry_pending)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("conditional_update", e))?;

        Ok(result.rows_affected() == 1)
    }

    async fn get(&self, id: JobId) -> LeaseResult<Option<JobItem>> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM lease_jobs j WHERE j.id = $1");
        let row = sqlx::query(&sql)
            .bind(*id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get", e))?;

        row.as_ref().map(job_from_row).transpose()
    }

    #[instrument(skip(self), err)]
    async fn stats(&self, now: DateTime<Utc>) -> LeaseResult<LedgerStats> {
        let row = sqlx::query(
            r#"
            SELECT
                COUNT(*) FILTER (WHERE status = 'pending') AS pending,
                COUNT(*) FILTER (WHERE status = 'leased') AS leased,
                COUNT(*) FILTER (
                    WHERE status = 'leased'
                      AND (lease_expires_at IS NULL OR lease_expires_at < $1)
                ) AS reclaimable,
                COUNT(*) FILTER (WHERE status = 'completed') AS completed,
                COUNT(*) FILTER (WHERE status = 'failed') AS failed,
                MIN(leased_at) FILTER (
                    WHERE status = 'leased' AND lease_expires_at >= $1
                ) AS oldest_active_leased_at
            FROM lease_jobs
            "#,
        )
        .bind(now)
        .fetch_one(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("stats", e))?;

        let count = |col: &str| -> LeaseResult<u64> {
            row.try_get::<i64, _>(col)
                .map(|v| v.max(0) as u64)
                .map_err(|e| map_sqlx_error("stats", e))
        };
        let oldest: Option<DateTime<Utc>> = row
            .try_get("oldest_active_leased_at")
            .map_err(|e| map_sqlx_error("stats", e))?;

        Ok(LedgerStats {
            pending: count("pending")?,
            leased: count("leased")?,
            reclaimable: count("reclaimable")?,
            completed: count("completed")?,
            failed: count("failed")?,
            oldest_active_lease_ms: oldest.map(|at| (now - at).num_milliseconds()),
        })
    }
}

#[async_trait]
impl LockStore for PostgresLeaseStore {
    async fn get_lock(&self, resource_key: &str) -> LeaseResult<Option<ResourceLock>> {
        let row = sqlx::query(
            r#"
            SELECT resource_key, owner, acquired_at, version
            FROM resource_locks
            WHERE resource_key = $1
            "#,
        )
        .bind(resource_key)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("get_lock", e))?;

        row.map(|row| -> Result<ResourceLock, sqlx::Error> {
            Ok(ResourceLock {
                resource_key: row.try_get("resource_key")?,
                owner: row.try_get::<Option<String>, _>("owner")?.map(OwnerId::from),
                acquired_at: row.try_get("acquired_at")?,
                version: row.try_get("version")?,
            })
        })
        .transpose()
        .map_err(|e| map_sqlx_error("get_lock", e))
    }

    #[instrument(skip(self, owner), fields(owner = %owner), err)]
    async fn insert_lock(
        &self,
        resource_key: &str,
        owner: &OwnerId,
        now: DateTime<Utc>,
    ) -> LeaseResult<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO resource_locks (resource_key, owner, acquired_at, version)
            VALUES ($1, $2, $3, 1)
            ON CONFLICT (resource_key) DO NOTHING
            "#,
        )
        .bind(resource_key)
        .bind(owner.as_str())
        .bind(now)
        .execute(&*self.pool)
        .await;

        match result {
            Ok(done) => Ok(done.rows_affected() == 1),
            Err(e) if is_unique_violation(&e) => Ok(false),
            Err(e) => Err(map_sqlx_error("insert_lock", e)),
        }
    }

    #[instrument(skip(self, owner), fields(owner = %owner), err)]
    async fn update_lock(
        &self,
        resource_key: &str,
        expected_version: i64,
        owner: &OwnerId,
        now: DateTime<Utc>,
    ) -> LeaseResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE resource_locks
            SET owner = $3, acquired_at = $4, version = version + 1
            WHERE resource_key = $1 AND version = $2
            "#,
        )
        .bind(resource_key)
        .bind(expected_version)
        .bind(owner.as_str())
        .bind(now)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("update_lock", e))?;

        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self, owner), fields(owner = %owner), err)]
    async fn release_lock(&self, resource_key: &str, owner: &OwnerId) -> LeaseResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE resource_locks
            SET owner = NULL, version = version + 1
            WHERE resource_key = $1 AND owner = $2
            "#,
        )
        .bind(resource_key)
        .bind(owner.as_str())
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("release_lock", e))?;

        Ok(result.rows_affected() == 1)
    }
}

fn job_from_row(row: &sqlx::postgres::PgRow) -> LeaseResult<JobItem> {
    let status: String = row
        .try_get("status")
        .map_err(|e| map_sqlx_error("decode_job", e))?;
    let decode = || -> Result<JobItem, sqlx::Error> {
        let id: uuid::Uuid = row.try_get("id")?;
        let attempt_count: i32 = row.try_get("attempt_count")?;
        Ok(JobItem {
            id: JobId::from_uuid(id),
            payload_key: row.try_get("payload_key")?,
            status: JobStatus::Pending,
            owner: row.try_get::<Option<String>, _>("owner")?.map(OwnerId::from),
            lease_expires_at: row.try_get("lease_expires_at")?,
            leased_at: row.try_get("leased_at")?,
            attempt_count: attempt_count.max(0) as u32,
            retry_pending: row.try_get("retry_pending")?,
            last_error: row.try_get("last_error")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    };
    let mut item = decode().map_err(|e| map_sqlx_error("decode_job", e))?;
    item.status = JobStatus::parse(&status)?;
    Ok(item)
}

/// Map SQLx errors to `LeaseError`.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> LeaseError {
    match err {
        sqlx::Error::Database(db_err) => LeaseError::unavailable(format!(
            "database error in {}: {} (code {})",
            operation,
            db_err.message(),
            db_err.code().as_deref().unwrap_or("none")
        )),
        sqlx::Error::ColumnDecode { .. }
        | sqlx::Error::Decode(_)
        | sqlx::Error::ColumnNotFound(_)
        | sqlx::Error::TypeNotFound { .. } => {
            LeaseError::corrupt(format!("failed to decode row in {}: {}", operation, err))
        }
        sqlx::Error::PoolClosed => {
            LeaseError::unavailable(format!("connection pool closed in {}", operation))
        }
        sqlx::Error::PoolTimedOut => {
            LeaseError::unavailable(format!("connection pool timed out in {}", operation))
        }
        _ => LeaseError::unavailable(format!("sqlx error in {}: {}", operation, err)),
    }
}

/// Check if an error is a unique constraint violation.
fn is_unique_violation(err: &sqlx::Error) -> bool {
    if let sqlx::Error::Database(db_err) = err {
        if let Some(code) = db_err.code() {
            return code.as_ref() == "23505";
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::time::Duration as StdDuration;

    use chrono::Duration;
    use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
    use workhorse_core::BackoffCurve;

    /// A store confined to its own schema, dropped by [`Scratch::drop_schema`].
    struct Scratch {
        store: PostgresLeaseStore,
        admin: PgPool,
        schema: String,
    }

    impl Scratch {
        /// `None` when `DATABASE_URL` is unset.
        async fn open() -> Option<Self> {
            let url = std::env::var("DATABASE_URL").ok()?;
            let schema = format!("workhorse_test_{}", uuid::Uuid::new_v4().simple());

            let admin = PgPoolOptions::new()
                .max_connections(1)
                .connect(&url)
                .await
                .unwrap();
            sqlx::query(&format!("CREATE SCHEMA {schema}"))
                .execute(&admin)
                .await
                .unwrap();

            let options = url
                .parse::<PgConnectOptions>()
                .unwrap()
                .options([("search_path", schema.as_str())]);
            let pool = PgPoolOptions::new()
                .max_connections(8)
                .connect_with(options)
                .await
                .unwrap();
            let store = PostgresLeaseStore::new(pool);
            store.ensure_schema().await.unwrap();

            Some(Self {
                store,
                admin,
                schema,
            })
        }

        async fn drop_schema(self) {
            self.store.pool.close().await;
            sqlx::query(&format!("DROP SCHEMA {} CASCADE", self.schema))
                .execute(&self.admin)
                .await
                .unwrap();
        }
    }

    fn t0() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-01-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    fn grant(owner: &str, expires_at: DateTime<Utc>) -> LeaseGrant {
        LeaseGrant {
            owner: OwnerId::from(owner),
            expires_at,
        }
    }

    /// Enqueue `key` at `at` and put it through `attempts` claim/requeue cycles.
    async fn requeued(store: &PostgresLeaseStore, key: &str, attempts: u32, at: DateTime<Utc>) -> JobItem {
        let id = store.enqueue(&[key.to_string()], at).await.unwrap()[0].id;
        for _ in 0..attempts {
            let claimed = store
                .claim_batch(&ClaimPredicate::at(at), 1, &grant("w", at + Duration::seconds(30)))
                .await
                .unwrap();
            assert_eq!(claimed[0].item.id, id);
            let patch = JobPatch::requeue(Some("boom".into()));
            assert!(store
                .conditional_update(id, JobStatus::Leased, &OwnerId::from("w"), &patch, at)
                .await
                .unwrap());
        }
        store.get(id).await.unwrap().unwrap()
    }

    #[tokio::test]
    #[ignore = "needs DATABASE_URL"]
    async fn expired_lease_is_claimable_strictly_after_expiry() {
        let Some(db) = Scratch::open().await else {
            return;
        };
        let store = &db.store;
        let now = t0();
        let expiry = now + Duration::seconds(10);
        store.enqueue(&["a".to_string()], now).await.unwrap();

        let first = store
            .claim_batch(&ClaimPredicate::at(now), 1, &grant("w1", expiry))
            .await
            .unwrap();
        assert_eq!(first.len(), 1);
        let id = first[0].item.id;

        let at_expiry = store
            .claim_batch(&ClaimPredicate::at(expiry), 1, &grant("w2", expiry + Duration::seconds(10)))
            .await
            .unwrap();
        assert!(at_expiry.is_empty());

        let after = expiry + Duration::milliseconds(1);
        let taken = store
            .claim_batch(&ClaimPredicate::at(after), 1, &grant("w2", after + Duration::seconds(10)))
            .await
            .unwrap();
        assert_eq!(taken.len(), 1);
        assert_eq!(taken[0].item.id, id);
        assert_eq!(taken[0].item.attempt_count, 2);
        assert_eq!(taken[0].previous_owner, Some(OwnerId::from("w1")));

        let complete = JobPatch::complete();
        assert!(!store
            .conditional_update(id, JobStatus::Leased, &OwnerId::from("w1"), &complete, after)
            .await
            .unwrap());
        assert!(store
            .conditional_update(id, JobStatus::Leased, &OwnerId::from("w2"), &complete, after)
            .await
            .unwrap());

        db.drop_schema().await;
    }

    #[tokio::test]
    #[ignore = "needs DATABASE_URL"]
    async fn requeue_delay_agrees_with_backoff_curve() {
        let Some(db) = Scratch::open().await else {
            return;
        };
        let store = &db.store;
        let at = t0();
        let curves = [
            BackoffCurve::fixed(StdDuration::from_secs(3)),
            BackoffCurve::linear(StdDuration::from_secs(2), StdDuration::from_secs(5)),
            BackoffCurve::exponential(StdDuration::from_secs(1), StdDuration::from_secs(3)),
        ];

        for curve in curves {
            for attempts in 1..=3 {
                let key = format!("{}-{attempts}", curve.strategy.as_str());
                let item = requeued(store, &key, attempts, at).await;
                let delay = Duration::from_std(curve.delay_for_attempt(attempts)).unwrap();
                let ready_at = item.updated_at + delay;
                let lease = grant("w", ready_at + Duration::seconds(30));

                let early = ClaimPredicate::at(ready_at - Duration::milliseconds(1))
                    .with_requeue_delay(curve);
                assert!(!early.matches(&item), "{key}");
                assert!(
                    store.claim_batch(&early, 10, &lease).await.unwrap().is_empty(),
                    "{key} claimable before its delay"
                );

                let ready = ClaimPredicate::at(ready_at).with_requeue_delay(curve);
                assert!(ready.matches(&item), "{key}");
                let claimed = store.claim_batch(&ready, 10, &lease).await.unwrap();
                let ids: Vec<_> = claimed.iter().map(|c| c.item.id).collect();
                assert_eq!(ids, vec![item.id], "{key}");

                assert!(store
                    .conditional_update(item.id, JobStatus::Leased, &OwnerId::from("w"), &JobPatch::complete(), ready_at)
                    .await
                    .unwrap());
            }
        }

        // A released item ignores the delay regardless of its attempt count.
        let slow = BackoffCurve::fixed(StdDuration::from_secs(60));
        let item = requeued(store, "released", 2, at).await;
        store
            .claim_batch(&ClaimPredicate::at(at), 1, &grant("w", at + Duration::seconds(30)))
            .await
            .unwrap();
        assert!(store
            .conditional_update(item.id, JobStatus::Leased, &OwnerId::from("w"), &JobPatch::release(), at)
            .await
            .unwrap());
        let again = store
            .claim_batch(
                &ClaimPredicate::at(at).with_requeue_delay(slow),
                1,
                &grant("w2", at + Duration::seconds(30)),
            )
            .await
            .unwrap();
        assert_eq!(again.len(), 1);
        assert_eq!(again[0].item.attempt_count, 4);

        db.drop_schema().await;
    }

    #[tokio::test]
    #[ignore = "needs DATABASE_URL"]
    async fn batch_is_reported_least_recently_updated_first() {
        let Some(db) = Scratch::open().await else {
            return;
        };
        let store = &db.store;
        let t0 = t0();

        let older = requeued(store, "created-first", 0, t0).await;
        store
            .claim_batch(&ClaimPredicate::at(t0), 1, &grant("w", t0 + Duration::seconds(30)))
            .await
            .unwrap();
        let touched = t0 + Duration::seconds(5);
        assert!(store
            .conditional_update(older.id, JobStatus::Leased, &OwnerId::from("w"), &JobPatch::release(), touched)
            .await
            .unwrap());
        let newer = requeued(store, "created-second", 0, t0 + Duration::seconds(1)).await;

        let at = t0 + Duration::seconds(10);
        let claimed = store
            .claim_batch(&ClaimPredicate::at(at), 2, &grant("w2", at + Duration::seconds(30)))
            .await
            .unwrap();
        let ids: Vec<_> = claimed.iter().map(|c| c.item.id).collect();
        assert_eq!(ids, vec![newer.id, older.id]);

        db.drop_schema().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    #[ignore = "needs DATABASE_URL"]
    async fn concurrent_claims_never_share_rows() {
        let Some(db) = Scratch::open().await else {
            return;
        };
        let now = t0();
        let keys: Vec<String> = (0..60).map(|i| format!("item-{i}")).collect();
        db.store.enqueue(&keys, now).await.unwrap();

        let mut claimers = Vec::new();
        for w in 0..4 {
            let store = db.store.clone();
            claimers.push(tokio::spawn(async move {
                let lease = grant(&format!("w{w}"), now + Duration::hours(1));
                let predicate = ClaimPredicate::at(now + Duration::seconds(1));
                let mut ids = Vec::new();
                loop {
                    let batch = store.claim_batch(&predicate, 7, &lease).await.unwrap();
                    if batch.is_empty() {
                        return ids;
                    }
                    ids.extend(batch.into_iter().map(|c| c.item.id));
                }
            }));
        }

        let mut seen = HashSet::new();
        let mut total = 0;
        for claimer in claimers {
            for id in claimer.await.unwrap() {
                total += 1;
                assert!(seen.insert(id), "job {id} claimed twice");
            }
        }
        assert_eq!(total, 60);
        assert_eq!(db.store.stats(now).await.unwrap().leased, 60);

        db.drop_schema().await;
    }

    #[test]
    fn schema_declares_both_tables() {
        assert!(SCHEMA.contains("CREATE TABLE IF NOT EXISTS lease_jobs"));
        assert!(SCHEMA.contains("CREATE TABLE IF NOT EXISTS resource_locks"));
        assert!(SCHEMA.contains("UNIQUE (payload_key)"));
    }

    #[test]
    fn pool_errors_are_transient_and_decode_errors_are_not() {
        assert!(map_sqlx_error("claim_batch", sqlx::Error::PoolTimedOut).is_transient());
        assert!(map_sqlx_error("claim_batch", sqlx::Error::PoolClosed).is_transient());

        let decode = map_sqlx_error("get", sqlx::Error::ColumnNotFound("status".into()));
        assert!(matches!(decode, LeaseError::Corrupt(_)));
    }
}
