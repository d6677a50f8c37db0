//! Lease manager: claim, renew, complete, fail and release job leases.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use workhorse_core::{
    BackoffCurve, ClaimPredicate, Clock, JobId, JobItem, JobPatch, JobStatus, LeaseError,
    LeaseGrant, LeaseResult, LedgerStats, OwnerId, SystemClock,
};
use workhorse_observability::LeaseMetrics;

use crate::store::LeaseStore;

/// Outcome of a monitoring sweep.
#[derive(Debug, Clone, Serialize)]
pub struct SweepReport {
    pub at: DateTime<Utc>,
    pub stats: LedgerStats,
}

/// Lease lifecycle over a [`LeaseStore`].
///
/// Every operation is a single non-blocking store round-trip and is safe to call
/// concurrently from any number of tasks and processes. A `false` return means
/// the caller no longer holds the lease (it expired and was reclaimed, or the
/// item already reached a terminal state): discard any result tied to it and do
/// not retry the same call. Errors mean the store could not be reached and the
/// lease state is unknown.
pub struct LeaseManager<S> {
    store: S,
    clock: Arc<dyn Clock>,
    metrics: Arc<LeaseMetrics>,
}

impl<S: LeaseStore> LeaseManager<S> {
    pub fn new(store: S) -> Self {
        Self {
            store,
            clock: Arc::new(SystemClock),
            metrics: Arc::new(LeaseMetrics::new()),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Share counters with other components of the process.
    pub fn with_metrics(mut self, metrics: Arc<LeaseMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn metrics(&self) -> &Arc<LeaseMetrics> {
        &self.metrics
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Add work items. Payload keys already in the ledger are ignored.
    pub async fn enqueue(&self, payload_keys: &[String]) -> LeaseResult<Vec<JobItem>> {
        let inserted = self.track(self.store.enqueue(payload_keys, self.now()).await)?;
        debug!(
            requested = payload_keys.len(),
            inserted = inserted.len(),
            "enqueued job items"
        );
        Ok(inserted)
    }

    /// Lease up to `batch_size` eligible items to `owner` for `ttl`.
    pub async fn claim(
        &self,
        owner: &OwnerId,
        batch_size: usize,
        ttl: Duration,
    ) -> LeaseResult<Vec<JobItem>> {
        self.claim_with_delay(owner, batch_size, ttl, None).await
    }

    /// Like [`claim`](Self::claim), but requeued items stay ineligible until
    /// `requeue_delay(attempt_count)` has passed since their last update.
    pub async fn claim_with_delay(
        &self,
        owner: &OwnerId,
        batch_size: usize,
        ttl: Duration,
        requeue_delay: Option<BackoffCurve>,
    ) -> LeaseResult<Vec<JobItem>> {
        let now = self.now();
        let grant = LeaseGrant {
            owner: owner.clone(),
            expires_at: expiry(now, ttl)?,
        };
        let predicate = ClaimPredicate {
            now,
            requeue_delay,
        };

        let claimed = self.track(self.store.claim_batch(&predicate, batch_size, &grant).await)?;

        let mut reclaimed = 0;
        for c in &claimed {
            if let Some(previous) = &c.previous_owner {
                reclaimed += 1;
                warn!(
                    job_id = %c.item.id,
                    previous_owner = %previous,
                    owner = %owner,
                    attempt = c.item.attempt_count,
                    "reclaimed expired lease"
                );
            }
        }
        self.metrics
            .record_claims(claimed.len() as u64, reclaimed);
        if !claimed.is_empty() {
            debug!(owner = %owner, claimed = claimed.len(), "claimed job items");
        }

        Ok(claimed.into_iter().map(|c| c.item).collect())
    }

    /// Extend the lease on `id` to `now + ttl`. `false` if the lease was lost.
    pub async fn renew(&self, owner: &OwnerId, id: JobId, ttl: Duration) -> LeaseResult<bool> {
        let now = self.now();
        let patch = JobPatch::renew(owner.clone(), expiry(now, ttl)?);
        let renewed = self.update(owner, id, &patch, now).await?;
        if renewed {
            self.metrics.record_renewal();
        }
        Ok(renewed)
    }

    /// Mark `id` completed. `false` if `owner` no longer holds it.
    pub async fn complete(&self, owner: &OwnerId, id: JobId) -> LeaseResult<bool> {
        let now = self.now();
        let done = self.update(owner, id, &JobPatch::complete(), now).await?;
        if done {
            self.metrics.record_completion();
            debug!(job_id = %id, owner = %owner, "job completed");
        }
        Ok(done)
    }

    /// Requeue (`permanent = false`) or fail permanently (`permanent = true`).
    pub async fn fail(&self, owner: &OwnerId, id: JobId, permanent: bool) -> LeaseResult<bool> {
        self.fail_with_error(owner, id, permanent, None).await
    }

    /// [`fail`](Self::fail), recording `error` on the item.
    pub async fn fail_with_error(
        &self,
        owner: &OwnerId,
        id: JobId,
        permanent: bool,
        error: Option<String>,
    ) -> LeaseResult<bool> {
        let now = self.now();
        let patch = if permanent {
            JobPatch::fail(error)
        } else {
            JobPatch::requeue(error)
        };
        let applied = self.update(owner, id, &patch, now).await?;
        if applied {
            if permanent {
                self.metrics.record_permanent_failure();
                info!(job_id = %id, owner = %owner, "job failed permanently");
            } else {
                self.metrics.record_requeue();
                debug!(job_id = %id, owner = %owner, "job requeued");
            }
        }
        Ok(applied)
    }

    /// Hand the lease back so another worker can claim the item right away.
    pub async fn release(&self, owner: &OwnerId, id: JobId) -> LeaseResult<bool> {
        let now = self.now();
        let released = self.update(owner, id, &JobPatch::release(), now).await?;
        if released {
            self.metrics.record_release();
            debug!(job_id = %id, owner = %owner, "lease released");
        }
        Ok(released)
    }

    pub async fn get(&self, id: JobId) -> LeaseResult<Option<JobItem>> {
        self.track(self.store.get(id).await)
    }

    pub async fn stats(&self) -> LeaseResult<LedgerStats> {
        self.track(self.store.stats(self.now()).await)
    }

    /// Surface reclaimable leases without claiming anything.
    ///
    /// Equivalent to a zero-sized claim: it evaluates the same expiry condition
    /// and never mutates rows. Reclamation itself happens in the next `claim`.
    pub async fn sweep(&self) -> LeaseResult<SweepReport> {
        let at = self.now();
        let stats = self.track(self.store.stats(at).await)?;
        if stats.reclaimable > 0 {
            warn!(
                reclaimable = stats.reclaimable,
                leased = stats.leased,
                "expired leases awaiting reclamation"
            );
        }
        debug!(
            pending = stats.pending,
            leased = stats.leased,
            completed = stats.completed,
            failed = stats.failed,
            oldest_active_lease_ms = ?stats.oldest_active_lease_ms,
            "ledger sweep"
        );
        Ok(SweepReport { at, stats })
    }

    async fn update(
        &self,
        owner: &OwnerId,
        id: JobId,
        patch: &JobPatch,
        now: DateTime<Utc>,
    ) -> LeaseResult<bool> {
        let applied = self.track(
            self.store
                .conditional_update(id, JobStatus::Leased, owner, patch, now)
                .await,
        )?;
        if !applied {
            self.metrics.record_lease_lost();
            debug!(job_id = %id, owner = %owner, to = %patch.status, "lease no longer held");
        }
        Ok(applied)
    }

    fn track<T>(&self, result: LeaseResult<T>) -> LeaseResult<T> {
        if let Err(e) = &result {
            if e.is_transient() {
                self.metrics.record_store_error();
            }
        }
        result
    }
}

fn expiry(now: DateTime<Utc>, ttl: Duration) -> LeaseResult<DateTime<Utc>> {
    if ttl.is_zero() {
        return Err(LeaseError::invalid("lease ttl must be positive"));
    }
    chrono::Duration::from_std(ttl)
        .ok()
        .and_then(|ttl| now.checked_add_signed(ttl))
        .ok_or_else(|| LeaseError::invalid(format!("lease ttl {ttl:?} is out of range")))
}
