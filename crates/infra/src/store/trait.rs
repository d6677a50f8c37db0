use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use workhorse_core::{
    ClaimPredicate, ClaimedJob, JobId, JobItem, JobPatch, JobStatus, LeaseGrant, LeaseResult,
    LedgerStats, OwnerId, ResourceLock,
};

/// Atomic primitives over the shared job ledger.
///
/// This is the only seam between the lease protocol and the durable store. Every
/// mutation of a job row goes through [`LeaseStore::claim_batch`] or
/// [`LeaseStore::conditional_update`]; no caller ever reads a row and then writes
/// it back unguarded.
///
/// ## Implementation Requirements
///
/// Implementations must:
/// - make `claim_batch` a single atomic step that skips rows another claimer is
///   currently locking (never wait on them)
/// - apply `conditional_update` only when the row still has the expected status
///   and owner, and report whether it did
/// - surface every infrastructure failure as `LeaseError::StoreUnavailable`
///   without retrying internally
/// - never move a row out of `Completed` or `Failed`
#[async_trait]
pub trait LeaseStore: Send + Sync {
    /// Insert new `Pending` items. Payload keys already in the ledger are skipped;
    /// only the newly inserted items are returned.
    async fn enqueue(
        &self,
        payload_keys: &[String],
        now: DateTime<Utc>,
    ) -> LeaseResult<Vec<JobItem>>;

    /// Atomically lease up to `limit` rows matching `predicate` to `grant.owner`.
    ///
    /// Oldest `updated_at` first. Returns an empty vector when nothing is eligible.
    async fn claim_batch(
        &self,
        predicate: &ClaimPredicate,
        limit: usize,
        grant: &LeaseGrant,
    ) -> LeaseResult<Vec<ClaimedJob>>;

    /// Apply `patch` only if the row is still `expected_status` and held by
    /// `expected_owner`. Returns whether the update took effect.
    async fn conditional_update(
        &self,
        id: JobId,
        expected_status: JobStatus,
        expected_owner: &OwnerId,
        patch: &JobPatch,
        now: DateTime<Utc>,
    ) -> LeaseResult<bool>;

    async fn get(&self, id: JobId) -> LeaseResult<Option<JobItem>>;

    async fn stats(&self, now: DateTime<Utc>) -> LeaseResult<LedgerStats>;
}

/// Atomic primitives over the resource lock table.
#[async_trait]
pub trait LockStore: Send + Sync {
    async fn get_lock(&self, resource_key: &str) -> LeaseResult<Option<ResourceLock>>;

    /// Create the row held by `owner`. Returns `false` if the row already exists
    /// (a concurrent acquirer won the insert race).
    async fn insert_lock(
        &self,
        resource_key: &str,
        owner: &OwnerId,
        now: DateTime<Utc>,
    ) -> LeaseResult<bool>;

    /// Set `owner` and `acquired_at = now` if the row is still at `expected_version`.
    async fn update_lock(
        &self,
        resource_key: &str,
        expected_version: i64,
        owner: &OwnerId,
        now: DateTime<Utc>,
    ) -> LeaseResult<bool>;

    /// Clear the owner if it is still `owner`.
    async fn release_lock(&self, resource_key: &str, owner: &OwnerId) -> LeaseResult<bool>;
}

#[async_trait]
impl<S> LeaseStore for Arc<S>
where
    S: LeaseStore + ?Sized,
{
    async fn enqueue(
        &self,
        payload_keys: &[String],
        now: DateTime<Utc>,
    ) -> LeaseResult<Vec<JobItem>> {
        (**self).enqueue(payload_keys, now).await
    }

    async fn claim_batch(
        &self,
        predicate: &ClaimPredicate,
        limit: usize,
        grant: &LeaseGrant,
    ) -> LeaseResult<Vec<ClaimedJob>> {
        (**self).claim_batch(predicate, limit, grant).await
    }

    async fn conditional_update(
        &self,
        id: JobId,
        expected_status: JobStatus,
        expected_owner: &OwnerId,
        patch: &JobPatch,
        now: DateTime<Utc>,
    ) -> LeaseResult<bool> {
        (**self)
            .conditional_update(id, expected_status, expected_owner, patch, now)
            .await
    }

    async fn get(&self, id: JobId) -> LeaseResult<Option<JobItem>> {
        (**self).get(id).await
    }

    async fn stats(&self, now: DateTime<Utc>) -> LeaseResult<LedgerStats> {
        (**self).stats(now).await
    }
}

#[async_trait]
impl<S> LockStore for Arc<S>
where
    S: LockStore + ?Sized,
{
    async fn get_lock(&self, resource_key: &str) -> LeaseResult<Option<ResourceLock>> {
        (**self).get_lock(resource_key).await
    }

    async fn insert_lock(
        &self,
        resource_key: &str,
        owner: &OwnerId,
        now: DateTime<Utc>,
    ) -> LeaseResult<bool> {
        (**self).insert_lock(resource_key, owner, now).await
    }

    async fn update_lock(
        &self,
        resource_key: &str,
        expected_version: i64,
        owner: &OwnerId,
        now: DateTime<Utc>,
    ) -> LeaseResult<bool> {
        (**self)
            .update_lock(resource_key, expected_version, owner, now)
            .await
    }

    async fn release_lock(&self, resource_key: &str, owner: &OwnerId) -> LeaseResult<bool> {
        (**self).release_lock(resource_key, owner).await
    }
}
