//! In-process store for tests/dev.
//!
//! One mutex serializes every primitive, which trivially gives the atomicity the
//! PostgreSQL store gets from row locks. It also keeps a grant log (every lease
//! interval handed out) so tests can check mutual exclusion after the fact.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use workhorse_core::{
    ClaimPredicate, ClaimedJob, JobId, JobItem, JobPatch, JobStatus, LeaseError, LeaseGrant,
    LeaseResult, LedgerStats, OwnerId, ResourceLock,
};

use super::r#trait::{LeaseStore, LockStore};

/// One lease interval granted to an owner (claim or renewal).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GrantRecord {
    pub job_id: JobId,
    pub owner: OwnerId,
    pub from: DateTime<Utc>,
    /// Expiry, or the moment the owner gave the lease up if that came first.
    pub until: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct State {
    jobs: HashMap<JobId, JobItem>,
    payload_keys: HashSet<String>,
    locks: HashMap<String, ResourceLock>,
    grants: Vec<GrantRecord>,
}

/// In-memory lease and lock store.
#[derive(Debug, Default)]
pub struct InMemoryLeaseStore {
    state: Mutex<State>,
    unavailable: AtomicBool,
}

impl InMemoryLeaseStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Simulate an outage: while set, every primitive fails with `StoreUnavailable`.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Every lease interval granted so far, in grant order.
    pub fn grant_log(&self) -> Vec<GrantRecord> {
        self.state
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .grants
            .clone()
    }

    /// Pairs of grants on the same item to different owners whose intervals overlap.
    pub fn overlapping_grants(&self) -> Vec<(GrantRecord, GrantRecord)> {
        let grants = self.grant_log();
        let mut overlaps = Vec::new();
        for (i, a) in grants.iter().enumerate() {
            for b in &grants[i + 1..] {
                if a.job_id == b.job_id
                    && a.owner != b.owner
                    && a.from < b.until
                    && b.from < a.until
                {
                    overlaps.push((a.clone(), b.clone()));
                }
            }
        }
        overlaps
    }

    fn lock_state(&self) -> LeaseResult<MutexGuard<'_, State>> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(LeaseError::unavailable("in-memory store marked unavailable"));
        }
        self.state
            .lock()
            .map_err(|_| LeaseError::unavailable("lock poisoned"))
    }
}

#[async_trait]
impl LeaseStore for InMemoryLeaseStore {
    async fn enqueue(
        &self,
        payload_keys: &[String],
        now: DateTime<Utc>,
    ) -> LeaseResult<Vec<JobItem>> {
        let mut state = self.lock_state()?;
        let mut inserted = Vec::new();
        for key in payload_keys {
            if !state.payload_keys.insert(key.clone()) {
                continue;
            }
            let item = JobItem::new(key.clone(), now);
            state.jobs.insert(item.id, item.clone());
            inserted.push(item);
        }
        Ok(inserted)
    }

    async fn claim_batch(
        &self,
        predicate: &ClaimPredicate,
        limit: usize,
        grant: &LeaseGrant,
    ) -> LeaseResult<Vec<ClaimedJob>> {
        let mut state = self.lock_state()?;
        if limit == 0 {
            return Ok(Vec::new());
        }

        let mut candidates: Vec<_> = state
            .jobs
            .values()
            .filter(|j| predicate.matches(j))
            .map(|j| (j.updated_at, j.created_at, j.id))
            .collect();
        candidates.sort();
        candidates.truncate(limit);

        let now = predicate.now;
        let mut claimed = Vec::with_capacity(candidates.len());
        for (_, _, id) in candidates {
            let Some(item) = state.jobs.get_mut(&id) else {
                continue;
            };
            let previous_owner = match item.status {
                JobStatus::Leased => item.owner.clone(),
                _ => None,
            };
            item.grant(grant, now);
            let item = item.clone();

            state.grants.push(GrantRecord {
                job_id: id,
                owner: grant.owner.clone(),
                from: now,
                until: grant.expires_at,
            });
            claimed.push(ClaimedJob {
                item,
                previous_owner,
            });
        }

        Ok(claimed)
    }

    async fn conditional_update(
        &self,
        id: JobId,
        expected_status: JobStatus,
        expected_owner: &OwnerId,
        patch: &JobPatch,
        now: DateTime<Utc>,
    ) -> LeaseResult<bool> {
        let mut state = self.lock_state()?;
        let Some(item) = state.jobs.get_mut(&id) else {
            return Ok(false);
        };
        if item.status != expected_status || item.owner.as_ref() != Some(expected_owner) {
            return Ok(false);
        }
        if !item.status.can_transition(patch.status) {
            return Err(LeaseError::invalid(format!(
                "job {id}: transition {} -> {} is not allowed",
                item.status, patch.status
            )));
        }

        patch.apply(item, now);
        let lease_expires_at = item.lease_expires_at;

        // Close (or extend) the owner's interval in the grant log.
        match (patch.status, lease_expires_at) {
            (JobStatus::Leased, Some(until)) => state.grants.push(GrantRecord {
                job_id: id,
                owner: expected_owner.clone(),
                from: now,
                until,
            }),
            _ => {
                for g in state
                    .grants
                    .iter_mut()
                    .filter(|g| g.job_id == id && &g.owner == expected_owner && g.until > now)
                {
                    g.until = now;
                }
            }
        }

        Ok(true)
    }

    async fn get(&self, id: JobId) -> LeaseResult<Option<JobItem>> {
        let state = self.lock_state()?;
        Ok(state.jobs.get(&id).cloned())
    }

    async fn stats(&self, now: DateTime<Utc>) -> LeaseResult<LedgerStats> {
        let state = self.lock_state()?;
        let mut stats = LedgerStats::default();
        for item in state.jobs.values() {
            stats.observe(item, now);
        }
        Ok(stats)
    }
}

#[async_trait]
impl LockStore for InMemoryLeaseStore {
    async fn get_lock(&self, resource_key: &str) -> LeaseResult<Option<ResourceLock>> {
        let state = self.lock_state()?;
        Ok(state.locks.get(resource_key).cloned())
    }

    async fn insert_lock(
        &self,
        resource_key: &str,
        owner: &OwnerId,
        now: DateTime<Utc>,
    ) -> LeaseResult<bool> {
        let mut state = self.lock_state()?;
        if state.locks.contains_key(resource_key) {
            return Ok(false);
        }
        state.locks.insert(
            resource_key.to_string(),
            ResourceLock {
                resource_key: resource_key.to_string(),
                owner: Some(owner.clone()),
                acquired_at: now,
                version: 1,
            },
        );
        Ok(true)
    }

    async fn update_lock(
        &self,
        resource_key: &str,
        expected_version: i64,
        owner: &OwnerId,
        now: DateTime<Utc>,
    ) -> LeaseResult<bool> {
        let mut state = self.lock_state()?;
        match state.locks.get_mut(resource_key) {
            Some(lock) if lock.version == expected_version => {
                lock.owner = Some(owner.clone());
                lock.acquired_at = now;
                lock.version += 1;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn release_lock(&self, resource_key: &str, owner: &OwnerId) -> LeaseResult<bool> {
        let mut state = self.lock_state()?;
        match state.locks.get_mut(resource_key) {
            Some(lock) if lock.owner.as_ref() == Some(owner) => {
                lock.owner = None;
                lock.version += 1;
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}
