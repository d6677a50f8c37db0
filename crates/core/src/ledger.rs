//! Job ledger: work items and their lease state machine.
//!
//! ```text
//! Pending --claim--> Leased --complete--> Completed
//!    ^                 |  \--fail(permanent)--> Failed
//!    |                 |
//!    +--fail/release---+   (renew: Leased -> Leased)
//!    +--lease_expires_at < now (implicit, discovered by the next claim)
//! ```
//!
//! The ledger is mutated only through the store's atomic primitives. The pure
//! functions here ([`ClaimPredicate::matches`], [`JobPatch::apply`]) define what
//! those primitives do; store implementations either call them directly
//! (in-memory) or mirror them in SQL (PostgreSQL).

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::backoff::BackoffCurve;
use crate::error::LeaseError;
use crate::id::{JobId, OwnerId};

/// Lifecycle state of a job item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting to be claimed
    Pending,
    /// Held by one owner until `lease_expires_at`
    Leased,
    /// Finished successfully (terminal)
    Completed,
    /// Gave up permanently (terminal)
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Leased => "leased",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Result<Self, LeaseError> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "leased" => Ok(JobStatus::Leased),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            other => Err(LeaseError::corrupt(format!("unknown job status '{other}'"))),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    /// Whether the state machine permits `self -> to`.
    pub fn can_transition(&self, to: JobStatus) -> bool {
        matches!(
            (self, to),
            (JobStatus::Pending, JobStatus::Leased)
                | (JobStatus::Leased, JobStatus::Leased)
                | (JobStatus::Leased, JobStatus::Pending)
                | (JobStatus::Leased, JobStatus::Completed)
                | (JobStatus::Leased, JobStatus::Failed)
        )
    }
}

impl core::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A unit of work tracked by the ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobItem {
    pub id: JobId,
    /// Opaque reference to the work (URL, file path). Never interpreted here.
    pub payload_key: String,
    pub status: JobStatus,
    pub owner: Option<OwnerId>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    /// When the current lease was first granted (not moved by renewals).
    pub leased_at: Option<DateTime<Utc>>,
    /// Incremented on every claim; never reset.
    pub attempt_count: u32,
    /// Set by a retriable failure, cleared by the next claim or a release.
    /// Only these items wait out the requeue delay.
    #[serde(default)]
    pub retry_pending: bool,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl JobItem {
    /// New pending item.
    pub fn new(payload_key: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            id: JobId::new(),
            payload_key: payload_key.into(),
            status: JobStatus::Pending,
            owner: None,
            lease_expires_at: None,
            leased_at: None,
            attempt_count: 0,
            retry_pending: false,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Leased and not yet past its expiry.
    pub fn has_active_lease(&self, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Leased && self.lease_expires_at.is_some_and(|exp| exp > now)
    }

    /// Leased but past its expiry: eligible for reclamation.
    pub fn has_expired_lease(&self, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Leased && self.lease_expires_at.is_none_or(|exp| exp < now)
    }

    pub fn is_held_by(&self, owner: &OwnerId) -> bool {
        self.status == JobStatus::Leased && self.owner.as_ref() == Some(owner)
    }

    /// Time since the current lease was granted.
    pub fn lease_age(&self, now: DateTime<Utc>) -> Option<Duration> {
        match self.status {
            JobStatus::Leased => self.leased_at.map(|at| now - at),
            _ => None,
        }
    }

    /// Mark leased by `grant`. Used by store implementations inside `claim_batch`.
    pub fn grant(&mut self, grant: &LeaseGrant, now: DateTime<Utc>) {
        self.status = JobStatus::Leased;
        self.owner = Some(grant.owner.clone());
        self.lease_expires_at = Some(grant.expires_at);
        self.leased_at = Some(now);
        self.attempt_count = self.attempt_count.saturating_add(1);
        self.retry_pending = false;
        self.updated_at = now;
    }
}

/// Eligibility predicate for `claim_batch`.
///
/// An item is claimable when it is `Pending` (and, if it was requeued by a
/// retriable failure, past its requeue delay) or `Leased` with
/// `lease_expires_at < now`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClaimPredicate {
    pub now: DateTime<Utc>,
    /// "Not before" delay for items with `retry_pending`, keyed on
    /// `attempt_count` and measured from `updated_at`.
    pub requeue_delay: Option<BackoffCurve>,
}

impl ClaimPredicate {
    pub fn at(now: DateTime<Utc>) -> Self {
        Self {
            now,
            requeue_delay: None,
        }
    }

    pub fn with_requeue_delay(mut self, curve: BackoffCurve) -> Self {
        self.requeue_delay = Some(curve);
        self
    }

    pub fn matches(&self, item: &JobItem) -> bool {
        match item.status {
            JobStatus::Pending => match self.requeue_delay {
                Some(curve) if item.retry_pending => {
                    let delay = Duration::from_std(curve.delay_for_attempt(item.attempt_count))
                        .unwrap_or(Duration::MAX);
                    item.updated_at
                        .checked_add_signed(delay)
                        .is_some_and(|ready_at| ready_at <= self.now)
                }
                _ => true,
            },
            JobStatus::Leased => item.has_expired_lease(self.now),
            JobStatus::Completed | JobStatus::Failed => false,
        }
    }
}

/// Owner and expiry applied to rows won by `claim_batch`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseGrant {
    pub owner: OwnerId,
    pub expires_at: DateTime<Utc>,
}

/// An item returned by `claim_batch`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimedJob {
    pub item: JobItem,
    /// Set when the claim took over an expired lease from another owner.
    pub previous_owner: Option<OwnerId>,
}

/// New field values applied by a conditional update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobPatch {
    pub status: JobStatus,
    pub owner: Option<OwnerId>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    /// Recorded when `Some`; otherwise the previous value is kept.
    pub last_error: Option<String>,
    pub retry_pending: bool,
}

impl JobPatch {
    /// Extend the lease held by `owner`.
    pub fn renew(owner: OwnerId, expires_at: DateTime<Utc>) -> Self {
        Self {
            status: JobStatus::Leased,
            owner: Some(owner),
            lease_expires_at: Some(expires_at),
            last_error: None,
            retry_pending: false,
        }
    }

    pub fn complete() -> Self {
        Self {
            status: JobStatus::Completed,
            owner: None,
            lease_expires_at: None,
            last_error: None,
            retry_pending: false,
        }
    }

    /// Return to `Pending` for a later retry.
    pub fn requeue(error: Option<String>) -> Self {
        Self {
            status: JobStatus::Pending,
            owner: None,
            lease_expires_at: None,
            last_error: error,
            retry_pending: true,
        }
    }

    pub fn fail(error: Option<String>) -> Self {
        Self {
            status: JobStatus::Failed,
            owner: None,
            lease_expires_at: None,
            last_error: error,
            retry_pending: false,
        }
    }

    /// Hand the lease back without recording a failure. The item is
    /// claimable again immediately.
    pub fn release() -> Self {
        Self {
            status: JobStatus::Pending,
            owner: None,
            lease_expires_at: None,
            last_error: None,
            retry_pending: false,
        }
    }

    /// Apply to an item already known to match the expectation.
    pub fn apply(&self, item: &mut JobItem, now: DateTime<Utc>) {
        if self.status != JobStatus::Leased {
            item.leased_at = None;
        }
        item.status = self.status;
        item.owner = self.owner.clone();
        item.lease_expires_at = self.lease_expires_at;
        item.retry_pending = self.retry_pending;
        if let Some(err) = &self.last_error {
            item.last_error = Some(err.clone());
        }
        item.updated_at = now;
    }
}

/// Ledger-wide counts for monitoring.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LedgerStats {
    pub pending: u64,
    /// All `Leased` rows, including expired ones.
    pub leased: u64,
    /// `Leased` rows whose expiry has passed (claimable by anyone).
    pub reclaimable: u64,
    pub completed: u64,
    pub failed: u64,
    /// Age of the oldest lease that is still active, in milliseconds.
    pub oldest_active_lease_ms: Option<i64>,
}

impl LedgerStats {
    pub fn total(&self) -> u64 {
        self.pending + self.leased + self.completed + self.failed
    }

    /// Fold one item into the counts (used by in-process stores).
    pub fn observe(&mut self, item: &JobItem, now: DateTime<Utc>) {
        match item.status {
            JobStatus::Pending => self.pending += 1,
            JobStatus::Leased => {
                self.leased += 1;
                if item.has_expired_lease(now) {
                    self.reclaimable += 1;
                } else if let Some(age) = item.lease_age(now) {
                    let ms = age.num_milliseconds();
                    self.oldest_active_lease_ms =
                        Some(self.oldest_active_lease_ms.map_or(ms, |cur| cur.max(ms)));
                }
            }
            JobStatus::Completed => self.completed += 1,
            JobStatus::Failed => self.failed += 1,
        }
    }
}
