//! Named resource locks with staleness-based takeover.
//!
//! A lock row is held exclusively while its `acquired_at` is within the caller's
//! staleness window. Past the window the holder is presumed dead and any other
//! owner may take the lock over without the holder's cooperation. Takeover
//! favors liveness: a superseded holder may still be running, so guarded code
//! re-checks ownership before irreversible steps.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::id::OwnerId;

/// Persistent state of one named resource lock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceLock {
    pub resource_key: String,
    /// `None` when free.
    pub owner: Option<OwnerId>,
    /// Last successful acquisition or renewal.
    pub acquired_at: DateTime<Utc>,
    /// Bumped on every mutation; the compare-and-swap token.
    pub version: i64,
}

impl ResourceLock {
    pub fn is_stale(&self, now: DateTime<Utc>, staleness_window: Duration) -> bool {
        now - self.acquired_at > staleness_window
    }

    /// Held by `owner` and not yet stale.
    pub fn is_held_by(&self, owner: &OwnerId, now: DateTime<Utc>, staleness_window: Duration) -> bool {
        self.owner.as_ref() == Some(owner) && !self.is_stale(now, staleness_window)
    }
}

/// What `try_acquire` must do given the current row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AcquireDecision {
    /// No row yet: insert one (a unique conflict means someone else won).
    Insert,
    /// Already ours: refresh `acquired_at`.
    Renew { version: i64 },
    /// Row exists but nobody holds it.
    AcquireFree { version: i64 },
    /// Holder's lease went stale: take it over.
    TakeOver { version: i64, previous_owner: OwnerId },
    /// Holder is still fresh.
    Busy { holder: OwnerId, held_for: Duration },
}

impl AcquireDecision {
    pub fn decide(
        current: Option<&ResourceLock>,
        owner: &OwnerId,
        now: DateTime<Utc>,
        staleness_window: Duration,
    ) -> Self {
        let Some(lock) = current else {
            return AcquireDecision::Insert;
        };

        match &lock.owner {
            None => AcquireDecision::AcquireFree {
                version: lock.version,
            },
            Some(holder) if holder == owner => AcquireDecision::Renew {
                version: lock.version,
            },
            Some(holder) if lock.is_stale(now, staleness_window) => AcquireDecision::TakeOver {
                version: lock.version,
                previous_owner: holder.clone(),
            },
            Some(holder) => AcquireDecision::Busy {
                holder: holder.clone(),
                held_for: now - lock.acquired_at,
            },
        }
    }
}

/// Result of an acquisition attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AcquireOutcome {
    /// Acquired a free or previously unknown resource.
    Acquired,
    /// Caller already held it; `acquired_at` was refreshed.
    Renewed,
    /// A stale holder was displaced.
    TakenOver { previous_owner: OwnerId },
    /// Someone else holds a fresh lock (or won a concurrent race).
    Busy {
        holder: Option<OwnerId>,
        held_for: Option<Duration>,
    },
}

impl AcquireOutcome {
    pub fn is_acquired(&self) -> bool {
        !matches!(self, AcquireOutcome::Busy { .. })
    }

    /// A race lost to a concurrent acquirer whose identity is unknown.
    pub fn lost_race() -> Self {
        AcquireOutcome::Busy {
            holder: None,
            held_for: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lock(owner: Option<&str>, acquired_at: DateTime<Utc>) -> ResourceLock {
        ResourceLock {
            resource_key: "/media/in/a.mkv".to_string(),
            owner: owner.map(OwnerId::from),
            acquired_at,
            version: 7,
        }
    }

    #[test]
    fn decide_covers_every_row_state() {
        let now = Utc::now();
        let window = Duration::seconds(10);
        let me = OwnerId::from("a");

        assert_eq!(AcquireDecision::decide(None, &me, now, window), AcquireDecision::Insert);

        let free = lock(None, now - Duration::hours(1));
        assert_eq!(
            AcquireDecision::decide(Some(&free), &me, now, window),
            AcquireDecision::AcquireFree { version: 7 }
        );

        let mine = lock(Some("a"), now - Duration::hours(1));
        assert_eq!(
            AcquireDecision::decide(Some(&mine), &me, now, window),
            AcquireDecision::Renew { version: 7 }
        );

        let fresh = lock(Some("b"), now - Duration::seconds(2));
        assert_eq!(
            AcquireDecision::decide(Some(&fresh), &me, now, window),
            AcquireDecision::Busy {
                holder: OwnerId::from("b"),
                held_for: Duration::seconds(2)
            }
        );

        let stale = lock(Some("b"), now - Duration::seconds(11));
        assert_eq!(
            AcquireDecision::decide(Some(&stale), &me, now, window),
            AcquireDecision::TakeOver {
                version: 7,
                previous_owner: OwnerId::from("b")
            }
        );
    }

    #[test]
    fn exactly_at_the_window_is_still_held() {
        let now = Utc::now();
        let row = lock(Some("b"), now - Duration::seconds(10));
        assert!(!row.is_stale(now, Duration::seconds(10)));
        assert!(row.is_held_by(&OwnerId::from("b"), now, Duration::seconds(10)));
        assert!(!row.is_held_by(&OwnerId::from("a"), now, Duration::seconds(10)));
    }
}
