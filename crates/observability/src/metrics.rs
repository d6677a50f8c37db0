//! Lease and lock event counters.
//!
//! Ownership can change hands without either owner being told (expired leases
//! reclaimed by another worker, stale locks taken over). These counters make
//! that visible. One instance is shared by every execution unit of a process;
//! pass it explicitly, there is no global registry.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Process-local counters, updated lock-free from many tasks.
#[derive(Debug, Default)]
pub struct LeaseMetrics {
    claims_granted: AtomicU64,
    leases_reclaimed: AtomicU64,
    renewals: AtomicU64,
    leases_lost: AtomicU64,
    completions: AtomicU64,
    requeues: AtomicU64,
    permanent_failures: AtomicU64,
    releases: AtomicU64,
    lock_acquired: AtomicU64,
    lock_renewed: AtomicU64,
    lock_takeovers: AtomicU64,
    lock_contended: AtomicU64,
    lock_released: AtomicU64,
    store_errors: AtomicU64,
}

/// Point-in-time copy of [`LeaseMetrics`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub claims_granted: u64,
    pub leases_reclaimed: u64,
    pub renewals: u64,
    pub leases_lost: u64,
    pub completions: u64,
    pub requeues: u64,
    pub permanent_failures: u64,
    pub releases: u64,
    pub lock_acquired: u64,
    pub lock_renewed: u64,
    pub lock_takeovers: u64,
    pub lock_contended: u64,
    pub lock_released: u64,
    pub store_errors: u64,
}

fn bump(counter: &AtomicU64, by: u64) {
    counter.fetch_add(by, Ordering::Relaxed);
}

impl LeaseMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// `reclaimed` is the subset of `granted` taken over from expired leases.
    pub fn record_claims(&self, granted: u64, reclaimed: u64) {
        bump(&self.claims_granted, granted);
        bump(&self.leases_reclaimed, reclaimed);
    }

    pub fn record_renewal(&self) {
        bump(&self.renewals, 1);
    }

    /// A conditional update found the lease held by someone else (or terminal).
    pub fn record_lease_lost(&self) {
        bump(&self.leases_lost, 1);
    }

    pub fn record_completion(&self) {
        bump(&self.completions, 1);
    }

    pub fn record_requeue(&self) {
        bump(&self.requeues, 1);
    }

    pub fn record_permanent_failure(&self) {
        bump(&self.permanent_failures, 1);
    }

    pub fn record_release(&self) {
        bump(&self.releases, 1);
    }

    pub fn record_lock_acquired(&self) {
        bump(&self.lock_acquired, 1);
    }

    pub fn record_lock_renewed(&self) {
        bump(&self.lock_renewed, 1);
    }

    pub fn record_lock_takeover(&self) {
        bump(&self.lock_takeovers, 1);
    }

    pub fn record_lock_contended(&self) {
        bump(&self.lock_contended, 1);
    }

    pub fn record_lock_released(&self) {
        bump(&self.lock_released, 1);
    }

    pub fn record_store_error(&self) {
        bump(&self.store_errors, 1);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        MetricsSnapshot {
            claims_granted: load(&self.claims_granted),
            leases_reclaimed: load(&self.leases_reclaimed),
            renewals: load(&self.renewals),
            leases_lost: load(&self.leases_lost),
            completions: load(&self.completions),
            requeues: load(&self.requeues),
            permanent_failures: load(&self.permanent_failures),
            releases: load(&self.releases),
            lock_acquired: load(&self.lock_acquired),
            lock_renewed: load(&self.lock_renewed),
            lock_takeovers: load(&self.lock_takeovers),
            lock_contended: load(&self.lock_contended),
            lock_released: load(&self.lock_released),
            store_errors: load(&self.store_errors),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn counters_accumulate_across_threads() {
        let metrics = Arc::new(LeaseMetrics::new());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let m = metrics.clone();
                std::thread::spawn(move || {
                    for _ in 0..250 {
                        m.record_claims(1, 0);
                        m.record_completion();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let snap = metrics.snapshot();
        assert_eq!(snap.claims_granted, 1000);
        assert_eq!(snap.completions, 1000);
        assert_eq!(snap.leases_reclaimed, 0);
    }

    #[test]
    fn snapshot_serializes_flat() {
        let metrics = LeaseMetrics::new();
        metrics.record_lock_takeover();
        let json = serde_json::to_value(metrics.snapshot()).unwrap();
        assert_eq!(json["lock_takeovers"], 1);
    }
}
