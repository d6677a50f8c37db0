//! Resource mutex over a [`LockStore`].

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, warn};

use workhorse_core::{
    AcquireDecision, AcquireOutcome, Clock, LeaseError, LeaseResult, OwnerId, SystemClock,
};
use workhorse_observability::LeaseMetrics;

use crate::store::LockStore;

/// Named mutual-exclusion locks with staleness-based takeover.
///
/// A holder keeps the lock by calling [`try_acquire`](Self::try_acquire) again
/// within the staleness window, which refreshes `acquired_at`. A holder that
/// stops doing so is displaced by the next acquirer once the window passes,
/// without being told. Code guarding an irreversible step should confirm
/// ownership with [`is_held_by`](Self::is_held_by) right before it.
///
/// ## Implementation Requirements
///
/// Every mutation is a compare-and-swap against the row version read in the
/// same call. Losing a race is reported as `Busy`, never as an error.
pub struct ResourceMutex<S> {
    store: S,
    clock: Arc<dyn Clock>,
    metrics: Arc<LeaseMetrics>,
}

impl<S: LockStore> ResourceMutex<S> {
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

    /// One acquisition attempt. Never waits.
    pub async fn try_acquire(
        &self,
        owner: &OwnerId,
        resource_key: &str,
        staleness_window: Duration,
    ) -> LeaseResult<AcquireOutcome> {
        let window = window(resource_key, staleness_window)?;
        let now = self.clock.now();

        let current = self.track(self.store.get_lock(resource_key).await)?;
        let decision = AcquireDecision::decide(current.as_ref(), owner, now, window);

        let outcome = match decision {
            AcquireDecision::Insert => {
                if self.track(self.store.insert_lock(resource_key, owner, now).await)? {
                    AcquireOutcome::Acquired
                } else {
                    AcquireOutcome::lost_race()
                }
            }
            AcquireDecision::AcquireFree { version } => {
                self.swap(resource_key, version, owner, now, AcquireOutcome::Acquired)
                    .await?
            }
            AcquireDecision::Renew { version } => {
                self.swap(resource_key, version, owner, now, AcquireOutcome::Renewed)
                    .await?
            }
            AcquireDecision::TakeOver {
                version,
                previous_owner,
            } => {
                let outcome = self
                    .swap(
                        resource_key,
                        version,
                        owner,
                        now,
                        AcquireOutcome::TakenOver {
                            previous_owner: previous_owner.clone(),
                        },
                    )
                    .await?;
                if outcome.is_acquired() {
                    warn!(
                        resource_key,
                        owner = %owner,
                        previous_owner = %previous_owner,
                        window_ms = window.num_milliseconds(),
                        "took over stale resource lock"
                    );
                }
                outcome
            }
            AcquireDecision::Busy { holder, held_for } => AcquireOutcome::Busy {
                holder: Some(holder),
                held_for: Some(held_for),
            },
        };

        match &outcome {
            AcquireOutcome::Acquired => {
                self.metrics.record_lock_acquired();
                debug!(resource_key, owner = %owner, "resource lock acquired");
            }
            AcquireOutcome::Renewed => self.metrics.record_lock_renewed(),
            AcquireOutcome::TakenOver { .. } => self.metrics.record_lock_takeover(),
            AcquireOutcome::Busy { holder, .. } => {
                self.metrics.record_lock_contended();
                debug!(resource_key, owner = %owner, holder = ?holder, "resource busy");
            }
        }

        Ok(outcome)
    }

    /// Poll [`try_acquire`](Self::try_acquire) every `poll_interval` until it
    /// succeeds or `max_wait` has elapsed. `Ok(false)` when the wait ran out.
    ///
    /// Dropping the returned future abandons the wait without side effects.
    pub async fn wait_acquire(
        &self,
        owner: &OwnerId,
        resource_key: &str,
        staleness_window: Duration,
        max_wait: Duration,
        poll_interval: Duration,
    ) -> LeaseResult<bool> {
        self.wait(owner, resource_key, staleness_window, max_wait, poll_interval, None)
            .await
    }

    /// [`wait_acquire`](Self::wait_acquire) that gives up with
    /// [`LeaseError::Cancelled`] once `cancel` becomes `true`.
    pub async fn wait_acquire_cancellable(
        &self,
        owner: &OwnerId,
        resource_key: &str,
        staleness_window: Duration,
        max_wait: Duration,
        poll_interval: Duration,
        cancel: &mut watch::Receiver<bool>,
    ) -> LeaseResult<bool> {
        self.wait(
            owner,
            resource_key,
            staleness_window,
            max_wait,
            poll_interval,
            Some(cancel),
        )
        .await
    }

    /// Give the lock up. `false` if `owner` did not hold it.
    pub async fn release(&self, owner: &OwnerId, resource_key: &str) -> LeaseResult<bool> {
        let released = self.track(self.store.release_lock(resource_key, owner).await)?;
        if released {
            self.metrics.record_lock_released();
            debug!(resource_key, owner = %owner, "resource lock released");
        }
        Ok(released)
    }

    /// Whether `owner` still holds a fresh lock on `resource_key`.
    pub async fn is_held_by(
        &self,
        owner: &OwnerId,
        resource_key: &str,
        staleness_window: Duration,
    ) -> LeaseResult<bool> {
        let window = window(resource_key, staleness_window)?;
        let current = self.track(self.store.get_lock(resource_key).await)?;
        let now = self.clock.now();
        Ok(current.is_some_and(|lock| lock.is_held_by(owner, now, window)))
    }

    async fn swap(
        &self,
        resource_key: &str,
        version: i64,
        owner: &OwnerId,
        now: DateTime<Utc>,
        on_success: AcquireOutcome,
    ) -> LeaseResult<AcquireOutcome> {
        let swapped = self.track(
            self.store
                .update_lock(resource_key, version, owner, now)
                .await,
        )?;
        Ok(if swapped {
            on_success
        } else {
            AcquireOutcome::lost_race()
        })
    }

    async fn wait(
        &self,
        owner: &OwnerId,
        resource_key: &str,
        staleness_window: Duration,
        max_wait: Duration,
        poll_interval: Duration,
        mut cancel: Option<&mut watch::Receiver<bool>>,
    ) -> LeaseResult<bool> {
        if poll_interval.is_zero() {
            return Err(LeaseError::invalid("poll interval must be positive"));
        }
        // `None` when `max_wait` is too large to represent: wait until acquired.
        let deadline = Instant::now().checked_add(max_wait);

        loop {
            if cancel.as_ref().is_some_and(|rx| *rx.borrow()) {
                return Err(LeaseError::Cancelled(resource_key.to_string()));
            }

            let outcome = self
                .try_acquire(owner, resource_key, staleness_window)
                .await?;
            if outcome.is_acquired() {
                return Ok(true);
            }

            let nap = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        debug!(resource_key, owner = %owner, max_wait_ms = max_wait.as_millis() as u64, "gave up waiting for resource");
                        return Ok(false);
                    }
                    poll_interval.min(deadline - now)
                }
                None => poll_interval,
            };

            match cancel.as_deref_mut() {
                Some(rx) => {
                    tokio::select! {
                        _ = tokio::time::sleep(nap) => {}
                        changed = rx.changed() => {
                            // A dropped sender can never cancel; finish the nap.
                            if changed.is_err() {
                                tokio::time::sleep(nap).await;
                            }
                        }
                    }
                }
                None => tokio::time::sleep(nap).await,
            }
        }
    }

    fn track<T>(&self, result: LeaseResult<T>) -> LeaseResult<T> {
        if matches!(&result, Err(e) if e.is_transient()) {
            self.metrics.record_store_error();
        }
        result
    }
}

fn window(resource_key: &str, staleness_window: Duration) -> LeaseResult<chrono::Duration> {
    if resource_key.is_empty() {
        return Err(LeaseError::invalid("resource key must not be empty"));
    }
    chrono::Duration::from_std(staleness_window).map_err(|_| {
        LeaseError::invalid(format!("staleness window {staleness_window:?} is out of range"))
    })
}
