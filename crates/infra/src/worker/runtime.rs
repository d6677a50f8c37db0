//! Worker runtime: claim, execute with heartbeats, finalize.

use std::sync::{Arc, Mutex};

use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use workhorse_core::{JobItem, LeaseResult, OwnerId};

use super::handler::{JobHandler, JobResult};
use crate::config::WorkerConfig;
use crate::lease::LeaseManager;
use crate::store::LeaseStore;

/// Handle to control running execution units.
#[derive(Debug)]
pub struct WorkerRuntimeHandle {
    shutdown: watch::Sender<bool>,
    joins: Vec<JoinHandle<()>>,
    stats: Arc<Mutex<WorkerStats>>,
    started: Instant,
}

impl WorkerRuntimeHandle {
    /// Request graceful shutdown and wait for every unit to stop.
    ///
    /// Units finish the item they are executing, release the items they claimed
    /// but did not start, and exit.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for join in self.joins {
            if let Err(e) = join.await {
                error!(error = %e, "execution unit panicked");
            }
        }
    }

    /// Get current runtime statistics.
    pub fn stats(&self) -> WorkerStats {
        let mut stats = lock_stats(&self.stats).clone();
        stats.uptime_secs = self.started.elapsed().as_secs();
        stats
    }
}

/// Runtime statistics, summed over all execution units.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct WorkerStats {
    pub claimed: u64,
    pub processed: u64,
    pub succeeded: u64,
    pub requeued: u64,
    pub failed_permanently: u64,
    pub leases_lost: u64,
    pub released: u64,
    pub store_errors: u64,
    pub current_running: usize,
    pub uptime_secs: u64,
}

/// What happened to one claimed batch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BatchReport {
    pub claimed: usize,
    pub succeeded: usize,
    pub requeued: usize,
    pub failed: usize,
    /// Items whose lease was lost before a result could be recorded.
    pub lost: usize,
    /// Claimed but unstarted items handed back on shutdown.
    pub released: usize,
    /// Items whose result could not be recorded because the store failed.
    pub store_errors: usize,
}

/// A claimed item and the last time its lease was confirmed.
struct Held {
    item: JobItem,
    confirmed_at: Instant,
}

enum Renewal {
    Held,
    Lost,
    /// Store error; the lease may or may not still be ours.
    Unknown,
}

#[derive(Debug, Clone, Copy)]
enum Outcome {
    Completed,
    Requeued,
    Failed,
}

enum Execution {
    Finished(JobResult),
    LeaseLost,
}

/// Drives execution units that pull from a [`LeaseManager`].
///
/// Each unit claims up to `batch_size` items, runs them one at a time through
/// the handler while renewing every held lease each `heartbeat_interval`, and
/// records the outcome. Losing a lease mid-execution drops the handler future.
pub struct WorkerRuntime<S, H> {
    manager: Arc<LeaseManager<S>>,
    handler: H,
    config: WorkerConfig,
    stats: Arc<Mutex<WorkerStats>>,
}

impl<S, H> WorkerRuntime<S, H>
where
    S: LeaseStore,
    H: JobHandler,
{
    pub fn new(manager: Arc<LeaseManager<S>>, handler: H, config: WorkerConfig) -> Self {
        Self {
            manager,
            handler,
            config,
            stats: Arc::new(Mutex::new(WorkerStats::default())),
        }
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    pub fn stats(&self) -> WorkerStats {
        lock_stats(&self.stats).clone()
    }

    /// Spawn `concurrency` execution units on the current tokio runtime.
    pub fn spawn(self) -> LeaseResult<WorkerRuntimeHandle>
    where
        S: 'static,
        H: 'static,
    {
        self.config.validate()?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let stats = self.stats.clone();
        let runtime = Arc::new(self);

        let joins = (0..runtime.config.concurrency)
            .map(|index| {
                let runtime = runtime.clone();
                let shutdown = shutdown_rx.clone();
                tokio::spawn(async move { runtime.run_unit(index, shutdown).await })
            })
            .collect();

        Ok(WorkerRuntimeHandle {
            shutdown: shutdown_tx,
            joins,
            stats,
            started: Instant::now(),
        })
    }

    /// Claim and process a single batch as `config.owner`.
    ///
    /// For tests and one-shot tools. Returns an empty report when nothing was
    /// eligible.
    pub async fn run_once(&self) -> LeaseResult<BatchReport> {
        self.config.validate()?;
        let owner = self.config.owner.clone();
        self.process_batch(&owner, None).await
    }

    async fn run_unit(&self, index: usize, mut shutdown: watch::Receiver<bool>) {
        let owner = OwnerId::from(format!("{}/{}", self.config.owner, index));
        let name = self.config.name.as_str();
        info!(worker = name, owner = %owner, "execution unit started");

        let mut streak: u32 = 0;
        loop {
            if *shutdown.borrow() {
                break;
            }

            match self.process_batch(&owner, Some(&shutdown)).await {
                Ok(report) if report.claimed > 0 => {
                    streak = 0;
                    continue;
                }
                Ok(_) => streak = streak.saturating_add(1),
                Err(e) => {
                    streak = streak.saturating_add(1);
                    self.update_stats(|s| s.store_errors += 1);
                    warn!(
                        worker = name,
                        owner = %owner,
                        error = %e,
                        failures = streak,
                        "claim failed; backing off"
                    );
                }
            }

            let delay = self.config.idle_backoff.delay(streak);
            let stop = tokio::select! {
                _ = tokio::time::sleep(delay) => false,
                changed = shutdown.changed() => changed.is_err(),
            };
            if stop {
                break;
            }
        }

        info!(worker = name, owner = %owner, "execution unit stopped");
    }

    async fn process_batch(
        &self,
        owner: &OwnerId,
        shutdown: Option<&watch::Receiver<bool>>,
    ) -> LeaseResult<BatchReport> {
        let claimed = self
            .manager
            .claim_with_delay(
                owner,
                self.config.batch_size,
                self.config.lease_ttl,
                Some(self.config.retry.requeue_curve()),
            )
            .await?;

        let mut report = BatchReport {
            claimed: claimed.len(),
            ..Default::default()
        };
        if claimed.is_empty() {
            return Ok(report);
        }
        self.update_stats(|s| s.claimed += claimed.len() as u64);
        debug!(owner = %owner, claimed = claimed.len(), "processing batch");

        let now = Instant::now();
        let mut waiting: Vec<Held> = claimed
            .into_iter()
            .rev()
            .map(|item| Held {
                item,
                confirmed_at: now,
            })
            .collect();

        while let Some(mut current) = waiting.pop() {
            if shutdown.is_some_and(|rx| *rx.borrow()) {
                waiting.push(current);
                break;
            }

            // Re-confirm items that waited behind slower ones.
            if current.confirmed_at.elapsed() >= self.config.heartbeat_interval {
                match self.renew(owner, &mut current).await {
                    Renewal::Held => {}
                    Renewal::Lost => {
                        report.lost += 1;
                        continue;
                    }
                    Renewal::Unknown if self.may_have_expired(&current) => {
                        report.store_errors += 1;
                        continue;
                    }
                    Renewal::Unknown => {}
                }
            }

            self.update_stats(|s| s.current_running += 1);
            let execution = self
                .execute_with_heartbeat(owner, &mut current, &mut waiting, &mut report)
                .await;
            self.update_stats(|s| {
                s.current_running = s.current_running.saturating_sub(1);
                s.processed += 1;
            });

            match execution {
                Execution::Finished(result) => {
                    self.finalize(owner, &current.item, result, &mut report)
                        .await
                }
                Execution::LeaseLost => {
                    report.lost += 1;
                    warn!(
                        job_id = %current.item.id,
                        owner = %owner,
                        "lease lost during execution; result discarded"
                    );
                }
            }
        }

        for held in waiting {
            match self.manager.release(owner, held.item.id).await {
                Ok(true) => report.released += 1,
                Ok(false) => report.lost += 1,
                Err(e) => {
                    report.store_errors += 1;
                    warn!(job_id = %held.item.id, error = %e, "release failed; lease will expire");
                }
            }
        }

        self.update_stats(|s| {
            s.leases_lost += report.lost as u64;
            s.released += report.released as u64;
            s.store_errors += report.store_errors as u64;
        });

        Ok(report)
    }

    async fn execute_with_heartbeat(
        &self,
        owner: &OwnerId,
        current: &mut Held,
        waiting: &mut Vec<Held>,
        report: &mut BatchReport,
    ) -> Execution {
        let period = self.config.heartbeat_interval;
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let item = current.item.clone();
        let run = self.handler.execute(&item);
        tokio::pin!(run);

        loop {
            tokio::select! {
                result = &mut run => return Execution::Finished(result),
                _ = ticker.tick() => {
                    match self.renew(owner, current).await {
                        Renewal::Held => {}
                        Renewal::Lost => return Execution::LeaseLost,
                        Renewal::Unknown if self.may_have_expired(current) => {
                            return Execution::LeaseLost;
                        }
                        Renewal::Unknown => {}
                    }

                    let mut still_held = Vec::with_capacity(waiting.len());
                    for mut held in waiting.drain(..) {
                        match self.renew(owner, &mut held).await {
                            Renewal::Lost => report.lost += 1,
                            Renewal::Held | Renewal::Unknown => still_held.push(held),
                        }
                    }
                    *waiting = still_held;
                }
            }
        }
    }

    async fn renew(&self, owner: &OwnerId, held: &mut Held) -> Renewal {
        match self
            .manager
            .renew(owner, held.item.id, self.config.lease_ttl)
            .await
        {
            Ok(true) => {
                held.confirmed_at = Instant::now();
                Renewal::Held
            }
            Ok(false) => Renewal::Lost,
            Err(e) => {
                self.update_stats(|s| s.store_errors += 1);
                warn!(job_id = %held.item.id, owner = %owner, error = %e, "heartbeat failed");
                Renewal::Unknown
            }
        }
    }

    /// Without a confirmed renewal for a full ttl, another worker may already
    /// have reclaimed the item.
    fn may_have_expired(&self, held: &Held) -> bool {
        held.confirmed_at.elapsed() >= self.config.lease_ttl
    }

    async fn finalize(
        &self,
        owner: &OwnerId,
        item: &JobItem,
        result: JobResult,
        report: &mut BatchReport,
    ) {
        let (outcome, error) = match result {
            JobResult::Success => (Outcome::Completed, None),
            JobResult::PermanentFailure(msg) => (Outcome::Failed, Some(msg)),
            JobResult::RetriableFailure(msg) if self.config.retry.should_retry(item.attempt_count) => {
                (Outcome::Requeued, Some(msg))
            }
            JobResult::RetriableFailure(msg) => {
                debug!(job_id = %item.id, attempts = item.attempt_count, "retries exhausted");
                (Outcome::Failed, Some(msg))
            }
        };

        let applied = match outcome {
            Outcome::Completed => self.manager.complete(owner, item.id).await,
            Outcome::Requeued => self.manager.fail_with_error(owner, item.id, false, error).await,
            Outcome::Failed => self.manager.fail_with_error(owner, item.id, true, error).await,
        };

        match applied {
            Ok(true) => {
                match outcome {
                    Outcome::Completed => report.succeeded += 1,
                    Outcome::Requeued => report.requeued += 1,
                    Outcome::Failed => report.failed += 1,
                }
                self.update_stats(|s| match outcome {
                    Outcome::Completed => s.succeeded += 1,
                    Outcome::Requeued => s.requeued += 1,
                    Outcome::Failed => s.failed_permanently += 1,
                });
            }
            Ok(false) => {
                report.lost += 1;
                warn!(
                    job_id = %item.id,
                    owner = %owner,
                    outcome = ?outcome,
                    "lease lost before result was recorded; result discarded"
                );
            }
            Err(e) => {
                report.store_errors += 1;
                warn!(
                    job_id = %item.id,
                    owner = %owner,
                    outcome = ?outcome,
                    error = %e,
                    "could not record result; item will be retried after its lease expires"
                );
            }
        }
    }

    fn update_stats(&self, f: impl FnOnce(&mut WorkerStats)) {
        f(&mut lock_stats(&self.stats));
    }
}

fn lock_stats(stats: &Mutex<WorkerStats>) -> std::sync::MutexGuard<'_, WorkerStats> {
    stats.lock().unwrap_or_else(|p| p.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use workhorse_core::{JobStatus, ManualClock};

    use crate::store::InMemoryLeaseStore;
    use crate::worker::{PollBackoff, RetryPolicy, handler_fn};

    type Manager = LeaseManager<Arc<InMemoryLeaseStore>>;

    fn manager_with(clock: &ManualClock) -> Arc<Manager> {
        Arc::new(LeaseManager::new(InMemoryLeaseStore::arc()).with_clock(Arc::new(clock.clone())))
    }

    fn config() -> WorkerConfig {
        WorkerConfig::default()
            .with_owner("test-worker")
            .with_batch_size(10)
            .with_lease_ttl(Duration::from_secs(5))
            .with_heartbeat_interval(Duration::from_millis(20))
            .with_idle_backoff(PollBackoff::immediate())
            .with_retry_policy(RetryPolicy::fixed(3, Duration::ZERO))
    }

    fn keys(ks: &[&str]) -> Vec<String> {
        ks.iter().map(|k| k.to_string()).collect()
    }

    async fn wait_for(mut check: impl FnMut() -> bool) {
        for _ in 0..500 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn run_once_completes_every_claimed_item() {
        let manager = manager_with(&ManualClock::starting_now());
        manager.enqueue(&keys(&["a", "b", "c"])).await.unwrap();

        let runtime = WorkerRuntime::new(
            manager.clone(),
            handler_fn(|_job| async { JobResult::Success }),
            config(),
        );
        let report = runtime.run_once().await.unwrap();

        assert_eq!(report.claimed, 3);
        assert_eq!(report.succeeded, 3);
        assert_eq!(manager.stats().await.unwrap().completed, 3);
        assert_eq!(runtime.stats().processed, 3);
        assert_eq!(runtime.run_once().await.unwrap(), BatchReport::default());
    }

    #[tokio::test]
    async fn retriable_failures_are_requeued_until_attempts_run_out() {
        let manager = manager_with(&ManualClock::starting_now());
        let item = manager.enqueue(&keys(&["flaky"])).await.unwrap().remove(0);
        let runtime = WorkerRuntime::new(
            manager.clone(),
            handler_fn(|_job| async { JobResult::RetriableFailure("timeout".into()) }),
            config(),
        );

        assert_eq!(runtime.run_once().await.unwrap().requeued, 1);
        assert_eq!(runtime.run_once().await.unwrap().requeued, 1);
        assert_eq!(runtime.run_once().await.unwrap().failed, 1);

        let stored = manager.get(item.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Failed);
        assert_eq!(stored.attempt_count, 3);
        assert_eq!(stored.last_error.as_deref(), Some("timeout"));
    }

    #[tokio::test]
    async fn permanent_failure_skips_retries() {
        let manager = manager_with(&ManualClock::starting_now());
        let item = manager.enqueue(&keys(&["gone"])).await.unwrap().remove(0);
        let runtime = WorkerRuntime::new(
            manager.clone(),
            handler_fn(|_job| async { JobResult::PermanentFailure("404".into()) }),
            config(),
        );

        assert_eq!(runtime.run_once().await.unwrap().failed, 1);
        let stored = manager.get(item.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Failed);
        assert_eq!(stored.attempt_count, 1);
    }

    #[tokio::test]
    async fn requeued_item_waits_for_retry_delay() {
        let clock = ManualClock::starting_now();
        let manager = manager_with(&clock);
        manager.enqueue(&keys(&["x"])).await.unwrap();
        let runtime = WorkerRuntime::new(
            manager.clone(),
            handler_fn(|_job| async { JobResult::RetriableFailure("busy".into()) }),
            config().with_retry_policy(RetryPolicy::fixed(3, Duration::from_secs(60))),
        );

        assert_eq!(runtime.run_once().await.unwrap().requeued, 1);
        assert_eq!(runtime.run_once().await.unwrap().claimed, 0);

        clock.advance(chrono::Duration::seconds(61));
        assert_eq!(runtime.run_once().await.unwrap().claimed, 1);
    }

    #[tokio::test]
    async fn lost_lease_drops_the_handler_and_discards_its_result() {
        let clock = ManualClock::starting_now();
        let manager = manager_with(&clock);
        let item = manager.enqueue(&keys(&["slow"])).await.unwrap().remove(0);

        let runtime = WorkerRuntime::new(
            manager.clone(),
            handler_fn(|_job| async {
                tokio::time::sleep(Duration::from_secs(30)).await;
                JobResult::Success
            }),
            config().with_heartbeat_interval(Duration::from_millis(50)),
        );
        let task = tokio::spawn(async move { runtime.run_once().await });

        let probe = manager.clone();
        wait_for(|| probe.metrics().snapshot().claims_granted == 1).await;

        // Expire the lease and let another worker reclaim it before the next heartbeat.
        clock.advance(chrono::Duration::seconds(6));
        let stolen = manager
            .claim(&OwnerId::from("other"), 1, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(stolen.len(), 1);

        let report = task.await.unwrap().unwrap();
        assert_eq!(report.lost, 1);
        assert_eq!(report.succeeded, 0);

        let stored = manager.get(item.id).await.unwrap().unwrap();
        assert_eq!(stored.owner, Some(OwnerId::from("other")));
        assert_eq!(stored.status, JobStatus::Leased);
    }

    #[tokio::test]
    async fn heartbeat_keeps_long_jobs_leased() {
        let manager = Arc::new(LeaseManager::new(InMemoryLeaseStore::arc()));
        manager.enqueue(&keys(&["long"])).await.unwrap();

        let runtime = WorkerRuntime::new(
            manager.clone(),
            handler_fn(|_job| async {
                tokio::time::sleep(Duration::from_millis(400)).await;
                JobResult::Success
            }),
            config()
                .with_lease_ttl(Duration::from_millis(150))
                .with_heartbeat_interval(Duration::from_millis(40)),
        );
        let task = tokio::spawn(async move { runtime.run_once().await });

        tokio::time::sleep(Duration::from_millis(250)).await;
        let stolen = manager
            .claim(&OwnerId::from("other"), 1, Duration::from_secs(5))
            .await
            .unwrap();
        assert!(stolen.is_empty());

        let report = task.await.unwrap().unwrap();
        assert_eq!(report.succeeded, 1);
        assert!(manager.metrics().snapshot().renewals >= 3);
    }

    #[tokio::test]
    async fn shutdown_finishes_in_flight_item_and_releases_the_rest() {
        let manager = manager_with(&ManualClock::starting_now());
        manager.enqueue(&keys(&["a", "b", "c"])).await.unwrap();

        let handle = WorkerRuntime::new(
            manager.clone(),
            handler_fn(|_job| async {
                tokio::time::sleep(Duration::from_millis(100)).await;
                JobResult::Success
            }),
            config().with_batch_size(3),
        )
        .spawn()
        .unwrap();

        wait_for(|| handle.stats().current_running == 1).await;
        handle.shutdown().await;

        let stats = manager.stats().await.unwrap();
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.pending, 2);
        assert_eq!(stats.leased, 0);
        assert_eq!(manager.metrics().snapshot().releases, 2);
    }

    #[tokio::test]
    async fn store_outage_backs_off_and_recovers() {
        let manager = manager_with(&ManualClock::starting_now());
        manager.enqueue(&keys(&["a"])).await.unwrap();
        manager.store().set_unavailable(true);

        let handle = WorkerRuntime::new(
            manager.clone(),
            handler_fn(|_job| async { JobResult::Success }),
            config().with_concurrency(2),
        )
        .spawn()
        .unwrap();

        wait_for(|| handle.stats().store_errors >= 4).await;
        manager.store().set_unavailable(false);
        wait_for(|| handle.stats().succeeded == 1).await;
        handle.shutdown().await;

        assert_eq!(manager.stats().await.unwrap().completed, 1);
    }

    #[tokio::test]
    async fn spawn_rejects_invalid_config() {
        let manager = manager_with(&ManualClock::starting_now());
        let err = WorkerRuntime::new(
            manager,
            handler_fn(|_job| async { JobResult::Success }),
            config().with_concurrency(0),
        )
        .spawn()
        .unwrap_err();

        assert!(matches!(err, workhorse_core::LeaseError::InvalidArgument(_)));
    }
}
