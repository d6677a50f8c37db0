//! Job handler seam.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;

use workhorse_core::JobItem;

/// Result of job execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobResult {
    /// Job completed successfully
    Success,
    /// Retrying cannot help (bad input, missing resource)
    PermanentFailure(String),
    /// Transient problem; the item may be retried per the retry policy
    RetriableFailure(String),
}

/// Executes one leased item.
///
/// ## Implementation Requirements
///
/// Handlers must be idempotent: an item can run again after a crash, after a
/// lost lease, or after its result failed to be recorded. The future may be
/// dropped at any await point when the worker loses the lease.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn execute(&self, job: &JobItem) -> JobResult;
}

#[async_trait]
impl<H> JobHandler for Arc<H>
where
    H: JobHandler + ?Sized,
{
    async fn execute(&self, job: &JobItem) -> JobResult {
        (**self).execute(job).await
    }
}

/// Adapter turning an async closure into a [`JobHandler`].
pub struct FnHandler<F>(F);

/// Wrap `f` as a [`JobHandler`]. The closure receives an owned copy of the item.
pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(JobItem) -> Fut + Send + Sync,
    Fut: Future<Output = JobResult> + Send,
{
    FnHandler(f)
}

#[async_trait]
impl<F, Fut> JobHandler for FnHandler<F>
where
    F: Fn(JobItem) -> Fut + Send + Sync,
    Fut: Future<Output = JobResult> + Send,
{
    async fn execute(&self, job: &JobItem) -> JobResult {
        (self.0)(job.clone()).await
    }
}
