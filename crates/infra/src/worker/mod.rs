//! Worker runtime: execution units that claim, run and finalize job items.
//!
//! ## Components
//!
//! - `JobHandler`: the injected callback that does the actual work
//! - `RetryPolicy`: when a retriable failure is requeued and how long it waits
//! - `PollBackoff`: idle and store-outage back-off
//! - `WorkerRuntime`: spawns execution units and exposes `run_once`

pub mod handler;
pub mod policy;
pub mod runtime;

pub use handler::{FnHandler, JobHandler, JobResult, handler_fn};
pub use policy::{PollBackoff, RetryPolicy};
pub use runtime::{BatchReport, WorkerRuntime, WorkerRuntimeHandle, WorkerStats};
