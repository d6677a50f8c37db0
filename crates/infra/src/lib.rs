//! Infrastructure layer: lease stores, the lease protocol, and the worker runtime.
//!
//! - [`store`]: atomic primitives over the job ledger and lock table
//!   (PostgreSQL, in-memory)
//! - [`lease`]: claim / renew / complete / fail / release
//! - [`mutex`]: named resource locks with staleness takeover
//! - [`worker`]: execution units driving an injected job handler
//! - [`config`]: environment-driven settings

pub mod config;
pub mod lease;
pub mod mutex;
pub mod store;
pub mod worker;


pub use config::{ConfigError, SweeperConfig, WorkerConfig};
pub use lease::{LeaseManager, SweepReport};
pub use mutex::ResourceMutex;
pub use store::{InMemoryLeaseStore, LeaseStore, LockStore, PostgresLeaseStore};
pub use worker::{JobHandler, JobResult, PollBackoff, RetryPolicy, WorkerRuntime, handler_fn};
