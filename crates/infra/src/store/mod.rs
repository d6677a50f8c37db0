//! Lease store adapters: the atomic primitives the lease protocol is built on.
//!
//! Two implementations share the [`LeaseStore`]/[`LockStore`] traits:
//! - [`InMemoryLeaseStore`] for tests and single-process development
//! - [`PostgresLeaseStore`] for real multi-process deployments

pub mod in_memory;
pub mod postgres;
pub mod r#trait;

pub use in_memory::{GrantRecord, InMemoryLeaseStore};
pub use postgres::PostgresLeaseStore;
pub use r#trait::{LeaseStore, LockStore};
