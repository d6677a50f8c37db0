//! Job leases: the claim / renew / finalize protocol over a [`crate::store::LeaseStore`].

pub mod manager;

pub use manager::{LeaseManager, SweepReport};
