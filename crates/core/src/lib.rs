//! `workhorse-core`: lease protocol building blocks.
//!
//! This crate contains the **pure** parts of the protocol (no IO): identifiers,
//! the job ledger state machine, resource lock decisions, backoff curves, the
//! clock abstraction and the error taxonomy.

pub mod backoff;
pub mod clock;
pub mod error;
pub mod id;
pub mod ledger;
pub mod lock;

pub use backoff::{BackoffCurve, BackoffStrategy};
pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{LeaseError, LeaseResult};
pub use id::{JobId, OwnerId};
pub use ledger::{
    ClaimPredicate, ClaimedJob, JobItem, JobPatch, JobStatus, LeaseGrant, LedgerStats,
};
pub use lock::{AcquireDecision, AcquireOutcome, ResourceLock};
