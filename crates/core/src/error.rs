//! Lease protocol error model.
//!
//! Only infrastructure failures and caller misuse are errors. Losing a lease or
//! finding a resource busy are expected outcomes under concurrency and are
//! reported as ordinary values (`false`, [`crate::AcquireOutcome::Busy`]).

use thiserror::Error;

/// Result type used across the lease protocol.
pub type LeaseResult<T> = Result<T, LeaseError>;

/// Lease protocol error.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LeaseError {
    /// The shared store could not be reached or the transaction failed.
    ///
    /// Lease state is unknown: the caller backs off and retries the same
    /// operation. It must not assume the lease was granted or lost.
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    /// A stored row could not be decoded (e.g. unknown status value).
    #[error("corrupt row: {0}")]
    Corrupt(String),

    /// The caller passed an argument the protocol cannot honor.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A cancellable wait was abandoned by its caller.
    #[error("cancelled while waiting for {0}")]
    Cancelled(String),
}

impl LeaseError {
    pub fn unavailable(msg: impl Into<String>) -> Self {
        Self::StoreUnavailable(msg.into())
    }

    pub fn corrupt(msg: impl Into<String>) -> Self {
        Self::Corrupt(msg.into())
    }

    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    /// True for transient failures where retrying later may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::StoreUnavailable(_))
    }
}
