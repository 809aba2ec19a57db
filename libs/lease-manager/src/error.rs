//! Error types for lease lifecycle operations.
//!
//! The first four variants are business-rule outcomes shown to the user as
//! is. Store failures are surfaced with a hint to try again, provisioning
//! failures never fail the lease itself.

use chrono::{DateTime, Utc};
use provisioning::ProvisioningError;
use resource_store::StoreError;
use thiserror::Error;

use crate::messages;

#[derive(Debug, Error)]
pub enum LeaseError {
    /// The user already holds a compute lease.
    #[error("{}", messages::ALREADY_LEASED)]
    AlreadyLeased,

    /// The user holds no lease.
    #[error("{}", messages::NO_LEASE)]
    NoLease,

    /// The requested pool does not exist.
    #[error("pool {0:?} not found")]
    PoolNotFound(String),

    /// The renewal counter is at its bound, the expiry is unchanged.
    #[error("the lease can not be renewed. it will expire at {expires_at}")]
    RenewalLimitExceeded { expires_at: DateTime<Utc> },

    /// Any get/list/create/update/delete failure.
    #[error("resource store error: {0}. you might want to try again")]
    ResourceStore(#[from] StoreError),

    /// Account or DNS failure.
    #[error(transparent)]
    Provisioning(#[from] ProvisioningError),

    /// The provisioning worker has shut down.
    #[error("provisioning queue is closed")]
    QueueClosed,
}

impl LeaseError {
    /// Returns true for outcomes that are explained to the user and never retried.
    pub fn is_business_rule(&self) -> bool {
        matches!(
            self,
            LeaseError::AlreadyLeased
                | LeaseError::NoLease
                | LeaseError::PoolNotFound(_)
                | LeaseError::RenewalLimitExceeded { .. }
        )
    }

    /// Returns true if this error indicates a transient failure that may
    /// succeed on retry.
    pub fn is_retryable(&self) -> bool {
        match self {
            LeaseError::ResourceStore(err) => err.is_retryable(),
            _ => false,
        }
    }
}

/// Shorthand result alias for lease operations.
pub type LeaseResult<T> = Result<T, LeaseError>;
