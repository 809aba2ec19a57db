use thiserror::Error;

/// Failures from the account, DNS and messaging collaborators. None of these
/// are fatal to the lease itself.
#[derive(Debug, Error)]
pub enum ProvisioningError {
    #[error("failed to create account {username} on {system}: {reason}")]
    CreateAccount {
        system: String,
        username: String,
        reason: String,
    },
    #[error("failed to delete account {username} on {system}: {reason}")]
    DeleteAccount {
        system: String,
        username: String,
        reason: String,
    },
    #[error("dns update for {domain} failed: {reason}")]
    Dns { domain: String, reason: String },
    #[error("failed to message {user}: {reason}")]
    Messaging { user: String, reason: String },
    #[error("network {network} has {found} reserved addresses, at least 4 are required")]
    NotEnoughAddresses { network: String, found: usize },
    #[error("lease {0} has no topology")]
    NoTopology(String),
}

impl ProvisioningError {
    /// the failure happened on an account system, a human has to look at it
    pub fn is_account(&self) -> bool {
        matches!(
            self,
            ProvisioningError::CreateAccount { .. } | ProvisioningError::DeleteAccount { .. }
        )
    }
}

/// Shorthand result alias for provisioning operations.
pub type ProvisioningResult<T> = Result<T, ProvisioningError>;
