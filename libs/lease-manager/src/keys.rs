//! Label and annotation keys carried on leases, plus typed accessors for them.
use provisioning::Credentials;
use resource_store::{Kind, Lease};

/// label + annotation naming the user a lease belongs to
pub const OWNER: &str = "leasekeeper/owner";
/// label holding the number of successful renewals
pub const RENEW_COUNT: &str = "leasekeeper/renew-count";
pub const DISABLE_PRUNING: &str = "leasekeeper/disable-pruning";
/// marks a zero-compute lease that only asks for an extra network segment
pub const NETWORK_ONLY: &str = "leasekeeper/network-only";
pub const DETAILS_SENT: &str = "leasekeeper/details-sent";
pub const NETWORK_DETAILS_SENT: &str = "leasekeeper/network-details-sent";
pub const TEMP_USERNAME: &str = "leasekeeper/temporary-username";
pub const TEMP_PASSWORD: &str = "leasekeeper/temporary-password";
/// set once an account exists on every configured system
pub const ACCOUNTS_CREATED: &str = "leasekeeper/accounts-created";
/// set once the DNS upsert was attempted, the owner is told about a failure
pub const DNS_REQUESTED: &str = "leasekeeper/dns-requested";

/// prefix for the store generated lease names
pub const GENERATE_NAME: &str = "user-lease-";

/// Accessors for the flags above.
pub trait LeaseExt {
    fn owner(&self) -> Option<&str>;
    fn is_network_only(&self) -> bool;
    fn renew_count(&self) -> u32;
    fn pruning_disabled(&self) -> bool;
    fn credentials(&self) -> Option<Credentials>;
    /// true once the message for this lease class went out
    fn details_sent(&self) -> bool;
    /// name of the bound `Network`, if the scheduler set one
    fn network_name(&self) -> Option<&str>;

    fn has_credentials(&self) -> bool {
        self.credentials().is_some()
    }

    /// Fulfilled and still missing the first provisioning step for its class.
    fn needs_provisioning(&self) -> bool;
}

impl LeaseExt for Lease {
    fn owner(&self) -> Option<&str> {
        self.meta.annotation(OWNER).filter(|owner| !owner.is_empty())
    }

    fn is_network_only(&self) -> bool {
        self.meta.flag(NETWORK_ONLY)
    }

    fn renew_count(&self) -> u32 {
        // an unparsable counter is treated as unrenewed
        self.meta
            .label(RENEW_COUNT)
            .and_then(|count| count.parse().ok())
            .unwrap_or(0)
    }

    fn pruning_disabled(&self) -> bool {
        self.meta.flag(DISABLE_PRUNING)
    }

    fn credentials(&self) -> Option<Credentials> {
        let username = self.meta.annotation(TEMP_USERNAME)?;
        let password = self.meta.annotation(TEMP_PASSWORD)?;
        if username.is_empty() || password.is_empty() {
            return None;
        }
        Some(Credentials {
            username: username.to_owned(),
            password: password.to_owned(),
        })
    }

    fn details_sent(&self) -> bool {
        if self.is_network_only() {
            self.meta.flag(NETWORK_DETAILS_SENT)
        } else {
            self.meta.flag(DETAILS_SENT)
        }
    }

    fn network_name(&self) -> Option<&str> {
        self.meta
            .owner(Kind::Network)
            .map(|owner| owner.name.as_str())
    }

    fn needs_provisioning(&self) -> bool {
        if !self.is_fulfilled() || self.meta.is_deleting() || self.owner().is_none() {
            return false;
        }
        if self.is_network_only() {
            !self.details_sent()
        } else {
            !self.has_credentials()
        }
    }
}
