//! text sent to lease owners
use chrono::{DateTime, Utc};

pub const ALREADY_LEASED: &str = "you already have a lease";
pub const NO_LEASE: &str = "you dont have any leases";
pub const RESOURCES_DELETED: &str =
    "Your leases have been deleted. You may create another lease now.";

pub fn expiry_warning(expires_at: DateTime<Utc>, max_renewals: u32) -> String {
    format!(
        "your lease will expire at {expires_at}. you can renew your lease up to {max_renewals} times."
    )
}

pub fn account_failure(err: impl std::fmt::Display) -> String {
    format!("unable to create user: {err}")
}

pub fn dns_failure(err: impl std::fmt::Display) -> String {
    format!("unable to create DNS records. you'll need to create them yourself. {err}")
}
