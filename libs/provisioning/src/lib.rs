//! # provisioning
//!
//! Collaborator interfaces the lease manager drives once a lease is
//! fulfilled: account minting on the backing systems, DNS records for the
//! lease VIPs, and direct messages to the lease owner. Also holds the pieces
//! that don't talk to anything: credential generation and rendering of the
//! details message.
#![warn(
    missing_debug_implementations,
    rust_2018_idioms,
    non_snake_case,
    non_upper_case_globals
)]
use std::{fmt, net::IpAddr};

use async_trait::async_trait;

pub mod credentials;
pub mod details;
pub mod dry_run;
pub mod error;

pub use config::AdminCredentials;
pub use credentials::Credentials;
pub use error::{ProvisioningError, ProvisioningResult};

/// Everything needed to mint one account.
#[derive(Clone, Copy)]
pub struct AccountRequest<'a> {
    pub domain: &'a str,
    pub admin: &'a AdminCredentials,
    pub username: &'a str,
    pub password: &'a str,
    pub group: &'a str,
}

impl fmt::Debug for AccountRequest<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccountRequest")
            .field("domain", &self.domain)
            .field("admin", self.admin)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("group", &self.group)
            .finish()
    }
}

/// Creates and removes accounts on a backing system (ex. a vCenter SSO domain).
#[async_trait]
pub trait AccountManager: Send + Sync + fmt::Debug + 'static {
    /// idempotent, an existing account is not an error
    async fn create_account(&self, system: &str, request: AccountRequest<'_>)
    -> ProvisioningResult<()>;

    async fn delete_account(
        &self,
        system: &str,
        username: &str,
        admin: &AdminCredentials,
    ) -> ProvisioningResult<()>;
}

/// The two VIPs a lease's cluster needs names for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Vips {
    pub api: IpAddr,
    pub ingress: IpAddr,
}

/// Manages the A records for one lease's cluster domain.
#[async_trait]
pub trait DnsRecords: Send + Sync + fmt::Debug + 'static {
    /// create or replace the records under `domain_name`
    async fn upsert_records(&self, vips: Vips, domain_name: &str) -> ProvisioningResult<()>;

    async fn delete_records(&self, vips: Vips, domain_name: &str) -> ProvisioningResult<()>;
}

/// Delivers a direct message to a user.
#[async_trait]
pub trait Messenger: Send + Sync + fmt::Debug + 'static {
    async fn send_direct_message(&self, user: &str, content: &str) -> ProvisioningResult<()>;
}

/// The records created for a cluster domain:
/// `api.` and `api-int.` point at the API VIP, `*.apps.` at the ingress VIP.
pub fn record_set(vips: Vips, domain_name: &str) -> Vec<(String, IpAddr)> {
    let domain = domain_name.trim_end_matches('.');
    vec![
        (format!("api.{domain}"), vips.api),
        (format!("api-int.{domain}"), vips.api),
        (format!("*.apps.{domain}"), vips.ingress),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_set() {
        let vips = Vips {
            api: "192.168.100.3".parse().unwrap(),
            ingress: "192.168.100.4".parse().unwrap(),
        };
        let records = record_set(vips, "user-lease-abcde.ci.example.com.");
        assert_eq!(
            records,
            vec![
                ("api.user-lease-abcde.ci.example.com".to_owned(), vips.api),
                ("api-int.user-lease-abcde.ci.example.com".to_owned(), vips.api),
                ("*.apps.user-lease-abcde.ci.example.com".to_owned(), vips.ingress),
            ]
        );
    }

    #[test]
    fn test_account_request_redacts_password() {
        let admin = AdminCredentials::new("admin", "adminpass");
        let req = AccountRequest {
            domain: "ci.example.com",
            admin: &admin,
            username: "user-lease-abcde",
            password: "s3cr3t-pass",
            group: "CI",
        };
        let s = format!("{req:?}");
        assert!(!s.contains("s3cr3t-pass"));
        assert!(!s.contains("adminpass"));
    }
}
