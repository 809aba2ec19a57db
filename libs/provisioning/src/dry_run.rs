//! collaborators that only log, used when no backend is configured
use async_trait::async_trait;
use tracing::info;

use crate::{
    AccountManager, AccountRequest, AdminCredentials, DnsRecords, Messenger, ProvisioningResult,
    Vips, record_set,
};

#[derive(Debug, Default, Clone, Copy)]
pub struct DryRunAccounts;

#[async_trait]
impl AccountManager for DryRunAccounts {
    async fn create_account(
        &self,
        system: &str,
        request: AccountRequest<'_>,
    ) -> ProvisioningResult<()> {
        info!(
            system,
            username = request.username,
            group = request.group,
            domain = request.domain,
            "dry run: would create account"
        );
        Ok(())
    }

    async fn delete_account(
        &self,
        system: &str,
        username: &str,
        _admin: &AdminCredentials,
    ) -> ProvisioningResult<()> {
        info!(system, username, "dry run: would delete account");
        Ok(())
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct DryRunDns;

#[async_trait]
impl DnsRecords for DryRunDns {
    async fn upsert_records(&self, vips: Vips, domain_name: &str) -> ProvisioningResult<()> {
        for (name, addr) in record_set(vips, domain_name) {
            info!(%name, %addr, "dry run: would upsert A record");
        }
        Ok(())
    }

    async fn delete_records(&self, vips: Vips, domain_name: &str) -> ProvisioningResult<()> {
        for (name, addr) in record_set(vips, domain_name) {
            info!(%name, %addr, "dry run: would delete A record");
        }
        Ok(())
    }
}

/// writes direct messages to the log instead of delivering them
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingMessenger;

#[async_trait]
impl Messenger for TracingMessenger {
    async fn send_direct_message(&self, user: &str, content: &str) -> ProvisioningResult<()> {
        info!(user, %content, "direct message");
        Ok(())
    }
}
