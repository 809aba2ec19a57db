//! # ddns
//!
//! RFC 2136 dynamic updates for the records a lease's cluster needs,
//! optionally signed with TSIG.
#![warn(
    missing_debug_implementations,
    rust_2018_idioms,
    non_snake_case,
    non_upper_case_globals
)]
use async_trait::async_trait;
use base64::{Engine, prelude::BASE64_STANDARD};
use hickory_proto::{
    ProtoError,
    dnssec::{DnsSecError, rdata::tsig::TsigAlgorithm, tsig::TSigner},
    rr::Name,
};
use provisioning::{DnsRecords, ProvisioningError, ProvisioningResult, Vips, record_set};
use tracing::{debug, info};

pub mod update;

pub use crate::update::{UpdateError, Updater};

/// Sends the lease A records to a DNS server that accepts dynamic updates.
#[derive(Debug)]
pub struct DnsUpdater {
    updater: Updater,
    zone: Name,
    ttl: u32,
}

impl DnsUpdater {
    pub async fn new(cfg: &config::Dns, ttl: u32) -> Result<Self, DdnsError> {
        let signer = cfg.tsig.as_ref().map(tsigner).transpose()?;
        let zone = update::fqdn(&cfg.zone)?;
        info!(server = %cfg.server, %zone, signed = signer.is_some(), "dns updates enabled");
        Ok(Self {
            updater: Updater::new(cfg.server, cfg.timeout, signer).await?,
            zone,
            ttl,
        })
    }
}

#[async_trait]
impl DnsRecords for DnsUpdater {
    async fn upsert_records(&self, vips: Vips, domain_name: &str) -> ProvisioningResult<()> {
        let records = record_set(vips, domain_name);
        let msg = update::upsert(self.zone.clone(), &records, self.ttl)
            .map_err(|err| dns_err(domain_name, err))?;
        self.updater
            .send(msg)
            .await
            .map_err(|err| dns_err(domain_name, err))?;
        debug!(domain = domain_name, "upserted dns records");
        Ok(())
    }

    async fn delete_records(&self, vips: Vips, domain_name: &str) -> ProvisioningResult<()> {
        let records = record_set(vips, domain_name);
        let msg =
            update::delete(self.zone.clone(), &records).map_err(|err| dns_err(domain_name, err))?;
        self.updater
            .send(msg)
            .await
            .map_err(|err| dns_err(domain_name, err))?;
        debug!(domain = domain_name, "deleted dns records");
        Ok(())
    }
}

fn dns_err(domain: &str, err: UpdateError) -> ProvisioningError {
    ProvisioningError::Dns {
        domain: domain.to_owned(),
        reason: err.to_string(),
    }
}

#[derive(thiserror::Error, Debug)]
pub enum DdnsError {
    #[error(transparent)]
    Update(#[from] UpdateError),
    #[error(transparent)]
    Tsig(#[from] TsigError),
}

#[derive(thiserror::Error, Debug)]
pub enum TsigError {
    #[error("unsupported tsig algorithm {0:?}")]
    UnsupportedAlgorithm(String),
    #[error("invalid key name {0:?}")]
    KeyName(#[from] ProtoError),
    #[error("key not base64 {0:?}")]
    KeyNotBase64(#[from] base64::DecodeError),
    #[error("failed to create TSigner {0:?}")]
    TSignerFailed(#[from] DnsSecError),
}

/// tsig fudge in seconds
const FUDGE: u16 = 300;

pub fn tsigner(key: &config::TsigKey) -> Result<TSigner, TsigError> {
    let algorithm = match key.algorithm.to_ascii_lowercase().trim_end_matches('.') {
        "hmac-sha256" => TsigAlgorithm::HmacSha256,
        "hmac-sha384" => TsigAlgorithm::HmacSha384,
        "hmac-sha512" => TsigAlgorithm::HmacSha512,
        other => return Err(TsigError::UnsupportedAlgorithm(other.to_owned())),
    };
    let key_bin = BASE64_STANDARD
        .decode(key.data.as_bytes())
        .map_err(TsigError::KeyNotBase64)?;
    let name = Name::from_ascii(&key.name)?;

    let signer =
        TSigner::new(key_bin, algorithm, name, FUDGE).map_err(TsigError::TSignerFailed)?;
    Ok(signer)
}
