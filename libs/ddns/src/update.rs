use std::{net::IpAddr, str::FromStr, sync::Arc, time::Duration};

use hickory_proto::{
    ProtoError,
    dnssec::tsig::TSigner,
    op::{Message, MessageType, OpCode, Query, ResponseCode, UpdateMessage},
    rr::{
        DNSClass, Name, RData, Record, RecordType,
        rdata::{A, AAAA},
    },
    runtime::TokioRuntimeProvider,
    udp::UdpClientStream,
    xfer::{DnsRequest, DnsRequestOptions, DnsRequestSender, FirstAnswer},
};
use tokio::sync::Mutex;
use tracing::{debug, error};

pub struct Updater {
    client: Mutex<UdpClientStream<TokioRuntimeProvider>>,
}

impl std::fmt::Debug for Updater {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Updater").finish_non_exhaustive()
    }
}

impl Updater {
    pub async fn new(
        dst: std::net::SocketAddr,
        timeout: Duration,
        tsig: Option<TSigner>,
    ) -> Result<Self, UpdateError> {
        let mut stream_builder = UdpClientStream::builder(dst, TokioRuntimeProvider::default())
            .with_timeout(Some(timeout));
        if let Some(tsig) = tsig {
            debug!("Added signer to stream {:?}", tsig.signer_name());
            stream_builder = stream_builder.with_signer(Some(Arc::new(tsig)));
        }

        let client = stream_builder.build().await?;

        Ok(Self {
            client: Mutex::new(client),
        })
    }

    /// send an update message, anything but NOERROR is an error
    pub async fn send(&self, message: Message) -> Result<(), UpdateError> {
        let request = DnsRequest::new(message, DnsRequestOptions::default());
        let resp = self.client.lock().await.send_message(request).first_answer().await?;
        if resp.response_code() == ResponseCode::NoError {
            Ok(())
        } else {
            error!(code = ?resp.response_code(), "dns update rejected");
            Err(UpdateError::ResponseCode(resp.response_code()))
        }
    }
}

impl Drop for Updater {
    fn drop(&mut self) {
        self.client.get_mut().shutdown();
    }
}

/// replace the address RRset of every name, one message for the whole set
pub fn upsert(
    zone_origin: Name,
    records: &[(String, IpAddr)],
    ttl: u32,
) -> Result<Message, UpdateError> {
    let mut message = update_msg(zone_origin);

    for (name, addr) in records {
        let name = fqdn(name)?;
        message.add_update(delete_rrset(name.clone(), record_type(addr)));
        message.add_update(Record::from_rdata(name, ttl, rdata(*addr)));
    }
    debug!("Created upsert message {:?}", message);
    Ok(message)
}

/// remove the address RRset of every name
pub fn delete(zone_origin: Name, records: &[(String, IpAddr)]) -> Result<Message, UpdateError> {
    let mut message = update_msg(zone_origin);

    for (name, addr) in records {
        message.add_update(delete_rrset(fqdn(name)?, record_type(addr)));
    }
    debug!("Created delete message {:?}", message);
    Ok(message)
}

// RFC 2136 2.5.2, class ANY + ttl 0 + empty rdata deletes the RRset
fn delete_rrset(name: Name, rr_type: RecordType) -> Record {
    let mut record = Record::update0(name, 0, rr_type);
    record.set_dns_class(DNSClass::ANY);
    record
}

fn record_type(addr: &IpAddr) -> RecordType {
    match addr {
        IpAddr::V4(_) => RecordType::A,
        IpAddr::V6(_) => RecordType::AAAA,
    }
}

fn rdata(addr: IpAddr) -> RData {
    match addr {
        IpAddr::V4(ip) => RData::A(A(ip)),
        IpAddr::V6(ip) => RData::AAAA(AAAA(ip)),
    }
}

pub fn fqdn(name: &str) -> Result<Name, UpdateError> {
    let mut name = Name::from_str(name)?;
    name.set_fqdn(true);
    Ok(name)
}

fn update_msg(zone_origin: Name) -> Message {
    let mut zone = Query::new();
    zone.set_name(zone_origin)
        .set_query_class(DNSClass::IN)
        .set_query_type(RecordType::SOA);

    let mut message = Message::new();
    message
        .set_id(rand::random())
        .set_message_type(MessageType::Query)
        .set_op_code(OpCode::Update)
        .set_recursion_desired(false);

    message.add_zone(zone);
    message
}

#[derive(thiserror::Error, Debug)]
pub enum UpdateError {
    #[error("got {0:?} instead of NoError")]
    ResponseCode(ResponseCode),
    #[error("dns client error {0}")]
    Proto(#[from] ProtoError),
}

#[cfg(test)]
mod test {
    use super::*;

    fn records() -> Vec<(String, IpAddr)> {
        vec![
            ("api.lease.ci.example.com".to_owned(), "10.0.0.3".parse().unwrap()),
            ("api-int.lease.ci.example.com".to_owned(), "10.0.0.3".parse().unwrap()),
            ("*.apps.lease.ci.example.com".to_owned(), "10.0.0.4".parse().unwrap()),
        ]
    }

    #[test]
    fn test_upsert_msg() {
        let zone = fqdn("ci.example.com").unwrap();
        let msg = upsert(zone.clone(), &records(), 300).unwrap();
        assert_eq!(msg.op_code(), OpCode::Update);
        assert_eq!(msg.queries()[0].name(), &zone);
        // a delete + add per name
        assert_eq!(msg.updates().len(), 6);

        let del = &msg.updates()[0];
        assert_eq!(del.dns_class(), DNSClass::ANY);
        assert_eq!(del.ttl(), 0);
        let add = &msg.updates()[1];
        assert_eq!(add.ttl(), 300);
        assert_eq!(add.record_type(), RecordType::A);
        assert_eq!(add.name(), &fqdn("api.lease.ci.example.com").unwrap());
    }

    #[test]
    fn test_delete_msg() {
        let zone = fqdn("ci.example.com").unwrap();
        let msg = delete(zone, &records()).unwrap();
        assert_eq!(msg.updates().len(), 3);
        assert!(msg.updates().iter().all(|r| r.dns_class() == DNSClass::ANY));
        assert!(msg.updates()[2].name().is_wildcard());
    }

    #[test]
    fn test_v6_record_type() {
        let msg = upsert(
            fqdn("example.com").unwrap(),
            &[("api.example.com".to_owned(), "2001:db8::3".parse().unwrap())],
            300,
        )
        .unwrap();
        assert_eq!(msg.updates()[1].record_type(), RecordType::AAAA);
    }
}
