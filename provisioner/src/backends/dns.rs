// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Dynamic DNS client: RFC 2136 updates and AXFR zone imports over TCP,
//! optionally signed with a TSIG key.

use super::DnsRecord;
use super::NameService;
use super::RecordInfo;
use super::RecordType;
use super::UpdateStatus;
use crate::config::DnsConfig;
use crate::config::DnsZoneConfig;
use crate::config::TsigKeyAlgorithm;
use crate::error::DnsError;
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use hickory_proto::dnssec::rdata::tsig::TsigAlgorithm;
use hickory_proto::dnssec::tsig::TSigner;
use hickory_proto::op::Message;
use hickory_proto::op::MessageType;
use hickory_proto::op::OpCode;
use hickory_proto::op::Query;
use hickory_proto::op::ResponseCode;
use hickory_proto::rr::rdata::A;
use hickory_proto::rr::rdata::AAAA;
use hickory_proto::rr::rdata::CNAME;
use hickory_proto::rr::rdata::MX;
use hickory_proto::rr::rdata::PTR;
use hickory_proto::rr::rdata::SRV;
use hickory_proto::rr::rdata::TXT;
use hickory_proto::rr::DNSClass;
use hickory_proto::rr::Name;
use hickory_proto::rr::RData;
use hickory_proto::rr::Record;
use hickory_proto::rr::RecordType as WireType;
use hickory_proto::serialize::binary::BinDecodable;
use hickory_proto::serialize::binary::BinEncodable;
use slog::debug;
use slog::o;
use slog::Logger;
use std::collections::BTreeMap;
use std::fmt;
use std::net::IpAddr;
use std::net::SocketAddr;
use std::time::Duration;
use std::time::SystemTime;
use std::time::UNIX_EPOCH;
use tokio::io::AsyncReadExt;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;

const DNS_PORT: u16 = 53;

/// Allowed clock skew between us and the server for TSIG, in seconds.
const TSIG_FUDGE: u16 = 300;

/// One configured zone: where its updates go and how they are signed.
struct ZoneEndpoint {
    origin: Name,
    server: String,
    signer: Option<TSigner>,
}

impl ZoneEndpoint {
    fn new(
        zone: &str,
        config: &DnsZoneConfig,
    ) -> Result<ZoneEndpoint, DnsError> {
        let apex = format!("{}.", zone.trim_end_matches('.'));
        let origin =
            Name::from_ascii(apex).map_err(|e| DnsError::InvalidRecord {
                name: zone.to_string(),
                message: e.to_string(),
            })?;
        Ok(ZoneEndpoint {
            origin,
            server: server_address(&config.server),
            signer: signer(zone, config)?,
        })
    }

    fn message(&self, op_code: OpCode, query_type: WireType) -> Message {
        let mut query = Query::query(self.origin.clone(), query_type);
        query.set_query_class(DNSClass::IN);
        let mut message = Message::new();
        message
            .set_id(rand::random())
            .set_message_type(MessageType::Query)
            .set_op_code(op_code)
            .set_recursion_desired(false)
            .add_query(query);
        message
    }

    fn sign(&self, zone: &str, message: &mut Message) -> Result<(), DnsError> {
        let Some(signer) = &self.signer else {
            return Ok(());
        };
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_err(|e| transport_error(zone, e))?
            .as_secs();
        let now = now
            .try_into()
            .map_err(|_| transport_error(zone, "system time out of range"))?;
        message.finalize(signer, now).map_err(|e| transport_error(zone, e))?;
        Ok(())
    }
}

/// Accepts `host`, `host:port`, or a bare address, defaulting the port.
fn server_address(server: &str) -> String {
    match server.parse::<IpAddr>() {
        Ok(ip) => SocketAddr::new(ip, DNS_PORT).to_string(),
        Err(_) if server.contains(':') => server.to_string(),
        Err(_) => format!("{server}:{DNS_PORT}"),
    }
}

fn signer(
    zone: &str,
    config: &DnsZoneConfig,
) -> Result<Option<TSigner>, DnsError> {
    let invalid = |message: String| DnsError::InvalidKey {
        zone: zone.to_string(),
        message,
    };
    let (name, secret) = match (&config.key_name, &config.key_secret) {
        (Some(name), Some(secret)) => (name, secret),
        (None, None) => return Ok(None),
        _ => {
            return Err(invalid(String::from(
                "key_name and key_secret must be set together",
            )));
        }
    };
    let key = STANDARD.decode(secret).map_err(|e| invalid(e.to_string()))?;
    let name = Name::from_ascii(name).map_err(|e| invalid(e.to_string()))?;
    let algorithm = match config.key_algorithm {
        TsigKeyAlgorithm::HmacSha256 => TsigAlgorithm::HmacSha256,
        TsigKeyAlgorithm::HmacSha384 => TsigAlgorithm::HmacSha384,
        TsigKeyAlgorithm::HmacSha512 => TsigAlgorithm::HmacSha512,
    };
    TSigner::new(key, algorithm, name, TSIG_FUDGE)
        .map(Some)
        .map_err(|e| invalid(e.to_string()))
}

fn transport_error(zone: &str, error: impl fmt::Display) -> DnsError {
    DnsError::Transport { zone: zone.to_string(), message: error.to_string() }
}

/// The textual response code, as name servers spell it in their logs.
fn status_of(code: ResponseCode) -> UpdateStatus {
    match code {
        ResponseCode::NoError => UpdateStatus::noerror(),
        other => UpdateStatus(format!("{other:?}").to_ascii_uppercase()),
    }
}

/// Makes a zone-relative name (or `@` for the apex) absolute.
fn absolute(name: &str, origin: &Name) -> Result<Name, String> {
    if name == "@" {
        return Ok(origin.clone());
    }
    let name = Name::from_ascii(name).map_err(|e| e.to_string())?;
    if name.is_fqdn() {
        Ok(name)
    } else {
        name.append_domain(origin).map_err(|e| e.to_string())
    }
}

/// The inverse of [`absolute`]; names outside the zone stay absolute.
fn relative(name: &Name, origin: &Name) -> String {
    let name = name.to_lowercase().to_ascii();
    let origin = origin.to_lowercase().to_ascii();
    if name == origin {
        return String::from("@");
    }
    match name.strip_suffix(&format!(".{origin}")) {
        Some(host) => host.to_string(),
        None => name,
    }
}

/// Record data for `record`. An `A` record holding an IPv6 address is sent
/// as `AAAA`.
fn rdata(origin: &Name, record: &DnsRecord) -> Result<RData, DnsError> {
    let invalid = |message: String| DnsError::InvalidRecord {
        name: record.name.clone(),
        message,
    };
    let target = |s: &str| absolute(s, origin).map_err(invalid);
    let content = record.content.trim();
    let rdata = match record.record_type {
        RecordType::A => match content.parse::<IpAddr>() {
            Ok(IpAddr::V4(address)) => RData::A(A(address)),
            Ok(IpAddr::V6(address)) => RData::AAAA(AAAA(address)),
            Err(e) => return Err(invalid(e.to_string())),
        },
        RecordType::CNAME => RData::CNAME(CNAME(target(content)?)),
        RecordType::PTR => RData::PTR(PTR(target(content)?)),
        RecordType::MX => {
            let (preference, exchange) =
                content.split_once(char::is_whitespace).ok_or_else(|| {
                    invalid(String::from(
                        "expected \"<preference> <exchange>\"",
                    ))
                })?;
            let preference = preference
                .parse::<u16>()
                .map_err(|e| invalid(e.to_string()))?;
            RData::MX(MX::new(preference, target(exchange.trim())?))
        }
        RecordType::TXT => RData::TXT(TXT::new(vec![content.to_string()])),
        RecordType::SRV => {
            let fields: Vec<&str> = content.split_whitespace().collect();
            let [priority, weight, port, host] = fields[..] else {
                return Err(invalid(String::from(
                    "expected \"<priority> <weight> <port> <target>\"",
                )));
            };
            let number = |s: &str| {
                s.parse::<u16>().map_err(|e| invalid(format!("{s:?}: {e}")))
            };
            RData::SRV(SRV::new(
                number(priority)?,
                number(weight)?,
                number(port)?,
                target(host)?,
            ))
        }
    };
    Ok(rdata)
}

fn wire_record(origin: &Name, record: &DnsRecord) -> Result<Record, DnsError> {
    let name = absolute(&record.name, origin).map_err(|message| {
        DnsError::InvalidRecord { name: record.name.clone(), message }
    })?;
    Ok(Record::from_rdata(name, record.ttl, rdata(origin, record)?))
}

fn wire_type(record_type: RecordType) -> WireType {
    match record_type {
        RecordType::A => WireType::A,
        RecordType::CNAME => WireType::CNAME,
        RecordType::PTR => WireType::PTR,
        RecordType::MX => WireType::MX,
        RecordType::TXT => WireType::TXT,
        RecordType::SRV => WireType::SRV,
    }
}

/// Converts a transferred record; record types this crate does not manage
/// are skipped.
fn record_info(
    zone: &str,
    origin: &Name,
    record: &Record,
) -> Option<RecordInfo> {
    let record_type = match record.data() {
        RData::A(_) | RData::AAAA(_) => RecordType::A,
        RData::CNAME(_) => RecordType::CNAME,
        RData::PTR(_) => RecordType::PTR,
        RData::MX(_) => RecordType::MX,
        RData::TXT(_) => RecordType::TXT,
        RData::SRV(_) => RecordType::SRV,
        _ => return None,
    };
    Some(RecordInfo {
        zone: zone.to_string(),
        record: DnsRecord {
            name: relative(record.name(), origin),
            record_type,
            content: record.data().to_string(),
            ttl: record.ttl(),
        },
    })
}

async fn send(stream: &mut TcpStream, message: &Message) -> Result<(), String> {
    let bytes = message.to_vec().map_err(|e| e.to_string())?;
    let len = u16::try_from(bytes.len())
        .map_err(|_| format!("message of {} bytes is too long", bytes.len()))?;
    stream.write_u16(len).await.map_err(|e| e.to_string())?;
    stream.write_all(&bytes).await.map_err(|e| e.to_string())?;
    stream.flush().await.map_err(|e| e.to_string())
}

async fn receive(stream: &mut TcpStream, id: u16) -> Result<Message, String> {
    let len = stream.read_u16().await.map_err(|e| e.to_string())?;
    let mut bytes = vec![0; usize::from(len)];
    stream.read_exact(&mut bytes).await.map_err(|e| e.to_string())?;
    let message = Message::from_vec(&bytes).map_err(|e| e.to_string())?;
    if message.id() != id {
        return Err(format!(
            "response id {} does not match request id {id}",
            message.id()
        ));
    }
    Ok(message)
}

/// [`NameService`] speaking the DNS protocol to each zone's primary server.
pub struct DnsUpdateClient {
    log: Logger,
    timeout: Duration,
    zones: BTreeMap<String, ZoneEndpoint>,
}

impl fmt::Debug for DnsUpdateClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DnsUpdateClient")
            .field("timeout", &self.timeout)
            .field("zones", &self.zones.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl DnsUpdateClient {
    pub fn new(
        log: &Logger,
        config: &DnsConfig,
    ) -> Result<DnsUpdateClient, DnsError> {
        let zones = config
            .zones
            .iter()
            .map(|(zone, zone_config)| {
                Ok((zone.clone(), ZoneEndpoint::new(zone, zone_config)?))
            })
            .collect::<Result<_, DnsError>>()?;
        Ok(DnsUpdateClient {
            log: log.new(o!("component" => "DnsUpdateClient")),
            timeout: config.timeout(),
            zones,
        })
    }

    fn endpoint(&self, zone: &str) -> Result<&ZoneEndpoint, DnsError> {
        self.zones
            .get(zone)
            .ok_or_else(|| DnsError::ZoneNotConfigured(zone.to_string()))
    }

    async fn connect(
        &self,
        zone: &str,
        endpoint: &ZoneEndpoint,
    ) -> Result<TcpStream, DnsError> {
        TcpStream::connect(&endpoint.server).await.map_err(|e| {
            transport_error(zone, format!("{}: {e}", endpoint.server))
        })
    }

    /// Sends one update carrying `updates` in its update section.
    async fn update(
        &self,
        zone: &str,
        updates: Vec<Record>,
    ) -> Result<UpdateStatus, DnsError> {
        let endpoint = self.endpoint(zone)?;
        let mut message = endpoint.message(OpCode::Update, WireType::SOA);
        for record in updates {
            message.add_name_server(record);
        }
        endpoint.sign(zone, &mut message)?;

        let exchange = async {
            let mut stream = self.connect(zone, endpoint).await?;
            send(&mut stream, &message)
                .await
                .map_err(|e| transport_error(zone, e))?;
            let response = receive(&mut stream, message.id())
                .await
                .map_err(|e| transport_error(zone, e))?;
            Ok::<_, DnsError>(response)
        };
        let response = tokio::time::timeout(self.timeout, exchange)
            .await
            .map_err(|_| {
                transport_error(
                    zone,
                    format!("no answer within {:?}", self.timeout),
                )
            })??;
        let status = status_of(response.response_code());
        debug!(self.log, "update answered";
            "zone" => zone, "status" => &status.0);
        Ok(status)
    }

    /// Transfers the zone, keeping the records between the opening and
    /// closing SOA.
    async fn transfer(&self, zone: &str) -> Result<Vec<RecordInfo>, DnsError> {
        let endpoint = self.endpoint(zone)?;
        let mut message = endpoint.message(OpCode::Query, WireType::AXFR);
        endpoint.sign(zone, &mut message)?;

        let exchange = async {
            let mut stream = self.connect(zone, endpoint).await?;
            send(&mut stream, &message)
                .await
                .map_err(|e| transport_error(zone, e))?;
            let mut records = Vec::new();
            let mut soa_seen = 0;
            while soa_seen < 2 {
                let response = receive(&mut stream, message.id())
                    .await
                    .map_err(|e| transport_error(zone, e))?;
                if response.response_code() != ResponseCode::NoError {
                    return Err(DnsError::Rejected {
                        zone: zone.to_string(),
                        status: status_of(response.response_code()).0,
                    });
                }
                if response.answers().is_empty() {
                    return Err(transport_error(
                        zone,
                        "zone transfer ended before the closing SOA",
                    ));
                }
                for record in response.answers() {
                    if record.record_type() == WireType::SOA {
                        soa_seen += 1;
                    } else if let Some(info) =
                        record_info(zone, &endpoint.origin, record)
                    {
                        records.push(info);
                    }
                }
            }
            Ok::<_, DnsError>(records)
        };
        let records = tokio::time::timeout(self.timeout, exchange)
            .await
            .map_err(|_| {
                transport_error(
                    zone,
                    format!("transfer not done within {:?}", self.timeout),
                )
            })??;
        debug!(self.log, "zone transferred";
            "zone" => zone, "records" => records.len());
        Ok(records)
    }
}

#[async_trait]
impl NameService for DnsUpdateClient {
    async fn add_record(
        &self,
        zone: &str,
        record: &DnsRecord,
    ) -> Result<UpdateStatus, DnsError> {
        let endpoint = self.endpoint(zone)?;
        let add = wire_record(&endpoint.origin, record)?;
        self.update(zone, vec![add]).await
    }

    async fn update_record(
        &self,
        zone: &str,
        record: &DnsRecord,
    ) -> Result<UpdateStatus, DnsError> {
        let endpoint = self.endpoint(zone)?;
        let add = wire_record(&endpoint.origin, record)?;
        // Delete the whole RRset (class ANY, empty rdata) before adding.
        let mut delete = Record::from_rdata(
            add.name().clone(),
            0,
            RData::Update0(wire_type(record.record_type)),
        );
        delete.set_dns_class(DNSClass::ANY);
        self.update(zone, vec![delete, add]).await
    }

    async fn remove_record(
        &self,
        zone: &str,
        record: &DnsRecord,
    ) -> Result<UpdateStatus, DnsError> {
        let endpoint = self.endpoint(zone)?;
        // Class NONE deletes only the record with matching data.
        let mut delete = wire_record(&endpoint.origin, record)?;
        delete.set_ttl(0);
        delete.set_dns_class(DNSClass::NONE);
        self.update(zone, vec![delete]).await
    }

    async fn import_zone_records(
        &self,
        zone: &str,
    ) -> Result<Vec<RecordInfo>, DnsError> {
        self.transfer(zone).await
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::DnsZoneConfig;
    use crate::sim::test_setup_log;
    use assert_matches::assert_matches;
    use hickory_proto::rr::rdata::SOA;
    use tokio::net::TcpListener;
    use tokio::task::JoinHandle;

    const ZONE: &str = "example.com";

    /// A name server accepting one connection. Every request it reads is
    /// answered with the messages `respond` returns; the requests are handed
    /// back when the client hangs up.
    async fn name_server<F>(respond: F) -> (String, JoinHandle<Vec<Message>>)
    where
        F: Fn(&Message) -> Vec<Message> + Send + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        let handle = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut requests = Vec::new();
            while let Ok(len) = stream.read_u16().await {
                let mut bytes = vec![0; usize::from(len)];
                stream.read_exact(&mut bytes).await.unwrap();
                let request = Message::from_vec(&bytes).unwrap();
                for response in respond(&request) {
                    let bytes = response.to_vec().unwrap();
                    let len = u16::try_from(bytes.len()).unwrap();
                    stream.write_u16(len).await.unwrap();
                    stream.write_all(&bytes).await.unwrap();
                }
                requests.push(request);
            }
            requests
        });
        (address, handle)
    }

    fn response_to(request: &Message, code: ResponseCode) -> Message {
        let mut response = Message::new();
        response
            .set_id(request.id())
            .set_message_type(MessageType::Response)
            .set_op_code(request.op_code())
            .set_response_code(code);
        response
    }

    fn config(server: &str, key: Option<(&str, &str)>) -> DnsConfig {
        let mut config = DnsConfig::default();
        config.timeout_secs = 5;
        config.zones.insert(
            ZONE.to_string(),
            DnsZoneConfig {
                server: server.to_string(),
                key_name: key.map(|(name, _)| name.to_string()),
                key_secret: key.map(|(_, secret)| secret.to_string()),
                key_algorithm: TsigKeyAlgorithm::HmacSha256,
                record_type: None,
                ttl: None,
            },
        );
        config
    }

    fn unsigned_client(log: &Logger, server: &str) -> DnsUpdateClient {
        DnsUpdateClient::new(log, &config(server, None)).unwrap()
    }

    fn a_record(name: &str, content: &str) -> DnsRecord {
        DnsRecord {
            name: name.to_string(),
            record_type: RecordType::A,
            content: content.to_string(),
            ttl: 300,
        }
    }

    fn name(s: &str) -> Name {
        Name::from_ascii(s).unwrap()
    }

    #[tokio::test]
    async fn test_add_record_sends_signed_update() {
        let log = test_setup_log("test_add_record_sends_signed_update");
        let (server, requests) =
            name_server(|r| vec![response_to(r, ResponseCode::NoError)]).await;
        let secret = STANDARD.encode(b"a shared secret of some length");
        let client = DnsUpdateClient::new(
            &log,
            &config(&server, Some(("provisioner-key", &secret))),
        )
        .unwrap();

        let status =
            client.add_record(ZONE, &a_record("web-1", "10.0.0.7")).await;
        assert_eq!(status.unwrap(), UpdateStatus::noerror());
        drop(client);

        let requests = requests.await.unwrap();
        assert_eq!(requests.len(), 1);
        let request = &requests[0];
        assert_eq!(request.op_code(), OpCode::Update);
        assert_eq!(request.queries()[0].name().to_ascii(), "example.com.");
        assert_eq!(request.queries()[0].query_type(), WireType::SOA);
        let updates = request.name_servers();
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].name().to_ascii(), "web-1.example.com.");
        assert_eq!(updates[0].dns_class(), DNSClass::IN);
        assert_eq!(updates[0].ttl(), 300);
        assert_eq!(
            *updates[0].data(),
            RData::A(A("10.0.0.7".parse().unwrap()))
        );
        // The TSIG record rides in the additional section.
        assert_eq!(request.header().additional_count(), 1);
    }

    #[tokio::test]
    async fn test_update_replaces_the_rrset() {
        let log = test_setup_log("test_update_replaces_the_rrset");
        let (server, requests) =
            name_server(|r| vec![response_to(r, ResponseCode::NoError)]).await;
        let client = unsigned_client(&log, &server);

        let status =
            client.update_record(ZONE, &a_record("web-1", "10.0.0.8")).await;
        assert!(!status.unwrap().is_error());
        drop(client);

        let requests = requests.await.unwrap();
        let updates = requests[0].name_servers();
        assert_eq!(updates.len(), 2);
        assert_eq!(updates[0].dns_class(), DNSClass::ANY);
        assert_eq!(updates[0].ttl(), 0);
        assert_eq!(updates[0].record_type(), WireType::A);
        assert_eq!(updates[1].dns_class(), DNSClass::IN);
        assert_eq!(requests[0].header().additional_count(), 0);
    }

    #[tokio::test]
    async fn test_remove_deletes_only_matching_record() {
        let log = test_setup_log("test_remove_deletes_only_matching_record");
        let (server, requests) =
            name_server(|r| vec![response_to(r, ResponseCode::NoError)]).await;
        let client = unsigned_client(&log, &server);

        client
            .remove_record(ZONE, &a_record("web-1", "10.0.0.7"))
            .await
            .unwrap();
        drop(client);

        let requests = requests.await.unwrap();
        let updates = requests[0].name_servers();
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].dns_class(), DNSClass::NONE);
        assert_eq!(updates[0].ttl(), 0);
        assert_eq!(
            *updates[0].data(),
            RData::A(A("10.0.0.7".parse().unwrap()))
        );
    }

    #[tokio::test]
    async fn test_refused_update_is_reported_as_status() {
        let log = test_setup_log("test_refused_update");
        let (server, _requests) =
            name_server(|r| vec![response_to(r, ResponseCode::Refused)]).await;
        let client = unsigned_client(&log, &server);

        let status = client
            .add_record(ZONE, &a_record("web-1", "10.0.0.7"))
            .await
            .unwrap();
        assert_eq!(status, UpdateStatus(String::from("REFUSED")));
        assert_matches!(
            status.into_result(ZONE),
            Err(DnsError::Rejected { status, .. }) if status == "REFUSED"
        );
    }

    #[tokio::test]
    async fn test_zone_transfer() {
        let log = test_setup_log("test_zone_transfer");
        let (server, requests) = name_server(|request| {
            let origin = name("example.com.");
            let soa = Record::from_rdata(
                origin.clone(),
                3600,
                RData::SOA(SOA::new(
                    name("ns1.example.com."),
                    name("hostmaster.example.com."),
                    7,
                    3600,
                    600,
                    86400,
                    300,
                )),
            );
            let mut first = response_to(request, ResponseCode::NoError);
            first.add_answer(soa.clone());
            first.add_answer(Record::from_rdata(
                origin.clone(),
                3600,
                RData::NS(hickory_proto::rr::rdata::NS(name(
                    "ns1.example.com.",
                ))),
            ));
            first.add_answer(Record::from_rdata(
                name("WEB-1.example.com."),
                300,
                RData::A(A("10.0.0.7".parse().unwrap())),
            ));
            let mut second = response_to(request, ResponseCode::NoError);
            second.add_answer(Record::from_rdata(
                name("alias.example.com."),
                60,
                RData::CNAME(CNAME(name("web-1.example.com."))),
            ));
            second.add_answer(soa);
            vec![first, second]
        })
        .await;
        let client = unsigned_client(&log, &server);

        let records = client.import_zone_records(ZONE).await.unwrap();
        drop(client);
        assert_eq!(
            records,
            vec![
                RecordInfo {
                    zone: ZONE.to_string(),
                    record: a_record("web-1", "10.0.0.7"),
                },
                RecordInfo {
                    zone: ZONE.to_string(),
                    record: DnsRecord {
                        name: String::from("alias"),
                        record_type: RecordType::CNAME,
                        content: String::from("web-1.example.com."),
                        ttl: 60,
                    },
                },
            ]
        );
        let requests = requests.await.unwrap();
        assert_eq!(requests[0].queries()[0].query_type(), WireType::AXFR);
    }

    #[tokio::test]
    async fn test_refused_transfer_is_rejected() {
        let log = test_setup_log("test_refused_transfer");
        let (server, _requests) =
            name_server(|r| vec![response_to(r, ResponseCode::NotAuth)]).await;
        let client = unsigned_client(&log, &server);

        assert_matches!(
            client.import_zone_records(ZONE).await,
            Err(DnsError::Rejected { status, .. }) if status == "NOTAUTH"
        );
    }

    #[tokio::test]
    async fn test_unreachable_server_is_transport_error() {
        let log = test_setup_log("test_unreachable_server");
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let server = listener.local_addr().unwrap().to_string();
        drop(listener);
        let client = unsigned_client(&log, &server);

        assert_matches!(
            client.add_record(ZONE, &a_record("web-1", "10.0.0.7")).await,
            Err(DnsError::Transport { zone, .. }) if zone == ZONE
        );
    }

    #[tokio::test]
    async fn test_unconfigured_zone() {
        let log = test_setup_log("test_unconfigured_zone");
        let client =
            DnsUpdateClient::new(&log, &config("127.0.0.1", None)).unwrap();
        assert_matches!(
            client.import_zone_records("elsewhere.test").await,
            Err(DnsError::ZoneNotConfigured(zone)) if zone == "elsewhere.test"
        );
    }

    #[test]
    fn test_bad_keys_are_rejected() {
        let log = test_setup_log("test_bad_keys_are_rejected");
        assert_matches!(
            DnsUpdateClient::new(
                &log,
                &config("127.0.0.1", Some(("key", "not base64!")))
            ),
            Err(DnsError::InvalidKey { .. })
        );

        let mut half = config("127.0.0.1", None);
        half.zones.get_mut(ZONE).unwrap().key_name = Some(String::from("k"));
        assert_matches!(
            DnsUpdateClient::new(&log, &half),
            Err(DnsError::InvalidKey { .. })
        );
    }

    #[test]
    fn test_server_address() {
        assert_eq!(server_address("10.0.0.53"), "10.0.0.53:53");
        assert_eq!(server_address("10.0.0.53:5353"), "10.0.0.53:5353");
        assert_eq!(server_address("::1"), "[::1]:53");
        assert_eq!(server_address("ns1.example.com"), "ns1.example.com:53");
    }

    #[test]
    fn test_record_data() {
        let origin = name("example.com.");
        let record = |record_type, content: &str| DnsRecord {
            name: String::from("x"),
            record_type,
            content: content.to_string(),
            ttl: 300,
        };

        assert_eq!(
            rdata(&origin, &record(RecordType::MX, "10 mail")).unwrap(),
            RData::MX(MX::new(10, name("mail.example.com.")))
        );
        assert_eq!(
            rdata(&origin, &record(RecordType::SRV, "0 5 5060 sip.other.net."))
                .unwrap(),
            RData::SRV(SRV::new(0, 5, 5060, name("sip.other.net.")))
        );
        assert_eq!(
            rdata(&origin, &record(RecordType::A, "fd00::7")).unwrap(),
            RData::AAAA(AAAA("fd00::7".parse().unwrap()))
        );
        assert_matches!(
            rdata(&origin, &record(RecordType::A, "web-1")),
            Err(DnsError::InvalidRecord { .. })
        );
        assert_matches!(
            rdata(&origin, &record(RecordType::SRV, "0 5 sip")),
            Err(DnsError::InvalidRecord { .. })
        );
    }

    #[test]
    fn test_status_and_names() {
        assert_eq!(status_of(ResponseCode::NoError), UpdateStatus::noerror());
        assert_eq!(status_of(ResponseCode::ServFail).0, "SERVFAIL");
        assert_eq!(status_of(ResponseCode::NXRRSet).0, "NXRRSET");

        let origin = name("example.com.");
        assert_eq!(relative(&name("Web-1.Example.COM."), &origin), "web-1");
        assert_eq!(relative(&origin, &origin), "@");
        assert_eq!(absolute("@", &origin).unwrap(), origin);
        assert_eq!(
            absolute("web-1", &origin).unwrap().to_ascii(),
            "web-1.example.com."
        );
    }
}
