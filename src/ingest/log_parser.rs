use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use lazy_static::lazy_static;
use regex::{Captures, Regex};
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, BufReader, Lines};
use tracing::trace;

use crate::error::{IngestError, IngestResult};
use crate::ingest::{
    ClientEvent, GatewayEvent, GatewayFlow, GatewayModule, GatewayResult, ObservationRecord, PacketHeader,
    RecordBody, RecordSource,
};
use crate::model::{ContentHash, Direction};

pub(crate) const IP_PATTERN: &str = r"(?:\d{1,3}\.){3}\d{1,3}";

lazy_static! {
    // 1351452800.14 LOG4 Sent 6:dd3f6ad25f9885796e1193fe93dd841e to 172.2.20.0:40869
    static ref CLIENT_LINE: Regex = Regex::new(&format!(
        r"^([0-9]+).*LOG[0-9] (Sent|Received) ([0-9]+):([a-z0-9]{{32}}) (?:to|from) ({ip}):(\d+)$",
        ip = IP_PATTERN
    ))
    .expect("client line pattern");

    // 353608 LOG0 Outbound: Accept: NAT: rewrite: p:6 s:10.1.0.2:80 d:...:80 hash:<hex>/p:6 s:... hash:<hex>
    static ref GATEWAY_LINE: Regex = Regex::new(&format!(
        r"^([0-9]+).*LOG[0-9] (Inbound|Outbound): (Accept|Reject): (Admin|NAT|Hopper): ([^:]+): (?:{pkt})?/(?:{pkt})?$",
        pkt = format!(
            r"p:([0-9]+) s:({ip}):([0-9]+) d:({ip}):([0-9]+) hash:([a-z0-9]+)",
            ip = IP_PATTERN
        )
    ))
    .expect("gateway line pattern");
}

/// Which line grammar a host's log follows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Client,
    Gateway,
}

impl LogFormat {
    pub fn for_host(host: &str) -> Self {
        if host.starts_with("gate") {
            LogFormat::Gateway
        } else {
            LogFormat::Client
        }
    }
}

/// Tokenizes one log line. Lines that are not traffic events, or whose
/// numbers do not fit their fields, yield `None`.
pub fn parse_line(host: &str, format: LogFormat, line_no: u64, line: &str) -> Option<ObservationRecord> {
    let line = line.trim_end_matches(['\r', '\n']);
    let (timestamp, body) = match format {
        LogFormat::Client => parse_client(line)?,
        LogFormat::Gateway => parse_gateway(line)?,
    };
    Some(ObservationRecord {
        host: host.to_string(),
        line: line_no,
        timestamp,
        body,
    })
}

fn parse_client(line: &str) -> Option<(i64, RecordBody)> {
    let caps = CLIENT_LINE.captures(line)?;
    let direction = match &caps[2] {
        "Sent" => Direction::Sent,
        _ => Direction::Received,
    };
    let event = ClientEvent {
        direction,
        protocol: caps[3].parse().ok()?,
        hash: ContentHash::from(&caps[4]),
        peer: caps[5].parse().ok()?,
        peer_port: caps[6].parse().ok()?,
    };
    Some((caps[1].parse().ok()?, RecordBody::Client(event)))
}

fn parse_gateway(line: &str) -> Option<(i64, RecordBody)> {
    let caps = GATEWAY_LINE.captures(line)?;
    let flow = match &caps[2] {
        "Inbound" => GatewayFlow::Inbound,
        _ => GatewayFlow::Outbound,
    };
    let result = match &caps[3] {
        "Accept" => GatewayResult::Accept,
        _ => GatewayResult::Reject,
    };
    let module = match &caps[4] {
        "Admin" => GatewayModule::Admin,
        "NAT" => GatewayModule::Nat,
        _ => GatewayModule::Hopper,
    };
    let inbound = packet_header(&caps, 6)?;
    let outbound = packet_header(&caps, 12)?;
    if inbound.is_none() && outbound.is_none() {
        return None;
    }

    let event = GatewayEvent {
        flow,
        result,
        module,
        reason: caps[5].trim().to_string(),
        inbound,
        outbound,
    };
    Some((caps[1].parse().ok()?, RecordBody::Gateway(event)))
}

/// Reads the six packet groups starting at `first`. The outer `Option` is
/// a parse failure, the inner one an absent packet.
fn packet_header(caps: &Captures<'_>, first: usize) -> Option<Option<PacketHeader>> {
    let Some(protocol) = caps.get(first) else {
        return Some(None);
    };
    let field = |offset: usize| caps.get(first + offset).map(|m| m.as_str());
    let header = PacketHeader {
        protocol: protocol.as_str().parse().ok()?,
        source: field(1)?.parse::<Ipv4Addr>().ok()?,
        source_port: field(2)?.parse().ok()?,
        destination: field(3)?.parse::<Ipv4Addr>().ok()?,
        destination_port: field(4)?.parse().ok()?,
        hash: ContentHash::from(field(5)?),
    };
    Some(Some(header))
}

/// Streams records out of one host's log file.
pub struct LogFileSource {
    host: String,
    path: PathBuf,
    format: LogFormat,
    lines: Lines<BufReader<File>>,
    line_no: u64,
}

impl LogFileSource {
    pub async fn open(host: impl Into<String>, path: impl AsRef<Path>) -> IngestResult<Self> {
        let host = host.into();
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path).await.map_err(|source| IngestError::Io {
            path: path.clone(),
            source,
        })?;
        Ok(Self {
            format: LogFormat::for_host(&host),
            host,
            path,
            lines: BufReader::new(file).lines(),
            line_no: 0,
        })
    }
}

#[async_trait]
impl RecordSource for LogFileSource {
    fn host(&self) -> &str {
        &self.host
    }

    async fn next_record(&mut self) -> IngestResult<Option<ObservationRecord>> {
        loop {
            let line = self.lines.next_line().await.map_err(|source| IngestError::Io {
                path: self.path.clone(),
                source,
            })?;
            let Some(line) = line else {
                return Ok(None);
            };
            self.line_no += 1;
            if let Some(record) = parse_line(&self.host, self.format, self.line_no, &line) {
                return Ok(Some(record));
            }
            trace!(host = %self.host, line = self.line_no, "skipped non-traffic line");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::collect_records;
    use std::io::Write;

    const HASH: &str = "dd3f6ad25f9885796e1193fe93dd841e";

    #[test]
    fn parses_client_send_and_receive() {
        let sent = parse_line(
            "protA1",
            LogFormat::Client,
            7,
            &format!("1351452800.14 LOG4 Sent 6:{} to 172.2.20.0:40869", HASH),
        )
        .unwrap();

        assert_eq!(sent.timestamp, 1351452800);
        assert_eq!(sent.line, 7);
        assert_eq!(
            sent.body,
            RecordBody::Client(ClientEvent {
                direction: Direction::Sent,
                protocol: 6,
                hash: ContentHash::from(HASH),
                peer: Ipv4Addr::new(172, 2, 20, 0),
                peer_port: 40869,
            })
        );

        let received = parse_line(
            "ext1",
            LogFormat::Client,
            8,
            &format!("1351452801.5 LOG4 Received 17:{} from 172.1.3.4:53", HASH),
        )
        .unwrap();
        assert!(matches!(
            received.body,
            RecordBody::Client(ClientEvent { direction: Direction::Received, protocol: 17, .. })
        ));
    }

    #[test]
    fn parses_gateway_admin_line_with_one_side() {
        let line = "353608.535795917 LOG0 Outbound: Accept: Admin: sent: \
                    /p:253 s:172.2.196.104:0 d:172.1.113.38:0 hash:2f67e51d456961704b08f6ec186dd182";
        let record = parse_line("gateB", LogFormat::Gateway, 3, line).unwrap();

        let RecordBody::Gateway(event) = record.body else {
            panic!("expected gateway record");
        };
        assert_eq!(record.timestamp, 353608);
        assert_eq!(event.flow, GatewayFlow::Outbound);
        assert_eq!(event.module, GatewayModule::Admin);
        assert_eq!(event.reason, "sent");
        assert!(event.inbound.is_none());
        let out = event.outbound.unwrap();
        assert_eq!(out.protocol, 253);
        assert_eq!(out.destination, Ipv4Addr::new(172, 1, 113, 38));
    }

    #[test]
    fn parses_gateway_transform_with_both_sides() {
        let line = "20 LOG1 Outbound: Accept: NAT: rewrite: \
                    p:6 s:10.1.0.2:5000 d:172.3.0.9:80 hash:aaaa/p:6 s:172.1.0.7:6000 d:172.3.0.9:80 hash:aaaa";
        let record = parse_line("gateA", LogFormat::Gateway, 1, line).unwrap();

        let RecordBody::Gateway(event) = record.body else {
            panic!("expected gateway record");
        };
        assert_eq!(event.module, GatewayModule::Nat);
        assert_eq!(event.inbound.as_ref().map(|p| p.source), Some(Ipv4Addr::new(10, 1, 0, 2)));
        assert_eq!(event.outbound.as_ref().map(|p| p.source_port), Some(6000));
    }

    #[test]
    fn rejects_noise_and_out_of_range_numbers() {
        assert!(parse_line("protA1", LogFormat::Client, 1, "LOCAL ADDRESS 10.1.0.2:4000").is_none());
        assert!(parse_line(
            "protA1",
            LogFormat::Client,
            1,
            &format!("10 LOG4 Sent 6:{} to 300.2.20.0:40869", HASH)
        )
        .is_none());
        assert!(parse_line("gateA", LogFormat::Gateway, 1, "10 LOG0 Inbound: Reject: NAT: no entry: /").is_none());
    }

    #[tokio::test]
    async fn file_source_keeps_line_numbers() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "LOCAL ADDRESS 10.1.0.2:4000").unwrap();
        writeln!(file, "starting up").unwrap();
        writeln!(file, "10 LOG4 Sent 6:{} to 172.2.0.1:80", HASH).unwrap();
        writeln!(file, "12 LOG4 Received 6:{} from 172.2.0.1:80", HASH).unwrap();

        let mut source = LogFileSource::open("protA1", file.path()).await.unwrap();
        let records = collect_records(&mut source).await.unwrap();

        assert_eq!(records.iter().map(|r| r.line).collect::<Vec<_>>(), vec![3, 4]);
        assert_eq!(source.host(), "protA1");
    }
}
