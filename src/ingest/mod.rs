//! Typed observation records and the sources that produce them.
//!
//! The tracer only ever sees [`ObservationRecord`]s. Where they come from
//! (per-host experiment logs via [`LogFileSource`], or an in-memory list) is
//! decided here.

use std::collections::VecDeque;
use std::net::Ipv4Addr;

use async_trait::async_trait;

use crate::error::IngestResult;
use crate::model::{ContentHash, Direction, ProtocolId, Timestamp};

pub mod log_parser;
pub mod roster;

pub use log_parser::{LogFileSource, LogFormat};
pub use roster::{discover_logs, read_roster_entry, HostLog, RosterEntry};

/// Addressing of one packet as printed by a gateway.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PacketHeader {
    pub protocol: ProtocolId,
    pub source: Ipv4Addr,
    pub source_port: u16,
    pub destination: Ipv4Addr,
    pub destination_port: u16,
    pub hash: ContentHash,
}

/// Which side of the gateway the triggering packet arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatewayFlow {
    Inbound,
    Outbound,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatewayResult {
    Accept,
    Reject,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatewayModule {
    Admin,
    Nat,
    Hopper,
}

/// A send or receive logged by a protected or external client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientEvent {
    pub direction: Direction,
    pub protocol: ProtocolId,
    pub hash: ContentHash,
    pub peer: Ipv4Addr,
    pub peer_port: u16,
}

/// One gateway decision. `inbound` is the packet it received, `outbound`
/// the packet it emitted; a transform carries both.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayEvent {
    pub flow: GatewayFlow,
    pub result: GatewayResult,
    pub module: GatewayModule,
    pub reason: String,
    pub inbound: Option<PacketHeader>,
    pub outbound: Option<PacketHeader>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordBody {
    Client(ClientEvent),
    Gateway(GatewayEvent),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObservationRecord {
    pub host: String,
    /// 1-based line in the host's log, kept for diagnostics.
    pub line: u64,
    pub timestamp: Timestamp,
    pub body: RecordBody,
}

/// A finite, per-host stream of records.
#[async_trait]
pub trait RecordSource: Send {
    fn host(&self) -> &str;

    async fn next_record(&mut self) -> IngestResult<Option<ObservationRecord>>;
}

/// Records already held in memory, handed out in order. A parsed log is
/// buffered in one of these until its turn to be recorded.
pub struct MemorySource {
    host: String,
    records: VecDeque<ObservationRecord>,
}

impl MemorySource {
    pub fn new(host: impl Into<String>, records: Vec<ObservationRecord>) -> Self {
        Self {
            host: host.into(),
            records: records.into(),
        }
    }
}

#[async_trait]
impl RecordSource for MemorySource {
    fn host(&self) -> &str {
        &self.host
    }

    async fn next_record(&mut self) -> IngestResult<Option<ObservationRecord>> {
        Ok(self.records.pop_front())
    }
}

/// Drains a source into a vector.
pub async fn collect_records<S: RecordSource + ?Sized>(source: &mut S) -> IngestResult<Vec<ObservationRecord>> {
    let mut records = Vec::new();
    while let Some(record) = source.next_record().await? {
        records.push(record);
    }
    Ok(records)
}
