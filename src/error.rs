use std::io;
use std::net::Ipv4Addr;
use std::path::PathBuf;

use thiserror::Error;

use crate::model::{ObservationId, SystemId};

/// Setup defects. Always fatal, raised before or during registry population.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigurationError {
    #[error("invalid system name `{name}`: {expected}")]
    InvalidSystemName { name: String, expected: &'static str },
    #[error("protected client `{client}` has no gateway `{gateway}`")]
    MissingGateway { client: String, gateway: String },
    #[error("network {network} has more than one gateway")]
    DuplicateGateway { network: char },
    #[error("address {address} matches systems {candidates:?} with no exact match (overlapping NAT ranges?)")]
    AmbiguousAddress {
        address: Ipv4Addr,
        candidates: Vec<SystemId>,
    },
    #[error("unknown system `{0}`")]
    UnknownSystem(String),
    #[error("stored system `{name}` with id {id} clashes with the systems loaded before it")]
    CorruptSystem { id: SystemId, name: String },
    #[error("invalid run configuration: {0}")]
    InvalidRun(String),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("observation {0} not found")]
    NotFound(ObservationId),
    #[error("cannot link {from} -> {to}: {to} is already the next hop of {holder}")]
    AlreadyClaimed {
        from: ObservationId,
        to: ObservationId,
        holder: ObservationId,
    },
    #[error("cannot link {from} -> {to}: {from} already links to {existing}")]
    AlreadyLinked {
        from: ObservationId,
        to: ObservationId,
        existing: ObservationId,
    },
    #[error("observation {0} cannot be its own next hop")]
    SelfLink(ObservationId),
    #[error("restored observation {0} violates a link invariant")]
    CorruptLink(ObservationId),
}

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("io error reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("no address line found in log for `{host}`")]
    MissingAddressLine { host: String },
    #[error("malformed address line in log for `{host}`: {line}")]
    MalformedAddress { host: String, line: String },
    #[error("log file name `{0}` does not carry a host name")]
    UnnamedLog(PathBuf),
    #[error("log task failed: {0}")]
    Task(String),
}

/// Which true-endpoint field disagreed inside a chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointField {
    Source,
    Destination,
}

impl std::fmt::Display for EndpointField {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EndpointField::Source => f.write_str("true source"),
            EndpointField::Destination => f.write_str("true destination"),
        }
    }
}

#[derive(Debug, Error)]
pub enum TraceError {
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Ingest(#[from] IngestError),
    #[error("sent observation {sent} matched receives on different systems {systems:?}")]
    CrossSystemAmbiguity {
        sent: ObservationId,
        systems: Vec<SystemId>,
    },
    #[error("observations {first} and {second} share a chain but disagree on the {field}")]
    TraceInconsistency {
        field: EndpointField,
        first: ObservationId,
        second: ObservationId,
    },
    #[error("trace database error: {0}")]
    Persist(#[from] rusqlite::Error),
}

pub type ConfigResult<T> = Result<T, ConfigurationError>;
pub type StoreResult<T> = Result<T, StoreError>;
pub type IngestResult<T> = Result<T, IngestError>;
pub type TraceResult<T> = Result<T, TraceError>;
