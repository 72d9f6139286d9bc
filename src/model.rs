use std::fmt;
use std::net::Ipv4Addr;

use serde::{Deserialize, Serialize};

/// Seconds since the start of the experiment, as logged by the observing host.
pub type Timestamp = i64;

/// IP protocol number carried by an observation.
pub type ProtocolId = u16;

/// Stable identity of a registered host or gateway. Never zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SystemId(u32);

impl SystemId {
    pub(crate) fn from_raw(raw: u32) -> Option<Self> {
        (raw != 0).then_some(Self(raw))
    }

    pub(crate) fn from_index(index: usize) -> Self {
        Self(index as u32 + 1)
    }

    pub fn get(self) -> u32 {
        self.0
    }

    pub(crate) fn index(self) -> usize {
        (self.0 - 1) as usize
    }
}

impl fmt::Display for SystemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Index of a packet observation inside the store. Assigned on append, never zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObservationId(u64);

impl ObservationId {
    pub(crate) fn from_raw(raw: u64) -> Option<Self> {
        (raw != 0).then_some(Self(raw))
    }

    pub(crate) fn from_index(index: usize) -> Self {
        Self(index as u64 + 1)
    }

    pub fn get(self) -> u64 {
        self.0
    }

    pub(crate) fn index(self) -> usize {
        (self.0 - 1) as usize
    }
}

impl fmt::Display for ObservationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Key into the deduplicated reason table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ReasonId(u32);

impl ReasonId {
    pub(crate) fn from_raw(raw: u32) -> Option<Self> {
        (raw != 0).then_some(Self(raw))
    }

    pub(crate) fn from_index(index: usize) -> Self {
        Self(index as u32 + 1)
    }

    pub fn get(self) -> u32 {
        self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    Sent,
    Received,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Role {
    Gateway,
    ProtectedClient,
    ExternalClient,
}

/// Opaque payload correlation key, the same on every hop a payload crosses.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ContentHash(String);

impl ContentHash {
    pub fn new(hash: impl Into<String>) -> Self {
        Self(hash.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ContentHash {
    fn from(hash: &str) -> Self {
        Self(hash.to_string())
    }
}

/// External address range fronted by a gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NatRange {
    pub base: Ipv4Addr,
    pub mask: Ipv4Addr,
}

impl NatRange {
    pub fn contains(&self, address: Ipv4Addr) -> bool {
        let mask = u32::from(self.mask);
        u32::from(address) & mask == u32::from(self.base) & mask
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct System {
    pub id: SystemId,
    pub name: String,
    pub role: Role,
    pub internal_address: Ipv4Addr,
    pub nat: Option<NatRange>,
}

impl System {
    /// Network letter for gateways and protected clients (`gateA`, `protA1` -> `A`).
    pub fn network(&self) -> Option<char> {
        match self.role {
            Role::Gateway | Role::ProtectedClient => self.name.chars().nth(4),
            Role::ExternalClient => None,
        }
    }
}

/// Core fields of an observation, fixed at insertion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewObservation {
    pub observing_system: SystemId,
    pub direction: Direction,
    pub timestamp: Timestamp,
    pub protocol: ProtocolId,
    pub source_address: Ipv4Addr,
    pub destination_address: Ipv4Addr,
    pub source_system: Option<SystemId>,
    pub destination_system: Option<SystemId>,
    pub true_source: Option<SystemId>,
    pub true_destination: Option<SystemId>,
    pub hash: ContentHash,
    pub reason: Option<ReasonId>,
    pub log_line: u64,
}

/// Point-in-time copy of one stored observation, including its mutable links.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PacketObservation {
    pub id: ObservationId,
    pub observing_system: SystemId,
    pub direction: Direction,
    pub timestamp: Timestamp,
    pub protocol: ProtocolId,
    pub source_address: Ipv4Addr,
    pub destination_address: Ipv4Addr,
    pub source_system: Option<SystemId>,
    pub destination_system: Option<SystemId>,
    pub true_source: Option<SystemId>,
    pub true_destination: Option<SystemId>,
    pub hash: ContentHash,
    pub next_hop: Option<ObservationId>,
    pub failed: bool,
    pub reason: Option<ReasonId>,
    pub log_line: u64,
}

impl PacketObservation {
    pub fn is_send(&self) -> bool {
        self.direction == Direction::Sent
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nat_range_matches_masked_prefix() {
        let range = NatRange {
            base: Ipv4Addr::new(172, 1, 0, 0),
            mask: Ipv4Addr::new(255, 255, 0, 0),
        };
        assert!(range.contains(Ipv4Addr::new(172, 1, 113, 38)));
        assert!(!range.contains(Ipv4Addr::new(172, 2, 113, 38)));
    }

    #[test]
    fn zero_ids_are_rejected() {
        assert!(SystemId::from_raw(0).is_none());
        assert!(ObservationId::from_raw(0).is_none());
        assert_eq!(ObservationId::from_raw(3).map(ObservationId::index), Some(2));
    }
}
