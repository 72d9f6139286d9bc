use std::collections::HashMap;
use std::net::Ipv4Addr;

use tracing::debug;

use crate::error::{ConfigResult, ConfigurationError};
use crate::model::{NatRange, Role, System, SystemId};

/// Identities of every host and gateway taking part in a run.
///
/// Populated once before recording, read-only afterwards. Ids are dense and
/// start at 1 in registration order.
#[derive(Debug, Default, Clone)]
pub struct SystemRegistry {
    systems: Vec<System>,
    by_name: HashMap<String, SystemId>,
}

impl SystemRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `name`, or returns the id it already has.
    pub fn register(&mut self, name: &str, internal_address: Ipv4Addr, nat: Option<NatRange>) -> SystemId {
        if let Some(id) = self.by_name.get(name) {
            return *id;
        }

        let id = self.next_id();
        let system = System {
            id,
            name: name.to_string(),
            role: role_for_name(name),
            internal_address,
            nat,
        };
        debug!(system = %name, id = %id, role = ?system.role, "registered system");
        self.by_name.insert(system.name.clone(), id);
        self.systems.push(system);
        id
    }

    /// Re-inserts a previously persisted system, keeping its id.
    pub(crate) fn restore(&mut self, system: System) -> ConfigResult<()> {
        if system.id != self.next_id() || self.by_name.contains_key(&system.name) {
            return Err(ConfigurationError::CorruptSystem {
                id: system.id,
                name: system.name,
            });
        }
        self.by_name.insert(system.name.clone(), system.id);
        self.systems.push(system);
        Ok(())
    }

    fn next_id(&self) -> SystemId {
        SystemId::from_index(self.systems.len())
    }

    pub fn resolve_by_name(&self, name: &str) -> Option<SystemId> {
        self.by_name.get(name).copied()
    }

    /// Finds the system owning `address`, either as its internal address or
    /// inside a gateway's NAT range. An exact internal match breaks ties;
    /// overlapping ranges without one are a configuration defect.
    pub fn resolve_by_address(&self, address: Ipv4Addr) -> ConfigResult<Option<SystemId>> {
        let candidates: Vec<&System> = self
            .systems
            .iter()
            .filter(|s| s.internal_address == address || s.nat.map_or(false, |nat| nat.contains(address)))
            .collect();

        match candidates.as_slice() {
            [] => Ok(None),
            [only] => Ok(Some(only.id)),
            many => {
                let exact: Vec<&&System> = many.iter().filter(|s| s.internal_address == address).collect();
                match exact.as_slice() {
                    [one] => Ok(Some(one.id)),
                    _ => Err(ConfigurationError::AmbiguousAddress {
                        address,
                        candidates: many.iter().map(|s| s.id).collect(),
                    }),
                }
            }
        }
    }

    pub fn get(&self, id: SystemId) -> Option<&System> {
        self.systems.get(id.index())
    }

    pub fn name_of(&self, id: SystemId) -> &str {
        self.get(id).map_or("?", |s| s.name.as_str())
    }

    pub fn systems(&self) -> impl Iterator<Item = &System> {
        self.systems.iter()
    }

    pub fn len(&self) -> usize {
        self.systems.len()
    }

    pub fn is_empty(&self) -> bool {
        self.systems.is_empty()
    }

    /// The gateway fronting network `letter`.
    pub fn gateway_for(&self, letter: char) -> Option<SystemId> {
        self.systems
            .iter()
            .find(|s| s.role == Role::Gateway && s.network() == Some(letter))
            .map(|s| s.id)
    }

    /// Gateway of a protected client, if the client is one.
    pub fn gateway_of(&self, id: SystemId) -> Option<SystemId> {
        let system = self.get(id)?;
        if system.role != Role::ProtectedClient {
            return None;
        }
        self.gateway_for(system.network()?)
    }

    /// Protected clients on network `letter`, in id order.
    pub fn protected_clients_on(&self, letter: char) -> impl Iterator<Item = &System> {
        self.systems
            .iter()
            .filter(move |s| s.role == Role::ProtectedClient && s.network() == Some(letter))
    }

    /// Checks naming and structure: `gateX`, `protXN`, `extN`; one gateway
    /// per network letter; every protected client has its gateway.
    pub fn validate_topology(&self) -> ConfigResult<()> {
        let mut gateways: HashMap<char, SystemId> = HashMap::new();

        for system in &self.systems {
            check_name(&system.name)?;
            if system.role == Role::Gateway {
                if let Some(letter) = system.network() {
                    if gateways.insert(letter, system.id).is_some() {
                        return Err(ConfigurationError::DuplicateGateway { network: letter });
                    }
                }
            }
        }

        for system in self.systems.iter().filter(|s| s.role == Role::ProtectedClient) {
            let letter = system.network().unwrap_or('?');
            if !gateways.contains_key(&letter) {
                return Err(ConfigurationError::MissingGateway {
                    client: system.name.clone(),
                    gateway: format!("gate{}", letter),
                });
            }
        }

        debug!(systems = self.systems.len(), "topology validated");
        Ok(())
    }
}

fn role_for_name(name: &str) -> Role {
    if name.starts_with("gate") {
        Role::Gateway
    } else if name.starts_with("prot") {
        Role::ProtectedClient
    } else {
        Role::ExternalClient
    }
}

fn check_name(name: &str) -> ConfigResult<()> {
    let invalid = |expected| ConfigurationError::InvalidSystemName {
        name: name.to_string(),
        expected,
    };
    let tail: Vec<char> = name.chars().skip(4).collect();

    if name.starts_with("gate") {
        match tail.as_slice() {
            [letter] if letter.is_ascii_uppercase() => Ok(()),
            _ => Err(invalid("gateways must be named gateX, X a single capital letter")),
        }
    } else if name.starts_with("prot") {
        match tail.as_slice() {
            [letter, digit] if letter.is_ascii_uppercase() && digit.is_ascii_digit() => Ok(()),
            _ => Err(invalid("protected hosts must be named protXY, X a capital letter and Y a digit")),
        }
    } else if let Some(rest) = name.strip_prefix("ext") {
        let rest: Vec<char> = rest.chars().collect();
        match rest.as_slice() {
            [digit] if digit.is_ascii_digit() => Ok(()),
            _ => Err(invalid("external hosts must be named extX, X a single digit")),
        }
    } else {
        Err(invalid("hosts must be named extX, protXY or gateX"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(a: u8, b: u8, c: u8, d: u8) -> Ipv4Addr {
        Ipv4Addr::new(a, b, c, d)
    }

    fn nat(base: Ipv4Addr, mask: Ipv4Addr) -> Option<NatRange> {
        Some(NatRange { base, mask })
    }

    #[test]
    fn registering_twice_returns_same_id() {
        let mut registry = SystemRegistry::new();
        let first = registry.register("ext1", ip(10, 0, 0, 1), None);
        let second = registry.register("ext1", ip(10, 9, 9, 9), None);

        assert_eq!(first, second);
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get(first).map(|s| s.internal_address), Some(ip(10, 0, 0, 1)));
    }

    #[test]
    fn address_inside_nat_range_resolves_to_gateway() {
        let mut registry = SystemRegistry::new();
        let gate = registry.register("gateA", ip(10, 1, 0, 1), nat(ip(172, 1, 0, 0), ip(255, 255, 0, 0)));

        assert_eq!(registry.resolve_by_address(ip(172, 1, 40, 2)), Ok(Some(gate)));
        assert_eq!(registry.resolve_by_address(ip(10, 1, 0, 1)), Ok(Some(gate)));
        assert_eq!(registry.resolve_by_address(ip(172, 3, 0, 1)), Ok(None));
    }

    #[test]
    fn exact_internal_match_beats_nat_range() {
        let mut registry = SystemRegistry::new();
        registry.register("gateA", ip(10, 1, 0, 1), nat(ip(172, 1, 0, 0), ip(255, 255, 0, 0)));
        let ext = registry.register("ext1", ip(172, 1, 0, 9), None);

        assert_eq!(registry.resolve_by_address(ip(172, 1, 0, 9)), Ok(Some(ext)));
    }

    #[test]
    fn overlapping_ranges_without_exact_match_are_ambiguous() {
        let mut registry = SystemRegistry::new();
        let a = registry.register("gateA", ip(10, 1, 0, 1), nat(ip(172, 1, 0, 0), ip(255, 255, 0, 0)));
        let b = registry.register("gateB", ip(10, 2, 0, 1), nat(ip(172, 0, 0, 0), ip(255, 0, 0, 0)));

        assert_eq!(
            registry.resolve_by_address(ip(172, 1, 5, 5)),
            Err(ConfigurationError::AmbiguousAddress {
                address: ip(172, 1, 5, 5),
                candidates: vec![a, b],
            })
        );
    }

    #[test]
    fn topology_requires_gateway_for_protected_client() {
        let mut registry = SystemRegistry::new();
        registry.register("protB1", ip(10, 2, 0, 2), None);
        registry.register("gateA", ip(10, 1, 0, 1), None);

        assert_eq!(
            registry.validate_topology(),
            Err(ConfigurationError::MissingGateway {
                client: "protB1".to_string(),
                gateway: "gateB".to_string(),
            })
        );

        registry.register("gateB", ip(10, 2, 0, 1), None);
        assert_eq!(registry.validate_topology(), Ok(()));
        assert_eq!(registry.gateway_of(registry.resolve_by_name("protB1").unwrap()), registry.resolve_by_name("gateB"));
    }

    #[test]
    fn restore_rejects_out_of_order_or_duplicate_systems() {
        let mut registry = SystemRegistry::new();
        let ext1 = System {
            id: SystemId::from_index(0),
            name: "ext1".to_string(),
            role: Role::ExternalClient,
            internal_address: ip(172, 3, 0, 1),
            nat: None,
        };
        registry.restore(ext1.clone()).unwrap();

        let duplicate = System {
            id: SystemId::from_index(1),
            ..ext1.clone()
        };
        assert_eq!(
            registry.restore(duplicate),
            Err(ConfigurationError::CorruptSystem {
                id: SystemId::from_index(1),
                name: "ext1".to_string(),
            })
        );

        let gap = System {
            id: SystemId::from_index(4),
            name: "ext2".to_string(),
            ..ext1
        };
        assert!(matches!(registry.restore(gap), Err(ConfigurationError::CorruptSystem { .. })));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn topology_rejects_malformed_names() {
        for bad in ["gateAB", "prot1A", "ext12", "router", "gatea"] {
            let mut registry = SystemRegistry::new();
            registry.register(bad, ip(10, 0, 0, 1), None);
            assert!(
                matches!(registry.validate_topology(), Err(ConfigurationError::InvalidSystemName { .. })),
                "{} should be rejected",
                bad
            );
        }
    }
}
