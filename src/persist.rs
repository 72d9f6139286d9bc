//! SQLite copy of a finished trace, so statistics can be re-run without
//! parsing and matching the logs again.
//!
//! Tables: `systems`, `reasons` and `packets`. Addresses are stored as
//! integers, next hops as nullable packet ids.

use std::net::Ipv4Addr;
use std::path::Path;

use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::info;

use crate::core::registry::SystemRegistry;
use crate::core::store::PacketStore;
use crate::error::TraceResult;
use crate::model::{
    ContentHash, Direction, NatRange, ObservationId, PacketObservation, ReasonId, Role, System, SystemId,
};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS systems (
    id INTEGER PRIMARY KEY,
    name TEXT UNIQUE NOT NULL,
    role TEXT NOT NULL,
    ip INTEGER NOT NULL,
    ext_base INTEGER,
    ext_mask INTEGER
);
CREATE TABLE IF NOT EXISTS reasons (
    id INTEGER PRIMARY KEY,
    reason TEXT UNIQUE NOT NULL
);
CREATE TABLE IF NOT EXISTS packets (
    id INTEGER PRIMARY KEY,
    system_id INTEGER NOT NULL REFERENCES systems(id),
    log_line INTEGER NOT NULL,
    is_send INTEGER NOT NULL,
    time INTEGER NOT NULL,
    proto INTEGER NOT NULL,
    hash TEXT NOT NULL,
    src_ip INTEGER NOT NULL,
    dest_ip INTEGER NOT NULL,
    src_id INTEGER REFERENCES systems(id),
    dest_id INTEGER REFERENCES systems(id),
    true_src_id INTEGER REFERENCES systems(id),
    true_dest_id INTEGER REFERENCES systems(id),
    next_hop_id INTEGER REFERENCES packets(id),
    is_failed INTEGER NOT NULL DEFAULT 0,
    reason_id INTEGER REFERENCES reasons(id)
);
CREATE INDEX IF NOT EXISTS idx_hash ON packets (hash);
CREATE INDEX IF NOT EXISTS idx_system_id ON packets (system_id);
CREATE INDEX IF NOT EXISTS idx_next_id ON packets (next_hop_id);
";

pub struct TraceDatabase {
    conn: Connection,
}

impl TraceDatabase {
    pub fn open(path: &Path) -> TraceResult<Self> {
        let conn = Connection::open(path)?;
        info!(path = %path.display(), "opened trace database");
        Ok(Self { conn })
    }

    pub fn open_in_memory() -> TraceResult<Self> {
        Ok(Self {
            conn: Connection::open_in_memory()?,
        })
    }

    pub fn create_schema(&self) -> TraceResult<()> {
        self.conn.execute_batch(SCHEMA)?;
        Ok(())
    }

    /// Whether the database holds a committed run. Every saved run has at
    /// least one system, so a bare schema or an empty file does not count.
    pub fn has_trace(&self) -> TraceResult<bool> {
        let found: Option<String> = self
            .conn
            .query_row(
                "SELECT name FROM sqlite_master WHERE type = 'table' AND name = 'systems'",
                [],
                |row| row.get(0),
            )
            .optional()?;
        if found.is_none() {
            return Ok(false);
        }
        let count: i64 = self.conn.query_row("SELECT COUNT(*) FROM systems", [], |row| row.get(0))?;
        Ok(count > 0)
    }

    /// Writes the whole run in one transaction, replacing earlier contents.
    pub fn save(&mut self, registry: &SystemRegistry, store: &PacketStore) -> TraceResult<()> {
        let tx = self.conn.transaction()?;
        tx.execute_batch("DELETE FROM packets; DELETE FROM reasons; DELETE FROM systems;")?;

        {
            let mut insert = tx.prepare(
                "INSERT INTO systems (id, name, role, ip, ext_base, ext_mask) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            )?;
            for system in registry.systems() {
                insert.execute(params![
                    system.id.get(),
                    system.name,
                    role_name(system.role),
                    u32::from(system.internal_address),
                    system.nat.map(|nat| u32::from(nat.base)),
                    system.nat.map(|nat| u32::from(nat.mask)),
                ])?;
            }
        }

        {
            let mut insert = tx.prepare("INSERT INTO reasons (id, reason) VALUES (?1, ?2)")?;
            for (id, text) in store.reasons() {
                insert.execute(params![id.get(), text])?;
            }
        }

        let observations = store.observations();
        {
            let mut insert = tx.prepare(
                "INSERT INTO packets (id, system_id, log_line, is_send, time, proto, hash, src_ip, dest_ip,
                    src_id, dest_id, true_src_id, true_dest_id, next_hop_id, is_failed, reason_id)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)",
            )?;
            for o in &observations {
                insert.execute(params![
                    o.id.get() as i64,
                    o.observing_system.get(),
                    o.log_line as i64,
                    o.is_send(),
                    o.timestamp,
                    o.protocol,
                    o.hash.as_str(),
                    u32::from(o.source_address),
                    u32::from(o.destination_address),
                    o.source_system.map(SystemId::get),
                    o.destination_system.map(SystemId::get),
                    o.true_source.map(SystemId::get),
                    o.true_destination.map(SystemId::get),
                    o.next_hop.map(|id| id.get() as i64),
                    o.failed,
                    o.reason.map(ReasonId::get),
                ])?;
            }
        }

        tx.commit()?;
        info!(
            systems = registry.len(),
            packets = observations.len(),
            "saved trace state"
        );
        Ok(())
    }

    /// Rebuilds the registry and store a previous [`save`](Self::save) wrote.
    pub fn load(&self) -> TraceResult<(SystemRegistry, PacketStore)> {
        let mut registry = SystemRegistry::new();
        let systems = {
            let mut stmt = self
                .conn
                .prepare("SELECT id, name, role, ip, ext_base, ext_mask FROM systems ORDER BY id")?;
            let rows = stmt.query_map([], system_from_row)?;
            rows.collect::<Result<Vec<_>, _>>()?
        };
        for system in systems {
            registry.restore(system)?;
        }

        let reasons = {
            let mut stmt = self.conn.prepare("SELECT reason FROM reasons ORDER BY id")?;
            let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
            rows.collect::<Result<Vec<_>, _>>()?
        };

        let observations = {
            let mut stmt = self.conn.prepare(
                "SELECT id, system_id, log_line, is_send, time, proto, hash, src_ip, dest_ip,
                    src_id, dest_id, true_src_id, true_dest_id, next_hop_id, is_failed, reason_id
                 FROM packets ORDER BY id",
            )?;
            let rows = stmt.query_map([], observation_from_row)?;
            rows.collect::<Result<Vec<_>, _>>()?
        };

        let store = PacketStore::restore(observations, reasons)?;
        info!(systems = registry.len(), packets = store.len(), "loaded trace state");
        Ok((registry, store))
    }
}

fn role_name(role: Role) -> &'static str {
    match role {
        Role::Gateway => "gateway",
        Role::ProtectedClient => "protected",
        Role::ExternalClient => "external",
    }
}

fn out_of_range(column: usize, value: i64) -> rusqlite::Error {
    rusqlite::Error::IntegralValueOutOfRange(column, value)
}

fn system_id(row: &Row<'_>, column: usize) -> rusqlite::Result<Option<SystemId>> {
    let Some(raw) = row.get::<_, Option<i64>>(column)? else {
        return Ok(None);
    };
    let id = u32::try_from(raw)
        .ok()
        .and_then(SystemId::from_raw)
        .ok_or_else(|| out_of_range(column, raw))?;
    Ok(Some(id))
}

fn required_system_id(row: &Row<'_>, column: usize) -> rusqlite::Result<SystemId> {
    system_id(row, column)?.ok_or_else(|| out_of_range(column, 0))
}

fn observation_id(row: &Row<'_>, column: usize) -> rusqlite::Result<Option<ObservationId>> {
    let Some(raw) = row.get::<_, Option<i64>>(column)? else {
        return Ok(None);
    };
    let id = u64::try_from(raw)
        .ok()
        .and_then(ObservationId::from_raw)
        .ok_or_else(|| out_of_range(column, raw))?;
    Ok(Some(id))
}

fn address(row: &Row<'_>, column: usize) -> rusqlite::Result<Ipv4Addr> {
    Ok(Ipv4Addr::from(row.get::<_, u32>(column)?))
}

fn system_from_row(row: &Row<'_>) -> rusqlite::Result<System> {
    let role = match row.get::<_, String>(2)?.as_str() {
        "gateway" => Role::Gateway,
        "protected" => Role::ProtectedClient,
        _ => Role::ExternalClient,
    };
    let base = row.get::<_, Option<u32>>(4)?;
    let mask = row.get::<_, Option<u32>>(5)?;
    Ok(System {
        id: required_system_id(row, 0)?,
        name: row.get(1)?,
        role,
        internal_address: address(row, 3)?,
        nat: base.zip(mask).map(|(base, mask)| NatRange {
            base: Ipv4Addr::from(base),
            mask: Ipv4Addr::from(mask),
        }),
    })
}

fn observation_from_row(row: &Row<'_>) -> rusqlite::Result<PacketObservation> {
    let direction = if row.get::<_, bool>(3)? {
        Direction::Sent
    } else {
        Direction::Received
    };
    let reason = match row.get::<_, Option<i64>>(15)? {
        None => None,
        Some(raw) => Some(
            u32::try_from(raw)
                .ok()
                .and_then(ReasonId::from_raw)
                .ok_or_else(|| out_of_range(15, raw))?,
        ),
    };
    let log_line = row.get::<_, i64>(2)?;

    Ok(PacketObservation {
        id: observation_id(row, 0)?.ok_or_else(|| out_of_range(0, 0))?,
        observing_system: required_system_id(row, 1)?,
        log_line: u64::try_from(log_line).map_err(|_| out_of_range(2, log_line))?,
        direction,
        timestamp: row.get(4)?,
        protocol: row.get(5)?,
        hash: ContentHash::new(row.get::<_, String>(6)?),
        source_address: address(row, 7)?,
        destination_address: address(row, 8)?,
        source_system: system_id(row, 9)?,
        destination_system: system_id(row, 10)?,
        true_source: system_id(row, 11)?,
        true_destination: system_id(row, 12)?,
        next_hop: observation_id(row, 13)?,
        failed: row.get(14)?,
        reason,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::store::tests::observation;
    use crate::error::{ConfigurationError, StoreError, TraceError};

    fn registry() -> SystemRegistry {
        let mut registry = SystemRegistry::new();
        registry.register(
            "gateA",
            Ipv4Addr::new(10, 1, 0, 1),
            Some(NatRange {
                base: Ipv4Addr::new(172, 1, 0, 0),
                mask: Ipv4Addr::new(255, 255, 0, 0),
            }),
        );
        registry.register("ext1", Ipv4Addr::new(172, 3, 0, 1), None);
        registry
    }

    #[test]
    fn saved_run_loads_back_identically() {
        let registry = registry();
        let store = PacketStore::new();
        let sent = store.append(observation(1, Direction::Sent, 10, "h1"));
        let recv = store.append(observation(2, Direction::Received, 11, "h1"));
        let lost = store.append(observation(2, Direction::Sent, 12, "h2"));
        store.claim_next_hop(sent, recv).unwrap();
        store.mark_failed(lost, "no matching receive found").unwrap();
        store.fill_true_endpoints(recv, None, Some(SystemId::from_index(1))).unwrap();

        let mut db = TraceDatabase::open_in_memory().unwrap();
        db.create_schema().unwrap();
        assert!(!db.has_trace().unwrap());
        db.save(&registry, &store).unwrap();
        assert!(db.has_trace().unwrap());

        let (loaded_registry, loaded_store) = db.load().unwrap();
        assert_eq!(loaded_registry.systems().collect::<Vec<_>>(), registry.systems().collect::<Vec<_>>());
        assert_eq!(loaded_store.observations(), store.observations());
        assert_eq!(loaded_store.reasons(), store.reasons());
        assert_eq!(loaded_store.predecessor(recv).unwrap(), Some(sent));
        assert_eq!(loaded_store.unresolved_sends().count(), 0);
    }

    #[test]
    fn second_predecessor_in_database_is_rejected() {
        let registry = registry();
        let store = PacketStore::new();
        let a = store.append(observation(1, Direction::Sent, 10, "h1"));
        store.append(observation(1, Direction::Sent, 10, "h1"));
        let recv = store.append(observation(2, Direction::Received, 11, "h1"));
        store.claim_next_hop(a, recv).unwrap();

        let mut db = TraceDatabase::open_in_memory().unwrap();
        db.create_schema().unwrap();
        db.save(&registry, &store).unwrap();
        db.conn
            .execute("UPDATE packets SET next_hop_id = ?1 WHERE id = 2", params![recv.get() as i64])
            .unwrap();

        assert!(matches!(
            db.load(),
            Err(TraceError::Store(StoreError::CorruptLink(_)))
        ));
    }

    #[test]
    fn system_id_gap_is_reported_on_load() {
        let mut db = TraceDatabase::open_in_memory().unwrap();
        db.create_schema().unwrap();
        db.save(&registry(), &PacketStore::new()).unwrap();
        db.conn.execute("UPDATE systems SET id = 5 WHERE id = 2", []).unwrap();

        assert!(matches!(
            db.load(),
            Err(TraceError::Configuration(ConfigurationError::CorruptSystem { name, .. })) if name == "ext1"
        ));
    }

    #[test]
    fn bare_schema_is_not_a_trace() {
        let db = TraceDatabase::open_in_memory().unwrap();
        assert!(!db.has_trace().unwrap());
        db.create_schema().unwrap();
        assert!(!db.has_trace().unwrap());
    }

    #[test]
    fn file_database_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trace.db");
        {
            let mut db = TraceDatabase::open(&path).unwrap();
            db.create_schema().unwrap();
            let store = PacketStore::new();
            store.append(observation(1, Direction::Sent, 10, "h1"));
            db.save(&registry(), &store).unwrap();
        }

        let db = TraceDatabase::open(&path).unwrap();
        assert!(db.has_trace().unwrap());
        assert_eq!(db.load().unwrap().1.len(), 1);
    }
}
