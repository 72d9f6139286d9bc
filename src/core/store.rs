use std::collections::{BTreeSet, HashMap};
use std::ops::{Bound, RangeInclusive};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use parking_lot::{Mutex, RwLock};

use crate::error::{StoreError, StoreResult};
use crate::model::{
    ContentHash, Direction, NewObservation, ObservationId, PacketObservation, ProtocolId, ReasonId, SystemId,
    Timestamp,
};

const UNSET: u64 = 0;

/// One stored observation. Core fields never change after append; links and
/// resolution results are atomics so matchers can update them under a shared lock.
#[derive(Debug)]
struct Slot {
    core: NewObservation,
    next_hop: AtomicU64,
    claimed_by: AtomicU64,
    true_source: AtomicU32,
    true_destination: AtomicU32,
    failed: AtomicBool,
    reason: AtomicU32,
}

impl Slot {
    fn new(core: NewObservation) -> Self {
        Self {
            true_source: AtomicU32::new(core.true_source.map_or(0, SystemId::get)),
            true_destination: AtomicU32::new(core.true_destination.map_or(0, SystemId::get)),
            reason: AtomicU32::new(core.reason.map_or(0, ReasonId::get)),
            next_hop: AtomicU64::new(UNSET),
            claimed_by: AtomicU64::new(UNSET),
            failed: AtomicBool::new(false),
            core,
        }
    }

    fn next_hop(&self) -> Option<ObservationId> {
        ObservationId::from_raw(self.next_hop.load(Ordering::Acquire))
    }

    fn claimed_by(&self) -> Option<ObservationId> {
        ObservationId::from_raw(self.claimed_by.load(Ordering::Acquire))
    }

    fn snapshot(&self, id: ObservationId) -> PacketObservation {
        let core = &self.core;
        PacketObservation {
            id,
            observing_system: core.observing_system,
            direction: core.direction,
            timestamp: core.timestamp,
            protocol: core.protocol,
            source_address: core.source_address,
            destination_address: core.destination_address,
            source_system: core.source_system,
            destination_system: core.destination_system,
            true_source: SystemId::from_raw(self.true_source.load(Ordering::Acquire)),
            true_destination: SystemId::from_raw(self.true_destination.load(Ordering::Acquire)),
            hash: core.hash.clone(),
            next_hop: self.next_hop(),
            failed: self.failed.load(Ordering::Acquire),
            reason: ReasonId::from_raw(self.reason.load(Ordering::Acquire)),
            log_line: core.log_line,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct MatchKey {
    source: SystemId,
    destination: SystemId,
    protocol: ProtocolId,
    hash: ContentHash,
}

#[derive(Debug, Default)]
struct StoreInner {
    slots: Vec<Slot>,
    receives_by_key: HashMap<MatchKey, Vec<ObservationId>>,
    sends: BTreeSet<(SystemId, ObservationId)>,
}

impl StoreInner {
    fn slot(&self, id: ObservationId) -> StoreResult<&Slot> {
        self.slots.get(id.index()).ok_or(StoreError::NotFound(id))
    }

    fn push(&mut self, slot: Slot) -> ObservationId {
        let id = ObservationId::from_index(self.slots.len());
        let core = &slot.core;
        match core.direction {
            Direction::Sent => {
                self.sends.insert((core.observing_system, id));
            }
            Direction::Received => {
                if let (Some(source), Some(destination)) = (core.source_system, core.destination_system) {
                    let key = MatchKey {
                        source,
                        destination,
                        protocol: core.protocol,
                        hash: core.hash.clone(),
                    };
                    self.receives_by_key.entry(key).or_default().push(id);
                }
            }
        }
        self.slots.push(slot);
        id
    }
}

#[derive(Debug, Default)]
struct ReasonTable {
    by_text: HashMap<String, ReasonId>,
    texts: Vec<String>,
}

/// Lookup keys for [`PacketStore::find_candidate_receives`].
#[derive(Debug, Clone)]
pub struct CandidateQuery<'a> {
    pub source_system: SystemId,
    pub destination_system: SystemId,
    pub hash: &'a ContentHash,
    pub protocol: ProtocolId,
    pub exclude_system: SystemId,
    pub window: RangeInclusive<Timestamp>,
}

/// Arena of packet observations with the indexes the matcher needs.
///
/// Appends serialize on the write lock, which also assigns ids. Everything
/// else, including link claims, runs under the read lock.
#[derive(Debug, Default)]
pub struct PacketStore {
    inner: RwLock<StoreInner>,
    reasons: Mutex<ReasonTable>,
}

impl PacketStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&self, observation: NewObservation) -> ObservationId {
        self.inner.write().push(Slot::new(observation))
    }

    pub fn len(&self) -> usize {
        self.inner.read().slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn fetch(&self, id: ObservationId) -> StoreResult<PacketObservation> {
        let inner = self.inner.read();
        Ok(inner.slot(id)?.snapshot(id))
    }

    pub fn next_hop(&self, id: ObservationId) -> StoreResult<Option<ObservationId>> {
        Ok(self.inner.read().slot(id)?.next_hop())
    }

    /// The observation whose next hop is `id`, if any.
    pub fn predecessor(&self, id: ObservationId) -> StoreResult<Option<ObservationId>> {
        Ok(self.inner.read().slot(id)?.claimed_by())
    }

    /// Unclaimed receives matching the query, ordered receives-that-already-
    /// forward first, then by id. Claimed receives are never offered.
    pub fn find_candidate_receives(&self, query: &CandidateQuery<'_>) -> Vec<ObservationId> {
        let inner = self.inner.read();
        let key = MatchKey {
            source: query.source_system,
            destination: query.destination_system,
            protocol: query.protocol,
            hash: query.hash.clone(),
        };
        let Some(ids) = inner.receives_by_key.get(&key) else {
            return Vec::new();
        };

        let mut candidates: Vec<(bool, ObservationId)> = ids
            .iter()
            .filter_map(|id| {
                let slot = &inner.slots[id.index()];
                let eligible = slot.core.observing_system != query.exclude_system
                    && query.window.contains(&slot.core.timestamp)
                    && slot.claimed_by().is_none();
                eligible.then(|| (slot.next_hop().is_some(), *id))
            })
            .collect();

        candidates.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));
        candidates.into_iter().map(|(_, id)| id).collect()
    }

    /// Sent observations that are neither linked nor failed, in
    /// (observing system, id) order. Each step reads current state.
    pub fn unresolved_sends(&self) -> UnresolvedSends<'_> {
        UnresolvedSends { store: self, after: None }
    }

    pub fn observing_system(&self, id: ObservationId) -> StoreResult<SystemId> {
        Ok(self.inner.read().slot(id)?.core.observing_system)
    }

    /// Links `from -> to`. Exclusive on both ends: `to` may have only one
    /// predecessor and `from` only one next hop.
    pub fn claim_next_hop(&self, from: ObservationId, to: ObservationId) -> StoreResult<()> {
        if from == to {
            return Err(StoreError::SelfLink(from));
        }
        let inner = self.inner.read();
        let source = inner.slot(from)?;
        let target = inner.slot(to)?;

        if let Err(holder) = target
            .claimed_by
            .compare_exchange(UNSET, from.get(), Ordering::AcqRel, Ordering::Acquire)
        {
            return Err(StoreError::AlreadyClaimed {
                from,
                to,
                holder: ObservationId::from_raw(holder).ok_or(StoreError::NotFound(to))?,
            });
        }

        if let Err(existing) = source
            .next_hop
            .compare_exchange(UNSET, to.get(), Ordering::AcqRel, Ordering::Acquire)
        {
            target.claimed_by.store(UNSET, Ordering::Release);
            return Err(StoreError::AlreadyLinked {
                from,
                to,
                existing: ObservationId::from_raw(existing).ok_or(StoreError::NotFound(from))?,
            });
        }

        Ok(())
    }

    pub fn mark_failed(&self, id: ObservationId, reason: &str) -> StoreResult<ReasonId> {
        let reason_id = self.intern_reason(reason);
        let inner = self.inner.read();
        let slot = inner.slot(id)?;
        slot.failed.store(true, Ordering::Release);
        slot.reason.store(reason_id.get(), Ordering::Release);
        Ok(reason_id)
    }

    /// Fills the true endpoints of `id` where they are still absent. Existing
    /// values are left alone. Returns whether anything changed.
    pub fn fill_true_endpoints(
        &self,
        id: ObservationId,
        source: Option<SystemId>,
        destination: Option<SystemId>,
    ) -> StoreResult<bool> {
        let inner = self.inner.read();
        let slot = inner.slot(id)?;
        let mut changed = false;
        for (field, value) in [(&slot.true_source, source), (&slot.true_destination, destination)] {
            if let Some(value) = value {
                changed |= field
                    .compare_exchange(0, value.get(), Ordering::AcqRel, Ordering::Acquire)
                    .is_ok();
            }
        }
        Ok(changed)
    }

    /// Sent observations that are nobody's next hop, in id order.
    pub fn roots(&self) -> impl Iterator<Item = ObservationId> + '_ {
        let len = self.len();
        (0..len).map(ObservationId::from_index).filter(move |id| {
            let inner = self.inner.read();
            let slot = &inner.slots[id.index()];
            slot.core.direction == Direction::Sent && slot.claimed_by().is_none()
        })
    }

    /// Every observation, in id order.
    pub fn observations(&self) -> Vec<PacketObservation> {
        let inner = self.inner.read();
        inner
            .slots
            .iter()
            .enumerate()
            .map(|(index, slot)| slot.snapshot(ObservationId::from_index(index)))
            .collect()
    }

    /// Returns the id for `text`, adding it on first use.
    pub fn intern_reason(&self, text: &str) -> ReasonId {
        let mut table = self.reasons.lock();
        if let Some(id) = table.by_text.get(text) {
            return *id;
        }
        let id = ReasonId::from_index(table.texts.len());
        table.texts.push(text.to_string());
        table.by_text.insert(text.to_string(), id);
        id
    }

    pub fn reason_text(&self, id: ReasonId) -> Option<String> {
        self.reasons.lock().texts.get(id.get() as usize - 1).cloned()
    }

    pub fn reasons(&self) -> Vec<(ReasonId, String)> {
        let table = self.reasons.lock();
        table
            .texts
            .iter()
            .enumerate()
            .map(|(index, text)| (ReasonId::from_index(index), text.clone()))
            .collect()
    }

    /// Rebuilds a store from persisted observations (dense ids from 1) and
    /// reasons, re-checking that no observation has two predecessors.
    pub fn restore(observations: Vec<PacketObservation>, reasons: Vec<String>) -> StoreResult<Self> {
        let store = Self::new();
        for text in &reasons {
            store.intern_reason(text);
        }

        {
            let mut inner = store.inner.write();
            for observation in &observations {
                let core = NewObservation {
                    observing_system: observation.observing_system,
                    direction: observation.direction,
                    timestamp: observation.timestamp,
                    protocol: observation.protocol,
                    source_address: observation.source_address,
                    destination_address: observation.destination_address,
                    source_system: observation.source_system,
                    destination_system: observation.destination_system,
                    true_source: observation.true_source,
                    true_destination: observation.true_destination,
                    hash: observation.hash.clone(),
                    reason: observation.reason,
                    log_line: observation.log_line,
                };
                let slot = Slot::new(core);
                slot.failed.store(observation.failed, Ordering::Relaxed);
                if inner.push(slot) != observation.id {
                    return Err(StoreError::CorruptLink(observation.id));
                }
            }
        }

        for observation in &observations {
            if let Some(next) = observation.next_hop {
                store
                    .claim_next_hop(observation.id, next)
                    .map_err(|_| StoreError::CorruptLink(observation.id))?;
            }
        }

        Ok(store)
    }
}

/// Restartable cursor over unresolved sends. See [`PacketStore::unresolved_sends`].
pub struct UnresolvedSends<'a> {
    store: &'a PacketStore,
    after: Option<(SystemId, ObservationId)>,
}

impl Iterator for UnresolvedSends<'_> {
    type Item = ObservationId;

    fn next(&mut self) -> Option<ObservationId> {
        let inner = self.store.inner.read();
        let lower = match self.after {
            Some(key) => Bound::Excluded(key),
            None => Bound::Unbounded,
        };
        let found = inner
            .sends
            .range((lower, Bound::Unbounded))
            .find(|(_, id)| {
                let slot = &inner.slots[id.index()];
                !slot.failed.load(Ordering::Acquire) && slot.next_hop().is_none()
            })
            .copied();
        self.after = found;
        found.map(|(_, id)| id)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use std::sync::Arc;

    pub(crate) fn system(raw: u32) -> SystemId {
        SystemId::from_raw(raw).unwrap()
    }

    pub(crate) fn observation(observer: u32, direction: Direction, timestamp: Timestamp, hash: &str) -> NewObservation {
        NewObservation {
            observing_system: system(observer),
            direction,
            timestamp,
            protocol: 6,
            source_address: Ipv4Addr::new(10, 0, 0, 1),
            destination_address: Ipv4Addr::new(10, 0, 0, 2),
            source_system: Some(system(1)),
            destination_system: Some(system(2)),
            true_source: None,
            true_destination: None,
            hash: ContentHash::from(hash),
            reason: None,
            log_line: 1,
        }
    }

    fn query(hash: &ContentHash, window: RangeInclusive<Timestamp>) -> CandidateQuery<'_> {
        CandidateQuery {
            source_system: system(1),
            destination_system: system(2),
            hash,
            protocol: 6,
            exclude_system: system(1),
            window,
        }
    }

    #[test]
    fn ids_are_dense_and_start_at_one() {
        let store = PacketStore::new();
        let a = store.append(observation(1, Direction::Sent, 10, "h1"));
        let b = store.append(observation(2, Direction::Received, 11, "h1"));

        assert_eq!((a.get(), b.get()), (1, 2));
        assert_eq!(store.fetch(b).unwrap().timestamp, 11);
        assert!(store.fetch(ObservationId::from_index(5)).is_err());
    }

    #[test]
    fn second_claim_on_same_source_or_target_fails() {
        let store = PacketStore::new();
        let sent = store.append(observation(1, Direction::Sent, 10, "h1"));
        let other = store.append(observation(1, Direction::Sent, 10, "h1"));
        let recv = store.append(observation(2, Direction::Received, 10, "h1"));
        let recv2 = store.append(observation(2, Direction::Received, 10, "h1"));

        store.claim_next_hop(sent, recv).unwrap();

        assert_eq!(
            store.claim_next_hop(sent, recv2),
            Err(StoreError::AlreadyLinked { from: sent, to: recv2, existing: recv })
        );
        assert_eq!(
            store.claim_next_hop(other, recv),
            Err(StoreError::AlreadyClaimed { from: other, to: recv, holder: sent })
        );
        // failed source claim must not leave recv2 claimed
        assert_eq!(store.predecessor(recv2).unwrap(), None);
        assert_eq!(store.predecessor(recv).unwrap(), Some(sent));
    }

    #[test]
    fn candidates_respect_window_system_and_claims() {
        let store = PacketStore::new();
        let hash = ContentHash::from("h1");
        let sent = store.append(observation(1, Direction::Sent, 100, "h1"));
        let own = store.append(observation(1, Direction::Received, 100, "h1"));
        let early = store.append(observation(2, Direction::Received, 94, "h1"));
        let edge = store.append(observation(2, Direction::Received, 105, "h1"));
        let inside = store.append(observation(2, Direction::Received, 101, "h1"));

        let found = store.find_candidate_receives(&query(&hash, 95..=105));
        assert_eq!(found, vec![edge, inside]);
        assert!(!found.contains(&own));
        assert!(!found.contains(&early));

        store.claim_next_hop(sent, edge).unwrap();
        assert_eq!(store.find_candidate_receives(&query(&hash, 95..=105)), vec![inside]);
    }

    #[test]
    fn candidates_prefer_receives_that_already_forward() {
        let store = PacketStore::new();
        let hash = ContentHash::from("h1");
        let plain = store.append(observation(2, Direction::Received, 100, "h1"));
        let forwarding = store.append(observation(2, Direction::Received, 100, "h1"));
        let onward = store.append(observation(2, Direction::Sent, 100, "h1"));
        store.claim_next_hop(forwarding, onward).unwrap();

        assert_eq!(store.find_candidate_receives(&query(&hash, 90..=110)), vec![forwarding, plain]);
    }

    #[test]
    fn unresolved_sends_follow_system_then_id_and_reflect_updates() {
        let store = PacketStore::new();
        let s3 = store.append(observation(3, Direction::Sent, 1, "a"));
        let s1 = store.append(observation(1, Direction::Sent, 1, "b"));
        store.append(observation(2, Direction::Received, 1, "b"));
        let s1b = store.append(observation(1, Direction::Sent, 1, "c"));

        assert_eq!(store.unresolved_sends().collect::<Vec<_>>(), vec![s1, s1b, s3]);

        store.mark_failed(s1, "no matching receive found").unwrap();
        let mut cursor = store.unresolved_sends();
        assert_eq!(cursor.next(), Some(s1b));
        store.mark_failed(s3, "gone").unwrap();
        assert_eq!(cursor.next(), None);
        assert_eq!(store.unresolved_sends().collect::<Vec<_>>(), vec![s1b]);
    }

    #[test]
    fn reasons_are_deduplicated() {
        let store = PacketStore::new();
        let a = store.append(observation(1, Direction::Sent, 1, "a"));
        let b = store.append(observation(1, Direction::Sent, 1, "b"));

        let first = store.mark_failed(a, "no matching receive found").unwrap();
        let second = store.mark_failed(b, "no matching receive found").unwrap();

        assert_eq!(first, second);
        assert_eq!(store.reasons().len(), 1);
        assert!(store.fetch(b).unwrap().failed);
        assert_eq!(store.reason_text(first).as_deref(), Some("no matching receive found"));
    }

    #[test]
    fn roots_skip_receives_and_linked_targets() {
        let store = PacketStore::new();
        let root = store.append(observation(1, Direction::Sent, 1, "a"));
        let recv = store.append(observation(2, Direction::Received, 1, "a"));
        let forwarded = store.append(observation(2, Direction::Sent, 1, "a"));
        store.claim_next_hop(root, recv).unwrap();
        store.claim_next_hop(recv, forwarded).unwrap();
        let lone = store.append(observation(3, Direction::Sent, 1, "z"));

        assert_eq!(store.roots().collect::<Vec<_>>(), vec![root, lone]);
    }

    #[test]
    fn fill_only_sets_absent_endpoints() {
        let store = PacketStore::new();
        let mut known = observation(1, Direction::Sent, 1, "a");
        known.true_source = Some(system(1));
        let id = store.append(known);

        assert!(store.fill_true_endpoints(id, Some(system(7)), Some(system(2))).unwrap());
        let stored = store.fetch(id).unwrap();
        assert_eq!(stored.true_source, Some(system(1)));
        assert_eq!(stored.true_destination, Some(system(2)));
        assert!(!store.fill_true_endpoints(id, Some(system(1)), Some(system(2))).unwrap());
    }

    #[test]
    fn concurrent_appends_get_unique_ids() {
        let store = Arc::new(PacketStore::new());
        std::thread::scope(|scope| {
            for observer in 1..=4 {
                let store = Arc::clone(&store);
                scope.spawn(move || {
                    for t in 0..250 {
                        store.append(observation(observer, Direction::Sent, t, "x"));
                    }
                });
            }
        });

        let ids: BTreeSet<u64> = store.observations().iter().map(|o| o.id.get()).collect();
        assert_eq!(ids.len(), 1000);
        assert_eq!(store.unresolved_sends().count(), 1000);
    }

    #[test]
    fn concurrent_claims_on_one_receive_have_single_winner() {
        let store = PacketStore::new();
        let recv = store.append(observation(2, Direction::Received, 1, "a"));
        let sends: Vec<ObservationId> = (0..8).map(|_| store.append(observation(1, Direction::Sent, 1, "a"))).collect();

        let winners: usize = std::thread::scope(|scope| {
            let handles: Vec<_> = sends
                .iter()
                .map(|sent| {
                    let store = &store;
                    scope.spawn(move || store.claim_next_hop(*sent, recv).is_ok())
                })
                .collect();
            handles.into_iter().map(|h| usize::from(h.join().unwrap())).sum()
        });

        assert_eq!(winners, 1);
        let holder = store.predecessor(recv).unwrap().unwrap();
        assert_eq!(store.next_hop(holder).unwrap(), Some(recv));
    }

    #[test]
    fn restore_rejects_double_predecessor() {
        let store = PacketStore::new();
        let a = store.append(observation(1, Direction::Sent, 1, "a"));
        let b = store.append(observation(1, Direction::Sent, 1, "a"));
        let r = store.append(observation(2, Direction::Received, 1, "a"));
        store.claim_next_hop(a, r).unwrap();

        let mut snapshot = store.observations();
        snapshot[b.index()].next_hop = Some(r);

        assert_eq!(PacketStore::restore(snapshot, Vec::new()).err(), Some(StoreError::CorruptLink(b)));
    }
}
