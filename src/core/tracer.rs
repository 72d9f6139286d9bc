use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::net::Ipv4Addr;
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::TracerConfig;
use crate::core::observability::{MatchOutcome, RunCounters};
use crate::core::phase_timer;
use crate::core::registry::SystemRegistry;
use crate::core::store::{CandidateQuery, PacketStore};
use crate::error::{ConfigResult, ConfigurationError, StoreError, TraceError, TraceResult};
use crate::ingest::{
    ClientEvent, GatewayEvent, GatewayFlow, GatewayModule, GatewayResult, ObservationRecord, PacketHeader,
    RecordBody, RecordSource,
};
use crate::model::{Direction, NewObservation, ObservationId, Role, System, SystemId};

pub const NO_MATCH_REASON: &str = "no matching receive found";
pub const LOST_CLAIM_REASON: &str = "lost claim race";

const PROGRESS_EVERY: u64 = 1000;

/// Totals of one matching pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MatchSummary {
    pub attempted: u64,
    pub linked: u64,
    pub ambiguous: u64,
    pub failed: u64,
    pub lost_claims: u64,
}

impl MatchSummary {
    fn merge(&mut self, other: MatchSummary) {
        self.attempted += other.attempted;
        self.linked += other.linked;
        self.ambiguous += other.ambiguous;
        self.failed += other.failed;
        self.lost_claims += other.lost_claims;
    }
}

/// Turns host records into observations, then links every send to the
/// receive it produced elsewhere.
pub struct Tracer {
    registry: Arc<SystemRegistry>,
    store: Arc<PacketStore>,
    counters: Arc<RunCounters>,
    config: TracerConfig,
}

impl Tracer {
    pub fn new(
        registry: Arc<SystemRegistry>,
        store: Arc<PacketStore>,
        counters: Arc<RunCounters>,
        config: TracerConfig,
    ) -> Self {
        Self {
            registry,
            store,
            counters,
            config,
        }
    }

    pub fn store(&self) -> &Arc<PacketStore> {
        &self.store
    }

    /// Records every record a source yields. Returns the record count.
    pub async fn record_source<S: RecordSource + ?Sized>(&self, source: &mut S) -> TraceResult<u64> {
        let mut count = 0u64;
        while let Some(record) = source.next_record().await? {
            self.record(&record)?;
            count += 1;
            if count % PROGRESS_EVERY == 0 {
                debug!(host = %source.host(), records = count, "recording");
            }
        }
        info!(host = %source.host(), records = count, "recorded host traffic");
        Ok(count)
    }

    /// Stores the observations one record describes and returns their ids.
    pub fn record(&self, record: &ObservationRecord) -> TraceResult<Vec<ObservationId>> {
        let this = self
            .registry
            .resolve_by_name(&record.host)
            .and_then(|id| self.registry.get(id))
            .ok_or_else(|| ConfigurationError::UnknownSystem(record.host.clone()))?;

        let ids = match (&record.body, this.role) {
            (RecordBody::Client(event), Role::ProtectedClient | Role::ExternalClient) => {
                vec![self.record_client(this, record, event)?]
            }
            (RecordBody::Gateway(event), Role::Gateway) => self.record_gateway(this, record, event)?,
            _ => {
                warn!(host = %record.host, line = record.line, "record kind does not match host role, skipped");
                self.counters.record_skipped();
                Vec::new()
            }
        };
        Ok(ids)
    }

    fn append(&self, observation: NewObservation) -> ObservationId {
        self.counters.record_observation();
        self.store.append(observation)
    }

    fn record_client(
        &self,
        this: &System,
        record: &ObservationRecord,
        event: &ClientEvent,
    ) -> TraceResult<ObservationId> {
        let peer = self.registry.resolve_by_address(event.peer)?;

        // A protected client always talks through its gateway but knows who it
        // really talks to; an external client only knows the next hop.
        let (adjacent, true_peer) = match this.role {
            Role::ProtectedClient => {
                let gateway = self.registry.gateway_of(this.id).ok_or_else(|| ConfigurationError::MissingGateway {
                    client: this.name.clone(),
                    gateway: format!("gate{}", this.network().unwrap_or('?')),
                })?;
                (Some(gateway), self.true_endpoint(event.peer)?)
            }
            _ => (peer, None),
        };

        let (source_address, destination_address, source_system, destination_system, true_source, true_destination) =
            match event.direction {
                Direction::Sent => (
                    this.internal_address,
                    event.peer,
                    Some(this.id),
                    adjacent,
                    Some(this.id),
                    true_peer,
                ),
                Direction::Received => (
                    event.peer,
                    this.internal_address,
                    adjacent,
                    Some(this.id),
                    true_peer,
                    Some(this.id),
                ),
            };

        Ok(self.append(NewObservation {
            observing_system: this.id,
            direction: event.direction,
            timestamp: record.timestamp,
            protocol: event.protocol,
            source_address,
            destination_address,
            source_system,
            destination_system,
            true_source,
            true_destination,
            hash: event.hash.clone(),
            reason: None,
            log_line: record.line,
        }))
    }

    fn record_gateway(
        &self,
        this: &System,
        record: &ObservationRecord,
        event: &GatewayEvent,
    ) -> TraceResult<Vec<ObservationId>> {
        let reason_text = match event.result {
            GatewayResult::Accept => event.reason.clone(),
            GatewayResult::Reject => format!("{} (rejected)", event.reason),
        };
        let reason = Some(self.store.intern_reason(&reason_text));
        let admin = event.module == GatewayModule::Admin;
        let observation = |direction: Direction,
                           packet: &PacketHeader,
                           source_system: Option<SystemId>,
                           destination_system: Option<SystemId>,
                           truth: Truth| {
            NewObservation {
                observing_system: this.id,
                direction,
                timestamp: record.timestamp,
                protocol: packet.protocol,
                source_address: packet.source,
                destination_address: packet.destination,
                source_system,
                destination_system,
                true_source: truth.0,
                true_destination: truth.1,
                hash: packet.hash.clone(),
                reason,
                log_line: record.line,
            }
        };

        let inbound = match &event.inbound {
            Some(packet) => {
                let source = self.registry.resolve_by_address(packet.source)?;
                let truth = match (event.flow, admin, &event.outbound) {
                    (GatewayFlow::Outbound, _, _) => Truth(source, self.true_endpoint(packet.destination)?),
                    (GatewayFlow::Inbound, true, _) => Truth(source, Some(this.id)),
                    (GatewayFlow::Inbound, false, Some(out)) => self.truth_of(out)?,
                    (GatewayFlow::Inbound, false, None) => Truth(None, None),
                };
                Some(self.append(observation(Direction::Received, packet, source, Some(this.id), truth)))
            }
            None => None,
        };

        let outbound = match &event.outbound {
            Some(packet) => {
                let destination = self.registry.resolve_by_address(packet.destination)?;
                let truth = match (event.flow, admin, &event.inbound) {
                    (_, true, _) => Truth(Some(this.id), destination),
                    (GatewayFlow::Outbound, false, Some(inp)) => self.truth_of(inp)?,
                    (GatewayFlow::Outbound, false, None) => Truth(None, None),
                    (GatewayFlow::Inbound, false, _) => self.truth_of(packet)?,
                };
                Some(self.append(observation(Direction::Sent, packet, Some(this.id), destination, truth)))
            }
            None => None,
        };

        let mut ids = Vec::with_capacity(2);
        if let Some(inbound) = inbound {
            ids.push(inbound);
        }
        if let Some(outbound) = outbound {
            ids.push(outbound);
        }
        if let (Some(from), Some(to)) = (inbound, outbound) {
            // The gateway itself asserts this correspondence.
            self.store.claim_next_hop(from, to)?;
            self.counters.record_gateway_link();
        }
        Ok(ids)
    }

    fn truth_of(&self, packet: &PacketHeader) -> ConfigResult<Truth> {
        Ok(Truth(self.true_endpoint(packet.source)?, self.true_endpoint(packet.destination)?))
    }

    /// Identity of the host ultimately behind `address`. An address in a
    /// gateway's external range stands for the gateway's only protected
    /// client; with several clients behind it the endpoint stays unknown.
    fn true_endpoint(&self, address: Ipv4Addr) -> ConfigResult<Option<SystemId>> {
        let Some(id) = self.registry.resolve_by_address(address)? else {
            return Ok(None);
        };
        let Some(system) = self.registry.get(id) else {
            return Ok(None);
        };
        if system.role != Role::Gateway || system.internal_address == address {
            return Ok(Some(id));
        }

        let Some(letter) = system.network() else {
            return Ok(Some(id));
        };
        let mut behind = self.registry.protected_clients_on(letter);
        Ok(match (behind.next(), behind.next()) {
            (None, _) => Some(id),
            (Some(only), None) => Some(only.id),
            (Some(_), Some(_)) => None,
        })
    }

    /// Links every unresolved send, or marks it failed.
    pub fn match_all(&self) -> TraceResult<MatchSummary> {
        let _timer = phase_timer("matching");
        let summary = if self.config.match_workers > 1 {
            self.match_sharded(self.config.match_workers)?
        } else {
            self.match_sequential()?
        };

        info!(
            attempted = summary.attempted,
            linked = summary.linked,
            ambiguous = summary.ambiguous,
            lost_claims = summary.lost_claims,
            "matching finished"
        );
        if summary.failed > 0 {
            warn!(failed = summary.failed, "sent packets without a matching receive");
        }
        Ok(summary)
    }

    fn match_sequential(&self) -> TraceResult<MatchSummary> {
        let mut summary = MatchSummary::default();
        loop {
            let before = summary.attempted;
            for sent in self.store.unresolved_sends() {
                self.match_into(sent, &mut summary)?;
            }
            if summary.attempted == before {
                return Ok(summary);
            }
        }
    }

    /// Sends only ever compete for receives carrying their own hash, so
    /// sharding by hash keeps every shard independent and the result equal
    /// to the sequential pass.
    fn match_sharded(&self, workers: usize) -> TraceResult<MatchSummary> {
        let mut shards: Vec<Vec<ObservationId>> = vec![Vec::new(); workers];
        for sent in self.store.unresolved_sends() {
            let hash = self.store.fetch(sent)?.hash;
            let mut hasher = DefaultHasher::new();
            hash.hash(&mut hasher);
            shards[(hasher.finish() % workers as u64) as usize].push(sent);
        }

        let results: Vec<TraceResult<MatchSummary>> = std::thread::scope(|scope| {
            let handles: Vec<_> = shards
                .into_iter()
                .map(|shard| {
                    scope.spawn(move || -> TraceResult<MatchSummary> {
                        let mut summary = MatchSummary::default();
                        for sent in shard {
                            self.match_into(sent, &mut summary)?;
                        }
                        Ok(summary)
                    })
                })
                .collect();
            handles
                .into_iter()
                .map(|handle| handle.join().unwrap_or_else(|panic| std::panic::resume_unwind(panic)))
                .collect()
        });

        let mut summary = MatchSummary::default();
        for result in results {
            summary.merge(result?);
        }
        // Anything a shard could not settle is picked up sequentially.
        summary.merge(self.match_sequential()?);
        Ok(summary)
    }

    fn match_into(&self, sent: ObservationId, summary: &mut MatchSummary) -> TraceResult<()> {
        let (outcome, lost) = self.match_send(sent)?;
        summary.lost_claims += lost;
        let Some(outcome) = outcome else {
            return Ok(());
        };
        summary.attempted += 1;
        match outcome {
            MatchOutcome::Linked => summary.linked += 1,
            MatchOutcome::Ambiguous => {
                summary.linked += 1;
                summary.ambiguous += 1;
            }
            MatchOutcome::Failed => summary.failed += 1,
        }
        if summary.attempted % PROGRESS_EVERY == 0 {
            debug!(attempted = summary.attempted, "tracing sent packets");
        }
        Ok(())
    }

    /// Resolves one send. `None` means another matcher already settled it.
    /// Also returns how many claim races were lost on the way.
    pub fn match_send(&self, sent: ObservationId) -> TraceResult<(Option<MatchOutcome>, u64)> {
        let observation = self.store.fetch(sent)?;
        if observation.next_hop.is_some() || observation.failed || !observation.is_send() {
            return Ok((None, 0));
        }

        let (Some(source_system), Some(destination_system)) =
            (observation.source_system, observation.destination_system)
        else {
            debug!(sent = %sent, "next hop identity unknown");
            return self.fail(sent, NO_MATCH_REASON, 0);
        };

        let slack = self.config.time_slack;
        let query = CandidateQuery {
            source_system,
            destination_system,
            hash: &observation.hash,
            protocol: observation.protocol,
            exclude_system: observation.observing_system,
            window: observation.timestamp.saturating_sub(slack)..=observation.timestamp.saturating_add(slack),
        };

        // A lost claim means the receive went to another send for good, so
        // the next query is shorter. Only re-queries that see no such progress
        // count against `claim_retries`.
        let mut lost = 0u64;
        let mut stalls = 0u32;
        let mut previous = usize::MAX;
        loop {
            let candidates = self.store.find_candidate_receives(&query);
            let (chosen, outcome) = match candidates.as_slice() {
                [] => {
                    // settled by a concurrent matcher of the same send
                    if self.store.next_hop(sent)?.is_some() {
                        return Ok((None, lost));
                    }
                    debug!(sent = %sent, hash = %observation.hash, "unable to locate corresponding receive");
                    return self.fail(sent, NO_MATCH_REASON, lost);
                }
                [only] => (*only, MatchOutcome::Linked),
                [first, ..] => {
                    self.ensure_single_system(sent, &candidates)?;
                    warn!(
                        sent = %sent,
                        chosen = %first,
                        candidates = ?candidates,
                        "multiple receives matched, treating as retransmission"
                    );
                    (*first, MatchOutcome::Ambiguous)
                }
            };

            if candidates.len() >= previous {
                stalls += 1;
                if stalls > self.config.claim_retries {
                    warn!(sent = %sent, lost, "claim retries exhausted");
                    return self.fail(sent, LOST_CLAIM_REASON, lost);
                }
            }
            previous = candidates.len();

            match self.store.claim_next_hop(sent, chosen) {
                Ok(()) => {
                    self.counters.record_match(outcome);
                    return Ok((Some(outcome), lost));
                }
                Err(StoreError::AlreadyClaimed { holder, .. }) => {
                    debug!(sent = %sent, receive = %chosen, holder = %holder, "lost claim, re-querying");
                    self.counters.record_lost_claim();
                    lost += 1;
                }
                Err(StoreError::AlreadyLinked { .. }) => return Ok((None, lost)),
                Err(other) => return Err(other.into()),
            }
        }
    }

    fn fail(&self, sent: ObservationId, reason: &str, lost: u64) -> TraceResult<(Option<MatchOutcome>, u64)> {
        self.store.mark_failed(sent, reason)?;
        self.counters.record_match(MatchOutcome::Failed);
        Ok((Some(MatchOutcome::Failed), lost))
    }

    /// A payload cannot legitimately arrive on two systems.
    fn ensure_single_system(&self, sent: ObservationId, candidates: &[ObservationId]) -> TraceResult<()> {
        let mut systems = candidates
            .iter()
            .map(|id| self.store.observing_system(*id))
            .collect::<Result<Vec<_>, _>>()?;
        systems.sort();
        systems.dedup();
        if systems.len() > 1 {
            return Err(TraceError::CrossSystemAmbiguity { sent, systems });
        }
        Ok(())
    }
}

/// (true source, true destination) as far as one record knows them.
#[derive(Debug, Clone, Copy)]
struct Truth(Option<SystemId>, Option<SystemId>);
