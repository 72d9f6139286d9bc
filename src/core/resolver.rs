use std::collections::HashSet;
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info};

use crate::core::observability::RunCounters;
use crate::core::phase_timer;
use crate::core::store::PacketStore;
use crate::error::{EndpointField, StoreResult, TraceError, TraceResult};
use crate::model::{ObservationId, SystemId};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ResolveSummary {
    pub chains: u64,
    /// Observations that gained at least one true endpoint.
    pub filled: u64,
}

/// Spreads each chain's true source and destination to every observation
/// in it. A chain whose members disagree is a hard error.
pub struct TrueEndpointResolver {
    store: Arc<PacketStore>,
    counters: Arc<RunCounters>,
}

impl TrueEndpointResolver {
    pub fn new(store: Arc<PacketStore>, counters: Arc<RunCounters>) -> Self {
        Self { store, counters }
    }

    /// Resolves every chain in the store. Must run after matching is done.
    pub fn resolve_all(&self) -> TraceResult<ResolveSummary> {
        let _timer = phase_timer("resolution");
        let mut summary = ResolveSummary::default();
        let mut visited: HashSet<ObservationId> = HashSet::new();

        for index in 0..self.store.len() {
            let id = ObservationId::from_index(index);
            if visited.contains(&id) {
                continue;
            }
            let chain = self.chain_of(id)?;
            visited.extend(chain.iter().copied());
            summary.filled += self.resolve_chain(&chain)?;
            summary.chains += 1;
        }

        self.counters.record_endpoints_filled(summary.filled);
        info!(chains = summary.chains, filled = summary.filled, "true endpoints resolved");
        Ok(summary)
    }

    /// Resolves only the chain containing `id`. Returns how many
    /// observations gained a value.
    pub fn resolve_observation(&self, id: ObservationId) -> TraceResult<u64> {
        let chain = self.chain_of(id)?;
        let filled = self.resolve_chain(&chain)?;
        self.counters.record_endpoints_filled(filled);
        Ok(filled)
    }

    /// The whole chain `id` belongs to, head first. For a chain closed into
    /// a loop the walk starts right after `id` and stops before repeating.
    pub fn chain_of(&self, id: ObservationId) -> StoreResult<Vec<ObservationId>> {
        let mut head = id;
        let mut seen = HashSet::from([id]);
        while let Some(previous) = self.store.predecessor(head)? {
            if !seen.insert(previous) {
                break;
            }
            head = previous;
        }

        let mut chain = vec![head];
        let mut members = HashSet::from([head]);
        let mut current = head;
        while let Some(next) = self.store.next_hop(current)? {
            if !members.insert(next) {
                break;
            }
            chain.push(next);
            current = next;
        }
        Ok(chain)
    }

    fn resolve_chain(&self, chain: &[ObservationId]) -> TraceResult<u64> {
        let observations = chain
            .iter()
            .map(|id| self.store.fetch(*id))
            .collect::<Result<Vec<_>, _>>()?;

        let source = agreed(
            EndpointField::Source,
            observations.iter().map(|o| (o.id, o.true_source)),
        )?;
        let destination = agreed(
            EndpointField::Destination,
            observations.iter().map(|o| (o.id, o.true_destination)),
        )?;

        let mut filled = 0;
        for observation in &observations {
            if observation.true_source.is_some() && observation.true_destination.is_some() {
                continue;
            }
            if self.store.fill_true_endpoints(observation.id, source, destination)? {
                filled += 1;
            }
        }
        if filled > 0 {
            debug!(head = %chain[0], hops = chain.len(), filled, "chain endpoints filled");
        }
        Ok(filled)
    }
}

/// The single value a chain carries for one field, checked over every member.
fn agreed(
    field: EndpointField,
    values: impl Iterator<Item = (ObservationId, Option<SystemId>)>,
) -> TraceResult<Option<SystemId>> {
    let mut found: Option<(ObservationId, SystemId)> = None;
    for (id, value) in values {
        let Some(value) = value else { continue };
        match found {
            None => found = Some((id, value)),
            Some((first, known)) if known != value => {
                return Err(TraceError::TraceInconsistency {
                    field,
                    first,
                    second: id,
                });
            }
            Some(_) => {}
        }
    }
    Ok(found.map(|(_, value)| value))
}
