use std::collections::HashSet;
use std::fmt::Write as _;
use std::sync::Arc;

use serde::Serialize;
use tracing::{info, warn};

use crate::config::WalkerConfig;
use crate::core::observability::RunCounters;
use crate::core::store::PacketStore;
use crate::error::StoreResult;
use crate::model::{ContentHash, Direction, ObservationId, SystemId, Timestamp};

/// How a chain ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TraceOutcome {
    /// The last observation is a receive.
    Delivered,
    /// The last observation is a send nobody received.
    Lost,
    /// The hop limit was hit or an observation repeated.
    Cyclic,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Hop {
    pub id: ObservationId,
    pub system: SystemId,
    pub direction: Direction,
    pub timestamp: Timestamp,
    pub hash: ContentHash,
}

/// One walked chain, root first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Trace {
    pub root: ObservationId,
    pub hops: Vec<Hop>,
    pub outcome: TraceOutcome,
}

impl Trace {
    pub fn terminal(&self) -> Option<&Hop> {
        match self.outcome {
            TraceOutcome::Cyclic => None,
            _ => self.hops.last(),
        }
    }

    /// Root to terminal, for delivered chains only.
    pub fn elapsed(&self) -> Option<Timestamp> {
        if self.outcome != TraceOutcome::Delivered {
            return None;
        }
        Some(self.hops.last()?.timestamp - self.hops.first()?.timestamp)
    }

    /// Operator view: `Trace of packet 3: 3:<hash> -> 5:<hash>`, two hops per line.
    pub fn render(&self) -> String {
        let mut out = format!("Trace of packet {}: ", self.root);
        let indent = " ".repeat(out.find(':').unwrap_or(1).saturating_sub(1));
        for (n, hop) in self.hops.iter().enumerate() {
            if n != 0 && n % 2 == 0 {
                let _ = write!(out, "\n{}-> ", indent);
            }
            let _ = write!(out, "{}:{} -> ", hop.id, hop.hash);
        }
        match self.outcome {
            TraceOutcome::Delivered => {
                out.truncate(out.len().saturating_sub(4));
            }
            TraceOutcome::Lost => out.push_str("(not received)"),
            TraceOutcome::Cyclic => out.push_str("(cycle limit reached, not done)"),
        }
        out
    }
}

/// Read-only traversal of the finished link graph.
pub struct TraceWalker {
    store: Arc<PacketStore>,
    config: WalkerConfig,
}

impl TraceWalker {
    pub fn new(store: Arc<PacketStore>, config: WalkerConfig) -> Self {
        Self { store, config }
    }

    pub fn roots(&self) -> impl Iterator<Item = ObservationId> + '_ {
        self.store.roots()
    }

    /// Follows next hops from `root`, visiting at most `cycle_limit`
    /// observations. A chain that uses up the whole limit counts as a cycle,
    /// even when its last observation has no next hop.
    pub fn walk(&self, root: ObservationId) -> StoreResult<Trace> {
        let mut hops = Vec::new();
        let mut seen = HashSet::new();
        let mut current = Some(root);

        while let Some(id) = current {
            if hops.len() >= self.config.cycle_limit || !seen.insert(id) {
                return Ok(Trace {
                    root,
                    hops,
                    outcome: TraceOutcome::Cyclic,
                });
            }
            let observation = self.store.fetch(id)?;
            current = observation.next_hop;
            hops.push(Hop {
                id,
                system: observation.observing_system,
                direction: observation.direction,
                timestamp: observation.timestamp,
                hash: observation.hash,
            });
        }

        let outcome = match hops.last().map(|hop| hop.direction) {
            _ if hops.len() >= self.config.cycle_limit => TraceOutcome::Cyclic,
            Some(Direction::Received) => TraceOutcome::Delivered,
            _ => TraceOutcome::Lost,
        };
        Ok(Trace { root, hops, outcome })
    }

    /// Every root's trace, in root order.
    pub fn traces(&self) -> StoreResult<Vec<Trace>> {
        self.roots().map(|root| self.walk(root)).collect()
    }

    /// Walks every root and returns the cyclic traces, logging each.
    pub fn check_all(&self, counters: &RunCounters) -> StoreResult<Vec<Trace>> {
        let mut cyclic = Vec::new();
        let mut walked = 0u64;
        for root in self.roots() {
            walked += 1;
            let trace = self.walk(root)?;
            if trace.outcome == TraceOutcome::Cyclic {
                warn!(root = %root, hops = trace.hops.len(), "cycle detected");
                cyclic.push(trace);
            }
        }

        counters.record_cycles(cyclic.len() as u64);
        if cyclic.is_empty() {
            info!(roots = walked, "no cycles found");
        } else {
            warn!(roots = walked, cycles = cyclic.len(), "traces hit the cycle limit");
        }
        Ok(cyclic)
    }

    /// Loops no root reaches, each listed once starting from its lowest id.
    /// A loop in which every member is someone's next hop has no root at all.
    pub fn orphaned_cycles(&self) -> StoreResult<Vec<Vec<ObservationId>>> {
        let mut reached: HashSet<ObservationId> = HashSet::new();
        for root in self.roots() {
            let mut current = Some(root);
            while let Some(id) = current {
                if !reached.insert(id) {
                    break;
                }
                current = self.store.next_hop(id)?;
            }
        }

        let mut cycles = Vec::new();
        for index in 0..self.store.len() {
            let start = ObservationId::from_index(index);
            if reached.contains(&start) {
                continue;
            }
            let mut path = Vec::new();
            let mut current = Some(start);
            while let Some(id) = current {
                if let Some(position) = path.iter().position(|seen| *seen == id) {
                    cycles.push(path.split_off(position));
                    break;
                }
                if !reached.insert(id) {
                    break;
                }
                path.push(id);
                current = self.store.next_hop(id)?;
            }
        }

        for cycle in &cycles {
            warn!(members = ?cycle, "cycle unreachable from any root");
        }
        Ok(cycles)
    }
}
