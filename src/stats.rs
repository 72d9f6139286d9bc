use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::sync::Arc;

use serde::Serialize;

use crate::config::{TimeRange, WalkerConfig};
use crate::core::observability::CountersSnapshot;
use crate::core::registry::SystemRegistry;
use crate::core::store::PacketStore;
use crate::core::walker::{TraceOutcome, TraceWalker};
use crate::error::StoreResult;
use crate::model::{ContentHash, ObservationId, SystemId, Timestamp};

/// What the statistics side needs to know about one root's chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TraceSummary {
    pub root: ObservationId,
    /// Seconds after the run's first observation.
    pub root_time: Timestamp,
    pub true_source: Option<String>,
    pub true_destination: Option<String>,
    pub outcome: TraceOutcome,
    pub elapsed: Option<Timestamp>,
    pub terminal_hash: Option<ContentHash>,
    pub terminal_system: Option<String>,
    pub terminal_reason: Option<String>,
    pub hops: usize,
    /// Delivered, and the last receive happened on the true destination.
    pub reached_destination: bool,
}

/// Read side over a finished run.
pub struct TraceQuery {
    registry: Arc<SystemRegistry>,
    store: Arc<PacketStore>,
    walker: TraceWalker,
}

impl TraceQuery {
    pub fn new(registry: Arc<SystemRegistry>, store: Arc<PacketStore>, config: WalkerConfig) -> Self {
        let walker = TraceWalker::new(Arc::clone(&store), config);
        Self {
            registry,
            store,
            walker,
        }
    }

    fn name(&self, id: Option<SystemId>) -> Option<String> {
        id.map(|id| self.registry.name_of(id).to_string())
    }

    /// Summaries of every chain whose root falls in `range`, in root order.
    pub fn summaries(&self, range: TimeRange) -> StoreResult<Vec<TraceSummary>> {
        let observations = self.store.observations();
        let origin = observations.iter().map(|o| o.timestamp).min().unwrap_or_default();
        let mut summaries = Vec::new();

        for root in self.walker.roots() {
            let head = &observations[root.index()];
            let root_time = head.timestamp - origin;
            if !range.contains(root_time) {
                continue;
            }

            let trace = self.walker.walk(root)?;
            let terminal = trace.terminal().map(|hop| &observations[hop.id.index()]);
            let reached_destination = trace.outcome == TraceOutcome::Delivered
                && head.true_destination.is_some()
                && terminal.map(|t| t.observing_system) == head.true_destination;

            summaries.push(TraceSummary {
                root,
                root_time,
                true_source: self.name(head.true_source),
                true_destination: self.name(head.true_destination),
                outcome: trace.outcome,
                elapsed: trace.elapsed(),
                terminal_hash: terminal.map(|t| t.hash.clone()),
                terminal_system: terminal.and_then(|t| self.name(Some(t.observing_system))),
                terminal_reason: terminal
                    .and_then(|t| t.reason)
                    .and_then(|reason| self.store.reason_text(reason)),
                hops: trace.hops.len(),
                reached_destination,
            });
        }
        Ok(summaries)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Latency {
    pub min: Timestamp,
    pub mean: f64,
    pub max: Timestamp,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PairStats {
    pub delivered: u64,
    pub lost: u64,
}

/// Aggregate figures for a set of traces. Cyclic traces are counted but
/// left out of latency, pair and reason figures.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RunStats {
    pub traces: u64,
    pub delivered: u64,
    pub reached_destination: u64,
    pub lost: u64,
    pub cyclic: u64,
    pub latency: Option<Latency>,
    pub pairs: BTreeMap<String, PairStats>,
    pub stop_reasons: BTreeMap<String, u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub counters: Option<CountersSnapshot>,
}

impl RunStats {
    pub fn from_summaries(summaries: &[TraceSummary]) -> Self {
        let mut stats = RunStats::default();
        let mut elapsed_total = 0i64;
        let mut elapsed_count = 0i64;

        for summary in summaries {
            stats.traces += 1;
            let pair = format!(
                "{} -> {}",
                summary.true_source.as_deref().unwrap_or("?"),
                summary.true_destination.as_deref().unwrap_or("?")
            );
            match summary.outcome {
                TraceOutcome::Cyclic => {
                    stats.cyclic += 1;
                    continue;
                }
                TraceOutcome::Delivered => {
                    stats.delivered += 1;
                    stats.pairs.entry(pair).or_default().delivered += 1;
                }
                TraceOutcome::Lost => {
                    stats.lost += 1;
                    stats.pairs.entry(pair).or_default().lost += 1;
                }
            }

            if summary.reached_destination {
                stats.reached_destination += 1;
                if let Some(elapsed) = summary.elapsed {
                    elapsed_total += elapsed;
                    elapsed_count += 1;
                    stats.latency = Some(match stats.latency {
                        None => Latency {
                            min: elapsed,
                            mean: 0.0,
                            max: elapsed,
                        },
                        Some(l) => Latency {
                            min: l.min.min(elapsed),
                            mean: 0.0,
                            max: l.max.max(elapsed),
                        },
                    });
                }
            } else {
                let reason = summary.terminal_reason.clone().unwrap_or_else(|| "unknown".to_string());
                *stats.stop_reasons.entry(reason).or_default() += 1;
            }
        }

        if let Some(latency) = stats.latency.as_mut() {
            latency.mean = elapsed_total as f64 / elapsed_count as f64;
        }
        stats
    }

    pub fn with_counters(mut self, counters: CountersSnapshot) -> Self {
        self.counters = Some(counters);
        self
    }

    pub fn render(&self) -> String {
        let mut out = format!(
            "[stats] traces={} delivered={} reached_destination={} lost={} cyclic={}\n",
            self.traces, self.delivered, self.reached_destination, self.lost, self.cyclic
        );
        if let Some(latency) = &self.latency {
            let _ = writeln!(
                out,
                "[stats] latency min={}s mean={:.2}s max={}s",
                latency.min, latency.mean, latency.max
            );
        }
        for (pair, figures) in &self.pairs {
            let _ = writeln!(out, "  {:<24} delivered={} lost={}", pair, figures.delivered, figures.lost);
        }
        for (reason, count) in &self.stop_reasons {
            let _ = writeln!(out, "  stopped: {:<32} {}", reason, count);
        }
        if let Some(c) = &self.counters {
            let _ = writeln!(
                out,
                "[stats] observations={} skipped={} gateway_links={} linked={} ambiguous={} failed={} \
                 lost_claims={} filled={} cycles={}",
                c.observations_recorded,
                c.records_skipped,
                c.gateway_links,
                c.matches_linked,
                c.matches_ambiguous,
                c.match_failures,
                c.lost_claims,
                c.endpoints_filled,
                c.cycles
            );
        }
        out
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::store::tests::observation;
    use crate::model::Direction;
    use std::net::Ipv4Addr;

    fn summary(outcome: TraceOutcome, elapsed: Option<i64>, reached: bool, reason: Option<&str>) -> TraceSummary {
        TraceSummary {
            root: ObservationId::from_index(0),
            root_time: 0,
            true_source: Some("protA1".into()),
            true_destination: Some("ext1".into()),
            outcome,
            elapsed,
            terminal_hash: None,
            terminal_system: None,
            terminal_reason: reason.map(str::to_string),
            hops: 3,
            reached_destination: reached,
        }
    }

    #[test]
    fn cyclic_traces_stay_out_of_latency_and_pairs() {
        let stats = RunStats::from_summaries(&[
            summary(TraceOutcome::Delivered, Some(2), true, None),
            summary(TraceOutcome::Delivered, Some(4), true, None),
            summary(TraceOutcome::Lost, None, false, Some("no matching receive found")),
            summary(TraceOutcome::Cyclic, None, false, None),
        ]);

        assert_eq!((stats.traces, stats.delivered, stats.lost, stats.cyclic), (4, 2, 1, 1));
        let latency = stats.latency.unwrap();
        assert_eq!((latency.min, latency.max), (2, 4));
        assert!((latency.mean - 3.0).abs() < f64::EPSILON);
        assert_eq!(stats.pairs["protA1 -> ext1"], PairStats { delivered: 2, lost: 1 });
        assert_eq!(stats.stop_reasons["no matching receive found"], 1);
        assert!(stats.render().starts_with("[stats] traces=4 delivered=2"));
    }

    #[test]
    fn summaries_honour_relative_time_range() {
        let mut registry = SystemRegistry::new();
        for name in ["ext1", "ext2"] {
            registry.register(name, Ipv4Addr::new(172, 3, 0, 1), None);
        }
        let store = Arc::new(PacketStore::new());
        let early = store.append(observation(1, Direction::Sent, 100, "a"));
        let early_recv = store.append(observation(2, Direction::Received, 101, "a"));
        store.claim_next_hop(early, early_recv).unwrap();
        let late = store.append(observation(1, Direction::Sent, 160, "b"));
        store.mark_failed(late, "no matching receive found").unwrap();

        let query = TraceQuery::new(Arc::new(registry), Arc::clone(&store), WalkerConfig::default());

        let all = query.summaries(TimeRange::all()).unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].elapsed, Some(1));
        assert_eq!(all[0].terminal_system.as_deref(), Some("ext2"));
        assert_eq!(all[1].terminal_reason.as_deref(), Some("no matching receive found"));

        let window = query.summaries(TimeRange { min: 30, max: Some(60) }).unwrap();
        assert_eq!(window.iter().map(|s| s.root).collect::<Vec<_>>(), vec![late]);
        assert_eq!(window[0].root_time, 60);
    }

    #[test]
    fn json_report_names_outcomes() {
        let stats = RunStats::from_summaries(&[summary(TraceOutcome::Lost, None, false, None)]);
        let json = stats.to_json().unwrap();
        assert!(json.contains("\"lost\": 1"));
        assert!(json.contains("\"unknown\": 1"));
    }
}
