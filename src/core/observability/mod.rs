use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Outcome class of one processed send, used for counter bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchOutcome {
    Linked,
    Ambiguous,
    Failed,
}

/// Per-run counters shared by every phase. Passed around as context, never global.
#[derive(Debug, Default)]
pub struct RunCounters {
    observations_recorded: AtomicU64,
    records_skipped: AtomicU64,
    gateway_links: AtomicU64,
    matches_linked: AtomicU64,
    matches_ambiguous: AtomicU64,
    match_failures: AtomicU64,
    lost_claims: AtomicU64,
    endpoints_filled: AtomicU64,
    cycles: AtomicU64,
}

impl RunCounters {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn record_observation(&self) {
        self.observations_recorded.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_skipped(&self) {
        self.records_skipped.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_gateway_link(&self) {
        self.gateway_links.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_match(&self, outcome: MatchOutcome) {
        let counter = match outcome {
            MatchOutcome::Linked => &self.matches_linked,
            MatchOutcome::Ambiguous => {
                self.matches_linked.fetch_add(1, Ordering::Relaxed);
                &self.matches_ambiguous
            }
            MatchOutcome::Failed => &self.match_failures,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_lost_claim(&self) {
        self.lost_claims.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_endpoints_filled(&self, count: u64) {
        self.endpoints_filled.fetch_add(count, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_cycles(&self, count: u64) {
        self.cycles.fetch_add(count, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> CountersSnapshot {
        CountersSnapshot {
            observations_recorded: self.observations_recorded.load(Ordering::Relaxed),
            records_skipped: self.records_skipped.load(Ordering::Relaxed),
            gateway_links: self.gateway_links.load(Ordering::Relaxed),
            matches_linked: self.matches_linked.load(Ordering::Relaxed),
            matches_ambiguous: self.matches_ambiguous.load(Ordering::Relaxed),
            match_failures: self.match_failures.load(Ordering::Relaxed),
            lost_claims: self.lost_claims.load(Ordering::Relaxed),
            endpoints_filled: self.endpoints_filled.load(Ordering::Relaxed),
            cycles: self.cycles.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CountersSnapshot {
    pub observations_recorded: u64,
    pub records_skipped: u64,
    pub gateway_links: u64,
    pub matches_linked: u64,
    pub matches_ambiguous: u64,
    pub match_failures: u64,
    pub lost_claims: u64,
    pub endpoints_filled: u64,
    pub cycles: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ambiguous_matches_also_count_as_linked() {
        let counters = RunCounters::new();
        counters.record_match(MatchOutcome::Linked);
        counters.record_match(MatchOutcome::Ambiguous);
        counters.record_match(MatchOutcome::Failed);

        let snap = counters.snapshot();
        assert_eq!(snap.matches_linked, 2);
        assert_eq!(snap.matches_ambiguous, 1);
        assert_eq!(snap.match_failures, 1);
    }
}
