use std::path::PathBuf;

use crate::error::{ConfigResult, ConfigurationError};
use crate::model::Timestamp;

/// Default clock-skew tolerance between hosts, in seconds.
pub const DEFAULT_TIME_SLACK: i64 = 5;
pub const DEFAULT_CYCLE_LIMIT: usize = 10;
pub const DEFAULT_CLAIM_RETRIES: u32 = 3;

/// Hop matching parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TracerConfig {
    pub time_slack: i64,
    /// Lost claims a send may absorb without the candidate list shrinking.
    /// Only a send matched by two workers at once can stall like that.
    pub claim_retries: u32,
    pub match_workers: usize,
}

impl Default for TracerConfig {
    fn default() -> Self {
        Self {
            time_slack: DEFAULT_TIME_SLACK,
            claim_retries: DEFAULT_CLAIM_RETRIES,
            match_workers: 1,
        }
    }
}

/// Chain walking parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalkerConfig {
    pub cycle_limit: usize,
}

impl Default for WalkerConfig {
    fn default() -> Self {
        Self {
            cycle_limit: DEFAULT_CYCLE_LIMIT,
        }
    }
}

/// Inclusive window of root times that statistics cover, in seconds after
/// the run's first observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeRange {
    pub min: Timestamp,
    pub max: Option<Timestamp>,
}

impl TimeRange {
    pub fn all() -> Self {
        Self { min: Timestamp::MIN, max: None }
    }

    pub fn contains(&self, t: Timestamp) -> bool {
        t >= self.min && self.max.map_or(true, |max| t <= max)
    }
}

impl Default for TimeRange {
    fn default() -> Self {
        Self::all()
    }
}

/// Top-level configuration of one reconciliation run
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub log_dir: PathBuf,
    /// Where trace state is persisted. `None` keeps everything in memory.
    pub database: Option<PathBuf>,
    pub empty_database: bool,
    pub trace_only: bool,
    pub show_cycles: bool,
    pub time_range: TimeRange,
    pub json_report: Option<PathBuf>,
    pub tracer: TracerConfig,
    pub walker: WalkerConfig,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            log_dir: PathBuf::from("."),
            database: None,
            empty_database: false,
            trace_only: false,
            show_cycles: false,
            time_range: TimeRange::all(),
            json_report: None,
            tracer: TracerConfig::default(),
            walker: WalkerConfig::default(),
        }
    }
}

impl RunConfig {
    pub fn validate(&self) -> ConfigResult<()> {
        let invalid = |msg: &str| Err(ConfigurationError::InvalidRun(msg.to_string()));
        if self.tracer.time_slack < 0 {
            return invalid("time slack must be >= 0");
        }
        if self.tracer.match_workers == 0 {
            return invalid("at least one match worker is required");
        }
        if self.walker.cycle_limit == 0 {
            return invalid("cycle limit must be > 0");
        }
        if let Some(max) = self.time_range.max {
            if max < self.time_range.min {
                return invalid("max time must be >= min time");
            }
        }
        Ok(())
    }
}
