//! One reconciliation run from a log directory to statistics.

use std::path::Path;
use std::sync::Arc;

use tokio::task::JoinSet;
use tracing::{info, warn};

use crate::config::{RunConfig, TracerConfig};
use crate::core::observability::{CountersSnapshot, RunCounters};
use crate::core::phase_timer;
use crate::core::registry::SystemRegistry;
use crate::core::resolver::{ResolveSummary, TrueEndpointResolver};
use crate::core::store::PacketStore;
use crate::core::tracer::{MatchSummary, Tracer};
use crate::core::walker::{Trace, TraceWalker};
use crate::error::{ConfigurationError, IngestError, TraceResult};
use crate::ingest::{collect_records, discover_logs, read_roster_entry, HostLog, LogFileSource, MemorySource};
use crate::model::ObservationId;
use crate::persist::TraceDatabase;
use crate::stats::{RunStats, TraceQuery};

/// Registry and store after recording, matching and resolution.
pub struct TracedRun {
    pub registry: Arc<SystemRegistry>,
    pub store: Arc<PacketStore>,
    pub counters: Arc<RunCounters>,
    pub matching: MatchSummary,
    pub resolution: ResolveSummary,
}

#[derive(Debug)]
pub struct RunReport {
    /// False when state came from an existing database.
    pub traced: bool,
    pub matching: Option<MatchSummary>,
    pub resolution: Option<ResolveSummary>,
    pub cycles: Vec<Trace>,
    pub orphaned_cycles: Vec<Vec<ObservationId>>,
    pub stats: Option<RunStats>,
    pub counters: CountersSnapshot,
}

impl RunReport {
    pub fn has_cycles(&self) -> bool {
        !self.cycles.is_empty() || !self.orphaned_cycles.is_empty()
    }
}

/// Reads every roster line in `logs` and registers the hosts, in log order.
pub async fn build_registry(logs: &[HostLog]) -> TraceResult<SystemRegistry> {
    let mut registry = SystemRegistry::new();
    for log in logs {
        let entry = read_roster_entry(log).await?;
        registry.register(&entry.name, entry.internal_address, entry.nat);
    }
    registry.validate_topology()?;
    info!(systems = registry.len(), "systems registered");
    Ok(registry)
}

/// Parses all logs concurrently. Each log is buffered in full, and the
/// buffers come back in `logs` order.
pub async fn parse_logs(logs: &[HostLog]) -> TraceResult<Vec<MemorySource>> {
    let _timer = phase_timer("parsing");
    let mut tasks = JoinSet::new();
    for (index, log) in logs.iter().cloned().enumerate() {
        tasks.spawn(async move {
            let mut source = LogFileSource::open(log.host.clone(), &log.path).await?;
            let records = collect_records(&mut source).await?;
            Ok::<_, IngestError>((index, MemorySource::new(log.host, records)))
        });
    }

    let mut parsed: Vec<Option<MemorySource>> = (0..logs.len()).map(|_| None).collect();
    while let Some(joined) = tasks.join_next().await {
        let (index, source) = joined.map_err(|e| IngestError::Task(e.to_string()))??;
        parsed[index] = Some(source);
    }
    Ok(parsed.into_iter().flatten().collect())
}

/// Records, matches and resolves every host log in `dir`.
pub async fn trace_directory(dir: &Path, config: &TracerConfig) -> TraceResult<TracedRun> {
    let logs = discover_logs(dir).await?;
    if logs.is_empty() {
        return Err(ConfigurationError::InvalidRun(format!("no host logs found in {}", dir.display())).into());
    }

    let registry = Arc::new(build_registry(&logs).await?);
    let store = Arc::new(PacketStore::new());
    let counters = Arc::new(RunCounters::new());
    let tracer = Tracer::new(
        Arc::clone(&registry),
        Arc::clone(&store),
        Arc::clone(&counters),
        config.clone(),
    );

    let per_host = parse_logs(&logs).await?;
    {
        let _timer = phase_timer("recording");
        for mut source in per_host {
            tracer.record_source(&mut source).await?;
        }
    }

    let matching = tracer.match_all()?;
    let resolution = TrueEndpointResolver::new(Arc::clone(&store), Arc::clone(&counters)).resolve_all()?;

    Ok(TracedRun {
        registry,
        store,
        counters,
        matching,
        resolution,
    })
}

/// Runs the whole pipeline for `config`.
///
/// With a database that already holds a finished trace, tracing is skipped
/// and the stored state is analysed instead, unless `empty_database` asks for
/// a fresh trace. A database without one is replaced.
pub async fn execute(config: &RunConfig) -> TraceResult<RunReport> {
    config.validate()?;

    let mut trace = true;
    if let Some(path) = &config.database {
        if tokio::fs::try_exists(path).await.unwrap_or(false) {
            if config.empty_database {
                remove_database(path).await?;
                info!(path = %path.display(), "removed existing database");
            } else if TraceDatabase::open(path)?.has_trace()? {
                warn!(
                    path = %path.display(),
                    "database already exists, skipping packet trace (use --empty-database to force a new one)"
                );
                trace = false;
            } else {
                // left behind by a run that never committed its save
                warn!(path = %path.display(), "database holds no finished trace, tracing again");
                remove_database(path).await?;
            }
        }
    }

    let (registry, store, counters, matching, resolution) = if trace {
        let run = trace_directory(&config.log_dir, &config.tracer).await?;
        if let Some(path) = &config.database {
            let mut db = TraceDatabase::open(path)?;
            db.create_schema()?;
            db.save(&run.registry, &run.store)?;
        }
        (
            run.registry,
            run.store,
            run.counters,
            Some(run.matching),
            Some(run.resolution),
        )
    } else {
        let path = config
            .database
            .as_deref()
            .ok_or_else(|| ConfigurationError::InvalidRun("no database to load".to_string()))?;
        let (registry, store) = TraceDatabase::open(path)?.load()?;
        (Arc::new(registry), Arc::new(store), Arc::new(RunCounters::new()), None, None)
    };

    let walker = TraceWalker::new(Arc::clone(&store), config.walker.clone());
    let cycles = walker.check_all(&counters)?;
    let orphaned_cycles = walker.orphaned_cycles()?;
    if !cycles.is_empty() || !orphaned_cycles.is_empty() {
        warn!("cycles found in trace data, results may be incorrect");
    }

    let stats = if config.trace_only {
        info!("trace only requested, skipping statistics");
        None
    } else {
        let query = TraceQuery::new(Arc::clone(&registry), Arc::clone(&store), config.walker.clone());
        let summaries = query.summaries(config.time_range)?;
        let stats = RunStats::from_summaries(&summaries).with_counters(counters.snapshot());
        if let Some(path) = &config.json_report {
            write_json(path, &stats).await?;
        }
        Some(stats)
    };

    Ok(RunReport {
        traced: trace,
        matching,
        resolution,
        cycles,
        orphaned_cycles,
        stats,
        counters: counters.snapshot(),
    })
}

async fn remove_database(path: &Path) -> TraceResult<()> {
    tokio::fs::remove_file(path).await.map_err(|source| IngestError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(())
}

async fn write_json(path: &Path, stats: &RunStats) -> TraceResult<()> {
    let io_err = |source| IngestError::Io {
        path: path.to_path_buf(),
        source,
    };
    let json = stats.to_json().map_err(|e| io_err(e.into()))?;
    tokio::fs::write(path, json).await.map_err(io_err)?;
    info!(path = %path.display(), "wrote json report");
    Ok(())
}
