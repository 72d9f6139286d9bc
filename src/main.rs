use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info, warn};

use hop_tracer::config::{
    RunConfig, TimeRange, TracerConfig, WalkerConfig, DEFAULT_CLAIM_RETRIES, DEFAULT_CYCLE_LIMIT, DEFAULT_TIME_SLACK,
};
use hop_tracer::logging;

#[derive(Parser, Debug)]
#[command(author, version, about = "Trace packets through an address-hopping test network run")]
struct Cli {
    /// Directory with the per-host logs of a run
    #[arg(short, long, default_value = ".")]
    logdir: PathBuf,

    /// SQLite database for trace state. If it exists it is assumed to hold a
    /// finished trace. Without it everything stays in memory.
    #[arg(long)]
    database: Option<PathBuf>,

    /// Remove an existing database and trace again
    #[arg(long)]
    empty_database: bool,

    /// Only trace packets, skip statistics
    #[arg(short, long)]
    trace_only: bool,

    /// First root time (seconds after the run start) to take stats from
    #[arg(long, default_value_t = 0)]
    min_time: i64,

    /// Last root time to take stats from
    #[arg(long)]
    max_time: Option<i64>,

    /// Print the packets involved when trace cycles are found
    #[arg(long)]
    show_cycles: bool,

    /// Also write statistics as JSON
    #[arg(long)]
    json: Option<PathBuf>,

    /// Allowed clock skew between hosts, in seconds
    #[arg(long, default_value_t = DEFAULT_TIME_SLACK)]
    time_slack: i64,

    /// Most observations a trace may visit before it counts as a cycle
    #[arg(long, default_value_t = DEFAULT_CYCLE_LIMIT)]
    cycle_limit: usize,

    /// Threads used for hop matching
    #[arg(long, default_value_t = 1)]
    match_workers: usize,

    /// More logging (-v debug, -vv trace). RUST_LOG overrides.
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

impl Cli {
    fn into_config(self) -> RunConfig {
        RunConfig {
            log_dir: self.logdir,
            database: self.database,
            empty_database: self.empty_database,
            trace_only: self.trace_only,
            show_cycles: self.show_cycles,
            time_range: TimeRange {
                min: self.min_time,
                max: self.max_time,
            },
            json_report: self.json,
            tracer: TracerConfig {
                time_slack: self.time_slack,
                claim_retries: DEFAULT_CLAIM_RETRIES,
                match_workers: self.match_workers,
            },
            walker: WalkerConfig {
                cycle_limit: self.cycle_limit,
            },
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    logging::init(cli.verbose);

    match run(cli.into_config()).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(config: RunConfig) -> Result<()> {
    let report = hop_tracer::execute(&config)
        .await
        .with_context(|| format!("processing run in {}", config.log_dir.display()))?;

    if report.has_cycles() {
        if config.show_cycles {
            for trace in &report.cycles {
                println!("{}", trace.render());
            }
            for cycle in &report.orphaned_cycles {
                let members: Vec<String> = cycle.iter().map(ToString::to_string).collect();
                println!("Unrooted cycle: {}", members.join(" -> "));
            }
        } else {
            warn!("to display the cycles, pass --show-cycles");
        }
    }

    match &report.stats {
        Some(stats) => print!("{}", stats.render()),
        None => info!("processing complete"),
    }
    Ok(())
}
