use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

use lazy_static::lazy_static;
use regex::Regex;
use tokio::fs::{self, File};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::info;

use crate::error::{IngestError, IngestResult};
use crate::ingest::log_parser::IP_PATTERN;
use crate::ingest::LogFormat;
use crate::model::NatRange;

lazy_static! {
    static ref GATEWAY_ADDRESS: Regex = Regex::new(&format!(
        r"Internal IP: ({ip}).+IP: ({ip}).+mask: ({ip})",
        ip = IP_PATTERN
    ))
    .expect("gateway address pattern");
    static ref CLIENT_ADDRESS: Regex =
        Regex::new(&format!(r"({ip}):(\d+)", ip = IP_PATTERN)).expect("client address pattern");
}

/// One host's log inside a run directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostLog {
    pub host: String,
    pub path: PathBuf,
}

/// What a host's log says about its own addressing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RosterEntry {
    pub name: String,
    pub internal_address: Ipv4Addr,
    pub nat: Option<NatRange>,
}

/// Lists every `*.log` in `dir`. The host name is the file name up to the
/// first `-` (`gateA-run3.log` -> `gateA`). Sorted by host, then path.
pub async fn discover_logs(dir: &Path) -> IngestResult<Vec<HostLog>> {
    let io_err = |source| IngestError::Io {
        path: dir.to_path_buf(),
        source,
    };
    let mut entries = fs::read_dir(dir).await.map_err(io_err)?;
    let mut logs = Vec::new();

    while let Some(entry) = entries.next_entry().await.map_err(io_err)? {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("log") {
            continue;
        }
        let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or_default();
        let host = stem.split('-').next().unwrap_or_default();
        if host.is_empty() {
            return Err(IngestError::UnnamedLog(path));
        }
        info!(host = %host, path = %path.display(), "found host log");
        logs.push(HostLog {
            host: host.to_string(),
            path,
        });
    }

    logs.sort_by(|a, b| a.host.cmp(&b.host).then_with(|| a.path.cmp(&b.path)));
    Ok(logs)
}

/// Reads the host's own address line: `Internal IP: .. IP: .. mask: ..` for
/// gateways, `LOCAL ADDRESS ip:port` for clients.
pub async fn read_roster_entry(log: &HostLog) -> IngestResult<RosterEntry> {
    let file = File::open(&log.path).await.map_err(|source| IngestError::Io {
        path: log.path.clone(),
        source,
    })?;
    let mut lines = BufReader::new(file).lines();
    let format = LogFormat::for_host(&log.host);
    let marker = match format {
        LogFormat::Gateway => "Internal IP",
        LogFormat::Client => "LOCAL ADDRESS",
    };

    while let Some(line) = lines.next_line().await.map_err(|source| IngestError::Io {
        path: log.path.clone(),
        source,
    })? {
        if !line.contains(marker) {
            continue;
        }
        return parse_address_line(&log.host, format, &line);
    }

    Err(IngestError::MissingAddressLine { host: log.host.clone() })
}

fn parse_address_line(host: &str, format: LogFormat, line: &str) -> IngestResult<RosterEntry> {
    let malformed = || IngestError::MalformedAddress {
        host: host.to_string(),
        line: line.to_string(),
    };
    let ip = |text: &str| text.parse::<Ipv4Addr>().map_err(|_| malformed());

    match format {
        LogFormat::Gateway => {
            let caps = GATEWAY_ADDRESS.captures(line).ok_or_else(malformed)?;
            Ok(RosterEntry {
                name: host.to_string(),
                internal_address: ip(&caps[1])?,
                nat: Some(NatRange {
                    base: ip(&caps[2])?,
                    mask: ip(&caps[3])?,
                }),
            })
        }
        LogFormat::Client => {
            let caps = CLIENT_ADDRESS.captures(line).ok_or_else(malformed)?;
            Ok(RosterEntry {
                name: host.to_string(),
                internal_address: ip(&caps[1])?,
                nat: None,
            })
        }
    }
}
