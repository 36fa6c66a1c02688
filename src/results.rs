//! # Results
//!
//! Console tables printed while the rounds run, plus an optional JSON report
//! written once the run is complete.
//!
//! The latency table lists one row per message size with the average
//! round-trip time; the throughput table adds the pool size, the aggregate
//! message and bit rates, and the bit rate per connection.

use crate::cli::{MasterConfig, TransportMode};
use crate::metrics::{Phase, RoundStats};
use crate::transport::DataEndpoint;
use crate::utils::{format_table_row, format_table_separator, generate_test_id};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

pub const LATENCY_HEADERS: [&str; 4] = ["Msg Size", "# Msgs", "Elapsed [ms]", "Avg round-trip [us]"];
const LATENCY_WIDTHS: [usize; 4] = [10, 10, 12, 19];

pub const THROUGHPUT_HEADERS: [&str; 7] = [
    "Msg Size",
    "# Conns",
    "# Msgs/Conn",
    "Elapsed [ms]",
    "Total [Msg/s]",
    "Total [Mb/s]",
    "Per Conn [Mb/s]",
];
const THROUGHPUT_WIDTHS: [usize; 7] = [10, 8, 11, 12, 13, 12, 15];

fn headers(phase: Phase) -> (&'static [&'static str], &'static [usize]) {
    match phase {
        Phase::Latency => (&LATENCY_HEADERS, &LATENCY_WIDTHS),
        Phase::Throughput => (&THROUGHPUT_HEADERS, &THROUGHPUT_WIDTHS),
    }
}

/// Table row for one round, formatted for its phase.
pub fn format_round_row(stats: &RoundStats) -> String {
    let columns: Vec<String> = match stats.phase {
        Phase::Latency => vec![
            stats.message_size.to_string(),
            stats.message_count.to_string(),
            stats.elapsed_ms().to_string(),
            format!("{:.3}", stats.avg_round_trip_us()),
        ],
        Phase::Throughput => vec![
            stats.message_size.to_string(),
            stats.participants.to_string(),
            stats.message_count.to_string(),
            stats.elapsed_ms().to_string(),
            stats.messages_per_second.to_string(),
            stats.total_mbps().to_string(),
            stats.per_connection_mbps().to_string(),
        ],
    };
    let columns: Vec<&str> = columns.iter().map(String::as_str).collect();
    format_table_row(&columns, headers(stats.phase).1)
}

/// Header block (separator, titles, separator) for a phase's table.
pub fn format_header(phase: Phase) -> String {
    let (titles, widths) = headers(phase);
    let separator = format_table_separator(widths);
    format!("{}\n{}\n{}", separator, format_table_row(titles, widths), separator)
}

/// Complete report written as JSON.
#[derive(Debug, Serialize, Deserialize)]
pub struct BenchmarkReport {
    pub metadata: ReportMetadata,
    pub latency: Vec<RoundStats>,
    pub throughput: Vec<RoundStats>,
}

/// Run metadata for telling reports apart.
#[derive(Debug, Serialize, Deserialize)]
pub struct ReportMetadata {
    pub version: String,
    pub run_id: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub hostname: String,
    pub transport: TransportMode,
    pub server_endpoint: Option<String>,
    pub config: MasterConfig,
}

/// Collects round results, prints them and writes the final report.
pub struct ResultsManager {
    config: MasterConfig,
    output_file: Option<PathBuf>,
    console: bool,
    run_id: String,
    started: chrono::DateTime<chrono::Utc>,
    endpoint: Option<String>,
    rounds: Vec<RoundStats>,
}

impl ResultsManager {
    pub fn new(config: &MasterConfig, output_file: Option<&Path>) -> Self {
        Self {
            config: config.clone(),
            output_file: output_file.map(Path::to_path_buf),
            console: true,
            run_id: generate_test_id(),
            started: chrono::Utc::now(),
            endpoint: None,
            rounds: Vec::new(),
        }
    }

    /// Collect results without printing tables.
    pub fn without_console(mut self) -> Self {
        self.console = false;
        self
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn set_endpoint(&mut self, endpoint: &DataEndpoint) {
        self.endpoint = Some(endpoint.to_string());
    }

    pub fn begin_phase(&mut self, phase: Phase, total_messages: u32) {
        info!(
            "Transferring {} messages in {} {} benchmark",
            total_messages, self.config.transport, phase
        );
        if self.console {
            println!("{}", format_header(phase));
        }
    }

    pub fn add_round(&mut self, stats: &RoundStats) {
        if self.console {
            println!("{}", format_round_row(stats));
            println!("{}", format_table_separator(headers(stats.phase).1));
        }
        self.rounds.push(stats.clone());
    }

    pub fn end_phase(&mut self) {
        if let Some(last) = self.rounds.last() {
            info!("Completed {} benchmark", last.phase);
        }
    }

    pub fn rounds(&self) -> &[RoundStats] {
        &self.rounds
    }

    pub fn report(&self) -> BenchmarkReport {
        let (latency, throughput) = self
            .rounds
            .iter()
            .cloned()
            .partition(|r| r.phase == Phase::Latency);
        BenchmarkReport {
            metadata: ReportMetadata {
                version: crate::VERSION.to_string(),
                run_id: self.run_id.clone(),
                timestamp: self.started,
                hostname: hostname::get()
                    .map(|h| h.to_string_lossy().into_owned())
                    .unwrap_or_else(|_| "unknown".to_string()),
                transport: self.config.transport,
                server_endpoint: self.endpoint.clone(),
                config: self.config.clone(),
            },
            latency,
            throughput,
        }
    }

    /// Write the JSON report if an output file was requested.
    pub fn finalize(&self) -> Result<()> {
        let Some(path) = &self.output_file else {
            debug!("No output file requested, skipping JSON report");
            return Ok(());
        };
        let json = serde_json::to_string_pretty(&self.report())
            .context("Failed to serialize benchmark report")?;
        std::fs::write(path, json)
            .with_context(|| format!("Failed to write report to {}", path.display()))?;
        info!("Results written to {}", path.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::compute_stats;
    use crate::protocol::Round;
    use std::time::Duration;
    use tempfile::tempdir;

    fn config() -> MasterConfig {
        MasterConfig {
            transport: TransportMode::Tcp,
            latency_messages: 1000,
            throughput_messages: 1000,
            connections: 4,
            first_message_size: 64,
            max_message_size: 1024,
            inactivity_limit: Duration::from_secs(5),
            settle_delay: Duration::from_millis(10),
            control_bind: "0.0.0.0:0".parse().unwrap(),
            server_name: "bench-server-ctrl".into(),
        }
    }

    fn latency_stats() -> RoundStats {
        let round = Round {
            message_size: 64,
            message_count: 200_000,
            bounce: true,
        };
        compute_stats(Phase::Latency, &round, 3_200_123_000, 1)
    }

    fn throughput_stats() -> RoundStats {
        let round = Round {
            message_size: 64,
            message_count: 25_000,
            bounce: false,
        };
        compute_stats(Phase::Throughput, &round, 250_000_000, 8)
    }

    #[test]
    fn test_headers_fit_their_columns() {
        for (titles, widths) in [
            (&LATENCY_HEADERS[..], &LATENCY_WIDTHS[..]),
            (&THROUGHPUT_HEADERS[..], &THROUGHPUT_WIDTHS[..]),
        ] {
            assert_eq!(titles.len(), widths.len());
            for (title, width) in titles.iter().zip(widths) {
                assert!(title.len() <= *width, "{} wider than {}", title, width);
            }
        }
    }

    #[test]
    fn test_latency_row() {
        let row = format_round_row(&latency_stats());
        assert!(row.contains(" 200000 |"));
        assert!(row.contains(" 3200 |"));
        assert!(row.contains(" 16.000 |"));
        assert_eq!(row.len(), format_table_separator(&LATENCY_WIDTHS).len());
    }

    #[test]
    fn test_throughput_row() {
        let row = format_round_row(&throughput_stats());
        let cells: Vec<&str> = row
            .split('|')
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .collect();
        assert_eq!(cells, ["64", "8", "25000", "250", "800000", "409", "51"]);
    }

    #[test]
    fn test_header_block() {
        let header = format_header(Phase::Throughput);
        assert_eq!(header.lines().count(), 3);
        assert!(header.contains("Per Conn [Mb/s]"));
    }

    #[test]
    fn test_report_splits_phases() {
        let mut manager = ResultsManager::new(&config(), None).without_console();
        manager.add_round(&latency_stats());
        manager.add_round(&throughput_stats());
        let report = manager.report();
        assert_eq!(report.latency.len(), 1);
        assert_eq!(report.throughput.len(), 1);
        assert_eq!(report.metadata.version, crate::VERSION);
        assert_eq!(report.metadata.run_id, manager.run_id());
    }

    #[test]
    fn test_finalize_writes_json() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("report.json");
        let mut manager = ResultsManager::new(&config(), Some(&path)).without_console();
        manager.set_endpoint(&DataEndpoint::Tcp("127.0.0.1:4711".parse().unwrap()));
        manager.add_round(&latency_stats());
        manager.finalize().unwrap();

        let json: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(json["metadata"]["transport"], "tcp");
        assert_eq!(json["metadata"]["server_endpoint"], "tcp://127.0.0.1:4711");
        assert_eq!(json["latency"][0]["avg_latency_ns"], 16_000);
        assert_eq!(json["throughput"].as_array().unwrap().len(), 0);
    }

    #[test]
    fn test_finalize_without_output_is_noop() {
        let manager = ResultsManager::new(&config(), None).without_console();
        manager.finalize().unwrap();
    }
}
