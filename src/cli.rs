use crate::plan::RoundPlan;
use crate::utils::{
    validate_connections, validate_message_counts, validate_message_size, validate_port,
};
use anyhow::Result;
use clap::{Args as ClapArgs, Parser, Subcommand, ValueEnum};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Cluster Benchmark - latency and throughput of cluster message transports
#[derive(Parser, Debug)]
#[clap(version, about, long_about = None)]
pub struct Args {
    #[clap(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the benchmark Controller and its Client workers
    Master(MasterArgs),

    /// Run the benchmark Server and its Echo workers
    Server(ServerArgs),
}

/// Settings shared by both roles
#[derive(ClapArgs, Debug, Clone)]
pub struct CommonArgs {
    /// Directory used to publish and discover the Server's control endpoint
    #[clap(
        long,
        env = "CLUSTER_BENCH_RENDEZVOUS_DIR",
        default_value = crate::defaults::RENDEZVOUS_DIR
    )]
    pub rendezvous_dir: PathBuf,

    /// Name under which the Server publishes its control endpoint
    #[clap(long, default_value = crate::defaults::SERVER_NAME)]
    pub server_name: String,

    /// Longest wait for any control message (e.g. 500ms, 30s, 5m)
    #[clap(long, value_parser = parse_duration, default_value = "300s")]
    pub inactivity_limit: Duration,

    /// Verbose output
    #[clap(short = 'v', long, default_value_t = false)]
    pub verbose: bool,
}

#[derive(ClapArgs, Debug)]
pub struct MasterArgs {
    /// Total messages for the latency phase (round k sends total / k); 0 skips the phase
    #[clap(short = 'l', long, default_value_t = crate::defaults::LATENCY_MESSAGES, help_heading = "Core Options")]
    pub latency_messages: u32,

    /// Total messages per connection for the throughput phase (round k sends total / k); 0 skips the phase
    #[clap(short = 't', long, default_value_t = crate::defaults::THROUGHPUT_MESSAGES, help_heading = "Core Options")]
    pub throughput_messages: u32,

    /// Number of Client connections in the throughput phase
    #[clap(short = 'c', long, default_value_t = crate::defaults::CONNECTIONS, help_heading = "Core Options")]
    pub connections: u32,

    /// Transport to benchmark
    #[clap(short = 'p', long, value_enum, default_value_t = TransportMode::Tcp, help_heading = "Core Options")]
    pub transport: TransportMode,

    /// Run a single message size instead of the default sweep
    #[clap(short = 'm', long, help_heading = "Core Options")]
    pub message_size: Option<u32>,

    /// Pause after resetting the Server and after growing the Client pool
    #[clap(long, value_parser = parse_duration, default_value = "1s")]
    pub settle_delay: Duration,

    /// Local address of the Controller's control socket
    #[clap(long, default_value = "0.0.0.0:0")]
    pub control_bind: SocketAddr,

    /// Write a JSON report of all rounds to this file
    #[clap(short = 'o', long)]
    pub output_file: Option<PathBuf>,

    #[clap(flatten)]
    pub common: CommonArgs,
}

#[derive(ClapArgs, Debug)]
pub struct ServerArgs {
    /// Address of the Server's control socket
    #[clap(long, default_value = "0.0.0.0:17777")]
    pub control_addr: SocketAddr,

    /// First port tried for the TCP listener
    #[clap(long, default_value_t = crate::defaults::TCP_BASE_PORT)]
    pub tcp_base_port: u16,

    #[clap(flatten)]
    pub common: CommonArgs,
}

/// Data-plane transports that can be benchmarked
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportMode {
    /// TIPC stream sockets (Linux, requires the tipc kernel module)
    #[clap(name = "tipc")]
    Tipc,

    /// TCP sockets
    #[clap(name = "tcp")]
    Tcp,
}

impl std::fmt::Display for TransportMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportMode::Tipc => write!(f, "TIPC"),
            TransportMode::Tcp => write!(f, "TCP"),
        }
    }
}

/// Validated Controller configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MasterConfig {
    pub transport: TransportMode,
    pub latency_messages: u32,
    pub throughput_messages: u32,
    pub connections: u32,
    pub first_message_size: u32,
    pub max_message_size: u32,
    pub inactivity_limit: Duration,
    pub settle_delay: Duration,
    pub control_bind: SocketAddr,
    pub server_name: String,
}

impl MasterConfig {
    pub fn from_args(args: &MasterArgs) -> Result<Self> {
        validate_connections(args.connections)?;
        validate_message_counts(args.latency_messages, args.throughput_messages)?;

        let (first_message_size, max_message_size) = match args.message_size {
            Some(size) => {
                validate_message_size(size)?;
                (size, size)
            }
            None => (
                crate::defaults::FIRST_MESSAGE_SIZE,
                crate::defaults::MAX_MESSAGE_SIZE,
            ),
        };

        Ok(Self {
            transport: args.transport,
            latency_messages: args.latency_messages,
            throughput_messages: args.throughput_messages,
            connections: args.connections,
            first_message_size,
            max_message_size,
            inactivity_limit: args.common.inactivity_limit,
            settle_delay: args.settle_delay,
            control_bind: args.control_bind,
            server_name: args.common.server_name.clone(),
        })
    }

    pub fn plan(&self) -> RoundPlan {
        RoundPlan::new(self.first_message_size, self.max_message_size)
    }
}

/// Validated Server configuration
#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub control_addr: SocketAddr,
    pub tcp_base_port: u16,
    pub inactivity_limit: Duration,
    pub server_name: String,
}

impl ServerConfig {
    pub fn from_args(args: &ServerArgs) -> Result<Self> {
        validate_port(args.tcp_base_port)?;
        Ok(Self {
            control_addr: args.control_addr,
            tcp_base_port: args.tcp_base_port,
            inactivity_limit: args.common.inactivity_limit,
            server_name: args.common.server_name.clone(),
        })
    }
}

/// Parse duration from string (e.g., "500ms", "10s", "5m", "1h")
pub fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();

    if s.is_empty() {
        return Err("Duration cannot be empty".to_string());
    }

    let (num_str, unit) = if let Some(stripped) = s.strip_suffix("ms") {
        (stripped, "ms")
    } else if let Some(stripped) = s.strip_suffix('s') {
        (stripped, "s")
    } else if let Some(stripped) = s.strip_suffix('m') {
        (stripped, "m")
    } else if let Some(stripped) = s.strip_suffix('h') {
        (stripped, "h")
    } else {
        (s, "s") // Default to seconds
    };

    let num: f64 = num_str
        .parse()
        .map_err(|_| format!("Invalid number in duration: {}", num_str))?;
    if !num.is_finite() || num < 0.0 {
        return Err(format!("Invalid duration: {}", s));
    }

    let secs = match unit {
        "ms" => num / 1000.0,
        "s" => num,
        "m" => num * 60.0,
        "h" => num * 3600.0,
        _ => return Err(format!("Invalid duration unit: {}", unit)),
    };

    Duration::try_from_secs_f64(secs).map_err(|e| format!("Invalid duration {}: {}", s, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("10s").unwrap(), Duration::from_secs(10));
        assert_eq!(parse_duration("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_duration("1h").unwrap(), Duration::from_secs(3600));
        assert_eq!(parse_duration("500ms").unwrap(), Duration::from_millis(500));
        assert_eq!(parse_duration("1.5s").unwrap(), Duration::from_millis(1500));
        assert_eq!(parse_duration("10").unwrap(), Duration::from_secs(10));

        assert!(parse_duration("").is_err());
        assert!(parse_duration("invalid").is_err());
        assert!(parse_duration("-3s").is_err());
    }

    #[test]
    fn test_transport_mode_display() {
        assert_eq!(TransportMode::Tipc.to_string(), "TIPC");
        assert_eq!(TransportMode::Tcp.to_string(), "TCP");
    }

    #[test]
    fn test_cli_is_well_formed() {
        Args::command().debug_assert();
    }

    #[test]
    fn test_master_defaults() {
        let args = Args::parse_from(["cluster-bench", "master"]);
        let Command::Master(master) = args.command else {
            panic!("expected master subcommand");
        };
        let config = MasterConfig::from_args(&master).unwrap();
        assert_eq!(config.transport, TransportMode::Tcp);
        assert_eq!(config.latency_messages, 200_000);
        assert_eq!(config.throughput_messages, 200_000);
        assert_eq!(config.connections, 8);
        assert_eq!(config.first_message_size, 64);
        assert_eq!(config.max_message_size, 66_000);
        assert_eq!(config.inactivity_limit, crate::defaults::INACTIVITY_LIMIT);
        assert_eq!(config.settle_delay, crate::defaults::SETTLE_DELAY);
        assert_eq!(config.plan().sizes().len(), 6);
    }

    #[test]
    fn test_master_single_size() {
        let args = Args::parse_from([
            "cluster-bench", "master", "-p", "tipc", "-m", "1000", "-c", "2", "-l", "10",
        ]);
        let Command::Master(master) = args.command else {
            panic!("expected master subcommand");
        };
        let config = MasterConfig::from_args(&master).unwrap();
        assert_eq!(config.transport, TransportMode::Tipc);
        assert_eq!(config.plan().sizes(), vec![1000]);
        assert_eq!(config.connections, 2);
        assert_eq!(config.latency_messages, 10);
    }

    #[test]
    fn test_master_rejects_zero_connections() {
        let args = Args::parse_from(["cluster-bench", "master", "-c", "0"]);
        let Command::Master(master) = args.command else {
            panic!("expected master subcommand");
        };
        assert!(MasterConfig::from_args(&master).is_err());
    }

    #[test]
    fn test_master_zero_count_skips_one_phase() {
        let args = Args::parse_from(["cluster-bench", "master", "-l", "0"]);
        let Command::Master(master) = args.command else {
            panic!("expected master subcommand");
        };
        let config = MasterConfig::from_args(&master).unwrap();
        assert_eq!(config.latency_messages, 0);
        assert_eq!(config.throughput_messages, 200_000);

        let args = Args::parse_from(["cluster-bench", "master", "-t", "0"]);
        let Command::Master(master) = args.command else {
            panic!("expected master subcommand");
        };
        assert_eq!(MasterConfig::from_args(&master).unwrap().throughput_messages, 0);
    }

    #[test]
    fn test_master_rejects_two_empty_phases() {
        let args = Args::parse_from(["cluster-bench", "master", "-l", "0", "-t", "0"]);
        let Command::Master(master) = args.command else {
            panic!("expected master subcommand");
        };
        let err = MasterConfig::from_args(&master).unwrap_err();
        assert!(err.to_string().contains("at least one phase"));
    }

    #[test]
    fn test_server_args() {
        let args = Args::parse_from([
            "cluster-bench",
            "server",
            "--control-addr",
            "127.0.0.1:9000",
            "--inactivity-limit",
            "5s",
        ]);
        let Command::Server(server) = args.command else {
            panic!("expected server subcommand");
        };
        let config = ServerConfig::from_args(&server).unwrap();
        assert_eq!(config.control_addr, "127.0.0.1:9000".parse().unwrap());
        assert_eq!(config.tcp_base_port, 4711);
        assert_eq!(config.inactivity_limit, Duration::from_secs(5));
        assert_eq!(config.server_name, "bench-server-ctrl");
    }
}
