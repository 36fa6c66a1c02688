//! # Cluster Benchmark Library
//!
//! Measures the latency and throughput of a cluster message transport (TIPC or
//! TCP) between a Controller with its pool of Client workers and a Server with
//! one Echo worker per connection.
//!
//! ## Roles
//!
//! - **Controller** (`controller`): discovers the Server, negotiates the
//!   transport, runs every round as a synchronized barrier and computes the
//!   statistics.
//! - **Client worker** (`client`): one data connection; streams or bounces
//!   messages on command.
//! - **Server** (`server`): owns the data listener, spawns an Echo worker per
//!   accepted peer and relays round commands and acks.
//!
//! ## Architecture Overview
//!
//! - `protocol`: the four fixed-size, big-endian control messages
//! - `control`: the bounded wait primitive and the UDP control socket
//! - `rendezvous`: name publication and discovery of the Server
//! - `transport`: TCP and TIPC message streams behind one trait seam
//! - `address`: choosing the Server address a TCP Client connects to
//! - `plan`, `metrics`: round sizes and counts, timing and rates
//! - `results`: console tables and the JSON report
//! - `cli`, `logging`, `utils`: configuration, log output and helpers
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use cluster_bench::{run_master, FileRendezvous, MasterConfig, ResultsManager, TransportMode};
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = MasterConfig {
//!         transport: TransportMode::Tcp,
//!         latency_messages: 10_000,
//!         throughput_messages: 10_000,
//!         connections: 4,
//!         first_message_size: 64,
//!         max_message_size: 4096,
//!         inactivity_limit: Duration::from_secs(30),
//!         settle_delay: Duration::from_secs(1),
//!         control_bind: "0.0.0.0:0".parse()?,
//!         server_name: "bench-server-ctrl".to_string(),
//!     };
//!
//!     let rendezvous = FileRendezvous::new("/tmp/cluster-bench");
//!     let mut results = ResultsManager::new(&config, None);
//!     let rounds = run_master(config, &rendezvous, Some(&mut results)).await?;
//!     println!("{} rounds completed", rounds.len());
//!     Ok(())
//! }
//! ```

pub mod address;

/// Command-line interface and configuration
///
/// Argument parsing with clap and the validated `MasterConfig` and
/// `ServerConfig` built from it.
pub mod cli;

pub mod client;
pub mod control;

/// Orchestration of a complete run
///
/// Owns the Client pool and the round sequence. Every round is a barrier over
/// all live workers, bounded by the inactivity limit.
pub mod controller;

pub mod error;
pub mod logging;
pub mod metrics;
pub mod plan;

/// Wire format of the control plane
///
/// Fixed-size structs encoded with bincode using fixed-width, big-endian
/// integers. Receivers reject any datagram whose length does not match.
pub mod protocol;

pub mod rendezvous;

/// Result presentation and output
///
/// Prints the latency and throughput tables as rounds complete and writes an
/// optional JSON report with run metadata.
pub mod results;

pub mod server;

/// Data-plane transports
///
/// `MessageStream` and `MessageListener` implementations for TCP and TIPC,
/// created through `TransportFactory`.
pub mod transport;

pub mod utils;

pub use cli::{Args, MasterConfig, ServerConfig, TransportMode};
pub use controller::{run_master, ControllerSession};
pub use error::{BenchError, BenchResult};
pub use metrics::{Phase, RoundStats};
pub use rendezvous::{FileRendezvous, MemoryRendezvous, Rendezvous};
pub use results::ResultsManager;
pub use server::{serve, Server};

/// The current version of the cluster benchmark
///
/// Populated from Cargo.toml and recorded in the JSON report.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default configuration values
pub mod defaults {
    use std::time::Duration;

    /// Total messages for the latency phase.
    pub const LATENCY_MESSAGES: u32 = 200_000;

    /// Total messages per connection for the throughput phase.
    pub const THROUGHPUT_MESSAGES: u32 = 200_000;

    /// Client connections in the throughput phase.
    pub const CONNECTIONS: u32 = 8;

    /// Size of the first round's messages.
    pub const FIRST_MESSAGE_SIZE: u32 = 64;

    /// Largest message size of the default sweep
    ///
    /// 66000 bytes is the TIPC user message limit, so the same sweep works
    /// for both transports.
    pub const MAX_MESSAGE_SIZE: u32 = 66_000;

    /// First port the Server tries for its TCP listener.
    pub const TCP_BASE_PORT: u16 = 4711;

    /// Directory shared by Controller and Server for discovery.
    pub const RENDEZVOUS_DIR: &str = "/tmp/cluster-bench";

    /// Name under which the Server publishes its control endpoint.
    pub const SERVER_NAME: &str = "bench-server-ctrl";

    /// Longest wait for any control message.
    pub const INACTIVITY_LIMIT: Duration = Duration::from_secs(300);

    /// Pause that lets the Server catch up after a reset or a new connection.
    pub const SETTLE_DELAY: Duration = Duration::from_secs(1);
}
