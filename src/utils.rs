//! # Utility Functions and Helper Module
//!
//! Helpers shared by the Controller, the Server and the report code:
//!
//! - **Host identity**: the node id carried in Server replies and the list of
//!   local IPv4 interface addresses used for TCP address selection
//! - **Validation**: command-line parameter checks with clear error messages
//! - **Formatting**: human-readable durations for progress logs
//! - **Display Helpers**: fixed-width console table rows
//!
//! ## Usage Examples
//!
//! ```rust
//! use cluster_bench::utils::*;
//!
//! # fn main() -> anyhow::Result<()> {
//! assert_eq!(format_duration_ns(1_500_000), "1.50ms");
//!
//! validate_connections(8)?;
//! # Ok(())
//! # }
//! ```

use crate::protocol::{MAX_MESSAGE_LEN, MAX_SERVER_IPS};
use anyhow::Result;
use std::io;
use std::net::{Ipv4Addr, SocketAddrV4};
use uuid::Uuid;

/// Generate a unique identifier for a benchmark run
///
/// The id is recorded in the JSON report so that results collected from
/// several runs (or several hosts) can be told apart.
pub fn generate_test_id() -> String {
    Uuid::new_v4().to_string()
}

/// Identity of this node within the cluster
///
/// A stable 32-bit value derived from the host name with the FNV-1a hash.
/// The Server reports it in every reply so the Controller can tell whether
/// the two run on the same host. Falls back to 0 if the host name cannot be
/// read, which every such host then shares.
pub fn own_node_id() -> u32 {
    match hostname::get() {
        Ok(name) => fnv1a(name.to_string_lossy().as_bytes()),
        Err(_) => 0,
    }
}

fn fnv1a(bytes: &[u8]) -> u32 {
    const OFFSET_BASIS: u32 = 0x811c_9dc5;
    const PRIME: u32 = 0x0100_0193;
    bytes.iter().fold(OFFSET_BASIS, |hash, &b| {
        (hash ^ u32::from(b)).wrapping_mul(PRIME)
    })
}

/// Enumerate the IPv4 addresses of the local interfaces
///
/// Loopback and unspecified addresses are skipped, duplicates (aliases shared
/// by several interface entries) are removed, and the list is truncated to the
/// number of addresses a Server reply can carry.
///
/// ## Errors
///
/// Fails only if the interface table itself cannot be read.
pub fn local_ipv4_addrs() -> io::Result<Vec<Ipv4Addr>> {
    let interfaces = nix::ifaddrs::getifaddrs().map_err(io::Error::from)?;

    let mut ips = Vec::new();
    for ifaddr in interfaces {
        let Some(sin) = ifaddr.address.as_ref().and_then(|a| a.as_sockaddr_in()) else {
            continue;
        };
        let ip = *SocketAddrV4::from(*sin).ip();
        if ip.is_loopback() || ip.is_unspecified() || ips.contains(&ip) {
            continue;
        }
        ips.push(ip);
        if ips.len() == MAX_SERVER_IPS {
            break;
        }
    }
    Ok(ips)
}

/// Convert nanoseconds to a human-readable duration string
///
/// Picks the largest unit that keeps the value at or above one and prints
/// two decimals for anything above nanoseconds.
///
/// ```rust
/// # use cluster_bench::utils::format_duration_ns;
/// assert_eq!(format_duration_ns(500), "500ns");
/// assert_eq!(format_duration_ns(1500), "1.50us");
/// assert_eq!(format_duration_ns(2_250_000_000), "2.25s");
/// ```
pub fn format_duration_ns(ns: u64) -> String {
    if ns < 1_000 {
        format!("{}ns", ns)
    } else if ns < 1_000_000 {
        format!("{:.2}us", ns as f64 / 1_000.0)
    } else if ns < 1_000_000_000 {
        format!("{:.2}ms", ns as f64 / 1_000_000.0)
    } else {
        format!("{:.2}s", ns as f64 / 1_000_000_000.0)
    }
}

/// Validate the size of the Client pool
///
/// At least one connection is needed for the latency phase; the upper bound
/// keeps a typo from spawning thousands of tasks and sockets.
pub fn validate_connections(connections: u32) -> Result<()> {
    if connections == 0 {
        anyhow::bail!("Number of connections must be at least 1");
    }
    if connections > 1024 {
        anyhow::bail!("Number of connections {} is too high (maximum 1024)", connections);
    }
    Ok(())
}

/// Validate a message size
///
/// Zero-length messages carry nothing to measure, and every worker allocates
/// a buffer of the maximum size, so sizes are capped at 16 MiB.
pub fn validate_message_size(message_size: u32) -> Result<()> {
    if message_size == 0 {
        anyhow::bail!("Message size cannot be zero");
    }
    if message_size > MAX_MESSAGE_LEN {
        anyhow::bail!("Message size {} is too large (maximum 16MiB)", message_size);
    }
    Ok(())
}

/// Validate the latency and throughput message counts
///
/// A zero count skips that phase, but a run must measure something.
pub fn validate_message_counts(latency: u32, throughput: u32) -> Result<()> {
    if latency == 0 && throughput == 0 {
        anyhow::bail!("Latency and throughput message counts are both zero; at least one phase must run");
    }
    Ok(())
}

/// Validate a base port for the TCP listener
///
/// Ports below 1024 need elevated privileges on most systems.
pub fn validate_port(port: u16) -> Result<()> {
    if port < 1024 {
        anyhow::bail!("Port number {} is too low (below 1024)", port);
    }
    Ok(())
}

/// Format one row of a console table
///
/// Columns are right-aligned to the given widths; a missing width defaults
/// to 10.
///
/// ```rust
/// # use cluster_bench::utils::{format_table_row, format_table_separator};
/// let widths = [4, 6];
/// assert_eq!(format_table_separator(&widths), "+------+--------+");
/// assert_eq!(format_table_row(&["64", "200"], &widths), "|   64 |    200 |");
/// ```
pub fn format_table_row(columns: &[&str], widths: &[usize]) -> String {
    let mut line = String::from("|");
    for (i, column) in columns.iter().enumerate() {
        let width = widths.get(i).copied().unwrap_or(10);
        line.push_str(&format!(" {:>width$} |", column, width = width));
    }
    line
}

pub fn format_table_separator(widths: &[usize]) -> String {
    let mut line = String::from("+");
    for &width in widths {
        line.push_str(&"-".repeat(width + 2));
        line.push('+');
    }
    line
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_test_id_is_unique() {
        let a = generate_test_id();
        let b = generate_test_id();
        assert_ne!(a, b);
        assert_eq!(a.len(), 36);
    }

    #[test]
    fn test_fnv1a_known_values() {
        assert_eq!(fnv1a(b""), 0x811c_9dc5);
        assert_eq!(fnv1a(b"a"), 0xe40c_292c);
    }

    #[test]
    fn test_own_node_id_is_stable() {
        assert_eq!(own_node_id(), own_node_id());
    }

    #[test]
    fn test_local_ipv4_addrs_filtering() {
        let ips = local_ipv4_addrs().unwrap();
        assert!(ips.len() <= MAX_SERVER_IPS);
        assert!(ips.iter().all(|ip| !ip.is_loopback() && !ip.is_unspecified()));
        let mut deduped = ips.clone();
        deduped.dedup();
        assert_eq!(deduped.len(), ips.len());
    }

    #[test]
    fn test_format_duration_ns() {
        assert_eq!(format_duration_ns(999), "999ns");
        assert_eq!(format_duration_ns(1_000), "1.00us");
        assert_eq!(format_duration_ns(1_500_000), "1.50ms");
        assert_eq!(format_duration_ns(3_000_000_000), "3.00s");
    }

    #[test]
    fn test_validate_connections() {
        assert!(validate_connections(1).is_ok());
        assert!(validate_connections(8).is_ok());
        assert!(validate_connections(0).is_err());
        assert!(validate_connections(1025).is_err());
    }

    #[test]
    fn test_validate_message_size() {
        assert!(validate_message_size(64).is_ok());
        assert!(validate_message_size(66000).is_ok());
        assert!(validate_message_size(0).is_err());
        assert!(validate_message_size(MAX_MESSAGE_LEN).is_ok());
        assert!(validate_message_size(MAX_MESSAGE_LEN + 1).is_err());
    }

    #[test]
    fn test_validate_message_counts() {
        assert!(validate_message_counts(1, 1).is_ok());
        assert!(validate_message_counts(0, 1).is_ok());
        assert!(validate_message_counts(1, 0).is_ok());
        let err = validate_message_counts(0, 0).unwrap_err();
        assert!(err.to_string().contains("at least one phase"));
    }

    #[test]
    fn test_validate_port() {
        assert!(validate_port(4711).is_ok());
        assert!(validate_port(80).is_err());
    }

    #[test]
    fn test_table_formatting() {
        let widths = [4, 6];
        assert_eq!(format_table_separator(&widths), "+------+--------+");
        assert_eq!(format_table_row(&["64", "200"], &widths), "|   64 |    200 |");
    }
}
