//! Choosing which Server address a TCP Client connects to.

use std::net::Ipv4Addr;

/// Pick the Server address that best matches the Client's interfaces.
///
/// If the two hosts share an address they are the same node and loopback is
/// used. Otherwise the Server address whose highest differing bit against any
/// Client address is lowest wins, which prefers the Server interface on the
/// Client's own subnet. Ties keep the first candidate found. Returns `None`
/// when either list is empty.
pub fn select_address(server_ips: &[Ipv4Addr], client_ips: &[Ipv4Addr]) -> Option<Ipv4Addr> {
    if server_ips.iter().any(|s| client_ips.contains(s)) {
        return Some(Ipv4Addr::LOCALHOST);
    }

    let mut best: Option<(u32, Ipv4Addr)> = None;
    for &server in server_ips {
        for &client in client_ips {
            let mismatch = mismatch_len(server, client);
            if best.map_or(true, |(current, _)| mismatch < current) {
                best = Some((mismatch, server));
            }
        }
    }
    best.map(|(_, ip)| ip)
}

/// Number of bits from the most significant differing bit downwards.
fn mismatch_len(a: Ipv4Addr, b: Ipv4Addr) -> u32 {
    32 - (u32::from(a) ^ u32::from(b)).leading_zeros()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(s: &str) -> Ipv4Addr {
        s.parse().unwrap()
    }

    #[test]
    fn test_shared_address_means_loopback() {
        let server = [ip("10.0.0.5"), ip("192.168.1.5")];
        let client = [ip("172.16.0.1"), ip("192.168.1.5")];
        assert_eq!(select_address(&server, &client), Some(Ipv4Addr::LOCALHOST));
    }

    #[test]
    fn test_prefers_same_subnet() {
        let server = [ip("10.1.0.5"), ip("192.168.1.5")];
        let client = [ip("192.168.1.77")];
        assert_eq!(select_address(&server, &client), Some(ip("192.168.1.5")));
    }

    #[test]
    fn test_compares_against_every_client_address() {
        let server = [ip("172.16.4.1"), ip("10.9.9.9")];
        let client = [ip("192.168.0.2"), ip("10.9.9.200")];
        assert_eq!(select_address(&server, &client), Some(ip("10.9.9.9")));
    }

    #[test]
    fn test_ties_keep_first_candidate() {
        // Both differ from the client in bit 1 only.
        let server = [ip("10.0.0.2"), ip("10.0.0.3")];
        let client = [ip("10.0.0.1")];
        assert_eq!(mismatch_len(server[0], client[0]), 2);
        assert_eq!(mismatch_len(server[1], client[0]), 2);
        assert_eq!(select_address(&server, &client), Some(ip("10.0.0.2")));
    }

    #[test]
    fn test_empty_lists() {
        assert_eq!(select_address(&[], &[ip("10.0.0.1")]), None);
        assert_eq!(select_address(&[ip("10.0.0.1")], &[]), None);
    }

    #[test]
    fn test_mismatch_len() {
        assert_eq!(mismatch_len(ip("10.0.0.1"), ip("10.0.0.1")), 0);
        assert_eq!(mismatch_len(ip("0.0.0.0"), ip("128.0.0.0")), 32);
        assert_eq!(mismatch_len(ip("10.0.0.0"), ip("10.0.0.255")), 8);
    }
}
