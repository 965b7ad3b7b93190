use std::collections::HashSet;
use std::net::{IpAddr, UdpSocket};

use crate::config::DiscoveryConfig;

/// First three octets of the local outbound IPv4 interface, if any.
///
/// Connecting a UDP socket only selects a route; nothing is sent.
pub fn local_segment() -> Option<String> {
    let socket = UdpSocket::bind("0.0.0.0:0").ok()?;
    socket.connect("8.8.8.8:80").ok()?;
    match socket.local_addr().ok()?.ip() {
        IpAddr::V4(ip) if !ip.is_loopback() && !ip.is_unspecified() => {
            let [a, b, c, _] = ip.octets();
            Some(format!("{}.{}.{}", a, b, c))
        }
        _ => None,
    }
}

/// Segments to scan: the local one first when enabled, then the configured
/// list, without duplicates.
pub fn scan_segments(config: &DiscoveryConfig) -> Vec<String> {
    let mut segments = Vec::new();
    if config.auto_detect_segments {
        if let Some(local) = local_segment() {
            segments.push(local);
        }
    }
    for segment in &config.scan_segments {
        if !segments.contains(segment) {
            segments.push(segment.clone());
        }
    }
    segments
}

/// Candidate addresses for one discovery sweep, excluding known machines.
pub fn candidate_addresses(
    segments: &[String],
    config: &DiscoveryConfig,
    known: &HashSet<String>,
) -> Vec<String> {
    let mut seen = HashSet::new();
    segments
        .iter()
        .flat_map(|segment| {
            config
                .suffix_ranges
                .iter()
                .flat_map(|range| range.clone())
                .map(move |suffix| format!("{}.{}", segment, suffix))
        })
        .filter(|address| !known.contains(address))
        .filter(|address| seen.insert(address.clone()))
        .collect()
}
