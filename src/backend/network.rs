//! Dynamic subnet allocation for the shared container network.
//!
//! The allocator scans the subnets already present on the host, then walks
//! candidate /24 blocks inside the configured private supernets and picks
//! the first block that intersects nothing. The result is deterministic
//! given the existing-network set and supernet order: numeric-lowest-first.

use std::net::Ipv4Addr;
use std::str::FromStr;

use ipnetwork::{IpNetwork, Ipv4Network};

/// Preferred supernets, tried in order; rotation on exhaustion.
pub const DEFAULT_SUPERNETS: [&str; 5] = [
    "10.100.0.0/16",
    "10.101.0.0/16",
    "10.102.0.0/16",
    "10.103.0.0/16",
    "10.104.0.0/16",
];

/// Parse raw subnet strings reported by the runtime into canonical CIDR form.
///
/// Malformed entries and IPv6 entries are ignored with a warning; so are
/// non-private IPv4 subnets, which the platform never allocates near.
pub fn parse_existing<I, S>(raw: I) -> Vec<Ipv4Network>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut parsed = Vec::new();
    for entry in raw {
        let entry = entry.as_ref().trim();
        if entry.is_empty() {
            continue;
        }
        match IpNetwork::from_str(entry) {
            Ok(IpNetwork::V4(network)) => {
                if network.network().is_private() {
                    parsed.push(network);
                } else {
                    tracing::warn!(subnet = %entry, "ignoring non-private subnet");
                }
            }
            Ok(IpNetwork::V6(_)) => {
                tracing::debug!(subnet = %entry, "ignoring IPv6 subnet");
            }
            Err(e) => {
                tracing::warn!(subnet = %entry, error = %e, "ignoring malformed subnet");
            }
        }
    }
    parsed
}

/// Supernet candidate list, honoring an `MCP_SUBNET` override.
///
/// The override must be a private IPv4 network that intersects none of the
/// existing subnets; on violation it is logged and the defaults are used.
pub fn resolve_supernets(
    override_value: Option<&str>,
    existing: &[Ipv4Network],
) -> Vec<Ipv4Network> {
    let defaults: Vec<Ipv4Network> = DEFAULT_SUPERNETS
        .iter()
        .map(|s| s.parse().expect("default supernets parse"))
        .collect();

    let Some(raw) = override_value else {
        return defaults;
    };

    match Ipv4Network::from_str(raw.trim()) {
        Ok(network) if !network.network().is_private() => {
            tracing::warn!(subnet = %raw, "MCP_SUBNET is not private, falling back");
            defaults
        }
        Ok(network) if existing.iter().any(|e| cidrs_overlap(network, *e)) => {
            tracing::warn!(subnet = %raw, "MCP_SUBNET overlaps an existing network, falling back");
            defaults
        }
        Ok(network) => {
            let mut supernets = vec![network];
            supernets.extend(defaults);
            supernets
        }
        Err(e) => {
            tracing::warn!(subnet = %raw, error = %e, "MCP_SUBNET is malformed, falling back");
            defaults
        }
    }
}

/// Pick the first /24 inside the supernets that intersects no existing
/// subnet. Returns `None` on complete exhaustion — the caller then creates
/// the network without explicit IPAM rather than failing.
pub fn allocate_subnet(
    existing: &[Ipv4Network],
    supernets: &[Ipv4Network],
) -> Option<Ipv4Network> {
    for supernet in supernets {
        if supernet.prefix() > 24 {
            tracing::warn!(supernet = %supernet, "supernet narrower than /24, skipping");
            continue;
        }
        let base = u32::from(supernet.network());
        let blocks = 1u32 << (24 - supernet.prefix());
        for index in 0..blocks {
            let address = Ipv4Addr::from(base + (index << 8));
            let candidate = Ipv4Network::new(address, 24).expect("/24 is a valid prefix");
            if !existing.iter().any(|e| cidrs_overlap(candidate, *e)) {
                return Some(candidate);
            }
        }
    }
    None
}

/// Two CIDR blocks overlap iff either contains the other's network address.
fn cidrs_overlap(a: Ipv4Network, b: Ipv4Network) -> bool {
    a.contains(b.network()) || b.contains(a.network())
}
