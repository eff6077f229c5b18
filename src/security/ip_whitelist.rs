// IP Whitelist Matching
// Validation of IP / CIDR entries and fail-closed matching of request
// addresses against the debug access whitelist.

use std::net::Ipv6Addr;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Family {
    V4,
    V6,
}

impl Family {
    fn bits(self) -> u32 {
        match self {
            Family::V4 => 32,
            Family::V6 => 128,
        }
    }
}

/// Strict dotted-quad parse: four non-empty decimal octets, each 0-255.
fn parse_ipv4(s: &str) -> Option<u32> {
    let mut value: u32 = 0;
    let mut count = 0;
    for part in s.split('.') {
        if part.is_empty() || part.len() > 3 || !part.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        let octet: u32 = part.parse().ok()?;
        if octet > 255 {
            return None;
        }
        value = (value << 8) | octet;
        count += 1;
    }
    (count == 4).then_some(value)
}

fn parse_ipv6(s: &str) -> Option<u128> {
    s.parse::<Ipv6Addr>().ok().map(u128::from)
}

fn parse_address(s: &str) -> Option<(Family, u128)> {
    if let Some(v4) = parse_ipv4(s) {
        return Some((Family::V4, v4 as u128));
    }
    parse_ipv6(s).map(|v6| (Family::V6, v6))
}

fn parse_prefix(s: &str) -> Option<u32> {
    if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    s.parse().ok()
}

fn network_mask(family: Family, prefix: u32) -> u128 {
    let bits = family.bits();
    if prefix == 0 {
        return 0;
    }
    let width = if bits == 128 {
        u128::MAX
    } else {
        (1u128 << bits) - 1
    };
    (u128::MAX << (bits - prefix)) & width
}

/// Whether `s` is a valid IPv4/IPv6 address, optionally with a `/prefix`.
pub fn is_valid_ip_or_cidr(s: &str) -> bool {
    let s = s.trim();
    let (address, prefix) = match s.split_once('/') {
        Some((address, prefix)) => (address, Some(prefix)),
        None => (s, None),
    };

    let Some((family, _)) = parse_address(address) else {
        return false;
    };

    match prefix {
        None => true,
        Some(prefix) => parse_prefix(prefix).is_some_and(|p| p <= family.bits()),
    }
}

/// Canonical form of a request address: brackets and zone id removed,
/// IPv4-mapped IPv6 reduced to plain IPv4, lowercase.
pub fn normalize_request_ip(ip: &str) -> String {
    let mut ip = ip.trim();
    if let Some(inner) = ip.strip_prefix('[').and_then(|rest| rest.strip_suffix(']')) {
        ip = inner;
    }
    if let Some((address, _zone)) = ip.split_once('%') {
        ip = address;
    }

    let lower = ip.to_ascii_lowercase();
    if let Some(mapped) = lower.strip_prefix("::ffff:")
        && parse_ipv4(mapped).is_some()
    {
        return mapped.to_string();
    }
    lower
}

fn entry_matches(candidate: &str, entry: &str) -> bool {
    let entry = entry.trim();
    if entry.is_empty() {
        return false;
    }

    let Some((network, prefix)) = entry.split_once('/') else {
        return normalize_request_ip(entry) == candidate;
    };

    let Some(prefix) = parse_prefix(prefix) else {
        return false;
    };
    let Some((entry_family, network)) = parse_address(network) else {
        return false;
    };
    let Some((candidate_family, address)) = parse_address(candidate) else {
        return false;
    };
    if entry_family != candidate_family || prefix > entry_family.bits() {
        return false;
    }

    let mask = network_mask(entry_family, prefix);
    address & mask == network & mask
}

/// Whether `ip` is matched by any whitelist entry. Malformed entries and
/// unparseable addresses never match.
pub fn is_ip_allowed_by_whitelist<S: AsRef<str>>(ip: &str, entries: &[S]) -> bool {
    let candidate = normalize_request_ip(ip);
    if candidate.is_empty() {
        return false;
    }
    entries
        .iter()
        .any(|entry| entry_matches(&candidate, entry.as_ref()))
}
