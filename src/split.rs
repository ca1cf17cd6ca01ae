//! Partitioning of address and port specifications into disjoint chunks.
//!
//! Both splitters try to produce `n` pieces and return fewer when the space is smaller.
//! Inputs that cannot be split are handed back unchanged as a single piece.
use anyhow::{bail, Context, Result};
use ipnet::IpNet;
use std::collections::BTreeSet;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

pub const MAX_PORT: u32 = 65_535;

/// Split a CIDR network or an `start-end` address range into up to `n` contiguous blocks.
///
/// Blocks are rendered as a bare address when they hold one address, `start-end` otherwise.
/// Single hosts, hostnames and anything unparseable come back as `[spec]`.
pub fn split_addresses(spec: &str, n: usize) -> Vec<String> {
    match address_interval(spec) {
        Ok(Some(interval)) => interval.split(n),
        Ok(None) => vec![spec.to_string()],
        Err(_) => vec![spec.to_string()],
    }
}

/// Split a port specification into up to `n` chunks.
///
/// Empty, `-` and `all` mean every port `1-65535`, cut into contiguous numeric ranges.
/// Explicit lists are expanded, de-duplicated and sorted, then sliced and re-compressed.
/// A list that cannot be parsed comes back as `[spec]`.
pub fn split_ports(spec: &str, n: usize) -> Vec<String> {
    let n = n.max(1);
    if spec.is_empty() || spec == "-" || spec == "all" {
        return split_port_universe(n);
    }
    match expand_ports(spec) {
        Ok(ports) if !ports.is_empty() => split_port_list(&ports, n),
        _ => vec![spec.to_string()],
    }
}

/// Expand `22,80,8000-8002` into the sorted set of distinct ports it names.
///
/// Reversed ranges (`90-80`) name no ports.
pub fn expand_ports(spec: &str) -> Result<Vec<u16>> {
    let mut set = BTreeSet::new();
    for part in spec.split(',') {
        let part = part.trim();
        if let Some((a, b)) = part.split_once('-') {
            let start = parse_port(a).with_context(|| format!("invalid range start: {a}"))?;
            let end = parse_port(b).with_context(|| format!("invalid range end: {b}"))?;
            set.extend(start..=end);
        } else {
            set.insert(parse_port(part).with_context(|| format!("invalid port: {part}"))?);
        }
    }
    Ok(set.into_iter().collect())
}

/// Collapse an ascending port slice into the shortest `a-b,c,d-e` form.
pub fn compress_ports(ports: &[u16]) -> String {
    let mut runs: Vec<String> = Vec::new();
    let mut iter = ports.iter().copied();
    let Some(first) = iter.next() else {
        return String::new();
    };
    let (mut start, mut prev) = (first, first);
    for port in iter {
        if u32::from(port) == u32::from(prev) + 1 {
            prev = port;
            continue;
        }
        runs.push(render_run(start, prev));
        start = port;
        prev = port;
    }
    runs.push(render_run(start, prev));
    runs.join(",")
}

fn render_run(start: u16, end: u16) -> String {
    if start == end {
        start.to_string()
    } else {
        format!("{start}-{end}")
    }
}

fn parse_port(s: &str) -> Result<u16> {
    let val: u32 = s.trim().parse()?;
    if val > MAX_PORT {
        bail!("port out of range: {val}");
    }
    Ok(val as u16)
}

fn split_port_universe(n: usize) -> Vec<String> {
    let n = n.min(MAX_PORT as usize) as u32;
    let per_chunk = MAX_PORT.div_ceil(n);
    (0..n)
        .map(|i| (i * per_chunk + 1, ((i + 1) * per_chunk).min(MAX_PORT)))
        .filter(|(start, end)| start <= end)
        .map(|(start, end)| format!("{start}-{end}"))
        .collect()
}

fn split_port_list(ports: &[u16], n: usize) -> Vec<String> {
    let n = n.min(ports.len()).max(1);
    let per_chunk = ports.len().div_ceil(n);
    ports
        .chunks(per_chunk)
        .filter(|chunk| !chunk.is_empty())
        .map(compress_ports)
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Family {
    V4,
    V6,
}

/// Inclusive numeric address interval of a single family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct AddressInterval {
    family: Family,
    first: u128,
    last: u128,
}

impl AddressInterval {
    fn split(&self, n: usize) -> Vec<String> {
        // span + 1 overflows only for ::/0, which nobody scans in pieces.
        let Some(total) = (self.last - self.first).checked_add(1) else {
            return vec![self.render(self.first, self.last)];
        };
        let n = (n as u128).min(total).max(1);
        let per_chunk = total.div_ceil(n);

        let mut out = Vec::new();
        for i in 0..n {
            let Some(start) = i
                .checked_mul(per_chunk)
                .and_then(|offset| self.first.checked_add(offset))
            else {
                break;
            };
            if start > self.last {
                break;
            }
            let end = start.saturating_add(per_chunk - 1).min(self.last);
            out.push(self.render(start, end));
        }
        out
    }

    fn render(&self, start: u128, end: u128) -> String {
        if start == end {
            self.addr(start).to_string()
        } else {
            format!("{}-{}", self.addr(start), self.addr(end))
        }
    }

    fn addr(&self, value: u128) -> IpAddr {
        match self.family {
            Family::V4 => IpAddr::V4(Ipv4Addr::from(value as u32)),
            Family::V6 => IpAddr::V6(Ipv6Addr::from(value)),
        }
    }
}

fn numeric(ip: IpAddr) -> (Family, u128) {
    match ip {
        IpAddr::V4(v4) => (Family::V4, u128::from(u32::from(v4))),
        IpAddr::V6(v6) => (Family::V6, u128::from(v6)),
    }
}

/// `Ok(None)` means the spec is a single target that is not a range at all.
fn address_interval(spec: &str) -> Result<Option<AddressInterval>> {
    if spec.contains('/') {
        let net: IpNet = spec.trim().parse().context("invalid CIDR")?;
        let (family, first) = numeric(net.network());
        let (_, last) = numeric(net.broadcast());
        return Ok(Some(AddressInterval { family, first, last }));
    }

    if spec.contains('-') {
        let parts: Vec<&str> = spec.split('-').collect();
        let [a, b] = parts.as_slice() else {
            bail!("range must have exactly one '-'");
        };
        let (fa, first) = numeric(a.trim().parse::<IpAddr>()?);
        let (fb, last) = numeric(b.trim().parse::<IpAddr>()?);
        if fa != fb {
            bail!("range mixes address families");
        }
        if last < first {
            bail!("range end precedes start");
        }
        return Ok(Some(AddressInterval { family: fa, first, last }));
    }

    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn small_cidr_is_one_address_per_chunk() {
        assert_eq!(
            split_addresses("10.0.0.0/30", 8),
            vec!["10.0.0.0", "10.0.0.1", "10.0.0.2", "10.0.0.3"]
        );
    }

    #[test]
    fn cidr_blocks_are_contiguous() {
        assert_eq!(
            split_addresses("192.168.1.0/24", 4),
            vec![
                "192.168.1.0-192.168.1.63",
                "192.168.1.64-192.168.1.127",
                "192.168.1.128-192.168.1.191",
                "192.168.1.192-192.168.1.255",
            ]
        );
    }

    #[test]
    fn host_bits_in_cidr_are_ignored() {
        assert_eq!(split_addresses("10.0.0.77/31", 4), vec!["10.0.0.76", "10.0.0.77"]);
    }

    #[test]
    fn uneven_range_truncates_last_chunk() {
        assert_eq!(
            split_addresses("10.0.0.1-10.0.0.10", 4),
            vec!["10.0.0.1-10.0.0.3", "10.0.0.4-10.0.0.6", "10.0.0.7-10.0.0.9", "10.0.0.10"]
        );
    }

    #[test]
    fn ipv6_network_splits() {
        assert_eq!(
            split_addresses("2001:db8::/126", 2),
            vec!["2001:db8::-2001:db8::1", "2001:db8::2-2001:db8::3"]
        );
    }

    #[test]
    fn unsplittable_targets_come_back_verbatim() {
        assert_eq!(split_addresses("scanme.example.com", 8), vec!["scanme.example.com"]);
        assert_eq!(split_addresses("10.0.0.5", 8), vec!["10.0.0.5"]);
        assert_eq!(split_addresses("my-host.lan", 8), vec!["my-host.lan"]);
        assert_eq!(split_addresses("10.0.0.9-10.0.0.1", 4), vec!["10.0.0.9-10.0.0.1"]);
        assert_eq!(split_addresses("10.0.0.0/99", 4), vec!["10.0.0.0/99"]);
        assert_eq!(split_addresses("10.0.0.1-::1", 4), vec!["10.0.0.1-::1"]);
    }

    #[test]
    fn all_ports_universe() {
        assert_eq!(
            split_ports("-", 4),
            vec!["1-16384", "16385-32768", "32769-49152", "49153-65535"]
        );
        assert_eq!(split_ports("", 4), split_ports("all", 4));
    }

    #[test]
    fn explicit_list_is_recompressed() {
        assert_eq!(split_ports("1-100", 4), vec!["1-25", "26-50", "51-75", "76-100"]);
        assert_eq!(split_ports("22,80,443,8000-8001", 2), vec!["22,80,443", "8000-8001"]);
    }

    #[test]
    fn fewer_ports_than_chunks() {
        assert_eq!(split_ports("22,80", 8), vec!["22", "80"]);
    }

    #[test]
    fn chunk_count_may_shrink_after_rounding() {
        // ceil(5 / 4) = 2 per chunk leaves only three chunks.
        assert_eq!(split_ports("1-5", 4), vec!["1-2", "3-4", "5"]);
    }

    #[test]
    fn duplicates_are_removed() {
        assert_eq!(split_ports("80,80,79-81", 1), vec!["79-81"]);
    }

    #[test]
    fn compress_runs() {
        assert_eq!(compress_ports(&[1, 2, 3, 5, 7, 8]), "1-3,5,7-8");
        assert_eq!(compress_ports(&[]), "");
        assert_eq!(compress_ports(&[65534, 65535]), "65534-65535");
    }

    #[test]
    fn unparseable_ports_come_back_verbatim() {
        assert_eq!(split_ports("70000", 4), vec!["70000"]);
        assert_eq!(split_ports("90-80", 4), vec!["90-80"]);
    }
}
