use ipnet::IpNet;
use nmap_fanout::planner::plan;
use nmap_fanout::split::{expand_ports, split_addresses, split_ports};
use std::collections::BTreeSet;
use std::net::Ipv4Addr;

/// Expand a rendered chunk (`a.b.c.d` or `start-end`) back into numeric addresses.
fn chunk_addresses(chunk: &str) -> Vec<u32> {
    match chunk.split_once('-') {
        Some((a, b)) => {
            let start = u32::from(a.parse::<Ipv4Addr>().unwrap());
            let end = u32::from(b.parse::<Ipv4Addr>().unwrap());
            (start..=end).collect()
        }
        None => vec![u32::from(chunk.parse::<Ipv4Addr>().unwrap())],
    }
}

#[test]
fn cidr_chunks_partition_the_network() {
    for cidr in ["10.0.0.0/30", "10.0.0.0/29", "192.168.7.0/24", "172.16.0.0/22", "10.1.2.3/27", "10.9.9.9/32"] {
        let net: IpNet = cidr.parse().unwrap();
        let IpNet::V4(net) = net else { unreachable!() };
        let expected: BTreeSet<u32> = (u32::from(net.network())..=u32::from(net.broadcast())).collect();

        for n in 1..=20 {
            let chunks = split_addresses(cidr, n);
            assert!(!chunks.is_empty());
            assert!(chunks.len() <= n, "{cidr} n={n}: {} chunks", chunks.len());

            let mut seen = BTreeSet::new();
            for chunk in &chunks {
                for addr in chunk_addresses(chunk) {
                    assert!(seen.insert(addr), "{cidr} n={n}: overlap at {chunk}");
                }
            }
            assert_eq!(seen, expected, "{cidr} n={n}: union differs");
        }
    }
}

#[test]
fn tiny_network_clamps_to_one_address_per_task() {
    let chunks = split_addresses("10.0.0.0/30", 8);
    assert_eq!(chunks.len(), 4);
    assert!(chunks.iter().all(|c| !c.contains('-')));
}

#[test]
fn port_chunks_partition_the_list() {
    for spec in ["1-100", "22,80,443", "1-5,7,9-12,100-101", "8080", "20-25,22-30", "1-1000,2000-2003"] {
        let expected = expand_ports(spec).unwrap();
        for n in 1..=20 {
            let chunks = split_ports(spec, n);
            assert!(!chunks.is_empty());
            assert!(chunks.len() <= n);

            let mut rebuilt = Vec::new();
            for chunk in &chunks {
                let ports = expand_ports(chunk).unwrap();
                assert!(!ports.is_empty());
                // Each chunk re-expands to a contiguous slice of the sorted list.
                let offset = rebuilt.len();
                assert_eq!(ports.as_slice(), &expected[offset..offset + ports.len()]);
                rebuilt.extend(ports);
            }
            assert_eq!(rebuilt, expected, "{spec} n={n}");
        }
    }
}

#[test]
fn full_port_range_covers_every_port_once() {
    for n in [1, 4, 7, 16] {
        let chunks = split_ports("", n);
        assert_eq!(chunks.len(), n);
        let ports: Vec<u16> = chunks.iter().flat_map(|c| expand_ports(c).unwrap()).collect();
        assert_eq!(ports.len(), 65_535);
        assert_eq!(ports.first(), Some(&1));
        assert_eq!(ports.last(), Some(&65_535));
        assert!(ports.windows(2).all(|w| w[0] + 1 == w[1]));
    }
}

#[test]
fn single_host_plan_splits_ports() {
    let tasks = plan("scanme.example.com", "1-100", 4);
    assert_eq!(tasks.len(), 4);
    for task in &tasks {
        assert_eq!(task.target, "scanme.example.com");
        assert_eq!(expand_ports(&task.ports).unwrap().len(), 25);
    }
}

#[test]
fn network_plan_never_splits_ports() {
    let tasks = plan("10.0.0.0/24", "-", 8);
    assert_eq!(tasks.len(), 8);
    assert!(tasks.iter().all(|t| t.ports == "-"));
    assert_eq!(tasks[0].target, "10.0.0.0-10.0.0.31");
    assert_eq!(tasks[7].target, "10.0.0.224-10.0.0.255");
}
