//! Reassembly of several scanner reports into one.
//!
//! The scanner's plain-text report is scraped with conservative patterns: a banner up to the
//! port table, the table rows, and the `Nmap done:` footer. Anything else is dropped.
use std::collections::BTreeMap;

use once_cell::sync::Lazy;
use regex::Regex;

use crate::types::SubTaskResult;

/// Strategy for turning successful sub-task outputs into a single report.
pub trait ReportMerger: Send + Sync {
    fn merge(&self, results: &[SubTaskResult]) -> String;
}

static BANNER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)Starting Nmap.*?PORT").expect("banner pattern compiles"));
static TABLE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?s)(PORT\s+STATE\s+SERVICE.*?)(?:\n\n|\nNmap done:|\z)").expect("table pattern compiles")
});
static HOST: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?m)^Nmap scan report for (.+)$").expect("host pattern compiles"));
static ROW: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(\d+)/(\w+)\s+(\S+)\s+(.*)$").expect("row pattern compiles"));
static FOOTER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)Nmap done:.*$").expect("footer pattern compiles"));
static ELAPSED: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"scanned in ([\d.]+) seconds").expect("elapsed pattern compiles"));
static HOSTS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(\d+) IP address").expect("hosts pattern compiles"));

/// One row of the port table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortRow {
    pub port: u16,
    pub proto: String,
    pub state: String,
    pub service: String,
}

/// Port rows found under one `Nmap scan report for` heading.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HostSection {
    /// `None` when the report carries no host heading at all.
    pub host: Option<String>,
    pub rows: Vec<PortRow>,
}

/// What could be recognised in a single report.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedReport {
    pub banner: Option<String>,
    pub sections: Vec<HostSection>,
    pub elapsed_secs: Option<f64>,
    pub hosts: Option<u64>,
}

fn parse_rows(section: &str) -> Vec<PortRow> {
    TABLE
        .captures(section)
        .and_then(|c| c.get(1))
        .map(|table| {
            table
                .as_str()
                .lines()
                .skip(1)
                .filter_map(|line| {
                    let caps = ROW.captures(line.trim())?;
                    Some(PortRow {
                        port: caps[1].parse().ok()?,
                        proto: caps[2].to_string(),
                        state: caps[3].to_string(),
                        service: caps[4].to_string(),
                    })
                })
                .collect()
        })
        .unwrap_or_default()
}

pub fn parse_report(text: &str) -> ParsedReport {
    let banner = BANNER.find(text).map(|m| {
        let s = m.as_str();
        s[..s.len() - "PORT".len()].trim().to_string()
    });

    let headings: Vec<(usize, String)> = HOST
        .captures_iter(text)
        .filter_map(|c| Some((c.get(0)?.start(), c[1].trim().to_string())))
        .collect();
    let sections: Vec<HostSection> = if headings.is_empty() {
        vec![HostSection {
            host: None,
            rows: parse_rows(text),
        }]
    } else {
        headings
            .iter()
            .enumerate()
            .map(|(i, (start, host))| {
                let end = headings.get(i + 1).map_or(text.len(), |(next, _)| *next);
                HostSection {
                    host: Some(host.clone()),
                    rows: parse_rows(&text[*start..end]),
                }
            })
            .collect()
    };
    let sections = sections.into_iter().filter(|s| !s.rows.is_empty()).collect();

    let footer = FOOTER.find(text).map(|m| m.as_str());
    let elapsed_secs = footer
        .and_then(|f| ELAPSED.captures(f))
        .and_then(|c| c[1].parse::<f64>().ok());
    let hosts = footer
        .and_then(|f| HOSTS.captures(f))
        .and_then(|c| c[1].parse::<u64>().ok());

    ParsedReport {
        banner,
        sections,
        elapsed_secs,
        hosts,
    }
}

/// Merger for nmap's normal (`-oN` style) text output.
#[derive(Debug, Clone, Copy, Default)]
pub struct NmapTextMerger;

impl ReportMerger for NmapTextMerger {
    fn merge(&self, results: &[SubTaskResult]) -> String {
        match results {
            [] => String::new(),
            [only] => only.raw_output.clone(),
            many => merge_reports(many),
        }
    }
}

type PortTable = BTreeMap<(u16, String), (String, String)>;

fn merge_reports(results: &[SubTaskResult]) -> String {
    let mut banner: Option<String> = None;
    // Targets stay in the order they first appear; rows are keyed so the last write wins.
    let mut tables: Vec<(String, PortTable)> = Vec::new();
    let mut saw_footer = false;
    let mut total_secs = 0.0f64;
    let mut total_hosts = 0u64;

    for result in results {
        let parsed = parse_report(&result.raw_output);
        if banner.is_none() {
            banner = parsed.banner;
        }

        // A chunk that covered several hosts keeps each host's rows under its own label.
        let per_host = parsed.sections.len() > 1;
        for section in parsed.sections {
            let label = match (per_host, section.host) {
                (true, Some(host)) => host,
                _ => result.target.clone(),
            };
            let idx = match tables.iter().position(|(t, _)| *t == label) {
                Some(i) => i,
                None => {
                    tables.push((label, PortTable::new()));
                    tables.len() - 1
                }
            };
            for row in section.rows {
                tables[idx].1.insert((row.port, row.proto), (row.state, row.service));
            }
        }

        if parsed.elapsed_secs.is_some() || parsed.hosts.is_some() {
            saw_footer = true;
            total_secs += parsed.elapsed_secs.unwrap_or(0.0);
            total_hosts += parsed.hosts.unwrap_or(0);
        }
    }

    let mut out: Vec<String> = Vec::new();
    if let Some(banner) = banner {
        out.push(banner);
        out.push(String::new());
    }
    out.push("PORT\tSTATE\tSERVICE".to_string());

    let labelled = tables.len() > 1;
    for (target, rows) in &tables {
        if labelled {
            out.push(String::new());
            out.push(format!("Target: {target}"));
        }
        for ((port, proto), (state, service)) in rows {
            out.push(format!("{port}/{proto}\t{state}\t{service}"));
        }
    }

    if saw_footer {
        out.push(String::new());
        out.push(format!(
            "Nmap done: {total_hosts} IP {} scanned in {total_secs:.2} seconds ({} parallel tasks)",
            if total_hosts == 1 { "address" } else { "addresses" },
            results.len()
        ));
    }

    out.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    const REPORT: &str = "Starting Nmap 7.94 ( https://nmap.org ) at 2024-05-01 10:00 UTC
Nmap scan report for 10.0.0.1
Host is up (0.00050s latency).
Not shown: 998 closed tcp ports (reset)
PORT     STATE SERVICE
443/tcp  open  https
22/tcp   open  ssh
53/udp   open|filtered domain

Nmap done: 1 IP address (1 host up) scanned in 1.25 seconds
";

    #[test]
    fn parses_banner_rows_and_footer() {
        let parsed = parse_report(REPORT);
        let banner = parsed.banner.unwrap();
        assert!(banner.starts_with("Starting Nmap 7.94"));
        assert!(banner.ends_with("Not shown: 998 closed tcp ports (reset)"));
        assert_eq!(parsed.sections.len(), 1);
        let section = &parsed.sections[0];
        assert_eq!(section.host.as_deref(), Some("10.0.0.1"));
        assert_eq!(section.rows.len(), 3);
        assert_eq!(section.rows[2].state, "open|filtered");
        assert_eq!(section.rows[0].service, "https");
        assert_eq!(parsed.elapsed_secs, Some(1.25));
        assert_eq!(parsed.hosts, Some(1));
    }

    #[test]
    fn table_ending_at_footer_without_blank_line() {
        let text = "PORT STATE SERVICE\n80/tcp open http\nNmap done: 1 IP address (1 host up) scanned in 0.10 seconds";
        let parsed = parse_report(text);
        assert_eq!(parsed.banner, None);
        assert_eq!(parsed.sections.len(), 1);
        assert_eq!(parsed.sections[0].host, None);
        assert_eq!(parsed.sections[0].rows[0].port, 80);
    }

    #[test]
    fn unrecognised_text_parses_to_nothing() {
        assert_eq!(parse_report("Note: Host seems down."), ParsedReport::default());
    }

    #[test]
    fn each_host_heading_gets_its_own_rows() {
        let text = "Nmap scan report for 10.0.0.1\nPORT STATE SERVICE\n22/tcp open ssh\n\n\
                    Nmap scan report for 10.0.0.2\nHost is up.\n\n\
                    Nmap scan report for 10.0.0.3\nPORT STATE SERVICE\n80/tcp open http\n\n\
                    Nmap done: 3 IP addresses (3 hosts up) scanned in 2.00 seconds\n";
        let parsed = parse_report(text);
        let hosts: Vec<_> = parsed.sections.iter().map(|s| s.host.as_deref()).collect();
        assert_eq!(hosts, vec![Some("10.0.0.1"), Some("10.0.0.3")]);
        assert_eq!(parsed.sections[1].rows[0].port, 80);
        assert_eq!(parsed.hosts, Some(3));
    }

    #[test]
    fn empty_input_merges_to_empty_report() {
        assert_eq!(NmapTextMerger.merge(&[]), "");
    }
}
