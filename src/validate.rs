use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use thiserror::Error;

use crate::config::{DEFAULT_PARALLEL_TASKS, MAX_PARALLEL_TASKS, MIN_PARALLEL_TASKS};
use crate::types::{ScanRequest, ScanSpec};

/// Flags a client may pass through to the scanner, with a short description for UIs.
pub const ALLOWED_OPTIONS: &[(&str, &str)] = &[
    ("-sS", "TCP SYN scan"),
    ("-sT", "TCP connect scan"),
    ("-sU", "UDP scan"),
    ("-sV", "service version detection"),
    ("-O", "OS detection"),
    ("-A", "aggressive scan"),
    ("-T0", "paranoid timing"),
    ("-T1", "sneaky timing"),
    ("-T2", "polite timing"),
    ("-T3", "normal timing"),
    ("-T4", "aggressive timing"),
];

static TARGET_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-zA-Z0-9][a-zA-Z0-9./-]+$").expect("target pattern compiles"));

static PORTS_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(?:\d+(?:-\d+)?(?:,\d+(?:-\d+)?)*)?$").expect("ports pattern compiles")
});

/// Reasons a request is refused before any work is scheduled.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("no request data provided")]
    EmptyRequest,
    #[error("invalid target format: {0:?}")]
    InvalidTarget(String),
    #[error("invalid port format: {0:?}")]
    InvalidPorts(String),
    #[error("option not allowed: {0}")]
    DisallowedOption(String),
}

pub fn is_valid_target(target: &str) -> bool {
    TARGET_PATTERN.is_match(target)
}

/// Empty, `all` and `-` are accepted alongside comma lists of ports and `a-b` ranges.
pub fn is_valid_ports(ports: &str) -> bool {
    ports.is_empty() || ports == "all" || ports == "-" || PORTS_PATTERN.is_match(ports)
}

pub fn is_allowed_option(option: &str) -> bool {
    ALLOWED_OPTIONS.iter().any(|(flag, _)| *flag == option)
}

/// Interpret a client-supplied parallelism value and clamp it into the supported window.
///
/// Numbers and numeric strings are honoured; anything else falls back to the default.
pub fn clamp_parallelism(raw: Option<&Value>) -> usize {
    let requested = match raw {
        Some(Value::Number(n)) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Some(Value::String(s)) => s.trim().parse::<i64>().ok(),
        _ => None,
    };
    match requested {
        Some(n) => n.clamp(MIN_PARALLEL_TASKS as i64, MAX_PARALLEL_TASKS as i64) as usize,
        None => DEFAULT_PARALLEL_TASKS,
    }
}

/// Check every field of a request and produce a [`ScanSpec`].
///
/// Checks run target, then ports, then options, and stop at the first failure.
pub fn validate_request(req: &ScanRequest) -> Result<ScanSpec, ValidationError> {
    if req.target.is_empty() || !is_valid_target(&req.target) {
        return Err(ValidationError::InvalidTarget(req.target.clone()));
    }
    if !is_valid_ports(&req.ports) {
        return Err(ValidationError::InvalidPorts(req.ports.clone()));
    }
    if let Some(bad) = req.options.iter().find(|o| !is_allowed_option(o)) {
        return Err(ValidationError::DisallowedOption(bad.clone()));
    }

    let ports = if req.ports == "all" {
        "-".to_string()
    } else {
        req.ports.clone()
    };

    Ok(ScanSpec {
        target: req.target.clone(),
        ports,
        options: req.options.clone(),
        scan_all_ports: req.scan_all_ports,
        parallelism: clamp_parallelism(req.parallel_tasks.as_ref()),
    })
}
