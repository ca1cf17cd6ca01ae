//! Library crate for nmap-fanout: split a scan into sub-tasks, run them in parallel,
//! stream progress, and merge the partial reports.
pub mod config;
pub mod coordinator;
pub mod events;
pub mod executor;
pub mod merge;
pub mod planner;
pub mod server;
pub mod split;
pub mod types;
pub mod validate;
