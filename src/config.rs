use std::time::Duration;

pub const MIN_PARALLEL_TASKS: usize = 4;
pub const MAX_PARALLEL_TASKS: usize = 16;
pub const DEFAULT_PARALLEL_TASKS: usize = 8;

/// Every Nth stdout line of a running task is published as progress.
pub const PROGRESS_SAMPLE_EVERY: usize = 10;

/// Runtime knobs shared by the executor and the coordinator.
#[derive(Debug, Clone)]
pub struct ScanSettings {
    /// Program launched for every scan (normally `nmap`).
    pub program: String,
    /// Pause between consecutive sub-task launches.
    pub launch_stagger: Duration,
    /// Wall-clock limit for the single-shot synchronous scan.
    pub sync_timeout: Duration,
    pub progress_every: usize,
    /// Buffer of each scan's broadcast channel.
    pub event_capacity: usize,
}

impl Default for ScanSettings {
    fn default() -> Self {
        Self {
            program: "nmap".to_string(),
            launch_stagger: Duration::from_millis(200),
            sync_timeout: Duration::from_secs(600),
            progress_every: PROGRESS_SAMPLE_EVERY,
            event_capacity: 1024,
        }
    }
}

impl ScanSettings {
    pub fn with_program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }

    pub fn with_launch_stagger(mut self, stagger: Duration) -> Self {
        self.launch_stagger = stagger;
        self
    }

    pub fn with_sync_timeout(mut self, timeout: Duration) -> Self {
        self.sync_timeout = timeout;
        self
    }
}
