use serde::{Deserialize, Serialize};

/// Raw scan request as submitted over HTTP or the websocket.
///
/// Nothing here is trusted; `validate::validate_request` turns it into a [`ScanSpec`].
#[derive(Deserialize, Serialize, Debug, Clone, Default, PartialEq)]
pub struct ScanRequest {
    #[serde(default)]
    pub target: String,
    #[serde(default)]
    pub ports: String,
    #[serde(default)]
    pub options: Vec<String>,
    #[serde(default)]
    pub scan_all_ports: bool,
    /// Desired number of sub-tasks. Accepts a number or a numeric string; anything else means default.
    #[serde(default)]
    pub parallel_tasks: Option<serde_json::Value>,
}

/// A validated scan: every field has passed syntax and allow-list checks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanSpec {
    pub target: String,
    /// Empty = tool default ports, `-` = all ports, otherwise a comma list of ports and ranges.
    pub ports: String,
    pub options: Vec<String>,
    pub scan_all_ports: bool,
    /// Already clamped to `[MIN_PARALLEL_TASKS, MAX_PARALLEL_TASKS]`.
    pub parallelism: usize,
}

impl ScanSpec {
    /// Port spec actually handed to the planner: `-` when every port was requested.
    pub fn resolved_ports(&self) -> &str {
        if self.scan_all_ports {
            "-"
        } else {
            &self.ports
        }
    }
}

/// One unit of parallel work.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct SubTask {
    pub task_id: String,
    pub target: String,
    pub ports: String,
}

impl SubTask {
    pub fn new(index: usize, target: impl Into<String>, ports: impl Into<String>) -> Self {
        Self {
            task_id: format!("task_{index}"),
            target: target.into(),
            ports: ports.into(),
        }
    }

    /// Numeric part of `task_N`, used to keep results in plan order.
    pub fn ordinal(task_id: &str) -> usize {
        task_id
            .strip_prefix("task_")
            .and_then(|n| n.parse().ok())
            .unwrap_or(usize::MAX)
    }
}

/// Outcome of running one sub-task.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct SubTaskResult {
    pub task_id: String,
    pub target: String,
    pub ports: String,
    pub command_text: String,
    pub success: bool,
    pub raw_output: String,
    pub error_text: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Error,
}

/// Lifecycle of a whole scan.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ScanState {
    Created,
    Starting,
    TasksCreated,
    Running,
    Completed,
    Error,
    Cancelled,
}

/// Row of the manifest published with `tasks_created`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct TaskManifestEntry {
    pub task_id: String,
    pub target: String,
    pub ports: String,
}

impl From<&SubTask> for TaskManifestEntry {
    fn from(task: &SubTask) -> Self {
        Self {
            task_id: task.task_id.clone(),
            target: task.target.clone(),
            ports: if task.ports.is_empty() {
                "default".to_string()
            } else {
                task.ports.clone()
            },
        }
    }
}

/// Status transitions published on a scan's channel.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ScanEvent {
    Starting {
        message: String,
        threads: usize,
    },
    TasksCreated {
        message: String,
        tasks: Vec<TaskManifestEntry>,
    },
    TaskRunning {
        task_id: String,
        message: String,
        command: String,
    },
    TaskProgress {
        task_id: String,
        partial_result: String,
    },
    TaskCompleted {
        task_id: String,
        message: String,
    },
    TaskError {
        task_id: String,
        message: String,
    },
    Completed {
        message: String,
        result: String,
    },
    Error {
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    Cancelled {
        message: String,
    },
}

impl ScanEvent {
    /// True for the events after which nothing else is published for the scan.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ScanEvent::Completed { .. } | ScanEvent::Error { .. })
    }
}

/// Envelope sent to subscribers: the event plus the scan it belongs to.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ScanUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scan_id: Option<String>,
    #[serde(flatten)]
    pub event: ScanEvent,
}
