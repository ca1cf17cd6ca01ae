use std::any::Any;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use ::time::{format_description::well_known, OffsetDateTime};
use anyhow::{anyhow, bail, Context, Result};
use futures_util::FutureExt;
use serde::Serialize;
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::ScanSettings;
use crate::events::{EventHub, ScanPublisher};
use crate::executor::{self, SingleScanOutcome, TaskExecutor};
use crate::merge::{NmapTextMerger, ReportMerger};
use crate::planner::{plan_with_axis, SplitAxis};
use crate::types::{
    ScanEvent, ScanSpec, ScanState, ScanUpdate, SubTask, SubTaskResult, TaskManifestEntry,
    TaskStatus,
};

/// Per-task row of a live scan.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct TaskEntry {
    pub task_id: String,
    pub target: String,
    pub ports: String,
    pub status: TaskStatus,
}

/// Mutable session state of one scan, owned by the registry until the scan ends.
#[derive(Debug)]
pub struct Scan {
    scan_id: String,
    started_at: OffsetDateTime,
    parallelism: usize,
    state: ScanState,
    tasks: Vec<TaskEntry>,
    completed_tasks: usize,
    cancel: CancellationToken,
}

impl Scan {
    fn new(scan_id: String, parallelism: usize) -> Self {
        Self {
            scan_id,
            started_at: OffsetDateTime::now_utc(),
            parallelism,
            state: ScanState::Created,
            tasks: Vec::new(),
            completed_tasks: 0,
            cancel: CancellationToken::new(),
        }
    }

    /// Lifecycle moves stop once a scan was cancelled so the snapshot keeps saying so.
    fn advance(&mut self, state: ScanState) {
        if !self.cancel.is_cancelled() {
            self.state = state;
        }
    }

    fn set_task_status(&mut self, task_id: &str, status: TaskStatus) {
        if let Some(task) = self.tasks.iter_mut().find(|t| t.task_id == task_id) {
            task.status = status;
        }
    }

    fn snapshot(&self) -> ScanSnapshot {
        ScanSnapshot {
            scan_id: self.scan_id.clone(),
            started_at: self
                .started_at
                .format(&well_known::Rfc3339)
                .unwrap_or_else(|_| String::from("1970-01-01T00:00:00Z")),
            parallelism: self.parallelism,
            state: self.state,
            total_tasks: self.tasks.len(),
            completed_tasks: self.completed_tasks,
            cancelled: self.cancel.is_cancelled(),
            tasks: self.tasks.clone(),
        }
    }
}

/// Serializable view of a [`Scan`].
#[derive(Debug, Clone, Serialize)]
pub struct ScanSnapshot {
    pub scan_id: String,
    pub started_at: String,
    pub parallelism: usize,
    pub state: ScanState,
    pub total_tasks: usize,
    pub completed_tasks: usize,
    pub cancelled: bool,
    pub tasks: Vec<TaskEntry>,
}

/// Live scans keyed by scan id. Entries exist only between start and terminal state.
#[derive(Debug, Default)]
pub struct ScanRegistry {
    scans: RwLock<HashMap<String, Scan>>,
}

impl ScanRegistry {
    async fn insert(&self, scan: Scan) {
        self.scans.write().await.insert(scan.scan_id.clone(), scan);
    }

    async fn remove(&self, scan_id: &str) -> Option<Scan> {
        self.scans.write().await.remove(scan_id)
    }

    /// Apply `f` to the scan if it is still registered.
    async fn update<F>(&self, scan_id: &str, f: F) -> bool
    where
        F: FnOnce(&mut Scan),
    {
        match self.scans.write().await.get_mut(scan_id) {
            Some(scan) => {
                f(scan);
                true
            }
            None => false,
        }
    }

    pub async fn snapshot(&self, scan_id: &str) -> Option<ScanSnapshot> {
        self.scans.read().await.get(scan_id).map(Scan::snapshot)
    }

    pub async fn len(&self) -> usize {
        self.scans.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

/// Handle returned by [`ScanCoordinator::start_scan`].
#[derive(Debug)]
pub struct ScanStarted {
    pub scan_id: String,
    pub parallelism: usize,
    /// Subscribed before any work starts, so no event is missed.
    pub events: broadcast::Receiver<ScanUpdate>,
    /// Fires when the scan is cancelled. Advisory: running sub-tasks are not stopped.
    pub cancelled: CancellationToken,
}

/// Owns the lifecycle of every parallel scan: plan, dispatch, collect, merge, publish.
#[derive(Clone)]
pub struct ScanCoordinator {
    settings: Arc<ScanSettings>,
    registry: Arc<ScanRegistry>,
    hub: Arc<EventHub>,
    merger: Arc<dyn ReportMerger>,
    executor: TaskExecutor,
}

impl ScanCoordinator {
    pub fn new(settings: ScanSettings) -> Self {
        Self::with_merger(settings, Arc::new(NmapTextMerger))
    }

    pub fn with_merger(settings: ScanSettings, merger: Arc<dyn ReportMerger>) -> Self {
        Self {
            executor: TaskExecutor::new(&settings),
            hub: Arc::new(EventHub::new(settings.event_capacity)),
            registry: Arc::new(ScanRegistry::default()),
            settings: Arc::new(settings),
            merger,
        }
    }

    pub fn settings(&self) -> &ScanSettings {
        &self.settings
    }

    pub fn registry(&self) -> &ScanRegistry {
        &self.registry
    }

    pub fn hub(&self) -> &EventHub {
        &self.hub
    }

    /// Register a scan and launch its orchestration in the background.
    pub async fn start_scan(&self, spec: ScanSpec) -> ScanStarted {
        let scan_id = Uuid::new_v4().to_string();
        let scan = Scan::new(scan_id.clone(), spec.parallelism);
        let cancelled = scan.cancel.clone();
        self.registry.insert(scan).await;

        let publisher = self.hub.open(&scan_id).await;
        let events = publisher.subscribe();
        info!(%scan_id, target = %spec.target, parallelism = spec.parallelism, "scan registered");

        let parallelism = spec.parallelism;
        tokio::spawn(self.clone().run(scan_id.clone(), spec, publisher));

        ScanStarted {
            scan_id,
            parallelism,
            events,
            cancelled,
        }
    }

    /// Flag a scan as cancelled and tell its subscribers.
    ///
    /// Advisory only: in-flight sub-tasks keep running and the final report is still
    /// published. Returns false for unknown or finished scans.
    pub async fn cancel(&self, scan_id: &str) -> bool {
        let found = self
            .registry
            .update(scan_id, |scan| {
                scan.cancel.cancel();
                scan.state = ScanState::Cancelled;
            })
            .await;
        if found {
            info!(scan_id, "scan cancellation requested");
            self.hub
                .publish_to(
                    scan_id,
                    ScanEvent::Cancelled {
                        message: "scan cancelled".to_string(),
                    },
                )
                .await;
        }
        found
    }

    pub async fn snapshot(&self, scan_id: &str) -> Option<ScanSnapshot> {
        self.registry.snapshot(scan_id).await
    }

    /// Non-parallel synchronous scan bounded by the configured timeout.
    pub async fn run_single(&self, spec: &ScanSpec) -> SingleScanOutcome {
        executor::run_single(&self.settings.program, spec, self.settings.sync_timeout).await
    }

    async fn run(self, scan_id: String, spec: ScanSpec, publisher: ScanPublisher) {
        // A panic here (a custom merger, say) must still end the scan and free its room.
        let outcome = AssertUnwindSafe(self.orchestrate(&scan_id, &spec, &publisher))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| Err(anyhow!("scan panicked: {}", panic_message(&*panic))));
        let final_event = match outcome {
            Ok(event) => event,
            Err(e) => {
                error!(%scan_id, error = %format!("{e:#}"), "scan orchestration failed");
                ScanEvent::Error {
                    message: format!("scan failed: {e:#}"),
                    error: None,
                }
            }
        };

        match &final_event {
            ScanEvent::Completed { .. } => info!(%scan_id, "scan completed"),
            _ => warn!(%scan_id, "scan finished with errors"),
        }
        publisher.publish(final_event);

        self.registry.remove(&scan_id).await;
        self.hub.close(&scan_id).await;
    }

    async fn orchestrate(
        &self,
        scan_id: &str,
        spec: &ScanSpec,
        publisher: &ScanPublisher,
    ) -> Result<ScanEvent> {
        let threads = spec.parallelism;
        self.registry.update(scan_id, |s| s.advance(ScanState::Starting)).await;
        publisher.publish(ScanEvent::Starting {
            message: format!("starting scan with {threads} parallel tasks"),
            threads,
        });

        let (axis, tasks) = plan_with_axis(&spec.target, spec.resolved_ports(), threads);
        if tasks.is_empty() {
            bail!("no sub-tasks could be planned for {}", spec.target);
        }
        let total = tasks.len();
        info!(
            scan_id,
            total,
            split = if axis == SplitAxis::Addresses { "addresses" } else { "ports" },
            "scan planned"
        );

        let entries: Vec<TaskEntry> = tasks
            .iter()
            .map(|t| TaskEntry {
                task_id: t.task_id.clone(),
                target: t.target.clone(),
                ports: t.ports.clone(),
                status: TaskStatus::Pending,
            })
            .collect();
        self.registry
            .update(scan_id, |s| {
                s.tasks = entries;
                s.advance(ScanState::TasksCreated);
            })
            .await;
        publisher.publish(ScanEvent::TasksCreated {
            message: format!("created {total} sub-tasks"),
            tasks: tasks.iter().map(TaskManifestEntry::from).collect(),
        });

        let results = self.dispatch(scan_id, tasks, &spec.options, publisher).await?;

        let (succeeded, failed): (Vec<SubTaskResult>, Vec<SubTaskResult>) =
            results.into_iter().partition(|r| r.success);

        if !failed.is_empty() {
            let diagnostics = failed
                .iter()
                .map(|r| format!("{}: {}", r.task_id, r.error_text.trim_end()))
                .collect::<Vec<_>>()
                .join("\n");
            return Ok(ScanEvent::Error {
                message: format!("{} of {total} sub-tasks failed", failed.len()),
                error: Some(diagnostics),
            });
        }

        Ok(ScanEvent::Completed {
            message: "scan completed".to_string(),
            result: self.merger.merge(&succeeded),
        })
    }

    /// Launch one worker per sub-task, staggered, and wait for all of them.
    ///
    /// Results come back in plan order regardless of completion order.
    async fn dispatch(
        &self,
        scan_id: &str,
        tasks: Vec<SubTask>,
        options: &[String],
        publisher: &ScanPublisher,
    ) -> Result<Vec<SubTaskResult>> {
        let total = tasks.len();
        let options: Arc<[String]> = options.into();
        let (tx, mut rx) = mpsc::unbounded_channel::<SubTaskResult>();
        let mut workers = JoinSet::new();

        self.registry.update(scan_id, |s| s.advance(ScanState::Running)).await;
        for (i, task) in tasks.into_iter().enumerate() {
            if i > 0 && !self.settings.launch_stagger.is_zero() {
                tokio::time::sleep(self.settings.launch_stagger).await;
            }
            self.registry
                .update(scan_id, |s| s.set_task_status(&task.task_id, TaskStatus::Running))
                .await;

            let executor = self.executor.clone();
            let options = Arc::clone(&options);
            let events = publisher.clone();
            let tx = tx.clone();
            workers.spawn(async move {
                let result = executor.execute(&task, &options, &events).await;
                let _ = tx.send(result);
            });
        }
        drop(tx);

        let mut results = Vec::with_capacity(total);
        while let Some(result) = rx.recv().await {
            let status = if result.success {
                TaskStatus::Completed
            } else {
                TaskStatus::Error
            };
            self.registry
                .update(scan_id, |s| {
                    s.set_task_status(&result.task_id, status);
                    s.completed_tasks += 1;
                })
                .await;
            results.push(result);
        }

        while let Some(joined) = workers.join_next().await {
            joined.context("scan worker panicked")?;
        }
        if results.len() != total {
            bail!("expected {total} sub-task results, got {}", results.len());
        }

        results.sort_by_key(|r| SubTask::ordinal(&r.task_id));
        Ok(results)
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(s) = panic.downcast_ref::<&str>() {
        *s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.as_str()
    } else {
        "unknown panic"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn registry_update_and_snapshot() {
        let registry = ScanRegistry::default();
        registry.insert(Scan::new("s1".into(), 8)).await;
        assert!(
            registry
                .update("s1", |s| {
                    s.tasks.push(TaskEntry {
                        task_id: "task_1".into(),
                        target: "10.0.0.1".into(),
                        ports: String::new(),
                        status: TaskStatus::Pending,
                    });
                    s.set_task_status("task_1", TaskStatus::Running);
                })
                .await
        );
        let snap = registry.snapshot("s1").await.unwrap();
        assert_eq!(snap.total_tasks, 1);
        assert_eq!(snap.tasks[0].status, TaskStatus::Running);
        assert_eq!(snap.state, ScanState::Created);

        assert!(registry.remove("s1").await.is_some());
        assert!(!registry.update("s1", |_| {}).await);
        assert!(registry.is_empty().await);
    }

    #[test]
    fn cancelled_scan_keeps_cancelled_state() {
        let mut scan = Scan::new("s".into(), 4);
        scan.cancel.cancel();
        scan.state = ScanState::Cancelled;
        scan.advance(ScanState::Running);
        assert_eq!(scan.state, ScanState::Cancelled);
        assert!(scan.snapshot().cancelled);
    }

    #[test]
    fn panic_payloads_render_as_text() {
        let literal: Box<dyn Any + Send> = Box::new("merge exploded");
        let owned: Box<dyn Any + Send> = Box::new(String::from("owned text"));
        let other: Box<dyn Any + Send> = Box::new(7u8);
        assert_eq!(panic_message(&*literal), "merge exploded");
        assert_eq!(panic_message(&*owned), "owned text");
        assert_eq!(panic_message(&*other), "unknown panic");
    }
}
