use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Result};
use clap::Parser;
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::EnvFilter;

use nmap_fanout::config::ScanSettings;
use nmap_fanout::coordinator::ScanCoordinator;
use nmap_fanout::server;
use nmap_fanout::types::{ScanEvent, ScanRequest};
use nmap_fanout::validate::validate_request;

/// nmap-fanout — run nmap in parallel slices and merge the reports.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "nmap-fanout",
    version,
    about = "Run nmap in parallel slices with live progress, then merge the reports.",
    long_about = None
)]
struct Cli {
    /// Address to serve the HTTP/websocket API on.
    #[arg(long, default_value = "127.0.0.1:5000")]
    bind: String,

    /// Scanner program to launch for every sub-task.
    #[arg(long = "nmap-path", default_value = "nmap")]
    nmap_path: String,

    /// Delay between consecutive sub-task launches, in milliseconds.
    #[arg(long = "launch-stagger-ms", default_value_t = 200)]
    launch_stagger_ms: u64,

    /// Timeout for the synchronous single-process scan endpoint, in seconds.
    #[arg(long = "sync-timeout-secs", default_value_t = 600)]
    sync_timeout_secs: u64,

    /// Directory of static UI files served at `/` (optional).
    #[arg(long = "ui-dir")]
    ui_dir: Option<PathBuf>,

    /// Run one parallel scan of this target from the terminal instead of serving.
    #[arg(long)]
    target: Option<String>,

    /// Port spec for the one-shot scan (e.g. `22,80,8000-8100`).
    #[arg(long, default_value = "")]
    ports: String,

    /// Scanner option for the one-shot scan; repeatable (e.g. `--option=-sV`).
    #[arg(long = "option", allow_hyphen_values = true)]
    options: Vec<String>,

    /// Scan every port in the one-shot scan.
    #[arg(long = "all-ports", default_value_t = false)]
    all_ports: bool,

    /// Number of parallel sub-tasks for the one-shot scan (clamped to 4-16).
    #[arg(long, default_value_t = 8)]
    parallel: u32,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let settings = ScanSettings::default()
        .with_program(cli.nmap_path.clone())
        .with_launch_stagger(Duration::from_millis(cli.launch_stagger_ms))
        .with_sync_timeout(Duration::from_secs(cli.sync_timeout_secs));
    let coordinator = ScanCoordinator::new(settings);

    match cli.target.clone() {
        Some(target) => run_one_shot(&cli, target, coordinator).await,
        None => {
            eprintln!("nmap-fanout configuration:");
            eprintln!("  bind          : {}", cli.bind);
            eprintln!("  scanner       : {}", cli.nmap_path);
            eprintln!("  stagger_ms    : {}", cli.launch_stagger_ms);
            eprintln!("  sync_timeout  : {}s", cli.sync_timeout_secs);
            eprintln!(
                "  ui_dir        : {}",
                cli.ui_dir
                    .as_ref()
                    .map(|p| p.display().to_string())
                    .unwrap_or_else(|| "<none>".to_string())
            );
            server::spawn_server(&cli.bind, coordinator, cli.ui_dir.clone()).await
        }
    }
}

/// Run a single parallel scan, print progress to stderr and the merged report to stdout.
async fn run_one_shot(cli: &Cli, target: String, coordinator: ScanCoordinator) -> Result<()> {
    let request = ScanRequest {
        target,
        ports: cli.ports.clone(),
        options: cli.options.clone(),
        scan_all_ports: cli.all_ports,
        parallel_tasks: Some(cli.parallel.into()),
    };
    let spec = validate_request(&request)?;
    let mut started = coordinator.start_scan(spec).await;

    // Ctrl-C flags the scan as cancelled and stops waiting for it.
    let cancel_coordinator = coordinator.clone();
    let cancel_id = started.scan_id.clone();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        cancel_coordinator.cancel(&cancel_id).await;
    });

    loop {
        let update = tokio::select! {
            update = started.events.recv() => update,
            _ = started.cancelled.cancelled() => bail!("scan {} cancelled", started.scan_id),
        };
        match update {
            Ok(update) => match update.event {
                ScanEvent::Starting { threads, .. } => eprintln!("starting with {threads} parallel tasks"),
                ScanEvent::TasksCreated { tasks, .. } => {
                    for task in tasks {
                        eprintln!("  {:<8} {:<32} {}", task.task_id, task.target, task.ports);
                    }
                }
                ScanEvent::TaskRunning { command, .. } => eprintln!("running: {command}"),
                ScanEvent::TaskProgress { .. } | ScanEvent::Cancelled { .. } => {}
                ScanEvent::TaskCompleted { message, .. } | ScanEvent::TaskError { message, .. } => {
                    eprintln!("{message}")
                }
                ScanEvent::Completed { result, .. } => {
                    println!("{result}");
                    return Ok(());
                }
                ScanEvent::Error { message, error } => {
                    bail!("{message}{}", error.map(|e| format!("\n{e}")).unwrap_or_default())
                }
            },
            Err(RecvError::Lagged(_)) => continue,
            Err(RecvError::Closed) => bail!("scan ended without a final report"),
        }
    }
}
