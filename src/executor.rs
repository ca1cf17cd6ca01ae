use std::process::Stdio;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::Command;
use tracing::{debug, warn};

use crate::config::ScanSettings;
use crate::events::ScanPublisher;
use crate::types::{ScanEvent, ScanSpec, SubTask, SubTaskResult};

/// Runs sub-tasks as child processes of the configured scanner.
#[derive(Debug, Clone)]
pub struct TaskExecutor {
    program: String,
    progress_every: usize,
}

struct ProcessOutput {
    success: bool,
    stdout: String,
    stderr: String,
    status: String,
}

impl TaskExecutor {
    pub fn new(settings: &ScanSettings) -> Self {
        Self {
            program: settings.program.clone(),
            progress_every: settings.progress_every.max(1),
        }
    }

    /// `program options... [-p ports] target`
    pub fn command_line(&self, task: &SubTask, options: &[String]) -> Vec<String> {
        let mut argv = Vec::with_capacity(options.len() + 4);
        argv.push(self.program.clone());
        argv.extend(options.iter().cloned());
        if !task.ports.is_empty() {
            argv.push("-p".to_string());
            argv.push(task.ports.clone());
        }
        argv.push(task.target.clone());
        argv
    }

    /// Run one sub-task to completion, publishing `task_running`, sampled `task_progress`
    /// lines and a terminal `task_completed` / `task_error`.
    ///
    /// Never fails: launch and I/O faults come back as an unsuccessful result.
    pub async fn execute(
        &self,
        task: &SubTask,
        options: &[String],
        events: &ScanPublisher,
    ) -> SubTaskResult {
        let argv = self.command_line(task, options);
        let command_text = argv.join(" ");

        events.publish(ScanEvent::TaskRunning {
            task_id: task.task_id.clone(),
            message: format!(
                "{}: scanning {} ports {}",
                task.task_id,
                task.target,
                if task.ports.is_empty() { "default" } else { task.ports.as_str() }
            ),
            command: command_text.clone(),
        });
        debug!(scan_id = events.scan_id(), task_id = %task.task_id, command = %command_text, "launching sub-task");

        let (success, raw_output, error_text) = match self.stream(&argv, task, events).await {
            Ok(out) if out.success => (true, out.stdout, String::new()),
            Ok(out) => {
                let error = if out.stderr.trim().is_empty() {
                    format!("{} exited with {}", self.program, out.status)
                } else {
                    out.stderr
                };
                (false, out.stdout, error)
            }
            Err(e) => (false, String::new(), format!("{e:#}")),
        };

        if success {
            events.publish(ScanEvent::TaskCompleted {
                task_id: task.task_id.clone(),
                message: format!("{} completed", task.task_id),
            });
        } else {
            warn!(scan_id = events.scan_id(), task_id = %task.task_id, error = %error_text.trim(), "sub-task failed");
            events.publish(ScanEvent::TaskError {
                task_id: task.task_id.clone(),
                message: format!("{} failed: {}", task.task_id, error_text.trim()),
            });
        }

        SubTaskResult {
            task_id: task.task_id.clone(),
            target: task.target.clone(),
            ports: task.ports.clone(),
            command_text,
            success,
            raw_output,
            error_text,
        }
    }

    async fn stream(
        &self,
        argv: &[String],
        task: &SubTask,
        events: &ScanPublisher,
    ) -> Result<ProcessOutput> {
        let mut child = Command::new(&argv[0])
            .args(&argv[1..])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("failed to launch {}", argv[0]))?;

        let stdout = child.stdout.take().context("failed to capture stdout")?;
        let stderr = child.stderr.take().context("failed to capture stderr")?;

        // Drained concurrently so a chatty stderr can never stall stdout.
        let stderr_reader = tokio::spawn(async move {
            let mut buf = Vec::new();
            BufReader::new(stderr).read_to_end(&mut buf).await?;
            Ok::<_, std::io::Error>(String::from_utf8_lossy(&buf).into_owned())
        });

        let mut reader = BufReader::new(stdout);
        let mut line = Vec::new();
        let mut output = String::new();
        let mut lines = 0usize;
        loop {
            line.clear();
            let read = reader
                .read_until(b'\n', &mut line)
                .await
                .context("failed to read scanner output")?;
            if read == 0 {
                break;
            }
            let text = String::from_utf8_lossy(&line);
            output.push_str(&text);
            lines += 1;
            if lines % self.progress_every == 0 {
                events.publish(ScanEvent::TaskProgress {
                    task_id: task.task_id.clone(),
                    partial_result: text.into_owned(),
                });
            }
        }

        let status = child.wait().await.context("failed to wait for scanner")?;
        let errors = stderr_reader
            .await
            .context("stderr reader stopped")?
            .context("failed to read scanner diagnostics")?;

        Ok(ProcessOutput {
            success: status.success(),
            stdout: output,
            stderr: errors,
            status: status.to_string(),
        })
    }
}

/// Outcome of the non-parallel, synchronous scan path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SingleScanOutcome {
    Completed { output: String, command: String },
    Failed { stderr: String, command: String },
    TimedOut { command: String },
    LaunchFailed { error: String, command: String },
}

/// `program options... [-p- | -p ports] target`
pub fn single_scan_argv(program: &str, spec: &ScanSpec) -> Vec<String> {
    let mut argv = vec![program.to_string()];
    argv.extend(spec.options.iter().cloned());
    if spec.scan_all_ports {
        argv.push("-p-".to_string());
    } else if !spec.ports.is_empty() {
        argv.push("-p".to_string());
        argv.push(spec.ports.clone());
    }
    argv.push(spec.target.clone());
    argv
}

/// Run the whole scan as one process, killing it once `timeout` elapses.
pub async fn run_single(program: &str, spec: &ScanSpec, timeout: Duration) -> SingleScanOutcome {
    let argv = single_scan_argv(program, spec);
    let command = argv.join(" ");

    let child = Command::new(&argv[0])
        .args(&argv[1..])
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn();
    let child = match child {
        Ok(c) => c,
        Err(e) => {
            return SingleScanOutcome::LaunchFailed {
                error: format!("failed to launch {program}: {e}"),
                command,
            }
        }
    };

    match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Err(_) => {
            warn!(%command, ?timeout, "single scan timed out, process killed");
            SingleScanOutcome::TimedOut { command }
        }
        Ok(Err(e)) => SingleScanOutcome::LaunchFailed {
            error: format!("scanner I/O failed: {e}"),
            command,
        },
        Ok(Ok(out)) if out.status.success() => SingleScanOutcome::Completed {
            output: String::from_utf8_lossy(&out.stdout).into_owned(),
            command,
        },
        Ok(Ok(out)) => SingleScanOutcome::Failed {
            stderr: String::from_utf8_lossy(&out.stderr).into_owned(),
            command,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(ports: &str, all: bool) -> ScanSpec {
        ScanSpec {
            target: "10.0.0.1".into(),
            ports: ports.into(),
            options: vec!["-sV".into(), "-T4".into()],
            scan_all_ports: all,
            parallelism: 8,
        }
    }

    #[test]
    fn sub_task_command_line() {
        let exec = TaskExecutor::new(&ScanSettings::default());
        let options = vec!["-sS".to_string()];
        let with_ports = SubTask::new(1, "10.0.0.1", "1-25");
        assert_eq!(exec.command_line(&with_ports, &options).join(" "), "nmap -sS -p 1-25 10.0.0.1");
        let default_ports = SubTask::new(2, "10.0.0.2", "");
        assert_eq!(exec.command_line(&default_ports, &options).join(" "), "nmap -sS 10.0.0.2");
    }

    #[test]
    fn single_scan_command_line() {
        assert_eq!(single_scan_argv("nmap", &spec("22,80", false)).join(" "), "nmap -sV -T4 -p 22,80 10.0.0.1");
        assert_eq!(single_scan_argv("nmap", &spec("22,80", true)).join(" "), "nmap -sV -T4 -p- 10.0.0.1");
        assert_eq!(single_scan_argv("nmap", &spec("", false)).join(" "), "nmap -sV -T4 10.0.0.1");
    }
}
