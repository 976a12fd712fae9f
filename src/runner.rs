//! Isolated execution runner.
//!
//! One sandboxed process per request: the harness-wrapped code is written into
//! the scratch directory and spawned with piped stdio, a fresh process group,
//! and OS resource limits. Output lines stream into the capture buffer as they
//! arrive; the wall-clock deadline kills the whole process group. Timeout and
//! crash are terminal states, not errors — partial output still flows back.

use crate::capture::{ErrorData, OutputCapture, PlotData, StreamOrigin};
use crate::config::{ResourceLimits, SandboxConfig};
use crate::errors::{Result, SandboxError};
use crate::harness::{build_harness, FINAL_RECORD_TYPE, HARNESS_FILE};
use async_trait::async_trait;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Exit code sentinel for executions killed by the wall-clock timeout.
pub const TIMEOUT_EXIT_CODE: i32 = -1;

/// Terminal state of one execution.
///
/// `Running` exists only while the OS process does; callers observe one of
/// these three.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionStatus {
    Completed,
    TimedOut,
    Crashed,
}

/// Raw result of one execution, before artifact extraction.
#[derive(Debug)]
pub struct RawExecution {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    pub status: ExecutionStatus,
    pub duration: Duration,
    /// Plot payloads auto-captured by the harness
    pub plots: Vec<PlotData>,
    /// Variable snapshot from the final record, when one was emitted
    pub variables: Option<serde_json::Value>,
}

/// The terminating record the harness prints as its last stdout line.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FinalRecord {
    stdout: String,
    stderr: String,
    exit_code: i32,
    #[serde(default)]
    plots: Vec<PlotData>,
    #[serde(default)]
    variables: Option<serde_json::Value>,
}

/// Seam between the orchestrator and the isolation backend.
#[async_trait]
pub trait ExecutionEngine: Send + Sync {
    async fn run(
        &self,
        code: &str,
        scratch: &Path,
        config: &SandboxConfig,
        capture: &mut OutputCapture,
    ) -> Result<RawExecution>;
}

/// Subprocess-based engine: spawns the system (or configured) Python with
/// rlimits and a harness wrapper.
pub struct ProcessEngine {
    python_path: PathBuf,
}

impl ProcessEngine {
    /// Locate Python in PATH.
    pub fn new() -> Result<Self> {
        let python_path = which::which("python3")
            .or_else(|_| which::which("python"))
            .map_err(|_| SandboxError::PythonNotFound)?;
        Ok(Self { python_path })
    }

    /// Use an explicit interpreter (bundled Python, pinned version).
    pub fn with_python_path(python_path: PathBuf) -> Result<Self> {
        if !python_path.exists() {
            return Err(SandboxError::PythonNotFound);
        }
        Ok(Self { python_path })
    }

    pub fn python_path(&self) -> &Path {
        &self.python_path
    }

    fn build_command(&self, scratch: &Path, limits: &ResourceLimits) -> Command {
        let mut cmd = Command::new(&self.python_path);
        cmd.arg(HARNESS_FILE)
            .current_dir(scratch)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        // Scrubbed environment: only what the interpreter and the scientific
        // stack need, everything writable pointed at the scratch dir.
        cmd.env_clear();
        if let Ok(path) = std::env::var("PATH") {
            cmd.env("PATH", path);
        }
        cmd.env("PYTHONIOENCODING", "utf-8")
            .env("PYTHONDONTWRITEBYTECODE", "1")
            .env("HOME", scratch)
            .env("TMPDIR", scratch)
            .env("MPLCONFIGDIR", scratch)
            .env("OMP_NUM_THREADS", limits.max_threads.to_string())
            .env("OPENBLAS_NUM_THREADS", limits.max_threads.to_string())
            .env("MKL_NUM_THREADS", limits.max_threads.to_string());

        apply_resource_limits(&mut cmd, limits);
        cmd
    }
}

#[cfg(unix)]
fn apply_resource_limits(cmd: &mut Command, limits: &ResourceLimits) {
    let cpu_seconds = limits.cpu_seconds;
    #[cfg(not(target_os = "macos"))]
    let memory_bytes = limits.memory_bytes;
    #[cfg(not(target_os = "macos"))]
    let max_processes = limits.max_processes;

    unsafe {
        cmd.pre_exec(move || {
            // Fresh process group so the timeout can kill the whole tree.
            libc::setpgid(0, 0);

            #[cfg(not(target_os = "macos"))]
            {
                // macOS does not honor RLIMIT_AS, skip it there.
                let rlimit = libc::rlimit {
                    rlim_cur: memory_bytes as libc::rlim_t,
                    rlim_max: memory_bytes as libc::rlim_t,
                };
                if libc::setrlimit(libc::RLIMIT_AS, &rlimit) != 0 {
                    return Err(std::io::Error::last_os_error());
                }

                let rlimit = libc::rlimit {
                    rlim_cur: max_processes as libc::rlim_t,
                    rlim_max: max_processes as libc::rlim_t,
                };
                if libc::setrlimit(libc::RLIMIT_NPROC, &rlimit) != 0 {
                    return Err(std::io::Error::last_os_error());
                }
            }

            let rlimit = libc::rlimit {
                rlim_cur: cpu_seconds as libc::rlim_t,
                rlim_max: cpu_seconds as libc::rlim_t,
            };
            if libc::setrlimit(libc::RLIMIT_CPU, &rlimit) != 0 {
                return Err(std::io::Error::last_os_error());
            }

            Ok(())
        });
    }
}

#[cfg(not(unix))]
fn apply_resource_limits(_cmd: &mut Command, _limits: &ResourceLimits) {
    // Non-Unix platforms rely on the wall-clock timeout only.
}

#[cfg(unix)]
fn kill_process_group(pid: u32) {
    unsafe {
        libc::kill(-(pid as i32), libc::SIGKILL);
    }
}

#[cfg(not(unix))]
fn kill_process_group(_pid: u32) {}

fn parse_final_record(line: &str) -> Option<FinalRecord> {
    let trimmed = line.trim();
    if !trimmed.starts_with('{') {
        return None;
    }
    let value: serde_json::Value = serde_json::from_str(trimmed).ok()?;
    if value.get("type")?.as_str()? != FINAL_RECORD_TYPE {
        return None;
    }
    serde_json::from_value(value).ok()
}

#[async_trait]
impl ExecutionEngine for ProcessEngine {
    async fn run(
        &self,
        code: &str,
        scratch: &Path,
        config: &SandboxConfig,
        capture: &mut OutputCapture,
    ) -> Result<RawExecution> {
        let limits = config.resource_limits()?;
        let harness = build_harness(code, scratch);
        tokio::fs::write(scratch.join(HARNESS_FILE), &harness).await?;

        let start = Instant::now();
        let mut child = self
            .build_command(scratch, &limits)
            .spawn()
            .map_err(|e| SandboxError::SpawnFailed(e.to_string()))?;
        let pid = child.id();

        info!("[SANDBOX] Spawned execution process (pid={:?})", pid);

        // Stream both pipes line-by-line into one channel; the capture buffer
        // sequences them on arrival.
        let (tx, mut rx) = mpsc::unbounded_channel::<(StreamOrigin, String)>();
        if let Some(stdout) = child.stdout.take() {
            let tx = tx.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if tx.send((StreamOrigin::Stdout, line)).is_err() {
                        break;
                    }
                }
            });
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if tx.send((StreamOrigin::Stderr, line)).is_err() {
                        break;
                    }
                }
            });
        }

        let deadline = tokio::time::Instant::now() + config.timeout();
        let mut final_record: Option<FinalRecord> = None;
        let mut timed_out = false;

        loop {
            tokio::select! {
                received = rx.recv() => {
                    match received {
                        Some((StreamOrigin::Stdout, line)) => {
                            if let Some(record) = parse_final_record(&line) {
                                final_record = Some(record);
                            } else {
                                capture.process_special_output(&line, StreamOrigin::Stdout);
                            }
                        }
                        Some((StreamOrigin::Stderr, line)) => {
                            capture.process_special_output(&line, StreamOrigin::Stderr);
                        }
                        // Both pipes closed: the process is exiting.
                        None => break,
                    }
                }
                _ = tokio::time::sleep_until(deadline) => {
                    timed_out = true;
                    break;
                }
            }
        }

        let exit_status = if timed_out {
            if let Some(pid) = pid {
                kill_process_group(pid);
            }
            let _ = child.kill().await;
            let _ = child.wait().await;
            None
        } else {
            match tokio::time::timeout_at(deadline, child.wait()).await {
                Ok(Ok(status)) => Some(status),
                Ok(Err(e)) => {
                    warn!("[SANDBOX] Failed to reap execution process: {}", e);
                    None
                }
                Err(_) => {
                    timed_out = true;
                    if let Some(pid) = pid {
                        kill_process_group(pid);
                    }
                    let _ = child.kill().await;
                    let _ = child.wait().await;
                    None
                }
            }
        };

        let duration = start.elapsed();

        if timed_out {
            let notice = format!(
                "Execution timed out after {}ms and was terminated\n",
                config.timeout_ms
            );
            capture.add_stderr(notice.clone());
            capture.add_error(ErrorData {
                error_type: "TimeoutError".to_string(),
                message: notice.trim_end().to_string(),
                traceback: None,
            });
            let stderr = capture.get_output_as_string(crate::capture::ChunkKind::Stderr);
            return Ok(RawExecution {
                stdout: capture.get_output_as_string(crate::capture::ChunkKind::Stdout),
                stderr,
                exit_code: TIMEOUT_EXIT_CODE,
                status: ExecutionStatus::TimedOut,
                duration,
                plots: Vec::new(),
                variables: None,
            });
        }

        let process_code = exit_status.and_then(|s| s.code());

        match final_record {
            Some(record) => {
                // Canonical transcripts come from the harness; record them as
                // chunks so buffer readers see the full picture.
                if !record.stdout.is_empty() {
                    capture.add_stdout(record.stdout.clone());
                }
                if !record.stderr.is_empty() {
                    capture.add_stderr(record.stderr.clone());
                }
                Ok(RawExecution {
                    stdout: record.stdout,
                    stderr: record.stderr,
                    exit_code: process_code.unwrap_or(record.exit_code),
                    status: ExecutionStatus::Completed,
                    duration,
                    plots: record.plots,
                    variables: record.variables,
                })
            }
            None => {
                // The harness never emitted its final record: the process
                // crashed or was killed by a resource limit. Fall back to the
                // raw captured text and force a nonzero exit code.
                debug!("[SANDBOX] No final record; falling back to raw capture");
                let exit_code = match process_code {
                    Some(0) | None => 1,
                    Some(code) => code,
                };
                capture.add_error(ErrorData {
                    error_type: "ProcessCrashed".to_string(),
                    message: format!("process exited with code {exit_code} before reporting"),
                    traceback: None,
                });
                Ok(RawExecution {
                    stdout: capture.get_output_as_string(crate::capture::ChunkKind::Stdout),
                    stderr: capture.get_output_as_string(crate::capture::ChunkKind::Stderr),
                    exit_code,
                    status: ExecutionStatus::Crashed,
                    duration,
                    plots: Vec::new(),
                    variables: None,
                })
            }
        }
    }
}
