//! Sandbox orchestrator, the public entry point.
//!
//! `execute` drives the whole pipeline: validate, run in isolation, extract
//! artifacts, assemble a `ToolResult`. The caller always gets a well-formed
//! result back; internal faults are caught at this boundary and reported as a
//! non-retryable error code, never as a panic or an `Err`. Scratch state is
//! tied to a RAII guard, so cleanup happens on every exit path.

use crate::artifacts::{Artifact, ArtifactExtractor};
use crate::capture::OutputCapture;
use crate::config::{ExecutionContext, SandboxConfig};
use crate::runner::ExecutionEngine;
use crate::scratch::ScratchDir;
use crate::storage::ObjectStorage;
use crate::validator::validate;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{error, info, warn};

/// Error code for faults that escape the pipeline. Non-retryable.
pub const PYTHON_EXECUTION_ERROR: &str = "PYTHON_EXECUTION_ERROR";

/// Fixed cost charged per execution, independent of outcome.
pub const EXECUTION_CREDITS: u32 = 1;

/// Terminal output of one execution, embedded in the `ToolResult`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResult {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    pub artifacts: Vec<Artifact>,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolError {
    pub code: String,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Usage {
    pub credits: u32,
}

/// What the caller receives from [`SandboxOrchestrator::execute`], always
/// well-formed regardless of how the execution ended.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<ExecutionResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub artifacts: Option<Vec<Artifact>>,
    pub usage: Usage,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ToolError>,
}

impl ToolResult {
    fn from_execution(result: ExecutionResult) -> Self {
        Self {
            success: result.exit_code == 0,
            artifacts: Some(result.artifacts.clone()),
            data: Some(result),
            usage: Usage {
                credits: EXECUTION_CREDITS,
            },
            error: None,
        }
    }

    fn internal_fault(message: String) -> Self {
        Self {
            success: false,
            data: None,
            artifacts: None,
            usage: Usage {
                credits: EXECUTION_CREDITS,
            },
            error: Some(ToolError {
                code: PYTHON_EXECUTION_ERROR.to_string(),
                message,
            }),
        }
    }
}

/// Drives validation, isolated execution, and artifact extraction. The engine
/// and storage backends are injected at construction; their lifecycle belongs
/// to the caller.
pub struct SandboxOrchestrator {
    engine: Arc<dyn ExecutionEngine>,
    storage: Arc<dyn ObjectStorage>,
    config: SandboxConfig,
    slots: Arc<Semaphore>,
}

impl SandboxOrchestrator {
    pub fn new(
        engine: Arc<dyn ExecutionEngine>,
        storage: Arc<dyn ObjectStorage>,
        config: SandboxConfig,
    ) -> Self {
        let slots = Arc::new(Semaphore::new(config.max_concurrency.max(1)));
        Self {
            engine,
            storage,
            config,
            slots,
        }
    }

    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    /// Run one piece of code through the full pipeline. Never panics and
    /// never returns an error: every fault is folded into the `ToolResult`.
    pub async fn execute(&self, code: &str, context: &ExecutionContext) -> ToolResult {
        info!(
            "[SANDBOX] Execution requested (tenant={}, user={})",
            context.tenant_id, context.user_id
        );

        // Fast-reject before any process or scratch state exists.
        let report = validate(code);
        if !report.valid {
            warn!("[SANDBOX] Validation rejected code: {:?}", report.errors);
            return ToolResult::from_execution(ExecutionResult {
                stdout: String::new(),
                stderr: report.errors.join("\n") + "\n",
                exit_code: 1,
                artifacts: Vec::new(),
                duration_ms: 0,
            });
        }

        // Bounded concurrency: requests past the limit queue here.
        let permit = self.slots.acquire().await;
        if permit.is_err() {
            return ToolResult::internal_fault("execution slots unavailable".to_string());
        }

        match self.run_pipeline(code).await {
            Ok(result) => result,
            Err(e) => {
                error!("[SANDBOX] Execution pipeline fault: {}", e);
                ToolResult::internal_fault(e.to_string())
            }
        }
    }

    async fn run_pipeline(&self, code: &str) -> crate::errors::Result<ToolResult> {
        let execution_id = uuid::Uuid::new_v4().to_string();
        // Scratch lives for this scope only; Drop removes it on every path.
        let scratch = ScratchDir::new(&self.config.temp_dir)?;
        let mut capture = OutputCapture::new(self.config.effective_buffer_size());

        let raw = self
            .engine
            .run(code, scratch.path(), &self.config, &mut capture)
            .await?;

        info!(
            "[SANDBOX] Execution {} finished: status={:?}, exit={}, took={:?}",
            execution_id, raw.status, raw.exit_code, raw.duration
        );

        // Extraction runs regardless of terminal state; a timed-out or
        // crashed run may still have written usable files.
        let extractor = ArtifactExtractor::new(self.storage.clone());
        let artifacts = extractor
            .extract(&execution_id, scratch.path(), &raw.plots, raw.variables.as_ref())
            .await;

        Ok(ToolResult::from_execution(ExecutionResult {
            stdout: raw.stdout,
            stderr: raw.stderr,
            exit_code: raw.exit_code,
            artifacts,
            duration_ms: raw.duration.as_millis() as u64,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::{Result, SandboxError};
    use crate::runner::{ExecutionStatus, ProcessEngine, RawExecution, TIMEOUT_EXIT_CODE};
    use async_trait::async_trait;
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct OkStorage;

    #[async_trait]
    impl ObjectStorage for OkStorage {
        async fn upload(&self, key: &str, _bytes: Vec<u8>, _content_type: &str) -> Result<String> {
            Ok(format!("mock://{key}"))
        }
    }

    /// Counts invocations and replays a canned execution.
    struct StubEngine {
        calls: AtomicUsize,
        exit_code: i32,
        status: ExecutionStatus,
        stderr: String,
        write_file: Option<(&'static str, &'static [u8])>,
        delay: Duration,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
    }

    impl StubEngine {
        fn succeeding() -> Self {
            Self {
                calls: AtomicUsize::new(0),
                exit_code: 0,
                status: ExecutionStatus::Completed,
                stderr: String::new(),
                write_file: None,
                delay: Duration::ZERO,
                in_flight: AtomicUsize::new(0),
                max_in_flight: AtomicUsize::new(0),
            }
        }

        fn crashing(stderr: &str) -> Self {
            Self {
                exit_code: 1,
                status: ExecutionStatus::Crashed,
                stderr: stderr.to_string(),
                ..Self::succeeding()
            }
        }
    }

    #[async_trait]
    impl ExecutionEngine for StubEngine {
        async fn run(
            &self,
            _code: &str,
            scratch: &Path,
            _config: &SandboxConfig,
            _capture: &mut OutputCapture,
        ) -> Result<RawExecution> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);

            if let Some((name, bytes)) = self.write_file {
                std::fs::write(scratch.join(name), bytes).unwrap();
            }
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }

            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            Ok(RawExecution {
                stdout: "stub output\n".to_string(),
                stderr: self.stderr.clone(),
                exit_code: self.exit_code,
                status: self.status,
                duration: Duration::from_millis(5),
                plots: Vec::new(),
                variables: None,
            })
        }
    }

    /// Always errors, for exercising the boundary catch.
    struct FaultyEngine;

    #[async_trait]
    impl ExecutionEngine for FaultyEngine {
        async fn run(
            &self,
            _code: &str,
            _scratch: &Path,
            _config: &SandboxConfig,
            _capture: &mut OutputCapture,
        ) -> Result<RawExecution> {
            Err(SandboxError::InternalError("engine blew up".to_string()))
        }
    }

    fn context() -> ExecutionContext {
        ExecutionContext {
            tenant_id: "t1".to_string(),
            user_id: "u1".to_string(),
            conversation_id: None,
        }
    }

    fn config_for(base: &Path) -> SandboxConfig {
        SandboxConfig {
            temp_dir: base.to_path_buf(),
            ..Default::default()
        }
    }

    fn scratch_entries(base: &Path) -> usize {
        std::fs::read_dir(base).map(|d| d.count()).unwrap_or(0)
    }

    fn python_available() -> bool {
        which::which("python3").or_else(|_| which::which("python")).is_ok()
    }

    #[tokio::test]
    async fn rejected_code_never_reaches_the_engine() {
        let base = tempfile::tempdir().unwrap();
        let engine = Arc::new(StubEngine::succeeding());
        let orchestrator = SandboxOrchestrator::new(
            engine.clone(),
            Arc::new(OkStorage),
            config_for(base.path()),
        );

        let result = orchestrator
            .execute("__import__('os').system('ls')", &context())
            .await;

        assert!(!result.success);
        let data = result.data.unwrap();
        assert_eq!(data.exit_code, 1);
        assert!(data.stderr.contains("Dangerous pattern detected"));
        assert_eq!(engine.calls.load(Ordering::SeqCst), 0);
        // No scratch directory was ever created.
        assert_eq!(scratch_entries(base.path()), 0);
    }

    #[tokio::test]
    async fn successful_execution_assembles_result_and_artifacts() {
        let base = tempfile::tempdir().unwrap();
        let engine = Arc::new(StubEngine {
            write_file: Some(("result.csv", b"a,b\n1,2\n")),
            ..StubEngine::succeeding()
        });
        let orchestrator =
            SandboxOrchestrator::new(engine, Arc::new(OkStorage), config_for(base.path()));

        let result = orchestrator.execute("x = 1", &context()).await;

        assert!(result.success);
        assert!(result.error.is_none());
        assert_eq!(result.usage.credits, EXECUTION_CREDITS);
        let data = result.data.unwrap();
        assert_eq!(data.stdout, "stub output\n");
        assert_eq!(data.artifacts.len(), 1);
        assert_eq!(data.artifacts[0].name, "result.csv");
        assert_eq!(result.artifacts.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn crash_yields_failed_result_not_an_error() {
        let base = tempfile::tempdir().unwrap();
        let engine = Arc::new(StubEngine::crashing("segfault-ish\n"));
        let orchestrator =
            SandboxOrchestrator::new(engine, Arc::new(OkStorage), config_for(base.path()));

        let result = orchestrator.execute("x = 1", &context()).await;

        assert!(!result.success);
        assert!(result.error.is_none());
        assert_eq!(result.data.unwrap().stderr, "segfault-ish\n");
    }

    #[tokio::test]
    async fn engine_fault_is_caught_at_the_boundary() {
        let base = tempfile::tempdir().unwrap();
        let orchestrator = SandboxOrchestrator::new(
            Arc::new(FaultyEngine),
            Arc::new(OkStorage),
            config_for(base.path()),
        );

        let result = orchestrator.execute("x = 1", &context()).await;

        assert!(!result.success);
        let error = result.error.unwrap();
        assert_eq!(error.code, PYTHON_EXECUTION_ERROR);
        assert!(error.message.contains("engine blew up"));
        // Scratch was cleaned up despite the fault.
        assert_eq!(scratch_entries(base.path()), 0);
    }

    #[tokio::test]
    async fn scratch_is_removed_on_every_terminal_path() {
        let base = tempfile::tempdir().unwrap();

        for engine in [
            Arc::new(StubEngine::succeeding()) as Arc<dyn ExecutionEngine>,
            Arc::new(StubEngine::crashing("boom")) as Arc<dyn ExecutionEngine>,
        ] {
            let orchestrator =
                SandboxOrchestrator::new(engine, Arc::new(OkStorage), config_for(base.path()));
            let _ = orchestrator.execute("x = 1", &context()).await;
            assert_eq!(scratch_entries(base.path()), 0);
        }
    }

    #[tokio::test]
    async fn concurrency_is_bounded_by_the_slot_pool() {
        let base = tempfile::tempdir().unwrap();
        let engine = Arc::new(StubEngine {
            delay: Duration::from_millis(50),
            ..StubEngine::succeeding()
        });
        let config = SandboxConfig {
            max_concurrency: 2,
            ..config_for(base.path())
        };
        let orchestrator =
            Arc::new(SandboxOrchestrator::new(engine.clone(), Arc::new(OkStorage), config));

        let mut handles = Vec::new();
        for _ in 0..6 {
            let orch = orchestrator.clone();
            handles.push(tokio::spawn(
                async move { orch.execute("x = 1", &context()).await },
            ));
        }
        for handle in handles {
            assert!(handle.await.unwrap().success);
        }

        assert_eq!(engine.calls.load(Ordering::SeqCst), 6);
        assert!(engine.max_in_flight.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn timeout_surfaces_as_failure_with_partial_output() {
        if !python_available() {
            return;
        }
        let base = tempfile::tempdir().unwrap();
        let config = SandboxConfig {
            timeout_ms: 300,
            ..config_for(base.path())
        };
        let orchestrator = SandboxOrchestrator::new(
            Arc::new(ProcessEngine::new().unwrap()),
            Arc::new(OkStorage),
            config,
        );

        let started = std::time::Instant::now();
        let result = orchestrator
            .execute("import time\ntime.sleep(10)", &context())
            .await;

        assert!(!result.success);
        let data = result.data.unwrap();
        assert_eq!(data.exit_code, TIMEOUT_EXIT_CODE);
        assert!(data.stderr.contains("timed out"));
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(scratch_entries(base.path()), 0);
    }
}
