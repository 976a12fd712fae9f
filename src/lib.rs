mod artifacts;
mod capture;
mod config;
mod errors;
mod harness;
mod orchestrator;
mod runner;
mod scratch;
mod storage;
mod validator;

use std::sync::Arc;

pub use artifacts::{Artifact, ArtifactExtractor, ArtifactKind, MAX_ARTIFACT_BYTES};
pub use capture::{
    ChunkData, ChunkFilter, ChunkKind, ErrorData, OutputCapture, OutputChunk, PlotData,
    PlotFormat, PlotMetadata, StreamOrigin, VariableData, DEFAULT_BUFFER_SIZE, MIN_BUFFER_SIZE,
};
pub use config::{parse_memory_limit, ExecutionContext, ResourceLimits, SandboxConfig};
pub use errors::{Result, SandboxError};
pub use orchestrator::{
    ExecutionResult, SandboxOrchestrator, ToolError, ToolResult, Usage, EXECUTION_CREDITS,
    PYTHON_EXECUTION_ERROR,
};
pub use runner::{
    ExecutionEngine, ExecutionStatus, ProcessEngine, RawExecution, TIMEOUT_EXIT_CODE,
};
pub use scratch::ScratchDir;
pub use storage::{LocalObjectStorage, ObjectStorage};
pub use validator::{validate, ValidationReport};

/// Runs Python code through the full sandbox pipeline with the default
/// process-based engine.
///
/// Validates the code, executes it in an isolated subprocess with resource
/// limits, extracts artifacts to `storage`, and returns the assembled
/// [`ToolResult`]. Fails only when no Python interpreter can be located;
/// every in-pipeline fault is reported inside the result instead.
///
/// # Example
/// ```rust,no_run
/// use pycell::{execute_python, ExecutionContext, LocalObjectStorage, SandboxConfig};
/// use std::sync::Arc;
///
/// #[tokio::main]
/// async fn main() -> pycell::Result<()> {
///     let context = ExecutionContext {
///         tenant_id: "acme".to_string(),
///         user_id: "alice".to_string(),
///         conversation_id: None,
///     };
///     let storage = Arc::new(LocalObjectStorage::new("/tmp/pycell-artifacts"));
///
///     let result =
///         execute_python("print('hello')", &context, SandboxConfig::default(), storage).await?;
///     println!("success: {}", result.success);
///     Ok(())
/// }
/// ```
pub async fn execute_python(
    code: &str,
    context: &ExecutionContext,
    config: SandboxConfig,
    storage: Arc<dyn ObjectStorage>,
) -> Result<ToolResult> {
    let engine = Arc::new(ProcessEngine::new()?);
    let orchestrator = SandboxOrchestrator::new(engine, storage, config);
    Ok(orchestrator.execute(code, context).await)
}
