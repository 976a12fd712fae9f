use pycell::{
    ExecutionContext, LocalObjectStorage, ProcessEngine, SandboxConfig, SandboxOrchestrator,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncReadExt;

#[derive(Debug, Clone)]
struct CliConfig {
    source: Option<PathBuf>,
    artifacts_dir: PathBuf,
    python_path: Option<PathBuf>,
    timeout_ms: Option<u64>,
}

impl CliConfig {
    fn from_env_and_args() -> Self {
        let args: Vec<String> = std::env::args().collect();

        let artifacts_dir = std::env::var("PYCELL_ARTIFACTS_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| std::env::temp_dir().join("pycell-artifacts"));
        let mut python_path = std::env::var("PYCELL_PYTHON_PATH").ok().map(PathBuf::from);

        let mut source = None;
        let mut timeout_ms = None;
        let mut artifacts_dir = artifacts_dir;

        let mut i = 1;
        while i < args.len() {
            match args[i].as_str() {
                "--timeout-ms" => {
                    if let Some(v) = args.get(i + 1) {
                        timeout_ms = v.parse().ok();
                    }
                    i += 2;
                }
                "--python-path" => {
                    if let Some(v) = args.get(i + 1) {
                        python_path = Some(PathBuf::from(v));
                    }
                    i += 2;
                }
                "--artifacts-dir" => {
                    if let Some(v) = args.get(i + 1) {
                        artifacts_dir = PathBuf::from(v);
                    }
                    i += 2;
                }
                "-" => {
                    source = None;
                    i += 1;
                }
                other => {
                    source = Some(PathBuf::from(other));
                    i += 1;
                }
            }
        }

        Self {
            source,
            artifacts_dir,
            python_path,
            timeout_ms,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(std::env::var("RUST_LOG").unwrap_or_else(|_| "pycell=info".to_string()))
        .with_target(false)
        .init();

    let cli = CliConfig::from_env_and_args();

    let code = match &cli.source {
        Some(path) => tokio::fs::read_to_string(path).await?,
        None => {
            let mut buf = String::new();
            tokio::io::stdin().read_to_string(&mut buf).await?;
            buf
        }
    };

    let mut config = SandboxConfig::default();
    if let Some(timeout_ms) = cli.timeout_ms {
        config.timeout_ms = timeout_ms;
    }

    let engine = match &cli.python_path {
        Some(path) => ProcessEngine::with_python_path(path.clone())?,
        None => ProcessEngine::new()?,
    };
    let storage = Arc::new(LocalObjectStorage::new(cli.artifacts_dir.clone()));
    let orchestrator = SandboxOrchestrator::new(Arc::new(engine), storage, config);

    let context = ExecutionContext {
        tenant_id: "local".to_string(),
        user_id: whoami(),
        conversation_id: None,
    };

    tracing::info!(
        "pycell-run executing {:?} (artifacts -> {:?})",
        cli.source.as_deref().unwrap_or(Path::new("stdin")),
        cli.artifacts_dir
    );

    let result = orchestrator.execute(&code, &context).await;
    println!("{}", serde_json::to_string_pretty(&result)?);

    if result.success {
        Ok(())
    } else {
        std::process::exit(1);
    }
}

fn whoami() -> String {
    std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_else(|_| "local".to_string())
}
