//! Object storage seam.
//!
//! The sandbox core treats storage as opaque: anything that can take bytes
//! under a key and hand back an addressable URL satisfies the contract.
//! Implementations must be safe for concurrent use; extractions from multiple
//! in-flight executions share one client.

use crate::errors::{Result, SandboxError};
use async_trait::async_trait;
use std::path::PathBuf;
use tracing::debug;

#[async_trait]
pub trait ObjectStorage: Send + Sync {
    /// Upload `bytes` under `key` and return an addressable URL.
    async fn upload(&self, key: &str, bytes: Vec<u8>, content_type: &str) -> Result<String>;
}

/// Filesystem-backed storage for local deployments and tests.
pub struct LocalObjectStorage {
    root: PathBuf,
}

impl LocalObjectStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl ObjectStorage for LocalObjectStorage {
    async fn upload(&self, key: &str, bytes: Vec<u8>, content_type: &str) -> Result<String> {
        // Keys are slash-scoped (execution-id/file-name); refuse traversal.
        if key.split('/').any(|part| part == ".." || part.is_empty()) {
            return Err(SandboxError::StorageFailed(format!("invalid key: {key}")));
        }

        let dest = self.root.join(key);
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&dest, bytes).await?;

        debug!("[STORAGE] Wrote {:?} ({})", dest, content_type);
        Ok(format!("file://{}", dest.display()))
    }
}
