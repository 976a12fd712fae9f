//! Post-execution artifact extraction.
//!
//! Scans the scratch directory for byproducts, classifies them by extension,
//! and persists each to object storage under a key scoped by execution id.
//! Extraction is best-effort throughout: oversized files are skipped silently,
//! and any single file's failure is logged without aborting the rest.

use crate::capture::{PlotData, PlotFormat};
use crate::harness::HARNESS_FILE;
use crate::storage::ObjectStorage;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, warn};

/// Per-file size ceiling; larger intermediates stay out-of-band.
pub const MAX_ARTIFACT_BYTES: u64 = 10 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArtifactKind {
    Image,
    Table,
    Document,
    Data,
}

/// Handle to one externally-stored execution byproduct.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Artifact {
    #[serde(rename = "type")]
    pub kind: ArtifactKind,
    pub name: String,
    pub url: String,
    pub mime_type: String,
    pub size: u64,
}

/// Classify a file name by extension. Unknown extensions fall back to `Data`
/// with an opaque MIME type.
pub fn classify_extension(name: &str) -> (ArtifactKind, &'static str) {
    let ext = Path::new(name)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .unwrap_or_default();

    match ext.as_str() {
        "png" => (ArtifactKind::Image, "image/png"),
        "jpg" | "jpeg" => (ArtifactKind::Image, "image/jpeg"),
        "gif" => (ArtifactKind::Image, "image/gif"),
        "svg" => (ArtifactKind::Image, "image/svg+xml"),
        "webp" => (ArtifactKind::Image, "image/webp"),
        "bmp" => (ArtifactKind::Image, "image/bmp"),
        "csv" => (ArtifactKind::Table, "text/csv"),
        "tsv" => (ArtifactKind::Table, "text/tab-separated-values"),
        "xlsx" => (
            ArtifactKind::Table,
            "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
        ),
        "parquet" => (ArtifactKind::Table, "application/vnd.apache.parquet"),
        "pdf" => (ArtifactKind::Document, "application/pdf"),
        "txt" => (ArtifactKind::Document, "text/plain"),
        "md" => (ArtifactKind::Document, "text/markdown"),
        "html" | "htm" => (ArtifactKind::Document, "text/html"),
        "docx" => (
            ArtifactKind::Document,
            "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
        ),
        "json" => (ArtifactKind::Data, "application/json"),
        "xml" => (ArtifactKind::Data, "application/xml"),
        _ => (ArtifactKind::Data, "application/octet-stream"),
    }
}

fn plot_mime_and_ext(format: PlotFormat) -> (&'static str, &'static str) {
    match format {
        PlotFormat::Png => ("image/png", "png"),
        PlotFormat::Svg => ("image/svg+xml", "svg"),
        PlotFormat::Html => ("text/html", "html"),
    }
}

pub struct ArtifactExtractor {
    storage: Arc<dyn ObjectStorage>,
}

impl ArtifactExtractor {
    pub fn new(storage: Arc<dyn ObjectStorage>) -> Self {
        Self { storage }
    }

    /// Persist everything one execution left behind: inline plot and
    /// variable payloads from the harness, then files found in the scratch
    /// directory. Returns the handles that uploaded successfully; never
    /// fails as a whole.
    pub async fn extract(
        &self,
        execution_id: &str,
        scratch: &Path,
        plots: &[PlotData],
        variables: Option<&serde_json::Value>,
    ) -> Vec<Artifact> {
        let mut artifacts = Vec::new();

        for (index, plot) in plots.iter().enumerate() {
            match self.upload_plot(execution_id, index, plot).await {
                Ok(artifact) => artifacts.push(artifact),
                Err(e) => warn!("[SANDBOX] Skipping plot {}: {}", plot.id, e),
            }
        }

        if let Some(snapshot) = variables.filter(|v| v.as_object().is_some_and(|m| !m.is_empty())) {
            match self.upload_variables(execution_id, snapshot).await {
                Ok(artifact) => artifacts.push(artifact),
                Err(e) => warn!("[SANDBOX] Skipping variable snapshot: {}", e),
            }
        }

        let entries = match std::fs::read_dir(scratch) {
            Ok(entries) => entries,
            Err(e) => {
                warn!("[SANDBOX] Cannot read scratch dir {:?}: {}", scratch, e);
                return artifacts;
            }
        };

        for entry in entries.flatten() {
            let Ok(file_type) = entry.file_type() else {
                continue;
            };
            if !file_type.is_file() || file_type.is_symlink() {
                continue;
            }
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            if name == HARNESS_FILE {
                continue;
            }

            let size = match entry.metadata() {
                Ok(meta) => meta.len(),
                Err(e) => {
                    warn!("[SANDBOX] Skipping {:?}: {}", entry.path(), e);
                    continue;
                }
            };
            if size > MAX_ARTIFACT_BYTES {
                debug!(
                    "[SANDBOX] Skipping oversized artifact {:?} ({} bytes)",
                    entry.path(),
                    size
                );
                continue;
            }

            match self.upload_file(execution_id, &name, &entry.path(), size).await {
                Ok(artifact) => artifacts.push(artifact),
                Err(e) => warn!("[SANDBOX] Skipping artifact {:?}: {}", entry.path(), e),
            }
        }

        artifacts
    }

    async fn upload_plot(
        &self,
        execution_id: &str,
        index: usize,
        plot: &PlotData,
    ) -> crate::errors::Result<Artifact> {
        let (mime, ext) = plot_mime_and_ext(plot.format);
        let bytes = match plot.format {
            PlotFormat::Png => BASE64.decode(plot.data.as_bytes()).map_err(|e| {
                crate::errors::SandboxError::InternalError(format!("bad plot payload: {e}"))
            })?,
            PlotFormat::Svg | PlotFormat::Html => plot.data.clone().into_bytes(),
        };

        let name = format!("plot-{index}.{ext}");
        let size = bytes.len() as u64;
        let key = format!("{execution_id}/{name}");
        let url = self.storage.upload(&key, bytes, mime).await?;

        Ok(Artifact {
            kind: ArtifactKind::Image,
            name,
            url,
            mime_type: mime.to_string(),
            size,
        })
    }

    async fn upload_variables(
        &self,
        execution_id: &str,
        snapshot: &serde_json::Value,
    ) -> crate::errors::Result<Artifact> {
        let bytes = serde_json::to_vec_pretty(snapshot)?;
        if bytes.len() as u64 > MAX_ARTIFACT_BYTES {
            return Err(crate::errors::SandboxError::StorageFailed(
                "variable snapshot exceeds size limit".to_string(),
            ));
        }

        let name = "variables.json".to_string();
        let size = bytes.len() as u64;
        let key = format!("{execution_id}/{name}");
        let url = self.storage.upload(&key, bytes, "application/json").await?;

        Ok(Artifact {
            kind: ArtifactKind::Data,
            name,
            url,
            mime_type: "application/json".to_string(),
            size,
        })
    }

    async fn upload_file(
        &self,
        execution_id: &str,
        name: &str,
        path: &Path,
        size: u64,
    ) -> crate::errors::Result<Artifact> {
        let (kind, mime) = classify_extension(name);
        let bytes = tokio::fs::read(path).await?;
        let key = format!("{execution_id}/{name}");
        let url = self.storage.upload(&key, bytes, mime).await?;

        Ok(Artifact {
            kind,
            name: name.to_string(),
            url,
            mime_type: mime.to_string(),
            size,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::PlotMetadata;
    use crate::errors::{Result, SandboxError};
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Records uploads; fails any key containing a configured marker.
    struct MockStorage {
        uploads: Mutex<Vec<(String, String, usize)>>,
        fail_on: Option<String>,
    }

    impl MockStorage {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                uploads: Mutex::new(Vec::new()),
                fail_on: None,
            })
        }

        fn failing_on(marker: &str) -> Arc<Self> {
            Arc::new(Self {
                uploads: Mutex::new(Vec::new()),
                fail_on: Some(marker.to_string()),
            })
        }
    }

    #[async_trait]
    impl ObjectStorage for MockStorage {
        async fn upload(&self, key: &str, bytes: Vec<u8>, content_type: &str) -> Result<String> {
            if let Some(marker) = &self.fail_on {
                if key.contains(marker.as_str()) {
                    return Err(SandboxError::StorageFailed("injected failure".into()));
                }
            }
            self.uploads
                .lock()
                .unwrap()
                .push((key.to_string(), content_type.to_string(), bytes.len()));
            Ok(format!("mock://{key}"))
        }
    }

    #[test]
    fn classification_by_extension() {
        assert_eq!(classify_extension("a.png").0, ArtifactKind::Image);
        assert_eq!(classify_extension("b.CSV").0, ArtifactKind::Table);
        assert_eq!(classify_extension("c.pdf").0, ArtifactKind::Document);
        assert_eq!(classify_extension("d.json").0, ArtifactKind::Data);
        assert_eq!(classify_extension("no-extension").0, ArtifactKind::Data);
        assert_eq!(classify_extension("a.png").1, "image/png");
    }

    #[tokio::test]
    async fn extracts_and_classifies_scratch_files() {
        let scratch = tempfile::tempdir().unwrap();
        std::fs::write(scratch.path().join("chart.png"), b"fake-png").unwrap();
        std::fs::write(scratch.path().join("report.csv"), b"a,b\n1,2\n").unwrap();
        std::fs::write(scratch.path().join(HARNESS_FILE), b"# wrapper").unwrap();

        let storage = MockStorage::new();
        let extractor = ArtifactExtractor::new(storage.clone());
        let mut artifacts = extractor.extract("exec-1", scratch.path(), &[], None).await;
        artifacts.sort_by(|a, b| a.name.cmp(&b.name));

        assert_eq!(artifacts.len(), 2);
        assert_eq!(artifacts[0].name, "chart.png");
        assert_eq!(artifacts[0].kind, ArtifactKind::Image);
        assert_eq!(artifacts[1].name, "report.csv");
        assert_eq!(artifacts[1].kind, ArtifactKind::Table);
        assert!(artifacts.iter().all(|a| a.url.starts_with("mock://exec-1/")));

        // The wrapped script itself is never an artifact.
        let uploads = storage.uploads.lock().unwrap();
        assert!(uploads.iter().all(|(key, _, _)| !key.contains("__harness__")));
    }

    #[tokio::test]
    async fn one_failing_upload_does_not_abort_the_rest() {
        let scratch = tempfile::tempdir().unwrap();
        std::fs::write(scratch.path().join("good.txt"), b"ok").unwrap();
        std::fs::write(scratch.path().join("bad.txt"), b"fails").unwrap();

        let storage = MockStorage::failing_on("bad.txt");
        let extractor = ArtifactExtractor::new(storage);
        let artifacts = extractor.extract("exec-2", scratch.path(), &[], None).await;

        assert_eq!(artifacts.len(), 1);
        assert_eq!(artifacts[0].name, "good.txt");
    }

    #[tokio::test]
    async fn oversized_files_are_silently_skipped() {
        let scratch = tempfile::tempdir().unwrap();
        let big = scratch.path().join("big.bin");
        let file = std::fs::File::create(&big).unwrap();
        file.set_len(MAX_ARTIFACT_BYTES + 1).unwrap();
        std::fs::write(scratch.path().join("small.txt"), b"tiny").unwrap();

        let extractor = ArtifactExtractor::new(MockStorage::new());
        let artifacts = extractor.extract("exec-3", scratch.path(), &[], None).await;

        assert_eq!(artifacts.len(), 1);
        assert_eq!(artifacts[0].name, "small.txt");
    }

    #[tokio::test]
    async fn inline_plots_upload_decoded_payloads() {
        let scratch = tempfile::tempdir().unwrap();
        let plot = PlotData {
            id: "p1".into(),
            format: PlotFormat::Png,
            data: BASE64.encode(b"png-payload"),
            metadata: PlotMetadata::default(),
        };

        let storage = MockStorage::new();
        let extractor = ArtifactExtractor::new(storage.clone());
        let artifacts = extractor.extract("exec-4", scratch.path(), &[plot], None).await;

        assert_eq!(artifacts.len(), 1);
        assert_eq!(artifacts[0].name, "plot-0.png");
        assert_eq!(artifacts[0].mime_type, "image/png");
        assert_eq!(artifacts[0].size, b"png-payload".len() as u64);

        let uploads = storage.uploads.lock().unwrap();
        assert_eq!(uploads[0].0, "exec-4/plot-0.png");
        assert_eq!(uploads[0].2, b"png-payload".len());
    }

    #[tokio::test]
    async fn variable_snapshot_uploads_as_json_artifact() {
        let scratch = tempfile::tempdir().unwrap();
        let snapshot = serde_json::json!({
            "answer": {"name": "answer", "type": "int", "value": 42}
        });

        let storage = MockStorage::new();
        let extractor = ArtifactExtractor::new(storage.clone());
        let artifacts = extractor
            .extract("exec-6", scratch.path(), &[], Some(&snapshot))
            .await;

        assert_eq!(artifacts.len(), 1);
        assert_eq!(artifacts[0].name, "variables.json");
        assert_eq!(artifacts[0].kind, ArtifactKind::Data);
        assert_eq!(storage.uploads.lock().unwrap()[0].0, "exec-6/variables.json");

        // An empty snapshot produces nothing.
        let empty = serde_json::json!({});
        let artifacts = extractor
            .extract("exec-7", scratch.path(), &[], Some(&empty))
            .await;
        assert!(artifacts.is_empty());
    }

    #[tokio::test]
    async fn corrupt_plot_payload_is_skipped_not_fatal() {
        let scratch = tempfile::tempdir().unwrap();
        let plot = PlotData {
            id: "p1".into(),
            format: PlotFormat::Png,
            data: "not base64 !!!".into(),
            metadata: PlotMetadata::default(),
        };

        let extractor = ArtifactExtractor::new(MockStorage::new());
        let artifacts = extractor.extract("exec-5", scratch.path(), &[plot], None).await;
        assert!(artifacts.is_empty());
    }
}
