use crate::errors::{Result, SandboxError};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Configuration for one sandbox execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxConfig {
    /// Wall-clock timeout in milliseconds
    pub timeout_ms: u64,
    /// Memory ceiling as a human-readable string ("512m", "1g")
    pub memory_limit: String,
    /// CPU share ceiling in whole cores ("1", "2")
    pub cpu_limit: String,
    /// Advisory allow-list of importable packages, documenting what the
    /// execution image ships with. Not enforced by the isolation layer.
    pub allowed_packages: Vec<String>,
    /// Root directory under which per-execution scratch directories are created
    pub temp_dir: PathBuf,
    /// Maximum number of concurrently running executions
    pub max_concurrency: usize,
    /// Maximum retained output chunks per execution (floor 100)
    pub max_buffer_size: usize,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 30_000,
            memory_limit: "512m".to_string(),
            cpu_limit: "1".to_string(),
            allowed_packages: default_allowed_packages(),
            temp_dir: std::env::temp_dir().join("pycell-scratch"),
            max_concurrency: 4,
            max_buffer_size: 1000,
        }
    }
}

impl SandboxConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Effective chunk buffer size; values below the floor are clamped up.
    pub fn effective_buffer_size(&self) -> usize {
        self.max_buffer_size.max(100)
    }

    /// Translate the caller-facing config into process resource limits.
    pub fn resource_limits(&self) -> Result<ResourceLimits> {
        let memory_bytes = parse_memory_limit(&self.memory_limit).ok_or_else(|| {
            SandboxError::InvalidConfig(format!("unparseable memory limit: {}", self.memory_limit))
        })?;
        let cpu_cores: u64 = self.cpu_limit.trim().parse().map_err(|_| {
            SandboxError::InvalidConfig(format!("unparseable cpu limit: {}", self.cpu_limit))
        })?;

        // CPU-time budget: wall-clock timeout scaled by the core allowance,
        // with a one second floor so tiny timeouts still get to run.
        let cpu_seconds = (self.timeout_ms / 1000).saturating_mul(cpu_cores.max(1)).max(1);

        Ok(ResourceLimits {
            memory_bytes,
            cpu_seconds,
            max_processes: 16,
            max_threads: 4,
        })
    }
}

/// OS-level limits applied to the sandboxed process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceLimits {
    /// Maximum address space in bytes
    pub memory_bytes: u64,
    /// Maximum CPU time in seconds
    pub cpu_seconds: u64,
    /// Maximum number of processes in the sandbox process group
    pub max_processes: u64,
    /// Thread cap handed to scientific libraries via env vars
    pub max_threads: u32,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            memory_bytes: 512 * 1024 * 1024,
            cpu_seconds: 30,
            max_processes: 16,
            max_threads: 4,
        }
    }
}

/// Caller identity attached to an execution request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionContext {
    pub tenant_id: String,
    pub user_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
}

/// Parse a memory limit string (e.g., "512m", "1g") to bytes.
pub fn parse_memory_limit(limit: &str) -> Option<u64> {
    let limit = limit.trim().to_lowercase();
    let (num_str, unit) = if limit.ends_with('g') || limit.ends_with("gb") {
        (limit.trim_end_matches(|c| c == 'g' || c == 'b'), "g")
    } else if limit.ends_with('m') || limit.ends_with("mb") {
        (limit.trim_end_matches(|c| c == 'm' || c == 'b'), "m")
    } else if limit.ends_with('k') || limit.ends_with("kb") {
        (limit.trim_end_matches(|c| c == 'k' || c == 'b'), "k")
    } else {
        (limit.as_str(), "b")
    };

    let num: u64 = num_str.parse().ok()?;

    Some(match unit {
        "g" => num * 1024 * 1024 * 1024,
        "m" => num * 1024 * 1024,
        "k" => num * 1024,
        _ => num,
    })
}

/// Default advisory package allow-list, mirroring what the execution image
/// ships with.
fn default_allowed_packages() -> Vec<String> {
    [
        "numpy",
        "pandas",
        "matplotlib",
        "scipy",
        "sklearn",
        "seaborn",
        "statsmodels",
        "PIL",
        "openpyxl",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_memory_limit_units() {
        assert_eq!(parse_memory_limit("512m"), Some(512 * 1024 * 1024));
        assert_eq!(parse_memory_limit("1g"), Some(1024 * 1024 * 1024));
        assert_eq!(parse_memory_limit("1024k"), Some(1024 * 1024));
        assert_eq!(parse_memory_limit("1024"), Some(1024));
        assert_eq!(parse_memory_limit("2GB"), Some(2 * 1024 * 1024 * 1024));
        assert_eq!(parse_memory_limit("oops"), None);
    }

    #[test]
    fn buffer_size_floor() {
        let config = SandboxConfig {
            max_buffer_size: 10,
            ..Default::default()
        };
        assert_eq!(config.effective_buffer_size(), 100);

        let config = SandboxConfig {
            max_buffer_size: 5000,
            ..Default::default()
        };
        assert_eq!(config.effective_buffer_size(), 5000);
    }

    #[test]
    fn resource_limits_from_config() {
        let config = SandboxConfig::default();
        let limits = config.resource_limits().unwrap();
        assert_eq!(limits.memory_bytes, 512 * 1024 * 1024);
        assert_eq!(limits.cpu_seconds, 30);
    }

    #[test]
    fn resource_limits_reject_bad_memory() {
        let config = SandboxConfig {
            memory_limit: "lots".to_string(),
            ..Default::default()
        };
        assert!(config.resource_limits().is_err());
    }

    #[test]
    fn cpu_seconds_floor_for_tiny_timeouts() {
        let config = SandboxConfig {
            timeout_ms: 100,
            ..Default::default()
        };
        assert_eq!(config.resource_limits().unwrap().cpu_seconds, 1);
    }
}
