//! Executor-side answer to liveness probes.
//!
//! Probes are served by the async runtime, never by an allocation thread,
//! so a deadlocked function keeps the executor reporting healthy until the
//! process itself goes away.

use std::{path::PathBuf, time::Duration};

use tokio::process::Command;
use tracing::warn;

use crate::config::HealthConfig;

const GPU_CHECK_TIMEOUT: Duration = Duration::from_secs(10);
const NVIDIA_VISIBLE_DEVICES: &str = "NVIDIA_VISIBLE_DEVICES";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthStatus {
    pub healthy: bool,
    pub message: String,
}

impl HealthStatus {
    fn healthy() -> Self {
        Self {
            healthy: true,
            message: "Function Executor is healthy".to_string(),
        }
    }

    fn unhealthy(message: impl Into<String>) -> Self {
        Self {
            healthy: false,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct HealthChecker {
    gpu_checks_enabled: bool,
    nvidia_smi_path: PathBuf,
}

impl HealthChecker {
    pub fn new(config: &HealthConfig) -> Self {
        Self {
            gpu_checks_enabled: config.gpu_checks_enabled,
            nvidia_smi_path: config.nvidia_smi_path.clone(),
        }
    }

    pub async fn check(&self) -> HealthStatus {
        if self.gpu_checks_enabled && has_visible_gpus(std::env::var(NVIDIA_VISIBLE_DEVICES).ok()) {
            if let Err(message) = self.check_gpus().await {
                warn!(error = %message, "GPU health check failed");
                return HealthStatus::unhealthy(message);
            }
        }
        HealthStatus::healthy()
    }

    async fn check_gpus(&self) -> Result<(), String> {
        let output = tokio::time::timeout(
            GPU_CHECK_TIMEOUT,
            Command::new(&self.nvidia_smi_path).kill_on_drop(true).output(),
        )
        .await
        .map_err(|_| format!("nvidia-smi did not finish in {:?}", GPU_CHECK_TIMEOUT))?
        .map_err(|e| format!("failed to run {}: {}", self.nvidia_smi_path.display(), e))?;

        if !output.status.success() {
            return Err(format!(
                "nvidia-smi exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            ));
        }
        Ok(())
    }
}

fn has_visible_gpus(devices: Option<String>) -> bool {
    match devices.as_deref().map(str::trim) {
        None | Some("") | Some("void") | Some("none") => false,
        Some(_) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_visible_gpus() {
        assert!(!has_visible_gpus(None));
        assert!(!has_visible_gpus(Some("void".to_string())));
        assert!(!has_visible_gpus(Some(" ".to_string())));
        assert!(has_visible_gpus(Some("0,1".to_string())));
        assert!(has_visible_gpus(Some("all".to_string())));
    }

    #[tokio::test]
    async fn test_gpu_check_reports_failing_tool() {
        let checker = HealthChecker {
            gpu_checks_enabled: true,
            nvidia_smi_path: PathBuf::from("false"),
        };
        let err = checker.check_gpus().await.unwrap_err();
        assert!(err.contains("nvidia-smi exited"));

        let missing = HealthChecker {
            gpu_checks_enabled: true,
            nvidia_smi_path: PathBuf::from("/nonexistent/nvidia-smi"),
        };
        assert!(missing.check_gpus().await.unwrap_err().contains("failed to run"));
    }

    #[tokio::test]
    async fn test_disabled_gpu_checks_are_healthy() {
        let checker = HealthChecker::new(&HealthConfig {
            gpu_checks_enabled: false,
            nvidia_smi_path: PathBuf::from("false"),
        });
        assert!(checker.check().await.healthy);
    }
}
