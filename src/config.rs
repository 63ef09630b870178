use std::{fs, net::SocketAddr, path::PathBuf, time::Duration};

use anyhow::{anyhow, Context, Result};
use blob_store::{BlobStoreOptions, MAX_IO_WORKERS};
use figment::{
    providers::{Env, Format, Yaml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::{allocation_runner::DownloadPolicy, retry::Backoff};

const LOCAL_EXECUTOR_ID: &str = "local";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BlobStoreConfig {
    /// Hard cap on concurrent chunk transfers.
    pub max_io_workers: usize,
    pub io_workers_per_cpu: usize,
    /// Detected from the machine when unset.
    pub available_cpu_count: Option<usize>,
    pub request_timeout_secs: u64,
}

impl Default for BlobStoreConfig {
    fn default() -> Self {
        Self {
            max_io_workers: MAX_IO_WORKERS,
            io_workers_per_cpu: 3,
            available_cpu_count: None,
            request_timeout_secs: 300,
        }
    }
}

impl BlobStoreConfig {
    pub fn options(&self) -> BlobStoreOptions {
        let cpus = self.available_cpu_count.unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        });
        BlobStoreOptions {
            worker_count: (cpus * self.io_workers_per_cpu).clamp(1, self.max_io_workers),
            request_timeout: Duration::from_secs(self.request_timeout_secs),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InputDownloadConfig {
    pub max_retries: u32,
    pub initial_backoff_ms: u64,
    /// Equal to `initial_backoff_ms` for a fixed delay.
    pub max_backoff_ms: u64,
}

impl Default for InputDownloadConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff_ms: 100,
            max_backoff_ms: 2_000,
        }
    }
}

impl InputDownloadConfig {
    pub fn policy(&self) -> DownloadPolicy {
        let initial = Duration::from_millis(self.initial_backoff_ms);
        let backoff = if self.max_backoff_ms == self.initial_backoff_ms {
            Backoff::Fixed(initial)
        } else {
            Backoff::Exponential {
                initial,
                max: Duration::from_millis(self.max_backoff_ms),
            }
        };
        DownloadPolicy {
            max_retries: self.max_retries,
            backoff,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    /// Probe GPUs with `nvidia-smi` when the container has any.
    pub gpu_checks_enabled: bool,
    pub nvidia_smi_path: PathBuf,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            gpu_checks_enabled: true,
            nvidia_smi_path: PathBuf::from("nvidia-smi"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FunctionExecutorConfig {
    pub executor_id: String,
    pub grpc_listen_addr: String,
    pub http_listen_addr: Option<String>,
    pub structured_logging: bool,
    pub blob_store: BlobStoreConfig,
    pub input_download: InputDownloadConfig,
    pub health: HealthConfig,
}

impl Default for FunctionExecutorConfig {
    fn default() -> Self {
        Self {
            executor_id: LOCAL_EXECUTOR_ID.to_string(),
            grpc_listen_addr: "0.0.0.0:9600".to_string(),
            http_listen_addr: None,
            structured_logging: false,
            blob_store: BlobStoreConfig::default(),
            input_download: InputDownloadConfig::default(),
            health: HealthConfig::default(),
        }
    }
}

impl FunctionExecutorConfig {
    pub fn from_path(path: &str) -> Result<Self> {
        let config_str = fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path))?;
        Self::from_yaml_str(&config_str)
    }

    /// Environment variables prefixed with `FUNCTION_EXECUTOR_` override
    /// the YAML.
    pub fn from_yaml_str(config_str: &str) -> Result<Self> {
        let config: FunctionExecutorConfig = Figment::new()
            .merge(Yaml::string(config_str))
            .merge(Env::prefixed("FUNCTION_EXECUTOR_"))
            .extract()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.executor_id.is_empty() {
            return Err(anyhow!("executor_id must not be empty"));
        }
        if self.grpc_listen_addr.parse::<SocketAddr>().is_err() {
            return Err(anyhow!(
                "invalid grpc listen address: {}",
                self.grpc_listen_addr
            ));
        }
        if let Some(addr) = self.http_listen_addr.as_ref() {
            if addr.parse::<SocketAddr>().is_err() {
                return Err(anyhow!("invalid http listen address: {}", addr));
            }
        }
        if self.blob_store.max_io_workers == 0 || self.blob_store.io_workers_per_cpu == 0 {
            return Err(anyhow!("blob store needs at least one I/O worker"));
        }
        if self.input_download.max_backoff_ms < self.input_download.initial_backoff_ms {
            return Err(anyhow!(
                "input_download.max_backoff_ms must not be below initial_backoff_ms"
            ));
        }
        Ok(())
    }

    pub fn grpc_socket_addr(&self) -> Result<SocketAddr> {
        self.grpc_listen_addr
            .parse()
            .with_context(|| format!("parsing grpc listen address {}", self.grpc_listen_addr))
    }

    pub fn http_socket_addr(&self) -> Result<Option<SocketAddr>> {
        self.http_listen_addr
            .as_ref()
            .map(|addr| {
                addr.parse()
                    .with_context(|| format!("parsing http listen address {}", addr))
            })
            .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = FunctionExecutorConfig::default();
        config.validate().unwrap();
        assert!(config.http_socket_addr().unwrap().is_none());
    }

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let config = FunctionExecutorConfig::from_yaml_str(
            r#"
executor_id: fe-7
http_listen_addr: 127.0.0.1:9601
blob_store:
  available_cpu_count: 2
input_download:
  initial_backoff_ms: 50
  max_backoff_ms: 50
"#,
        )
        .unwrap();
        assert_eq!(config.executor_id, "fe-7");
        assert_eq!(config.grpc_listen_addr, "0.0.0.0:9600");
        assert_eq!(config.blob_store.options().worker_count, 6);
        assert_eq!(
            config.input_download.policy().backoff,
            Backoff::Fixed(Duration::from_millis(50))
        );
        assert!(config.health.gpu_checks_enabled);
    }

    #[test]
    fn test_worker_count_is_capped() {
        let config = BlobStoreConfig {
            available_cpu_count: Some(64),
            ..Default::default()
        };
        assert_eq!(config.options().worker_count, MAX_IO_WORKERS);
    }

    #[test]
    fn test_invalid_addresses_are_rejected() {
        assert!(FunctionExecutorConfig::from_yaml_str("grpc_listen_addr: nowhere").is_err());
        assert!(FunctionExecutorConfig::from_yaml_str("http_listen_addr: nowhere").is_err());
    }

    #[test]
    fn test_env_overrides_yaml() {
        std::env::set_var("FUNCTION_EXECUTOR_STRUCTURED_LOGGING", "true");
        let config = FunctionExecutorConfig::from_yaml_str("structured_logging: false");
        std::env::remove_var("FUNCTION_EXECUTOR_STRUCTURED_LOGGING");
        assert!(config.unwrap().structured_logging);
    }

    #[test]
    fn test_serialized_defaults_load_back() {
        let yaml = serde_yaml::to_string(&FunctionExecutorConfig::default()).unwrap();
        let config = FunctionExecutorConfig::from_yaml_str(&yaml).unwrap();
        assert_eq!(config.executor_id, LOCAL_EXECUTOR_ID);
        assert_eq!(config.health.nvidia_smi_path, PathBuf::from("nvidia-smi"));
    }
}
