//! Periodic liveness probing of a Function Executor.
//!
//! This is the probing side: a supervisor runs [`run_health_checker`]
//! against an executor and kills and respawns it once it reports
//! [`HealthCheckerExit::Unhealthy`].

use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use proto_api::function_executor_pb::HealthCheckResponse;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::{fe_client::FunctionExecutorGrpcClient, http_models::HealthResponse};

pub const HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(5);
pub const HEALTH_CHECK_TIMEOUT: Duration = Duration::from_secs(5);
const MAX_FAILURES: u32 = 3;

#[async_trait]
pub trait HealthProbe: Send {
    async fn probe(&mut self) -> Result<HealthCheckResponse>;
}

#[async_trait]
impl HealthProbe for FunctionExecutorGrpcClient {
    async fn probe(&mut self) -> Result<HealthCheckResponse> {
        self.check_health().await
    }
}

/// Probes `GET /health` of the HTTP API.
pub struct HttpHealthProbe {
    client: reqwest::Client,
    url: String,
}

impl HttpHealthProbe {
    pub fn new(base_url: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(HEALTH_CHECK_TIMEOUT)
            .build()
            .context("building HTTP health probe client")?;
        Ok(Self {
            client,
            url: format!("{}/health", base_url.trim_end_matches('/')),
        })
    }
}

#[async_trait]
impl HealthProbe for HttpHealthProbe {
    async fn probe(&mut self) -> Result<HealthCheckResponse> {
        let response = self
            .client
            .get(&self.url)
            .send()
            .await
            .with_context(|| format!("GET {} failed", self.url))?;
        let status = response.status();
        let body: HealthResponse = response
            .json()
            .await
            .with_context(|| format!("decoding health response with status {}", status))?;
        Ok(HealthCheckResponse {
            healthy: Some(body.healthy && status.is_success()),
            status_message: body.error.or(body.status_message),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthCheckerExit {
    Cancelled,
    /// Too many consecutive failed probes.
    Unhealthy,
}

/// Probes every `interval` until cancelled or until the executor fails
/// `MAX_FAILURES` probes in a row. A probe taking longer than
/// `probe_timeout` counts as failed.
pub async fn run_health_checker<P: HealthProbe>(
    mut probe: P,
    interval: Duration,
    probe_timeout: Duration,
    cancel_token: CancellationToken,
    fe_id: &str,
) -> HealthCheckerExit {
    let mut interval = tokio::time::interval(interval);
    let mut consecutive_failures = 0u32;

    // Reset the interval so the first tick happens after the duration
    interval.reset();

    loop {
        tokio::select! {
            _ = cancel_token.cancelled() => {
                info!(fe_id = %fe_id, "Health checker cancelled");
                return HealthCheckerExit::Cancelled;
            }
            _ = interval.tick() => {
                let result = tokio::time::timeout(probe_timeout, probe.probe())
                    .await
                    .unwrap_or_else(|_| Err(anyhow!("health check timed out after {:?}", probe_timeout)));
                match result {
                    Ok(response) => {
                        if response.healthy.unwrap_or(false) {
                            consecutive_failures = 0;
                        } else {
                            consecutive_failures += 1;
                            warn!(
                                fe_id = %fe_id,
                                consecutive_failures = consecutive_failures,
                                status_message = ?response.status_message,
                                "FE health check returned unhealthy"
                            );
                        }
                    }
                    Err(e) => {
                        consecutive_failures += 1;
                        warn!(
                            fe_id = %fe_id,
                            consecutive_failures = consecutive_failures,
                            error = %e,
                            "FE health check failed"
                        );
                    }
                }

                if consecutive_failures >= MAX_FAILURES {
                    warn!(
                        fe_id = %fe_id,
                        consecutive_failures = consecutive_failures,
                        "FE failed too many health checks, terminating"
                    );
                    return HealthCheckerExit::Unhealthy;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;

    use super::*;

    struct ScriptedProbe {
        responses: VecDeque<Option<bool>>,
    }

    #[async_trait]
    impl HealthProbe for ScriptedProbe {
        async fn probe(&mut self) -> Result<HealthCheckResponse> {
            match self.responses.pop_front().flatten() {
                Some(healthy) => Ok(HealthCheckResponse {
                    healthy: Some(healthy),
                    status_message: None,
                }),
                None => Err(anyhow!("connection refused")),
            }
        }
    }

    struct HangingProbe;

    #[async_trait]
    impl HealthProbe for HangingProbe {
        async fn probe(&mut self) -> Result<HealthCheckResponse> {
            std::future::pending().await
        }
    }

    #[tokio::test]
    async fn test_success_resets_failure_count() {
        let probe = ScriptedProbe {
            responses: VecDeque::from(vec![
                None,
                Some(false),
                Some(true),
                None,
                Some(false),
                None,
            ]),
        };
        let exit = run_health_checker(
            probe,
            Duration::from_millis(5),
            Duration::from_secs(1),
            CancellationToken::new(),
            "fe-1",
        )
        .await;
        assert_eq!(exit, HealthCheckerExit::Unhealthy);
    }

    #[tokio::test]
    async fn test_hanging_probe_counts_as_failure() {
        let exit = run_health_checker(
            HangingProbe,
            Duration::from_millis(5),
            Duration::from_millis(10),
            CancellationToken::new(),
            "fe-1",
        )
        .await;
        assert_eq!(exit, HealthCheckerExit::Unhealthy);
    }

    #[tokio::test]
    async fn test_cancellation() {
        let cancel_token = CancellationToken::new();
        cancel_token.cancel();
        let probe = ScriptedProbe {
            responses: VecDeque::new(),
        };
        let exit = run_health_checker(
            probe,
            Duration::from_secs(60),
            Duration::from_secs(1),
            cancel_token,
            "fe-1",
        )
        .await;
        assert_eq!(exit, HealthCheckerExit::Cancelled);
    }
}
