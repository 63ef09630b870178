//! Log output of the executor process.
//!
//! `RUST_LOG` selects what gets logged, INFO when unset. Every event carries
//! the name of the thread that emitted it, which for user code is
//! `allocation-<allocation id>`.

use anyhow::{Context, Result};
use tracing_subscriber::{
    filter::LevelFilter,
    fmt,
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
    Layer,
};

use crate::config::FunctionExecutorConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// One flattened JSON object per event, for log collectors.
    Json,
    /// Human readable single lines.
    Compact,
}

impl LogFormat {
    pub fn for_config(config: &FunctionExecutorConfig) -> Self {
        if config.structured_logging {
            LogFormat::Json
        } else {
            LogFormat::Compact
        }
    }
}

fn env_filter() -> EnvFilter {
    EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy()
}

/// Installs the global subscriber. Fails if one is already installed.
pub fn setup_tracing(config: &FunctionExecutorConfig) -> Result<()> {
    let registry = tracing_subscriber::registry();
    let installed = match LogFormat::for_config(config) {
        LogFormat::Json => registry
            .with(
                fmt::layer()
                    .json()
                    .flatten_event(true)
                    .with_current_span(true)
                    .with_span_list(false)
                    .with_thread_names(true)
                    .with_filter(env_filter()),
            )
            .try_init(),
        LogFormat::Compact => registry
            .with(
                fmt::layer()
                    .compact()
                    .with_thread_names(true)
                    .with_filter(env_filter()),
            )
            .try_init(),
    };
    installed.context("installing the tracing subscriber")
}
