//! Function Executor
//!
//! Runs one application function on behalf of a control plane. The
//! executor exposes two servers:
//! - gRPC server: the `FunctionExecutor` service used by the control plane
//! - HTTP server (optional): the same operations as JSON over HTTP

use anyhow::{Context, Result};
use blob_store::BlobStore;
use clap::Parser;
use function_executor::{
    config::FunctionExecutorConfig,
    function::{AllocationError, FunctionRegistry},
    future_graph::{Argument, Future},
    grpc_server,
    health::HealthChecker,
    http_server,
    service::{self, FunctionExecutorService},
    tracing::setup_tracing,
};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "function-executor")]
#[command(about = "Runs application functions for the control plane")]
struct Args {
    /// Path to the YAML config file
    #[arg(long, short = 'c')]
    config: Option<String>,

    /// gRPC listen address, e.g. 0.0.0.0:9600
    #[arg(long)]
    address: Option<String>,

    /// HTTP listen address; the HTTP API is off unless set
    #[arg(long)]
    http_address: Option<String>,

    #[arg(long)]
    executor_id: Option<String>,

    /// Human readable logs instead of JSON
    #[arg(long)]
    dev: bool,
}

fn load_config(args: &Args) -> Result<FunctionExecutorConfig> {
    let mut config = match args.config.as_deref() {
        Some(path) => FunctionExecutorConfig::from_path(path)?,
        None => FunctionExecutorConfig::default(),
    };
    if let Some(address) = args.address.clone() {
        config.grpc_listen_addr = address;
    }
    if let Some(address) = args.http_address.clone() {
        config.http_listen_addr = Some(address);
    }
    if let Some(executor_id) = args.executor_id.clone() {
        config.executor_id = executor_id;
    }
    if args.dev {
        config.structured_logging = false;
    }
    config.validate()?;
    Ok(config)
}

/// Functions built into this binary.
fn registry() -> FunctionRegistry {
    let mut registry = FunctionRegistry::new();
    registry
        .register("echo", |_, args| Ok(args.arg(0)?.clone().into()))
        .register("square", |_, args| {
            let x = args.i64_arg(0)?;
            Ok(json!(x * x).into())
        })
        .register("add", |_, args| {
            Ok(json!(args.i64_arg(0)? + args.i64_arg(1)?).into())
        })
        .register("sum_of_squares", |ctx, args| {
            let items: Vec<Argument> = args
                .arg(0)?
                .as_data()
                .and_then(|v| v.as_array())
                .ok_or_else(|| AllocationError::request("expected a list of integers"))?
                .iter()
                .map(|v| Argument::from(v.clone()))
                .collect();
            ctx.update_progress(1.0, 2.0);
            let squares = Future::map("square", items);
            Ok(Future::reduce("add", squares, Some(json!(0).into())).into())
        });
    registry
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = load_config(&args)?;
    setup_tracing(&config)?;

    info!(
        version = service::VERSION,
        executor_id = %config.executor_id,
        "Starting function executor"
    );

    let blob_store =
        BlobStore::new(config.blob_store.options()).context("Failed to create blob store")?;
    let service = FunctionExecutorService::new(
        registry(),
        blob_store,
        config.input_download.policy(),
        HealthChecker::new(&config.health),
    );

    let cancel_token = CancellationToken::new();

    let grpc_server_handle = {
        let service = service.clone();
        let addr = config.grpc_socket_addr()?;
        let cancel_token = cancel_token.clone();

        tokio::spawn(async move {
            if let Err(e) = grpc_server::run_server(addr, service, cancel_token.clone()).await {
                error!(error = %e, "gRPC server error");
                cancel_token.cancel();
            }
        })
    };

    let http_server_handle = match config.http_socket_addr()? {
        Some(addr) => {
            let service = service.clone();
            let cancel_token = cancel_token.clone();
            Some(tokio::spawn(async move {
                if let Err(e) = http_server::run_http_server(addr, service, cancel_token.clone()).await {
                    error!(error = %e, "HTTP server error");
                    cancel_token.cancel();
                }
            }))
        }
        None => None,
    };

    wait_for_shutdown(cancel_token.clone()).await;
    cancel_token.cancel();

    let _ = grpc_server_handle.await;
    if let Some(handle) = http_server_handle {
        let _ = handle.await;
    }

    info!("Function executor shutdown complete");
    Ok(())
}

async fn wait_for_shutdown(cancel_token: CancellationToken) {
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl-C");
        }
        _ = terminate => {
            info!("Received SIGTERM");
        }
        _ = cancel_token.cancelled() => {
            info!("Cancellation token triggered");
        }
    }
}
