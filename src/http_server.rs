//! HTTP transport for control planes without a streaming RPC client.
//!
//! Provides endpoints for:
//! - Initialization, info and health
//! - Allocation create, list, delete and output blob delivery
//! - Long-polling of allocation state

use std::{net::SocketAddr, time::Duration};

use anyhow::{Context, Result};
use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use bytes::Bytes;
use proto_api::function_executor_pb::{
    Allocation,
    AllocationUpdate,
    InitializeRequest,
    ListAllocationsResponse,
};
use serde::de::DeserializeOwned;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{error, info};

use crate::{
    http_models::{
        CreatedResponse,
        ErrorResponse,
        HealthResponse,
        SuccessResponse,
        LAST_HASH_HEADER,
        TIMEOUT_HEADER,
    },
    service::{FunctionExecutorService, ServiceError},
};

/// Longest accepted long-poll wait.
const MAX_LONG_POLL: Duration = Duration::from_secs(300);

pub fn create_routes(service: FunctionExecutorService) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health))
        .route("/info", get(info))
        .route("/initialize", post(initialize))
        .route("/allocations", post(create_allocation).get(list_allocations))
        .route(
            "/allocations/{allocation_id}",
            get(get_allocation).delete(delete_allocation),
        )
        .route("/allocations/{allocation_id}/updates", post(send_allocation_update))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(service)
}

/// Serves the HTTP API on `addr` until `cancel_token` fires.
pub async fn run_http_server(
    addr: SocketAddr,
    service: FunctionExecutorService,
    cancel_token: CancellationToken,
) -> Result<()> {
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind HTTP server to {}", addr))?;
    run_http_server_with_listener(listener, service, cancel_token).await
}

pub async fn run_http_server_with_listener(
    listener: TcpListener,
    service: FunctionExecutorService,
    cancel_token: CancellationToken,
) -> Result<()> {
    let addr = listener.local_addr().context("Failed to read HTTP listen address")?;
    info!(addr = %addr, "HTTP server listening");

    axum::serve(listener, create_routes(service))
        .with_graceful_shutdown(async move {
            cancel_token.cancelled().await;
            info!("HTTP server shutting down");
        })
        .await
        .context("HTTP server error")?;

    Ok(())
}

fn error_response(err: ServiceError) -> Response {
    let status = match &err {
        ServiceError::NotInitialized => StatusCode::SERVICE_UNAVAILABLE,
        ServiceError::AlreadyInitialized |
        ServiceError::AlreadyExists(_) |
        ServiceError::FailedPrecondition(_) => StatusCode::CONFLICT,
        ServiceError::InvalidArgument(_) => StatusCode::BAD_REQUEST,
        ServiceError::NotFound(_) => StatusCode::NOT_FOUND,
        ServiceError::Internal(_) => {
            error!(error = %err, "internal error serving HTTP request");
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    (
        status,
        axum::Json(ErrorResponse::with_code(err.to_string(), err.code())),
    )
        .into_response()
}

fn bad_request(message: impl Into<String>) -> Response {
    error_response(ServiceError::InvalidArgument(message.into()))
}

fn parse_body<T: DeserializeOwned>(body: &Bytes) -> Result<T, Response> {
    if body.is_empty() {
        return Err(bad_request("request body is required"));
    }
    serde_json::from_slice(body).map_err(|e| bad_request(format!("invalid request body: {}", e)))
}

// ============================================================================
// Health, info and initialization
// ============================================================================

async fn health(State(service): State<FunctionExecutorService>) -> impl IntoResponse {
    match service.check_health().await {
        Ok(response) if response.healthy.unwrap_or(false) => (
            StatusCode::OK,
            axum::Json(HealthResponse {
                healthy: true,
                status_message: response.status_message,
                error: None,
            }),
        ),
        Ok(response) => (
            StatusCode::SERVICE_UNAVAILABLE,
            axum::Json(HealthResponse {
                healthy: false,
                status_message: None,
                error: response.status_message,
            }),
        ),
        Err(err) => (
            StatusCode::SERVICE_UNAVAILABLE,
            axum::Json(HealthResponse {
                healthy: false,
                status_message: None,
                error: Some(err.to_string()),
            }),
        ),
    }
}

async fn info(State(service): State<FunctionExecutorService>) -> impl IntoResponse {
    axum::Json(service.info().await)
}

async fn initialize(State(service): State<FunctionExecutorService>, body: Bytes) -> Response {
    let request: InitializeRequest = match parse_body(&body) {
        Ok(request) => request,
        Err(response) => return response,
    };
    match service.initialize(request).await {
        Ok(response) => (StatusCode::OK, axum::Json(response)).into_response(),
        Err(err) => error_response(err),
    }
}

// ============================================================================
// Allocations
// ============================================================================

async fn create_allocation(State(service): State<FunctionExecutorService>, body: Bytes) -> Response {
    let body: serde_json::Value = match parse_body(&body) {
        Ok(body) => body,
        Err(response) => return response,
    };
    // Either {"allocation": {...}} or the bare allocation.
    let allocation = body.get("allocation").cloned().unwrap_or(body);
    let allocation: Allocation = match serde_json::from_value(allocation) {
        Ok(allocation) => allocation,
        Err(e) => return bad_request(format!("invalid allocation: {}", e)),
    };

    match service.create_allocation(allocation).await {
        Ok(_) => (
            StatusCode::CREATED,
            axum::Json(CreatedResponse {
                status: "created".to_string(),
            }),
        )
            .into_response(),
        Err(err) => error_response(err),
    }
}

async fn list_allocations(State(service): State<FunctionExecutorService>) -> impl IntoResponse {
    axum::Json(ListAllocationsResponse {
        allocations: service.list_allocations().await,
    })
}

/// Long-polls when both `X-Last-Hash` and `X-Timeout` are set, otherwise
/// returns the current state right away.
async fn get_allocation(
    State(service): State<FunctionExecutorService>,
    Path(allocation_id): Path<String>,
    headers: HeaderMap,
) -> Response {
    let runner = match service.runner(&allocation_id).await {
        Ok(runner) => runner,
        Err(err) => return error_response(err),
    };

    let last_hash = headers.get(LAST_HASH_HEADER).and_then(|v| v.to_str().ok());
    let timeout = headers.get(TIMEOUT_HEADER).and_then(|v| v.to_str().ok());
    let state = match (last_hash, timeout) {
        (Some(last_hash), Some(timeout)) => {
            let timeout = match timeout.trim().parse::<f64>() {
                Ok(secs) if secs.is_finite() && secs >= 0.0 => {
                    Duration::from_secs_f64(secs).min(MAX_LONG_POLL)
                }
                _ => return bad_request(format!("invalid {} header: {}", TIMEOUT_HEADER, timeout)),
            };
            runner.wait_for_update(Some(last_hash), timeout).await
        }
        _ => runner.state(),
    };
    (StatusCode::OK, axum::Json(state)).into_response()
}

async fn send_allocation_update(
    State(service): State<FunctionExecutorService>,
    Path(allocation_id): Path<String>,
    body: Bytes,
) -> Response {
    let mut update: AllocationUpdate = match parse_body(&body) {
        Ok(update) => update,
        Err(response) => return response,
    };
    match update.allocation_id.as_deref() {
        None | Some("") => update.allocation_id = Some(allocation_id),
        Some(id) if id == allocation_id => {}
        Some(id) => {
            return bad_request(format!(
                "update for allocation {} sent to allocation {}",
                id, allocation_id
            ))
        }
    }

    match service.send_allocation_update(update).await {
        Ok(()) => (StatusCode::OK, axum::Json(SuccessResponse { success: true })).into_response(),
        Err(err) => error_response(err),
    }
}

async fn delete_allocation(
    State(service): State<FunctionExecutorService>,
    Path(allocation_id): Path<String>,
) -> Response {
    match service.delete_allocation(&allocation_id).await {
        Ok(()) => (StatusCode::OK, axum::Json(SuccessResponse { success: true })).into_response(),
        Err(err) => error_response(err),
    }
}
