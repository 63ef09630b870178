//! Transport-independent core of the Function Executor.
//!
//! The gRPC and HTTP servers are thin adapters over
//! [`FunctionExecutorService`]; both see the same allocations.

use std::{collections::HashMap, fmt, sync::Arc};

use blob_store::BlobStore;
use proto_api::function_executor_pb::{
    Allocation,
    AllocationInfo,
    AllocationUpdate,
    FunctionRef,
    HealthCheckResponse,
    InfoResponse,
    InitializationFailureReason,
    InitializationOutcomeCode,
    InitializeRequest,
    InitializeResponse,
    SerializedObjectEncoding,
};
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::{
    allocation_runner::{
        validate_allocation,
        AllocationRunner,
        DownloadPolicy,
        RunnerEnvironment,
    },
    function::FunctionRegistry,
    health::HealthChecker,
    serialization::verify_inline_object,
};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const SDK_LANGUAGE: &str = "rust";
pub const SDK_LANGUAGE_VERSION: &str = env!("CARGO_PKG_RUST_VERSION");
pub const NOT_INITIALIZED_MESSAGE: &str = "Service not initialized";

#[derive(Debug)]
pub enum ServiceError {
    NotInitialized,
    AlreadyInitialized,
    InvalidArgument(String),
    AlreadyExists(String),
    NotFound(String),
    FailedPrecondition(String),
    Internal(anyhow::Error),
}

impl ServiceError {
    /// Stable machine-readable name, used as the HTTP error code.
    pub fn code(&self) -> &'static str {
        match self {
            ServiceError::NotInitialized => "NOT_INITIALIZED",
            ServiceError::AlreadyInitialized => "ALREADY_INITIALIZED",
            ServiceError::InvalidArgument(_) => "INVALID_ARGUMENT",
            ServiceError::AlreadyExists(_) => "ALREADY_EXISTS",
            ServiceError::NotFound(_) => "NOT_FOUND",
            ServiceError::FailedPrecondition(_) => "FAILED_PRECONDITION",
            ServiceError::Internal(_) => "INTERNAL",
        }
    }
}

impl fmt::Display for ServiceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServiceError::NotInitialized => write!(f, "{}", NOT_INITIALIZED_MESSAGE),
            ServiceError::AlreadyInitialized => {
                write!(f, "Function Executor is already initialized")
            }
            ServiceError::InvalidArgument(message) |
            ServiceError::AlreadyExists(message) |
            ServiceError::NotFound(message) |
            ServiceError::FailedPrecondition(message) => write!(f, "{}", message),
            ServiceError::Internal(err) => write!(f, "{:#}", err),
        }
    }
}

impl std::error::Error for ServiceError {}

impl From<ServiceError> for tonic::Status {
    fn from(err: ServiceError) -> Self {
        let message = err.to_string();
        match err {
            ServiceError::NotInitialized | ServiceError::FailedPrecondition(_) => {
                tonic::Status::failed_precondition(message)
            }
            ServiceError::AlreadyInitialized | ServiceError::AlreadyExists(_) => {
                tonic::Status::already_exists(message)
            }
            ServiceError::InvalidArgument(_) => tonic::Status::invalid_argument(message),
            ServiceError::NotFound(_) => tonic::Status::not_found(message),
            ServiceError::Internal(_) => tonic::Status::internal(message),
        }
    }
}

pub type ServiceResult<T> = Result<T, ServiceError>;

/// Outcome of opening a session.
pub struct OpenedSession {
    pub session_id: String,
    pub resumed: bool,
    /// Allocations created earlier in a resumed session, still present.
    pub allocations: Vec<Arc<AllocationRunner>>,
}

struct ServiceInner {
    registry: FunctionRegistry,
    blob_store: BlobStore,
    download_policy: DownloadPolicy,
    health_checker: HealthChecker,
    environment: RwLock<Option<RunnerEnvironment>>,
    allocations: RwLock<HashMap<String, Arc<AllocationRunner>>>,
    /// Allocation ids created through each session, in creation order.
    sessions: RwLock<HashMap<String, Vec<String>>>,
}

#[derive(Clone)]
pub struct FunctionExecutorService {
    inner: Arc<ServiceInner>,
}

fn required<'a>(value: &'a Option<String>, field: &str) -> ServiceResult<&'a str> {
    match value.as_deref() {
        Some(v) if !v.is_empty() => Ok(v),
        _ => Err(ServiceError::InvalidArgument(format!("{} is required", field))),
    }
}

fn validate_function_ref(function: &FunctionRef) -> ServiceResult<()> {
    required(&function.namespace, "function.namespace")?;
    required(&function.application_name, "function.application_name")?;
    required(&function.function_name, "function.function_name")?;
    required(&function.application_version, "function.application_version")?;
    Ok(())
}

impl FunctionExecutorService {
    pub fn new(
        registry: FunctionRegistry,
        blob_store: BlobStore,
        download_policy: DownloadPolicy,
        health_checker: HealthChecker,
    ) -> Self {
        Self {
            inner: Arc::new(ServiceInner {
                registry,
                blob_store,
                download_policy,
                health_checker,
                environment: RwLock::new(None),
                allocations: RwLock::new(HashMap::new()),
                sessions: RwLock::new(HashMap::new()),
            }),
        }
    }

    /// Selects the function this executor runs. Only the first successful
    /// call takes effect.
    pub async fn initialize(&self, request: InitializeRequest) -> ServiceResult<InitializeResponse> {
        let mut environment = self.inner.environment.write().await;
        if environment.is_some() {
            return Err(ServiceError::AlreadyInitialized);
        }

        let function_ref = request
            .function
            .ok_or_else(|| ServiceError::InvalidArgument("function is required".to_string()))?;
        validate_function_ref(&function_ref)?;

        let code = request.application_code.ok_or_else(|| {
            ServiceError::InvalidArgument("application_code is required".to_string())
        })?;
        let encoding = code
            .manifest
            .as_ref()
            .map(|manifest| manifest.encoding())
            .unwrap_or(SerializedObjectEncoding::Unknown);
        if encoding != SerializedObjectEncoding::BinaryZip {
            return Err(ServiceError::InvalidArgument(format!(
                "application_code must be BINARY_ZIP, got {:?}",
                encoding
            )));
        }
        let package = verify_inline_object(&code).map_err(|e| {
            ServiceError::InvalidArgument(format!("invalid application_code: {}", e))
        })?;

        let function_name = function_ref.function_name.clone().unwrap_or_default();
        let Some(function) = self.inner.registry.get(&function_name) else {
            warn!(function_name = %function_name, "function is not registered");
            return Ok(InitializeResponse {
                outcome_code: Some(InitializationOutcomeCode::Failure as i32),
                failure_reason: Some(InitializationFailureReason::FunctionError as i32),
                diagnostics: Some(format!(
                    "function {} is not registered in this executor, available functions: [{}]",
                    function_name,
                    self.inner.registry.names().join(", ")
                )),
            });
        };

        info!(
            namespace = function_ref.namespace.as_deref().unwrap_or_default(),
            application = function_ref.application_name.as_deref().unwrap_or_default(),
            application_version = function_ref.application_version.as_deref().unwrap_or_default(),
            function_name = %function_name,
            application_code_size = package.len(),
            "initialized function executor"
        );
        *environment = Some(RunnerEnvironment {
            function_ref,
            function,
            blob_store: self.inner.blob_store.clone(),
            download_policy: self.inner.download_policy,
        });
        Ok(InitializeResponse {
            outcome_code: Some(InitializationOutcomeCode::Success as i32),
            failure_reason: None,
            diagnostics: None,
        })
    }

    pub async fn is_initialized(&self) -> bool {
        self.inner.environment.read().await.is_some()
    }

    pub async fn info(&self) -> InfoResponse {
        InfoResponse {
            version: Some(VERSION.to_string()),
            sdk_version: Some(VERSION.to_string()),
            sdk_language: Some(SDK_LANGUAGE.to_string()),
            sdk_language_version: Some(SDK_LANGUAGE_VERSION.to_string()),
            initialized: Some(self.is_initialized().await),
        }
    }

    pub async fn check_health(&self) -> ServiceResult<HealthCheckResponse> {
        if !self.is_initialized().await {
            return Err(ServiceError::NotInitialized);
        }
        let status = self.inner.health_checker.check().await;
        Ok(HealthCheckResponse {
            healthy: Some(status.healthy),
            status_message: Some(status.message),
        })
    }

    pub async fn list_allocations(&self) -> Vec<AllocationInfo> {
        let allocations = self.inner.allocations.read().await;
        let mut infos: Vec<_> = allocations.values().map(|runner| runner.info().clone()).collect();
        infos.sort_by(|a, b| a.allocation_id.cmp(&b.allocation_id));
        infos
    }

    /// Starts `allocation`. Reusing an allocation id is a conflict and
    /// never runs the function twice.
    pub async fn create_allocation(&self, allocation: Allocation) -> ServiceResult<Arc<AllocationRunner>> {
        let environment = self
            .inner
            .environment
            .read()
            .await
            .clone()
            .ok_or(ServiceError::NotInitialized)?;
        validate_allocation(&allocation).map_err(|e| ServiceError::InvalidArgument(e.to_string()))?;
        let allocation_id = allocation.allocation_id.clone().unwrap_or_default();

        let mut allocations = self.inner.allocations.write().await;
        if allocations.contains_key(&allocation_id) {
            return Err(ServiceError::AlreadyExists(format!(
                "allocation {} already exists",
                allocation_id
            )));
        }
        let runner = Arc::new(AllocationRunner::start(allocation, environment).map_err(ServiceError::Internal)?);
        allocations.insert(allocation_id, runner.clone());
        Ok(runner)
    }

    pub async fn runner(&self, allocation_id: &str) -> ServiceResult<Arc<AllocationRunner>> {
        self.inner
            .allocations
            .read()
            .await
            .get(allocation_id)
            .cloned()
            .ok_or_else(|| ServiceError::NotFound(format!("allocation {} not found", allocation_id)))
    }

    pub async fn send_allocation_update(&self, update: AllocationUpdate) -> ServiceResult<()> {
        let allocation_id = required(&update.allocation_id, "allocation_id")?.to_string();
        let runner = self.runner(&allocation_id).await?;
        if runner.finished() {
            return Err(ServiceError::FailedPrecondition(format!(
                "allocation {} already finished",
                allocation_id
            )));
        }
        runner
            .deliver_update(update)
            .map_err(|e| ServiceError::InvalidArgument(e.to_string()))
    }

    /// Forgets a finished allocation.
    pub async fn delete_allocation(&self, allocation_id: &str) -> ServiceResult<()> {
        let mut allocations = self.inner.allocations.write().await;
        let runner = allocations
            .get(allocation_id)
            .ok_or_else(|| ServiceError::NotFound(format!("allocation {} not found", allocation_id)))?;
        if !runner.finished() {
            return Err(ServiceError::FailedPrecondition(format!(
                "allocation {} is still running",
                allocation_id
            )));
        }
        allocations.remove(allocation_id);
        info!(allocation_id, "deleted allocation");
        Ok(())
    }

    /// Opens a new session, or resumes `session_id` if it is known.
    pub async fn open_session(&self, session_id: Option<String>) -> OpenedSession {
        let session_id = session_id
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        let mut sessions = self.inner.sessions.write().await;
        let (resumed, allocation_ids) = match sessions.get(&session_id) {
            Some(ids) => (true, ids.clone()),
            None => {
                sessions.insert(session_id.clone(), Vec::new());
                (false, Vec::new())
            }
        };
        drop(sessions);

        let allocations = self.inner.allocations.read().await;
        let runners = allocation_ids
            .iter()
            .filter_map(|id| allocations.get(id).cloned())
            .collect();
        info!(session_id = %session_id, resumed, "opened session");
        OpenedSession {
            session_id,
            resumed,
            allocations: runners,
        }
    }

    pub async fn add_session_allocation(&self, session_id: &str, allocation_id: &str) {
        if let Some(ids) = self.inner.sessions.write().await.get_mut(session_id) {
            ids.push(allocation_id.to_string());
        }
    }

    pub async fn close_session(&self, session_id: &str) {
        if self.inner.sessions.write().await.remove(session_id).is_some() {
            info!(session_id, "closed session");
        }
    }
}
