//! gRPC transport of the `FunctionExecutor` service.

use std::{net::SocketAddr, pin::Pin, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use proto_api::{
    function_executor_pb::{
        function_executor_server::{FunctionExecutor, FunctionExecutorServer},
        session_client_message,
        session_server_message,
        AllocationCompleted,
        AllocationState,
        AllocationUpdate,
        CreateAllocationRequest,
        CreateAllocationResponse,
        DeleteAllocationRequest,
        DeleteAllocationResponse,
        HealthCheckRequest,
        HealthCheckResponse,
        InfoRequest,
        InfoResponse,
        InitializeRequest,
        InitializeResponse,
        ListAllocationsRequest,
        ListAllocationsResponse,
        OpenSessionResponse,
        SendAllocationUpdateResponse,
        SessionClientMessage,
        SessionServerMessage,
        WatchAllocationStateRequest,
    },
    google_rpc,
};
use tokio::{net::TcpListener, sync::mpsc};
use tokio_stream::{
    wrappers::{ReceiverStream, TcpListenerStream},
    Stream,
};
use tokio_util::sync::CancellationToken;
use tonic::{Request, Response, Status, Streaming};
use tracing::{debug, info, warn};

use crate::{
    allocation_runner::AllocationRunner,
    service::{FunctionExecutorService, ServiceError},
};

/// Upper bound of one wait for an allocation state change. Watchers wake
/// up at least this often to notice cancellation.
const WATCH_POLL_TIMEOUT: Duration = Duration::from_secs(5);
const SESSION_CHANNEL_CAPACITY: usize = 64;

type ResponseStream<T> = Pin<Box<dyn Stream<Item = Result<T, Status>> + Send + 'static>>;

fn required_id(value: Option<String>) -> Result<String, Status> {
    value
        .filter(|id| !id.is_empty())
        .ok_or_else(|| Status::invalid_argument("allocation_id is required"))
}

pub struct FunctionExecutorGrpcService {
    service: FunctionExecutorService,
    cancel_token: CancellationToken,
}

impl FunctionExecutorGrpcService {
    pub fn new(service: FunctionExecutorService, cancel_token: CancellationToken) -> Self {
        Self {
            service,
            cancel_token,
        }
    }
}

#[tonic::async_trait]
impl FunctionExecutor for FunctionExecutorGrpcService {
    type WatchAllocationStateStream = ResponseStream<AllocationState>;
    type OpenSessionStream = ResponseStream<SessionServerMessage>;

    async fn initialize(
        &self,
        request: Request<InitializeRequest>,
    ) -> Result<Response<InitializeResponse>, Status> {
        let response = self.service.initialize(request.into_inner()).await?;
        Ok(Response::new(response))
    }

    async fn get_info(&self, _request: Request<InfoRequest>) -> Result<Response<InfoResponse>, Status> {
        Ok(Response::new(self.service.info().await))
    }

    async fn check_health(
        &self,
        _request: Request<HealthCheckRequest>,
    ) -> Result<Response<HealthCheckResponse>, Status> {
        Ok(Response::new(self.service.check_health().await?))
    }

    async fn list_allocations(
        &self,
        _request: Request<ListAllocationsRequest>,
    ) -> Result<Response<ListAllocationsResponse>, Status> {
        Ok(Response::new(ListAllocationsResponse {
            allocations: self.service.list_allocations().await,
        }))
    }

    async fn create_allocation(
        &self,
        request: Request<CreateAllocationRequest>,
    ) -> Result<Response<CreateAllocationResponse>, Status> {
        let allocation = request
            .into_inner()
            .allocation
            .ok_or_else(|| Status::invalid_argument("allocation is required"))?;
        self.service.create_allocation(allocation).await?;
        Ok(Response::new(CreateAllocationResponse {}))
    }

    async fn watch_allocation_state(
        &self,
        request: Request<WatchAllocationStateRequest>,
    ) -> Result<Response<Self::WatchAllocationStateStream>, Status> {
        let allocation_id = required_id(request.into_inner().allocation_id)?;
        let runner = self.service.runner(&allocation_id).await?;
        let cancel_token = self.cancel_token.clone();

        let stream = async_stream::stream! {
            let mut last_hash: Option<String> = None;
            loop {
                let state = tokio::select! {
                    _ = cancel_token.cancelled() => break,
                    state = runner.wait_for_update(last_hash.as_deref(), WATCH_POLL_TIMEOUT) => state,
                };
                if state.sha256_hash == last_hash {
                    continue;
                }
                last_hash = state.sha256_hash.clone();
                let finished = state.result.is_some();
                yield Ok::<_, Status>(state);
                if finished {
                    break;
                }
            }
        };
        Ok(Response::new(Box::pin(stream)))
    }

    async fn send_allocation_update(
        &self,
        request: Request<AllocationUpdate>,
    ) -> Result<Response<SendAllocationUpdateResponse>, Status> {
        self.service.send_allocation_update(request.into_inner()).await?;
        Ok(Response::new(SendAllocationUpdateResponse {}))
    }

    async fn delete_allocation(
        &self,
        request: Request<DeleteAllocationRequest>,
    ) -> Result<Response<DeleteAllocationResponse>, Status> {
        let allocation_id = required_id(request.into_inner().allocation_id)?;
        self.service.delete_allocation(&allocation_id).await?;
        Ok(Response::new(DeleteAllocationResponse {}))
    }

    async fn open_session(
        &self,
        request: Request<Streaming<SessionClientMessage>>,
    ) -> Result<Response<Self::OpenSessionStream>, Status> {
        let inbound = request.into_inner();
        let (tx, rx) = mpsc::channel(SESSION_CHANNEL_CAPACITY);
        let session = Session {
            service: self.service.clone(),
            tx,
            cancel_token: self.cancel_token.child_token(),
            session_id: None,
        };
        tokio::spawn(session.run(inbound));
        Ok(Response::new(Box::pin(ReceiverStream::new(rx))))
    }
}

type SessionSender = mpsc::Sender<Result<SessionServerMessage, Status>>;

/// One bidirectional session stream.
///
/// Every allocation created or resumed in the session gets a watcher task
/// that forwards its state changes and finally its result.
struct Session {
    service: FunctionExecutorService,
    tx: SessionSender,
    cancel_token: CancellationToken,
    session_id: Option<String>,
}

fn server_message(message: session_server_message::Message) -> Result<SessionServerMessage, Status> {
    Ok(SessionServerMessage {
        message: Some(message),
    })
}

fn error_message(err: ServiceError) -> session_server_message::Message {
    let status = Status::from(err);
    session_server_message::Message::Error(google_rpc::Status {
        code: status.code() as i32,
        message: status.message().to_string(),
    })
}

impl Session {
    async fn run(mut self, mut inbound: Streaming<SessionClientMessage>) {
        loop {
            let message = tokio::select! {
                _ = self.cancel_token.cancelled() => break,
                message = inbound.message() => message,
            };
            match message {
                Ok(Some(message)) => {
                    if !self.handle(message).await {
                        break;
                    }
                }
                Ok(None) => break,
                Err(status) => {
                    warn!(session_id = ?self.session_id, error = %status, "session stream failed");
                    break;
                }
            }
        }
        debug!(session_id = ?self.session_id, "session ended");
        self.cancel_token.cancel();
    }

    async fn send(&self, message: session_server_message::Message) -> bool {
        self.tx.send(server_message(message)).await.is_ok()
    }

    /// Returns false once the session is over.
    async fn handle(&mut self, message: SessionClientMessage) -> bool {
        use session_client_message::Message;
        use session_server_message::Message as Reply;

        let Some(message) = message.message else {
            return self
                .send(error_message(ServiceError::InvalidArgument(
                    "empty session message".to_string(),
                )))
                .await;
        };

        match message {
            Message::OpenSession(request) => {
                if self.session_id.is_some() {
                    return self
                        .send(error_message(ServiceError::FailedPrecondition(
                            "session is already open".to_string(),
                        )))
                        .await;
                }
                let opened = self.service.open_session(request.session_id).await;
                self.session_id = Some(opened.session_id.clone());
                let sent = self
                    .send(Reply::OpenSession(OpenSessionResponse {
                        status: Some(google_rpc::Status::ok()),
                        session_id: Some(opened.session_id),
                        resumed: Some(opened.resumed),
                    }))
                    .await;
                for runner in opened.allocations {
                    self.watch(runner);
                }
                sent
            }
            Message::CreateAllocation(request) => {
                let Some(session_id) = self.session_id.clone() else {
                    return self
                        .send(error_message(ServiceError::FailedPrecondition(
                            "open the session before creating allocations".to_string(),
                        )))
                        .await;
                };
                let Some(allocation) = request.allocation else {
                    return self
                        .send(error_message(ServiceError::InvalidArgument(
                            "allocation is required".to_string(),
                        )))
                        .await;
                };
                match self.service.create_allocation(allocation).await {
                    Ok(runner) => {
                        self.service
                            .add_session_allocation(&session_id, runner.allocation_id())
                            .await;
                        self.watch(runner);
                        true
                    }
                    Err(err) => self.send(error_message(err)).await,
                }
            }
            Message::AllocationUpdate(update) => match self.service.send_allocation_update(update).await {
                Ok(()) => true,
                Err(err) => self.send(error_message(err)).await,
            },
            Message::HealthCheck(_) => match self.service.check_health().await {
                Ok(response) => self.send(Reply::HealthCheck(response)).await,
                Err(err) => self.send(error_message(err)).await,
            },
            Message::LeaveSession(request) => {
                if request.close.unwrap_or(false) {
                    if let Some(session_id) = self.session_id.as_deref() {
                        self.service.close_session(session_id).await;
                    }
                }
                false
            }
        }
    }

    fn watch(&self, runner: Arc<AllocationRunner>) {
        let tx = self.tx.clone();
        let cancel_token = self.cancel_token.clone();
        tokio::spawn(async move {
            let mut last_hash: Option<String> = None;
            loop {
                let state = tokio::select! {
                    _ = cancel_token.cancelled() => return,
                    state = runner.wait_for_update(last_hash.as_deref(), WATCH_POLL_TIMEOUT) => state,
                };
                if state.sha256_hash == last_hash {
                    continue;
                }
                last_hash = state.sha256_hash.clone();
                let result = state.result.clone();
                let sent = tx
                    .send(server_message(session_server_message::Message::AllocationState(state)))
                    .await;
                if sent.is_err() {
                    return;
                }
                if let Some(result) = result {
                    let _ = tx
                        .send(server_message(
                            session_server_message::Message::AllocationCompleted(AllocationCompleted {
                                allocation_id: Some(runner.allocation_id().to_string()),
                                result: Some(result),
                            }),
                        ))
                        .await;
                    return;
                }
            }
        });
    }
}

/// Serves the gRPC API on `addr` until `cancel_token` fires.
pub async fn run_server(
    addr: SocketAddr,
    service: FunctionExecutorService,
    cancel_token: CancellationToken,
) -> Result<()> {
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind gRPC server to {}", addr))?;
    run_server_with_listener(listener, service, cancel_token).await
}

pub async fn run_server_with_listener(
    listener: TcpListener,
    service: FunctionExecutorService,
    cancel_token: CancellationToken,
) -> Result<()> {
    let addr = listener.local_addr().context("Failed to read gRPC listen address")?;
    info!(addr = %addr, "gRPC server listening");

    let server = FunctionExecutorServer::new(FunctionExecutorGrpcService::new(
        service,
        cancel_token.clone(),
    ));
    tonic::transport::Server::builder()
        .add_service(server)
        .serve_with_incoming_shutdown(TcpListenerStream::new(listener), async move {
            cancel_token.cancelled().await;
            info!("gRPC server shutting down");
        })
        .await
        .context("gRPC server error")?;

    Ok(())
}
