//! Control-plane side of the executor's gRPC API.
//!
//! Health checking probes through it, and the integration tests use it to
//! drive allocations the way a control plane does. RPC failures keep the
//! `tonic::Status` at the root of the error chain.

use std::time::Duration;

use anyhow::{Context, Result};
use proto_api::function_executor_pb::{
    function_executor_client::FunctionExecutorClient,
    Allocation,
    AllocationInfo,
    AllocationState,
    AllocationUpdate,
    CreateAllocationRequest,
    DeleteAllocationRequest,
    HealthCheckRequest,
    HealthCheckResponse,
    InfoRequest,
    InfoResponse,
    InitializeRequest,
    InitializeResponse,
    ListAllocationsRequest,
    SessionClientMessage,
    SessionServerMessage,
    WatchAllocationStateRequest,
};
use tokio_stream::Stream;
use tonic::{
    transport::{Channel, Endpoint},
    Response,
    Status,
    Streaming,
};
use tracing::debug;

const ATTEMPT_TIMEOUT: Duration = Duration::from_secs(1);
const RECONNECT_DELAY: Duration = Duration::from_millis(100);

#[derive(Clone)]
pub struct FunctionExecutorGrpcClient {
    addr: String,
    inner: FunctionExecutorClient<Channel>,
}

impl FunctionExecutorGrpcClient {
    /// Connects to the executor listening on `addr` ("host:port"). A freshly
    /// spawned executor may not be listening yet, so failed attempts are
    /// repeated until `timeout` runs out.
    pub async fn connect(addr: &str, timeout: Duration) -> Result<Self> {
        let endpoint = Endpoint::from_shared(format!("http://{}", addr))
            .with_context(|| format!("invalid executor address {}", addr))?
            .connect_timeout(ATTEMPT_TIMEOUT);

        let deadline = tokio::time::Instant::now() + timeout;
        let mut attempts = 0u32;
        let channel = loop {
            attempts += 1;
            let last_error = match endpoint.connect().await {
                Ok(channel) => break channel,
                Err(e) => e,
            };
            if tokio::time::Instant::now() + RECONNECT_DELAY >= deadline {
                return Err(last_error).with_context(|| {
                    format!(
                        "executor at {} is unreachable after {} attempts in {:?}",
                        addr, attempts, timeout
                    )
                });
            }
            debug!(addr, attempts, error = %last_error, "executor not reachable yet");
            tokio::time::sleep(RECONNECT_DELAY).await;
        };

        Ok(Self {
            addr: addr.to_string(),
            inner: FunctionExecutorClient::new(channel),
        })
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    fn reply<T>(&self, method: &str, response: Result<Response<T>, Status>) -> Result<T> {
        response
            .map(Response::into_inner)
            .map_err(anyhow::Error::new)
            .with_context(|| format!("{} on executor {}", method, self.addr))
    }

    /// Loads the function. The outcome code tells whether it succeeded.
    pub async fn initialize(&mut self, request: InitializeRequest) -> Result<InitializeResponse> {
        let response = self.inner.initialize(request).await;
        self.reply("Initialize", response)
    }

    pub async fn info(&mut self) -> Result<InfoResponse> {
        let response = self.inner.get_info(InfoRequest {}).await;
        self.reply("GetInfo", response)
    }

    pub async fn check_health(&mut self) -> Result<HealthCheckResponse> {
        let response = self.inner.check_health(HealthCheckRequest {}).await;
        self.reply("CheckHealth", response)
    }

    pub async fn allocations(&mut self) -> Result<Vec<AllocationInfo>> {
        let response = self.inner.list_allocations(ListAllocationsRequest {}).await;
        Ok(self.reply("ListAllocations", response)?.allocations)
    }

    pub async fn create_allocation(&mut self, allocation: Allocation) -> Result<()> {
        let request = CreateAllocationRequest {
            allocation: Some(allocation),
        };
        let response = self.inner.create_allocation(request).await;
        self.reply("CreateAllocation", response)?;
        Ok(())
    }

    /// State changes of one allocation. The stream ends after its terminal
    /// state.
    pub async fn watch(&mut self, allocation_id: &str) -> Result<Streaming<AllocationState>> {
        let request = WatchAllocationStateRequest {
            allocation_id: Some(allocation_id.to_string()),
        };
        let response = self.inner.watch_allocation_state(request).await;
        self.reply("WatchAllocationState", response)
    }

    /// Answers an output blob request of a running allocation.
    pub async fn deliver_update(&mut self, update: AllocationUpdate) -> Result<()> {
        let response = self.inner.send_allocation_update(update).await;
        self.reply("SendAllocationUpdate", response)?;
        Ok(())
    }

    /// Forgets a finished allocation.
    pub async fn delete_allocation(&mut self, allocation_id: &str) -> Result<()> {
        let request = DeleteAllocationRequest {
            allocation_id: Some(allocation_id.to_string()),
        };
        let response = self.inner.delete_allocation(request).await;
        self.reply("DeleteAllocation", response)?;
        Ok(())
    }

    pub async fn open_session<S>(&mut self, outbound: S) -> Result<Streaming<SessionServerMessage>>
    where
        S: Stream<Item = SessionClientMessage> + Send + 'static,
    {
        let response = self.inner.open_session(outbound).await;
        self.reply("OpenSession", response)
    }
}
