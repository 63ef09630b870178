//! Runs one allocation end to end.
//!
//! The function executes on a dedicated OS thread so a hung or crashing
//! function never blocks the transports that serve health checks. Progress
//! is published through [`AllocationStateWrapper`]; the control plane reads
//! it by polling or streaming and answers output blob requests through
//! [`AllocationRunner::deliver_update`].

mod result;
mod state;
mod validation;

use std::{
    collections::HashMap,
    panic::{self, AssertUnwindSafe},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use anyhow::{anyhow, bail, Context, Result};
use blob_store::{BlobError, BlobStore};
use proto_api::function_executor_pb::{
    allocation_update,
    Allocation,
    AllocationInfo,
    AllocationOutputBlob,
    AllocationPhase,
    AllocationResult,
    AllocationState,
    AllocationUpdate,
    Blob,
    FunctionInputs,
    FunctionRef,
};
pub use state::AllocationStateWrapper;
use tokio::{runtime::Handle, sync::oneshot};
use tracing::{debug, error, info, warn};
pub use validation::validate_allocation;

use crate::{
    function::{
        reconstruct_args,
        AllocationError,
        FunctionContext,
        FunctionHandler,
        FunctionOutput,
    },
    future_graph::{ExecutionPlan, ExecutionPlanBuilder, FutureRef, GraphError},
    retry::{retry_with_backoff, Backoff},
    serialization::{download_serialized_object, SerializedObjectWriter, Value},
};

/// Retry policy for argument downloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DownloadPolicy {
    pub max_retries: u32,
    pub backoff: Backoff,
}

impl Default for DownloadPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff: Backoff::Exponential {
                initial: Duration::from_millis(100),
                max: Duration::from_secs(2),
            },
        }
    }
}

/// Everything an allocation needs from the initialized executor.
#[derive(Clone)]
pub struct RunnerEnvironment {
    pub function_ref: FunctionRef,
    pub function: FunctionHandler,
    pub blob_store: BlobStore,
    pub download_policy: DownloadPolicy,
}

type PendingBlobRequests = Arc<Mutex<HashMap<String, oneshot::Sender<AllocationOutputBlob>>>>;

fn lock_requests(
    requests: &Mutex<HashMap<String, oneshot::Sender<AllocationOutputBlob>>>,
) -> MutexGuard<'_, HashMap<String, oneshot::Sender<AllocationOutputBlob>>> {
    requests.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct AllocationRunner {
    info: AllocationInfo,
    state: Arc<AllocationStateWrapper>,
    blob_requests: PendingBlobRequests,
}

impl AllocationRunner {
    /// Starts running `allocation` on its own thread. The allocation must
    /// have passed [`validate_allocation`]. Must be called from within a
    /// tokio runtime; the allocation thread does its blob I/O on it.
    pub fn start(allocation: Allocation, env: RunnerEnvironment) -> Result<Self> {
        let runtime = Handle::try_current()
            .context("starting an allocation outside of a tokio runtime")?;
        let allocation_id = allocation.allocation_id.clone().unwrap_or_default();
        let info = AllocationInfo {
            allocation_id: allocation.allocation_id.clone(),
            request_id: allocation.request_id.clone(),
            function_call_id: allocation.function_call_id.clone(),
        };
        let state = Arc::new(AllocationStateWrapper::new(&allocation_id));
        let blob_requests: PendingBlobRequests = Arc::new(Mutex::new(HashMap::new()));

        let execution = Execution {
            allocation,
            env,
            runtime,
            state: state.clone(),
            blob_requests: blob_requests.clone(),
        };
        std::thread::Builder::new()
            .name(format!("allocation-{}", allocation_id))
            .spawn(move || execution.run())
            .context("spawning allocation thread")?;

        Ok(Self {
            info,
            state,
            blob_requests,
        })
    }

    pub fn info(&self) -> &AllocationInfo {
        &self.info
    }

    pub fn allocation_id(&self) -> &str {
        self.info.allocation_id.as_deref().unwrap_or_default()
    }

    pub fn state(&self) -> AllocationState {
        self.state.snapshot()
    }

    pub fn finished(&self) -> bool {
        self.state.has_result()
    }

    pub async fn wait_for_update(
        &self,
        last_seen_hash: Option<&str>,
        timeout: Duration,
    ) -> AllocationState {
        self.state.wait_for_update(last_seen_hash, timeout).await
    }

    /// Hands an output blob to the request waiting for it. Blobs for
    /// unknown requests are logged and dropped.
    pub fn deliver_update(&self, update: AllocationUpdate) -> Result<()> {
        let Some(allocation_update::Update::OutputBlob(output_blob)) = update.update else {
            bail!("allocation update carries no output blob");
        };

        let blob_id = output_blob.blob.as_ref().and_then(|blob| blob.id.clone());
        let mut requests = lock_requests(&self.blob_requests);
        let sender = match blob_id {
            Some(id) => requests.remove(&id).map(|sender| (id, sender)),
            // A failure status may come without a blob; it answers the only
            // outstanding request.
            None if requests.len() == 1 => requests.drain().next(),
            None => None,
        };
        drop(requests);

        match sender {
            Some((id, sender)) => {
                debug!(allocation_id = self.allocation_id(), blob_id = %id, "delivering output blob");
                if sender.send(output_blob).is_err() {
                    warn!(allocation_id = self.allocation_id(), blob_id = %id, "output blob request is gone");
                }
            }
            None => {
                warn!(
                    allocation_id = self.allocation_id(),
                    "ignoring output blob for an unknown request"
                );
            }
        }
        Ok(())
    }
}

/// The part of a runner that lives on the allocation thread.
struct Execution {
    allocation: Allocation,
    env: RunnerEnvironment,
    runtime: Handle,
    state: Arc<AllocationStateWrapper>,
    blob_requests: PendingBlobRequests,
}

impl Execution {
    fn allocation_id(&self) -> &str {
        self.allocation.allocation_id.as_deref().unwrap_or_default()
    }

    fn function_call_id(&self) -> &str {
        self.allocation.function_call_id.as_deref().unwrap_or_default()
    }

    fn inputs(&self) -> Result<&FunctionInputs> {
        self.allocation
            .inputs
            .as_ref()
            .ok_or_else(|| anyhow!("allocation has no inputs"))
    }

    fn run(self) {
        info!(
            allocation_id = self.allocation_id(),
            request_id = self.allocation.request_id.as_deref().unwrap_or_default(),
            function_call_id = self.function_call_id(),
            "running allocation"
        );
        let result = match panic::catch_unwind(AssertUnwindSafe(|| self.execute())) {
            Ok(Ok(result)) => result,
            Ok(Err(err)) => {
                error!(
                    allocation_id = self.allocation_id(),
                    error = %format!("{:#}", err),
                    "allocation failed with internal error"
                );
                result::internal_error()
            }
            Err(payload) => {
                error!(
                    allocation_id = self.allocation_id(),
                    panic = %panic_message(payload),
                    "allocation runner panicked"
                );
                result::internal_error()
            }
        };
        info!(
            allocation_id = self.allocation_id(),
            outcome_code = ?result.outcome_code(),
            failure_reason = ?result.failure_reason(),
            "allocation finished"
        );
        self.state.set_result(result);
    }

    fn execute(&self) -> Result<AllocationResult> {
        self.state.set_phase(AllocationPhase::FetchingInputs);
        let inputs = self.download_inputs()?;
        let args = reconstruct_args(
            self.inputs()?.function_call_metadata.as_deref(),
            inputs,
        )
        .context("reconstructing function arguments")?;

        self.state.set_phase(AllocationPhase::Executing);
        let progress_state = self.state.clone();
        let ctx = FunctionContext::new(
            self.allocation.request_id.as_deref().unwrap_or_default(),
            self.allocation_id(),
            self.function_call_id(),
        )
        .with_progress(move |current, total| progress_state.update_progress(current, total));

        let function = self.env.function.clone();
        let output = panic::catch_unwind(AssertUnwindSafe(|| function(&ctx, args)))
            .unwrap_or_else(|payload| {
                Err(AllocationError::function(format!(
                    "function panicked: {}",
                    panic_message(payload)
                )))
            });

        match output {
            Ok(FunctionOutput::Value(value)) => self.upload_value(&value),
            Ok(FunctionOutput::PendingCall(future)) => self.upload_plan(&ctx, &future),
            Err(AllocationError::RequestError(message)) => self.upload_request_error(&ctx, message),
            Err(AllocationError::FunctionError(message)) => Ok(function_error(&ctx, &message)),
        }
    }

    fn download_inputs(&self) -> Result<Vec<Value>> {
        let inputs = self.inputs()?;
        let policy = self.env.download_policy;
        inputs
            .args
            .iter()
            .zip(inputs.arg_blobs.iter())
            .enumerate()
            .map(|(index, (arg, blob))| {
                let description = format!("downloading argument {}", index);
                let decoded = retry_with_backoff(
                    policy.max_retries,
                    policy.backoff,
                    &description,
                    || {
                        self.runtime
                            .block_on(download_serialized_object(&self.env.blob_store, blob, arg))
                    },
                    |err: &anyhow::Error| {
                        err.downcast_ref::<BlobError>()
                            .is_some_and(BlobError::is_retryable)
                    },
                )
                .with_context(|| format!("argument {} of allocation", index))?;
                Ok(decoded.value)
            })
            .collect()
    }

    fn upload_value(&self, value: &Value) -> Result<AllocationResult> {
        let mut writer = SerializedObjectWriter::new();
        let object = writer.add(value).context("serializing function output")?;
        let uploaded = self.upload_outputs(writer)?;
        Ok(result::success_value(object, uploaded))
    }

    fn upload_plan(&self, ctx: &FunctionContext, future: &FutureRef) -> Result<AllocationResult> {
        let builder = ExecutionPlanBuilder::new(self.env.function_ref.clone(), self.function_call_id());
        match builder.build(future) {
            Ok(ExecutionPlan::Value(value)) => self.upload_value(&value),
            Ok(ExecutionPlan::Updates { updates, outputs }) => {
                let uploaded = if outputs.is_empty() {
                    None
                } else {
                    Some(self.upload_outputs(outputs)?)
                };
                Ok(result::success_updates(updates, uploaded))
            }
            Err(err) => match err.downcast_ref::<GraphError>() {
                Some(graph_error) if graph_error.is_user_error() => {
                    Ok(function_error(ctx, &graph_error.to_string()))
                }
                _ => Err(err.context("building execution plan")),
            },
        }
    }

    fn upload_request_error(&self, ctx: &FunctionContext, message: String) -> Result<AllocationResult> {
        let blob = self
            .inputs()?
            .request_error_blob
            .as_ref()
            .ok_or_else(|| anyhow!("allocation has no request error blob"))?;
        let mut writer = SerializedObjectWriter::new();
        let object = writer
            .add(&Value::Text(message))
            .context("serializing request error")?;
        let uploaded = self
            .runtime
            .block_on(self.env.blob_store.put(blob, &writer.into_buffers()))
            .context("uploading request error")?;
        Ok(result::request_error(
            object,
            uploaded,
            ctx.stdout().contents(),
            ctx.stderr().contents(),
        ))
    }

    fn upload_outputs(&self, writer: SerializedObjectWriter) -> Result<Blob> {
        let blob = self.request_output_blob(writer.size())?;
        self.runtime
            .block_on(self.env.blob_store.put(&blob, &writer.into_buffers()))
            .context("uploading function outputs")
    }

    /// Asks the control plane for a blob of at least `size` bytes and blocks
    /// until it arrives.
    fn request_output_blob(&self, size: u64) -> Result<Blob> {
        let id = nanoid::nanoid!();
        let (tx, rx) = oneshot::channel();
        lock_requests(&self.blob_requests).insert(id.clone(), tx);
        self.state.add_output_blob_request(&id, size);
        debug!(allocation_id = self.allocation_id(), blob_id = %id, size, "requested output blob");

        let received = rx.blocking_recv();
        self.state.remove_output_blob_request(&id);
        lock_requests(&self.blob_requests).remove(&id);

        let output_blob = received.map_err(|_| anyhow!("output blob request {} was abandoned", id))?;
        if let Some(status) = output_blob.status.as_ref() {
            if !status.is_ok() {
                bail!(
                    "output blob request {} failed with code {}: {}",
                    id,
                    status.code,
                    status.message
                );
            }
        }
        output_blob
            .blob
            .ok_or_else(|| anyhow!("output blob request {} was answered without a blob", id))
    }
}

fn function_error(ctx: &FunctionContext, message: &str) -> AllocationResult {
    use std::io::Write;

    let mut stderr = ctx.stderr();
    let _ = writeln!(stderr, "{}", message);
    result::function_error(ctx.stdout().contents(), stderr.contents())
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic payload".to_string())
}
