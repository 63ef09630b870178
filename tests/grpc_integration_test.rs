//! Integration tests for the gRPC surface.
//!
//! Every test runs the real tonic server on an ephemeral port, connects to
//! it with `FunctionExecutorGrpcClient` and drives allocations the way a
//! control plane does: initialize, create, watch, answer output blob
//! requests, collect the result.

mod common;

use std::time::Duration;

use anyhow::Result;
use common::{
    allocation,
    blob_store,
    function_inputs,
    initialize_request,
    output_blob_update,
    service,
    TestServer,
};
use function_executor::{
    fe_client::FunctionExecutorGrpcClient,
    function::{AllocationError, FunctionCallMetadata, FunctionRegistry},
    future_graph::{Argument, Future},
    serialization::{download_serialized_object, Value},
};
use proto_api::function_executor_pb::{
    allocation_result::Outputs,
    execution_plan_update::Op,
    function_arg::Source,
    session_client_message,
    session_server_message,
    AllocationFailureReason,
    AllocationOutcomeCode,
    AllocationPhase,
    AllocationResult,
    AllocationState,
    CreateAllocationRequest,
    ExecutionPlanUpdates,
    HealthCheckRequest,
    InitializationOutcomeCode,
    LeaveSessionRequest,
    ListOperationKind,
    OpenSessionRequest,
    SessionClientMessage,
    SessionServerMessage,
};
use serde_json::json;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::Streaming;

const STREAM_TIMEOUT: Duration = Duration::from_secs(10);

fn registry() -> FunctionRegistry {
    let mut registry = FunctionRegistry::new();
    registry
        .register("echo", |_, args| Ok(args.arg(0)?.clone().into()))
        .register("describe", |_, args| Ok(json!(describe(args.arg(0)?)).into()))
        .register("concat", |_, args| {
            Ok(json!(format!("{}{}", describe(args.arg(0)?), describe(args.arg(1)?))).into())
        })
        .register("pipeline", |_, args| {
            let a = args
                .kwarg("a")
                .cloned()
                .ok_or_else(|| AllocationError::request("missing argument a"))?;
            let b = args
                .kwarg("b")
                .cloned()
                .ok_or_else(|| AllocationError::request("missing argument b"))?;
            let items: Vec<Argument> = vec![a.clone().into(), b.into(), a.into()];
            let described = Future::map("describe", items);
            Ok(Future::reduce("concat", described, Some(json!(0).into())).into())
        });
    registry
}

fn describe(value: &Value) -> String {
    match value {
        Value::Data(data) => data.to_string(),
        Value::Text(text) => text.clone(),
        Value::File(_) => "<file>".to_string(),
    }
}

fn pipeline_metadata() -> FunctionCallMetadata {
    FunctionCallMetadata::FunctionCall {
        positional_args: 0,
        kwarg_names: vec!["a".to_string(), "b".to_string()],
    }
}

async fn next_state(stream: &mut Streaming<AllocationState>) -> Result<AllocationState> {
    match tokio::time::timeout(STREAM_TIMEOUT, stream.message()).await {
        Ok(Ok(Some(state))) => Ok(state),
        Ok(Ok(None)) => anyhow::bail!("Stream closed"),
        Ok(Err(e)) => anyhow::bail!("Stream error: {}", e),
        Err(_) => anyhow::bail!("Timeout waiting for allocation state"),
    }
}

/// Watches `allocation_id` to completion, answering every output blob
/// request. Returns the result and the number of answered requests.
async fn run_to_completion(
    client: &mut FunctionExecutorGrpcClient,
    allocation_id: &str,
    blob_dir: &std::path::Path,
) -> Result<(AllocationResult, usize)> {
    let mut stream = client.watch(allocation_id).await?;
    let mut answered = Vec::new();
    loop {
        let state = next_state(&mut stream).await?;
        for request in state.output_blob_requests.iter() {
            let id = request.id.clone().unwrap_or_default();
            if answered.contains(&id) {
                continue;
            }
            client
                .deliver_update(output_blob_update(allocation_id, request, blob_dir))
                .await?;
            answered.push(id);
        }
        if let Some(result) = state.result.clone() {
            assert!(matches!(
                state.phase(),
                AllocationPhase::CompleteSuccess | AllocationPhase::CompleteFailure
            ));
            // The stream ends after the terminal state.
            assert!(next_state(&mut stream).await.is_err());
            return Ok((result, answered.len()));
        }
    }
}

async fn initialized_client(server: &TestServer, function_name: &str) -> FunctionExecutorGrpcClient {
    let mut client =
        FunctionExecutorGrpcClient::connect(&server.addr.to_string(), Duration::from_secs(5))
            .await
            .unwrap();
    let response = client.initialize(initialize_request(function_name)).await.unwrap();
    assert_eq!(response.outcome_code(), InitializationOutcomeCode::Success);
    client
}

fn plan_updates(result: AllocationResult) -> ExecutionPlanUpdates {
    assert_eq!(result.outcome_code(), AllocationOutcomeCode::Success);
    match result.outputs {
        Some(Outputs::Updates(updates)) => updates,
        other => panic!("expected execution plan updates, got {:?}", other.is_some()),
    }
}

/// Runs the map-reduce pipeline against a fresh executor and returns its
/// plan updates plus the uploaded outputs blob result.
async fn run_pipeline(function_call_id: &str) -> (AllocationResult, usize) {
    let blob_dir = tempfile::tempdir().unwrap();
    let server = TestServer::grpc(service(registry())).await;
    let mut client = initialized_client(&server, "pipeline").await;

    let inputs = function_inputs(
        blob_dir.path(),
        &[Value::Data(json!(3)), Value::Data(json!("x"))],
        Some(pipeline_metadata()),
    );
    client
        .create_allocation(allocation("alloc-1", function_call_id, inputs))
        .await
        .unwrap();

    let outcome = run_to_completion(&mut client, "alloc-1", blob_dir.path())
        .await
        .unwrap();

    // Keep the uploaded blob readable for the caller's assertions.
    std::mem::forget(blob_dir);
    outcome
}

#[tokio::test]
async fn test_get_info_before_initialize() {
    let server = TestServer::grpc(service(registry())).await;
    let mut client =
        FunctionExecutorGrpcClient::connect(&server.addr.to_string(), Duration::from_secs(5))
            .await
            .unwrap();

    let info = client.info().await.unwrap();
    assert_eq!(info.sdk_language.as_deref(), Some("rust"));
    assert_eq!(info.initialized, Some(false));
    assert!(info.version.is_some());

    // Health probes fail until the executor is initialized.
    let err = client.check_health().await.unwrap_err();
    assert!(format!("{:#}", err).contains("Service not initialized"));
}

#[tokio::test]
async fn test_map_reduce_allocation_end_to_end() {
    let (result, answered) = run_pipeline("call-e2e").await;
    assert_eq!(answered, 1, "exactly one output blob is requested");

    let uploaded = result.uploaded_function_outputs_blob.clone().unwrap();
    let updates = plan_updates(result);
    assert_eq!(updates.updates.len(), 2);

    let Some(Op::List(list)) = &updates.updates[0].op else {
        panic!("expected the map operation first");
    };
    let Some(Op::Reduce(reduce)) = &updates.updates[1].op else {
        panic!("expected the reduce operation second");
    };
    assert_eq!(list.kind(), ListOperationKind::MapOperation);
    assert_eq!(list.items.len(), 3);
    assert_eq!(
        list.function.as_ref().unwrap().function_name.as_deref(),
        Some("describe")
    );
    assert_eq!(
        reduce.reducer.as_ref().unwrap().namespace.as_deref(),
        Some("test-ns")
    );
    assert_eq!(reduce.collection.len(), 2);
    assert_eq!(
        reduce.collection[1].source,
        Some(Source::FunctionCallId(list.id.clone().unwrap()))
    );
    assert_eq!(updates.root_function_call_id, reduce.id);

    // Literals travel in the uploaded outputs blob.
    let Some(Source::Value(initial)) = &reduce.collection[0].source else {
        panic!("expected the initial value to be a literal");
    };
    let decoded = download_serialized_object(&blob_store(), &uploaded, initial)
        .await
        .unwrap();
    assert_eq!(decoded.value, Value::Data(json!(0)));

    let Some(Source::Value(second_item)) = &list.items[1].source else {
        panic!("expected a literal list item");
    };
    let decoded = download_serialized_object(&blob_store(), &uploaded, second_item)
        .await
        .unwrap();
    assert_eq!(decoded.value, Value::Data(json!("x")));
}

#[tokio::test]
async fn test_durable_ids_survive_restart() {
    let (first, _) = run_pipeline("call-replay").await;
    let (second, _) = run_pipeline("call-replay").await;
    let (other, _) = run_pipeline("call-other").await;

    let first = plan_updates(first);
    let second = plan_updates(second);
    let other = plan_updates(other);

    assert_eq!(first.root_function_call_id, second.root_function_call_id);
    for (a, b) in first.updates.iter().zip(second.updates.iter()) {
        let id = |update: &proto_api::function_executor_pb::ExecutionPlanUpdate| match &update.op {
            Some(Op::List(list)) => list.id.clone(),
            Some(Op::Reduce(reduce)) => reduce.id.clone(),
            Some(Op::FunctionCall(call)) => call.id.clone(),
            None => None,
        };
        assert_eq!(id(a), id(b));
    }
    assert_ne!(first.root_function_call_id, other.root_function_call_id);
}

#[tokio::test]
async fn test_duplicate_allocation_is_rejected() {
    let blob_dir = tempfile::tempdir().unwrap();
    let server = TestServer::grpc(service(registry())).await;
    let mut client = initialized_client(&server, "echo").await;

    let inputs = function_inputs(blob_dir.path(), &[Value::Data(json!({"k": 1}))], None);
    let duplicate = allocation("alloc-dup", "call-dup", inputs);
    client.create_allocation(duplicate.clone()).await.unwrap();
    let err = client.create_allocation(duplicate).await.unwrap_err();
    let status = err.downcast_ref::<tonic::Status>().unwrap();
    assert_eq!(status.code(), tonic::Code::AlreadyExists);

    let (result, answered) = run_to_completion(&mut client, "alloc-dup", blob_dir.path())
        .await
        .unwrap();
    assert_eq!(answered, 1);
    assert_eq!(result.outcome_code(), AllocationOutcomeCode::Success);

    let listed = client.allocations().await.unwrap();
    assert_eq!(listed.len(), 1);
    client.delete_allocation("alloc-dup").await.unwrap();
    assert!(client.allocations().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_request_error_is_uploaded() {
    let blob_dir = tempfile::tempdir().unwrap();
    let mut registry = registry();
    registry.register("picky", |_, _| Err(AllocationError::request("name must not be empty")));
    let server = TestServer::grpc(service(registry)).await;
    let mut client = initialized_client(&server, "picky").await;

    let inputs = function_inputs(blob_dir.path(), &[Value::Data(json!(""))], None);
    client
        .create_allocation(allocation("alloc-picky", "call-picky", inputs))
        .await
        .unwrap();

    let (result, answered) = run_to_completion(&mut client, "alloc-picky", blob_dir.path())
        .await
        .unwrap();
    assert_eq!(answered, 0, "request errors go to the dedicated blob");
    assert_eq!(result.outcome_code(), AllocationOutcomeCode::Failure);
    assert_eq!(result.failure_reason(), AllocationFailureReason::RequestError);

    let blob = result.uploaded_request_error_blob.unwrap();
    let object = result.request_error_output.unwrap();
    let decoded = download_serialized_object(&blob_store(), &blob, &object)
        .await
        .unwrap();
    assert_eq!(decoded.value, Value::Text("name must not be empty".to_string()));
}

async fn next_message(stream: &mut Streaming<SessionServerMessage>) -> session_server_message::Message {
    tokio::time::timeout(STREAM_TIMEOUT, stream.message())
        .await
        .expect("timed out waiting for a session message")
        .expect("session stream failed")
        .expect("session stream closed")
        .message
        .expect("empty session message")
}

fn client_message(message: session_client_message::Message) -> SessionClientMessage {
    SessionClientMessage {
        message: Some(message),
    }
}

#[tokio::test]
async fn test_session_runs_and_resumes_allocations() {
    use session_client_message::Message as Outbound;
    use session_server_message::Message as Inbound;

    let blob_dir = tempfile::tempdir().unwrap();
    let server = TestServer::grpc(service(registry())).await;
    let mut client = initialized_client(&server, "echo").await;

    let (tx, rx) = mpsc::channel(16);
    let mut inbound = client.open_session(ReceiverStream::new(rx)).await.unwrap();

    tx.send(client_message(Outbound::OpenSession(OpenSessionRequest {
        session_id: None,
    })))
    .await
    .unwrap();
    let Inbound::OpenSession(opened) = next_message(&mut inbound).await else {
        panic!("expected the open session response first");
    };
    assert_eq!(opened.resumed, Some(false));
    assert!(opened.status.unwrap().is_ok());
    let session_id = opened.session_id.unwrap();

    let inputs = function_inputs(blob_dir.path(), &[Value::Data(json!([1, 2]))], None);
    tx.send(client_message(Outbound::CreateAllocation(CreateAllocationRequest {
        allocation: Some(allocation("alloc-session", "call-session", inputs)),
    })))
    .await
    .unwrap();

    let mut answered = false;
    let completed = loop {
        match next_message(&mut inbound).await {
            Inbound::AllocationState(state) => {
                if let (false, Some(request)) = (answered, state.output_blob_requests.first()) {
                    let update = output_blob_update("alloc-session", request, blob_dir.path());
                    tx.send(client_message(Outbound::AllocationUpdate(update)))
                        .await
                        .unwrap();
                    answered = true;
                }
            }
            Inbound::AllocationCompleted(completed) => break completed,
            Inbound::Error(status) => panic!("session error: {:?}", status.message),
            Inbound::OpenSession(_) | Inbound::HealthCheck(_) => {}
        }
    };
    assert!(answered);
    assert_eq!(completed.allocation_id.as_deref(), Some("alloc-session"));
    assert_eq!(
        completed.result.unwrap().outcome_code(),
        AllocationOutcomeCode::Success
    );

    tx.send(client_message(Outbound::HealthCheck(HealthCheckRequest {})))
        .await
        .unwrap();
    let Inbound::HealthCheck(health) = next_message(&mut inbound).await else {
        panic!("expected a health check response");
    };
    assert_eq!(health.healthy, Some(true));

    // Leave without closing so the session can be resumed.
    tx.send(client_message(Outbound::LeaveSession(LeaveSessionRequest {
        close: Some(false),
    })))
    .await
    .unwrap();
    drop(tx);

    let (tx, rx) = mpsc::channel(16);
    let mut inbound = client.open_session(ReceiverStream::new(rx)).await.unwrap();
    tx.send(client_message(Outbound::OpenSession(OpenSessionRequest {
        session_id: Some(session_id.clone()),
    })))
    .await
    .unwrap();
    let Inbound::OpenSession(resumed) = next_message(&mut inbound).await else {
        panic!("expected the open session response first");
    };
    assert_eq!(resumed.resumed, Some(true));
    assert_eq!(resumed.session_id.as_deref(), Some(session_id.as_str()));

    // The finished allocation is replayed: its terminal state, then its result.
    let Inbound::AllocationState(state) = next_message(&mut inbound).await else {
        panic!("expected the replayed allocation state");
    };
    assert_eq!(state.phase(), AllocationPhase::CompleteSuccess);
    let Inbound::AllocationCompleted(replayed) = next_message(&mut inbound).await else {
        panic!("expected the replayed allocation result");
    };
    assert_eq!(replayed.allocation_id.as_deref(), Some("alloc-session"));
}

#[tokio::test]
async fn test_session_rejects_allocation_before_open() {
    use session_client_message::Message as Outbound;
    use session_server_message::Message as Inbound;

    let blob_dir = tempfile::tempdir().unwrap();
    let server = TestServer::grpc(service(registry())).await;
    let mut client = initialized_client(&server, "echo").await;

    let (tx, rx) = mpsc::channel(16);
    let mut inbound = client.open_session(ReceiverStream::new(rx)).await.unwrap();
    let inputs = function_inputs(blob_dir.path(), &[Value::Data(json!(1))], None);
    tx.send(client_message(Outbound::CreateAllocation(CreateAllocationRequest {
        allocation: Some(allocation("alloc-early", "call-early", inputs)),
    })))
    .await
    .unwrap();

    let Inbound::Error(status) = next_message(&mut inbound).await else {
        panic!("expected an error");
    };
    assert_eq!(status.code, tonic::Code::FailedPrecondition as i32);
    assert!(client.allocations().await.unwrap().is_empty());
}
