//! Shared fixtures for the integration tests: file-backed blobs, allocation
//! builders and in-process servers on ephemeral ports.

#![allow(dead_code)]

use std::{net::SocketAddr, path::Path};

use blob_store::{file_blob, BlobStore, BlobStoreOptions};
use function_executor::{
    allocation_runner::DownloadPolicy,
    config::HealthConfig,
    function::{FunctionCallMetadata, FunctionRegistry},
    grpc_server,
    health::HealthChecker,
    http_server,
    serialization::{inline_object, serialize, Value},
    service::FunctionExecutorService,
};
use proto_api::{
    function_executor_pb::{
        allocation_update,
        Allocation,
        AllocationOutputBlob,
        AllocationOutputBlobRequest,
        AllocationUpdate,
        FunctionInputs,
        FunctionRef,
        InitializeRequest,
        SerializedObjectEncoding,
        SerializedObjectInsideBlob,
    },
    google_rpc,
};
use tokio::{net::TcpListener, task::JoinHandle};
use tokio_util::sync::CancellationToken;

pub const REQUEST_ERROR_BLOB_SIZE: u64 = 1024 * 1024;

pub fn blob_store() -> BlobStore {
    BlobStore::new(BlobStoreOptions::for_cpus(2)).unwrap()
}

pub fn service(registry: FunctionRegistry) -> FunctionExecutorService {
    FunctionExecutorService::new(
        registry,
        blob_store(),
        DownloadPolicy::default(),
        HealthChecker::new(&HealthConfig {
            gpu_checks_enabled: false,
            ..Default::default()
        }),
    )
}

pub fn function_ref(function_name: &str) -> FunctionRef {
    FunctionRef {
        namespace: Some("test-ns".to_string()),
        application_name: Some("test-app".to_string()),
        function_name: Some(function_name.to_string()),
        application_version: Some("v1".to_string()),
    }
}

pub fn initialize_request(function_name: &str) -> InitializeRequest {
    InitializeRequest {
        function: Some(function_ref(function_name)),
        application_code: Some(inline_object(
            b"PK\x05\x06\0\0\0\0\0\0\0\0\0\0\0\0\0\0\0\0\0\0".to_vec(),
            SerializedObjectEncoding::BinaryZip,
        )),
    }
}

/// Writes every value into its own file blob under `dir`.
pub fn function_inputs(
    dir: &Path,
    values: &[Value],
    metadata: Option<FunctionCallMetadata>,
) -> FunctionInputs {
    let mut args = Vec::new();
    let mut arg_blobs = Vec::new();
    for (i, value) in values.iter().enumerate() {
        let serialized = serialize(value).unwrap();
        let id = format!("arg-{}", i);
        let path = dir.join(format!("{}.bin", id));
        std::fs::write(&path, serialized.to_bytes()).unwrap();
        arg_blobs.push(file_blob(&id, &path, &[serialized.len()]).unwrap());
        args.push(SerializedObjectInsideBlob {
            manifest: Some(serialized.manifest),
            offset: Some(0),
        });
    }
    FunctionInputs {
        args,
        arg_blobs,
        request_error_blob: Some(
            file_blob(
                "request-error",
                &dir.join("request-error.bin"),
                &[REQUEST_ERROR_BLOB_SIZE],
            )
            .unwrap(),
        ),
        function_call_metadata: metadata.map(|m| m.encode().unwrap()),
    }
}

pub fn allocation(allocation_id: &str, function_call_id: &str, inputs: FunctionInputs) -> Allocation {
    Allocation {
        request_id: Some("req-1".to_string()),
        function_call_id: Some(function_call_id.to_string()),
        allocation_id: Some(allocation_id.to_string()),
        inputs: Some(inputs),
        result: None,
    }
}

/// Answers an output blob request with a fresh file blob under `dir`.
pub fn output_blob_update(
    allocation_id: &str,
    request: &AllocationOutputBlobRequest,
    dir: &Path,
) -> AllocationUpdate {
    let id = request.id.clone().unwrap();
    let blob = file_blob(
        &id,
        &dir.join(format!("{}.bin", id)),
        &[request.size.unwrap()],
    )
    .unwrap();
    AllocationUpdate {
        allocation_id: Some(allocation_id.to_string()),
        update: Some(allocation_update::Update::OutputBlob(AllocationOutputBlob {
            status: Some(google_rpc::Status::ok()),
            blob: Some(blob),
        })),
    }
}

pub struct TestServer {
    pub addr: SocketAddr,
    pub cancel_token: CancellationToken,
    pub handle: JoinHandle<()>,
}

impl TestServer {
    pub async fn grpc(service: FunctionExecutorService) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let cancel_token = CancellationToken::new();
        let token = cancel_token.clone();
        let handle = tokio::spawn(async move {
            grpc_server::run_server_with_listener(listener, service, token)
                .await
                .unwrap();
        });
        Self {
            addr,
            cancel_token,
            handle,
        }
    }

    pub async fn http(service: FunctionExecutorService) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let cancel_token = CancellationToken::new();
        let token = cancel_token.clone();
        let handle = tokio::spawn(async move {
            http_server::run_http_server_with_listener(listener, service, token)
                .await
                .unwrap();
        });
        Self {
            addr,
            cancel_token,
            handle,
        }
    }

    pub fn shutdown(&self) {
        self.cancel_token.cancel();
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.cancel_token.cancel();
    }
}
