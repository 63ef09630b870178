//! Messages of the `function_executor_service` package.

use serde::{Deserialize, Serialize};

// ============================================================================
// Serialized objects and blobs
// ============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum SerializedObjectEncoding {
    Unknown = 0,
    Utf8Json = 1,
    Utf8Text = 2,
    BinaryPickle = 3,
    BinaryZip = 4,
    Raw = 5,
}

#[derive(Clone, PartialEq, ::prost::Message, Serialize, Deserialize)]
#[serde(default)]
pub struct SerializedObjectManifest {
    #[prost(enumeration = "SerializedObjectEncoding", optional, tag = "1")]
    pub encoding: Option<i32>,
    #[prost(uint64, optional, tag = "2")]
    pub encoding_version: Option<u64>,
    /// Total size of metadata and payload.
    #[prost(uint64, optional, tag = "3")]
    pub size: Option<u64>,
    #[prost(uint64, optional, tag = "4")]
    pub metadata_size: Option<u64>,
    /// Hex SHA-256 over metadata and payload.
    #[prost(string, optional, tag = "5")]
    pub sha256_hash: Option<String>,
    /// Set for RAW (File-shaped) objects.
    #[prost(string, optional, tag = "6")]
    pub content_type: Option<String>,
    #[prost(string, optional, tag = "7")]
    pub source_function_call_id: Option<String>,
}

#[derive(Clone, PartialEq, ::prost::Message, Serialize, Deserialize)]
#[serde(default)]
pub struct SerializedObject {
    #[prost(message, optional, tag = "1")]
    pub manifest: Option<SerializedObjectManifest>,
    #[prost(bytes = "vec", optional, tag = "2")]
    #[serde(with = "crate::serde_bytes")]
    pub data: Option<Vec<u8>>,
}

#[derive(Clone, PartialEq, ::prost::Message, Serialize, Deserialize)]
#[serde(default)]
pub struct BlobChunk {
    #[prost(string, optional, tag = "1")]
    pub uri: Option<String>,
    #[prost(uint64, optional, tag = "2")]
    pub size: Option<u64>,
    /// Set by the producer after the chunk is written.
    #[prost(string, optional, tag = "3")]
    pub etag: Option<String>,
}

#[derive(Clone, PartialEq, ::prost::Message, Serialize, Deserialize)]
#[serde(default)]
pub struct Blob {
    #[prost(string, optional, tag = "1")]
    pub id: Option<String>,
    #[prost(message, repeated, tag = "2")]
    pub chunks: Vec<BlobChunk>,
}

#[derive(Clone, PartialEq, ::prost::Message, Serialize, Deserialize)]
#[serde(default)]
pub struct SerializedObjectInsideBlob {
    #[prost(message, optional, tag = "1")]
    pub manifest: Option<SerializedObjectManifest>,
    #[prost(uint64, optional, tag = "2")]
    pub offset: Option<u64>,
}

// ============================================================================
// Initialization, info and health
// ============================================================================

#[derive(Clone, PartialEq, ::prost::Message, Serialize, Deserialize)]
#[serde(default)]
pub struct FunctionRef {
    #[prost(string, optional, tag = "1")]
    pub namespace: Option<String>,
    #[prost(string, optional, tag = "2")]
    pub application_name: Option<String>,
    #[prost(string, optional, tag = "3")]
    pub function_name: Option<String>,
    #[prost(string, optional, tag = "4")]
    pub application_version: Option<String>,
}

#[derive(Clone, PartialEq, ::prost::Message, Serialize, Deserialize)]
#[serde(default)]
pub struct InitializeRequest {
    #[prost(message, optional, tag = "1")]
    pub function: Option<FunctionRef>,
    #[prost(message, optional, tag = "2")]
    pub application_code: Option<SerializedObject>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum InitializationOutcomeCode {
    Unknown = 0,
    Success = 1,
    Failure = 2,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum InitializationFailureReason {
    Unknown = 0,
    InternalError = 1,
    FunctionError = 2,
}

#[derive(Clone, PartialEq, ::prost::Message, Serialize, Deserialize)]
#[serde(default)]
pub struct InitializeResponse {
    #[prost(enumeration = "InitializationOutcomeCode", optional, tag = "1")]
    pub outcome_code: Option<i32>,
    #[prost(enumeration = "InitializationFailureReason", optional, tag = "2")]
    pub failure_reason: Option<i32>,
    #[prost(string, optional, tag = "3")]
    pub diagnostics: Option<String>,
}

#[derive(Clone, PartialEq, ::prost::Message, Serialize, Deserialize)]
#[serde(default)]
pub struct InfoRequest {}

#[derive(Clone, PartialEq, ::prost::Message, Serialize, Deserialize)]
#[serde(default)]
pub struct InfoResponse {
    #[prost(string, optional, tag = "1")]
    pub version: Option<String>,
    #[prost(string, optional, tag = "2")]
    pub sdk_version: Option<String>,
    #[prost(string, optional, tag = "3")]
    pub sdk_language: Option<String>,
    #[prost(string, optional, tag = "4")]
    pub sdk_language_version: Option<String>,
    #[prost(bool, optional, tag = "5")]
    pub initialized: Option<bool>,
}

#[derive(Clone, PartialEq, ::prost::Message, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthCheckRequest {}

#[derive(Clone, PartialEq, ::prost::Message, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthCheckResponse {
    #[prost(bool, optional, tag = "1")]
    pub healthy: Option<bool>,
    #[prost(string, optional, tag = "2")]
    pub status_message: Option<String>,
}

// ============================================================================
// Allocations
// ============================================================================

#[derive(Clone, PartialEq, ::prost::Message, Serialize, Deserialize)]
#[serde(default)]
pub struct FunctionInputs {
    #[prost(message, repeated, tag = "1")]
    pub args: Vec<SerializedObjectInsideBlob>,
    /// `arg_blobs[i]` holds `args[i]`.
    #[prost(message, repeated, tag = "2")]
    pub arg_blobs: Vec<Blob>,
    #[prost(message, optional, tag = "3")]
    pub request_error_blob: Option<Blob>,
    /// Absent for calls made directly by the application API.
    #[prost(bytes = "vec", optional, tag = "4")]
    #[serde(with = "crate::serde_bytes")]
    pub function_call_metadata: Option<Vec<u8>>,
}

#[derive(Clone, PartialEq, ::prost::Message, Serialize, Deserialize)]
#[serde(default)]
pub struct Allocation {
    #[prost(string, optional, tag = "1")]
    pub request_id: Option<String>,
    #[prost(string, optional, tag = "2")]
    pub function_call_id: Option<String>,
    #[prost(string, optional, tag = "3")]
    pub allocation_id: Option<String>,
    #[prost(message, optional, tag = "4")]
    pub inputs: Option<FunctionInputs>,
    #[prost(message, optional, tag = "5")]
    pub result: Option<AllocationResult>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum AllocationOutcomeCode {
    Unknown = 0,
    Success = 1,
    Failure = 2,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum AllocationFailureReason {
    Unknown = 0,
    InternalError = 1,
    FunctionError = 2,
    RequestError = 3,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum AllocationPhase {
    Unknown = 0,
    Created = 1,
    FetchingInputs = 2,
    Executing = 3,
    AwaitingOutputBlob = 4,
    CompleteSuccess = 5,
    CompleteFailure = 6,
}

#[derive(Clone, PartialEq, ::prost::Message, Serialize, Deserialize)]
#[serde(default)]
pub struct FunctionArg {
    #[prost(oneof = "function_arg::Source", tags = "1, 2")]
    pub source: Option<function_arg::Source>,
}

pub mod function_arg {
    use serde::{Deserialize, Serialize};

    #[derive(Clone, PartialEq, ::prost::Oneof, Serialize, Deserialize)]
    #[serde(rename_all = "snake_case")]
    pub enum Source {
        #[prost(message, tag = "1")]
        Value(super::SerializedObjectInsideBlob),
        #[prost(string, tag = "2")]
        FunctionCallId(String),
    }
}

#[derive(Clone, PartialEq, ::prost::Message, Serialize, Deserialize)]
#[serde(default)]
pub struct FunctionCall {
    /// Durable id of the call.
    #[prost(string, optional, tag = "1")]
    pub id: Option<String>,
    #[prost(message, optional, tag = "2")]
    pub target: Option<FunctionRef>,
    #[prost(message, repeated, tag = "3")]
    pub args: Vec<FunctionArg>,
    #[prost(bytes = "vec", optional, tag = "4")]
    #[serde(with = "crate::serde_bytes")]
    pub call_metadata: Option<Vec<u8>>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum ListOperationKind {
    Unknown = 0,
    MapOperation = 1,
    Collection = 2,
}

#[derive(Clone, PartialEq, ::prost::Message, Serialize, Deserialize)]
#[serde(default)]
pub struct ListOperation {
    #[prost(string, optional, tag = "1")]
    pub id: Option<String>,
    #[prost(enumeration = "ListOperationKind", optional, tag = "2")]
    pub kind: Option<i32>,
    /// Function applied to every item of a map operation.
    #[prost(message, optional, tag = "3")]
    pub function: Option<FunctionRef>,
    #[prost(message, repeated, tag = "4")]
    pub items: Vec<FunctionArg>,
    /// Metadata of every per-item call.
    #[prost(bytes = "vec", optional, tag = "5")]
    #[serde(with = "crate::serde_bytes")]
    pub call_metadata: Option<Vec<u8>>,
}

#[derive(Clone, PartialEq, ::prost::Message, Serialize, Deserialize)]
#[serde(default)]
pub struct ReduceOp {
    #[prost(string, optional, tag = "1")]
    pub id: Option<String>,
    #[prost(message, optional, tag = "2")]
    pub reducer: Option<FunctionRef>,
    /// Initial value first (when given), then the items to fold.
    #[prost(message, repeated, tag = "3")]
    pub collection: Vec<FunctionArg>,
    #[prost(bytes = "vec", optional, tag = "4")]
    #[serde(with = "crate::serde_bytes")]
    pub call_metadata: Option<Vec<u8>>,
}

#[derive(Clone, PartialEq, ::prost::Message, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionPlanUpdate {
    #[prost(oneof = "execution_plan_update::Op", tags = "1, 2, 3")]
    pub op: Option<execution_plan_update::Op>,
}

pub mod execution_plan_update {
    use serde::{Deserialize, Serialize};

    #[derive(Clone, PartialEq, ::prost::Oneof, Serialize, Deserialize)]
    #[serde(rename_all = "snake_case")]
    pub enum Op {
        #[prost(message, tag = "1")]
        FunctionCall(super::FunctionCall),
        #[prost(message, tag = "2")]
        Reduce(super::ReduceOp),
        #[prost(message, tag = "3")]
        List(super::ListOperation),
    }
}

#[derive(Clone, PartialEq, ::prost::Message, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionPlanUpdates {
    /// Children come before the updates that reference them.
    #[prost(message, repeated, tag = "1")]
    pub updates: Vec<ExecutionPlanUpdate>,
    /// Call whose output becomes the output of the allocation.
    #[prost(string, optional, tag = "2")]
    pub root_function_call_id: Option<String>,
}

#[derive(Clone, PartialEq, ::prost::Message, Serialize, Deserialize)]
#[serde(default)]
pub struct AllocationResult {
    #[prost(enumeration = "AllocationOutcomeCode", optional, tag = "1")]
    pub outcome_code: Option<i32>,
    #[prost(enumeration = "AllocationFailureReason", optional, tag = "2")]
    pub failure_reason: Option<i32>,
    #[prost(oneof = "allocation_result::Outputs", tags = "3, 4")]
    pub outputs: Option<allocation_result::Outputs>,
    #[prost(message, optional, tag = "5")]
    pub uploaded_function_outputs_blob: Option<Blob>,
    #[prost(message, optional, tag = "6")]
    pub request_error_output: Option<SerializedObjectInsideBlob>,
    #[prost(message, optional, tag = "7")]
    pub uploaded_request_error_blob: Option<Blob>,
    /// Output captured from the function, attached on failures.
    #[prost(string, optional, tag = "8")]
    pub stdout: Option<String>,
    #[prost(string, optional, tag = "9")]
    pub stderr: Option<String>,
}

pub mod allocation_result {
    use serde::{Deserialize, Serialize};

    #[derive(Clone, PartialEq, ::prost::Oneof, Serialize, Deserialize)]
    #[serde(rename_all = "snake_case")]
    pub enum Outputs {
        #[prost(message, tag = "3")]
        Value(super::SerializedObjectInsideBlob),
        #[prost(message, tag = "4")]
        Updates(super::ExecutionPlanUpdates),
    }
}

#[derive(Clone, PartialEq, ::prost::Message, Serialize, Deserialize)]
#[serde(default)]
pub struct AllocationProgress {
    #[prost(double, optional, tag = "1")]
    pub current: Option<f64>,
    #[prost(double, optional, tag = "2")]
    pub total: Option<f64>,
}

#[derive(Clone, PartialEq, ::prost::Message, Serialize, Deserialize)]
#[serde(default)]
pub struct AllocationOutputBlobRequest {
    #[prost(string, optional, tag = "1")]
    pub id: Option<String>,
    #[prost(uint64, optional, tag = "2")]
    pub size: Option<u64>,
}

#[derive(Clone, PartialEq, ::prost::Message, Serialize, Deserialize)]
#[serde(default)]
pub struct AllocationState {
    #[prost(enumeration = "AllocationPhase", optional, tag = "1")]
    pub phase: Option<i32>,
    #[prost(message, optional, tag = "2")]
    pub progress: Option<AllocationProgress>,
    #[prost(message, repeated, tag = "3")]
    pub output_blob_requests: Vec<AllocationOutputBlobRequest>,
    #[prost(message, optional, tag = "4")]
    pub result: Option<AllocationResult>,
    /// Hex SHA-256 of the state with this field unset.
    #[prost(string, optional, tag = "5")]
    pub sha256_hash: Option<String>,
    #[prost(string, optional, tag = "6")]
    pub allocation_id: Option<String>,
}

#[derive(Clone, PartialEq, ::prost::Message, Serialize, Deserialize)]
#[serde(default)]
pub struct AllocationOutputBlob {
    #[prost(message, optional, tag = "1")]
    pub status: Option<crate::google_rpc::Status>,
    #[prost(message, optional, tag = "2")]
    pub blob: Option<Blob>,
}

#[derive(Clone, PartialEq, ::prost::Message, Serialize, Deserialize)]
#[serde(default)]
pub struct AllocationUpdate {
    #[prost(string, optional, tag = "1")]
    pub allocation_id: Option<String>,
    #[prost(oneof = "allocation_update::Update", tags = "2")]
    pub update: Option<allocation_update::Update>,
}

pub mod allocation_update {
    use serde::{Deserialize, Serialize};

    #[derive(Clone, PartialEq, ::prost::Oneof, Serialize, Deserialize)]
    #[serde(rename_all = "snake_case")]
    pub enum Update {
        /// Answer to `AllocationState.output_blob_requests`, matched by blob id.
        #[prost(message, tag = "2")]
        OutputBlob(super::AllocationOutputBlob),
    }
}

#[derive(Clone, PartialEq, ::prost::Message, Serialize, Deserialize)]
#[serde(default)]
pub struct CreateAllocationRequest {
    #[prost(message, optional, tag = "1")]
    pub allocation: Option<Allocation>,
}

#[derive(Clone, PartialEq, ::prost::Message, Serialize, Deserialize)]
#[serde(default)]
pub struct CreateAllocationResponse {}

#[derive(Clone, PartialEq, ::prost::Message, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchAllocationStateRequest {
    #[prost(string, optional, tag = "1")]
    pub allocation_id: Option<String>,
}

#[derive(Clone, PartialEq, ::prost::Message, Serialize, Deserialize)]
#[serde(default)]
pub struct SendAllocationUpdateResponse {}

#[derive(Clone, PartialEq, ::prost::Message, Serialize, Deserialize)]
#[serde(default)]
pub struct DeleteAllocationRequest {
    #[prost(string, optional, tag = "1")]
    pub allocation_id: Option<String>,
}

#[derive(Clone, PartialEq, ::prost::Message, Serialize, Deserialize)]
#[serde(default)]
pub struct DeleteAllocationResponse {}

#[derive(Clone, PartialEq, ::prost::Message, Serialize, Deserialize)]
#[serde(default)]
pub struct ListAllocationsRequest {}

#[derive(Clone, PartialEq, ::prost::Message, Serialize, Deserialize)]
#[serde(default)]
pub struct AllocationInfo {
    #[prost(string, optional, tag = "1")]
    pub allocation_id: Option<String>,
    #[prost(string, optional, tag = "2")]
    pub request_id: Option<String>,
    #[prost(string, optional, tag = "3")]
    pub function_call_id: Option<String>,
}

#[derive(Clone, PartialEq, ::prost::Message, Serialize, Deserialize)]
#[serde(default)]
pub struct ListAllocationsResponse {
    #[prost(message, repeated, tag = "1")]
    pub allocations: Vec<AllocationInfo>,
}

// ============================================================================
// Sessions
// ============================================================================

#[derive(Clone, PartialEq, ::prost::Message, Serialize, Deserialize)]
#[serde(default)]
pub struct OpenSessionRequest {
    /// Reusing a previous id resumes that session.
    #[prost(string, optional, tag = "1")]
    pub session_id: Option<String>,
}

#[derive(Clone, PartialEq, ::prost::Message, Serialize, Deserialize)]
#[serde(default)]
pub struct OpenSessionResponse {
    #[prost(message, optional, tag = "1")]
    pub status: Option<crate::google_rpc::Status>,
    #[prost(string, optional, tag = "2")]
    pub session_id: Option<String>,
    #[prost(bool, optional, tag = "3")]
    pub resumed: Option<bool>,
}

#[derive(Clone, PartialEq, ::prost::Message, Serialize, Deserialize)]
#[serde(default)]
pub struct LeaveSessionRequest {
    /// Forget the session instead of keeping it for resumption.
    #[prost(bool, optional, tag = "1")]
    pub close: Option<bool>,
}

#[derive(Clone, PartialEq, ::prost::Message, Serialize, Deserialize)]
#[serde(default)]
pub struct AllocationCompleted {
    #[prost(string, optional, tag = "1")]
    pub allocation_id: Option<String>,
    #[prost(message, optional, tag = "2")]
    pub result: Option<AllocationResult>,
}

#[derive(Clone, PartialEq, ::prost::Message, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionClientMessage {
    #[prost(oneof = "session_client_message::Message", tags = "1, 2, 3, 4, 5")]
    pub message: Option<session_client_message::Message>,
}

pub mod session_client_message {
    use serde::{Deserialize, Serialize};

    #[derive(Clone, PartialEq, ::prost::Oneof, Serialize, Deserialize)]
    #[serde(rename_all = "snake_case")]
    pub enum Message {
        #[prost(message, tag = "1")]
        OpenSession(super::OpenSessionRequest),
        #[prost(message, tag = "2")]
        CreateAllocation(super::CreateAllocationRequest),
        #[prost(message, tag = "3")]
        AllocationUpdate(super::AllocationUpdate),
        #[prost(message, tag = "4")]
        HealthCheck(super::HealthCheckRequest),
        #[prost(message, tag = "5")]
        LeaveSession(super::LeaveSessionRequest),
    }
}

#[derive(Clone, PartialEq, ::prost::Message, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionServerMessage {
    #[prost(oneof = "session_server_message::Message", tags = "1, 2, 3, 4, 5")]
    pub message: Option<session_server_message::Message>,
}

pub mod session_server_message {
    use serde::{Deserialize, Serialize};

    #[derive(Clone, PartialEq, ::prost::Oneof, Serialize, Deserialize)]
    #[serde(rename_all = "snake_case")]
    pub enum Message {
        #[prost(message, tag = "1")]
        OpenSession(super::OpenSessionResponse),
        #[prost(message, tag = "2")]
        AllocationState(super::AllocationState),
        #[prost(message, tag = "3")]
        HealthCheck(super::HealthCheckResponse),
        #[prost(message, tag = "4")]
        AllocationCompleted(super::AllocationCompleted),
        /// Rejection of a single client message; the session stays open.
        #[prost(message, tag = "5")]
        Error(crate::google_rpc::Status),
    }
}

include!(concat!(
    env!("OUT_DIR"),
    "/function_executor_service.FunctionExecutor.rs"
));

#[cfg(test)]
mod tests {
    use prost::Message;

    use super::*;

    #[test]
    fn test_allocation_json_accepts_missing_fields() {
        let allocation: Allocation =
            serde_json::from_str(r#"{"allocation_id": "a1", "inputs": {"args": []}}"#).unwrap();
        assert_eq!(allocation.allocation_id.as_deref(), Some("a1"));
        assert!(allocation.request_id.is_none());
        assert!(allocation.inputs.unwrap().request_error_blob.is_none());
    }

    #[test]
    fn test_bytes_fields_are_base64_in_json() {
        let inputs = FunctionInputs {
            function_call_metadata: Some(b"{}".to_vec()),
            ..Default::default()
        };
        let json = serde_json::to_value(&inputs).unwrap();
        assert_eq!(json["function_call_metadata"], "e30=");

        let back: FunctionInputs = serde_json::from_value(json).unwrap();
        assert_eq!(back, inputs);
    }

    #[test]
    fn test_result_outputs_oneof_encoding() {
        let result = AllocationResult {
            outcome_code: Some(AllocationOutcomeCode::Success as i32),
            outputs: Some(allocation_result::Outputs::Updates(ExecutionPlanUpdates {
                updates: vec![],
                root_function_call_id: Some("root".to_string()),
            })),
            ..Default::default()
        };
        let decoded = AllocationResult::decode(result.encode_to_vec().as_slice()).unwrap();
        assert_eq!(decoded, result);
        assert_eq!(decoded.outcome_code(), AllocationOutcomeCode::Success);

        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["outputs"]["updates"]["root_function_call_id"], "root");
    }
}
