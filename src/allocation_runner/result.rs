use proto_api::function_executor_pb::{
    allocation_result::Outputs,
    AllocationFailureReason,
    AllocationOutcomeCode,
    AllocationResult,
    Blob,
    ExecutionPlanUpdates,
    SerializedObjectInsideBlob,
};

pub fn success_value(value: SerializedObjectInsideBlob, uploaded_blob: Blob) -> AllocationResult {
    AllocationResult {
        outcome_code: Some(AllocationOutcomeCode::Success as i32),
        outputs: Some(Outputs::Value(value)),
        uploaded_function_outputs_blob: Some(uploaded_blob),
        ..Default::default()
    }
}

/// `uploaded_blob` is absent when the updates reference no literal values.
pub fn success_updates(updates: ExecutionPlanUpdates, uploaded_blob: Option<Blob>) -> AllocationResult {
    AllocationResult {
        outcome_code: Some(AllocationOutcomeCode::Success as i32),
        outputs: Some(Outputs::Updates(updates)),
        uploaded_function_outputs_blob: uploaded_blob,
        ..Default::default()
    }
}

pub fn function_error(stdout: String, stderr: String) -> AllocationResult {
    AllocationResult {
        outcome_code: Some(AllocationOutcomeCode::Failure as i32),
        failure_reason: Some(AllocationFailureReason::FunctionError as i32),
        stdout: Some(stdout),
        stderr: Some(stderr),
        ..Default::default()
    }
}

pub fn request_error(
    request_error_output: SerializedObjectInsideBlob,
    uploaded_request_error_blob: Blob,
    stdout: String,
    stderr: String,
) -> AllocationResult {
    AllocationResult {
        outcome_code: Some(AllocationOutcomeCode::Failure as i32),
        failure_reason: Some(AllocationFailureReason::RequestError as i32),
        request_error_output: Some(request_error_output),
        uploaded_request_error_blob: Some(uploaded_request_error_blob),
        stdout: Some(stdout),
        stderr: Some(stderr),
        ..Default::default()
    }
}

pub fn internal_error() -> AllocationResult {
    AllocationResult {
        outcome_code: Some(AllocationOutcomeCode::Failure as i32),
        failure_reason: Some(AllocationFailureReason::InternalError as i32),
        ..Default::default()
    }
}
