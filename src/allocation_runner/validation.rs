use anyhow::{bail, Result};
use proto_api::function_executor_pb::Allocation;

/// Checks that an allocation carries everything needed to run it.
pub fn validate_allocation(allocation: &Allocation) -> Result<()> {
    for (field, value) in [
        ("request_id", &allocation.request_id),
        ("function_call_id", &allocation.function_call_id),
        ("allocation_id", &allocation.allocation_id),
    ] {
        if value.as_deref().map_or(true, str::is_empty) {
            bail!("allocation.{} is required", field);
        }
    }

    let Some(inputs) = allocation.inputs.as_ref() else {
        bail!("allocation.inputs is required");
    };
    if inputs.request_error_blob.is_none() {
        bail!("allocation.inputs.request_error_blob is required");
    }
    if inputs.args.len() != inputs.arg_blobs.len() {
        bail!(
            "allocation.inputs has {} args but {} arg_blobs",
            inputs.args.len(),
            inputs.arg_blobs.len()
        );
    }
    for (i, arg) in inputs.args.iter().enumerate() {
        if arg.manifest.is_none() {
            bail!("allocation.inputs.args[{}].manifest is required", i);
        }
    }
    if allocation.result.is_some() {
        bail!("allocation.result must not be set");
    }
    Ok(())
}
