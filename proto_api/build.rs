use anyhow::Result;
use tonic_build::manual::{Builder, Method, Service};

const MESSAGES: &str = "crate::function_executor_pb";

struct Rpc {
    name: &'static str,
    route: &'static str,
    input: &'static str,
    output: &'static str,
    client_streaming: bool,
    server_streaming: bool,
}

const fn unary(
    name: &'static str,
    route: &'static str,
    input: &'static str,
    output: &'static str,
) -> Rpc {
    Rpc {
        name,
        route,
        input,
        output,
        client_streaming: false,
        server_streaming: false,
    }
}

// The message types are written by hand in src/function_executor_pb.rs, so
// only the service stubs are generated here and no protoc is needed.
const RPCS: &[Rpc] = &[
    unary("initialize", "Initialize", "InitializeRequest", "InitializeResponse"),
    unary("get_info", "GetInfo", "InfoRequest", "InfoResponse"),
    unary(
        "check_health",
        "CheckHealth",
        "HealthCheckRequest",
        "HealthCheckResponse",
    ),
    unary(
        "list_allocations",
        "ListAllocations",
        "ListAllocationsRequest",
        "ListAllocationsResponse",
    ),
    unary(
        "create_allocation",
        "CreateAllocation",
        "CreateAllocationRequest",
        "CreateAllocationResponse",
    ),
    Rpc {
        name: "watch_allocation_state",
        route: "WatchAllocationState",
        input: "WatchAllocationStateRequest",
        output: "AllocationState",
        client_streaming: false,
        server_streaming: true,
    },
    unary(
        "send_allocation_update",
        "SendAllocationUpdate",
        "AllocationUpdate",
        "SendAllocationUpdateResponse",
    ),
    unary(
        "delete_allocation",
        "DeleteAllocation",
        "DeleteAllocationRequest",
        "DeleteAllocationResponse",
    ),
    Rpc {
        name: "open_session",
        route: "OpenSession",
        input: "SessionClientMessage",
        output: "SessionServerMessage",
        client_streaming: true,
        server_streaming: true,
    },
];

fn main() -> Result<()> {
    println!("cargo:rerun-if-changed=build.rs");

    let mut service = Service::builder()
        .name("FunctionExecutor")
        .package("function_executor_service");

    for rpc in RPCS {
        let mut method = Method::builder()
            .name(rpc.name)
            .route_name(rpc.route)
            .input_type(format!("{}::{}", MESSAGES, rpc.input))
            .output_type(format!("{}::{}", MESSAGES, rpc.output))
            .codec_path("tonic::codec::ProstCodec");
        if rpc.client_streaming {
            method = method.client_streaming();
        }
        if rpc.server_streaming {
            method = method.server_streaming();
        }
        service = service.method(method.build());
    }

    Builder::new().compile(&[service.build()]);
    Ok(())
}
