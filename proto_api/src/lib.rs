//! Wire definitions for the Function Executor API.
//!
//! Messages are prost structs that also derive serde, so the gRPC service
//! and the HTTP API share one set of types. All scalar fields are optional
//! the way proto3 `optional` fields are.
//!
//! The tonic client and server stubs for the `FunctionExecutor` service are
//! generated by `build.rs`.

pub mod function_executor_pb;
pub mod serde_bytes;

/// google.rpc.Status subset used to report per-message outcomes.
pub mod google_rpc {
    use serde::{Deserialize, Serialize};

    #[derive(Clone, PartialEq, ::prost::Message, Serialize, Deserialize)]
    #[serde(default)]
    pub struct Status {
        #[prost(int32, tag = "1")]
        pub code: i32,
        #[prost(string, tag = "2")]
        pub message: ::prost::alloc::string::String,
    }

    impl Status {
        pub fn ok() -> Self {
            Self {
                code: tonic::Code::Ok as i32,
                message: String::new(),
            }
        }

        pub fn is_ok(&self) -> bool {
            self.code == tonic::Code::Ok as i32
        }
    }
}
