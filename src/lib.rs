pub mod allocation_runner;
pub mod config;
pub mod fe_client;
pub mod function;
pub mod future_graph;
pub mod grpc_server;
pub mod health;
pub mod health_checker;
pub mod http_models;
pub mod http_server;
pub mod local_runner;
pub mod retry;
pub mod serialization;
pub mod service;
pub mod tracing;
