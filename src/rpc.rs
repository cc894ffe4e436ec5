//! JSON-RPC client plumbing for the remote endpoint: transport selection,
//! circuit breaker, retry policy, and payload decoding.

pub mod circuit_breaker;
pub mod client;
pub mod endpoint;
pub mod helpers;
pub mod options;
pub mod retry;

pub use circuit_breaker::{
    CircuitBreakerError, CircuitBreakerSnapshot, CircuitState, RpcCircuitBreaker,
};
pub use client::{AsyncRpcClient, RpcError};
pub use endpoint::{EndpointTransport, RemoteEndpoint};
pub use helpers::{decode_new_head, parse_quantity};
pub use options::RpcClientOptions;
