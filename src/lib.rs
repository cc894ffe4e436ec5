pub mod error;
pub mod rpc;
pub mod runtime;
pub mod supervisor;
pub mod watcher;

pub use error::ForkSyncError;
pub use rpc::circuit_breaker::{CircuitBreakerSnapshot, CircuitState, RpcCircuitBreaker};
pub use rpc::{AsyncRpcClient, EndpointTransport, RemoteEndpoint, RpcClientOptions, RpcError};
pub use runtime::config::{ForkSyncConfig, ForkSyncConfigBuilder, ForkSyncConfigParams};
pub use runtime::runner::Runner;
pub use runtime::telemetry::{init_tracing, Telemetry, TelemetrySnapshot};
pub use supervisor::{
    ForkInstanceInfo, ForkLauncher, ForkProcess, ForkStatus, ForkSupervisor, LaunchFuture,
    LaunchRequest, ProcessLauncher, RestartSlot, SimulatorFlavor, StopFuture, SupervisorSettings,
};
pub use watcher::{BlockEvent, HeadWatcher, WatcherExit, WatcherHandle, WatcherOptions};
