//! Remote head watcher. Turns new blocks on the remote endpoint into
//! [`BlockEvent`]s, either from a `newHeads` subscription (WebSocket) or by
//! polling `eth_blockNumber` (HTTP).

pub mod events;
mod polling;
mod subscription;

pub use events::{BlockEvent, WatcherExit};

use crate::error::ForkSyncError;
use crate::rpc::{AsyncRpcClient, EndpointTransport, RemoteEndpoint, RpcClientOptions};
use crate::runtime::telemetry::Telemetry;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(4);

#[derive(Debug, Clone)]
pub struct WatcherOptions {
    pub rpc: RpcClientOptions,
    /// Only used for HTTP endpoints.
    pub poll_interval: Duration,
    pub telemetry: Option<Arc<Telemetry>>,
    /// Deliver the subscribe-time head as a [`BlockEvent::baseline`] before
    /// any new block. Off by default.
    pub emit_baseline: bool,
}

impl Default for WatcherOptions {
    fn default() -> Self {
        Self {
            rpc: RpcClientOptions::default(),
            poll_interval: DEFAULT_POLL_INTERVAL,
            telemetry: None,
            emit_baseline: false,
        }
    }
}

pub struct HeadWatcher;

impl HeadWatcher {
    /// Connects to `endpoint`, probes its current head, and starts delivering
    /// new blocks to `on_block` in arrival order. With
    /// [`WatcherOptions::emit_baseline`] the probed head is delivered first.
    ///
    /// Any failure before the stream is established is reported as
    /// [`ForkSyncError::Connection`]; this function does not retry.
    pub async fn subscribe<F>(
        endpoint: &RemoteEndpoint,
        options: WatcherOptions,
        shutdown: CancellationToken,
        on_block: F,
    ) -> Result<WatcherHandle, ForkSyncError>
    where
        F: FnMut(BlockEvent) + Send + 'static,
    {
        let connection_error = |err| ForkSyncError::connection(endpoint.as_str(), err);

        let mut client = AsyncRpcClient::connect_with_options(endpoint, options.rpc.clone())
            .await
            .map_err(connection_error)?;
        if let Some(telemetry) = options.telemetry.clone() {
            client = client.with_telemetry(telemetry);
        }

        // Subscribe before reading the head so no block falls between the two.
        let subscription = match endpoint.transport() {
            EndpointTransport::WebSocket => Some(
                client
                    .subscribe_new_heads()
                    .await
                    .map_err(connection_error)?,
            ),
            EndpointTransport::Http => None,
        };

        let head = client.block_number().await.map_err(connection_error)?;
        let baseline = options.emit_baseline.then(|| BlockEvent::baseline(head));
        let cancel = shutdown.child_token();

        let task = match subscription {
            Some(subscription) => tokio::spawn(subscription::run(
                client,
                subscription,
                baseline,
                cancel.clone(),
                on_block,
            )),
            None => tokio::spawn(polling::run(
                client,
                head,
                baseline,
                options.poll_interval,
                cancel.clone(),
                on_block,
            )),
        };

        tracing::info!(
            endpoint = %endpoint,
            transport = ?endpoint.transport(),
            head,
            "watching remote head"
        );

        Ok(WatcherHandle {
            head,
            task: Some(task),
            cancel,
        })
    }
}

/// Handle to a running watcher task.
pub struct WatcherHandle {
    head: u64,
    task: Option<JoinHandle<WatcherExit>>,
    cancel: CancellationToken,
}

impl WatcherHandle {
    /// Remote head reported by the probe at subscribe time. It is the
    /// baseline, not an emitted event.
    pub fn head(&self) -> u64 {
        self.head
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// Resolves once the watcher finishes, with the reason it did.
    pub async fn closed(mut self) -> WatcherExit {
        let Some(task) = self.task.take() else {
            return WatcherExit::Stopped;
        };
        match task.await {
            Ok(exit) => exit,
            Err(err) => WatcherExit::Disconnected {
                reason: format!("watcher task failed: {err}"),
            },
        }
    }
}

impl Drop for WatcherHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
