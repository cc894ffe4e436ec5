//! Head discovery for WebSocket endpoints through `eth_subscribe("newHeads")`.

use super::events::{BlockEvent, WatcherExit};
use crate::rpc::{decode_new_head, AsyncRpcClient};
use jsonrpsee::core::client::Subscription;
use serde_json::Value;
use tokio::select;
use tokio_util::sync::CancellationToken;

/// Drives the subscription until it ends or `cancel` fires. `client` is held
/// for the lifetime of the stream since dropping it tears the socket down.
pub(crate) async fn run<F>(
    client: AsyncRpcClient,
    mut subscription: Subscription<Value>,
    baseline: Option<BlockEvent>,
    cancel: CancellationToken,
    mut on_block: F,
) -> WatcherExit
where
    F: FnMut(BlockEvent) + Send,
{
    if let Some(event) = baseline {
        on_block(event);
    }

    loop {
        let next = select! {
            _ = cancel.cancelled() => None,
            item = subscription.next() => Some(item),
        };

        let item = match next {
            Some(item) => item,
            None => {
                if let Err(err) = subscription.unsubscribe().await {
                    tracing::debug!(error = %err, "eth_unsubscribe failed during shutdown");
                }
                return WatcherExit::Stopped;
            }
        };

        let notification = match item {
            Some(Ok(notification)) => notification,
            Some(Err(err)) => {
                tracing::warn!(error = %err, "dropping undecodable newHeads notification");
                continue;
            }
            None => {
                let reason = if client.is_connected() {
                    format!("newHeads subscription on {} closed", client.endpoint())
                } else {
                    format!("connection to {} dropped", client.endpoint())
                };
                return WatcherExit::Disconnected { reason };
            }
        };

        match decode_new_head(&notification) {
            Ok((height, hash)) => on_block(BlockEvent::new(height, hash)),
            Err(err) => {
                tracing::warn!(error = %err, "dropping malformed newHeads notification");
            }
        }
    }
}
