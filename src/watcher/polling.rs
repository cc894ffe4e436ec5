//! Head discovery for HTTP endpoints: `eth_blockNumber` on a fixed interval.

use super::events::{BlockEvent, WatcherExit};
use crate::rpc::AsyncRpcClient;
use std::ops::RangeInclusive;
use std::time::Duration;
use tokio::select;
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// Upper bound on events emitted for a single poll after a long gap.
pub(crate) const MAX_CATCH_UP_BLOCKS: u64 = 256;

pub(crate) async fn run<F>(
    client: AsyncRpcClient,
    baseline: u64,
    baseline_event: Option<BlockEvent>,
    interval: Duration,
    cancel: CancellationToken,
    mut on_block: F,
) -> WatcherExit
where
    F: FnMut(BlockEvent) + Send,
{
    if let Some(event) = baseline_event {
        on_block(event);
    }

    let mut last_head = baseline;
    let mut ticker = time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        let polled = select! {
            _ = cancel.cancelled() => return WatcherExit::Stopped,
            polled = async {
                ticker.tick().await;
                client.block_number().await
            } => polled,
        };

        let head = match polled {
            Ok(head) => head,
            Err(err) => {
                tracing::warn!(
                    endpoint = %client.endpoint(),
                    error = %err,
                    "remote head poll failed; retrying on next tick"
                );
                continue;
            }
        };

        if head < last_head {
            tracing::warn!(
                endpoint = %client.endpoint(),
                previous = last_head,
                head,
                "remote head moved backwards"
            );
        }

        if let Some(range) = heights_to_emit(last_head, head) {
            if head > last_head && *range.start() > last_head + 1 {
                tracing::debug!(
                    skipped_from = last_head + 1,
                    skipped_to = *range.start() - 1,
                    "remote head jumped; emitting only the most recent blocks"
                );
            }
            for height in range {
                on_block(BlockEvent::new(height, None));
            }
        }

        last_head = head;
    }
}

/// Heights to report when the polled head moves from `last` to `head`:
/// every new height in order (capped to the most recent
/// [`MAX_CATCH_UP_BLOCKS`]), or just `head` when it regressed.
pub(crate) fn heights_to_emit(last: u64, head: u64) -> Option<RangeInclusive<u64>> {
    if head == last {
        return None;
    }

    if head < last {
        return Some(head..=head);
    }

    let start = (last + 1).max(head.saturating_sub(MAX_CATCH_UP_BLOCKS - 1));
    Some(start..=head)
}
