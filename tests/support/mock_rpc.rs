use std::{
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
};

use anyhow::{Context, Result};
use jsonrpsee::{
    server::{ServerBuilder, ServerHandle},
    types::ErrorObjectOwned,
    RpcModule, SubscriptionMessage,
};
use serde_json::json;
use tokio::sync::broadcast;

const CHAIN_ID: u64 = 1;

/// In-memory remote chain: a head height plus a broadcast of new heads to
/// `newHeads` subscribers.
#[derive(Clone)]
pub struct MockChain {
    head: Arc<AtomicU64>,
    failing: Arc<AtomicBool>,
    heads: broadcast::Sender<u64>,
}

impl MockChain {
    pub fn new(head: u64) -> Self {
        let (heads, _) = broadcast::channel(1_024);
        Self {
            head: Arc::new(AtomicU64::new(head)),
            failing: Arc::new(AtomicBool::new(false)),
            heads,
        }
    }

    pub fn head(&self) -> u64 {
        self.head.load(Ordering::SeqCst)
    }

    /// Sets the head and notifies subscribers.
    pub fn push_head(&self, height: u64) {
        self.head.store(height, Ordering::SeqCst);
        let _ = self.heads.send(height);
    }

    /// Makes `eth_blockNumber` return an internal error while set.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn subscriber_count(&self) -> usize {
        self.heads.receiver_count()
    }

    fn block_hash(height: u64) -> String {
        format!("0x{height:064x}")
    }
}

pub struct MockRpcServer {
    addr: SocketAddr,
    handle: ServerHandle,
}

impl MockRpcServer {
    pub async fn start(chain: MockChain) -> Result<Self> {
        Self::start_on("127.0.0.1:0", chain).await
    }

    /// Serves HTTP and WebSocket JSON-RPC for `chain` on `addr`.
    pub async fn start_on(addr: &str, chain: MockChain) -> Result<Self> {
        let server = ServerBuilder::default()
            .build(addr)
            .await
            .with_context(|| format!("failed to bind mock rpc server on {addr}"))?;
        let addr = server.local_addr().context("mock server has no local address")?;

        let mut module = RpcModule::new(chain);
        module
            .register_method("eth_blockNumber", |_, chain, _| {
                if chain.failing.load(Ordering::SeqCst) {
                    return Err(ErrorObjectOwned::owned(
                        -32603,
                        "mock outage",
                        None::<()>,
                    ));
                }
                Ok(format!("{:#x}", chain.head()))
            })
            .context("register eth_blockNumber")?;

        module
            .register_method("eth_chainId", |_, _, _| format!("{CHAIN_ID:#x}"))
            .context("register eth_chainId")?;

        module
            .register_subscription(
                "eth_subscribe",
                "eth_subscription",
                "eth_unsubscribe",
                |params, pending, chain, _| async move {
                    let kind: String = params.one()?;
                    if kind != "newHeads" {
                        pending
                            .reject(ErrorObjectOwned::owned(
                                -32602,
                                format!("unsupported subscription {kind}"),
                                None::<()>,
                            ))
                            .await;
                        return Ok(());
                    }

                    let mut heads = chain.heads.subscribe();
                    let sink = pending.accept().await?;

                    loop {
                        let height = tokio::select! {
                            _ = sink.closed() => break,
                            received = heads.recv() => match received {
                                Ok(height) => height,
                                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                                Err(broadcast::error::RecvError::Closed) => break,
                            },
                        };

                        let header = json!({
                            "number": format!("{height:#x}"),
                            "hash": MockChain::block_hash(height),
                            "parentHash": MockChain::block_hash(height.saturating_sub(1)),
                        });
                        sink.send(SubscriptionMessage::from_json(&header)?).await?;
                    }

                    Ok(())
                },
            )
            .context("register eth_subscribe")?;

        let handle = server.start(module);
        Ok(Self { addr, handle })
    }

    pub fn http_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn ws_url(&self) -> String {
        format!("ws://{}", self.addr)
    }

    pub async fn shutdown(self) {
        if self.handle.stop().is_ok() {
            self.handle.stopped().await;
        }
    }
}
