use std::time::{Duration, Instant};

use anyhow::{bail, Result};
use forksync::{ForkSyncConfig, ForkSyncConfigBuilder};
use once_cell::sync::Lazy;
use tokio::net::TcpListener;
use tokio::time::sleep;
use tracing_subscriber::EnvFilter;

static TRACING_SUBSCRIBER: Lazy<()> = Lazy::new(|| {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();
});

pub fn init_tracing() {
    Lazy::force(&TRACING_SUBSCRIBER);
}

/// Returns a port that was free a moment ago.
pub async fn free_port() -> Result<u16> {
    let probe = TcpListener::bind("127.0.0.1:0").await?;
    Ok(probe.local_addr()?.port())
}

/// Config tuned for tests: fast polling, short timeouts, tight backoff.
pub fn fast_config(remote_url: &str, local_port: u16) -> ForkSyncConfigBuilder {
    ForkSyncConfig::builder()
        .remote_rpc_url(remote_url)
        .local_host("127.0.0.1")
        .local_port(local_port)
        .poll_interval(Duration::from_millis(50))
        .rpc_timeout(Duration::from_secs(1))
        .startup_timeout(Duration::from_secs(2))
        .port_release_timeout(Duration::from_secs(1))
        .readiness_poll_interval(Duration::from_millis(10))
        .restart_backoff(Duration::from_millis(10), Duration::from_millis(50))
        .resubscribe_backoff(Duration::from_millis(50), Duration::from_millis(200))
        .metrics_interval(Duration::from_secs(60))
}

/// Polls `condition` until it holds or `limit` elapses.
pub async fn wait_until<F>(limit: Duration, what: &str, mut condition: F) -> Result<()>
where
    F: FnMut() -> bool,
{
    let deadline = Instant::now() + limit;
    loop {
        if condition() {
            return Ok(());
        }
        if Instant::now() >= deadline {
            bail!("timed out after {limit:?} waiting for {what}");
        }
        sleep(Duration::from_millis(10)).await;
    }
}
