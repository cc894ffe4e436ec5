//! Local port probes used around restarts: the port must be free before a new
//! simulator starts, and accepting connections before it counts as up.

use super::launcher::ForkProcess;
use crate::error::ForkSyncError;
use anyhow::{bail, Result};
use std::io::ErrorKind;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{sleep, timeout, Instant};

/// Waits until `addr` can be bound again. `AddrInUse` is retried every
/// `poll` until `limit` elapses; any other bind error fails immediately.
pub(crate) async fn wait_for_port_release(
    addr: &str,
    limit: Duration,
    poll: Duration,
) -> Result<()> {
    let deadline = Instant::now() + limit;

    loop {
        match TcpListener::bind(addr).await {
            Ok(listener) => {
                drop(listener);
                return Ok(());
            }
            Err(err) if err.kind() == ErrorKind::AddrInUse => {
                if Instant::now() >= deadline {
                    return Err(ForkSyncError::port_bind(
                        addr,
                        format!("still in use after {limit:?}"),
                    )
                    .into());
                }
                tracing::trace!(addr, "local port still in use");
                sleep(poll).await;
            }
            Err(err) => return Err(ForkSyncError::port_bind(addr, err.to_string()).into()),
        }
    }
}

/// Waits until something accepts TCP connections on `addr`, failing early
/// when `process` exits.
pub(crate) async fn wait_until_listening(
    process: &mut dyn ForkProcess,
    addr: &str,
    limit: Duration,
    poll: Duration,
) -> Result<()> {
    let deadline = Instant::now() + limit;

    loop {
        if let Some(status) = process.try_exit_status()? {
            bail!("simulator exited before accepting connections ({status})");
        }

        if let Ok(Ok(stream)) = timeout(poll, TcpStream::connect(addr)).await {
            drop(stream);
            return Ok(());
        }

        if Instant::now() >= deadline {
            bail!("simulator did not accept connections on {addr} within {limit:?}");
        }
        sleep(poll).await;
    }
}
