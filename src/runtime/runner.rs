use crate::error::ForkSyncError;
use crate::rpc::{AsyncRpcClient, RemoteEndpoint, RpcClientOptions};
use crate::runtime::backoff::{next_backoff, sleep_with_cancellation};
use crate::runtime::config::ForkSyncConfig;
use crate::runtime::telemetry::{self, Telemetry};
use crate::supervisor::{
    ForkLauncher, ForkStatus, ForkSupervisor, ProcessLauncher, RestartSlot, SupervisorSettings,
};
use crate::watcher::{BlockEvent, HeadWatcher, WatcherExit, WatcherOptions};
use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Coordinates the watcher, the restart slot, and the fork supervisor, and
/// handles OS signals for graceful shutdowns.
pub struct Runner {
    config: ForkSyncConfig,
    launcher: Arc<dyn ForkLauncher>,
    telemetry: Arc<Telemetry>,
    status: Arc<watch::Sender<ForkStatus>>,
    slot: Arc<RestartSlot>,
    shutdown: CancellationToken,
    tasks: Option<RunnerTasks>,
}

impl Runner {
    /// Creates a runner that launches the configured simulator binary.
    pub fn new(config: ForkSyncConfig) -> Self {
        let launcher = Arc::new(ProcessLauncher::from_config(&config));
        Self::with_launcher(config, launcher)
    }

    /// Creates a runner that starts forks through `launcher`.
    pub fn with_launcher(config: ForkSyncConfig, launcher: Arc<dyn ForkLauncher>) -> Self {
        let (status, _) = watch::channel(ForkStatus::Idle);
        Self {
            config,
            launcher,
            telemetry: Arc::new(Telemetry::default()),
            status: Arc::new(status),
            slot: Arc::new(RestartSlot::new()),
            shutdown: CancellationToken::new(),
            tasks: None,
        }
    }

    /// Returns a clone of the root shutdown token so external callers can integrate
    /// with their own signal handlers or cancellation strategies.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn config(&self) -> &ForkSyncConfig {
        &self.config
    }

    pub fn telemetry(&self) -> Arc<Telemetry> {
        self.telemetry.clone()
    }

    /// Receiver tracking the fork instance state across restarts.
    pub fn status(&self) -> watch::Receiver<ForkStatus> {
        self.status.subscribe()
    }

    /// Probes the remote, performs the initial fork, and spawns the sync
    /// worker, the head watcher loop, and the metrics reporter.
    ///
    /// Connection and fork failures are logged, never returned: the service
    /// keeps running and the next block retries.
    pub async fn start(&mut self) -> Result<()> {
        if self.tasks.is_some() {
            return Ok(());
        }

        let endpoint = self.config.remote_endpoint().clone();
        let run_token = self.shutdown.child_token();
        self.slot.take();

        let mut supervisor = ForkSupervisor::new(
            self.launcher.clone(),
            SupervisorSettings::from_config(&self.config),
            self.telemetry.clone(),
            run_token.clone(),
        )
        .with_status_channel(self.status.clone());

        match probe_head(&endpoint, self.config.rpc_timeout(), &self.telemetry).await {
            Ok(head) => {
                if let Err(err) = supervisor.ensure_fork_at(&endpoint, head).await {
                    tracing::warn!(
                        kind = err.kind(),
                        error = %err,
                        head,
                        "initial fork failed; waiting for the next block"
                    );
                }
            }
            Err(err) => {
                tracing::warn!(
                    kind = err.kind(),
                    error = %err,
                    "remote endpoint unreachable; skipping initial fork"
                );
            }
        }

        let worker = tokio::spawn(sync_worker(
            supervisor,
            self.slot.clone(),
            endpoint.clone(),
            run_token.clone(),
        ));

        let watcher = tokio::spawn(watch_loop(WatchLoopParams {
            endpoint,
            options: WatcherOptions {
                rpc: RpcClientOptions {
                    request_timeout: self.config.rpc_timeout(),
                    ..RpcClientOptions::default()
                },
                poll_interval: self.config.poll_interval(),
                telemetry: Some(self.telemetry.clone()),
                emit_baseline: true,
            },
            slot: self.slot.clone(),
            telemetry: self.telemetry.clone(),
            shutdown: run_token.clone(),
            initial_backoff: self.config.resubscribe_initial_backoff(),
            max_backoff: self.config.resubscribe_max_backoff(),
        }));

        let metrics = telemetry::spawn_metrics_reporter(
            self.telemetry.clone(),
            run_token.clone(),
            self.config.metrics_interval(),
        );

        self.tasks = Some(RunnerTasks {
            run_token,
            worker,
            watcher,
            metrics,
        });
        Ok(())
    }

    /// Cancels every task, waits for them, and stops the fork instance.
    pub async fn stop(&mut self) -> Result<()> {
        let Some(tasks) = self.tasks.take() else {
            return Ok(());
        };

        self.shutdown.cancel();
        tasks.shutdown().await;
        self.reinitialize_shutdown_token();
        Ok(())
    }

    /// Runs until a Ctrl-C (SIGINT) is received or the shutdown token is cancelled elsewhere.
    pub async fn run_until_ctrl_c(&mut self) -> Result<()> {
        self.start().await?;
        tracing::info!("runner started; waiting for Ctrl-C (SIGINT) to initiate shutdown");

        tokio::select! {
            _ = signal::ctrl_c() => {
                tracing::info!("Ctrl-C received; shutting down runner");
            }
            _ = self.shutdown.cancelled() => {
                tracing::info!("runner shutdown token cancelled");
            }
        }

        self.stop().await
    }

    fn reinitialize_shutdown_token(&mut self) {
        self.shutdown = CancellationToken::new();
    }
}

struct RunnerTasks {
    run_token: CancellationToken,
    worker: JoinHandle<()>,
    watcher: JoinHandle<()>,
    metrics: JoinHandle<()>,
}

impl RunnerTasks {
    async fn shutdown(self) {
        self.run_token.cancel();

        if let Err(err) = self.watcher.await {
            tracing::warn!(error = %err, "head watcher task panicked");
        }
        if let Err(err) = self.worker.await {
            tracing::warn!(error = %err, "sync worker task panicked");
        }
        if let Err(err) = self.metrics.await {
            tracing::warn!(error = %err, "metrics reporter task panicked");
        }
    }
}

async fn probe_head(
    endpoint: &RemoteEndpoint,
    rpc_timeout: Duration,
    telemetry: &Arc<Telemetry>,
) -> Result<u64, ForkSyncError> {
    let options = RpcClientOptions::probe(rpc_timeout);
    let client = AsyncRpcClient::connect_with_options(endpoint, options)
        .await
        .map_err(|err| ForkSyncError::connection(endpoint.as_str(), err))?
        .with_telemetry(telemetry.clone());

    let head = client
        .block_number()
        .await
        .map_err(|err| ForkSyncError::connection(endpoint.as_str(), err))?;
    let chain_id = client.chain_id().await.ok();
    tracing::info!(endpoint = %endpoint, head, chain_id, "remote endpoint reachable");
    Ok(head)
}

/// Applies pending block events one at a time. Owns the supervisor, so
/// restarts are serialized and the instance is stopped when the task ends.
async fn sync_worker(
    mut supervisor: ForkSupervisor,
    slot: Arc<RestartSlot>,
    endpoint: RemoteEndpoint,
    shutdown: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = shutdown.cancelled() => break,
            event = slot.next() => event,
        };

        if event.baseline && is_current(&supervisor, event.height) {
            tracing::debug!(
                height = event.height,
                "fork already follows the remote head; skipping restart"
            );
            continue;
        }

        tracing::info!(
            height = event.height,
            hash = event.hash.as_deref(),
            queued_ms = event.observed_at.elapsed().as_millis() as u64,
            "restarting fork for new remote block"
        );

        match supervisor.ensure_fork_at(&endpoint, event.height).await {
            Ok(_) => {}
            Err(ForkSyncError::Cancelled) => break,
            Err(err) => {
                tracing::warn!(
                    kind = err.kind(),
                    error = %err,
                    height = event.height,
                    "fork restart failed; waiting for the next block"
                );
            }
        }
    }

    if let Err(err) = supervisor.shutdown().await {
        tracing::warn!(error = %err, "failed to stop fork instance during shutdown");
    }
    tracing::info!("sync worker stopped");
}

fn is_current(supervisor: &ForkSupervisor, height: u64) -> bool {
    supervisor
        .current()
        .is_some_and(|info| info.trigger_height == Some(height))
}

struct WatchLoopParams {
    endpoint: RemoteEndpoint,
    options: WatcherOptions,
    slot: Arc<RestartSlot>,
    telemetry: Arc<Telemetry>,
    shutdown: CancellationToken,
    initial_backoff: Duration,
    max_backoff: Duration,
}

/// Keeps a head watcher attached to the remote, re-subscribing with
/// exponential backoff whenever subscribing fails or the stream ends. Each
/// attach feeds the current remote head to the slot first, so blocks missed
/// while detached still converge the fork.
async fn watch_loop(params: WatchLoopParams) {
    let WatchLoopParams {
        endpoint,
        options,
        slot,
        telemetry,
        shutdown,
        initial_backoff,
        max_backoff,
    } = params;

    let mut backoff = initial_backoff;

    while !shutdown.is_cancelled() {
        let on_block = {
            let slot = slot.clone();
            let telemetry = telemetry.clone();
            move |event: BlockEvent| {
                if !event.baseline {
                    telemetry.record_block_observed();
                }
                tracing::debug!(
                    height = event.height,
                    baseline = event.baseline,
                    "remote block observed"
                );
                if let Some(superseded) = slot.offer(event).filter(|old| !old.baseline) {
                    telemetry.record_event_superseded();
                    tracing::debug!(
                        superseded = superseded.height,
                        "pending restart superseded by a newer block"
                    );
                }
            }
        };

        match HeadWatcher::subscribe(&endpoint, options.clone(), shutdown.clone(), on_block).await
        {
            Ok(handle) => {
                backoff = initial_backoff;
                match handle.closed().await {
                    WatcherExit::Stopped => break,
                    WatcherExit::Disconnected { reason } => {
                        tracing::warn!(
                            reason = %reason,
                            "remote head watcher disconnected; resubscribing"
                        );
                    }
                }
            }
            Err(err) => {
                tracing::warn!(
                    kind = err.kind(),
                    error = %err,
                    backoff_ms = backoff.as_millis() as u64,
                    "failed to watch remote head; retrying"
                );
            }
        }

        if sleep_with_cancellation(backoff, Some(&shutdown)).await.is_err() {
            break;
        }
        backoff = next_backoff(backoff, max_backoff);
    }

    tracing::info!("head watcher loop stopped");
}
