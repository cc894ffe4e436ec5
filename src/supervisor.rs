//! Fork supervisor: owns the single simulator instance and replaces it with a
//! fresh fork whenever asked to follow a new remote head.

pub mod instance;
pub mod launcher;
mod port;
pub mod slot;

pub use instance::{ForkInstanceInfo, ForkStatus};
pub use launcher::{
    ForkLauncher, ForkProcess, LaunchFuture, LaunchRequest, ProcessLauncher, SimulatorFlavor,
    StopFuture,
};
pub use slot::RestartSlot;

use crate::error::ForkSyncError;
use crate::rpc::RemoteEndpoint;
use crate::runtime::backoff::{retry_with_backoff, RetryBackoff, RetryDisposition};
use crate::runtime::config::ForkSyncConfig;
use crate::runtime::telemetry::Telemetry;
use anyhow::Result;
use instance::ForkInstance;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// Restart tuning for [`ForkSupervisor`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SupervisorSettings {
    pub host: String,
    pub port: u16,
    pub pin_fork_block: bool,
    pub startup_timeout: Duration,
    pub port_release_timeout: Duration,
    pub readiness_poll_interval: Duration,
    pub restart_max_attempts: usize,
    pub restart_initial_backoff: Duration,
    pub restart_max_backoff: Duration,
}

impl SupervisorSettings {
    pub fn from_config(config: &ForkSyncConfig) -> Self {
        Self {
            host: config.local_host().to_owned(),
            port: config.local_port(),
            pin_fork_block: config.pin_fork_block(),
            startup_timeout: config.startup_timeout(),
            port_release_timeout: config.port_release_timeout(),
            readiness_poll_interval: config.readiness_poll_interval(),
            restart_max_attempts: config.restart_max_attempts(),
            restart_initial_backoff: config.restart_initial_backoff(),
            restart_max_backoff: config.restart_max_backoff(),
        }
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Owns at most one [`ForkInstance`]. Restarts take `&mut self`, so they can
/// never overlap.
pub struct ForkSupervisor {
    launcher: Arc<dyn ForkLauncher>,
    settings: SupervisorSettings,
    current: Option<ForkInstance>,
    generation: u64,
    status: Arc<watch::Sender<ForkStatus>>,
    telemetry: Arc<Telemetry>,
    shutdown: CancellationToken,
}

impl ForkSupervisor {
    pub fn new(
        launcher: Arc<dyn ForkLauncher>,
        settings: SupervisorSettings,
        telemetry: Arc<Telemetry>,
        shutdown: CancellationToken,
    ) -> Self {
        let (status, _) = watch::channel(ForkStatus::Idle);
        Self {
            launcher,
            settings,
            current: None,
            generation: 0,
            status: Arc::new(status),
            telemetry,
            shutdown,
        }
    }

    /// Publishes status updates on `status` instead of a private channel.
    pub fn with_status_channel(mut self, status: Arc<watch::Sender<ForkStatus>>) -> Self {
        status.send_replace(self.status.borrow().clone());
        self.status = status;
        self
    }

    pub fn settings(&self) -> &SupervisorSettings {
        &self.settings
    }

    pub fn current(&self) -> Option<&ForkInstanceInfo> {
        self.current.as_ref().map(|instance| &instance.info)
    }

    pub fn status(&self) -> watch::Receiver<ForkStatus> {
        self.status.subscribe()
    }

    /// Replaces the running fork with one taken from `endpoint` at `height`.
    ///
    /// The previous instance is stopped and the local port confirmed free
    /// before the new simulator is launched. On failure nothing is left
    /// running until the next call.
    pub async fn ensure_fork_at(
        &mut self,
        endpoint: &RemoteEndpoint,
        height: u64,
    ) -> Result<ForkInstanceInfo, ForkSyncError> {
        self.restart(endpoint, Some(height)).await
    }

    /// Same as [`ForkSupervisor::ensure_fork_at`] when the remote head is
    /// unknown; the simulator forks from the remote's latest block.
    pub async fn ensure_fork_latest(
        &mut self,
        endpoint: &RemoteEndpoint,
    ) -> Result<ForkInstanceInfo, ForkSyncError> {
        self.restart(endpoint, None).await
    }

    /// Stops the running instance, if any.
    pub async fn shutdown(&mut self) -> Result<()> {
        let stopped = self.stop_current().await;
        self.status.send_replace(ForkStatus::Down {
            reason: "supervisor shut down".to_owned(),
        });
        stopped
    }

    async fn restart(
        &mut self,
        endpoint: &RemoteEndpoint,
        height: Option<u64>,
    ) -> Result<ForkInstanceInfo, ForkSyncError> {
        self.telemetry.record_restart_started();
        self.status.send_replace(ForkStatus::Restarting { height });

        if let Err(err) = self.stop_current().await {
            // The port wait below decides whether the old process is really gone.
            tracing::warn!(error = %err, "failed to stop previous fork instance");
        }

        let fork_block = height.filter(|_| self.settings.pin_fork_block);
        let request = LaunchRequest {
            endpoint: endpoint.clone(),
            fork_block,
            host: self.settings.host.clone(),
            port: self.settings.port,
        };
        let launcher = self.launcher.clone();
        let settings = self.settings.clone();
        let shutdown = self.shutdown.clone();
        let launched =
            launch_with_retry(launcher.as_ref(), &settings, &request, height, &shutdown).await;

        match launched {
            Ok(process) => {
                self.generation += 1;
                let info = ForkInstanceInfo {
                    generation: self.generation,
                    endpoint: endpoint.clone(),
                    fork_block,
                    trigger_height: height,
                    host: self.settings.host.clone(),
                    port: self.settings.port,
                    pid: process.id(),
                    started_at: SystemTime::now(),
                };

                tracing::info!(
                    generation = info.generation,
                    endpoint = %endpoint,
                    fork_block = info.fork_block,
                    addr = %info.addr(),
                    pid = info.pid,
                    "fork instance running"
                );

                self.current = Some(ForkInstance {
                    process,
                    info: info.clone(),
                    started: Instant::now(),
                });
                self.telemetry.record_restart_succeeded();
                self.status.send_replace(ForkStatus::Running(info.clone()));
                Ok(info)
            }
            Err(err) => {
                let err = ForkSyncError::from_any(err, endpoint.as_str(), height);
                self.telemetry.record_restart_failed();
                self.status.send_replace(ForkStatus::Down {
                    reason: err.to_string(),
                });
                Err(err)
            }
        }
    }

    async fn stop_current(&mut self) -> Result<()> {
        let Some(mut instance) = self.current.take() else {
            return Ok(());
        };

        tracing::info!(
            generation = instance.info.generation,
            pid = instance.info.pid,
            uptime_ms = instance.started.elapsed().as_millis() as u64,
            "stopping fork instance"
        );
        instance.process.stop().await
    }
}

/// Runs [`launch_once`] under the configured restart backoff. Every failed
/// attempt is logged; cancellation of `shutdown` aborts the wait between
/// attempts.
async fn launch_with_retry(
    launcher: &dyn ForkLauncher,
    settings: &SupervisorSettings,
    request: &LaunchRequest,
    height: Option<u64>,
    shutdown: &CancellationToken,
) -> Result<Box<dyn ForkProcess>> {
    let backoff = RetryBackoff::new(
        settings.restart_initial_backoff,
        settings.restart_max_backoff,
    )
    .with_max_attempts(settings.restart_max_attempts)
    .with_cancellation(shutdown);

    retry_with_backoff(
        backoff,
        |_| launch_once(launcher, settings, request, height),
        |attempt, delay, err, will_retry| {
            if will_retry {
                tracing::warn!(
                    attempt,
                    backoff_ms = delay.as_millis() as u64,
                    height,
                    error = %err,
                    "fork restart failed; retrying"
                );
            } else {
                tracing::error!(
                    attempt,
                    height,
                    error = %err,
                    "fork restart failed; giving up until the next block"
                );
            }
        },
        |_, err| match err.downcast_ref::<ForkSyncError>() {
            Some(ForkSyncError::Cancelled) => RetryDisposition::Abort,
            _ => RetryDisposition::Retry,
        },
    )
    .await
}

/// One stop-free restart attempt: port released, simulator launched, and
/// accepting connections.
async fn launch_once(
    launcher: &dyn ForkLauncher,
    settings: &SupervisorSettings,
    request: &LaunchRequest,
    height: Option<u64>,
) -> Result<Box<dyn ForkProcess>> {
    let addr = request.addr();
    let fork_start =
        |err| ForkSyncError::fork_start(request.endpoint.as_str(), height, err);

    port::wait_for_port_release(
        &addr,
        settings.port_release_timeout,
        settings.readiness_poll_interval,
    )
    .await?;

    let mut process = launcher.launch(request).await.map_err(fork_start)?;

    if let Err(err) = port::wait_until_listening(
        process.as_mut(),
        &addr,
        settings.startup_timeout,
        settings.readiness_poll_interval,
    )
    .await
    {
        if let Err(stop_err) = process.stop().await {
            tracing::warn!(error = %stop_err, "failed to stop half-started simulator");
        }
        return Err(fork_start(err).into());
    }

    Ok(process)
}
