use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio::{select, time};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

/// Default interval used by the metrics reporter task.
pub const DEFAULT_METRICS_INTERVAL: Duration = Duration::from_secs(30);

static TRACING_INIT: OnceLock<()> = OnceLock::new();

/// Installs a basic tracing subscriber (if one is not already active).
///
/// The subscriber honours `RUST_LOG` if it is present, otherwise it falls back to `info`.
/// Calling this function multiple times is harmless.
pub fn init_tracing() {
    if TRACING_INIT.get().is_some() {
        return;
    }

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .try_init();

    let _ = TRACING_INIT.set(());
}

/// Monotonic counters describing what the service has done since start.
#[derive(Default, Debug)]
pub struct Telemetry {
    blocks_observed: AtomicU64,
    events_superseded: AtomicU64,
    restarts_started: AtomicU64,
    restarts_succeeded: AtomicU64,
    restarts_failed: AtomicU64,
    rpc_errors: AtomicU64,
    rpc_timeouts: AtomicU64,
}

impl Telemetry {
    pub fn record_block_observed(&self) {
        self.blocks_observed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_event_superseded(&self) {
        self.events_superseded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_restart_started(&self) {
        self.restarts_started.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_restart_succeeded(&self) {
        self.restarts_succeeded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_restart_failed(&self) {
        self.restarts_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rpc_error(&self) {
        self.rpc_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Timeouts also count towards `rpc_errors`.
    pub fn record_rpc_timeout(&self) {
        self.rpc_timeouts.fetch_add(1, Ordering::Relaxed);
        self.rpc_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> TelemetrySnapshot {
        TelemetrySnapshot {
            blocks_observed: self.blocks_observed.load(Ordering::Relaxed),
            events_superseded: self.events_superseded.load(Ordering::Relaxed),
            restarts_started: self.restarts_started.load(Ordering::Relaxed),
            restarts_succeeded: self.restarts_succeeded.load(Ordering::Relaxed),
            restarts_failed: self.restarts_failed.load(Ordering::Relaxed),
            rpc_errors: self.rpc_errors.load(Ordering::Relaxed),
            rpc_timeouts: self.rpc_timeouts.load(Ordering::Relaxed),
        }
    }

    pub fn blocks_observed(&self) -> u64 {
        self.blocks_observed.load(Ordering::Relaxed)
    }

    pub fn events_superseded(&self) -> u64 {
        self.events_superseded.load(Ordering::Relaxed)
    }

    pub fn restarts_succeeded(&self) -> u64 {
        self.restarts_succeeded.load(Ordering::Relaxed)
    }

    pub fn restarts_failed(&self) -> u64 {
        self.restarts_failed.load(Ordering::Relaxed)
    }

    pub fn rpc_errors(&self) -> u64 {
        self.rpc_errors.load(Ordering::Relaxed)
    }

    pub fn rpc_timeouts(&self) -> u64 {
        self.rpc_timeouts.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct TelemetrySnapshot {
    pub blocks_observed: u64,
    pub events_superseded: u64,
    pub restarts_started: u64,
    pub restarts_succeeded: u64,
    pub restarts_failed: u64,
    pub rpc_errors: u64,
    pub rpc_timeouts: u64,
}

/// Spawns a background task that periodically logs block, restart, and RPC counters.
pub fn spawn_metrics_reporter(
    telemetry: Arc<Telemetry>,
    shutdown: CancellationToken,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately; skip it so the first report
        // covers a full interval.
        ticker.tick().await;

        let mut last_snapshot = telemetry.snapshot();

        loop {
            select! {
                _ = shutdown.cancelled() => {
                    tracing::info!(target: "forksync::metrics", "metrics reporter shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    let current = telemetry.snapshot();

                    tracing::info!(
                        target: "forksync::metrics",
                        blocks_observed = current.blocks_observed,
                        blocks_delta = current
                            .blocks_observed
                            .saturating_sub(last_snapshot.blocks_observed),
                        events_superseded = current.events_superseded,
                        restarts_started = current.restarts_started,
                        restarts_succeeded = current.restarts_succeeded,
                        restarts_failed = current.restarts_failed,
                        rpc_errors = current.rpc_errors,
                        rpc_timeouts = current.rpc_timeouts,
                        "runtime metrics snapshot"
                    );

                    last_snapshot = current;
                }
            }
        }
    })
}
