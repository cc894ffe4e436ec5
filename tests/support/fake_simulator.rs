use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::{Duration, Instant},
};

use anyhow::{anyhow, Result};
use forksync::{ForkLauncher, ForkProcess, LaunchFuture, LaunchRequest, StopFuture};
use tokio::net::TcpListener;
use tokio::time::sleep;

#[derive(Debug, Clone)]
pub struct LaunchRecord {
    pub fork_block: Option<u64>,
    pub endpoint: String,
    pub at: Instant,
}

#[derive(Default)]
struct LauncherState {
    launches: Mutex<Vec<LaunchRecord>>,
    active: AtomicUsize,
    max_active: AtomicUsize,
    failures_remaining: AtomicUsize,
}

/// In-process stand-in for anvil: "launching" binds the requested port after
/// an optional delay, stopping releases it.
#[derive(Clone, Default)]
pub struct FakeLauncher {
    state: Arc<LauncherState>,
    startup_delay: Duration,
}

impl FakeLauncher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_startup_delay(mut self, delay: Duration) -> Self {
        self.startup_delay = delay;
        self
    }

    /// The next `count` launches fail before binding the port.
    pub fn fail_next(&self, count: usize) {
        self.state.failures_remaining.store(count, Ordering::SeqCst);
    }

    pub fn launches(&self) -> Vec<LaunchRecord> {
        self.state
            .launches
            .lock()
            .expect("launch log lock poisoned")
            .clone()
    }

    pub fn fork_blocks(&self) -> Vec<Option<u64>> {
        self.launches()
            .into_iter()
            .map(|record| record.fork_block)
            .collect()
    }

    /// Instances currently holding the port.
    pub fn active(&self) -> usize {
        self.state.active.load(Ordering::SeqCst)
    }

    /// Highest number of simultaneously running instances observed.
    pub fn max_active(&self) -> usize {
        self.state.max_active.load(Ordering::SeqCst)
    }

    async fn spawn(&self, request: &LaunchRequest) -> Result<Box<dyn ForkProcess>> {
        self.state
            .launches
            .lock()
            .expect("launch log lock poisoned")
            .push(LaunchRecord {
                fork_block: request.fork_block,
                endpoint: request.endpoint.to_string(),
                at: Instant::now(),
            });

        if self
            .state
            .failures_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok()
        {
            return Err(anyhow!("fake simulator refused to start"));
        }

        if !self.startup_delay.is_zero() {
            sleep(self.startup_delay).await;
        }

        let listener = TcpListener::bind(request.addr()).await?;
        let active = self.state.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.state.max_active.fetch_max(active, Ordering::SeqCst);

        Ok(Box::new(FakeProcess {
            listener: Some(listener),
            state: self.state.clone(),
        }))
    }
}

impl ForkLauncher for FakeLauncher {
    fn launch<'a>(&'a self, request: &'a LaunchRequest) -> LaunchFuture<'a> {
        Box::pin(self.spawn(request))
    }
}

struct FakeProcess {
    listener: Option<TcpListener>,
    state: Arc<LauncherState>,
}

impl ForkProcess for FakeProcess {
    fn id(&self) -> Option<u32> {
        None
    }

    fn try_exit_status(&mut self) -> Result<Option<String>> {
        Ok(None)
    }

    fn stop<'a>(&'a mut self) -> StopFuture<'a> {
        Box::pin(async move {
            if self.listener.take().is_some() {
                self.state.active.fetch_sub(1, Ordering::SeqCst);
            }
            Ok(())
        })
    }
}

impl Drop for FakeProcess {
    fn drop(&mut self) {
        if self.listener.take().is_some() {
            self.state.active.fetch_sub(1, Ordering::SeqCst);
        }
    }
}
