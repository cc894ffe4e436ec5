use std::{sync::Arc, time::Duration};

use crate::support::{
    fake_simulator::FakeLauncher,
    helpers::{fast_config, free_port, init_tracing, wait_until},
};
use anyhow::Result;
use forksync::{
    BlockEvent, ForkStatus, ForkSupervisor, RemoteEndpoint, RestartSlot, SupervisorSettings,
    Telemetry,
};
use tokio_util::sync::CancellationToken;

async fn supervisor(launcher: &FakeLauncher) -> Result<(ForkSupervisor, RemoteEndpoint)> {
    let config = fast_config("http://127.0.0.1:8545", free_port().await?).build()?;
    let supervisor = ForkSupervisor::new(
        Arc::new(launcher.clone()),
        SupervisorSettings::from_config(&config),
        Arc::new(Telemetry::default()),
        CancellationToken::new(),
    );
    Ok((supervisor, config.remote_endpoint().clone()))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn burst_of_blocks_never_runs_two_forks() -> Result<()> {
    init_tracing();
    let launcher = FakeLauncher::new().with_startup_delay(Duration::from_millis(50));
    let (mut supervisor, endpoint) = supervisor(&launcher).await?;
    let status = supervisor.status();
    let slot = Arc::new(RestartSlot::new());
    let shutdown = CancellationToken::new();

    let worker = tokio::spawn({
        let slot = slot.clone();
        let shutdown = shutdown.clone();
        async move {
            loop {
                let event = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    event = slot.next() => event,
                };
                supervisor.ensure_fork_at(&endpoint, event.height).await?;
            }
            supervisor.shutdown().await
        }
    });

    let mut superseded = 0;
    for height in 1..=20u64 {
        if slot.offer(BlockEvent::new(height, None)).is_some() {
            superseded += 1;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    wait_until(Duration::from_secs(5), "fork at 20", || {
        status.borrow().running().map(|info| info.fork_block) == Some(Some(20))
    })
    .await?;

    let blocks: Vec<u64> = launcher.fork_blocks().into_iter().flatten().collect();
    assert_eq!(launcher.max_active(), 1);
    assert_eq!(blocks.last().copied(), Some(20));
    assert!(blocks.windows(2).all(|pair| pair[0] < pair[1]), "{blocks:?}");
    let launches = launcher.launches();
    assert!(launches.windows(2).all(|pair| pair[0].at <= pair[1].at));
    assert!(superseded > 0, "a 50ms startup should coalesce some of 20 blocks");
    assert_eq!(blocks.len() + superseded, 20);

    shutdown.cancel();
    worker.await??;
    assert_eq!(launcher.active(), 0);
    assert!(matches!(*status.borrow(), ForkStatus::Down { .. }));
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn latest_fork_then_pinned_fork() -> Result<()> {
    init_tracing();
    let launcher = FakeLauncher::new();
    let (mut supervisor, endpoint) = supervisor(&launcher).await?;

    let latest = supervisor.ensure_fork_latest(&endpoint).await?;
    assert_eq!(latest.fork_block, None);
    assert_eq!(latest.trigger_height, None);

    let pinned = supervisor.ensure_fork_at(&endpoint, 12).await?;
    assert_eq!(pinned.fork_block, Some(12));
    assert_eq!(pinned.generation, latest.generation + 1);
    assert_eq!(launcher.fork_blocks(), vec![None, Some(12)]);
    assert_eq!(launcher.max_active(), 1);

    supervisor.shutdown().await?;
    assert_eq!(launcher.active(), 0);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn failed_restart_recovers_on_next_block() -> Result<()> {
    init_tracing();
    let launcher = FakeLauncher::new();
    let (mut supervisor, endpoint) = supervisor(&launcher).await?;
    let attempts = supervisor.settings().restart_max_attempts;

    supervisor.ensure_fork_at(&endpoint, 1).await?;
    launcher.fail_next(attempts);

    let err = supervisor
        .ensure_fork_at(&endpoint, 2)
        .await
        .expect_err("every attempt fails");
    assert_eq!(err.kind(), "fork_start");
    assert_eq!(launcher.active(), 0);
    assert!(supervisor.current().is_none());

    let info = supervisor.ensure_fork_at(&endpoint, 3).await?;
    assert_eq!(info.fork_block, Some(3));
    assert_eq!(launcher.active(), 1);

    supervisor.shutdown().await?;
    Ok(())
}
