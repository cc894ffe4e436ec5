use std::{sync::Arc, time::Duration};

use crate::support::{
    fake_simulator::FakeLauncher,
    helpers::{fast_config, free_port, init_tracing, wait_until},
    mock_rpc::{MockChain, MockRpcServer},
};
use anyhow::Result;
use forksync::{ForkStatus, Runner};
use tokio::sync::watch;

fn running_block(status: &watch::Receiver<ForkStatus>) -> Option<Option<u64>> {
    status.borrow().running().map(|info| info.fork_block)
}

async fn wait_for_fork(status: &watch::Receiver<ForkStatus>, height: u64) -> Result<()> {
    wait_until(Duration::from_secs(5), &format!("fork at {height}"), || {
        running_block(status) == Some(Some(height))
    })
    .await
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn fork_follows_each_new_head() -> Result<()> {
    init_tracing();
    let chain = MockChain::new(99);
    let server = MockRpcServer::start(chain.clone()).await?;
    let launcher = FakeLauncher::new();
    let config = fast_config(&server.ws_url(), free_port().await?).build()?;

    let mut runner = Runner::with_launcher(config, Arc::new(launcher.clone()));
    runner.start().await?;
    let status = runner.status();
    wait_for_fork(&status, 99).await?;

    wait_until(Duration::from_secs(2), "newHeads subscriber", || {
        chain.subscriber_count() > 0
    })
    .await?;

    for height in [100, 101, 105] {
        chain.push_head(height);
        wait_for_fork(&status, height).await?;
    }

    assert_eq!(
        launcher.fork_blocks(),
        vec![Some(99), Some(100), Some(101), Some(105)]
    );
    assert_eq!(launcher.max_active(), 1);
    assert_eq!(launcher.active(), 1);
    assert!(launcher
        .launches()
        .iter()
        .all(|record| record.endpoint == server.ws_url()));

    let generation = status.borrow().running().map(|info| info.generation);
    assert_eq!(generation, Some(4));

    let metrics = runner.telemetry().snapshot();
    assert_eq!(metrics.blocks_observed, 3);
    assert_eq!(metrics.restarts_succeeded, 4);

    runner.stop().await?;
    server.shutdown().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn newer_block_supersedes_pending_restart() -> Result<()> {
    init_tracing();
    let chain = MockChain::new(99);
    let server = MockRpcServer::start(chain.clone()).await?;
    let launcher = FakeLauncher::new().with_startup_delay(Duration::from_millis(300));
    let config = fast_config(&server.ws_url(), free_port().await?)
        .startup_timeout(Duration::from_secs(3))
        .build()?;

    let mut runner = Runner::with_launcher(config, Arc::new(launcher.clone()));
    runner.start().await?;
    let status = runner.status();
    wait_for_fork(&status, 99).await?;
    wait_until(Duration::from_secs(2), "newHeads subscriber", || {
        chain.subscriber_count() > 0
    })
    .await?;

    // 101 arrives while 100 is starting: it waits, then replaces 100.
    chain.push_head(100);
    wait_until(Duration::from_secs(2), "launch for 100", || {
        launcher.fork_blocks().contains(&Some(100))
    })
    .await?;
    chain.push_head(101);
    wait_until(Duration::from_secs(2), "launch for 101", || {
        launcher.fork_blocks().contains(&Some(101))
    })
    .await?;

    // 102 and 103 both arrive during 101's restart; only 103 is applied.
    chain.push_head(102);
    chain.push_head(103);
    wait_for_fork(&status, 103).await?;

    assert_eq!(
        launcher.fork_blocks(),
        vec![Some(99), Some(100), Some(101), Some(103)]
    );
    assert_eq!(launcher.max_active(), 1);
    assert_eq!(runner.telemetry().events_superseded(), 1);

    runner.stop().await?;
    server.shutdown().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn unreachable_remote_at_startup_is_not_fatal() -> Result<()> {
    init_tracing();
    let remote_port = free_port().await?;
    let remote_addr = format!("127.0.0.1:{remote_port}");
    let launcher = FakeLauncher::new();
    let config = fast_config(&format!("ws://{remote_addr}"), free_port().await?).build()?;

    let mut runner = Runner::with_launcher(config, Arc::new(launcher.clone()));
    runner.start().await?;
    let status = runner.status();

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(*status.borrow(), ForkStatus::Idle);
    assert!(launcher.launches().is_empty());

    // The remote comes up later; attaching forks at its current head
    // without waiting for a new block.
    let chain = MockChain::new(40);
    let server = MockRpcServer::start_on(&remote_addr, chain.clone()).await?;
    wait_for_fork(&status, 40).await?;
    assert_eq!(launcher.fork_blocks(), vec![Some(40)]);
    assert_eq!(runner.telemetry().blocks_observed(), 0);

    wait_until(Duration::from_secs(2), "late newHeads subscriber", || {
        chain.subscriber_count() > 0
    })
    .await?;
    chain.push_head(41);
    wait_for_fork(&status, 41).await?;
    assert_eq!(launcher.fork_blocks(), vec![Some(40), Some(41)]);

    runner.stop().await?;
    server.shutdown().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn block_during_initial_fork_is_not_lost() -> Result<()> {
    init_tracing();
    let chain = MockChain::new(99);
    let server = MockRpcServer::start(chain.clone()).await?;
    let launcher = FakeLauncher::new().with_startup_delay(Duration::from_millis(300));
    let config = fast_config(&server.ws_url(), free_port().await?)
        .startup_timeout(Duration::from_secs(3))
        .build()?;

    // 100 is produced while the fork at 99 is still starting, before any
    // watcher is attached.
    let producer = tokio::spawn({
        let chain = chain.clone();
        async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            chain.push_head(100);
        }
    });

    let mut runner = Runner::with_launcher(config, Arc::new(launcher.clone()));
    runner.start().await?;
    producer.await?;
    let status = runner.status();

    wait_for_fork(&status, 100).await?;
    assert_eq!(launcher.fork_blocks(), vec![Some(99), Some(100)]);
    assert_eq!(launcher.max_active(), 1);

    runner.stop().await?;
    server.shutdown().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn resubscribing_catches_up_to_the_current_head() -> Result<()> {
    init_tracing();
    let chain = MockChain::new(50);
    let server = MockRpcServer::start(chain.clone()).await?;
    let addr = server.ws_url().trim_start_matches("ws://").to_owned();
    let launcher = FakeLauncher::new();
    let config = fast_config(&server.ws_url(), free_port().await?).build()?;

    let mut runner = Runner::with_launcher(config, Arc::new(launcher.clone()));
    runner.start().await?;
    let status = runner.status();
    wait_for_fork(&status, 50).await?;

    // The head moves while the remote is down; nobody is subscribed then.
    server.shutdown().await;
    chain.push_head(53);
    let server = MockRpcServer::start_on(&addr, chain.clone()).await?;

    wait_for_fork(&status, 53).await?;
    assert_eq!(launcher.fork_blocks(), vec![Some(50), Some(53)]);
    assert_eq!(launcher.max_active(), 1);

    runner.stop().await?;
    server.shutdown().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn http_remote_is_polled() -> Result<()> {
    init_tracing();
    let chain = MockChain::new(7);
    let server = MockRpcServer::start(chain.clone()).await?;
    let launcher = FakeLauncher::new();
    let config = fast_config(&server.http_url(), free_port().await?).build()?;

    let mut runner = Runner::with_launcher(config, Arc::new(launcher.clone()));
    runner.start().await?;
    let status = runner.status();
    wait_for_fork(&status, 7).await?;

    // 9 is reached whether the poller sees it as a new block or reads it as
    // the head when it attaches.
    chain.push_head(9);
    wait_for_fork(&status, 9).await?;

    let blocks: Vec<u64> = launcher.fork_blocks().into_iter().flatten().collect();
    assert_eq!(blocks.first().copied(), Some(7));
    assert!(blocks.windows(2).all(|pair| pair[0] < pair[1]), "{blocks:?}");
    assert_eq!(launcher.max_active(), 1);

    runner.stop().await?;
    server.shutdown().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn unpinned_forks_follow_latest() -> Result<()> {
    init_tracing();
    let chain = MockChain::new(3);
    let server = MockRpcServer::start(chain.clone()).await?;
    let launcher = FakeLauncher::new();
    let config = fast_config(&server.ws_url(), free_port().await?)
        .pin_fork_block(false)
        .build()?;

    let mut runner = Runner::with_launcher(config, Arc::new(launcher.clone()));
    runner.start().await?;
    let status = runner.status();
    wait_until(Duration::from_secs(5), "unpinned fork", || {
        running_block(&status) == Some(None)
    })
    .await?;

    let trigger = status.borrow().running().and_then(|info| info.trigger_height);
    assert_eq!(trigger, Some(3));
    assert_eq!(launcher.fork_blocks(), vec![None]);

    runner.stop().await?;
    server.shutdown().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn stop_releases_the_fork_and_runner_restarts() -> Result<()> {
    init_tracing();
    let chain = MockChain::new(20);
    let server = MockRpcServer::start(chain.clone()).await?;
    let launcher = FakeLauncher::new();
    let config = fast_config(&server.ws_url(), free_port().await?).build()?;

    let mut runner = Runner::with_launcher(config, Arc::new(launcher.clone()));
    runner.start().await?;
    let status = runner.status();
    wait_for_fork(&status, 20).await?;

    runner.stop().await?;
    assert_eq!(launcher.active(), 0);
    assert!(matches!(*status.borrow(), ForkStatus::Down { .. }));
    assert!(!runner.cancellation_token().is_cancelled());

    chain.push_head(21);
    runner.start().await?;
    wait_for_fork(&status, 21).await?;
    assert_eq!(launcher.max_active(), 1);

    runner.stop().await?;
    assert_eq!(launcher.active(), 0);
    server.shutdown().await;
    Ok(())
}
