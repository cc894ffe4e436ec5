use anyhow::{Context, Result};
use forksync::{init_tracing, ForkSyncConfig, Runner};

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let config = ForkSyncConfig::from_env().context("invalid forksync configuration")?;
    tracing::info!(
        remote = %config.remote_endpoint(),
        local = %config.local_addr(),
        simulator = config.simulator_bin(),
        flavor = %config.simulator_flavor(),
        "starting forksync"
    );

    let mut runner = Runner::new(config);
    runner.run_until_ctrl_c().await
}
