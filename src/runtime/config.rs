use crate::rpc::endpoint::RemoteEndpoint;
use crate::runtime::telemetry;
use crate::supervisor::launcher::SimulatorFlavor;
use anyhow::{anyhow, bail, Context, Result};
use std::fmt::Display;
use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_LOCAL_HOST: &str = "127.0.0.1";
pub const DEFAULT_LOCAL_PORT: u16 = 1337;
pub const DEFAULT_SIMULATOR_BIN: &str = "anvil";
const DEFAULT_REMOTE_RPC_URL: &str = "http://localhost:8545";
const DEFAULT_POLL_INTERVAL_MS: u64 = 4_000;
const DEFAULT_RPC_TIMEOUT_SECS: u64 = 10;
const DEFAULT_STARTUP_TIMEOUT_SECS: u64 = 30;
const DEFAULT_PORT_RELEASE_TIMEOUT_SECS: u64 = 10;
const DEFAULT_READINESS_POLL_MS: u64 = 100;
const DEFAULT_RESTART_MAX_ATTEMPTS: usize = 3;
const DEFAULT_RESTART_INITIAL_BACKOFF_MS: u64 = 500;
const DEFAULT_RESTART_MAX_BACKOFF_SECS: u64 = 10;
const DEFAULT_RESUBSCRIBE_INITIAL_BACKOFF_SECS: u64 = 1;
const DEFAULT_RESUBSCRIBE_MAX_BACKOFF_SECS: u64 = 30;

/// Runtime configuration for the fork synchronisation service.
///
/// All instances must be constructed via [`ForkSyncConfig::builder`],
/// [`ForkSyncConfig::new`], or [`ForkSyncConfig::from_env`] so invariants are
/// validated before any consumer observes the values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForkSyncConfig {
    remote_endpoint: RemoteEndpoint,
    local_host: String,
    local_port: u16,
    simulator_bin: String,
    simulator_flavor: SimulatorFlavor,
    simulator_args: Vec<String>,
    pin_fork_block: bool,
    poll_interval: Duration,
    rpc_timeout: Duration,
    startup_timeout: Duration,
    port_release_timeout: Duration,
    readiness_poll_interval: Duration,
    restart_max_attempts: usize,
    restart_initial_backoff: Duration,
    restart_max_backoff: Duration,
    resubscribe_initial_backoff: Duration,
    resubscribe_max_backoff: Duration,
    metrics_interval: Duration,
}

pub struct ForkSyncConfigParams {
    pub remote_rpc_url: String,
    pub local_host: String,
    pub local_port: u16,
    pub simulator_bin: String,
    pub simulator_flavor: SimulatorFlavor,
    pub simulator_args: Vec<String>,
    pub pin_fork_block: bool,
    pub poll_interval: Duration,
    pub rpc_timeout: Duration,
    pub startup_timeout: Duration,
    pub port_release_timeout: Duration,
    pub readiness_poll_interval: Duration,
    pub restart_max_attempts: usize,
    pub restart_initial_backoff: Duration,
    pub restart_max_backoff: Duration,
    pub resubscribe_initial_backoff: Duration,
    pub resubscribe_max_backoff: Duration,
    pub metrics_interval: Duration,
}

impl ForkSyncConfig {
    /// Returns a builder to incrementally construct and validate a configuration.
    pub fn builder() -> ForkSyncConfigBuilder {
        ForkSyncConfigBuilder::default()
    }

    /// Constructs a configuration directly from the provided values.
    ///
    /// Prefer [`ForkSyncConfig::builder`] when most values use defaults.
    pub fn new(params: ForkSyncConfigParams) -> Result<Self> {
        let ForkSyncConfigParams {
            remote_rpc_url,
            local_host,
            local_port,
            simulator_bin,
            simulator_flavor,
            simulator_args,
            pin_fork_block,
            poll_interval,
            rpc_timeout,
            startup_timeout,
            port_release_timeout,
            readiness_poll_interval,
            restart_max_attempts,
            restart_initial_backoff,
            restart_max_backoff,
            resubscribe_initial_backoff,
            resubscribe_max_backoff,
            metrics_interval,
        } = params;

        let remote_endpoint =
            RemoteEndpoint::parse(&remote_rpc_url).context("invalid remote_rpc_url")?;

        let config = Self {
            remote_endpoint,
            local_host: local_host.trim().to_owned(),
            local_port,
            simulator_bin: simulator_bin.trim().to_owned(),
            simulator_flavor,
            simulator_args,
            pin_fork_block,
            poll_interval,
            rpc_timeout,
            startup_timeout,
            port_release_timeout,
            readiness_poll_interval,
            restart_max_attempts,
            restart_initial_backoff,
            restart_max_backoff,
            resubscribe_initial_backoff,
            resubscribe_max_backoff,
            metrics_interval,
        };

        config.validate()?;
        Ok(config)
    }

    /// Loads the configuration from `REMOTE_RPC_URL` and the `FORKSYNC_*`
    /// environment variables, falling back to defaults for unset values.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`ForkSyncConfig::from_env`] but reads variables through
    /// `lookup`, which keeps the process environment out of tests.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

        let mut builder = Self::builder().remote_rpc_url(
            var("REMOTE_RPC_URL").unwrap_or_else(|| DEFAULT_REMOTE_RPC_URL.to_owned()),
        );

        if let Some(host) = var("FORKSYNC_LOCAL_HOST") {
            builder = builder.local_host(host);
        }
        if let Some(port) = var("FORKSYNC_LOCAL_PORT") {
            builder = builder.local_port(parse_var("FORKSYNC_LOCAL_PORT", &port)?);
        }
        if let Some(bin) = var("FORKSYNC_SIMULATOR_BIN") {
            builder = builder.simulator_bin(bin);
        }
        if let Some(flavor) = var("FORKSYNC_SIMULATOR_FLAVOR") {
            builder = builder.simulator_flavor(parse_var("FORKSYNC_SIMULATOR_FLAVOR", &flavor)?);
        }
        if let Some(args) = var("FORKSYNC_SIMULATOR_ARGS") {
            builder = builder.simulator_args(args.split_whitespace().map(str::to_owned));
        }
        if let Some(pin) = var("FORKSYNC_PIN_FORK_BLOCK") {
            builder = builder.pin_fork_block(parse_bool("FORKSYNC_PIN_FORK_BLOCK", &pin)?);
        }
        if let Some(ms) = var("FORKSYNC_POLL_INTERVAL_MS") {
            builder = builder.poll_interval(Duration::from_millis(parse_var(
                "FORKSYNC_POLL_INTERVAL_MS",
                &ms,
            )?));
        }
        if let Some(secs) = var("FORKSYNC_RPC_TIMEOUT_SECS") {
            builder = builder.rpc_timeout(Duration::from_secs(parse_var(
                "FORKSYNC_RPC_TIMEOUT_SECS",
                &secs,
            )?));
        }
        if let Some(secs) = var("FORKSYNC_STARTUP_TIMEOUT_SECS") {
            builder = builder.startup_timeout(Duration::from_secs(parse_var(
                "FORKSYNC_STARTUP_TIMEOUT_SECS",
                &secs,
            )?));
        }
        if let Some(secs) = var("FORKSYNC_PORT_RELEASE_TIMEOUT_SECS") {
            builder = builder.port_release_timeout(Duration::from_secs(parse_var(
                "FORKSYNC_PORT_RELEASE_TIMEOUT_SECS",
                &secs,
            )?));
        }
        if let Some(ms) = var("FORKSYNC_READINESS_POLL_MS") {
            builder = builder.readiness_poll_interval(Duration::from_millis(parse_var(
                "FORKSYNC_READINESS_POLL_MS",
                &ms,
            )?));
        }
        if let Some(attempts) = var("FORKSYNC_RESTART_ATTEMPTS") {
            builder =
                builder.restart_max_attempts(parse_var("FORKSYNC_RESTART_ATTEMPTS", &attempts)?);
        }
        if let Some(secs) = var("FORKSYNC_METRICS_INTERVAL_SECS") {
            builder = builder.metrics_interval(Duration::from_secs(parse_var(
                "FORKSYNC_METRICS_INTERVAL_SECS",
                &secs,
            )?));
        }

        builder.build()
    }

    /// Upstream endpoint every fork is taken from.
    pub fn remote_endpoint(&self) -> &RemoteEndpoint {
        &self.remote_endpoint
    }

    pub fn local_host(&self) -> &str {
        &self.local_host
    }

    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    /// `host:port` the simulator binds to.
    pub fn local_addr(&self) -> String {
        format!("{}:{}", self.local_host, self.local_port)
    }

    /// Executable launched for each fork instance.
    pub fn simulator_bin(&self) -> &str {
        &self.simulator_bin
    }

    pub fn simulator_flavor(&self) -> SimulatorFlavor {
        self.simulator_flavor
    }

    /// Extra arguments appended after the generated fork flags.
    pub fn simulator_args(&self) -> &[String] {
        &self.simulator_args
    }

    /// Whether forks are pinned to the triggering block height rather than
    /// the remote's latest block at launch time.
    pub fn pin_fork_block(&self) -> bool {
        self.pin_fork_block
    }

    /// Interval between `eth_blockNumber` polls on HTTP endpoints.
    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    /// Per-request timeout applied to the remote RPC client.
    pub fn rpc_timeout(&self) -> Duration {
        self.rpc_timeout
    }

    /// Maximum time a launched simulator may take to accept connections.
    pub fn startup_timeout(&self) -> Duration {
        self.startup_timeout
    }

    /// Maximum time to wait for the local port to become bindable again.
    pub fn port_release_timeout(&self) -> Duration {
        self.port_release_timeout
    }

    pub fn readiness_poll_interval(&self) -> Duration {
        self.readiness_poll_interval
    }

    pub fn restart_max_attempts(&self) -> usize {
        self.restart_max_attempts
    }

    pub fn restart_initial_backoff(&self) -> Duration {
        self.restart_initial_backoff
    }

    pub fn restart_max_backoff(&self) -> Duration {
        self.restart_max_backoff
    }

    pub fn resubscribe_initial_backoff(&self) -> Duration {
        self.resubscribe_initial_backoff
    }

    pub fn resubscribe_max_backoff(&self) -> Duration {
        self.resubscribe_max_backoff
    }

    /// Interval used by the telemetry reporter.
    pub fn metrics_interval(&self) -> Duration {
        self.metrics_interval
    }

    /// Performs validation on an existing configuration instance.
    pub fn validate(&self) -> Result<()> {
        ensure_not_empty(&self.local_host, "local_host")?;
        ensure_not_empty(&self.simulator_bin, "simulator_bin")?;

        if self.local_port == 0 {
            bail!("local_port must be greater than 0");
        }

        for (value, field) in [
            (self.poll_interval, "poll_interval"),
            (self.rpc_timeout, "rpc_timeout"),
            (self.startup_timeout, "startup_timeout"),
            (self.port_release_timeout, "port_release_timeout"),
            (self.readiness_poll_interval, "readiness_poll_interval"),
            (self.restart_initial_backoff, "restart_initial_backoff"),
            (self.resubscribe_initial_backoff, "resubscribe_initial_backoff"),
            (self.metrics_interval, "metrics_interval"),
        ] {
            if value.is_zero() {
                bail!("{field} must be greater than 0");
            }
        }

        if self.restart_max_attempts == 0 {
            bail!("restart_max_attempts must be greater than 0");
        }

        if self.restart_initial_backoff > self.restart_max_backoff {
            bail!(
                "restart_initial_backoff ({:?}) must not exceed restart_max_backoff ({:?})",
                self.restart_initial_backoff,
                self.restart_max_backoff
            );
        }

        if self.resubscribe_initial_backoff > self.resubscribe_max_backoff {
            bail!(
                "resubscribe_initial_backoff ({:?}) must not exceed resubscribe_max_backoff ({:?})",
                self.resubscribe_initial_backoff,
                self.resubscribe_max_backoff
            );
        }

        Ok(())
    }
}

#[derive(Debug, Default, Clone)]
pub struct ForkSyncConfigBuilder {
    remote_rpc_url: Option<String>,
    local_host: Option<String>,
    local_port: Option<u16>,
    simulator_bin: Option<String>,
    simulator_flavor: Option<SimulatorFlavor>,
    simulator_args: Vec<String>,
    pin_fork_block: Option<bool>,
    poll_interval: Option<Duration>,
    rpc_timeout: Option<Duration>,
    startup_timeout: Option<Duration>,
    port_release_timeout: Option<Duration>,
    readiness_poll_interval: Option<Duration>,
    restart_max_attempts: Option<usize>,
    restart_initial_backoff: Option<Duration>,
    restart_max_backoff: Option<Duration>,
    resubscribe_initial_backoff: Option<Duration>,
    resubscribe_max_backoff: Option<Duration>,
    metrics_interval: Option<Duration>,
}

impl ForkSyncConfigBuilder {
    pub fn remote_rpc_url(mut self, url: impl Into<String>) -> Self {
        self.remote_rpc_url = Some(url.into());
        self
    }

    pub fn local_host(mut self, host: impl Into<String>) -> Self {
        self.local_host = Some(host.into());
        self
    }

    pub fn local_port(mut self, port: u16) -> Self {
        self.local_port = Some(port);
        self
    }

    pub fn simulator_bin(mut self, bin: impl Into<String>) -> Self {
        self.simulator_bin = Some(bin.into());
        self
    }

    pub fn simulator_flavor(mut self, flavor: SimulatorFlavor) -> Self {
        self.simulator_flavor = Some(flavor);
        self
    }

    pub fn simulator_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.simulator_args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn pin_fork_block(mut self, pin: bool) -> Self {
        self.pin_fork_block = Some(pin);
        self
    }

    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = Some(interval);
        self
    }

    pub fn rpc_timeout(mut self, timeout: Duration) -> Self {
        self.rpc_timeout = Some(timeout);
        self
    }

    pub fn startup_timeout(mut self, timeout: Duration) -> Self {
        self.startup_timeout = Some(timeout);
        self
    }

    pub fn port_release_timeout(mut self, timeout: Duration) -> Self {
        self.port_release_timeout = Some(timeout);
        self
    }

    pub fn readiness_poll_interval(mut self, interval: Duration) -> Self {
        self.readiness_poll_interval = Some(interval);
        self
    }

    pub fn restart_max_attempts(mut self, attempts: usize) -> Self {
        self.restart_max_attempts = Some(attempts);
        self
    }

    pub fn restart_backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.restart_initial_backoff = Some(initial);
        self.restart_max_backoff = Some(max);
        self
    }

    pub fn resubscribe_backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.resubscribe_initial_backoff = Some(initial);
        self.resubscribe_max_backoff = Some(max);
        self
    }

    pub fn metrics_interval(mut self, interval: Duration) -> Self {
        self.metrics_interval = Some(interval);
        self
    }

    pub fn build(self) -> Result<ForkSyncConfig> {
        let params = ForkSyncConfigParams {
            remote_rpc_url: self.remote_rpc_url.context("remote_rpc_url is required")?,
            local_host: self
                .local_host
                .unwrap_or_else(|| DEFAULT_LOCAL_HOST.to_owned()),
            local_port: self.local_port.unwrap_or(DEFAULT_LOCAL_PORT),
            simulator_bin: self
                .simulator_bin
                .unwrap_or_else(|| DEFAULT_SIMULATOR_BIN.to_owned()),
            simulator_flavor: self.simulator_flavor.unwrap_or_default(),
            simulator_args: self.simulator_args,
            pin_fork_block: self.pin_fork_block.unwrap_or(true),
            poll_interval: self
                .poll_interval
                .unwrap_or_else(|| Duration::from_millis(DEFAULT_POLL_INTERVAL_MS)),
            rpc_timeout: self
                .rpc_timeout
                .unwrap_or_else(|| Duration::from_secs(DEFAULT_RPC_TIMEOUT_SECS)),
            startup_timeout: self
                .startup_timeout
                .unwrap_or_else(|| Duration::from_secs(DEFAULT_STARTUP_TIMEOUT_SECS)),
            port_release_timeout: self
                .port_release_timeout
                .unwrap_or_else(|| Duration::from_secs(DEFAULT_PORT_RELEASE_TIMEOUT_SECS)),
            readiness_poll_interval: self
                .readiness_poll_interval
                .unwrap_or_else(|| Duration::from_millis(DEFAULT_READINESS_POLL_MS)),
            restart_max_attempts: self
                .restart_max_attempts
                .unwrap_or(DEFAULT_RESTART_MAX_ATTEMPTS),
            restart_initial_backoff: self
                .restart_initial_backoff
                .unwrap_or_else(|| Duration::from_millis(DEFAULT_RESTART_INITIAL_BACKOFF_MS)),
            restart_max_backoff: self
                .restart_max_backoff
                .unwrap_or_else(|| Duration::from_secs(DEFAULT_RESTART_MAX_BACKOFF_SECS)),
            resubscribe_initial_backoff: self
                .resubscribe_initial_backoff
                .unwrap_or_else(|| Duration::from_secs(DEFAULT_RESUBSCRIBE_INITIAL_BACKOFF_SECS)),
            resubscribe_max_backoff: self
                .resubscribe_max_backoff
                .unwrap_or_else(|| Duration::from_secs(DEFAULT_RESUBSCRIBE_MAX_BACKOFF_SECS)),
            metrics_interval: self
                .metrics_interval
                .unwrap_or(telemetry::DEFAULT_METRICS_INTERVAL),
        };

        ForkSyncConfig::new(params)
    }
}

fn ensure_not_empty(value: &str, field: &str) -> Result<()> {
    if value.trim().is_empty() {
        bail!("{field} cannot be empty");
    }
    Ok(())
}

fn parse_var<T>(key: &str, value: &str) -> Result<T>
where
    T: FromStr,
    T::Err: Display,
{
    value
        .trim()
        .parse::<T>()
        .map_err(|err| anyhow!("failed to parse {key}='{value}': {err}"))
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => bail!("failed to parse {key}='{value}': expected true or false"),
    }
}
