//! Launching simulator processes. [`ForkLauncher`] is the seam the supervisor
//! restarts through; [`ProcessLauncher`] is the production implementation
//! that spawns `anvil` or `ganache`.

use crate::rpc::RemoteEndpoint;
use crate::runtime::config::ForkSyncConfig;
use anyhow::{anyhow, bail, Context, Result};
use futures::future::BoxFuture;
use std::fmt;
use std::process::Stdio;
use std::str::FromStr;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::time::timeout;

pub type LaunchFuture<'a> = BoxFuture<'a, Result<Box<dyn ForkProcess>>>;
pub type StopFuture<'a> = BoxFuture<'a, Result<()>>;

const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(10);

/// Everything a launcher needs to start one fork.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchRequest {
    pub endpoint: RemoteEndpoint,
    /// `None` forks from the remote's latest block.
    pub fork_block: Option<u64>,
    pub host: String,
    pub port: u16,
}

impl LaunchRequest {
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Starts simulator instances.
pub trait ForkLauncher: Send + Sync + 'static {
    /// Spawns a simulator for `request`. Resolving does not imply the
    /// instance is accepting connections yet.
    fn launch<'a>(&'a self, request: &'a LaunchRequest) -> LaunchFuture<'a>;
}

/// A launched simulator.
pub trait ForkProcess: Send + 'static {
    fn id(&self) -> Option<u32>;

    /// Returns a description of the exit status once the process has exited.
    fn try_exit_status(&mut self) -> Result<Option<String>>;

    /// Terminates the process and waits for it to exit.
    fn stop<'a>(&'a mut self) -> StopFuture<'a>;
}

/// Command line dialect of the simulator binary.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SimulatorFlavor {
    #[default]
    Anvil,
    Ganache,
}

impl SimulatorFlavor {
    /// Fork flags for `request`, without any extra user arguments.
    pub fn fork_args(&self, request: &LaunchRequest) -> Vec<String> {
        let (url_flag, block_flag, host_flag, port_flag) = match self {
            SimulatorFlavor::Anvil => ("--fork-url", "--fork-block-number", "--host", "--port"),
            SimulatorFlavor::Ganache => (
                "--fork.url",
                "--fork.blockNumber",
                "--server.host",
                "--server.port",
            ),
        };

        let mut args = vec![url_flag.to_owned(), request.endpoint.as_str().to_owned()];
        if let Some(block) = request.fork_block {
            args.push(block_flag.to_owned());
            args.push(block.to_string());
        }
        args.extend([
            host_flag.to_owned(),
            request.host.clone(),
            port_flag.to_owned(),
            request.port.to_string(),
        ]);
        args
    }
}

impl fmt::Display for SimulatorFlavor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SimulatorFlavor::Anvil => f.write_str("anvil"),
            SimulatorFlavor::Ganache => f.write_str("ganache"),
        }
    }
}

impl FromStr for SimulatorFlavor {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "anvil" => Ok(SimulatorFlavor::Anvil),
            "ganache" => Ok(SimulatorFlavor::Ganache),
            other => bail!("unknown simulator flavor '{other}' (expected anvil or ganache)"),
        }
    }
}

/// Spawns the simulator binary as a child process.
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    program: String,
    flavor: SimulatorFlavor,
    extra_args: Vec<String>,
    stop_timeout: Duration,
}

impl ProcessLauncher {
    pub fn new(program: impl Into<String>, flavor: SimulatorFlavor) -> Self {
        Self {
            program: program.into(),
            flavor,
            extra_args: Vec::new(),
            stop_timeout: DEFAULT_STOP_TIMEOUT,
        }
    }

    pub fn from_config(config: &ForkSyncConfig) -> Self {
        Self::new(config.simulator_bin(), config.simulator_flavor())
            .with_extra_args(config.simulator_args().iter().cloned())
    }

    pub fn with_extra_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.extra_args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_stop_timeout(mut self, stop_timeout: Duration) -> Self {
        self.stop_timeout = stop_timeout;
        self
    }

    /// Full argument list passed to the program for `request`.
    pub fn args(&self, request: &LaunchRequest) -> Vec<String> {
        let mut args = self.flavor.fork_args(request);
        args.extend(self.extra_args.iter().cloned());
        args
    }

    async fn spawn(&self, request: &LaunchRequest) -> Result<Box<dyn ForkProcess>> {
        let args = self.args(request);
        tracing::debug!(program = %self.program, ?args, "spawning simulator");

        let mut child = Command::new(&self.program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("failed to spawn simulator '{}'", self.program))?;

        let pid = child.id();
        tracing::info!(
            program = %self.program,
            pid,
            fork_block = request.fork_block,
            addr = %request.addr(),
            "simulator process started"
        );

        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(forward_output(stdout, pid, "stdout"));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_output(stderr, pid, "stderr"));
        }

        Ok(Box::new(ChildProcess {
            child,
            stop_timeout: self.stop_timeout,
        }))
    }
}

impl ForkLauncher for ProcessLauncher {
    fn launch<'a>(&'a self, request: &'a LaunchRequest) -> LaunchFuture<'a> {
        Box::pin(self.spawn(request))
    }
}

async fn forward_output<R>(stream: R, pid: Option<u32>, stream_name: &'static str)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(stream).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        tracing::debug!(target: "forksync::simulator", pid, stream = stream_name, "{line}");
    }
}

struct ChildProcess {
    child: Child,
    stop_timeout: Duration,
}

impl ChildProcess {
    async fn terminate(&mut self) -> Result<()> {
        if let Some(status) = self
            .child
            .try_wait()
            .context("failed to check simulator status")?
        {
            tracing::debug!(?status, "simulator already exited");
            return Ok(());
        }

        let pid = self.child.id();
        timeout(self.stop_timeout, self.child.kill())
            .await
            .map_err(|_| {
                anyhow!(
                    "simulator (pid {pid:?}) did not exit within {:?}",
                    self.stop_timeout
                )
            })?
            .context("failed to kill simulator")?;

        tracing::debug!(pid, "simulator process stopped");
        Ok(())
    }
}

impl ForkProcess for ChildProcess {
    fn id(&self) -> Option<u32> {
        self.child.id()
    }

    fn try_exit_status(&mut self) -> Result<Option<String>> {
        let status = self
            .child
            .try_wait()
            .context("failed to check simulator status")?;
        Ok(status.map(|status| status.to_string()))
    }

    fn stop<'a>(&'a mut self) -> StopFuture<'a> {
        Box::pin(self.terminate())
    }
}
