use super::launcher::ForkProcess;
use crate::rpc::RemoteEndpoint;
use std::fmt;
use std::time::{Instant, SystemTime};

/// Observable description of a running fork instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForkInstanceInfo {
    /// Sequence number of successful starts within this service run, from 1.
    pub generation: u64,
    pub endpoint: RemoteEndpoint,
    /// Block height the fork is pinned to, `None` when it forked "latest".
    pub fork_block: Option<u64>,
    /// Remote head that triggered the restart, when known.
    pub trigger_height: Option<u64>,
    pub host: String,
    pub port: u16,
    pub pid: Option<u32>,
    pub started_at: SystemTime,
}

impl ForkInstanceInfo {
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Supervisor view of the fork, published over a watch channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ForkStatus {
    Idle,
    Restarting { height: Option<u64> },
    Running(ForkInstanceInfo),
    Down { reason: String },
}

impl ForkStatus {
    pub fn running(&self) -> Option<&ForkInstanceInfo> {
        match self {
            ForkStatus::Running(info) => Some(info),
            _ => None,
        }
    }
}

impl fmt::Display for ForkStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ForkStatus::Idle => f.write_str("idle"),
            ForkStatus::Restarting { height: Some(height) } => {
                write!(f, "restarting at block {height}")
            }
            ForkStatus::Restarting { height: None } => f.write_str("restarting at latest"),
            ForkStatus::Running(info) => write!(
                f,
                "running generation {} on {}",
                info.generation,
                info.addr()
            ),
            ForkStatus::Down { reason } => write!(f, "down: {reason}"),
        }
    }
}

/// The live simulator owned by the supervisor.
pub(crate) struct ForkInstance {
    pub(crate) process: Box<dyn ForkProcess>,
    pub(crate) info: ForkInstanceInfo,
    pub(crate) started: Instant,
}
