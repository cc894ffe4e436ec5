//! Error taxonomy surfaced by the watcher, the supervisor, and the runner.
//!
//! None of these errors is fatal for the service: they are logged and the next
//! block event retries implicitly.

use anyhow::Error as AnyError;
use std::fmt;

#[derive(Debug)]
pub enum ForkSyncError {
    /// The remote endpoint could not be reached while subscribing or probing.
    Connection { endpoint: String, source: AnyError },
    /// The local port was still held after the previous instance stopped.
    PortBind { addr: String, reason: String },
    /// The simulator could not fork from the remote endpoint.
    ForkStart {
        endpoint: String,
        height: Option<u64>,
        source: AnyError,
    },
    /// A restart was interrupted by a shutdown request.
    Cancelled,
}

impl ForkSyncError {
    pub fn connection(endpoint: impl Into<String>, source: AnyError) -> Self {
        Self::Connection {
            endpoint: endpoint.into(),
            source,
        }
    }

    pub fn port_bind(addr: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::PortBind {
            addr: addr.into(),
            reason: reason.into(),
        }
    }

    pub fn fork_start(endpoint: impl Into<String>, height: Option<u64>, source: AnyError) -> Self {
        Self::ForkStart {
            endpoint: endpoint.into(),
            height,
            source,
        }
    }

    /// Short, stable label used in structured logs.
    pub fn kind(&self) -> &'static str {
        match self {
            ForkSyncError::Connection { .. } => "connection",
            ForkSyncError::PortBind { .. } => "port_bind",
            ForkSyncError::ForkStart { .. } => "fork_start",
            ForkSyncError::Cancelled => "cancelled",
        }
    }

    /// Recovers a typed error from an `anyhow` chain, classifying anything
    /// unrecognised as a fork start failure.
    pub(crate) fn from_any(err: AnyError, endpoint: &str, height: Option<u64>) -> Self {
        match err.downcast::<ForkSyncError>() {
            Ok(typed) => typed,
            Err(other) => Self::fork_start(endpoint, height, other),
        }
    }
}

impl fmt::Display for ForkSyncError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ForkSyncError::Connection { endpoint, source } => {
                write!(f, "failed to connect to remote endpoint {endpoint}: {source:#}")
            }
            ForkSyncError::PortBind { addr, reason } => {
                write!(f, "local port {addr} could not be rebound: {reason}")
            }
            ForkSyncError::ForkStart {
                endpoint,
                height: Some(height),
                source,
            } => write!(
                f,
                "failed to start fork of {endpoint} at block {height}: {source:#}"
            ),
            ForkSyncError::ForkStart {
                endpoint,
                height: None,
                source,
            } => write!(f, "failed to start fork of {endpoint}: {source:#}"),
            ForkSyncError::Cancelled => write!(f, "fork restart cancelled"),
        }
    }
}

impl std::error::Error for ForkSyncError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ForkSyncError::Connection { source, .. } | ForkSyncError::ForkStart { source, .. } => {
                Some(source.as_ref())
            }
            _ => None,
        }
    }
}
