//! Shared retry context, logging helpers, and canned message templates used by
//! the RPC client to keep instrumentation consistent across operations.

use crate::rpc::circuit_breaker::CircuitState;
use anyhow::Error;
use std::time::Duration;

/// Logging labels that describe how a particular RPC method reports
/// circuit-breaker state, retry attempts, and exhaustion.
#[derive(Clone, Copy)]
pub(crate) struct RetryMessages {
    pub(crate) method: &'static str,
    pub(crate) circuit_open: &'static str,
    pub(crate) timeout: &'static str,
    pub(crate) retry: &'static str,
    pub(crate) exhausted: &'static str,
}

/// Context passed into `retry_with_breaker` carrying the endpoint label and
/// message templates.
#[derive(Clone, Copy)]
pub(crate) struct RetryContext<'a> {
    endpoint: &'a str,
    messages: &'a RetryMessages,
}

impl<'a> RetryContext<'a> {
    pub(crate) fn new(endpoint: &'a str, messages: &'a RetryMessages) -> Self {
        Self { endpoint, messages }
    }

    pub(crate) fn method(&self) -> &'static str {
        self.messages.method
    }

    pub(crate) fn log_permit(&self, state: CircuitState) {
        tracing::trace!(
            endpoint = self.endpoint,
            method = self.messages.method,
            breaker_state = ?state,
            "circuit breaker permit acquired"
        );
    }

    pub(crate) fn log_circuit_open(&self, err: &dyn std::fmt::Display) {
        tracing::debug!(
            endpoint = self.endpoint,
            method = self.messages.method,
            reason = %err,
            "{}",
            self.messages.circuit_open
        );
    }

    pub(crate) fn log_timeout(&self, attempt: usize, backoff: Duration) {
        tracing::warn!(
            endpoint = self.endpoint,
            method = self.messages.method,
            attempt,
            backoff_ms = duration_to_millis(backoff),
            "{}",
            self.messages.timeout
        );
    }

    pub(crate) fn log_retry(&self, attempt: usize, backoff: Duration, err: &Error) {
        tracing::warn!(
            endpoint = self.endpoint,
            method = self.messages.method,
            attempt,
            backoff_ms = duration_to_millis(backoff),
            error = %err,
            "{}",
            self.messages.retry
        );
    }

    pub(crate) fn log_exhausted(&self, attempt: usize, err: &Error) {
        tracing::debug!(
            endpoint = self.endpoint,
            method = self.messages.method,
            attempt,
            error = %err,
            "{}",
            self.messages.exhausted
        );
    }
}

fn duration_to_millis(backoff: Duration) -> u64 {
    backoff.as_millis().min(u128::from(u64::MAX)) as u64
}

pub(crate) const BLOCK_NUMBER_RETRY: RetryMessages = RetryMessages {
    method: "eth_blockNumber",
    circuit_open: "RPC circuit breaker open; skipping eth_blockNumber",
    timeout: "eth_blockNumber timed out; retrying",
    retry: "eth_blockNumber failed; retrying",
    exhausted: "eth_blockNumber exhausted retries",
};

pub(crate) const CHAIN_ID_RETRY: RetryMessages = RetryMessages {
    method: "eth_chainId",
    circuit_open: "RPC circuit breaker open; skipping eth_chainId",
    timeout: "eth_chainId timed out; retrying",
    retry: "eth_chainId failed; retrying",
    exhausted: "eth_chainId exhausted retries",
};
