//! RPC client for the remote chain endpoint. Wraps a `jsonrpsee` HTTP or
//! WebSocket client with per-request timeouts, bounded retries, and the shared
//! circuit breaker.

use crate::rpc::circuit_breaker::RpcCircuitBreaker;
use crate::rpc::endpoint::{EndpointTransport, RemoteEndpoint};
use crate::rpc::helpers::parse_quantity;
use crate::rpc::options::RpcClientOptions;
use crate::rpc::retry::{RetryContext, BLOCK_NUMBER_RETRY, CHAIN_ID_RETRY};
use crate::runtime::telemetry::Telemetry;
use anyhow::{anyhow, Context, Result};
use jsonrpsee::core::client::{
    ClientT, Error as JsonRpcError, Subscription, SubscriptionClientT,
};
use jsonrpsee::core::params::ArrayParams;
use jsonrpsee::http_client::{HttpClient, HttpClientBuilder};
use jsonrpsee::rpc_params;
use jsonrpsee::ws_client::{WsClient, WsClientBuilder};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::{future::Future, sync::Arc, time::Duration};
use tokio::time::{sleep, timeout};

#[derive(Debug)]
pub enum RpcError {
    Timeout { method: &'static str },
    CircuitOpen,
    InvalidQuantity { value: String },
    SubscriptionUnsupported,
}

impl std::fmt::Display for RpcError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RpcError::Timeout { method } => write!(f, "rpc method {method} timed out"),
            RpcError::CircuitOpen => write!(f, "rpc circuit breaker is open"),
            RpcError::InvalidQuantity { value } => {
                write!(f, "invalid hex quantity {value:?} in rpc response")
            }
            RpcError::SubscriptionUnsupported => {
                write!(f, "subscriptions require a ws:// or wss:// endpoint")
            }
        }
    }
}

impl std::error::Error for RpcError {}

#[derive(Clone)]
enum Transport {
    Http(HttpClient),
    WebSocket(Arc<WsClient>),
}

#[derive(Clone)]
pub struct AsyncRpcClient {
    endpoint: RemoteEndpoint,
    transport: Transport,
    options: RpcClientOptions,
    breaker: Arc<RpcCircuitBreaker>,
    telemetry: Option<Arc<Telemetry>>,
}

impl AsyncRpcClient {
    /// Connects to `endpoint` with default options and a private breaker.
    pub async fn connect(endpoint: &RemoteEndpoint) -> Result<Self> {
        Self::connect_with_options(endpoint, RpcClientOptions::default()).await
    }

    pub async fn connect_with_options(
        endpoint: &RemoteEndpoint,
        options: RpcClientOptions,
    ) -> Result<Self> {
        Self::connect_with_breaker(endpoint, options, Arc::new(RpcCircuitBreaker::default()))
            .await
    }

    /// Builds the underlying transport. For WebSocket endpoints this performs
    /// the handshake, so an unreachable endpoint fails here; HTTP clients
    /// connect lazily on the first request.
    pub async fn connect_with_breaker(
        endpoint: &RemoteEndpoint,
        options: RpcClientOptions,
        breaker: Arc<RpcCircuitBreaker>,
    ) -> Result<Self> {
        options.validate()?;
        let max_response_size = options.max_response_body_bytes.min(u32::MAX as usize) as u32;

        let transport = match endpoint.transport() {
            EndpointTransport::Http => {
                let client = HttpClientBuilder::default()
                    .request_timeout(options.request_timeout)
                    .max_response_size(max_response_size)
                    .build(endpoint.as_str())
                    .map_err(|err| anyhow!("failed to build HTTP RPC client: {err}"))?;
                Transport::Http(client)
            }
            EndpointTransport::WebSocket => {
                let client = WsClientBuilder::default()
                    .request_timeout(options.request_timeout)
                    .connection_timeout(options.request_timeout)
                    .max_response_size(max_response_size)
                    .build(endpoint.as_str())
                    .await
                    .map_err(|err| anyhow!("failed to open WebSocket to {endpoint}: {err}"))?;
                Transport::WebSocket(Arc::new(client))
            }
        };

        Ok(Self {
            endpoint: endpoint.clone(),
            transport,
            options,
            breaker,
            telemetry: None,
        })
    }

    /// Routes rpc error and timeout counters into `telemetry`.
    pub fn with_telemetry(mut self, telemetry: Arc<Telemetry>) -> Self {
        self.telemetry = Some(telemetry);
        self
    }

    pub fn endpoint(&self) -> &RemoteEndpoint {
        &self.endpoint
    }

    pub fn breaker(&self) -> &Arc<RpcCircuitBreaker> {
        &self.breaker
    }

    /// Returns `false` once a WebSocket connection has dropped. HTTP clients
    /// are connectionless and always report `true`.
    pub fn is_connected(&self) -> bool {
        match &self.transport {
            Transport::Http(_) => true,
            Transport::WebSocket(client) => client.is_connected(),
        }
    }

    /// Current head height reported by `eth_blockNumber`.
    pub async fn block_number(&self) -> Result<u64> {
        let context = RetryContext::new(self.endpoint.as_str(), &BLOCK_NUMBER_RETRY);
        let height = self
            .retry_with_breaker(context, || async {
                let raw: String = self.request_once(context.method(), rpc_params![]).await?;
                parse_quantity(&raw)
            })
            .await?;
        tracing::trace!(endpoint = %self.endpoint, height, "fetched remote head");
        Ok(height)
    }

    pub async fn chain_id(&self) -> Result<u64> {
        let context = RetryContext::new(self.endpoint.as_str(), &CHAIN_ID_RETRY);
        self.retry_with_breaker(context, || async {
            let raw: String = self.request_once(context.method(), rpc_params![]).await?;
            parse_quantity(&raw)
        })
        .await
    }

    /// Opens an `eth_subscribe("newHeads")` stream. Only available over
    /// WebSocket transports.
    pub async fn subscribe_new_heads(&self) -> Result<Subscription<Value>> {
        const METHOD: &str = "eth_subscribe";

        let Transport::WebSocket(client) = &self.transport else {
            return Err(RpcError::SubscriptionUnsupported.into());
        };

        timeout(
            self.options.request_timeout,
            client.subscribe::<Value, _>(METHOD, rpc_params!["newHeads"], "eth_unsubscribe"),
        )
        .await
        .map_err(|_| RpcError::Timeout { method: METHOD })?
        .map_err(|err| map_rpc_error(METHOD, err))
    }

    /// Shared retry/backoff loop that wraps RPC operations with breaker gating,
    /// telemetry, exponential backoff, and consistent logging.
    async fn retry_with_breaker<T, F, Fut>(
        &self,
        context: RetryContext<'_>,
        mut operation: F,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0;

        loop {
            match self.breaker.before_request() {
                Ok(state) => context.log_permit(state),
                Err(err) => {
                    context.log_circuit_open(&err);
                    return Err(RpcError::CircuitOpen.into());
                }
            }

            attempt += 1;

            let err = match operation().await {
                Ok(value) => {
                    self.breaker.record_success();
                    return Ok(value);
                }
                Err(err) => err,
            };

            let timed_out = match err.downcast_ref::<RpcError>() {
                Some(RpcError::InvalidQuantity { .. }) => {
                    // The endpoint answered; the payload is what is wrong.
                    self.breaker.record_success();
                    self.record_rpc_error(false);
                    return Err(err);
                }
                Some(RpcError::Timeout { .. }) => true,
                _ => false,
            };

            self.breaker.record_failure();
            self.record_rpc_error(timed_out);

            if attempt >= self.options.max_attempts {
                context.log_exhausted(attempt, &err);
                return Err(err);
            }

            let backoff = self.backoff_delay(attempt);
            if timed_out {
                context.log_timeout(attempt, backoff);
            } else {
                context.log_retry(attempt, backoff, &err);
            }
            sleep(backoff).await;
        }
    }

    async fn request_once<R>(&self, method: &'static str, params: ArrayParams) -> Result<R>
    where
        R: DeserializeOwned + Send,
    {
        let call = async {
            match &self.transport {
                Transport::Http(client) => client.request::<R, _>(method, params).await,
                Transport::WebSocket(client) => client.request::<R, _>(method, params).await,
            }
        };

        timeout(self.options.request_timeout, call)
            .await
            .map_err(|_| RpcError::Timeout { method })?
            .map_err(|err| map_rpc_error(method, err))
            .with_context(|| format!("rpc {method} against {} failed", self.endpoint))
    }

    fn backoff_delay(&self, attempt: usize) -> Duration {
        if attempt <= 1 {
            return self.options.initial_backoff;
        }

        let exponent = attempt.saturating_sub(1) as u32;
        let multiplier = 1u32.checked_shl(exponent).unwrap_or(u32::MAX);
        self.options
            .initial_backoff
            .saturating_mul(multiplier)
            .min(self.options.max_backoff)
    }

    fn record_rpc_error(&self, timed_out: bool) {
        if let Some(telemetry) = &self.telemetry {
            if timed_out {
                telemetry.record_rpc_timeout();
            } else {
                telemetry.record_rpc_error();
            }
        }
    }
}

fn map_rpc_error(method: &'static str, err: JsonRpcError) -> anyhow::Error {
    match err {
        JsonRpcError::RequestTimeout => RpcError::Timeout { method }.into(),
        JsonRpcError::Call(call) => anyhow!(
            "rpc {method} call failed (code={}, message={})",
            call.code(),
            call.message()
        ),
        other => anyhow!("rpc {method} call failed: {other}"),
    }
}
