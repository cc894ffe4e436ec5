use anyhow::{bail, Result};
use std::fmt;

/// Transport used to talk to a [`RemoteEndpoint`], derived from its scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EndpointTransport {
    /// `http://` or `https://`; new blocks are discovered by polling.
    Http,
    /// `ws://` or `wss://`; new blocks arrive through `eth_subscribe`.
    WebSocket,
}

/// Immutable, validated URL of the upstream chain RPC source.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RemoteEndpoint {
    url: String,
    transport: EndpointTransport,
}

impl RemoteEndpoint {
    pub fn parse(url: impl AsRef<str>) -> Result<Self> {
        let url = url.as_ref().trim();
        let lower = url.to_ascii_lowercase();
        let (transport, rest) = if let Some(rest) = lower
            .strip_prefix("https://")
            .or_else(|| lower.strip_prefix("http://"))
        {
            (EndpointTransport::Http, rest)
        } else if let Some(rest) = lower
            .strip_prefix("wss://")
            .or_else(|| lower.strip_prefix("ws://"))
        {
            (EndpointTransport::WebSocket, rest)
        } else {
            bail!("remote endpoint must start with http://, https://, ws:// or wss://");
        };

        if rest.is_empty() || rest.starts_with('/') {
            bail!("remote endpoint {url} is missing a host");
        }

        Ok(Self {
            url: url.to_owned(),
            transport,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.url
    }

    pub fn transport(&self) -> EndpointTransport {
        self.transport
    }
}

impl fmt::Display for RemoteEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.url)
    }
}
