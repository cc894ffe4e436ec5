//! Decoding helpers for Ethereum JSON-RPC payloads (hex quantities and
//! `newHeads` notifications).

use crate::rpc::client::RpcError;
use anyhow::{Context, Result};
use serde::Deserialize;
use serde_json::Value;

/// Parses a `0x`-prefixed hexadecimal quantity such as `"0x1b4"`.
///
/// The input is trimmed first. Leading zeroes are accepted even though the
/// canonical Ethereum encoding forbids them; several providers emit them.
pub fn parse_quantity(raw: &str) -> Result<u64> {
    let trimmed = raw.trim();
    let digits = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
        .ok_or_else(|| RpcError::InvalidQuantity {
            value: trimmed.to_owned(),
        })?;

    if digits.is_empty() {
        return Err(RpcError::InvalidQuantity {
            value: trimmed.to_owned(),
        }
        .into());
    }

    u64::from_str_radix(digits, 16)
        .map_err(|_| RpcError::InvalidQuantity {
            value: trimmed.to_owned(),
        })
        .context("quantity does not fit a block number")
}

#[derive(Debug, Deserialize)]
struct NewHeadPayload {
    number: String,
    #[serde(default)]
    hash: Option<String>,
}

/// Extracts `(number, hash)` from a `newHeads` subscription notification.
pub fn decode_new_head(value: &Value) -> Result<(u64, Option<String>)> {
    let payload = NewHeadPayload::deserialize(value).context("malformed newHeads notification")?;
    let number = parse_quantity(&payload.number)?;
    Ok((number, payload.hash))
}
