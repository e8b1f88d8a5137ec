//! Canonical block payloads.
//!
//! Nodes disagree on field order and on which optional fields they return, so
//! the payload handed to webhooks is a fixed projection of the block with
//! quantities decoded to numbers and keys in sorted order. The same block
//! always encodes to the same bytes.

use std::collections::BTreeMap;

use serde_json::Value;

use blockfeed_core::error::FeedError;
use blockfeed_core::types::Block;

/// Quantities decoded to JSON numbers.
const QUANTITY_FIELDS: &[&str] = &[
    "baseFeePerGas",
    "blobGasUsed",
    "excessBlobGas",
    "gasLimit",
    "gasUsed",
    "number",
    "size",
    "timestamp",
];

/// Fields copied through unchanged when present.
const PASSTHROUGH_FIELDS: &[&str] = &[
    "difficulty",
    "extraData",
    "hash",
    "logsBloom",
    "miner",
    "mixHash",
    "nonce",
    "parentBeaconBlockRoot",
    "parentHash",
    "receiptsRoot",
    "sha3Uncles",
    "stateRoot",
    "transactions",
    "transactionsRoot",
    "uncles",
    "withdrawals",
    "withdrawalsRoot",
];

/// Parse a `0x`-prefixed (or bare) hex quantity.
pub fn parse_hex_u64(s: &str) -> Result<u64, FeedError> {
    let digits = s.strip_prefix("0x").unwrap_or(s);
    if digits.is_empty() {
        return Err(FeedError::Rpc(format!("empty hex quantity '{s}'")));
    }
    u64::from_str_radix(digits, 16)
        .map_err(|e| FeedError::Rpc(format!("invalid hex quantity '{s}': {e}")))
}

/// Project a raw `eth_getBlockByNumber` result into a [`Block`].
pub fn canonical_payload(raw: &Value) -> Result<Block, FeedError> {
    let obj = raw
        .as_object()
        .ok_or_else(|| FeedError::Rpc(format!("block is not an object: {raw}")))?;

    let height = obj
        .get("number")
        .and_then(Value::as_str)
        .ok_or_else(|| FeedError::Rpc("block has no number".into()))
        .and_then(parse_hex_u64)?;

    let mut out: BTreeMap<&str, Value> = BTreeMap::new();
    for &field in QUANTITY_FIELDS {
        match obj.get(field) {
            None | Some(Value::Null) => {}
            Some(Value::String(hex)) => {
                out.insert(field, Value::from(parse_hex_u64(hex)?));
            }
            Some(other) => {
                return Err(FeedError::Rpc(format!("{field}: expected hex quantity, got {other}")))
            }
        }
    }
    for &field in PASSTHROUGH_FIELDS {
        if let Some(v) = obj.get(field).filter(|v| !v.is_null()) {
            out.insert(field, v.clone());
        }
    }

    Ok(Block::new(height, serde_json::to_string(&out)?))
}
