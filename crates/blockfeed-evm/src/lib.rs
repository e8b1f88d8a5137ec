//! blockfeed-evm: follows an EVM chain over JSON-RPC.
//!
//! [`EvmBlockSource`] polls `eth_blockNumber`, walks every height it has not
//! emitted yet with `eth_getBlockByNumber`, and hands each block to the sink
//! as a canonical JSON payload (see [`payload`]).

pub mod client;
pub mod payload;
pub mod source;

pub use client::{EvmRpcClient, HttpEvmClient};
pub use payload::{canonical_payload, parse_hex_u64};
pub use source::{EvmBlockSource, SourceOptions};
