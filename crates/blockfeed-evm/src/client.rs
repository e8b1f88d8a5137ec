//! JSON-RPC transport for EVM nodes.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};

use blockfeed_core::error::FeedError;

use crate::payload::parse_hex_u64;

/// The two calls a block source needs from a node.
#[async_trait]
pub trait EvmRpcClient: Send + Sync {
    async fn block_number(&self) -> Result<u64, FeedError>;

    /// Raw `eth_getBlockByNumber` result, `None` if the node does not have
    /// the block yet.
    async fn block_by_number(&self, number: u64) -> Result<Option<Value>, FeedError>;
}

#[derive(Debug, Deserialize)]
struct RpcResponse {
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<RpcErrorBody>,
}

#[derive(Debug, Deserialize)]
struct RpcErrorBody {
    code: i64,
    message: String,
}

/// `EvmRpcClient` over plain HTTP POST.
pub struct HttpEvmClient {
    url: String,
    http: reqwest::Client,
    full_transactions: bool,
    next_id: AtomicU64,
}

impl HttpEvmClient {
    pub fn new(url: impl Into<String>, request_timeout: Duration) -> Result<Self, FeedError> {
        let http = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| FeedError::Config(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            url: url.into(),
            http,
            full_transactions: false,
            next_id: AtomicU64::new(1),
        })
    }

    /// Ask for full transaction objects instead of hashes.
    pub fn with_full_transactions(mut self, full: bool) -> Self {
        self.full_transactions = full;
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    async fn call(&self, method: &str, params: Value) -> Result<Value, FeedError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let body = json!({ "jsonrpc": "2.0", "id": id, "method": method, "params": params });

        let resp = self
            .http
            .post(&self.url)
            .json(&body)
            .send()
            .await
            .map_err(|e| FeedError::Rpc(format!("{method}: {e}")))?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let text = resp.text().await.unwrap_or_default();
            return Err(FeedError::Rpc(format!("{method}: HTTP {status}: {text}")));
        }

        let parsed: RpcResponse = resp
            .json()
            .await
            .map_err(|e| FeedError::Rpc(format!("{method}: malformed response: {e}")))?;

        if let Some(err) = parsed.error {
            return Err(FeedError::Rpc(format!(
                "{method}: RPC error {}: {}",
                err.code, err.message
            )));
        }
        Ok(parsed.result.unwrap_or(Value::Null))
    }
}

#[async_trait]
impl EvmRpcClient for HttpEvmClient {
    async fn block_number(&self) -> Result<u64, FeedError> {
        let result = self.call("eth_blockNumber", json!([])).await?;
        let hex = result
            .as_str()
            .ok_or_else(|| FeedError::Rpc(format!("eth_blockNumber: expected hex string, got {result}")))?;
        parse_hex_u64(hex)
    }

    async fn block_by_number(&self, number: u64) -> Result<Option<Value>, FeedError> {
        let result = self
            .call(
                "eth_getBlockByNumber",
                json!([format!("0x{number:x}"), self.full_transactions]),
            )
            .await?;
        Ok((!result.is_null()).then_some(result))
    }
}
