//! blockfeed-core: shared vocabulary for the block-to-webhook pipeline.
//!
//! # Architecture
//!
//! ```text
//! BlockSource → ingestion log → IngestionConsumer ─┬─> BlockStore (cache + durable)
//!                                                  └─> WebhookStream::flush (every shard)
//!                                                           │
//!                        delivery log (per shard) <─────────┘
//!                                │
//!                        WebhookProcessor → POST {url} → ack + re-arm
//! ```
//!
//! This crate holds the pieces every stage agrees on: the data model, the
//! error type, the store/source/lookup traits, the backoff policy, and the
//! shard router.

pub mod config;
pub mod error;
pub mod retry;
pub mod shard;
pub mod source;
pub mod store;
pub mod types;
pub mod webhook;

pub use config::FeedConfig;
pub use error::FeedError;
pub use retry::{RetryConfig, RetryPolicy};
pub use shard::{ShardId, ShardRouter};
pub use source::{BlockSink, BlockSource};
pub use store::{BlockStore, CacheTier};
pub use types::{Block, DeliveryMessage};
pub use webhook::{Webhook, WebhookDirectory, WebhookValidator};
