//! blockfeed-relay: the process roles of the block-to-webhook pipeline.
//!
//! | Role | Reads | Writes |
//! |---|---|---|
//! | [`BlockProducer`] | a `BlockSource` | ingestion log |
//! | [`IngestionConsumer`] | ingestion log | block store, every shard's pending set, flush notices |
//! | [`WebhookFlusher`] | one shard's flush notices | that shard's pending set |
//! | [`WebhookProcessor`] | one shard's delivery log | webhook endpoints, pending set |
//!
//! Every role is a long-running `run` that returns `Ok(())` once its
//! cancellation token fires.

pub mod client;
pub mod flusher;
pub mod ingest;
pub mod processor;
pub mod producer;

pub use client::{DeliveryOptions, WebhookClient};
pub use flusher::{flush_notices, FlushNotice, WebhookFlusher, FLUSH_GROUP};
pub use ingest::IngestionConsumer;
pub use processor::WebhookProcessor;
pub use producer::{block_log, block_topic, BlockProducer, BLOCK_GROUP};
