//! Typed topics over a [`LogBackend`].
//!
//! `subscribe` runs `concurrency` consumers named `{name}-{i}`. Each one
//! loops over two phases until cancelled:
//!
//! 1. **backlog**: redeliver its own delivered-but-unacked messages oldest
//!    first (`is_backlog = true`), bumping their delivery counters, until
//!    the backlog is empty;
//! 2. **new**: claim up to `batch_size` messages past the group cursor,
//!    waiting up to `block_timeout_ms` when there are none.
//!
//! A handler error leaves the whole batch unacknowledged. The backlog pass
//! then waits `block_timeout_ms` and starts again from the oldest pending
//! message, so nothing newer is claimed while an older batch keeps failing.
//! Log errors and undecodable messages end the subscription.

use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use blockfeed_core::config::SubscribeOptions;
use blockfeed_core::error::FeedError;

use crate::backend::{LogBackend, LogMessage, MessageId, PendingEntry};

/// A decoded log entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamMessage<T> {
    pub id: MessageId,
    pub data: T,
}

/// What a handler receives per call.
#[derive(Debug, Clone)]
pub struct MessageBatch<T> {
    /// Consumer that claimed the batch (`{name}-{i}`).
    pub consumer: String,
    /// `true` when these messages were delivered before and never acked.
    pub is_backlog: bool,
    pub messages: Vec<StreamMessage<T>>,
}

impl<T> MessageBatch<T> {
    pub fn ids(&self) -> Vec<MessageId> {
        self.messages.iter().map(|m| m.id).collect()
    }
}

/// Processes batches claimed by a subscription. The handler is responsible
/// for acknowledging what it finished.
#[async_trait]
pub trait StreamHandler<T>: Send + Sync {
    async fn handle(&self, batch: MessageBatch<T>) -> Result<(), FeedError>;
}

/// A topic whose payloads are JSON-encoded `T`, read through one consumer
/// group.
pub struct Stream<T> {
    backend: Arc<dyn LogBackend>,
    topic: String,
    group: String,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Clone for Stream<T> {
    fn clone(&self) -> Self {
        Self {
            backend: self.backend.clone(),
            topic: self.topic.clone(),
            group: self.group.clone(),
            _marker: PhantomData,
        }
    }
}

impl<T> Stream<T>
where
    T: Serialize + DeserializeOwned + Send + 'static,
{
    pub fn new(
        backend: Arc<dyn LogBackend>,
        topic: impl Into<String>,
        group: impl Into<String>,
    ) -> Self {
        Self {
            backend,
            topic: topic.into(),
            group: group.into(),
            _marker: PhantomData,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    pub fn backend(&self) -> &Arc<dyn LogBackend> {
        &self.backend
    }

    pub async fn publish(&self, data: &T) -> Result<MessageId, FeedError> {
        let payload = serde_json::to_string(data)?;
        self.backend.append(&self.topic, &payload, None).await
    }

    /// Publish keeping at most `max_len` entries on the topic. With
    /// `max_len = 1` the topic only ever holds the latest value.
    pub async fn publish_capped(&self, data: &T, max_len: usize) -> Result<MessageId, FeedError> {
        let payload = serde_json::to_string(data)?;
        self.backend
            .append(&self.topic, &payload, Some(max_len.max(1)))
            .await
    }

    /// Acknowledge and delete `ids` in one step.
    pub async fn ack_del(&self, ids: &[MessageId]) -> Result<(), FeedError> {
        if ids.is_empty() {
            return Ok(());
        }
        self.backend
            .ack_del(&self.topic, &self.group, ids, None)
            .await
            .map(|_| ())
    }

    /// Acknowledge and delete `ids`, appending `replacement` in the same step.
    pub async fn ack_del_replace(
        &self,
        ids: &[MessageId],
        replacement: &T,
    ) -> Result<MessageId, FeedError> {
        let payload = serde_json::to_string(replacement)?;
        self.backend
            .ack_del(&self.topic, &self.group, ids, Some(&payload))
            .await?
            .ok_or_else(|| FeedError::Log("replacement was not appended".into()))
    }

    pub async fn pending_entry(&self, id: MessageId) -> Result<Option<PendingEntry>, FeedError> {
        self.backend.pending_entry(&self.topic, &self.group, id).await
    }

    pub async fn len(&self) -> Result<u64, FeedError> {
        self.backend.topic_len(&self.topic).await
    }

    pub async fn is_empty(&self) -> Result<bool, FeedError> {
        Ok(self.len().await? == 0)
    }

    fn decode(&self, raw: Vec<LogMessage>) -> Result<Vec<StreamMessage<T>>, FeedError> {
        raw.into_iter()
            .map(|m| {
                let data = serde_json::from_str(&m.payload).map_err(|e| {
                    FeedError::Serialization(format!("message {} on '{}': {e}", m.id, self.topic))
                })?;
                Ok(StreamMessage { id: m.id, data })
            })
            .collect()
    }

    /// Consume the topic until `cancel` fires or a fatal error occurs.
    pub async fn subscribe<H>(
        &self,
        consumer_name: &str,
        opts: &SubscribeOptions,
        handler: Arc<H>,
        cancel: CancellationToken,
    ) -> Result<(), FeedError>
    where
        H: StreamHandler<T> + 'static,
    {
        opts.validate()?;
        self.backend.create_group(&self.topic, &self.group).await?;
        info!(
            topic = %self.topic,
            group = %self.group,
            consumer = consumer_name,
            concurrency = opts.concurrency,
            batch_size = opts.batch_size,
            "consumer group ready"
        );

        // One ordered consumer runs inline.
        if opts.concurrency == 1 {
            let consumer = format!("{consumer_name}-0");
            return self.consume(&consumer, opts, handler.as_ref(), &cancel).await;
        }

        let child = cancel.child_token();
        let mut workers = JoinSet::new();
        for i in 0..opts.concurrency {
            let stream = self.clone();
            let consumer = format!("{consumer_name}-{i}");
            let opts = opts.clone();
            let handler = handler.clone();
            let child = child.clone();
            workers.spawn(async move {
                debug!(consumer = %consumer, "consumer online");
                stream.consume(&consumer, &opts, handler.as_ref(), &child).await
            });
        }

        let mut outcome = Ok(());
        while let Some(joined) = workers.join_next().await {
            let result = joined.map_err(|e| FeedError::Other(format!("consumer task failed: {e}")));
            if let Err(e) = result.and_then(|r| r) {
                if outcome.is_ok() {
                    error!(topic = %self.topic, error = %e, "consumer stopped, shutting down siblings");
                    child.cancel();
                    outcome = Err(e);
                }
            }
        }
        outcome
    }

    async fn consume(
        &self,
        consumer: &str,
        opts: &SubscribeOptions,
        handler: &dyn StreamHandler<T>,
        cancel: &CancellationToken,
    ) -> Result<(), FeedError> {
        loop {
            if cancel.is_cancelled() {
                return Ok(());
            }
            if !self.drain_backlog(consumer, opts, handler, cancel).await? {
                return Ok(());
            }
            if !self.read_new(consumer, opts, handler, cancel).await? {
                return Ok(());
            }
        }
    }

    /// Redeliver the consumer's backlog until it is empty. A failed batch
    /// restarts the pass from the oldest pending message after a pause.
    /// Returns `false` if cancelled.
    async fn drain_backlog(
        &self,
        consumer: &str,
        opts: &SubscribeOptions,
        handler: &dyn StreamHandler<T>,
        cancel: &CancellationToken,
    ) -> Result<bool, FeedError> {
        let mut cursor = MessageId(0);
        loop {
            let raw = self
                .backend
                .read_backlog(&self.topic, &self.group, consumer, cursor, opts.batch_size)
                .await?;
            let Some(last) = raw.last() else {
                return Ok(true);
            };
            cursor = last.id;
            let messages = self.decode(raw)?;
            debug!(topic = %self.topic, consumer, count = messages.len(), "redelivering backlog");

            let batch = MessageBatch {
                consumer: consumer.to_string(),
                is_backlog: true,
                messages,
            };
            match self.dispatch(handler, batch, cancel).await {
                Dispatch::Handled => {}
                Dispatch::Cancelled => return Ok(false),
                Dispatch::Failed => {
                    tokio::select! {
                        _ = cancel.cancelled() => return Ok(false),
                        _ = tokio::time::sleep(opts.block_timeout()) => {}
                    }
                    cursor = MessageId(0);
                }
            }
        }
    }

    /// Claim and handle one batch of new messages, waiting if there are
    /// none. Returns `false` if cancelled.
    async fn read_new(
        &self,
        consumer: &str,
        opts: &SubscribeOptions,
        handler: &dyn StreamHandler<T>,
        cancel: &CancellationToken,
    ) -> Result<bool, FeedError> {
        let raw = self
            .backend
            .read_new(&self.topic, &self.group, consumer, opts.batch_size)
            .await?;
        if raw.is_empty() {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(false),
                _ = self.backend.wait_for_messages(&self.topic, opts.block_timeout()) => {}
            }
            return Ok(true);
        }

        let messages = self.decode(raw)?;
        debug!(topic = %self.topic, consumer, count = messages.len(), "received messages");
        let batch = MessageBatch {
            consumer: consumer.to_string(),
            is_backlog: false,
            messages,
        };
        Ok(self.dispatch(handler, batch, cancel).await != Dispatch::Cancelled)
    }

    /// Run the handler. Its errors are logged and the batch stays pending.
    async fn dispatch(
        &self,
        handler: &dyn StreamHandler<T>,
        batch: MessageBatch<T>,
        cancel: &CancellationToken,
    ) -> Dispatch {
        let consumer = batch.consumer.clone();
        let count = batch.messages.len();
        let is_backlog = batch.is_backlog;
        tokio::select! {
            _ = cancel.cancelled() => Dispatch::Cancelled,
            result = handler.handle(batch) => match result {
                Ok(()) => {
                    debug!(topic = %self.topic, consumer = %consumer, count, "processed messages");
                    Dispatch::Handled
                }
                Err(e) => {
                    error!(
                        topic = %self.topic,
                        consumer = %consumer,
                        count,
                        is_backlog,
                        error = %e,
                        "handler failed, batch left in backlog"
                    );
                    Dispatch::Failed
                }
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Dispatch {
    Handled,
    Failed,
    Cancelled,
}
