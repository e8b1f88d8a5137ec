//! In-process log and scheduler backend.
//!
//! All topics and shards live behind one mutex, so every trait method is a
//! single critical section. Appends wake blocked readers through a
//! [`Notify`]. Data is lost when the process exits.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tracing::debug;

use blockfeed_core::error::FeedError;
use blockfeed_core::shard::ShardId;
use blockfeed_core::types::DeliveryMessage;
use blockfeed_core::webhook::Webhook;

use crate::backend::{
    promotable, rearm_target, LogBackend, LogMessage, MessageId, PendingEntry, PendingJob, Rearm,
    RearmMode, ScheduleBackend,
};

#[derive(Default)]
struct Topic {
    entries: BTreeMap<u64, String>,
    last_id: u64,
    groups: HashMap<String, Group>,
}

#[derive(Default)]
struct Group {
    last_delivered: u64,
    pending: BTreeMap<u64, PendingRecord>,
}

struct PendingRecord {
    consumer: String,
    deliveries: u32,
    last_delivered_ms: i64,
}

#[derive(Default)]
struct Shard {
    webhooks: HashMap<String, Webhook>,
    by_score: BTreeSet<(u64, String)>,
    jobs: HashMap<String, PendingJob>,
    latest_flushed: Option<u64>,
}

impl Shard {
    fn insert_job(&mut self, job: PendingJob) {
        if let Some(old) = self.jobs.remove(&job.webhook_id) {
            self.by_score.remove(&(old.score, old.webhook_id));
        }
        self.by_score.insert((job.score, job.webhook_id.clone()));
        self.jobs.insert(job.webhook_id.clone(), job);
    }

    fn remove_job(&mut self, webhook_id: &str) -> Option<PendingJob> {
        let job = self.jobs.remove(webhook_id)?;
        self.by_score.remove(&(job.score, job.webhook_id.clone()));
        Some(job)
    }
}

#[derive(Default)]
struct State {
    topics: HashMap<String, Topic>,
    shards: HashMap<ShardId, Shard>,
}

impl State {
    fn append(&mut self, topic: &str, payload: &str, max_len: Option<usize>) -> MessageId {
        let t = self.topics.entry(topic.to_string()).or_default();
        t.last_id += 1;
        t.entries.insert(t.last_id, payload.to_string());
        if let Some(max_len) = max_len {
            while t.entries.len() > max_len {
                t.entries.pop_first();
            }
        }
        MessageId(t.last_id)
    }

    fn group_mut(&mut self, topic: &str, group: &str) -> Result<&mut Topic, FeedError> {
        let t = self
            .topics
            .get_mut(topic)
            .filter(|t| t.groups.contains_key(group))
            .ok_or_else(|| {
                FeedError::Log(format!("consumer group '{group}' does not exist on '{topic}'"))
            })?;
        Ok(t)
    }

    fn ack_del(&mut self, topic: &str, group: &str, ids: &[MessageId]) {
        if let Some(t) = self.topics.get_mut(topic) {
            for id in ids {
                if let Some(g) = t.groups.get_mut(group) {
                    g.pending.remove(&id.0);
                }
                t.entries.remove(&id.0);
            }
        }
    }
}

/// In-memory [`LogBackend`] + [`ScheduleBackend`].
#[derive(Default)]
pub struct MemoryLog {
    state: Mutex<State>,
    appended: Notify,
}

impl MemoryLog {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, State>, FeedError> {
        self.state.lock().map_err(|e| FeedError::Log(e.to_string()))
    }
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[async_trait]
impl LogBackend for MemoryLog {
    async fn create_group(&self, topic: &str, group: &str) -> Result<(), FeedError> {
        let mut state = self.lock()?;
        state
            .topics
            .entry(topic.to_string())
            .or_default()
            .groups
            .entry(group.to_string())
            .or_default();
        Ok(())
    }

    async fn append(
        &self,
        topic: &str,
        payload: &str,
        max_len: Option<usize>,
    ) -> Result<MessageId, FeedError> {
        let id = self.lock()?.append(topic, payload, max_len);
        self.appended.notify_waiters();
        Ok(id)
    }

    async fn read_new(
        &self,
        topic: &str,
        group: &str,
        consumer: &str,
        count: usize,
    ) -> Result<Vec<LogMessage>, FeedError> {
        let mut state = self.lock()?;
        let t = state.group_mut(topic, group)?;
        let Topic { entries, groups, .. } = t;
        let g = groups
            .get_mut(group)
            .ok_or_else(|| FeedError::Log(format!("consumer group '{group}' vanished")))?;

        let messages: Vec<LogMessage> = entries
            .range(g.last_delivered + 1..)
            .take(count)
            .map(|(id, payload)| LogMessage {
                id: MessageId(*id),
                payload: payload.clone(),
            })
            .collect();

        let now = now_ms();
        for msg in &messages {
            g.last_delivered = g.last_delivered.max(msg.id.0);
            g.pending.insert(
                msg.id.0,
                PendingRecord {
                    consumer: consumer.to_string(),
                    deliveries: 1,
                    last_delivered_ms: now,
                },
            );
        }
        Ok(messages)
    }

    async fn read_backlog(
        &self,
        topic: &str,
        group: &str,
        consumer: &str,
        after: MessageId,
        count: usize,
    ) -> Result<Vec<LogMessage>, FeedError> {
        let mut state = self.lock()?;
        let t = state.group_mut(topic, group)?;
        let Topic { entries, groups, .. } = t;
        let g = groups
            .get_mut(group)
            .ok_or_else(|| FeedError::Log(format!("consumer group '{group}' vanished")))?;

        let mut messages = Vec::new();
        let mut stale = Vec::new();
        let now = now_ms();
        for (id, record) in g.pending.range_mut(after.0 + 1..) {
            if messages.len() >= count {
                break;
            }
            if record.consumer != consumer {
                continue;
            }
            match entries.get(id) {
                Some(payload) => {
                    record.deliveries += 1;
                    record.last_delivered_ms = now;
                    messages.push(LogMessage {
                        id: MessageId(*id),
                        payload: payload.clone(),
                    });
                }
                None => stale.push(*id),
            }
        }
        if !stale.is_empty() {
            debug!(topic, group, consumer, count = stale.len(), "dropped stale backlog entries");
            for id in stale {
                g.pending.remove(&id);
            }
        }
        Ok(messages)
    }

    async fn pending_entry(
        &self,
        topic: &str,
        group: &str,
        id: MessageId,
    ) -> Result<Option<PendingEntry>, FeedError> {
        let state = self.lock()?;
        Ok(state
            .topics
            .get(topic)
            .and_then(|t| t.groups.get(group))
            .and_then(|g| g.pending.get(&id.0))
            .map(|r| PendingEntry {
                id,
                consumer: r.consumer.clone(),
                deliveries: r.deliveries,
                last_delivered_ms: r.last_delivered_ms,
            }))
    }

    async fn ack_del(
        &self,
        topic: &str,
        group: &str,
        ids: &[MessageId],
        replacement: Option<&str>,
    ) -> Result<Option<MessageId>, FeedError> {
        let replaced = {
            let mut state = self.lock()?;
            state.ack_del(topic, group, ids);
            replacement.map(|payload| state.append(topic, payload, None))
        };
        if replaced.is_some() {
            self.appended.notify_waiters();
        }
        Ok(replaced)
    }

    async fn topic_len(&self, topic: &str) -> Result<u64, FeedError> {
        let state = self.lock()?;
        Ok(state
            .topics
            .get(topic)
            .map(|t| t.entries.len() as u64)
            .unwrap_or(0))
    }

    async fn wait_for_messages(&self, _topic: &str, timeout: Duration) {
        let _ = tokio::time::timeout(timeout, self.appended.notified()).await;
    }
}

#[async_trait]
impl ScheduleBackend for MemoryLog {
    async fn set_webhook(&self, shard: ShardId, webhook: &Webhook) -> Result<bool, FeedError> {
        let mut state = self.lock()?;
        let s = state.shards.entry(shard).or_default();
        let is_new = s
            .webhooks
            .insert(webhook.id.clone(), webhook.clone())
            .is_none();
        if is_new {
            s.insert_job(PendingJob {
                webhook_id: webhook.id.clone(),
                score: 0,
                message: DeliveryMessage::initial(webhook.id.clone()),
            });
        }
        Ok(is_new)
    }

    async fn get_webhook(&self, shard: ShardId, id: &str) -> Result<Option<Webhook>, FeedError> {
        let state = self.lock()?;
        Ok(state
            .shards
            .get(&shard)
            .and_then(|s| s.webhooks.get(id))
            .cloned())
    }

    async fn delete_webhook(&self, shard: ShardId, id: &str) -> Result<bool, FeedError> {
        let mut state = self.lock()?;
        let Some(s) = state.shards.get_mut(&shard) else {
            return Ok(false);
        };
        s.remove_job(id);
        Ok(s.webhooks.remove(id).is_some())
    }

    async fn flush_pending(
        &self,
        shard: ShardId,
        latest_height: u64,
    ) -> Result<Vec<PendingJob>, FeedError> {
        let promoted = {
            let mut state = self.lock()?;
            let s = state.shards.entry(shard).or_default();
            s.latest_flushed = Some(s.latest_flushed.map_or(latest_height, |h| h.max(latest_height)));

            let ordered: Vec<(u64, String)> = s.by_score.iter().cloned().collect();
            let take = promotable(&ordered, latest_height);
            let promoted: Vec<PendingJob> = ordered[..take]
                .iter()
                .filter_map(|(_, id)| s.remove_job(id))
                .collect();

            let topic = shard.delivery_topic();
            for job in &promoted {
                let payload = serde_json::to_string(&job.message)?;
                state.append(&topic, &payload, None);
            }
            promoted
        };
        if !promoted.is_empty() {
            self.appended.notify_waiters();
        }
        Ok(promoted)
    }

    async fn ack_and_rearm(
        &self,
        shard: ShardId,
        group: &str,
        id: MessageId,
        next: &DeliveryMessage,
        mode: RearmMode,
    ) -> Result<Rearm, FeedError> {
        let payload = serde_json::to_string(next)?;
        let topic = shard.delivery_topic();
        let outcome = {
            let mut state = self.lock()?;
            state.ack_del(&topic, group, &[id]);
            let s = state.shards.entry(shard).or_default();
            match rearm_target(next, s.latest_flushed, mode) {
                Some(score) => {
                    s.insert_job(PendingJob {
                        webhook_id: next.webhook_id.clone(),
                        score,
                        message: next.clone(),
                    });
                    Rearm::Pending { score }
                }
                None => Rearm::Promoted(state.append(&topic, &payload, None)),
            }
        };
        if matches!(outcome, Rearm::Promoted(_)) {
            self.appended.notify_waiters();
        }
        Ok(outcome)
    }

    async fn latest_flushed_height(&self, shard: ShardId) -> Result<Option<u64>, FeedError> {
        let state = self.lock()?;
        Ok(state.shards.get(&shard).and_then(|s| s.latest_flushed))
    }

    async fn pending_jobs(&self, shard: ShardId) -> Result<Vec<PendingJob>, FeedError> {
        let state = self.lock()?;
        Ok(state
            .shards
            .get(&shard)
            .map(|s| {
                s.by_score
                    .iter()
                    .filter_map(|(_, id)| s.jobs.get(id).cloned())
                    .collect()
            })
            .unwrap_or_default())
    }
}
