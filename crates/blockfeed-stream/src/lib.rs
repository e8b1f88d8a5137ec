//! blockfeed-stream: durable append log and per-shard webhook scheduling.
//!
//! ```text
//! Stream<T> ── publish / subscribe(group, consumer) / ack_del
//!     │
//!     └── LogBackend ─┬─ MemoryLog   (single process, tests)
//!                     └─ SqliteLog   (shared by processes, survives restarts)
//!
//! WebhookStream (one per shard)
//!     ├── set / get / delete webhook
//!     ├── flush(latest_height)      pending set → delivery log
//!     └── ack / ack_and_rearm       delivery log → pending set
//! ```
//!
//! Every operation that touches scheduling state runs as one atomic step
//! inside the backend.

pub mod backend;
#[cfg(feature = "memory")]
pub mod memory;
pub mod scheduler;
pub mod stream;

#[cfg(feature = "sqlite")]
pub mod sqlite;

pub use backend::{
    LogBackend, LogMessage, MessageId, PendingEntry, PendingJob, Rearm, RearmMode,
    ScheduleBackend,
};
#[cfg(feature = "memory")]
pub use memory::MemoryLog;
pub use scheduler::{ShardSet, WebhookStream};
pub use stream::{MessageBatch, Stream, StreamHandler, StreamMessage};

#[cfg(feature = "sqlite")]
pub use sqlite::SqliteLog;
