//! blockfeed-storage: block storage tiers.
//!
//! Backends:
//! - [`memory`]: in-memory ordered map per chain (cache tier, tests)
//! - [`sqlite`]: SQLite via `sqlx` (durable tier, or a cache tier shared by processes)
//! - `postgres`: PostgreSQL via `sqlx` (durable tier)
//! - [`cached`]: two-tier composition with a background cache → durable flusher

pub mod cached;

#[cfg(feature = "memory")]
pub mod memory;

#[cfg(feature = "sqlite")]
pub mod sqlite;

#[cfg(feature = "postgres")]
pub mod postgres;

pub use cached::CachedBlockStore;

#[cfg(feature = "memory")]
pub use memory::MemoryBlockStore;

#[cfg(feature = "sqlite")]
pub use sqlite::SqliteBlockStore;

#[cfg(feature = "postgres")]
pub use postgres::PostgresBlockStore;
