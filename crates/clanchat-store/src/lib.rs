//! Local message store for clanchat clients.
//!
//! Two independent keyspaces sit on one synchronous key-value backend:
//!
//! - **cache**: the last [`StoreConfig::cache_limit`] messages per
//!   conversation, dropped wholesale once older than the expiry window
//! - **outbox**: locally-originated messages awaiting delivery, with retry
//!   bookkeeping
//!
//! [`MessageStore`] never returns errors: backend faults are logged and
//! degrade to an empty read or a skipped write. The server stays the source of
//! truth for history, so losing cache is always recoverable.

pub mod clock;
pub mod config;
pub mod kv;
pub mod sqlite;
pub mod store;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::StoreConfig;
pub use kv::{KvStore, MemoryKv, StoreError};
pub use sqlite::SqliteKv;
pub use store::{CachedConversation, MessageStore, OutboxEntry, OutboxPatch, StorageInfo};
