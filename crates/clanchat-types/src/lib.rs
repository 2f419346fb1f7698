//! Shared message and conversation types for clanchat.
//!
//! This crate is the leaf of the workspace: typed conversation ids, the chat
//! [`Message`] wire model, and the global shard resolver. It has **no internal
//! clanchat dependencies**.
//!
//! # Identity
//!
//! Two messages are the same message when their `(timestamp, sender_id)` pair
//! matches. Server ids are optional and absent on optimistic copies, so they
//! never participate in deduplication.
//!
//! |-------------------|-----------------------------------------------|
//! | Type              | Purpose                                       |
//! |-------------------|-----------------------------------------------|
//! | [`ConversationId`]| Which chat stream (direct, clan, global shard)|
//! | [`Message`]       | One chat message, optimistic or authoritative |
//! | [`MessageKey`]    | Deduplication identity `(timestamp, sender)`  |
//! | [`MessagePatch`]  | Partial update applied by timestamp           |
//! | [`DeliveryStatus`]| `sending` / `sent` / `failed`                 |
//! |-------------------|-----------------------------------------------|

pub mod ids;
pub mod message;
pub mod shard;

pub use ids::ConversationId;
pub use message::{
    DeliveryStatus, Message, MessageKey, MessagePatch, compare_timestamps, insert_sorted,
    next_local_timestamp, sort_by_timestamp,
};
pub use shard::{DEFAULT_SHARD, SHARD_COUNT, java_string_hash, shard_for, shard_index};

/// Current time as Unix milliseconds.
pub fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
