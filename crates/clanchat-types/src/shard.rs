//! Global chat shard resolution.
//!
//! The global conversation is partitioned across [`SHARD_COUNT`] shards and
//! the server picks a user's shard with Java's `String.hashCode`. The client
//! must reproduce that hash bit for bit, including 32-bit wraparound and
//! hashing UTF-16 code units rather than bytes or chars.

use crate::ids::ConversationId;

/// Number of global shards. Must match the server.
pub const SHARD_COUNT: i32 = 20;

/// Shard used when no usable user id is available.
pub const DEFAULT_SHARD: &str = "global#shard-0";

/// Java `String.hashCode`: `h = 31 * h + unit` over UTF-16 code units,
/// wrapping at 32 bits, seeded at zero.
pub fn java_string_hash(s: &str) -> i32 {
    s.encode_utf16()
        .fold(0i32, |h, unit| h.wrapping_mul(31).wrapping_add(unit as i32))
}

/// Non-negative shard index for a user id.
pub fn shard_index(user_id: &str) -> u32 {
    // rem_euclid == ((h % n) + n) % n for a positive modulus
    java_string_hash(user_id).rem_euclid(SHARD_COUNT) as u32
}

/// Global shard conversation for a user. Absent or empty ids map to
/// [`DEFAULT_SHARD`].
pub fn shard_for(user_id: Option<&str>) -> ConversationId {
    match user_id {
        Some(id) if !id.is_empty() => ConversationId::new(format!("global#shard-{}", shard_index(id))),
        _ => ConversationId::from(DEFAULT_SHARD),
    }
}
