//! Store limits.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Maximum messages kept per cached conversation.
pub const DEFAULT_CACHE_LIMIT: usize = 50;

/// A cached conversation older than this is discarded on read.
pub const DEFAULT_CACHE_EXPIRY_HOURS: u64 = 24;

/// Outbox entries at or past this many failed attempts are never retried.
pub const DEFAULT_MAX_OUTBOX_RETRIES: u32 = 3;

/// Limits for [`MessageStore`](crate::MessageStore).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub cache_limit: usize,
    pub cache_expiry_hours: u64,
    pub max_outbox_retries: u32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            cache_limit: DEFAULT_CACHE_LIMIT,
            cache_expiry_hours: DEFAULT_CACHE_EXPIRY_HOURS,
            max_outbox_retries: DEFAULT_MAX_OUTBOX_RETRIES,
        }
    }
}

impl StoreConfig {
    pub fn cache_expiry(&self) -> Duration {
        Duration::from_secs(self.cache_expiry_hours * 60 * 60)
    }
}
