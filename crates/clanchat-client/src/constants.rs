//! Client configuration constants.
//!
//! Defaults for [`ClientConfig`](crate::ClientConfig). Store limits live in
//! `clanchat_store::config`.

use std::time::Duration;

/// Messages requested per history page.
pub const DEFAULT_PAGE_SIZE: usize = 20;

/// First reconnect delay; each further attempt doubles it.
pub const RECONNECT_BASE_DELAY: Duration = Duration::from_millis(1000);

/// Automatic reconnects stop after this many consecutive failures. A
/// foreground signal or explicit `connect()` starts again.
pub const MAX_RECONNECT_ATTEMPTS: u32 = 5;

/// Upper bound on opening the live connection, so a stalled handshake never
/// leaves the manager stuck in `connecting`.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Upper bound on one history fetch or send. Expiry counts as a transient
/// failure.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// How often the background task prunes the local store.
pub const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Sender id stamped on optimistic messages when the caller gives none.
pub const DEFAULT_SENDER_ID: &str = "current-user";

/// Live topics are `TOPIC_PREFIX` followed by the conversation id.
pub const TOPIC_PREFIX: &str = "/topic/chat/";
