//! Chat message model.
//!
//! The JSON shape matches the live feed and history API (`chatId`, `ts`,
//! `senderId`, `status`), so frames deserialize straight into [`Message`].

use std::cmp::Ordering;
use std::str::FromStr;
use std::sync::atomic::{AtomicI64, Ordering as AtomicOrdering};

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use strum::EnumString;

use crate::ids::ConversationId;

/// Local delivery state of a message.
///
/// Messages from the server are always `Sent`; the other states only exist on
/// optimistic copies created by this client.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Default, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(ascii_case_insensitive)]
pub enum DeliveryStatus {
    /// Shown optimistically, delivery attempt in flight.
    Sending,
    /// Confirmed by the server.
    #[default]
    Sent,
    /// Delivery failed; the message waits in the outbox.
    Failed,
}

impl DeliveryStatus {
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        <Self as FromStr>::from_str(s).ok()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryStatus::Sending => "sending",
            DeliveryStatus::Sent => "sent",
            DeliveryStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A single chat message.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    /// Server-assigned id. Absent on optimistic copies.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(rename = "chatId")]
    pub conversation_id: ConversationId,
    /// ISO-8601 timestamp.
    #[serde(rename = "ts")]
    pub timestamp: String,
    pub sender_id: String,
    pub content: String,
    #[serde(rename = "status", default)]
    pub delivery_status: DeliveryStatus,
}

impl Message {
    /// Build an authoritative (server-side) message.
    pub fn new(
        conversation_id: impl Into<ConversationId>,
        timestamp: impl Into<String>,
        sender_id: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            id: None,
            conversation_id: conversation_id.into(),
            timestamp: timestamp.into(),
            sender_id: sender_id.into(),
            content: content.into(),
            delivery_status: DeliveryStatus::Sent,
        }
    }

    /// Build an optimistic local copy stamped with a fresh local timestamp.
    pub fn optimistic(
        conversation_id: ConversationId,
        sender_id: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            id: None,
            conversation_id,
            timestamp: next_local_timestamp(),
            sender_id: sender_id.into(),
            content: content.into(),
            delivery_status: DeliveryStatus::Sending,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_status(mut self, status: DeliveryStatus) -> Self {
        self.delivery_status = status;
        self
    }

    pub fn key(&self) -> MessageKey {
        MessageKey {
            timestamp: self.timestamp.clone(),
            sender_id: self.sender_id.clone(),
        }
    }

    /// Same `(timestamp, sender_id)` identity.
    pub fn same_identity(&self, other: &Message) -> bool {
        self.timestamp == other.timestamp && self.sender_id == other.sender_id
    }

    /// A local copy that has not been confirmed by the server.
    pub fn is_placeholder(&self) -> bool {
        self.delivery_status != DeliveryStatus::Sent
    }
}

/// Deduplication identity of a message.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct MessageKey {
    pub timestamp: String,
    pub sender_id: String,
}

impl MessageKey {
    pub fn matches(&self, message: &Message) -> bool {
        self.timestamp == message.timestamp && self.sender_id == message.sender_id
    }
}

/// Partial update for a message located by timestamp.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessagePatch {
    pub id: Option<String>,
    pub content: Option<String>,
    pub delivery_status: Option<DeliveryStatus>,
}

impl MessagePatch {
    pub fn status(status: DeliveryStatus) -> Self {
        Self {
            delivery_status: Some(status),
            ..Self::default()
        }
    }

    pub fn content(content: impl Into<String>) -> Self {
        Self {
            content: Some(content.into()),
            ..Self::default()
        }
    }

    pub fn apply(&self, message: &mut Message) {
        if let Some(id) = &self.id {
            message.id = Some(id.clone());
        }
        if let Some(content) = &self.content {
            message.content = content.clone();
        }
        if let Some(status) = self.delivery_status {
            message.delivery_status = status;
        }
    }
}

/// Order two message timestamps.
///
/// RFC 3339 values compare as instants (so `+02:00` offsets sort correctly);
/// anything unparseable falls back to plain string order.
pub fn compare_timestamps(a: &str, b: &str) -> Ordering {
    match (DateTime::parse_from_rfc3339(a), DateTime::parse_from_rfc3339(b)) {
        (Ok(a), Ok(b)) => a.cmp(&b),
        _ => a.cmp(b),
    }
}

/// Stable sort by timestamp, ascending.
pub fn sort_by_timestamp(messages: &mut [Message]) {
    messages.sort_by(|a, b| compare_timestamps(&a.timestamp, &b.timestamp));
}

/// Insert into an ascending list, after any entries with an equal timestamp.
pub fn insert_sorted(messages: &mut Vec<Message>, message: Message) {
    let pos = messages.partition_point(|m| {
        compare_timestamps(&m.timestamp, &message.timestamp) != Ordering::Greater
    });
    messages.insert(pos, message);
}

static LAST_LOCAL_MILLIS: AtomicI64 = AtomicI64::new(0);

/// Next local timestamp, RFC 3339 UTC with millisecond precision.
///
/// Strictly increasing within the process: two sends in the same millisecond
/// get distinct timestamps, so their `(timestamp, sender)` keys never collide.
pub fn next_local_timestamp() -> String {
    let now = Utc::now().timestamp_millis();
    let mut prev = LAST_LOCAL_MILLIS.load(AtomicOrdering::Relaxed);
    loop {
        let next = now.max(prev + 1);
        match LAST_LOCAL_MILLIS.compare_exchange_weak(
            prev,
            next,
            AtomicOrdering::AcqRel,
            AtomicOrdering::Relaxed,
        ) {
            Ok(_) => return format_millis(next),
            Err(actual) => prev = actual,
        }
    }
}

fn format_millis(millis: i64) -> String {
    DateTime::<Utc>::from_timestamp_millis(millis)
        .map(|dt| dt.to_rfc3339_opts(SecondsFormat::Millis, true))
        .unwrap_or_else(|| millis.to_string())
}
