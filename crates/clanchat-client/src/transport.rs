//! Live push transport seam.
//!
//! A [`Transport`] opens one physical session per connect; the session
//! multiplexes topic subscriptions and reports inbound frames and closure on
//! an event channel. STOMP over websockets fits this shape, as does any
//! broker with topic subscribe/unsubscribe.

use async_trait::async_trait;
use clanchat_types::ConversationId;
use tokio::sync::mpsc;

use crate::constants::TOPIC_PREFIX;

/// Transport-level failure.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("transport unavailable: {0}")]
    Unavailable(String),
    #[error("session closed")]
    Closed,
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("timed out")]
    Timeout,
}

/// Something the open session reports.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TransportEvent {
    /// A message body on a subscribed topic. Parsing is the caller's job.
    Frame { topic: String, payload: String },
    /// The peer or network ended the session.
    Closed { reason: String },
    /// A protocol-level error; the session is unusable afterwards.
    Error(String),
}

/// Inbound events for one session. The stream ending means the session died.
pub type EventStream = mpsc::UnboundedReceiver<TransportEvent>;

/// Opens sessions.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn open(&self, token: &str) -> Result<(Box<dyn TransportSession>, EventStream), TransportError>;
}

/// One open session.
#[async_trait]
pub trait TransportSession: Send + Sync {
    async fn subscribe(&self, topic: &str) -> Result<(), TransportError>;
    async fn unsubscribe(&self, topic: &str) -> Result<(), TransportError>;
    async fn close(&self);
}

/// Live topic for a conversation.
pub fn topic_for(conversation_id: &ConversationId) -> String {
    format!("{TOPIC_PREFIX}{conversation_id}")
}

/// Inverse of [`topic_for`].
pub fn conversation_for_topic(topic: &str) -> Option<ConversationId> {
    topic
        .strip_prefix(TOPIC_PREFIX)
        .filter(|id| !id.is_empty())
        .map(ConversationId::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topic_addressing() {
        let id = ConversationId::from("global#shard-7");
        let topic = topic_for(&id);
        assert_eq!(topic, "/topic/chat/global#shard-7");
        assert_eq!(conversation_for_topic(&topic), Some(id));
        assert_eq!(conversation_for_topic("/topic/chat/"), None);
        assert_eq!(conversation_for_topic("/queue/other"), None);
    }
}
