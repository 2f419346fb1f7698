//! History and send API consumed by the sync controller.
//!
//! The request/response mechanics (HTTP, GraphQL, auth headers) live behind
//! [`ChatApi`]; this crate only needs the two calls and a typed failure that
//! separates moderation rejections from everything retryable.

use std::str::FromStr;

use async_trait::async_trait;
use clanchat_types::{ConversationId, Message};
use strum::EnumString;

/// Why the server refused a message. Retrying never helps.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, EnumString)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum ModerationReason {
    /// Content flagged as uncivil.
    ToxicityWarning,
    Banned,
    /// Muted for 24 hours.
    Muted,
    #[strum(serialize = "READONLY")]
    ReadOnly,
}

impl ModerationReason {
    const ALL: [ModerationReason; 4] = [
        ModerationReason::ToxicityWarning,
        ModerationReason::Banned,
        ModerationReason::Muted,
        ModerationReason::ReadOnly,
    ];

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        <Self as FromStr>::from_str(s).ok()
    }

    /// Marker the server embeds in its error text.
    pub fn as_str(&self) -> &'static str {
        match self {
            ModerationReason::ToxicityWarning => "TOXICITY_WARNING",
            ModerationReason::Banned => "BANNED",
            ModerationReason::Muted => "MUTED",
            ModerationReason::ReadOnly => "READONLY",
        }
    }

    /// Find a moderation marker anywhere in a server error message.
    pub fn from_server_message(message: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|reason| message.contains(reason.as_str()))
    }

    /// Text shown to the sender.
    pub fn user_message(&self) -> &'static str {
        match self {
            ModerationReason::ToxicityWarning => "Keep it civil",
            ModerationReason::Banned => "You are banned",
            ModerationReason::Muted => "You are muted for 24h",
            ModerationReason::ReadOnly => "You are temporarily read-only",
        }
    }
}

impl std::fmt::Display for ModerationReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.user_message())
    }
}

/// Failure of a history fetch or send.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ApiError {
    #[error("rejected: {0}")]
    Moderation(ModerationReason),
    #[error("unauthorized")]
    Unauthorized,
    #[error("network error: {0}")]
    Network(String),
    #[error("server error: {0}")]
    Server(String),
    #[error("request timed out")]
    Timeout,
}

impl ApiError {
    /// Classify a server error message, picking out moderation markers.
    pub fn from_server_message(message: impl Into<String>) -> Self {
        let message = message.into();
        match ModerationReason::from_server_message(&message) {
            Some(reason) => ApiError::Moderation(reason),
            None => ApiError::Server(message),
        }
    }

    /// Whether a later attempt might succeed. Everything but moderation is.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, ApiError::Moderation(_))
    }

    pub fn moderation(&self) -> Option<ModerationReason> {
        match self {
            ApiError::Moderation(reason) => Some(*reason),
            _ => None,
        }
    }
}

/// Server-side chat operations.
#[async_trait]
pub trait ChatApi: Send + Sync {
    /// Up to `limit` messages, ascending by timestamp. `before` absent means
    /// the most recent page; otherwise the page strictly older than it.
    async fn get_messages(
        &self,
        conversation_id: &ConversationId,
        before: Option<&str>,
        limit: usize,
    ) -> Result<Vec<Message>, ApiError>;

    /// Deliver a message. The returned copy only confirms delivery; the live
    /// feed carries the copy other viewers see.
    async fn send_message(
        &self,
        conversation_id: &ConversationId,
        content: &str,
    ) -> Result<Message, ApiError>;
}
