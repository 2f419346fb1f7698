//! Outbox flushing.
//!
//! A flush walks one conversation's outbox oldest first and stops at the
//! first failure, so queued messages are never delivered out of order. A
//! moderation rejection drops that entry before stopping; the rest wait for
//! the next flush. [`FlushGate`] keeps two passes over the same conversation from
//! running at once, across every controller in the process.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use clanchat_store::MessageStore;
use clanchat_types::{ConversationId, Message};
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::api::{ApiError, ChatApi, ModerationReason};

/// Per-conversation flush exclusion. Clones share state.
#[derive(Clone, Debug, Default)]
pub struct FlushGate {
    active: Arc<Mutex<HashSet<ConversationId>>>,
}

impl FlushGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the conversation, or `None` if a flush already holds it.
    pub fn try_acquire(&self, conversation_id: &ConversationId) -> Option<FlushPermit> {
        if !self.active.lock().insert(conversation_id.clone()) {
            return None;
        }
        Some(FlushPermit {
            conversation_id: conversation_id.clone(),
            active: self.active.clone(),
        })
    }

    pub fn is_flushing(&self, conversation_id: &ConversationId) -> bool {
        self.active.lock().contains(conversation_id)
    }
}

/// Held for the duration of one flush pass.
#[derive(Debug)]
pub struct FlushPermit {
    conversation_id: ConversationId,
    active: Arc<Mutex<HashSet<ConversationId>>>,
}

impl Drop for FlushPermit {
    fn drop(&mut self) {
        self.active.lock().remove(&self.conversation_id);
    }
}

/// What happened to one outbox entry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum FlushOutcome {
    Delivered(Message),
    Rejected(Message, ModerationReason),
    Failed(Message, ApiError),
}

/// Send with an upper bound; expiry is [`ApiError::Timeout`].
pub(crate) async fn deliver(
    api: &dyn ChatApi,
    conversation_id: &ConversationId,
    content: &str,
    limit: Duration,
) -> Result<Message, ApiError> {
    match tokio::time::timeout(limit, api.send_message(conversation_id, content)).await {
        Ok(result) => result,
        Err(_) => Err(ApiError::Timeout),
    }
}

/// One flush pass over a conversation's outbox. Store bookkeeping happens
/// here; `report` hears about each entry attempted.
pub(crate) async fn flush_conversation(
    api: &dyn ChatApi,
    store: &MessageStore,
    gate: &FlushGate,
    conversation_id: &ConversationId,
    limit: Duration,
    mut report: impl FnMut(FlushOutcome) + Send,
) {
    let Some(_permit) = gate.try_acquire(conversation_id) else {
        debug!(conversation = %conversation_id, "flush already in progress");
        return;
    };

    let entries = store.get_outbox_messages(Some(conversation_id));
    if entries.is_empty() {
        return;
    }
    debug!(conversation = %conversation_id, pending = entries.len(), "flushing outbox");

    for entry in entries {
        if store.is_exhausted(&entry) {
            debug!(outbox_id = %entry.outbox_id, retries = entry.retry_count, "skipping exhausted entry");
            continue;
        }

        match deliver(api, conversation_id, &entry.message.content, limit).await {
            Ok(_) => {
                store.remove_outbox_message(&entry.outbox_id);
                report(FlushOutcome::Delivered(entry.message));
            }
            Err(ApiError::Moderation(reason)) => {
                warn!(outbox_id = %entry.outbox_id, ?reason, "queued message rejected, dropping");
                store.remove_outbox_message(&entry.outbox_id);
                report(FlushOutcome::Rejected(entry.message, reason));
                break;
            }
            Err(e) => {
                warn!(
                    outbox_id = %entry.outbox_id,
                    retry = entry.retry_count + 1,
                    "queued message failed, stopping flush: {e}"
                );
                store.record_outbox_failure(&entry);
                report(FlushOutcome::Failed(entry.message, e));
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use clanchat_store::{MemoryKv, StoreConfig};

    use super::*;
    use crate::testing::FakeApi;

    const LIMIT: Duration = Duration::from_secs(30);

    fn queued(store: &MessageStore) {
        // Enqueued newest first; the flush must still go oldest first.
        for (ts, text) in [
            ("2024-01-01T00:00:03.000Z", "three"),
            ("2024-01-01T00:00:01.000Z", "one"),
            ("2024-01-01T00:00:02.000Z", "two"),
        ] {
            store.add_outbox_message(Message::new("c1", ts, "me", text));
        }
    }

    fn store() -> MessageStore {
        MessageStore::new(MemoryKv::new(), StoreConfig::default())
    }

    #[tokio::test]
    async fn test_flush_in_timestamp_order() {
        let store = store();
        queued(&store);
        let api = FakeApi::new();
        let mut outcomes = Vec::new();

        flush_conversation(&api, &store, &FlushGate::new(), &"c1".into(), LIMIT, |o| outcomes.push(o)).await;

        assert_eq!(api.sent_contents(), ["one", "two", "three"]);
        assert!(store.get_outbox_messages(None).is_empty());
        assert!(outcomes.iter().all(|o| matches!(o, FlushOutcome::Delivered(_))));
    }

    #[tokio::test]
    async fn test_flush_stops_at_first_failure() {
        let store = store();
        queued(&store);
        let api = FakeApi::new();
        api.push_send_result(Err(ApiError::Network("reset".into())));

        flush_conversation(&api, &store, &FlushGate::new(), &"c1".into(), LIMIT, |_| {}).await;

        assert_eq!(api.sent_contents(), ["one"]);
        let left = store.get_outbox_messages(None);
        assert_eq!(left.len(), 3);
        assert_eq!(left[0].message.content, "one");
        assert_eq!(left[0].retry_count, 1);
        assert_eq!(left[1].retry_count, 0);
    }

    #[tokio::test]
    async fn test_rejected_entry_dropped_and_flush_stops() {
        let store = store();
        queued(&store);
        let api = FakeApi::new();
        api.push_send_result(Err(ApiError::Moderation(ModerationReason::ToxicityWarning)));
        let mut outcomes = Vec::new();

        flush_conversation(&api, &store, &FlushGate::new(), &"c1".into(), LIMIT, |o| outcomes.push(o)).await;

        assert_eq!(api.sent_contents(), ["one"]);
        let left: Vec<String> = store
            .get_outbox_messages(None)
            .into_iter()
            .map(|e| e.message.content)
            .collect();
        assert_eq!(left, ["two", "three"]);
        assert_eq!(outcomes.len(), 1);
        assert!(matches!(
            outcomes[0],
            FlushOutcome::Rejected(_, ModerationReason::ToxicityWarning)
        ));
    }

    #[tokio::test]
    async fn test_exhausted_entries_skipped() {
        let store = store();
        let id = store
            .add_outbox_message(Message::new("c1", "2024-01-01T00:00:01.000Z", "me", "stuck"))
            .unwrap();
        store.update_outbox_message(
            &id,
            &clanchat_store::OutboxPatch {
                retry_count: Some(3),
                last_attempt: None,
            },
        );
        store.add_outbox_message(Message::new("c1", "2024-01-01T00:00:02.000Z", "me", "fresh"));
        let api = FakeApi::new();

        flush_conversation(&api, &store, &FlushGate::new(), &"c1".into(), LIMIT, |_| {}).await;

        assert_eq!(api.sent_contents(), ["fresh"]);
        assert_eq!(store.get_outbox_messages(None).len(), 1);
    }

    #[tokio::test]
    async fn test_gate_makes_reentrant_flush_a_noop() {
        let store = store();
        queued(&store);
        let api = FakeApi::new();
        let gate = FlushGate::new();
        let c1: ConversationId = "c1".into();

        let permit = gate.try_acquire(&c1).unwrap();
        assert!(gate.try_acquire(&c1).is_none());
        flush_conversation(&api, &store, &gate, &c1, LIMIT, |_| {}).await;
        assert!(api.sent_contents().is_empty());

        drop(permit);
        assert!(!gate.is_flushing(&c1));
        flush_conversation(&api, &store, &gate, &c1, LIMIT, |_| {}).await;
        assert_eq!(api.sent_contents().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deliver_times_out() {
        let api = FakeApi::new();
        api.set_send_delay(Some(Duration::from_secs(60)));
        let result = deliver(&api, &"c1".into(), "hi", LIMIT).await;
        assert_eq!(result, Err(ApiError::Timeout));
    }
}
