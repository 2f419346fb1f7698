//! In-process fakes for the consumed interfaces.
//!
//! Compiled for this crate's tests and behind the `test-mock` feature for
//! downstream crates.

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use clanchat_types::{ConversationId, Message, compare_timestamps, next_local_timestamp};
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::api::{ApiError, ChatApi};
use crate::transport::{
    EventStream, Transport, TransportError, TransportEvent, TransportSession, topic_for,
};

pub use crate::credentials::StaticCredentials;

// ============================================================================
// FakeTransport
// ============================================================================

/// Broker stand-in. Tracks subscriptions per topic like a real broker would,
/// so a double subscribe shows up as duplicate frames.
#[derive(Clone, Default)]
pub struct FakeTransport {
    inner: Arc<Mutex<TransportState>>,
}

#[derive(Default)]
struct TransportState {
    opens: u32,
    fail_opens: u32,
    next_session: u64,
    link: Option<Link>,
    subscribe_calls: Vec<String>,
}

struct Link {
    id: u64,
    events: mpsc::UnboundedSender<TransportEvent>,
    topics: BTreeMap<String, usize>,
}

impl FakeTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` opens fail. Zero clears any remaining failures.
    pub fn fail_next_opens(&self, n: u32) {
        self.inner.lock().fail_opens = n;
    }

    /// Opens attempted, failed ones included.
    pub fn open_count(&self) -> u32 {
        self.inner.lock().opens
    }

    pub fn is_open(&self) -> bool {
        self.inner.lock().link.is_some()
    }

    /// Topic → subscription count on the open session.
    pub fn subscriptions(&self) -> BTreeMap<String, usize> {
        self.inner
            .lock()
            .link
            .as_ref()
            .map(|link| link.topics.clone())
            .unwrap_or_default()
    }

    /// Every subscribe call ever made, in order.
    pub fn subscribe_calls(&self) -> Vec<String> {
        self.inner.lock().subscribe_calls.clone()
    }

    /// Publish a raw payload. Returns how many frames went out (one per
    /// subscription to the topic).
    pub fn deliver(&self, topic: &str, payload: impl Into<String>) -> usize {
        let payload = payload.into();
        let state = self.inner.lock();
        let Some(link) = &state.link else {
            return 0;
        };
        let count = link.topics.get(topic).copied().unwrap_or(0);
        for _ in 0..count {
            let _ = link.events.send(TransportEvent::Frame {
                topic: topic.to_string(),
                payload: payload.clone(),
            });
        }
        count
    }

    /// Publish a message on its conversation's topic.
    pub fn deliver_message(&self, message: &Message) -> usize {
        let payload = serde_json::to_string(message).unwrap_or_default();
        self.deliver(&topic_for(&message.conversation_id), payload)
    }

    /// Kill the open session from the server side.
    pub fn drop_connection(&self, reason: &str) {
        if let Some(link) = self.inner.lock().link.take() {
            let _ = link.events.send(TransportEvent::Closed {
                reason: reason.to_string(),
            });
        }
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn open(&self, _token: &str) -> Result<(Box<dyn TransportSession>, EventStream), TransportError> {
        let mut state = self.inner.lock();
        state.opens += 1;
        if state.fail_opens > 0 {
            state.fail_opens -= 1;
            return Err(TransportError::Unavailable("scripted failure".into()));
        }

        state.next_session += 1;
        let id = state.next_session;
        let (tx, rx) = mpsc::unbounded_channel();
        state.link = Some(Link {
            id,
            events: tx,
            topics: BTreeMap::new(),
        });
        let session = FakeSession {
            id,
            inner: self.inner.clone(),
        };
        Ok((Box::new(session), rx))
    }
}

struct FakeSession {
    id: u64,
    inner: Arc<Mutex<TransportState>>,
}

impl FakeSession {
    fn with_link<R>(&self, f: impl FnOnce(&mut Link) -> R) -> Result<R, TransportError> {
        let mut state = self.inner.lock();
        match state.link.as_mut() {
            Some(link) if link.id == self.id => Ok(f(link)),
            _ => Err(TransportError::Closed),
        }
    }
}

#[async_trait]
impl TransportSession for FakeSession {
    async fn subscribe(&self, topic: &str) -> Result<(), TransportError> {
        self.with_link(|link| *link.topics.entry(topic.to_string()).or_insert(0) += 1)?;
        self.inner.lock().subscribe_calls.push(topic.to_string());
        Ok(())
    }

    async fn unsubscribe(&self, topic: &str) -> Result<(), TransportError> {
        self.with_link(|link| {
            if let Some(count) = link.topics.get_mut(topic) {
                *count -= 1;
                if *count == 0 {
                    link.topics.remove(topic);
                }
            }
        })
    }

    async fn close(&self) {
        let mut state = self.inner.lock();
        if state.link.as_ref().is_some_and(|link| link.id == self.id) {
            state.link = None;
        }
    }
}

// ============================================================================
// FakeApi
// ============================================================================

/// Scripted history and send endpoint.
#[derive(Default)]
pub struct FakeApi {
    state: Mutex<ApiState>,
}

#[derive(Default)]
struct ApiState {
    history: HashMap<ConversationId, Vec<Message>>,
    history_failures: HashMap<ConversationId, ApiError>,
    history_delays: HashMap<ConversationId, Duration>,
    history_requests: Vec<(ConversationId, Option<String>)>,
    send_results: VecDeque<Result<(), ApiError>>,
    send_delay: Option<Duration>,
    send_attempts: Vec<(ConversationId, String)>,
}

impl FakeApi {
    pub fn new() -> Self {
        Self::default()
    }

    /// Full server-side history for a conversation, any order.
    pub fn set_history(&self, conversation_id: &ConversationId, messages: Vec<Message>) {
        self.state.lock().history.insert(conversation_id.clone(), messages);
    }

    pub fn fail_history(&self, conversation_id: &ConversationId, error: ApiError) {
        self.state
            .lock()
            .history_failures
            .insert(conversation_id.clone(), error);
    }

    pub fn delay_history(&self, conversation_id: &ConversationId, delay: Duration) {
        self.state
            .lock()
            .history_delays
            .insert(conversation_id.clone(), delay);
    }

    /// Outcome for the next send; unscripted sends succeed.
    pub fn push_send_result(&self, result: Result<(), ApiError>) {
        self.state.lock().send_results.push_back(result);
    }

    pub fn set_send_delay(&self, delay: Option<Duration>) {
        self.state.lock().send_delay = delay;
    }

    pub fn send_attempts(&self) -> Vec<(ConversationId, String)> {
        self.state.lock().send_attempts.clone()
    }

    pub fn sent_contents(&self) -> Vec<String> {
        self.state
            .lock()
            .send_attempts
            .iter()
            .map(|(_, content)| content.clone())
            .collect()
    }

    pub fn history_requests(&self) -> Vec<(ConversationId, Option<String>)> {
        self.state.lock().history_requests.clone()
    }
}

#[async_trait]
impl ChatApi for FakeApi {
    async fn get_messages(
        &self,
        conversation_id: &ConversationId,
        before: Option<&str>,
        limit: usize,
    ) -> Result<Vec<Message>, ApiError> {
        let delay = {
            let mut state = self.state.lock();
            state
                .history_requests
                .push((conversation_id.clone(), before.map(String::from)));
            state.history_delays.get(conversation_id).copied()
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let state = self.state.lock();
        if let Some(error) = state.history_failures.get(conversation_id) {
            return Err(error.clone());
        }
        let mut older: Vec<Message> = state
            .history
            .get(conversation_id)
            .into_iter()
            .flatten()
            .filter(|m| before.is_none_or(|b| compare_timestamps(&m.timestamp, b) == Ordering::Less))
            .cloned()
            .collect();
        older.sort_by(|a, b| compare_timestamps(&a.timestamp, &b.timestamp));
        let start = older.len().saturating_sub(limit);
        Ok(older.split_off(start))
    }

    async fn send_message(
        &self,
        conversation_id: &ConversationId,
        content: &str,
    ) -> Result<Message, ApiError> {
        let (delay, outcome, n) = {
            let mut state = self.state.lock();
            state
                .send_attempts
                .push((conversation_id.clone(), content.to_string()));
            let outcome = state.send_results.pop_front().unwrap_or(Ok(()));
            (state.send_delay, outcome, state.send_attempts.len())
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        outcome.map(|()| {
            Message::new(conversation_id.clone(), next_local_timestamp(), "server", content)
                .with_id(format!("srv-{n}"))
        })
    }
}
