//! Sync controller: one chat view kept consistent across cache, history
//! fetch, and the live feed.
//!
//! Each [`ChatSync`] is an actor task owning the UI-facing message list. It
//! never awaits I/O itself: history fetches, sends, and outbox flushes run as
//! spawned tasks that post their results back, so live messages keep flowing
//! while a request is pending.
//!
//! ```text
//!   cache ──read──▶ ┌───────────┐ ◀── history fetch (replace)
//!                   │ SyncActor │ ◀── live frames (dedup, append)
//!   UI ◀── watch ── └───────────┘ ──▶ send / outbox flush
//! ```
//!
//! A conversation change bumps a generation counter. Fetches capture the
//! generation they were issued under; results from an older generation are
//! dropped on arrival.

use std::collections::{BTreeSet, HashMap};
use std::future::Future;
use std::sync::Arc;

use clanchat_store::MessageStore;
use clanchat_types::{
    ConversationId, DeliveryStatus, Message, MessagePatch, insert_sorted, sort_by_timestamp,
};
use futures::future::join_all;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, trace, warn};

use crate::api::{ApiError, ChatApi, ModerationReason};
use crate::config::SyncConfig;
use crate::connection::{ConnectionHandle, ConnectionState, ListenerGuard, Subscription};
use crate::flush::{FlushGate, FlushOutcome, deliver, flush_conversation};

/// Failure categories shown to the user.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ChatError {
    #[error("failed to load messages: {0}")]
    LoadFailed(String),
    /// Queued in the outbox; delivered on the next flush.
    #[error("message not sent, will retry: {0}")]
    SendFailedTransient(String),
    #[error("{0}")]
    SendFailedPermanent(ModerationReason),
    /// Informational; cached messages stay usable.
    #[error("network disconnected")]
    NetworkDisconnected,
    #[error("cannot send in multi-conversation mode; send to a specific conversation")]
    SendUnsupported,
    #[error("chat controller shut down")]
    Shutdown,
}

/// Snapshot of a chat view.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChatView {
    /// Ascending by timestamp. Multi mode interleaves all conversations.
    pub messages: Vec<Message>,
    pub has_more: bool,
    pub is_loading: bool,
    pub is_connected: bool,
    pub error: Option<ChatError>,
}

impl Default for ChatView {
    fn default() -> Self {
        Self {
            messages: Vec::new(),
            has_more: true,
            is_loading: false,
            is_connected: false,
            error: None,
        }
    }
}

/// Collaborators shared by every controller in the process.
#[derive(Clone)]
pub struct SyncDeps {
    pub api: Arc<dyn ChatApi>,
    pub connection: ConnectionHandle,
    pub store: Arc<MessageStore>,
    pub config: SyncConfig,
    pub flush_gate: FlushGate,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Mode {
    Single,
    Multi,
}

type Reply = oneshot::Sender<Result<(), ChatError>>;
type PageResults = Vec<(ConversationId, Result<Vec<Message>, ApiError>)>;

enum SyncCommand {
    SetConversations(Vec<ConversationId>),
    LoadMore { reply: Reply },
    Send {
        content: String,
        sender_id: Option<String>,
        reply: Reply,
    },
    Append(Message),
    Update {
        timestamp: String,
        patch: MessagePatch,
    },
    Remove {
        timestamp: String,
    },
    Retry,
}

enum SyncEvent {
    Loaded {
        generation: u64,
        results: PageResults,
    },
    LoadedMore {
        generation: u64,
        results: PageResults,
        reply: Reply,
    },
    Live(Message),
    Connection(ConnectionState),
    Sent {
        placeholder: Message,
        result: Result<Message, ApiError>,
        reply: Reply,
    },
    Flush(FlushOutcome),
}

// ============================================================================
// ChatSync handle
// ============================================================================

/// Handle to a chat view controller. Clones share the controller; it stops
/// and releases its subscriptions when the last clone is dropped.
#[derive(Clone)]
pub struct ChatSync {
    tx: mpsc::UnboundedSender<SyncCommand>,
    view: watch::Receiver<ChatView>,
}

impl ChatSync {
    /// Controller for a single conversation.
    pub fn spawn(deps: SyncDeps, conversation_id: Option<ConversationId>) -> Self {
        start(Mode::Single, deps, conversation_id.into_iter().collect())
    }

    /// Controller for the union of several conversations. Sending is
    /// unsupported; use a single-conversation controller for that.
    pub fn spawn_multi(deps: SyncDeps, conversation_ids: Vec<ConversationId>) -> Self {
        start(Mode::Multi, deps, conversation_ids)
    }

    pub fn set_conversation(&self, conversation_id: Option<ConversationId>) -> Result<(), ChatError> {
        self.send(SyncCommand::SetConversations(conversation_id.into_iter().collect()))
    }

    pub fn set_conversations(&self, conversation_ids: Vec<ConversationId>) -> Result<(), ChatError> {
        self.send(SyncCommand::SetConversations(conversation_ids))
    }

    /// Fetch the page before the oldest displayed message and prepend it.
    pub async fn load_more(&self) -> Result<(), ChatError> {
        let (reply, rx) = oneshot::channel();
        self.send(SyncCommand::LoadMore { reply })?;
        rx.await.map_err(|_| ChatError::Shutdown)?
    }

    /// Send optimistically. `Ok` means delivered, or queued because the
    /// connection is down.
    pub async fn send_message(&self, content: &str, sender_id: Option<&str>) -> Result<(), ChatError> {
        let (reply, rx) = oneshot::channel();
        self.send(SyncCommand::Send {
            content: content.to_string(),
            sender_id: sender_id.map(String::from),
            reply,
        })?;
        rx.await.map_err(|_| ChatError::Shutdown)?
    }

    pub fn append_message(&self, message: Message) -> Result<(), ChatError> {
        self.send(SyncCommand::Append(message))
    }

    pub fn update_message(&self, timestamp: &str, patch: MessagePatch) -> Result<(), ChatError> {
        self.send(SyncCommand::Update {
            timestamp: timestamp.to_string(),
            patch,
        })
    }

    pub fn remove_message(&self, timestamp: &str) -> Result<(), ChatError> {
        self.send(SyncCommand::Remove {
            timestamp: timestamp.to_string(),
        })
    }

    /// Clear the error and flush the outbox if connected.
    pub fn retry(&self) -> Result<(), ChatError> {
        self.send(SyncCommand::Retry)
    }

    pub fn view(&self) -> ChatView {
        self.view.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<ChatView> {
        self.view.clone()
    }

    /// Wait until the view satisfies `predicate`, checking the current view
    /// first.
    pub async fn wait_for(&self, predicate: impl FnMut(&ChatView) -> bool) -> Result<ChatView, ChatError> {
        let mut rx = self.view.clone();
        let view = rx.wait_for(predicate).await.map_err(|_| ChatError::Shutdown)?;
        Ok((*view).clone())
    }

    fn send(&self, command: SyncCommand) -> Result<(), ChatError> {
        self.tx.send(command).map_err(|_| ChatError::Shutdown)
    }
}

fn start(mode: Mode, deps: SyncDeps, initial: Vec<ConversationId>) -> ChatSync {
    let (tx, rx) = mpsc::unbounded_channel();
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let (view_tx, view_rx) = watch::channel(ChatView::default());

    let listener = {
        let events = events_tx.clone();
        deps.connection.add_connection_handler(move |state| {
            let _ = events.send(SyncEvent::Connection(state));
        })
    };

    let mut actor = SyncActor {
        mode,
        api: deps.api,
        connection: deps.connection,
        store: deps.store,
        config: deps.config,
        flush_gate: deps.flush_gate,
        conversations: Vec::new(),
        generation: 0,
        initialized: false,
        live_during_load: Vec::new(),
        is_connected: false,
        view: ChatView::default(),
        view_tx,
        events_tx,
        subscriptions: HashMap::new(),
        _listener: listener,
    };
    // Applied before the task starts so the first snapshot already shows the
    // cached messages.
    actor.set_conversations(initial);
    tokio::spawn(actor.run(rx, events_rx));

    ChatSync { tx, view: view_rx }
}

// ============================================================================
// SyncActor
// ============================================================================

struct SyncActor {
    mode: Mode,
    api: Arc<dyn ChatApi>,
    connection: ConnectionHandle,
    store: Arc<MessageStore>,
    config: SyncConfig,
    flush_gate: FlushGate,
    conversations: Vec<ConversationId>,
    generation: u64,
    /// Initial load finished for the current generation.
    initialized: bool,
    /// Live frames that arrived while the initial fetch was in flight. The
    /// fetched page replaces the view, so these are merged back into it.
    live_during_load: Vec<Message>,
    is_connected: bool,
    view: ChatView,
    view_tx: watch::Sender<ChatView>,
    events_tx: mpsc::UnboundedSender<SyncEvent>,
    subscriptions: HashMap<ConversationId, Subscription>,
    _listener: ListenerGuard,
}

/// Same conversation and `(timestamp, sender)`.
fn same_message(a: &Message, b: &Message) -> bool {
    a.conversation_id == b.conversation_id && a.same_identity(b)
}

impl SyncActor {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<SyncCommand>,
        mut events: mpsc::UnboundedReceiver<SyncEvent>,
    ) {
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command),
                    None => break,
                },
                Some(event) = events.recv() => self.handle_event(event),
            }
        }
        debug!(conversations = self.conversations.len(), "chat controller shutting down");
    }

    fn handle_command(&mut self, command: SyncCommand) {
        match command {
            SyncCommand::SetConversations(ids) => self.set_conversations(ids),
            SyncCommand::LoadMore { reply } => self.load_more(reply),
            SyncCommand::Send {
                content,
                sender_id,
                reply,
            } => self.send_message(content, sender_id, reply),
            SyncCommand::Append(message) => self.append_message(message),
            SyncCommand::Update { timestamp, patch } => self.update_message(&timestamp, &patch),
            SyncCommand::Remove { timestamp } => self.remove_message(&timestamp),
            SyncCommand::Retry => {
                self.view.error = None;
                self.publish();
                self.flush_outbox();
            }
        }
    }

    fn handle_event(&mut self, event: SyncEvent) {
        match event {
            SyncEvent::Loaded {
                generation,
                results,
            } => self.on_loaded(generation, results),
            SyncEvent::LoadedMore {
                generation,
                results,
                reply,
            } => self.on_loaded_more(generation, results, reply),
            SyncEvent::Live(message) => self.on_live(message),
            SyncEvent::Connection(state) => self.on_connection(state),
            SyncEvent::Sent {
                placeholder,
                result,
                reply,
            } => self.on_sent(placeholder, result, reply),
            SyncEvent::Flush(outcome) => self.on_flush(outcome),
        }
    }

    fn publish(&self) {
        self.view_tx.send_replace(self.view.clone());
    }

    // ── Initialization ───────────────────────────────────────────────────

    fn set_conversations(&mut self, ids: Vec<ConversationId>) {
        let mut seen = BTreeSet::new();
        let mut ids: Vec<ConversationId> = ids
            .into_iter()
            .filter(|id| !id.is_empty() && seen.insert(id.clone()))
            .collect();
        if self.mode == Mode::Single && ids.len() > 1 {
            warn!(count = ids.len(), "single-conversation controller given several ids, using the first");
            ids.truncate(1);
        }
        if ids == self.conversations && self.generation > 0 {
            return;
        }

        self.generation += 1;
        self.conversations = ids;
        self.initialized = false;
        // Conversations no longer shown lose their live feed now; new ones
        // subscribe after the initial load.
        let shown = &self.conversations;
        self.subscriptions.retain(|id, _| shown.contains(id));
        self.live_during_load
            .retain(|m| shown.contains(&m.conversation_id));

        if self.conversations.is_empty() {
            self.view.messages.clear();
            self.view.is_loading = false;
            self.view.error = None;
            self.publish();
            return;
        }

        let mut cached: Vec<Message> = self
            .conversations
            .iter()
            .flat_map(|id| self.store.get_messages(id))
            .collect();
        sort_by_timestamp(&mut cached);
        if !cached.is_empty() {
            self.view.has_more = cached.len() >= self.config.page_size;
        }
        self.view.messages = self.with_pending(cached);
        self.view.is_loading = true;
        self.view.error = None;
        self.publish();
        debug!(
            generation = self.generation,
            conversations = self.conversations.len(),
            cached = self.view.messages.len(),
            "loading conversations"
        );

        let fetch = self.fetch_pages(None);
        let generation = self.generation;
        let events = self.events_tx.clone();
        tokio::spawn(async move {
            let results = fetch.await;
            let _ = events.send(SyncEvent::Loaded {
                generation,
                results,
            });
        });
    }

    /// One page per current conversation, fetched concurrently.
    fn fetch_pages(&self, before: Option<String>) -> impl Future<Output = PageResults> + Send + 'static {
        let api = self.api.clone();
        let ids = self.conversations.clone();
        let limit = self.config.page_size;
        let request_timeout = self.config.request_timeout();
        async move {
            join_all(ids.into_iter().map(|id| {
                let api = api.clone();
                let before = before.clone();
                async move {
                    let fetch = api.get_messages(&id, before.as_deref(), limit);
                    let result = match tokio::time::timeout(request_timeout, fetch).await {
                        Ok(result) => result,
                        Err(_) => Err(ApiError::Timeout),
                    };
                    (id, result)
                }
            }))
            .await
        }
    }

    /// `messages` plus local placeholders that have no server copy yet:
    /// in-flight sends still on screen, then anything waiting in the outbox.
    fn with_pending(&self, mut messages: Vec<Message>) -> Vec<Message> {
        let carried: Vec<Message> = self
            .view
            .messages
            .iter()
            .filter(|m| m.is_placeholder() && self.conversations.contains(&m.conversation_id))
            .cloned()
            .collect();
        let queued = self
            .conversations
            .iter()
            .flat_map(|id| self.store.get_outbox_messages(Some(id)))
            // Entries out of retries are never flushed again.
            .filter(|entry| !self.store.is_exhausted(entry))
            .map(|entry| entry.message.with_status(DeliveryStatus::Failed));

        for placeholder in carried.into_iter().chain(queued) {
            if !messages.iter().any(|m| same_message(m, &placeholder)) {
                insert_sorted(&mut messages, placeholder);
            }
        }
        messages
    }

    fn on_loaded(&mut self, generation: u64, results: PageResults) {
        if generation != self.generation {
            debug!(generation, current = self.generation, "discarding stale history fetch");
            return;
        }

        let live = std::mem::take(&mut self.live_during_load);
        let mut merged = Vec::new();
        let mut fetched = 0;
        let mut any_ok = false;
        let mut first_error = None;
        for (id, result) in results {
            match result {
                Ok(mut page) => {
                    sort_by_timestamp(&mut page);
                    fetched += page.len();
                    for m in live.iter().filter(|m| m.conversation_id == id) {
                        if !page.iter().any(|p| p.same_identity(m)) {
                            insert_sorted(&mut page, m.clone());
                        }
                    }
                    self.store.set_messages(&id, &page);
                    any_ok = true;
                    merged.extend(page);
                }
                Err(e) => {
                    warn!(conversation = %id, "failed to load history: {e}");
                    // Keep showing what the cache had for this conversation.
                    merged.extend(
                        self.view
                            .messages
                            .iter()
                            .filter(|m| m.conversation_id == id && !m.is_placeholder())
                            .cloned(),
                    );
                    first_error.get_or_insert(e);
                }
            }
        }

        if any_ok {
            self.view.has_more = self.page_is_full(fetched);
        } else if let Some(e) = first_error {
            self.view.error = Some(ChatError::LoadFailed(e.to_string()));
        }
        sort_by_timestamp(&mut merged);
        self.view.messages = self.with_pending(merged);
        self.view.is_loading = false;
        self.initialized = true;
        info!(generation, messages = self.view.messages.len(), "conversations loaded");

        self.subscribe_live();
        self.connection.connect();
        self.flush_outbox();
        self.publish();
    }

    fn page_is_full(&self, fetched: usize) -> bool {
        match self.mode {
            Mode::Single => fetched == self.config.page_size,
            Mode::Multi => fetched >= self.config.page_size,
        }
    }

    /// Subscribe conversations that have no live handler yet; existing ones
    /// are left alone.
    fn subscribe_live(&mut self) {
        for id in &self.conversations {
            if self.subscriptions.contains_key(id) {
                continue;
            }
            let events = self.events_tx.clone();
            let subscription = self.connection.subscribe_to_chat(id, move |message| {
                let _ = events.send(SyncEvent::Live(message));
            });
            self.subscriptions.insert(id.clone(), subscription);
        }
    }

    // ── Pagination ───────────────────────────────────────────────────────

    fn load_more(&mut self, reply: Reply) {
        let oldest = match self.view.messages.first() {
            Some(m) if !self.view.is_loading && !self.conversations.is_empty() => m.timestamp.clone(),
            _ => {
                let _ = reply.send(Ok(()));
                return;
            }
        };

        self.view.is_loading = true;
        self.publish();

        let fetch = self.fetch_pages(Some(oldest));
        let generation = self.generation;
        let events = self.events_tx.clone();
        tokio::spawn(async move {
            let results = fetch.await;
            let _ = events.send(SyncEvent::LoadedMore {
                generation,
                results,
                reply,
            });
        });
    }

    fn on_loaded_more(&mut self, generation: u64, results: PageResults, reply: Reply) {
        if generation != self.generation {
            debug!(generation, "discarding stale page");
            let _ = reply.send(Ok(()));
            return;
        }

        let mut older = Vec::new();
        let mut fetched = 0;
        let mut any_ok = false;
        let mut first_error = None;
        for (id, result) in results {
            match result {
                Ok(page) => {
                    fetched += page.len();
                    any_ok = true;
                    older.extend(page);
                }
                Err(e) => {
                    warn!(conversation = %id, "failed to load older messages: {e}");
                    first_error.get_or_insert(e);
                }
            }
        }

        let outcome = match first_error {
            Some(e) if !any_ok => {
                let error = ChatError::LoadFailed(e.to_string());
                self.view.error = Some(error.clone());
                Err(error)
            }
            _ => {
                sort_by_timestamp(&mut older);
                older.retain(|m| !self.view.messages.iter().any(|shown| same_message(shown, m)));
                self.view.has_more = self.page_is_full(fetched);
                older.append(&mut self.view.messages);
                self.view.messages = older;

                for id in &self.conversations {
                    let confirmed: Vec<Message> = self
                        .view
                        .messages
                        .iter()
                        .filter(|m| &m.conversation_id == id && !m.is_placeholder())
                        .cloned()
                        .collect();
                    self.store.set_messages(id, &confirmed);
                }
                Ok(())
            }
        };

        self.view.is_loading = false;
        self.publish();
        let _ = reply.send(outcome);
    }

    // ── Live feed ────────────────────────────────────────────────────────

    fn on_live(&mut self, message: Message) {
        if !self.conversations.contains(&message.conversation_id) {
            trace!(conversation = %message.conversation_id, "live message for a conversation no longer shown");
            return;
        }

        match self.view.messages.iter().position(|m| same_message(m, &message)) {
            Some(i) if self.view.messages[i].is_placeholder() => {
                // The echo of a local send: swap in the server copy and stop
                // retrying it.
                self.view.messages[i] = message.clone();
                for entry in self.store.get_outbox_messages(Some(&message.conversation_id)) {
                    if entry.message.same_identity(&message) {
                        self.store.remove_outbox_message(&entry.outbox_id);
                    }
                }
            }
            Some(_) => return,
            None => insert_sorted(&mut self.view.messages, message.clone()),
        }
        if !self.initialized {
            self.live_during_load.push(message.clone());
        }
        let conversation_id = message.conversation_id.clone();
        self.store.append_message(&conversation_id, message);
        self.publish();
    }

    fn on_connection(&mut self, state: ConnectionState) {
        let connected = state.is_connected();
        let was_connected = self.is_connected;
        self.is_connected = connected;
        self.view.is_connected = connected;

        if connected && !was_connected {
            if self.view.error == Some(ChatError::NetworkDisconnected) {
                self.view.error = None;
            }
            self.flush_outbox();
        } else if !connected && was_connected && self.view.error.is_none() {
            self.view.error = Some(ChatError::NetworkDisconnected);
        }
        self.publish();
    }

    // ── Sending ──────────────────────────────────────────────────────────

    fn send_message(&mut self, content: String, sender_id: Option<String>, reply: Reply) {
        if self.mode == Mode::Multi {
            let _ = reply.send(Err(ChatError::SendUnsupported));
            return;
        }
        let content = content.trim();
        let Some(conversation_id) = self.conversations.first().cloned() else {
            debug!("send ignored: no conversation");
            let _ = reply.send(Ok(()));
            return;
        };
        if content.is_empty() {
            let _ = reply.send(Ok(()));
            return;
        }

        let sender_id = sender_id
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| self.config.default_sender_id.clone());
        let placeholder = Message::optimistic(conversation_id, sender_id, content);
        insert_sorted(&mut self.view.messages, placeholder.clone());
        self.publish();

        if !self.is_connected {
            debug!(conversation = %placeholder.conversation_id, "offline, queueing message");
            self.queue_failed(&placeholder);
            self.publish();
            let _ = reply.send(Ok(()));
            return;
        }

        let api = self.api.clone();
        let limit = self.config.request_timeout();
        let events = self.events_tx.clone();
        tokio::spawn(async move {
            let result = deliver(api.as_ref(), &placeholder.conversation_id, &placeholder.content, limit).await;
            let _ = events.send(SyncEvent::Sent {
                placeholder,
                result,
                reply,
            });
        });
    }

    fn on_sent(&mut self, placeholder: Message, result: Result<Message, ApiError>, reply: Reply) {
        let outcome = match result {
            Ok(_) => {
                // The server copy arrives on the live feed.
                self.remove_placeholder(&placeholder);
                Ok(())
            }
            Err(ApiError::Moderation(reason)) => {
                info!(conversation = %placeholder.conversation_id, ?reason, "message rejected");
                self.remove_placeholder(&placeholder);
                let error = ChatError::SendFailedPermanent(reason);
                self.view.error = Some(error.clone());
                Err(error)
            }
            Err(e) => {
                warn!(conversation = %placeholder.conversation_id, "send failed, queueing: {e}");
                self.queue_failed(&placeholder);
                let error = ChatError::SendFailedTransient(e.to_string());
                self.view.error = Some(error.clone());
                Err(error)
            }
        };
        self.publish();
        let _ = reply.send(outcome);
    }

    fn queue_failed(&mut self, placeholder: &Message) {
        self.store
            .add_outbox_message(placeholder.clone().with_status(DeliveryStatus::Failed));
        self.mark_failed(placeholder);
    }

    fn mark_failed(&mut self, placeholder: &Message) {
        for m in self
            .view
            .messages
            .iter_mut()
            .filter(|m| m.is_placeholder() && same_message(m, placeholder))
        {
            m.delivery_status = DeliveryStatus::Failed;
        }
    }

    fn remove_placeholder(&mut self, placeholder: &Message) {
        self.view
            .messages
            .retain(|m| !(m.is_placeholder() && same_message(m, placeholder)));
    }

    // ── Outbox ───────────────────────────────────────────────────────────

    fn flush_outbox(&self) {
        if !self.is_connected || !self.initialized || self.conversations.is_empty() {
            return;
        }

        let api = self.api.clone();
        let store = self.store.clone();
        let gate = self.flush_gate.clone();
        let ids = self.conversations.clone();
        let limit = self.config.request_timeout();
        let events = self.events_tx.clone();
        tokio::spawn(async move {
            for id in ids {
                flush_conversation(api.as_ref(), &store, &gate, &id, limit, |outcome| {
                    let _ = events.send(SyncEvent::Flush(outcome));
                })
                .await;
            }
        });
    }

    fn on_flush(&mut self, outcome: FlushOutcome) {
        match outcome {
            FlushOutcome::Delivered(message) => self.remove_placeholder(&message),
            FlushOutcome::Rejected(message, reason) => {
                self.remove_placeholder(&message);
                self.view.error = Some(ChatError::SendFailedPermanent(reason));
            }
            FlushOutcome::Failed(message, e) => {
                self.mark_failed(&message);
                self.view.error = Some(ChatError::SendFailedTransient(e.to_string()));
            }
        }
        self.publish();
    }

    // ── Manual corrections ───────────────────────────────────────────────

    fn append_message(&mut self, message: Message) {
        if self.view.messages.iter().any(|m| same_message(m, &message)) {
            return;
        }
        self.store
            .append_message(&message.conversation_id, message.clone());
        insert_sorted(&mut self.view.messages, message);
        self.publish();
    }

    /// Conversations whose cache holds `timestamp`: in single mode always the
    /// current one, in multi mode those of the matching displayed messages.
    fn affected(&self, timestamp: &str) -> BTreeSet<ConversationId> {
        match self.mode {
            Mode::Single => self.conversations.iter().cloned().collect(),
            Mode::Multi => self
                .view
                .messages
                .iter()
                .filter(|m| m.timestamp == timestamp)
                .map(|m| m.conversation_id.clone())
                .collect(),
        }
    }

    fn update_message(&mut self, timestamp: &str, patch: &MessagePatch) {
        for id in self.affected(timestamp) {
            self.store.update_message(&id, timestamp, patch);
        }
        for m in self.view.messages.iter_mut().filter(|m| m.timestamp == timestamp) {
            patch.apply(m);
        }
        self.publish();
    }

    fn remove_message(&mut self, timestamp: &str) {
        for id in self.affected(timestamp) {
            self.store.remove_message(&id, timestamp);
        }
        self.view.messages.retain(|m| m.timestamp != timestamp);
        self.publish();
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use clanchat_store::{MemoryKv, OutboxPatch, StoreConfig};

    use super::*;
    use crate::config::ConnectionConfig;
    use crate::connection::spawn_connection;
    use crate::credentials::StaticCredentials;
    use crate::testing::{FakeApi, FakeTransport};

    struct Harness {
        api: Arc<FakeApi>,
        transport: FakeTransport,
        credentials: Arc<StaticCredentials>,
        connection: ConnectionHandle,
        store: Arc<MessageStore>,
        gate: FlushGate,
    }

    impl Harness {
        fn new(online: bool) -> Self {
            let transport = FakeTransport::new();
            let credentials = Arc::new(StaticCredentials::new(online.then(|| "token".to_string())));
            let connection = spawn_connection(
                Arc::new(transport.clone()),
                credentials.clone(),
                ConnectionConfig::default(),
            );
            Self {
                api: Arc::new(FakeApi::new()),
                transport,
                credentials,
                connection,
                store: Arc::new(MessageStore::new(MemoryKv::new(), StoreConfig::default())),
                gate: FlushGate::new(),
            }
        }

        fn deps(&self) -> SyncDeps {
            SyncDeps {
                api: self.api.clone(),
                connection: self.connection.clone(),
                store: self.store.clone(),
                config: SyncConfig::default(),
                flush_gate: self.gate.clone(),
            }
        }

        fn chat(&self, id: &str) -> ChatSync {
            ChatSync::spawn(self.deps(), Some(ConversationId::from(id)))
        }
    }

    fn c(id: &str) -> ConversationId {
        ConversationId::from(id)
    }

    fn ts(second: u32) -> String {
        format!("2024-05-01T10:00:{second:02}.000Z")
    }

    fn msg(conv: &str, second: u32, sender: &str, content: &str) -> Message {
        Message::new(conv, ts(second), sender, content)
    }

    async fn ready(chat: &ChatSync) -> ChatView {
        chat.wait_for(|v| !v.is_loading && v.is_connected).await.unwrap()
    }

    #[tokio::test]
    async fn test_cached_then_fresh_page_replaces() {
        let h = Harness::new(false);
        let m1 = msg("c1", 1, "alice", "one");
        let m2 = msg("c1", 2, "bob", "two");
        h.store.set_messages(&c("c1"), &[m1.clone()]);
        h.api.set_history(&c("c1"), vec![m1.clone(), m2.clone()]);

        let chat = h.chat("c1");
        let first = chat.view();
        assert!(first.is_loading);
        assert_eq!(first.messages, vec![m1.clone()]);

        let view = chat.wait_for(|v| !v.is_loading).await.unwrap();
        assert_eq!(view.messages, vec![m1.clone(), m2.clone()]);
        assert!(!view.has_more);
        assert!(view.error.is_none());
        assert_eq!(h.store.get_messages(&c("c1")), vec![m1, m2]);
    }

    #[tokio::test]
    async fn test_fetch_failure_keeps_cache() {
        let h = Harness::new(false);
        let m1 = msg("c1", 1, "alice", "cached");
        h.store.set_messages(&c("c1"), &[m1.clone()]);
        h.api.fail_history(&c("c1"), ApiError::Network("offline".into()));

        let chat = h.chat("c1");
        let view = chat.wait_for(|v| !v.is_loading).await.unwrap();
        assert_eq!(view.messages, vec![m1]);
        assert!(matches!(view.error, Some(ChatError::LoadFailed(_))));
    }

    #[tokio::test]
    async fn test_full_page_sets_has_more() {
        let h = Harness::new(false);
        let history: Vec<Message> = (0..25).map(|i| msg("c1", i, "alice", "x")).collect();
        h.api.set_history(&c("c1"), history.clone());

        let chat = h.chat("c1");
        let view = chat.wait_for(|v| !v.is_loading).await.unwrap();
        assert_eq!(view.messages, history[5..].to_vec());
        assert!(view.has_more);

        chat.load_more().await.unwrap();
        let view = chat.view();
        assert_eq!(view.messages, history);
        assert!(!view.has_more);
        assert_eq!(h.api.history_requests()[1], (c("c1"), Some(ts(5))));
        assert_eq!(h.store.get_messages(&c("c1")).len(), 25);
    }

    #[tokio::test]
    async fn test_load_more_noop_when_empty() {
        let h = Harness::new(false);
        let chat = h.chat("c1");
        chat.wait_for(|v| !v.is_loading).await.unwrap();
        chat.load_more().await.unwrap();
        assert_eq!(h.api.history_requests().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_conversation_change_discards_stale_fetch() {
        let h = Harness::new(false);
        h.api.set_history(&c("c1"), vec![msg("c1", 1, "alice", "stale")]);
        h.api.delay_history(&c("c1"), Duration::from_secs(5));
        h.api.set_history(&c("c2"), vec![msg("c2", 1, "bob", "fresh")]);

        let chat = h.chat("c1");
        chat.set_conversation(Some(c("c2"))).unwrap();
        let view = chat
            .wait_for(|v| !v.is_loading && !v.messages.is_empty())
            .await
            .unwrap();
        assert_eq!(view.messages[0].content, "fresh");

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(chat.view().messages, view.messages);
        assert!(h.store.get_messages(&c("c1")).is_empty());
    }

    #[tokio::test]
    async fn test_offline_send_then_flush_on_connect() {
        let h = Harness::new(false);
        let chat = h.chat("c1");
        chat.wait_for(|v| !v.is_loading).await.unwrap();

        chat.send_message("  hi  ", Some("me")).await.unwrap();
        let view = chat.view();
        assert_eq!(view.messages.len(), 1);
        let placeholder = view.messages[0].clone();
        assert_eq!(placeholder.content, "hi");
        assert_eq!(placeholder.delivery_status, DeliveryStatus::Failed);
        assert_eq!(h.store.get_outbox_messages(Some(&c("c1"))).len(), 1);

        h.credentials.set(Some("token".into()));
        h.connection.connect();
        chat.wait_for(|v| v.is_connected && v.messages.is_empty())
            .await
            .unwrap();
        assert!(h.store.get_outbox_messages(None).is_empty());
        assert_eq!(h.api.send_attempts(), vec![(c("c1"), "hi".to_string())]);

        h.connection.active_subscriptions().await;
        let echo = Message::new("c1", placeholder.timestamp.clone(), "me", "hi").with_id("srv-1");
        assert_eq!(h.transport.deliver_message(&echo), 1);
        let view = chat.wait_for(|v| v.messages.len() == 1).await.unwrap();
        assert_eq!(view.messages[0], echo);
    }

    #[tokio::test]
    async fn test_online_send_removes_placeholder() {
        let h = Harness::new(true);
        let chat = h.chat("c1");
        ready(&chat).await;

        chat.send_message("hello", None).await.unwrap();
        assert!(chat.view().messages.is_empty());
        assert_eq!(h.api.sent_contents(), ["hello"]);
        assert!(h.store.get_outbox_messages(None).is_empty());
    }

    #[tokio::test]
    async fn test_banned_send_leaves_nothing_behind() {
        let h = Harness::new(true);
        h.api
            .push_send_result(Err(ApiError::Moderation(ModerationReason::Banned)));
        let chat = h.chat("c1");
        ready(&chat).await;

        let err = chat.send_message("hi", None).await.unwrap_err();
        assert_eq!(err, ChatError::SendFailedPermanent(ModerationReason::Banned));
        assert_eq!(err.to_string(), "You are banned");

        let view = chat.view();
        assert!(view.messages.is_empty());
        assert_eq!(view.error, Some(err));
        assert!(h.store.get_outbox_messages(None).is_empty());
    }

    #[tokio::test]
    async fn test_transient_send_failure_queues() {
        let h = Harness::new(true);
        h.api.push_send_result(Err(ApiError::Server("503".into())));
        let chat = h.chat("c1");
        ready(&chat).await;

        let err = chat.send_message("hi", Some("me")).await.unwrap_err();
        assert!(matches!(err, ChatError::SendFailedTransient(_)));
        let view = chat.view();
        assert_eq!(view.messages.len(), 1);
        assert_eq!(view.messages[0].delivery_status, DeliveryStatus::Failed);
        assert_eq!(view.messages[0].sender_id, "me");
        assert_eq!(h.store.get_outbox_messages(Some(&c("c1"))).len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_timeout_is_transient() {
        let h = Harness::new(true);
        let chat = h.chat("c1");
        ready(&chat).await;
        h.api.set_send_delay(Some(Duration::from_secs(120)));

        let err = chat.send_message("slow", None).await.unwrap_err();
        assert_eq!(err, ChatError::SendFailedTransient(ApiError::Timeout.to_string()));
        assert_eq!(chat.view().messages[0].delivery_status, DeliveryStatus::Failed);
        assert_eq!(h.store.get_outbox_messages(None).len(), 1);
    }

    #[tokio::test]
    async fn test_blank_send_is_noop() {
        let h = Harness::new(true);
        let chat = h.chat("c1");
        ready(&chat).await;
        chat.send_message("   ", None).await.unwrap();
        assert!(chat.view().messages.is_empty());
        assert!(h.api.send_attempts().is_empty());
    }

    #[tokio::test]
    async fn test_flush_stops_at_first_failure() {
        let h = Harness::new(true);
        for (second, text) in [(3, "three"), (1, "one"), (2, "two")] {
            h.store
                .add_outbox_message(msg("c1", second, "me", text).with_status(DeliveryStatus::Failed));
        }
        h.api.push_send_result(Err(ApiError::Network("flaky".into())));

        let chat = h.chat("c1");
        let view = chat
            .wait_for(|v| matches!(v.error, Some(ChatError::SendFailedTransient(_))))
            .await
            .unwrap();

        assert_eq!(h.api.sent_contents(), ["one"]);
        let outbox = h.store.get_outbox_messages(Some(&c("c1")));
        assert_eq!(outbox.len(), 3);
        assert_eq!(outbox[0].retry_count, 1);
        assert_eq!(outbox[1].retry_count, 0);
        assert_eq!(outbox[2].retry_count, 0);
        // Queued messages show as failed placeholders.
        assert_eq!(view.messages.len(), 3);
        assert!(view.messages.iter().all(|m| m.delivery_status == DeliveryStatus::Failed));

        // retry() clears the error and flushes again, in order.
        chat.retry().unwrap();
        let view = chat.wait_for(|v| v.messages.is_empty()).await.unwrap();
        assert!(view.error.is_none());
        assert_eq!(h.api.sent_contents(), ["one", "one", "two", "three"]);
        assert!(h.store.get_outbox_messages(None).is_empty());
    }

    #[tokio::test]
    async fn test_live_duplicates_ignored() {
        let h = Harness::new(true);
        let chat = h.chat("c1");
        ready(&chat).await;
        h.connection.active_subscriptions().await;

        let m1 = msg("c1", 5, "bob", "yo");
        let m2 = msg("c1", 6, "bob", "again");
        h.transport.deliver_message(&m1);
        h.transport.deliver_message(&m1);
        h.transport.deliver_message(&m2);

        let view = chat.wait_for(|v| v.messages.len() >= 2).await.unwrap();
        assert_eq!(view.messages, vec![m1.clone(), m2.clone()]);
        assert_eq!(h.store.get_messages(&c("c1")), vec![m1, m2]);
    }

    #[tokio::test]
    async fn test_live_echo_replaces_failed_placeholder() {
        let h = Harness::new(true);
        h.api.push_send_result(Err(ApiError::Network("reset".into())));
        let chat = h.chat("c1");
        ready(&chat).await;
        h.connection.active_subscriptions().await;

        let _ = chat.send_message("hi", Some("me")).await;
        let placeholder = chat.view().messages[0].clone();
        assert!(placeholder.is_placeholder());

        let echo = Message::new("c1", placeholder.timestamp.clone(), "me", "hi").with_id("srv-9");
        h.transport.deliver_message(&echo);
        let view = chat
            .wait_for(|v| v.messages.iter().all(|m| !m.is_placeholder()))
            .await
            .unwrap();
        assert_eq!(view.messages, vec![echo]);
        assert!(h.store.get_outbox_messages(None).is_empty());
    }

    #[tokio::test]
    async fn test_disconnect_is_reported_and_cleared() {
        let h = Harness::new(true);
        let chat = h.chat("c1");
        ready(&chat).await;

        h.connection.disconnect();
        let view = chat.wait_for(|v| !v.is_connected).await.unwrap();
        assert_eq!(view.error, Some(ChatError::NetworkDisconnected));

        h.connection.connect();
        let view = chat.wait_for(|v| v.is_connected).await.unwrap();
        assert!(view.error.is_none());
    }

    #[tokio::test]
    async fn test_manual_corrections_hit_view_and_cache() {
        let h = Harness::new(false);
        let chat = h.chat("c1");
        chat.wait_for(|v| !v.is_loading).await.unwrap();

        let m = msg("c1", 1, "alice", "draft");
        chat.append_message(m.clone()).unwrap();
        chat.append_message(m.clone()).unwrap();
        chat.update_message(&m.timestamp, MessagePatch::content("edited"))
            .unwrap();
        let view = chat
            .wait_for(|v| v.messages.first().is_some_and(|m| m.content == "edited"))
            .await
            .unwrap();
        assert_eq!(view.messages.len(), 1);
        assert_eq!(h.store.get_messages(&c("c1"))[0].content, "edited");

        chat.remove_message(&m.timestamp).unwrap();
        chat.wait_for(|v| v.messages.is_empty()).await.unwrap();
        assert!(h.store.get_messages(&c("c1")).is_empty());
    }

    #[tokio::test]
    async fn test_multi_merges_and_rejects_send() {
        let h = Harness::new(true);
        let a = msg("c1", 1, "alice", "a");
        let b = msg("c2", 2, "bob", "b");
        let d = msg("c1", 3, "alice", "d");
        h.api.set_history(&c("c1"), vec![a.clone(), d.clone()]);
        h.api.set_history(&c("c2"), vec![b.clone()]);

        let chat = ChatSync::spawn_multi(h.deps(), vec![c("c1"), c("c2")]);
        let view = ready(&chat).await;
        assert_eq!(view.messages, vec![a, b, d]);
        assert!(!view.has_more);

        assert_eq!(chat.send_message("hi", None).await, Err(ChatError::SendUnsupported));
        assert_eq!(
            h.connection.active_subscriptions().await,
            vec![c("c1"), c("c2")]
        );
    }

    #[tokio::test]
    async fn test_multi_dedup_is_per_conversation() {
        let h = Harness::new(true);
        let chat = ChatSync::spawn_multi(h.deps(), vec![c("c1"), c("c2")]);
        ready(&chat).await;
        h.connection.active_subscriptions().await;

        // Same timestamp and sender in two conversations: both kept.
        h.transport.deliver_message(&msg("c1", 1, "bob", "left"));
        h.transport.deliver_message(&msg("c2", 1, "bob", "right"));
        h.transport.deliver_message(&msg("c2", 1, "bob", "right"));
        h.transport.deliver_message(&msg("c1", 2, "bob", "done"));

        let view = chat.wait_for(|v| v.messages.len() >= 3).await.unwrap();
        assert_eq!(view.messages.len(), 3);
    }

    #[tokio::test]
    async fn test_multi_reconciles_subscriptions() {
        let h = Harness::new(true);
        let chat = ChatSync::spawn_multi(h.deps(), vec![c("c1"), c("c2")]);
        ready(&chat).await;
        assert_eq!(
            h.connection.active_subscriptions().await,
            vec![c("c1"), c("c2")]
        );

        h.api.set_history(&c("c3"), vec![msg("c3", 1, "carol", "hey")]);
        chat.set_conversations(vec![c("c2"), c("c3")]).unwrap();
        chat.wait_for(|v| !v.is_loading && !v.messages.is_empty())
            .await
            .unwrap();

        assert_eq!(
            h.connection.active_subscriptions().await,
            vec![c("c2"), c("c3")]
        );
        let c2_subscribes = h
            .transport
            .subscribe_calls()
            .iter()
            .filter(|t| t.as_str() == "/topic/chat/c2")
            .count();
        assert_eq!(c2_subscribes, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_live_message_during_reload_survives_page() {
        let h = Harness::new(true);
        let a = msg("c1", 1, "alice", "a");
        h.api.set_history(&c("c1"), vec![a.clone()]);
        let chat = ChatSync::spawn_multi(h.deps(), vec![c("c1"), c("c2")]);
        ready(&chat).await;
        h.connection.active_subscriptions().await;

        // c1 keeps its live feed across the switch; its new fetch is slow.
        h.api.delay_history(&c("c1"), Duration::from_secs(5));
        chat.set_conversations(vec![c("c1"), c("c3")]).unwrap();
        chat.wait_for(|v| v.is_loading).await.unwrap();

        let live = msg("c1", 9, "bob", "while loading");
        assert_eq!(h.transport.deliver_message(&live), 1);
        chat.wait_for(|v| v.messages.contains(&live)).await.unwrap();

        let view = chat.wait_for(|v| !v.is_loading).await.unwrap();
        assert_eq!(view.messages, vec![a.clone(), live.clone()]);
        assert_eq!(h.store.get_messages(&c("c1")), vec![a, live]);
    }

    #[tokio::test]
    async fn test_exhausted_outbox_entry_not_shown() {
        let h = Harness::new(false);
        let spent = msg("c1", 1, "me", "spent").with_status(DeliveryStatus::Failed);
        let fresh = msg("c1", 2, "me", "fresh").with_status(DeliveryStatus::Failed);
        let spent_id = h.store.add_outbox_message(spent).unwrap();
        h.store.add_outbox_message(fresh).unwrap();
        h.store.update_outbox_message(
            &spent_id,
            &OutboxPatch {
                retry_count: Some(StoreConfig::default().max_outbox_retries),
                ..Default::default()
            },
        );

        let chat = h.chat("c1");
        let view = chat.wait_for(|v| !v.is_loading).await.unwrap();
        let contents: Vec<&str> = view.messages.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, ["fresh"]);
        // Still in the store until maintenance prunes it.
        assert_eq!(h.store.get_outbox_messages(None).len(), 2);
    }

    #[tokio::test]
    async fn test_dropping_controller_unsubscribes() {
        let h = Harness::new(true);
        let chat = h.chat("c1");
        ready(&chat).await;
        assert_eq!(h.connection.active_subscriptions().await, vec![c("c1")]);

        drop(chat);
        // The actor notices on its next poll.
        let mut remaining = vec![c("c1")];
        for _ in 0..20 {
            remaining = h.connection.active_subscriptions().await;
            if remaining.is_empty() {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert!(remaining.is_empty());
    }
}
