//! Shared live connection with per-conversation subscriptions.
//!
//! One [`ConnectionActor`] owns the physical session, the subscription
//! registry, and the reconnect timer. Every chat view in the process talks to
//! it through a cloneable [`ConnectionHandle`].
//!
//! ```text
//!   ConnectionHandle (Clone)     mpsc      ConnectionActor (tokio task)
//!   ┌──────────────────────┐  ────────▶  ┌───────────────────────────────┐
//!   │ .connect()           │             │ session + event stream        │
//!   │ .subscribe_to_chat() │             │ conversation → handler        │
//!   │ .set_app_state()     │             │ exponential reconnect timer   │
//!   └──────────────────────┘             └───────────────────────────────┘
//!              │ state / listeners (Arc<Mutex<Shared>>)     ▲
//!              └────────────────────────────────────────────┘
//! ```
//!
//! State transitions:
//!
//! ```text
//!   disconnected ──connect()──▶ connecting ──ok──▶ connected
//!        ▲                          │                  │
//!        └──────── failure ─────────┘◀── loss/close ───┘
//!                  (schedules reconnect with backoff)
//! ```

use std::collections::{BTreeSet, HashMap};
use std::future::pending;
use std::sync::{Arc, Weak};

use clanchat_types::{ConversationId, DeliveryStatus, Message};
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, sleep_until, timeout};
use tracing::{debug, error, info, trace, warn};

use crate::config::ConnectionConfig;
use crate::credentials::CredentialSource;
use crate::transport::{
    EventStream, Transport, TransportError, TransportEvent, TransportSession,
    conversation_for_topic, topic_for,
};

/// Lifecycle of the live connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
        }
    }

    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Host application lifecycle, as reported by the platform.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum AppLifecycle {
    /// Foreground and interactive.
    Active,
    /// Visible but not interactive (app switcher, incoming call).
    Inactive,
    Background,
}

/// Receives every message on one conversation's topic.
pub type MessageHandler = Arc<dyn Fn(Message) + Send + Sync>;

/// Receives connection state changes.
pub type ConnectionHandler = Arc<dyn Fn(ConnectionState) + Send + Sync>;

/// State readable without a round trip through the actor.
struct Shared {
    state: ConnectionState,
    reconnect_attempts: u32,
    listeners: HashMap<u64, ConnectionHandler>,
    next_id: u64,
}

impl Shared {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }
}

enum Command {
    Connect,
    Disconnect,
    Lifecycle(AppLifecycle),
    Subscribe {
        conversation_id: ConversationId,
        token: u64,
        handler: MessageHandler,
    },
    Unsubscribe {
        conversation_id: ConversationId,
        token: u64,
    },
    ActiveSubscriptions {
        reply: oneshot::Sender<Vec<ConversationId>>,
    },
}

// ============================================================================
// ConnectionHandle
// ============================================================================

/// Cloneable handle to the process-wide connection actor.
///
/// Commands are queued and applied in order. The actor exits once every
/// handle and [`Subscription`] is gone.
#[derive(Clone)]
pub struct ConnectionHandle {
    tx: mpsc::UnboundedSender<Command>,
    shared: Arc<Mutex<Shared>>,
}

impl ConnectionHandle {
    /// Open the live connection unless already connected. Without a
    /// credential this logs and gives up until called again.
    pub fn connect(&self) {
        self.send(Command::Connect);
    }

    /// Close the connection and cancel any pending reconnect. Registered
    /// handlers are kept for the next `connect()`.
    pub fn disconnect(&self) {
        self.send(Command::Disconnect);
    }

    /// Foreground connects when not connected; inactive and background
    /// disconnect.
    pub fn set_app_state(&self, lifecycle: AppLifecycle) {
        self.send(Command::Lifecycle(lifecycle));
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.lock().state
    }

    pub fn is_connected(&self) -> bool {
        self.state().is_connected()
    }

    /// Consecutive failed connects since the last success.
    pub fn reconnect_attempts(&self) -> u32 {
        self.shared.lock().reconnect_attempts
    }

    /// Conversations with a live subscription on the current session,
    /// answered after every previously queued command has been applied.
    pub async fn active_subscriptions(&self) -> Vec<ConversationId> {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(Command::ActiveSubscriptions { reply }).is_err() {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    /// Register the handler for a conversation, replacing any earlier one.
    ///
    /// The live subscription is made now if connected, otherwise on the next
    /// successful connect. Dropping the returned guard unregisters it.
    pub fn subscribe_to_chat<F>(&self, conversation_id: &ConversationId, handler: F) -> Subscription
    where
        F: Fn(Message) + Send + Sync + 'static,
    {
        if conversation_id.is_empty() {
            warn!("cannot subscribe to an empty conversation id");
            return Subscription { inner: None };
        }

        let token = self.shared.lock().next_id();
        self.send(Command::Subscribe {
            conversation_id: conversation_id.clone(),
            token,
            handler: Arc::new(handler),
        });
        Subscription {
            inner: Some(SubscriptionInner {
                conversation_id: conversation_id.clone(),
                token,
                tx: self.tx.clone(),
            }),
        }
    }

    /// Register a state listener. It is called with the current state before
    /// this returns, then on every change.
    ///
    /// Listeners run under the registry lock: they must be quick and must
    /// not call back into the handle.
    pub fn add_connection_handler<F>(&self, handler: F) -> ListenerGuard
    where
        F: Fn(ConnectionState) + Send + Sync + 'static,
    {
        let handler: ConnectionHandler = Arc::new(handler);
        let mut shared = self.shared.lock();
        let id = shared.next_id();
        shared.listeners.insert(id, handler.clone());
        handler(shared.state);
        ListenerGuard {
            id,
            shared: Arc::downgrade(&self.shared),
        }
    }

    fn send(&self, command: Command) {
        if self.tx.send(command).is_err() {
            debug!("connection actor is gone, command dropped");
        }
    }
}

/// Keeps a chat handler registered. Dropping it unsubscribes.
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription {
    inner: Option<SubscriptionInner>,
}

struct SubscriptionInner {
    conversation_id: ConversationId,
    token: u64,
    tx: mpsc::UnboundedSender<Command>,
}

impl Subscription {
    pub fn conversation_id(&self) -> Option<&ConversationId> {
        self.inner.as_ref().map(|i| &i.conversation_id)
    }

    pub fn unsubscribe(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if let Some(inner) = self.inner.take() {
            // A newer handler for the same conversation carries a different
            // token, so the actor ignores this.
            let _ = inner.tx.send(Command::Unsubscribe {
                conversation_id: inner.conversation_id,
                token: inner.token,
            });
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.release();
    }
}

/// Keeps a connection listener registered. Dropping it removes the listener.
#[must_use = "dropping a ListenerGuard removes the listener immediately"]
pub struct ListenerGuard {
    id: u64,
    shared: Weak<Mutex<Shared>>,
}

impl Drop for ListenerGuard {
    fn drop(&mut self) {
        if let Some(shared) = self.shared.upgrade() {
            shared.lock().listeners.remove(&self.id);
        }
    }
}

// ============================================================================
// ConnectionActor
// ============================================================================

struct ConnectionActor {
    transport: Arc<dyn Transport>,
    credentials: Arc<dyn CredentialSource>,
    config: ConnectionConfig,
    shared: Arc<Mutex<Shared>>,
    /// Present exactly while connected.
    session: Option<Box<dyn TransportSession>>,
    events: Option<EventStream>,
    /// Registered handlers, kept across disconnects.
    handlers: HashMap<ConversationId, (u64, MessageHandler)>,
    /// Topics subscribed on the current session.
    live: BTreeSet<ConversationId>,
    reconnect_at: Option<Instant>,
}

impl ConnectionActor {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Command>) {
        loop {
            tokio::select! {
                command = rx.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => break,
                },
                event = next_event(&mut self.events) => self.handle_event(event).await,
                _ = reconnect_timer(self.reconnect_at) => {
                    self.reconnect_at = None;
                    self.connect().await;
                }
            }
        }
        self.disconnect().await;
        debug!("connection actor shutting down: all handles dropped");
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Connect => self.connect().await,
            Command::Disconnect => self.disconnect().await,
            Command::Lifecycle(lifecycle) => {
                debug!(?lifecycle, "app lifecycle changed");
                match lifecycle {
                    AppLifecycle::Active => {
                        if self.session.is_none() {
                            self.connect().await;
                        }
                    }
                    AppLifecycle::Inactive | AppLifecycle::Background => self.disconnect().await,
                }
            }
            Command::Subscribe {
                conversation_id,
                token,
                handler,
            } => {
                self.handlers.insert(conversation_id.clone(), (token, handler));
                if self.session.is_some() {
                    self.perform_subscription(&conversation_id).await;
                }
            }
            Command::Unsubscribe {
                conversation_id,
                token,
            } => self.unsubscribe(conversation_id, token).await,
            Command::ActiveSubscriptions { reply } => {
                let _ = reply.send(self.live.iter().cloned().collect());
            }
        }
    }

    async fn handle_event(&mut self, event: Option<TransportEvent>) {
        match event {
            Some(TransportEvent::Frame { topic, payload }) => self.dispatch(&topic, &payload),
            Some(TransportEvent::Closed { reason }) => self.connection_lost(&reason).await,
            Some(TransportEvent::Error(e)) => self.connection_lost(&e).await,
            None => self.connection_lost("event stream ended").await,
        }
    }

    async fn connect(&mut self) {
        if self.session.is_some() {
            return;
        }
        self.reconnect_at = None;

        let Some(token) = self.credentials.access_token().await else {
            warn!("no access token available for live connection");
            return;
        };

        self.set_state(ConnectionState::Connecting);
        let error = match timeout(self.config.connect_timeout(), self.transport.open(&token)).await {
            Ok(Ok((session, events))) => {
                self.session = Some(session);
                self.events = Some(events);
                self.shared.lock().reconnect_attempts = 0;
                info!("live connection established");
                self.set_state(ConnectionState::Connected);
                self.resubscribe_all().await;
                return;
            }
            Ok(Err(e)) => e,
            Err(_) => TransportError::Timeout,
        };

        warn!(error = %error, "live connection failed");
        self.set_state(ConnectionState::Disconnected);
        self.schedule_reconnect();
    }

    async fn disconnect(&mut self) {
        self.reconnect_at = None;
        self.events = None;
        if let Some(session) = self.session.take() {
            session.close().await;
            info!("live connection closed");
        }
        self.live.clear();
        self.set_state(ConnectionState::Disconnected);
    }

    async fn connection_lost(&mut self, reason: &str) {
        warn!(reason, "live connection lost");
        self.events = None;
        if let Some(session) = self.session.take() {
            session.close().await;
        }
        self.live.clear();
        self.set_state(ConnectionState::Disconnected);
        self.schedule_reconnect();
    }

    fn schedule_reconnect(&mut self) {
        let attempt = {
            let mut shared = self.shared.lock();
            if shared.reconnect_attempts >= self.config.max_reconnect_attempts {
                error!(
                    attempts = shared.reconnect_attempts,
                    "max reconnection attempts reached"
                );
                return;
            }
            shared.reconnect_attempts += 1;
            shared.reconnect_attempts
        };

        let delay = self.config.backoff_delay(attempt);
        info!(attempt, delay_ms = delay.as_millis() as u64, "scheduling reconnect");
        self.reconnect_at = Instant::now().checked_add(delay);
    }

    /// Make exactly one live subscription per registered conversation.
    async fn resubscribe_all(&mut self) {
        let conversations: Vec<ConversationId> = self.handlers.keys().cloned().collect();
        for conversation_id in conversations {
            self.perform_subscription(&conversation_id).await;
        }
    }

    async fn perform_subscription(&mut self, conversation_id: &ConversationId) {
        let Some(session) = &self.session else {
            return;
        };
        let topic = topic_for(conversation_id);

        if self.live.remove(conversation_id) {
            if let Err(e) = session.unsubscribe(&topic).await {
                debug!(topic = %topic, "unsubscribe before resubscribe failed: {e}");
            }
        }
        match session.subscribe(&topic).await {
            Ok(()) => {
                self.live.insert(conversation_id.clone());
                debug!(conversation = %conversation_id, "subscribed");
            }
            Err(e) => warn!(conversation = %conversation_id, "subscribe failed: {e}"),
        }
    }

    async fn unsubscribe(&mut self, conversation_id: ConversationId, token: u64) {
        match self.handlers.get(&conversation_id) {
            Some((current, _)) if *current == token => {}
            _ => {
                trace!(conversation = %conversation_id, "ignoring unsubscribe for replaced handler");
                return;
            }
        }
        self.handlers.remove(&conversation_id);

        if self.live.remove(&conversation_id) {
            if let Some(session) = &self.session {
                if let Err(e) = session.unsubscribe(&topic_for(&conversation_id)).await {
                    warn!(conversation = %conversation_id, "unsubscribe failed: {e}");
                }
            }
        }
        debug!(conversation = %conversation_id, "unsubscribed");
    }

    fn dispatch(&self, topic: &str, payload: &str) {
        let Some(conversation_id) = conversation_for_topic(topic) else {
            trace!(topic, "frame on unknown topic");
            return;
        };
        if !self.live.contains(&conversation_id) {
            trace!(topic, "frame for unsubscribed conversation");
            return;
        }
        let Some((_, handler)) = self.handlers.get(&conversation_id) else {
            return;
        };

        match serde_json::from_str::<Message>(payload) {
            Ok(mut message) => {
                // Anything on the live feed is authoritative.
                message.delivery_status = DeliveryStatus::Sent;
                trace!(conversation = %conversation_id, ts = %message.timestamp, "dispatching frame");
                handler(message);
            }
            Err(e) => warn!(topic, "dropping malformed frame: {e}"),
        }
    }

    fn set_state(&self, state: ConnectionState) {
        let mut shared = self.shared.lock();
        if shared.state == state {
            return;
        }
        shared.state = state;
        info!(%state, "connection state changed");
        for listener in shared.listeners.values() {
            listener(state);
        }
    }
}

async fn next_event(events: &mut Option<EventStream>) -> Option<TransportEvent> {
    match events {
        Some(rx) => rx.recv().await,
        None => pending().await,
    }
}

async fn reconnect_timer(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => pending().await,
    }
}

/// Spawn the connection actor on the current tokio runtime.
pub fn spawn_connection(
    transport: Arc<dyn Transport>,
    credentials: Arc<dyn CredentialSource>,
    config: ConnectionConfig,
) -> ConnectionHandle {
    let (tx, rx) = mpsc::unbounded_channel();
    let shared = Arc::new(Mutex::new(Shared {
        state: ConnectionState::Disconnected,
        reconnect_attempts: 0,
        listeners: HashMap::new(),
        next_id: 0,
    }));
    let actor = ConnectionActor {
        transport,
        credentials,
        config,
        shared: shared.clone(),
        session: None,
        events: None,
        handlers: HashMap::new(),
        live: BTreeSet::new(),
        reconnect_at: None,
    };
    tokio::spawn(actor.run(rx));
    ConnectionHandle { tx, shared }
}
