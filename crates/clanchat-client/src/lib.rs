//! Realtime chat sync engine.
//!
//! Keeps a local view of one or more conversations consistent across three
//! sources: the on-device [`MessageStore`](clanchat_store::MessageStore), a
//! paginated history API, and a shared live push connection.
//!
//! # Architecture
//!
//! ```text
//! ChatClient
//!  ├─ ConnectionHandle ──▶ connection actor ──▶ Transport (one session)
//!  ├─ MessageStore (cache + outbox)
//!  └─ ChatSync × N ──▶ sync actor per view ──▶ ChatApi
//! ```
//!
//! Every actor is a tokio task behind a cloneable handle; handles send
//! commands over an mpsc channel and await replies on oneshots. Views are
//! published on a `watch` channel.
//!
//! # Example
//!
//! ```ignore
//! let client = ChatClient::open(&config, api, transport, credentials)?;
//! let chat = client.chat(Some("room-1".into()));
//! chat.send_message("hello", None).await?;
//! let view = chat.view();
//! ```

pub mod api;
pub mod client;
pub mod config;
pub mod connection;
pub mod constants;
pub mod credentials;
pub mod flush;
pub mod maintenance;
pub mod sync;
pub mod transport;

#[cfg(any(test, feature = "test-mock"))]
pub mod testing;

pub use api::{ApiError, ChatApi, ModerationReason};
pub use client::ChatClient;
pub use config::{ClientConfig, ConfigError, ConnectionConfig, SyncConfig};
pub use connection::{
    AppLifecycle, ConnectionHandle, ConnectionState, ListenerGuard, Subscription, spawn_connection,
};
pub use credentials::{CredentialSource, StaticCredentials};
pub use flush::FlushGate;
pub use maintenance::{MaintenanceHandle, spawn_maintenance};
pub use sync::{ChatError, ChatSync, ChatView, SyncDeps};
pub use transport::{EventStream, Transport, TransportError, TransportEvent, TransportSession};
