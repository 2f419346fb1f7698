//! Process-wide client: one connection, one store, many chat views.

use std::sync::Arc;

use clanchat_store::{KvStore, MessageStore, SqliteKv, StoreError};
use clanchat_types::{ConversationId, shard_for};
use tracing::info;

use crate::api::ChatApi;
use crate::config::ClientConfig;
use crate::connection::{AppLifecycle, ConnectionHandle, spawn_connection};
use crate::credentials::CredentialSource;
use crate::flush::FlushGate;
use crate::maintenance::{MaintenanceHandle, spawn_maintenance};
use crate::sync::{ChatSync, SyncDeps};
use crate::transport::Transport;

/// Owns the shared connection, the message store, and store maintenance.
/// Chat views created from it share all three.
///
/// Must be created inside a tokio runtime.
pub struct ChatClient {
    deps: SyncDeps,
    _maintenance: MaintenanceHandle,
}

impl ChatClient {
    /// Open the SQLite store at the configured path and start the client.
    pub fn open(
        config: &ClientConfig,
        api: Arc<dyn ChatApi>,
        transport: Arc<dyn Transport>,
        credentials: Arc<dyn CredentialSource>,
    ) -> Result<Self, StoreError> {
        let path = config.database_path();
        let kv = SqliteKv::open(&path)?;
        info!(path = %path.display(), "opened message store");
        Ok(Self::with_store(config, kv, api, transport, credentials))
    }

    /// Start the client over any key-value backend.
    pub fn with_store(
        config: &ClientConfig,
        kv: impl KvStore + 'static,
        api: Arc<dyn ChatApi>,
        transport: Arc<dyn Transport>,
        credentials: Arc<dyn CredentialSource>,
    ) -> Self {
        let store = Arc::new(MessageStore::new(kv, config.store.clone()));
        let connection = spawn_connection(transport, credentials, config.connection.clone());
        let maintenance = spawn_maintenance(store.clone(), config.maintenance_interval());
        Self {
            deps: SyncDeps {
                api,
                connection,
                store,
                config: config.sync.clone(),
                flush_gate: FlushGate::new(),
            },
            _maintenance: maintenance,
        }
    }

    pub fn connection(&self) -> &ConnectionHandle {
        &self.deps.connection
    }

    pub fn store(&self) -> &Arc<MessageStore> {
        &self.deps.store
    }

    /// View of one conversation.
    pub fn chat(&self, conversation_id: Option<ConversationId>) -> ChatSync {
        ChatSync::spawn(self.deps.clone(), conversation_id)
    }

    /// Merged view of several conversations.
    pub fn multi_chat(&self, conversation_ids: Vec<ConversationId>) -> ChatSync {
        ChatSync::spawn_multi(self.deps.clone(), conversation_ids)
    }

    /// View of the user's global shard.
    pub fn global_chat(&self, user_id: Option<&str>) -> ChatSync {
        self.chat(Some(shard_for(user_id)))
    }

    /// Forward a host lifecycle transition to the connection.
    pub fn set_app_state(&self, lifecycle: AppLifecycle) {
        self.deps.connection.set_app_state(lifecycle);
    }
}

#[cfg(test)]
mod tests {
    use clanchat_store::MemoryKv;
    use clanchat_types::Message;

    use super::*;
    use crate::credentials::StaticCredentials;
    use crate::testing::{FakeApi, FakeTransport};

    fn client(transport: &FakeTransport, api: Arc<FakeApi>) -> ChatClient {
        ChatClient::with_store(
            &ClientConfig::default(),
            MemoryKv::new(),
            api,
            Arc::new(transport.clone()),
            Arc::new(StaticCredentials::new(Some("token".into()))),
        )
    }

    #[tokio::test]
    async fn test_global_chat_uses_shard() {
        let transport = FakeTransport::new();
        let api = Arc::new(FakeApi::new());
        let shard = shard_for(Some("user-42"));
        api.set_history(&shard, vec![Message::new(shard.clone(), "2024-01-01T00:00:00.000Z", "bob", "hi")]);

        let client = client(&transport, api);
        let chat = client.global_chat(Some("user-42"));
        let view = chat
            .wait_for(|v| !v.is_loading && v.is_connected)
            .await
            .unwrap();
        assert_eq!(view.messages.len(), 1);
        assert_eq!(client.connection().active_subscriptions().await, vec![shard]);
    }

    #[tokio::test]
    async fn test_views_share_one_connection() {
        let transport = FakeTransport::new();
        let client = client(&transport, Arc::new(FakeApi::new()));
        let a = client.chat(Some("c1".into()));
        let b = client.multi_chat(vec!["c2".into(), "c3".into()]);
        a.wait_for(|v| v.is_connected).await.unwrap();
        b.wait_for(|v| v.is_connected && !v.is_loading).await.unwrap();
        a.wait_for(|v| !v.is_loading).await.unwrap();

        assert_eq!(transport.open_count(), 1);
        assert_eq!(
            client.connection().active_subscriptions().await,
            vec![ConversationId::from("c1"), "c2".into(), "c3".into()]
        );

        client.set_app_state(AppLifecycle::Background);
        a.wait_for(|v| !v.is_connected).await.unwrap();
        assert!(!transport.is_open());
    }

    #[tokio::test]
    async fn test_open_creates_sqlite_store() {
        let dir = tempfile::tempdir().unwrap();
        let config = ClientConfig {
            database_path: Some(dir.path().join("nested").join("messages.db")),
            ..ClientConfig::default()
        };
        let client = ChatClient::open(
            &config,
            Arc::new(FakeApi::new()),
            Arc::new(FakeTransport::new()),
            Arc::new(StaticCredentials::new(None)),
        )
        .unwrap();
        client.store().set_messages(&"c1".into(), &[Message::new("c1", "2024-01-01T00:00:00.000Z", "a", "x")]);
        assert_eq!(client.store().storage_info().cache_entries, 1);
        assert!(dir.path().join("nested").join("messages.db").exists());
    }
}
