//! Periodic store housekeeping.

use std::sync::Arc;
use std::time::Duration;

use clanchat_store::MessageStore;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Running maintenance task. Dropping the handle stops it.
pub struct MaintenanceHandle {
    task: JoinHandle<()>,
}

impl Drop for MaintenanceHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

const MIN_INTERVAL: Duration = Duration::from_secs(1);

/// Prune expired cache entries and exhausted outbox entries every `interval`,
/// starting immediately. Intervals under a second are raised to one.
pub fn spawn_maintenance(store: Arc<MessageStore>, interval: Duration) -> MaintenanceHandle {
    let interval = if interval < MIN_INTERVAL {
        warn!(?interval, "maintenance interval too short, using {MIN_INTERVAL:?}");
        MIN_INTERVAL
    } else {
        interval
    };
    let task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let store = store.clone();
            let pass = tokio::task::spawn_blocking(move || {
                (
                    store.prune_expired_cache_entries(),
                    store.prune_exhausted_outbox_entries(),
                )
            });
            match pass.await {
                Ok((0, 0)) => debug!("maintenance pass: nothing to prune"),
                Ok((cache, outbox)) => info!(cache, outbox, "pruned store entries"),
                Err(e) => warn!("maintenance pass failed: {e}"),
            }
        }
    });
    MaintenanceHandle { task }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use clanchat_store::{ManualClock, MemoryKv, OutboxPatch, StoreConfig};
    use clanchat_types::Message;

    use super::*;

    fn stale_store() -> Arc<MessageStore> {
        let clock = Arc::new(ManualClock::new(1_000));
        let store = Arc::new(MessageStore::with_clock(
            MemoryKv::new(),
            StoreConfig::default(),
            clock.clone(),
        ));
        store.set_messages(&"c1".into(), &[Message::new("c1", "2024-01-01T00:00:00.000Z", "a", "x")]);
        let id = store
            .add_outbox_message(Message::new("c1", "2024-01-01T00:00:01.000Z", "me", "y"))
            .unwrap();
        store.update_outbox_message(
            &id,
            &OutboxPatch {
                retry_count: Some(3),
                last_attempt: None,
            },
        );
        clock.advance(Duration::from_secs(25 * 3600));
        store
    }

    async fn assert_pruned(store: &MessageStore) {
        for _ in 0..100 {
            let info = store.storage_info();
            if info.cache_entries == 0 && info.outbox_entries == 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("maintenance did not prune: {:?}", store.storage_info());
    }

    #[tokio::test]
    async fn test_prunes_on_first_tick() {
        let store = stale_store();
        let _handle = spawn_maintenance(store.clone(), Duration::from_secs(300));
        assert_pruned(&store).await;
    }

    #[tokio::test]
    async fn test_zero_interval_is_clamped() {
        let store = stale_store();
        let _handle = spawn_maintenance(store.clone(), Duration::ZERO);
        assert_pruned(&store).await;
    }
}
