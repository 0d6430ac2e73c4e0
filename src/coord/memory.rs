//! In-memory coordination store
//!
//! A process-local [`CoordStore`] used by the integration tests and by
//! embedded setups that run every group member inside one process. Ephemeral
//! semantics are approximated: registrations and ownership nodes live until
//! they are deleted, deregistered, or expired through [`expire_consumer`].
//!
//! [`expire_consumer`]: InMemoryCoordStore::expire_consumer

use crate::consumer::subscription::ThreadId;
use crate::coord::{Broker, ConsumerInfo, CoordStore, WatchEvent, WatchHandle, INVALID_OFFSET};
use crate::error::Result;
use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap};
use tokio::sync::oneshot;

#[derive(Default)]
struct Watchers {
    topics: Vec<oneshot::Sender<WatchEvent>>,
    brokers: Vec<oneshot::Sender<WatchEvent>>,
    consumers: HashMap<String, Vec<oneshot::Sender<WatchEvent>>>,
    changes: HashMap<String, Vec<oneshot::Sender<WatchEvent>>>,
}

/// DashMap-backed coordination store for tests and embedded use
#[derive(Default)]
pub struct InMemoryCoordStore {
    /// group -> consumer id -> registration
    registrations: DashMap<String, BTreeMap<String, ConsumerInfo>>,
    /// (group, topic, partition) -> thread id text
    owners: DashMap<(String, String, i32), String>,
    /// (group, topic, partition) -> committed offset
    offsets: DashMap<(String, String, i32), i64>,
    /// group -> sync barrier present
    sync_nodes: DashMap<String, ()>,
    /// group -> opaque notification children
    notifications: DashMap<String, Vec<String>>,
    topics: RwLock<BTreeMap<String, Vec<i32>>>,
    brokers: RwLock<Vec<Broker>>,
    watchers: Mutex<Watchers>,
}

impl InMemoryCoordStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a topic with `partitions` partitions and fire the topics watch
    pub fn create_topic(&self, name: &str, partitions: i32) {
        self.topics
            .write()
            .insert(name.to_string(), (0..partitions).collect());
        let senders = std::mem::take(&mut self.watchers.lock().topics);
        fire(senders, WatchEvent::Changed);
    }

    /// Replace the broker set and fire the brokers watch
    pub fn set_brokers(&self, brokers: Vec<Broker>) {
        *self.brokers.write() = brokers;
        let senders = std::mem::take(&mut self.watchers.lock().brokers);
        fire(senders, WatchEvent::Changed);
    }

    /// Drop a consumer's session: its registration and every ownership node
    /// it holds disappear, and membership watchers fire. This is what a
    /// crashed consumer looks like to the rest of the group.
    pub fn expire_consumer(&self, group: &str, consumer_id: &str) {
        if let Some(mut members) = self.registrations.get_mut(group) {
            members.remove(consumer_id);
        }
        self.owners.retain(|key, thread_text| {
            if key.0 != group {
                return true;
            }
            match ThreadId::parse(thread_text) {
                Some(thread) => thread.consumer_id != consumer_id,
                None => true,
            }
        });
        self.fire_consumers_watch(group);
    }

    /// Fire every outstanding watch with [`WatchEvent::Disconnected`],
    /// simulating a session loss
    pub fn disconnect(&self) {
        let mut watchers = self.watchers.lock();
        fire(std::mem::take(&mut watchers.topics), WatchEvent::Disconnected);
        fire(std::mem::take(&mut watchers.brokers), WatchEvent::Disconnected);
        for (_, senders) in watchers.consumers.drain() {
            fire(senders, WatchEvent::Disconnected);
        }
        for (_, senders) in watchers.changes.drain() {
            fire(senders, WatchEvent::Disconnected);
        }
    }

    /// Ownership nodes currently present for a group, for assertions
    pub fn owned_partitions(&self, group: &str) -> Vec<(String, i32, String)> {
        let mut nodes: Vec<(String, i32, String)> = self
            .owners
            .iter()
            .filter(|entry| entry.key().0 == group)
            .map(|entry| {
                let (_, topic, partition) = entry.key().clone();
                (topic, partition, entry.value().clone())
            })
            .collect();
        nodes.sort();
        nodes
    }

    /// Pending notification children for a group, for assertions
    pub fn notification_count(&self, group: &str) -> usize {
        self.notifications
            .get(group)
            .map(|n| n.len())
            .unwrap_or(0)
    }

    fn fire_consumers_watch(&self, group: &str) {
        let senders = self
            .watchers
            .lock()
            .consumers
            .remove(group)
            .unwrap_or_default();
        fire(senders, WatchEvent::Changed);
    }

    fn fire_changes_watch(&self, group: &str) {
        let senders = self
            .watchers
            .lock()
            .changes
            .remove(group)
            .unwrap_or_default();
        fire(senders, WatchEvent::Changed);
    }
}

fn fire(senders: Vec<oneshot::Sender<WatchEvent>>, event: WatchEvent) {
    for sender in senders {
        // The receiver may be gone when a consumer already shut down
        let _ = sender.send(event);
    }
}

fn watch(slot: &mut Vec<oneshot::Sender<WatchEvent>>) -> WatchHandle {
    let (tx, rx) = oneshot::channel();
    slot.push(tx);
    rx
}

#[async_trait]
impl CoordStore for InMemoryCoordStore {
    async fn register_consumer(
        &self,
        group: &str,
        consumer_id: &str,
        info: &ConsumerInfo,
    ) -> Result<()> {
        self.registrations
            .entry(group.to_string())
            .or_default()
            .insert(consumer_id.to_string(), info.clone());
        self.fire_consumers_watch(group);
        Ok(())
    }

    async fn deregister_consumer(&self, group: &str, consumer_id: &str) -> Result<()> {
        if let Some(mut members) = self.registrations.get_mut(group) {
            members.remove(consumer_id);
        }
        self.fire_consumers_watch(group);
        Ok(())
    }

    async fn get_all_brokers(&self) -> Result<Vec<Broker>> {
        Ok(self.brokers.read().clone())
    }

    async fn watch_brokers(&self) -> Result<WatchHandle> {
        Ok(watch(&mut self.watchers.lock().brokers))
    }

    async fn get_topics(&self) -> Result<Vec<String>> {
        Ok(self.topics.read().keys().cloned().collect())
    }

    async fn watch_topics(&self) -> Result<WatchHandle> {
        Ok(watch(&mut self.watchers.lock().topics))
    }

    async fn get_partitions_for_topics(
        &self,
        topics: &[String],
    ) -> Result<HashMap<String, Vec<i32>>> {
        let known = self.topics.read();
        let mut result = HashMap::new();
        for topic in topics {
            if let Some(partitions) = known.get(topic) {
                result.insert(topic.clone(), partitions.clone());
            }
        }
        Ok(result)
    }

    async fn get_consumers_in_group(&self, group: &str) -> Result<Vec<String>> {
        Ok(self
            .registrations
            .get(group)
            .map(|members| members.keys().cloned().collect())
            .unwrap_or_default())
    }

    async fn watch_consumers_in_group(&self, group: &str) -> Result<WatchHandle> {
        Ok(watch(
            self.watchers
                .lock()
                .consumers
                .entry(group.to_string())
                .or_default(),
        ))
    }

    async fn get_consumer_info(
        &self,
        group: &str,
        consumer_id: &str,
    ) -> Result<Option<ConsumerInfo>> {
        Ok(self
            .registrations
            .get(group)
            .and_then(|members| members.get(consumer_id).cloned()))
    }

    async fn watch_group_changes(&self, group: &str) -> Result<WatchHandle> {
        Ok(watch(
            self.watchers
                .lock()
                .changes
                .entry(group.to_string())
                .or_default(),
        ))
    }

    async fn ensure_group_paths(&self, group: &str) -> Result<()> {
        self.notifications.entry(group.to_string()).or_default();
        Ok(())
    }

    async fn claim_partition_ownership(
        &self,
        group: &str,
        topic: &str,
        partition: i32,
        thread_id: &ThreadId,
    ) -> Result<bool> {
        let key = (group.to_string(), topic.to_string(), partition);
        match self.owners.entry(key) {
            Entry::Occupied(existing) => Ok(existing.get() == &thread_id.to_string()),
            Entry::Vacant(slot) => {
                slot.insert(thread_id.to_string());
                Ok(true)
            }
        }
    }

    async fn delete_partition_ownership(
        &self,
        group: &str,
        topic: &str,
        partition: i32,
    ) -> Result<()> {
        self.owners
            .remove(&(group.to_string(), topic.to_string(), partition));
        Ok(())
    }

    async fn get_offset(&self, group: &str, topic: &str, partition: i32) -> Result<i64> {
        Ok(self
            .offsets
            .get(&(group.to_string(), topic.to_string(), partition))
            .map(|o| *o)
            .unwrap_or(INVALID_OFFSET))
    }

    async fn commit_offset(
        &self,
        group: &str,
        topic: &str,
        partition: i32,
        offset: i64,
    ) -> Result<()> {
        self.offsets
            .insert((group.to_string(), topic.to_string(), partition), offset);
        Ok(())
    }

    async fn is_group_in_sync(&self, group: &str) -> Result<bool> {
        Ok(self.sync_nodes.contains_key(group))
    }

    async fn create_group_sync(&self, group: &str) -> Result<()> {
        self.sync_nodes.insert(group.to_string(), ());
        Ok(())
    }

    async fn delete_group_sync(&self, group: &str) -> Result<()> {
        self.sync_nodes.remove(group);
        Ok(())
    }

    async fn notify_group(&self, group: &str, from_consumer_id: &str) -> Result<()> {
        let mut children = self.notifications.entry(group.to_string()).or_default();
        let seq = children.len();
        children.push(format!("{}-{}", from_consumer_id, seq));
        drop(children);
        self.fire_changes_watch(group);
        Ok(())
    }

    async fn purge_obsolete_notifications(&self, group: &str) -> Result<()> {
        if let Some(mut children) = self.notifications.get_mut(group) {
            children.clear();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap as StdHashMap;

    fn info() -> ConsumerInfo {
        ConsumerInfo::new(StdHashMap::from([("events".to_string(), 1)]), "static")
    }

    #[tokio::test]
    async fn test_register_then_list() {
        let store = InMemoryCoordStore::new();
        store.register_consumer("g", "c1", &info()).await.unwrap();
        store.register_consumer("g", "c2", &info()).await.unwrap();

        let members = store.get_consumers_in_group("g").await.unwrap();
        assert_eq!(members, vec!["c1".to_string(), "c2".to_string()]);

        let read = store.get_consumer_info("g", "c1").await.unwrap();
        assert_eq!(read, Some(info()));
    }

    #[tokio::test]
    async fn test_claim_contention() {
        let store = InMemoryCoordStore::new();
        let t1 = ThreadId::new("c1", 0);
        let t2 = ThreadId::new("c2", 0);

        assert!(store
            .claim_partition_ownership("g", "events", 0, &t1)
            .await
            .unwrap());
        // Another thread cannot take a held partition
        assert!(!store
            .claim_partition_ownership("g", "events", 0, &t2)
            .await
            .unwrap());
        // Re-claiming by the holder is fine
        assert!(store
            .claim_partition_ownership("g", "events", 0, &t1)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_claim_delete_claim() {
        let store = InMemoryCoordStore::new();
        let t1 = ThreadId::new("c1", 0);

        assert!(store
            .claim_partition_ownership("g", "events", 0, &t1)
            .await
            .unwrap());
        store
            .delete_partition_ownership("g", "events", 0)
            .await
            .unwrap();
        // Deleting a missing node is idempotent
        store
            .delete_partition_ownership("g", "events", 0)
            .await
            .unwrap();
        assert!(store
            .claim_partition_ownership("g", "events", 0, &t1)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_membership_watch_fires_on_register() {
        let store = InMemoryCoordStore::new();
        let watch = store.watch_consumers_in_group("g").await.unwrap();

        store.register_consumer("g", "c1", &info()).await.unwrap();
        assert_eq!(watch.await.unwrap(), WatchEvent::Changed);
    }

    #[tokio::test]
    async fn test_disconnect_fires_all_watches() {
        let store = InMemoryCoordStore::new();
        let topics = store.watch_topics().await.unwrap();
        let brokers = store.watch_brokers().await.unwrap();
        let members = store.watch_consumers_in_group("g").await.unwrap();

        store.disconnect();
        assert_eq!(topics.await.unwrap(), WatchEvent::Disconnected);
        assert_eq!(brokers.await.unwrap(), WatchEvent::Disconnected);
        assert_eq!(members.await.unwrap(), WatchEvent::Disconnected);
    }

    #[tokio::test]
    async fn test_offsets() {
        let store = InMemoryCoordStore::new();
        assert_eq!(store.get_offset("g", "events", 0).await.unwrap(), INVALID_OFFSET);

        store.commit_offset("g", "events", 0, 42).await.unwrap();
        assert_eq!(store.get_offset("g", "events", 0).await.unwrap(), 42);
    }

    #[tokio::test]
    async fn test_sync_barrier() {
        let store = InMemoryCoordStore::new();
        assert!(!store.is_group_in_sync("g").await.unwrap());

        store.create_group_sync("g").await.unwrap();
        assert!(store.is_group_in_sync("g").await.unwrap());

        store.delete_group_sync("g").await.unwrap();
        assert!(!store.is_group_in_sync("g").await.unwrap());
        // Deleting a missing barrier is idempotent
        store.delete_group_sync("g").await.unwrap();
    }

    #[tokio::test]
    async fn test_notifications_purge() {
        let store = InMemoryCoordStore::new();
        store.notify_group("g", "c1").await.unwrap();
        store.notify_group("g", "c2").await.unwrap();
        assert_eq!(store.notification_count("g"), 2);

        store.purge_obsolete_notifications("g").await.unwrap();
        assert_eq!(store.notification_count("g"), 0);
    }

    #[tokio::test]
    async fn test_expire_consumer_drops_ownership() {
        let store = InMemoryCoordStore::new();
        store.register_consumer("g", "c1", &info()).await.unwrap();
        store
            .claim_partition_ownership("g", "events", 0, &ThreadId::new("c1", 0))
            .await
            .unwrap();
        store
            .claim_partition_ownership("g", "events", 1, &ThreadId::new("c2", 0))
            .await
            .unwrap();

        store.expire_consumer("g", "c1");

        assert!(store.get_consumers_in_group("g").await.unwrap().is_empty());
        let remaining = store.owned_partitions("g");
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].1, 1);
    }

    #[tokio::test]
    async fn test_topic_partitions() {
        let store = InMemoryCoordStore::new();
        store.create_topic("events", 4);
        store.create_topic("audit", 2);

        let parts = store
            .get_partitions_for_topics(&["events".to_string(), "missing".to_string()])
            .await
            .unwrap();
        assert_eq!(parts.len(), 1);
        assert_eq!(parts["events"], vec![0, 1, 2, 3]);
    }
}
