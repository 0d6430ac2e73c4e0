//! Locally authoritative map of owned partitions
//!
//! The [`TopicRegistry`] is the product of the last successful rebalance and
//! the source of truth for the fetch layer. Readers take cheap `Arc`
//! snapshots; the coordinator replaces the whole map atomically, so a reader
//! sees either the previous rebalance's view or the new one, never a mix.

use crate::consumer::assignor::TopicPartition;
use crate::consumer::stream::BlockQueue;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

/// Starting-offset sentinel meaning "the current end of the log". Installed
/// when a partition has no valid committed offset and `auto_offset_reset` is
/// `largest`; the fetch driver translates it to the partition's real end
/// position before fetching.
pub const OFFSET_END: i64 = i64::MAX;

/// Per-partition state owned by the registry and consumed by the fetch layer
#[derive(Debug)]
pub struct PartitionTopicInfo {
    pub topic: String,
    pub partition: i32,
    /// Sender side of the owning stream's bounded block queue
    pub blocks: BlockQueue,
    consumed_offset: AtomicI64,
    fetched_offset: AtomicI64,
    /// Maximum bytes per fetch request for this partition
    pub fetch_size: i32,
    pub client_id: String,
}

impl PartitionTopicInfo {
    pub fn new(
        topic: impl Into<String>,
        partition: i32,
        blocks: BlockQueue,
        starting_offset: i64,
        fetch_size: i32,
        client_id: impl Into<String>,
    ) -> Self {
        Self {
            topic: topic.into(),
            partition,
            blocks,
            consumed_offset: AtomicI64::new(starting_offset),
            fetched_offset: AtomicI64::new(starting_offset),
            fetch_size,
            client_id: client_id.into(),
        }
    }

    pub fn topic_partition(&self) -> TopicPartition {
        TopicPartition::new(self.topic.clone(), self.partition)
    }

    pub fn consumed_offset(&self) -> i64 {
        self.consumed_offset.load(Ordering::Relaxed)
    }

    pub fn fetched_offset(&self) -> i64 {
        self.fetched_offset.load(Ordering::Relaxed)
    }

    /// Record delivery progress. The fetched offset is bumped first so
    /// consumed never observably exceeds fetched.
    pub fn record_consumed(&self, offset: i64) {
        self.fetched_offset.fetch_max(offset, Ordering::Relaxed);
        self.consumed_offset.store(offset, Ordering::Relaxed);
    }

    /// Record fetch progress; called by the fetch driver
    pub fn record_fetched(&self, offset: i64) {
        self.fetched_offset.fetch_max(offset, Ordering::Relaxed);
    }

    /// Unconsumed distance between fetch and delivery
    pub fn lag(&self) -> i64 {
        (self.fetched_offset() - self.consumed_offset()).max(0)
    }
}

/// Shape of the registry's backing map
pub type RegistryMap = HashMap<String, HashMap<i32, Arc<PartitionTopicInfo>>>;

/// Lag for one owned partition
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionLag {
    pub topic: String,
    pub partition: i32,
    pub lag: i64,
}

/// The `topic -> partition -> PartitionTopicInfo` map produced by the last
/// successful rebalance
#[derive(Default)]
pub struct TopicRegistry {
    inner: RwLock<Arc<RegistryMap>>,
}

impl TopicRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current view. The returned snapshot stays valid while a replace runs.
    pub fn snapshot(&self) -> Arc<RegistryMap> {
        self.inner.read().clone()
    }

    /// Install the result of a rebalance. The sole mutator; called only by
    /// the coordinator under the rebalance lock.
    pub fn replace(&self, map: RegistryMap) {
        *self.inner.write() = Arc::new(map);
    }

    pub fn clear(&self) {
        self.replace(RegistryMap::new());
    }

    pub fn get(&self, topic: &str, partition: i32) -> Option<Arc<PartitionTopicInfo>> {
        self.snapshot().get(topic)?.get(&partition).cloned()
    }

    /// Total number of owned partitions
    pub fn len(&self) -> usize {
        self.snapshot().values().map(|p| p.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All owned partition infos, flattened for the fetch driver
    pub fn partition_infos(&self) -> Vec<Arc<PartitionTopicInfo>> {
        self.snapshot()
            .values()
            .flat_map(|partitions| partitions.values().cloned())
            .collect()
    }

    /// Identity keys of every owned partition, sorted
    pub fn partitions(&self) -> Vec<TopicPartition> {
        let mut keys: Vec<TopicPartition> = self
            .snapshot()
            .iter()
            .flat_map(|(topic, partitions)| {
                partitions
                    .keys()
                    .map(|p| TopicPartition::new(topic.clone(), *p))
            })
            .collect();
        keys.sort();
        keys
    }

    /// Per-partition lag, sorted by partition
    pub fn lag(&self) -> Vec<PartitionLag> {
        let mut lags: Vec<PartitionLag> = self
            .partition_infos()
            .iter()
            .map(|info| PartitionLag {
                topic: info.topic.clone(),
                partition: info.partition,
                lag: info.lag(),
            })
            .collect();
        lags.sort_by(|a, b| (&a.topic, a.partition).cmp(&(&b.topic, b.partition)));
        lags
    }
}
