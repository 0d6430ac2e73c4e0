//! Typed operations over the coordination store
//!
//! The consumer core never speaks to the store directly; everything goes
//! through the [`CoordStore`] trait. The real client (connection handling,
//! session keep-alive, retries at the transport level) lives outside this
//! crate; [`memory::InMemoryCoordStore`] ships for tests and embedded use.
//!
//! # Store layout
//!
//! All group state lives under well-known paths (see [`GroupPaths`]):
//!
//! ```text
//! /consumers/<group>/ids/<consumerId>          ephemeral, JSON ConsumerInfo
//! /consumers/<group>/owners/<topic>/<part>     ephemeral, text ThreadId
//! /consumers/<group>/offsets/<topic>/<part>    persistent, decimal offset
//! /consumers/<group>/changes                   persistent notification parent
//! /consumers/<group>/sync                      persistent one-bit barrier
//! /brokers/ids/*, /brokers/topics/*            broker and topic universes
//! ```
//!
//! Ephemeral nodes disappear with the session that created them, which is
//! what turns a consumer crash into a membership change the rest of the
//! group observes.

pub mod memory;

use crate::consumer::subscription::ThreadId;
use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::oneshot;

/// Sentinel for a missing or invalid committed offset
pub const INVALID_OFFSET: i64 = -1;

/// Pattern prefix advertising an in-flight topic switch to the group
pub const SWITCH_PATTERN_PREFIX: &str = "switch/";

/// Registration format version
const CONSUMER_INFO_VERSION: i16 = 1;

/// Whether an offset needs resolution against the auto-offset-reset policy
pub fn is_offset_invalid(offset: i64) -> bool {
    offset <= INVALID_OFFSET
}

/// A broker currently alive in the cluster
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Broker {
    pub id: i32,
    pub host: String,
    pub port: u16,
}

/// Per-consumer registration persisted under the group's `ids` path.
///
/// Written as an ephemeral node keyed by consumer id; its disappearance
/// triggers a rebalance in every other member.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsumerInfo {
    pub version: i16,
    pub subscription: HashMap<String, usize>,
    pub pattern: String,
    pub timestamp: i64,
}

impl ConsumerInfo {
    pub fn new(subscription: HashMap<String, usize>, pattern: impl Into<String>) -> Self {
        Self {
            version: CONSUMER_INFO_VERSION,
            subscription,
            pattern: pattern.into(),
            timestamp: chrono::Utc::now().timestamp(),
        }
    }

    /// Whether this member is advertising a topic switch
    pub fn is_switching(&self) -> bool {
        self.pattern.starts_with(SWITCH_PATTERN_PREFIX)
    }

    /// The pattern the member wants the group to converge on, if switching
    pub fn desired_pattern(&self) -> Option<&str> {
        self.pattern.strip_prefix(SWITCH_PATTERN_PREFIX)
    }
}

/// What a fired watch observed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchEvent {
    /// The watched node or its children changed
    Changed,
    /// The session to the store dropped; the watch must be reinstalled
    /// without triggering a rebalance
    Disconnected,
    /// Spurious wake with no attached change
    Empty,
}

/// One-shot watch receiver. After it fires (or the session ends) the caller
/// must install a fresh watch.
pub type WatchHandle = oneshot::Receiver<WatchEvent>;

/// Well-known store paths for a consumer group
#[derive(Debug, Clone)]
pub struct GroupPaths {
    group: String,
}

impl GroupPaths {
    pub const BROKER_IDS_DIR: &'static str = "/brokers/ids";
    pub const BROKER_TOPICS_DIR: &'static str = "/brokers/topics";

    pub fn new(group: impl Into<String>) -> Self {
        Self {
            group: group.into(),
        }
    }

    pub fn consumer_registry_dir(&self) -> String {
        format!("/consumers/{}/ids", self.group)
    }

    pub fn consumer_path(&self, consumer_id: &str) -> String {
        format!("{}/{}", self.consumer_registry_dir(), consumer_id)
    }

    pub fn owners_dir(&self, topic: &str) -> String {
        format!("/consumers/{}/owners/{}", self.group, topic)
    }

    pub fn owner_path(&self, topic: &str, partition: i32) -> String {
        format!("{}/{}", self.owners_dir(topic), partition)
    }

    pub fn offset_path(&self, topic: &str, partition: i32) -> String {
        format!("/consumers/{}/offsets/{}/{}", self.group, topic, partition)
    }

    pub fn changes_dir(&self) -> String {
        format!("/consumers/{}/changes", self.group)
    }

    pub fn sync_path(&self) -> String {
        format!("/consumers/{}/sync", self.group)
    }
}

/// The coordination-store operations the consumer core depends on.
///
/// Implementations must be safe to share across tasks; the gateway is called
/// concurrently from the watch loop, the public API, and the shutdown path.
#[async_trait]
pub trait CoordStore: Send + Sync {
    /// Write this consumer's registration as an ephemeral node. Re-registering
    /// overwrites the previous registration.
    async fn register_consumer(
        &self,
        group: &str,
        consumer_id: &str,
        info: &ConsumerInfo,
    ) -> Result<()>;

    /// Remove this consumer's registration. Missing node is not an error.
    async fn deregister_consumer(&self, group: &str, consumer_id: &str) -> Result<()>;

    /// Current broker set
    async fn get_all_brokers(&self) -> Result<Vec<Broker>>;

    /// Install a one-shot watch on the broker set
    async fn watch_brokers(&self) -> Result<WatchHandle>;

    /// Current topic universe
    async fn get_topics(&self) -> Result<Vec<String>>;

    /// Install a one-shot watch on the topic universe
    async fn watch_topics(&self) -> Result<WatchHandle>;

    /// Partition ids per topic, for the requested topics
    async fn get_partitions_for_topics(
        &self,
        topics: &[String],
    ) -> Result<HashMap<String, Vec<i32>>>;

    /// Consumer ids currently registered in the group
    async fn get_consumers_in_group(&self, group: &str) -> Result<Vec<String>>;

    /// Install a one-shot watch on group membership
    async fn watch_consumers_in_group(&self, group: &str) -> Result<WatchHandle>;

    /// Read a member's registration, `None` if it is gone
    async fn get_consumer_info(
        &self,
        group: &str,
        consumer_id: &str,
    ) -> Result<Option<ConsumerInfo>>;

    /// Install a one-shot watch on the group's notification node
    async fn watch_group_changes(&self, group: &str) -> Result<WatchHandle>;

    /// Create the persistent parents (notification dir and friends) the
    /// group needs before watches can be installed
    async fn ensure_group_paths(&self, group: &str) -> Result<()>;

    /// Create the ephemeral ownership node for a partition. Returns `false`
    /// if another thread already holds it; `Err` only on transport faults.
    async fn claim_partition_ownership(
        &self,
        group: &str,
        topic: &str,
        partition: i32,
        thread_id: &ThreadId,
    ) -> Result<bool>;

    /// Delete the ownership node. Idempotent; a missing node is not an error.
    async fn delete_partition_ownership(
        &self,
        group: &str,
        topic: &str,
        partition: i32,
    ) -> Result<()>;

    /// Committed offset for the partition, or [`INVALID_OFFSET`] when none
    /// has been committed
    async fn get_offset(&self, group: &str, topic: &str, partition: i32) -> Result<i64>;

    /// Persist a committed offset
    async fn commit_offset(
        &self,
        group: &str,
        topic: &str,
        partition: i32,
        offset: i64,
    ) -> Result<()>;

    /// Whether the group's sync barrier node exists
    async fn is_group_in_sync(&self, group: &str) -> Result<bool>;

    /// Create the sync barrier node. Creating an existing barrier is fine.
    async fn create_group_sync(&self, group: &str) -> Result<()>;

    /// Delete the sync barrier node. Missing node is not an error.
    async fn delete_group_sync(&self, group: &str) -> Result<()>;

    /// Append an opaque notification nudging every member to rebalance
    async fn notify_group(&self, group: &str, from_consumer_id: &str) -> Result<()>;

    /// Drop notification nodes that every member has already seen
    async fn purge_obsolete_notifications(&self, group: &str) -> Result<()>;
}
