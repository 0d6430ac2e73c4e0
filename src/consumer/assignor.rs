//! Partition assignment for consumer groups
//!
//! Every group member runs the assignment independently against the same
//! store state and must arrive at the same answer, so everything that feeds
//! a decision (consumers, threads, topics, partitions) is sorted before use.
//! Two strategies are available:
//!
//! - `Range`: per-topic contiguous ranges; the first few threads take one
//!   extra partition when the count does not divide evenly
//! - `RoundRobin`: all partitions across all topics dealt out to the global
//!   thread ring, skipping threads not subscribed to the partition's topic

use crate::consumer::subscription::{ThreadId, TopicSubscription};
use crate::coord::{Broker, ConsumerInfo, CoordStore};
use crate::error::{ConfigError, CoordError, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;

/// Identity key for a partition of a topic
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TopicPartition {
    pub topic: String,
    pub partition: i32,
}

impl TopicPartition {
    pub fn new(topic: impl Into<String>, partition: i32) -> Self {
        Self {
            topic: topic.into(),
            partition,
        }
    }
}

impl fmt::Display for TopicPartition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.topic, self.partition)
    }
}

/// Strategy for assigning partitions to consumer threads
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AssignmentStrategy {
    /// Contiguous per-topic ranges
    #[default]
    Range,
    /// Round-robin over all partitions of all topics
    RoundRobin,
}

impl FromStr for AssignmentStrategy {
    type Err = ConfigError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "range" => Ok(AssignmentStrategy::Range),
            "roundrobin" => Ok(AssignmentStrategy::RoundRobin),
            other => Err(ConfigError::invalid_setting(
                "partition_assignment_strategy",
                format!("unknown strategy '{}'", other),
            )),
        }
    }
}

/// Everything a rebalance attempt needs to decide ownership, reconstructed
/// from store state on every attempt
#[derive(Debug)]
pub struct AssignmentContext {
    pub group: String,
    pub consumer_id: String,
    /// Sorted ids of every registered member
    pub consumers: Vec<String>,
    /// Registration of every member
    pub consumer_infos: BTreeMap<String, ConsumerInfo>,
    pub brokers: Vec<Broker>,
    /// Partition ids per subscribed topic
    pub partitions_per_topic: BTreeMap<String, Vec<i32>>,
    /// Union of every member's threads, sorted per topic
    pub thread_ids_per_topic: BTreeMap<String, Vec<ThreadId>>,
    /// At least one member is advertising a switch
    pub switch_in_progress: bool,
    /// Every member is advertising the switch
    pub switch_in_sync: bool,
    /// Subscription the group is switching to
    pub desired_counts: HashMap<String, usize>,
    /// Pattern the group is switching to
    pub desired_pattern: String,
    /// This consumer has itself advertised the switch
    pub in_topic_switch: bool,
}

impl AssignmentContext {
    /// Read group membership and subscriptions from the store and derive the
    /// switch state every member will agree on.
    pub async fn build(
        group: &str,
        consumer_id: &str,
        exclude_internal: bool,
        brokers: Vec<Broker>,
        coord: &dyn CoordStore,
    ) -> Result<AssignmentContext> {
        let mut consumers = coord.get_consumers_in_group(group).await?;
        consumers.sort();
        if consumers.is_empty() {
            return Err(CoordError::operation(
                "build assignment context",
                format!("group '{}' has no registered consumers", group),
            )
            .into());
        }

        let mut consumer_infos = BTreeMap::new();
        for member in &consumers {
            let info = coord
                .get_consumer_info(group, member)
                .await?
                .ok_or_else(|| {
                    // The member vanished between the children read and the
                    // data read; the caller retries against fresh state
                    CoordError::operation(
                        "build assignment context",
                        format!("consumer '{}' disappeared from group '{}'", member, group),
                    )
                })?;
            consumer_infos.insert(member.clone(), info);
        }

        let switching: Vec<(&String, &ConsumerInfo)> = consumer_infos
            .iter()
            .filter(|(_, info)| info.is_switching())
            .collect();
        let switch_in_progress = !switching.is_empty();
        let switch_in_sync = switching.len() == consumer_infos.len();

        // Every member must derive the same desired subscription: take it
        // from the switching member with the newest timestamp, consumer id
        // breaking ties
        let (desired_counts, desired_pattern) = switching
            .iter()
            .max_by_key(|(id, info)| (info.timestamp, id.as_str()))
            .map(|(_, info)| {
                (
                    info.subscription.clone(),
                    info.desired_pattern().unwrap_or_default().to_string(),
                )
            })
            .unwrap_or_default();

        let in_topic_switch = consumer_infos
            .get(consumer_id)
            .map(|info| info.is_switching())
            .unwrap_or(false);

        let mut thread_ids_per_topic: BTreeMap<String, Vec<ThreadId>> = BTreeMap::new();
        for (member, info) in &consumer_infos {
            let subscription =
                TopicSubscription::from_consumer_info(member, info, exclude_internal)?;
            for (topic, threads) in subscription.consumer_thread_ids_per_topic(coord).await? {
                thread_ids_per_topic.entry(topic).or_default().extend(threads);
            }
        }
        for threads in thread_ids_per_topic.values_mut() {
            threads.sort();
        }

        let topics: Vec<String> = thread_ids_per_topic.keys().cloned().collect();
        let partitions_per_topic: BTreeMap<String, Vec<i32>> = coord
            .get_partitions_for_topics(&topics)
            .await?
            .into_iter()
            .map(|(topic, mut partitions)| {
                partitions.sort_unstable();
                (topic, partitions)
            })
            .collect();

        Ok(AssignmentContext {
            group: group.to_string(),
            consumer_id: consumer_id.to_string(),
            consumers,
            consumer_infos,
            brokers,
            partitions_per_topic,
            thread_ids_per_topic,
            switch_in_progress,
            switch_in_sync,
            desired_counts,
            desired_pattern,
            in_topic_switch,
        })
    }
}

impl AssignmentStrategy {
    /// Map every partition of every subscribed topic to exactly one thread.
    ///
    /// Deterministic over the context; no partition appears twice.
    pub fn assign(&self, ctx: &AssignmentContext) -> HashMap<TopicPartition, ThreadId> {
        match self {
            AssignmentStrategy::Range => assign_range(ctx),
            AssignmentStrategy::RoundRobin => assign_round_robin(ctx),
        }
    }
}

fn assign_range(ctx: &AssignmentContext) -> HashMap<TopicPartition, ThreadId> {
    let mut ownership = HashMap::new();

    for (topic, threads) in &ctx.thread_ids_per_topic {
        let Some(partitions) = ctx.partitions_per_topic.get(topic) else {
            continue;
        };
        if threads.is_empty() || partitions.is_empty() {
            continue;
        }

        let per_thread = partitions.len() / threads.len();
        let extra = partitions.len() % threads.len();

        for (i, thread) in threads.iter().enumerate() {
            let start = per_thread * i + i.min(extra);
            let count = per_thread + usize::from(i < extra);
            for partition in &partitions[start..start + count] {
                ownership.insert(TopicPartition::new(topic.clone(), *partition), thread.clone());
            }
        }
    }

    ownership
}

fn assign_round_robin(ctx: &AssignmentContext) -> HashMap<TopicPartition, ThreadId> {
    let mut ownership = HashMap::new();

    let mut all_threads: Vec<ThreadId> = ctx
        .thread_ids_per_topic
        .values()
        .flatten()
        .cloned()
        .collect();
    all_threads.sort();
    all_threads.dedup();
    if all_threads.is_empty() {
        return ownership;
    }

    let mut all_partitions: Vec<TopicPartition> = ctx
        .partitions_per_topic
        .iter()
        .flat_map(|(topic, partitions)| {
            partitions
                .iter()
                .map(|p| TopicPartition::new(topic.clone(), *p))
        })
        .collect();
    all_partitions.sort();

    let mut ring = all_threads.iter().cycle();
    for tp in all_partitions {
        // Deal to the next thread whose owner subscribes to this topic
        for _ in 0..all_threads.len() {
            let candidate = ring
                .next()
                .unwrap_or_else(|| unreachable!("cycle over non-empty thread list"));
            let subscribed = ctx
                .thread_ids_per_topic
                .get(&tp.topic)
                .map(|threads| threads.contains(candidate))
                .unwrap_or(false);
            if subscribed {
                ownership.insert(tp, candidate.clone());
                break;
            }
        }
    }

    ownership
}
