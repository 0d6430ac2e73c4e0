//! Topic subscriptions and consumer thread identity
//!
//! A [`TopicSubscription`] describes how the topics a consumer is interested
//! in map to per-consumer streams. Three variants exist: a static map of
//! explicit topic names, a wildcard filter resolved against the live topic
//! universe, and a switch marker used while a group migrates to a new
//! subscription in lockstep.

use crate::coord::{ConsumerInfo, CoordStore, SWITCH_PATTERN_PREFIX};
use crate::error::{CoordError, Result};
use regex::Regex;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

/// Prefix marking topics internal to the broker cluster
const INTERNAL_TOPIC_PREFIX: &str = "__";

/// Within-consumer stream identity; the unit of partition assignment.
///
/// Thread ids order lexicographically by `(consumer_id, index)` so that every
/// group member sorts them identically during assignment.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ThreadId {
    pub consumer_id: String,
    pub index: usize,
}

impl ThreadId {
    pub fn new(consumer_id: impl Into<String>, index: usize) -> Self {
        Self {
            consumer_id: consumer_id.into(),
            index,
        }
    }

    /// Parse the text form written to ownership nodes (`<consumer_id>-<index>`).
    pub fn parse(s: &str) -> Option<Self> {
        let (consumer_id, index) = s.rsplit_once('-')?;
        let index = index.parse().ok()?;
        Some(Self {
            consumer_id: consumer_id.to_string(),
            index,
        })
    }
}

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.consumer_id, self.index)
    }
}

/// Key mapping partitions to streams: all partitions of one topic owned by
/// one thread share a single stream.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TopicAndThreadId {
    pub topic: String,
    pub thread_id: ThreadId,
}

impl TopicAndThreadId {
    pub fn new(topic: impl Into<String>, thread_id: ThreadId) -> Self {
        Self {
            topic: topic.into(),
            thread_id,
        }
    }
}

/// Filter deciding which topics a wildcard subscription covers
pub trait TopicFilter: Send + Sync + fmt::Debug {
    /// Whether the topic passes the filter
    fn is_topic_allowed(&self, topic: &str, exclude_internal: bool) -> bool;

    /// The raw pattern, written to the store as the subscription key
    fn pattern(&self) -> &str;

    /// Pattern kind advertised to the group: `white_list` or `black_list`
    fn kind(&self) -> &'static str;
}

/// Accepts topics matching the regular expression
#[derive(Debug, Clone)]
pub struct Whitelist {
    raw: String,
    regex: Regex,
}

impl Whitelist {
    pub fn new(pattern: &str) -> Result<Self> {
        let regex = Regex::new(pattern).map_err(|e| {
            crate::error::ConfigError::invalid_setting("whitelist", e.to_string())
        })?;
        Ok(Self {
            raw: pattern.to_string(),
            regex,
        })
    }
}

impl TopicFilter for Whitelist {
    fn is_topic_allowed(&self, topic: &str, exclude_internal: bool) -> bool {
        if exclude_internal && topic.starts_with(INTERNAL_TOPIC_PREFIX) {
            return false;
        }
        self.regex.is_match(topic)
    }

    fn pattern(&self) -> &str {
        &self.raw
    }

    fn kind(&self) -> &'static str {
        "white_list"
    }
}

/// Accepts topics not matching the regular expression
#[derive(Debug, Clone)]
pub struct Blacklist {
    raw: String,
    regex: Regex,
}

impl Blacklist {
    pub fn new(pattern: &str) -> Result<Self> {
        let regex = Regex::new(pattern).map_err(|e| {
            crate::error::ConfigError::invalid_setting("blacklist", e.to_string())
        })?;
        Ok(Self {
            raw: pattern.to_string(),
            regex,
        })
    }
}

impl TopicFilter for Blacklist {
    fn is_topic_allowed(&self, topic: &str, exclude_internal: bool) -> bool {
        if exclude_internal && topic.starts_with(INTERNAL_TOPIC_PREFIX) {
            return false;
        }
        !self.regex.is_match(topic)
    }

    fn pattern(&self) -> &str {
        &self.raw
    }

    fn kind(&self) -> &'static str {
        "black_list"
    }
}

/// How topics map to per-consumer streams
#[derive(Debug, Clone)]
pub enum TopicSubscription {
    /// Explicit `topic -> stream count` map
    Static {
        consumer_id: String,
        counts: HashMap<String, usize>,
    },
    /// Filter over the live topic universe, `num_streams` threads per match.
    /// The universe is resolved on every call, never cached, because it
    /// changes with store events.
    Wildcard {
        consumer_id: String,
        filter: Arc<dyn TopicFilter>,
        num_streams: usize,
        exclude_internal: bool,
    },
    /// In-flight replacement of one subscription by another; emits like
    /// `Static` but advertises `switch/<desired_pattern>` to peers
    Switch {
        consumer_id: String,
        counts: HashMap<String, usize>,
        desired_pattern: String,
    },
}

impl TopicSubscription {
    /// Pattern string registered in the store for this subscription
    pub fn pattern(&self) -> String {
        match self {
            TopicSubscription::Static { .. } => "static".to_string(),
            TopicSubscription::Wildcard { filter, .. } => filter.kind().to_string(),
            TopicSubscription::Switch {
                desired_pattern, ..
            } => format!("{}{}", SWITCH_PATTERN_PREFIX, desired_pattern),
        }
    }

    /// The `topic -> stream count` map persisted in this consumer's
    /// registration. Wildcard subscriptions persist the filter pattern as
    /// the sole key.
    pub fn subscription_map(&self) -> HashMap<String, usize> {
        match self {
            TopicSubscription::Static { counts, .. }
            | TopicSubscription::Switch { counts, .. } => counts.clone(),
            TopicSubscription::Wildcard {
                filter,
                num_streams,
                ..
            } => {
                let mut map = HashMap::new();
                map.insert(filter.pattern().to_string(), *num_streams);
                map
            }
        }
    }

    /// The set of `(topic, thread)` identities this consumer contributes,
    /// sorted per topic for deterministic assignment
    pub async fn consumer_thread_ids_per_topic(
        &self,
        coord: &dyn CoordStore,
    ) -> Result<BTreeMap<String, Vec<ThreadId>>> {
        match self {
            TopicSubscription::Static { consumer_id, counts }
            | TopicSubscription::Switch {
                consumer_id,
                counts,
                ..
            } => Ok(thread_ids_for(
                consumer_id,
                counts.iter().map(|(t, c)| (t.clone(), *c)),
            )),
            TopicSubscription::Wildcard {
                consumer_id,
                filter,
                num_streams,
                exclude_internal,
            } => {
                let topics = coord.get_topics().await?;
                let matched = topics
                    .into_iter()
                    .filter(|t| filter.is_topic_allowed(t, *exclude_internal))
                    .map(|t| (t, *num_streams));
                Ok(thread_ids_for(consumer_id, matched))
            }
        }
    }

    /// Rebuild a subscription from a registration read back from the store.
    ///
    /// The rebalance recomputes the local topic count from store state on
    /// every attempt, so switches and wildcard universe growth are observed
    /// without local bookkeeping.
    pub fn from_consumer_info(
        consumer_id: &str,
        info: &ConsumerInfo,
        exclude_internal: bool,
    ) -> Result<TopicSubscription> {
        let counts: HashMap<String, usize> = info.subscription.clone();
        match info.pattern.as_str() {
            "static" => Ok(TopicSubscription::Static {
                consumer_id: consumer_id.to_string(),
                counts,
            }),
            kind @ ("white_list" | "black_list") => {
                let (pattern, num_streams) = counts.iter().next().ok_or_else(|| {
                    CoordError::operation("parse consumer info", "empty wildcard subscription")
                })?;
                let filter: Arc<dyn TopicFilter> = if kind == "white_list" {
                    Arc::new(Whitelist::new(pattern)?)
                } else {
                    Arc::new(Blacklist::new(pattern)?)
                };
                Ok(TopicSubscription::Wildcard {
                    consumer_id: consumer_id.to_string(),
                    filter,
                    num_streams: *num_streams,
                    exclude_internal,
                })
            }
            other => match other.strip_prefix(SWITCH_PATTERN_PREFIX) {
                Some(desired) => Ok(TopicSubscription::Switch {
                    consumer_id: consumer_id.to_string(),
                    counts,
                    desired_pattern: desired.to_string(),
                }),
                None => Err(CoordError::operation(
                    "parse consumer info",
                    format!("unknown subscription pattern '{}'", other),
                )
                .into()),
            },
        }
    }
}

fn thread_ids_for(
    consumer_id: &str,
    counts: impl Iterator<Item = (String, usize)>,
) -> BTreeMap<String, Vec<ThreadId>> {
    let mut result = BTreeMap::new();
    for (topic, count) in counts {
        let ids: Vec<ThreadId> = (0..count).map(|i| ThreadId::new(consumer_id, i)).collect();
        result.insert(topic, ids);
    }
    result
}
