//! Consumer configuration
//!
//! [`ConsumerConfig`] is the loading target for whatever mechanism the host
//! uses (CLI, file, environment); this crate does not parse any of those
//! itself. Defaults are carried as named constants so embedding code can
//! reference them.

use crate::consumer::assignor::AssignmentStrategy;
use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;

/// Default number of fetcher threads, also the default stream count for
/// wildcard subscriptions
pub const DEFAULT_NUM_CONSUMER_FETCHERS: usize = 1;

/// Default maximum bytes fetched per partition per request
pub const DEFAULT_FETCH_MESSAGE_MAX_BYTES: i32 = 1024 * 1024;

/// Default capacity of each stream's block queue (backpressure bound)
pub const DEFAULT_QUEUED_MAX_MESSAGES: usize = 10;

/// Default number of rebalance attempts before giving up
pub const DEFAULT_REBALANCE_MAX_RETRIES: u32 = 4;

/// Default sleep between failed rebalance attempts
pub const DEFAULT_REBALANCE_BACKOFF: Duration = Duration::from_secs(2);

/// Default coordination-store session timeout
pub const DEFAULT_ZOOKEEPER_TIMEOUT: Duration = Duration::from_secs(6);

/// The only supported offsets storage backend
pub const OFFSETS_STORAGE_ZOOKEEPER: &str = "zookeeper";

/// Where a consumer starts when a partition has no valid committed offset
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AutoOffsetReset {
    /// Start from the earliest available offset
    Smallest,
    /// Start from the end of the log
    #[default]
    Largest,
}

impl FromStr for AutoOffsetReset {
    type Err = ConfigError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "smallest" => Ok(AutoOffsetReset::Smallest),
            "largest" => Ok(AutoOffsetReset::Largest),
            other => Err(ConfigError::invalid_setting(
                "auto_offset_reset",
                format!("unknown value '{}'", other),
            )),
        }
    }
}

/// Complete configuration for a [`Consumer`](crate::consumer::Consumer).
///
/// # Example
///
/// ```rust
/// use muster::config::ConsumerConfig;
///
/// let config = ConsumerConfig {
///     group_id: "ingest".to_string(),
///     zookeeper_connect: vec!["zk1:2181".to_string()],
///     ..ConsumerConfig::default()
/// };
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsumerConfig {
    /// Process-wide stable identifier of this consumer. Generated when empty.
    pub consumer_id: String,

    /// Name of the coordination group; all consumers sharing a group id
    /// partition the union of their subscriptions.
    pub group_id: String,

    /// Coordination-store connect strings (host:port)
    pub zookeeper_connect: Vec<String>,

    /// Coordination-store session timeout
    pub zookeeper_timeout: Duration,

    /// Number of fetcher threads; default stream count for wildcard
    /// subscriptions
    pub num_consumer_fetchers: usize,

    /// Maximum bytes fetched per partition per request
    pub fetch_message_max_bytes: i32,

    /// Capacity of each stream's block queue. This bound is the only
    /// backpressure mechanism between the fetchers and user delivery.
    pub queued_max_messages: usize,

    /// Number of rebalance attempts before the consumer gives up
    pub rebalance_max_retries: u32,

    /// Sleep between failed rebalance attempts
    pub rebalance_backoff: Duration,

    /// Offsets storage backend. Only `"zookeeper"` is supported; any other
    /// value fails at first use.
    pub offsets_storage: String,

    /// Where to start when a partition has no valid committed offset
    pub auto_offset_reset: AutoOffsetReset,

    /// Whether wildcard subscriptions skip internal topics
    pub exclude_internal_topics: bool,

    /// Partition assignment strategy used during rebalance
    pub partition_assignment_strategy: AssignmentStrategy,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            consumer_id: format!("muster-{}", uuid::Uuid::new_v4()),
            group_id: String::new(),
            zookeeper_connect: Vec::new(),
            zookeeper_timeout: DEFAULT_ZOOKEEPER_TIMEOUT,
            num_consumer_fetchers: DEFAULT_NUM_CONSUMER_FETCHERS,
            fetch_message_max_bytes: DEFAULT_FETCH_MESSAGE_MAX_BYTES,
            queued_max_messages: DEFAULT_QUEUED_MAX_MESSAGES,
            rebalance_max_retries: DEFAULT_REBALANCE_MAX_RETRIES,
            rebalance_backoff: DEFAULT_REBALANCE_BACKOFF,
            offsets_storage: OFFSETS_STORAGE_ZOOKEEPER.to_string(),
            auto_offset_reset: AutoOffsetReset::default(),
            exclude_internal_topics: true,
            partition_assignment_strategy: AssignmentStrategy::default(),
        }
    }
}

impl ConsumerConfig {
    /// Check the configuration for values the consumer cannot run with.
    ///
    /// `offsets_storage` is deliberately not checked here; an unsupported
    /// backend fails at first use instead.
    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        if self.group_id.is_empty() {
            return Err(ConfigError::missing("group_id"));
        }
        if self.consumer_id.is_empty() {
            return Err(ConfigError::missing("consumer_id"));
        }
        if self.zookeeper_connect.is_empty() {
            return Err(ConfigError::missing("zookeeper_connect"));
        }
        if self.num_consumer_fetchers == 0 {
            return Err(ConfigError::invalid_setting(
                "num_consumer_fetchers",
                "must be at least 1",
            ));
        }
        if self.fetch_message_max_bytes <= 0 {
            return Err(ConfigError::invalid_setting(
                "fetch_message_max_bytes",
                "must be positive",
            ));
        }
        if self.queued_max_messages == 0 {
            return Err(ConfigError::invalid_setting(
                "queued_max_messages",
                "must be at least 1",
            ));
        }
        if self.rebalance_max_retries == 0 {
            return Err(ConfigError::invalid_setting(
                "rebalance_max_retries",
                "must be at least 1",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_config() -> ConsumerConfig {
        ConsumerConfig {
            group_id: "test-group".to_string(),
            zookeeper_connect: vec!["localhost:2181".to_string()],
            ..ConsumerConfig::default()
        }
    }

    #[test]
    fn test_defaults() {
        let config = ConsumerConfig::default();
        assert!(config.consumer_id.starts_with("muster-"));
        assert_eq!(config.num_consumer_fetchers, DEFAULT_NUM_CONSUMER_FETCHERS);
        assert_eq!(config.queued_max_messages, DEFAULT_QUEUED_MAX_MESSAGES);
        assert_eq!(config.offsets_storage, OFFSETS_STORAGE_ZOOKEEPER);
        assert_eq!(config.auto_offset_reset, AutoOffsetReset::Largest);
        assert!(config.exclude_internal_topics);
    }

    #[test]
    fn test_validate_ok() {
        assert!(valid_config().validate().is_ok());
    }

    #[test]
    fn test_validate_missing_group() {
        let config = ConsumerConfig {
            group_id: String::new(),
            ..valid_config()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_zero_retries() {
        let config = ConsumerConfig {
            rebalance_max_retries: 0,
            ..valid_config()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_does_not_check_offsets_storage() {
        // An unsupported backend is fatal at first use, not at validation
        let config = ConsumerConfig {
            offsets_storage: "kafka".to_string(),
            ..valid_config()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_auto_offset_reset_from_str() {
        assert_eq!(
            "smallest".parse::<AutoOffsetReset>().unwrap(),
            AutoOffsetReset::Smallest
        );
        assert_eq!(
            "largest".parse::<AutoOffsetReset>().unwrap(),
            AutoOffsetReset::Largest
        );
        assert!("earliest".parse::<AutoOffsetReset>().is_err());
    }
}
