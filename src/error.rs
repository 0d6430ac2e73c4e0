//! Error types for muster
//!
//! This module defines the error taxonomy used throughout the crate. Transient
//! coordination-store faults are represented as [`CoordError`] and recovered
//! inside the rebalance loop; only configuration problems and exhausted-retry
//! conditions escape to the caller.

use thiserror::Error;

/// Result type alias for muster operations
pub type Result<T> = std::result::Result<T, ConsumerError>;

/// Structured coordination-store error domain
#[derive(Debug, Error, Clone)]
pub enum CoordError {
    #[error("{operation}: {detail}")]
    Operation { operation: String, detail: String },
    #[error("node not found: {0}")]
    NodeNotFound(String),
    #[error("session expired")]
    SessionExpired,
    #[error("{0}")]
    Message(String),
}

impl CoordError {
    pub fn operation(operation: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::Operation {
            operation: operation.into(),
            detail: detail.into(),
        }
    }

    pub fn node_not_found(path: impl Into<String>) -> Self {
        Self::NodeNotFound(path.into())
    }
}

impl From<String> for CoordError {
    fn from(value: String) -> Self {
        Self::Message(value)
    }
}

impl From<&str> for CoordError {
    fn from(value: &str) -> Self {
        Self::Message(value.to_string())
    }
}

/// Structured configuration error domain
#[derive(Debug, Error, Clone)]
pub enum ConfigError {
    #[error("{setting}: {reason}")]
    InvalidSetting { setting: String, reason: String },
    #[error("missing {0}")]
    Missing(String),
    #[error("{0}")]
    Message(String),
}

impl ConfigError {
    pub fn invalid_setting(setting: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidSetting {
            setting: setting.into(),
            reason: reason.into(),
        }
    }

    pub fn missing(setting: impl Into<String>) -> Self {
        Self::Missing(setting.into())
    }
}

impl From<String> for ConfigError {
    fn from(value: String) -> Self {
        Self::Message(value)
    }
}

impl From<&str> for ConfigError {
    fn from(value: &str) -> Self {
        Self::Message(value.to_string())
    }
}

/// Top-level error type for the consumer
#[derive(Debug, Error, Clone)]
pub enum ConsumerError {
    /// Coordination-store fault; retried inside the rebalance loop
    #[error("coordination store error: {0}")]
    Coord(#[from] CoordError),

    /// Invalid or missing configuration
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// An offset was acked for a partition this consumer does not own
    #[error("not the owner of {topic}/{partition}")]
    NotOwner { topic: String, partition: i32 },

    /// `offsets_storage` names a backend the consumer does not support
    #[error("offsets storage '{0}' is not supported")]
    UnsupportedOffsetStorage(String),

    /// All rebalance attempts failed; the group state never converged
    #[error("failed to rebalance after {retries} retries")]
    RebalanceExhausted { retries: u32 },

    /// Message streams were already created for this consumer
    #[error("message streams were already created for this consumer")]
    AlreadySubscribed,

    /// The operation requires an active subscription
    #[error("consumer has no active subscription")]
    NoSubscription,

    /// The consumer is shutting down
    #[error("consumer is shutting down")]
    ShuttingDown,
}

impl ConsumerError {
    pub fn not_owner(topic: impl Into<String>, partition: i32) -> Self {
        Self::NotOwner {
            topic: topic.into(),
            partition,
        }
    }
}
