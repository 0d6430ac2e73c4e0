#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]

//! # Muster
//!
//! Muster is a group-coordinated, high-level consumer client for partitioned
//! log brokers. Consumers sharing a group id divide the partitions of their
//! subscribed topics among themselves, coordinate through a hierarchical
//! metadata store with ephemeral nodes and change notifications, and
//! rebalance automatically when members, topics, or brokers change.
//!
//! ## What this crate is
//!
//! The coordination core: group registration, the store watch loop, the
//! deterministic rebalance protocol with retry and backoff, partition
//! ownership claims, starting-offset installation, stream fan-out with
//! bounded backpressure, a graceful in-group topic-switch protocol, and
//! graceful shutdown. The broker wire protocol and the per-broker fetch
//! loops live behind the [`FetchDriver`](consumer::FetchDriver) seam; the
//! real coordination-store client lives behind
//! [`CoordStore`](coord::CoordStore).
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use muster::config::ConsumerConfig;
//! use muster::consumer::{Consumer, NoopFetchDriver};
//! use muster::coord::memory::InMemoryCoordStore;
//! use std::collections::HashMap;
//! use std::sync::Arc;
//!
//! # async fn run() -> muster::error::Result<()> {
//! let config = ConsumerConfig {
//!     group_id: "ingest".to_string(),
//!     zookeeper_connect: vec!["zk1:2181".to_string()],
//!     ..ConsumerConfig::default()
//! };
//!
//! let coord = Arc::new(InMemoryCoordStore::new());
//! let consumer = Consumer::new(config, coord, Arc::new(NoopFetchDriver))?;
//!
//! // One subscription per consumer: two streams for topic "events"
//! let mut streams = consumer
//!     .create_message_streams(HashMap::from([("events".to_string(), 2)]))
//!     .await?;
//!
//! let mut stream = streams.remove("events").unwrap().remove(0);
//! while let Some(batch) = stream.recv().await {
//!     for message in &batch {
//!         // process message.value
//!     }
//!     let last = batch.last().unwrap();
//!     consumer.ack(last.offset, &last.topic, last.partition).await?;
//! }
//!
//! // Graceful shutdown; the channel fires when every ownership node is gone
//! let mut done = consumer.close();
//! let _ = done.changed().await;
//! # Ok(())
//! # }
//! ```
//!
//! ## Modules
//!
//! - [`consumer`]: the coordinator, assignors, registry, and streams
//! - [`coord`]: the coordination-store gateway and its in-memory test double
//! - [`config`]: consumer configuration
//! - [`error`]: error types and `Result` alias
//! - [`metrics`]: optional Prometheus metrics (behind the `metrics` feature)

pub mod config;
pub mod consumer;
pub mod coord;
pub mod error;
pub mod metrics;

pub use config::{AutoOffsetReset, ConsumerConfig};
pub use consumer::{
    AssignmentStrategy, Blacklist, Consumer, FetchDriver, Message, MessageStream, NoopFetchDriver,
    ThreadId, TopicFilter, TopicPartition, Whitelist,
};
pub use coord::{Broker, ConsumerInfo, CoordStore, INVALID_OFFSET, SWITCH_PATTERN_PREFIX};
pub use error::{ConsumerError, Result};
