//! Shared helpers for the integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use muster::config::ConsumerConfig;
use muster::consumer::{FetchDriver, PartitionTopicInfo, TopicPartition};
use muster::error::Result;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Install a log subscriber once so failing tests can be rerun with RUST_LOG
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Config with short rebalance timings so tests converge quickly
pub fn test_config(group: &str, consumer_id: &str) -> ConsumerConfig {
    ConsumerConfig {
        group_id: group.to_string(),
        consumer_id: consumer_id.to_string(),
        zookeeper_connect: vec!["localhost:2181".to_string()],
        rebalance_backoff: Duration::from_millis(25),
        rebalance_max_retries: 8,
        ..ConsumerConfig::default()
    }
}

/// Poll `condition` until it holds or `timeout` elapses
pub async fn wait_until(timeout: Duration, condition: impl Fn() -> bool) -> bool {
    wait_until_async(timeout, || {
        let holds = condition();
        async move { holds }
    })
    .await
}

/// Like [`wait_until`] for conditions that need the store
pub async fn wait_until_async<F, Fut>(timeout: Duration, condition: F) -> bool
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

/// Fetch driver that records every assignment handed over by the coordinator
#[derive(Default)]
pub struct RecordingFetchDriver {
    assignments: Mutex<Vec<Vec<TopicPartition>>>,
    closed: Mutex<bool>,
}

impl RecordingFetchDriver {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Partition sets passed to `start_connections`, in call order
    pub fn assignments(&self) -> Vec<Vec<TopicPartition>> {
        self.assignments.lock().unwrap().clone()
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.lock().unwrap()
    }
}

#[async_trait]
impl FetchDriver for RecordingFetchDriver {
    async fn start_connections(&self, partitions: Vec<Arc<PartitionTopicInfo>>) -> Result<()> {
        let mut keys: Vec<TopicPartition> =
            partitions.iter().map(|p| p.topic_partition()).collect();
        keys.sort();
        self.assignments.lock().unwrap().push(keys);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        *self.closed.lock().unwrap() = true;
        Ok(())
    }
}
