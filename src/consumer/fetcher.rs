//! Fetch-layer seam
//!
//! The broker wire protocol and per-broker fetch loops live outside this
//! crate. The coordinator drives whatever implements [`FetchDriver`]: after
//! every successful rebalance it hands over the full set of owned partition
//! infos, and during shutdown it waits for the driver to stop.

use crate::consumer::registry::PartitionTopicInfo;
use crate::error::Result;
use async_trait::async_trait;
use std::sync::Arc;

/// Interface the coordinator drives through ownership transitions.
///
/// `start_connections` receives the complete post-rebalance view; computing
/// the delta against the previous view is the driver's business. Drivers
/// push [`FetchedBlock`](crate::consumer::stream::FetchedBlock)s into each
/// partition's `blocks` queue and advance its fetched offset.
#[async_trait]
pub trait FetchDriver: Send + Sync {
    /// Install the owned-partition set produced by a rebalance
    async fn start_connections(&self, partitions: Vec<Arc<PartitionTopicInfo>>) -> Result<()>;

    /// Stop all fetch work; resolves when everything has wound down
    async fn close(&self) -> Result<()>;
}

/// Driver that fetches nothing. Useful for tests and for embedded setups
/// where something else feeds the block queues.
#[derive(Debug, Default)]
pub struct NoopFetchDriver;

#[async_trait]
impl FetchDriver for NoopFetchDriver {
    async fn start_connections(&self, _partitions: Vec<Arc<PartitionTopicInfo>>) -> Result<()> {
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}
