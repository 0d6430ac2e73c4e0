//! Consumer-group coordination core
//!
//! This module implements the high-level consumer: subscription policies,
//! deterministic partition assignment, the locally authoritative registry of
//! owned partitions, stream fan-out to user channels, and the coordinator
//! state machine that ties them together.

pub mod assignor;
pub mod coordinator;
pub mod fetcher;
pub mod registry;
pub mod stream;
pub mod subscription;

pub use assignor::{AssignmentContext, AssignmentStrategy, TopicPartition};
pub use coordinator::Consumer;
pub use fetcher::{FetchDriver, NoopFetchDriver};
pub use registry::{PartitionLag, PartitionTopicInfo, TopicRegistry, OFFSET_END};
pub use stream::{
    decode_block, encode_block, BlockQueue, BlockRecord, FetchedBlock, Message, MessageStream,
};
pub use subscription::{
    Blacklist, ThreadId, TopicAndThreadId, TopicFilter, TopicSubscription, Whitelist,
};
