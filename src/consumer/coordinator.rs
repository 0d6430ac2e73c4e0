//! Consumer-group coordination
//!
//! [`Consumer`] is the state machine at the center of the crate. It registers
//! this process in its group, watches the coordination store for membership,
//! topic, and broker changes, and on every relevant change runs the rebalance
//! protocol: recompute the subscription from store state, release current
//! ownership, assign partitions deterministically across the live members,
//! claim the assigned partitions, install starting offsets, and hand the new
//! view to the fetch layer.
//!
//! # Rebalancing
//!
//! Every member runs the same assignment against the same store state, so
//! members converge without talking to each other. Claiming makes the
//! decision visible: a claim lost to another member means the local view was
//! stale, so the attempt releases its partial claims, backs off, and retries
//! against fresh state.
//!
//! # Topic switch
//!
//! A group can migrate to a new subscription without dropping out of the
//! group. One member advertises `switch/<pattern>`; every other member copies
//! the advertisement on its next rebalance; once all members advertise, the
//! sync barrier in the store flips and members re-register with the final
//! pattern. The cutover order is preserved across members by the barrier.
//!
//! # Shutdown
//!
//! `close()` is monotonic: once initiated, no rebalance completes and no new
//! ownership is claimed. Stream workers stop first, then the fetch driver,
//! then the watch loop releases every ownership node and deregisters the
//! consumer. The returned channel fires when all of that has finished.

use crate::config::{AutoOffsetReset, ConsumerConfig, OFFSETS_STORAGE_ZOOKEEPER};
use crate::consumer::assignor::{AssignmentContext, AssignmentStrategy, TopicPartition};
use crate::consumer::fetcher::FetchDriver;
use crate::consumer::registry::{
    PartitionLag, PartitionTopicInfo, RegistryMap, TopicRegistry, OFFSET_END,
};
use crate::consumer::stream::{spawn_stream, BlockQueue, MessageStream, StreamSlot};
use crate::consumer::subscription::{ThreadId, TopicAndThreadId, TopicFilter, TopicSubscription};
use crate::coord::{is_offset_invalid, ConsumerInfo, CoordStore, WatchEvent, INVALID_OFFSET};
use crate::error::{ConsumerError, Result};
use crate::metrics::{record_owned_partitions, record_rebalance, record_rebalance_duration};
use parking_lot::{Mutex as SyncMutex, RwLock};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Backoff after a spurious watch event
const EMPTY_EVENT_BACKOFF: Duration = Duration::from_secs(2);

struct SlotEntry {
    thread_id: ThreadId,
    slot: StreamSlot,
}

struct Shared {
    config: ConsumerConfig,
    coord: Arc<dyn CoordStore>,
    fetcher: Arc<dyn FetchDriver>,
    registry: TopicRegistry,
    /// Serializes every rebalance attempt, watch-driven or direct, and `ack`
    rebalance_lock: Mutex<()>,
    /// Monotonic; once set no rebalance completes and no ownership is claimed
    is_shutting_down: AtomicBool,
    subscribed: AtomicBool,
    slots: RwLock<Vec<SlotEntry>>,
    /// `(topic, thread) -> slot index`, built at stream-creation time
    bindings: RwLock<HashMap<TopicAndThreadId, usize>>,
    /// Last offset written to the store per partition, to skip redundant acks
    checkpointed_offsets: SyncMutex<HashMap<TopicPartition, i64>>,
    unsubscribe_tx: watch::Sender<bool>,
    close_finished_tx: watch::Sender<bool>,
    fatal_tx: watch::Sender<Option<ConsumerError>>,
    watch_task: SyncMutex<Option<JoinHandle<()>>>,
}

/// High-level group-coordinated consumer.
///
/// # Example
///
/// ```rust,no_run
/// use muster::config::ConsumerConfig;
/// use muster::consumer::{Consumer, NoopFetchDriver};
/// use muster::coord::memory::InMemoryCoordStore;
/// use std::collections::HashMap;
/// use std::sync::Arc;
///
/// # async fn run() -> muster::error::Result<()> {
/// let config = ConsumerConfig {
///     group_id: "ingest".to_string(),
///     zookeeper_connect: vec!["zk1:2181".to_string()],
///     ..ConsumerConfig::default()
/// };
/// let coord = Arc::new(InMemoryCoordStore::new());
/// let consumer = Consumer::new(config, coord, Arc::new(NoopFetchDriver))?;
///
/// let mut streams = consumer
///     .create_message_streams(HashMap::from([("events".to_string(), 2)]))
///     .await?;
///
/// for mut stream in streams.remove("events").unwrap() {
///     tokio::spawn(async move {
///         while let Some(batch) = stream.recv().await {
///             for message in batch {
///                 println!("{}/{}@{}", message.topic, message.partition, message.offset);
///             }
///         }
///     });
/// }
/// # Ok(())
/// # }
/// ```
pub struct Consumer {
    shared: Arc<Shared>,
}

impl fmt::Display for Consumer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.shared.config.consumer_id)
    }
}

impl Consumer {
    /// Create a consumer. Fails only on invalid configuration; nothing is
    /// registered in the store until streams are created.
    pub fn new(
        config: ConsumerConfig,
        coord: Arc<dyn CoordStore>,
        fetcher: Arc<dyn FetchDriver>,
    ) -> Result<Self> {
        config.validate()?;
        info!(
            consumer_id = %config.consumer_id,
            group_id = %config.group_id,
            "starting consumer"
        );

        let (unsubscribe_tx, _) = watch::channel(false);
        let (close_finished_tx, _) = watch::channel(false);
        let (fatal_tx, _) = watch::channel(None);

        Ok(Self {
            shared: Arc::new(Shared {
                config,
                coord,
                fetcher,
                registry: TopicRegistry::new(),
                rebalance_lock: Mutex::new(()),
                is_shutting_down: AtomicBool::new(false),
                subscribed: AtomicBool::new(false),
                slots: RwLock::new(Vec::new()),
                bindings: RwLock::new(HashMap::new()),
                checkpointed_offsets: SyncMutex::new(HashMap::new()),
                unsubscribe_tx,
                close_finished_tx,
                fatal_tx,
                watch_task: SyncMutex::new(None),
            }),
        })
    }

    pub fn consumer_id(&self) -> &str {
        &self.shared.config.consumer_id
    }

    pub fn group_id(&self) -> &str {
        &self.shared.config.group_id
    }

    /// Subscribe to an explicit `topic -> stream count` map.
    ///
    /// Allocates one stream per `(topic, threadIndex)`, registers the
    /// consumer in its group, and runs the first rebalance before returning.
    /// May be called once per consumer; later calls are rejected.
    pub async fn create_message_streams(
        &self,
        topic_counts: HashMap<String, usize>,
    ) -> Result<HashMap<String, Vec<MessageStream>>> {
        let shared = &self.shared;
        if shared.is_shutting_down.load(Ordering::SeqCst) {
            return Err(ConsumerError::ShuttingDown);
        }
        if shared.subscribed.swap(true, Ordering::SeqCst) {
            return Err(ConsumerError::AlreadySubscribed);
        }

        let consumer_id = shared.config.consumer_id.clone();
        let mut streams: HashMap<String, Vec<MessageStream>> = HashMap::new();
        {
            let mut slots = shared.slots.write();
            let mut bindings = shared.bindings.write();
            let mut topics: Vec<&String> = topic_counts.keys().collect();
            topics.sort();
            for topic in topics {
                for index in 0..topic_counts[topic] {
                    let thread_id = ThreadId::new(&consumer_id, index);
                    let (slot, stream) = spawn_stream(shared.config.queued_max_messages);
                    bindings.insert(
                        TopicAndThreadId::new(topic.clone(), thread_id.clone()),
                        slots.len(),
                    );
                    slots.push(SlotEntry { thread_id, slot });
                    streams.entry(topic.clone()).or_default().push(stream);
                }
            }
        }

        let subscription = TopicSubscription::Static {
            consumer_id,
            counts: topic_counts,
        };
        shared.register_subscription(&subscription).await?;
        self.start_watch_loop();

        let _guard = shared.rebalance_lock.lock().await;
        shared.rebalance().await?;

        Ok(streams)
    }

    /// Subscribe to every topic matching `filter`, with one stream per
    /// thread. `num_streams` defaults to `num_consumer_fetchers`.
    pub async fn create_message_streams_by_filter(
        &self,
        filter: Arc<dyn TopicFilter>,
        num_streams: Option<usize>,
    ) -> Result<Vec<MessageStream>> {
        let shared = &self.shared;
        if shared.is_shutting_down.load(Ordering::SeqCst) {
            return Err(ConsumerError::ShuttingDown);
        }
        if shared.subscribed.swap(true, Ordering::SeqCst) {
            return Err(ConsumerError::AlreadySubscribed);
        }

        let num_streams = num_streams.unwrap_or(shared.config.num_consumer_fetchers);
        let consumer_id = shared.config.consumer_id.clone();
        let mut streams = Vec::with_capacity(num_streams);
        {
            // Wildcard streams are per thread; the topics a thread ends up
            // serving are decided at rebalance time, so no static bindings
            // are recorded here
            let mut slots = shared.slots.write();
            for index in 0..num_streams {
                let (slot, stream) = spawn_stream(shared.config.queued_max_messages);
                slots.push(SlotEntry {
                    thread_id: ThreadId::new(&consumer_id, index),
                    slot,
                });
                streams.push(stream);
            }
        }

        let subscription = TopicSubscription::Wildcard {
            consumer_id,
            filter,
            num_streams,
            exclude_internal: shared.config.exclude_internal_topics,
        };
        shared.register_subscription(&subscription).await?;
        self.start_watch_loop();

        let _guard = shared.rebalance_lock.lock().await;
        shared.rebalance().await?;

        Ok(streams)
    }

    /// Ask the whole group to migrate to a new subscription.
    ///
    /// Registers a `switch/<desired_pattern>` advertisement and nudges every
    /// member. The local registry does not change here; the next rebalance
    /// observes the switch and the group converges over bounded rounds.
    pub async fn switch_topic(
        &self,
        topic_counts: HashMap<String, usize>,
        desired_pattern: &str,
    ) -> Result<()> {
        let shared = &self.shared;
        if shared.is_shutting_down.load(Ordering::SeqCst) {
            return Err(ConsumerError::ShuttingDown);
        }
        if !shared.subscribed.load(Ordering::SeqCst) {
            return Err(ConsumerError::NoSubscription);
        }
        shared.advertise_switch(topic_counts, desired_pattern).await
    }

    /// Persist a committed offset for an owned partition.
    ///
    /// Serialized with rebalance: an ack for a partition this consumer no
    /// longer owns fails with [`ConsumerError::NotOwner`]. A repeat of the
    /// last committed offset is skipped without touching the store.
    pub async fn ack(&self, offset: i64, topic: &str, partition: i32) -> Result<()> {
        let shared = &self.shared;
        let _guard = shared.rebalance_lock.lock().await;

        let partition_info = shared
            .registry
            .get(topic, partition)
            .ok_or_else(|| ConsumerError::not_owner(topic, partition))?;

        if shared.config.offsets_storage != OFFSETS_STORAGE_ZOOKEEPER {
            return Err(ConsumerError::UnsupportedOffsetStorage(
                shared.config.offsets_storage.clone(),
            ));
        }

        let tp = TopicPartition::new(topic, partition);
        if shared.checkpointed_offsets.lock().get(&tp) == Some(&offset) {
            debug!(partition = %tp, offset, "offset already committed, skipping");
            return Ok(());
        }

        shared
            .coord
            .commit_offset(&shared.config.group_id, topic, partition, offset)
            .await?;
        shared.checkpointed_offsets.lock().insert(tp, offset);
        partition_info.record_consumed(offset);

        debug!(topic, partition, offset, "committed offset");
        Ok(())
    }

    /// Initiate graceful shutdown. Idempotent; the returned channel fires
    /// `true` once every ownership node is released and the consumer is
    /// deregistered.
    pub fn close(&self) -> watch::Receiver<bool> {
        let rx = self.shared.close_finished_tx.subscribe();
        if self.shared.is_shutting_down.swap(true, Ordering::SeqCst) {
            return rx;
        }
        info!(consumer_id = %self.shared.config.consumer_id, "closing consumer");

        let shared = self.shared.clone();
        tokio::spawn(async move {
            debug!("stopping stream workers");
            for entry in shared.slots.read().iter() {
                entry.slot.close();
            }

            debug!("stopping fetch driver");
            if let Err(e) = shared.fetcher.close().await {
                warn!(error = %e, "fetch driver close failed");
            }

            // The send also covers a watch loop that has not reached its
            // select yet; the loop checks the flag before waiting
            let _ = shared.unsubscribe_tx.send(true);
            let task = shared.watch_task.lock().take();
            if let Some(task) = task {
                if let Err(e) = task.await {
                    warn!(error = %e, "watch loop task failed");
                }
            }

            info!("consumer shutdown complete");
            let _ = shared.close_finished_tx.send(true);
        });

        rx
    }

    /// Watch-driven fatal errors (rebalance exhaustion after the retry
    /// budget, unsupported configuration discovered mid-flight). The channel
    /// holds the first fatal error; the watch loop has stopped by then.
    pub fn fatal_errors(&self) -> watch::Receiver<Option<ConsumerError>> {
        self.shared.fatal_tx.subscribe()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shared.is_shutting_down.load(Ordering::SeqCst)
    }

    /// Identity keys of every partition owned after the last rebalance
    pub fn owned_partitions(&self) -> Vec<TopicPartition> {
        self.shared.registry.partitions()
    }

    /// Per-partition info, for fetch-driver implementors and tests
    pub fn partition_info(&self, topic: &str, partition: i32) -> Option<Arc<PartitionTopicInfo>> {
        self.shared.registry.get(topic, partition)
    }

    /// Fetch/consume lag per owned partition
    pub fn lag(&self) -> Vec<PartitionLag> {
        self.shared.registry.lag()
    }

    fn start_watch_loop(&self) {
        if self.shared.is_shutting_down.load(Ordering::SeqCst) {
            return;
        }
        let shared = self.shared.clone();
        let handle = tokio::spawn(run_watch_loop(shared));
        *self.shared.watch_task.lock() = Some(handle);
    }
}

/// Multiplexes the four one-shot watches plus the unsubscribe signal. The
/// only task allowed to initiate watch-driven rebalances.
async fn run_watch_loop(shared: Arc<Shared>) {
    let coord = shared.coord.clone();
    let group = shared.config.group_id.clone();
    let mut unsubscribe_rx = shared.unsubscribe_tx.subscribe();

    // close() may have signalled before this task subscribed
    if *unsubscribe_rx.borrow() {
        shared.finalize_unsubscribe().await;
        return;
    }

    if let Err(e) = coord.ensure_group_paths(&group).await {
        shared.publish_fatal(e);
        return;
    }

    macro_rules! install {
        ($installer:expr) => {
            match $installer.await {
                Ok(handle) => handle,
                Err(e) => {
                    shared.publish_fatal(e);
                    return;
                }
            }
        };
    }

    let mut topics_watch = install!(coord.watch_topics());
    let mut brokers_watch = install!(coord.watch_brokers());
    let mut consumers_watch = install!(coord.watch_consumers_in_group(&group));
    let mut changes_watch = install!(coord.watch_group_changes(&group));
    debug!(group_id = %group, "subscribed for group changes");

    loop {
        tokio::select! {
            event = &mut topics_watch => {
                let event = event.unwrap_or(WatchEvent::Disconnected);
                topics_watch = install!(coord.watch_topics());
                if shared.handle_watch_event("topics", event).await.is_err() {
                    return;
                }
            }
            event = &mut brokers_watch => {
                let event = event.unwrap_or(WatchEvent::Disconnected);
                brokers_watch = install!(coord.watch_brokers());
                if shared.handle_watch_event("brokers", event).await.is_err() {
                    return;
                }
            }
            event = &mut consumers_watch => {
                let event = event.unwrap_or(WatchEvent::Disconnected);
                consumers_watch = install!(coord.watch_consumers_in_group(&group));
                if shared.handle_watch_event("consumers", event).await.is_err() {
                    return;
                }
            }
            event = &mut changes_watch => {
                let event = event.unwrap_or(WatchEvent::Disconnected);
                changes_watch = install!(coord.watch_group_changes(&group));
                if shared.handle_watch_event("group changes", event).await.is_err() {
                    return;
                }
            }
            changed = unsubscribe_rx.changed() => {
                if changed.is_err() || *unsubscribe_rx.borrow() {
                    shared.finalize_unsubscribe().await;
                    return;
                }
            }
        }
    }
}

impl Shared {
    async fn register_subscription(&self, subscription: &TopicSubscription) -> Result<()> {
        let info = ConsumerInfo::new(subscription.subscription_map(), subscription.pattern());
        info!(
            group_id = %self.config.group_id,
            pattern = %info.pattern,
            "registering consumer in group"
        );
        self.coord
            .register_consumer(&self.config.group_id, &self.config.consumer_id, &info)
            .await
    }

    async fn advertise_switch(
        &self,
        topic_counts: HashMap<String, usize>,
        desired_pattern: &str,
    ) -> Result<()> {
        let subscription = TopicSubscription::Switch {
            consumer_id: self.config.consumer_id.clone(),
            counts: topic_counts,
            desired_pattern: desired_pattern.to_string(),
        };
        info!(
            group_id = %self.config.group_id,
            pattern = %subscription.pattern(),
            "advertising topic switch"
        );
        self.register_subscription(&subscription).await?;
        self.coord
            .notify_group(&self.config.group_id, &self.config.consumer_id)
            .await
    }

    fn publish_fatal(&self, error: ConsumerError) {
        error!(error = %error, "consumer hit a fatal error");
        let _ = self.fatal_tx.send(Some(error));
    }

    /// React to one fired watch. `Err` means a fatal was published and the
    /// watch loop must stop.
    async fn handle_watch_event(&self, source: &str, event: WatchEvent) -> Result<()> {
        match event {
            WatchEvent::Disconnected => {
                debug!(source, "watch session ended, reinstalled");
                Ok(())
            }
            WatchEvent::Empty => {
                debug!(source, "spurious watch event, backing off");
                tokio::time::sleep(EMPTY_EVENT_BACKOFF).await;
                Ok(())
            }
            WatchEvent::Changed => {
                debug!(source, "watch fired");
                let _guard = self.rebalance_lock.lock().await;
                match self.rebalance().await {
                    Ok(()) => Ok(()),
                    Err(e) => {
                        self.publish_fatal(e.clone());
                        Err(e)
                    }
                }
            }
        }
    }

    /// Run `try_rebalance` up to the configured retry budget. Must be called
    /// with the rebalance lock held.
    async fn rebalance(&self) -> Result<()> {
        if self.is_shutting_down.load(Ordering::SeqCst) {
            info!(
                consumer_id = %self.config.consumer_id,
                "rebalance triggered during shutdown, ignoring"
            );
            return Ok(());
        }

        let group = &self.config.group_id;
        let strategy = self.config.partition_assignment_strategy;
        let start = Instant::now();
        info!(group_id = %group, consumer_id = %self.config.consumer_id, "rebalance triggered");

        for attempt in 1..=self.config.rebalance_max_retries {
            match self.try_rebalance(strategy).await {
                Ok(true) => {
                    record_rebalance(group, "success");
                    record_rebalance_duration(group, start.elapsed().as_millis() as u64);
                    return Ok(());
                }
                Ok(false) => {
                    warn!(attempt, "rebalance attempt failed, backing off");
                    tokio::time::sleep(self.config.rebalance_backoff).await;
                }
                Err(e) => {
                    record_rebalance(group, "fatal");
                    return Err(e);
                }
            }
        }

        if self.is_shutting_down.load(Ordering::SeqCst) {
            return Ok(());
        }
        record_rebalance(group, "exhausted");
        Err(ConsumerError::RebalanceExhausted {
            retries: self.config.rebalance_max_retries,
        })
    }

    /// One rebalance attempt. `Ok(false)` asks the caller to back off and
    /// retry; `Err` is fatal.
    async fn try_rebalance(&self, strategy: AssignmentStrategy) -> Result<bool> {
        let group = &self.config.group_id;
        let consumer_id = &self.config.consumer_id;

        // Recompute the local subscription from store state so switches and
        // wildcard universe growth are observed
        let own_info = match self.coord.get_consumer_info(group, consumer_id).await {
            Ok(Some(info)) => info,
            Ok(None) => {
                warn!("own registration missing, retrying");
                return Ok(false);
            }
            Err(e) => {
                error!(error = %e, "failed to read own registration");
                return Ok(false);
            }
        };
        let subscription = match TopicSubscription::from_consumer_info(
            consumer_id,
            &own_info,
            self.config.exclude_internal_topics,
        ) {
            Ok(subscription) => subscription,
            Err(e) => {
                error!(error = %e, "failed to reconstruct subscription");
                return Ok(false);
            }
        };
        debug!(pattern = %subscription.pattern(), "recomputed local subscription");

        let brokers = match self.coord.get_all_brokers().await {
            Ok(brokers) => brokers,
            Err(e) => {
                error!(error = %e, "failed to list brokers");
                return Ok(false);
            }
        };

        // Release current ownership. The registry itself stays in place so
        // the fetch layer keeps serving until the new view is installed.
        if let Err(e) = self.release_partition_ownership().await {
            error!(error = %e, "failed to release partition ownership");
            return Ok(false);
        }

        let ctx = match AssignmentContext::build(
            group,
            consumer_id,
            self.config.exclude_internal_topics,
            brokers,
            self.coord.as_ref(),
        )
        .await
        {
            Ok(ctx) => ctx,
            Err(e) => {
                error!(error = %e, "failed to build assignment context");
                return Ok(false);
            }
        };

        if ctx.switch_in_progress {
            info!(group_id = %group, "consumer group is switching topics");
            if !ctx.in_topic_switch {
                // One member published the switch; copy its advertisement and
                // let the next round converge
                if let Err(e) = self
                    .advertise_switch(ctx.desired_counts.clone(), &ctx.desired_pattern)
                    .await
                {
                    error!(error = %e, "failed to join topic switch");
                    return Ok(false);
                }
                return Ok(true);
            }

            if !ctx.switch_in_sync {
                match self.coord.is_group_in_sync(group).await {
                    Ok(true) => {}
                    Ok(false) => {
                        info!("group not in sync yet, waiting");
                        return Ok(true);
                    }
                    Err(e) => {
                        error!(error = %e, "failed to read group sync state");
                        return Ok(false);
                    }
                }
            } else if let Err(e) = self.coord.create_group_sync(group).await {
                error!(error = %e, "failed to create group sync barrier");
                return Ok(false);
            }

            let final_info =
                ConsumerInfo::new(ctx.desired_counts.clone(), ctx.desired_pattern.clone());
            if let Err(e) = self
                .coord
                .register_consumer(group, consumer_id, &final_info)
                .await
            {
                error!(error = %e, "failed to re-register with the desired pattern");
                return Ok(false);
            }
            if let Err(e) = self.coord.notify_group(group, consumer_id).await {
                error!(error = %e, "failed to notify consumer group");
                return Ok(false);
            }
        } else {
            // Best-effort cleanup of switch leftovers
            if let Err(e) = self.coord.delete_group_sync(group).await {
                warn!(error = %e, "failed to delete group sync node");
            }
            if let Err(e) = self.coord.purge_obsolete_notifications(group).await {
                warn!(error = %e, "failed to purge obsolete notifications");
            }
        }

        let decision = strategy.assign(&ctx);
        let mut my_ownership: Vec<(TopicPartition, ThreadId)> = decision
            .into_iter()
            .filter(|(_, thread)| thread.consumer_id == *consumer_id)
            .collect();
        my_ownership.sort_by(|a, b| a.0.cmp(&b.0));

        let partitions: Vec<TopicPartition> =
            my_ownership.iter().map(|(tp, _)| tp.clone()).collect();
        let offsets = match self.fetch_offsets(&partitions).await {
            Ok(offsets) => offsets,
            Err(e @ ConsumerError::UnsupportedOffsetStorage(_)) => return Err(e),
            Err(e) => {
                error!(error = %e, "failed to fetch offsets during rebalance");
                return Ok(false);
            }
        };

        if self.is_shutting_down.load(Ordering::SeqCst) {
            warn!(
                consumer_id = %consumer_id,
                "aborting rebalance, shutdown sequence started"
            );
            return Ok(true);
        }

        let mut next: RegistryMap = RegistryMap::new();
        {
            let mut checkpoints = self.checkpointed_offsets.lock();
            for (tp, thread) in &my_ownership {
                let Some(queue) = self.queue_for(&tp.topic, thread) else {
                    error!(partition = %tp, thread = %thread, "no stream bound for owned partition");
                    return Ok(false);
                };
                let committed = offsets.get(tp).copied().unwrap_or(INVALID_OFFSET);
                let starting = if is_offset_invalid(committed) {
                    match self.config.auto_offset_reset {
                        AutoOffsetReset::Smallest => 0,
                        AutoOffsetReset::Largest => OFFSET_END,
                    }
                } else {
                    committed
                };
                checkpoints.insert(tp.clone(), committed);
                next.entry(tp.topic.clone()).or_default().insert(
                    tp.partition,
                    Arc::new(PartitionTopicInfo::new(
                        tp.topic.clone(),
                        tp.partition,
                        queue,
                        starting,
                        self.config.fetch_message_max_bytes,
                        consumer_id.clone(),
                    )),
                );
            }
        }

        if !self.reflect_ownership(&my_ownership).await {
            return Ok(false);
        }

        self.registry.replace(next);
        record_owned_partitions(group, self.registry.len());
        if let Err(e) = self
            .fetcher
            .start_connections(self.registry.partition_infos())
            .await
        {
            error!(error = %e, "fetch driver failed to pick up the new assignment");
        }

        info!(
            group_id = %group,
            owned = self.registry.len(),
            "rebalance complete"
        );
        Ok(true)
    }

    /// Claim every assigned partition. On any lost or failed claim, release
    /// the partial claims and report failure so the caller retries.
    async fn reflect_ownership(&self, ownership: &[(TopicPartition, ThreadId)]) -> bool {
        let group = &self.config.group_id;
        let mut claimed: Vec<&TopicPartition> = Vec::new();
        let mut all_claimed = true;

        for (tp, thread) in ownership {
            match self
                .coord
                .claim_partition_ownership(group, &tp.topic, tp.partition, thread)
                .await
            {
                Ok(true) => {
                    debug!(partition = %tp, thread = %thread, "claimed partition");
                    claimed.push(tp);
                }
                Ok(false) => {
                    warn!(partition = %tp, "partition already owned by another consumer");
                    all_claimed = false;
                }
                Err(e) => {
                    error!(partition = %tp, error = %e, "failed to claim partition");
                    all_claimed = false;
                }
            }
        }

        if !all_claimed {
            warn!(
                claimed = claimed.len(),
                wanted = ownership.len(),
                "could not claim every partition, releasing partial claims"
            );
            for tp in claimed {
                if let Err(e) = self
                    .coord
                    .delete_partition_ownership(group, &tp.topic, tp.partition)
                    .await
                {
                    warn!(partition = %tp, error = %e, "failed to release partial claim");
                }
            }
        }

        all_claimed
    }

    async fn fetch_offsets(
        &self,
        partitions: &[TopicPartition],
    ) -> Result<HashMap<TopicPartition, i64>> {
        let mut offsets = HashMap::new();
        if partitions.is_empty() {
            return Ok(offsets);
        }
        if self.config.offsets_storage != OFFSETS_STORAGE_ZOOKEEPER {
            return Err(ConsumerError::UnsupportedOffsetStorage(
                self.config.offsets_storage.clone(),
            ));
        }
        for tp in partitions {
            let offset = self
                .coord
                .get_offset(&self.config.group_id, &tp.topic, tp.partition)
                .await?;
            offsets.insert(tp.clone(), offset);
        }
        Ok(offsets)
    }

    async fn release_partition_ownership(&self) -> Result<()> {
        let partitions = self.registry.partitions();
        if partitions.is_empty() {
            return Ok(());
        }
        info!(count = partitions.len(), "releasing partition ownership");
        for tp in partitions {
            self.coord
                .delete_partition_ownership(&self.config.group_id, &tp.topic, tp.partition)
                .await?;
        }
        Ok(())
    }

    /// Block queue for an owned `(topic, thread)`. Static subscriptions have
    /// an exact binding; after a topic switch the new topic falls back to
    /// the slot with the same thread index so stream handles stay stable.
    fn queue_for(&self, topic: &str, thread: &ThreadId) -> Option<BlockQueue> {
        let key = TopicAndThreadId::new(topic, thread.clone());
        if let Some(index) = self.bindings.read().get(&key) {
            return self
                .slots
                .read()
                .get(*index)
                .map(|entry| entry.slot.blocks.clone());
        }
        self.slots
            .read()
            .iter()
            .find(|entry| entry.thread_id.index == thread.index)
            .map(|entry| entry.slot.blocks.clone())
    }

    /// Shutdown tail run by the watch loop: drop every ownership node and
    /// leave the group.
    async fn finalize_unsubscribe(&self) {
        debug!("unsubscribing from group changes");
        if let Err(e) = self.release_partition_ownership().await {
            error!(error = %e, "failed to release ownership during shutdown");
        }
        self.registry.clear();
        if let Err(e) = self
            .coord
            .deregister_consumer(&self.config.group_id, &self.config.consumer_id)
            .await
        {
            error!(error = %e, "failed to deregister consumer");
        }
    }
}
