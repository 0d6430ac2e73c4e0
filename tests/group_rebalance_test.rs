//! Rebalance protocol integration tests over the in-memory coordination store

mod common;

use common::{init_tracing, test_config, wait_until, RecordingFetchDriver};
use muster::consumer::{Consumer, NoopFetchDriver, TopicPartition, Whitelist, OFFSET_END};
use muster::coord::memory::InMemoryCoordStore;
use muster::coord::{ConsumerInfo, CoordStore};
use muster::error::ConsumerError;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

const CONVERGENCE: Duration = Duration::from_secs(5);

fn consumer(store: &Arc<InMemoryCoordStore>, group: &str, id: &str) -> Consumer {
    init_tracing();
    Consumer::new(test_config(group, id), store.clone(), Arc::new(NoopFetchDriver))
        .expect("valid config")
}

#[tokio::test]
async fn single_consumer_static_assignment() {
    let store = Arc::new(InMemoryCoordStore::new());
    store.create_topic("t", 4);
    let fetcher = RecordingFetchDriver::new();
    let c1 = Consumer::new(test_config("g", "c1"), store.clone(), fetcher.clone()).unwrap();

    let streams = c1
        .create_message_streams(HashMap::from([("t".to_string(), 2)]))
        .await
        .unwrap();

    // Exactly 2 streams for the topic
    assert_eq!(streams.len(), 1);
    assert_eq!(streams["t"].len(), 2);

    // Registry holds all 4 partitions
    let owned = c1.owned_partitions();
    assert_eq!(
        owned,
        (0..4).map(|p| TopicPartition::new("t", p)).collect::<Vec<_>>()
    );

    // All 4 ephemeral owner nodes present, 2 per thread
    let nodes = store.owned_partitions("g");
    assert_eq!(nodes.len(), 4);
    let mut per_thread: HashMap<String, usize> = HashMap::new();
    for (_, _, thread) in &nodes {
        *per_thread.entry(thread.clone()).or_insert(0) += 1;
    }
    assert_eq!(per_thread.len(), 2);
    assert!(per_thread.values().all(|&count| count == 2));

    // No committed offsets yet: largest-reset installs the end sentinel
    assert_eq!(c1.partition_info("t", 0).unwrap().fetched_offset(), OFFSET_END);

    // The fetch driver received the full assignment
    let assignments = fetcher.assignments();
    assert_eq!(assignments.last().unwrap().len(), 4);

    let mut done = c1.close();
    done.changed().await.unwrap();
}

#[tokio::test]
async fn second_consumer_joining_splits_ownership() {
    let store = Arc::new(InMemoryCoordStore::new());
    store.create_topic("t", 4);

    let c1 = consumer(&store, "g", "c1");
    c1.create_message_streams(HashMap::from([("t".to_string(), 2)]))
        .await
        .unwrap();
    assert_eq!(c1.owned_partitions().len(), 4);

    let c2 = consumer(&store, "g", "c2");
    c2.create_message_streams(HashMap::from([("t".to_string(), 2)]))
        .await
        .unwrap();

    // Ownership converges to 2 + 2 with no overlap
    let converged = wait_until(CONVERGENCE, || {
        c1.owned_partitions().len() == 2 && c2.owned_partitions().len() == 2
    })
    .await;
    assert!(converged, "ownership never converged to an even split");

    let mine: HashSet<TopicPartition> = c1.owned_partitions().into_iter().collect();
    let theirs: HashSet<TopicPartition> = c2.owned_partitions().into_iter().collect();
    assert!(mine.is_disjoint(&theirs));
    assert_eq!(mine.union(&theirs).count(), 4);
    assert_eq!(store.owned_partitions("g").len(), 4);

    let mut done1 = c1.close();
    done1.changed().await.unwrap();

    // The survivor takes everything back
    let converged = wait_until(CONVERGENCE, || c2.owned_partitions().len() == 4).await;
    assert!(converged, "survivor never took over released partitions");

    let mut done2 = c2.close();
    done2.changed().await.unwrap();
}

#[tokio::test]
async fn wildcard_consumer_picks_up_created_topic() {
    let store = Arc::new(InMemoryCoordStore::new());
    let c1 = consumer(&store, "g", "c1");

    // No topic matches yet
    let streams = c1
        .create_message_streams_by_filter(Arc::new(Whitelist::new("^events\\..*").unwrap()), Some(2))
        .await
        .unwrap();
    assert_eq!(streams.len(), 2);
    assert!(c1.owned_partitions().is_empty());

    // Topic creation fires the topics watch; the rebalance installs ownership
    store.create_topic("events.orders", 3);
    let converged = wait_until(CONVERGENCE, || c1.owned_partitions().len() == 3).await;
    assert!(converged, "wildcard consumer never picked up the new topic");

    // A non-matching topic changes nothing
    store.create_topic("metrics", 5);
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(c1.owned_partitions().len(), 3);

    let mut done = c1.close();
    done.changed().await.unwrap();
}

#[tokio::test]
async fn contended_claim_is_retried_until_released() {
    let store = Arc::new(InMemoryCoordStore::new());
    store.create_topic("t", 2);

    // A foreign thread already holds partition 0
    let ghost = muster::ThreadId::new("ghost", 0);
    assert!(store
        .claim_partition_ownership("g", "t", 0, &ghost)
        .await
        .unwrap());

    // Release the contended partition while the first rebalance is retrying
    let store_clone = store.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(60)).await;
        store_clone
            .delete_partition_ownership("g", "t", 0)
            .await
            .unwrap();
    });

    let c1 = consumer(&store, "g", "c1");
    c1.create_message_streams(HashMap::from([("t".to_string(), 1)]))
        .await
        .expect("rebalance should succeed once the contended claim is released");

    assert_eq!(c1.owned_partitions().len(), 2);

    let mut done = c1.close();
    done.changed().await.unwrap();
}

#[tokio::test]
async fn closing_during_contended_rebalance_short_circuits() {
    let store = Arc::new(InMemoryCoordStore::new());
    store.create_topic("t", 2);

    // A foreign thread holds partition 0 and never lets go, so the first
    // rebalance keeps retrying until shutdown interrupts it
    let ghost = muster::ThreadId::new("ghost", 0);
    store
        .claim_partition_ownership("g", "t", 0, &ghost)
        .await
        .unwrap();

    let c1 = Arc::new(consumer(&store, "g", "c1"));
    let closer = c1.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(80)).await;
        closer.close();
    });

    // The retry loop observes the shutdown flag and stops without claiming
    c1.create_message_streams(HashMap::from([("t".to_string(), 1)]))
        .await
        .expect("shutdown must short-circuit the rebalance, not fail it");

    let done = c1.close();
    let finished = wait_until(CONVERGENCE, || *done.borrow()).await;
    assert!(finished, "shutdown never completed");

    // Nothing of ours is left behind, only the foreign claim
    let nodes = store.owned_partitions("g");
    assert_eq!(nodes.len(), 1);
    assert_eq!(nodes[0].2, "ghost-0");
    assert!(store.get_consumers_in_group("g").await.unwrap().is_empty());
}

#[tokio::test]
async fn shutdown_releases_every_ephemeral_node() {
    let store = Arc::new(InMemoryCoordStore::new());
    store.create_topic("t", 4);
    let fetcher = RecordingFetchDriver::new();
    let c1 = Consumer::new(test_config("g", "c1"), store.clone(), fetcher.clone()).unwrap();

    c1.create_message_streams(HashMap::from([("t".to_string(), 2)]))
        .await
        .unwrap();
    assert_eq!(store.owned_partitions("g").len(), 4);

    let mut done = c1.close();
    done.changed().await.unwrap();

    assert!(store.owned_partitions("g").is_empty());
    assert!(store.get_consumers_in_group("g").await.unwrap().is_empty());
    assert!(fetcher.is_closed());
    assert!(c1.owned_partitions().is_empty());
}

#[tokio::test]
async fn rebalance_on_unchanged_context_is_a_noop() {
    let store = Arc::new(InMemoryCoordStore::new());
    store.create_topic("t", 4);
    let c1 = consumer(&store, "g", "c1");

    c1.create_message_streams(HashMap::from([("t".to_string(), 2)]))
        .await
        .unwrap();
    let before = c1.owned_partitions();

    // A spurious group notification triggers a rebalance round
    store.notify_group("g", "outsider").await.unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;

    assert_eq!(c1.owned_partitions(), before);
    assert_eq!(store.owned_partitions("g").len(), 4);

    let mut done = c1.close();
    done.changed().await.unwrap();
}

#[tokio::test]
async fn acked_offset_survives_restart() {
    let store = Arc::new(InMemoryCoordStore::new());
    store.create_topic("t", 2);

    let c1 = consumer(&store, "g", "c1");
    c1.create_message_streams(HashMap::from([("t".to_string(), 1)]))
        .await
        .unwrap();

    c1.ack(100, "t", 0).await.unwrap();
    // Repeat of the same offset is deduplicated against the checkpoint
    c1.ack(100, "t", 0).await.unwrap();
    assert_eq!(store.get_offset("g", "t", 0).await.unwrap(), 100);

    let mut done = c1.close();
    done.changed().await.unwrap();

    // A replacement member resumes at the committed offset
    let c2 = consumer(&store, "g", "c2");
    c2.create_message_streams(HashMap::from([("t".to_string(), 1)]))
        .await
        .unwrap();

    let resumed = c2.partition_info("t", 0).unwrap();
    assert_eq!(resumed.fetched_offset(), 100);
    assert_eq!(resumed.consumed_offset(), 100);
    // The never-acked partition starts at the end of the log
    assert_eq!(c2.partition_info("t", 1).unwrap().fetched_offset(), OFFSET_END);

    let mut done = c2.close();
    done.changed().await.unwrap();
}

#[tokio::test]
async fn unresolvable_group_state_surfaces_as_fatal() {
    let store = Arc::new(InMemoryCoordStore::new());
    store.create_topic("t", 2);
    let c1 = Consumer::new(
        muster::config::ConsumerConfig {
            rebalance_max_retries: 3,
            ..test_config("g", "c1")
        },
        store.clone(),
        Arc::new(NoopFetchDriver),
    )
    .unwrap();

    c1.create_message_streams(HashMap::from([("t".to_string(), 1)]))
        .await
        .unwrap();
    let mut fatals = c1.fatal_errors();

    // A member with an unparseable registration makes every context build
    // fail; after the retry budget the watch loop must surface the failure
    let broken = ConsumerInfo::new(HashMap::from([("t".to_string(), 1)]), "mystery");
    store.register_consumer("g", "ghost", &broken).await.unwrap();

    tokio::time::timeout(CONVERGENCE, fatals.changed())
        .await
        .expect("fatal error never surfaced")
        .unwrap();
    assert!(matches!(
        *fatals.borrow(),
        Some(ConsumerError::RebalanceExhausted { .. })
    ));

    let mut done = c1.close();
    done.changed().await.unwrap();
}

#[tokio::test]
async fn session_loss_reinstalls_watches_without_rebalance() {
    let store = Arc::new(InMemoryCoordStore::new());
    store.create_topic("t", 2);
    let c1 = consumer(&store, "g", "c1");

    c1.create_message_streams(HashMap::from([("t".to_string(), 1)]))
        .await
        .unwrap();
    let before = c1.owned_partitions();

    // Disconnect fires every watch; the loop must reinstall and carry on
    store.disconnect();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(c1.owned_partitions(), before);

    // Watches are live again: a membership change still triggers rebalance
    let c2 = consumer(&store, "g", "c2");
    c2.create_message_streams(HashMap::from([("t".to_string(), 1)]))
        .await
        .unwrap();
    let converged = wait_until(CONVERGENCE, || {
        c1.owned_partitions().len() == 1 && c2.owned_partitions().len() == 1
    })
    .await;
    assert!(converged, "watches were not reinstalled after session loss");

    let mut done1 = c1.close();
    done1.changed().await.unwrap();
    let mut done2 = c2.close();
    done2.changed().await.unwrap();
}

#[tokio::test]
async fn crashed_member_partitions_are_taken_over() {
    let store = Arc::new(InMemoryCoordStore::new());
    store.create_topic("t", 4);

    let c1 = consumer(&store, "g", "c1");
    c1.create_message_streams(HashMap::from([("t".to_string(), 2)]))
        .await
        .unwrap();
    let c2 = consumer(&store, "g", "c2");
    c2.create_message_streams(HashMap::from([("t".to_string(), 2)]))
        .await
        .unwrap();

    let converged = wait_until(CONVERGENCE, || {
        c1.owned_partitions().len() == 2 && c2.owned_partitions().len() == 2
    })
    .await;
    assert!(converged);

    // c2's session expires: ephemeral registration and ownership vanish
    store.expire_consumer("g", "c2");

    let converged = wait_until(CONVERGENCE, || c1.owned_partitions().len() == 4).await;
    assert!(converged, "survivor never reclaimed the crashed member's share");

    let mut done = c1.close();
    done.changed().await.unwrap();
}
