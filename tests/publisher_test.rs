mod common;

use common::*;
use mq_publisher::broker::{BrokerConnector, MemoryCluster, Topic};
use mq_publisher::partition_index::key_position;
use mq_publisher::{Error, TopicPublisher};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;

/// Asserts that within every partition each producer's sequence numbers only
/// grow. Values look like `p{producer}-{seq}`.
fn assert_producer_order(partitions: &[Vec<String>]) {
    for values in partitions {
        let mut last: HashMap<&str, u64> = HashMap::new();
        for value in values {
            let (producer, seq) = value.split_once('-').unwrap();
            let seq: u64 = seq.parse().unwrap();
            if let Some(previous) = last.insert(producer, seq) {
                assert!(previous < seq, "{} sent {} after {}", producer, seq, previous);
            }
        }
    }
}

#[tokio::test]
async fn test_concurrent_producers_deliver_everything_in_order() {
    init_tracing();
    let cluster = MemoryCluster::with_brokers(&BROKERS);
    let config = get_test_config("concurrent", 6);
    let topic = config.topic();
    let publisher = start_publisher(&cluster, config).await;

    let producers: Vec<_> = (0..4)
        .map(|producer| {
            let publisher = publisher.clone();
            tokio::spawn(async move {
                for seq in 0..250 {
                    publisher
                        .publish(format!("key-{producer}-{}", seq % 17), format!("p{producer}-{seq}"))
                        .await?;
                }
                Ok::<_, Error>(())
            })
        })
        .collect();
    for producer in producers {
        producer.await.unwrap().unwrap();
    }
    publisher.shutdown().await.unwrap();

    assert_eq!(cluster.received_count(&topic), 1000);
    let partitions = received_values(&cluster, &topic);
    assert_eq!(partitions.len(), 6);
    assert_producer_order(&partitions);
}

#[tokio::test]
async fn test_same_key_lands_on_one_partition() {
    let cluster = MemoryCluster::with_brokers(&BROKERS);
    let config = get_test_config("same_key", 6);
    let topic = config.topic();
    let publisher = start_publisher(&cluster, config).await;

    for seq in 0..50 {
        publisher.publish("sticky", format!("p0-{seq}")).await.unwrap();
    }
    publisher.shutdown().await.unwrap();

    let received = cluster.received(&topic);
    let (partition, messages) = received.iter().next().unwrap();
    assert_eq!(received.len(), 1);
    assert!(partition.contains(key_position(b"sticky")));
    assert_eq!(messages.len(), 50);
}

#[tokio::test]
async fn test_bootstrap_skips_unreachable_broker() {
    let cluster = MemoryCluster::with_brokers(&BROKERS);
    cluster.kill_broker(BROKERS[0]);
    let mut config = get_test_config("bootstrap", 3);
    config.brokers = vec!["nowhere:17777".to_string(), BROKERS[0].to_string(), BROKERS[1].to_string()];
    let topic = config.topic();
    let publisher = start_publisher(&cluster, config).await;

    publisher.publish("k", "v").await.unwrap();
    publisher.shutdown().await.unwrap();
    assert_eq!(cluster.received_count(&topic), 1);
    assert!(cluster
        .assignments(&topic)
        .iter()
        .all(|a| a.leader_broker != BROKERS[0]));
}

#[tokio::test]
async fn test_start_fails_when_topic_cannot_be_configured() {
    let cluster = MemoryCluster::with_brokers(&BROKERS);
    for broker in BROKERS {
        cluster.kill_broker(broker);
    }
    let config = get_test_config("unconfigurable", 3);
    let result = TopicPublisher::start(config, Arc::new(cluster)).await;
    assert!(matches!(result, Err(Error::TopicConfiguration { .. })));
}

#[tokio::test]
async fn test_publish_after_shutdown_is_closed() {
    let cluster = MemoryCluster::with_brokers(&BROKERS);
    let publisher = start_publisher(&cluster, get_test_config("after_shutdown", 2)).await;
    publisher.shutdown().await.unwrap();

    assert!(matches!(publisher.publish("k", "v").await, Err(Error::Closed)));
}

#[tokio::test]
async fn test_blocked_publishers_released_by_shutdown() {
    init_tracing();
    let cluster = MemoryCluster::with_brokers(&BROKERS);
    let mut config = get_test_config("blocked", 1);
    config.publisher.queue_capacity = 4;
    let topic = config.topic();
    let publisher = start_publisher(&cluster, config).await;

    let leader = cluster.assignments(&topic)[0].leader_broker.clone();
    cluster.pause_broker(&leader);
    for seq in 0..4 {
        publisher.publish("k", format!("p0-{seq}")).await.unwrap();
    }

    // The worker holds at most one record in flight, so at least two of
    // these stay blocked on the full queue.
    let blocked: Vec<_> = (0..3)
        .map(|i| {
            let publisher = publisher.clone();
            tokio::spawn(async move { publisher.publish("k", format!("p{}-0", i + 1)).await })
        })
        .collect();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let shutdown = {
        let publisher = publisher.clone();
        tokio::spawn(async move { publisher.shutdown().await })
    };

    let mut accepted = 0;
    let mut closed = 0;
    for handle in blocked {
        match timeout(Duration::from_secs(2), handle).await.unwrap().unwrap() {
            Ok(()) => accepted += 1,
            Err(Error::Closed) => closed += 1,
            Err(e) => panic!("unexpected error: {}", e),
        }
    }
    assert!(closed >= 2, "only {} publishers saw the shutdown", closed);

    cluster.resume_broker(&leader);
    timeout(Duration::from_secs(2), shutdown)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(cluster.received_count(&topic), 4 + accepted);
}

#[tokio::test]
async fn test_unassigned_partition_rejects_publish() {
    let cluster = MemoryCluster::with_brokers(&BROKERS);
    let config = get_test_config("unassigned", 3);
    let topic: Topic = config.topic();
    cluster
        .connect(BROKERS[0])
        .await
        .unwrap()
        .configure_topic(&topic, 3)
        .await
        .unwrap();
    cluster.clear_leader(&topic, 1).unwrap();
    let orphaned = cluster.assignments(&topic)[1].partition;

    let publisher = start_publisher(&cluster, config).await;
    let key = (0..)
        .map(|i| format!("key-{i}"))
        .find(|k| orphaned.contains(key_position(k.as_bytes())))
        .unwrap();
    let served = (0..)
        .map(|i| format!("key-{i}"))
        .find(|k| !orphaned.contains(key_position(k.as_bytes())))
        .unwrap();

    let result = publisher.publish(key.clone(), "v").await;
    assert!(matches!(result, Err(Error::UnassignedPartition { position }) if orphaned.contains(position)));
    publisher.publish(served, "v").await.unwrap();

    publisher.shutdown().await.unwrap();
    assert_eq!(cluster.received_count(&topic), 1);
}
