#![allow(dead_code)]

use mq_publisher::broker::{MemoryCluster, Topic};
use mq_publisher::{Config, TopicPublisher};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;

pub const BROKERS: [&str; 3] = ["b1:17777", "b2:17777", "b3:17777"];

pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter("mq_publisher=debug")
        .with_test_writer()
        .try_init()
        .ok();
}

/// Test configuration creating a fresh topic, with a short lookup retry delay.
pub fn get_test_config(name: &str, partitions: u32) -> Config {
    let mut config = Config::new(
        BROKERS.iter().map(|b| b.to_string()).collect(),
        "test",
        &format!("{}_{}", name, std::process::id()),
    );
    config.topic.create = true;
    config.topic.partition_count = partitions;
    config.publisher.queue_capacity = 64;
    config.publisher.ack_interval = 8;
    config.publisher.lookup_retry_delay_ms = 20;
    config
}

pub async fn start_publisher(cluster: &MemoryCluster, config: Config) -> Arc<TopicPublisher> {
    let publisher = TopicPublisher::start(config, Arc::new(cluster.clone()))
        .await
        .expect("publisher should start");
    Arc::new(publisher)
}

/// Polls `check` until it holds, failing the test after `secs` seconds.
pub async fn eventually<F, Fut>(secs: u64, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    timeout(Duration::from_secs(secs), async {
        while !check().await {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

/// Values received for `topic`, grouped per partition in arrival order.
pub fn received_values(cluster: &MemoryCluster, topic: &Topic) -> Vec<Vec<String>> {
    cluster
        .received(topic)
        .into_values()
        .map(|messages| {
            messages
                .into_iter()
                .map(|m| String::from_utf8_lossy(&m.value).into_owned())
                .collect()
        })
        .collect()
}
