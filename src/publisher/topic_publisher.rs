//! Application entry point for publishing to one topic.
//!
//! # Example
//!
//! ```rust
//! use mq_publisher::broker::MemoryCluster;
//! use mq_publisher::{Config, TopicPublisher};
//! use std::sync::Arc;
//!
//! # #[tokio::main]
//! # async fn main() -> mq_publisher::Result<()> {
//! let cluster = MemoryCluster::with_brokers(&["localhost:17777"]);
//! let mut config = Config::new(vec!["localhost:17777".to_string()], "test", "events");
//! config.topic.create = true;
//!
//! let publisher = TopicPublisher::start(config, Arc::new(cluster.clone())).await?;
//! publisher.publish("user-42", "signed up").await?;
//! publisher.shutdown().await?;
//!
//! assert_eq!(cluster.received_count(publisher.topic()), 1);
//! # Ok(())
//! # }
//! ```

use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, instrument, Instrument};

use super::scheduler::Scheduler;
use super::QueueIndex;
use crate::broker::{BrokerConnector, DataMessage, Topic};
use crate::partition_index::key_position;
use crate::queue::QueueClosed;
use crate::{Config, Error, Result};

/// Publishes keyed records to the partitions of a topic.
///
/// Records with the same key always land on the same partition and, from a
/// single caller, in the order they were published. `publish` may be called
/// from any number of tasks at once.
pub struct TopicPublisher {
    topic: Topic,
    index: Arc<QueueIndex>,
    shutdown: CancellationToken,
    scheduler: Mutex<Option<JoinHandle<Result<()>>>>,
}

impl TopicPublisher {
    /// Configures the topic and starts routing.
    ///
    /// Returns once the first set of partition workers has been started.
    ///
    /// # Errors
    ///
    /// Fails on invalid configuration, or if no bootstrap broker could
    /// configure the topic.
    pub async fn start(config: Config, connector: Arc<dyn BrokerConnector>) -> Result<Self> {
        config.validate()?;
        let topic = config.topic();
        let index = Arc::new(QueueIndex::new());
        let shutdown = CancellationToken::new();

        let scheduler = Scheduler::new(&config, connector, index.clone(), shutdown.clone());
        let (ready_tx, ready_rx) = oneshot::channel();
        let span = info_span!("scheduler", topic = %topic);
        let handle = tokio::spawn(scheduler.run(ready_tx).instrument(span));

        if ready_rx.await.is_err() {
            // The scheduler exited before routing anything.
            shutdown.cancel();
            return Err(match handle.await {
                Ok(Err(e)) => e,
                Ok(Ok(())) => Error::Closed,
                Err(e) => Error::TaskFailed(e.to_string()),
            });
        }

        info!("publisher started for topic {}", topic);
        Ok(Self {
            topic,
            index,
            shutdown,
            scheduler: Mutex::new(Some(handle)),
        })
    }

    pub fn topic(&self) -> &Topic {
        &self.topic
    }

    pub fn is_closed(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Publishes one record, waiting while its partition's buffer is full.
    ///
    /// # Errors
    ///
    /// * [`Error::UnassignedPartition`] if no leader currently serves the key
    /// * [`Error::Closed`] once [`shutdown`](Self::shutdown) has begun
    pub async fn publish(&self, key: impl Into<Bytes>, value: impl Into<Bytes>) -> Result<()> {
        let mut message = DataMessage::new(key, value);
        let position = key_position(&message.key);

        loop {
            if self.is_closed() {
                return Err(Error::Closed);
            }
            let Some(queue) = self.index.lookup(position) else {
                return Err(if self.is_closed() {
                    Error::Closed
                } else {
                    Error::UnassignedPartition { position }
                });
            };

            match queue.enqueue(message).await {
                Ok(()) => return Ok(()),
                Err(QueueClosed(rejected)) => {
                    // The partition's worker was replaced while we waited; its
                    // successor is already in the index.
                    debug!(position, "partition queue closed, re-routing record");
                    message = rejected;
                    tokio::task::yield_now().await;
                }
            }
        }
    }

    /// Stops routing, drains every partition worker and waits for them.
    ///
    /// Concurrent and later `publish` calls fail with [`Error::Closed`].
    /// Calling it again is a no-op.
    #[instrument(skip(self), fields(topic = %self.topic))]
    pub async fn shutdown(&self) -> Result<()> {
        self.shutdown.cancel();
        let handle = self.scheduler.lock().take();
        let Some(handle) = handle else {
            return Ok(());
        };

        info!("shutting down publisher");
        let result = handle
            .await
            .map_err(|e| Error::TaskFailed(e.to_string()))?;
        info!("publisher shut down");
        result
    }
}

impl Drop for TopicPublisher {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::MemoryCluster;

    const B1: &str = "b1:17777";

    fn config(create: bool) -> Config {
        let mut config = Config::new(vec![B1.to_string()], "test", "facade");
        config.topic.create = create;
        config.topic.partition_count = 3;
        config.publisher.lookup_retry_delay_ms = 10;
        config
    }

    #[tokio::test]
    async fn test_publish_routes_by_key() {
        let cluster = MemoryCluster::with_brokers(&[B1]);
        let publisher = TopicPublisher::start(config(true), Arc::new(cluster.clone()))
            .await
            .unwrap();

        for i in 0..30 {
            publisher.publish("same-key", format!("v{i}")).await.unwrap();
        }
        publisher.shutdown().await.unwrap();

        let received = cluster.received(publisher.topic());
        assert_eq!(received.len(), 1);
        let (partition, messages) = received.iter().next().unwrap();
        assert!(partition.contains(key_position(b"same-key")));
        let values: Vec<_> = messages.iter().map(|m| m.value.clone()).collect();
        let expected: Vec<_> = (0..30).map(|i| format!("v{i}")).collect();
        assert_eq!(values, expected);
    }

    #[tokio::test]
    async fn test_start_fails_for_missing_topic() {
        let cluster = MemoryCluster::with_brokers(&[B1]);
        let result = TopicPublisher::start(config(false), Arc::new(cluster)).await;
        assert!(matches!(result, Err(Error::TopicConfiguration { .. })));
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let cluster = MemoryCluster::with_brokers(&[B1]);
        let mut config = config(true);
        config.brokers.clear();
        let result = TopicPublisher::start(config, Arc::new(cluster)).await;
        assert!(matches!(result, Err(Error::NoBootstrapBrokers)));
    }

    #[tokio::test]
    async fn test_shutdown_is_idempotent() {
        let cluster = MemoryCluster::with_brokers(&[B1]);
        let publisher = TopicPublisher::start(config(true), Arc::new(cluster))
            .await
            .unwrap();
        publisher.shutdown().await.unwrap();
        publisher.shutdown().await.unwrap();
        assert!(publisher.is_closed());
        assert!(matches!(
            publisher.publish("k", "v").await,
            Err(Error::Closed)
        ));
    }
}
