use crate::broker::{BrokerConnector, PartitionAssignment, Topic};
use crate::{Error, Result};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// Talks to the bootstrap brokers on behalf of one topic.
///
/// Every call tries the configured addresses in order and returns the first
/// success.
pub struct TopicManager {
    connector: Arc<dyn BrokerConnector>,
    bootstrap_brokers: Vec<String>,
    topic: Topic,
}

impl TopicManager {
    pub fn new(
        connector: Arc<dyn BrokerConnector>,
        bootstrap_brokers: Vec<String>,
        topic: Topic,
    ) -> Self {
        Self {
            connector,
            bootstrap_brokers,
            topic,
        }
    }

    pub fn topic(&self) -> &Topic {
        &self.topic
    }

    /// Creates the topic with `partition_count` partitions, or confirms it
    /// exists when the count is zero.
    #[instrument(skip(self), fields(topic = %self.topic))]
    pub async fn ensure_topic_exists(&self, partition_count: u32) -> Result<()> {
        if self.bootstrap_brokers.is_empty() {
            return Err(Error::NoBootstrapBrokers);
        }

        let mut last_error = None;
        for broker in &self.bootstrap_brokers {
            let attempt = async {
                let client = self.connector.connect(broker).await?;
                client.configure_topic(&self.topic, partition_count).await
            };
            match attempt.await {
                Ok(()) => {
                    info!("Topic '{}' configured via {}", self.topic, broker);
                    return Ok(());
                }
                Err(e) => {
                    warn!("Failed to configure topic '{}' via {}: {}", self.topic, broker, e);
                    last_error = Some(e);
                }
            }
        }

        Err(Error::TopicConfiguration {
            topic: self.topic.to_string(),
            message: last_error.map(|e| e.to_string()).unwrap_or_default(),
        })
    }

    /// Fetches the partition assignments from the first broker that returns a
    /// non-empty list.
    #[instrument(skip(self), fields(topic = %self.topic))]
    pub async fn lookup_assignments(&self) -> Result<Vec<PartitionAssignment>> {
        if self.bootstrap_brokers.is_empty() {
            return Err(Error::NoBootstrapBrokers);
        }

        let mut last_error = Error::NoAssignments;
        for broker in &self.bootstrap_brokers {
            let attempt = async {
                let client = self.connector.connect(broker).await?;
                client.lookup_partition_assignments(&self.topic).await
            };
            match attempt.await {
                Ok(assignments) if !assignments.is_empty() => {
                    debug!("Lookup via {} returned {} assignments", broker, assignments.len());
                    return Ok(assignments);
                }
                Ok(_) => {
                    warn!("Lookup via {} returned no assignments", broker);
                    last_error = Error::NoAssignments;
                }
                Err(e) => {
                    warn!("Lookup via {} failed: {}", broker, e);
                    last_error = e;
                }
            }
        }

        Err(last_error)
    }
}
