//! Broker-facing data model and the transport seam.
//!
//! The publisher never talks to a socket directly. It reaches brokers through
//! a [`BrokerConnector`], which hands out [`BrokerClient`]s for the three calls
//! the publisher needs: topic configuration, partition assignment lookup and
//! opening a publish stream. A publish stream is split into a [`PublishSink`]
//! and a [`PublishSource`] so that sending and receiving can run concurrently.

pub mod memory;


use async_trait::async_trait;
use bytes::Bytes;
use std::fmt;

use crate::partition_index::RING_SIZE;
use crate::Result;

pub use memory::MemoryCluster;

/// A topic, identified by namespace and name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Topic {
    pub namespace: String,
    pub name: String,
}

impl Topic {
    pub fn new(namespace: &str, name: &str) -> Self {
        Self {
            namespace: namespace.to_string(),
            name: name.to_string(),
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Half-open slice `[range_start, range_stop)` of the partition ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Partition {
    pub range_start: u32,
    pub range_stop: u32,
}

impl Partition {
    pub fn new(range_start: u32, range_stop: u32) -> Self {
        Self {
            range_start,
            range_stop,
        }
    }

    /// Splits the ring into `count` contiguous partitions of near-equal width.
    pub fn split_ring(count: u32) -> Vec<Partition> {
        let count = count.clamp(1, RING_SIZE);
        (0..count)
            .map(|i| Partition::new(i * RING_SIZE / count, (i + 1) * RING_SIZE / count))
            .collect()
    }

    pub fn contains(&self, position: u32) -> bool {
        self.range_start <= position && position < self.range_stop
    }
}

impl fmt::Display for Partition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.range_start, self.range_stop)
    }
}

/// A partition together with the brokers currently serving it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionAssignment {
    pub partition: Partition,
    /// Empty when the partition has no leader.
    pub leader_broker: String,
    pub follower_brokers: Vec<String>,
}

impl PartitionAssignment {
    pub fn new(partition: Partition, leader_broker: &str) -> Self {
        Self {
            partition,
            leader_broker: leader_broker.to_string(),
            follower_brokers: Vec::new(),
        }
    }

    pub fn is_assigned(&self) -> bool {
        !self.leader_broker.is_empty()
    }
}

/// One published record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataMessage {
    pub key: Bytes,
    pub value: Bytes,
    pub ts_ns: i64,
}

impl DataMessage {
    pub fn new(key: impl Into<Bytes>, value: impl Into<Bytes>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            ts_ns: chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default(),
        }
    }
}

/// First frame on every publish stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishInit {
    pub topic: Topic,
    pub partition: Partition,
    pub ack_interval: u32,
}

/// Client to broker frames.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishRequest {
    Init(PublishInit),
    Data(DataMessage),
}

/// Broker to client frames. The first one acknowledges the init frame.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublishResponse {
    pub ack_sequence: i64,
    /// Empty on success.
    pub error: String,
}

/// Opens clients to brokers by address.
#[async_trait]
pub trait BrokerConnector: Send + Sync + 'static {
    async fn connect(&self, address: &str) -> Result<Box<dyn BrokerClient>>;
}

/// The RPC surface a broker exposes to publishers.
#[async_trait]
pub trait BrokerClient: Send + Sync {
    /// Creates the topic, or confirms it exists. Idempotent. A partition
    /// count of zero only confirms.
    async fn configure_topic(&self, topic: &Topic, partition_count: u32) -> Result<()>;

    async fn lookup_partition_assignments(&self, topic: &Topic)
        -> Result<Vec<PartitionAssignment>>;

    async fn open_publish_stream(
        &self,
        topic: &Topic,
        partition: &Partition,
    ) -> Result<(Box<dyn PublishSink>, Box<dyn PublishSource>)>;
}

/// Sending half of a publish stream. Dropping it ends the stream.
#[async_trait]
pub trait PublishSink: Send {
    async fn send(&mut self, request: PublishRequest) -> Result<()>;
}

/// Receiving half of a publish stream.
#[async_trait]
pub trait PublishSource: Send {
    /// Next frame from the broker; `Ok(None)` when the stream ended cleanly.
    async fn recv(&mut self) -> Result<Option<PublishResponse>>;
}
