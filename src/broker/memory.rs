//! In-process broker cluster.
//!
//! [`MemoryCluster`] implements [`BrokerConnector`] entirely in memory, with
//! enough control to exercise the publisher under churn: brokers can be
//! killed (severing their live streams), paused (stalling sends so that
//! backpressure builds up) and revived, and partition leadership can be moved,
//! cleared or re-split. Every record a leader accepts is kept per partition
//! for inspection.
//!
//! # Example
//!
//! ```rust
//! use mq_publisher::broker::{BrokerConnector, MemoryCluster, Topic};
//!
//! # #[tokio::main]
//! # async fn main() -> mq_publisher::Result<()> {
//! let cluster = MemoryCluster::with_brokers(&["b1:17777", "b2:17777"]);
//! let topic = Topic::new("test", "events");
//!
//! let client = cluster.connect("b1:17777").await?;
//! client.configure_topic(&topic, 4).await?;
//! assert_eq!(client.lookup_partition_assignments(&topic).await?.len(), 4);
//! # Ok(())
//! # }
//! ```

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

use super::{
    BrokerClient, BrokerConnector, DataMessage, Partition, PartitionAssignment, PublishInit,
    PublishRequest, PublishResponse, PublishSink, PublishSource, Topic,
};
use crate::{Error, Result};

struct BrokerNode {
    up: bool,
    /// Cancelled when the broker dies; every stream it served fails.
    severed: CancellationToken,
    paused: watch::Sender<bool>,
}

impl BrokerNode {
    fn new() -> Self {
        let (paused, _) = watch::channel(false);
        Self {
            up: true,
            severed: CancellationToken::new(),
            paused,
        }
    }
}

#[derive(Default)]
struct ClusterState {
    brokers: BTreeMap<String, BrokerNode>,
    topics: HashMap<Topic, Vec<PartitionAssignment>>,
    received: HashMap<Topic, BTreeMap<Partition, Vec<DataMessage>>>,
    streams_opened: u64,
    connect_attempts: u64,
    configure_calls: u64,
    lookup_calls: u64,
}

impl ClusterState {
    fn live_broker(&self, address: &str) -> Result<&BrokerNode> {
        match self.brokers.get(address) {
            Some(node) if node.up => Ok(node),
            Some(_) => Err(Error::Connection(format!("broker {} is down", address))),
            None => Err(Error::Connection(format!("unknown broker {}", address))),
        }
    }

    fn up_brokers(&self) -> Vec<String> {
        self.brokers
            .iter()
            .filter(|(_, node)| node.up)
            .map(|(address, _)| address.clone())
            .collect()
    }

    fn assign_round_robin(&self, partitions: Vec<Partition>) -> Result<Vec<PartitionAssignment>> {
        let leaders = self.up_brokers();
        if leaders.is_empty() {
            return Err(Error::Broker("no live brokers to lead partitions".to_string()));
        }
        Ok(partitions
            .into_iter()
            .enumerate()
            .map(|(i, partition)| {
                let leader = &leaders[i % leaders.len()];
                let mut assignment = PartitionAssignment::new(partition, leader);
                assignment.follower_brokers = leaders
                    .iter()
                    .filter(|b| *b != leader)
                    .take(1)
                    .cloned()
                    .collect();
                assignment
            })
            .collect())
    }

    fn assignments_mut(&mut self, topic: &Topic) -> Result<&mut Vec<PartitionAssignment>> {
        self.topics
            .get_mut(topic)
            .ok_or_else(|| Error::Broker(format!("topic {} not found", topic)))
    }
}

/// Shared handle to an in-memory cluster. Clones refer to the same cluster.
#[derive(Clone, Default)]
pub struct MemoryCluster {
    state: Arc<Mutex<ClusterState>>,
}

impl MemoryCluster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_brokers(addresses: &[&str]) -> Self {
        let cluster = Self::new();
        for address in addresses {
            cluster.add_broker(address);
        }
        cluster
    }

    pub fn add_broker(&self, address: &str) {
        self.state
            .lock()
            .brokers
            .entry(address.to_string())
            .or_insert_with(BrokerNode::new);
    }

    /// Marks a broker down and fails every stream it is serving.
    pub fn kill_broker(&self, address: &str) {
        let mut state = self.state.lock();
        if let Some(node) = state.brokers.get_mut(address) {
            node.up = false;
            node.severed.cancel();
            info!(broker = %address, "broker killed");
        }
    }

    pub fn revive_broker(&self, address: &str) {
        let mut state = self.state.lock();
        if let Some(node) = state.brokers.get_mut(address) {
            node.up = true;
            if node.severed.is_cancelled() {
                node.severed = CancellationToken::new();
            }
            info!(broker = %address, "broker revived");
        }
    }

    /// Fails the broker's current streams without taking it down.
    pub fn sever_streams(&self, address: &str) {
        let mut state = self.state.lock();
        if let Some(node) = state.brokers.get_mut(address) {
            node.severed.cancel();
            node.severed = CancellationToken::new();
        }
    }

    /// Stalls data frames sent to this broker until [`resume_broker`](Self::resume_broker).
    pub fn pause_broker(&self, address: &str) {
        if let Some(node) = self.state.lock().brokers.get(address) {
            node.paused.send_replace(true);
        }
    }

    pub fn resume_broker(&self, address: &str) {
        if let Some(node) = self.state.lock().brokers.get(address) {
            node.paused.send_replace(false);
        }
    }

    /// Current assignments of a topic, ordered by range start.
    pub fn assignments(&self, topic: &Topic) -> Vec<PartitionAssignment> {
        self.state
            .lock()
            .topics
            .get(topic)
            .cloned()
            .unwrap_or_default()
    }

    /// Moves leadership of the `index`-th partition.
    pub fn set_leader(&self, topic: &Topic, index: usize, leader: &str) -> Result<()> {
        let mut state = self.state.lock();
        let assignments = state.assignments_mut(topic)?;
        let assignment = assignments
            .get_mut(index)
            .ok_or_else(|| Error::Broker(format!("no partition {} in {}", index, topic)))?;
        assignment.leader_broker = leader.to_string();
        Ok(())
    }

    pub fn clear_leader(&self, topic: &Topic, index: usize) -> Result<()> {
        self.set_leader(topic, index, "")
    }

    /// Hands every partition led by `address` to the remaining live brokers.
    /// Returns the number of partitions moved.
    pub fn fail_over(&self, topic: &Topic, address: &str) -> Result<usize> {
        let mut state = self.state.lock();
        let candidates: Vec<String> = state
            .up_brokers()
            .into_iter()
            .filter(|b| b != address)
            .collect();
        if candidates.is_empty() {
            return Err(Error::Broker("no live brokers to fail over to".to_string()));
        }
        let assignments = state.assignments_mut(topic)?;
        let mut moved = 0;
        for assignment in assignments.iter_mut() {
            if assignment.leader_broker == address {
                assignment.leader_broker = candidates[moved % candidates.len()].clone();
                moved += 1;
            }
        }
        Ok(moved)
    }

    /// Re-splits the topic into `count` partitions with fresh leaders.
    pub fn repartition(&self, topic: &Topic, count: u32) -> Result<()> {
        let mut state = self.state.lock();
        if !state.topics.contains_key(topic) {
            return Err(Error::Broker(format!("topic {} not found", topic)));
        }
        let assignments = state.assign_round_robin(Partition::split_ring(count))?;
        state.topics.insert(topic.clone(), assignments);
        Ok(())
    }

    /// Records accepted per partition, in arrival order.
    pub fn received(&self, topic: &Topic) -> BTreeMap<Partition, Vec<DataMessage>> {
        self.state
            .lock()
            .received
            .get(topic)
            .cloned()
            .unwrap_or_default()
    }

    pub fn received_count(&self, topic: &Topic) -> usize {
        self.state
            .lock()
            .received
            .get(topic)
            .map(|partitions| partitions.values().map(Vec::len).sum())
            .unwrap_or(0)
    }

    pub fn streams_opened(&self) -> u64 {
        self.state.lock().streams_opened
    }

    /// Every dial, including those refused because the broker is down.
    pub fn connect_attempts(&self) -> u64 {
        self.state.lock().connect_attempts
    }

    pub fn configure_calls(&self) -> u64 {
        self.state.lock().configure_calls
    }

    pub fn lookup_calls(&self) -> u64 {
        self.state.lock().lookup_calls
    }
}

#[async_trait]
impl BrokerConnector for MemoryCluster {
    async fn connect(&self, address: &str) -> Result<Box<dyn BrokerClient>> {
        let mut state = self.state.lock();
        state.connect_attempts += 1;
        state.live_broker(address)?;
        drop(state);
        Ok(Box::new(MemoryBrokerClient {
            cluster: self.clone(),
            address: address.to_string(),
        }))
    }
}

struct MemoryBrokerClient {
    cluster: MemoryCluster,
    address: String,
}

#[async_trait]
impl BrokerClient for MemoryBrokerClient {
    #[instrument(skip(self), fields(broker = %self.address))]
    async fn configure_topic(&self, topic: &Topic, partition_count: u32) -> Result<()> {
        let mut state = self.cluster.state.lock();
        state.live_broker(&self.address)?;
        state.configure_calls += 1;

        if state.topics.contains_key(topic) {
            debug!("Topic '{}' already exists", topic);
            return Ok(());
        }
        if partition_count == 0 {
            return Err(Error::Broker(format!("topic {} not found", topic)));
        }

        let assignments = state.assign_round_robin(Partition::split_ring(partition_count))?;
        info!("Created topic '{}' with {} partitions", topic, assignments.len());
        state.topics.insert(topic.clone(), assignments);
        Ok(())
    }

    async fn lookup_partition_assignments(
        &self,
        topic: &Topic,
    ) -> Result<Vec<PartitionAssignment>> {
        let mut state = self.cluster.state.lock();
        state.live_broker(&self.address)?;
        state.lookup_calls += 1;
        state
            .topics
            .get(topic)
            .cloned()
            .ok_or_else(|| Error::Broker(format!("topic {} not found", topic)))
    }

    async fn open_publish_stream(
        &self,
        topic: &Topic,
        partition: &Partition,
    ) -> Result<(Box<dyn PublishSink>, Box<dyn PublishSource>)> {
        let mut state = self.cluster.state.lock();
        let node = state.live_broker(&self.address)?;
        let severed = node.severed.clone();
        let paused = node.paused.subscribe();
        state.streams_opened += 1;

        let (responses, inbox) = mpsc::unbounded_channel();
        let sink = MemorySink {
            cluster: self.cluster.clone(),
            address: self.address.clone(),
            topic: topic.clone(),
            partition: *partition,
            severed: severed.clone(),
            paused,
            responses,
            ack_interval: None,
            accepted: 0,
        };
        let source = MemorySource { inbox, severed };
        Ok((Box::new(sink), Box::new(source)))
    }
}

struct MemorySink {
    cluster: MemoryCluster,
    address: String,
    topic: Topic,
    partition: Partition,
    severed: CancellationToken,
    paused: watch::Receiver<bool>,
    responses: mpsc::UnboundedSender<PublishResponse>,
    ack_interval: Option<u32>,
    accepted: u64,
}

impl MemorySink {
    fn reset_error(&self) -> Error {
        Error::Transport(format!("connection to {} reset", self.address))
    }

    fn init(&mut self, init: PublishInit) -> Result<()> {
        let state = self.cluster.state.lock();
        let leads = state
            .topics
            .get(&init.topic)
            .map(|assignments| {
                assignments
                    .iter()
                    .any(|a| a.partition == init.partition && a.leader_broker == self.address)
            })
            .unwrap_or(false);
        drop(state);

        let error = if leads {
            self.ack_interval = Some(init.ack_interval.max(1));
            String::new()
        } else {
            format!(
                "broker {} does not lead {} partition {}",
                self.address, init.topic, init.partition
            )
        };
        self.responses
            .send(PublishResponse {
                ack_sequence: 0,
                error,
            })
            .map_err(|_| self.reset_error())
    }

    fn accept(&mut self, message: DataMessage) -> Result<()> {
        let Some(ack_interval) = self.ack_interval else {
            return Err(Error::Transport("data frame before init".to_string()));
        };
        let ack_sequence = message.ts_ns;
        self.cluster
            .state
            .lock()
            .received
            .entry(self.topic.clone())
            .or_default()
            .entry(self.partition)
            .or_default()
            .push(message);

        self.accepted += 1;
        if self.accepted % u64::from(ack_interval) == 0 {
            // The source may already be gone; acks are best effort.
            let _ = self.responses.send(PublishResponse {
                ack_sequence,
                error: String::new(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl PublishSink for MemorySink {
    async fn send(&mut self, request: PublishRequest) -> Result<()> {
        if *self.paused.borrow() {
            let resumed = tokio::select! {
                resumed = self.paused.wait_for(|paused| !*paused) => resumed.is_ok(),
                _ = self.severed.cancelled() => false,
            };
            if !resumed {
                return Err(self.reset_error());
            }
        }
        if self.severed.is_cancelled() {
            return Err(self.reset_error());
        }
        match request {
            PublishRequest::Init(init) => self.init(init),
            PublishRequest::Data(message) => self.accept(message),
        }
    }
}

struct MemorySource {
    inbox: mpsc::UnboundedReceiver<PublishResponse>,
    severed: CancellationToken,
}

#[async_trait]
impl PublishSource for MemorySource {
    async fn recv(&mut self) -> Result<Option<PublishResponse>> {
        tokio::select! {
            biased;
            frame = self.inbox.recv() => Ok(frame),
            _ = self.severed.cancelled() => Err(Error::Transport("connection reset by broker".to_string())),
        }
    }
}
