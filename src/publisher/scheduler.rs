//! Topology discovery and partition worker reconciliation.
//!
//! The scheduler runs as a single task for the publisher's whole lifetime. It
//! owns the generation counter, the worker table and the receiving end of the
//! fault channel; nothing else touches them. Its only shared state is the
//! routing index, which it alone writes.
//!
//! Each round looks up the partition assignments, bumps the generation and
//! reconciles the workers against the new list. The scheduler then waits for
//! a fault from the current generation, and any such fault triggers a full
//! re-discovery. Lookup failures are retried after a fixed delay, with no
//! attempt limit.

use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::topic_manager::TopicManager;
use super::worker::{PartitionFault, PartitionWorker, WorkerContext};
use super::{PublishQueue, QueueIndex};
use crate::broker::{BrokerConnector, DataMessage, Partition, PartitionAssignment, Topic};
use crate::partition_index::{key_position, RING_SIZE};
use crate::Config;

struct WorkerSlot {
    partition: Partition,
    /// `None` while the partition has no leader.
    worker: Option<PartitionWorker>,
}

struct PendingWorker {
    slot: usize,
    assignment: PartitionAssignment,
    queue: Arc<PublishQueue>,
    backlog: Vec<DataMessage>,
}

pub(crate) struct Scheduler {
    topic_manager: TopicManager,
    configure_partition_count: u32,
    queue_capacity: usize,
    retry_delay: Duration,
    index: Arc<QueueIndex>,
    context: Arc<WorkerContext>,
    faults: mpsc::Receiver<PartitionFault>,
    slots: Vec<WorkerSlot>,
    /// Undelivered records whose partition currently has no leader.
    orphans: Vec<DataMessage>,
    generation: u64,
    shutdown: CancellationToken,
}

impl Scheduler {
    pub(crate) fn new(
        config: &Config,
        connector: Arc<dyn BrokerConnector>,
        index: Arc<QueueIndex>,
        shutdown: CancellationToken,
    ) -> Self {
        let topic = config.topic();
        // A topic never has more partitions than ring positions, so no live
        // worker can find the channel full.
        let (fault_tx, faults) = mpsc::channel(RING_SIZE as usize);
        let context = Arc::new(WorkerContext {
            connector: connector.clone(),
            topic: topic.clone(),
            ack_interval: config.publisher.ack_interval,
            faults: fault_tx,
        });

        Self {
            topic_manager: TopicManager::new(connector, config.brokers.clone(), topic),
            configure_partition_count: config.configure_partition_count(),
            queue_capacity: config.publisher.queue_capacity,
            retry_delay: config.lookup_retry_delay(),
            index,
            context,
            faults,
            slots: Vec::new(),
            orphans: Vec::new(),
            generation: 0,
            shutdown,
        }
    }

    fn topic(&self) -> &Topic {
        self.topic_manager.topic()
    }

    /// Runs until shutdown. `ready` fires once, after the first generation
    /// has been reconciled.
    ///
    /// # Errors
    ///
    /// Fails only if the topic cannot be configured on any bootstrap broker.
    pub(crate) async fn run(mut self, ready: oneshot::Sender<()>) -> crate::Result<()> {
        self.topic_manager
            .ensure_topic_exists(self.configure_partition_count)
            .await?;
        info!("start scheduler thread for topic {}", self.topic());

        let mut ready = Some(ready);
        while let Some(assignments) = self.next_assignments().await {
            self.advance(assignments).await;
            if let Some(ready) = ready.take() {
                // The caller may have given up waiting.
                let _ = ready.send(());
            }

            match self.await_current_fault().await {
                Some(fault) => info!("refreshing topology after fault: {}", fault),
                None => break,
            }
        }

        self.stop_all().await;
        Ok(())
    }

    /// Looks up assignments until one succeeds. `None` on shutdown.
    async fn next_assignments(&mut self) -> Option<Vec<PartitionAssignment>> {
        loop {
            info!(
                "lookup partitions gen {} topic {}",
                self.generation + 1,
                self.topic()
            );
            let lookup = tokio::select! {
                _ = self.shutdown.cancelled() => return None,
                lookup = self.topic_manager.lookup_assignments() => lookup,
            };
            match lookup {
                Ok(assignments) => return Some(assignments),
                Err(e) => error!(
                    "lookup topic {}: {}; retrying in {:?}",
                    self.topic(),
                    e,
                    self.retry_delay
                ),
            }

            tokio::select! {
                _ = self.shutdown.cancelled() => return None,
                _ = tokio::time::sleep(self.retry_delay) => {}
            }
        }
    }

    /// Starts a new generation from a freshly fetched assignment list.
    pub(crate) async fn advance(&mut self, assignments: Vec<PartitionAssignment>) {
        self.generation += 1;
        info!(
            generation = self.generation,
            "start generation {} with {} assignments",
            self.generation,
            assignments.len()
        );
        self.reconcile(assignments).await;
    }

    async fn reconcile(&mut self, mut assignments: Vec<PartitionAssignment>) {
        assignments.sort_by_key(|a| a.partition.range_start);
        let generation = self.generation;

        // Workers are only reused positionally when the partition layout is
        // unchanged. Anything else restarts every worker.
        let same_layout = assignments.len() == self.slots.len()
            && assignments
                .iter()
                .zip(&self.slots)
                .all(|(assignment, slot)| assignment.partition == slot.partition);

        let previous = std::mem::take(&mut self.slots);
        let mut slots = Vec::with_capacity(assignments.len());
        let mut retiring = Vec::new();
        let mut pending = Vec::new();
        let mut kept = 0;

        if same_layout {
            for (assignment, slot) in assignments.into_iter().zip(previous) {
                let partition = assignment.partition;
                if let Some(existing) = slot.worker {
                    if existing.assignment().leader_broker == assignment.leader_broker
                        && existing.adopt_generation(generation)
                    {
                        kept += 1;
                        slots.push(WorkerSlot {
                            partition,
                            worker: Some(existing),
                        });
                        continue;
                    }
                    retiring.push(existing);
                }

                if assignment.is_assigned() {
                    let queue = Arc::new(PublishQueue::new(self.queue_capacity));
                    self.index
                        .insert(partition.range_start, partition.range_stop, queue.clone());
                    pending.push(PendingWorker {
                        slot: slots.len(),
                        assignment,
                        queue,
                        backlog: Vec::new(),
                    });
                } else {
                    self.index.remove(partition.range_start, partition.range_stop);
                    debug!("partition {} has no leader, leaving it unrouted", partition);
                }
                slots.push(WorkerSlot {
                    partition,
                    worker: None,
                });
            }
        } else {
            if !previous.is_empty() {
                warn!(
                    "partition layout changed from {} to {} partitions, restarting all workers",
                    previous.len(),
                    assignments.len()
                );
            }
            retiring.extend(previous.into_iter().filter_map(|slot| slot.worker));

            for assignment in assignments {
                let partition = assignment.partition;
                if assignment.is_assigned() {
                    pending.push(PendingWorker {
                        slot: slots.len(),
                        assignment,
                        queue: Arc::new(PublishQueue::new(self.queue_capacity)),
                        backlog: Vec::new(),
                    });
                }
                slots.push(WorkerSlot {
                    partition,
                    worker: None,
                });
            }
            self.index.replace_all(pending.iter().map(|p| {
                (
                    p.assignment.partition.range_start,
                    p.assignment.partition.range_stop,
                    p.queue.clone(),
                )
            }));
        }

        // Replacements are routable before the old queues close, so a
        // publisher racing the swap re-resolves to a live queue.
        let retired = retiring.len();
        for worker in &retiring {
            worker.stop();
        }
        let mut leftovers = std::mem::take(&mut self.orphans);
        for unsent in join_all(retiring.into_iter().map(PartitionWorker::join)).await {
            leftovers.extend(unsent);
        }
        self.route_leftovers(leftovers, &mut pending);

        // Old workers have fully drained, so starting the new ones now keeps
        // per-partition order across the swap.
        let started = pending.len();
        for worker in pending {
            if !worker.backlog.is_empty() {
                info!(
                    "re-sending {} records to partition {}",
                    worker.backlog.len(),
                    worker.assignment.partition
                );
            }
            slots[worker.slot].worker = Some(PartitionWorker::spawn(
                self.context.clone(),
                worker.assignment,
                generation,
                worker.queue,
                worker.backlog,
            ));
        }
        self.slots = slots;

        info!(
            generation,
            kept, started, retired, "reconciled partition workers"
        );
    }

    /// Hands records left behind by retired workers to the new worker of the
    /// partition they hash to. Records without one are held for later.
    fn route_leftovers(&mut self, leftovers: Vec<DataMessage>, pending: &mut [PendingWorker]) {
        for message in leftovers {
            let position = key_position(&message.key);
            match pending
                .iter_mut()
                .find(|p| p.assignment.partition.contains(position))
            {
                Some(worker) => worker.backlog.push(message),
                None => self.orphans.push(message),
            }
        }
        if !self.orphans.is_empty() {
            warn!(
                "holding {} records for partitions without a leader",
                self.orphans.len()
            );
        }
    }

    /// Waits for a fault of the current generation, discarding stale ones.
    /// `None` on shutdown.
    async fn await_current_fault(&mut self) -> Option<PartitionFault> {
        loop {
            let fault = tokio::select! {
                _ = self.shutdown.cancelled() => return None,
                fault = self.faults.recv() => fault?,
            };
            if fault.generation < self.generation {
                debug!("discarding stale fault: {}", fault);
                continue;
            }
            error!("publish to topic {} failed: {}", self.topic(), fault);
            return Some(fault);
        }
    }

    /// Drains every worker. Records a faulted worker could not send get one
    /// more lookup and a last generation of workers to carry them, so a leader
    /// change right before shutdown does not lose them.
    async fn stop_all(&mut self) {
        let mut undelivered = self.retire_all().await;

        if !undelivered.is_empty() {
            info!(
                "re-routing {} unsent records before shutdown",
                undelivered.len()
            );
            match self.topic_manager.lookup_assignments().await {
                Ok(assignments) => {
                    self.orphans = undelivered;
                    self.advance(assignments).await;
                    undelivered = self.retire_all().await;
                }
                Err(e) => warn!("final lookup for topic {} failed: {}", self.topic(), e),
            }
        }
        self.index.clear();

        if !undelivered.is_empty() {
            warn!(
                "{} records could not be delivered before shutdown",
                undelivered.len()
            );
        }
        info!("scheduler stopped at generation {}", self.generation);
    }

    /// Stops and joins every worker. Returns what none of them sent, orphans
    /// included.
    async fn retire_all(&mut self) -> Vec<DataMessage> {
        let workers: Vec<_> = self
            .slots
            .drain(..)
            .filter_map(|slot| slot.worker)
            .collect();
        info!("stopping {} partition workers", workers.len());

        for worker in &workers {
            worker.stop();
        }
        let mut unsent = std::mem::take(&mut self.orphans);
        for leftovers in join_all(workers.into_iter().map(PartitionWorker::join)).await {
            unsent.extend(leftovers);
        }
        unsent
    }
}
