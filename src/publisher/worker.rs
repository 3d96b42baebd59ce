//! One publish stream per partition leader.
//!
//! A [`PartitionWorker`] moves through
//! `Connecting -> Streaming -> (Draining | Faulted) -> Stopped`. It never
//! retries on its own: a failure is reported to the scheduler tagged with the
//! worker's generation, and the scheduler decides what replaces it.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, trace, warn, Instrument};

use super::PublishQueue;
use crate::broker::{
    BrokerConnector, DataMessage, Partition, PartitionAssignment, PublishInit, PublishRequest,
    PublishSink, PublishSource, Topic,
};
use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Connecting,
    Streaming,
    Draining,
    Faulted,
    Stopped,
}

impl WorkerState {
    pub fn is_live(&self) -> bool {
        matches!(self, WorkerState::Connecting | WorkerState::Streaming)
    }
}

/// A worker failure, delivered to the scheduler.
#[derive(Debug)]
pub struct PartitionFault {
    pub generation: u64,
    pub partition: Partition,
    pub broker: String,
    pub cause: Error,
}

impl fmt::Display for PartitionFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "gen {} partition {} on {}: {}",
            self.generation, self.partition, self.broker, self.cause
        )
    }
}

/// Everything workers of one publisher share.
pub(crate) struct WorkerContext {
    pub(crate) connector: Arc<dyn BrokerConnector>,
    pub(crate) topic: Topic,
    pub(crate) ack_interval: u32,
    pub(crate) faults: mpsc::Sender<PartitionFault>,
}

// Generation and state change together so a fault is either seen by the
// scheduler before it re-tags the worker, or carries the new tag.
struct WorkerStatus {
    generation: u64,
    state: WorkerState,
}

/// Scheduler-side handle to a running partition worker.
pub(crate) struct PartitionWorker {
    assignment: PartitionAssignment,
    queue: Arc<PublishQueue>,
    status: Arc<Mutex<WorkerStatus>>,
    stop: CancellationToken,
    handle: JoinHandle<Vec<DataMessage>>,
}

impl PartitionWorker {
    /// Starts a worker that first sends `backlog`, then everything enqueued on
    /// `queue`.
    pub(crate) fn spawn(
        context: Arc<WorkerContext>,
        assignment: PartitionAssignment,
        generation: u64,
        queue: Arc<PublishQueue>,
        backlog: Vec<DataMessage>,
    ) -> Self {
        let status = Arc::new(Mutex::new(WorkerStatus {
            generation,
            state: WorkerState::Connecting,
        }));
        let stop = CancellationToken::new();
        let span = info_span!(
            "partition_worker",
            topic = %context.topic,
            partition = %assignment.partition,
            leader = %assignment.leader_broker,
        );
        let task = WorkerTask {
            context,
            assignment: assignment.clone(),
            queue: queue.clone(),
            status: status.clone(),
            stop: stop.clone(),
            backlog: backlog.into(),
        };
        let handle = tokio::spawn(task.run().instrument(span));

        Self {
            assignment,
            queue,
            status,
            stop,
            handle,
        }
    }

    pub(crate) fn assignment(&self) -> &PartitionAssignment {
        &self.assignment
    }

    pub(crate) fn state(&self) -> WorkerState {
        self.status.lock().state
    }

    pub(crate) fn generation(&self) -> u64 {
        self.status.lock().generation
    }

    /// Moves a live worker into `generation`. Returns false, leaving the tag
    /// untouched, if the worker already faulted or is stopping.
    pub(crate) fn adopt_generation(&self, generation: u64) -> bool {
        let mut status = self.status.lock();
        if !status.state.is_live() {
            return false;
        }
        status.generation = generation;
        true
    }

    /// Asks the worker to drain its queue and exit.
    pub(crate) fn stop(&self) {
        self.queue.close();
        self.stop.cancel();
    }

    /// Waits for the worker to exit. Returns the records it did not deliver,
    /// oldest first.
    pub(crate) async fn join(self) -> Vec<DataMessage> {
        let mut unsent = match self.handle.await {
            Ok(unsent) => unsent,
            Err(e) => {
                error!(partition = %self.assignment.partition, "partition worker task failed: {}", e);
                Vec::new()
            }
        };
        unsent.extend(self.queue.drain());
        unsent
    }
}

struct WorkerTask {
    context: Arc<WorkerContext>,
    assignment: PartitionAssignment,
    queue: Arc<PublishQueue>,
    status: Arc<Mutex<WorkerStatus>>,
    stop: CancellationToken,
    /// Records to send before the queue: carried over from a previous worker,
    /// or the in-flight record of a failed send.
    backlog: VecDeque<DataMessage>,
}

impl WorkerTask {
    async fn run(mut self) -> Vec<DataMessage> {
        let outcome = self.publish().await;

        let fault_generation = {
            let mut status = self.status.lock();
            if outcome.is_err() && !self.stop.is_cancelled() {
                status.state = WorkerState::Faulted;
                Some(status.generation)
            } else {
                status.state = WorkerState::Stopped;
                None
            }
        };

        match (outcome, fault_generation) {
            (Ok(()), _) => debug!("partition worker stopped"),
            (Err(cause), Some(generation)) => {
                warn!(generation, "partition worker faulted: {}", cause);
                self.report(PartitionFault {
                    generation,
                    partition: self.assignment.partition,
                    broker: self.assignment.leader_broker.clone(),
                    cause,
                })
                .await;
            }
            (Err(cause), None) => debug!("partition worker stopped after error: {}", cause),
        }

        self.backlog.into()
    }

    async fn publish(&mut self) -> Result<()> {
        info!(
            "connecting to {} for topic partition {}",
            self.assignment.leader_broker, self.assignment.partition
        );
        // A stop signal during connection setup is handled by the send duty,
        // which still drains whatever was buffered.
        let (mut sink, source) = self.connect().await?;
        self.set_state(WorkerState::Streaming);
        debug!("publish stream initialized");

        let broken = CancellationToken::new();
        let finished = CancellationToken::new();
        let (forwarded, received) = tokio::join!(
            async {
                let forwarded = self.forward(sink.as_mut(), &broken).await;
                // Ends the stream from our side before the receive duty stops.
                drop(sink);
                finished.cancel();
                forwarded
            },
            receive_acks(source, &broken, &finished),
        );

        match (forwarded, received) {
            (Err(_), Err(cause)) if broken.is_cancelled() => Err(cause),
            (forwarded, _) => forwarded,
        }
    }

    async fn connect(&self) -> Result<(Box<dyn PublishSink>, Box<dyn PublishSource>)> {
        let leader = &self.assignment.leader_broker;
        let client = self.context.connector.connect(leader).await?;
        let (mut sink, mut source) = client
            .open_publish_stream(&self.context.topic, &self.assignment.partition)
            .await?;

        sink.send(PublishRequest::Init(PublishInit {
            topic: self.context.topic.clone(),
            partition: self.assignment.partition,
            ack_interval: self.context.ack_interval,
        }))
        .await?;

        match source.recv().await? {
            Some(ack) if ack.error.is_empty() => Ok((sink, source)),
            Some(ack) => Err(Error::InitRejected {
                broker: leader.clone(),
                message: ack.error,
            }),
            None => Err(Error::Transport(
                "stream closed before init acknowledgment".to_string(),
            )),
        }
    }

    /// Send duty: backlog first, then the queue until it is closed and empty.
    async fn forward(
        &mut self,
        sink: &mut dyn PublishSink,
        broken: &CancellationToken,
    ) -> Result<()> {
        let mut draining = false;
        loop {
            let message = match self.backlog.pop_front() {
                Some(message) => message,
                None => tokio::select! {
                    biased;
                    _ = broken.cancelled() => return Err(stream_broken()),
                    _ = self.stop.cancelled(), if !draining => {
                        draining = true;
                        self.queue.close();
                        self.set_state(WorkerState::Draining);
                        debug!(buffered = self.queue.len(), "draining partition queue");
                        continue;
                    }
                    next = self.queue.dequeue() => match next {
                        Some(message) => message,
                        None => return Ok(()),
                    },
                },
            };

            if broken.is_cancelled() {
                self.backlog.push_front(message);
                return Err(stream_broken());
            }
            if let Err(e) = sink.send(PublishRequest::Data(message.clone())).await {
                self.backlog.push_front(message);
                return Err(e);
            }
        }
    }

    async fn report(&self, fault: PartitionFault) {
        tokio::select! {
            sent = self.context.faults.send(fault) => {
                if sent.is_err() {
                    debug!("scheduler is gone, fault dropped");
                }
            }
            _ = self.stop.cancelled() => debug!("worker stopped before its fault was collected"),
        }
    }

    fn set_state(&self, state: WorkerState) {
        self.status.lock().state = state;
    }
}

fn stream_broken() -> Error {
    Error::Transport("publish stream broken".to_string())
}

/// Receive duty: reads acknowledgments until the stream ends or the send duty
/// finishes. A failure cancels `broken` so the send duty stops too.
async fn receive_acks(
    mut source: Box<dyn PublishSource>,
    broken: &CancellationToken,
    finished: &CancellationToken,
) -> Result<()> {
    let mut acks: u64 = 0;
    loop {
        let frame = tokio::select! {
            _ = finished.cancelled() => return Ok(()),
            frame = source.recv() => frame,
        };
        match frame {
            Ok(Some(ack)) if ack.error.is_empty() => {
                acks += 1;
                trace!(ack_sequence = ack.ack_sequence, acks, "ack received");
            }
            Ok(Some(ack)) => {
                warn!("broker reported stream error: {}", ack.error);
                broken.cancel();
                return Err(Error::Broker(ack.error));
            }
            Ok(None) => {
                debug!(acks, "publish stream closed by broker");
                return Ok(());
            }
            Err(e) => {
                warn!("publish stream receive failed: {}", e);
                broken.cancel();
                return Err(e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::MemoryCluster;
    use std::time::Duration;
    use tokio::time::timeout;

    const B1: &str = "b1:17777";
    const B2: &str = "b2:17777";

    struct Harness {
        cluster: MemoryCluster,
        context: Arc<WorkerContext>,
        faults: mpsc::Receiver<PartitionFault>,
        topic: Topic,
    }

    async fn harness() -> Harness {
        let cluster = MemoryCluster::with_brokers(&[B1, B2]);
        let topic = Topic::new("test", "worker");
        cluster
            .connect(B1)
            .await
            .unwrap()
            .configure_topic(&topic, 2)
            .await
            .unwrap();
        let (tx, faults) = mpsc::channel(8);
        let context = Arc::new(WorkerContext {
            connector: Arc::new(cluster.clone()),
            topic: topic.clone(),
            ack_interval: 4,
            faults: tx,
        });
        Harness {
            cluster,
            context,
            faults,
            topic,
        }
    }

    fn message(i: usize) -> DataMessage {
        DataMessage::new(format!("key-{i}"), format!("value-{i}"))
    }

    async fn wait_for_state(worker: &PartitionWorker, state: WorkerState) {
        timeout(Duration::from_secs(2), async {
            while worker.state() != state {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("worker never reached expected state");
    }

    #[tokio::test]
    async fn test_stop_drains_everything_buffered() {
        let h = harness().await;
        let assignment = h.cluster.assignments(&h.topic)[0].clone();
        let queue = Arc::new(PublishQueue::new(64));
        let worker = PartitionWorker::spawn(h.context.clone(), assignment.clone(), 1, queue.clone(), vec![]);

        for i in 0..50 {
            queue.enqueue(message(i)).await.unwrap();
        }
        worker.stop();
        let unsent = timeout(Duration::from_secs(2), worker.join()).await.unwrap();
        assert!(unsent.is_empty());

        let received = h.cluster.received(&h.topic);
        let values: Vec<_> = received[&assignment.partition]
            .iter()
            .map(|m| m.value.clone())
            .collect();
        let expected: Vec<_> = (0..50).map(|i| message(i).value).collect();
        assert_eq!(values, expected);
    }

    #[tokio::test]
    async fn test_backlog_sent_before_queue() {
        let h = harness().await;
        let assignment = h.cluster.assignments(&h.topic)[1].clone();
        let queue = Arc::new(PublishQueue::new(8));
        queue.enqueue(message(2)).await.unwrap();
        let worker = PartitionWorker::spawn(
            h.context.clone(),
            assignment.clone(),
            1,
            queue,
            vec![message(0), message(1)],
        );
        worker.stop();
        assert!(worker.join().await.is_empty());

        let received = h.cluster.received(&h.topic);
        let keys: Vec<_> = received[&assignment.partition]
            .iter()
            .map(|m| m.key.clone())
            .collect();
        assert_eq!(keys, vec!["key-0", "key-1", "key-2"]);
    }

    #[tokio::test]
    async fn test_connect_failure_reports_fault_with_generation() {
        let mut h = harness().await;
        let assignment = h.cluster.assignments(&h.topic)[0].clone();
        h.cluster.kill_broker(&assignment.leader_broker);

        let queue = Arc::new(PublishQueue::new(8));
        let worker = PartitionWorker::spawn(h.context.clone(), assignment.clone(), 7, queue, vec![]);

        let fault = timeout(Duration::from_secs(2), h.faults.recv()).await.unwrap().unwrap();
        assert_eq!(fault.generation, 7);
        assert_eq!(fault.partition, assignment.partition);
        assert!(matches!(fault.cause, Error::Connection(_)));
        assert_eq!(worker.state(), WorkerState::Faulted);
        assert!(!worker.adopt_generation(8));
        assert_eq!(worker.generation(), 7);
    }

    #[tokio::test]
    async fn test_init_rejection_is_a_fault() {
        let mut h = harness().await;
        let mut assignment = h.cluster.assignments(&h.topic)[0].clone();
        // Point the worker at a broker that does not lead this partition.
        assignment.leader_broker = if assignment.leader_broker == B1 { B2 } else { B1 }.to_string();

        let worker = PartitionWorker::spawn(
            h.context.clone(),
            assignment,
            3,
            Arc::new(PublishQueue::new(8)),
            vec![],
        );
        let fault = timeout(Duration::from_secs(2), h.faults.recv()).await.unwrap().unwrap();
        assert!(matches!(fault.cause, Error::InitRejected { .. }));
        assert!(worker.join().await.is_empty());
    }

    #[tokio::test]
    async fn test_stream_failure_keeps_unsent_records() {
        let mut h = harness().await;
        let assignment = h.cluster.assignments(&h.topic)[0].clone();
        let leader = assignment.leader_broker.clone();
        let queue = Arc::new(PublishQueue::new(16));
        let worker = PartitionWorker::spawn(h.context.clone(), assignment, 2, queue.clone(), vec![]);
        wait_for_state(&worker, WorkerState::Streaming).await;

        h.cluster.pause_broker(&leader);
        for i in 0..5 {
            queue.enqueue(message(i)).await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        h.cluster.kill_broker(&leader);

        let fault = timeout(Duration::from_secs(2), h.faults.recv()).await.unwrap().unwrap();
        assert_eq!(fault.generation, 2);
        assert!(matches!(fault.cause, Error::Transport(_)));

        let unsent = worker.join().await;
        let keys: Vec<_> = unsent.iter().map(|m| m.key.clone()).collect();
        let expected: Vec<_> = (0..5).map(|i| message(i).key).collect();
        assert_eq!(keys, expected);
    }

    #[tokio::test]
    async fn test_adopt_generation_while_live() {
        let h = harness().await;
        let assignment = h.cluster.assignments(&h.topic)[0].clone();
        let worker = PartitionWorker::spawn(
            h.context.clone(),
            assignment,
            1,
            Arc::new(PublishQueue::new(8)),
            vec![],
        );
        wait_for_state(&worker, WorkerState::Streaming).await;

        assert!(worker.adopt_generation(2));
        assert_eq!(worker.generation(), 2);

        worker.stop();
        assert!(worker.join().await.is_empty());
    }

    #[tokio::test]
    async fn test_stopped_worker_does_not_report() {
        let mut h = harness().await;
        let assignment = h.cluster.assignments(&h.topic)[0].clone();
        let leader = assignment.leader_broker.clone();
        let queue = Arc::new(PublishQueue::new(8));
        let worker = PartitionWorker::spawn(h.context.clone(), assignment, 1, queue.clone(), vec![]);
        wait_for_state(&worker, WorkerState::Streaming).await;

        h.cluster.pause_broker(&leader);
        queue.enqueue(message(0)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        worker.stop();
        h.cluster.kill_broker(&leader);

        let unsent = worker.join().await;
        assert_eq!(unsent.len(), 1);
        assert!(h.faults.try_recv().is_err());
    }
}
