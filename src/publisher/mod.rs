mod scheduler;
pub mod topic_manager;
pub mod topic_publisher;
pub mod worker;

use crate::broker::DataMessage;
use crate::partition_index::PartitionRangeIndex;
use crate::queue::BufferedQueue;
use std::sync::Arc;

/// Per-partition buffer between `publish` callers and a worker.
pub(crate) type PublishQueue = BufferedQueue<DataMessage>;

/// Ring position to the queue of the worker serving it.
pub(crate) type QueueIndex = PartitionRangeIndex<Arc<PublishQueue>>;

pub use topic_manager::TopicManager;
pub use topic_publisher::TopicPublisher;
pub use worker::{PartitionFault, WorkerState};
