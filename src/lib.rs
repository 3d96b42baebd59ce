pub mod broker;
pub mod config;
pub mod error;
pub mod partition_index;
pub mod publisher;
pub mod queue;

pub use config::Config;
pub use error::{Error, Result};
pub use publisher::TopicPublisher;
