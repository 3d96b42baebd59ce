use crate::broker::Topic;
use crate::partition_index::RING_SIZE;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

const ENV_PREFIX: &str = "MQ_PUBLISHER";

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// Bootstrap broker addresses, tried in order.
    pub brokers: Vec<String>,
    pub topic: TopicConfig,
    #[serde(default)]
    pub publisher: PublisherConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TopicConfig {
    pub namespace: String,
    pub name: String,
    /// Ask the bootstrap brokers to create the topic if it does not exist.
    #[serde(default)]
    pub create: bool,
    #[serde(default = "default_partition_count")]
    pub partition_count: u32,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PublisherConfig {
    /// Records buffered per partition before `publish` applies backpressure.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// Number of records after which the broker acknowledges a stream.
    #[serde(default = "default_ack_interval")]
    pub ack_interval: u32,
    #[serde(default = "default_lookup_retry_delay_ms")]
    pub lookup_retry_delay_ms: u64,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
            ack_interval: default_ack_interval(),
            lookup_retry_delay_ms: default_lookup_retry_delay_ms(),
        }
    }
}

impl Config {
    /// Minimal configuration for a topic; everything else takes its default.
    pub fn new(brokers: Vec<String>, namespace: &str, name: &str) -> Self {
        Self {
            brokers,
            topic: TopicConfig {
                namespace: namespace.to_string(),
                name: name.to_string(),
                create: false,
                partition_count: default_partition_count(),
            },
            publisher: PublisherConfig::default(),
        }
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::load(Some(path.as_ref()))
    }

    /// Loads an optional TOML file, then applies `MQ_PUBLISHER_*` environment
    /// overrides (`__` separates nested keys, `BROKERS` is a comma separated list).
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path));
        }
        let settings = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("brokers")
                    .try_parsing(true),
            )
            .build()?;

        let config: Config = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.brokers.iter().all(|b| b.trim().is_empty()) {
            return Err(Error::NoBootstrapBrokers);
        }
        if self.topic.namespace.is_empty() || self.topic.name.is_empty() {
            return Err(Error::Config(
                "topic namespace and name must not be empty".to_string(),
            ));
        }
        if self.topic.create
            && (self.topic.partition_count == 0 || self.topic.partition_count > RING_SIZE)
        {
            return Err(Error::Config(format!(
                "partition_count must be between 1 and {}, got {}",
                RING_SIZE, self.topic.partition_count
            )));
        }
        if self.publisher.queue_capacity == 0 {
            return Err(Error::Config("queue_capacity must be positive".to_string()));
        }
        if self.publisher.ack_interval == 0 {
            return Err(Error::Config("ack_interval must be positive".to_string()));
        }
        Ok(())
    }

    pub fn topic(&self) -> Topic {
        Topic::new(&self.topic.namespace, &self.topic.name)
    }

    /// Partition count sent with ConfigureTopic. Zero only confirms that the
    /// topic exists.
    pub fn configure_partition_count(&self) -> u32 {
        if self.topic.create {
            self.topic.partition_count
        } else {
            0
        }
    }

    pub fn lookup_retry_delay(&self) -> Duration {
        Duration::from_millis(self.publisher.lookup_retry_delay_ms)
    }
}

fn default_partition_count() -> u32 {
    6
}

fn default_queue_capacity() -> usize {
    1024
}

fn default_ack_interval() -> u32 {
    128
}

fn default_lookup_retry_delay_ms() -> u64 {
    5000
}
