//! Error types and result handling for mq-publisher.
//!
//! This module defines the main error type [`Error`] and a convenience
//! [`Result`] type alias used throughout the crate.
//!
//! Only two kinds of error ever reach application code through the publisher:
//! a failed one-time topic configuration at startup, and operations attempted
//! after shutdown. Everything transport related is recovered internally by
//! re-discovering the topology.
//!
//! # Example
//!
//! ```rust
//! use mq_publisher::{Error, Result};
//!
//! fn route(position: u32) -> Result<()> {
//!     Err(Error::UnassignedPartition { position })
//! }
//!
//! match route(17) {
//!     Ok(()) => println!("Routed"),
//!     Err(Error::UnassignedPartition { position }) => eprintln!("No leader for {}", position),
//!     Err(e) => eprintln!("Other error: {}", e),
//! }
//! ```

use thiserror::Error;

/// The main error type for mq-publisher operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Invalid configuration values.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Configuration could not be loaded from file or environment.
    #[error("Configuration source error: {0}")]
    ConfigSource(#[from] config::ConfigError),

    /// The bootstrap broker list is empty.
    #[error("No bootstrap brokers configured")]
    NoBootstrapBrokers,

    /// A broker could not be reached.
    #[error("Connection error: {0}")]
    Connection(String),

    /// The publish stream failed while sending or receiving frames.
    #[error("Transport error: {0}")]
    Transport(String),

    /// The broker answered a request with an error.
    #[error("Broker error: {0}")]
    Broker(String),

    /// The leader refused the publish stream initialization.
    #[error("Init rejected by {broker}: {message}")]
    InitRejected {
        /// Address of the broker that rejected the stream
        broker: String,
        /// Error string carried by the init acknowledgment
        message: String,
    },

    /// A lookup succeeded but returned no partition assignments.
    #[error("No broker partition assignments")]
    NoAssignments,

    /// Topic creation or confirmation failed on every bootstrap broker.
    #[error("Configure topic {topic}: {message}")]
    TopicConfiguration {
        /// The topic as `namespace/name`
        topic: String,
        /// The last broker error
        message: String,
    },

    /// No partition worker currently covers this ring position.
    #[error("No leader assigned for partition covering position {position}")]
    UnassignedPartition {
        /// Ring position derived from the record key
        position: u32,
    },

    /// The publisher has been shut down.
    #[error("Publisher is closed")]
    Closed,

    /// A background task panicked or was aborted.
    #[error("Task failed: {0}")]
    TaskFailed(String),
}

/// A convenient Result type alias for mq-publisher operations.
///
/// This is equivalent to `std::result::Result<T, mq_publisher::Error>`.
pub type Result<T> = std::result::Result<T, Error>;
