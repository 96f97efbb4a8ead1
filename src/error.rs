//! Grid error abstractions.

use thiserror::Error;

/// Errors related to the configuration of a grid and its operators.
///
/// When returned from the registration API these are recoverable. When detected after
/// `Grid::start`, they indicate that the planner and the registry have diverged and are
/// treated as fatal.
#[derive(Debug, Error)]
pub enum GridError {
    /// An operator with the same name has already been added.
    #[error("operator already added: {0}")]
    AlreadyAdded(String),
    /// An input topic has no registered decoder.
    #[error("topic {0}: no decoder found for topic")]
    NoDecoder(String),
    /// The log failed to report the partitions of a topic.
    #[error("topic {topic}: failed getting partition data: {source}")]
    PartitionDiscovery {
        topic: String,
        #[source]
        source: anyhow::Error,
    },
    /// A topic has more partitions than the parallelism of an operator reading it.
    #[error("topic {topic}: parallelism of operator {name} is {parallelism} which is less than the number of partitions {partitions}")]
    ParallelismTooLow {
        topic: String,
        name: String,
        parallelism: u32,
        partitions: usize,
    },
    /// An operator was declared with a parallelism of zero.
    #[error("operator {0}: parallelism must be at least 1")]
    InvalidParallelism(String),
    /// The grid has already been started.
    #[error("grid has already been started")]
    AlreadyStarted,
    /// An assignment named an operator which was never added.
    #[error("operator does not exist: {0}")]
    UnknownOperator(String),
    /// An assignment named a topic which the operator does not read.
    #[error("operator {name}: not set as reader of: {topic}")]
    NotReader { name: String, topic: String },
    /// An operator emitted an event for a topic which has no registered writer.
    #[error("operator {name}: not set as writer of: {topic}")]
    NotWriter { name: String, topic: String },
    /// An operator did not resolve an offset control event.
    #[error("operator {name}: offset range of {topic}/{partition} was not resolved")]
    UnresolvedOffset { name: String, topic: String, partition: i32 },
    /// An error from the underlying log.
    #[error("log error: {0}")]
    Log(#[source] anyhow::Error),
}

/// Actor definition validation errors.
#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
pub enum ActorError {
    #[error("invalid actor type")]
    InvalidActorType,
    #[error("invalid actor name")]
    InvalidActorName,
    #[error("invalid actor namespace")]
    InvalidActorNamespace,
}

/// A result type where the error is a `GridError`.
pub type GridResult<T> = ::std::result::Result<T, GridError>;
