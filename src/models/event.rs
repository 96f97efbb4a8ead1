use std::any::Any;
use std::fmt;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};

use crate::models::proto::command::CmdMsg;

/// The receiving half of a stream of events.
pub type EventRx = mpsc::Receiver<Event>;
/// The sending half of a stream of events.
pub type EventTx = mpsc::Sender<Event>;

/// An event read from, or to be written to, a topic of the log.
#[derive(Debug)]
pub struct Event {
    /// The topic of the event.
    pub topic: String,
    /// The partition of the event, assigned by the log when written.
    pub partition: i32,
    /// The offset of the event within its partition, assigned by the log when written.
    pub offset: u64,
    /// The key of the event, used by the topic's partitioner.
    pub key: Vec<u8>,
    /// The decoded message of the event.
    pub message: Message,
}

impl Event {
    /// Create a new event carrying an application payload, to be written to the given topic.
    pub fn writable<T: Any + Send + Sync>(topic: impl Into<String>, key: impl Into<Vec<u8>>, payload: T) -> Self {
        Self::new(topic, key, Message::Data(Payload::new(payload)))
    }

    /// Create a new event with the given message, to be written to the given topic.
    pub fn new(topic: impl Into<String>, key: impl Into<Vec<u8>>, message: Message) -> Self {
        Self {
            topic: topic.into(),
            partition: 0,
            offset: 0,
            key: key.into(),
            message,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn message(&self) -> &Message {
        &self.message
    }
}

/// The message of an event.
#[derive(Debug)]
pub enum Message {
    /// An application payload, as produced by the topic's decoder.
    Data(Payload),
    /// An entry of a grid's command log.
    Cmd(CmdMsg),
    /// A control event carrying the offset range of a partition, delivered to operator
    /// instances on their state channel before the partition is read.
    MinMaxOffset(MinMaxOffset),
}

/// A decoded application payload.
#[derive(Clone)]
pub struct Payload(Arc<dyn Any + Send + Sync>);

impl Payload {
    pub fn new<T: Any + Send + Sync>(val: T) -> Self {
        Self(Arc::new(val))
    }

    /// Get a reference to the payload if it is of type `T`.
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.0.downcast_ref::<T>()
    }

    pub fn is<T: Any>(&self) -> bool {
        self.0.is::<T>()
    }
}

impl fmt::Debug for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Payload(..)")
    }
}

/// The offset range of a partition about to be read by an operator instance.
///
/// The instance must resolve the range with either `use_min`, to replay everything retained in
/// the partition, or `use_max`, to skip the backlog and read only new events. Dropping this value
/// without resolving it is fatal to the grid.
#[derive(Debug)]
pub struct MinMaxOffset {
    /// The topic of the partition.
    pub topic: String,
    /// The partition.
    pub partition: i32,
    /// The oldest offset retained in the partition.
    pub min: u64,
    /// The next offset to be written to the partition.
    pub max: u64,
    tx: oneshot::Sender<u64>,
}

impl MinMaxOffset {
    pub(crate) fn new(topic: impl Into<String>, partition: i32, min: u64, max: u64) -> (Self, oneshot::Receiver<u64>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                topic: topic.into(),
                partition,
                min,
                max,
                tx,
            },
            rx,
        )
    }

    /// Resolve the range to its minimum, replaying all retained events.
    pub fn use_min(self) {
        let _ = self.tx.send(self.min);
    }

    /// Resolve the range to its maximum, skipping the backlog.
    pub fn use_max(self) {
        let _ = self.tx.send(self.max);
    }
}
