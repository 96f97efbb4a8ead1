//! The event log abstraction used by the grid.
//!
//! The grid never talks to a broker directly. Every peer reads & writes partitioned topics
//! through a `ReadWriteLog`, and per-topic codecs translate between stored bytes and the
//! `Message` variants seen by the runtime and by operators.

mod sled_log;

use std::any::Any;
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use arc_swap::ArcSwap;
use futures::stream::{FuturesUnordered, StreamExt};
use serde::{de::DeserializeOwned, Serialize};
use tokio::task::JoinHandle;

use crate::models::{EventRx, Message, Payload};
use crate::utils;

pub use sled_log::SledLog;

/// The handle of the task feeding a stream returned from a read.
///
/// A reader stops cleanly once its stream is dropped. It fails if a stored record can not be
/// read or decoded, in which case its stream closes without delivering any later record.
pub type ReaderHandle = JoinHandle<Result<()>>;

/// A partitioned, append-only log of topics.
///
/// Reads & writes spawn tasks onto the current tokio runtime, and so must be called from within
/// a runtime context.
pub trait ReadWriteLog: Send + Sync + 'static {
    /// Read the given partitions of a topic as a single stream, starting from the newest offset
    /// of each partition.
    fn read(&self, topic: &str, partitions: &[i32]) -> Result<(EventRx, ReaderHandle)>;

    /// Read the given partitions of a topic as a single stream, starting from the paired offsets.
    fn read_from(&self, topic: &str, offsets: &[(i32, u64)]) -> Result<(EventRx, ReaderHandle)>;

    /// Write all events of the given stream to a topic, until the stream closes.
    ///
    /// Each event is encoded with the topic's encoder, and is routed to a partition by applying
    /// the topic's partitioner to the event's key.
    fn write(&self, topic: &str, events: EventRx) -> Result<JoinHandle<Result<()>>>;

    /// The sorted partition IDs of a topic.
    fn partitions(&self, topic: &str) -> Result<Vec<i32>>;

    /// The oldest retained offset & the next offset to be written of a topic partition.
    fn offsets(&self, topic: &str, partition: i32) -> Result<(u64, u64)>;

    /// Register a decoder for the given topics.
    fn add_decoder(&self, decoder: Arc<dyn Decoder>, topics: &[&str]);

    /// Register an encoder for the given topics.
    fn add_encoder(&self, encoder: Arc<dyn Encoder>, topics: &[&str]);

    /// Register a partitioner for the given topics.
    fn add_partitioner(&self, partitioner: Arc<dyn Partitioner>, topics: &[&str]);

    /// All topics which have a registered decoder, sorted.
    fn decoded_topics(&self) -> Vec<String>;

    /// All topics which have a registered encoder, sorted.
    fn encoded_topics(&self) -> Vec<String>;
}

/// Await the given readers, returning the first error encountered.
///
/// The remaining readers are aborted once one of them fails.
pub async fn join_readers(readers: Vec<ReaderHandle>) -> Result<()> {
    let mut readers: FuturesUnordered<ReaderHandle> = readers.into_iter().collect();
    while let Some(res) = readers.next().await {
        if let Err(err) = res.context("error joining log reader").and_then(|res| res) {
            readers.iter().for_each(|reader| reader.abort());
            return Err(err);
        }
    }
    Ok(())
}

/// The error to surface for a stream which closed while its consumer still expected events.
///
/// This is the reader's own error if it failed, and an error naming `what` otherwise.
pub async fn closed_reader_error(reader: &mut ReaderHandle, what: &str) -> anyhow::Error {
    match reader.await.context("error joining log reader").and_then(|res| res) {
        Err(err) => err.context(format!("{} failed", what)),
        Ok(()) => anyhow::anyhow!("{} closed unexpectedly", what),
    }
}

/// A type which decodes stored bytes into a message.
pub trait Decoder: Send + Sync + 'static {
    fn decode(&self, data: &[u8]) -> Result<Message>;
}

/// A type which encodes a message into bytes for storage.
pub trait Encoder: Send + Sync + 'static {
    fn encode(&self, msg: &Message) -> Result<Vec<u8>>;
}

/// A type which routes an event key to one of a topic's partitions.
pub trait Partitioner: Send + Sync + 'static {
    /// Select a partition in `[0, nparts)` for the given key.
    fn partition(&self, key: &[u8], nparts: usize) -> i32;
}

/// A JSON codec for application payloads of type `T`.
pub struct JsonCodec<T>(PhantomData<fn() -> T>);

impl<T> JsonCodec<T> {
    pub fn new() -> Self {
        Self(PhantomData)
    }
}

impl<T> Default for JsonCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Decoder for JsonCodec<T>
where
    T: DeserializeOwned + Any + Send + Sync + 'static,
{
    fn decode(&self, data: &[u8]) -> Result<Message> {
        let val: T = serde_json::from_slice(data).context("error decoding json payload")?;
        Ok(Message::Data(Payload::new(val)))
    }
}

impl<T> Encoder for JsonCodec<T>
where
    T: Serialize + Any + Send + Sync + 'static,
{
    fn encode(&self, msg: &Message) -> Result<Vec<u8>> {
        let val = match msg {
            Message::Data(payload) => match payload.downcast_ref::<T>() {
                Some(val) => val,
                None => bail!("payload is not of type {}", std::any::type_name::<T>()),
            },
            other => bail!("json codec can only encode data payloads, got {:?}", other),
        };
        serde_json::to_vec(val).context("error encoding json payload")
    }
}

/// The protobuf codec of command log entries.
#[derive(Clone, Copy, Debug, Default)]
pub struct CmdMsgCodec;

impl Decoder for CmdMsgCodec {
    fn decode(&self, data: &[u8]) -> Result<Message> {
        Ok(Message::Cmd(utils::decode_model(data)?))
    }
}

impl Encoder for CmdMsgCodec {
    fn encode(&self, msg: &Message) -> Result<Vec<u8>> {
        match msg {
            Message::Cmd(cmd) => utils::encode_model(cmd),
            other => bail!("command codec can only encode command entries, got {:?}", other),
        }
    }
}

/// A partitioner which hashes the event key, used for topics with no registered partitioner.
#[derive(Clone, Copy, Debug, Default)]
pub struct HashPartitioner;

impl Partitioner for HashPartitioner {
    fn partition(&self, key: &[u8], nparts: usize) -> i32 {
        if nparts == 0 {
            return 0;
        }
        (seahash::hash(key) % nparts as u64) as i32
    }
}

/// The per-topic codecs of a log.
///
/// Registrations are rare & reads are on every event, so the maps are swapped atomically.
#[derive(Default)]
pub struct Codecs {
    decoders: ArcSwap<HashMap<String, Arc<dyn Decoder>>>,
    encoders: ArcSwap<HashMap<String, Arc<dyn Encoder>>>,
    partitioners: ArcSwap<HashMap<String, Arc<dyn Partitioner>>>,
}

impl Codecs {
    pub fn add_decoder(&self, decoder: Arc<dyn Decoder>, topics: &[&str]) {
        insert_for_topics(&self.decoders, decoder, topics);
    }

    pub fn add_encoder(&self, encoder: Arc<dyn Encoder>, topics: &[&str]) {
        insert_for_topics(&self.encoders, encoder, topics);
    }

    pub fn add_partitioner(&self, partitioner: Arc<dyn Partitioner>, topics: &[&str]) {
        insert_for_topics(&self.partitioners, partitioner, topics);
    }

    pub fn decoder(&self, topic: &str) -> Option<Arc<dyn Decoder>> {
        self.decoders.load().get(topic).cloned()
    }

    pub fn encoder(&self, topic: &str) -> Option<Arc<dyn Encoder>> {
        self.encoders.load().get(topic).cloned()
    }

    /// The partitioner of the given topic, falling back to `HashPartitioner`.
    pub fn partitioner(&self, topic: &str) -> Arc<dyn Partitioner> {
        self.partitioners
            .load()
            .get(topic)
            .cloned()
            .unwrap_or_else(|| Arc::new(HashPartitioner))
    }

    pub fn decoded_topics(&self) -> Vec<String> {
        sorted_keys(&self.decoders)
    }

    pub fn encoded_topics(&self) -> Vec<String> {
        sorted_keys(&self.encoders)
    }
}

fn insert_for_topics<T: ?Sized>(map: &ArcSwap<HashMap<String, Arc<T>>>, val: Arc<T>, topics: &[&str]) {
    map.rcu(|old| {
        let mut new = HashMap::clone(old);
        for topic in topics {
            new.insert(topic.to_string(), val.clone());
        }
        new
    });
}

fn sorted_keys<T: ?Sized>(map: &ArcSwap<HashMap<String, Arc<T>>>) -> Vec<String> {
    let mut keys: Vec<String> = map.load().keys().cloned().collect();
    keys.sort();
    keys
}
