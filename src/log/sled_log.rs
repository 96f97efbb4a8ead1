//! An embedded log backed by sled.
//!
//! Each topic partition is stored in its own tree named `{topic}/{partition}`, with records
//! keyed by their offset. Topic metadata lives in the `topics` tree. This backend is suitable for
//! running any number of peers within a single process, which is how the grid is tested
//! end-to-end.

use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use dashmap::DashMap;
use sled::{Db, Tree};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;

use crate::config::{Config, DEFAULT_READ_BATCH_SIZE};
use crate::log::{join_readers, Codecs, Decoder, Encoder, Partitioner, ReadWriteLog, ReaderHandle};
use crate::models::{Event, EventRx, EventTx, Record};
use crate::utils;

/// The key prefix used for storing partition records.
///
/// NOTE: in order to preserve lexicographical ordering of keys, it is important to always use
/// the `utils::encode_byte_prefix*` methods.
pub const PREFIX_EVENT: &[u8; 1] = b"e";
/// The tree used for storing topic metadata.
const TREE_TOPICS: &str = "topics";

const ERR_ITER_FAILURE: &str = "error iterating partition records";

/// A log backed by an embedded sled database.
#[derive(Clone)]
pub struct SledLog {
    inner: Arc<SledLogInner>,
}

struct SledLogInner {
    db: Db,
    /// Topic name to partition count.
    topics: Tree,
    /// Opened partitions, keyed by `{topic}/{partition}`.
    partitions: DashMap<String, Arc<Partition>>,
    codecs: Codecs,
    /// Capacity of the channels returned from reads.
    capacity: usize,
    /// The maximum number of records fetched from a partition at once.
    batch_size: usize,
}

/// A single partition of a topic.
struct Partition {
    tree: Tree,
    /// The next offset to be written; locked for the duration of an append.
    next_offset: Mutex<u64>,
    /// Signal carrying the partition's high-water mark, observed by tailing readers.
    signal: watch::Sender<u64>,
}

impl SledLog {
    /// Open the log stored under the configured data path.
    pub fn open(config: &Config) -> Result<Self> {
        Self::open_path(&config.storage_data_path, config.channel_capacity, config.read_batch_size)
    }

    /// Open the log stored under the given path, using the default read batch size if `batch_size` is `0`.
    pub fn open_path(path: impl AsRef<Path>, capacity: usize, batch_size: usize) -> Result<Self> {
        let path = path.as_ref();
        std::fs::create_dir_all(path).with_context(|| format!("error creating dir for log at {}", path.display()))?;
        let db = sled::Config::new()
            .path(path)
            .mode(sled::Mode::HighThroughput)
            .open()
            .context("error opening log database")?;
        let topics = db.open_tree(TREE_TOPICS).context("error opening topics tree")?;
        tracing::debug!(path = %path.display(), topics = topics.len(), "log opened");
        Ok(Self {
            inner: Arc::new(SledLogInner {
                db,
                topics,
                partitions: Default::default(),
                codecs: Default::default(),
                capacity: capacity.max(1),
                batch_size: if batch_size == 0 { DEFAULT_READ_BATCH_SIZE } else { batch_size },
            }),
        })
    }

    /// Create a topic with the given number of partitions.
    ///
    /// Creating an existing topic with the same partition count is a no-op.
    pub fn create_topic(&self, topic: &str, partitions: u32) -> Result<()> {
        if partitions == 0 {
            bail!("topic {} must have at least 1 partition", topic);
        }
        match self.partition_count(topic)? {
            Some(count) if count == partitions => Ok(()),
            Some(count) => bail!("topic {} already exists with {} partitions, requested {}", topic, count, partitions),
            None => self.set_partition_count(topic, partitions),
        }
    }

    /// Grow an existing topic to the given number of partitions.
    pub fn grow_topic(&self, topic: &str, partitions: u32) -> Result<()> {
        match self.partition_count(topic)? {
            Some(count) if count > partitions => bail!("topic {} has {} partitions, can not shrink to {}", topic, count, partitions),
            Some(_) => self.set_partition_count(topic, partitions),
            None => bail!("topic {} does not exist", topic),
        }
    }

    /// Flush all pending writes to disk.
    pub async fn flush(&self) -> Result<()> {
        self.inner.db.flush_async().await.context("error flushing log")?;
        Ok(())
    }

    fn set_partition_count(&self, topic: &str, partitions: u32) -> Result<()> {
        self.inner
            .topics
            .insert(topic.as_bytes(), &utils::encode_u64(u64::from(partitions)))
            .context("error writing topic metadata")?;
        tracing::debug!(topic, partitions, "topic partitions set");
        Ok(())
    }

    fn partition_count(&self, topic: &str) -> Result<Option<u32>> {
        let val = self.inner.topics.get(topic.as_bytes()).context("error reading topic metadata")?;
        val.map(|val| {
            let count = utils::decode_u64(&val).context("error decoding topic partition count, data corrupted")?;
            u32::try_from(count).context("topic partition count out of range, data corrupted")
        })
        .transpose()
    }

    /// Get a handle to the given partition, opening it if needed.
    fn partition(&self, topic: &str, partition: i32) -> Result<Arc<Partition>> {
        let name = format!("{}/{}", topic, partition);
        if let Some(part) = self.inner.partitions.get(&name) {
            return Ok(part.value().clone());
        }
        let count = match self.partition_count(topic)? {
            Some(count) => count,
            None => bail!("topic {} does not exist", topic),
        };
        if partition < 0 || partition as u32 >= count {
            bail!("partition {} of topic {} does not exist, topic has {} partitions", partition, topic, count);
        }

        let tree = self.inner.db.open_tree(name.as_bytes()).with_context(|| format!("error opening tree {}", name))?;
        let next_offset = recover_next_offset(&tree)?;
        let part = self
            .inner
            .partitions
            .entry(name)
            .or_insert_with(|| {
                let (signal, _) = watch::channel(next_offset);
                Arc::new(Partition {
                    tree,
                    next_offset: Mutex::new(next_offset),
                    signal,
                })
            })
            .value()
            .clone();
        Ok(part)
    }

    fn decoder(&self, topic: &str) -> Result<Arc<dyn Decoder>> {
        match self.inner.codecs.decoder(topic) {
            Some(decoder) => Ok(decoder),
            None => bail!("no decoder registered for topic {}", topic),
        }
    }

    /// Spawn one reader per partition, all feeding the same channel.
    fn spawn_readers(&self, topic: &str, offsets: &[(i32, u64)]) -> Result<(EventRx, ReaderHandle)> {
        let decoder = self.decoder(topic)?;
        let parts = offsets
            .iter()
            .map(|(partition, offset)| self.partition(topic, *partition).map(|part| (*partition, *offset, part)))
            .collect::<Result<Vec<_>>>()?;

        let (tx, rx) = mpsc::channel(self.inner.capacity);
        let readers: Vec<ReaderHandle> = parts
            .into_iter()
            .map(|(partition, offset, part)| {
                let reader = PartitionReader {
                    topic: topic.to_string(),
                    partition,
                    offset,
                    batch_size: self.inner.batch_size,
                    tree: part.tree.clone(),
                    signal: part.signal.subscribe(),
                    decoder: decoder.clone(),
                    tx: tx.clone(),
                };
                tokio::spawn(reader.run())
            })
            .collect();
        Ok((rx, tokio::spawn(join_readers(readers))))
    }
}

impl ReadWriteLog for SledLog {
    fn read(&self, topic: &str, partitions: &[i32]) -> Result<(EventRx, ReaderHandle)> {
        let offsets = partitions
            .iter()
            .map(|partition| self.offsets(topic, *partition).map(|(_, max)| (*partition, max)))
            .collect::<Result<Vec<_>>>()?;
        self.spawn_readers(topic, &offsets)
    }

    fn read_from(&self, topic: &str, offsets: &[(i32, u64)]) -> Result<(EventRx, ReaderHandle)> {
        self.spawn_readers(topic, offsets)
    }

    fn write(&self, topic: &str, events: EventRx) -> Result<JoinHandle<Result<()>>> {
        let encoder = match self.inner.codecs.encoder(topic) {
            Some(encoder) => encoder,
            None => bail!("no encoder registered for topic {}", topic),
        };
        if self.partition_count(topic)?.is_none() {
            bail!("topic {} does not exist", topic);
        }
        let writer = TopicWriter {
            log: self.clone(),
            topic: topic.to_string(),
            encoder,
            partitioner: self.inner.codecs.partitioner(topic),
            events,
        };
        Ok(tokio::spawn(writer.run()))
    }

    fn partitions(&self, topic: &str) -> Result<Vec<i32>> {
        match self.partition_count(topic)? {
            Some(count) => Ok((0..count as i32).collect()),
            None => bail!("topic {} does not exist", topic),
        }
    }

    fn offsets(&self, topic: &str, partition: i32) -> Result<(u64, u64)> {
        let part = self.partition(topic, partition)?;
        let max = *part.signal.borrow();
        let min = part
            .tree
            .first()
            .context(ERR_ITER_FAILURE)?
            .map(|(key, _)| utils::decode_byte_prefix(&key))
            .transpose()?
            .unwrap_or(max);
        Ok((min, max))
    }

    fn add_decoder(&self, decoder: Arc<dyn Decoder>, topics: &[&str]) {
        self.inner.codecs.add_decoder(decoder, topics)
    }

    fn add_encoder(&self, encoder: Arc<dyn Encoder>, topics: &[&str]) {
        self.inner.codecs.add_encoder(encoder, topics)
    }

    fn add_partitioner(&self, partitioner: Arc<dyn Partitioner>, topics: &[&str]) {
        self.inner.codecs.add_partitioner(partitioner, topics)
    }

    fn decoded_topics(&self) -> Vec<String> {
        self.inner.codecs.decoded_topics()
    }

    fn encoded_topics(&self) -> Vec<String> {
        self.inner.codecs.encoded_topics()
    }
}

/// Recover the next offset of a partition from its last stored record.
pub(super) fn recover_next_offset(tree: &Tree) -> Result<u64> {
    let last = tree.last().context("error fetching last partition record during recovery")?;
    match last {
        Some((key, _)) => Ok(utils::decode_byte_prefix(&key).context("error decoding record offset, data corrupted")? + 1),
        None => Ok(0),
    }
}

/// A task tailing a single partition from an offset.
struct PartitionReader {
    topic: String,
    partition: i32,
    /// The next offset to be read.
    offset: u64,
    /// The maximum number of records to fetch at once.
    batch_size: usize,
    tree: Tree,
    signal: watch::Receiver<u64>,
    decoder: Arc<dyn Decoder>,
    tx: EventTx,
}

impl PartitionReader {
    async fn run(mut self) -> Result<()> {
        tracing::trace!(topic = %self.topic, partition = self.partition, offset = self.offset, "partition reader started");
        let res = self.tail().await;
        match &res {
            Ok(()) => tracing::trace!(topic = %self.topic, partition = self.partition, "partition reader stopped"),
            Err(err) => tracing::error!(error = ?err, topic = %self.topic, partition = self.partition, offset = self.offset, "error reading partition"),
        }
        res
    }

    async fn tail(&mut self) -> Result<()> {
        loop {
            // Mark the current high-water mark as seen before scanning, so that any append racing
            // with the scan triggers another pass.
            let _ = *self.signal.borrow_and_update();
            if !self.forward_available().await? {
                return Ok(());
            }
            tokio::select! {
                res = self.signal.changed() => if res.is_err() { return Ok(()) },
                _ = self.tx.closed() => return Ok(()),
            }
        }
    }

    /// Forward all records from the current offset onward, returning `false` if the consumer is gone.
    async fn forward_available(&mut self) -> Result<bool> {
        loop {
            let batch = self.fetch_batch().await?;
            let exhausted = batch.len() < self.batch_size;
            for (offset, record) in batch {
                let message = self
                    .decoder
                    .decode(&record.value)
                    .with_context(|| format!("error decoding record {} of {}/{}", offset, self.topic, self.partition))?;
                let event = Event {
                    topic: self.topic.clone(),
                    partition: self.partition,
                    offset,
                    key: record.key,
                    message,
                };
                if self.tx.send(event).await.is_err() {
                    return Ok(false);
                }
                self.offset = offset + 1;
            }
            if exhausted {
                return Ok(true);
            }
        }
    }

    /// Fetch the next batch of records from the current offset.
    async fn fetch_batch(&self) -> Result<Vec<(u64, Record)>> {
        let (tree, offset, batch_size) = (self.tree.clone(), self.offset, self.batch_size);
        spawn_blocking(move || -> Result<Vec<(u64, Record)>> {
            let start = utils::encode_byte_prefix(PREFIX_EVENT, offset);
            let stop = utils::encode_byte_prefix(PREFIX_EVENT, u64::MAX);
            let mut batch = Vec::with_capacity(batch_size.min(1024));
            for kv_res in tree.range(start..=stop).take(batch_size) {
                let (key, val) = kv_res.context(ERR_ITER_FAILURE)?;
                let offset = utils::decode_byte_prefix(&key)?;
                let record: Record = utils::decode_model(&val).context("error decoding partition record")?;
                batch.push((offset, record));
            }
            Ok(batch)
        })
        .await?
    }
}

/// A task writing a stream of events to a topic.
struct TopicWriter {
    log: SledLog,
    topic: String,
    encoder: Arc<dyn Encoder>,
    partitioner: Arc<dyn Partitioner>,
    events: EventRx,
}

impl TopicWriter {
    async fn run(mut self) -> Result<()> {
        tracing::trace!(topic = %self.topic, "topic writer started");
        while let Some(event) = self.events.recv().await {
            let value = self
                .encoder
                .encode(&event.message)
                .with_context(|| format!("error encoding event for topic {}", self.topic))?;
            let nparts = match self.log.partition_count(&self.topic)? {
                Some(count) => count as usize,
                None => bail!("topic {} no longer exists", self.topic),
            };
            let partition = self.partitioner.partition(&event.key, nparts);
            let part = self.log.partition(&self.topic, partition)?;
            append(&part, Record { key: event.key, value }).await?;
        }
        tracing::trace!(topic = %self.topic, "topic writer stopped");
        Ok(())
    }
}

/// Append a record to the given partition, returning its offset.
async fn append(part: &Partition, record: Record) -> Result<u64> {
    let mut next_offset = part.next_offset.lock().await;
    let offset = *next_offset;
    let key = utils::encode_byte_prefix(PREFIX_EVENT, offset);
    let val = utils::encode_model(&record)?;
    let tree = part.tree.clone();
    spawn_blocking(move || tree.insert(&key, val))
        .await?
        .context("error appending record to partition")?;
    *next_offset += 1;
    part.signal.send_replace(*next_offset);
    Ok(offset)
}

/// Run a blocking storage operation on the blocking thread pool.
#[tracing::instrument(level = "trace", skip(f), err)]
async fn spawn_blocking<F, R>(f: F) -> Result<R>
where
    F: FnOnce() -> R + Send + 'static,
    R: Send + 'static,
{
    tokio::task::spawn_blocking(f).await.context("error joining blocking storage task")
}
