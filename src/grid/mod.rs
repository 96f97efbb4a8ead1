//! The grid coordinator.
//!
//! A `Grid` is the per-peer runtime of a set of named operators. Operators are registered with
//! `add` before the grid is started. Once started, the grid's voter & manager coordinate with
//! every other peer of the same grid through the command topic, and the instance supervisor runs
//! whichever operator instances the leader assigns to this peer.
//!
//! ## Command Topic
//! The command topic is named `{grid}-cmd` and must exist on the log with exactly one partition
//! before the grid is started. Its decoder & encoder are registered by the grid itself.
//!
//! ## Outputs
//! One writer is opened per encoded topic when the grid starts, and it is shared by every
//! instance on this peer. Register encoders for every topic which operators emit to before
//! calling `start`.

mod instance;
mod supervisor;
#[cfg(test)]
mod supervisor_test;

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use futures::stream::StreamExt;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::{BroadcastStream, SignalStream};
use tokio_stream::StreamMap;
use uuid::Uuid;

use crate::actor::{validate_actor_def, ActorDef};
use crate::config::Config;
use crate::error::{GridError, GridResult};
use crate::log::{CmdMsgCodec, Decoder, Encoder, Partitioner, ReadWriteLog};
use crate::manager::{Manager, Topology};
use crate::meter::Registry;
use crate::models::{EventRx, EventTx};
use crate::voter::{LeaderState, Voter};

pub use instance::merge;
use supervisor::Supervisor;

/// An operator instance.
///
/// An actor is handed two streams when its instance starts. The `state` stream carries one
/// `Message::MinMaxOffset` control event per assigned partition, each of which must be resolved
/// before the next is delivered; it closes once every partition has been resolved. The `input`
/// stream carries the events of all assigned partitions. The returned stream carries the events
/// to be written, and must close once `input` closes.
pub trait Actor: Send + 'static {
    fn act(self: Box<Self>, input: EventRx, state: EventRx) -> EventRx;
}

/// A factory of operator instances, called with the operator name & instance ID.
pub type NewActor = Arc<dyn Fn(&str, u32) -> Box<dyn Actor> + Send + Sync>;

/// A registered operator.
#[derive(Clone)]
pub(crate) struct Op {
    pub(crate) parallelism: u32,
    pub(crate) factory: NewActor,
    pub(crate) topics: BTreeSet<String>,
}

/// Grid-wide state, frozen when the grid starts.
pub(crate) struct GridCtx {
    /// The application's runtime config.
    pub(crate) config: Arc<Config>,
    /// The log shared by all peers of the grid.
    pub(crate) log: Arc<dyn ReadWriteLog>,
    /// The registered operators.
    pub(crate) ops: HashMap<String, Op>,
    /// The shared writer of each output topic.
    pub(crate) writers: HashMap<String, EventTx>,
    /// The registry of meters.
    pub(crate) registry: Registry,
    /// A channel used for triggering graceful shutdown.
    pub(crate) shutdown_tx: broadcast::Sender<()>,
    /// A channel of fatal errors, the first of which is returned from `Grid::wait`.
    pub(crate) fatal_tx: mpsc::UnboundedSender<anyhow::Error>,
}

impl GridCtx {
    /// Record a fatal error & trigger shutdown of the grid.
    pub(crate) fn fatal(&self, err: anyhow::Error) {
        tracing::error!(error = ?err, "fatal error, shutting down grid");
        let _ = self.fatal_tx.send(err);
        let _ = self.shutdown_tx.send(());
    }
}

/// A handle which can be used to stop a grid from a different task.
#[derive(Clone)]
pub struct ShutdownHandle {
    shutdown_tx: broadcast::Sender<()>,
    /// Set once shutdown is requested, so that a grid stopped before it starts never runs.
    stopped: Arc<AtomicBool>,
}

impl ShutdownHandle {
    /// Trigger shutdown of the grid, this is idempotent.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        let _ = self.shutdown_tx.send(());
    }

    fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

/// The tasks of a started grid.
struct Running {
    ctx: Arc<GridCtx>,
    voter: JoinHandle<Result<()>>,
    manager: JoinHandle<Result<()>>,
    supervisor: JoinHandle<Result<()>>,
    /// The command topic writers of the voter & manager.
    cmd_writers: Vec<JoinHandle<Result<()>>>,
    /// The shared output writers, by topic.
    writers: Vec<(String, JoinHandle<Result<()>>)>,
    /// Subscribed when the grid starts, so that no shutdown signal is missed.
    shutdown_rx: broadcast::Receiver<()>,
    fatal_rx: mpsc::UnboundedReceiver<anyhow::Error>,
}

/// The per-peer runtime of a grid of operators.
pub struct Grid {
    /// The application's runtime config.
    config: Arc<Config>,
    /// The log shared by all peers of the grid.
    log: Arc<dyn ReadWriteLog>,
    /// The identity of this peer.
    peer: ActorDef,
    /// The registered operators.
    ops: HashMap<String, Op>,
    /// The partitions of each input topic, as discovered when operators are added.
    partitions: HashMap<String, Vec<i32>>,
    /// The meter registry to use, a default is installed on start if unset.
    registry: Option<Registry>,

    /// A handle used for triggering graceful shutdown.
    shutdown: ShutdownHandle,
    /// The leader state of this peer, available once started.
    leader_rx: Option<watch::Receiver<LeaderState>>,
    /// The tasks of the grid, available once started.
    running: Option<Running>,
    started: bool,
}

impl Grid {
    /// Create a new grid peer over the given log.
    ///
    /// The peer is named by `config.peer_name`, or a random name when unset, within the namespace
    /// of the grid's name.
    pub fn new(config: Arc<Config>, log: Arc<dyn ReadWriteLog>) -> Result<Self> {
        config.validate()?;
        let name = config.peer_name.clone().unwrap_or_else(|| format!("peer-{}", Uuid::new_v4()));
        let peer = ActorDef::new(name).with_namespace(config.name.as_str());
        validate_actor_def(&peer).with_context(|| format!("invalid peer identity {}", peer))?;

        let cmd_topic = config.cmd_topic();
        log.add_decoder(Arc::new(CmdMsgCodec), &[cmd_topic.as_str()]);
        log.add_encoder(Arc::new(CmdMsgCodec), &[cmd_topic.as_str()]);
        tracing::debug!(peer = %peer, grid = %config.name, quorum = config.quorum(), "grid peer created");

        let (shutdown_tx, _) = broadcast::channel(1);
        Ok(Self {
            config,
            log,
            peer,
            ops: HashMap::new(),
            partitions: HashMap::new(),
            registry: None,
            shutdown: ShutdownHandle {
                shutdown_tx,
                stopped: Arc::new(AtomicBool::new(false)),
            },
            leader_rx: None,
            running: None,
            started: false,
        })
    }

    /// The name of the grid.
    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// The ID of this peer.
    pub fn peer_id(&self) -> &str {
        self.peer.id()
    }

    /// The name of the grid's command topic.
    pub fn cmd_topic(&self) -> String {
        self.config.cmd_topic()
    }

    /// The meter registry in use, if set or if the grid has been started.
    pub fn registry(&self) -> Option<Registry> {
        self.registry.clone()
    }

    /// A receiver of this peer's leader state, available once the grid has started.
    pub fn leader_state(&self) -> Option<watch::Receiver<LeaderState>> {
        self.leader_rx.clone()
    }

    /// Register an operator.
    ///
    /// Each of the operator's input topics must have a registered decoder, and must not have
    /// more partitions than the operator's parallelism.
    pub fn add<F>(&mut self, name: &str, parallelism: u32, factory: F, topics: &[&str]) -> GridResult<()>
    where
        F: Fn(&str, u32) -> Box<dyn Actor> + Send + Sync + 'static,
    {
        if self.started {
            return Err(GridError::AlreadyStarted);
        }
        if self.ops.contains_key(name) {
            return Err(GridError::AlreadyAdded(name.into()));
        }
        if parallelism == 0 {
            return Err(GridError::InvalidParallelism(name.into()));
        }

        let decoded = self.log.decoded_topics();
        let mut discovered = HashMap::new();
        for topic in topics {
            if !decoded.iter().any(|decoded| decoded.as_str() == *topic) {
                return Err(GridError::NoDecoder(topic.to_string()));
            }
            let partitions = self.log.partitions(topic).map_err(|source| GridError::PartitionDiscovery {
                topic: topic.to_string(),
                source,
            })?;
            if partitions.len() > parallelism as usize {
                return Err(GridError::ParallelismTooLow {
                    topic: topic.to_string(),
                    name: name.into(),
                    parallelism,
                    partitions: partitions.len(),
                });
            }
            discovered.insert(topic.to_string(), partitions);
        }

        self.partitions.extend(discovered);
        self.ops.insert(
            name.into(),
            Op {
                parallelism,
                factory: Arc::new(factory),
                topics: topics.iter().map(|topic| topic.to_string()).collect(),
            },
        );
        tracing::debug!(operator = name, parallelism, topics = ?topics, "operator added");
        Ok(())
    }

    /// Register a decoder for the given topics on the underlying log.
    pub fn add_decoder(&self, decoder: Arc<dyn Decoder>, topics: &[&str]) {
        self.log.add_decoder(decoder, topics)
    }

    /// Register an encoder for the given topics on the underlying log.
    pub fn add_encoder(&self, encoder: Arc<dyn Encoder>, topics: &[&str]) {
        self.log.add_encoder(encoder, topics)
    }

    /// Register a partitioner for the given topics on the underlying log.
    pub fn add_partitioner(&self, partitioner: Arc<dyn Partitioner>, topics: &[&str]) {
        self.log.add_partitioner(partitioner, topics)
    }

    /// Use the given meter registry.
    pub fn use_metrics(&mut self, registry: Registry) {
        self.registry = Some(registry);
    }

    /// A handle which can be used to stop this grid from a different task.
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.shutdown.clone()
    }

    /// Trigger shutdown of the grid, this is idempotent.
    ///
    /// A grid stopped before it is started shuts down as soon as it starts.
    pub fn stop(&self) {
        self.shutdown.stop();
    }

    /// Start the grid.
    ///
    /// This must be called from within a tokio runtime, and may only be called once.
    pub fn start(&mut self) -> GridResult<()> {
        if self.started {
            return Err(GridError::AlreadyStarted);
        }
        self.started = true;
        let (config, log, cap) = (self.config.clone(), self.log.clone(), self.config.channel_capacity);
        let cmd_topic = config.cmd_topic();
        let registry = self.registry.get_or_insert_with(Registry::new).clone();
        let shutdown_tx = self.shutdown.shutdown_tx.clone();
        let shutdown_rx = shutdown_tx.subscribe();

        // Open the shared output writers.
        let mut writers = HashMap::new();
        let mut writer_handles = vec![];
        for topic in log.encoded_topics().into_iter().filter(|topic| topic != &cmd_topic) {
            let (tx, rx) = mpsc::channel(cap);
            let handle = log.write(&topic, rx).map_err(GridError::Log)?;
            writers.insert(topic.clone(), tx);
            writer_handles.push((topic, handle));
        }

        let (fatal_tx, fatal_rx) = mpsc::unbounded_channel();
        let ctx = Arc::new(GridCtx {
            config: config.clone(),
            log: log.clone(),
            ops: self.ops.clone(),
            writers,
            registry,
            shutdown_tx: shutdown_tx.clone(),
            fatal_tx,
        });

        let mut topology = Topology::default();
        for (name, op) in self.ops.iter() {
            let partitions: BTreeMap<String, Vec<i32>> = op
                .topics
                .iter()
                .map(|topic| (topic.clone(), self.partitions.get(topic).cloned().unwrap_or_default()))
                .collect();
            topology.insert(name.as_str(), op.parallelism, partitions);
        }

        // Each of the voter & manager gets its own reader & writer of the command topic. A new
        // incarnation is announced on every start, so that the leader notices a restarted peer.
        let peer_id = self.peer.id().to_string();
        let incarnation = Uuid::new_v4().to_string();
        let voter_events = log.read(&cmd_topic, &[0]).map_err(GridError::Log)?;
        let (voter_out, voter_out_rx) = mpsc::channel(cap);
        let voter_writer = log.write(&cmd_topic, voter_out_rx).map_err(GridError::Log)?;
        let manager_events = log.read(&cmd_topic, &[0]).map_err(GridError::Log)?;
        let (manager_out, manager_out_rx) = mpsc::channel(cap);
        let manager_writer = log.write(&cmd_topic, manager_out_rx).map_err(GridError::Log)?;

        let (voter, leader_rx) = Voter::new(config.clone(), peer_id.clone(), incarnation.clone(), voter_events, voter_out, shutdown_tx.clone());
        let (tasks_tx, tasks_rx) = mpsc::channel(cap);
        let manager = Manager::new(
            config,
            peer_id,
            topology,
            log,
            manager_events,
            manager_out,
            leader_rx.clone(),
            tasks_tx,
            shutdown_tx.clone(),
        );
        let supervisor = Supervisor::new(ctx.clone(), tasks_rx);

        self.leader_rx = Some(leader_rx);
        self.running = Some(Running {
            ctx,
            voter: voter.spawn(),
            manager: manager.spawn(),
            supervisor: supervisor.spawn(),
            cmd_writers: vec![voter_writer, manager_writer],
            writers: writer_handles,
            shutdown_rx,
            fatal_rx,
        });
        tracing::info!(peer = %self.peer, incarnation = %incarnation, grid = %self.config.name, operators = self.ops.len(), "grid started");
        if self.shutdown.is_stopped() {
            tracing::debug!(peer = %self.peer, "grid was stopped before it started");
            let _ = shutdown_tx.send(());
        }
        Ok(())
    }

    /// Wait for the grid to shut down, returning the first fatal error encountered, if any.
    ///
    /// Shutdown is triggered by `stop`, by a `ShutdownHandle`, by a fatal error or by SIGINT or
    /// SIGTERM. All tasks are joined, and all queued output is written before this returns.
    pub async fn wait(mut self) -> Result<()> {
        let running = self.running.take().ok_or_else(|| anyhow!("grid has not been started"))?;
        let Running {
            ctx,
            voter,
            manager,
            supervisor,
            cmd_writers,
            writers,
            shutdown_rx,
            mut fatal_rx,
        } = running;

        let mut signals = StreamMap::new();
        signals.insert("sigterm", SignalStream::new(signal(SignalKind::terminate()).context("error building signal stream")?));
        signals.insert("sigint", SignalStream::new(signal(SignalKind::interrupt()).context("error building signal stream")?));
        let mut shutdown_rx = BroadcastStream::new(shutdown_rx);
        tokio::select! {
            Some((_, sig)) = signals.next() => {
                tracing::debug!(signal = ?sig, "signal received, beginning graceful shutdown");
                self.stop();
            }
            _ = shutdown_rx.next() => (),
        }

        // Begin shutdown routine.
        tracing::debug!(peer = %self.peer, "grid is shutting down");
        let mut errors = vec![];
        for (name, handle) in [("voter", voter), ("manager", manager), ("instance supervisor", supervisor)] {
            if let Err(err) = handle.await.with_context(|| format!("error joining {} handle", name)).and_then(|res| res) {
                tracing::error!(error = ?err, "error shutting down {}", name);
                errors.push(err);
            }
        }

        // Dropping the context closes the shared writers, which then drain their queues.
        drop(ctx);
        for handle in cmd_writers {
            if let Err(err) = handle.await.context("error joining command writer handle").and_then(|res| res) {
                tracing::error!(error = ?err, "error shutting down command writer");
                errors.push(err);
            }
        }
        for (topic, handle) in writers {
            if let Err(err) = handle.await.context("error joining writer handle").and_then(|res| res) {
                tracing::error!(error = ?err, topic = %topic, "error shutting down writer");
                errors.push(err);
            }
        }

        tracing::debug!(peer = %self.peer, "grid shutdown complete");
        match fatal_rx.try_recv() {
            Ok(err) => Err(err),
            Err(_) => match errors.into_iter().next() {
                Some(err) => Err(err),
                None => Ok(()),
            },
        }
    }
}
