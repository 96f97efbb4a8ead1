//! Partition assignment over the command log.
//!
//! Every peer runs a manager. All managers track grid membership & the latest assignment of each
//! operator instance by reading the command log, and each one asks its peer's instance supervisor
//! to start or stop the instances assigned to, or moved away from, that peer. Only the manager of
//! the current leader plans & emits assignments.

mod state;

use std::sync::Arc;
use std::time::Instant;

use anyhow::{bail, Result};
use futures::stream::StreamExt;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::{BroadcastStream, ReceiverStream, WatchStream};

use crate::config::Config;
use crate::log::{closed_reader_error, ReadWriteLog, ReaderHandle};
use crate::models::{CmdMsg, Event, EventRx, EventTx, Instance, Message};
use crate::voter::LeaderState;

pub use state::{plan, ManagerState, OpTopology, Topology};

/// A request for a peer's instance supervisor.
#[derive(Clone, Debug, PartialEq)]
pub enum InstanceTask {
    /// Start the given instance on this peer.
    Start(Instance),
    /// Stop the given instance, which has been assigned to a different peer.
    Stop(Instance),
}

/// A task driving a `ManagerState` from the command log.
pub struct Manager {
    /// The application's runtime config.
    config: Arc<Config>,
    /// The assignment state machine.
    state: ManagerState,
    /// The operators of the grid & the partitions of their input topics.
    topology: Topology,
    /// The log, used to rediscover topic partitions.
    log: Arc<dyn ReadWriteLog>,
    /// A stream of entries from the command log.
    events: ReceiverStream<Event>,
    /// The reader feeding `events`.
    reader: ReaderHandle,
    /// A channel of entries to be appended to the command log.
    out: EventTx,
    /// A stream of this peer's leader state.
    leader_rx: WatchStream<LeaderState>,
    /// A channel of requests to this peer's instance supervisor.
    tasks: mpsc::Sender<InstanceTask>,

    /// A channel used for triggering graceful shutdown.
    shutdown_tx: broadcast::Sender<()>,
    /// A channel used for triggering graceful shutdown.
    shutdown_rx: BroadcastStream<()>,
}

impl Manager {
    /// Create a new instance.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Arc<Config>, id: String, topology: Topology, log: Arc<dyn ReadWriteLog>, (events, reader): (EventRx, ReaderHandle), out: EventTx, leader_rx: watch::Receiver<LeaderState>,
        tasks: mpsc::Sender<InstanceTask>, shutdown_tx: broadcast::Sender<()>,
    ) -> Self {
        Self {
            state: ManagerState::new(id, config.leader_timeout()),
            config,
            topology,
            log,
            events: ReceiverStream::new(events),
            reader,
            out,
            leader_rx: WatchStream::new(leader_rx),
            tasks,
            shutdown_rx: BroadcastStream::new(shutdown_tx.subscribe()),
            shutdown_tx,
        }
    }

    pub fn spawn(self) -> JoinHandle<Result<()>> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) -> Result<()> {
        tracing::debug!(peer = %self.state.id(), "manager started");
        let mut ticker = tokio::time::interval(self.config.liveness_interval());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut discovery = tokio::time::interval(self.config.leader_timeout());
        discovery.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        let res = loop {
            // Shutdown is checked first so that no task is sent to a supervisor which has already
            // drained. Command entries come last, as a busy command log must not delay the timers.
            tokio::select! {
                biased;
                _ = self.shutdown_rx.next() => break Ok(()),
                Some(state) = self.leader_rx.next() => {
                    self.state.set_leader(&state);
                    if let Err(err) = self.plan().await {
                        break Err(err);
                    }
                }
                _ = ticker.tick() => {
                    if let Err(err) = self.plan().await {
                        break Err(err);
                    }
                }
                _ = discovery.tick() => self.rediscover_partitions(),
                event_opt = self.events.next() => match event_opt {
                    Some(event) => {
                        if let Err(err) = self.handle_event(event).await {
                            break Err(err);
                        }
                    }
                    None => break Err(closed_reader_error(&mut self.reader, "command log reader of manager").await),
                },
            }
        };

        if let Err(err) = &res {
            tracing::error!(error = ?err, "fatal error in manager, shutting down");
            let _ = self.shutdown_tx.send(());
        }
        tracing::debug!(peer = %self.state.id(), "manager stopped");
        res
    }

    /// Handle an entry read from the command log.
    #[tracing::instrument(level = "trace", skip(self, event))]
    async fn handle_event(&mut self, event: Event) -> Result<()> {
        let msg = match &event.message {
            Message::Cmd(msg) => msg,
            other => {
                tracing::warn!(message = ?other, "unexpected message on command topic, skipping");
                return Ok(());
            }
        };
        for task in self.state.observe(msg, Instant::now()) {
            tracing::debug!(task = ?task, "dispatching instance task");
            if self.tasks.send(task).await.is_err() {
                bail!("instance supervisor closed unexpectedly");
            }
        }
        Ok(())
    }

    /// Emit a new plan if leading and the plan has changed.
    async fn plan(&mut self) -> Result<()> {
        let out = self.state.tick(Instant::now(), &self.topology);
        self.emit(out).await
    }

    async fn emit(&mut self, out: Vec<CmdMsg>) -> Result<()> {
        for msg in out {
            let event = Event::new(self.config.cmd_topic(), self.state.id().as_bytes().to_vec(), Message::Cmd(msg));
            if self.out.send(event).await.is_err() {
                bail!("command log writer of manager closed unexpectedly");
            }
        }
        Ok(())
    }

    /// Refresh the partitions of all input topics from the log.
    #[tracing::instrument(level = "trace", skip(self))]
    fn rediscover_partitions(&mut self) {
        for topic in self.topology.topics() {
            let partitions = match self.log.partitions(&topic) {
                Ok(partitions) => partitions,
                Err(err) => {
                    tracing::warn!(error = ?err, topic = %topic, "error rediscovering topic partitions");
                    continue;
                }
            };
            for (name, op) in self.topology.ops.iter() {
                let known = op.partitions.get(&topic).map(Vec::len).unwrap_or(0);
                if known != partitions.len() && partitions.len() > op.parallelism as usize {
                    tracing::warn!(
                        topic = %topic, operator = %name, parallelism = op.parallelism, partitions = partitions.len(),
                        "topic has more partitions than operator parallelism, instances will read multiple partitions"
                    );
                }
            }
            self.topology.set_partitions(&topic, &partitions);
        }
    }
}
