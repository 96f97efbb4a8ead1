//! Leader election over the command log.
//!
//! Every peer runs a voter. Voters never talk to each other directly: proposals, votes,
//! leadership announcements and liveness entries are all appended to partition 0 of the grid's
//! command topic, and every voter reduces the same totally ordered sequence of entries. A peer
//! votes at most once per term, and a candidate is only elected by a quorum of distinct votes, so
//! at most one leader can be elected per term.

mod state;
#[cfg(test)]
mod mod_test;

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Result};
use futures::stream::StreamExt;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::{BroadcastStream, ReceiverStream};

use crate::config::Config;
use crate::log::{closed_reader_error, ReaderHandle};
use crate::models::{CmdMsg, Event, EventRx, EventTx, Message};

pub use state::VoterState;

const METRIC_IS_LEADER: &str = "grid_is_leader";
const METRIC_LEADERSHIP_CHANGE: &str = "grid_num_leadership_changes";

/// Different states which a peer's voter may be in.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LeaderState {
    /// This peer is the leader of the given term.
    Leading { term: u64 },
    /// A different peer, identified by `leader`, is the leader of the given term.
    Following { term: u64, leader: String },
    /// No leader is currently known.
    Standby,
}

impl LeaderState {
    pub fn is_leading(&self) -> bool {
        matches!(self, Self::Leading { .. })
    }

    /// The term of the known leader, if any.
    pub fn term(&self) -> Option<u64> {
        match self {
            Self::Leading { term } | Self::Following { term, .. } => Some(*term),
            Self::Standby => None,
        }
    }
}

/// A task driving a `VoterState` from the command log.
pub struct Voter {
    /// The application's runtime config.
    config: Arc<Config>,
    /// The election state machine.
    state: VoterState,
    /// A stream of entries from the command log.
    events: ReceiverStream<Event>,
    /// The reader feeding `events`.
    reader: ReaderHandle,
    /// A channel of entries to be appended to the command log.
    out: EventTx,
    /// Sender for the current leader state.
    leader_tx: watch::Sender<LeaderState>,
    /// The last published leader state.
    leader: LeaderState,
    /// Count of observed leadership changes.
    changes: u64,

    /// A channel used for triggering graceful shutdown.
    shutdown_tx: broadcast::Sender<()>,
    /// A channel used for triggering graceful shutdown.
    shutdown_rx: BroadcastStream<()>,
}

impl Voter {
    /// Create a new instance.
    ///
    /// `events` must be read from partition 0 of the command topic by `reader`, and `out` must
    /// feed a writer of the command topic. The `incarnation` identifies this run of the peer.
    pub fn new(
        config: Arc<Config>, id: String, incarnation: String, (events, reader): (EventRx, ReaderHandle), out: EventTx, shutdown_tx: broadcast::Sender<()>,
    ) -> (Self, watch::Receiver<LeaderState>) {
        metrics::register_gauge!(METRIC_LEADERSHIP_CHANGE, metrics::Unit::Count, "the number of leadership changes observed by this peer");
        metrics::register_gauge!(
            METRIC_IS_LEADER,
            metrics::Unit::Count,
            "a gauge indicating if this peer is the leader, where 1.0 indicates leadership, any other value does not"
        );
        let state = VoterState::new(id, config.quorum(), config.liveness_interval(), config.leader_timeout(), config.max_leader_time()).with_incarnation(incarnation);
        let (leader_tx, leader_rx) = watch::channel(LeaderState::Standby);
        (
            Self {
                config,
                state,
                events: ReceiverStream::new(events),
                reader,
                out,
                leader_tx,
                leader: LeaderState::Standby,
                changes: 0,
                shutdown_rx: BroadcastStream::new(shutdown_tx.subscribe()),
                shutdown_tx,
            },
            leader_rx,
        )
    }

    pub fn spawn(self) -> JoinHandle<Result<()>> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) -> Result<()> {
        tracing::debug!(peer = %self.state.id(), "voter started");
        let period = (self.config.liveness_interval() / 2).max(Duration::from_millis(1));
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        let res = loop {
            tokio::select! {
                event_opt = self.events.next() => match event_opt {
                    Some(event) => {
                        if let Err(err) = self.handle_event(event).await {
                            break Err(err);
                        }
                    }
                    None => break Err(closed_reader_error(&mut self.reader, "command log reader of voter").await),
                },
                _ = ticker.tick() => {
                    let out = self.state.tick(Instant::now());
                    if let Err(err) = self.emit(out).await {
                        break Err(err);
                    }
                }
                _ = self.shutdown_rx.next() => break Ok(()),
            }
        };

        if let Err(err) = &res {
            tracing::error!(error = ?err, "fatal error in voter, shutting down");
            let _ = self.shutdown_tx.send(());
        }
        if self.leader != LeaderState::Standby {
            self.set_state(LeaderState::Standby);
        }
        tracing::debug!(peer = %self.state.id(), "voter stopped");
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
        let out = self.state.observe(msg, Instant::now());
        self.emit(out).await
    }

    /// Append the given entries to the command log & publish any change of leader state.
    async fn emit(&mut self, out: Vec<CmdMsg>) -> Result<()> {
        let state = self.state.state();
        if state != self.leader {
            self.set_state(state);
        }
        for msg in out {
            let event = Event::new(self.config.cmd_topic(), self.state.id().as_bytes().to_vec(), Message::Cmd(msg));
            if self.out.send(event).await.is_err() {
                bail!("command log writer of voter closed unexpectedly");
            }
        }
        Ok(())
    }

    /// Set the current leader state & emit a state update.
    fn set_state(&mut self, state: LeaderState) {
        if state.term().is_some() && state.term() != self.leader.term() {
            self.changes += 1;
            metrics::gauge!(METRIC_LEADERSHIP_CHANGE, self.changes as f64);
        }
        tracing::info!(peer = %self.state.id(), state = ?state, "leader state changed");
        self.leader = state;
        self.leader_tx.send_replace(self.leader.clone());
        let is_leader = if self.leader.is_leading() { 1.0 } else { 0.0 };
        metrics::gauge!(METRIC_IS_LEADER, is_leader);
    }
}
