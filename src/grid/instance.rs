//! Operator instance runtime.
//!
//! An instance resolves the offset range of each of its assigned partitions through its actor's
//! state channel, then merges the events of all of its partitions into the actor's input, and
//! demultiplexes the actor's output onto the grid's shared writers.

use std::sync::Arc;

use anyhow::{anyhow, Result};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::error::GridError;
use crate::grid::GridCtx;
use crate::log::{join_readers, ReaderHandle};
use crate::meter::{Meter, Registry};
use crate::models::{Event, EventRx, EventTx, Instance, Message, MinMaxOffset};

/// The runtime of a single operator instance.
pub(super) struct InstanceRuntime {
    ctx: Arc<GridCtx>,
    assignment: Instance,
    stop_rx: oneshot::Receiver<()>,
}

impl InstanceRuntime {
    pub(super) fn new(ctx: Arc<GridCtx>, assignment: Instance, stop_rx: oneshot::Receiver<()>) -> Self {
        Self { ctx, assignment, stop_rx }
    }

    /// Spawn this instance, any error it encounters is fatal to the grid.
    pub(super) fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            let ctx = self.ctx.clone();
            if let Err(err) = self.run().await {
                ctx.fatal(err);
            }
        })
    }

    pub(super) async fn run(self) -> Result<()> {
        let Self { ctx, assignment, mut stop_rx } = self;
        let name = assignment.fname.as_str();
        let op = ctx.ops.get(name).ok_or_else(|| GridError::UnknownOperator(name.into()))?;
        for slice in assignment.topic_slices.iter() {
            if !op.topics.contains(&slice.topic) {
                return Err(GridError::NotReader {
                    name: name.into(),
                    topic: slice.topic.clone(),
                }
                .into());
            }
        }

        let cap = ctx.config.channel_capacity;
        let actor = (op.factory)(name, assignment.id);
        let (input_tx, input_rx) = mpsc::channel(cap);
        let (state_tx, state_rx) = mpsc::channel(cap);
        let output = actor.act(input_rx, state_rx);
        let mut demux_handle = tokio::spawn(demux(ctx.clone(), name.to_string(), output));
        tracing::debug!(operator = name, id = assignment.id, "operator instance started");

        // Resolve the offset ranges, unless stopped in the meantime.
        let inputs = tokio::select! {
            res = resolve_inputs(&ctx, &assignment, state_tx) => res?,
            _ = &mut stop_rx => {
                drop(input_tx);
                return join_demux(demux_handle).await;
            }
        };

        let (inputs, readers): (Vec<EventRx>, Vec<ReaderHandle>) = inputs.into_iter().unzip();
        let meter = ctx.registry.get_or_register(&meter_name(name));
        let forwarders = merge_into(&meter, inputs, input_tx);
        let readers = join_readers(readers);
        tokio::pin!(readers);
        let mut readers_done = false;
        let res = loop {
            tokio::select! {
                _ = &mut stop_rx => {
                    tracing::debug!(operator = name, id = assignment.id, "draining operator instance");
                    forwarders.iter().for_each(|handle| handle.abort());
                    break join_demux(demux_handle).await;
                }
                res = &mut readers, if !readers_done => match res {
                    Ok(()) => readers_done = true,
                    Err(err) => {
                        forwarders.iter().for_each(|handle| handle.abort());
                        demux_handle.abort();
                        break Err(err);
                    }
                },
                res = &mut demux_handle => {
                    forwarders.iter().for_each(|handle| handle.abort());
                    let res = res.map_err(|err| anyhow!("error joining demux task: {}", err)).and_then(|res| res);
                    // The readers exit once their forwarders are gone, surface any failure of theirs.
                    if res.is_ok() && !readers_done {
                        break (&mut readers).await;
                    }
                    break res;
                }
            }
        };
        tracing::debug!(operator = name, id = assignment.id, "operator instance stopped");
        res
    }
}

/// Resolve the starting offset of every assigned partition & open a reader per topic.
async fn resolve_inputs(ctx: &GridCtx, assignment: &Instance, state_tx: EventTx) -> Result<Vec<(EventRx, ReaderHandle)>> {
    let name = assignment.fname.as_str();
    let mut inputs = Vec::with_capacity(assignment.topic_slices.len());
    for slice in assignment.topic_slices.iter() {
        let mut offsets = Vec::with_capacity(slice.partitions.len());
        for &partition in slice.partitions.iter() {
            let unresolved = || GridError::UnresolvedOffset {
                name: name.into(),
                topic: slice.topic.clone(),
                partition,
            };
            let (min, max) = ctx.log.offsets(&slice.topic, partition).map_err(GridError::Log)?;
            let (ctl, resolved) = MinMaxOffset::new(slice.topic.as_str(), partition, min, max);
            let mut event = Event::new(slice.topic.as_str(), Vec::new(), Message::MinMaxOffset(ctl));
            event.partition = partition;
            event.offset = max;
            if state_tx.send(event).await.is_err() {
                return Err(unresolved().into());
            }
            let offset = match tokio::time::timeout(ctx.config.offset_resolution_timeout(), resolved).await {
                Ok(Ok(offset)) => offset,
                _ => return Err(unresolved().into()),
            };
            tracing::debug!(operator = name, topic = %slice.topic, partition, offset, "partition offset resolved");
            offsets.push((partition, offset));
        }
        inputs.push(ctx.log.read_from(&slice.topic, &offsets).map_err(GridError::Log)?);
    }
    Ok(inputs)
}

async fn join_demux(handle: JoinHandle<Result<()>>) -> Result<()> {
    handle.await.map_err(|err| anyhow!("error joining demux task: {}", err)).and_then(|res| res)
}

/// Route every event of an operator's output to the shared writer of its topic.
pub(super) async fn demux(ctx: Arc<GridCtx>, name: String, mut output: EventRx) -> Result<()> {
    while let Some(event) = output.recv().await {
        let writer = match ctx.writers.get(&event.topic) {
            Some(writer) => writer,
            None => return Err(GridError::NotWriter { name, topic: event.topic }.into()),
        };
        let topic = event.topic.clone();
        if writer.send(event).await.is_err() {
            return Err(anyhow!("writer of topic {} closed unexpectedly", topic));
        }
    }
    Ok(())
}

/// The name of the meter marked for every event delivered to an operator.
pub(super) fn meter_name(name: &str) -> String {
    format!("{}-msg-rate", name)
}

/// Merge the given streams into one, marking the operator's meter once per forwarded event.
///
/// Order is preserved per input stream, but not across them. The merged stream closes once
/// every input has closed.
pub fn merge(name: &str, inputs: Vec<EventRx>, capacity: usize, registry: &Registry) -> EventRx {
    let (tx, rx) = mpsc::channel(capacity);
    let meter = registry.get_or_register(&meter_name(name));
    merge_into(&meter, inputs, tx);
    rx
}

fn merge_into(meter: &Meter, inputs: Vec<EventRx>, tx: EventTx) -> Vec<JoinHandle<()>> {
    inputs
        .into_iter()
        .map(|mut input| {
            let (meter, tx) = (meter.clone(), tx.clone());
            tokio::spawn(async move {
                while let Some(event) = input.recv().await {
                    if tx.send(event).await.is_err() {
                        break;
                    }
                    meter.mark(1);
                }
            })
        })
        .collect()
}
