use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use futures::stream::StreamExt;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::{BroadcastStream, ReceiverStream};

use crate::grid::instance::InstanceRuntime;
use crate::grid::GridCtx;
use crate::manager::InstanceTask;
use crate::models::Instance;

/// An operator instance running on this peer.
struct RunningInstance {
    assignment: Instance,
    stop_tx: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

/// A task starting & stopping the operator instances assigned to this peer.
pub(super) struct Supervisor {
    ctx: Arc<GridCtx>,
    tasks: ReceiverStream<InstanceTask>,
    running: HashMap<(String, u32), RunningInstance>,
    shutdown_rx: BroadcastStream<()>,
}

impl Supervisor {
    pub(super) fn new(ctx: Arc<GridCtx>, tasks: mpsc::Receiver<InstanceTask>) -> Self {
        let shutdown_rx = BroadcastStream::new(ctx.shutdown_tx.subscribe());
        Self {
            ctx,
            tasks: ReceiverStream::new(tasks),
            running: HashMap::new(),
            shutdown_rx,
        }
    }

    pub(super) fn spawn(self) -> JoinHandle<Result<()>> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) -> Result<()> {
        tracing::debug!("instance supervisor started");
        loop {
            tokio::select! {
                Some(task) = self.tasks.next() => self.handle_task(task).await,
                _ = self.shutdown_rx.next() => break,
                else => break,
            }
        }

        let keys: Vec<_> = self.running.keys().cloned().collect();
        for key in keys {
            self.stop_instance(&key).await;
        }
        tracing::debug!("instance supervisor stopped");
        Ok(())
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn handle_task(&mut self, task: InstanceTask) {
        match task {
            InstanceTask::Start(inst) => {
                let key = inst.key();
                if let Some(running) = self.running.get_mut(&key) {
                    if running.assignment.same_placement(&inst) && !running.handle.is_finished() {
                        running.assignment = inst;
                        return;
                    }
                    self.stop_instance(&key).await;
                }
                let (stop_tx, stop_rx) = oneshot::channel();
                tracing::info!(operator = %inst.fname, id = inst.id, "starting operator instance");
                let handle = InstanceRuntime::new(self.ctx.clone(), inst.clone(), stop_rx).spawn();
                self.running.insert(key, RunningInstance { assignment: inst, stop_tx, handle });
            }
            InstanceTask::Stop(inst) => self.stop_instance(&inst.key()).await,
        }
    }

    /// Stop the given instance, if running, and wait for it to drain.
    async fn stop_instance(&mut self, key: &(String, u32)) {
        let running = match self.running.remove(key) {
            Some(running) => running,
            None => return,
        };
        tracing::info!(operator = %key.0, id = key.1, "stopping operator instance");
        let _ = running.stop_tx.send(());
        if let Err(err) = running.handle.await {
            tracing::error!(error = ?err, operator = %key.0, id = key.1, "error joining operator instance");
        }
    }
}
