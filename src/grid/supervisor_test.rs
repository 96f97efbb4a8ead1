use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio::sync::{broadcast, mpsc, Notify};

use crate::config::Config;
use crate::fixtures;
use crate::grid::supervisor::Supervisor;
use crate::grid::{Actor, GridCtx, Op};
use crate::manager::InstanceTask;
use crate::meter::Registry;
use crate::models::{EventRx, Instance, Message, TopicSlice};

const TIMEOUT: Duration = Duration::from_secs(5);

/// The lifecycle events of every actor, in order.
type Lifecycle = Arc<Mutex<Vec<String>>>;

/// An actor which records its start & stop, and which instance 0 can be told to end early.
struct Counted {
    id: u32,
    lifecycle: Lifecycle,
    finish: Arc<Notify>,
}

impl Actor for Counted {
    fn act(self: Box<Self>, mut input: EventRx, mut state: EventRx) -> EventRx {
        let (tx, rx) = mpsc::channel(1);
        tokio::spawn(async move {
            while let Some(event) = state.recv().await {
                if let Message::MinMaxOffset(ctl) = event.message {
                    ctl.use_max();
                }
            }
            loop {
                tokio::select! {
                    event_opt = input.recv() => if event_opt.is_none() { break },
                    _ = self.finish.notified(), if self.id == 0 => break,
                }
            }
            record(&self.lifecycle, format!("stop-{}", self.id));
            drop(tx);
        });
        rx
    }
}

fn record(lifecycle: &Lifecycle, entry: String) {
    lifecycle.lock().expect("lifecycle lock poisoned").push(entry);
}

fn snapshot(lifecycle: &Lifecycle) -> Vec<String> {
    lifecycle.lock().expect("lifecycle lock poisoned").clone()
}

/// Wait until the lifecycle holds exactly the expected entries.
async fn await_lifecycle(lifecycle: &Lifecycle, expected: &[&str]) -> Result<()> {
    let deadline = tokio::time::Instant::now() + TIMEOUT;
    loop {
        let got = snapshot(lifecycle);
        if got.len() >= expected.len() {
            let expected: Vec<String> = expected.iter().map(|entry| entry.to_string()).collect();
            assert_eq!(got, expected, "expected lifecycle {:?} got {:?}", expected, got);
            return Ok(());
        }
        if tokio::time::Instant::now() > deadline {
            bail!("timeout waiting for lifecycle {:?}, got {:?}", expected, got);
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

fn instance(id: u32, seq: u64, partitions: Vec<i32>) -> Instance {
    Instance {
        term: 1,
        seq,
        fname: "counted".into(),
        id,
        peer: "test-grid-peer-0".into(),
        topic_slices: vec![TopicSlice {
            topic: "numbers".into(),
            partitions,
        }],
    }
}

#[tokio::test]
async fn supervisor_starts_restarts_and_drains_instances() -> Result<()> {
    fixtures::init_tracing();
    let (config, _tmpdir) = Config::new_test()?;
    let log = fixtures::open_log(&config, &[("numbers", 3)])?;
    let lifecycle: Lifecycle = Default::default();
    let finish = Arc::new(Notify::new());

    let (factory_lifecycle, factory_finish) = (lifecycle.clone(), finish.clone());
    let op = Op {
        parallelism: 3,
        factory: Arc::new(move |_: &str, id: u32| -> Box<dyn Actor> {
            record(&factory_lifecycle, format!("start-{}", id));
            Box::new(Counted {
                id,
                lifecycle: factory_lifecycle.clone(),
                finish: factory_finish.clone(),
            })
        }),
        topics: vec!["numbers".to_string()].into_iter().collect::<BTreeSet<_>>(),
    };
    let (shutdown_tx, _) = broadcast::channel(1);
    let (fatal_tx, mut fatal_rx) = mpsc::unbounded_channel();
    let ctx = Arc::new(GridCtx {
        config,
        log: Arc::new(log),
        ops: vec![("counted".to_string(), op)].into_iter().collect(),
        writers: Default::default(),
        registry: Registry::new(),
        shutdown_tx: shutdown_tx.clone(),
        fatal_tx,
    });
    let (tasks_tx, tasks_rx) = mpsc::channel(16);
    let handle = Supervisor::new(ctx, tasks_rx).spawn();

    tasks_tx.send(InstanceTask::Start(instance(0, 1, vec![0]))).await?;
    await_lifecycle(&lifecycle, &["start-0"]).await?;

    // The same placement under a newer seq is a no-op, instance 1 starting proves it was handled.
    tasks_tx.send(InstanceTask::Start(instance(0, 2, vec![0]))).await?;
    tasks_tx.send(InstanceTask::Start(instance(1, 3, vec![1]))).await?;
    await_lifecycle(&lifecycle, &["start-0", "start-1"]).await?;

    // A changed placement stops the old runtime before starting the new one.
    tasks_tx.send(InstanceTask::Start(instance(0, 4, vec![0, 2]))).await?;
    await_lifecycle(&lifecycle, &["start-0", "start-1", "stop-0", "start-0"]).await?;

    // An instance which has finished on its own is started again for the same placement.
    finish.notify_one();
    await_lifecycle(&lifecycle, &["start-0", "start-1", "stop-0", "start-0", "stop-0"]).await?;
    tokio::time::sleep(Duration::from_millis(100)).await;
    tasks_tx.send(InstanceTask::Start(instance(0, 5, vec![0, 2]))).await?;
    await_lifecycle(&lifecycle, &["start-0", "start-1", "stop-0", "start-0", "stop-0", "start-0"]).await?;

    // Stop drains the instance.
    tasks_tx.send(InstanceTask::Stop(instance(0, 6, vec![0, 2]))).await?;
    await_lifecycle(&lifecycle, &["start-0", "start-1", "stop-0", "start-0", "stop-0", "start-0", "stop-0"]).await?;

    // Shutdown drains everything still running.
    let _ = shutdown_tx.send(());
    tokio::time::timeout(TIMEOUT, handle).await.context("timeout waiting for supervisor shutdown")???;
    let got = snapshot(&lifecycle);
    assert_eq!(got.last().map(String::as_str), Some("stop-1"), "expected instance 1 to be drained on shutdown got {:?}", got);
    assert!(fatal_rx.try_recv().is_err(), "expected no fatal errors");
    Ok(())
}
