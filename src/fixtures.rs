use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use tokio::sync::mpsc;

use crate::config::Config;
use crate::grid::Actor;
use crate::log::{JsonCodec, ReadWriteLog, SledLog};
use crate::models::{Event, EventRx, Message};

/// The application payload used throughout tests.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Num {
    pub val: u64,
}

/// Install a test subscriber for tracing output, filtered by `RUST_LOG`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Open a log under the config's data path, creating the given topics with a `Num` codec.
pub fn open_log(config: &Config, topics: &[(&str, u32)]) -> Result<SledLog> {
    let log = SledLog::open(config)?;
    let codec = Arc::new(JsonCodec::<Num>::new());
    for (topic, partitions) in topics {
        log.create_topic(topic, *partitions)?;
        log.add_decoder(codec.clone(), &[*topic]);
        log.add_encoder(codec.clone(), &[*topic]);
    }
    Ok(log)
}

/// Receive exactly `n` events from the given stream, failing if they do not arrive in time.
pub async fn recv_n(rx: &mut EventRx, n: usize, timeout: Duration) -> Result<Vec<Event>> {
    let mut events = Vec::with_capacity(n);
    let deadline = tokio::time::sleep(timeout);
    tokio::pin!(deadline);
    while events.len() < n {
        tokio::select! {
            event_opt = rx.recv() => match event_opt {
                Some(event) => events.push(event),
                None => bail!("stream closed after {} events, expected {}", events.len(), n),
            },
            _ = &mut deadline => bail!("timeout after receiving {} events, expected {}", events.len(), n),
        }
    }
    Ok(events)
}

/// Extract the `Num` payload of an event.
pub fn num_of(event: &Event) -> Result<u64> {
    match &event.message {
        Message::Data(payload) => payload.downcast_ref::<Num>().map(|num| num.val).context("payload is not a Num"),
        other => bail!("expected a data message, got {:?}", other),
    }
}

/// Write the given numbers to a topic, keyed by their value, waiting for the writer to finish.
pub async fn write_nums(log: &SledLog, topic: &str, nums: impl IntoIterator<Item = u64>) -> Result<()> {
    let (tx, rx) = tokio::sync::mpsc::channel(16);
    let handle = log.write(topic, rx)?;
    for val in nums {
        tx.send(Event::writable(topic, val.to_string(), Num { val }))
            .await
            .context("writer closed early")?;
    }
    drop(tx);
    handle.await.context("error joining writer")??;
    Ok(())
}

/// How a test actor resolves its offset control events.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Resolve {
    Min,
    Max,
    /// Drop the control event without resolving it.
    Drop,
}

/// An actor which adds a constant to every `Num` it reads, emitting the result to `output`.
pub struct Adder {
    pub output: String,
    pub add: u64,
    pub resolve: Resolve,
}

impl Adder {
    pub fn boxed(output: &str, add: u64, resolve: Resolve) -> Box<dyn Actor> {
        Box::new(Self {
            output: output.into(),
            add,
            resolve,
        })
    }
}

impl Actor for Adder {
    fn act(self: Box<Self>, mut input: EventRx, mut state: EventRx) -> EventRx {
        let (tx, rx) = mpsc::channel(16);
        tokio::spawn(async move {
            while let Some(event) = state.recv().await {
                if let Message::MinMaxOffset(ctl) = event.message {
                    match self.resolve {
                        Resolve::Min => ctl.use_min(),
                        Resolve::Max => ctl.use_max(),
                        Resolve::Drop => drop(ctl),
                    }
                }
            }
            while let Some(event) = input.recv().await {
                let val = match num_of(&event) {
                    Ok(val) => val,
                    Err(_) => continue,
                };
                let out = Event::writable(self.output.as_str(), event.key, Num { val: val + self.add });
                if tx.send(out).await.is_err() {
                    break;
                }
            }
        });
        rx
    }
}
