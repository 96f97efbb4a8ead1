use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;

use crate::config::Config;
use crate::fixtures;
use crate::log::{CmdMsgCodec, ReadWriteLog, SledLog};
use crate::voter::{LeaderState, Voter};

type Handles = (JoinHandle<Result<()>>, JoinHandle<Result<()>>, watch::Receiver<LeaderState>);

fn setup_log(config: &Config) -> Result<SledLog> {
    let log = SledLog::open(config)?;
    let topic = config.cmd_topic();
    log.create_topic(&topic, 1)?;
    log.add_decoder(Arc::new(CmdMsgCodec), &[topic.as_str()]);
    log.add_encoder(Arc::new(CmdMsgCodec), &[topic.as_str()]);
    Ok(log)
}

fn spawn_voter(config: Arc<Config>, log: &SledLog, id: &str, shutdown_tx: broadcast::Sender<()>) -> Result<Handles> {
    let topic = config.cmd_topic();
    let events = log.read(&topic, &[0])?;
    let (out_tx, out_rx) = mpsc::channel(config.channel_capacity);
    let writer = log.write(&topic, out_rx)?;
    let (voter, leader_rx) = Voter::new(config, id.into(), format!("{}-run", id), events, out_tx, shutdown_tx);
    Ok((voter.spawn(), writer, leader_rx))
}

/// Wait until the given peers agree on a single leader.
async fn await_agreement(peers: &[(&str, &watch::Receiver<LeaderState>)]) -> Result<(u64, String)> {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let states: Vec<_> = peers.iter().map(|(id, rx)| (*id, rx.borrow().clone())).collect();
        let leaders: Vec<_> = states
            .iter()
            .filter_map(|(id, state)| match state {
                LeaderState::Leading { term } => Some((*term, id.to_string())),
                LeaderState::Following { term, leader } => Some((*term, leader.clone())),
                LeaderState::Standby => None,
            })
            .collect();
        let num_leading = states.iter().filter(|(_, state)| state.is_leading()).count();
        if leaders.len() == peers.len() && num_leading == 1 && leaders.windows(2).all(|pair| pair[0] == pair[1]) {
            return Ok(leaders[0].clone());
        }
        if tokio::time::Instant::now() > deadline {
            bail!("timeout waiting for peers to agree on a leader, last states {:?}", states);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn single_peer_elects_itself() -> Result<()> {
    fixtures::init_tracing();
    let (config, _tmpdir) = Config::new_test()?;
    let log = setup_log(&config)?;
    let (shutdown_tx, _) = broadcast::channel(1);

    let (voter, _writer, leader_rx) = spawn_voter(config.clone(), &log, "test-grid-peer-0", shutdown_tx.clone())?;
    let (term, leader) = await_agreement(&[("test-grid-peer-0", &leader_rx)]).await?;
    assert_eq!(leader, "test-grid-peer-0", "expected self to lead got {}", leader);
    assert!(term >= 1, "expected a term of at least 1 got {}", term);

    let _ = shutdown_tx.send(());
    voter.await.context("error joining voter")??;
    assert_eq!(*leader_rx.borrow(), LeaderState::Standby, "expected standby after shutdown");
    Ok(())
}

#[tokio::test]
async fn peers_agree_on_leader_through_log() -> Result<()> {
    fixtures::init_tracing();
    let (config, _tmpdir) = Config::new_test()?;
    let mut config = (*config).clone();
    config.npeers = 3;
    let config = Arc::new(config);
    let log = setup_log(&config)?;
    let (shutdown_tx, _) = broadcast::channel(1);

    let ids = ["test-grid-peer-0", "test-grid-peer-1", "test-grid-peer-2"];
    let mut handles = vec![];
    for id in ids {
        handles.push(spawn_voter(config.clone(), &log, id, shutdown_tx.clone())?);
    }
    let peers: Vec<_> = ids.iter().copied().zip(handles.iter().map(|(_, _, rx)| rx)).collect();
    let (_, leader) = await_agreement(&peers).await?;
    assert!(ids.contains(&leader.as_str()), "expected a known leader got {}", leader);

    let _ = shutdown_tx.send(());
    for (voter, _, _) in handles {
        voter.await.context("error joining voter")??;
    }
    Ok(())
}
