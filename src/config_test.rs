use std::time::Duration;

use anyhow::Result;

use crate::config::*;

#[test]
fn config_deserializes_from_full_env() -> Result<()> {
    let config: Config = envy::prefixed(ENV_PREFIX).from_iter(vec![
        ("GRID_NAME".into(), "loadtest".into()),
        ("GRID_NPEERS".into(), "3".into()),
        ("GRID_PEER_NAME".into(), "peer-0".into()),
        ("GRID_LIVENESS_INTERVAL_MS".into(), "500".into()),
        ("GRID_LEADER_TIMEOUT_MS".into(), "4000".into()),
        ("GRID_MAX_LEADER_TIME_MS".into(), "60000".into()),
        ("GRID_OFFSET_RESOLUTION_TIMEOUT_MS".into(), "1000".into()),
        ("GRID_CHANNEL_CAPACITY".into(), "64".into()),
        ("GRID_READ_BATCH_SIZE".into(), "250".into()),
        ("GRID_STORAGE_DATA_PATH".into(), "/var/lib/grid".into()),
    ])?;
    config.validate()?;

    assert!(config.name == "loadtest", "unexpected value parsed for GRID_NAME, got {}, expected {}", config.name, "loadtest");
    assert!(config.npeers == 3, "unexpected value parsed for GRID_NPEERS, got {}, expected {}", config.npeers, 3);
    assert!(
        config.peer_name.as_deref() == Some("peer-0"),
        "unexpected value parsed for GRID_PEER_NAME, got {:?}, expected {:?}",
        config.peer_name,
        Some("peer-0")
    );
    assert!(
        config.liveness_interval() == Duration::from_millis(500),
        "unexpected value parsed for GRID_LIVENESS_INTERVAL_MS, got {:?}, expected {:?}",
        config.liveness_interval(),
        Duration::from_millis(500)
    );
    assert!(
        config.leader_timeout() == Duration::from_millis(4000),
        "unexpected value parsed for GRID_LEADER_TIMEOUT_MS, got {:?}, expected {:?}",
        config.leader_timeout(),
        Duration::from_millis(4000)
    );
    assert!(
        config.max_leader_time() == Some(Duration::from_secs(60)),
        "unexpected value parsed for GRID_MAX_LEADER_TIME_MS, got {:?}, expected {:?}",
        config.max_leader_time(),
        Some(Duration::from_secs(60))
    );
    assert!(config.channel_capacity == 64, "unexpected value parsed for GRID_CHANNEL_CAPACITY, got {}, expected {}", config.channel_capacity, 64);
    assert!(config.read_batch_size == 250, "unexpected value parsed for GRID_READ_BATCH_SIZE, got {}, expected {}", config.read_batch_size, 250);
    assert!(
        config.storage_data_path == "/var/lib/grid",
        "unexpected value parsed for GRID_STORAGE_DATA_PATH, got {}, expected {}",
        config.storage_data_path,
        "/var/lib/grid"
    );
    assert!(config.cmd_topic() == "loadtest-cmd", "unexpected command topic, got {}, expected {}", config.cmd_topic(), "loadtest-cmd");
    assert!(config.quorum() == 2, "unexpected quorum, got {}, expected {}", config.quorum(), 2);

    Ok(())
}

#[test]
fn config_deserializes_from_sparse_env() -> Result<()> {
    let config: Config = envy::prefixed(ENV_PREFIX).from_iter(vec![("GRID_NAME".into(), "loadtest".into()), ("GRID_NPEERS".into(), "4".into())])?;
    config.validate()?;

    assert!(config.peer_name.is_none(), "expected GRID_PEER_NAME to default to None, got {:?}", config.peer_name);
    assert!(
        config.liveness_interval_ms == DEFAULT_LIVENESS_INTERVAL_MS,
        "unexpected default for GRID_LIVENESS_INTERVAL_MS, got {}, expected {}",
        config.liveness_interval_ms,
        DEFAULT_LIVENESS_INTERVAL_MS
    );
    assert!(
        config.leader_timeout_ms == DEFAULT_LEADER_TIMEOUT_MS,
        "unexpected default for GRID_LEADER_TIMEOUT_MS, got {}, expected {}",
        config.leader_timeout_ms,
        DEFAULT_LEADER_TIMEOUT_MS
    );
    assert!(config.max_leader_time().is_none(), "expected max leader time to be disabled, got {:?}", config.max_leader_time());
    assert!(
        config.channel_capacity == DEFAULT_CHANNEL_CAPACITY,
        "unexpected default for GRID_CHANNEL_CAPACITY, got {}, expected {}",
        config.channel_capacity,
        DEFAULT_CHANNEL_CAPACITY
    );
    assert!(
        config.read_batch_size == DEFAULT_READ_BATCH_SIZE,
        "unexpected default for GRID_READ_BATCH_SIZE, got {}, expected {}",
        config.read_batch_size,
        DEFAULT_READ_BATCH_SIZE
    );
    assert!(
        config.storage_data_path == DEFAULT_DATA_PATH,
        "unexpected default for GRID_STORAGE_DATA_PATH, got {}, expected {}",
        config.storage_data_path,
        DEFAULT_DATA_PATH
    );
    assert!(config.quorum() == 3, "unexpected quorum for 4 peers, got {}, expected {}", config.quorum(), 3);

    Ok(())
}

#[test]
fn config_rejects_leader_timeout_below_liveness_interval() {
    let mut config = Config::with_name("loadtest", 1);
    config.liveness_interval_ms = 1_000;
    config.leader_timeout_ms = 500;

    let res = config.validate();
    assert!(res.is_err(), "expected validation error for leader timeout below liveness interval, got {:?}", res);
}

#[test]
fn quorum_is_majority_of_peers() {
    for (npeers, expected) in [(1, 1), (2, 2), (3, 2), (4, 3), (5, 3), (7, 4)] {
        let config = Config::with_name("loadtest", npeers);
        assert_eq!(config.quorum(), expected, "unexpected quorum for {} peers, got {} expected {}", npeers, config.quorum(), expected);
    }
}
