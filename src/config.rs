//! Runtime configuration.

use std::time::Duration;

use anyhow::{ensure, Context, Result};
use serde::Deserialize;

/// The prefix of all environment variables read by `Config::new`.
pub const ENV_PREFIX: &str = "GRID_";

pub(crate) const DEFAULT_LIVENESS_INTERVAL_MS: u64 = 2_000;
pub(crate) const DEFAULT_LEADER_TIMEOUT_MS: u64 = 10_000;
pub(crate) const DEFAULT_OFFSET_RESOLUTION_TIMEOUT_MS: u64 = 30_000;
pub(crate) const DEFAULT_CHANNEL_CAPACITY: usize = 1024;
pub(crate) const DEFAULT_READ_BATCH_SIZE: usize = 1000;
/// The default path to use for the embedded log's data.
pub const DEFAULT_DATA_PATH: &str = "/usr/local/grid/data";

/// Runtime configuration data.
#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    /// The name of the grid.
    ///
    /// All peers of the same grid must use the same name. The command topic of the grid is
    /// named `{name}-cmd`, and the name is used as the namespace of every peer's identity.
    pub name: String,
    /// The expected number of peers taking part in the grid, used to derive the quorum.
    pub npeers: usize,
    /// The name of this peer, which must be unique within the grid.
    ///
    /// A random name is generated when this is not set.
    #[serde(default)]
    pub peer_name: Option<String>,

    /// The interval at which peers emit liveness entries to the command log.
    #[serde(default = "default_liveness_interval_ms")]
    pub liveness_interval_ms: u64,
    /// The duration without a liveness entry from the leader after which a new election begins.
    ///
    /// Peers which have not been observed for this duration are also dropped from assignment
    /// planning by the leader.
    #[serde(default = "default_leader_timeout_ms")]
    pub leader_timeout_ms: u64,
    /// Maximum time a peer will hold leadership before stepping down, `0` disables this.
    ///
    /// This is a test hook used to force re-elections, normally it should be `0`.
    #[serde(default)]
    pub max_leader_time_ms: u64,
    /// How long an operator instance has to resolve an offset control event.
    #[serde(default = "default_offset_resolution_timeout_ms")]
    pub offset_resolution_timeout_ms: u64,
    /// The capacity of the buffered channels used throughout the runtime.
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
    /// The maximum number of records a log reader fetches from storage at once.
    #[serde(default = "default_read_batch_size")]
    pub read_batch_size: usize,

    /// The path to the embedded log's data on disk.
    #[serde(default = "default_data_path")]
    pub storage_data_path: String,
}

impl Config {
    /// Create a new config instance from the runtime environment.
    ///
    /// All variables are read with the `GRID_` prefix, e.g. `GRID_NAME` and `GRID_NPEERS`.
    #[allow(clippy::new_without_default)]
    pub fn new() -> Result<Self> {
        let config: Config = envy::prefixed(ENV_PREFIX).from_env().context("error building config from env")?;
        config.validate()?;
        Ok(config)
    }

    /// Create a config with the given grid name & peer count, using defaults for everything else.
    pub fn with_name(name: impl Into<String>, npeers: usize) -> Self {
        Self {
            name: name.into(),
            npeers,
            peer_name: None,
            liveness_interval_ms: DEFAULT_LIVENESS_INTERVAL_MS,
            leader_timeout_ms: DEFAULT_LEADER_TIMEOUT_MS,
            max_leader_time_ms: 0,
            offset_resolution_timeout_ms: DEFAULT_OFFSET_RESOLUTION_TIMEOUT_MS,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            read_batch_size: DEFAULT_READ_BATCH_SIZE,
            storage_data_path: default_data_path(),
        }
    }

    /// Statically validate this config.
    pub fn validate(&self) -> Result<()> {
        ensure!(self.npeers >= 1, "npeers must be at least 1");
        ensure!(self.channel_capacity >= 1, "channel_capacity must be at least 1");
        ensure!(self.read_batch_size >= 1, "read_batch_size must be at least 1");
        ensure!(self.liveness_interval_ms >= 1, "liveness_interval_ms must be at least 1");
        ensure!(
            self.leader_timeout_ms > self.liveness_interval_ms,
            "leader_timeout_ms must be greater than liveness_interval_ms"
        );
        Ok(())
    }

    /// The name of the grid's command topic.
    pub fn cmd_topic(&self) -> String {
        format!("{}-cmd", self.name)
    }

    /// The number of confirmations needed to elect a leader.
    pub fn quorum(&self) -> usize {
        (self.npeers / 2) + 1
    }

    pub fn liveness_interval(&self) -> Duration {
        Duration::from_millis(self.liveness_interval_ms)
    }

    pub fn leader_timeout(&self) -> Duration {
        Duration::from_millis(self.leader_timeout_ms)
    }

    /// The max leader time, if enabled.
    pub fn max_leader_time(&self) -> Option<Duration> {
        match self.max_leader_time_ms {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        }
    }

    pub fn offset_resolution_timeout(&self) -> Duration {
        Duration::from_millis(self.offset_resolution_timeout_ms)
    }
}

fn default_liveness_interval_ms() -> u64 {
    DEFAULT_LIVENESS_INTERVAL_MS
}

fn default_leader_timeout_ms() -> u64 {
    DEFAULT_LEADER_TIMEOUT_MS
}

fn default_offset_resolution_timeout_ms() -> u64 {
    DEFAULT_OFFSET_RESOLUTION_TIMEOUT_MS
}

fn default_channel_capacity() -> usize {
    DEFAULT_CHANNEL_CAPACITY
}

fn default_read_batch_size() -> usize {
    DEFAULT_READ_BATCH_SIZE
}

/// The default path to use for data storage.
pub fn default_data_path() -> String {
    DEFAULT_DATA_PATH.to_string()
}

#[cfg(test)]
impl Config {
    /// Create a config suitable for tests, with short timers and a temporary data dir.
    pub fn new_test() -> Result<(std::sync::Arc<Self>, tempfile::TempDir)> {
        let tmpdir = tempfile::tempdir_in("/tmp").context("error creating tmp dir in /tmp")?;
        let mut config = Self::with_name("test-grid", 1);
        config.liveness_interval_ms = 20;
        config.leader_timeout_ms = 200;
        config.offset_resolution_timeout_ms = 1_000;
        config.read_batch_size = 8;
        config.storage_data_path = tmpdir.path().to_string_lossy().to_string();
        Ok((std::sync::Arc::new(config), tmpdir))
    }
}
