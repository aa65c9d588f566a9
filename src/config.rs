use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use config::builder::DefaultState;
use config::{Config, ConfigBuilder, Environment};
use dotenv::dotenv;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::errors::{RaftError, RaftResult};
use crate::peers::Quorum;

pub const ENV_PREFIX: &str = "RAFT";
pub const DEFAULT_TICK_MS: u64 = 1000;
pub const DEFAULT_TIMEOUT_MS: u64 = 500;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RaftConfig {
    /// The pid of the local replica; must be a member of the quorum.
    pub replica_id: u32,
    /// Heartbeat period. Election timeouts are drawn from `[2 * tick, 4 * tick)`.
    pub tick_ms: u64,
    /// Upper bound on a single outbound RPC; must be shorter than the tick.
    pub timeout_ms: u64,
    /// When set, entries are only sent to followers on heartbeats instead of as soon as
    /// they are proposed.
    pub aggregate: bool,
    pub peers_path: Option<PathBuf>,
    /// Directory for the durable log; the log is kept in memory when unset.
    pub data_dir: Option<PathBuf>,
    #[serde(skip)]
    pub quorum: Option<Quorum>,
}

impl Default for RaftConfig {
    fn default() -> Self {
        Self {
            replica_id: 0,
            tick_ms: DEFAULT_TICK_MS,
            timeout_ms: DEFAULT_TIMEOUT_MS,
            aggregate: false,
            peers_path: None,
            data_dir: None,
            quorum: None,
        }
    }
}

impl RaftConfig {
    /// Loads the configuration from `RAFT_*` environment variables, honouring a `.env`
    /// file in the working directory.
    pub fn from_env() -> RaftResult<RaftConfig> {
        Self::from_env_with(None, None)
    }

    /// Like [`RaftConfig::from_env`], with command line values taking precedence.
    pub fn from_env_with(replica_id: Option<u32>, peers_path: Option<&Path>) -> RaftResult<RaftConfig> {
        dotenv().ok(); //Load .env file if present
        let mut builder = Config::builder().add_source(Environment::with_prefix(ENV_PREFIX).try_parsing(true));
        if let Some(replica_id) = replica_id {
            builder = builder
                .set_override("replica_id", replica_id as i64)
                .context("Unable to override replica id")?;
        }
        if let Some(path) = peers_path {
            builder = builder
                .set_override("peers_path", path.display().to_string())
                .context("Unable to override peers path")?;
        }
        Self::from_builder(builder)
    }

    pub fn from_builder(builder: ConfigBuilder<DefaultState>) -> RaftResult<RaftConfig> {
        let config = builder
            .set_default("tick_ms", DEFAULT_TICK_MS as i64)
            .and_then(|b| b.set_default("timeout_ms", DEFAULT_TIMEOUT_MS as i64))
            .and_then(|b| b.set_default("aggregate", false))
            .context("Unable to set configuration defaults")?
            .build()
            .context("Unable to build configuration")?;

        let conf: RaftConfig = config.try_deserialize().context("Unable to deserialize configuration")?;
        conf.validate()?;
        info!(
            replica_id = conf.replica_id,
            tick_ms = conf.tick_ms,
            timeout_ms = conf.timeout_ms,
            aggregate = conf.aggregate,
            "loaded configuration"
        );
        Ok(conf)
    }

    pub fn validate(&self) -> RaftResult<()> {
        if self.replica_id == 0 {
            return Err(RaftError::Config("replica id is required".to_string()));
        }

        if self.tick_ms == 0 {
            return Err(RaftError::Config("tick must be greater than zero".to_string()));
        }

        if self.timeout_ms >= self.tick_ms {
            return Err(RaftError::Config(format!(
                "timeout ({}ms) must be less than tick ({}ms)",
                self.timeout_ms, self.tick_ms
            )));
        }

        match (&self.peers_path, &self.quorum) {
            (Some(_), Some(_)) => Err(RaftError::Config("specify either a peers path or a quorum, not both".to_string())),
            (None, None) => Err(RaftError::Config("a peers path or a quorum is required".to_string())),
            _ => Ok(()),
        }
    }

    /// The validated quorum, loaded from the peers file if one was configured. The local
    /// replica must be one of its peers.
    pub fn quorum(&self) -> RaftResult<Quorum> {
        let quorum = match (&self.quorum, &self.peers_path) {
            (Some(quorum), _) => quorum.clone(),
            (None, Some(path)) => Quorum::load(path)?,
            (None, None) => return Err(RaftError::Config("a peers path or a quorum is required".to_string())),
        };
        quorum.validate()?;

        if !quorum.contains(self.replica_id) {
            return Err(RaftError::Config(format!(
                "replica {} is not a member of quorum {}",
                self.replica_id, quorum.qid
            )));
        }
        Ok(quorum)
    }

    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Bounds of the randomized election timeout.
    pub fn candidacy_timeout(&self) -> (Duration, Duration) {
        (self.tick() * 2, self.tick() * 4)
    }
}
