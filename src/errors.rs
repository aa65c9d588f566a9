use thiserror::Error;

use crate::raft::state::State;

pub type RaftResult<T> = Result<T, RaftError>;

#[derive(Error, Debug)]
pub enum RaftError {
    #[error("{0}")]
    ApplicationStartup(String),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error(transparent)]
    Quorum(#[from] QuorumError),
    #[error(transparent)]
    Log(#[from] LogError),
    #[error("replica is not the leader (current leader: {0})")]
    NotLeader(u32),
    #[error("cannot move replica from {from} to {to}")]
    InvalidTransition { from: State, to: State },
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    InternalServerErrorWithContext(String),
    #[error(transparent)]
    Transport(#[from] tonic::transport::Error),
    #[error(transparent)]
    AnyhowError(#[from] anyhow::Error),
}

/// Errors returned by [`crate::raft::log::Log`] operations.
///
/// Sequencing variants are protocol violations and must be turned into an RPC level
/// rejection by the replica; `Sync` means the log may be ahead of disk and the in-flight
/// operation must not be acknowledged.
#[derive(Error, Debug)]
pub enum LogError {
    #[error("cannot append entry in earlier term ({entry} < {last})")]
    AppendEarlierTerm { entry: u64, last: u64 },
    #[error("cannot append entry with smaller index ({entry} <= {last})")]
    AppendSmallerIndex { entry: u64, last: u64 },
    #[error("cannot skip index ({entry} > {next})")]
    AppendSkipIndex { entry: u64, next: u64 },
    #[error("cannot commit invalid index {0}")]
    CommitInvalidIndex(u64),
    #[error("index at {0} already committed")]
    IndexAlreadyCommitted(u64),
    #[error("cannot truncate invalid index {0}")]
    TruncInvalidIndex(u64),
    #[error("cannot truncate already committed index {0}")]
    TruncCommittedIndex(u64),
    #[error("entry at index {index} does not match term {term}")]
    TruncTermMismatch { index: u64, term: u64 },
    #[error("no entry at index {0}")]
    NoEntry(u64),
    #[error("no entry before index {0}")]
    NoEntryBefore(u64),
    #[error("no entries after {0}")]
    NoEntriesAfter(u64),
    #[error("a sync is required to load the log")]
    SyncRequired,
    #[error("could not sync log: {0:#}")]
    Sync(#[source] anyhow::Error),
    #[error("state machine failed at index {index}: {source:#}")]
    StateMachine {
        index: u64,
        #[source]
        source: anyhow::Error,
    },
}

impl LogError {
    /// True for errors that violate the log's sequencing invariants, as opposed to
    /// durability or state machine failures.
    pub fn is_sequencing(&self) -> bool {
        !matches!(self, LogError::SyncRequired | LogError::Sync(_) | LogError::StateMachine { .. })
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("invalid quorum configuration: quorum id is required")]
    MissingQid,
    #[error("invalid quorum configuration: no peers assigned to quorum")]
    NoPeers,
    #[error("invalid quorum configuration: peer ids must be unique")]
    UniquePid,
    #[error("invalid peer configuration: peer id is required")]
    MissingPid,
    #[error("invalid peer configuration: name, bind_addr, and endpoint are required")]
    PeerMissingField,
}

#[derive(Error, Debug)]
pub enum QuorumError {
    #[error("{}", join_errors(.0))]
    Invalid(Vec<ValidationError>),
    #[error("unknown file extension {0:?}")]
    UnknownExtension(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),
}

fn join_errors(errors: &[ValidationError]) -> String {
    let messages = errors.iter().map(|e| e.to_string()).collect::<Vec<String>>();
    format!("{} error(s) occurred: {}", errors.len(), messages.join("; "))
}

impl From<RaftError> for tonic::Status {
    fn from(err: RaftError) -> Self {
        match err {
            RaftError::BadRequest(msg) => tonic::Status::invalid_argument(msg),
            RaftError::NotLeader(leader) => tonic::Status::failed_precondition(format!("not the leader, current leader is {leader}")),
            err => tonic::Status::internal(err.to_string()),
        }
    }
}
