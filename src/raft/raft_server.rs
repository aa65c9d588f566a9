use std::sync::Arc;

use anyhow::{anyhow, Context};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::RaftConfig;
use crate::errors::{RaftError, RaftResult};
use crate::raft::log::{Log, StateMachine};
use crate::raft::replica::{Replica, ReplicaStatus, Ticks};
use crate::raft::sync::{FileSync, MemorySync};
use crate::rpc::peer_network::PeerNetwork;
use crate::rpc::raft::LogEntry;
use crate::rpc::server::RaftGrpcServerStub;
use crate::rpc::{RaftEvent, ReplicaReceiver, ReplicaSender};

pub struct RaftServer {}

impl RaftServer {
    /// Builds the replica described by `conf` and starts its gRPC service, peer network
    /// and run loop. Everything runs until the returned handle is shut down.
    pub async fn start_server(conf: RaftConfig, sm: Box<dyn StateMachine>) -> RaftResult<ReplicaHandle> {
        conf.validate()?;
        let quorum = Arc::new(conf.quorum()?);
        let peer = quorum
            .get(conf.replica_id)
            .ok_or_else(|| RaftError::Config(format!("replica {} is not a member of the quorum", conf.replica_id)))?
            .clone();
        info!("Initializing replica {} ({}) on {}...", peer.pid, peer.name, peer.bind_addr);

        //CHANNELS
        //Requests from the grpc server and the handle, and replies from peers, all enter the run loop here
        let (server_to_replica_tx, replica_from_server_rx) = mpsc::unbounded_channel();
        //Requests from the replica to its peers. The replica never talks to the network directly.
        let (replica_to_peers_tx, peers_from_replica_rx) = mpsc::unbounded_channel();

        let log = Self::open_log(&conf, sm)?;
        let (mut replica, ticks) = Replica::new(&conf, quorum.clone(), log, replica_to_peers_tx)?;

        let listener = TcpListener::bind(&peer.bind_addr)
            .await
            .map_err(|e| RaftError::ApplicationStartup(format!("Unable to bind {}: {e}", peer.bind_addr)))?;
        let shutdown = CancellationToken::new();

        let grpc_server = RaftGrpcServerStub::new(server_to_replica_tx.clone());
        let grpc_handle = tokio::spawn(grpc_server.serve(listener, shutdown.clone()));

        let peer_network = PeerNetwork::new(conf.replica_id, &quorum, conf.timeout())?;
        let peer_handle = tokio::spawn(peer_network.run(
            peers_from_replica_rx,
            server_to_replica_tx.clone(),
            shutdown.clone(),
        ));

        replica.start()?;
        let replica_handle = tokio::spawn(Self::run(replica, ticks, replica_from_server_rx, shutdown.clone()));

        Ok(ReplicaHandle {
            pid: conf.replica_id,
            tx: server_to_replica_tx,
            shutdown,
            tasks: vec![replica_handle, grpc_handle, peer_handle],
        })
    }

    /// Opens the durable log in the data directory if one is configured, or a fresh
    /// in-memory log otherwise.
    fn open_log(conf: &RaftConfig, sm: Box<dyn StateMachine>) -> RaftResult<Log> {
        match &conf.data_dir {
            Some(dir) => {
                let sync = FileSync::open(dir)?;
                Ok(Log::builder().state_machine(sm).sync(Box::new(sync)).load()?)
            }
            None => Ok(Log::builder().state_machine(sm).sync(Box::new(MemorySync::new())).build()),
        }
    }

    /// The single writer of the replica: timer ticks and events are applied one at a
    /// time until shutdown, after which the replica is stopped.
    pub async fn run(
        mut replica: Replica,
        mut ticks: Ticks,
        mut replica_from_server_rx: ReplicaReceiver,
        shutdown: CancellationToken,
    ) -> RaftResult<()> {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                Some(()) = ticks.heartbeat.recv() => {
                    if let Err(e) = replica.on_heartbeat() {
                        error!("Heartbeat failed on replica {}: {e}", replica.pid());
                    }
                },
                Some(()) = ticks.candidacy.recv() => {
                    if let Err(e) = replica.on_candidacy_timeout() {
                        error!("Election could not be started on replica {}: {e}", replica.pid());
                    }
                },
                Some(event) = replica_from_server_rx.recv() => {
                    if let Err(e) = replica.step(event) {
                        warn!("Event could not be applied on replica {}: {e}", replica.pid());
                    }
                },
            }
        }
        debug!("Run loop for replica {} stopped", replica.pid());
        replica.stop()
    }
}

/// Handle on a running replica, used to propose entries, inspect its status and shut
/// it down.
#[derive(Debug)]
pub struct ReplicaHandle {
    pid: u32,
    tx: ReplicaSender,
    shutdown: CancellationToken,
    tasks: Vec<JoinHandle<RaftResult<()>>>,
}

impl ReplicaHandle {
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Appends a command to the replicated log; only the leader accepts proposals.
    pub async fn propose(&self, key: Vec<u8>, value: Vec<u8>) -> RaftResult<LogEntry> {
        match self.request(RaftEvent::ProposeEvent { key, value }).await? {
            RaftEvent::ProposeReplyEvent(entry) => Ok(entry),
            event => Err(RaftError::InternalServerErrorWithContext(format!(
                "Unexpected reply to proposal: {event:?}"
            ))),
        }
    }

    pub async fn status(&self) -> RaftResult<ReplicaStatus> {
        match self.request(RaftEvent::StatusEvent).await? {
            RaftEvent::StatusReplyEvent(status) => Ok(status),
            event => Err(RaftError::InternalServerErrorWithContext(format!(
                "Unexpected reply to status: {event:?}"
            ))),
        }
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Stops the run loop, the gRPC service and the peer network and waits for them.
    pub async fn shutdown(self) -> RaftResult<()> {
        self.shutdown.cancel();
        let results = futures::future::join_all(self.tasks).await;
        for result in results {
            result.context("Replica task panicked")??;
        }
        info!("Replica {} shut down", self.pid);
        Ok(())
    }

    async fn request(&self, event: RaftEvent) -> RaftResult<RaftEvent> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send((event, Some(tx)))
            .map_err(|_| anyhow!("Replica {} is not running", self.pid))?;
        rx.await.context("Replica dropped the request without answering")?
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use tempfile::tempdir;
    use test_log::test;

    use super::*;
    use crate::peers::{Peer, Quorum};
    use crate::raft::mock::MockStateMachine;
    use crate::raft::state::State;

    fn single(data_dir: Option<std::path::PathBuf>) -> RaftConfig {
        RaftConfig {
            replica_id: 1,
            quorum: Some(Quorum {
                qid: 1,
                bootstrap_leader: Some(1),
                peers: vec![Peer {
                    pid: 1,
                    name: "alpha".to_string(),
                    bind_addr: "127.0.0.1:0".to_string(),
                    endpoint: "http://127.0.0.1:1".to_string(),
                }],
            }),
            data_dir,
            ..Default::default()
        }
    }

    #[test(tokio::test)]
    async fn test_single_replica_commits_proposals() {
        let sm = MockStateMachine::new();
        let handle = RaftServer::start_server(single(None), Box::new(sm.clone())).await.unwrap();

        let entry = handle.propose(b"topic".to_vec(), b"event".to_vec()).await.unwrap();
        assert_eq!(entry.index, 1);
        assert_eq!(entry.term, 0);

        let status = handle.status().await.unwrap();
        assert_eq!(status.state, State::Leader);
        assert_eq!(status.leader, 1);
        assert_eq!(status.commit_index, 1);
        assert_eq!(sm.committed(), vec![1]);

        handle.shutdown().await.unwrap();
    }

    #[test(tokio::test)]
    async fn test_restart_from_data_dir() {
        let dir = tempdir().unwrap();
        let handle = RaftServer::start_server(single(Some(dir.path().to_path_buf())), Box::new(MockStateMachine::new()))
            .await
            .unwrap();
        for i in 0..3 {
            handle.propose(b"topic".to_vec(), vec![i]).await.unwrap();
        }
        handle.shutdown().await.unwrap();

        // With history on disk the replica no longer bootstraps; it wins an election instead.
        let conf = RaftConfig {
            tick_ms: 50,
            timeout_ms: 20,
            ..single(Some(dir.path().to_path_buf()))
        };
        let handle = RaftServer::start_server(conf, Box::new(MockStateMachine::new())).await.unwrap();
        let status = handle.status().await.unwrap();
        assert_eq!(status.last_applied, 3);
        assert_eq!(status.commit_index, 3);

        let mut status = status;
        for _ in 0..50 {
            if status.state == State::Leader {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            status = handle.status().await.unwrap();
        }
        assert_eq!(status.state, State::Leader);
        assert_eq!(status.term, 1);

        let entry = handle.propose(b"topic".to_vec(), vec![3]).await.unwrap();
        assert_eq!((entry.index, entry.term), (4, 1));
        handle.shutdown().await.unwrap();
    }

    #[test(tokio::test)]
    async fn test_invalid_config_is_fatal() {
        let conf = RaftConfig {
            tick_ms: 100,
            timeout_ms: 500,
            ..single(None)
        };
        assert!(matches!(
            RaftServer::start_server(conf, Box::new(MockStateMachine::new())).await,
            Err(RaftError::Config(_))
        ));

        let conf = RaftConfig {
            tick_ms: 0,
            timeout_ms: 0,
            ..single(None)
        };
        assert!(matches!(
            RaftServer::start_server(conf, Box::new(MockStateMachine::new())).await,
            Err(RaftError::Config(_))
        ));
    }

    #[test(tokio::test)]
    async fn test_requests_after_shutdown_fail() {
        let handle = RaftServer::start_server(single(None), Box::new(MockStateMachine::new())).await.unwrap();
        let token = handle.shutdown_token();
        token.cancel();
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(handle.status().await.is_err());
    }

    #[test(tokio::test)]
    async fn test_member_required() {
        let conf = RaftConfig {
            replica_id: 2,
            ..single(None)
        };
        assert!(matches!(
            RaftServer::start_server(conf, Box::new(MockStateMachine::new())).await,
            Err(RaftError::Config(_))
        ));
    }
}
