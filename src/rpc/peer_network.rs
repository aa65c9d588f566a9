use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::errors::RaftResult;
use crate::peers::Quorum;
use crate::rpc::raft::{AppendReply, AppendRequest, VoteReply, VoteRequest};
use crate::rpc::rpc_client::RaftGrpcClientStub;
use crate::rpc::{RaftEvent, ReplicaSender};

/// Outbound side of a replica: one client stub per remote peer. Requests emitted by the
/// replica are delivered here and the replies are fed back into the run loop.
#[derive(Debug, Clone)]
pub struct PeerNetwork {
    pid: u32,
    timeout: Duration,
    peers: Arc<HashMap<u32, RaftGrpcClientStub>>,
}

impl PeerNetwork {
    pub fn new(pid: u32, quorum: &Quorum, timeout: Duration) -> RaftResult<Self> {
        let mut peers = HashMap::new();
        for peer in quorum.remotes(pid) {
            info!("Registering peer {} ({}) at {}", peer.pid, peer.name, peer.endpoint);
            peers.insert(peer.pid, RaftGrpcClientStub::new(peer.pid, &peer.endpoint, timeout)?);
        }
        Ok(Self {
            pid,
            timeout,
            peers: Arc::new(peers),
        })
    }

    /// Asks every peer for its vote. Peers that fail or time out are left out.
    pub async fn request_vote(&self, request: VoteRequest) -> Vec<VoteReply> {
        let handles = self
            .peers
            .values()
            .map(|client| client.request_vote(request.clone(), self.timeout))
            .collect::<Vec<_>>();
        let joined = futures::future::join_all(handles).await;
        joined
            .into_iter()
            .filter_map(|result| match result {
                Ok(reply) => {
                    debug!("Received VoteReply on replica: {} -> :{reply:?}", self.pid);
                    Some(reply)
                }
                Err(e) => {
                    warn!("Error received at {} while sending RequestVote to the peers. Tonic error is {:?}", self.pid, e);
                    None
                }
            })
            .collect::<Vec<VoteReply>>()
    }

    pub async fn append_entries(&self, pid: u32, request: AppendRequest) -> RaftResult<AppendReply> {
        let client = self
            .peers
            .get(&pid)
            .with_context(|| format!("Peer client for peer {pid} does not exist"))?;
        let reply = client
            .append_entries(request, self.timeout)
            .await
            .with_context(|| format!("Error received at {} while sending AppendEntries to peer {pid}", self.pid))?;
        debug!("Received AppendReply on replica: {} -> :{reply:?}", self.pid);
        Ok(reply)
    }

    /// Delivers requests from the replica until `shutdown` fires or the replica goes away.
    /// Each request runs on its own task; replies go back to the replica without a
    /// responder.
    pub async fn run(
        self,
        mut peers_from_replica_rx: mpsc::UnboundedReceiver<RaftEvent>,
        replica_tx: ReplicaSender,
        shutdown: CancellationToken,
    ) -> RaftResult<()> {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                event = peers_from_replica_rx.recv() => {
                    let Some(event) = event else { break };
                    self.dispatch(event, replica_tx.clone());
                }
            }
        }
        debug!("Peer network for replica {} stopped", self.pid);
        Ok(())
    }

    fn dispatch(&self, event: RaftEvent, replica_tx: ReplicaSender) {
        let network = self.clone();
        match event {
            RaftEvent::PeerVoteRequestEvent(req) => {
                tokio::spawn(async move {
                    for reply in network.request_vote(req).await {
                        if replica_tx.send((RaftEvent::VoteReplyEvent(reply), None)).is_err() {
                            break;
                        }
                    }
                });
            }
            RaftEvent::PeerAppendRequestEvent(pid, req) => {
                tokio::spawn(async move {
                    match network.append_entries(pid, req).await {
                        Ok(reply) => {
                            let _ = replica_tx.send((RaftEvent::AppendReplyEvent(reply), None));
                        }
                        Err(e) => warn!("{e:#}"),
                    }
                });
            }
            event => error!("Some unexpected event came up in the peer network: {:?}", event),
        }
    }
}
