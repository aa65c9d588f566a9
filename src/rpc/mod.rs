use tokio::sync::{mpsc, oneshot};

use crate::errors::RaftResult;
use crate::raft::replica::ReplicaStatus;
use crate::rpc::raft::{AppendReply, AppendRequest, LogEntry, VoteReply, VoteRequest};

pub mod peer_network;
pub mod rpc_client;
pub mod server;

pub mod raft {
    tonic::include_proto!("raft.v1beta1");
}

/// Channel on which the replica answers an event that expects a response.
pub type Responder = oneshot::Sender<RaftResult<RaftEvent>>;

/// The run loop's inbound queue.
pub type ReplicaSender = mpsc::UnboundedSender<(RaftEvent, Option<Responder>)>;
pub type ReplicaReceiver = mpsc::UnboundedReceiver<(RaftEvent, Option<Responder>)>;

/// Everything that flows through the replica's run loop.
///
/// Requests arriving on the gRPC server are paired with a `Responder`; the replica
/// answers them with the matching reply variant. Replies coming back from peers arrive
/// without a responder. The `Peer*` variants travel the other way: the replica emits
/// them for the peer network to deliver.
#[derive(Debug, Clone)]
pub enum RaftEvent {
    VoteRequestEvent(VoteRequest),
    AppendRequestEvent(AppendRequest),
    VoteReplyEvent(VoteReply),
    AppendReplyEvent(AppendReply),

    PeerVoteRequestEvent(VoteRequest),
    PeerAppendRequestEvent(u32, AppendRequest),

    ProposeEvent { key: Vec<u8>, value: Vec<u8> },
    ProposeReplyEvent(LogEntry),
    StatusEvent,
    StatusReplyEvent(ReplicaStatus),
}
