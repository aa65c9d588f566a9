use std::pin::Pin;

use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};
use tokio_stream::wrappers::{ReceiverStream, TcpListenerStream};
use tokio_stream::{Stream, StreamExt};
use tokio_util::sync::CancellationToken;
use tonic::transport::Server;
use tonic::{Request, Response, Status, Streaming};
use tracing::{debug, error, info};

use crate::errors::RaftError::InternalServerErrorWithContext;
use crate::errors::RaftResult;
use crate::rpc::raft::raft_server::{Raft, RaftServer};
use crate::rpc::raft::{AppendReply, AppendRequest, VoteReply, VoteRequest};
use crate::rpc::{RaftEvent, ReplicaSender};

const APPEND_STREAM_BUFFER: usize = 64;

type AppendReplyStream = Pin<Box<dyn Stream<Item = Result<AppendReply, Status>> + Send + 'static>>;

/// The gRPC face of a replica. Every request is forwarded to the run loop together with
/// a oneshot sender on which the replica answers; the stub itself holds no state.
#[derive(Debug, Clone)]
pub struct RaftGrpcServerStub {
    server_to_replica_tx: ReplicaSender,
}

impl RaftGrpcServerStub {
    pub fn new(tx: ReplicaSender) -> Self {
        Self {
            server_to_replica_tx: tx,
        }
    }

    /// Serves the Raft service on an already bound listener until `shutdown` fires.
    pub async fn serve(self, listener: TcpListener, shutdown: CancellationToken) -> RaftResult<()> {
        let address = listener.local_addr().ok();
        info!("Raft grpc service listening on {:?}", address);
        Server::builder()
            .add_service(RaftServer::new(self))
            .serve_with_incoming_shutdown(TcpListenerStream::new(listener), async move { shutdown.cancelled().await })
            .await
            .map_err(|e| {
                InternalServerErrorWithContext(format!(
                    "Unable to run tonic grpc server at {:?}. Error reported was {:?}",
                    address, e
                ))
            })
    }

    async fn forward(&self, event: RaftEvent) -> Result<RaftEvent, Status> {
        let (replica_to_server_tx, server_from_replica_rx) = oneshot::channel();
        self.server_to_replica_tx
            .send((event, Some(replica_to_server_tx)))
            .map_err(|_| Status::unavailable("replica is not running"))?;

        match server_from_replica_rx.await {
            Ok(Ok(event)) => Ok(event),
            Ok(Err(e)) => Err(e.into()),
            Err(e) => {
                error!("Replica dropped the request without answering. Error is : {e:?}");
                Err(Status::internal(format!("Replica dropped the request without answering: {e:?}")))
            }
        }
    }

    /// Answers each request of an inbound append stream in order on the returned stream.
    /// The outbound stream ends when the inbound one does or fails.
    fn append_replies<S>(&self, mut inbound: S) -> ReceiverStream<Result<AppendReply, Status>>
    where
        S: Stream<Item = Result<AppendRequest, Status>> + Unpin + Send + 'static,
    {
        let (tx, rx) = mpsc::channel(APPEND_STREAM_BUFFER);
        let stub = self.clone();
        tokio::spawn(async move {
            while let Some(message) = inbound.next().await {
                let req = match message {
                    Ok(req) => req,
                    Err(status) => {
                        debug!("Append stream closed by leader: {status:?}");
                        break;
                    }
                };

                let reply = match stub.forward(RaftEvent::AppendRequestEvent(req)).await {
                    Ok(RaftEvent::AppendReplyEvent(reply)) => Ok(reply),
                    Ok(event) => {
                        error!("Some unexpected match pattern came up in append_entries response stream: {event:?}");
                        Err(Status::internal("Some unexpected match pattern came up in append_entries response stream"))
                    }
                    Err(status) => Err(status),
                };

                if tx.send(reply).await.is_err() {
                    // Leader went away.
                    break;
                }
            }
        });
        ReceiverStream::new(rx)
    }
}

#[tonic::async_trait]
impl Raft for RaftGrpcServerStub {
    async fn request_vote(&self, request: Request<VoteRequest>) -> Result<Response<VoteReply>, Status> {
        debug!("Request received is {:?}", request);
        match self.forward(RaftEvent::VoteRequestEvent(request.into_inner())).await? {
            RaftEvent::VoteReplyEvent(reply) => Ok(Response::new(reply)),
            event => {
                error!("Some unexpected match pattern came up in request_vote response: {event:?}");
                Err(Status::internal("Some unexpected match pattern came up in request_vote response"))
            }
        }
    }

    type AppendEntriesStream = AppendReplyStream;

    async fn append_entries(
        &self,
        request: Request<Streaming<AppendRequest>>,
    ) -> Result<Response<Self::AppendEntriesStream>, Status> {
        debug!("Append stream opened by {:?}", request.remote_addr());
        let replies = self.append_replies(request.into_inner());
        Ok(Response::new(Box::pin(replies) as Self::AppendEntriesStream))
    }
}
