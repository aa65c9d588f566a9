use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};
use tokio_stream::wrappers::ReceiverStream;
use tonic::transport::{Channel, Endpoint};
use tonic::{Request, Status, Streaming};
use tracing::debug;

use crate::errors::RaftResult;
use crate::rpc::raft::raft_client::RaftClient;
use crate::rpc::raft::{AppendReply, AppendRequest, VoteReply, VoteRequest};

/// The open AppendEntries stream to one peer. Requests and replies are paired in order.
#[derive(Debug)]
struct AppendStream {
    tx: mpsc::Sender<AppendRequest>,
    replies: Streaming<AppendReply>,
}

/// Client side of a single peer. The channel connects lazily on first use and
/// reconnects on its own; the append stream is reopened after any failure.
#[derive(Debug, Clone)]
pub struct RaftGrpcClientStub {
    pid: u32,
    client: RaftClient<Channel>,
    //Serializes request/reply pairs on the shared append stream
    append_stream: Arc<Mutex<Option<AppendStream>>>,
}

impl RaftGrpcClientStub {
    pub fn new(pid: u32, endpoint: &str, timeout: Duration) -> RaftResult<Self> {
        debug!("Constructing new stub for peer {pid} at {endpoint}");
        let channel = Endpoint::from_shared(endpoint.to_string())?
            .connect_timeout(timeout)
            .connect_lazy();
        Ok(Self {
            pid,
            client: RaftClient::new(channel),
            append_stream: Arc::new(Mutex::new(None)),
        })
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub async fn request_vote(&self, request: VoteRequest, timeout: Duration) -> Result<VoteReply, Status> {
        let mut client = self.client.clone();
        let response = tokio::time::timeout(timeout, client.request_vote(request))
            .await
            .map_err(|_| Status::deadline_exceeded(format!("request vote to peer {} timed out", self.pid)))??;
        Ok(response.into_inner())
    }

    /// Sends one request on the append stream and waits for its reply.
    pub async fn append_entries(&self, request: AppendRequest, timeout: Duration) -> Result<AppendReply, Status> {
        let mut slot = self.append_stream.lock().await;
        let result = tokio::time::timeout(timeout, self.exchange(&mut slot, request)).await;
        match result {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(status)) => {
                *slot = None;
                Err(status)
            }
            Err(_) => {
                // A late reply would pair with the next request.
                *slot = None;
                Err(Status::deadline_exceeded(format!("append entries to peer {} timed out", self.pid)))
            }
        }
    }

    async fn exchange(&self, slot: &mut Option<AppendStream>, request: AppendRequest) -> Result<AppendReply, Status> {
        if slot.is_none() {
            *slot = Some(self.open_append_stream().await?);
        }
        let stream = slot
            .as_mut()
            .ok_or_else(|| Status::internal("append stream is not open"))?;

        stream
            .tx
            .send(request)
            .await
            .map_err(|_| Status::unavailable(format!("append stream to peer {} is closed", self.pid)))?;

        stream
            .replies
            .message()
            .await?
            .ok_or_else(|| Status::unavailable(format!("peer {} closed the append stream", self.pid)))
    }

    async fn open_append_stream(&self) -> Result<AppendStream, Status> {
        debug!("Opening append stream to peer {}", self.pid);
        let (tx, rx) = mpsc::channel(1);
        let mut client = self.client.clone();
        let replies = client
            .append_entries(Request::new(ReceiverStream::new(rx)))
            .await?
            .into_inner();
        Ok(AppendStream { tx, replies })
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use test_log::test;
    use tokio::net::TcpListener;
    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::errors::RaftError;
    use crate::rpc::server::RaftGrpcServerStub;
    use crate::rpc::{RaftEvent, Responder};

    const TIMEOUT: Duration = Duration::from_secs(2);

    /// Serves a fake replica that acknowledges every append and grants every vote.
    async fn serve(shutdown: CancellationToken) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let endpoint = format!("http://{}", listener.local_addr().unwrap());
        let (tx, mut rx) = mpsc::unbounded_channel::<(RaftEvent, Option<Responder>)>();

        tokio::spawn(async move {
            while let Some((event, Some(responder))) = rx.recv().await {
                let reply = match event {
                    RaftEvent::VoteRequestEvent(req) => Ok(RaftEvent::VoteReplyEvent(VoteReply {
                        remote: 2,
                        term: req.term,
                        granted: true,
                    })),
                    RaftEvent::AppendRequestEvent(req) => Ok(RaftEvent::AppendReplyEvent(AppendReply {
                        remote: 2,
                        term: req.term,
                        success: true,
                        index: req.prev_log_index + req.entries.len() as u64,
                        commit_index: req.leader_commit,
                    })),
                    event => Err(RaftError::BadRequest(format!("unexpected {event:?}"))),
                };
                let _ = responder.send(reply);
            }
        });
        tokio::spawn(RaftGrpcServerStub::new(tx).serve(listener, shutdown));
        endpoint
    }

    #[test(tokio::test)]
    async fn test_round_trip() {
        let shutdown = CancellationToken::new();
        let endpoint = serve(shutdown.clone()).await;
        let stub = RaftGrpcClientStub::new(2, &endpoint, TIMEOUT).unwrap();

        let vote = VoteRequest {
            term: 5,
            candidate: 1,
            last_log_index: 3,
            last_log_term: 4,
        };
        assert_eq!(
            stub.request_vote(vote, TIMEOUT).await.unwrap(),
            VoteReply { remote: 2, term: 5, granted: true }
        );

        for prev in 0..3 {
            let req = AppendRequest {
                term: 5,
                leader: 1,
                prev_log_index: prev,
                prev_log_term: 4,
                leader_commit: prev,
                entries: vec![],
            };
            let reply = stub.append_entries(req, TIMEOUT).await.unwrap();
            assert_eq!(reply.index, prev);
            assert_eq!(reply.commit_index, prev);
        }
        shutdown.cancel();
    }

    #[test(tokio::test)]
    async fn test_unreachable_peer() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let endpoint = format!("http://{}", listener.local_addr().unwrap());
        drop(listener);

        let stub = RaftGrpcClientStub::new(3, &endpoint, TIMEOUT).unwrap();
        assert!(stub.request_vote(VoteRequest::default(), TIMEOUT).await.is_err());
        assert!(stub.append_entries(AppendRequest::default(), TIMEOUT).await.is_err());
        assert!(stub.append_stream.lock().await.is_none());
    }

    #[test]
    fn test_invalid_endpoint() {
        assert!(RaftGrpcClientStub::new(1, "not a uri", TIMEOUT).is_err());
    }
}
