//! Raft RPC messages and the transports carrying them
//!
//! [`RaftNetworkClient`] is openraft's network factory: it hands out one
//! [`RaftConnection`] per peer, and every connection pushes requests through
//! the node's [`RaftTransport`].

use super::{RaftId, RaftMember, TypeConfig};
use crate::cluster::types::{ClusterError, ClusterResult};
use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use openraft::error::{InstallSnapshotError, NetworkError, RPCError, RaftError, Unreachable};
use openraft::network::{RPCOption, RaftNetwork, RaftNetworkFactory};
use openraft::raft::{
    AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest, InstallSnapshotResponse,
    VoteRequest, VoteResponse,
};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Serialize, Deserialize)]
pub enum RaftRequest {
    AppendEntries(AppendEntriesRequest<TypeConfig>),
    Vote(VoteRequest<RaftId>),
    InstallSnapshot(InstallSnapshotRequest<TypeConfig>),
}

#[derive(Debug, Serialize, Deserialize)]
pub enum RaftResponse {
    AppendEntries(AppendEntriesResponse<RaftId>),
    Vote(VoteResponse<RaftId>),
    InstallSnapshot(InstallSnapshotResponse<RaftId>),
    /// The receiving node failed to process the request
    Error(String),
}

/// Delivers raft requests to another voter, addressed by its raft address
pub trait RaftTransport: Send + Sync + 'static {
    fn send(&self, target: &str, request: RaftRequest) -> BoxFuture<'static, ClusterResult<RaftResponse>>;
}

/// JSON over HTTP: `POST http://<target>/raft`
#[derive(Clone)]
pub struct HttpRaftTransport {
    client: Client,
}

impl HttpRaftTransport {
    pub fn new(timeout: Duration) -> ClusterResult<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ClusterError::NetworkError(e.to_string()))?;
        Ok(Self { client })
    }
}

impl RaftTransport for HttpRaftTransport {
    fn send(&self, target: &str, request: RaftRequest) -> BoxFuture<'static, ClusterResult<RaftResponse>> {
        let client = self.client.clone();
        let url = format!("http://{}/raft", target);
        async move {
            let response = client
                .post(&url)
                .json(&request)
                .send()
                .await
                .map_err(|e| ClusterError::NetworkError(format!("{}: {}", url, e)))?;

            let status = response.status();
            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                return Err(ClusterError::NetworkError(format!(
                    "{}: HTTP {}: {}",
                    url, status, body
                )));
            }
            response
                .json::<RaftResponse>()
                .await
                .map_err(|e| ClusterError::SerializationError(e.to_string()))
        }
        .boxed()
    }
}

/// openraft network factory over a [`RaftTransport`]
#[derive(Clone)]
pub struct RaftNetworkClient {
    transport: Arc<dyn RaftTransport>,
}

impl RaftNetworkClient {
    pub fn new(transport: Arc<dyn RaftTransport>) -> Self {
        Self { transport }
    }
}

impl RaftNetworkFactory<TypeConfig> for RaftNetworkClient {
    type Network = RaftConnection;

    async fn new_client(&mut self, _target: RaftId, node: &RaftMember) -> Self::Network {
        RaftConnection {
            addr: node.addr.clone(),
            transport: self.transport.clone(),
        }
    }
}

/// Connection to one peer's raft endpoint
pub struct RaftConnection {
    addr: String,
    transport: Arc<dyn RaftTransport>,
}

impl RaftConnection {
    async fn call(&self, request: RaftRequest) -> ClusterResult<RaftResponse> {
        match self.transport.send(&self.addr, request).await? {
            RaftResponse::Error(e) => Err(ClusterError::Remote(e)),
            response => Ok(response),
        }
    }
}

/// Transport failures back off as unreachable; the rest are retried
fn rpc_error<E: std::error::Error>(e: ClusterError) -> RPCError<RaftId, RaftMember, E> {
    match e {
        ClusterError::NetworkError(_) | ClusterError::Timeout(_) => {
            RPCError::Unreachable(Unreachable::new(&e))
        }
        other => RPCError::Network(NetworkError::new(&other)),
    }
}

fn unexpected<E: std::error::Error>(response: RaftResponse) -> RPCError<RaftId, RaftMember, E> {
    rpc_error(ClusterError::SerializationError(format!(
        "unexpected raft response {:?}",
        response
    )))
}

impl RaftNetwork<TypeConfig> for RaftConnection {
    async fn append_entries(
        &mut self,
        req: AppendEntriesRequest<TypeConfig>,
        _option: RPCOption,
    ) -> Result<AppendEntriesResponse<RaftId>, RPCError<RaftId, RaftMember, RaftError<RaftId>>> {
        match self
            .call(RaftRequest::AppendEntries(req))
            .await
            .map_err(rpc_error::<RaftError<RaftId>>)?
        {
            RaftResponse::AppendEntries(resp) => Ok(resp),
            other => Err(unexpected(other)),
        }
    }

    async fn vote(
        &mut self,
        req: VoteRequest<RaftId>,
        _option: RPCOption,
    ) -> Result<VoteResponse<RaftId>, RPCError<RaftId, RaftMember, RaftError<RaftId>>> {
        match self
            .call(RaftRequest::Vote(req))
            .await
            .map_err(rpc_error::<RaftError<RaftId>>)?
        {
            RaftResponse::Vote(resp) => Ok(resp),
            other => Err(unexpected(other)),
        }
    }

    async fn install_snapshot(
        &mut self,
        req: InstallSnapshotRequest<TypeConfig>,
        _option: RPCOption,
    ) -> Result<
        InstallSnapshotResponse<RaftId>,
        RPCError<RaftId, RaftMember, RaftError<RaftId, InstallSnapshotError>>,
    > {
        match self
            .call(RaftRequest::InstallSnapshot(req))
            .await
            .map_err(rpc_error::<RaftError<RaftId, InstallSnapshotError>>)?
        {
            RaftResponse::InstallSnapshot(resp) => Ok(resp),
            other => Err(unexpected(other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use openraft::{CommittedLeaderId, LogId, Vote};
    use parking_lot::Mutex;

    #[test]
    fn test_request_wire_format() {
        let req = RaftRequest::Vote(VoteRequest {
            vote: Vote::new(3, 7),
            last_log_id: Some(LogId::new(CommittedLeaderId::new(2, 7), 9)),
        });
        let json = serde_json::to_value(&req).unwrap();
        assert!(json.get("Vote").is_some());

        match serde_json::from_value::<RaftRequest>(json).unwrap() {
            RaftRequest::Vote(back) => {
                assert_eq!(back.vote, Vote::new(3, 7));
                assert_eq!(back.last_log_id.map(|l| l.index), Some(9));
            }
            other => panic!("decoded {:?}", other),
        }
    }

    /// Answers every request with a fixed response or error
    struct Canned {
        reply: Mutex<Option<ClusterResult<RaftResponse>>>,
    }

    impl RaftTransport for Canned {
        fn send(&self, _target: &str, _request: RaftRequest) -> BoxFuture<'static, ClusterResult<RaftResponse>> {
            let reply = self
                .reply
                .lock()
                .take()
                .unwrap_or_else(|| Err(ClusterError::NetworkError("no reply".into())));
            async move { reply }.boxed()
        }
    }

    fn connection(reply: ClusterResult<RaftResponse>) -> RaftConnection {
        RaftConnection {
            addr: "raft-b".into(),
            transport: Arc::new(Canned {
                reply: Mutex::new(Some(reply)),
            }),
        }
    }

    fn vote_request() -> VoteRequest<RaftId> {
        VoteRequest {
            vote: Vote::new(1, 1),
            last_log_id: None,
        }
    }

    #[tokio::test]
    async fn test_transport_failures_map_to_rpc_errors() {
        let option = || RPCOption::new(Duration::from_secs(1));

        let mut down = connection(Err(ClusterError::NetworkError("refused".into())));
        let err = down.vote(vote_request(), option()).await.unwrap_err();
        assert!(matches!(err, RPCError::Unreachable(_)));

        let mut failing = connection(Ok(RaftResponse::Error("storage".into())));
        let err = failing.vote(vote_request(), option()).await.unwrap_err();
        assert!(matches!(err, RPCError::Network(_)));

        let mut confused = connection(Ok(RaftResponse::InstallSnapshot(InstallSnapshotResponse {
            vote: Vote::new(1, 1),
        })));
        let err = confused.vote(vote_request(), option()).await.unwrap_err();
        assert!(matches!(err, RPCError::Network(_)));
    }
}
