use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::{RaftError, Result};
use crate::message::{AppendEntriesRequest, AppendEntriesResponse, VoteRequest, VoteResponse};
use crate::server::Server;

/// Transport-side view of one server in the Raft network.
///
/// The core never talks to the network itself; it hands requests to peers
/// and interprets the responses. Implementations exist per transport; the
/// in-process [`LocalPeer`] below covers tests and single-process clusters.
#[async_trait]
pub trait Peer: Send + Sync {
    fn id(&self) -> u64;

    async fn append_entries(&self, req: AppendEntriesRequest) -> AppendEntriesResponse;

    async fn request_vote(&self, req: VoteRequest) -> VoteResponse;

    /// Forward a client command to this peer. Optional: transports that do
    /// not support forwarding keep the default.
    async fn command(&self, _cmd: Vec<u8>) -> Result<Vec<u8>> {
        Err(RaftError::NotLeader(None))
    }
}

/// The full set of servers in the Raft network, keyed by id.
///
/// Must include the local server so quorum is computed over the whole
/// cluster.
#[derive(Clone, Default)]
pub struct Peers {
    inner: HashMap<u64, Arc<dyn Peer>>,
}

impl Peers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, peer: Arc<dyn Peer>) {
        self.inner.insert(peer.id(), peer);
    }

    pub fn get(&self, id: u64) -> Option<&Arc<dyn Peer>> {
        self.inner.get(&id)
    }

    pub fn count(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Majority size for this cluster: `count / 2 + 1`.
    pub fn quorum(&self) -> usize {
        self.inner.len() / 2 + 1
    }

    /// A copy of the set without the given id, for fan-outs that must skip
    /// the local server.
    pub fn except(&self, id: u64) -> Peers {
        let inner = self
            .inner
            .iter()
            .filter(|(peer_id, _)| **peer_id != id)
            .map(|(peer_id, peer)| (*peer_id, Arc::clone(peer)))
            .collect();
        Peers { inner }
    }

    pub fn ids(&self) -> Vec<u64> {
        self.inner.keys().copied().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn Peer>> {
        self.inner.values()
    }

    /// Fans `req` out to every peer in this set on short-lived tasks.
    ///
    /// Responses arrive on the returned receiver in completion order.
    /// Cancelling the returned token abandons workers that have not yet
    /// completed; their responses are never delivered.
    pub fn request_votes(
        &self,
        req: VoteRequest,
    ) -> (mpsc::Receiver<VoteResponse>, CancellationToken) {
        let (tx, rx) = mpsc::channel(self.inner.len().max(1));
        let cancel = CancellationToken::new();

        for peer in self.inner.values() {
            let peer = Arc::clone(peer);
            let req = req.clone();
            let tx = tx.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = cancel.cancelled() => {}
                    resp = peer.request_vote(req) => {
                        let _ = tx.send(resp).await;
                    }
                }
            });
        }

        (rx, cancel)
    }
}

impl fmt::Debug for Peers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut ids = self.ids();
        ids.sort_unstable();
        f.debug_tuple("Peers").field(&ids).finish()
    }
}

impl FromIterator<Arc<dyn Peer>> for Peers {
    fn from_iter<I: IntoIterator<Item = Arc<dyn Peer>>>(iter: I) -> Self {
        let mut peers = Peers::new();
        for peer in iter {
            peers.insert(peer);
        }
        peers
    }
}

/// In-process peer that calls straight into a local [`Server`].
///
/// A stopped server answers with an unsuccessful zero-term response, which
/// the protocol treats the same as a peer that never answers usefully.
pub struct LocalPeer {
    server: Arc<Server>,
}

impl LocalPeer {
    pub fn new(server: Arc<Server>) -> Self {
        Self { server }
    }
}

#[async_trait]
impl Peer for LocalPeer {
    fn id(&self) -> u64 {
        self.server.id()
    }

    async fn append_entries(&self, req: AppendEntriesRequest) -> AppendEntriesResponse {
        match self.server.append_entries(req).await {
            Ok(resp) => resp,
            Err(err) => AppendEntriesResponse {
                term: 0,
                success: false,
                reason: Some(err.to_string()),
            },
        }
    }

    async fn request_vote(&self, req: VoteRequest) -> VoteResponse {
        match self.server.request_vote(req).await {
            Ok(resp) => resp,
            Err(err) => VoteResponse {
                term: 0,
                vote_granted: false,
                reason: Some(err.to_string()),
            },
        }
    }

    async fn command(&self, cmd: Vec<u8>) -> Result<Vec<u8>> {
        self.server.command(cmd).await
    }
}
