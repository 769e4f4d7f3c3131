use std::fmt;
use std::io::Write;
use std::sync::{Arc, Mutex as StdMutex, RwLock as StdRwLock};

use tokio::sync::{mpsc, oneshot};
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;

use crate::config::TimingConfig;
use crate::error::{RaftError, Result};
use crate::log::{ApplyError, Log, LogEntry};
use crate::message::{AppendEntriesRequest, AppendEntriesResponse, VoteRequest, VoteResponse};
use crate::next_index::NextIndex;
use crate::peer::{Peer, Peers};
use crate::timer;

const CHANNEL_CAPACITY: usize = 100;

/// The three roles a server moves between.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Passive: answers RPCs, votes when asked, times out into an election.
    Follower,
    /// Transitional: soliciting votes to become leader.
    Candidate,
    /// Active: replicates the log and sends heartbeats.
    Leader,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Follower => write!(f, "follower"),
            Role::Candidate => write!(f, "candidate"),
            Role::Leader => write!(f, "leader"),
        }
    }
}

/// What a role loop decided when it returned.
enum Transition {
    To(Role),
    Stop,
}

struct AppendEntriesTuple {
    request: AppendEntriesRequest,
    respond: oneshot::Sender<AppendEntriesResponse>,
}

struct VoteTuple {
    request: VoteRequest,
    respond: oneshot::Sender<VoteResponse>,
}

struct CommandTuple {
    command: Vec<u8>,
    respond: oneshot::Sender<Result<Vec<u8>>>,
}

/// One member of the replicated state machine.
///
/// A `Server` is a handle; the protocol itself runs on a driver task spawned
/// by [`start`](Server::start). Inbound RPCs and client commands are
/// forwarded to the driver over channels, each carrying a one-shot reply
/// sender, so every submission is serialized through the driver and sees
/// exactly one response.
pub struct Server {
    id: u64,
    role: Arc<StdRwLock<Role>>,
    ae_tx: mpsc::Sender<AppendEntriesTuple>,
    rv_tx: mpsc::Sender<VoteTuple>,
    cmd_tx: mpsc::Sender<CommandTuple>,
    cancel: CancellationToken,
    driver: StdMutex<Option<Driver>>,
}

impl Server {
    /// Creates an un-started server with default timing.
    ///
    /// `id` must be unique in the Raft network and greater than zero
    /// (panics otherwise). Committed entries are streamed to `store`; the
    /// apply function is called on each committed command, in index order,
    /// and its output answers the submitting client.
    pub fn new<W, F>(id: u64, store: W, apply: F) -> Self
    where
        W: Write + Send + Sync + 'static,
        F: FnMut(&[u8]) -> std::result::Result<Vec<u8>, ApplyError> + Send + Sync + 'static,
    {
        Self::with_timing(id, store, apply, TimingConfig::default())
    }

    /// Like [`new`](Server::new) with explicit timing, for tests and tightly
    /// tuned deployments.
    pub fn with_timing<W, F>(id: u64, store: W, apply: F, config: TimingConfig) -> Self
    where
        W: Write + Send + Sync + 'static,
        F: FnMut(&[u8]) -> std::result::Result<Vec<u8>, ApplyError> + Send + Sync + 'static,
    {
        assert!(id > 0, "server id must be greater than zero");

        let (ae_tx, ae_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (rv_tx, rv_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (cmd_tx, cmd_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let role = Arc::new(StdRwLock::new(Role::Follower));
        let cancel = CancellationToken::new();

        let driver = Driver {
            id,
            term: 0,
            voted_for: None,
            leader_id: None,
            log: Log::new(Box::new(store), Box::new(apply)),
            peers: Peers::new(),
            config,
            role: Arc::clone(&role),
            ae_rx,
            rv_rx,
            cmd_rx,
            cancel: cancel.clone(),
            election_deadline: Instant::now(),
        };

        Self {
            id,
            role,
            ae_tx,
            rv_tx,
            cmd_tx,
            cancel,
            driver: StdMutex::new(Some(driver)),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// The current role: follower, candidate, or leader.
    pub fn state(&self) -> Role {
        *self.role.read().expect("role lock poisoned")
    }

    /// Injects the set of peers this server will communicate with. The set
    /// must include this server so quorum is computed over the full cluster.
    /// Call before [`start`](Server::start).
    pub fn set_peers(&self, peers: Peers) {
        let mut driver = self.driver.lock().expect("driver lock poisoned");
        match driver.as_mut() {
            Some(driver) => driver.peers = peers,
            None => tracing::warn!(id = self.id, "set_peers after start has no effect"),
        }
    }

    /// Spawns the driver task. Must be called from within a Tokio runtime.
    pub fn start(&self) {
        let driver = self.driver.lock().expect("driver lock poisoned").take();
        match driver {
            Some(driver) => {
                tokio::spawn(driver.run());
            }
            None => tracing::warn!(id = self.id, "server already started"),
        }
    }

    /// Signals the driver to exit at its next event-select boundary.
    /// Outstanding submissions fail with [`RaftError::Stopped`].
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// Pushes a state-machine command through the Raft network, blocking
    /// until it is committed and applied locally, the leader is deposed, or
    /// the client-facing deadline fires.
    ///
    /// A `Timeout` does not stop replication: the command stays in the
    /// leader's log and may still commit, so commands are best structured to
    /// be idempotent.
    pub async fn command(&self, command: Vec<u8>) -> Result<Vec<u8>> {
        let (respond, response) = oneshot::channel();
        self.cmd_tx
            .send(CommandTuple { command, respond })
            .await
            .map_err(|_| RaftError::Stopped)?;
        response.await.map_err(|_| RaftError::Stopped)?
    }

    /// Processes an AppendEntries RPC. Public so peers can be built on
    /// arbitrary transports.
    pub async fn append_entries(&self, request: AppendEntriesRequest) -> Result<AppendEntriesResponse> {
        let (respond, response) = oneshot::channel();
        self.ae_tx
            .send(AppendEntriesTuple { request, respond })
            .await
            .map_err(|_| RaftError::Stopped)?;
        response.await.map_err(|_| RaftError::Stopped)
    }

    /// Processes a RequestVote RPC. Public so peers can be built on
    /// arbitrary transports.
    pub async fn request_vote(&self, request: VoteRequest) -> Result<VoteResponse> {
        let (respond, response) = oneshot::channel();
        self.rv_tx
            .send(VoteTuple { request, respond })
            .await
            .map_err(|_| RaftError::Stopped)?;
        response.await.map_err(|_| RaftError::Stopped)
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// The role engine. Owns all mutable role state; runs as one spawned task.
struct Driver {
    id: u64,
    term: u64,
    voted_for: Option<u64>,
    leader_id: Option<u64>,
    log: Log,
    peers: Peers,
    config: TimingConfig,
    role: Arc<StdRwLock<Role>>,
    ae_rx: mpsc::Receiver<AppendEntriesTuple>,
    rv_rx: mpsc::Receiver<VoteTuple>,
    cmd_rx: mpsc::Receiver<CommandTuple>,
    cancel: CancellationToken,
    election_deadline: Instant,
}

impl Driver {
    async fn run(mut self) {
        self.reset_election_timeout();
        loop {
            let role = self.role();
            let transition = match role {
                Role::Follower => self.follower_loop().await,
                Role::Candidate => self.candidate_loop().await,
                Role::Leader => self.leader_loop().await,
            };
            match transition {
                Transition::To(next) => {
                    tracing::debug!(
                        id = self.id,
                        term = self.term,
                        from = %role,
                        to = %next,
                        "role transition"
                    );
                    self.set_role(next);
                }
                Transition::Stop => {
                    tracing::info!(id = self.id, term = self.term, "server stopped");
                    return;
                }
            }
        }
    }

    fn role(&self) -> Role {
        *self.role.read().expect("role lock poisoned")
    }

    fn set_role(&self, role: Role) {
        *self.role.write().expect("role lock poisoned") = role;
    }

    fn reset_election_timeout(&mut self) {
        self.election_deadline = Instant::now() + timer::random_election_timeout(&self.config);
    }

    async fn follower_loop(&mut self) -> Transition {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return Transition::Stop,

                Some(tuple) = self.cmd_rx.recv() => {
                    // Followers do not accept commands; point the client at
                    // the leader when one is known.
                    let err = match self.leader_id {
                        Some(leader) => RaftError::NotLeader(Some(leader)),
                        None => RaftError::UnknownLeader,
                    };
                    let _ = tuple.respond.send(Err(err));
                }

                _ = time::sleep_until(self.election_deadline) => {
                    tracing::info!(
                        id = self.id,
                        term = self.term,
                        "election timeout, becoming candidate"
                    );
                    self.term += 1;
                    self.reset_election_timeout();
                    return Transition::To(Role::Candidate);
                }

                Some(tuple) = self.ae_rx.recv() => {
                    let (resp, _step_down) = self.handle_append_entries(tuple.request);
                    let _ = tuple.respond.send(resp);
                }

                Some(tuple) = self.rv_rx.recv() => {
                    let (resp, _step_down) = self.handle_request_vote(tuple.request);
                    let _ = tuple.respond.send(resp);
                }
            }
        }
    }

    async fn candidate_loop(&mut self) -> Transition {
        // Claim the self-vote for this term before soliciting anyone else.
        self.voted_for = Some(self.id);
        self.leader_id = None;

        let votes_required = self.peers.quorum();
        let mut votes_received: usize = 1;
        tracing::info!(
            id = self.id,
            term = self.term,
            votes_required,
            "election started"
        );

        if votes_received >= votes_required {
            tracing::info!(id = self.id, term = self.term, "single-server network, won");
            return Transition::To(Role::Leader);
        }

        let (mut responses, canceler) = self.peers.except(self.id).request_votes(VoteRequest {
            term: self.term,
            candidate_id: self.id,
            last_log_index: self.log.last_index(),
            last_log_term: self.log.last_term(),
        });
        // Leaving this role for any reason abandons the outstanding vote
        // workers; late responses are never delivered.
        let _vote_guard = canceler.drop_guard();

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return Transition::Stop,

                Some(tuple) = self.cmd_rx.recv() => {
                    let _ = tuple.respond.send(Err(RaftError::UnknownLeader));
                }

                Some(resp) = responses.recv() => {
                    tracing::debug!(
                        id = self.id,
                        term = self.term,
                        resp_term = resp.term,
                        granted = resp.vote_granted,
                        "vote response"
                    );
                    if resp.term != self.term {
                        continue;
                    }
                    if resp.vote_granted {
                        votes_received += 1;
                    }
                    if votes_received >= votes_required {
                        tracing::info!(
                            id = self.id,
                            term = self.term,
                            votes_received,
                            "won election"
                        );
                        return Transition::To(Role::Leader);
                    }
                }

                Some(tuple) = self.ae_rx.recv() => {
                    // An AppendEntries at our term or above means a
                    // legitimate leader already won this election.
                    let leader_exists = tuple.request.term >= self.term;
                    let (resp, step_down) = self.handle_append_entries(tuple.request);
                    let _ = tuple.respond.send(resp);
                    if step_down || leader_exists {
                        tracing::info!(id = self.id, term = self.term, "stepping down");
                        return Transition::To(Role::Follower);
                    }
                }

                Some(tuple) = self.rv_rx.recv() => {
                    // A more recent candidate can defeat us the same way.
                    let (resp, step_down) = self.handle_request_vote(tuple.request);
                    let _ = tuple.respond.send(resp);
                    if step_down {
                        tracing::info!(id = self.id, term = self.term, "stepping down");
                        return Transition::To(Role::Follower);
                    }
                }

                _ = time::sleep_until(self.election_deadline) => {
                    tracing::info!(
                        id = self.id,
                        term = self.term,
                        "election ended without a winner"
                    );
                    // Restart the election in a fresh term.
                    self.term += 1;
                    self.reset_election_timeout();
                    return Transition::To(Role::Candidate);
                }
            }
        }
    }

    async fn leader_loop(&mut self) -> Transition {
        self.leader_id = Some(self.id);
        let next_index = Arc::new(NextIndex::new(
            self.peers.except(self.id).ids(),
            self.log.last_index() + 1,
        ));

        // The first tick completes immediately, asserting leadership before
        // anyone else times out.
        let mut heartbeat = timer::heartbeat_interval(&self.config);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return Transition::Stop,

                Some(tuple) = self.cmd_rx.recv() => {
                    if let Some(transition) = self.replicate_command(tuple, &next_index).await {
                        return transition;
                    }
                }

                _ = heartbeat.tick() => {
                    self.broadcast_flush(&next_index).await;
                }

                Some(tuple) = self.ae_rx.recv() => {
                    let (resp, step_down) = self.handle_append_entries(tuple.request);
                    let _ = tuple.respond.send(resp);
                    if step_down {
                        tracing::info!(id = self.id, term = self.term, "deposed, stepping down");
                        return Transition::To(Role::Follower);
                    }
                }

                Some(tuple) = self.rv_rx.recv() => {
                    let (resp, step_down) = self.handle_request_vote(tuple.request);
                    let _ = tuple.respond.send(resp);
                    if step_down {
                        tracing::info!(id = self.id, term = self.term, "deposed, stepping down");
                        return Transition::To(Role::Follower);
                    }
                }
            }
        }
    }

    /// Builds the AppendEntries "delta" for a follower whose next expected
    /// entry is `next_index`: everything we hold from there on, plus the
    /// consistency-check coordinates and our commit index.
    fn append_request(&self, next_index: u64) -> AppendEntriesRequest {
        let prev_log_index = next_index.saturating_sub(1);
        let (entries, prev_log_term) = self.log.entries_after(prev_log_index);
        AppendEntriesRequest {
            term: self.term,
            leader_id: self.id,
            prev_log_index,
            prev_log_term,
            entries,
            commit_index: self.log.commit_index(),
        }
    }

    /// One flush per peer, awaiting all before returning. Used for
    /// heartbeats and for propagating a freshly advanced commit index.
    async fn broadcast_flush(&self, next_index: &Arc<NextIndex>) {
        let recipients = self.peers.except(self.id);
        let mut workers = Vec::with_capacity(recipients.count());
        for peer in recipients.iter() {
            let next = next_index.get(peer.id()).await;
            let req = self.append_request(next);
            let peer = Arc::clone(peer);
            let next_index = Arc::clone(next_index);
            workers.push(tokio::spawn(async move {
                let peer_id = peer.id();
                if let Err(err) = flush(peer, req, next_index).await {
                    tracing::debug!(peer = peer_id, error = %err, "flush failed");
                }
            }));
        }
        for worker in workers {
            let _ = worker.await;
        }
    }

    /// Leader-side scatter/gather for one client command.
    ///
    /// Returns a transition when the leader must leave its role, `None` to
    /// keep leading.
    async fn replicate_command(
        &mut self,
        tuple: CommandTuple,
        next_index: &Arc<NextIndex>,
    ) -> Option<Transition> {
        let CommandTuple { command, respond } = tuple;
        let entry = LogEntry {
            index: self.log.last_index() + 1,
            term: self.term,
            command,
        };
        let index = entry.index;
        if let Err(err) = self.log.append_entry(entry) {
            let _ = respond.send(Err(err.into()));
            return None;
        }
        tracing::debug!(id = self.id, term = self.term, index, "appended client command");

        // Client-facing deadline only. Once appended, the entry is
        // replicated by subsequent heartbeats regardless of what the client
        // is told here.
        let deadline = time::sleep(timer::random_election_timeout(&self.config));

        // Scatter one flush per peer.
        let recipients = self.peers.except(self.id);
        let (results_tx, mut results_rx) = mpsc::channel(recipients.count().max(1));
        for peer in recipients.iter() {
            let next = next_index.get(peer.id()).await;
            let req = self.append_request(next);
            let peer = Arc::clone(peer);
            let next_index = Arc::clone(next_index);
            let results_tx = results_tx.clone();
            tokio::spawn(async move {
                let peer_id = peer.id();
                let result = flush(peer, req, next_index).await;
                if let Err(err) = &result {
                    tracing::debug!(peer = peer_id, error = %err, "replication flush failed");
                }
                let _ = results_tx.send(result).await;
            });
        }
        drop(results_tx);

        // Gather acknowledgements off to the side so the deadline can cut
        // in front of a slow quorum. If every peer rejects, neither signal
        // fires and the deadline answers.
        let (committed_tx, committed_rx) = oneshot::channel();
        let (deposed_tx, deposed_rx) = oneshot::channel();
        let quorum = self.peers.quorum();
        tokio::spawn(async move {
            let mut have: usize = 1; // our own append already succeeded
            if have >= quorum {
                let _ = committed_tx.send(());
                return;
            }
            while let Some(result) = results_rx.recv().await {
                match result {
                    Err(RaftError::Deposed) => {
                        let _ = deposed_tx.send(());
                        return;
                    }
                    Err(_) => {}
                    Ok(()) => {
                        have += 1;
                        if have >= quorum {
                            let _ = committed_tx.send(());
                            return;
                        }
                    }
                }
            }
        });

        tokio::select! {
            _ = self.cancel.cancelled() => {
                let _ = respond.send(Err(RaftError::Stopped));
                Some(Transition::Stop)
            }

            Ok(()) = deposed_rx => {
                tracing::info!(
                    id = self.id,
                    term = self.term,
                    index,
                    "deposed while replicating command"
                );
                let _ = respond.send(Err(RaftError::Deposed));
                // Give the new leader a full timeout to reach us before we
                // campaign against it.
                self.reset_election_timeout();
                Some(Transition::To(Role::Follower))
            }

            _ = deadline => {
                tracing::debug!(id = self.id, term = self.term, index, "command deadline elapsed");
                let _ = respond.send(Err(RaftError::Timeout));
                None
            }

            Ok(()) = committed_rx => {
                match self.log.commit_to(index) {
                    Ok(output) => {
                        // One extra round so followers learn the new commit
                        // index without waiting for the next heartbeat.
                        self.broadcast_flush(next_index).await;
                        let _ = respond.send(Ok(output.unwrap_or_default()));
                        None
                    }
                    Err(err) => {
                        panic!("commit of quorum-acknowledged entry {index} failed: {err}")
                    }
                }
            }
        }
    }

    /// Shared term rules plus the AppendEntries acceptance path. Returns the
    /// response and whether the caller must step down to follower.
    fn handle_append_entries(
        &mut self,
        req: AppendEntriesRequest,
    ) -> (AppendEntriesResponse, bool) {
        if req.term < self.term {
            return (
                AppendEntriesResponse {
                    term: self.term,
                    success: false,
                    reason: Some(format!("term {} < {}", req.term, self.term)),
                },
                false,
            );
        }

        let mut step_down = false;
        if req.term > self.term {
            self.term = req.term;
            self.voted_for = None;
            step_down = true;
        }

        // A live leader for the current term; put off our own election.
        self.reset_election_timeout();
        self.leader_id = Some(req.leader_id);

        if let Err(err) = self.log.ensure_last_is(req.prev_log_index, req.prev_log_term) {
            return (
                AppendEntriesResponse {
                    term: self.term,
                    success: false,
                    reason: Some(format!("consistency check failed: {err}")),
                },
                step_down,
            );
        }

        for entry in req.entries {
            let entry_index = entry.index;
            if let Err(err) = self.log.append_entry(entry) {
                return (
                    AppendEntriesResponse {
                        term: self.term,
                        success: false,
                        reason: Some(format!("append of entry {entry_index} failed: {err}")),
                    },
                    step_down,
                );
            }
        }

        if req.commit_index > 0 {
            if let Err(err) = self.log.commit_to(req.commit_index) {
                return (
                    AppendEntriesResponse {
                        term: self.term,
                        success: false,
                        reason: Some(format!("commit to {} failed: {err}", req.commit_index)),
                    },
                    step_down,
                );
            }
        }

        (
            AppendEntriesResponse {
                term: self.term,
                success: true,
                reason: None,
            },
            step_down,
        )
    }

    /// Shared term rules plus the vote-grant rules. Returns the response and
    /// whether the caller must step down to follower.
    fn handle_request_vote(&mut self, req: VoteRequest) -> (VoteResponse, bool) {
        if req.term < self.term {
            return (
                VoteResponse {
                    term: self.term,
                    vote_granted: false,
                    reason: Some(format!("term {} < {}", req.term, self.term)),
                },
                false,
            );
        }

        let mut step_down = false;
        if req.term > self.term {
            self.term = req.term;
            self.voted_for = None;
            step_down = true;
        }

        if let Some(vote) = self.voted_for {
            if vote != req.candidate_id {
                return (
                    VoteResponse {
                        term: self.term,
                        vote_granted: false,
                        reason: Some(format!("already voted for {vote} this term")),
                    },
                    step_down,
                );
            }
        }

        // Election restriction: only back candidates whose log is at least
        // as up to date as ours, comparing (last term, last index).
        let our_last_index = self.log.last_index();
        let our_last_term = self.log.last_term();
        if our_last_term > req.last_log_term
            || (our_last_term == req.last_log_term && our_last_index > req.last_log_index)
        {
            return (
                VoteResponse {
                    term: self.term,
                    vote_granted: false,
                    reason: Some(format!(
                        "our log {our_last_index}/{our_last_term} is more recent than {}/{}",
                        req.last_log_index, req.last_log_term
                    )),
                },
                step_down,
            );
        }

        self.voted_for = Some(req.candidate_id);
        // Backing a candidate means not immediately challenging it.
        self.reset_election_timeout();
        (
            VoteResponse {
                term: self.term,
                vote_granted: true,
                reason: None,
            },
            step_down,
        )
    }
}

/// Sends one AppendEntries to one peer and folds the response into the
/// shared next-index table.
///
/// Idempotent: repeated flushes with overlapping prefixes are accepted by
/// followers, so the same path serves heartbeats, command replication, and
/// commit propagation.
async fn flush(
    peer: Arc<dyn Peer>,
    req: AppendEntriesRequest,
    next_index: Arc<NextIndex>,
) -> Result<()> {
    let peer_id = peer.id();
    let term = req.term;
    let last_sent = req.entries.last().map(|e| e.index);

    let resp = peer.append_entries(req).await;

    if resp.term > term {
        return Err(RaftError::Deposed);
    }
    if !resp.success {
        next_index.decrement(peer_id).await;
        return Err(RaftError::Rejected);
    }
    if let Some(index) = last_sent {
        next_index.set(peer_id, index + 1).await;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    fn test_driver(id: u64, term: u64) -> Driver {
        let (_ae_tx, ae_rx) = mpsc::channel(1);
        let (_rv_tx, rv_rx) = mpsc::channel(1);
        let (_cmd_tx, cmd_rx) = mpsc::channel(1);
        Driver {
            id,
            term,
            voted_for: None,
            leader_id: None,
            log: Log::new(
                Box::new(std::io::sink()),
                Box::new(|cmd: &[u8]| Ok(cmd.to_vec())),
            ),
            peers: Peers::new(),
            config: TimingConfig::default(),
            role: Arc::new(StdRwLock::new(Role::Follower)),
            ae_rx,
            rv_rx,
            cmd_rx,
            cancel: CancellationToken::new(),
            election_deadline: Instant::now(),
        }
    }

    fn entry(index: u64, term: u64, command: &[u8]) -> LogEntry {
        LogEntry {
            index,
            term,
            command: command.to_vec(),
        }
    }

    fn vote_request(term: u64, candidate_id: u64, last_index: u64, last_term: u64) -> VoteRequest {
        VoteRequest {
            term,
            candidate_id,
            last_log_index: last_index,
            last_log_term: last_term,
        }
    }

    fn heartbeat(term: u64, leader_id: u64) -> AppendEntriesRequest {
        AppendEntriesRequest {
            term,
            leader_id,
            prev_log_index: 0,
            prev_log_term: 0,
            entries: Vec::new(),
            commit_index: 0,
        }
    }

    #[test]
    fn test_vote_granted_and_recorded() {
        let mut driver = test_driver(1, 0);

        let (resp, step_down) = driver.handle_request_vote(vote_request(1, 2, 0, 0));

        assert!(resp.vote_granted);
        assert_eq!(resp.term, 1);
        assert!(step_down);
        assert_eq!(driver.term, 1);
        assert_eq!(driver.voted_for, Some(2));
    }

    #[test]
    fn test_vote_rejects_stale_term() {
        let mut driver = test_driver(1, 5);

        let (resp, step_down) = driver.handle_request_vote(vote_request(3, 2, 0, 0));

        assert!(!resp.vote_granted);
        assert_eq!(resp.term, 5);
        assert!(!step_down);
        assert_eq!(driver.voted_for, None);
    }

    #[test]
    fn test_vote_is_unique_per_term() {
        let mut driver = test_driver(1, 1);
        driver.voted_for = Some(2);

        let (resp, _) = driver.handle_request_vote(vote_request(1, 3, 0, 0));
        assert!(!resp.vote_granted);

        // Re-asking for the candidate we already backed is fine.
        let (resp, _) = driver.handle_request_vote(vote_request(1, 2, 0, 0));
        assert!(resp.vote_granted);
        assert_eq!(driver.voted_for, Some(2));
    }

    #[test]
    fn test_vote_denied_when_our_log_is_more_recent() {
        let mut driver = test_driver(1, 2);
        driver.log.append_entry(entry(1, 1, b"a")).unwrap();
        driver.log.append_entry(entry(2, 2, b"b")).unwrap();

        // Lower last term than ours.
        let (resp, _) = driver.handle_request_vote(vote_request(3, 2, 5, 1));
        assert!(!resp.vote_granted);

        // Equal last term, shorter log.
        let mut driver = test_driver(1, 2);
        driver.log.append_entry(entry(1, 2, b"a")).unwrap();
        driver.log.append_entry(entry(2, 2, b"b")).unwrap();
        let (resp, _) = driver.handle_request_vote(vote_request(3, 2, 1, 2));
        assert!(!resp.vote_granted);
    }

    #[test]
    fn test_vote_compares_terms_before_indices() {
        // Candidate's log is shorter but ends in a later term, so it is the
        // more recent of the two.
        let mut driver = test_driver(1, 1);
        driver.log.append_entry(entry(1, 1, b"a")).unwrap();
        driver.log.append_entry(entry(2, 1, b"b")).unwrap();
        driver.log.append_entry(entry(3, 1, b"c")).unwrap();

        let (resp, _) = driver.handle_request_vote(vote_request(3, 2, 1, 2));
        assert!(resp.vote_granted);
    }

    #[test]
    fn test_vote_grant_resets_election_timer() {
        let mut driver = test_driver(1, 0);
        driver.election_deadline = Instant::now() - std::time::Duration::from_secs(1);

        let before = Instant::now();
        let (resp, _) = driver.handle_request_vote(vote_request(1, 2, 0, 0));

        assert!(resp.vote_granted);
        assert!(driver.election_deadline >= before + driver.config.min_election_timeout());
    }

    #[test]
    fn test_append_entries_rejects_stale_term() {
        let mut driver = test_driver(1, 5);

        let (resp, step_down) = driver.handle_append_entries(heartbeat(3, 2));

        assert!(!resp.success);
        assert_eq!(resp.term, 5);
        assert!(!step_down);
        assert!(resp.reason.is_some());
    }

    #[test]
    fn test_append_entries_steps_down_on_higher_term() {
        let mut driver = test_driver(1, 2);
        driver.voted_for = Some(1);

        let (resp, step_down) = driver.handle_append_entries(heartbeat(4, 2));

        assert!(resp.success);
        assert!(step_down);
        assert_eq!(driver.term, 4);
        assert_eq!(driver.voted_for, None);
        assert_eq!(driver.leader_id, Some(2));
    }

    #[test]
    fn test_append_entries_resets_election_timer_before_responding() {
        let mut driver = test_driver(1, 1);
        driver.election_deadline = Instant::now() - std::time::Duration::from_secs(1);

        let before = Instant::now();
        let (resp, _) = driver.handle_append_entries(heartbeat(1, 2));

        assert!(resp.success);
        assert!(driver.election_deadline >= before + driver.config.min_election_timeout());
    }

    #[test]
    fn test_append_entries_appends_and_commits() {
        let mut driver = test_driver(1, 1);

        let req = AppendEntriesRequest {
            term: 1,
            leader_id: 2,
            prev_log_index: 0,
            prev_log_term: 0,
            entries: vec![entry(1, 1, b"a"), entry(2, 1, b"b")],
            commit_index: 1,
        };
        let (resp, _) = driver.handle_append_entries(req);

        assert!(resp.success);
        assert_eq!(driver.log.last_index(), 2);
        assert_eq!(driver.log.commit_index(), 1);
        assert_eq!(driver.leader_id, Some(2));
    }

    #[test]
    fn test_append_entries_rejects_on_consistency_failure() {
        let mut driver = test_driver(1, 1);
        driver.log.append_entry(entry(1, 1, b"a")).unwrap();

        let req = AppendEntriesRequest {
            term: 1,
            leader_id: 2,
            prev_log_index: 3,
            prev_log_term: 1,
            entries: vec![entry(4, 1, b"d")],
            commit_index: 0,
        };
        let (resp, _) = driver.handle_append_entries(req);

        assert!(!resp.success);
        assert!(resp.reason.is_some());
        assert_eq!(driver.log.last_index(), 1);
    }

    #[test]
    fn test_log_prefix_repair() {
        // Follower diverged after index 1: it holds [a@1, x@2] while the
        // leader holds [a@1, b@2, c@3] from a later term.
        let mut driver = test_driver(1, 1);
        driver.log.append_entry(entry(1, 1, b"a")).unwrap();
        driver.log.append_entry(entry(2, 1, b"x")).unwrap();

        // The leader's first probe assumes the follower is caught up.
        let probe = AppendEntriesRequest {
            term: 2,
            leader_id: 2,
            prev_log_index: 2,
            prev_log_term: 2,
            entries: vec![entry(3, 2, b"c")],
            commit_index: 0,
        };
        let (resp, _) = driver.handle_append_entries(probe);
        assert!(!resp.success);

        // After decrementing next_index, the retry carries the full suffix.
        let retry = AppendEntriesRequest {
            term: 2,
            leader_id: 2,
            prev_log_index: 1,
            prev_log_term: 1,
            entries: vec![entry(2, 2, b"b"), entry(3, 2, b"c")],
            commit_index: 0,
        };
        let (resp, _) = driver.handle_append_entries(retry);
        assert!(resp.success);

        assert_eq!(driver.log.last_index(), 3);
        assert_eq!(driver.log.get(2).unwrap().command, b"b".to_vec());
        assert_eq!(driver.log.get(3).unwrap().command, b"c".to_vec());
    }

    struct ScriptedPeer {
        id: u64,
        responses: Mutex<VecDeque<AppendEntriesResponse>>,
    }

    impl ScriptedPeer {
        fn new(id: u64, responses: Vec<AppendEntriesResponse>) -> Arc<Self> {
            Arc::new(Self {
                id,
                responses: Mutex::new(responses.into()),
            })
        }
    }

    #[async_trait]
    impl Peer for ScriptedPeer {
        fn id(&self) -> u64 {
            self.id
        }

        async fn append_entries(&self, _req: AppendEntriesRequest) -> AppendEntriesResponse {
            self.responses
                .lock()
                .unwrap()
                .pop_front()
                .expect("scripted peer ran out of responses")
        }

        async fn request_vote(&self, req: VoteRequest) -> VoteResponse {
            VoteResponse {
                term: req.term,
                vote_granted: false,
                reason: None,
            }
        }
    }

    fn ok_response(term: u64) -> AppendEntriesResponse {
        AppendEntriesResponse {
            term,
            success: true,
            reason: None,
        }
    }

    fn reject_response(term: u64) -> AppendEntriesResponse {
        AppendEntriesResponse {
            term,
            success: false,
            reason: Some("no".to_string()),
        }
    }

    fn flush_request(term: u64, entries: Vec<LogEntry>) -> AppendEntriesRequest {
        AppendEntriesRequest {
            term,
            leader_id: 1,
            prev_log_index: 0,
            prev_log_term: 0,
            entries,
            commit_index: 0,
        }
    }

    #[tokio::test]
    async fn test_flush_advances_next_index_on_success() {
        let peer = ScriptedPeer::new(2, vec![ok_response(1)]);
        let ni = Arc::new(NextIndex::new([2], 1));

        let req = flush_request(1, vec![entry(1, 1, b"a"), entry(2, 1, b"b")]);
        flush(peer, req, Arc::clone(&ni)).await.unwrap();

        assert_eq!(ni.get(2).await, 3);
    }

    #[tokio::test]
    async fn test_flush_leaves_cursor_alone_on_empty_success() {
        let peer = ScriptedPeer::new(2, vec![ok_response(1)]);
        let ni = Arc::new(NextIndex::new([2], 4));

        flush(peer, flush_request(1, Vec::new()), Arc::clone(&ni))
            .await
            .unwrap();

        assert_eq!(ni.get(2).await, 4);
    }

    #[tokio::test]
    async fn test_flush_decrements_on_rejection() {
        let peer = ScriptedPeer::new(2, vec![reject_response(1)]);
        let ni = Arc::new(NextIndex::new([2], 3));

        let err = flush(peer, flush_request(1, Vec::new()), Arc::clone(&ni))
            .await
            .unwrap_err();

        assert!(matches!(err, RaftError::Rejected));
        assert_eq!(ni.get(2).await, 2);
    }

    #[tokio::test]
    async fn test_flush_reports_deposed_on_higher_term() {
        let peer = ScriptedPeer::new(2, vec![reject_response(9)]);
        let ni = Arc::new(NextIndex::new([2], 3));

        let err = flush(peer, flush_request(1, Vec::new()), Arc::clone(&ni))
            .await
            .unwrap_err();

        assert!(matches!(err, RaftError::Deposed));
        // Deposition is not a replication failure; the cursor is untouched.
        assert_eq!(ni.get(2).await, 3);
    }

    #[test]
    #[should_panic(expected = "server id must be greater than zero")]
    fn test_zero_id_is_rejected() {
        let _ = Server::new(0, std::io::sink(), |cmd: &[u8]| Ok(cmd.to_vec()));
    }
}
