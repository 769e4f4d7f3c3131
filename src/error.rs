use thiserror::Error;

use crate::log::LogError;

#[derive(Error, Debug)]
pub enum RaftError {
    /// The command was sent to a server that is not the leader. Clients
    /// should retry against the carried leader id, if any.
    #[error("not the leader, current leader is node {0:?}")]
    NotLeader(Option<u64>),

    /// No leader is known, e.g. during an election. Retry after an election
    /// timeout.
    #[error("no leader known")]
    UnknownLeader,

    /// The leader stepped down mid-replication. The command may or may not
    /// have been committed; retry idempotently.
    #[error("deposed during replication")]
    Deposed,

    /// The client-facing deadline elapsed before quorum. The command may
    /// still commit in the background.
    #[error("timed out awaiting quorum")]
    Timeout,

    /// A single follower refused an AppendEntries. Internal to the flush
    /// path; never surfaced to clients.
    #[error("AppendEntries rejected by peer")]
    Rejected,

    #[error("log error: {0}")]
    Log(#[from] LogError),

    /// The server's driver has exited.
    #[error("server stopped")]
    Stopped,
}

pub type Result<T> = std::result::Result<T, RaftError>;
