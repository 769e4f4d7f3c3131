pub mod config;
pub mod error;
pub mod log;
pub mod message;
pub mod next_index;
pub mod peer;
pub mod server;
pub mod timer;

pub use config::TimingConfig;
pub use error::{RaftError, Result};
pub use log::{ApplyError, ApplyFn, Log, LogEntry, LogError};
pub use message::{AppendEntriesRequest, AppendEntriesResponse, VoteRequest, VoteResponse};
pub use peer::{LocalPeer, Peer, Peers};
pub use server::{Role, Server};
