//! Test harness for in-process Raft cluster integration tests.
//!
//! Wires servers together through `LocalPeer` and provides polling helpers
//! and the client retry discipline used by the consensus tests.

#![allow(dead_code)]

use std::io::Write;
use std::sync::{Arc, Mutex, Once};
use std::time::Duration;

use raft_lite::{ApplyError, LocalPeer, Peer, Peers, RaftError, Role, Server, TimingConfig};
use tracing_subscriber::EnvFilter;

static TRACING_INIT: Once = Once::new();

/// Installs a `tracing` subscriber honoring `RUST_LOG`, once per process, so
/// a failing test can be rerun with e.g. `RUST_LOG=raft_lite=debug`.
pub fn init_tracing() {
    TRACING_INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
            )
            .with_test_writer()
            .try_init();
    });
}

/// Shared byte buffer used both as a log storage sink and as the "state
/// machine" each server applies committed commands into.
#[derive(Clone, Default)]
pub struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

impl SharedBuffer {
    pub fn contents(&self) -> Vec<u8> {
        self.0.lock().unwrap().clone()
    }

    pub fn push(&self, bytes: &[u8]) {
        self.0.lock().unwrap().extend_from_slice(bytes);
    }
}

impl Write for SharedBuffer {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.push(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// Short timeouts so tests converge quickly.
pub fn test_timing() -> TimingConfig {
    TimingConfig::new(25)
}

/// A running cluster of in-process servers with ids `1..=n`.
///
/// Each server's apply function appends the committed command to that
/// server's machine buffer and echoes the command back as the response.
pub struct TestCluster {
    pub servers: Vec<Arc<Server>>,
    pub machines: Vec<SharedBuffer>,
}

impl TestCluster {
    pub fn start(n: usize, timing: TimingConfig) -> Self {
        init_tracing();

        let mut servers = Vec::with_capacity(n);
        let mut machines = Vec::with_capacity(n);

        for i in 0..n {
            let machine = SharedBuffer::default();
            let recorder = machine.clone();
            let server = Arc::new(Server::with_timing(
                (i + 1) as u64,
                SharedBuffer::default(),
                move |cmd: &[u8]| -> Result<Vec<u8>, ApplyError> {
                    recorder.push(cmd);
                    Ok(cmd.to_vec())
                },
                timing.clone(),
            ));
            machines.push(machine);
            servers.push(server);
        }

        let peers: Peers = servers
            .iter()
            .map(|s| Arc::new(LocalPeer::new(Arc::clone(s))) as Arc<dyn Peer>)
            .collect();
        for server in &servers {
            server.set_peers(peers.clone());
        }
        for server in &servers {
            server.start();
        }

        Self { servers, machines }
    }

    pub fn leader(&self) -> Option<&Arc<Server>> {
        self.servers.iter().find(|s| s.state() == Role::Leader)
    }

    pub fn count_leaders(&self) -> usize {
        self.servers
            .iter()
            .filter(|s| s.state() == Role::Leader)
            .count()
    }

    pub fn stop(&self) {
        for server in &self.servers {
            server.stop();
        }
    }
}

/// Submits a command with the client retry discipline: follow `NotLeader`
/// redirects, wait out elections on `UnknownLeader`, retry `Deposed`
/// idempotently, and accept `Timeout` as probable success (the entry is in
/// the leader's log and heartbeats will finish the job).
pub async fn submit(
    cluster: &TestCluster,
    start: usize,
    command: Vec<u8>,
) -> Result<(), RaftError> {
    let mut target = start % cluster.servers.len();
    for _ in 0..200 {
        let server = &cluster.servers[target];
        match server.command(command.clone()).await {
            Ok(_) => return Ok(()),
            Err(RaftError::NotLeader(Some(leader))) => {
                target = cluster
                    .servers
                    .iter()
                    .position(|s| s.id() == leader)
                    .unwrap_or((target + 1) % cluster.servers.len());
            }
            Err(RaftError::NotLeader(None))
            | Err(RaftError::UnknownLeader)
            | Err(RaftError::Deposed) => {
                tokio::time::sleep(Duration::from_millis(25)).await;
            }
            Err(RaftError::Timeout) => return Ok(()),
            Err(err) => return Err(err),
        }
    }
    Err(RaftError::UnknownLeader)
}

/// Polls `condition` until it holds or the timeout elapses.
pub async fn wait_for<F>(condition: F, timeout: Duration) -> bool
where
    F: Fn() -> bool,
{
    let start = tokio::time::Instant::now();
    while start.elapsed() < timeout {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

pub async fn assert_eventually<F>(condition: F, timeout: Duration, message: &str)
where
    F: Fn() -> bool,
{
    assert!(wait_for(condition, timeout).await, "{}", message);
}
