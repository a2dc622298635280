use super::cluster::{config, Commands, Recorder};

use pretty_assertions::assert_eq;
use replog::error::Result;
use replog::raft::transport::Memory;
use replog::raft::{
    self, Configuration, Header, Raft, RequestVoteRequest, Server, Transport, PROTOCOL_VERSION_MAX,
};
use replog::storage::{self, LogStore, MemorySnapshots, SnapshotStore, StableStore};
use std::sync::Arc;
use std::time::Duration;

/// Starts node a on the given stores, connected to the client transport.
fn start(
    store: &Arc<storage::Memory>,
    snapshots: &Arc<MemorySnapshots>,
    client: &Memory,
) -> Result<Raft> {
    // A long heartbeat timeout keeps a from campaigning during the test.
    let config = raft::Config {
        heartbeat_timeout: Duration::from_secs(10),
        election_timeout: Duration::from_secs(10),
        ..config("a")
    };
    let transport = Memory::new("a");
    client.connect(&transport)?;
    let log: Arc<dyn LogStore> = store.clone();
    let stable: Arc<dyn StableStore> = store.clone();
    let snapshots: Arc<dyn SnapshotStore> = snapshots.clone();
    let state = Box::new(Recorder::new(Commands::default()));
    Raft::new(config, state, log, stable, snapshots, Arc::new(transport))
}

/// Requests a vote from a in the given term.
fn request_vote(client: &Memory, candidate: &str, term: u64) -> Result<bool> {
    let request = RequestVoteRequest {
        header: Header {
            protocol_version: PROTOCOL_VERSION_MAX,
            id: candidate.as_bytes().to_vec(),
            addr: candidate.as_bytes().to_vec(),
        },
        term,
        candidate: candidate.as_bytes().to_vec(),
        last_log_index: 10,
        last_log_term: 10,
        leadership_transfer: false,
    };
    Ok(client.request_vote("a", "a", &request)?.granted)
}

#[test]
/// The current term and vote survive a restart, so a server never votes for
/// two candidates in the same term.
fn vote_survives_restart() -> Result<()> {
    let store = Arc::new(storage::Memory::new());
    let snapshots = Arc::new(MemorySnapshots::new());
    let servers = ["a", "b", "c"].map(|id| Server::voter(id, id));
    let configuration = Configuration::new(servers.to_vec());
    let transport = Memory::new("a");
    raft::bootstrap_cluster(&config("a"), &*store, &*store, &*snapshots, &transport, &configuration)?;

    let client = Memory::new("client");
    let node = start(&store, &snapshots, &client)?;
    assert!(request_vote(&client, "b", 5)?);
    assert_eq!(node.current_term(), 5);
    node.shutdown().wait()?;

    let node = start(&store, &snapshots, &client)?;
    assert_eq!(node.current_term(), 5);
    assert!(!request_vote(&client, "c", 5)?);
    // A repeated request from the same candidate is granted again.
    assert!(request_vote(&client, "b", 5)?);
    // A newer term allows a new vote.
    assert!(request_vote(&client, "c", 6)?);
    node.shutdown().wait()?;
    Ok(())
}
