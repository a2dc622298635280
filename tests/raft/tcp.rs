use super::cluster::{config, wait_for, Commands, Recorder};

use pretty_assertions::assert_eq;
use replog::error::Result;
use replog::raft::transport::{Tcp, TcpOptions};
use replog::raft::{Configuration, Raft, Role, Server, Transport};
use replog::storage::{self, FileSnapshots, LogStore, SnapshotStore, StableStore};
use std::sync::{Arc, PoisonError};
use std::time::Duration;

#[test]
/// A cluster over TCP with file-backed stores elects a leader and replicates
/// commands.
fn tcp_cluster() -> Result<()> {
    let dir = tempfile::TempDir::with_prefix("replog")?;
    let transports = (0..3)
        .map(|_| Tcp::bind("127.0.0.1:0", TcpOptions::default()))
        .collect::<Result<Vec<_>>>()?;
    let servers = transports
        .iter()
        .enumerate()
        .map(|(i, transport)| Server::voter(format!("n{i}"), transport.local_addr()))
        .collect();
    let configuration = Configuration::new(servers);

    let mut nodes = Vec::new();
    for (i, transport) in transports.into_iter().enumerate() {
        let config = config(&format!("n{i}"));
        let store = Arc::new(storage::File::new(dir.path().join(format!("n{i}.log")), false)?);
        let snapshots = Arc::new(FileSnapshots::new(dir.path().join(format!("n{i}.snap")), 2)?);
        let commands = Commands::default();
        let log: Arc<dyn LogStore> = store.clone();
        let stable: Arc<dyn StableStore> = store;
        let snapshots: Arc<dyn SnapshotStore> = snapshots;
        let raft = Raft::new(
            config,
            Box::new(Recorder::new(commands.clone())),
            log,
            stable,
            snapshots,
            Arc::new(transport),
        )?;
        nodes.push((raft, commands));
    }
    for (raft, _) in &nodes {
        raft.bootstrap_cluster(configuration.clone()).wait()?;
    }

    let mut leader = 0;
    wait_for(|| match nodes.iter().position(|(raft, _)| raft.state() == Role::Leader) {
        Some(i) => {
            leader = i;
            true
        }
        None => false,
    })?;
    let raft = &nodes[leader].0;
    for command in [b"a", b"b", b"c"] {
        raft.apply(command.to_vec(), Duration::from_secs(1)).wait()?;
    }
    raft.verify_leader().wait()?;

    let expect = vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()];
    wait_for(|| {
        nodes.iter().all(|(_, commands)| {
            *commands.lock().unwrap_or_else(PoisonError::into_inner) == expect
        })
    })?;
    for (raft, _) in &nodes {
        assert_eq!(raft.get_configuration().wait()?.latest, configuration);
        raft.shutdown().wait()?;
    }
    Ok(())
}
