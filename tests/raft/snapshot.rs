use super::cluster::{wait_for, TestCluster};

use pretty_assertions::assert_eq;
use replog::error::{Error, Result};
use replog::storage::{LogStore as _, SnapshotStore as _};
use std::io::Read as _;
use std::time::Duration;

#[test]
/// A follower that falls behind the leader's compacted log catches up via
/// InstallSnapshot, and ends up with the leader's state.
fn install_snapshot_catch_up() -> Result<()> {
    const THRESHOLD: u64 = 100;
    const TRAILING: u64 = 50;
    let mut cluster = TestCluster::run_with(3, |config| {
        config.snapshot_threshold = THRESHOLD;
        config.trailing_logs = TRAILING;
        config.snapshot_interval = Duration::from_millis(50);
    })?;
    let leader = cluster.leader()?;
    let follower = (leader + 1) % 3;
    cluster.stop(follower)?;

    let snapshot_index = {
        let raft = cluster.nodes[leader].raft();
        let futures: Vec<_> = (0..10_000u32)
            .map(|i| raft.apply(i.to_be_bytes().to_vec(), Duration::ZERO))
            .collect();
        for future in futures {
            future.wait()?;
        }

        // Wait for the leader's last snapshot and compaction. No further
        // snapshots are taken once fewer than THRESHOLD entries follow it.
        let store = &cluster.nodes[leader].store;
        wait_for(|| {
            let stats = raft.stats();
            let trailing_start = stats.last_snapshot_index.saturating_sub(TRAILING);
            stats.last_snapshot_index > 3
                && stats.commit_index - stats.last_snapshot_index < THRESHOLD
                && store.first_index().is_ok_and(|i| i > trailing_start)
        })?;
        raft.stats().last_snapshot_index
    };

    cluster.restart(follower)?;
    cluster.apply(leader, b"after")?;
    let all = cluster.running_except(&[]);
    cluster.wait_for_convergence(&all)?;

    let mut expect: Vec<Vec<u8>> = (0..10_000u32).map(|i| i.to_be_bytes().to_vec()).collect();
    expect.push(b"after".to_vec());
    let node = &cluster.nodes[follower];
    assert_eq!(node.commands(), expect);

    // The follower installed the leader's snapshot, which replaced its log.
    assert_eq!(node.raft().stats().last_snapshot_index, snapshot_index);
    assert!(!node.snapshots.list()?.is_empty());
    assert!(node.store.first_index()? > snapshot_index - TRAILING);
    assert!(cluster.nodes[leader].store.first_index()? > snapshot_index - TRAILING);
    Ok(())
}

#[test]
/// A snapshot taken on demand can be read back, and restoring it rolls the
/// whole cluster back to that state.
fn user_snapshot_restore() -> Result<()> {
    let cluster = TestCluster::run(3)?;
    let leader = cluster.leader()?;
    cluster.apply(leader, b"a")?;
    cluster.apply(leader, b"b")?;

    let raft = cluster.nodes[leader].raft();
    let snapshot = raft.snapshot().wait()?;
    let (meta, mut reader) = snapshot.open()?;
    assert_eq!(meta.id, snapshot.id());
    let mut data = Vec::new();
    reader.read_to_end(&mut data)?;
    assert_eq!(data.len() as u64, meta.size);

    cluster.apply(leader, b"c")?;
    let (meta, reader) = snapshot.open()?;
    raft.restore(meta, reader, Duration::ZERO)?;
    assert_eq!(cluster.nodes[leader].commands(), vec![b"a".to_vec(), b"b".to_vec()]);

    cluster.apply(leader, b"d")?;
    let all = cluster.running_except(&[]);
    cluster.wait_for_convergence(&all)?;
    for node in &cluster.nodes {
        assert_eq!(node.commands(), vec![b"a".to_vec(), b"b".to_vec(), b"d".to_vec()]);
    }

    // Restores must go through the leader.
    let follower = cluster.nodes[(leader + 1) % 3].raft();
    let (meta, reader) = snapshot.open()?;
    assert_eq!(follower.restore(meta, reader, Duration::ZERO), Err(Error::NotLeader));
    Ok(())
}

#[test]
/// A restarted node restores its latest snapshot before replaying the log.
fn restart_restores_snapshot() -> Result<()> {
    let mut cluster = TestCluster::run(1)?;
    cluster.leader()?;
    cluster.apply(0, b"a")?;
    cluster.nodes[0].raft().snapshot().wait()?;
    cluster.apply(0, b"b")?;

    cluster.stop(0)?;
    cluster.restart(0)?;
    cluster.leader()?;
    wait_for(|| cluster.nodes[0].commands() == vec![b"a".to_vec(), b"b".to_vec()])?;
    Ok(())
}
