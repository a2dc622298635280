use super::cluster::{wait_for, TestCluster};

use pretty_assertions::assert_eq;
use replog::error::{Error, Result};
use replog::raft::Role;
use std::time::Duration;

#[test]
/// A command applied on the leader commits and is applied on every node.
fn basic_commit() -> Result<()> {
    let cluster = TestCluster::run(3)?;
    let leader = cluster.leader()?;

    let applied = cluster.nodes[leader].raft().apply(b"x".to_vec(), Duration::from_secs(1));
    let applied = applied.wait()?;
    assert_eq!(applied.response, b"x".to_vec());

    // Index 1 is the bootstrap configuration, and index 2 the leader's noop.
    assert_eq!(applied.index, 3);
    wait_for(|| cluster.nodes.iter().all(|node| node.raft().applied_index() == applied.index))?;
    for node in &cluster.nodes {
        assert_eq!(node.commands(), vec![b"x".to_vec()]);
    }
    Ok(())
}

#[test]
/// A leader partitioned with an uncommitted entry loses leadership, and the
/// entry is never applied anywhere once the partition heals.
fn leader_loss_during_commit() -> Result<()> {
    let cluster = TestCluster::run_with(5, |config| {
        config.heartbeat_timeout = Duration::from_millis(200);
        config.election_timeout = Duration::from_millis(200);
        config.leader_lease_timeout = Duration::from_millis(200);
    })?;
    let old = cluster.leader()?;

    cluster.partition(&[old])?;
    let lost = cluster.nodes[old].raft().apply(b"lost".to_vec(), Duration::from_secs(1));
    assert_eq!(lost.wait(), Err(Error::LeadershipLost));

    let majority = cluster.running_except(&[old]);
    let new = cluster.leader_among(&majority)?;
    assert_ne!(new, old);
    cluster.apply(new, b"kept")?;

    cluster.connect_all()?;
    let all = cluster.running_except(&[]);
    cluster.wait_for_convergence(&all)?;
    for node in &cluster.nodes {
        assert_eq!(node.commands(), vec![b"kept".to_vec()]);
    }
    Ok(())
}

#[test]
/// Commands are applied in order, and a barrier resolves once everything
/// before it has been applied.
fn barrier() -> Result<()> {
    let cluster = TestCluster::run(3)?;
    let leader = cluster.leader()?;
    let raft = cluster.nodes[leader].raft();

    let futures: Vec<_> =
        (0..100u32).map(|i| raft.apply(i.to_be_bytes().to_vec(), Duration::ZERO)).collect();
    raft.barrier(Duration::ZERO).wait()?;
    for future in &futures {
        assert!(future.try_wait().is_some());
    }
    let expect: Vec<Vec<u8>> = (0..100u32).map(|i| i.to_be_bytes().to_vec()).collect();
    assert_eq!(cluster.nodes[leader].commands(), expect);

    let all = cluster.running_except(&[]);
    cluster.wait_for_convergence(&all)?;
    Ok(())
}

#[test]
/// Leadership verification succeeds on the leader and fails elsewhere, and
/// writes to followers are rejected.
fn verify_leader() -> Result<()> {
    let cluster = TestCluster::run(3)?;
    let leader = cluster.leader()?;
    cluster.nodes[leader].raft().verify_leader().wait()?;

    let follower = (leader + 1) % 3;
    let raft = cluster.nodes[follower].raft();
    assert_eq!(raft.state(), Role::Follower);
    assert_eq!(raft.verify_leader().wait(), Err(Error::NotLeader));
    assert_eq!(raft.apply(b"x".to_vec(), Duration::ZERO).wait(), Err(Error::NotLeader));
    wait_for(|| raft.leader().1 == cluster.nodes[leader].id)?;
    Ok(())
}

#[test]
/// A leader that can't reach a quorum fails verification once it loses its
/// lease, and a follower elected by the majority takes over.
fn verify_leader_partitioned() -> Result<()> {
    let cluster = TestCluster::run(3)?;
    let leader = cluster.leader()?;
    cluster.partition(&[leader])?;
    assert!(cluster.nodes[leader].raft().verify_leader().wait().is_err());
    let majority = cluster.running_except(&[leader]);
    cluster.leader_among(&majority)?;
    Ok(())
}

#[test]
/// Nonvoters don't count towards the quorum when verifying leadership, so a
/// leader that can only reach nonvoters fails verification.
fn verify_leader_ignores_nonvoters() -> Result<()> {
    let mut cluster = TestCluster::run(3)?;
    let leader = cluster.leader()?;
    let mut nonvoters = Vec::new();
    for _ in 0..2 {
        let i = cluster.add_node(|_| {})?;
        let id = cluster.nodes[i].id.clone();
        let raft = cluster.nodes[leader].raft();
        raft.add_nonvoter(id.as_str(), id.as_str(), 0, Duration::ZERO).wait()?;
        nonvoters.push(i);
    }
    let all = cluster.running_except(&[]);
    cluster.wait_for_convergence(&all)?;

    let mut group = nonvoters.clone();
    group.push(leader);
    cluster.partition(&group)?;
    assert!(cluster.nodes[leader].raft().verify_leader().wait().is_err());
    let voters = cluster.running_except(&group);
    cluster.leader_among(&voters)?;
    Ok(())
}

#[test]
/// Batched apply channels still apply every command once.
fn batch_apply_channel() -> Result<()> {
    let cluster = TestCluster::run_with(3, |config| config.batch_apply_ch = true)?;
    let leader = cluster.leader()?;
    let raft = cluster.nodes[leader].raft();
    let futures: Vec<_> =
        (0..500u32).map(|i| raft.apply(i.to_be_bytes().to_vec(), Duration::ZERO)).collect();
    let mut last = 0;
    for future in futures {
        let index = future.wait()?.index;
        assert!(index > last);
        last = index;
    }
    let all = cluster.running_except(&[]);
    cluster.wait_for_convergence(&all)?;
    assert_eq!(cluster.nodes[leader].commands().len(), 500);
    Ok(())
}
