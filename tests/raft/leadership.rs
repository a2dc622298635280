use super::cluster::{wait_for, TestCluster};

use pretty_assertions::assert_eq;
use replog::error::Result;
use replog::raft::{Observation, ObservationFilter, Observer, Role};
use std::sync::Arc;
use std::time::Duration;

#[test]
/// Leadership transfers to another voter in a newer term without losing
/// any committed entries.
fn leadership_transfer() -> Result<()> {
    let cluster = TestCluster::run(3)?;
    let old = cluster.leader()?;
    cluster.apply(old, b"before")?;
    let term = cluster.nodes[old].raft().current_term();

    cluster.nodes[old].raft().leadership_transfer().wait()?;
    let all = cluster.running_except(&[]);
    let mut new = old;
    wait_for(|| {
        new = cluster.leader_among(&all).unwrap_or(old);
        new != old
    })?;
    assert!(cluster.nodes[new].raft().current_term() > term);

    cluster.apply(new, b"after")?;
    cluster.wait_for_convergence(&all)?;
    for node in &cluster.nodes {
        assert_eq!(node.commands(), vec![b"before".to_vec(), b"after".to_vec()]);
    }
    Ok(())
}

#[test]
/// Leadership can be transferred to a specific server.
fn leadership_transfer_to_server() -> Result<()> {
    let cluster = TestCluster::run(3)?;
    let old = cluster.leader()?;
    let target = (old + 2) % 3;
    let id = cluster.nodes[target].id.clone();

    cluster.nodes[old].raft().leadership_transfer_to_server(id.as_str(), id.as_str()).wait()?;
    wait_for(|| cluster.nodes[target].raft().state() == Role::Leader)?;
    Ok(())
}

#[test]
/// The leader channel reports gaining and losing leadership.
fn leader_ch() -> Result<()> {
    let cluster = TestCluster::run(3)?;
    let leader = cluster.leader()?;
    let leader_ch = cluster.nodes[leader].raft().leader_ch();
    assert_eq!(leader_ch.recv_timeout(Duration::from_secs(1)), Ok(true));

    cluster.nodes[leader].raft().leadership_transfer().wait()?;
    assert_eq!(leader_ch.recv_timeout(Duration::from_secs(5)), Ok(false));
    Ok(())
}

#[test]
/// Observers receive role and leader changes, filtered as requested, and
/// stop receiving once deregistered.
fn observers() -> Result<()> {
    let cluster = TestCluster::run(3)?;
    let leader = cluster.leader()?;
    let raft = cluster.nodes[leader].raft();

    let (tx, rx) = crossbeam::channel::unbounded();
    let filter: ObservationFilter =
        Arc::new(|observation: &Observation| matches!(observation, Observation::Role(_)));
    let observer = Observer::new(tx, false, Some(filter));
    let id = raft.register_observer(observer.clone());

    raft.leadership_transfer().wait()?;
    assert_eq!(rx.recv_timeout(Duration::from_secs(5)), Ok(Observation::Role(Role::Follower)));
    assert!(observer.observed() >= 1);
    assert_eq!(observer.dropped(), 0);

    raft.deregister_observer(id);
    while rx.try_recv().is_ok() {}
    let all = cluster.running_except(&[]);
    let new = cluster.leader_among(&all)?;
    cluster.nodes[new].raft().leadership_transfer().wait()?;
    cluster.leader_among(&all)?;
    assert!(rx.try_recv().is_err());
    Ok(())
}

#[test]
/// A full observer channel drops observations instead of blocking the node.
fn observer_drops_when_full() -> Result<()> {
    let cluster = TestCluster::run(3)?;
    let leader = cluster.leader()?;
    let raft = cluster.nodes[leader].raft();

    let (tx, _rx) = crossbeam::channel::bounded(0);
    let observer = Observer::new(tx, false, None);
    raft.register_observer(observer.clone());
    raft.leadership_transfer().wait()?;
    wait_for(|| observer.dropped() > 0)?;
    assert_eq!(observer.observed(), 0);
    Ok(())
}
