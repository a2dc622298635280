use super::cluster::{wait_for, TestCluster};

use pretty_assertions::assert_eq;
use replog::error::{Error, Result};
use replog::raft::{Role, Server, Suffrage};
use std::time::Duration;

#[test]
/// Adding a voter replicates the new configuration to every node, and a
/// second change based on the same configuration index is rejected.
fn add_voter() -> Result<()> {
    let mut cluster = TestCluster::run(3)?;
    let leader = cluster.leader()?;
    cluster.apply(leader, b"before")?;

    let added = cluster.add_node(|_| {})?;
    let raft = cluster.nodes[leader].raft();
    let prev_index = raft.get_configuration().wait()?.latest_index;
    let applied = raft.add_voter("n3", "n3", prev_index, Duration::ZERO).wait()?;
    assert!(applied.index > prev_index);

    let expect = raft.get_configuration().wait()?.latest;
    assert_eq!(expect.servers.len(), 4);
    assert_eq!(expect.get("n3"), Some(&Server::voter("n3", "n3")));
    wait_for(|| {
        cluster.nodes.iter().all(|node| {
            node.raft().get_configuration().wait().is_ok_and(|c| c.latest == expect)
        })
    })?;

    let result = raft.add_voter("n4", "n4", prev_index, Duration::ZERO).wait();
    assert!(matches!(result, Err(Error::ConfigurationChanged { .. })), "{result:?}");

    // The new voter catches up on the log.
    cluster.apply(leader, b"after")?;
    let all = cluster.running_except(&[]);
    cluster.wait_for_convergence(&all)?;
    assert_eq!(cluster.nodes[added].commands(), vec![b"before".to_vec(), b"after".to_vec()]);
    Ok(())
}

#[test]
/// A nonvoter receives the log, but doesn't count towards the quorum and
/// never campaigns.
fn nonvoter() -> Result<()> {
    let mut cluster = TestCluster::run(3)?;
    let leader = cluster.leader()?;
    let added = cluster.add_node(|_| {})?;
    let raft = cluster.nodes[leader].raft();
    raft.add_nonvoter("n3", "n3", 0, Duration::ZERO).wait()?;
    assert_eq!(raft.stats().num_peers, 2);

    cluster.apply(leader, b"x")?;
    let all = cluster.running_except(&[]);
    cluster.wait_for_convergence(&all)?;
    assert_eq!(cluster.nodes[added].commands(), vec![b"x".to_vec()]);

    // With the voters gone, the nonvoter stays a follower.
    for i in 0..3 {
        cluster.stop(i)?;
    }
    std::thread::sleep(Duration::from_millis(500));
    assert_eq!(cluster.nodes[added].raft().state(), Role::Follower);
    Ok(())
}

#[test]
/// A demoted voter keeps receiving the log as a nonvoter.
fn demote_voter() -> Result<()> {
    let cluster = TestCluster::run(3)?;
    let leader = cluster.leader()?;
    let follower = (leader + 1) % 3;
    let id = cluster.nodes[follower].id.clone();

    let raft = cluster.nodes[leader].raft();
    raft.demote_voter(id.as_str(), 0, Duration::ZERO).wait()?;
    let latest = raft.get_configuration().wait()?.latest;
    assert_eq!(latest.get(&id).map(|server| server.suffrage), Some(Suffrage::Nonvoter));

    cluster.apply(leader, b"x")?;
    let all = cluster.running_except(&[]);
    cluster.wait_for_convergence(&all)?;
    Ok(())
}

#[test]
/// A staging server left by an older version receives the log, and becomes
/// a voter once promoted.
fn promote_staging() -> Result<()> {
    let cluster =
        TestCluster::run_suffrages(&[Suffrage::Voter, Suffrage::Voter, Suffrage::Staging])?;
    let leader = cluster.leader()?;
    let raft = cluster.nodes[leader].raft();
    assert_eq!(raft.stats().num_peers, 1);

    let prev_index = raft.get_configuration().wait()?.latest_index;
    raft.promote("n2", prev_index, Duration::ZERO).wait()?;
    let latest = raft.get_configuration().wait()?.latest;
    assert_eq!(latest.get("n2"), Some(&Server::voter("n2", "n2")));
    assert_eq!(raft.stats().num_peers, 2);

    cluster.apply(leader, b"x")?;
    let all = cluster.running_except(&[]);
    cluster.wait_for_convergence(&all)?;
    assert_eq!(cluster.nodes[2].commands(), vec![b"x".to_vec()]);
    Ok(())
}

#[test]
/// A removed follower is no longer replicated to, and the remaining servers
/// carry on without it.
fn remove_follower() -> Result<()> {
    let cluster = TestCluster::run(3)?;
    let leader = cluster.leader()?;
    let follower = (leader + 1) % 3;
    let id = cluster.nodes[follower].id.clone();

    let raft = cluster.nodes[leader].raft();
    raft.remove_server(id.as_str(), 0, Duration::ZERO).wait()?;
    assert!(!raft.get_configuration().wait()?.latest.contains(&id));
    assert_eq!(raft.stats().num_peers, 1);

    let rest = cluster.running_except(&[follower]);
    cluster.apply(leader, b"x")?;
    cluster.wait_for_convergence(&rest)?;
    assert!(cluster.nodes[follower].commands().is_empty());
    assert_eq!(cluster.leader_among(&rest)?, leader);
    Ok(())
}

#[test]
/// A removed leader shuts down once the removal commits, and the remaining
/// servers elect a new leader.
fn remove_leader_shutdown() -> Result<()> {
    remove_leader(true)
}

#[test]
/// With shutdown_on_remove disabled, a removed leader steps down instead.
fn remove_leader_step_down() -> Result<()> {
    remove_leader(false)
}

fn remove_leader(shutdown_on_remove: bool) -> Result<()> {
    let cluster =
        TestCluster::run_with(3, |config| config.shutdown_on_remove = shutdown_on_remove)?;
    let leader = cluster.leader()?;
    let id = cluster.nodes[leader].id.clone();

    // A leader shutting itself down may not get to respond.
    let result = cluster.nodes[leader].raft().remove_server(id.as_str(), 0, Duration::ZERO).wait();
    match shutdown_on_remove {
        true => assert!(result.is_ok() || result == Err(Error::RaftShutdown), "{result:?}"),
        false => assert!(result.is_ok(), "{result:?}"),
    }
    let rest = cluster.running_except(&[leader]);
    let new = cluster.leader_among(&rest)?;
    assert_ne!(new, leader);
    let old = cluster.nodes[leader].raft();
    match shutdown_on_remove {
        true => wait_for(|| old.state() == Role::Shutdown)?,
        false => assert_ne!(old.state(), Role::Leader),
    }

    let latest = cluster.nodes[new].raft().get_configuration().wait()?.latest;
    assert!(!latest.contains(&id));
    Ok(())
}

#[test]
/// Changes that would leave the cluster without voters are rejected.
fn remove_last_voter() -> Result<()> {
    let cluster = TestCluster::run(1)?;
    let raft = cluster.nodes[0].raft();
    cluster.leader()?;
    let result = raft.remove_server("n0", 0, Duration::ZERO).wait();
    assert!(matches!(result, Err(Error::InvalidInput(_))), "{result:?}");
    Ok(())
}
