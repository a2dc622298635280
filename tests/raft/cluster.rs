use replog::encoding::bincode;
use replog::error::{Error, Result};
use replog::raft::transport::Memory;
use replog::raft::{
    self, Config, Configuration, Entry, Index, Raft, Role, Server, Snapshot, State, Suffrage,
    Transport,
};
use replog::storage::{self, LogStore, MemorySnapshots, SnapshotStore, StableStore};

use std::io::{Read, Write};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

/// How long to wait for the cluster to converge.
pub const TIMEOUT: Duration = Duration::from_secs(10);

/// Commands applied to a state machine, in order.
pub type Commands = Arc<Mutex<Vec<Vec<u8>>>>;

/// A state machine recording applied commands. Responds with the command.
pub struct Recorder {
    commands: Commands,
}

impl Recorder {
    pub fn new(commands: Commands) -> Self {
        Self { commands }
    }
}

struct RecorderSnapshot(Vec<Vec<u8>>);

impl Snapshot for RecorderSnapshot {
    fn persist(&mut self, sink: &mut dyn Write) -> Result<()> {
        bincode::serialize_into(sink, &self.0)
    }
}

impl State for Recorder {
    fn apply(&mut self, entry: &Entry) -> Result<Vec<u8>> {
        self.commands.lock().unwrap_or_else(PoisonError::into_inner).push(entry.data.clone());
        Ok(entry.data.clone())
    }

    fn snapshot(&mut self) -> Result<Box<dyn Snapshot>> {
        let commands = self.commands.lock().unwrap_or_else(PoisonError::into_inner).clone();
        Ok(Box::new(RecorderSnapshot(commands)))
    }

    fn restore(&mut self, reader: &mut dyn Read) -> Result<()> {
        let commands = bincode::deserialize_from(reader)?;
        *self.commands.lock().unwrap_or_else(PoisonError::into_inner) = commands;
        Ok(())
    }
}

/// Returns a fast node configuration for in-memory clusters.
pub fn config(id: &str) -> Config {
    Config {
        local_id: id.to_string(),
        heartbeat_timeout: Duration::from_millis(50),
        election_timeout: Duration::from_millis(50),
        leader_lease_timeout: Duration::from_millis(50),
        commit_timeout: Duration::from_millis(5),
        snapshot_interval: Duration::from_secs(3600),
        ..Default::default()
    }
}

/// A cluster node. Its stores outlive restarts.
pub struct TestNode {
    pub id: String,
    pub config: Config,
    pub store: Arc<storage::Memory>,
    pub snapshots: Arc<MemorySnapshots>,
    pub transport: Memory,
    pub commands: Commands,
    pub raft: Option<Raft>,
}

impl TestNode {
    /// Creates a stopped node with empty stores.
    fn new(config: Config) -> Self {
        Self {
            id: config.local_id.clone(),
            transport: Memory::new(config.local_id.as_str()),
            config,
            store: Arc::new(storage::Memory::new()),
            snapshots: Arc::new(MemorySnapshots::new()),
            commands: Commands::default(),
            raft: None,
        }
    }

    /// Starts the node on its existing stores, with a fresh state machine.
    fn start(&mut self) -> Result<()> {
        self.commands = Commands::default();
        let state = Box::new(Recorder::new(self.commands.clone()));
        let log: Arc<dyn LogStore> = self.store.clone();
        let stable: Arc<dyn StableStore> = self.store.clone();
        let snapshots: Arc<dyn SnapshotStore> = self.snapshots.clone();
        let transport: Arc<dyn Transport> = Arc::new(self.transport.clone());
        self.raft = Some(Raft::new(self.config.clone(), state, log, stable, snapshots, transport)?);
        Ok(())
    }

    /// Returns the running node.
    pub fn raft(&self) -> &Raft {
        self.raft.as_ref().expect("node is stopped")
    }

    /// Returns the commands applied to the state machine.
    pub fn commands(&self) -> Vec<Vec<u8>> {
        self.commands.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

/// An in-process cluster over the in-memory transport. All nodes are
/// shut down when dropped.
pub struct TestCluster {
    pub nodes: Vec<TestNode>,
}

impl TestCluster {
    /// Starts a cluster of n voters bootstrapped with the default test config.
    pub fn run(n: usize) -> Result<Self> {
        Self::run_with(n, |_| {})
    }

    /// Starts a cluster of n voters, adjusting each node's config first.
    pub fn run_with(n: usize, adjust: impl Fn(&mut Config)) -> Result<Self> {
        Self::bootstrap(&vec![Suffrage::Voter; n], adjust)
    }

    /// Starts a cluster with one server per given suffrage.
    pub fn run_suffrages(suffrages: &[Suffrage]) -> Result<Self> {
        Self::bootstrap(suffrages, |_| {})
    }

    fn bootstrap(suffrages: &[Suffrage], adjust: impl Fn(&mut Config)) -> Result<Self> {
        let mut nodes = Vec::new();
        for i in 0..suffrages.len() {
            let mut config = config(&format!("n{i}"));
            adjust(&mut config);
            nodes.push(TestNode::new(config));
        }
        let configuration = Configuration::new(
            nodes
                .iter()
                .zip(suffrages)
                .map(|(node, suffrage)| Server {
                    suffrage: *suffrage,
                    id: node.id.clone(),
                    address: node.id.clone(),
                })
                .collect(),
        );
        for node in &nodes {
            raft::bootstrap_cluster(
                &node.config,
                &*node.store,
                &*node.store,
                &*node.snapshots,
                &node.transport,
                &configuration,
            )?;
        }

        let mut cluster = Self { nodes };
        cluster.connect_all()?;
        for node in &mut cluster.nodes {
            node.start()?;
        }
        Ok(cluster)
    }

    /// Adds and starts a node that isn't part of the configuration.
    pub fn add_node(&mut self, adjust: impl Fn(&mut Config)) -> Result<usize> {
        let mut config = config(&format!("n{}", self.nodes.len()));
        adjust(&mut config);
        let mut node = TestNode::new(config);
        node.start()?;
        self.nodes.push(node);
        self.connect_all()?;
        Ok(self.nodes.len() - 1)
    }

    /// Connects every node to every other node.
    pub fn connect_all(&self) -> Result<()> {
        for a in &self.nodes {
            for b in &self.nodes {
                if a.id != b.id {
                    a.transport.connect(&b.transport)?;
                }
            }
        }
        Ok(())
    }

    /// Partitions the given nodes from the rest, in both directions.
    pub fn partition(&self, group: &[usize]) -> Result<()> {
        for (i, a) in self.nodes.iter().enumerate() {
            for (j, b) in self.nodes.iter().enumerate() {
                if group.contains(&i) != group.contains(&j) {
                    a.transport.disconnect(&b.id)?;
                }
            }
        }
        Ok(())
    }

    /// Stops a node, keeping its stores.
    pub fn stop(&mut self, i: usize) -> Result<()> {
        self.partition(&[i])?;
        if let Some(raft) = self.nodes[i].raft.take() {
            raft.shutdown().wait()?;
        }
        Ok(())
    }

    /// Restarts a stopped node on a fresh transport.
    pub fn restart(&mut self, i: usize) -> Result<()> {
        let node = &mut self.nodes[i];
        node.transport = Memory::new(node.id.as_str());
        node.start()?;
        self.connect_all()
    }

    /// Returns the running nodes' indexes, except the given ones.
    pub fn running_except(&self, except: &[usize]) -> Vec<usize> {
        (0..self.nodes.len())
            .filter(|i| !except.contains(i) && self.nodes[*i].raft.is_some())
            .collect()
    }

    /// Waits for exactly one leader among the given nodes, returning it.
    pub fn leader_among(&self, among: &[usize]) -> Result<usize> {
        let mut leader = None;
        wait_for(|| {
            let leaders: Vec<usize> = among
                .iter()
                .copied()
                .filter(|i| self.nodes[*i].raft().state() == Role::Leader)
                .collect();
            leader = match leaders.as_slice() {
                [leader] => Some(*leader),
                _ => None,
            };
            leader.is_some()
        })?;
        leader.ok_or_else(|| Error::IO("no leader".into()))
    }

    /// Waits for exactly one leader among the running nodes.
    pub fn leader(&self) -> Result<usize> {
        self.leader_among(&self.running_except(&[]))
    }

    /// Waits for the given nodes to apply the same commands as the leader,
    /// up to the leader's commit index.
    pub fn wait_for_convergence(&self, among: &[usize]) -> Result<()> {
        let leader = self.leader_among(among)?;
        wait_for(|| {
            let expect = self.nodes[leader].commands();
            let commit_index = self.nodes[leader].raft().commit_index();
            among.iter().all(|i| {
                let raft = self.nodes[*i].raft();
                raft.applied_index() >= commit_index && self.nodes[*i].commands() == expect
            })
        })
    }

    /// Applies a command on the given node and waits for the result.
    pub fn apply(&self, i: usize, command: &[u8]) -> Result<Index> {
        Ok(self.nodes[i].raft().apply(command.to_vec(), Duration::from_secs(1)).wait()?.index)
    }
}

impl Drop for TestCluster {
    fn drop(&mut self) {
        for node in &mut self.nodes {
            if let Some(raft) = node.raft.take() {
                let _ = raft.shutdown().wait();
            }
        }
    }
}

/// Polls the condition until it holds, or fails after TIMEOUT.
pub fn wait_for(mut condition: impl FnMut() -> bool) -> Result<()> {
    let started = Instant::now();
    while !condition() {
        if started.elapsed() >= TIMEOUT {
            return Err(Error::IO("timed out waiting for condition".into()));
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    Ok(())
}
