mod candidate;
mod follower;
mod leader;
mod rpc;

use super::configuration::decode_entry;
use super::fsm::{Commit, FsmRequest};
use super::future::Responder;
use super::observer::{Observation, Observers};
use super::replication::Verify;
use super::state::State;
use super::{
    decode_peers, Applied, Config, Configuration, ConfigurationChange, Configurations, Entry,
    EntryKind, Header, Index, Rpc, ServerAddress, ServerID, Term, Transport, KEY_CURRENT_TERM,
    KEY_LAST_VOTE_CAND, KEY_LAST_VOTE_TERM,
};
use crate::error::{Error, Result};
use crate::storage::{LogStore, SnapshotMeta, SnapshotStore, StableStore};

use crossbeam::channel::{Receiver, Sender};
use log::{error, info, warn};
use rand::Rng as _;
use std::collections::HashMap;
use std::io::Read;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::{Duration, Instant};

/// A node role. Shutdown is terminal.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Role {
    Follower = 0,
    Candidate = 1,
    Leader = 2,
    Shutdown = 3,
}

impl Role {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Role::Follower,
            1 => Role::Candidate,
            2 => Role::Leader,
            _ => Role::Shutdown,
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Follower => write!(f, "Follower"),
            Role::Candidate => write!(f, "Candidate"),
            Role::Leader => write!(f, "Leader"),
            Role::Shutdown => write!(f, "Shutdown"),
        }
    }
}

/// The last log entry and last snapshot positions, updated together.
#[derive(Clone, Copy, Default)]
struct Positions {
    log_index: Index,
    log_term: Term,
    snapshot_index: Index,
    snapshot_term: Term,
}

/// State shared between the node's threads: the main loop, the FSM and
/// snapshot runners, replication workers, the transport's heartbeat fast
/// path, and the public API. Only the main loop changes the role and term.
pub(crate) struct Shared {
    pub protocol_version: u8,
    pub local_id: ServerID,
    pub local_addr: ServerAddress,
    pub log: Arc<dyn LogStore>,
    pub stable: Arc<dyn StableStore>,
    pub snapshots: Arc<dyn SnapshotStore>,
    pub transport: Arc<dyn Transport>,
    pub observers: Observers,
    /// Fires (disconnects) when the node shuts down.
    pub shutdown_rx: Receiver<()>,
    shutdown_tx: Mutex<Option<Sender<()>>>,
    config: RwLock<Config>,
    role: AtomicU8,
    current_term: AtomicU64,
    commit_index: AtomicU64,
    last_applied: AtomicU64,
    positions: Mutex<Positions>,
    leader: RwLock<(ServerAddress, ServerID)>,
    last_contact: RwLock<Option<Instant>>,
    configurations: RwLock<Configurations>,
    leadership_transfer: AtomicBool,
    leader_tx: Sender<bool>,
    leader_rx: Receiver<bool>,
}

impl Shared {
    /// Creates new shared state for a follower.
    pub fn new(
        config: Config,
        log: Arc<dyn LogStore>,
        stable: Arc<dyn StableStore>,
        snapshots: Arc<dyn SnapshotStore>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = crossbeam::channel::bounded(0);
        let (leader_tx, leader_rx) = crossbeam::channel::bounded(1);
        Self {
            protocol_version: config.protocol_version,
            local_id: config.local_id.clone(),
            local_addr: transport.local_addr(),
            log,
            stable,
            snapshots,
            transport,
            observers: Observers::default(),
            shutdown_rx,
            shutdown_tx: Mutex::new(Some(shutdown_tx)),
            config: RwLock::new(config),
            role: AtomicU8::new(Role::Follower as u8),
            current_term: AtomicU64::new(0),
            commit_index: AtomicU64::new(0),
            last_applied: AtomicU64::new(0),
            positions: Mutex::new(Positions::default()),
            leader: RwLock::new((ServerAddress::new(), ServerID::new())),
            last_contact: RwLock::new(None),
            configurations: RwLock::new(Configurations::default()),
            leadership_transfer: AtomicBool::new(false),
            leader_tx,
            leader_rx,
        }
    }

    /// Returns a copy of the current configuration.
    pub fn config(&self) -> Config {
        self.config.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Replaces the configuration.
    pub fn set_config(&self, config: Config) {
        *self.config.write().unwrap_or_else(PoisonError::into_inner) = config;
    }

    pub fn role(&self) -> Role {
        Role::from_u8(self.role.load(Ordering::SeqCst))
    }

    /// Sets the role, notifying observers if it changed. Any role change
    /// clears the known leader, so the leader must be set afterwards.
    pub fn set_role(&self, role: Role) {
        self.set_leader("", "");
        let old = Role::from_u8(self.role.swap(role as u8, Ordering::SeqCst));
        if old != role {
            self.observe(Observation::Role(role));
        }
    }

    /// Shuts the node down. Returns false if it was already shut down.
    pub fn shutdown(&self) -> bool {
        let shutdown_tx = self.shutdown_tx.lock().unwrap_or_else(PoisonError::into_inner).take();
        self.set_role(Role::Shutdown);
        shutdown_tx.is_some()
    }

    pub fn current_term(&self) -> Term {
        self.current_term.load(Ordering::SeqCst)
    }

    /// Persists and sets the current term.
    pub fn set_current_term(&self, term: Term) -> Result<()> {
        self.stable.set_u64(KEY_CURRENT_TERM, term)?;
        self.current_term.store(term, Ordering::SeqCst);
        Ok(())
    }

    /// Persists a vote for the candidate in the term.
    pub fn persist_vote(&self, term: Term, candidate: &[u8]) -> Result<()> {
        self.stable.set_u64(KEY_LAST_VOTE_TERM, term)?;
        self.stable.set(KEY_LAST_VOTE_CAND, candidate.to_vec())
    }

    pub fn commit_index(&self) -> Index {
        self.commit_index.load(Ordering::SeqCst)
    }

    pub fn set_commit_index(&self, index: Index) {
        self.commit_index.store(index, Ordering::SeqCst)
    }

    pub fn last_applied(&self) -> Index {
        self.last_applied.load(Ordering::SeqCst)
    }

    pub fn set_last_applied(&self, index: Index) {
        self.last_applied.store(index, Ordering::SeqCst)
    }

    fn positions(&self) -> Positions {
        *self.positions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns the last log index and term.
    pub fn last_log(&self) -> (Index, Term) {
        let positions = self.positions();
        (positions.log_index, positions.log_term)
    }

    pub fn set_last_log(&self, index: Index, term: Term) {
        let mut positions = self.positions.lock().unwrap_or_else(PoisonError::into_inner);
        positions.log_index = index;
        positions.log_term = term;
    }

    /// Returns the last snapshot index and term.
    pub fn last_snapshot(&self) -> (Index, Term) {
        let positions = self.positions();
        (positions.snapshot_index, positions.snapshot_term)
    }

    pub fn set_last_snapshot(&self, index: Index, term: Term) {
        let mut positions = self.positions.lock().unwrap_or_else(PoisonError::into_inner);
        positions.snapshot_index = index;
        positions.snapshot_term = term;
    }

    /// Returns the last index in the log or the last snapshot, whichever is
    /// greater.
    pub fn last_index(&self) -> Index {
        let positions = self.positions();
        positions.log_index.max(positions.snapshot_index)
    }

    /// Returns the last index and term in the log or the last snapshot,
    /// whichever is greater.
    pub fn last_entry(&self) -> (Index, Term) {
        let positions = self.positions();
        match positions.log_index >= positions.snapshot_index {
            true => (positions.log_index, positions.log_term),
            false => (positions.snapshot_index, positions.snapshot_term),
        }
    }

    /// Returns the known leader's address and ID, empty if unknown.
    pub fn leader(&self) -> (ServerAddress, ServerID) {
        self.leader.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Sets the known leader, notifying observers if it changed.
    pub fn set_leader(&self, address: impl Into<ServerAddress>, id: impl Into<ServerID>) {
        let (address, id) = (address.into(), id.into());
        let mut leader = self.leader.write().unwrap_or_else(PoisonError::into_inner);
        if leader.0 == address && leader.1 == id {
            return;
        }
        *leader = (address.clone(), id.clone());
        drop(leader);
        self.observe(Observation::Leader { address, id });
    }

    /// Returns the last time the node heard from a leader (or, as leader,
    /// when it stepped down).
    pub fn last_contact(&self) -> Option<Instant> {
        *self.last_contact.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_last_contact(&self) {
        *self.last_contact.write().unwrap_or_else(PoisonError::into_inner) = Some(Instant::now());
    }

    /// Returns a copy of the main loop's configurations.
    pub fn configurations(&self) -> Configurations {
        self.configurations.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn set_configurations(&self, configurations: &Configurations) {
        *self.configurations.write().unwrap_or_else(PoisonError::into_inner) =
            configurations.clone();
    }

    pub fn leadership_transfer_in_progress(&self) -> bool {
        self.leadership_transfer.load(Ordering::SeqCst)
    }

    pub fn set_leadership_transfer(&self, in_progress: bool) {
        self.leadership_transfer.store(in_progress, Ordering::SeqCst)
    }

    /// Returns the leadership channel. It holds the latest leadership change
    /// only, older unread values are replaced.
    pub fn leader_ch(&self) -> Receiver<bool> {
        self.leader_rx.clone()
    }

    fn notify_leader(&self, leader: bool) {
        if self.leader_tx.try_send(leader).is_err() {
            let _ = self.leader_rx.try_recv();
            let _ = self.leader_tx.try_send(leader);
        }
    }

    /// Returns the header for outbound RPCs.
    pub fn header(&self) -> Header {
        Header {
            protocol_version: self.protocol_version,
            id: self.local_id.as_bytes().to_vec(),
            addr: self.transport.encode_peer(&self.local_id, &self.local_addr),
        }
    }

    /// Returns the local server's transport-encoded address.
    pub fn encoded_local(&self) -> Vec<u8> {
        self.transport.encode_peer(&self.local_id, &self.local_addr)
    }

    pub fn observe(&self, observation: Observation) {
        self.observers.observe(observation)
    }

    /// Deletes log entries covered by a snapshot at the given index, keeping
    /// at least trailing_logs entries.
    pub fn compact_logs(&self, snapshot_index: Index) -> Result<()> {
        let first_index = self.log.first_index()?;
        let (last_index, _) = self.last_log();
        let trailing_logs = self.config().trailing_logs;
        if last_index <= trailing_logs {
            return Ok(());
        }
        let max_index = snapshot_index.min(last_index - trailing_logs);
        if first_index > max_index {
            info!("No logs to truncate");
            return Ok(());
        }
        info!("Compacting logs from {first_index} to {max_index}");
        self.log
            .delete_range(first_index, max_index)
            .map_err(|err| Error::IO(format!("log compaction failed: {err}")))
    }

    /// Deletes the entire log after installing a snapshot that doesn't
    /// extend it. The snapshot position becomes the last log position.
    pub fn remove_old_logs(&self, snapshot_index: Index, snapshot_term: Term) -> Result<()> {
        let (first_index, last_index) = (self.log.first_index()?, self.log.last_index()?);
        if last_index > 0 {
            info!("Removing all logs from {first_index} to {last_index}");
            self.log.delete_range(first_index, last_index)?;
        }
        self.set_last_log(snapshot_index, snapshot_term);
        Ok(())
    }
}

/// A client write, waiting to be dispatched by the leader.
pub(crate) struct LogRequest {
    pub entry: Entry,
    pub responder: Responder<Applied>,
}

/// A membership change request.
pub(crate) struct ConfigChangeRequest {
    pub change: ConfigurationChange,
    pub responder: Responder<Applied>,
}

/// A user snapshot restore request.
pub(crate) struct RestoreRequest {
    pub meta: SnapshotMeta,
    pub reader: Box<dyn Read + Send>,
    pub responder: Responder<()>,
}

/// A leadership transfer request, to the given server or the most
/// up-to-date one.
pub(crate) struct TransferRequest {
    pub target: Option<(ServerID, ServerAddress)>,
    pub responder: Responder<()>,
}

/// A live bootstrap request.
pub(crate) struct BootstrapRequest {
    pub configuration: Configuration,
    pub responder: Responder<()>,
}

/// Requests received by the main loop.
#[derive(Clone)]
pub(crate) struct Inbox {
    pub rpc_rx: Receiver<Rpc>,
    pub apply_rx: Receiver<LogRequest>,
    pub config_change_rx: Receiver<ConfigChangeRequest>,
    pub configurations_rx: Receiver<Responder<Configurations>>,
    pub verify_rx: Receiver<Arc<Verify>>,
    pub restore_rx: Receiver<RestoreRequest>,
    pub transfer_rx: Receiver<TransferRequest>,
    pub bootstrap_rx: Receiver<BootstrapRequest>,
}

/// An entry dispatched by the leader, waiting to commit.
pub(super) struct Inflight {
    entry: Entry,
    responder: Option<Responder<Applied>>,
}

impl Inflight {
    fn respond(self, result: Result<Applied>) {
        if let Some(responder) = self.responder {
            responder.respond(result)
        }
    }
}

impl From<LogRequest> for Inflight {
    fn from(request: LogRequest) -> Self {
        Self { entry: request.entry, responder: Some(request.responder) }
    }
}

/// The node's main loop. It owns the role transitions and the cluster
/// configurations, and runs until shutdown.
pub(crate) struct Node {
    shared: Arc<Shared>,
    inbox: Inbox,
    verify_tx: Sender<Arc<Verify>>,
    fsm_tx: Sender<FsmRequest>,
    configurations: Configurations,
    /// Set when a TimeoutNow made this node a candidate, allowing it to
    /// disrupt a known leader.
    candidate_from_transfer: bool,
}

impl Node {
    pub fn new(
        shared: Arc<Shared>,
        inbox: Inbox,
        verify_tx: Sender<Arc<Verify>>,
        fsm_tx: Sender<FsmRequest>,
    ) -> Self {
        Self {
            shared,
            inbox,
            verify_tx,
            fsm_tx,
            configurations: Configurations::default(),
            candidate_from_transfer: false,
        }
    }

    /// Restores the newest loadable snapshot into the state machine on
    /// startup, including its configuration.
    pub fn restore_snapshot(&mut self, state: &mut dyn State) -> Result<()> {
        let snapshots = self.shared.snapshots.list().inspect_err(|err| {
            error!("Failed to list snapshots: {err}");
        })?;
        let restore = !self.shared.config().no_snapshot_restore_on_start;
        for meta in &snapshots {
            if restore {
                let result = self.shared.snapshots.open(&meta.id).and_then(|(_, mut reader)| {
                    state.restore(&mut reader)
                });
                if let Err(err) = result {
                    error!("Failed to restore snapshot {}: {err}", meta.id);
                    continue;
                }
                info!(
                    "Restored from snapshot {} at index {} term {} ({} bytes)",
                    meta.id, meta.index, meta.term, meta.size
                );
            }
            self.shared.set_last_applied(meta.index);
            self.shared.set_commit_index(meta.index);
            self.shared.set_last_snapshot(meta.index, meta.term);
            let (configuration, index) = match meta.version {
                0 => (decode_peers(&meta.peers, &*self.shared.transport)?, meta.index),
                _ => (meta.configuration.clone(), meta.configuration_index),
            };
            self.set_committed_configuration(configuration.clone(), index);
            self.set_latest_configuration(configuration, index);
            return Ok(());
        }
        if !snapshots.is_empty() {
            return Err(Error::IO("failed to load any existing snapshots".into()));
        }
        Ok(())
    }

    /// Scans the log after the last snapshot for configuration entries.
    pub fn load_configurations(&mut self) -> Result<()> {
        let (snapshot_index, _) = self.shared.last_snapshot();
        let (last_index, _) = self.shared.last_log();
        for index in snapshot_index + 1..=last_index {
            let entry = self.shared.log.get_log(index)?.ok_or(Error::LogNotFound)?;
            self.process_configuration_entry(&entry)?;
        }
        info!(
            "Initial configuration at index {}: {:?}",
            self.configurations.latest_index, self.configurations.latest.servers
        );
        Ok(())
    }

    /// Runs the main loop until shutdown.
    pub fn run(mut self) {
        loop {
            let result = match self.shared.role() {
                Role::Follower => self.run_follower(),
                Role::Candidate => self.run_candidate(),
                Role::Leader => self.run_leader(),
                Role::Shutdown => return,
            };
            if let Err(err) = result {
                if err != Error::RaftShutdown {
                    error!("Raft node failed: {err}");
                }
                self.shared.shutdown();
            }
        }
    }

    /// Returns the number of votes needed for a quorum.
    fn quorum_size(&self) -> usize {
        self.configurations.latest.voters().count() / 2 + 1
    }

    fn set_latest_configuration(&mut self, configuration: Configuration, index: Index) {
        self.configurations.latest = configuration;
        self.configurations.latest_index = index;
        self.shared.set_configurations(&self.configurations);
    }

    fn set_committed_configuration(&mut self, configuration: Configuration, index: Index) {
        self.configurations.committed = configuration;
        self.configurations.committed_index = index;
        self.shared.set_configurations(&self.configurations);
    }

    /// Takes a configuration entry into use as the latest configuration, as
    /// soon as it's appended. The previous latest is then committed, since
    /// only one uncommitted configuration may exist.
    fn process_configuration_entry(&mut self, entry: &Entry) -> Result<()> {
        let configuration = match entry.kind {
            EntryKind::Configuration
            | EntryKind::AddPeerDeprecated
            | EntryKind::RemovePeerDeprecated => {
                decode_entry(entry.kind, &entry.data, &*self.shared.transport)?
            }
            _ => return Ok(()),
        };
        self.set_committed_configuration(
            self.configurations.latest.clone(),
            self.configurations.latest_index,
        );
        self.set_latest_configuration(configuration, entry.index);
        Ok(())
    }

    /// Hands committed entries up to index to the FSM runner, in batches of
    /// at most max_append_entries. Entries are taken from inflight if
    /// present (on the leader), otherwise read from the log. Entries that
    /// don't reach the FSM are resolved here.
    fn process_logs(&mut self, index: Index, mut inflight: HashMap<Index, Inflight>) {
        let last_applied = self.shared.last_applied();
        if index <= last_applied {
            warn!("Skipping application of old log {index}");
            return;
        }

        let max_batch = self.shared.config().max_append_entries;
        let mut batch = Vec::with_capacity(max_batch);
        for i in last_applied + 1..=index {
            let (entry, responder) = match inflight.remove(&i) {
                Some(inflight) => (inflight.entry, inflight.responder),
                None => match self.shared.log.get_log(i) {
                    Ok(Some(entry)) => (entry, None),
                    Ok(None) => panic!("failed to get log {i}: {}", Error::LogNotFound),
                    Err(err) => panic!("failed to get log {i}: {err}"),
                },
            };
            let apply = match entry.kind {
                EntryKind::Command | EntryKind::Barrier => true,
                EntryKind::Configuration => self.shared.protocol_version > 2,
                EntryKind::Noop
                | EntryKind::AddPeerDeprecated
                | EntryKind::RemovePeerDeprecated => false,
            };
            if apply {
                batch.push(Commit { entry, responder });
                if batch.len() >= max_batch {
                    self.apply_batch(std::mem::take(&mut batch));
                }
            } else if let Some(responder) = responder {
                responder.respond(Ok(Applied { index: entry.index, response: Vec::new() }));
            }
        }
        if !batch.is_empty() {
            self.apply_batch(batch);
        }
        self.shared.set_last_applied(index);
    }

    /// Sends a batch to the FSM runner. On shutdown the batch is dropped,
    /// which resolves its futures with Error::RaftShutdown.
    fn apply_batch(&self, batch: Vec<Commit>) {
        crossbeam::select! {
            send(self.fsm_tx, FsmRequest::Commit(batch)) -> _ => {},
            recv(self.shared.shutdown_rx) -> _ => {},
        }
    }
}

/// Returns a timer channel firing after a random duration in [d, 2d).
pub(crate) fn random_timeout(duration: Duration) -> Receiver<Instant> {
    if duration.is_zero() {
        return crossbeam::channel::never();
    }
    let nanos = duration.as_nanos().min(u64::MAX as u128) as u64;
    let jitter = Duration::from_nanos(rand::thread_rng().gen_range(0..nanos));
    crossbeam::channel::after(duration + jitter)
}

/// Builds a follower node "a" on in-memory stores, with a configuration of
/// the given voters committed at index 1.
#[cfg(test)]
fn test_node(servers: &[&str]) -> Node {
    let config = Config { local_id: "a".into(), ..Default::default() };
    let store = Arc::new(crate::storage::Memory::new());
    let shared = Arc::new(Shared::new(
        config,
        store.clone(),
        store,
        Arc::new(crate::storage::MemorySnapshots::new()),
        Arc::new(super::transport::Memory::new("a")),
    ));
    let (_, apply_rx) = crossbeam::channel::unbounded();
    let (_, config_change_rx) = crossbeam::channel::unbounded();
    let (_, configurations_rx) = crossbeam::channel::unbounded();
    let (verify_tx, verify_rx) = crossbeam::channel::unbounded();
    let (_, restore_rx) = crossbeam::channel::unbounded();
    let (_, transfer_rx) = crossbeam::channel::unbounded();
    let (_, bootstrap_rx) = crossbeam::channel::unbounded();
    let inbox = Inbox {
        rpc_rx: shared.transport.consumer(),
        apply_rx,
        config_change_rx,
        configurations_rx,
        verify_rx,
        restore_rx,
        transfer_rx,
        bootstrap_rx,
    };
    let (fsm_tx, _) = crossbeam::channel::unbounded();
    let mut node = Node::new(shared, inbox, verify_tx, fsm_tx);
    let configuration = Configuration::new(
        servers.iter().map(|id| super::Server::voter(*id, *id)).collect(),
    );
    node.set_latest_configuration(configuration.clone(), 1);
    node.set_committed_configuration(configuration, 1);
    node
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raft::transport::Memory;
    use crate::storage;
    use pretty_assertions::assert_eq;

    fn shared() -> Shared {
        let config = Config { local_id: "a".into(), ..Default::default() };
        let store = Arc::new(storage::Memory::new());
        Shared::new(
            config,
            store.clone(),
            store,
            Arc::new(storage::MemorySnapshots::new()),
            Arc::new(Memory::new("a")),
        )
    }

    #[test]
    fn random_timeout_range() {
        let start = Instant::now();
        let fired = random_timeout(Duration::from_millis(10)).recv().expect("timer fired");
        let elapsed = fired.duration_since(start);
        assert!(elapsed >= Duration::from_millis(10), "fired after {elapsed:?}");
        assert!(random_timeout(Duration::ZERO).recv_timeout(Duration::from_millis(5)).is_err());
    }

    #[test]
    fn last_entry_prefers_newest() {
        let shared = shared();
        shared.set_last_log(5, 2);
        assert_eq!(shared.last_entry(), (5, 2));
        shared.set_last_snapshot(8, 3);
        assert_eq!(shared.last_entry(), (8, 3));
        assert_eq!(shared.last_index(), 8);
        assert_eq!(shared.last_log(), (5, 2));
    }

    #[test]
    fn set_role_observes_changes() {
        let shared = shared();
        let (tx, rx) = crossbeam::channel::unbounded();
        shared.observers.register(crate::raft::Observer::new(tx, false, None));
        shared.set_role(Role::Follower);
        shared.set_role(Role::Candidate);
        shared.set_role(Role::Candidate);
        shared.set_leader("addr", "id");
        shared.set_leader("addr", "id");
        assert_eq!(
            rx.try_iter().collect::<Vec<_>>(),
            vec![
                Observation::Role(Role::Candidate),
                Observation::Leader { address: "addr".into(), id: "id".into() },
            ]
        );
    }

    #[test]
    fn leader_ch_keeps_latest() {
        let shared = shared();
        shared.notify_leader(true);
        shared.notify_leader(false);
        let rx = shared.leader_ch();
        assert_eq!(rx.try_recv(), Ok(false));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn current_term_is_persisted() -> Result<()> {
        let shared = shared();
        shared.set_current_term(7)?;
        assert_eq!(shared.current_term(), 7);
        assert_eq!(shared.stable.get_u64(KEY_CURRENT_TERM)?, Some(7));
        Ok(())
    }

    #[test]
    fn compact_logs_keeps_trailing() -> Result<()> {
        let shared = shared();
        shared.set_config(Config { trailing_logs: 3, ..shared.config() });
        let entries: Vec<Entry> = (1..=10)
            .map(|index| Entry { index, term: 1, ..Entry::command(vec![]) })
            .collect();
        shared.log.store_logs(&entries)?;
        shared.set_last_log(10, 1);

        shared.compact_logs(5)?;
        assert_eq!(shared.log.first_index()?, 6);

        // Never deletes past the trailing logs.
        shared.compact_logs(10)?;
        assert_eq!(shared.log.first_index()?, 8);
        Ok(())
    }

    #[test]
    fn shutdown_once() {
        let shared = shared();
        assert!(shared.shutdown());
        assert!(!shared.shutdown());
        assert_eq!(shared.role(), Role::Shutdown);
        assert!(shared.shutdown_rx.recv().is_err());
    }
}
