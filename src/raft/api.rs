use super::fsm::{FsmRequest, FsmRunner};
use super::future::{Future, Responder};
use super::node::{
    BootstrapRequest, ConfigChangeRequest, Inbox, LogRequest, Node, RestoreRequest, Role, Shared,
    TransferRequest,
};
use super::observer::Observer;
use super::replication::Verify;
use super::snapshot::{OpenSnapshot, SnapshotRunner};
use super::state::State;
use super::{
    ApplyFuture, ChangeCommand, Config, Configuration, ConfigurationChange, Configurations, Entry,
    EntryKind, Index, ReloadableConfig, Rpc, ServerAddress, ServerID, Term, Transport,
    KEY_CURRENT_TERM, PROTOCOL_VERSION_MAX, PROTOCOL_VERSION_MIN, SNAPSHOT_VERSION_MAX,
    SNAPSHOT_VERSION_MIN,
};
use crate::errinput;
use crate::error::{Error, Result};
use crate::storage::{LogStore, SnapshotMeta, SnapshotStore, StableStore};

use crossbeam::channel::{Receiver, Sender};
use log::{error, info};
use std::io::Read;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// A Raft node. It is created with its storage, transport and state machine,
/// and immediately starts running as a follower on background threads until
/// shut down. All methods can be called concurrently.
pub struct Raft {
    shared: Arc<Shared>,
    apply_tx: Sender<LogRequest>,
    config_change_tx: Sender<ConfigChangeRequest>,
    configurations_tx: Sender<Responder<Configurations>>,
    verify_tx: Sender<Arc<Verify>>,
    user_snapshot_tx: Sender<Responder<OpenSnapshot>>,
    restore_tx: Sender<RestoreRequest>,
    transfer_tx: Sender<TransferRequest>,
    bootstrap_tx: Sender<BootstrapRequest>,
    /// Only used to report the FSM queue length.
    fsm_tx: Sender<FsmRequest>,
    threads: Mutex<Vec<JoinHandle<()>>>,
    reload_lock: Mutex<()>,
}

impl Raft {
    /// Creates and starts a Raft node. The current term, the newest snapshot
    /// and the log are loaded from the stores, so a restarted node resumes
    /// where it left off. A fresh cluster must additionally be bootstrapped,
    /// see [`Raft::bootstrap_cluster`].
    pub fn new(
        config: Config,
        mut state: Box<dyn State>,
        log: Arc<dyn LogStore>,
        stable: Arc<dyn StableStore>,
        snapshots: Arc<dyn SnapshotStore>,
        transport: Arc<dyn Transport>,
    ) -> Result<Self> {
        config.validate()?;
        if config.protocol_version < 3 && config.local_id != transport.local_addr() {
            return errinput!(
                "when running with protocol version < 3, the local ID must be the network address"
            );
        }

        let current_term = stable.get_u64(KEY_CURRENT_TERM)?.unwrap_or(0);
        let last_log = match log.last_index()? {
            0 => None,
            index => Some(log.get_log(index)?.ok_or_else(|| {
                Error::IO(format!("failed to get last log at index {index}"))
            })?),
        };

        let apply_capacity = match config.batch_apply_ch {
            true => config.max_append_entries,
            false => 0,
        };
        let (apply_tx, apply_rx) = crossbeam::channel::bounded(apply_capacity);
        let (config_change_tx, config_change_rx) = crossbeam::channel::bounded(0);
        let (configurations_tx, configurations_rx) = crossbeam::channel::bounded(8);
        let (verify_tx, verify_rx) = crossbeam::channel::bounded(64);
        let (user_snapshot_tx, user_snapshot_rx) = crossbeam::channel::bounded(0);
        let (restore_tx, restore_rx) = crossbeam::channel::bounded(0);
        let (transfer_tx, transfer_rx) = crossbeam::channel::bounded(1);
        let (bootstrap_tx, bootstrap_rx) = crossbeam::channel::bounded(0);
        let (fsm_tx, fsm_rx) = crossbeam::channel::bounded(128);
        let (fsm_snapshot_tx, fsm_snapshot_rx) = crossbeam::channel::bounded(0);

        let shared =
            Arc::new(Shared::new(config, log, stable, snapshots.clone(), transport.clone()));
        shared.set_current_term(current_term)?;
        if let Some(entry) = &last_log {
            shared.set_last_log(entry.index, entry.term);
        }

        let inbox = Inbox {
            rpc_rx: transport.consumer(),
            apply_rx,
            config_change_rx,
            configurations_rx,
            verify_rx,
            restore_rx,
            transfer_rx,
            bootstrap_rx,
        };
        let mut node = Node::new(shared.clone(), inbox, verify_tx.clone(), fsm_tx.clone());
        node.restore_snapshot(&mut *state)?;
        node.load_configurations()?;

        // Heartbeats are answered on the transport's thread when possible, to
        // avoid queueing behind slow RPCs such as InstallSnapshot.
        let weak = Arc::downgrade(&shared);
        transport.set_heartbeat_handler(Some(Arc::new(move |rpc: Rpc| -> Option<Rpc> {
            match weak.upgrade() {
                Some(shared) => shared.process_heartbeat(rpc),
                None => Some(rpc),
            }
        })));

        let fsm = FsmRunner::new(state, snapshots);
        let snapshot_runner = SnapshotRunner::new(shared.clone(), fsm_snapshot_tx);
        let shutdown_rx = shared.shutdown_rx.clone();
        let threads = vec![
            std::thread::Builder::new().name("raft-node".into()).spawn(move || node.run())?,
            std::thread::Builder::new()
                .name("raft-fsm".into())
                .spawn(move || fsm.run(fsm_rx, fsm_snapshot_rx, shutdown_rx))?,
            std::thread::Builder::new()
                .name("raft-snapshot".into())
                .spawn(move || snapshot_runner.run(user_snapshot_rx))?,
        ];
        info!("Started Raft node {} at {}", shared.local_id, shared.local_addr);

        Ok(Self {
            shared,
            apply_tx,
            config_change_tx,
            configurations_tx,
            verify_tx,
            user_snapshot_tx,
            restore_tx,
            transfer_tx,
            bootstrap_tx,
            fsm_tx,
            threads: Mutex::new(threads),
            reload_lock: Mutex::new(()),
        })
    }

    /// Sends a request to the main loop, giving up when the timer fires or
    /// the node shuts down.
    fn enqueue<T>(&self, tx: &Sender<T>, value: T, timer: &Receiver<Instant>) -> Result<()> {
        crossbeam::select! {
            send(tx, value) -> result => result.map_err(|_| Error::RaftShutdown),
            recv(self.shared.shutdown_rx) -> _ => Err(Error::RaftShutdown),
            recv(timer) -> _ => Err(Error::EnqueueTimeout),
        }
    }

    /// Applies a command to the state machine. It must be called on the
    /// leader, and the future resolves once the command is committed and
    /// applied, with the state machine's response. The timeout limits how
    /// long to wait for the command to be accepted, zero waits forever.
    pub fn apply(&self, command: Vec<u8>, timeout: Duration) -> ApplyFuture {
        self.apply_log(Entry::command(command), timeout)
    }

    /// Like [`Raft::apply`], but takes a log entry to also pass extensions.
    /// Only the data and extensions are used.
    pub fn apply_log(&self, entry: Entry, timeout: Duration) -> ApplyFuture {
        let entry = Entry { extensions: entry.extensions, ..Entry::command(entry.data) };
        self.submit(entry, &timer(timeout))
    }

    fn submit(&self, entry: Entry, timer: &Receiver<Instant>) -> ApplyFuture {
        let (future, responder) = Future::new();
        match self.enqueue(&self.apply_tx, LogRequest { entry, responder }, timer) {
            Ok(()) => future,
            Err(err) => Future::ready(Err(err)),
        }
    }

    /// Returns a future that resolves once all preceding operations have been
    /// applied to the state machine. Must be called on the leader.
    pub fn barrier(&self, timeout: Duration) -> ApplyFuture {
        self.submit(Entry::new(EntryKind::Barrier, Vec::new()), &timer(timeout))
    }

    /// Verifies that this node is still the leader, by confirming that a
    /// quorum of voters still accepts it.
    pub fn verify_leader(&self) -> Future<()> {
        let (future, responder) = Future::new();
        match self.enqueue(&self.verify_tx, Verify::new(responder), &crossbeam::channel::never()) {
            Ok(()) => future,
            Err(err) => Future::ready(Err(err)),
        }
    }

    /// Returns the committed and latest cluster configurations.
    pub fn get_configuration(&self) -> Future<Configurations> {
        let (future, responder) = Future::new();
        let never = crossbeam::channel::never();
        match self.enqueue(&self.configurations_tx, responder, &never) {
            Ok(()) => future,
            Err(err) => Future::ready(Err(err)),
        }
    }

    fn change_configuration(
        &self,
        command: ChangeCommand,
        id: ServerID,
        address: ServerAddress,
        prev_index: Index,
        timeout: Duration,
    ) -> ApplyFuture {
        let change = ConfigurationChange { command, id, address, prev_index };
        let (future, responder) = Future::new();
        let request = ConfigChangeRequest { change, responder };
        match self.enqueue(&self.config_change_tx, request, &timer(timeout)) {
            Ok(()) => future,
            Err(err) => Future::ready(Err(err)),
        }
    }

    /// Adds a server as a voter, or updates its address if it already is one.
    /// The leader brings it up to date before it counts toward the quorum.
    /// If prev_index is non-zero, the change is rejected unless the latest
    /// configuration is at that index.
    pub fn add_voter(
        &self,
        id: impl Into<ServerID>,
        address: impl Into<ServerAddress>,
        prev_index: Index,
        timeout: Duration,
    ) -> ApplyFuture {
        if self.shared.protocol_version < 2 {
            return Future::ready(Err(Error::UnsupportedProtocol));
        }
        let (id, address) = (id.into(), address.into());
        self.change_configuration(ChangeCommand::AddVoter, id, address, prev_index, timeout)
    }

    /// Adds a server as a nonvoter, which receives the log but doesn't vote.
    /// A voter keeps its suffrage, but takes the new address.
    pub fn add_nonvoter(
        &self,
        id: impl Into<ServerID>,
        address: impl Into<ServerAddress>,
        prev_index: Index,
        timeout: Duration,
    ) -> ApplyFuture {
        if self.shared.protocol_version < 3 {
            return Future::ready(Err(Error::UnsupportedProtocol));
        }
        let (id, address) = (id.into(), address.into());
        self.change_configuration(ChangeCommand::AddNonvoter, id, address, prev_index, timeout)
    }

    /// Removes a server from the cluster. If it is the leader, it steps down
    /// once the removal commits.
    pub fn remove_server(
        &self,
        id: impl Into<ServerID>,
        prev_index: Index,
        timeout: Duration,
    ) -> ApplyFuture {
        if self.shared.protocol_version < 2 {
            return Future::ready(Err(Error::UnsupportedProtocol));
        }
        let (id, address) = (id.into(), ServerAddress::new());
        self.change_configuration(ChangeCommand::RemoveServer, id, address, prev_index, timeout)
    }

    /// Demotes a voter to a nonvoter.
    pub fn demote_voter(
        &self,
        id: impl Into<ServerID>,
        prev_index: Index,
        timeout: Duration,
    ) -> ApplyFuture {
        if self.shared.protocol_version < 3 {
            return Future::ready(Err(Error::UnsupportedProtocol));
        }
        let (id, address) = (id.into(), ServerAddress::new());
        self.change_configuration(ChangeCommand::DemoteVoter, id, address, prev_index, timeout)
    }

    /// Promotes a staging server to a voter. Staging servers only appear in
    /// configurations written by older versions, and otherwise behave like
    /// nonvoters.
    pub fn promote(&self, id: impl Into<ServerID>, prev_index: Index, timeout: Duration) -> ApplyFuture {
        let (id, address) = (id.into(), ServerAddress::new());
        self.change_configuration(ChangeCommand::Promote, id, address, prev_index, timeout)
    }

    /// Adds a voter by address, for protocol versions < 3 where servers are
    /// identified by address.
    pub fn add_peer(&self, address: impl Into<ServerAddress>) -> ApplyFuture {
        if self.shared.protocol_version > 2 {
            return Future::ready(Err(Error::UnsupportedProtocol));
        }
        let address = address.into();
        let id = address.clone();
        self.change_configuration(ChangeCommand::AddStaging, id, address, 0, Duration::ZERO)
    }

    /// Removes a voter by address, for protocol versions < 3.
    pub fn remove_peer(&self, address: impl Into<ServerAddress>) -> ApplyFuture {
        if self.shared.protocol_version > 2 {
            return Future::ready(Err(Error::UnsupportedProtocol));
        }
        let (id, address) = (address.into(), ServerAddress::new());
        self.change_configuration(ChangeCommand::RemoveServer, id, address, 0, Duration::ZERO)
    }

    /// Takes a snapshot of the state machine now, regardless of the snapshot
    /// threshold. The resolved handle can open the snapshot for reading.
    pub fn snapshot(&self) -> Future<OpenSnapshot> {
        let (future, responder) = Future::new();
        let never = crossbeam::channel::never();
        match self.enqueue(&self.user_snapshot_tx, responder, &never) {
            Ok(()) => future,
            Err(err) => Future::ready(Err(err)),
        }
    }

    /// Replaces the cluster's state with an external snapshot, e.g. for
    /// disaster recovery. Must be called on the leader, and blocks until the
    /// local restore completes and a subsequent entry commits, which implies
    /// that a quorum installed the snapshot. Inflight applies are aborted
    /// with [`Error::AbortedByRestore`].
    pub fn restore(
        &self,
        meta: SnapshotMeta,
        reader: Box<dyn Read + Send>,
        timeout: Duration,
    ) -> Result<()> {
        let timer = timer(timeout);
        let (future, responder) = Future::new();
        self.enqueue(&self.restore_tx, RestoreRequest { meta, reader, responder }, &timer)?;
        future.wait()?;
        self.submit(Entry::new(EntryKind::Noop, Vec::new()), &timer).wait()?;
        Ok(())
    }

    /// Transfers leadership to the most up-to-date voter. The future resolves
    /// once this node is no longer the leader, or with an error if the
    /// transfer didn't complete within the election timeout.
    pub fn leadership_transfer(&self) -> Future<()> {
        self.initiate_leadership_transfer(None)
    }

    /// Transfers leadership to the given server.
    pub fn leadership_transfer_to_server(
        &self,
        id: impl Into<ServerID>,
        address: impl Into<ServerAddress>,
    ) -> Future<()> {
        self.initiate_leadership_transfer(Some((id.into(), address.into())))
    }

    fn initiate_leadership_transfer(&self, target: Option<(ServerID, ServerAddress)>) -> Future<()> {
        if self.shared.protocol_version < 3 {
            return Future::ready(Err(Error::UnsupportedProtocol));
        }
        if target.as_ref().is_some_and(|(id, _)| *id == self.shared.local_id) {
            info!("Cannot transfer leadership to itself");
            return Future::ready(errinput!("cannot transfer leadership to itself"));
        }
        let (future, responder) = Future::new();
        crossbeam::select! {
            send(self.transfer_tx, TransferRequest { target, responder }) -> result => match result {
                Ok(()) => future,
                Err(_) => Future::ready(Err(Error::RaftShutdown)),
            },
            recv(self.shared.shutdown_rx) -> _ => Future::ready(Err(Error::RaftShutdown)),
            default => Future::ready(Err(Error::EnqueueTimeout)),
        }
    }

    /// Bootstraps a fresh cluster with the given configuration while the
    /// node is running. See [`super::bootstrap_cluster`] for the offline
    /// version. Fails with [`Error::CantBootstrap`] if the node has state.
    pub fn bootstrap_cluster(&self, configuration: Configuration) -> Future<()> {
        let (future, responder) = Future::new();
        let request = BootstrapRequest { configuration, responder };
        match self.enqueue(&self.bootstrap_tx, request, &crossbeam::channel::never()) {
            Ok(()) => future,
            Err(err) => Future::ready(Err(err)),
        }
    }

    /// Shuts the node down and waits for its threads to exit, then closes
    /// the transport. Pending operations resolve with
    /// [`Error::RaftShutdown`]. Further calls do nothing. The node may also
    /// have shut itself down, e.g. when removed from the cluster, in which
    /// case the first call still joins its threads.
    pub fn shutdown(&self) -> Future<()> {
        if self.shared.shutdown() {
            info!("Shutting down Raft node {}", self.shared.local_id);
        }
        let threads =
            std::mem::take(&mut *self.threads.lock().unwrap_or_else(PoisonError::into_inner));
        if threads.is_empty() {
            return Future::ready(Ok(()));
        }
        for thread in threads {
            let name = thread.thread().name().unwrap_or("raft").to_string();
            if thread.join().is_err() {
                error!("Thread {name} panicked");
            }
        }
        self.shared.transport.set_heartbeat_handler(None);
        Future::ready(self.shared.transport.close())
    }

    /// Returns the node's role.
    pub fn state(&self) -> Role {
        self.shared.role()
    }

    /// Returns the known leader's address and ID, empty if unknown.
    pub fn leader(&self) -> (ServerAddress, ServerID) {
        self.shared.leader()
    }

    /// Returns when the node last heard from the leader, or None if never.
    pub fn last_contact(&self) -> Option<Instant> {
        self.shared.last_contact()
    }

    /// Returns the last index in the log or the last snapshot.
    pub fn last_index(&self) -> Index {
        self.shared.last_index()
    }

    /// Returns the last index applied to the state machine.
    pub fn applied_index(&self) -> Index {
        self.shared.last_applied()
    }

    pub fn current_term(&self) -> Term {
        self.shared.current_term()
    }

    pub fn commit_index(&self) -> Index {
        self.shared.commit_index()
    }

    /// Returns a channel that receives true when the node becomes leader and
    /// false when it steps down. Only the latest change is kept, so a slow
    /// receiver skips intermediate changes.
    pub fn leader_ch(&self) -> Receiver<bool> {
        self.shared.leader_ch()
    }

    /// Returns the local server ID.
    pub fn local_id(&self) -> &str {
        &self.shared.local_id
    }

    /// Returns the current configuration.
    pub fn config(&self) -> Config {
        self.shared.config()
    }

    /// Updates the reloadable configuration fields at runtime.
    pub fn reload_config(&self, reloadable: ReloadableConfig) -> Result<()> {
        let _guard = self.reload_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let config = self.shared.config().merge(&reloadable);
        config.validate()?;
        self.shared.set_config(config);
        Ok(())
    }

    /// Registers an observer, returning its ID.
    pub fn register_observer(&self, observer: Arc<Observer>) -> u64 {
        self.shared.observers.register(observer)
    }

    /// Deregisters an observer.
    pub fn deregister_observer(&self, id: u64) {
        self.shared.observers.deregister(id)
    }

    /// Returns node statistics.
    pub fn stats(&self) -> Stats {
        let shared = &self.shared;
        let (last_log_index, last_log_term) = shared.last_log();
        let (last_snapshot_index, last_snapshot_term) = shared.last_snapshot();
        let configurations = shared.configurations();
        let state = shared.role();

        let voters: Vec<&str> =
            configurations.latest.voters().map(|server| server.id.as_str()).collect();
        let num_peers = match voters.contains(&shared.local_id.as_str()) {
            true => voters.len() - 1,
            false => 0,
        };
        let last_contact = match state {
            Role::Leader => Some(Duration::ZERO),
            _ => shared.last_contact().map(|contact| contact.elapsed()),
        };

        Stats {
            state,
            term: shared.current_term(),
            last_log_index,
            last_log_term,
            commit_index: shared.commit_index(),
            applied_index: shared.last_applied(),
            fsm_pending: self.fsm_tx.len(),
            last_snapshot_index,
            last_snapshot_term,
            protocol_version: shared.protocol_version,
            protocol_version_min: PROTOCOL_VERSION_MIN,
            protocol_version_max: PROTOCOL_VERSION_MAX,
            snapshot_version_min: SNAPSHOT_VERSION_MIN,
            snapshot_version_max: SNAPSHOT_VERSION_MAX,
            latest_configuration: configurations.latest,
            latest_configuration_index: configurations.latest_index,
            num_peers,
            last_contact,
        }
    }
}

impl Drop for Raft {
    fn drop(&mut self) {
        self.shared.shutdown();
    }
}

/// Returns a timer for an enqueue timeout, zero meaning no timeout.
fn timer(timeout: Duration) -> Receiver<Instant> {
    match timeout.is_zero() {
        true => crossbeam::channel::never(),
        false => crossbeam::channel::after(timeout),
    }
}

/// Node statistics.
#[derive(Clone, Debug, PartialEq)]
pub struct Stats {
    pub state: Role,
    pub term: Term,
    pub last_log_index: Index,
    pub last_log_term: Term,
    pub commit_index: Index,
    pub applied_index: Index,
    /// Commit batches queued for the state machine.
    pub fsm_pending: usize,
    pub last_snapshot_index: Index,
    pub last_snapshot_term: Term,
    pub protocol_version: u8,
    pub protocol_version_min: u8,
    pub protocol_version_max: u8,
    pub snapshot_version_min: u8,
    pub snapshot_version_max: u8,
    pub latest_configuration: Configuration,
    pub latest_configuration_index: Index,
    /// Other voters, or 0 if the local server isn't a voter.
    pub num_peers: usize,
    /// Time since the last leader contact: zero on the leader, None if never.
    pub last_contact: Option<Duration>,
}

impl std::fmt::Display for Stats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "state = {}", self.state)?;
        writeln!(f, "term = {}", self.term)?;
        writeln!(f, "last_log_index = {}", self.last_log_index)?;
        writeln!(f, "last_log_term = {}", self.last_log_term)?;
        writeln!(f, "commit_index = {}", self.commit_index)?;
        writeln!(f, "applied_index = {}", self.applied_index)?;
        writeln!(f, "fsm_pending = {}", self.fsm_pending)?;
        writeln!(f, "last_snapshot_index = {}", self.last_snapshot_index)?;
        writeln!(f, "last_snapshot_term = {}", self.last_snapshot_term)?;
        writeln!(f, "protocol_version = {}", self.protocol_version)?;
        writeln!(f, "protocol_version_min = {}", self.protocol_version_min)?;
        writeln!(f, "protocol_version_max = {}", self.protocol_version_max)?;
        writeln!(f, "snapshot_version_min = {}", self.snapshot_version_min)?;
        writeln!(f, "snapshot_version_max = {}", self.snapshot_version_max)?;
        let servers = self.latest_configuration.servers.iter().map(|s| s.to_string());
        writeln!(f, "latest_configuration = [{}]", servers.collect::<Vec<_>>().join(", "))?;
        writeln!(f, "latest_configuration_index = {}", self.latest_configuration_index)?;
        writeln!(f, "num_peers = {}", self.num_peers)?;
        match self.last_contact {
            Some(contact) => write!(f, "last_contact = {contact:?}"),
            None => write!(f, "last_contact = never"),
        }
    }
}
