use super::{
    BootstrapRequest, ConfigChangeRequest, Inflight, Node, RestoreRequest, Role, Shared,
    TransferRequest,
};
use crate::error::{Error, Result};
use crate::raft::commitment::Commitment;
use crate::raft::fsm::FsmRequest;
use crate::raft::future::Future;
use crate::raft::observer::Observation;
use crate::raft::replication::{Replication, TransferHandle, Verify};
use crate::raft::{
    encode_peers, next_configuration, Entry, EntryKind, Index, Server, ServerID, Suffrage,
    TimeoutNowRequest, SNAPSHOT_VERSION_MAX, SNAPSHOT_VERSION_MIN,
};

use crossbeam::channel::{Receiver, Sender};
use log::{debug, error, info, warn};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

/// The minimum interval between leader lease checks.
const MIN_CHECK_INTERVAL: Duration = Duration::from_millis(10);

/// State that only exists while the node is leader.
struct LeaderState {
    commitment: Arc<Commitment>,
    commit_rx: Receiver<()>,
    /// Dispatched entries awaiting commit, in index order.
    inflight: VecDeque<Inflight>,
    replications: HashMap<ServerID, Replication>,
    /// Verifications awaiting a quorum.
    notify: HashMap<usize, Arc<Verify>>,
    step_down_tx: Sender<()>,
    step_down_rx: Receiver<()>,
    /// Disconnected when the node leaves the leader role.
    _left_tx: Sender<()>,
    left_rx: Receiver<()>,
}

impl Node {
    /// Runs the leader role until it steps down or the node shuts down.
    pub(super) fn run_leader(&mut self) -> Result<()> {
        info!("Entering leader state in term {}", self.shared.current_term());
        self.shared.notify_leader(true);

        let (commit_tx, commit_rx) = crossbeam::channel::bounded(1);
        let (step_down_tx, step_down_rx) = crossbeam::channel::bounded(1);
        let (left_tx, left_rx) = crossbeam::channel::bounded(0);
        let commitment = Commitment::new(
            commit_tx,
            &self.configurations.latest,
            self.shared.last_index() + 1,
        );
        let mut state = LeaderState {
            commitment: Arc::new(commitment),
            commit_rx,
            inflight: VecDeque::new(),
            replications: HashMap::new(),
            notify: HashMap::new(),
            step_down_tx,
            step_down_rx,
            _left_tx: left_tx,
            left_rx,
        };

        self.start_stop_replication(&mut state);
        // A no-op entry in the new term commits all entries from prior terms.
        let noop = Inflight { entry: Entry::new(EntryKind::Noop, vec![]), responder: None };
        self.dispatch_logs(&mut state, vec![noop]);
        let result = self.leader_loop(&mut state);
        self.leader_cleanup(state);
        result
    }

    /// Stops replication and fails outstanding requests after stepping down.
    fn leader_cleanup(&mut self, mut state: LeaderState) {
        // The leader was in contact with itself until now.
        self.shared.set_last_contact();
        for replication in state.replications.values_mut() {
            replication.stop(None);
        }
        for inflight in state.inflight.drain(..) {
            inflight.respond(Err(Error::LeadershipLost));
        }
        for verify in state.notify.values() {
            verify.respond(Err(Error::LeadershipLost));
        }
        // Stepping down on an RPC may have set the new leader already.
        let (leader_addr, leader_id) = self.shared.leader();
        if leader_addr == self.shared.local_addr && leader_id == self.shared.local_id {
            self.shared.set_leader("", "");
        }
        drop(state);
        self.shared.notify_leader(false);
    }

    fn leader_loop(&mut self, state: &mut LeaderState) -> Result<()> {
        let inbox = self.inbox.clone();
        let shutdown_rx = self.shared.shutdown_rx.clone();
        let (commit_rx, step_down_rx) = (state.commit_rx.clone(), state.step_down_rx.clone());
        let never = crossbeam::channel::never();
        let mut lease = crossbeam::channel::after(self.shared.config().leader_lease_timeout);

        while self.shared.role() == Role::Leader {
            // Only one configuration change may be uncommitted at a time, and
            // only after an entry from this term has committed.
            let change_ready = self.configurations.stable()
                && self.shared.commit_index() >= state.commitment.start_index();
            let config_change_rx = if change_ready { &inbox.config_change_rx } else { &never };

            crossbeam::select! {
                recv(inbox.rpc_rx) -> rpc => self.process_rpc(rpc?)?,

                recv(step_down_rx) -> _ => {
                    warn!("Peer has newer term, stepping down");
                    self.shared.set_role(Role::Follower);
                }

                recv(inbox.transfer_rx) -> request => self.leadership_transfer(state, request?),

                recv(commit_rx) -> _ => self.commit(state),

                recv(inbox.verify_rx) -> verify => self.verify(state, verify?),

                recv(inbox.restore_rx) -> request => {
                    let RestoreRequest { meta, mut reader, responder } = request?;
                    if self.shared.leadership_transfer_in_progress() {
                        responder.respond(Err(Error::LeadershipTransferInProgress));
                    } else {
                        let result = self.restore_user_snapshot(state, meta, &mut reader);
                        responder.respond(result);
                    }
                }

                recv(inbox.configurations_rx) -> responder => {
                    responder?.respond(Ok(self.configurations.clone()))
                }

                recv(config_change_rx) -> request => {
                    let request = request?;
                    if self.shared.leadership_transfer_in_progress() {
                        request.responder.respond(Err(Error::LeadershipTransferInProgress));
                    } else {
                        self.append_configuration_entry(state, request);
                    }
                }

                recv(inbox.bootstrap_rx) -> request => {
                    let BootstrapRequest { responder, .. } = request?;
                    responder.respond(Err(Error::CantBootstrap));
                }

                recv(inbox.apply_rx) -> request => {
                    let request = request?;
                    if self.shared.leadership_transfer_in_progress() {
                        request.responder.respond(Err(Error::LeadershipTransferInProgress));
                    } else {
                        let max = self.shared.config().max_append_entries;
                        let ready = group_commit(request, &inbox.apply_rx, max);
                        self.dispatch_logs(state, ready.into_iter().map(Inflight::from).collect());
                    }
                }

                recv(lease) -> _ => {
                    let max_diff = self.check_leader_lease(state);
                    let interval = self.shared.config().leader_lease_timeout.saturating_sub(max_diff);
                    lease = crossbeam::channel::after(interval.max(MIN_CHECK_INTERVAL));
                }

                recv(shutdown_rx) -> _ => return Ok(()),
            }
        }
        Ok(())
    }

    /// Starts replication to new servers in the latest configuration, and
    /// stops it to removed ones after a final best-effort round.
    fn start_stop_replication(&mut self, state: &mut LeaderState) {
        let last_index = self.shared.last_index();
        let term = self.shared.current_term();

        for server in &self.configurations.latest.servers {
            if server.id == self.shared.local_id {
                continue;
            }
            match state.replications.get(&server.id) {
                Some(replication) => {
                    if replication.server().address != server.address {
                        info!("Updating peer {} to address {}", server.id, server.address);
                        replication.set_server(server.clone());
                    }
                }
                None => {
                    info!("Added peer {}, starting replication", server.id);
                    let replication = Replication::start(
                        self.shared.clone(),
                        state.commitment.clone(),
                        state.step_down_tx.clone(),
                        server.clone(),
                        term,
                        last_index + 1,
                    );
                    replication.trigger();
                    state.replications.insert(server.id.clone(), replication);
                    self.shared.observe(Observation::Peer { server: server.clone(), removed: false });
                }
            }
        }

        let latest = &self.configurations.latest;
        let removed: Vec<ServerID> =
            state.replications.keys().filter(|id| !latest.contains(id)).cloned().collect();
        for id in removed {
            let Some(mut replication) = state.replications.remove(&id) else { continue };
            info!("Removed peer {id}, stopping replication after {last_index}");
            replication.stop(Some(last_index));
            let server = replication.server();
            self.shared.observe(Observation::Peer { server, removed: true });
        }
    }

    /// Appends entries to the local log in the current term, and triggers
    /// replication. Returns the last dispatched index, or None if the local
    /// append failed, in which case the node steps down.
    fn dispatch_logs(&mut self, state: &mut LeaderState, mut batch: Vec<Inflight>) -> Option<Index> {
        let now = SystemTime::now();
        let term = self.shared.current_term();
        let mut last_index = self.shared.last_index();
        for inflight in &mut batch {
            last_index += 1;
            inflight.entry.index = last_index;
            inflight.entry.term = term;
            inflight.entry.appended_at = Some(now);
        }

        let entries: Vec<Entry> = batch.iter().map(|inflight| inflight.entry.clone()).collect();
        if let Err(err) = self.shared.log.store_logs(&entries) {
            error!("Failed to append entries to log: {err}");
            for inflight in batch {
                inflight.respond(Err(err.clone()));
            }
            self.shared.set_role(Role::Follower);
            return None;
        }
        state.commitment.match_index(&self.shared.local_id, last_index);
        self.shared.set_last_log(last_index, term);
        state.inflight.extend(batch);
        for replication in state.replications.values() {
            replication.trigger();
        }
        Some(last_index)
    }

    /// Handles an advanced commit index: commits the latest configuration if
    /// covered, and applies committed inflight entries.
    fn commit(&mut self, state: &mut LeaderState) {
        let old_commit_index = self.shared.commit_index();
        let commit_index = state.commitment.commit_index();
        self.shared.set_commit_index(commit_index);

        let mut step_down = false;
        let latest_index = self.configurations.latest_index;
        if latest_index > old_commit_index && latest_index <= commit_index {
            self.set_committed_configuration(self.configurations.latest.clone(), latest_index);
            if !self.configurations.committed.has_vote(&self.shared.local_id) {
                step_down = true;
            }
        }

        let mut ready = HashMap::new();
        let mut last_ready = 0;
        while state.inflight.front().is_some_and(|inflight| inflight.entry.index <= commit_index) {
            let Some(inflight) = state.inflight.pop_front() else { break };
            last_ready = inflight.entry.index;
            ready.insert(last_ready, inflight);
        }
        if !ready.is_empty() {
            self.process_logs(last_ready, ready);
        }

        if step_down {
            if self.shared.config().shutdown_on_remove {
                info!("Removed from configuration, shutting down");
                self.shared.shutdown();
            } else {
                info!("Removed from configuration, stepping down to follower");
                self.shared.set_role(Role::Follower);
            }
        }
    }

    /// Handles a leadership verification: starts it when first received, and
    /// responds once replication workers report the outcome.
    fn verify(&mut self, state: &mut LeaderState, verify: Arc<Verify>) {
        if !verify.started() {
            if verify.start(self.quorum_size(), self.verify_tx.clone()) {
                state.notify.insert(verify.key(), verify.clone());
                // Only voters count towards the quorum.
                let latest = &self.configurations.latest;
                for (id, replication) in &state.replications {
                    if latest.has_vote(id) {
                        replication.add_verify(verify.clone());
                    }
                }
            }
            return;
        }

        state.notify.remove(&verify.key());
        for replication in state.replications.values() {
            replication.remove_verify(verify.key());
        }
        if verify.confirmed() {
            verify.respond(Ok(()));
        } else {
            warn!("New leader elected, stepping down");
            self.shared.set_role(Role::Follower);
            verify.respond(Err(Error::NotLeader));
        }
    }

    /// Steps down if the leader hasn't heard from a quorum of voters within
    /// the lease timeout. Returns the longest contact age within the lease.
    fn check_leader_lease(&mut self, state: &LeaderState) -> Duration {
        let lease_timeout = self.shared.config().leader_lease_timeout;
        let now = Instant::now();
        let mut contacted = 0;
        let mut max_diff = Duration::ZERO;
        for server in self.configurations.latest.voters() {
            if server.id == self.shared.local_id {
                contacted += 1;
                continue;
            }
            let Some(replication) = state.replications.get(&server.id) else { continue };
            let diff = now.saturating_duration_since(replication.last_contact());
            if diff <= lease_timeout {
                contacted += 1;
                max_diff = max_diff.max(diff);
            } else if diff <= 3 * lease_timeout {
                warn!("Failed to contact {} in {diff:?}", server.id);
            } else {
                debug!("Failed to contact {} in {diff:?}", server.id);
            }
        }
        if contacted < self.quorum_size() {
            warn!("Failed to contact quorum of nodes, stepping down");
            self.shared.set_role(Role::Follower);
        }
        max_diff
    }

    /// Appends the configuration resulting from a change, and takes it into
    /// use immediately.
    fn append_configuration_entry(&mut self, state: &mut LeaderState, request: ConfigChangeRequest) {
        let ConfigChangeRequest { change, responder } = request;
        let configuration = match next_configuration(
            &self.configurations.latest,
            self.configurations.latest_index,
            &change,
        ) {
            Ok(configuration) => configuration,
            Err(err) => return responder.respond(Err(err)),
        };
        info!(
            "Updating configuration with {:?} ({}, {}): {:?}",
            change.command, change.id, change.address, configuration.servers
        );

        // Old servers understand the legacy peer list, which asserts the full
        // set of voters.
        let entry = match self.shared.protocol_version < 2 {
            true => Entry::new(
                EntryKind::RemovePeerDeprecated,
                encode_peers(&configuration, &*self.shared.transport),
            ),
            false => Entry::new(EntryKind::Configuration, configuration.encode()),
        };
        let inflight = Inflight { entry, responder: Some(responder) };
        let Some(index) = self.dispatch_logs(state, vec![inflight]) else { return };
        self.set_latest_configuration(configuration.clone(), index);
        state.commitment.set_configuration(&configuration);
        self.start_stop_replication(state);
    }

    /// Replaces the state machine with a user-provided snapshot. The snapshot
    /// is stored at an index past the end of the log, leaving a gap that
    /// forces followers to install it.
    fn restore_user_snapshot(
        &mut self,
        state: &mut LeaderState,
        meta: crate::storage::SnapshotMeta,
        reader: &mut Box<dyn std::io::Read + Send>,
    ) -> Result<()> {
        if !(SNAPSHOT_VERSION_MIN..=SNAPSHOT_VERSION_MAX).contains(&meta.version) {
            return Err(Error::InvalidInput(format!("unsupported snapshot version {}", meta.version)));
        }
        let configurations = &self.configurations;
        if !configurations.stable() {
            return Err(Error::InvalidInput(format!(
                "cannot restore snapshot now, wait until the configuration entry at {} has been applied (have applied {})",
                configurations.latest_index, configurations.committed_index
            )));
        }
        for inflight in state.inflight.drain(..) {
            inflight.respond(Err(Error::AbortedByRestore));
        }

        let term = self.shared.current_term();
        let last_index = self.shared.last_index().max(meta.index) + 1;
        let mut sink = self.shared.snapshots.create(
            meta.version,
            last_index,
            term,
            &configurations.latest,
            configurations.latest_index,
        )?;
        let written = match std::io::copy(reader, &mut sink) {
            Ok(written) => written,
            Err(err) => {
                sink.cancel()?;
                return Err(Error::IO(format!("failed to write snapshot: {err}")));
            }
        };
        if written != meta.size {
            sink.cancel()?;
            return Err(Error::IO(format!(
                "failed to write snapshot, size didn't match ({written} != {})",
                meta.size
            )));
        }
        let id = sink.id().to_string();
        sink.close()?;
        info!("Copied {written} bytes to local snapshot {id}");

        let (future, responder) = Future::new();
        crossbeam::select! {
            send(self.fsm_tx, FsmRequest::Restore { id, responder }) -> result => result?,
            recv(self.shared.shutdown_rx) -> _ => return Err(Error::RaftShutdown),
        }
        match future.wait() {
            Ok(()) => {}
            Err(Error::RaftShutdown) => return Err(Error::RaftShutdown),
            Err(err) => panic!("failed to restore snapshot: {err}"),
        }

        self.shared.set_last_log(last_index, term);
        self.shared.set_last_applied(last_index);
        self.shared.set_last_snapshot(last_index, term);
        if self.shared.log.is_monotonic() {
            if let Err(err) = self.shared.remove_old_logs(last_index, term) {
                error!("Failed to reset logs after restore: {err}");
            }
        }
        info!("Restored user snapshot at index {last_index}");
        Ok(())
    }

    /// Starts a leadership transfer to the requested server, or the most
    /// up-to-date voter. The transfer runs on its own threads, and the
    /// leader stops accepting writes until it completes.
    fn leadership_transfer(&mut self, state: &mut LeaderState, request: TransferRequest) {
        let TransferRequest { target, responder } = request;
        if self.shared.leadership_transfer_in_progress() {
            debug!("Leadership transfer already in progress");
            return responder.respond(Err(Error::LeadershipTransferInProgress));
        }
        let (id, address) = match target {
            Some(target) => target,
            None => match self.pick_server(state) {
                Some(server) => (server.id, server.address),
                None => return responder.respond(Err(Error::InvalidInput("cannot find peer".into()))),
            },
        };
        let Some(replication) = state.replications.get(&id) else {
            let err = Error::InvalidInput(format!("cannot find replication state for {id}"));
            return responder.respond(Err(err));
        };

        info!("Starting leadership transfer to {id} at {address}");
        self.shared.set_leadership_transfer(true);
        let handle = replication.transfer_handle();
        let (stop_tx, stop_rx) = crossbeam::channel::bounded::<()>(0);
        let (done_tx, done_rx) = crossbeam::channel::bounded(1);
        let shared = self.shared.clone();
        std::thread::spawn(move || {
            let result = transfer(&shared, &handle, &address, &stop_rx);
            let _ = done_tx.send(result);
        });

        let shared = self.shared.clone();
        let left_rx = state.left_rx.clone();
        std::thread::spawn(move || {
            let deadline = crossbeam::channel::after(shared.config().election_timeout);
            let result = crossbeam::select! {
                recv(deadline) -> _ => Err(Error::TransferTimeout),
                // Losing leadership is the expected outcome.
                recv(left_rx) -> _ => Ok(()),
                recv(done_rx) -> result => match result.unwrap_or(Err(Error::RaftShutdown)) {
                    Ok(()) => crossbeam::select! {
                        recv(deadline) -> _ => Err(Error::TransferTimeout),
                        recv(left_rx) -> _ => Ok(()),
                    },
                    Err(err) => Err(err),
                },
            };
            drop(stop_tx);
            if let Err(err) = &result {
                debug!("Leadership transfer failed: {err}");
            }
            shared.set_leadership_transfer(false);
            responder.respond(result);
        });
    }

    /// Picks the voter with the most replicated log.
    fn pick_server(&self, state: &LeaderState) -> Option<Server> {
        let mut pick: Option<(Index, &Server)> = None;
        for server in &self.configurations.latest.servers {
            if server.id == self.shared.local_id || server.suffrage != Suffrage::Voter {
                continue;
            }
            let Some(replication) = state.replications.get(&server.id) else { continue };
            let next_index = replication.next_index();
            if pick.map_or(true, |(current, _)| next_index > current) {
                pick = Some((next_index, server));
            }
        }
        pick.map(|(_, server)| server.clone())
    }
}

/// Brings the target up to date and tells it to start an election.
fn transfer(
    shared: &Shared,
    handle: &TransferHandle,
    address: &str,
    stop_rx: &Receiver<()>,
) -> Result<()> {
    if !handle.catch_up(stop_rx)? {
        return Ok(());
    }
    let id = handle.server().id;
    let request = TimeoutNowRequest { header: shared.header() };
    shared.transport.timeout_now(&id, address, &request).map_err(|err| {
        Error::IO(format!("failed to make TimeoutNow RPC to {id}: {err}"))
    })?;
    Ok(())
}

/// Group commit: collects the request along with any others that are
/// already queued, at most max in total.
fn group_commit<T>(first: T, rx: &Receiver<T>, max: usize) -> Vec<T> {
    let mut batch = vec![first];
    while batch.len() < max {
        match rx.try_recv() {
            Ok(request) => batch.push(request),
            Err(_) => break,
        }
    }
    batch
}

#[cfg(test)]
mod tests {
    use super::super::LogRequest;
    use super::*;
    use pretty_assertions::assert_eq;

    fn setup(servers: &[&str]) -> (Node, LeaderState) {
        let node = super::super::test_node(servers);
        let configuration = node.configurations.latest.clone();

        let (commit_tx, commit_rx) = crossbeam::channel::bounded(1);
        let (step_down_tx, step_down_rx) = crossbeam::channel::bounded(1);
        let (left_tx, left_rx) = crossbeam::channel::bounded(0);
        let state = LeaderState {
            commitment: Arc::new(Commitment::new(commit_tx, &configuration, 1)),
            commit_rx,
            inflight: VecDeque::new(),
            replications: HashMap::new(),
            notify: HashMap::new(),
            step_down_tx,
            step_down_rx,
            _left_tx: left_tx,
            left_rx,
        };
        (node, state)
    }

    #[test]
    fn dispatch_assigns_indexes() {
        let (mut node, mut state) = setup(&["a", "b", "c"]);
        let batch = (0..3)
            .map(|i| Inflight { entry: Entry::command(vec![i]), responder: None })
            .collect();
        assert_eq!(node.dispatch_logs(&mut state, batch), Some(3));
        assert_eq!(node.shared.last_log(), (3, 0));
        assert_eq!(state.inflight.iter().map(|i| i.entry.index).collect::<Vec<_>>(), vec![1, 2, 3]);
        assert!(state.inflight.iter().all(|i| i.entry.appended_at.is_some()));
        let entry = node.shared.log.get_log(2).expect("get").expect("entry");
        assert_eq!(entry.data, vec![1]);
    }

    #[test]
    fn group_commit_bounded_by_max() {
        let (tx, rx) = crossbeam::channel::unbounded();
        for i in 1..=10 {
            tx.send(i).expect("send");
        }
        assert_eq!(group_commit(0, &rx, 4), vec![0, 1, 2, 3]);
        assert_eq!(group_commit(0, &rx, 1), vec![0]);
        assert_eq!(group_commit(0, &rx, 64), vec![0, 4, 5, 6, 7, 8, 9, 10]);
        assert_eq!(group_commit(0, &rx, 64), vec![0]);
    }

    #[test]
    fn single_voter_commits_and_verifies() {
        let (mut node, mut state) = setup(&["a"]);
        let (future, responder) = Future::new();
        let request = LogRequest { entry: Entry::command(b"x".to_vec()), responder };
        node.dispatch_logs(&mut state, vec![request.into()]);
        assert_eq!(state.commitment.commit_index(), 1);

        node.commit(&mut state);
        assert_eq!(node.shared.commit_index(), 1);
        assert_eq!(node.shared.last_applied(), 1);
        assert!(state.inflight.is_empty());
        drop(future);

        let (future, responder) = Future::new();
        node.verify(&mut state, Verify::new(responder));
        assert_eq!(future.wait(), Ok(()));
        assert!(state.notify.is_empty());
    }

    #[test]
    fn lease_steps_down_without_quorum() {
        let (mut node, state) = setup(&["a", "b", "c"]);
        node.shared.set_role(Role::Leader);
        // No replications means no contact with the other voters.
        node.check_leader_lease(&state);
        assert_eq!(node.shared.role(), Role::Follower);

        let (mut node, state) = setup(&["a"]);
        node.shared.set_role(Role::Leader);
        node.check_leader_lease(&state);
        assert_eq!(node.shared.role(), Role::Leader);
    }

    #[test]
    fn cleanup_fails_inflight() {
        let (mut node, mut state) = setup(&["a", "b", "c"]);
        let (future, responder) = Future::new();
        let inflight = Inflight { entry: Entry::command(vec![]), responder: Some(responder) };
        node.dispatch_logs(&mut state, vec![inflight]);
        node.shared.set_leader(node.shared.local_addr.clone(), "a");
        node.leader_cleanup(state);
        assert_eq!(future.wait(), Err(Error::LeadershipLost));
        assert_eq!(node.shared.leader(), (String::new(), String::new()));
        assert!(node.shared.last_contact().is_some());
    }
}
