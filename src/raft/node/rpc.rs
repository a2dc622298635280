use super::{Node, Role, Shared};
use crate::error::{Error, Result};
use crate::raft::fsm::FsmRequest;
use crate::raft::future::Future;
use crate::raft::{
    decode_peers, encode_peers, AppendEntriesRequest, AppendEntriesResponse, Configuration,
    Entry, Header, InstallSnapshotRequest, InstallSnapshotResponse, Request, RequestVoteRequest,
    RequestVoteResponse, Response, Rpc, TimeoutNowRequest, TimeoutNowResponse,
    KEY_LAST_VOTE_CAND, KEY_LAST_VOTE_TERM, PROTOCOL_VERSION_MAX, PROTOCOL_VERSION_MIN,
    SNAPSHOT_VERSION_MAX, SNAPSHOT_VERSION_MIN,
};
use crate::raft::observer::Observation;

use log::{debug, error, info, warn};
use std::collections::HashMap;
use std::io::Read;

impl Shared {
    /// Checks that an RPC's protocol version can be handled. Versions one
    /// below the local one are accepted for rolling upgrades.
    pub fn check_header(&self, header: &Header) -> Result<()> {
        let version = header.protocol_version;
        if !(PROTOCOL_VERSION_MIN..=PROTOCOL_VERSION_MAX).contains(&version)
            || version < self.protocol_version.saturating_sub(1)
        {
            return Err(Error::UnsupportedProtocol);
        }
        Ok(())
    }

    /// Handles a heartbeat on the transport's thread, without involving the
    /// main loop or the disk. Only heartbeats from the current leader in
    /// the current term are handled while following, anything else is
    /// returned for the main loop to process.
    pub fn process_heartbeat(&self, rpc: Rpc) -> Option<Rpc> {
        let Request::AppendEntries(request) = &rpc.request else {
            return Some(rpc);
        };
        if !request.is_heartbeat()
            || self.role() != Role::Follower
            || request.term != self.current_term()
            || self.check_header(&request.header).is_err()
        {
            return Some(rpc);
        }
        self.set_leader(
            self.leader_address(&request.header, &request.leader),
            String::from_utf8_lossy(&request.header.id).into_owned(),
        );
        self.set_last_contact();
        let response = AppendEntriesResponse {
            header: self.header(),
            term: request.term,
            last_log: self.last_index(),
            success: true,
            no_retry_backoff: false,
        };
        rpc.respond(Ok(Response::AppendEntries(response)));
        None
    }

    /// Returns the sender's address from its header, falling back to the
    /// legacy address field for older protocol versions.
    fn leader_address(&self, header: &Header, legacy: &[u8]) -> String {
        match header.addr.is_empty() {
            true => self.transport.decode_peer(legacy),
            false => self.transport.decode_peer(&header.addr),
        }
    }
}

impl Node {
    /// Processes an inbound RPC.
    pub(super) fn process_rpc(&mut self, mut rpc: Rpc) -> Result<()> {
        if let Err(err) = self.shared.check_header(rpc.request.header()) {
            rpc.respond(Err(err));
            return Ok(());
        }
        let reader = rpc.reader.take();
        let result = match &rpc.request {
            Request::AppendEntries(request) => {
                self.append_entries(request).map(Response::AppendEntries)
            }
            Request::RequestVote(request) => self.request_vote(request).map(Response::RequestVote),
            Request::InstallSnapshot(request) => {
                let mut reader = reader.unwrap_or_else(|| Box::new(std::io::empty()) as Box<dyn Read + Send>);
                let result = self.install_snapshot(request, &mut reader);
                // Always consume the whole body, so the stream stays usable.
                let _ = std::io::copy(&mut reader, &mut std::io::sink());
                result.map(Response::InstallSnapshot)
            }
            Request::TimeoutNow(request) => self.timeout_now(request).map(Response::TimeoutNow),
        };
        rpc.respond(result);
        Ok(())
    }

    /// Steps down to follower in a newer term. Failing to persist the term is
    /// fatal.
    fn step_down(&mut self, term: u64) {
        self.shared.set_role(Role::Follower);
        if let Err(err) = self.shared.set_current_term(term) {
            error!("Failed to save current term {term}: {err}");
            self.shared.shutdown();
        }
    }

    /// Appends entries from the leader, after checking that the log matches
    /// the leader's at the preceding entry.
    fn append_entries(&mut self, request: &AppendEntriesRequest) -> Result<AppendEntriesResponse> {
        let mut response = AppendEntriesResponse {
            header: self.shared.header(),
            term: self.shared.current_term(),
            last_log: self.shared.last_index(),
            success: false,
            no_retry_backoff: false,
        };

        if request.term < self.shared.current_term() {
            return Ok(response);
        }
        if request.term > self.shared.current_term()
            || (self.shared.role() != Role::Follower && !self.candidate_from_transfer)
        {
            self.step_down(request.term);
            response.term = request.term;
        }

        self.shared.set_leader(
            self.shared.leader_address(&request.header, &request.leader),
            String::from_utf8_lossy(&request.header.id).into_owned(),
        );

        if request.prev_log_entry > 0 {
            let (last_index, last_term) = self.shared.last_entry();
            let prev_log_term = if request.prev_log_entry == last_index {
                last_term
            } else {
                match self.shared.log.get_log(request.prev_log_entry) {
                    Ok(Some(entry)) => entry.term,
                    Ok(None) | Err(_) => {
                        warn!(
                            "Failed to get previous log {} (last index {last_index})",
                            request.prev_log_entry
                        );
                        response.no_retry_backoff = true;
                        return Ok(response);
                    }
                }
            };
            if request.prev_log_term != prev_log_term {
                warn!(
                    "Previous log term mismatch: ours {prev_log_term} remote {}",
                    request.prev_log_term
                );
                response.no_retry_backoff = true;
                return Ok(response);
            }
        }

        if !request.entries.is_empty() {
            let Some(new_entries) = self.truncate_conflicts(&request.entries) else {
                return Ok(response);
            };
            if let Some(last) = new_entries.last() {
                if let Err(err) = self.shared.log.store_logs(new_entries) {
                    error!("Failed to append to logs: {err}");
                    return Ok(response);
                }
                for entry in new_entries {
                    if let Err(err) = self.process_configuration_entry(entry) {
                        warn!("Failed to append entry {}: {err}", entry.index);
                        return Err(err);
                    }
                }
                self.shared.set_last_log(last.index, last.term);
            }
        }

        if request.leader_commit_index > 0
            && request.leader_commit_index > self.shared.commit_index()
        {
            let index = request.leader_commit_index.min(self.shared.last_index());
            self.shared.set_commit_index(index);
            if self.configurations.latest_index <= index {
                self.set_committed_configuration(
                    self.configurations.latest.clone(),
                    self.configurations.latest_index,
                );
            }
            self.process_logs(index, HashMap::new());
        }

        response.success = true;
        self.shared.set_last_contact();
        Ok(response)
    }

    /// Skips entries already in the log and truncates the log at the first
    /// conflicting entry. Returns the entries to append, or None if the log
    /// could not be read or truncated.
    fn truncate_conflicts<'a>(&mut self, entries: &'a [Entry]) -> Option<&'a [Entry]> {
        let (last_log_index, _) = self.shared.last_log();
        for (i, entry) in entries.iter().enumerate() {
            if entry.index > last_log_index {
                return Some(&entries[i..]);
            }
            let stored = match self.shared.log.get_log(entry.index) {
                Ok(Some(stored)) => stored,
                Ok(None) => {
                    warn!("Failed to get log entry {}: {}", entry.index, Error::LogNotFound);
                    return None;
                }
                Err(err) => {
                    warn!("Failed to get log entry {}: {err}", entry.index);
                    return None;
                }
            };
            if entry.term != stored.term {
                warn!("Clearing log suffix from {} to {last_log_index}", entry.index);
                if let Err(err) = self.shared.log.delete_range(entry.index, last_log_index) {
                    error!("Failed to clear log suffix: {err}");
                    return None;
                }
                if entry.index <= self.configurations.latest_index {
                    self.set_latest_configuration(
                        self.configurations.committed.clone(),
                        self.configurations.committed_index,
                    );
                }
                return Some(&entries[i..]);
            }
        }
        Some(&[])
    }

    /// Decides whether to grant a vote to a candidate.
    fn request_vote(&mut self, request: &RequestVoteRequest) -> Result<RequestVoteResponse> {
        self.shared.observe(Observation::RequestVote(request.clone()));

        let mut response = RequestVoteResponse {
            header: self.shared.header(),
            term: self.shared.current_term(),
            peers: Vec::new(),
            granted: false,
        };
        if self.shared.protocol_version < 2 {
            response.peers = encode_peers(&self.configurations.latest, &*self.shared.transport);
        }

        let candidate_bytes = match request.header.addr.is_empty() {
            true => &request.candidate,
            false => &request.header.addr,
        };
        let candidate = self.shared.transport.decode_peer(candidate_bytes);
        let candidate_id = String::from_utf8_lossy(&request.header.id).into_owned();
        let latest = &self.configurations.latest;

        // Servers without an ID (protocol < 3) are assumed to be members.
        if !candidate_id.is_empty()
            && !latest.servers.is_empty()
            && !latest.contains(&candidate_id)
        {
            warn!("Rejecting vote request from {candidate} since it is not in configuration");
            return Ok(response);
        }
        let (leader_addr, leader_id) = self.shared.leader();
        if !leader_addr.is_empty() && leader_addr != candidate && !request.leadership_transfer {
            warn!(
                "Rejecting vote request from {candidate} since we have leader {leader_id:?} at {leader_addr}"
            );
            return Ok(response);
        }

        if request.term < self.shared.current_term() {
            return Ok(response);
        }
        if request.term > self.shared.current_term() {
            debug!("Lost leadership because of a vote request in newer term {}", request.term);
            self.step_down(request.term);
            response.term = request.term;
        }

        // A voter demoted to nonvoter may still campaign. Its newer term is
        // adopted above, so the cluster can make progress, but the vote is
        // denied.
        let latest = &self.configurations.latest;
        if !candidate_id.is_empty() && !latest.servers.is_empty() && !latest.has_vote(&candidate_id)
        {
            warn!("Rejecting vote request from {candidate} since it is not a voter");
            return Ok(response);
        }

        let last_vote_term = match self.shared.stable.get_u64(KEY_LAST_VOTE_TERM) {
            Ok(term) => term.unwrap_or(0),
            Err(err) => {
                error!("Failed to get last vote term: {err}");
                return Ok(response);
            }
        };
        let last_vote_candidate = match self.shared.stable.get(KEY_LAST_VOTE_CAND) {
            Ok(candidate) => candidate,
            Err(err) => {
                error!("Failed to get last vote candidate: {err}");
                return Ok(response);
            }
        };
        if let Some(last_vote_candidate) = last_vote_candidate {
            if last_vote_term == request.term {
                info!("Duplicate vote request in term {}", request.term);
                if &last_vote_candidate == candidate_bytes {
                    warn!("Duplicate vote request from {candidate}");
                    response.granted = true;
                }
                return Ok(response);
            }
        }

        let (last_index, last_term) = self.shared.last_entry();
        if last_term > request.last_log_term {
            warn!(
                "Rejecting vote request from {candidate} since our last term {last_term} is greater than {}",
                request.last_log_term
            );
            return Ok(response);
        }
        if last_term == request.last_log_term && last_index > request.last_log_index {
            warn!(
                "Rejecting vote request from {candidate} since our last index {last_index} is greater than {}",
                request.last_log_index
            );
            return Ok(response);
        }

        if let Err(err) = self.shared.persist_vote(request.term, candidate_bytes) {
            error!("Failed to persist vote: {err}");
            return Ok(response);
        }
        response.granted = true;
        self.shared.set_last_contact();
        Ok(response)
    }

    /// Installs a snapshot streamed from the leader, replacing the FSM state.
    fn install_snapshot(
        &mut self,
        request: &InstallSnapshotRequest,
        reader: &mut Box<dyn Read + Send>,
    ) -> Result<InstallSnapshotResponse> {
        let mut response = InstallSnapshotResponse {
            header: self.shared.header(),
            term: self.shared.current_term(),
            success: false,
        };

        if !(SNAPSHOT_VERSION_MIN..=SNAPSHOT_VERSION_MAX).contains(&request.snapshot_version) {
            return Err(Error::InvalidData(format!(
                "unsupported snapshot version {}",
                request.snapshot_version
            )));
        }
        if request.term < self.shared.current_term() {
            info!(
                "Ignoring snapshot install in term {} older than current term {}",
                request.term,
                self.shared.current_term()
            );
            return Ok(response);
        }
        if request.term > self.shared.current_term() {
            self.step_down(request.term);
            response.term = request.term;
        }
        self.shared.set_leader(
            self.shared.leader_address(&request.header, &request.leader),
            String::from_utf8_lossy(&request.header.id).into_owned(),
        );

        let (configuration, configuration_index) = match request.snapshot_version {
            0 => (decode_peers(&request.peers, &*self.shared.transport)?, request.last_log_index),
            _ => (Configuration::decode(&request.configuration)?, request.configuration_index),
        };
        let mut sink = self
            .shared
            .snapshots
            .create(
                crate::raft::snapshot_version(self.shared.protocol_version),
                request.last_log_index,
                request.last_log_term,
                &configuration,
                configuration_index,
            )
            .inspect_err(|err| error!("Failed to create snapshot to install: {err}"))?;

        let copied = match std::io::copy(&mut reader.take(request.size), &mut sink) {
            Ok(copied) => copied,
            Err(err) => {
                error!("Failed to copy snapshot: {err}");
                let _ = sink.cancel();
                return Err(err.into());
            }
        };
        if copied != request.size {
            error!("Failed to receive whole snapshot: {copied} of {} bytes", request.size);
            let _ = sink.cancel();
            return Err(Error::IO("short read".into()));
        }
        let id = sink.id().to_string();
        sink.close().inspect_err(|err| error!("Failed to finalize snapshot: {err}"))?;
        info!("Copied {copied} bytes to local snapshot {id}");

        let (future, responder) = Future::new();
        crossbeam::select! {
            send(self.fsm_tx, FsmRequest::Restore { id, responder }) -> result => result?,
            recv(self.shared.shutdown_rx) -> _ => return Err(Error::RaftShutdown),
        }
        future.wait().inspect_err(|err| error!("Failed to restore snapshot: {err}"))?;

        let (index, term) = (request.last_log_index, request.last_log_term);
        self.shared.set_last_applied(index);
        self.shared.set_last_snapshot(index, term);
        if index > self.shared.commit_index() {
            self.shared.set_commit_index(index);
        }
        self.set_latest_configuration(configuration.clone(), configuration_index);
        self.set_committed_configuration(configuration, configuration_index);

        // Keep the log if it already extends past the snapshot, otherwise the
        // snapshot replaces it entirely.
        let matching = match self.shared.log.get_log(index) {
            Ok(entry) => entry.is_some_and(|entry| entry.term == term),
            Err(_) => false,
        };
        let result = match matching && !self.shared.log.is_monotonic() {
            true => self.shared.compact_logs(index),
            false => self.shared.remove_old_logs(index, term),
        };
        if let Err(err) = result {
            error!("Failed to compact logs: {err}");
        }

        info!("Installed remote snapshot at index {index} term {term}");
        response.success = true;
        self.shared.set_last_contact();
        Ok(response)
    }

    /// Starts an election immediately, on request of the leader during a
    /// leadership transfer.
    fn timeout_now(&mut self, _request: &TimeoutNowRequest) -> Result<TimeoutNowResponse> {
        self.shared.set_role(Role::Candidate);
        self.candidate_from_transfer = true;
        Ok(TimeoutNowResponse { header: self.shared.header() })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raft::transport::Memory;
    use crate::raft::{Config, EntryKind, Server};
    use crate::storage;
    use pretty_assertions::assert_eq;
    use std::sync::Arc;

    fn setup(protocol_version: u8) -> Shared {
        let config = Config { local_id: "a".into(), protocol_version, ..Default::default() };
        let store = Arc::new(storage::Memory::new());
        Shared::new(
            config,
            store.clone(),
            store,
            Arc::new(storage::MemorySnapshots::new()),
            Arc::new(Memory::new("a")),
        )
    }

    fn header(protocol_version: u8) -> Header {
        Header { protocol_version, id: b"b".to_vec(), addr: b"b".to_vec() }
    }

    #[test]
    fn check_header() {
        let shared = setup(3);
        assert_eq!(shared.check_header(&header(3)), Ok(()));
        assert_eq!(shared.check_header(&header(2)), Ok(()));
        assert_eq!(shared.check_header(&header(1)), Err(Error::UnsupportedProtocol));
        assert_eq!(shared.check_header(&header(4)), Err(Error::UnsupportedProtocol));
        assert_eq!(setup(1).check_header(&header(0)), Ok(()));
    }

    /// Truncating a conflicting uncommitted configuration entry reverts the
    /// latest configuration to the committed one.
    #[test]
    fn truncate_reverts_configuration() -> Result<()> {
        let mut node = super::super::test_node(&["a", "b", "c"]);
        let committed = node.configurations.committed.clone();
        let bootstrap = Entry {
            index: 1,
            term: 1,
            ..Entry::new(EntryKind::Configuration, committed.encode())
        };
        node.shared.log.store_log(&bootstrap)?;
        node.shared.set_last_log(1, 1);

        let mut added = committed.clone();
        added.servers.push(Server::voter("d", "d"));
        let append = AppendEntriesRequest {
            header: header(3),
            term: 1,
            leader: b"b".to_vec(),
            prev_log_entry: 1,
            prev_log_term: 1,
            entries: vec![Entry {
                index: 2,
                term: 1,
                ..Entry::new(EntryKind::Configuration, added.encode())
            }],
            ..Default::default()
        };
        assert!(node.append_entries(&append)?.success);
        assert_eq!(node.configurations.latest, added);
        assert_eq!(node.configurations.latest_index, 2);
        assert_eq!(node.configurations.committed_index, 1);

        // A new leader overwrites the uncommitted entry.
        let overwrite = AppendEntriesRequest {
            term: 2,
            entries: vec![Entry { index: 2, term: 2, ..Entry::command(b"x".to_vec()) }],
            ..append
        };
        assert!(node.append_entries(&overwrite)?.success);
        assert_eq!(node.configurations.latest, committed);
        assert_eq!(node.configurations.latest_index, node.configurations.committed_index);
        assert_eq!(node.shared.log.get_log(2)?.map(|entry| entry.term), Some(2));
        assert_eq!(node.shared.last_log(), (2, 2));
        Ok(())
    }

    #[test]
    fn heartbeat_fast_path() -> Result<()> {
        let shared = setup(3);
        shared.set_current_term(2)?;
        shared.set_last_log(7, 2);
        let heartbeat = AppendEntriesRequest {
            header: header(3),
            term: 2,
            leader: b"b".to_vec(),
            ..Default::default()
        };

        let (tx, rx) = crossbeam::channel::bounded(1);
        let rpc = Rpc::new(Request::AppendEntries(heartbeat.clone()), tx);
        assert!(shared.process_heartbeat(rpc).is_none());
        let response = rx.recv()??.into_append_entries()?;
        assert!(response.success);
        assert_eq!(response.last_log, 7);
        assert_eq!(shared.leader(), ("b".to_string(), "b".to_string()));
        assert!(shared.last_contact().is_some());

        // Heartbeats from other terms, and any heartbeat while not
        // following, go through the main loop.
        let (tx, _rx) = crossbeam::channel::bounded(1);
        let stale = AppendEntriesRequest { term: 1, ..heartbeat.clone() };
        assert!(shared.process_heartbeat(Rpc::new(Request::AppendEntries(stale), tx)).is_some());

        shared.set_role(Role::Candidate);
        let (tx, _rx) = crossbeam::channel::bounded(1);
        assert!(shared.process_heartbeat(Rpc::new(Request::AppendEntries(heartbeat), tx)).is_some());
        Ok(())
    }
}
