//! Leader-side replication. Each peer gets a replication worker that sends
//! it log entries (or the latest snapshot when the entries it needs have been
//! compacted), plus a heartbeat thread. Workers run on their own threads and
//! report progress to the leader's main loop via the commitment tracker and
//! the step-down channel.

use super::commitment::Commitment;
use super::future::Responder;
use super::node::Shared;
use super::observer::Observation;
use super::transport::AppendPipeline;
use super::{AppendEntriesRequest, Configuration, Index, InstallSnapshotRequest, Server, Term};
use crate::error::{Error, Result};

use crossbeam::channel::{Receiver, Sender, TryRecvError};
use log::{error, info, warn};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::{Duration, Instant};

/// The base backoff after a failed RPC.
const FAILURE_WAIT: Duration = Duration::from_millis(10);

/// The maximum backoff exponent.
const MAX_FAILURE_SCALE: u32 = 12;

/// Returns the backoff after the given number of consecutive failures,
/// doubling from the base and capped at the limit.
fn backoff(base: Duration, failures: u64, limit: Duration) -> Duration {
    let scale = failures.min(MAX_FAILURE_SCALE as u64) as u32;
    base.saturating_mul(2u32.saturating_pow(scale)).min(limit)
}

/// A leadership verification: the leader is confirmed once a quorum of
/// voters (itself included) acknowledges a round of heartbeats.
pub(crate) struct Verify {
    state: Mutex<VerifyState>,
}

struct VerifyState {
    quorum_size: usize,
    votes: usize,
    /// Notified once the outcome is known. None before start() and after
    /// notification.
    notify_tx: Option<Sender<Arc<Verify>>>,
    responder: Option<Responder<()>>,
}

impl Verify {
    pub fn new(responder: Responder<()>) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(VerifyState {
                quorum_size: 0,
                votes: 0,
                notify_tx: None,
                responder: Some(responder),
            }),
        })
    }

    /// Returns a key identifying the verification.
    pub fn key(self: &Arc<Self>) -> usize {
        Arc::as_ptr(self) as usize
    }

    fn state(&self) -> std::sync::MutexGuard<'_, VerifyState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns true if the verification has been started by the leader.
    pub fn started(&self) -> bool {
        self.state().quorum_size > 0
    }

    /// Returns true if a quorum confirmed the leader.
    pub fn confirmed(&self) -> bool {
        let state = self.state();
        state.votes >= state.quorum_size
    }

    /// Starts the verification with the leader's own vote. Returns false if
    /// the leader alone is a quorum, in which case it has already responded.
    pub fn start(&self, quorum_size: usize, notify_tx: Sender<Arc<Verify>>) -> bool {
        let mut state = self.state();
        state.votes = 1;
        state.quorum_size = quorum_size;
        if quorum_size <= 1 {
            if let Some(responder) = state.responder.take() {
                responder.respond(Ok(()));
            }
            return false;
        }
        state.notify_tx = Some(notify_tx);
        true
    }

    /// Records a peer's heartbeat outcome. The leader's main loop is notified
    /// once a quorum acknowledged it, or as soon as any peer rejects it.
    pub fn vote(self: &Arc<Self>, leader: bool) {
        let notify_tx = {
            let mut state = self.state();
            if state.notify_tx.is_none() {
                return;
            }
            if leader {
                state.votes += 1;
                if state.votes < state.quorum_size {
                    return;
                }
            }
            state.notify_tx.take()
        };
        if let Some(notify_tx) = notify_tx {
            let _ = notify_tx.send(self.clone());
        }
    }

    /// Responds to the caller.
    pub fn respond(&self, result: Result<()>) {
        if let Some(responder) = self.state().responder.take() {
            responder.respond(result);
        }
    }
}

/// Replication state for a peer, shared between the leader's main loop,
/// the replication worker and the heartbeat thread.
pub(crate) struct Peer {
    shared: Arc<Shared>,
    commitment: Arc<Commitment>,
    step_down_tx: Sender<()>,
    server: RwLock<Server>,
    /// The leader's term, fixed for the lifetime of the worker.
    term: Term,
    /// The next log index to send to the peer.
    next_index: AtomicU64,
    last_contact: RwLock<Instant>,
    /// Leadership verifications awaiting the next heartbeat.
    notify: Mutex<HashMap<usize, Arc<Verify>>>,
}

impl Peer {
    pub fn server(&self) -> Server {
        self.server.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn next_index(&self) -> Index {
        self.next_index.load(Ordering::SeqCst)
    }

    /// Returns the last time the peer responded.
    pub fn last_contact(&self) -> Instant {
        *self.last_contact.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_last_contact(&self) {
        *self.last_contact.write().unwrap_or_else(PoisonError::into_inner) = Instant::now();
    }

    /// Votes on all pending verifications.
    fn notify_all(&self, leader: bool) {
        let pending = std::mem::take(
            &mut *self.notify.lock().unwrap_or_else(PoisonError::into_inner),
        );
        for verify in pending.values() {
            verify.vote(leader);
        }
    }

    /// Records that the peer stored the request's entries.
    fn update_last_appended(&self, request: &AppendEntriesRequest) {
        if let Some(last) = request.entries.last() {
            self.next_index.store(last.index + 1, Ordering::SeqCst);
            self.commitment.match_index(&self.server().id, last.index);
        }
        self.notify_all(true);
    }

    /// The peer has a newer term, so the leader must step down.
    fn handle_stale_term(&self) {
        error!("Peer {} has newer term, stopping replication", self.server().id);
        self.notify_all(false);
        let _ = self.step_down_tx.try_send(());
    }

    /// Builds an AppendEntries request for entries from next_index up to
    /// last_index, at most max_append_entries. Returns Error::LogNotFound if
    /// the entries have been compacted.
    fn append_entries_request(
        &self,
        next_index: Index,
        last_index: Index,
    ) -> Result<AppendEntriesRequest> {
        let shared = &self.shared;
        let mut request = AppendEntriesRequest {
            header: shared.header(),
            term: self.term,
            leader: shared.encoded_local(),
            leader_commit_index: shared.commit_index(),
            ..Default::default()
        };

        let (snapshot_index, snapshot_term) = shared.last_snapshot();
        if next_index == 1 {
            (request.prev_log_entry, request.prev_log_term) = (0, 0);
        } else if next_index - 1 == snapshot_index {
            (request.prev_log_entry, request.prev_log_term) = (snapshot_index, snapshot_term);
        } else {
            let prev = shared.log.get_log(next_index - 1)?.ok_or_else(|| {
                error!("Failed to get log {}: {}", next_index - 1, Error::LogNotFound);
                Error::LogNotFound
            })?;
            (request.prev_log_entry, request.prev_log_term) = (prev.index, prev.term);
        }

        let max_entries = shared.config().max_append_entries as u64;
        let max_index = last_index.min(next_index + max_entries - 1);
        for index in next_index..=max_index {
            request.entries.push(shared.log.get_log(index)?.ok_or(Error::LogNotFound)?);
        }
        Ok(request)
    }
}

/// The leader's handle to a peer's replication worker. Dropping it stops the
/// worker.
pub(crate) struct Replication {
    peer: Arc<Peer>,
    /// Stops the worker when dropped. Sending an index first asks the worker
    /// to replicate up to it before stopping.
    stop_tx: Option<Sender<Index>>,
    trigger_tx: Sender<()>,
    /// Replicates to the peer and acknowledges on the given channel.
    ack_tx: Sender<Sender<Result<()>>>,
    heartbeat_tx: Sender<()>,
}

impl Replication {
    /// Starts replicating to the given server from next_index.
    pub fn start(
        shared: Arc<Shared>,
        commitment: Arc<Commitment>,
        step_down_tx: Sender<()>,
        server: Server,
        term: Term,
        next_index: Index,
    ) -> Self {
        let peer = Arc::new(Peer {
            shared,
            commitment,
            step_down_tx,
            server: RwLock::new(server),
            term,
            next_index: AtomicU64::new(next_index),
            last_contact: RwLock::new(Instant::now()),
            notify: Mutex::new(HashMap::new()),
        });
        let (stop_tx, stop_rx) = crossbeam::channel::bounded(1);
        let (trigger_tx, trigger_rx) = crossbeam::channel::bounded(1);
        let (ack_tx, ack_rx) = crossbeam::channel::bounded(1);
        let (heartbeat_tx, heartbeat_rx) = crossbeam::channel::bounded(1);

        let worker = Worker {
            peer: peer.clone(),
            stop_rx,
            trigger_rx,
            ack_rx,
            failures: 0,
            allow_pipeline: false,
        };
        std::thread::spawn(move || worker.run(heartbeat_rx));

        Self { peer, stop_tx: Some(stop_tx), trigger_tx, ack_tx, heartbeat_tx }
    }

    /// Asks the worker to replicate new entries.
    pub fn trigger(&self) {
        let _ = self.trigger_tx.try_send(());
    }

    /// Asks the heartbeat thread to send a heartbeat now.
    pub fn heartbeat(&self) {
        let _ = self.heartbeat_tx.try_send(());
    }

    /// Registers a verification with the next heartbeat, and sends it.
    pub fn add_verify(&self, verify: Arc<Verify>) {
        self.peer
            .notify
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(verify.key(), verify);
        self.heartbeat();
    }

    /// Removes a verification.
    pub fn remove_verify(&self, key: usize) {
        self.peer.notify.lock().unwrap_or_else(PoisonError::into_inner).remove(&key);
    }

    /// Stops the worker, after making a best effort to replicate up to the
    /// given index.
    pub fn stop(&mut self, index: Option<Index>) {
        if let (Some(stop_tx), Some(index)) = (self.stop_tx.take(), index) {
            let _ = stop_tx.try_send(index);
        }
    }

    pub fn server(&self) -> Server {
        self.peer.server()
    }

    /// Updates the peer's server, e.g. when its address changed.
    pub fn set_server(&self, server: Server) {
        *self.peer.server.write().unwrap_or_else(PoisonError::into_inner) = server;
    }

    pub fn next_index(&self) -> Index {
        self.peer.next_index()
    }

    pub fn last_contact(&self) -> Instant {
        self.peer.last_contact()
    }

    /// Returns a handle for driving the peer during a leadership transfer.
    pub fn transfer_handle(&self) -> TransferHandle {
        TransferHandle { peer: self.peer.clone(), ack_tx: self.ack_tx.clone() }
    }
}

impl Drop for Replication {
    fn drop(&mut self) {
        self.stop(None)
    }
}

/// Drives a peer from a leadership transfer thread.
pub(crate) struct TransferHandle {
    peer: Arc<Peer>,
    ack_tx: Sender<Sender<Result<()>>>,
}

impl TransferHandle {
    /// Replicates to the peer until it has the full log. Returns Ok(false)
    /// if the transfer was cancelled via stop_rx.
    pub fn catch_up(&self, stop_rx: &Receiver<()>) -> Result<bool> {
        while self.peer.next_index() <= self.peer.shared.last_index() {
            let (done_tx, done_rx) = crossbeam::channel::bounded(1);
            crossbeam::select! {
                send(self.ack_tx, done_tx) -> result => result?,
                recv(stop_rx) -> _ => return Ok(false),
            }
            crossbeam::select! {
                recv(done_rx) -> result => result??,
                recv(stop_rx) -> _ => return Ok(false),
            }
        }
        Ok(true)
    }

    pub fn server(&self) -> Server {
        self.peer.server()
    }
}

/// A replication worker, running on its own thread until stopped.
struct Worker {
    peer: Arc<Peer>,
    stop_rx: Receiver<Index>,
    trigger_rx: Receiver<()>,
    ack_rx: Receiver<Sender<Result<()>>>,
    failures: u64,
    /// Set after a successful AppendEntries, when the peer is caught up
    /// enough to switch to pipelining.
    allow_pipeline: bool,
}

impl Worker {
    fn run(mut self, heartbeat_rx: Receiver<()>) {
        // The heartbeat thread stops when this sender is dropped.
        let (heartbeat_stop_tx, heartbeat_stop_rx) = crossbeam::channel::bounded::<()>(0);
        let peer = self.peer.clone();
        std::thread::spawn(move || heartbeat(peer, heartbeat_rx, heartbeat_stop_rx));

        let (stop_rx, trigger_rx, ack_rx) =
            (self.stop_rx.clone(), self.trigger_rx.clone(), self.ack_rx.clone());
        let mut stop = false;
        while !stop {
            let commit_timeout = super::node::random_timeout(self.peer.shared.config().commit_timeout);
            stop = crossbeam::select! {
                recv(stop_rx) -> index => {
                    if let Ok(index) = index {
                        self.replicate_to(index);
                    }
                    true
                }
                recv(ack_rx) -> done_tx => {
                    let (last_index, _) = self.peer.shared.last_log();
                    let stop = self.replicate_to(last_index);
                    if let Ok(done_tx) = done_tx {
                        let _ = done_tx.send(match stop {
                            false => Ok(()),
                            true => Err(Error::IO("replication failed".into())),
                        });
                    }
                    stop
                }
                recv(trigger_rx) -> _ => {
                    let (last_index, _) = self.peer.shared.last_log();
                    self.replicate_to(last_index)
                }
                recv(commit_timeout) -> _ => {
                    let (last_index, _) = self.peer.shared.last_log();
                    self.replicate_to(last_index)
                }
            };

            if !stop && self.allow_pipeline {
                self.allow_pipeline = false;
                match self.pipeline_replicate() {
                    Ok(()) | Err(Error::PipelineReplicationNotSupported) => {}
                    Err(err) => error!(
                        "Failed to start pipeline replication to {}: {err}",
                        self.peer.server().id
                    ),
                }
            }
        }
        drop(heartbeat_stop_tx);
    }

    /// Sleeps after consecutive failures, unless the node shuts down.
    fn backoff(&self) {
        if self.failures > 0 {
            let wait = backoff(FAILURE_WAIT, self.failures, Duration::MAX);
            crossbeam::select! {
                recv(crossbeam::channel::after(wait)) -> _ => {},
                recv(self.peer.shared.shutdown_rx) -> _ => {},
            }
        }
    }

    /// Replicates entries up to last_index, one request at a time. Returns
    /// true if replication should stop.
    fn replicate_to(&mut self, last_index: Index) -> bool {
        loop {
            self.backoff();
            let server = self.peer.server();
            let shared = &self.peer.shared;

            match self.peer.append_entries_request(self.peer.next_index(), last_index) {
                Ok(request) => {
                    let response =
                        match shared.transport.append_entries(&server.id, &server.address, &request)
                        {
                            Ok(response) => response,
                            Err(err) => {
                                error!("Failed to append entries to {}: {err}", server.id);
                                self.failures += 1;
                                return false;
                            }
                        };
                    if response.term > request.term {
                        self.peer.handle_stale_term();
                        return true;
                    }
                    self.peer.set_last_contact();

                    if response.success {
                        self.peer.update_last_appended(&request);
                        self.failures = 0;
                        self.allow_pipeline = true;
                    } else {
                        let next_index = (self.peer.next_index().saturating_sub(1))
                            .min(response.last_log + 1)
                            .max(1);
                        self.peer.next_index.store(next_index, Ordering::SeqCst);
                        match response.no_retry_backoff {
                            true => self.failures = 0,
                            false => self.failures += 1,
                        }
                        warn!(
                            "Append entries rejected by {}, sending older logs from {next_index}",
                            server.id
                        );
                    }
                }
                Err(Error::LogNotFound) => match self.send_latest_snapshot() {
                    Ok(true) => return true,
                    Ok(false) => {}
                    Err(err) => {
                        error!("Failed to send snapshot to {}: {err}", server.id);
                        return false;
                    }
                },
                Err(_) => return false,
            }

            match self.stop_rx.try_recv() {
                Ok(_) | Err(TryRecvError::Disconnected) => return true,
                Err(TryRecvError::Empty) => {}
            }
            if self.peer.next_index() > last_index {
                return false;
            }
        }
    }

    /// Sends the latest snapshot to the peer. Returns true if replication
    /// should stop.
    fn send_latest_snapshot(&mut self) -> Result<bool> {
        let shared = &self.peer.shared;
        let Some(latest) = shared.snapshots.list()?.into_iter().next() else {
            self.failures += 1;
            return Err(Error::IO("no snapshots found".into()));
        };
        let (meta, reader) = shared.snapshots.open(&latest.id)?;
        let request = InstallSnapshotRequest {
            header: shared.header(),
            snapshot_version: meta.version,
            term: self.peer.term,
            leader: shared.encoded_local(),
            last_log_index: meta.index,
            last_log_term: meta.term,
            peers: meta.peers.clone(),
            configuration: Configuration::encode(&meta.configuration),
            configuration_index: meta.configuration_index,
            size: meta.size,
        };

        let server = self.peer.server();
        info!("Sending snapshot {} at index {} to {}", meta.id, meta.index, server.id);
        let response =
            match shared.transport.install_snapshot(&server.id, &server.address, &request, reader) {
                Ok(response) => response,
                Err(err) => {
                    self.failures += 1;
                    return Err(err);
                }
            };
        if response.term > request.term {
            self.peer.handle_stale_term();
            return Ok(true);
        }
        self.peer.set_last_contact();

        if response.success {
            self.peer.next_index.store(meta.index + 1, Ordering::SeqCst);
            self.peer.commitment.match_index(&server.id, meta.index);
            self.failures = 0;
            self.peer.notify_all(true);
        } else {
            self.failures += 1;
            warn!("Snapshot install rejected by {}", server.id);
        }
        Ok(false)
    }

    /// Replicates via a pipeline, sending requests without waiting for
    /// responses, until the pipeline fails or replication stops. Responses
    /// are processed by a decoder thread.
    fn pipeline_replicate(&mut self) -> Result<()> {
        let server = self.peer.server();
        let mut pipeline =
            self.peer.shared.transport.append_entries_pipeline(&server.id, &server.address)?;
        info!("Pipelining replication to {}", server.id);

        let (stop_tx, stop_rx) = crossbeam::channel::bounded::<()>(0);
        let (finish_tx, finish_rx) = crossbeam::channel::bounded::<()>(0);
        let (peer, results_rx) = (self.peer.clone(), pipeline.consumer());
        std::thread::spawn(move || {
            let _finish_tx = finish_tx;
            loop {
                crossbeam::select! {
                    recv(results_rx) -> result => {
                        let Ok(result) = result else { return };
                        let Ok(response) = result.response else { return };
                        if response.term > result.request.term {
                            peer.handle_stale_term();
                            return;
                        }
                        peer.set_last_contact();
                        if !response.success {
                            return;
                        }
                        peer.update_last_appended(&result.request);
                    }
                    recv(stop_rx) -> _ => return,
                }
            }
        });

        let mut next_index = self.peer.next_index();
        let mut stop = false;
        while !stop {
            let commit_timeout = super::node::random_timeout(self.peer.shared.config().commit_timeout);
            stop = crossbeam::select! {
                recv(finish_rx) -> _ => true,
                recv(self.stop_rx) -> index => {
                    if let Ok(index) = index {
                        self.pipeline_send(&mut *pipeline, &mut next_index, index);
                    }
                    true
                }
                recv(self.ack_rx) -> done_tx => {
                    let (last_index, _) = self.peer.shared.last_log();
                    let stop = self.pipeline_send(&mut *pipeline, &mut next_index, last_index);
                    if let Ok(done_tx) = done_tx {
                        let _ = done_tx.send(match stop {
                            false => Ok(()),
                            true => Err(Error::IO("replication failed".into())),
                        });
                    }
                    stop
                }
                recv(self.trigger_rx) -> _ => {
                    let (last_index, _) = self.peer.shared.last_log();
                    self.pipeline_send(&mut *pipeline, &mut next_index, last_index)
                }
                recv(commit_timeout) -> _ => {
                    let (last_index, _) = self.peer.shared.last_log();
                    self.pipeline_send(&mut *pipeline, &mut next_index, last_index)
                }
            };
        }

        drop(stop_tx);
        crossbeam::select! {
            recv(finish_rx) -> _ => {},
            recv(self.peer.shared.shutdown_rx) -> _ => {},
        }
        pipeline.close()
    }

    /// Sends entries up to last_index on the pipeline. Returns true if the
    /// pipeline should stop.
    fn pipeline_send(
        &self,
        pipeline: &mut dyn AppendPipeline,
        next_index: &mut Index,
        last_index: Index,
    ) -> bool {
        let Ok(request) = self.peer.append_entries_request(*next_index, last_index) else {
            return true;
        };
        let last = request.entries.last().map(|entry| entry.index);
        if let Err(err) = pipeline.append_entries(request) {
            error!("Failed to pipeline append entries to {}: {err}", self.peer.server().id);
            return true;
        }
        if let Some(last) = last {
            *next_index = last + 1;
        }
        false
    }
}

/// Sends heartbeats to the peer every heartbeat_timeout/10, or when asked
/// via heartbeat_rx, until stop_rx disconnects.
fn heartbeat(peer: Arc<Peer>, heartbeat_rx: Receiver<()>, stop_rx: Receiver<()>) {
    let shared = &peer.shared;
    let request = AppendEntriesRequest {
        header: shared.header(),
        term: peer.term,
        leader: shared.encoded_local(),
        ..Default::default()
    };
    let mut failures = 0;
    loop {
        let interval = super::node::random_timeout(shared.config().heartbeat_timeout / 10);
        let stopped = crossbeam::select! {
            recv(heartbeat_rx) -> _ => false,
            recv(interval) -> _ => false,
            recv(stop_rx) -> _ => true,
        };
        if stopped {
            return;
        }

        let server = peer.server();
        match shared.transport.append_entries(&server.id, &server.address, &request) {
            Ok(response) => {
                if failures > 0 {
                    shared.observe(Observation::ResumedHeartbeat { peer: server.id.clone() });
                }
                peer.set_last_contact();
                failures = 0;
                peer.notify_all(response.success);
            }
            Err(err) => {
                let wait = backoff(FAILURE_WAIT, failures, shared.config().heartbeat_timeout / 2);
                error!("Failed to heartbeat to {} (backoff {wait:?}): {err}", server.id);
                shared.observe(Observation::FailedHeartbeat {
                    peer: server.id.clone(),
                    last_contact: peer.last_contact(),
                });
                failures += 1;
                let stopped = crossbeam::select! {
                    recv(crossbeam::channel::after(wait)) -> _ => false,
                    recv(stop_rx) -> _ => true,
                };
                if stopped {
                    return;
                }
            }
        }
    }
}
