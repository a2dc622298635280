use super::fsm::FsmSnapshot;
use super::future::{Future, Responder};
use super::node::{random_timeout, Shared};
use super::snapshot_version;
use crate::error::{Error, Result};
use crate::storage::{SnapshotMeta, SnapshotStore};

use crossbeam::channel::{Receiver, Sender};
use log::{debug, error, info};
use std::io::Read;
use std::sync::Arc;

/// A snapshot taken on user request, which can be opened for reading.
pub struct OpenSnapshot {
    id: String,
    snapshots: Arc<dyn SnapshotStore>,
}

impl OpenSnapshot {
    /// Returns the snapshot ID.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Opens the snapshot, returning its metadata and contents.
    pub fn open(&self) -> Result<(SnapshotMeta, Box<dyn Read + Send>)> {
        self.snapshots.open(&self.id)
    }
}

impl std::fmt::Debug for OpenSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenSnapshot").field("id", &self.id).finish()
    }
}

/// Takes snapshots periodically once enough entries have committed since the
/// last one, or on user request, and compacts the log afterwards.
pub(crate) struct SnapshotRunner {
    shared: Arc<Shared>,
    fsm_snapshot_tx: Sender<Responder<FsmSnapshot>>,
}

impl SnapshotRunner {
    pub fn new(shared: Arc<Shared>, fsm_snapshot_tx: Sender<Responder<FsmSnapshot>>) -> Self {
        Self { shared, fsm_snapshot_tx }
    }

    /// Runs until shutdown.
    pub fn run(self, user_snapshot_rx: Receiver<Responder<OpenSnapshot>>) {
        debug!("Starting snapshot runner");
        let shutdown_rx = self.shared.shutdown_rx.clone();
        loop {
            let interval = random_timeout(self.shared.config().snapshot_interval);
            crossbeam::select! {
                recv(interval) -> _ => {
                    if self.should_snapshot() {
                        if let Err(err) = self.take_snapshot() {
                            error!("Failed to take snapshot: {err}");
                        }
                    }
                }
                recv(user_snapshot_rx) -> responder => {
                    let Ok(responder) = responder else { return };
                    let result = self.take_snapshot().map(|id| OpenSnapshot {
                        id,
                        snapshots: self.shared.snapshots.clone(),
                    });
                    if let Err(err) = &result {
                        error!("Failed to take user snapshot: {err}");
                    }
                    responder.respond(result);
                }
                recv(shutdown_rx) -> _ => return,
            }
        }
    }

    /// Returns true if enough entries have committed since the last snapshot,
    /// and there is no uncommitted configuration.
    fn should_snapshot(&self) -> bool {
        let (snapshot_index, _) = self.shared.last_snapshot();
        let delta = self.shared.commit_index().saturating_sub(snapshot_index);
        delta >= self.shared.config().snapshot_threshold && self.shared.configurations().stable()
    }

    /// Snapshots the FSM, persists it with the committed configuration, and
    /// compacts the log. Returns the snapshot ID.
    fn take_snapshot(&self) -> Result<String> {
        let (future, responder) = Future::new();
        crossbeam::select! {
            send(self.fsm_snapshot_tx, responder) -> result => result?,
            recv(self.shared.shutdown_rx) -> _ => return Err(Error::RaftShutdown),
        }
        let mut fsm_snapshot = future.wait().map_err(|err| match err {
            Error::NothingNewToSnapshot | Error::RaftShutdown => err,
            err => Error::IO(format!("failed to start snapshot: {err}")),
        })?;
        let result = self.persist(&mut fsm_snapshot);
        fsm_snapshot.snapshot.release();
        result
    }

    fn persist(&self, fsm_snapshot: &mut FsmSnapshot) -> Result<String> {
        let FsmSnapshot { index, term, snapshot } = fsm_snapshot;
        let (index, term) = (*index, *term);

        // The snapshot carries the committed configuration, so the FSM must
        // have applied past it.
        let configurations = self.shared.configurations();
        if index < configurations.committed_index {
            return Err(Error::InvalidInput(format!(
                "cannot take snapshot now, wait until the configuration entry at {} has been applied (have applied {index})",
                configurations.committed_index
            )));
        }

        info!("Starting snapshot up to {index}");
        let version = snapshot_version(self.shared.protocol_version);
        let mut sink = self
            .shared
            .snapshots
            .create(
                version,
                index,
                term,
                &configurations.committed,
                configurations.committed_index,
            )
            .map_err(|err| Error::IO(format!("failed to create snapshot: {err}")))?;
        if let Err(err) = snapshot.persist(&mut sink) {
            sink.cancel()?;
            return Err(Error::IO(format!("failed to persist snapshot: {err}")));
        }
        let id = sink.id().to_string();
        sink.close().map_err(|err| Error::IO(format!("failed to close snapshot: {err}")))?;

        self.shared.set_last_snapshot(index, term);
        self.shared.compact_logs(index)?;
        info!("Snapshot {id} complete up to {index}");
        Ok(id)
    }
}
