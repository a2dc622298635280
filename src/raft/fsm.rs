use super::future::Responder;
use super::state::{Snapshot, State};
use super::{Applied, Configuration, Entry, EntryKind, Index, Term};
use crate::error::{Error, Result};
use crate::storage::SnapshotStore;

use crossbeam::channel::Receiver;
use log::{debug, error, info};
use std::sync::Arc;

/// A committed entry to apply, with the client's responder if the entry was
/// submitted on this node.
pub(crate) struct Commit {
    pub entry: Entry,
    pub responder: Option<Responder<Applied>>,
}

impl Commit {
    fn respond(self, result: Result<Vec<u8>>) {
        if let Some(responder) = self.responder {
            let index = self.entry.index;
            responder.respond(result.map(|response| Applied { index, response }));
        }
    }
}

/// A request that mutates the FSM.
pub(crate) enum FsmRequest {
    /// Applies a batch of committed entries in order.
    Commit(Vec<Commit>),
    /// Replaces the FSM state with the given snapshot.
    Restore { id: String, responder: Responder<()> },
}

/// A point-in-time FSM snapshot, with the last applied position it covers.
pub(crate) struct FsmSnapshot {
    pub index: Index,
    pub term: Term,
    pub snapshot: Box<dyn Snapshot>,
}

/// Runs the FSM on its own thread. All FSM calls happen here, so applies and
/// restores never run concurrently.
pub(crate) struct FsmRunner {
    state: Box<dyn State>,
    snapshots: Arc<dyn SnapshotStore>,
    /// The last applied or restored position.
    last_index: Index,
    last_term: Term,
}

impl FsmRunner {
    pub fn new(state: Box<dyn State>, snapshots: Arc<dyn SnapshotStore>) -> Self {
        Self { state, snapshots, last_index: 0, last_term: 0 }
    }

    /// Processes requests until shutdown.
    pub fn run(
        mut self,
        mutate_rx: Receiver<FsmRequest>,
        snapshot_rx: Receiver<Responder<FsmSnapshot>>,
        shutdown_rx: Receiver<()>,
    ) {
        debug!("Starting FSM runner");
        loop {
            crossbeam::select! {
                recv(mutate_rx) -> request => match request {
                    Ok(FsmRequest::Commit(batch)) => self.apply(batch),
                    Ok(FsmRequest::Restore { id, responder }) => responder.respond(self.restore(&id)),
                    Err(_) => return,
                },
                recv(snapshot_rx) -> responder => match responder {
                    Ok(responder) => responder.respond(self.snapshot()),
                    Err(_) => return,
                },
                recv(shutdown_rx) -> _ => return,
            }
        }
    }

    fn apply(&mut self, batch: Vec<Commit>) {
        if self.state.as_batching().is_some() {
            self.apply_batch(batch)
        } else {
            for commit in batch {
                self.apply_single(commit)
            }
        }
    }

    /// Applies a single entry. Only commands reach the state machine, and
    /// configurations reach its configuration store if it has one.
    fn apply_single(&mut self, commit: Commit) {
        let entry = &commit.entry;
        let result = match entry.kind {
            EntryKind::Command => self.state.apply(entry),
            EntryKind::Configuration => {
                if let Some(store) = self.state.as_configuration_store() {
                    match Configuration::decode(&entry.data) {
                        Ok(configuration) => store.store_configuration(entry.index, configuration),
                        Err(err) => error!("Failed to decode configuration {}: {err}", entry.index),
                    }
                }
                Ok(Vec::new())
            }
            _ => Ok(Vec::new()),
        };
        (self.last_index, self.last_term) = (entry.index, entry.term);
        commit.respond(result);
    }

    /// Applies commands and configurations in a single call to the batching
    /// state machine.
    fn apply_batch(&mut self, batch: Vec<Commit>) {
        let Some(last) = batch.last() else { return };
        let (last_index, last_term) = (last.entry.index, last.entry.term);

        let (applied, other): (Vec<Commit>, Vec<Commit>) = batch.into_iter().partition(|c| {
            matches!(c.entry.kind, EntryKind::Command | EntryKind::Configuration)
        });
        if !applied.is_empty() {
            let entries: Vec<Entry> = applied.iter().map(|c| c.entry.clone()).collect();
            let Some(batching) = self.state.as_batching() else { return };
            let results = batching.apply_batch(&entries);
            if results.len() != applied.len() {
                panic!("batch apply returned {} results, expected {}", results.len(), applied.len());
            }
            for (commit, result) in applied.into_iter().zip(results) {
                commit.respond(result);
            }
        }
        for commit in other {
            commit.respond(Ok(Vec::new()));
        }
        (self.last_index, self.last_term) = (last_index, last_term);
    }

    /// Restores the state machine from a stored snapshot.
    fn restore(&mut self, id: &str) -> Result<()> {
        let (meta, mut reader) = self
            .snapshots
            .open(id)
            .map_err(|err| Error::IO(format!("failed to open snapshot {id}: {err}")))?;
        self.state
            .restore(&mut reader)
            .map_err(|err| Error::IO(format!("failed to restore snapshot {id}: {err}")))?;
        info!("Restored snapshot {id} at index {} term {}", meta.index, meta.term);
        (self.last_index, self.last_term) = (meta.index, meta.term);
        Ok(())
    }

    /// Takes a point-in-time snapshot of the state machine.
    fn snapshot(&mut self) -> Result<FsmSnapshot> {
        if self.last_index == 0 {
            return Err(Error::NothingNewToSnapshot);
        }
        let snapshot = self.state.snapshot()?;
        Ok(FsmSnapshot { index: self.last_index, term: self.last_term, snapshot })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raft::future::Future;
    use crate::raft::state::BatchingState;
    use crate::raft::Server;
    use crate::storage::MemorySnapshots;
    use pretty_assertions::assert_eq;
    use std::io::{Read, Write};

    /// Records applied commands, and the configuration store calls.
    #[derive(Default)]
    struct Recorder {
        commands: Vec<Vec<u8>>,
        configurations: Vec<Index>,
        batching: bool,
    }

    struct RecorderSnapshot(Vec<u8>);

    impl Snapshot for RecorderSnapshot {
        fn persist(&mut self, sink: &mut dyn Write) -> Result<()> {
            Ok(sink.write_all(&self.0)?)
        }
    }

    impl State for Recorder {
        fn apply(&mut self, entry: &Entry) -> Result<Vec<u8>> {
            if entry.data == b"fail" {
                return Err(Error::InvalidInput("fail".into()));
            }
            self.commands.push(entry.data.clone());
            Ok(entry.index.to_be_bytes().to_vec())
        }

        fn snapshot(&mut self) -> Result<Box<dyn Snapshot>> {
            Ok(Box::new(RecorderSnapshot(self.commands.concat())))
        }

        fn restore(&mut self, reader: &mut dyn Read) -> Result<()> {
            let mut data = Vec::new();
            reader.read_to_end(&mut data)?;
            self.commands = vec![data];
            Ok(())
        }

        fn as_batching(&mut self) -> Option<&mut dyn BatchingState> {
            match self.batching {
                true => Some(self),
                false => None,
            }
        }

        fn as_configuration_store(&mut self) -> Option<&mut dyn super::super::ConfigurationStore> {
            Some(self)
        }
    }

    impl BatchingState for Recorder {
        fn apply_batch(&mut self, entries: &[Entry]) -> Vec<Result<Vec<u8>>> {
            entries
                .iter()
                .map(|entry| match entry.kind {
                    EntryKind::Command => self.apply(entry),
                    _ => Ok(Vec::new()),
                })
                .collect()
        }
    }

    impl super::super::ConfigurationStore for Recorder {
        fn store_configuration(&mut self, index: Index, _configuration: Configuration) {
            self.configurations.push(index)
        }
    }

    fn commit(index: Index, kind: EntryKind, data: &[u8]) -> (Commit, Future<Applied>) {
        let (future, responder) = Future::new();
        let entry = Entry { index, term: 1, ..Entry::new(kind, data.to_vec()) };
        (Commit { entry, responder: Some(responder) }, future)
    }

    fn configuration_data() -> Vec<u8> {
        Configuration::new(vec![Server::voter("a", "a")]).encode()
    }

    #[test]
    fn apply_single() {
        apply(false)
    }

    #[test]
    fn apply_batch() {
        apply(true)
    }

    /// Applies a mixed batch, checking each future's resolution.
    fn apply(batching: bool) {
        let state = Recorder { batching, ..Default::default() };
        let mut runner = FsmRunner::new(Box::new(state), Arc::new(MemorySnapshots::new()));

        let (c1, f1) = commit(1, EntryKind::Configuration, &configuration_data());
        let (c2, f2) = commit(2, EntryKind::Command, b"a");
        let (c3, f3) = commit(3, EntryKind::Barrier, b"");
        let (c4, f4) = commit(4, EntryKind::Command, b"fail");
        runner.apply(vec![c1, c2, c3, c4]);

        assert_eq!(f1.wait(), Ok(Applied { index: 1, response: vec![] }));
        assert_eq!(f2.wait(), Ok(Applied { index: 2, response: 2u64.to_be_bytes().to_vec() }));
        assert_eq!(f3.wait(), Ok(Applied { index: 3, response: vec![] }));
        assert_eq!(f4.wait(), Err(Error::InvalidInput("fail".into())));
        assert_eq!((runner.last_index, runner.last_term), (4, 1));
    }

    #[test]
    fn snapshot_and_restore() -> Result<()> {
        let snapshots = Arc::new(MemorySnapshots::new());
        let mut runner = FsmRunner::new(Box::new(Recorder::default()), snapshots.clone());
        assert!(matches!(runner.snapshot(), Err(Error::NothingNewToSnapshot)));

        let (c1, _) = commit(1, EntryKind::Command, b"a");
        let (c2, _) = commit(2, EntryKind::Command, b"b");
        runner.apply(vec![c1, c2]);

        let mut snapshot = runner.snapshot()?;
        assert_eq!((snapshot.index, snapshot.term), (2, 1));
        let mut sink = snapshots.create(1, 2, 1, &Configuration::default(), 0)?;
        snapshot.snapshot.persist(&mut sink)?;
        let id = sink.id().to_string();
        sink.close()?;

        let mut other = FsmRunner::new(Box::new(Recorder::default()), snapshots);
        other.restore(&id)?;
        assert_eq!((other.last_index, other.last_term), (2, 1));
        assert!(other.restore("missing").is_err());
        Ok(())
    }
}
