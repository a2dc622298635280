//! Snapshot stores. A snapshot is a point-in-time copy of the FSM state along
//! with the cluster configuration at the snapshot's log index. It is
//! authoritative for every log index up to and including its own.

mod file;
mod memory;

pub use file::FileSnapshots;
pub use memory::MemorySnapshots;

use crate::encoding;
use crate::error::Result;
use crate::raft::{Configuration, Index, Term};

use serde::{Deserialize, Serialize};
use std::io::{Read, Write};
use std::time::{SystemTime, UNIX_EPOCH};

/// Snapshot metadata.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SnapshotMeta {
    /// The snapshot format version.
    pub version: u8,
    /// The store-assigned snapshot ID.
    pub id: String,
    /// The last log index included in the snapshot.
    pub index: Index,
    /// The term of the last log index included in the snapshot.
    pub term: Term,
    /// Legacy encoded peers, only used by version 0.
    #[serde(with = "serde_bytes")]
    pub peers: Vec<u8>,
    /// The cluster configuration as of the snapshot.
    pub configuration: Configuration,
    /// The log index of the configuration.
    pub configuration_index: Index,
    /// The size of the snapshot data in bytes.
    pub size: u64,
}

impl encoding::Value for SnapshotMeta {}

/// A snapshot store.
pub trait SnapshotStore: Send + Sync {
    /// Begins a new snapshot, returning a sink for the snapshot data.
    fn create(
        &self,
        version: u8,
        index: Index,
        term: Term,
        configuration: &Configuration,
        configuration_index: Index,
    ) -> Result<Box<dyn SnapshotSink>>;

    /// Lists the available snapshots, newest first.
    fn list(&self) -> Result<Vec<SnapshotMeta>>;

    /// Opens a snapshot for reading.
    fn open(&self, id: &str) -> Result<(SnapshotMeta, Box<dyn Read + Send>)>;
}

/// A sink receiving snapshot data. The sink must be finalized with close(),
/// or discarded with cancel() which removes all partial output. Both consume
/// the sink, so only one can be called. Dropping an unfinalized sink behaves
/// like cancel().
pub trait SnapshotSink: Write + Send {
    /// Returns the snapshot ID.
    fn id(&self) -> &str;

    /// Finalizes the snapshot, making it visible to list() and open().
    fn close(self: Box<Self>) -> Result<()>;

    /// Discards the snapshot.
    fn cancel(self: Box<Self>) -> Result<()>;
}

/// Generates a snapshot ID which sorts by term, index and creation time.
pub(crate) fn snapshot_id(term: Term, index: Index) -> String {
    let millis = SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_millis()).unwrap_or(0);
    format!("{term:020}-{index:020}-{millis}")
}

/// Test suite shared by all snapshot store implementations.
#[cfg(test)]
trait TestSuite<S: SnapshotStore> {
    fn setup() -> Result<S>;

    fn test() -> Result<()> {
        Self::test_create_open()?;
        Self::test_cancel()?;
        Self::test_drop()?;
        Ok(())
    }

    fn configuration() -> Configuration {
        Configuration::new(vec![crate::raft::Server::voter("a", "addr-a")])
    }

    fn test_create_open() -> Result<()> {
        let s = Self::setup()?;
        assert!(s.list()?.is_empty());

        let mut sink = s.create(1, 10, 3, &Self::configuration(), 2)?;
        sink.write_all(b"first")?;
        let id = sink.id().to_string();
        sink.close()?;

        let list = s.list()?;
        assert_eq!(list.len(), 1);
        let meta = &list[0];
        assert_eq!(meta.id, id);
        assert_eq!((meta.version, meta.index, meta.term), (1, 10, 3));
        assert_eq!(meta.configuration, Self::configuration());
        assert_eq!(meta.configuration_index, 2);
        assert_eq!(meta.size, 5);

        let (meta, mut reader) = s.open(&id)?;
        assert_eq!(meta.index, 10);
        let mut data = Vec::new();
        reader.read_to_end(&mut data)?;
        assert_eq!(data, b"first");

        // A newer snapshot is listed first.
        let mut sink = s.create(1, 20, 3, &Self::configuration(), 2)?;
        sink.write_all(b"second")?;
        sink.close()?;
        assert_eq!(s.list()?[0].index, 20);
        Ok(())
    }

    fn test_cancel() -> Result<()> {
        let s = Self::setup()?;
        let mut sink = s.create(1, 10, 3, &Self::configuration(), 2)?;
        sink.write_all(b"partial")?;
        let id = sink.id().to_string();
        sink.cancel()?;
        assert!(s.list()?.is_empty());
        assert!(s.open(&id).is_err());
        Ok(())
    }

    fn test_drop() -> Result<()> {
        let s = Self::setup()?;
        let mut sink = s.create(1, 10, 3, &Self::configuration(), 2)?;
        sink.write_all(b"partial")?;
        drop(sink);
        assert!(s.list()?.is_empty());
        Ok(())
    }
}
