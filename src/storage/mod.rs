//! Storage backends consumed by the Raft node: the log store holding
//! replicated entries, the stable store holding the current term and vote,
//! and the snapshot store holding FSM snapshots.

mod file;
mod memory;
pub mod snapshot;

pub use file::File;
pub use memory::Memory;
pub use snapshot::{FileSnapshots, MemorySnapshots, SnapshotMeta, SnapshotSink, SnapshotStore};

use crate::error::Result;
use crate::raft::{Entry, Index};

/// A log store. Entry indexes are 1-based, and 0 means no entry. The store is
/// shared between the node's threads, so implementations use interior
/// locking.
pub trait LogStore: Send + Sync {
    /// Returns the first index written, or 0 if the log is empty.
    fn first_index(&self) -> Result<Index>;

    /// Returns the last index written, or 0 if the log is empty.
    fn last_index(&self) -> Result<Index>;

    /// Fetches a log entry, if it exists.
    fn get_log(&self, index: Index) -> Result<Option<Entry>>;

    /// Stores a single log entry.
    fn store_log(&self, entry: &Entry) -> Result<()> {
        self.store_logs(std::slice::from_ref(entry))
    }

    /// Stores multiple log entries durably, replacing any existing entries at
    /// the same indexes.
    fn store_logs(&self, entries: &[Entry]) -> Result<()>;

    /// Deletes the entries in the inclusive index range.
    fn delete_range(&self, min: Index, max: Index) -> Result<()>;

    /// Returns true if the store can't represent gaps in the log, in which case
    /// installing a snapshot removes all entries instead of compacting.
    fn is_monotonic(&self) -> bool {
        false
    }
}

/// A stable key/value store for Raft metadata (current term and vote).
/// Missing keys are returned as None.
pub trait StableStore: Send + Sync {
    /// Gets a value.
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>>;

    /// Sets a value durably.
    fn set(&self, key: &[u8], value: Vec<u8>) -> Result<()>;

    /// Gets a u64 value.
    fn get_u64(&self, key: &[u8]) -> Result<Option<u64>> {
        match self.get(key)? {
            Some(bytes) => {
                let bytes: [u8; 8] = bytes.as_slice().try_into().map_err(|_| {
                    crate::error::Error::InvalidData(format!("invalid u64 value {bytes:?}"))
                })?;
                Ok(Some(u64::from_be_bytes(bytes)))
            }
            None => Ok(None),
        }
    }

    /// Sets a u64 value durably.
    fn set_u64(&self, key: &[u8], value: u64) -> Result<()> {
        self.set(key, value.to_be_bytes().to_vec())
    }
}

#[cfg(test)]
use crate::raft::EntryKind;

/// Test suite shared by all log and stable store implementations.
#[cfg(test)]
trait TestSuite<S: LogStore + StableStore> {
    fn setup() -> Result<S>;

    fn test() -> Result<()> {
        Self::test_empty()?;
        Self::test_store_get()?;
        Self::test_overwrite()?;
        Self::test_delete_range()?;
        Self::test_stable()?;
        Ok(())
    }

    fn entry(index: Index, term: u64) -> Entry {
        Entry { index, term, ..Entry::new(EntryKind::Command, vec![index as u8]) }
    }

    fn test_empty() -> Result<()> {
        let s = Self::setup()?;
        assert_eq!(0, s.first_index()?);
        assert_eq!(0, s.last_index()?);
        assert_eq!(None, s.get_log(1)?);
        Ok(())
    }

    fn test_store_get() -> Result<()> {
        let s = Self::setup()?;
        s.store_log(&Self::entry(1, 1))?;
        s.store_logs(&[Self::entry(2, 1), Self::entry(3, 2)])?;
        assert_eq!(1, s.first_index()?);
        assert_eq!(3, s.last_index()?);
        assert_eq!(Some(Self::entry(2, 1)), s.get_log(2)?);
        assert_eq!(Some(Self::entry(3, 2)), s.get_log(3)?);
        assert_eq!(None, s.get_log(0)?);
        assert_eq!(None, s.get_log(4)?);
        Ok(())
    }

    fn test_overwrite() -> Result<()> {
        let s = Self::setup()?;
        s.store_logs(&[Self::entry(1, 1), Self::entry(2, 1)])?;
        s.store_log(&Self::entry(2, 3))?;
        assert_eq!(Some(Self::entry(2, 3)), s.get_log(2)?);
        assert_eq!(2, s.last_index()?);
        Ok(())
    }

    fn test_delete_range() -> Result<()> {
        let s = Self::setup()?;
        s.store_logs(&(1..=5).map(|i| Self::entry(i, 1)).collect::<Vec<_>>())?;

        // Compact a prefix.
        s.delete_range(1, 2)?;
        assert_eq!(3, s.first_index()?);
        assert_eq!(5, s.last_index()?);
        assert_eq!(None, s.get_log(2)?);

        // Truncate a suffix.
        s.delete_range(4, 5)?;
        assert_eq!(3, s.first_index()?);
        assert_eq!(3, s.last_index()?);

        // Ranges beyond the log are fine.
        s.delete_range(10, 20)?;
        assert_eq!(3, s.last_index()?);

        // Deleting everything empties the log.
        s.delete_range(0, 3)?;
        assert_eq!(0, s.first_index()?);
        assert_eq!(0, s.last_index()?);
        Ok(())
    }

    fn test_stable() -> Result<()> {
        let s = Self::setup()?;
        assert_eq!(None, s.get(b"a")?);
        s.set(b"a", vec![0x01])?;
        assert_eq!(Some(vec![0x01]), s.get(b"a")?);

        assert_eq!(None, s.get_u64(b"term")?);
        s.set_u64(b"term", 7)?;
        assert_eq!(Some(7), s.get_u64(b"term")?);
        s.set_u64(b"term", 8)?;
        assert_eq!(Some(8), s.get_u64(b"term")?);
        Ok(())
    }
}
