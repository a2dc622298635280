use super::{LogStore, StableStore};
use crate::error::Result;
use crate::raft::{Entry, Index};

use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;

/// An in-memory log and stable store. Not durable, so it is only suitable for
/// tests and ephemeral nodes.
#[derive(Default)]
pub struct Memory {
    log: RwLock<BTreeMap<Index, Entry>>,
    stable: RwLock<HashMap<Vec<u8>, Vec<u8>>>,
}

impl Memory {
    /// Creates a new in-memory store.
    pub fn new() -> Self {
        Self::default()
    }
}

impl LogStore for Memory {
    fn first_index(&self) -> Result<Index> {
        Ok(self.log.read()?.keys().next().copied().unwrap_or(0))
    }

    fn last_index(&self) -> Result<Index> {
        Ok(self.log.read()?.keys().next_back().copied().unwrap_or(0))
    }

    fn get_log(&self, index: Index) -> Result<Option<Entry>> {
        Ok(self.log.read()?.get(&index).cloned())
    }

    fn store_logs(&self, entries: &[Entry]) -> Result<()> {
        let mut log = self.log.write()?;
        for entry in entries {
            log.insert(entry.index, entry.clone());
        }
        Ok(())
    }

    fn delete_range(&self, min: Index, max: Index) -> Result<()> {
        if min > max {
            return Ok(());
        }
        let mut log = self.log.write()?;
        let tail = log.split_off(&min);
        log.extend(tail.into_iter().filter(|(index, _)| *index > max));
        Ok(())
    }
}

impl StableStore for Memory {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.stable.read()?.get(key).cloned())
    }

    fn set(&self, key: &[u8], value: Vec<u8>) -> Result<()> {
        self.stable.write()?.insert(key.to_vec(), value);
        Ok(())
    }
}

#[cfg(test)]
impl super::TestSuite<Memory> for Memory {
    fn setup() -> Result<Self> {
        Ok(Memory::new())
    }
}

#[test]
fn tests() -> Result<()> {
    use super::TestSuite;
    Memory::test()
}
