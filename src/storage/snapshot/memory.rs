use super::{snapshot_id, SnapshotMeta, SnapshotSink, SnapshotStore};
use crate::error::{Error, Result};
use crate::raft::{Configuration, Index, Term};

use std::io::{Cursor, Read, Write};
use std::sync::{Arc, RwLock};

/// An in-memory snapshot store. It retains only the most recent snapshot,
/// and is intended for tests.
#[derive(Clone, Default)]
pub struct MemorySnapshots {
    latest: Arc<RwLock<Option<(SnapshotMeta, Arc<Vec<u8>>)>>>,
}

impl MemorySnapshots {
    /// Creates a new in-memory snapshot store.
    pub fn new() -> Self {
        Self::default()
    }
}

impl SnapshotStore for MemorySnapshots {
    fn create(
        &self,
        version: u8,
        index: Index,
        term: Term,
        configuration: &Configuration,
        configuration_index: Index,
    ) -> Result<Box<dyn SnapshotSink>> {
        let meta = SnapshotMeta {
            version,
            id: snapshot_id(term, index),
            index,
            term,
            peers: Vec::new(),
            configuration: configuration.clone(),
            configuration_index,
            size: 0,
        };
        Ok(Box::new(MemorySink { store: self.clone(), meta, data: Vec::new() }))
    }

    fn list(&self) -> Result<Vec<SnapshotMeta>> {
        Ok(self.latest.read()?.iter().map(|(meta, _)| meta.clone()).collect())
    }

    fn open(&self, id: &str) -> Result<(SnapshotMeta, Box<dyn Read + Send>)> {
        match self.latest.read()?.as_ref() {
            Some((meta, data)) if meta.id == id => {
                Ok((meta.clone(), Box::new(Cursor::new(data.as_ref().clone()))))
            }
            _ => Err(Error::InvalidInput(format!("snapshot {id} not found"))),
        }
    }
}

/// A sink for an in-memory snapshot.
struct MemorySink {
    store: MemorySnapshots,
    meta: SnapshotMeta,
    data: Vec<u8>,
}

impl Write for MemorySink {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.data.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl SnapshotSink for MemorySink {
    fn id(&self) -> &str {
        &self.meta.id
    }

    fn close(self: Box<Self>) -> Result<()> {
        let MemorySink { store, mut meta, data } = *self;
        meta.size = data.len() as u64;
        *store.latest.write()? = Some((meta, Arc::new(data)));
        Ok(())
    }

    fn cancel(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
impl super::TestSuite<MemorySnapshots> for MemorySnapshots {
    fn setup() -> Result<Self> {
        Ok(MemorySnapshots::new())
    }
}

#[test]
fn tests() -> Result<()> {
    use super::TestSuite;
    MemorySnapshots::test()
}
