use super::{snapshot_id, SnapshotMeta, SnapshotSink, SnapshotStore};
use crate::encoding::Value as _;
use crate::error::{Error, Result};
use crate::raft::{Configuration, Index, Term, SNAPSHOT_VERSION_MAX, SNAPSHOT_VERSION_MIN};

use itertools::Itertools as _;
use log::{debug, error, info, warn};
use std::fs;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

/// The suffix of directories holding incomplete snapshots.
const TMP_SUFFIX: &str = ".tmp";

/// The snapshot metadata file name.
const META_FILE: &str = "meta";

/// The snapshot data file name.
const STATE_FILE: &str = "state";

/// A file-based snapshot store. Each snapshot is a directory under the store
/// directory containing a metadata file and a state file. Snapshots are
/// written to a temporary directory which is renamed into place when the sink
/// is closed, so a crash never leaves a partial snapshot visible. Only the
/// `retain` newest snapshots are kept.
pub struct FileSnapshots {
    dir: PathBuf,
    retain: usize,
}

impl FileSnapshots {
    /// Opens or creates a snapshot store in the given directory, retaining
    /// the given number of snapshots.
    pub fn new(dir: PathBuf, retain: usize) -> Result<Self> {
        if retain < 1 {
            return Err(Error::InvalidInput("must retain at least one snapshot".into()));
        }
        fs::create_dir_all(&dir)?;
        let store = Self { dir, retain };
        store.remove_incomplete()?;
        Ok(store)
    }

    /// Removes temporary directories left behind by a crash.
    fn remove_incomplete(&self) -> Result<()> {
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.is_dir() && path.to_string_lossy().ends_with(TMP_SUFFIX) {
                warn!("Removing incomplete snapshot {}", path.display());
                fs::remove_dir_all(&path)?;
            }
        }
        Ok(())
    }

    /// Lists all complete snapshots, newest first, skipping unreadable ones.
    fn list_all(&self) -> Result<Vec<SnapshotMeta>> {
        let mut snapshots = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_string();
            if name.ends_with(TMP_SUFFIX) {
                continue;
            }
            match Self::read_meta(&entry.path()) {
                Ok(meta) if (SNAPSHOT_VERSION_MIN..=SNAPSHOT_VERSION_MAX).contains(&meta.version) => {
                    snapshots.push(meta)
                }
                Ok(meta) => {
                    warn!("Snapshot {name} has unsupported version {}, ignoring", meta.version)
                }
                Err(err) => warn!("Failed to read snapshot {name}: {err}"),
            }
        }
        Ok(snapshots
            .into_iter()
            .sorted_by(|a, b| (b.term, b.index, &b.id).cmp(&(a.term, a.index, &a.id)))
            .collect())
    }

    /// Reads snapshot metadata from a snapshot directory.
    fn read_meta(dir: &Path) -> Result<SnapshotMeta> {
        SnapshotMeta::decode_from(BufReader::new(fs::File::open(dir.join(META_FILE))?))
    }

    /// Removes snapshots beyond the retention limit.
    fn reap(&self) -> Result<()> {
        for meta in self.list_all()?.into_iter().skip(self.retain) {
            info!("Reaping snapshot {}", meta.id);
            fs::remove_dir_all(self.dir.join(&meta.id))?;
        }
        Ok(())
    }
}

impl SnapshotStore for FileSnapshots {
    fn create(
        &self,
        version: u8,
        index: Index,
        term: Term,
        configuration: &Configuration,
        configuration_index: Index,
    ) -> Result<Box<dyn SnapshotSink>> {
        if !(SNAPSHOT_VERSION_MIN..=SNAPSHOT_VERSION_MAX).contains(&version) {
            return Err(Error::InvalidInput(format!("unsupported snapshot version {version}")));
        }
        let id = snapshot_id(term, index);
        let tmp_dir = self.dir.join(format!("{id}{TMP_SUFFIX}"));
        info!("Creating new snapshot at {}", tmp_dir.display());
        fs::create_dir_all(&tmp_dir)?;
        let state = BufWriter::new(fs::File::create(tmp_dir.join(STATE_FILE))?);
        let meta = SnapshotMeta {
            version,
            id,
            index,
            term,
            peers: Vec::new(),
            configuration: configuration.clone(),
            configuration_index,
            size: 0,
        };
        Ok(Box::new(FileSink {
            dir: self.dir.clone(),
            retain: self.retain,
            tmp_dir,
            meta,
            state: Some(state),
        }))
    }

    fn list(&self) -> Result<Vec<SnapshotMeta>> {
        Ok(self.list_all()?.into_iter().take(self.retain).collect())
    }

    fn open(&self, id: &str) -> Result<(SnapshotMeta, Box<dyn Read + Send>)> {
        let dir = self.dir.join(id);
        let meta = Self::read_meta(&dir)?;
        let file = fs::File::open(dir.join(STATE_FILE))?;
        let size = file.metadata()?.len();
        if size != meta.size {
            return Err(Error::InvalidData(format!(
                "snapshot {id} has size {size}, expected {}",
                meta.size
            )));
        }
        debug!("Opened snapshot {id} of {size} bytes");
        Ok((meta, Box::new(BufReader::new(file))))
    }
}

/// A sink writing a snapshot into a temporary directory.
struct FileSink {
    dir: PathBuf,
    retain: usize,
    tmp_dir: PathBuf,
    meta: SnapshotMeta,
    /// The state file writer. None once closed or cancelled.
    state: Option<BufWriter<fs::File>>,
}

impl FileSink {
    /// Finalizes the snapshot: flushes the state, writes the metadata, and
    /// moves the directory into place.
    fn finalize(&mut self) -> Result<()> {
        let Some(state) = self.state.take() else {
            return Err(Error::InvalidInput("snapshot sink already finalized".into()));
        };
        let file = state.into_inner().map_err(|e| Error::IO(e.error().to_string()))?;
        file.sync_all()?;
        self.meta.size = file.metadata()?.len();

        let mut meta_file = BufWriter::new(fs::File::create(self.tmp_dir.join(META_FILE))?);
        self.meta.encode_into(&mut meta_file)?;
        meta_file.flush()?;
        meta_file.get_ref().sync_all()?;

        let final_dir = self.dir.join(&self.meta.id);
        fs::rename(&self.tmp_dir, &final_dir)?;
        // Sync the parent directory so the rename is durable.
        fs::File::open(&self.dir)?.sync_all()?;
        Ok(())
    }

    /// Removes the temporary directory.
    fn discard(&mut self) -> Result<()> {
        self.state = None;
        if self.tmp_dir.exists() {
            fs::remove_dir_all(&self.tmp_dir)?;
        }
        Ok(())
    }
}

impl Write for FileSink {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match self.state.as_mut() {
            Some(state) => state.write(buf),
            None => Err(std::io::Error::other("snapshot sink is closed")),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match self.state.as_mut() {
            Some(state) => state.flush(),
            None => Ok(()),
        }
    }
}

impl SnapshotSink for FileSink {
    fn id(&self) -> &str {
        &self.meta.id
    }

    fn close(mut self: Box<Self>) -> Result<()> {
        if let Err(err) = self.finalize() {
            self.discard()?;
            return Err(err);
        }
        FileSnapshots { dir: self.dir.clone(), retain: self.retain }.reap()
    }

    fn cancel(mut self: Box<Self>) -> Result<()> {
        self.discard()
    }
}

impl Drop for FileSink {
    fn drop(&mut self) {
        if self.state.is_some() {
            if let Err(err) = self.discard() {
                error!("Failed to remove incomplete snapshot {}: {err}", self.tmp_dir.display());
            }
        }
    }
}

#[cfg(test)]
impl super::TestSuite<FileSnapshots> for FileSnapshots {
    fn setup() -> Result<Self> {
        let dir = tempfile::TempDir::with_prefix("replog")?;
        // Keep the directory around for the duration of the test process.
        FileSnapshots::new(dir.into_path(), 3)
    }
}

#[test]
fn tests() -> Result<()> {
    use super::TestSuite;
    FileSnapshots::test()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raft::Server;
    use pretty_assertions::assert_eq;

    fn create(store: &FileSnapshots, index: Index, data: &[u8]) -> Result<String> {
        let configuration = Configuration::new(vec![Server::voter("a", "addr-a")]);
        let mut sink = store.create(1, index, 1, &configuration, 1)?;
        sink.write_all(data)?;
        let id = sink.id().to_string();
        sink.close()?;
        Ok(id)
    }

    /// Only the retained number of snapshots are kept.
    #[test]
    fn retain() -> Result<()> {
        let dir = tempfile::TempDir::with_prefix("replog")?;
        let store = FileSnapshots::new(dir.path().to_path_buf(), 2)?;
        create(&store, 1, b"a")?;
        create(&store, 2, b"b")?;
        create(&store, 3, b"c")?;
        let indexes: Vec<Index> = store.list()?.iter().map(|m| m.index).collect();
        assert_eq!(indexes, vec![3, 2]);
        assert_eq!(fs::read_dir(dir.path())?.count(), 2);
        Ok(())
    }

    /// Snapshots survive reopening, and incomplete ones are removed.
    #[test]
    fn reopen() -> Result<()> {
        let dir = tempfile::TempDir::with_prefix("replog")?;
        let store = FileSnapshots::new(dir.path().to_path_buf(), 2)?;
        let id = create(&store, 5, b"data")?;
        fs::create_dir(dir.path().join(format!("crashed{TMP_SUFFIX}")))?;

        let store = FileSnapshots::new(dir.path().to_path_buf(), 2)?;
        assert_eq!(fs::read_dir(dir.path())?.count(), 1);
        let (meta, mut reader) = store.open(&id)?;
        assert_eq!(meta.size, 4);
        let mut data = String::new();
        reader.read_to_string(&mut data)?;
        assert_eq!(data, "data");
        Ok(())
    }

    /// A snapshot with a truncated state file can't be opened.
    #[test]
    fn open_corrupt() -> Result<()> {
        let dir = tempfile::TempDir::with_prefix("replog")?;
        let store = FileSnapshots::new(dir.path().to_path_buf(), 2)?;
        let id = create(&store, 5, b"data")?;
        fs::write(dir.path().join(&id).join(STATE_FILE), b"da")?;
        assert!(matches!(store.open(&id), Err(Error::InvalidData(_))));
        Ok(())
    }
}
