use super::{LogStore, StableStore};
use crate::encoding::{self, Value as _};
use crate::error::{Error, Result};
use crate::raft::{Entry, Index};

use fs2::FileExt as _;
use log::{error, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::io::{BufReader, BufWriter, Read, Seek as _, SeekFrom, Write};
use std::path::PathBuf;
use std::sync::Mutex;

/// A durable log and stable store, backed by a single append-only file.
///
/// The file contains a sequence of records, each length-prefixed with a
/// big-endian u32 and encoded with Bincode. A record either stores a log
/// entry, deletes a range of log entries, or sets a stable key. Records are
/// never modified in place: overwritten and deleted data becomes garbage,
/// which is removed by compaction when the store is opened.
///
/// An index of entry positions is kept in memory, along with the (small) set
/// of stable keys. Both are rebuilt on startup by replaying the file. A torn
/// record at the end of the file, left by a crash during a write, is
/// truncated away.
///
/// The file is exclusively locked while open.
pub struct File {
    inner: Mutex<Inner>,
}

struct Inner {
    /// The path to the file.
    path: PathBuf,
    /// The append-only file.
    file: std::fs::File,
    /// Index of entry positions and record sizes in the file.
    index: BTreeMap<Index, (u64, u32)>,
    /// Stable key/value pairs, with their record sizes.
    stable: HashMap<Vec<u8>, (Vec<u8>, u32)>,
    /// Number of bytes of garbage in the file.
    garbage: u64,
    /// If true, fsync writes.
    sync: bool,
}

/// A file record.
#[derive(Debug, Serialize, Deserialize)]
enum Record {
    /// A log entry.
    Entry(Entry),
    /// Deletes log entries in the inclusive range.
    DeleteRange(Index, Index),
    /// Sets a stable key.
    Set(#[serde(with = "serde_bytes")] Vec<u8>, #[serde(with = "serde_bytes")] Vec<u8>),
}

impl encoding::Value for Record {}

/// Wraps the file in a writer for appends.
type Writer = for<'a> fn(&'a mut std::fs::File) -> Box<dyn Write + 'a>;

fn buffered(file: &mut std::fs::File) -> Box<dyn Write + '_> {
    Box::new(BufWriter::new(file))
}

impl File {
    /// Opens or creates a store at the given path. If sync is true, writes
    /// are fsynced before returning.
    pub fn new(path: PathBuf, sync: bool) -> Result<Self> {
        info!("Opening log store {}", path.display());
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;
        file.try_lock_exclusive()?;
        let mut inner = Inner {
            path,
            file,
            index: BTreeMap::new(),
            stable: HashMap::new(),
            garbage: 0,
            sync,
        };
        inner.replay()?;
        Ok(Self { inner: Mutex::new(inner) })
    }

    /// Opens a store, and compacts it if the garbage ratio exceeds the given
    /// threshold.
    pub fn new_compact(path: PathBuf, sync: bool, garbage_ratio_threshold: f64) -> Result<Self> {
        let store = Self::new(path, sync)?;
        {
            let mut inner = store.inner.lock()?;
            let size = inner.file.metadata()?.len();
            let ratio = if size > 0 { inner.garbage as f64 / size as f64 } else { 0.0 };
            if ratio >= garbage_ratio_threshold {
                info!(
                    "Compacting {} to remove {:.0}% garbage",
                    inner.path.display(),
                    ratio * 100.0
                );
                inner.compact()?;
            }
        }
        Ok(store)
    }
}

impl Inner {
    /// Replays the file, building the in-memory index and stable keys.
    fn replay(&mut self) -> Result<()> {
        let size = self.file.metadata()?.len();
        let mut reader = BufReader::new(&mut self.file);
        reader.seek(SeekFrom::Start(0))?;
        let mut pos = 0;
        let mut len_buf = [0; 4];
        while pos < size {
            let result = reader.read_exact(&mut len_buf).and_then(|_| {
                let len = u32::from_be_bytes(len_buf);
                let mut buf = vec![0; len as usize];
                reader.read_exact(&mut buf)?;
                Ok((len, buf))
            });
            let (len, buf) = match result {
                Ok(r) => r,
                Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => {
                    warn!("Found incomplete record at offset {pos}, truncating file");
                    break;
                }
                Err(err) => return Err(err.into()),
            };
            let record = Record::decode(&buf).map_err(|err| {
                Error::InvalidData(format!(
                    "corrupt record at offset {pos} in {}: {err}",
                    self.path.display()
                ))
            })?;
            match record {
                Record::Entry(entry) => {
                    if let Some((_, old)) = self.index.insert(entry.index, (pos + 4, len)) {
                        self.garbage += 4 + old as u64;
                    }
                }
                Record::DeleteRange(min, max) => {
                    self.garbage += 4 + len as u64;
                    self.garbage += Self::remove_range(&mut self.index, min, max);
                }
                Record::Set(key, value) => {
                    if let Some((_, old)) = self.stable.insert(key, (value, len)) {
                        self.garbage += 4 + old as u64;
                    }
                }
            }
            pos += 4 + len as u64;
        }
        drop(reader);
        if pos < size {
            self.file.set_len(pos)?;
            self.file.sync_all()?;
        }
        Ok(())
    }

    /// Removes an index range, returning the number of garbage bytes.
    fn remove_range(index: &mut BTreeMap<Index, (u64, u32)>, min: Index, max: Index) -> u64 {
        if min > max {
            return 0;
        }
        let mut tail = index.split_off(&min);
        let mut rest = tail.split_off(&(max.saturating_add(1)));
        let garbage = tail.values().map(|(_, len)| 4 + *len as u64).sum();
        index.append(&mut rest);
        garbage
    }

    /// Appends records to the file, returning their positions and sizes.
    fn write(&mut self, records: &[Record]) -> Result<Vec<(u64, u32)>> {
        self.write_with(records, buffered)
    }

    /// Appends records through the given writer. A failed write is truncated
    /// away, so that later records never follow a torn one.
    fn write_with(&mut self, records: &[Record], writer: Writer) -> Result<Vec<(u64, u32)>> {
        let start = self.file.seek(SeekFrom::End(0))?;
        let result = Self::append(writer(&mut self.file), start, records).and_then(|locations| {
            if self.sync {
                self.file.sync_data()?;
            }
            Ok(locations)
        });
        if result.is_err() {
            if let Err(err) = self.file.set_len(start) {
                error!("Failed to truncate {} after failed write: {err}", self.path.display());
            }
        }
        result
    }

    /// Writes length-prefixed records starting at the given file position.
    fn append(
        mut writer: Box<dyn Write + '_>,
        mut pos: u64,
        records: &[Record],
    ) -> Result<Vec<(u64, u32)>> {
        let mut locations = Vec::with_capacity(records.len());
        for record in records {
            let bytes = record.encode();
            let len = u32::try_from(bytes.len())
                .map_err(|_| Error::InvalidInput(format!("record too large: {}", bytes.len())))?;
            writer.write_all(&len.to_be_bytes())?;
            writer.write_all(&bytes)?;
            locations.push((pos + 4, len));
            pos += 4 + len as u64;
        }
        writer.flush()?;
        Ok(locations)
    }

    /// Reads the record at the given position.
    fn read(&mut self, pos: u64, len: u32) -> Result<Record> {
        let mut buf = vec![0; len as usize];
        self.file.seek(SeekFrom::Start(pos))?;
        self.file.read_exact(&mut buf)?;
        Record::decode(&buf)
    }

    /// Rewrites the file with only live records, replacing it atomically.
    fn compact(&mut self) -> Result<()> {
        let mut tmp_path = self.path.clone();
        tmp_path.set_extension("new");

        let mut records = Vec::with_capacity(self.index.len() + self.stable.len());
        for (pos, len) in self.index.values().copied().collect::<Vec<_>>() {
            records.push(self.read(pos, len)?);
        }
        for (key, (value, _)) in &self.stable {
            records.push(Record::Set(key.clone(), value.clone()));
        }

        let mut tmp = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp_path)?;
        {
            let mut writer = BufWriter::new(&mut tmp);
            for record in &records {
                let bytes = record.encode();
                writer.write_all(&(bytes.len() as u32).to_be_bytes())?;
                writer.write_all(&bytes)?;
            }
            writer.flush()?;
        }
        tmp.sync_all()?;
        tmp.try_lock_exclusive()?;
        std::fs::rename(&tmp_path, &self.path)?;

        self.file = tmp;
        self.index.clear();
        self.stable.clear();
        self.garbage = 0;
        self.replay()
    }
}

impl LogStore for File {
    fn first_index(&self) -> Result<Index> {
        Ok(self.inner.lock()?.index.keys().next().copied().unwrap_or(0))
    }

    fn last_index(&self) -> Result<Index> {
        Ok(self.inner.lock()?.index.keys().next_back().copied().unwrap_or(0))
    }

    fn get_log(&self, index: Index) -> Result<Option<Entry>> {
        let mut inner = self.inner.lock()?;
        let Some((pos, len)) = inner.index.get(&index).copied() else {
            return Ok(None);
        };
        match inner.read(pos, len)? {
            Record::Entry(entry) => Ok(Some(entry)),
            record => Err(Error::InvalidData(format!("expected entry at {pos}, got {record:?}"))),
        }
    }

    fn store_logs(&self, entries: &[Entry]) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let mut inner = self.inner.lock()?;
        let records: Vec<Record> = entries.iter().cloned().map(Record::Entry).collect();
        let locations = inner.write(&records)?;
        for (entry, location) in entries.iter().zip(locations) {
            if let Some((_, old)) = inner.index.insert(entry.index, location) {
                inner.garbage += 4 + old as u64;
            }
        }
        Ok(())
    }

    fn delete_range(&self, min: Index, max: Index) -> Result<()> {
        let mut inner = self.inner.lock()?;
        if min > max || inner.index.range(min..=max).next().is_none() {
            return Ok(());
        }
        let locations = inner.write(&[Record::DeleteRange(min, max)])?;
        let garbage = Inner::remove_range(&mut inner.index, min, max);
        inner.garbage += garbage + locations.iter().map(|(_, len)| 4 + *len as u64).sum::<u64>();
        Ok(())
    }
}

impl StableStore for File {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.inner.lock()?.stable.get(key).map(|(value, _)| value.clone()))
    }

    fn set(&self, key: &[u8], value: Vec<u8>) -> Result<()> {
        let mut inner = self.inner.lock()?;
        let locations = inner.write(&[Record::Set(key.to_vec(), value.clone())])?;
        let (_, len) = locations[0];
        if let Some((_, old)) = inner.stable.insert(key.to_vec(), (value, len)) {
            inner.garbage += 4 + old as u64;
        }
        Ok(())
    }
}

#[cfg(test)]
impl super::TestSuite<File> for File {
    fn setup() -> Result<Self> {
        let dir = tempfile::TempDir::with_prefix("replog")?;
        // The file remains open and locked after the directory is removed.
        File::new(dir.path().join("log"), false)
    }
}

#[test]
fn tests() -> Result<()> {
    use super::TestSuite;
    File::test()
}
