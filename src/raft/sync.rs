use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{anyhow, bail, Context};
use prost::Message;
use tracing::debug;

use crate::raft::log::NULL_ENTRY;
use crate::rpc::raft::{LogEntry, LogMeta};

/// Durable storage for the log. Every mutation of a [`crate::raft::log::Log`] is
/// written through its sync before the mutation is reported as successful.
///
/// `read_from(0)` returns the log starting with the null entry at index 0, and
/// `read_meta` on an empty store returns a default meta record.
pub trait LogSync: Send {
    /// Stores `entries`, replacing any stored entry at or after the first index written.
    fn write(&mut self, entries: &[LogEntry]) -> anyhow::Result<()>;
    fn write_meta(&mut self, meta: &LogMeta) -> anyhow::Result<()>;
    /// Removes every entry with an index greater than or equal to `start_index`.
    fn trunc(&mut self, start_index: u64) -> anyhow::Result<()>;
    fn read(&self, index: u64) -> anyhow::Result<LogEntry>;
    fn read_from(&self, index: u64) -> anyhow::Result<Vec<LogEntry>>;
    fn read_meta(&self) -> anyhow::Result<LogMeta>;
    fn close(&mut self) -> anyhow::Result<()>;
}

#[derive(Debug, Default)]
struct MemoryStore {
    entries: Vec<LogEntry>,
    meta: Option<LogMeta>,
}

/// Keeps the log in process memory. Clones share the same store, so a log can be
/// reloaded from a clone to simulate a restart.
#[derive(Debug, Clone, Default)]
pub struct MemorySync {
    store: Arc<Mutex<MemoryStore>>,
}

impl MemorySync {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a store that already holds the given entries and meta record.
    pub fn with_state(entries: Vec<LogEntry>, meta: LogMeta) -> Self {
        let entries = entries.into_iter().filter(|e| e.index > 0).collect();
        Self {
            store: Arc::new(Mutex::new(MemoryStore {
                entries,
                meta: Some(meta),
            })),
        }
    }

    fn lock(&self) -> anyhow::Result<MutexGuard<'_, MemoryStore>> {
        self.store.lock().map_err(|_| anyhow!("memory sync lock poisoned"))
    }
}

impl LogSync for MemorySync {
    fn write(&mut self, entries: &[LogEntry]) -> anyhow::Result<()> {
        let mut store = self.lock()?;
        if let Some(first) = entries.first() {
            store.entries.retain(|e| e.index < first.index);
        }
        store.entries.extend_from_slice(entries);
        Ok(())
    }

    fn write_meta(&mut self, meta: &LogMeta) -> anyhow::Result<()> {
        self.lock()?.meta = Some(meta.clone());
        Ok(())
    }

    fn trunc(&mut self, start_index: u64) -> anyhow::Result<()> {
        self.lock()?.entries.retain(|e| e.index < start_index);
        Ok(())
    }

    fn read(&self, index: u64) -> anyhow::Result<LogEntry> {
        if index == 0 {
            return Ok(NULL_ENTRY);
        }
        self.lock()?
            .entries
            .iter()
            .find(|e| e.index == index)
            .cloned()
            .ok_or_else(|| anyhow!("could not find entry at index {index}"))
    }

    fn read_from(&self, index: u64) -> anyhow::Result<Vec<LogEntry>> {
        let store = self.lock()?;
        let mut entries = Vec::with_capacity(store.entries.len() + 1);
        if index == 0 {
            entries.push(NULL_ENTRY);
        }
        entries.extend(store.entries.iter().filter(|e| e.index >= index).cloned());
        Ok(entries)
    }

    fn read_meta(&self) -> anyhow::Result<LogMeta> {
        Ok(self.lock()?.meta.clone().unwrap_or_default())
    }

    fn close(&mut self) -> anyhow::Result<()> {
        Ok(())
    }
}

const ENTRIES_FILE: &str = "entries.log";
const META_FILE: &str = "meta.pb";

/// Stores the log in a directory: entries as length-delimited protobuf records in
/// `entries.log`, and the meta record in `meta.pb`.
#[derive(Debug)]
pub struct FileSync {
    dir: PathBuf,
    closed: bool,
}

impl FileSync {
    /// Opens (creating if needed) a log directory.
    pub fn open<P: AsRef<Path>>(dir: P) -> anyhow::Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir).with_context(|| format!("could not create log directory {}", dir.display()))?;
        debug!(dir = %dir.display(), "opened file sync");
        Ok(Self { dir, closed: false })
    }

    fn entries_path(&self) -> PathBuf {
        self.dir.join(ENTRIES_FILE)
    }

    fn meta_path(&self) -> PathBuf {
        self.dir.join(META_FILE)
    }

    fn check_open(&self) -> anyhow::Result<()> {
        if self.closed {
            bail!("file sync at {} is closed", self.dir.display());
        }
        Ok(())
    }

    fn read_all(&self) -> anyhow::Result<Vec<LogEntry>> {
        let path = self.entries_path();
        if !path.exists() {
            return Ok(Vec::new());
        }

        let data = fs::read(&path).with_context(|| format!("could not read {}", path.display()))?;
        let mut buf: &[u8] = &data;
        let mut entries = Vec::new();
        while !buf.is_empty() {
            let entry = LogEntry::decode_length_delimited(&mut buf).context("could not decode log entry")?;
            entries.push(entry);
        }
        Ok(entries)
    }

    /// Replaces `path` atomically by writing to a sibling file and renaming it.
    fn replace(path: &Path, data: &[u8]) -> anyhow::Result<()> {
        let tmp = path.with_extension("tmp");
        let mut file = File::create(&tmp).with_context(|| format!("could not create {}", tmp.display()))?;
        file.write_all(data)?;
        file.sync_all()?;
        fs::rename(&tmp, path).with_context(|| format!("could not replace {}", path.display()))?;
        Ok(())
    }
}

impl LogSync for FileSync {
    fn write(&mut self, entries: &[LogEntry]) -> anyhow::Result<()> {
        self.check_open()?;
        let Some(first) = entries.first() else {
            return Ok(());
        };

        let existing = self.read_all()?;
        if existing.iter().any(|e| e.index >= first.index) {
            debug!(index = first.index, "overwriting entries on disk");
            let mut buf = Vec::new();
            for entry in existing.iter().filter(|e| e.index < first.index).chain(entries) {
                entry.encode_length_delimited(&mut buf)?;
            }
            return Self::replace(&self.entries_path(), &buf);
        }

        let mut buf = Vec::new();
        for entry in entries {
            entry.encode_length_delimited(&mut buf)?;
        }

        let path = self.entries_path();
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("could not open {}", path.display()))?;
        file.write_all(&buf)?;
        file.sync_data()?;
        Ok(())
    }

    fn write_meta(&mut self, meta: &LogMeta) -> anyhow::Result<()> {
        self.check_open()?;
        Self::replace(&self.meta_path(), &meta.encode_to_vec())
    }

    fn trunc(&mut self, start_index: u64) -> anyhow::Result<()> {
        self.check_open()?;
        let mut buf = Vec::new();
        for entry in self.read_all()?.iter().filter(|e| e.index < start_index) {
            entry.encode_length_delimited(&mut buf)?;
        }
        Self::replace(&self.entries_path(), &buf)
    }

    fn read(&self, index: u64) -> anyhow::Result<LogEntry> {
        if index == 0 {
            return Ok(NULL_ENTRY);
        }
        self.read_all()?
            .into_iter()
            .find(|e| e.index == index)
            .ok_or_else(|| anyhow!("could not find entry at index {index}"))
    }

    fn read_from(&self, index: u64) -> anyhow::Result<Vec<LogEntry>> {
        let mut entries = Vec::new();
        if index == 0 {
            entries.push(NULL_ENTRY);
        }
        entries.extend(self.read_all()?.into_iter().filter(|e| e.index >= index));
        Ok(entries)
    }

    fn read_meta(&self) -> anyhow::Result<LogMeta> {
        let path = self.meta_path();
        if !path.exists() {
            return Ok(LogMeta::default());
        }
        let data = fs::read(&path).with_context(|| format!("could not read {}", path.display()))?;
        LogMeta::decode(data.as_slice()).context("could not decode log meta")
    }

    fn close(&mut self) -> anyhow::Result<()> {
        self.closed = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use tempfile::tempdir;
    use test_log::test;

    use super::*;

    fn entry(index: u64, term: u64) -> LogEntry {
        LogEntry {
            index,
            term,
            key: b"cmd".to_vec(),
            value: format!("value-{index}").into_bytes(),
        }
    }

    fn exercise(sync: &mut dyn LogSync) {
        assert_eq!(sync.read_meta().unwrap(), LogMeta::default());
        assert_eq!(sync.read_from(0).unwrap(), vec![NULL_ENTRY]);

        sync.write(&[entry(1, 1), entry(2, 1)]).unwrap();
        sync.write(&[entry(3, 2)]).unwrap();
        assert_eq!(sync.read(0).unwrap(), NULL_ENTRY);
        assert_eq!(sync.read(2).unwrap(), entry(2, 1));
        assert!(sync.read(4).is_err());
        assert_eq!(sync.read_from(2).unwrap(), vec![entry(2, 1), entry(3, 2)]);
        assert_eq!(sync.read_from(0).unwrap().len(), 4);

        // Rewriting from an earlier index replaces the tail.
        sync.write(&[entry(2, 3)]).unwrap();
        assert_eq!(sync.read_from(0).unwrap(), vec![NULL_ENTRY, entry(1, 1), entry(2, 3)]);
        sync.write(&[entry(3, 3)]).unwrap();
        assert_eq!(sync.read_from(2).unwrap(), vec![entry(2, 3), entry(3, 3)]);

        sync.trunc(2).unwrap();
        assert_eq!(sync.read_from(0).unwrap(), vec![NULL_ENTRY, entry(1, 1)]);

        let meta = LogMeta {
            last_applied: 1,
            commit_index: 1,
            length: 1,
            ..Default::default()
        };
        sync.write_meta(&meta).unwrap();
        assert_eq!(sync.read_meta().unwrap(), meta);
        sync.close().unwrap();
    }

    #[test]
    fn test_memory_sync() {
        let mut sync = MemorySync::new();
        exercise(&mut sync);
    }

    #[test]
    fn test_memory_sync_clones_share_state() {
        let mut sync = MemorySync::new();
        let other = sync.clone();
        sync.write(&[entry(1, 1)]).unwrap();
        assert_eq!(other.read(1).unwrap(), entry(1, 1));
    }

    #[test]
    fn test_file_sync() {
        let dir = tempdir().unwrap();
        let mut sync = FileSync::open(dir.path().join("log")).unwrap();
        exercise(&mut sync);
        assert!(sync.write(&[entry(2, 1)]).is_err(), "closed sync should reject writes");

        let reopened = FileSync::open(dir.path().join("log")).unwrap();
        assert_eq!(reopened.read_from(1).unwrap(), vec![entry(1, 1)]);
        assert_eq!(reopened.read_meta().unwrap().commit_index, 1);
    }

    #[test]
    fn test_file_sync_overwrite_keeps_log_loadable() {
        let dir = tempdir().unwrap();
        let mut sync = FileSync::open(dir.path()).unwrap();
        sync.write(&[entry(1, 1), entry(2, 1), entry(3, 1)]).unwrap();

        // The entries after 1 were never truncated, so the write must replace them.
        sync.write(&[entry(2, 2)]).unwrap();
        assert_eq!(sync.read_from(1).unwrap(), vec![entry(1, 1), entry(2, 2)]);

        let log = crate::raft::log::Log::builder().sync(Box::new(sync)).load().unwrap();
        assert_eq!(log.last_applied(), 2);
        assert_eq!(log.last_term(), 2);
    }
}
