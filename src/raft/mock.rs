//! Recording test doubles for the log's collaborators.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::anyhow;

use crate::raft::log::StateMachine;
use crate::raft::sync::{LogSync, MemorySync};
use crate::rpc::raft::{LogEntry, LogMeta};

pub const WRITE: &str = "write";
pub const WRITE_META: &str = "write_meta";
pub const TRUNC: &str = "trunc";
pub const READ: &str = "read";
pub const READ_FROM: &str = "read_from";
pub const READ_META: &str = "read_meta";
pub const CLOSE: &str = "close";

#[derive(Debug, Default)]
struct SyncState {
    calls: HashMap<&'static str, usize>,
    failing: HashMap<&'static str, String>,
}

/// A `MemorySync` that counts calls per method and can be told to fail any of them.
#[derive(Debug, Clone, Default)]
pub struct MockSync {
    inner: MemorySync,
    state: Arc<Mutex<SyncState>>,
}

impl MockSync {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_state(entries: Vec<LogEntry>, meta: LogMeta) -> Self {
        Self {
            inner: MemorySync::with_state(entries, meta),
            state: Default::default(),
        }
    }

    pub fn use_error(&self, method: &'static str, message: &str) {
        self.state.lock().unwrap().failing.insert(method, message.to_string());
    }

    pub fn reset(&self) {
        let mut state = self.state.lock().unwrap();
        state.failing.clear();
        state.calls.clear();
    }

    pub fn calls(&self, method: &'static str) -> usize {
        self.state.lock().unwrap().calls.get(method).copied().unwrap_or_default()
    }

    fn incr(&self, method: &'static str) -> anyhow::Result<()> {
        let mut state = self.state.lock().unwrap();
        *state.calls.entry(method).or_default() += 1;
        match state.failing.get(method) {
            Some(message) => Err(anyhow!(message.clone())),
            None => Ok(()),
        }
    }
}

impl LogSync for MockSync {
    fn write(&mut self, entries: &[LogEntry]) -> anyhow::Result<()> {
        self.incr(WRITE)?;
        self.inner.write(entries)
    }

    fn write_meta(&mut self, meta: &LogMeta) -> anyhow::Result<()> {
        self.incr(WRITE_META)?;
        self.inner.write_meta(meta)
    }

    fn trunc(&mut self, start_index: u64) -> anyhow::Result<()> {
        self.incr(TRUNC)?;
        self.inner.trunc(start_index)
    }

    fn read(&self, index: u64) -> anyhow::Result<LogEntry> {
        self.incr(READ)?;
        self.inner.read(index)
    }

    fn read_from(&self, index: u64) -> anyhow::Result<Vec<LogEntry>> {
        self.incr(READ_FROM)?;
        self.inner.read_from(index)
    }

    fn read_meta(&self) -> anyhow::Result<LogMeta> {
        self.incr(READ_META)?;
        self.inner.read_meta()
    }

    fn close(&mut self) -> anyhow::Result<()> {
        self.incr(CLOSE)?;
        self.inner.close()
    }
}

#[derive(Debug, Default)]
struct Applied {
    committed: Vec<u64>,
    dropped: Vec<u64>,
    fail_commit_at: Option<u64>,
}

/// Records the indices passed to `commit_entry` and `drop_entry`.
#[derive(Debug, Clone, Default)]
pub struct MockStateMachine {
    applied: Arc<Mutex<Applied>>,
}

impl MockStateMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_commit_at(&self, index: Option<u64>) {
        self.applied.lock().unwrap().fail_commit_at = index;
    }

    pub fn committed(&self) -> Vec<u64> {
        self.applied.lock().unwrap().committed.clone()
    }

    pub fn dropped(&self) -> Vec<u64> {
        self.applied.lock().unwrap().dropped.clone()
    }
}

impl StateMachine for MockStateMachine {
    fn commit_entry(&mut self, entry: &LogEntry) -> anyhow::Result<()> {
        let mut applied = self.applied.lock().unwrap();
        if applied.fail_commit_at == Some(entry.index) {
            return Err(anyhow!("could not apply entry {}", entry.index));
        }
        applied.committed.push(entry.index);
        Ok(())
    }

    fn drop_entry(&mut self, entry: &LogEntry) -> anyhow::Result<()> {
        self.applied.lock().unwrap().dropped.push(entry.index);
        Ok(())
    }
}
