use std::fmt;
use std::time::SystemTime;

use anyhow::Context;
use tracing::{debug, info, trace, warn};

use crate::errors::LogError;
use crate::raft::sync::LogSync;
use crate::rpc::raft::{LogEntry, LogMeta};

/// Sits at index 0 of every log and represents the state before the first command.
pub const NULL_ENTRY: LogEntry = LogEntry {
    index: 0,
    term: 0,
    key: Vec::new(),
    value: Vec::new(),
};

/// The application that consumes the log. Entries are handed over once they are
/// committed, and handed back when an uncommitted entry is dropped by a truncation.
///
/// A commit that fails part way is not rolled back, and retrying it hands the earlier
/// entries over again, so `commit_entry` must be idempotent.
pub trait StateMachine: Send {
    fn commit_entry(&mut self, entry: &LogEntry) -> anyhow::Result<()>;
    fn drop_entry(&mut self, entry: &LogEntry) -> anyhow::Result<()>;
}

/// The sequence of commands applied to the state machine, kept in memory and written
/// through to an optional [`LogSync`] on every mutation.
///
/// The log guarantees that entries are contiguous in index and non-decreasing in term,
/// and that committed entries are never truncated. It is not thread-safe: it is owned
/// and mutated by a single replica.
pub struct Log {
    sm: Option<Box<dyn StateMachine>>,
    sync: Option<Box<dyn LogSync>>,
    last_applied: u64,
    commit_index: u64,
    length: u64,
    term: u64,
    voted_for: u32,
    entries: Vec<LogEntry>,
    created: SystemTime,
    modified: SystemTime,
    snapshot: Option<SystemTime>,
}

#[derive(Default)]
pub struct LogBuilder {
    sm: Option<Box<dyn StateMachine>>,
    sync: Option<Box<dyn LogSync>>,
}

impl LogBuilder {
    pub fn state_machine(mut self, sm: Box<dyn StateMachine>) -> Self {
        self.sm = Some(sm);
        self
    }

    pub fn sync(mut self, sync: Box<dyn LogSync>) -> Self {
        self.sync = Some(sync);
        self
    }

    /// Creates an empty log holding only the null entry.
    pub fn build(self) -> Log {
        let now = SystemTime::now();
        Log {
            sm: self.sm,
            sync: self.sync,
            last_applied: 0,
            commit_index: 0,
            length: 0,
            term: 0,
            voted_for: 0,
            entries: vec![NULL_ENTRY],
            created: now,
            modified: now,
            snapshot: None,
        }
    }

    /// Reconstructs a log from its sync. Fails with [`LogError::SyncRequired`] if no
    /// sync was given.
    ///
    /// The entries read back are authoritative: if the meta record lags behind them
    /// (the entries were written but the meta write failed), the indices are recomputed
    /// from the entries.
    pub fn load(self) -> Result<Log, LogError> {
        let mut log = self.build();
        let sync = log.sync.as_ref().ok_or(LogError::SyncRequired)?;

        let meta = sync.read_meta().context("could not read meta").map_err(LogError::Sync)?;
        let mut entries = sync.read_from(0).context("could not read entries").map_err(LogError::Sync)?;
        if entries.first().map_or(true, |e| e.index != 0) {
            entries.insert(0, NULL_ENTRY);
        }

        if let Some((pos, _)) = entries.iter().enumerate().find(|(pos, e)| e.index != *pos as u64) {
            return Err(LogError::Sync(anyhow::anyhow!("log on disk is not contiguous at position {pos}")));
        }

        let last_applied = entries.len() as u64 - 1;
        if last_applied != meta.last_applied {
            warn!(
                meta_last_applied = meta.last_applied,
                last_applied, "log meta does not match entries on disk"
            );
        }

        log.entries = entries;
        log.last_applied = last_applied;
        log.length = last_applied;
        log.commit_index = meta.commit_index.min(last_applied);
        log.term = meta.term.max(log.last_term());
        if log.term == meta.term {
            log.voted_for = meta.voted_for;
        }
        if let Some(created) = meta.created.and_then(|ts| SystemTime::try_from(ts).ok()) {
            log.created = created;
        }
        if let Some(modified) = meta.modified.and_then(|ts| SystemTime::try_from(ts).ok()) {
            log.modified = modified;
        }
        log.snapshot = meta.snapshot.and_then(|ts| SystemTime::try_from(ts).ok());

        info!(
            log_length = log.length,
            last_applied = log.last_applied,
            commit_index = log.commit_index,
            term = log.term,
            "raft log loaded from disk"
        );
        Ok(log)
    }
}

impl Log {
    pub fn builder() -> LogBuilder {
        LogBuilder::default()
    }

    /// An empty log without a state machine or sync.
    pub fn new() -> Self {
        Self::builder().build()
    }

    // Index management

    /// The index of the last entry in the log.
    pub fn last_applied(&self) -> u64 {
        self.last_applied
    }

    pub fn commit_index(&self) -> u64 {
        self.commit_index
    }

    pub fn last_entry(&self) -> &LogEntry {
        &self.entries[self.last_applied as usize]
    }

    pub fn last_commit(&self) -> &LogEntry {
        &self.entries[self.commit_index as usize]
    }

    pub fn last_term(&self) -> u64 {
        self.last_entry().term
    }

    pub fn commit_term(&self) -> u64 {
        self.last_commit().term
    }

    pub fn length(&self) -> u64 {
        self.length
    }

    /// The term recorded with [`Log::set_vote`], never behind the last entry's term.
    pub fn term(&self) -> u64 {
        self.term
    }

    pub fn voted_for(&self) -> Option<u32> {
        (self.voted_for != 0).then_some(self.voted_for)
    }

    /// Records the replica's current term and vote, writing the meta record through
    /// when either changed.
    pub fn set_vote(&mut self, term: u64, voted_for: Option<u32>) -> Result<(), LogError> {
        let voted_for = voted_for.unwrap_or(0);
        if term == self.term && voted_for == self.voted_for {
            return Ok(());
        }
        trace!(term, voted_for, "recording vote");
        self.term = term;
        self.voted_for = voted_for;
        self.write_meta()
    }

    /// True if a remote log ending at `(last_index, last_term)` is at least as up to
    /// date as this one: a later last term wins, and equal terms compare by index.
    pub fn as_up_to_date(&self, last_index: u64, last_term: u64) -> bool {
        (last_term, last_index) >= (self.last_term(), self.last_applied)
    }

    // Entry management

    /// Appends a new command at the next index in the given term.
    pub fn create(&mut self, key: Vec<u8>, value: Vec<u8>, term: u64) -> Result<LogEntry, LogError> {
        let entry = LogEntry {
            index: self.last_applied + 1,
            term,
            key,
            value,
        };
        self.append(vec![entry.clone()])?;
        Ok(entry)
    }

    /// Appends entries that continue the log exactly: each entry must be at the next
    /// index and in a term no earlier than the one before it. The batch is checked as a
    /// whole before anything is added, and is synced with a single write.
    pub fn append(&mut self, entries: Vec<LogEntry>) -> Result<(), LogError> {
        if entries.is_empty() {
            return Ok(());
        }

        let (mut prev_index, mut prev_term) = (self.last_applied, self.last_term());
        for entry in entries.iter() {
            if entry.term < prev_term {
                debug!(entry_term = entry.term, prev_term, "cannot append entry in earlier term");
                return Err(LogError::AppendEarlierTerm {
                    entry: entry.term,
                    last: prev_term,
                });
            }

            if entry.index <= prev_index {
                debug!(entry_index = entry.index, prev_index, "cannot append entry with smaller index");
                return Err(LogError::AppendSmallerIndex {
                    entry: entry.index,
                    last: prev_index,
                });
            }

            if entry.index > prev_index + 1 {
                debug!(entry_index = entry.index, next_index = prev_index + 1, "cannot skip index");
                return Err(LogError::AppendSkipIndex {
                    entry: entry.index,
                    next: prev_index + 1,
                });
            }

            prev_index = entry.index;
            prev_term = entry.term;
        }

        let start = self.entries.len();
        let count = entries.len();
        self.entries.extend(entries);
        self.last_applied = prev_index;
        self.length += count as u64;
        self.modified = SystemTime::now();

        if self.sync.is_some() {
            let meta = self.meta();
            if let Some(sync) = self.sync.as_mut() {
                sync.write(&self.entries[start..]).map_err(LogError::Sync)?;
                sync.write_meta(&meta).map_err(LogError::Sync)?;
            }
        }

        trace!(
            num_entries = count,
            log_length = self.length,
            last_applied = self.last_applied,
            sync = self.sync.is_some(),
            "raft log entries appended"
        );
        Ok(())
    }

    /// Commits every entry up to and including `index`, handing each newly committed
    /// entry to the state machine in order. If the state machine fails, the entries
    /// handed over so far stay applied but the commit index does not move.
    pub fn commit(&mut self, index: u64) -> Result<(), LogError> {
        if index <= self.commit_index {
            debug!(index, commit_index = self.commit_index, "index already committed");
            return Err(LogError::IndexAlreadyCommitted(index));
        }

        if index > self.last_applied {
            debug!(index, last_applied = self.last_applied, "cannot commit invalid index");
            return Err(LogError::CommitInvalidIndex(index));
        }

        if let Some(sm) = self.sm.as_mut() {
            for i in self.commit_index + 1..=index {
                if let Err(source) = sm.commit_entry(&self.entries[i as usize]) {
                    warn!(
                        error_index = i,
                        start_index = self.commit_index + 1,
                        end_index = index,
                        error = %source,
                        "partial raft commit"
                    );
                    return Err(LogError::StateMachine { index: i, source });
                }
            }
        }

        let num_entries = index - self.commit_index;
        self.commit_index = index;
        self.modified = SystemTime::now();
        self.write_meta()?;

        debug!(num_entries, commit_index = self.commit_index, "raft log committed");
        Ok(())
    }

    /// Drops every entry after `index`, keeping the entry at `index`, which must be in
    /// `term`. Committed entries cannot be dropped. Each dropped entry is handed to the
    /// state machine in ascending index order.
    pub fn truncate(&mut self, index: u64, term: u64) -> Result<(), LogError> {
        if index > self.last_applied {
            debug!(index, last_applied = self.last_applied, "cannot truncate invalid index");
            return Err(LogError::TruncInvalidIndex(index));
        }

        let next_index = index + 1;
        if next_index <= self.commit_index {
            debug!(trunc_index = next_index, commit_index = self.commit_index, "cannot truncate already committed index");
            return Err(LogError::TruncCommittedIndex(next_index));
        }

        let entry_term = self.entries[index as usize].term;
        if entry_term != term {
            debug!(trunc_term = entry_term, term, "the entry at the truncation index must match the expected term");
            return Err(LogError::TruncTermMismatch { index, term });
        }

        if index == self.last_applied {
            return Ok(());
        }

        if let Some(sm) = self.sm.as_mut() {
            for dropped in self.entries[next_index as usize..].iter() {
                if let Err(source) = sm.drop_entry(dropped) {
                    warn!(
                        error_index = dropped.index,
                        start_index = next_index,
                        end_index = self.last_applied,
                        error = %source,
                        "partial raft drop"
                    );
                    return Err(LogError::StateMachine {
                        index: dropped.index,
                        source,
                    });
                }
            }
        }

        let num_entries = self.last_applied - index;
        self.entries.truncate(next_index as usize);
        self.length -= num_entries;
        self.last_applied = index;
        self.modified = SystemTime::now();

        if let Some(sync) = self.sync.as_mut() {
            sync.trunc(next_index).map_err(LogError::Sync)?;
        }
        self.write_meta()?;

        trace!(
            num_entries,
            log_length = self.length,
            last_applied = self.last_applied,
            sync = self.sync.is_some(),
            "raft log entries truncated"
        );
        Ok(())
    }

    // Entry access

    /// The entry at `index`, committed or not.
    pub fn get(&self, index: u64) -> Result<&LogEntry, LogError> {
        if index > self.last_applied {
            return Err(LogError::NoEntry(index));
        }
        Ok(&self.entries[index as usize])
    }

    /// The entry before `index`; valid up to one past the end of the log.
    pub fn prev(&self, index: u64) -> Result<&LogEntry, LogError> {
        if index < 1 || index > self.last_applied + 1 {
            return Err(LogError::NoEntryBefore(index));
        }
        Ok(&self.entries[index as usize - 1])
    }

    /// All entries from `index` to the end of the log, inclusive.
    pub fn after(&self, index: u64) -> Result<&[LogEntry], LogError> {
        if index > self.last_applied {
            return Err(LogError::NoEntriesAfter(index));
        }
        Ok(&self.entries[index as usize..])
    }

    // Metadata management

    pub fn meta(&self) -> LogMeta {
        LogMeta {
            last_applied: self.last_applied,
            commit_index: self.commit_index,
            length: self.length,
            created: Some(self.created.into()),
            modified: Some(self.modified.into()),
            snapshot: self.snapshot.map(Into::into),
            term: self.term,
            voted_for: self.voted_for,
        }
    }

    fn write_meta(&mut self) -> Result<(), LogError> {
        let meta = self.meta();
        if let Some(sync) = self.sync.as_mut() {
            sync.write_meta(&meta).map_err(LogError::Sync)?;
        }
        Ok(())
    }

    /// Closes the underlying sync, if any.
    pub fn close(&mut self) -> Result<(), LogError> {
        if let Some(sync) = self.sync.as_mut() {
            sync.close().map_err(LogError::Sync)?;
        }
        Ok(())
    }
}

impl Default for Log {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Log {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Log")
            .field("last_applied", &self.last_applied)
            .field("commit_index", &self.commit_index)
            .field("length", &self.length)
            .field("state_machine", &self.sm.is_some())
            .field("sync", &self.sync.is_some())
            .finish()
    }
}
