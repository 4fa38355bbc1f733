//! Per-session transfer log of writes made to a migrating range.
//!
//! The donor's store appends every effective write inside the range while the
//! log is registered. The coordinator pulls batches with [`TransferLog::next_batch`]
//! and removes entries only after the recipient acknowledges them with
//! [`TransferLog::ack`]. Sequence numbers start at 1 and are dense.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::error::{MigrationError, MigrationResult};
use crate::types::{KeyRange, SessionId, XferEntry, XferOp};

#[derive(Default)]
struct LogInner {
    entries: VecDeque<XferEntry>,
    last_seq: u64,
    acked_seq: u64,
    overflowed: bool,
    closed: bool,
}

/// Entries pulled for one transfer-mods call.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct XferBatch {
    pub entries: Vec<XferEntry>,
    /// Entries still queued after this batch.
    pub remaining: usize,
}

pub struct TransferLog {
    session_id: SessionId,
    collection: String,
    range: KeyRange,
    max_entries: usize,
    inner: Mutex<LogInner>,
}

impl TransferLog {
    pub fn new(
        session_id: SessionId,
        collection: impl Into<String>,
        range: KeyRange,
        max_entries: usize,
    ) -> Self {
        Self {
            session_id,
            collection: collection.into(),
            range,
            max_entries: max_entries.max(1),
            inner: Mutex::new(LogInner::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, LogInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    /// Whether a write to `collection`/`key` belongs in this log.
    pub fn captures(&self, collection: &str, key: &[u8]) -> bool {
        self.collection == collection && self.range.contains_key(key)
    }

    /// Append one mutation and return its sequence number.
    ///
    /// Once the bound is exceeded the log stays overflowed and rejects every
    /// later append; the session must abort.
    pub fn append(&self, op: XferOp) -> MigrationResult<u64> {
        let mut inner = self.lock();
        if inner.closed {
            return Err(MigrationError::InvalidState(format!(
                "transfer log for {} is closed",
                self.session_id
            )));
        }
        if inner.overflowed || inner.entries.len() >= self.max_entries {
            inner.overflowed = true;
            return Err(self.overflow_error());
        }
        inner.last_seq += 1;
        let seq = inner.last_seq;
        inner.entries.push_back(XferEntry {
            session_id: self.session_id.clone(),
            seq,
            op,
        });
        Ok(seq)
    }

    /// Peek at up to `max` of the oldest unacknowledged entries.
    pub fn next_batch(&self, max: usize) -> XferBatch {
        let inner = self.lock();
        let take = max.min(inner.entries.len());
        XferBatch {
            entries: inner.entries.iter().take(take).cloned().collect(),
            remaining: inner.entries.len() - take,
        }
    }

    /// Drop every entry with `seq <= through_seq` and return the backlog left.
    /// Acknowledgements never move backwards.
    pub fn ack(&self, through_seq: u64) -> usize {
        let mut inner = self.lock();
        let through_seq = through_seq.min(inner.last_seq);
        if through_seq > inner.acked_seq {
            inner.acked_seq = through_seq;
        }
        while inner
            .entries
            .front()
            .is_some_and(|entry| entry.seq <= through_seq)
        {
            inner.entries.pop_front();
        }
        inner.entries.len()
    }

    pub fn backlog(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn last_seq(&self) -> u64 {
        self.lock().last_seq
    }

    pub fn acked_seq(&self) -> u64 {
        self.lock().acked_seq
    }

    pub fn overflowed(&self) -> bool {
        self.lock().overflowed
    }

    pub fn check_overflow(&self) -> MigrationResult<()> {
        if self.overflowed() {
            return Err(self.overflow_error());
        }
        Ok(())
    }

    /// Stop accepting appends and discard anything still queued.
    pub fn close(&self) {
        let mut inner = self.lock();
        inner.closed = true;
        inner.entries.clear();
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    fn overflow_error(&self) -> MigrationError {
        MigrationError::TransferLogOverflow {
            session_id: self.session_id.clone(),
            limit: self.max_entries,
        }
    }
}
