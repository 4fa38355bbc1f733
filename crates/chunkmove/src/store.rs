//! Per-shard document store with range ownership.
//!
//! A shard only serves keys inside ranges it owns. Documents outside those
//! ranges may still be stored (clone data of an in-flight incoming migration,
//! or a range given away but not yet deleted) but are invisible to reads and
//! rejected for writes.
//!
//! The store is also where migrations hook into the write path:
//! - registered transfer logs receive every effective write to their range,
//!   under the same lock that applies it, so per-key order is exact;
//! - a critical section blocks writes to a range until released;
//! - range locks block structural changes such as dropping the collection.

use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::error::{MigrationError, MigrationResult};
use crate::types::{DocKey, Document, KeyRange, SessionId, ShardId, XferOp};
use crate::xfer_log::TransferLog;

#[derive(Default)]
struct StoreInner {
    docs: BTreeMap<String, BTreeMap<DocKey, Vec<u8>>>,
    /// Sorted, coalesced owned ranges per collection.
    owned: BTreeMap<String, Vec<KeyRange>>,
    logs: Vec<Arc<TransferLog>>,
    range_locks: BTreeMap<SessionId, (String, KeyRange)>,
    blocked: BTreeMap<SessionId, (String, KeyRange)>,
    /// Ranges receiving clone data; the range deleter leaves them alone.
    incoming: BTreeMap<SessionId, (String, KeyRange)>,
}

impl StoreInner {
    fn owns_key(&self, collection: &str, key: &[u8]) -> bool {
        self.owned
            .get(collection)
            .is_some_and(|ranges| ranges.iter().any(|r| r.contains_key(key)))
    }

    fn owns_range(&self, collection: &str, range: &KeyRange) -> bool {
        self.owned
            .get(collection)
            .is_some_and(|ranges| ranges.iter().any(|r| r.covers(range)))
    }

    fn write_blocked(&self, collection: &str, key: &[u8]) -> bool {
        self.blocked
            .values()
            .any(|(c, r)| c == collection && r.contains_key(key))
    }

    fn incoming_covers(&self, collection: &str, key: &[u8]) -> bool {
        self.incoming
            .values()
            .any(|(c, r)| c == collection && r.contains_key(key))
    }

    fn apply_write(
        &mut self,
        shard: ShardId,
        collection: &str,
        op: XferOp,
    ) -> MigrationResult<bool> {
        if !self.owns_key(collection, op.key()) {
            return Err(MigrationError::RangeNotOwned {
                shard,
                collection: collection.to_string(),
                range: KeyRange::point(op.key()),
            });
        }
        let docs = self.docs.entry(collection.to_string()).or_default();
        let changed = match &op {
            XferOp::Upsert { key, body } => {
                docs.insert(key.clone(), body.clone());
                true
            }
            XferOp::Delete { key } => docs.remove(key).is_some(),
        };
        if changed {
            for log in self.logs.iter().filter(|l| l.captures(collection, op.key())) {
                if let Err(err) = log.append(op.clone()) {
                    tracing::debug!(
                        shard,
                        session_id = %log.session_id(),
                        error = %err,
                        "transfer log rejected write"
                    );
                }
            }
        }
        Ok(changed)
    }

    fn scan(&self, collection: &str, range: &KeyRange) -> Vec<Document> {
        let Some(docs) = self.docs.get(collection) else {
            return Vec::new();
        };
        if range.is_empty() {
            return Vec::new();
        }
        docs.range(bounds(range))
            .map(|(key, body)| Document::new(key.clone(), body.clone()))
            .collect()
    }
}

fn bounds(range: &KeyRange) -> (Bound<Vec<u8>>, Bound<Vec<u8>>) {
    let end = if range.end.is_empty() {
        Bound::Unbounded
    } else {
        Bound::Excluded(range.end.clone())
    };
    (Bound::Included(range.start.clone()), end)
}

/// Sort ranges by start and merge overlapping or adjacent ones.
fn coalesce(ranges: &mut Vec<KeyRange>) {
    ranges.retain(|r| !r.is_empty());
    ranges.sort_by(|a, b| a.start.cmp(&b.start));
    let mut out: Vec<KeyRange> = Vec::with_capacity(ranges.len());
    for range in ranges.drain(..) {
        if let Some(last) = out.last_mut() {
            if last.end.is_empty() || range.start <= last.end {
                if range.end.is_empty() {
                    last.end = Vec::new();
                } else if !last.end.is_empty() && range.end > last.end {
                    last.end = range.end;
                }
                continue;
            }
        }
        out.push(range);
    }
    *ranges = out;
}

pub struct ShardStore {
    shard: ShardId,
    inner: Mutex<StoreInner>,
    /// Bumped whenever a critical section ends.
    unblocked: watch::Sender<u64>,
}

impl ShardStore {
    pub fn new(shard: ShardId) -> Self {
        let (unblocked, _) = watch::channel(0);
        Self {
            shard,
            inner: Mutex::new(StoreInner::default()),
            unblocked,
        }
    }

    fn lock(&self) -> MutexGuard<'_, StoreInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn shard(&self) -> ShardId {
        self.shard
    }

    pub fn owns_key(&self, collection: &str, key: &[u8]) -> bool {
        self.lock().owns_key(collection, key)
    }

    pub fn owns_range(&self, collection: &str, range: &KeyRange) -> bool {
        self.lock().owns_range(collection, range)
    }

    pub fn owned_ranges(&self, collection: &str) -> Vec<KeyRange> {
        self.lock().owned.get(collection).cloned().unwrap_or_default()
    }

    pub fn assume_ownership(&self, collection: &str, range: &KeyRange) {
        let mut inner = self.lock();
        let ranges = inner.owned.entry(collection.to_string()).or_default();
        ranges.push(range.clone());
        coalesce(ranges);
    }

    pub fn relinquish_ownership(&self, collection: &str, range: &KeyRange) {
        let mut inner = self.lock();
        if let Some(ranges) = inner.owned.get_mut(collection) {
            let mut rest: Vec<KeyRange> = ranges.iter().flat_map(|r| r.subtract(range)).collect();
            coalesce(&mut rest);
            *ranges = rest;
        }
    }

    pub fn get(&self, collection: &str, key: &[u8]) -> MigrationResult<Option<Vec<u8>>> {
        let inner = self.lock();
        if !inner.owns_key(collection, key) {
            return Err(MigrationError::RangeNotOwned {
                shard: self.shard,
                collection: collection.to_string(),
                range: KeyRange::point(key),
            });
        }
        Ok(inner
            .docs
            .get(collection)
            .and_then(|docs| docs.get(key))
            .cloned())
    }

    /// Owned documents inside `range`, in key order.
    pub fn scan(&self, collection: &str, range: &KeyRange) -> Vec<Document> {
        let inner = self.lock();
        inner
            .scan(collection, range)
            .into_iter()
            .filter(|doc| inner.owns_key(collection, &doc.key))
            .collect()
    }

    pub fn owned_documents(&self, collection: &str) -> Vec<Document> {
        self.scan(collection, &KeyRange::full())
    }

    /// Stored documents the shard does not own.
    pub fn orphan_count(&self, collection: &str) -> usize {
        let inner = self.lock();
        inner
            .docs
            .get(collection)
            .map(|docs| {
                docs.keys()
                    .filter(|key| !inner.owns_key(collection, key))
                    .count()
            })
            .unwrap_or(0)
    }

    pub async fn upsert(
        &self,
        collection: &str,
        key: impl Into<DocKey>,
        body: impl Into<Vec<u8>>,
    ) -> MigrationResult<()> {
        let op = XferOp::Upsert {
            key: key.into(),
            body: body.into(),
        };
        self.write(collection, op).await.map(|_| ())
    }

    /// Delete a document. Returns whether it existed.
    pub async fn delete(&self, collection: &str, key: impl Into<DocKey>) -> MigrationResult<bool> {
        self.write(collection, XferOp::Delete { key: key.into() })
            .await
    }

    /// Apply a write, waiting out any critical section covering the key.
    async fn write(&self, collection: &str, op: XferOp) -> MigrationResult<bool> {
        loop {
            let mut unblocked = self.unblocked.subscribe();
            {
                let mut inner = self.lock();
                if !inner.write_blocked(collection, op.key()) {
                    return inner.apply_write(self.shard, collection, op);
                }
            }
            // The sender lives as long as the store.
            let _ = unblocked.changed().await;
        }
    }

    pub fn drop_collection(&self, collection: &str) -> MigrationResult<()> {
        let mut inner = self.lock();
        if let Some((session_id, _)) = inner
            .range_locks
            .iter()
            .chain(inner.incoming.iter())
            .find(|(_, (c, _))| c == collection)
        {
            return Err(MigrationError::StructuralChangeBlocked {
                collection: collection.to_string(),
                session_id: session_id.clone(),
            });
        }
        inner.docs.remove(collection);
        inner.owned.remove(collection);
        Ok(())
    }

    /// Block structural changes to `collection` while the lock is held.
    pub fn lock_range(
        self: &Arc<Self>,
        session_id: &SessionId,
        collection: &str,
        range: &KeyRange,
    ) -> RangeLock {
        self.lock().range_locks.insert(
            session_id.clone(),
            (collection.to_string(), range.clone()),
        );
        RangeLock {
            store: self.clone(),
            session_id: session_id.clone(),
        }
    }

    /// Snapshot the owned documents of `range` and register a transfer log
    /// for it, atomically with respect to writes.
    pub fn begin_transfer(
        &self,
        session_id: &SessionId,
        collection: &str,
        range: &KeyRange,
        max_entries: usize,
    ) -> MigrationResult<(Vec<Document>, Arc<TransferLog>)> {
        let mut inner = self.lock();
        if !inner.owns_range(collection, range) {
            return Err(MigrationError::RangeNotOwned {
                shard: self.shard,
                collection: collection.to_string(),
                range: range.clone(),
            });
        }
        if inner.logs.iter().any(|log| log.session_id() == session_id) {
            return Err(MigrationError::InvalidState(format!(
                "transfer log for {session_id} already registered"
            )));
        }
        let snapshot = inner.scan(collection, range);
        let log = Arc::new(TransferLog::new(
            session_id.clone(),
            collection,
            range.clone(),
            max_entries,
        ));
        inner.logs.push(log.clone());
        Ok((snapshot, log))
    }

    /// Unregister and close the session's transfer log.
    pub fn end_transfer(&self, session_id: &SessionId) {
        let mut inner = self.lock();
        inner.logs.retain(|log| {
            if log.session_id() == session_id {
                log.close();
                false
            } else {
                true
            }
        });
    }

    /// Block writes to `range` until the returned guard drops. Writes already
    /// applied are in the transfer log by the time this returns.
    pub fn block_writes(
        self: &Arc<Self>,
        session_id: &SessionId,
        collection: &str,
        range: &KeyRange,
    ) -> CriticalSection {
        self.lock().blocked.insert(
            session_id.clone(),
            (collection.to_string(), range.clone()),
        );
        CriticalSection {
            store: self.clone(),
            session_id: session_id.clone(),
        }
    }

    pub fn writes_blocked(&self, collection: &str, key: &[u8]) -> bool {
        self.lock().write_blocked(collection, key)
    }

    fn unblock(&self, session_id: &SessionId) {
        let removed = self.lock().blocked.remove(session_id).is_some();
        if removed {
            self.unblocked.send_modify(|v| *v = v.wrapping_add(1));
        }
    }

    /// Reserve `range` for incoming clone data.
    pub fn reserve_incoming(&self, session_id: &SessionId, collection: &str, range: &KeyRange) {
        self.lock().incoming.insert(
            session_id.clone(),
            (collection.to_string(), range.clone()),
        );
    }

    pub fn release_incoming(&self, session_id: &SessionId) {
        self.lock().incoming.remove(session_id);
    }

    /// Store documents without taking ownership. Keys the shard already owns
    /// are left untouched. Returns how many documents were written.
    pub fn ingest_unowned(
        &self,
        collection: &str,
        docs: impl IntoIterator<Item = Document>,
    ) -> usize {
        let mut inner = self.lock();
        let mut written = 0;
        for doc in docs {
            if inner.owns_key(collection, &doc.key) {
                continue;
            }
            inner
                .docs
                .entry(collection.to_string())
                .or_default()
                .insert(doc.key, doc.body);
            written += 1;
        }
        written
    }

    /// Apply a replicated mutation to unowned data. Delete of an absent key is
    /// a no-op. Returns whether anything changed.
    pub fn apply_unowned(&self, collection: &str, op: XferOp) -> bool {
        let mut inner = self.lock();
        if inner.owns_key(collection, op.key()) {
            return false;
        }
        let docs = inner.docs.entry(collection.to_string()).or_default();
        match op {
            XferOp::Upsert { key, body } => docs.insert(key, body.clone()).as_ref() != Some(&body),
            XferOp::Delete { key } => docs.remove(&key).is_some(),
        }
    }

    /// Delete every unowned document inside `range`.
    pub fn purge_unowned(&self, collection: &str, range: &KeyRange) -> usize {
        self.purge(collection, range, false)
    }

    fn purge(&self, collection: &str, range: &KeyRange, skip_incoming: bool) -> usize {
        let mut inner = self.lock();
        let doomed: Vec<DocKey> = inner
            .scan(collection, range)
            .into_iter()
            .map(|doc| doc.key)
            .filter(|key| !inner.owns_key(collection, key))
            .filter(|key| !(skip_incoming && inner.incoming_covers(collection, key)))
            .collect();
        if let Some(docs) = inner.docs.get_mut(collection) {
            for key in &doomed {
                docs.remove(key);
            }
        }
        doomed.len()
    }

    /// Delete a range this shard gave away once `delay` elapses. Keys owned
    /// again, or reserved by an incoming migration, by then are kept.
    pub fn schedule_range_deletion(
        self: &Arc<Self>,
        collection: &str,
        range: &KeyRange,
        delay: Duration,
    ) -> JoinHandle<usize> {
        let store = self.clone();
        let collection = collection.to_string();
        let range = range.clone();
        tokio::spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            let removed = store.purge(&collection, &range, true);
            tracing::info!(
                shard = store.shard,
                collection = %collection,
                range = %range,
                removed,
                "deleted migrated range"
            );
            removed
        })
    }
}

/// Structural-change lock held by a migration for its lifetime.
pub struct RangeLock {
    store: Arc<ShardStore>,
    session_id: SessionId,
}

impl Drop for RangeLock {
    fn drop(&mut self) {
        self.store.lock().range_locks.remove(&self.session_id);
    }
}

/// Write block over a migrating range. Dropping it wakes blocked writers.
pub struct CriticalSection {
    store: Arc<ShardStore>,
    session_id: SessionId,
}

impl Drop for CriticalSection {
    fn drop(&mut self) {
        self.store.unblock(&self.session_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::u64_key;

    fn sid(seq: u64) -> SessionId {
        SessionId {
            donor: 1,
            started_ms: 1,
            seq,
        }
    }

    fn owned_store(range: KeyRange) -> Arc<ShardStore> {
        let store = Arc::new(ShardStore::new(1));
        store.assume_ownership("x", &range);
        store
    }

    #[tokio::test]
    async fn reads_and_writes_require_ownership() {
        let store = owned_store(KeyRange::u64s(0, 30));
        store.upsert("x", u64_key(5), "five").await.expect("owned write");
        assert_eq!(
            store.get("x", &u64_key(5)).expect("owned read"),
            Some(b"five".to_vec())
        );
        let err = store
            .upsert("x", u64_key(30), "thirty")
            .await
            .expect_err("unowned write");
        assert_eq!(err.kind(), "range_not_owned");
        assert!(store.get("x", &u64_key(40)).is_err());
    }

    #[test]
    fn ownership_coalesces_and_subtracts() {
        let store = Arc::new(ShardStore::new(1));
        store.assume_ownership("x", &KeyRange::u64s(10, 20));
        store.assume_ownership("x", &KeyRange::u64s(0, 10));
        store.assume_ownership("x", &KeyRange::u64s(15, 25));
        assert_eq!(store.owned_ranges("x"), vec![KeyRange::u64s(0, 25)]);
        assert!(store.owns_range("x", &KeyRange::u64s(5, 22)));

        store.relinquish_ownership("x", &KeyRange::u64s(5, 10));
        assert_eq!(
            store.owned_ranges("x"),
            vec![KeyRange::u64s(0, 5), KeyRange::u64s(10, 25)]
        );
        assert!(!store.owns_range("x", &KeyRange::u64s(0, 10)));
    }

    #[tokio::test]
    async fn transfer_log_sees_writes_after_snapshot() {
        let store = owned_store(KeyRange::full());
        store.upsert("x", u64_key(1), "a").await.expect("write");
        store.upsert("x", u64_key(50), "b").await.expect("write");

        let (snapshot, log) = store
            .begin_transfer(&sid(1), "x", &KeyRange::u64s(0, 30), 16)
            .expect("begin transfer");
        assert_eq!(snapshot, vec![Document::new(u64_key(1), "a")]);

        store.upsert("x", u64_key(5), "c").await.expect("write");
        store.upsert("x", u64_key(60), "d").await.expect("write");
        assert!(store.delete("x", u64_key(1)).await.expect("delete"));
        assert!(!store.delete("x", u64_key(2)).await.expect("delete absent"));

        let ops: Vec<_> = log.next_batch(16).entries.into_iter().map(|e| e.op).collect();
        assert_eq!(
            ops,
            vec![
                XferOp::Upsert {
                    key: u64_key(5),
                    body: b"c".to_vec()
                },
                XferOp::Delete { key: u64_key(1) },
            ]
        );

        store.end_transfer(&sid(1));
        assert!(log.is_closed());
        store.upsert("x", u64_key(6), "e").await.expect("write");
        assert_eq!(log.last_seq(), 2);
    }

    #[test]
    fn transfer_requires_full_ownership() {
        let store = owned_store(KeyRange::u64s(0, 10));
        let err = store
            .begin_transfer(&sid(1), "x", &KeyRange::u64s(0, 20), 16)
            .err()
            .expect("partial ownership rejected");
        assert_eq!(err.kind(), "range_not_owned");
    }

    #[tokio::test]
    async fn critical_section_blocks_only_its_range() {
        let store = owned_store(KeyRange::full());
        let section = store.block_writes(&sid(1), "x", &KeyRange::u64s(0, 10));

        store
            .upsert("x", u64_key(20), "outside")
            .await
            .expect("outside write proceeds");

        let blocked = {
            let store = store.clone();
            tokio::spawn(async move { store.upsert("x", u64_key(3), "inside").await })
        };
        tokio::task::yield_now().await;
        assert!(!blocked.is_finished());
        assert!(store.writes_blocked("x", &u64_key(3)));

        drop(section);
        blocked
            .await
            .expect("join")
            .expect("write proceeds after release");
        assert_eq!(
            store.get("x", &u64_key(3)).expect("read"),
            Some(b"inside".to_vec())
        );
    }

    #[tokio::test]
    async fn blocked_writer_sees_lost_ownership() {
        let store = owned_store(KeyRange::full());
        let section = store.block_writes(&sid(1), "x", &KeyRange::u64s(0, 10));
        let blocked = {
            let store = store.clone();
            tokio::spawn(async move { store.upsert("x", u64_key(3), "late").await })
        };
        tokio::task::yield_now().await;
        store.relinquish_ownership("x", &KeyRange::u64s(0, 10));
        drop(section);
        let err = blocked.await.expect("join").expect_err("moved away");
        assert_eq!(err.kind(), "range_not_owned");
    }

    #[test]
    fn range_lock_blocks_drop_collection() {
        let store = owned_store(KeyRange::full());
        let lock = store.lock_range(&sid(4), "x", &KeyRange::u64s(0, 10));
        assert_eq!(
            store.drop_collection("x").expect_err("blocked"),
            MigrationError::StructuralChangeBlocked {
                collection: "x".into(),
                session_id: sid(4),
            }
        );
        drop(lock);
        store.drop_collection("x").expect("drop after release");
        assert!(store.owned_ranges("x").is_empty());
    }

    #[test]
    fn unowned_data_is_invisible_until_owned() {
        let store = Arc::new(ShardStore::new(2));
        let range = KeyRange::u64s(0, 30);
        let written = store.ingest_unowned(
            "x",
            vec![Document::new(u64_key(1), "a"), Document::new(u64_key(2), "b")],
        );
        assert_eq!(written, 2);
        assert!(store.apply_unowned(
            "x",
            XferOp::Delete {
                key: u64_key(2)
            }
        ));
        assert!(!store.apply_unowned(
            "x",
            XferOp::Delete {
                key: u64_key(2)
            }
        ));
        assert!(store.scan("x", &range).is_empty());
        assert_eq!(store.orphan_count("x"), 1);

        store.assume_ownership("x", &range);
        assert_eq!(store.scan("x", &range), vec![Document::new(u64_key(1), "a")]);
        assert_eq!(store.orphan_count("x"), 0);
    }

    #[tokio::test]
    async fn range_deletion_skips_reclaimed_and_incoming_keys() {
        let store = owned_store(KeyRange::full());
        for id in 0..10 {
            store.upsert("x", u64_key(id), "v").await.expect("write");
        }
        store.relinquish_ownership("x", &KeyRange::u64s(0, 10));
        store.assume_ownership("x", &KeyRange::u64s(0, 2));
        store.reserve_incoming(&sid(9), "x", &KeyRange::u64s(8, 10));

        let removed = store
            .schedule_range_deletion("x", &KeyRange::u64s(0, 10), Duration::ZERO)
            .await
            .expect("join");
        assert_eq!(removed, 6);
        assert_eq!(store.orphan_count("x"), 2);

        store.release_incoming(&sid(9));
        assert_eq!(store.purge_unowned("x", &KeyRange::u64s(0, 10)), 2);
    }
}
