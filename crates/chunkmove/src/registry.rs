//! Migration session registry.
//!
//! The registry is the only place that answers "is a migration active" and
//! "what is its id". Admission checks and insertion happen under one lock, so
//! concurrently submitted requests are serialized: at most one live session
//! per overlapping range of a collection, and at most one donor role and one
//! recipient role per shard.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio_util::sync::CancellationToken;

use crate::error::{MigrationError, MigrationResult};
use crate::types::{now_unix_ms, KeyRange, SessionId, ShardId};

/// A session admitted by the registry.
#[derive(Clone, Debug)]
pub struct LiveSession {
    pub id: SessionId,
    pub collection: String,
    pub range: KeyRange,
    pub donor: ShardId,
    pub recipient: ShardId,
    pub created_unix_ms: u64,
    /// Cancelled when an operator interrupts the session.
    pub cancel: CancellationToken,
}

#[derive(Default)]
struct RegistryInner {
    next_seq: u64,
    live: BTreeMap<SessionId, LiveSession>,
}

#[derive(Default)]
pub struct SessionRegistry {
    inner: Mutex<RegistryInner>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, RegistryInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Admit a new session or fail fast.
    ///
    /// Checks, in order: the range does not overlap a live session of the
    /// same collection, the recipient is not already receiving, the donor is
    /// not already donating.
    pub fn acquire(
        &self,
        collection: &str,
        range: &KeyRange,
        donor: ShardId,
        recipient: ShardId,
    ) -> MigrationResult<LiveSession> {
        if donor == recipient {
            return Err(MigrationError::InvalidRequest(format!(
                "donor and recipient are both shard {donor}"
            )));
        }
        if range.is_empty() {
            return Err(MigrationError::InvalidRequest(format!(
                "empty range {range}"
            )));
        }

        let mut inner = self.lock();
        if let Some(other) = inner
            .live
            .values()
            .find(|s| s.collection == collection && s.range.overlaps(range))
        {
            return Err(MigrationError::ConflictingMigration {
                reason: format!(
                    "{collection} {range} overlaps {} of migration {}",
                    other.range, other.id
                ),
            });
        }
        if let Some(other) = inner.live.values().find(|s| s.recipient == recipient) {
            return Err(MigrationError::RecipientBusy {
                shard: recipient,
                active: other.id.clone(),
            });
        }
        if let Some(other) = inner.live.values().find(|s| s.donor == donor) {
            return Err(MigrationError::ConflictingMigration {
                reason: format!("shard {donor} is already donating in migration {}", other.id),
            });
        }

        inner.next_seq = inner.next_seq.saturating_add(1);
        let created_unix_ms = now_unix_ms();
        let session = LiveSession {
            id: SessionId {
                donor,
                started_ms: created_unix_ms,
                seq: inner.next_seq,
            },
            collection: collection.to_string(),
            range: range.clone(),
            donor,
            recipient,
            created_unix_ms,
            cancel: CancellationToken::new(),
        };
        inner.live.insert(session.id.clone(), session.clone());
        Ok(session)
    }

    /// Remove a session. Returns whether it was still live.
    pub fn release(&self, session_id: &SessionId) -> bool {
        self.lock().live.remove(session_id).is_some()
    }

    pub fn get(&self, session_id: &SessionId) -> Option<LiveSession> {
        self.lock().live.get(session_id).cloned()
    }

    pub fn is_active(&self, session_id: &SessionId) -> bool {
        self.lock().live.contains_key(session_id)
    }

    /// Live sessions, oldest first.
    pub fn live(&self) -> Vec<LiveSession> {
        let mut sessions: Vec<_> = self.lock().live.values().cloned().collect();
        sessions.sort_by_key(|s| (s.created_unix_ms, s.id.seq));
        sessions
    }

    pub fn for_collection(&self, collection: &str) -> Vec<LiveSession> {
        self.live()
            .into_iter()
            .filter(|s| s.collection == collection)
            .collect()
    }

    pub fn donating(&self, shard: ShardId) -> Option<SessionId> {
        self.lock()
            .live
            .values()
            .find(|s| s.donor == shard)
            .map(|s| s.id.clone())
    }

    pub fn receiving(&self, shard: ShardId) -> Option<SessionId> {
        self.lock()
            .live
            .values()
            .find(|s| s.recipient == shard)
            .map(|s| s.id.clone())
    }

    pub fn len(&self) -> usize {
        self.lock().live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Signal the session's cancellation token.
    pub fn interrupt(&self, session_id: &SessionId) -> MigrationResult<()> {
        let inner = self.lock();
        let session = inner
            .live
            .get(session_id)
            .ok_or_else(|| MigrationError::UnknownSession(session_id.clone()))?;
        session.cancel.cancel();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn overlapping_range_conflicts() {
        let registry = SessionRegistry::new();
        registry
            .acquire("x", &KeyRange::u64s(0, 10), 1, 2)
            .expect("first acquire");
        let err = registry
            .acquire("x", &KeyRange::u64s(5, 15), 3, 4)
            .expect_err("overlap rejected");
        assert_eq!(err.kind(), "conflicting_migration");

        // Same range of another collection is independent.
        registry
            .acquire("y", &KeyRange::u64s(5, 15), 3, 4)
            .expect("other collection");
    }

    #[test]
    fn recipient_busy_takes_precedence_over_donor_conflict() {
        let registry = SessionRegistry::new();
        let first = registry
            .acquire("collA", &KeyRange::u64s(0, 10), 0, 1)
            .expect("first acquire");
        let err = registry
            .acquire("collA", &KeyRange::u64s(10, 20), 0, 1)
            .expect_err("recipient busy");
        assert_eq!(
            err,
            MigrationError::RecipientBusy {
                shard: 1,
                active: first.id,
            }
        );
    }

    #[test]
    fn donor_cannot_donate_twice() {
        let registry = SessionRegistry::new();
        registry
            .acquire("x", &KeyRange::u64s(0, 10), 1, 2)
            .expect("first acquire");
        let err = registry
            .acquire("x", &KeyRange::u64s(20, 30), 1, 3)
            .expect_err("donor busy");
        assert_eq!(err.kind(), "conflicting_migration");
    }

    #[test]
    fn rejects_malformed_requests() {
        let registry = SessionRegistry::new();
        assert_eq!(
            registry
                .acquire("x", &KeyRange::u64s(0, 10), 1, 1)
                .expect_err("self move")
                .kind(),
            "invalid_request"
        );
        assert_eq!(
            registry
                .acquire("x", &KeyRange::u64s(10, 10), 1, 2)
                .expect_err("empty range")
                .kind(),
            "invalid_request"
        );
        assert!(registry.is_empty());
    }

    #[test]
    fn release_is_idempotent_and_ids_are_never_reused() {
        let registry = SessionRegistry::new();
        let range = KeyRange::u64s(0, 10);
        let first = registry.acquire("x", &range, 1, 2).expect("acquire");
        assert!(registry.release(&first.id));
        assert!(!registry.release(&first.id));
        let second = registry.acquire("x", &range, 1, 2).expect("reacquire");
        assert_ne!(first.id, second.id);
        assert_eq!(registry.donating(1), Some(second.id.clone()));
        assert_eq!(registry.receiving(2), Some(second.id));
    }

    #[test]
    fn interrupt_cancels_token() {
        let registry = SessionRegistry::new();
        let session = registry
            .acquire("x", &KeyRange::u64s(0, 10), 1, 2)
            .expect("acquire");
        registry.interrupt(&session.id).expect("interrupt");
        assert!(session.cancel.is_cancelled());
        registry.release(&session.id);
        assert_eq!(
            registry.interrupt(&session.id).expect_err("gone"),
            MigrationError::UnknownSession(session.id)
        );
    }

    #[test]
    fn concurrent_overlapping_acquires_admit_one() {
        let registry = Arc::new(SessionRegistry::new());
        let handles: Vec<_> = (0..8u64)
            .map(|i| {
                let registry = registry.clone();
                std::thread::spawn(move || {
                    registry
                        .acquire("x", &KeyRange::u64s(i, i + 10), 10 + i, 20 + i)
                        .is_ok()
                })
            })
            .collect();
        let admitted = handles
            .into_iter()
            .map(|h| h.join().expect("join"))
            .filter(|ok| *ok)
            .count();
        assert_eq!(admitted, 1);
        assert_eq!(registry.len(), 1);
    }
}
