//! Recipient side of a migration.
//!
//! The worker mirrors the donor's session: it accepts clone batches and
//! transfer-log entries only for the one incoming session it has recorded,
//! keeps everything it receives as unowned data, and takes ownership only
//! when that same session commits. Any call naming another session id is
//! rejected before it touches the store.
//!
//! A session that ends without a commit normally has its data purged. When a
//! catalog is attached, the worker first checks it: if the catalog already
//! names this shard as owner of the range, the donor's commit was lost and
//! the worker takes ownership instead.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::catalog::OwnershipCatalog;
use crate::config::{enabled, MigrationConfig};
use crate::error::{MigrationError, MigrationResult};
use crate::store::ShardStore;
use crate::types::{
    CloneBatch, Document, KeyRange, RecipientState, RecipientStatus, SessionId, ShardId,
};
use crate::xfer_log::XferBatch;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BeginCloneRequest {
    pub session_id: SessionId,
    pub collection: String,
    pub range: KeyRange,
    pub donor: ShardId,
    pub clone_epoch: u64,
}

/// Reply to a transfer-mods call.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModsAck {
    /// Highest sequence applied so far; the donor may drop entries up to it.
    pub applied_through: u64,
    /// Entries the donor still holds beyond this batch. Zero means caught up.
    pub backlog: usize,
}

/// Calls a donor makes on a recipient. Every call is keyed by session id.
#[async_trait]
pub trait RecipientEndpoint: Send + Sync + 'static {
    async fn begin_clone(&self, request: BeginCloneRequest) -> MigrationResult<()>;

    /// Upsert a batch of snapshot documents. Returns the session's cloned total.
    async fn clone_batch(&self, batch: CloneBatch) -> MigrationResult<u64>;

    async fn transfer_mods(
        &self,
        session_id: &SessionId,
        batch: XferBatch,
    ) -> MigrationResult<ModsAck>;

    async fn commit(&self, session_id: &SessionId) -> MigrationResult<()>;

    async fn abort(&self, session_id: &SessionId) -> MigrationResult<()>;

    async fn status(&self) -> MigrationResult<RecipientStatus>;
}

struct Incoming {
    session_id: SessionId,
    collection: String,
    range: KeyRange,
    donor: ShardId,
    clone_epoch: u64,
    state: RecipientState,
    cloned_docs: u64,
    cloned_bytes: u64,
    applied_ops: u64,
    last_applied_seq: u64,
    last_error: Option<MigrationError>,
    last_activity: Instant,
}

/// What `begin_clone` must do about the session currently recorded.
enum Admission {
    Start,
    AlreadyActive,
    Displace { session_id: SessionId, idle: Duration },
}

enum ModsRejection {
    /// Rejected without side effects.
    Refused(MigrationError),
    /// Sequence gap; the session cannot continue.
    Gap(MigrationError),
}

/// How a live incoming session ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum SessionEnd {
    Discarded,
    Adopted,
    /// Someone else ended or replaced it first.
    Gone,
}

#[derive(Default)]
struct RecipientInner {
    /// Latest incoming session, kept after it ends for status and replays.
    session: Option<Incoming>,
}

impl RecipientInner {
    fn live(&mut self, session_id: &SessionId) -> MigrationResult<&mut Incoming> {
        match self.session.as_mut() {
            Some(s) if s.state.is_live() && s.session_id == *session_id => Ok(s),
            Some(s) if s.state.is_live() => {
                Err(MigrationError::stale(session_id, Some(&s.session_id)))
            }
            _ => Err(MigrationError::stale(session_id, None)),
        }
    }
}

pub struct RecipientIngestWorker {
    shard: ShardId,
    store: Arc<ShardStore>,
    idle_timeout: Option<Duration>,
    catalog: Option<Arc<dyn OwnershipCatalog>>,
    inner: Mutex<RecipientInner>,
}

impl RecipientIngestWorker {
    pub fn new(store: Arc<ShardStore>, cfg: &MigrationConfig) -> Self {
        Self {
            shard: store.shard(),
            store,
            idle_timeout: enabled(cfg.recipient_idle_timeout),
            catalog: None,
            inner: Mutex::new(RecipientInner::default()),
        }
    }

    /// Consult `catalog` before throwing away an incoming range.
    pub fn with_catalog(mut self, catalog: Arc<dyn OwnershipCatalog>) -> Self {
        self.catalog = Some(catalog);
        self
    }

    fn lock(&self) -> MutexGuard<'_, RecipientInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn shard(&self) -> ShardId {
        self.shard
    }

    pub fn state(&self) -> RecipientState {
        self.lock()
            .session
            .as_ref()
            .map_or(RecipientState::Idle, |s| s.state)
    }

    /// Session currently bound to this recipient, if any.
    pub fn active_session(&self) -> Option<SessionId> {
        self.lock()
            .session
            .as_ref()
            .filter(|s| s.state.is_live())
            .map(|s| s.session_id.clone())
    }

    /// Throw away everything the session wrote and mark it aborted.
    fn discard(&self, incoming: &mut Incoming, reason: Option<MigrationError>) {
        let purged = self
            .store
            .purge_unowned(&incoming.collection, &incoming.range);
        self.store.release_incoming(&incoming.session_id);
        incoming.state = RecipientState::Aborted;
        incoming.last_error = reason;
        tracing::info!(
            shard = self.shard,
            session_id = %incoming.session_id,
            collection = %incoming.collection,
            range = %incoming.range,
            purged,
            "recipient discarded incoming range"
        );
    }

    /// Take ownership of a session's range without a commit call, because
    /// the catalog already assigns it here.
    fn adopt(&self, incoming: &mut Incoming) {
        self.store
            .assume_ownership(&incoming.collection, &incoming.range);
        self.store.release_incoming(&incoming.session_id);
        incoming.state = RecipientState::Steady;
        incoming.last_activity = Instant::now();
        tracing::warn!(
            shard = self.shard,
            session_id = %incoming.session_id,
            collection = %incoming.collection,
            range = %incoming.range,
            "catalog assigns incoming range here without a commit; taking ownership"
        );
    }

    /// Whether the catalog names this shard as owner of all of `range`.
    /// Without a catalog nothing is ever assigned by surprise.
    async fn assigned_here(&self, collection: &str, range: &KeyRange) -> MigrationResult<bool> {
        let Some(catalog) = &self.catalog else {
            return Ok(false);
        };
        let routing = catalog.read(collection).await.map_err(|err| {
            tracing::warn!(
                shard = self.shard,
                collection,
                range = %range,
                error = ?err,
                "catalog unreadable, keeping incoming range"
            );
            MigrationError::from(err)
        })?;
        Ok(routing.owned_by(self.shard, range))
    }

    /// End the live session `session_id`, purging its data unless the
    /// catalog already assigns its range here. Fails, keeping the data, when
    /// the catalog cannot be read.
    async fn end_incoming(
        &self,
        session_id: &SessionId,
        reason: Option<MigrationError>,
    ) -> MigrationResult<SessionEnd> {
        let (collection, range) = {
            let inner = self.lock();
            match inner.session.as_ref() {
                Some(s) if s.session_id == *session_id && s.state.is_live() => {
                    (s.collection.clone(), s.range.clone())
                }
                _ => return Ok(SessionEnd::Gone),
            }
        };
        let assigned = self.assigned_here(&collection, &range).await?;

        let mut inner = self.lock();
        let Some(incoming) = inner
            .session
            .as_mut()
            .filter(|s| s.session_id == *session_id && s.state.is_live())
        else {
            return Ok(SessionEnd::Gone);
        };
        if assigned {
            self.adopt(incoming);
            Ok(SessionEnd::Adopted)
        } else {
            self.discard(incoming, reason);
            Ok(SessionEnd::Discarded)
        }
    }

    fn admit(&self, inner: &RecipientInner, request: &BeginCloneRequest) -> MigrationResult<Admission> {
        let Some(current) = inner.session.as_ref() else {
            return Ok(Admission::Start);
        };
        if current.session_id == request.session_id {
            if current.state.is_live() {
                return Ok(Admission::AlreadyActive);
            }
            return Err(MigrationError::stale(&request.session_id, None));
        }
        if !current.state.is_live() {
            return Ok(Admission::Start);
        }
        let idle = current.last_activity.elapsed();
        match self.idle_timeout {
            Some(limit) if idle >= limit => Ok(Admission::Displace {
                session_id: current.session_id.clone(),
                idle,
            }),
            _ => Err(MigrationError::RecipientBusy {
                shard: self.shard,
                active: current.session_id.clone(),
            }),
        }
    }

    async fn handle_begin_clone(&self, request: BeginCloneRequest) -> MigrationResult<()> {
        if request.donor == self.shard {
            return Err(MigrationError::InvalidRequest(format!(
                "shard {} cannot receive from itself",
                self.shard
            )));
        }
        loop {
            let admission = self.admit(&self.lock(), &request)?;
            match admission {
                Admission::AlreadyActive => return Ok(()),
                Admission::Displace { session_id, idle } => {
                    tracing::warn!(
                        shard = self.shard,
                        stale_session = %session_id,
                        session_id = %request.session_id,
                        idle_ms = idle.as_millis() as u64,
                        "displacing idle incoming migration"
                    );
                    let reason = MigrationError::Timeout {
                        phase: "recipient_idle".to_string(),
                        elapsed_ms: idle.as_millis().min(u128::from(u64::MAX)) as u64,
                    };
                    self.end_incoming(&session_id, Some(reason)).await?;
                }
                Admission::Start => {
                    let mut inner = self.lock();
                    // Re-check under the lock that applies the change.
                    if matches!(self.admit(&inner, &request)?, Admission::Start) {
                        return self.start_session(&mut inner, request);
                    }
                }
            }
        }
    }

    fn start_session(
        &self,
        inner: &mut RecipientInner,
        request: BeginCloneRequest,
    ) -> MigrationResult<()> {
        if self
            .store
            .owned_ranges(&request.collection)
            .iter()
            .any(|owned| owned.overlaps(&request.range))
        {
            return Err(MigrationError::InvalidRequest(format!(
                "shard {} already owns part of {} in {}",
                self.shard, request.range, request.collection
            )));
        }

        self.store
            .reserve_incoming(&request.session_id, &request.collection, &request.range);
        let purged = self
            .store
            .purge_unowned(&request.collection, &request.range);
        tracing::info!(
            shard = self.shard,
            session_id = %request.session_id,
            collection = %request.collection,
            range = %request.range,
            donor = request.donor,
            purged,
            "recipient began clone"
        );
        inner.session = Some(Incoming {
            session_id: request.session_id,
            collection: request.collection,
            range: request.range,
            donor: request.donor,
            clone_epoch: request.clone_epoch,
            state: RecipientState::Cloning,
            cloned_docs: 0,
            cloned_bytes: 0,
            applied_ops: 0,
            last_applied_seq: 0,
            last_error: None,
            last_activity: Instant::now(),
        });
        Ok(())
    }

    fn handle_clone_batch(&self, batch: CloneBatch) -> MigrationResult<u64> {
        let mut inner = self.lock();
        let incoming = inner.live(&batch.session_id)?;
        if incoming.state != RecipientState::Cloning {
            return Err(MigrationError::InvalidState(format!(
                "clone batch for {} after catch-up started",
                batch.session_id
            )));
        }
        if batch.clone_epoch != incoming.clone_epoch {
            return Err(MigrationError::InvalidState(format!(
                "clone batch epoch {} does not match session epoch {}",
                batch.clone_epoch, incoming.clone_epoch
            )));
        }
        let docs: Vec<Document> = batch
            .docs
            .into_iter()
            .filter(|doc| incoming.range.contains_key(&doc.key))
            .collect();
        let bytes: usize = docs.iter().map(Document::size_bytes).sum();
        let written = self.store.ingest_unowned(&incoming.collection, docs);
        incoming.cloned_docs += written as u64;
        incoming.cloned_bytes += bytes as u64;
        incoming.last_activity = Instant::now();
        tracing::debug!(
            shard = self.shard,
            session_id = %incoming.session_id,
            written,
            total = incoming.cloned_docs,
            "recipient ingested clone batch"
        );
        Ok(incoming.cloned_docs)
    }

    async fn handle_transfer_mods(
        &self,
        session_id: &SessionId,
        batch: XferBatch,
    ) -> MigrationResult<ModsAck> {
        let gap = match self.apply_mods(session_id, batch) {
            Ok(ack) => return Ok(ack),
            Err(ModsRejection::Refused(err)) => return Err(err),
            Err(ModsRejection::Gap(err)) => err,
        };
        tracing::warn!(
            shard = self.shard,
            session_id = %session_id,
            error = %gap,
            "aborting incoming migration"
        );
        if let Err(err) = self.end_incoming(session_id, Some(gap.clone())).await {
            tracing::warn!(
                shard = self.shard,
                session_id = %session_id,
                error = %err,
                "incoming migration left for the donor to abort"
            );
        }
        Err(gap)
    }

    fn apply_mods(&self, session_id: &SessionId, batch: XferBatch) -> Result<ModsAck, ModsRejection> {
        let mut inner = self.lock();
        let incoming = inner.live(session_id).map_err(ModsRejection::Refused)?;
        if let Some(foreign) = batch.entries.iter().find(|e| e.session_id != *session_id) {
            return Err(ModsRejection::Refused(MigrationError::stale(
                &foreign.session_id,
                Some(session_id),
            )));
        }
        match incoming.state {
            RecipientState::Cloning => incoming.state = RecipientState::Catchup,
            RecipientState::Catchup => {}
            other => {
                return Err(ModsRejection::Refused(MigrationError::InvalidState(format!(
                    "transfer mods for {session_id} in recipient state {other:?}"
                ))))
            }
        }

        // Validate contiguity before touching the store.
        let applied_through = incoming.last_applied_seq;
        let mut expected = applied_through;
        for entry in batch.entries.iter().filter(|e| e.seq > applied_through) {
            if entry.seq != expected + 1 {
                return Err(ModsRejection::Gap(MigrationError::InvalidState(format!(
                    "transfer log gap for {session_id}: expected seq {}, got {}",
                    expected + 1,
                    entry.seq
                ))));
            }
            expected = entry.seq;
        }

        let mut applied = 0u64;
        for entry in batch.entries {
            if entry.seq <= incoming.last_applied_seq {
                continue;
            }
            if incoming.range.contains_key(entry.op.key()) {
                self.store.apply_unowned(&incoming.collection, entry.op);
            }
            incoming.last_applied_seq = entry.seq;
            applied += 1;
        }
        incoming.applied_ops += applied;
        incoming.last_activity = Instant::now();
        Ok(ModsAck {
            applied_through: incoming.last_applied_seq,
            backlog: batch.remaining,
        })
    }

    fn handle_commit(&self, session_id: &SessionId) -> MigrationResult<()> {
        let mut inner = self.lock();
        if inner
            .session
            .as_ref()
            .is_some_and(|s| s.session_id == *session_id && s.state == RecipientState::Steady)
        {
            return Ok(());
        }
        let incoming = inner.live(session_id)?;
        if incoming.state != RecipientState::Catchup {
            return Err(MigrationError::InvalidState(format!(
                "commit for {session_id} before catch-up"
            )));
        }
        incoming.state = RecipientState::Committing;
        self.store
            .assume_ownership(&incoming.collection, &incoming.range);
        self.store.release_incoming(session_id);
        incoming.state = RecipientState::Steady;
        incoming.last_activity = Instant::now();
        tracing::info!(
            shard = self.shard,
            session_id = %session_id,
            collection = %incoming.collection,
            range = %incoming.range,
            cloned_docs = incoming.cloned_docs,
            applied_ops = incoming.applied_ops,
            "recipient serving migrated range"
        );
        Ok(())
    }

    async fn handle_abort(&self, session_id: &SessionId) -> MigrationResult<()> {
        let committed = || {
            MigrationError::InvalidState(format!("cannot abort {session_id} after commit"))
        };
        loop {
            {
                let inner = self.lock();
                let Some(current) = inner.session.as_ref() else {
                    return Ok(());
                };
                if current.session_id != *session_id {
                    if current.state.is_live() {
                        return Err(MigrationError::stale(session_id, Some(&current.session_id)));
                    }
                    return Ok(());
                }
                match current.state {
                    RecipientState::Aborted => return Ok(()),
                    RecipientState::Steady => return Err(committed()),
                    _ => {}
                }
            }
            match self.end_incoming(session_id, None).await? {
                SessionEnd::Discarded => return Ok(()),
                SessionEnd::Adopted => return Err(committed()),
                SessionEnd::Gone => {}
            }
        }
    }

    fn snapshot_status(&self) -> RecipientStatus {
        let inner = self.lock();
        match inner.session.as_ref() {
            None => RecipientStatus {
                shard: self.shard,
                state: RecipientState::Idle,
                session_id: None,
                collection: None,
                range: None,
                donor: None,
                cloned_docs: 0,
                cloned_bytes: 0,
                applied_ops: 0,
                last_applied_seq: 0,
                last_error: None,
            },
            Some(s) => RecipientStatus {
                shard: self.shard,
                state: s.state,
                session_id: Some(s.session_id.clone()),
                collection: Some(s.collection.clone()),
                range: Some(s.range.clone()),
                donor: Some(s.donor),
                cloned_docs: s.cloned_docs,
                cloned_bytes: s.cloned_bytes,
                applied_ops: s.applied_ops,
                last_applied_seq: s.last_applied_seq,
                last_error: s.last_error.clone(),
            },
        }
    }
}

#[async_trait]
impl RecipientEndpoint for RecipientIngestWorker {
    async fn begin_clone(&self, request: BeginCloneRequest) -> MigrationResult<()> {
        self.handle_begin_clone(request).await
    }

    async fn clone_batch(&self, batch: CloneBatch) -> MigrationResult<u64> {
        self.handle_clone_batch(batch)
    }

    async fn transfer_mods(
        &self,
        session_id: &SessionId,
        batch: XferBatch,
    ) -> MigrationResult<ModsAck> {
        self.handle_transfer_mods(session_id, batch).await
    }

    async fn commit(&self, session_id: &SessionId) -> MigrationResult<()> {
        self.handle_commit(session_id)
    }

    async fn abort(&self, session_id: &SessionId) -> MigrationResult<()> {
        self.handle_abort(session_id).await
    }

    async fn status(&self) -> MigrationResult<RecipientStatus> {
        Ok(self.snapshot_status())
    }
}
