//! Donor-side migration coordinator.
//!
//! Each accepted request runs as one spawned task that walks
//! `Created -> ClonePrep -> Cloning -> SteadyState -> Committing` and ends in
//! `Committed` or `Aborted`.
//!
//! Runtime safety model:
//! - The session registry admits the request; the session is released only
//!   once the task reaches a terminal state.
//! - Every wait before the catalog compare-and-swap races the session's
//!   cancellation token and the current phase deadline.
//! - Writes to the range are blocked only for the final drain. That window
//!   stays open across the catalog commit so nothing lands on the donor after
//!   the last drain.
//! - Once the catalog accepts the ownership change the migration cannot be
//!   cancelled or rolled back. The recipient commit is retried until the
//!   recipient acknowledges it.

use std::collections::{BTreeMap, VecDeque};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::catalog::{CasOutcome, CollectionRouting, OwnershipCatalog};
use crate::checkpoint::{Checkpoint, Checkpoints};
use crate::config::{enabled, MigrationConfig};
use crate::error::{MigrationError, MigrationResult};
use crate::recipient::{BeginCloneRequest, RecipientEndpoint};
use crate::registry::{LiveSession, SessionRegistry};
use crate::retry::RetryPolicy;
use crate::store::{CriticalSection, RangeLock, ShardStore};
use crate::types::{
    now_unix_ms, CloneBatch, CommitDecision, Document, KeyRange, MigrationState, MigrationStatus,
    SessionId, ShardId,
};
use crate::xfer_log::TransferLog;

/// Recipient endpoints reachable from this donor, by shard.
#[derive(Default)]
pub struct RecipientDirectory {
    endpoints: RwLock<BTreeMap<ShardId, Arc<dyn RecipientEndpoint>>>,
}

impl RecipientDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, shard: ShardId, endpoint: Arc<dyn RecipientEndpoint>) {
        self.endpoints
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(shard, endpoint);
    }

    pub fn get(&self, shard: ShardId) -> Option<Arc<dyn RecipientEndpoint>> {
        self.endpoints
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&shard)
            .cloned()
    }
}

#[derive(Default)]
struct BoardInner {
    statuses: BTreeMap<SessionId, MigrationStatus>,
    logs: BTreeMap<SessionId, Arc<TransferLog>>,
    finished: VecDeque<SessionId>,
}

/// Latest status of live sessions plus a bounded tail of finished ones.
struct StatusBoard {
    history: usize,
    inner: Mutex<BoardInner>,
}

impl StatusBoard {
    fn new(history: usize) -> Self {
        Self {
            history,
            inner: Mutex::new(BoardInner::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BoardInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self, status: MigrationStatus) {
        self.lock()
            .statuses
            .insert(status.session_id.clone(), status);
    }

    fn attach_log(&self, session_id: &SessionId, log: Arc<TransferLog>) {
        self.lock().logs.insert(session_id.clone(), log);
    }

    fn finish(&self, status: MigrationStatus) {
        let mut inner = self.lock();
        let session_id = status.session_id.clone();
        inner.logs.remove(&session_id);
        inner.statuses.insert(session_id.clone(), status);
        inner.finished.push_back(session_id);
        while inner.finished.len() > self.history {
            if let Some(evicted) = inner.finished.pop_front() {
                inner.statuses.remove(&evicted);
            }
        }
    }

    fn get(&self, session_id: &SessionId) -> Option<MigrationStatus> {
        let inner = self.lock();
        let mut status = inner.statuses.get(session_id)?.clone();
        if let Some(log) = inner.logs.get(session_id) {
            status.backlog = log.backlog();
        }
        Some(status)
    }

    fn all(&self) -> Vec<MigrationStatus> {
        let inner = self.lock();
        inner
            .statuses
            .values()
            .cloned()
            .map(|mut status| {
                if let Some(log) = inner.logs.get(&status.session_id) {
                    status.backlog = log.backlog();
                }
                status
            })
            .collect()
    }
}

/// Handle to a running migration.
pub struct MigrationHandle {
    session_id: SessionId,
    task: JoinHandle<MigrationStatus>,
}

impl MigrationHandle {
    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    /// Wait for the terminal status.
    pub async fn wait(self) -> MigrationResult<MigrationStatus> {
        self.task.await.map_err(|err| {
            MigrationError::InvalidState(format!("migration task {} failed: {err}", self.session_id))
        })
    }
}

/// Donor-side driver for migrations out of one shard.
pub struct MigrationCoordinator {
    shard: ShardId,
    store: Arc<ShardStore>,
    registry: Arc<SessionRegistry>,
    catalog: Arc<dyn OwnershipCatalog>,
    recipients: Arc<RecipientDirectory>,
    cfg: MigrationConfig,
    retry: RetryPolicy,
    checkpoints: Arc<Checkpoints>,
    statuses: Arc<StatusBoard>,
}

impl MigrationCoordinator {
    pub fn new(
        store: Arc<ShardStore>,
        registry: Arc<SessionRegistry>,
        catalog: Arc<dyn OwnershipCatalog>,
        recipients: Arc<RecipientDirectory>,
        cfg: MigrationConfig,
    ) -> Self {
        let statuses = Arc::new(StatusBoard::new(cfg.status_history));
        Self {
            shard: store.shard(),
            store,
            registry,
            catalog,
            recipients,
            cfg,
            retry: RetryPolicy::default(),
            checkpoints: Arc::new(Checkpoints::new()),
            statuses,
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_checkpoints(mut self, checkpoints: Arc<Checkpoints>) -> Self {
        self.checkpoints = checkpoints;
        self
    }

    pub fn shard(&self) -> ShardId {
        self.shard
    }

    pub fn checkpoints(&self) -> &Arc<Checkpoints> {
        &self.checkpoints
    }

    /// Admit a migration of `range` to `to_shard` and start driving it.
    ///
    /// Registry conflicts fail here, before any task is spawned. Must be
    /// called from within a Tokio runtime.
    pub fn request_migration(
        &self,
        collection: &str,
        range: KeyRange,
        to_shard: ShardId,
    ) -> MigrationResult<MigrationHandle> {
        let endpoint = self.recipients.get(to_shard).ok_or_else(|| {
            MigrationError::InvalidRequest(format!("no recipient endpoint for shard {to_shard}"))
        })?;
        let session = self
            .registry
            .acquire(collection, &range, self.shard, to_shard)?;
        tracing::info!(
            session_id = %session.id,
            collection,
            range = %range,
            donor = self.shard,
            recipient = to_shard,
            "migration accepted"
        );

        let status = MigrationStatus {
            session_id: session.id.clone(),
            collection: session.collection.clone(),
            range: session.range.clone(),
            donor: session.donor,
            recipient: session.recipient,
            state: MigrationState::Created,
            backlog: 0,
            last_error: None,
            clone_epoch: None,
            cloned_docs: 0,
            cloned_bytes: 0,
            catchup_ops: 0,
            steady_ops: 0,
            created_unix_ms: session.created_unix_ms,
            updated_unix_ms: session.created_unix_ms,
        };
        self.statuses.publish(status.clone());

        let session_id = session.id.clone();
        let run = MigrationRun {
            store: self.store.clone(),
            registry: self.registry.clone(),
            catalog: self.catalog.clone(),
            endpoint,
            cfg: self.cfg.clone(),
            retry: self.retry,
            checkpoints: self.checkpoints.clone(),
            statuses: self.statuses.clone(),
            session,
            status,
            phase: MigrationState::Created.as_str(),
            phase_started: Instant::now(),
            range_lock: None,
            critical: None,
            log: None,
            recipient_contacted: false,
        };
        let task = tokio::spawn(run.run());
        Ok(MigrationHandle { session_id, task })
    }

    /// Request a migration and wait for it. An aborted migration returns
    /// the error that aborted it.
    pub async fn run_migration(
        &self,
        collection: &str,
        range: KeyRange,
        to_shard: ShardId,
    ) -> MigrationResult<MigrationStatus> {
        let status = self
            .request_migration(collection, range, to_shard)?
            .wait()
            .await?;
        match (&status.state, &status.last_error) {
            (MigrationState::Aborted, Some(err)) => Err(err.clone()),
            _ => Ok(status),
        }
    }

    /// Interrupt a live session. It aborts unless the catalog already
    /// committed the ownership change.
    pub fn interrupt(&self, session_id: &SessionId) -> MigrationResult<()> {
        self.registry.interrupt(session_id)?;
        tracing::info!(session_id = %session_id, "migration interrupt requested");
        Ok(())
    }

    pub fn migration_status(&self, session_id: &SessionId) -> MigrationResult<MigrationStatus> {
        self.statuses
            .get(session_id)
            .ok_or_else(|| MigrationError::UnknownSession(session_id.clone()))
    }

    /// Statuses of live and recently finished migrations of this donor.
    pub fn statuses(&self) -> Vec<MigrationStatus> {
        self.statuses.all()
    }
}

/// State owned by one migration task.
struct MigrationRun {
    store: Arc<ShardStore>,
    registry: Arc<SessionRegistry>,
    catalog: Arc<dyn OwnershipCatalog>,
    endpoint: Arc<dyn RecipientEndpoint>,
    cfg: MigrationConfig,
    retry: RetryPolicy,
    checkpoints: Arc<Checkpoints>,
    statuses: Arc<StatusBoard>,
    session: LiveSession,
    status: MigrationStatus,
    phase: &'static str,
    phase_started: Instant,
    range_lock: Option<RangeLock>,
    critical: Option<CriticalSection>,
    log: Option<Arc<TransferLog>>,
    recipient_contacted: bool,
}

impl MigrationRun {
    async fn run(mut self) -> MigrationStatus {
        if let Err(err) = self.drive().await {
            self.abort(err).await;
        }
        self.statuses.finish(self.status.clone());
        self.status
    }

    async fn drive(&mut self) -> MigrationResult<()> {
        self.range_lock = Some(self.store.lock_range(
            &self.session.id,
            &self.session.collection,
            &self.session.range,
        ));
        self.enter(MigrationState::Created).await?;

        self.enter(MigrationState::ClonePrep).await?;
        let snapshot = self.prepare().await?;

        self.enter(MigrationState::Cloning).await?;
        self.clone_snapshot(snapshot).await?;

        self.enter(MigrationState::SteadyState).await?;
        self.catch_up().await?;
        self.final_drain().await?;

        self.enter(MigrationState::Committing).await?;
        let new_epoch = self.commit_catalog().await?;
        self.complete(new_epoch).await;
        Ok(())
    }

    fn update(&mut self, apply: impl FnOnce(&mut MigrationStatus)) {
        apply(&mut self.status);
        self.status.updated_unix_ms = now_unix_ms();
        self.statuses.publish(self.status.clone());
    }

    fn set_state(&mut self, state: MigrationState) {
        self.phase = state.as_str();
        self.phase_started = Instant::now();
        let backlog = self.log.as_ref().map_or(0, |log| log.backlog());
        self.update(|s| {
            s.state = state;
            s.backlog = backlog;
        });
        tracing::info!(
            session_id = %self.session.id,
            collection = %self.session.collection,
            range = %self.session.range,
            donor = self.session.donor,
            recipient = self.session.recipient,
            state = ?state,
            "migration state changed"
        );
    }

    /// Move to a non-terminal state and honour any checkpoint armed there.
    async fn enter(&mut self, state: MigrationState) -> MigrationResult<()> {
        self.set_state(state);
        self.pause(Checkpoint::Enter(state)).await
    }

    async fn pause(&self, point: Checkpoint) -> MigrationResult<()> {
        let checkpoints = self.checkpoints.clone();
        let session_id = self.session.id.clone();
        self.guarded(None, true, async move {
            checkpoints.reach(&session_id, point).await;
            Ok(())
        })
        .await
    }

    /// Enter a terminal state. Checkpoints still fire but cannot interrupt.
    async fn finish_in(&mut self, state: MigrationState) {
        self.set_state(state);
        self.checkpoints
            .reach(&self.session.id, Checkpoint::Enter(state))
            .await;
    }

    fn timeout_error(&self) -> MigrationError {
        MigrationError::Timeout {
            phase: self.phase.to_string(),
            elapsed_ms: self.phase_started.elapsed().as_millis().min(u128::from(u64::MAX)) as u64,
        }
    }

    /// Race `fut` against the phase deadline and, if `cancellable`, the
    /// session's cancellation token.
    async fn guarded<T>(
        &self,
        deadline: Option<Instant>,
        cancellable: bool,
        fut: impl Future<Output = MigrationResult<T>>,
    ) -> MigrationResult<T> {
        let cancelled = async {
            if cancellable {
                self.session.cancel.cancelled().await;
            } else {
                std::future::pending::<()>().await;
            }
        };
        tokio::select! {
            biased;
            _ = cancelled => Err(MigrationError::OperatorInterrupted),
            _ = sleep_until(deadline) => Err(self.timeout_error()),
            res = fut => res,
        }
    }

    /// Call the recipient, retrying transport failures with backoff.
    async fn call<T, F, Fut>(
        &self,
        op: &'static str,
        deadline: Option<Instant>,
        cancellable: bool,
        mut call: F,
    ) -> MigrationResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = MigrationResult<T>>,
    {
        let salt = self.session.id.seq ^ self.session.donor.rotate_left(32);
        let mut failures = 0u32;
        loop {
            match self.guarded(deadline, cancellable, call()).await {
                Err(err) if err.is_retryable() => {
                    failures += 1;
                    let Some(delay) = self.retry.delay_after(salt, failures) else {
                        tracing::warn!(
                            session_id = %self.session.id,
                            op,
                            failures,
                            error = %err,
                            "retries exhausted"
                        );
                        return Err(err);
                    };
                    tracing::debug!(
                        session_id = %self.session.id,
                        op,
                        failures,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "retrying after transient failure"
                    );
                    self.guarded(deadline, cancellable, async {
                        tokio::time::sleep(delay).await;
                        Ok(())
                    })
                    .await?;
                }
                other => return other,
            }
        }
    }

    fn transfer_log(&self) -> MigrationResult<Arc<TransferLog>> {
        self.log.clone().ok_or_else(|| {
            MigrationError::InvalidState(format!("no transfer log for {}", self.session.id))
        })
    }

    fn clone_epoch(&self) -> MigrationResult<u64> {
        self.status.clone_epoch.ok_or_else(|| {
            MigrationError::InvalidState(format!("no clone epoch for {}", self.session.id))
        })
    }

    /// Verify ownership against the catalog, record the clone epoch, then
    /// snapshot the range and start capturing writes.
    async fn prepare(&mut self) -> MigrationResult<Vec<Document>> {
        let catalog = self.catalog.clone();
        let collection = self.session.collection.clone();
        let routing = self
            .call("catalog_read", None, true, || {
                let catalog = catalog.clone();
                let collection = collection.clone();
                async move { catalog.read(&collection).await.map_err(MigrationError::from) }
            })
            .await?;
        if !routing.owned_by(self.session.donor, &self.session.range) {
            return Err(MigrationError::RangeNotOwned {
                shard: self.session.donor,
                collection: self.session.collection.clone(),
                range: self.session.range.clone(),
            });
        }

        let (snapshot, log) = self.store.begin_transfer(
            &self.session.id,
            &self.session.collection,
            &self.session.range,
            self.cfg.xfer_log_max_entries,
        )?;
        self.statuses.attach_log(&self.session.id, log.clone());
        self.log = Some(log);
        let epoch = routing.epoch;
        self.update(|s| s.clone_epoch = Some(epoch));
        tracing::debug!(
            session_id = %self.session.id,
            clone_epoch = epoch,
            docs = snapshot.len(),
            "clone snapshot taken"
        );
        Ok(snapshot)
    }

    async fn clone_snapshot(&mut self, snapshot: Vec<Document>) -> MigrationResult<()> {
        let deadline = enabled(self.cfg.clone_timeout).map(|d| Instant::now() + d);
        let clone_epoch = self.clone_epoch()?;
        let log = self.transfer_log()?;
        let endpoint = self.endpoint.clone();

        let request = BeginCloneRequest {
            session_id: self.session.id.clone(),
            collection: self.session.collection.clone(),
            range: self.session.range.clone(),
            donor: self.session.donor,
            clone_epoch,
        };
        self.recipient_contacted = true;
        self.call("begin_clone", deadline, true, || {
            let endpoint = endpoint.clone();
            let request = request.clone();
            async move { endpoint.begin_clone(request).await }
        })
        .await?;

        let batches = clone_batches(
            snapshot,
            self.cfg.clone_batch_max_docs,
            self.cfg.clone_batch_max_bytes,
        );
        let total = batches.len();
        for (idx, docs) in batches.into_iter().enumerate() {
            log.check_overflow()?;
            let batch = CloneBatch {
                session_id: self.session.id.clone(),
                clone_epoch,
                docs,
            };
            let count = batch.docs.len() as u64;
            let bytes = batch.size_bytes() as u64;
            self.call("clone_batch", deadline, true, || {
                let endpoint = endpoint.clone();
                let batch = batch.clone();
                async move { endpoint.clone_batch(batch).await }
            })
            .await?;
            self.update(|s| {
                s.cloned_docs += count;
                s.cloned_bytes += bytes;
            });
            tracing::debug!(
                session_id = %self.session.id,
                batch = idx + 1,
                total,
                docs = count,
                "clone batch delivered"
            );
            self.pause(Checkpoint::AfterCloneBatch).await?;
        }
        log.check_overflow()
    }

    /// Ship one transfer-mods batch (possibly empty) and return the backlog
    /// left after the acknowledgement.
    async fn drain_once(&mut self, deadline: Option<Instant>, steady: bool) -> MigrationResult<usize> {
        let log = self.transfer_log()?;
        log.check_overflow()?;
        let batch = log.next_batch(self.cfg.xfer_batch_max_entries);
        let shipped = batch.entries.len() as u64;
        let endpoint = self.endpoint.clone();
        let session_id = self.session.id.clone();
        let ack = self
            .call("transfer_mods", deadline, true, || {
                let endpoint = endpoint.clone();
                let session_id = session_id.clone();
                let batch = batch.clone();
                async move { endpoint.transfer_mods(&session_id, batch).await }
            })
            .await?;
        let backlog = log.ack(ack.applied_through);
        self.update(|s| {
            if steady {
                s.steady_ops += shipped;
            } else {
                s.catchup_ops += shipped;
            }
            s.backlog = backlog;
        });
        if shipped > 0 {
            tracing::debug!(
                session_id = %self.session.id,
                shipped,
                applied_through = ack.applied_through,
                backlog,
                "transfer mods delivered"
            );
        }
        Ok(backlog)
    }

    /// Drain the transfer log until the recipient reports no backlog.
    async fn catch_up(&mut self) -> MigrationResult<()> {
        let deadline = enabled(self.cfg.catchup_timeout).map(|d| Instant::now() + d);
        loop {
            let backlog = self.drain_once(deadline, false).await?;
            if backlog == 0 {
                return Ok(());
            }
            if !self.cfg.steady_poll_interval.is_zero() {
                let poll = self.cfg.steady_poll_interval;
                self.guarded(deadline, true, async move {
                    tokio::time::sleep(poll).await;
                    Ok(())
                })
                .await?;
            }
        }
    }

    /// Block writes to the range and drain at least once more, within the
    /// configured window.
    async fn final_drain(&mut self) -> MigrationResult<()> {
        self.critical = Some(self.store.block_writes(
            &self.session.id,
            &self.session.collection,
            &self.session.range,
        ));
        self.pause(Checkpoint::CriticalSection).await?;

        self.phase = "final_drain";
        self.phase_started = Instant::now();
        let deadline = Some(Instant::now() + self.cfg.final_drain_window);
        loop {
            if self.drain_once(deadline, true).await? == 0 {
                return Ok(());
            }
        }
    }

    /// Compare-and-swap ownership in the catalog. Not cancellable once sent.
    async fn commit_catalog(&mut self) -> MigrationResult<u64> {
        if self.session.cancel.is_cancelled() {
            return Err(MigrationError::OperatorInterrupted);
        }
        let decision = CommitDecision {
            collection: self.session.collection.clone(),
            range: self.session.range.clone(),
            from_owner: self.session.donor,
            to_owner: self.session.recipient,
            expected_epoch: self.clone_epoch()?,
        };
        match self.cas_with_retry(&decision).await? {
            CasOutcome::Committed { new_epoch } => Ok(new_epoch),
            CasOutcome::Conflict { current_epoch } => Err(MigrationError::CatalogEpochConflict {
                collection: decision.collection,
                expected: decision.expected_epoch,
                actual: current_epoch,
            }),
        }
    }

    /// Run `fut` under the per-attempt commit deadline.
    async fn commit_attempt<T>(
        &self,
        what: &'static str,
        fut: impl Future<Output = anyhow::Result<T>>,
    ) -> anyhow::Result<T> {
        match enabled(self.cfg.commit_timeout) {
            Some(limit) => tokio::time::timeout(limit, fut)
                .await
                .unwrap_or_else(|_| Err(anyhow::anyhow!("{what} timed out"))),
            None => fut.await,
        }
    }

    /// Compare-and-swap with retries.
    ///
    /// An attempt that fails without an answer may still have landed, so from
    /// then on a conflict can be this session's own write. Such outcomes are
    /// settled by reading the catalog, never by guessing.
    async fn cas_with_retry(&self, decision: &CommitDecision) -> MigrationResult<CasOutcome> {
        let salt = self.session.id.seq;
        let mut failures = 0u32;
        let mut unanswered = false;
        loop {
            let attempt = self
                .commit_attempt("catalog commit", self.catalog.cas_owner(decision))
                .await;
            let err = match attempt {
                Ok(CasOutcome::Conflict { current_epoch }) if unanswered => {
                    tracing::info!(
                        session_id = %self.session.id,
                        current_epoch,
                        "catalog conflict after an unanswered commit"
                    );
                    let routing = self.read_catalog_until_answered(decision).await;
                    return Ok(observed_outcome(decision, &routing)
                        .unwrap_or(CasOutcome::Conflict { current_epoch }));
                }
                Ok(outcome) => return Ok(outcome),
                Err(err) => err,
            };
            unanswered = true;

            // The write may have landed before the failure; the catalog decides.
            match self
                .commit_attempt("catalog read", self.catalog.read(&decision.collection))
                .await
            {
                Ok(routing) => {
                    if let Some(outcome) = observed_outcome(decision, &routing) {
                        return Ok(outcome);
                    }
                }
                Err(read_err) => tracing::debug!(
                    session_id = %self.session.id,
                    error = ?read_err,
                    "catalog read after failed commit also failed"
                ),
            }

            failures += 1;
            let Some(delay) = self.retry.delay_after(salt, failures) else {
                let routing = self.read_catalog_until_answered(decision).await;
                if let Some(outcome) = observed_outcome(decision, &routing) {
                    return Ok(outcome);
                }
                tracing::warn!(
                    session_id = %self.session.id,
                    failures,
                    error = ?err,
                    "catalog commit failed"
                );
                return Err(MigrationError::from(err));
            };
            tracing::debug!(
                session_id = %self.session.id,
                failures,
                error = ?err,
                "retrying catalog commit"
            );
            tokio::time::sleep(delay).await;
        }
    }

    /// Read the catalog until it answers. Used once giving up could leave the
    /// donor and the catalog disagreeing about the owner.
    async fn read_catalog_until_answered(&self, decision: &CommitDecision) -> CollectionRouting {
        let salt = self.session.id.seq;
        let mut failures = 0u32;
        loop {
            match self
                .commit_attempt("catalog read", self.catalog.read(&decision.collection))
                .await
            {
                Ok(routing) => return routing,
                Err(err) => {
                    failures += 1;
                    tracing::warn!(
                        session_id = %self.session.id,
                        failures,
                        error = ?err,
                        "catalog unreadable while commit outcome is unknown"
                    );
                    tokio::time::sleep(self.retry.persistent_delay(salt, failures)).await;
                }
            }
        }
    }

    /// Deliver the commit to the recipient. The catalog already names it as
    /// owner, so transport failures are retried for as long as it takes.
    async fn commit_recipient(&mut self) {
        let salt = self.session.id.seq ^ self.session.recipient.rotate_left(32);
        let mut failures = 0u32;
        loop {
            let attempt = match enabled(self.cfg.commit_timeout) {
                Some(limit) => tokio::time::timeout(limit, self.endpoint.commit(&self.session.id))
                    .await
                    .unwrap_or_else(|_| {
                        Err(MigrationError::Transport("recipient commit timed out".into()))
                    }),
                None => self.endpoint.commit(&self.session.id).await,
            };
            match attempt {
                Ok(()) => {
                    if failures > 0 {
                        tracing::info!(
                            session_id = %self.session.id,
                            recipient = self.session.recipient,
                            failures,
                            "recipient committed after retries"
                        );
                        self.update(|s| s.last_error = None);
                    }
                    return;
                }
                Err(err) if err.is_retryable() => {
                    failures += 1;
                    let delay = self.retry.persistent_delay(salt, failures);
                    tracing::warn!(
                        session_id = %self.session.id,
                        recipient = self.session.recipient,
                        failures,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "recipient commit failed after catalog change, retrying"
                    );
                    self.update(|s| s.last_error = Some(err));
                    tokio::time::sleep(delay).await;
                }
                Err(err) => {
                    tracing::error!(
                        session_id = %self.session.id,
                        recipient = self.session.recipient,
                        error = %err,
                        "recipient refused commit after catalog change"
                    );
                    self.update(|s| s.last_error = Some(err));
                    return;
                }
            }
        }
    }

    /// Finish a migration the catalog has committed.
    async fn complete(&mut self, new_epoch: u64) {
        tracing::info!(
            session_id = %self.session.id,
            collection = %self.session.collection,
            range = %self.session.range,
            new_epoch,
            "catalog ownership committed"
        );
        self.store
            .relinquish_ownership(&self.session.collection, &self.session.range);
        self.store.end_transfer(&self.session.id);

        self.commit_recipient().await;

        // Writers blocked on the donor wake up and find the range gone.
        self.critical = None;
        self.log = None;
        self.store.schedule_range_deletion(
            &self.session.collection,
            &self.session.range,
            self.cfg.range_deletion_delay,
        );
        self.range_lock = None;
        self.finish_in(MigrationState::Committed).await;
        self.registry.release(&self.session.id);
    }

    async fn abort(&mut self, err: MigrationError) {
        tracing::warn!(
            session_id = %self.session.id,
            collection = %self.session.collection,
            range = %self.session.range,
            phase = self.phase,
            reason = err.kind(),
            error = %err,
            "migration aborted"
        );
        self.critical = None;
        self.store.end_transfer(&self.session.id);
        self.log = None;

        if self.recipient_contacted {
            let endpoint = self.endpoint.clone();
            let session_id = self.session.id.clone();
            let deadline = enabled(self.cfg.commit_timeout).map(|d| Instant::now() + d);
            let aborted = self
                .call("abort", deadline, false, || {
                    let endpoint = endpoint.clone();
                    let session_id = session_id.clone();
                    async move { endpoint.abort(&session_id).await }
                })
                .await;
            if let Err(abort_err) = aborted {
                tracing::warn!(
                    session_id = %self.session.id,
                    recipient = self.session.recipient,
                    error = %abort_err,
                    "recipient abort failed"
                );
            }
        }

        self.range_lock = None;
        self.update(|s| s.last_error = Some(err));
        self.finish_in(MigrationState::Aborted).await;
        self.registry.release(&self.session.id);
    }
}

/// What a catalog read says about a compare-and-swap whose reply was lost.
/// `None` while the epoch is unchanged, meaning the swap has not landed.
fn observed_outcome(decision: &CommitDecision, routing: &CollectionRouting) -> Option<CasOutcome> {
    if routing.epoch <= decision.expected_epoch {
        return None;
    }
    if routing.owned_by(decision.to_owner, &decision.range) {
        Some(CasOutcome::Committed {
            new_epoch: routing.epoch,
        })
    } else {
        Some(CasOutcome::Conflict {
            current_epoch: routing.epoch,
        })
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending::<()>().await,
    }
}

/// Split a snapshot into batches bounded by document count and bytes.
/// A document larger than `max_bytes` travels alone.
fn clone_batches(docs: Vec<Document>, max_docs: usize, max_bytes: usize) -> Vec<Vec<Document>> {
    let mut out = Vec::new();
    let mut current = Vec::new();
    let mut current_bytes = 0usize;
    for doc in docs {
        let size = doc.size_bytes();
        if !current.is_empty()
            && (current.len() >= max_docs || current_bytes.saturating_add(size) > max_bytes)
        {
            out.push(std::mem::take(&mut current));
            current_bytes = 0;
        }
        current_bytes = current_bytes.saturating_add(size);
        current.push(doc);
    }
    if !current.is_empty() {
        out.push(current);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    use async_trait::async_trait;

    use crate::catalog::InMemoryCatalog;
    use crate::recipient::RecipientIngestWorker;
    use crate::types::{u64_key, RecipientState};

    struct Fixture {
        donor: Arc<ShardStore>,
        recipient_store: Arc<ShardStore>,
        recipient: Arc<RecipientIngestWorker>,
        catalog: Arc<InMemoryCatalog>,
        registry: Arc<SessionRegistry>,
        coordinator: MigrationCoordinator,
    }

    async fn fixture(cfg: MigrationConfig) -> Fixture {
        fixture_with(cfg, RetryPolicy::default(), |catalog| -> Arc<dyn OwnershipCatalog> {
            catalog
        })
        .await
    }

    /// Fixture whose coordinator reaches the catalog through `wrap`.
    async fn fixture_with(
        cfg: MigrationConfig,
        retry: RetryPolicy,
        wrap: impl FnOnce(Arc<InMemoryCatalog>) -> Arc<dyn OwnershipCatalog>,
    ) -> Fixture {
        let donor = Arc::new(ShardStore::new(1));
        let recipient_store = Arc::new(ShardStore::new(2));
        let catalog = Arc::new(InMemoryCatalog::new());
        catalog.create_collection("x", 1).expect("create");
        donor.assume_ownership("x", &KeyRange::full());
        for id in 0..40 {
            donor
                .upsert("x", u64_key(id), format!("v{id}"))
                .await
                .expect("seed");
        }
        let recipient = Arc::new(
            RecipientIngestWorker::new(recipient_store.clone(), &cfg).with_catalog(catalog.clone()),
        );
        let directory = Arc::new(RecipientDirectory::new());
        directory.register(2, recipient.clone());
        let registry = Arc::new(SessionRegistry::new());
        let coordinator = MigrationCoordinator::new(
            donor.clone(),
            registry.clone(),
            wrap(catalog.clone()),
            directory,
            cfg,
        )
        .with_retry(retry);
        Fixture {
            donor,
            recipient_store,
            recipient,
            catalog,
            registry,
            coordinator,
        }
    }

    fn small_batches() -> MigrationConfig {
        MigrationConfig {
            clone_batch_max_docs: 4,
            range_deletion_delay: std::time::Duration::ZERO,
            ..MigrationConfig::default()
        }
    }

    #[test]
    fn clone_batches_respect_both_caps() {
        let docs: Vec<_> = (0..5)
            .map(|i| Document::new(u64_key(i), vec![0u8; 10]))
            .collect();
        let sizes: Vec<_> = clone_batches(docs.clone(), 2, 1_000)
            .iter()
            .map(Vec::len)
            .collect();
        assert_eq!(sizes, vec![2, 2, 1]);
        // 18 bytes per doc: two fit under 40.
        let sizes: Vec<_> = clone_batches(docs, 10, 40).iter().map(Vec::len).collect();
        assert_eq!(sizes, vec![2, 2, 1]);
        let oversized = vec![Document::new(u64_key(1), vec![0u8; 100])];
        assert_eq!(clone_batches(oversized, 10, 40).len(), 1);
    }

    #[tokio::test]
    async fn migration_moves_range_and_catalog() {
        let fx = fixture(small_batches()).await;
        let status = fx
            .coordinator
            .run_migration("x", KeyRange::u64s(0, 30), 2)
            .await
            .expect("migration commits");
        assert_eq!(status.state, MigrationState::Committed);
        assert_eq!(status.cloned_docs, 30);
        assert_eq!(status.last_error, None);
        assert_eq!(status.clone_epoch, Some(1));

        let routing = fx.catalog.routing("x").expect("routing");
        assert_eq!(routing.epoch, 2);
        assert!(routing.owned_by(2, &KeyRange::u64s(0, 30)));
        assert_eq!(fx.recipient.state(), RecipientState::Steady);
        assert_eq!(fx.recipient_store.scan("x", &KeyRange::full()).len(), 30);
        assert!(fx.donor.get("x", &u64_key(3)).is_err());
        assert_eq!(fx.donor.owned_documents("x").len(), 10);
        assert!(fx.registry.is_empty());

        let checkpoints = fx.coordinator.checkpoints().visited(&status.session_id);
        assert_eq!(
            checkpoints.first(),
            Some(&Checkpoint::Enter(MigrationState::Created))
        );
        assert_eq!(
            checkpoints.last(),
            Some(&Checkpoint::Enter(MigrationState::Committed))
        );
    }

    #[tokio::test]
    async fn interrupt_aborts_and_leaves_ownership() {
        let fx = fixture(small_batches()).await;
        let pause = fx
            .coordinator
            .checkpoints()
            .arm(Checkpoint::Enter(MigrationState::SteadyState));
        let handle = fx
            .coordinator
            .request_migration("x", KeyRange::u64s(0, 30), 2)
            .expect("accepted");
        let session_id = pause.wait_reached().await;
        assert_eq!(&session_id, handle.session_id());

        fx.coordinator.interrupt(&session_id).expect("interrupt");
        let status = handle.wait().await.expect("join");
        assert_eq!(status.state, MigrationState::Aborted);
        assert_eq!(status.last_error, Some(MigrationError::OperatorInterrupted));

        assert_eq!(fx.catalog.epoch("x"), Some(1));
        assert!(fx
            .catalog
            .routing("x")
            .expect("routing")
            .owned_by(1, &KeyRange::u64s(0, 30)));
        assert_eq!(fx.donor.owned_documents("x").len(), 40);
        assert_eq!(fx.recipient.state(), RecipientState::Aborted);
        assert_eq!(fx.recipient_store.orphan_count("x"), 0);
        assert!(fx.registry.is_empty());
        assert_eq!(
            fx.coordinator
                .migration_status(&session_id)
                .expect("status kept")
                .state,
            MigrationState::Aborted
        );
    }

    #[tokio::test]
    async fn unknown_recipient_is_rejected_up_front() {
        let fx = fixture(small_batches()).await;
        let err = fx
            .coordinator
            .request_migration("x", KeyRange::u64s(0, 30), 9)
            .err()
            .expect("no endpoint");
        assert_eq!(err.kind(), "invalid_request");
        assert!(fx.registry.is_empty());
    }

    #[tokio::test]
    async fn status_history_is_bounded() {
        let cfg = MigrationConfig {
            status_history: 1,
            ..small_batches()
        };
        let fx = fixture(cfg).await;
        let first = fx
            .coordinator
            .run_migration("x", KeyRange::u64s(0, 10), 2)
            .await
            .expect("first");
        let second = fx
            .coordinator
            .run_migration("x", KeyRange::u64s(10, 20), 2)
            .await
            .expect("second");
        assert!(fx.coordinator.migration_status(&first.session_id).is_err());
        assert_eq!(
            fx.coordinator
                .migration_status(&second.session_id)
                .expect("latest kept")
                .state,
            MigrationState::Committed
        );
        assert_eq!(fx.coordinator.statuses().len(), 1);
    }

    fn take_one(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    /// Catalog in front of an in-memory one that loses replies and reads.
    struct FlakyCatalog {
        inner: Arc<InMemoryCatalog>,
        /// Next N swaps are applied but reported as failed.
        lost_replies: AtomicU32,
        /// Next N swaps fail without being applied.
        failed_swaps: AtomicU32,
        /// Reads that fail after each lost reply.
        reads_lost_per_reply: u32,
        failing_reads: AtomicU32,
    }

    impl FlakyCatalog {
        fn wrap(
            lost_replies: u32,
            failed_swaps: u32,
            reads_lost_per_reply: u32,
        ) -> impl FnOnce(Arc<InMemoryCatalog>) -> Arc<dyn OwnershipCatalog> {
            move |inner| -> Arc<dyn OwnershipCatalog> {
                Arc::new(FlakyCatalog {
                    inner,
                    lost_replies: AtomicU32::new(lost_replies),
                    failed_swaps: AtomicU32::new(failed_swaps),
                    reads_lost_per_reply,
                    failing_reads: AtomicU32::new(0),
                })
            }
        }
    }

    #[async_trait]
    impl OwnershipCatalog for FlakyCatalog {
        async fn read(&self, collection: &str) -> anyhow::Result<CollectionRouting> {
            if take_one(&self.failing_reads) {
                anyhow::bail!("catalog read dropped");
            }
            self.inner.read(collection).await
        }

        async fn cas_owner(&self, decision: &CommitDecision) -> anyhow::Result<CasOutcome> {
            if take_one(&self.failed_swaps) {
                anyhow::bail!("catalog unavailable");
            }
            let outcome = self.inner.cas_owner(decision).await?;
            if take_one(&self.lost_replies) {
                self.failing_reads
                    .store(self.reads_lost_per_reply, Ordering::SeqCst);
                anyhow::bail!("catalog reply lost");
            }
            Ok(outcome)
        }
    }

    fn quick_retry() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 4,
            base_delay: std::time::Duration::from_millis(1),
            max_delay: std::time::Duration::from_millis(5),
        }
    }

    fn assert_handed_over(fx: &Fixture, status: &MigrationStatus) {
        assert_eq!(status.state, MigrationState::Committed);
        assert_eq!(status.last_error, None);
        let routing = fx.catalog.routing("x").expect("routing");
        assert_eq!(routing.epoch, 2);
        assert!(routing.owned_by(2, &KeyRange::u64s(0, 30)));
        assert!(!fx.donor.owns_key("x", &u64_key(5)));
        assert_eq!(fx.recipient.state(), RecipientState::Steady);
        assert_eq!(
            fx.recipient_store.get("x", &u64_key(5)).expect("recipient owns"),
            Some(b"v5".to_vec())
        );
        assert_eq!(fx.recipient_store.orphan_count("x"), 0);
    }

    #[tokio::test]
    async fn lost_commit_reply_is_settled_by_the_catalog() {
        let fx = fixture_with(small_batches(), quick_retry(), FlakyCatalog::wrap(1, 0, 1)).await;
        let status = fx
            .coordinator
            .run_migration("x", KeyRange::u64s(0, 30), 2)
            .await
            .expect("commit landed");
        assert_handed_over(&fx, &status);
    }

    #[tokio::test]
    async fn unreadable_catalog_is_waited_out_past_the_retry_budget() {
        let fx = fixture_with(small_batches(), quick_retry(), FlakyCatalog::wrap(1, 0, 10)).await;
        let status = fx
            .coordinator
            .run_migration("x", KeyRange::u64s(0, 30), 2)
            .await
            .expect("commit landed");
        assert_handed_over(&fx, &status);
    }

    #[tokio::test]
    async fn failed_commit_then_foreign_change_conflicts() {
        let fx = fixture_with(small_batches(), quick_retry(), FlakyCatalog::wrap(0, 1, 0)).await;
        let pause = fx
            .coordinator
            .checkpoints()
            .arm(Checkpoint::Enter(MigrationState::Committing));
        let handle = fx
            .coordinator
            .request_migration("x", KeyRange::u64s(0, 30), 2)
            .expect("accepted");
        pause.wait_reached().await;
        fx.catalog.split_chunk("x", &u64_key(50)).expect("split");
        pause.release();

        let status = handle.wait().await.expect("join");
        assert_eq!(status.state, MigrationState::Aborted);
        assert_eq!(
            status.last_error,
            Some(MigrationError::CatalogEpochConflict {
                collection: "x".into(),
                expected: 1,
                actual: 2,
            })
        );
        assert!(fx
            .catalog
            .routing("x")
            .expect("routing")
            .owned_by(1, &KeyRange::u64s(0, 30)));
        assert_eq!(fx.donor.owned_documents("x").len(), 40);
        assert_eq!(fx.recipient_store.orphan_count("x"), 0);
    }

    #[tokio::test]
    async fn commit_that_never_lands_aborts_after_retries() {
        let fx = fixture_with(small_batches(), quick_retry(), FlakyCatalog::wrap(0, 10, 0)).await;
        let status = fx
            .coordinator
            .request_migration("x", KeyRange::u64s(0, 30), 2)
            .expect("accepted")
            .wait()
            .await
            .expect("join");
        assert_eq!(status.state, MigrationState::Aborted);
        assert!(matches!(status.last_error, Some(MigrationError::Transport(_))));
        assert_eq!(fx.catalog.epoch("x"), Some(1));
        assert_eq!(fx.donor.owned_documents("x").len(), 40);
        assert_eq!(fx.recipient.state(), RecipientState::Aborted);
        assert_eq!(fx.recipient_store.orphan_count("x"), 0);
    }

    #[test]
    fn observed_outcome_reads_the_catalog() {
        let catalog = InMemoryCatalog::new();
        catalog.create_collection("x", 1).expect("create");
        let decision = CommitDecision {
            collection: "x".into(),
            range: KeyRange::u64s(0, 30),
            from_owner: 1,
            to_owner: 2,
            expected_epoch: 1,
        };
        let routing = catalog.routing("x").expect("routing");
        assert_eq!(observed_outcome(&decision, &routing), None);

        catalog.split_chunk("x", &u64_key(50)).expect("split");
        let routing = catalog.routing("x").expect("routing");
        assert_eq!(
            observed_outcome(&decision, &routing),
            Some(CasOutcome::Conflict { current_epoch: 2 })
        );
    }
}
