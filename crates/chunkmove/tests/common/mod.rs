//! Shared helpers for integration tests.

#![allow(dead_code)]

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chunkmove::{
    u64_key, BeginCloneRequest, CloneBatch, LocalCluster, MigrationConfig, MigrationError,
    MigrationResult, ModsAck, RecipientEndpoint, RecipientStatus, RetryPolicy, SessionId,
    ShardId, XferBatch,
};

/// Upper bound for any single awaited step in a test.
pub const STEP_TIMEOUT: Duration = Duration::from_secs(20);

/// Await `fut`, panicking with `what` if it takes longer than `STEP_TIMEOUT`.
pub async fn within<T>(what: &str, fut: impl Future<Output = T>) -> T {
    match tokio::time::timeout(STEP_TIMEOUT, fut).await {
        Ok(value) => value,
        Err(_) => panic!("timed out waiting for {what}"),
    }
}

/// Small batches so multi-batch paths are exercised, immediate range deletion.
pub fn test_config() -> MigrationConfig {
    MigrationConfig {
        clone_batch_max_docs: 4,
        xfer_batch_max_entries: 8,
        steady_poll_interval: Duration::from_millis(1),
        range_deletion_delay: Duration::ZERO,
        ..MigrationConfig::default()
    }
}

pub fn fast_retry() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 4,
        base_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(5),
    }
}

pub fn body(id: u64, version: u64) -> Vec<u8> {
    format!("doc-{id}-v{version}").into_bytes()
}

/// Cluster of `shards` with collection `coll` owned by `owner` and seeded
/// with ids `0..docs`.
pub async fn seeded_cluster(
    shards: &[ShardId],
    coll: &str,
    owner: ShardId,
    docs: u64,
    cfg: MigrationConfig,
) -> LocalCluster {
    let cluster = LocalCluster::new(shards, cfg, fast_retry());
    cluster.create_collection(coll, owner).expect("create collection");
    for id in 0..docs {
        cluster
            .write(coll, u64_key(id), body(id, 0))
            .await
            .expect("seed write");
    }
    cluster
}

/// Endpoint wrapper that injects faults in front of a real recipient.
pub struct FaultyEndpoint {
    inner: Arc<dyn RecipientEndpoint>,
    /// Next N transfer-mods calls fail with a transport error.
    pub fail_transfer_mods: AtomicU32,
    /// Next N clone-batch calls fail with a transport error.
    pub fail_clone_batches: AtomicU32,
    /// Next N commit calls fail with a transport error.
    pub fail_commits: AtomicU32,
    /// Abort calls are acknowledged but never delivered.
    pub drop_aborts: AtomicBool,
    /// Commit calls are acknowledged but never delivered.
    pub drop_commits: AtomicBool,
    /// Transfer-mods calls hang forever while set.
    pub stall_transfer_mods: AtomicBool,
    pub transfer_mods_calls: AtomicU64,
}

impl FaultyEndpoint {
    pub fn new(inner: Arc<dyn RecipientEndpoint>) -> Self {
        Self {
            inner,
            fail_transfer_mods: AtomicU32::new(0),
            fail_clone_batches: AtomicU32::new(0),
            fail_commits: AtomicU32::new(0),
            drop_aborts: AtomicBool::new(false),
            drop_commits: AtomicBool::new(false),
            stall_transfer_mods: AtomicBool::new(false),
            transfer_mods_calls: AtomicU64::new(0),
        }
    }

    /// Install a fault injector in front of `shard` and return it.
    pub fn install(cluster: &LocalCluster, shard: ShardId) -> Arc<FaultyEndpoint> {
        let mut installed = None;
        cluster
            .wrap_endpoint(shard, |inner| {
                let faulty = Arc::new(FaultyEndpoint::new(inner));
                installed = Some(faulty.clone());
                faulty
            })
            .expect("wrap endpoint");
        installed.expect("endpoint installed")
    }
}

fn take_one(counter: &AtomicU32) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

#[async_trait]
impl RecipientEndpoint for FaultyEndpoint {
    async fn begin_clone(&self, request: BeginCloneRequest) -> MigrationResult<()> {
        self.inner.begin_clone(request).await
    }

    async fn clone_batch(&self, batch: CloneBatch) -> MigrationResult<u64> {
        if take_one(&self.fail_clone_batches) {
            return Err(MigrationError::Transport("injected clone failure".into()));
        }
        self.inner.clone_batch(batch).await
    }

    async fn transfer_mods(
        &self,
        session_id: &SessionId,
        batch: XferBatch,
    ) -> MigrationResult<ModsAck> {
        self.transfer_mods_calls.fetch_add(1, Ordering::SeqCst);
        if self.stall_transfer_mods.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        if take_one(&self.fail_transfer_mods) {
            return Err(MigrationError::Transport("injected transfer failure".into()));
        }
        self.inner.transfer_mods(session_id, batch).await
    }

    async fn commit(&self, session_id: &SessionId) -> MigrationResult<()> {
        if self.drop_commits.load(Ordering::SeqCst) {
            return Ok(());
        }
        if take_one(&self.fail_commits) {
            return Err(MigrationError::Transport("injected commit failure".into()));
        }
        self.inner.commit(session_id).await
    }

    async fn abort(&self, session_id: &SessionId) -> MigrationResult<()> {
        if self.drop_aborts.load(Ordering::SeqCst) {
            return Ok(());
        }
        self.inner.abort(session_id).await
    }

    async fn status(&self) -> MigrationResult<RecipientStatus> {
        self.inner.status().await
    }
}
