//! In-process cluster: shard nodes sharing one registry, catalog and
//! recipient directory. Used by the integration tests and the workload
//! harness.
//!
//! The routing helpers (`write`, `delete`, `read`) follow the rule every
//! client outside the protocol must follow: trust the catalog, and re-read
//! it whenever a shard answers that it does not own the key.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use crate::catalog::{ChunkDesc, InMemoryCatalog, OwnershipCatalog};
use crate::checkpoint::Checkpoints;
use crate::config::MigrationConfig;
use crate::coordinator::{MigrationCoordinator, MigrationHandle, RecipientDirectory};
use crate::error::{MigrationError, MigrationResult};
use crate::recipient::{RecipientEndpoint, RecipientIngestWorker};
use crate::registry::SessionRegistry;
use crate::retry::RetryPolicy;
use crate::store::ShardStore;
use crate::types::{
    DocKey, KeyRange, MigrationState, MigrationStatus, SessionId, ShardId, XferOp,
};

/// One shard: its store plus both migration roles.
pub struct ShardNode {
    pub id: ShardId,
    pub store: Arc<ShardStore>,
    pub recipient: Arc<RecipientIngestWorker>,
    pub coordinator: Arc<MigrationCoordinator>,
}

pub struct LocalCluster {
    pub registry: Arc<SessionRegistry>,
    pub catalog: Arc<InMemoryCatalog>,
    pub directory: Arc<RecipientDirectory>,
    pub checkpoints: Arc<Checkpoints>,
    nodes: BTreeMap<ShardId, ShardNode>,
    route_retry: RetryPolicy,
}

impl LocalCluster {
    pub fn new(shards: &[ShardId], cfg: MigrationConfig, retry: RetryPolicy) -> Self {
        Self::with_catalog(shards, cfg, retry, InMemoryCatalog::new())
    }

    pub fn with_catalog(
        shards: &[ShardId],
        cfg: MigrationConfig,
        retry: RetryPolicy,
        catalog: InMemoryCatalog,
    ) -> Self {
        let registry = Arc::new(SessionRegistry::new());
        let catalog = Arc::new(catalog);
        let directory = Arc::new(RecipientDirectory::new());
        let checkpoints = Arc::new(Checkpoints::new());
        let mut nodes = BTreeMap::new();
        for &id in shards {
            let store = Arc::new(ShardStore::new(id));
            let recipient = Arc::new(
                RecipientIngestWorker::new(store.clone(), &cfg).with_catalog(catalog.clone()),
            );
            directory.register(id, recipient.clone());
            let coordinator = MigrationCoordinator::new(
                store.clone(),
                registry.clone(),
                catalog.clone(),
                directory.clone(),
                cfg.clone(),
            )
            .with_retry(retry)
            .with_checkpoints(checkpoints.clone());
            nodes.insert(
                id,
                ShardNode {
                    id,
                    store,
                    recipient,
                    coordinator: Arc::new(coordinator),
                },
            );
        }
        Self {
            registry,
            catalog,
            directory,
            checkpoints,
            nodes,
            route_retry: RetryPolicy {
                max_attempts: 32,
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(50),
            },
        }
    }

    pub fn node(&self, id: ShardId) -> MigrationResult<&ShardNode> {
        self.nodes
            .get(&id)
            .ok_or_else(|| MigrationError::InvalidRequest(format!("unknown shard {id}")))
    }

    pub fn nodes(&self) -> impl Iterator<Item = &ShardNode> {
        self.nodes.values()
    }

    pub fn shard_ids(&self) -> Vec<ShardId> {
        self.nodes.keys().copied().collect()
    }

    /// Replace the endpoint donors use to reach `shard`, e.g. to inject faults.
    pub fn wrap_endpoint(
        &self,
        shard: ShardId,
        wrap: impl FnOnce(Arc<dyn RecipientEndpoint>) -> Arc<dyn RecipientEndpoint>,
    ) -> MigrationResult<()> {
        let node = self.node(shard)?;
        let inner: Arc<dyn RecipientEndpoint> = node.recipient.clone();
        self.directory.register(shard, wrap(inner));
        Ok(())
    }

    /// Create a collection owned entirely by `owner`.
    pub fn create_collection(&self, collection: &str, owner: ShardId) -> anyhow::Result<()> {
        self.create_collection_with_chunks(
            collection,
            vec![ChunkDesc {
                range: KeyRange::full(),
                owner,
            }],
        )
    }

    pub fn create_collection_with_chunks(
        &self,
        collection: &str,
        chunks: Vec<ChunkDesc>,
    ) -> anyhow::Result<()> {
        for chunk in &chunks {
            anyhow::ensure!(
                self.nodes.contains_key(&chunk.owner),
                "unknown shard {}",
                chunk.owner
            );
        }
        self.catalog
            .create_collection_with_chunks(collection, chunks.clone())?;
        for chunk in chunks {
            if let Some(node) = self.nodes.get(&chunk.owner) {
                node.store.assume_ownership(collection, &chunk.range);
            }
        }
        Ok(())
    }

    /// Start migrating `range` to `to_shard` from whichever shard the
    /// catalog names as its owner.
    pub async fn request_migration(
        &self,
        collection: &str,
        range: KeyRange,
        to_shard: ShardId,
    ) -> MigrationResult<MigrationHandle> {
        let routing = self.catalog.read(collection).await?;
        let donor = routing.owner_of(&range.start).ok_or_else(|| {
            MigrationError::InvalidRequest(format!("no owner for {range} of {collection}"))
        })?;
        self.node(donor)?
            .coordinator
            .request_migration(collection, range, to_shard)
    }

    /// Run a migration to completion. Aborts surface as the aborting error.
    pub async fn run_migration(
        &self,
        collection: &str,
        range: KeyRange,
        to_shard: ShardId,
    ) -> MigrationResult<MigrationStatus> {
        let status = self
            .request_migration(collection, range, to_shard)
            .await?
            .wait()
            .await?;
        match (&status.state, &status.last_error) {
            (MigrationState::Aborted, Some(err)) => Err(err.clone()),
            _ => Ok(status),
        }
    }

    pub fn interrupt(&self, session_id: &SessionId) -> MigrationResult<()> {
        self.node(session_id.donor)?.coordinator.interrupt(session_id)
    }

    pub fn migration_status(&self, session_id: &SessionId) -> MigrationResult<MigrationStatus> {
        self.node(session_id.donor)?
            .coordinator
            .migration_status(session_id)
    }

    pub async fn write(
        &self,
        collection: &str,
        key: impl Into<DocKey>,
        body: impl Into<Vec<u8>>,
    ) -> MigrationResult<()> {
        let op = XferOp::Upsert {
            key: key.into(),
            body: body.into(),
        };
        self.route_write(collection, op).await.map(|_| ())
    }

    pub async fn delete(&self, collection: &str, key: impl Into<DocKey>) -> MigrationResult<bool> {
        self.route_write(collection, XferOp::Delete { key: key.into() })
            .await
    }

    async fn route_write(&self, collection: &str, op: XferOp) -> MigrationResult<bool> {
        let mut failures = 0u32;
        loop {
            let owner = self.owner_of(collection, op.key()).await?;
            let store = &self.node(owner)?.store;
            let result = match op.clone() {
                XferOp::Upsert { key, body } => store.upsert(collection, key, body).await.map(|_| true),
                XferOp::Delete { key } => store.delete(collection, key).await,
            };
            match result {
                Err(err @ MigrationError::RangeNotOwned { .. }) => {
                    failures += 1;
                    let Some(delay) = self.route_retry.delay_after(owner, failures) else {
                        return Err(err);
                    };
                    tokio::time::sleep(delay).await;
                }
                other => return other,
            }
        }
    }

    pub async fn read(&self, collection: &str, key: &[u8]) -> MigrationResult<Option<Vec<u8>>> {
        let mut failures = 0u32;
        loop {
            let owner = self.owner_of(collection, key).await?;
            match self.node(owner)?.store.get(collection, key) {
                Err(err @ MigrationError::RangeNotOwned { .. }) => {
                    failures += 1;
                    let Some(delay) = self.route_retry.delay_after(owner, failures) else {
                        return Err(err);
                    };
                    tokio::time::sleep(delay).await;
                }
                other => return other,
            }
        }
    }

    async fn owner_of(&self, collection: &str, key: &[u8]) -> MigrationResult<ShardId> {
        let routing = self.catalog.read(collection).await?;
        routing.owner_of(key).ok_or_else(|| {
            MigrationError::InvalidRequest(format!("no owner for key in {collection}"))
        })
    }

    /// Check that shard stores and the catalog agree on who owns what.
    pub fn verify_ownership(&self, collection: &str) -> anyhow::Result<()> {
        let routing = self
            .catalog
            .routing(collection)
            .ok_or_else(|| anyhow::anyhow!("unknown collection {collection}"))?;
        for chunk in &routing.chunks {
            for node in self.nodes.values() {
                let owns = node.store.owns_range(collection, &chunk.range);
                if node.id == chunk.owner {
                    anyhow::ensure!(
                        owns,
                        "shard {} does not own its chunk {} of {collection}",
                        node.id,
                        chunk.range
                    );
                } else {
                    let overlaps = node
                        .store
                        .owned_ranges(collection)
                        .iter()
                        .any(|owned| owned.overlaps(&chunk.range));
                    anyhow::ensure!(
                        !overlaps,
                        "shard {} owns part of chunk {} of {collection} held by shard {}",
                        node.id,
                        chunk.range,
                        chunk.owner
                    );
                }
            }
        }
        Ok(())
    }
}
