//! Range ownership catalog.
//!
//! The catalog is the single source of truth for which shard owns which
//! range. Every change bumps the collection's epoch, and a migration commits
//! with a compare-and-swap on the epoch it read at clone time.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard, PoisonError};

use anyhow::Context;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::types::{CommitDecision, KeyRange, ShardId};

/// One contiguous chunk of a collection and its owner.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkDesc {
    pub range: KeyRange,
    pub owner: ShardId,
}

/// Routing table of one collection. Chunks are sorted and cover the keyspace.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionRouting {
    pub collection: String,
    pub epoch: u64,
    pub chunks: Vec<ChunkDesc>,
}

impl CollectionRouting {
    pub fn owner_of(&self, key: &[u8]) -> Option<ShardId> {
        self.chunks
            .iter()
            .find(|c| c.range.contains_key(key))
            .map(|c| c.owner)
    }

    /// Whether every chunk overlapping `range` belongs to `shard`.
    pub fn owned_by(&self, shard: ShardId, range: &KeyRange) -> bool {
        if range.is_empty() {
            return false;
        }
        let mut overlapping = self.chunks.iter().filter(|c| c.range.overlaps(range));
        let mut any = false;
        let all = overlapping.all(|c| {
            any = true;
            c.owner == shard
        });
        any && all
    }

    /// Ranges owned by `shard`, one per chunk.
    pub fn ranges_of(&self, shard: ShardId) -> Vec<KeyRange> {
        self.chunks
            .iter()
            .filter(|c| c.owner == shard)
            .map(|c| c.range.clone())
            .collect()
    }

    fn split_at(&mut self, key: &[u8]) -> bool {
        if key.is_empty() {
            return false;
        }
        let Some(idx) = self
            .chunks
            .iter()
            .position(|c| c.range.contains_key(key) && c.range.start.as_slice() != key)
        else {
            return false;
        };
        let right = ChunkDesc {
            range: KeyRange::new(key.to_vec(), self.chunks[idx].range.end.clone()),
            owner: self.chunks[idx].owner,
        };
        self.chunks[idx].range.end = key.to_vec();
        self.chunks.insert(idx + 1, right);
        true
    }
}

/// Result of a conditional ownership change.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CasOutcome {
    Committed { new_epoch: u64 },
    Conflict { current_epoch: u64 },
}

/// Catalog operations a migration depends on.
#[async_trait]
pub trait OwnershipCatalog: Send + Sync + 'static {
    async fn read(&self, collection: &str) -> anyhow::Result<CollectionRouting>;

    /// Move `decision.range` from `from_owner` to `to_owner` only if the
    /// collection epoch still equals `decision.expected_epoch`.
    async fn cas_owner(&self, decision: &CommitDecision) -> anyhow::Result<CasOutcome>;
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct CatalogState {
    pub collections: BTreeMap<String, CollectionRouting>,
}

/// In-process catalog, optionally persisted as pretty JSON after each change.
#[derive(Clone)]
pub struct InMemoryCatalog {
    state: Arc<RwLock<CatalogState>>,
    path: Option<PathBuf>,
}

impl Default for InMemoryCatalog {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryCatalog {
    pub fn new() -> Self {
        Self {
            state: Arc::new(RwLock::new(CatalogState::default())),
            path: None,
        }
    }

    /// Load catalog state from `path`, or start empty if it is missing.
    pub fn load_or_init(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let state = match fs::read(&path) {
            Ok(data) => serde_json::from_slice::<CatalogState>(&data)
                .with_context(|| format!("parse catalog state {}", path.display()))?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => CatalogState::default(),
            Err(err) => {
                return Err(err).with_context(|| format!("read catalog state {}", path.display()))
            }
        };
        Ok(Self {
            state: Arc::new(RwLock::new(state)),
            path: Some(path),
        })
    }

    fn read_state(&self) -> RwLockReadGuard<'_, CatalogState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_state(&self) -> RwLockWriteGuard<'_, CatalogState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn state(&self) -> CatalogState {
        self.read_state().clone()
    }

    pub fn routing(&self, collection: &str) -> Option<CollectionRouting> {
        self.read_state().collections.get(collection).cloned()
    }

    pub fn epoch(&self, collection: &str) -> Option<u64> {
        self.read_state().collections.get(collection).map(|r| r.epoch)
    }

    /// Register a collection whose whole keyspace belongs to `owner`.
    pub fn create_collection(&self, collection: &str, owner: ShardId) -> anyhow::Result<u64> {
        self.create_collection_with_chunks(
            collection,
            vec![ChunkDesc {
                range: KeyRange::full(),
                owner,
            }],
        )
    }

    /// Register a collection with an explicit chunk layout. Chunks must be
    /// sorted, contiguous and cover the whole keyspace.
    pub fn create_collection_with_chunks(
        &self,
        collection: &str,
        chunks: Vec<ChunkDesc>,
    ) -> anyhow::Result<u64> {
        anyhow::ensure!(!chunks.is_empty(), "collection {collection} needs at least one chunk");
        let first = &chunks[0].range;
        let last = &chunks[chunks.len() - 1].range;
        anyhow::ensure!(
            first.start.is_empty() && last.is_unbounded(),
            "chunks of {collection} must cover the whole keyspace"
        );
        for pair in chunks.windows(2) {
            anyhow::ensure!(
                pair[0].range.adjoins(&pair[1].range),
                "chunks {} and {} of {collection} are not contiguous",
                pair[0].range,
                pair[1].range
            );
        }

        let mut state = self.write_state();
        anyhow::ensure!(
            !state.collections.contains_key(collection),
            "collection {collection} already exists"
        );
        state.collections.insert(
            collection.to_string(),
            CollectionRouting {
                collection: collection.to_string(),
                epoch: 1,
                chunks,
            },
        );
        drop(state);
        self.persist()?;
        Ok(1)
    }

    /// Split the chunk containing `at` into two. Bumps the epoch.
    pub fn split_chunk(&self, collection: &str, at: &[u8]) -> anyhow::Result<u64> {
        let mut state = self.write_state();
        let routing = state
            .collections
            .get_mut(collection)
            .with_context(|| format!("unknown collection {collection}"))?;
        anyhow::ensure!(
            routing.split_at(at),
            "split point is already a chunk boundary of {collection}"
        );
        routing.epoch = routing.epoch.saturating_add(1);
        let epoch = routing.epoch;
        drop(state);
        self.persist()?;
        Ok(epoch)
    }

    fn apply_cas(&self, decision: &CommitDecision) -> anyhow::Result<CasOutcome> {
        let mut state = self.write_state();
        let routing = state
            .collections
            .get_mut(&decision.collection)
            .with_context(|| format!("unknown collection {}", decision.collection))?;
        if routing.epoch != decision.expected_epoch {
            return Ok(CasOutcome::Conflict {
                current_epoch: routing.epoch,
            });
        }
        anyhow::ensure!(
            decision.from_owner != decision.to_owner,
            "ownership change to the same shard"
        );
        anyhow::ensure!(
            routing.owned_by(decision.from_owner, &decision.range),
            "shard {} does not own {} of {}",
            decision.from_owner,
            decision.range,
            decision.collection
        );

        routing.split_at(&decision.range.start);
        routing.split_at(&decision.range.end);
        for chunk in routing
            .chunks
            .iter_mut()
            .filter(|c| decision.range.covers(&c.range))
        {
            chunk.owner = decision.to_owner;
        }
        routing.epoch = routing.epoch.saturating_add(1);
        let new_epoch = routing.epoch;
        drop(state);
        self.persist()?;
        Ok(CasOutcome::Committed { new_epoch })
    }

    fn persist(&self) -> anyhow::Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let state = self.read_state();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).context("create catalog state dir")?;
        }
        let data = serde_json::to_vec_pretty(&*state).context("serialize catalog state")?;
        fs::write(path, data).context("write catalog state")?;
        Ok(())
    }
}

#[async_trait]
impl OwnershipCatalog for InMemoryCatalog {
    async fn read(&self, collection: &str) -> anyhow::Result<CollectionRouting> {
        self.routing(collection)
            .with_context(|| format!("unknown collection {collection}"))
    }

    async fn cas_owner(&self, decision: &CommitDecision) -> anyhow::Result<CasOutcome> {
        self.apply_cas(decision)
    }
}
