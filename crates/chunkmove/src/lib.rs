//! Live range migration for a sharded document store.
//!
//! A donor shard moves ownership of one key range of a collection to a
//! recipient shard while the collection keeps serving reads and writes.
//! Higher layers supply an `OwnershipCatalog` and a `RecipientEndpoint` per
//! peer, then drive migrations through `MigrationCoordinator`.

pub mod catalog;
pub mod checkpoint;
pub mod cluster;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod recipient;
pub mod registry;
pub mod retry;
pub mod store;
pub mod types;
pub mod xfer_log;

pub use catalog::{CasOutcome, ChunkDesc, CollectionRouting, InMemoryCatalog, OwnershipCatalog};
pub use checkpoint::{Checkpoint, Checkpoints, PausePoint};
pub use cluster::{LocalCluster, ShardNode};
pub use config::MigrationConfig;
pub use coordinator::{MigrationCoordinator, MigrationHandle, RecipientDirectory};
pub use error::{MigrationError, MigrationResult};
pub use recipient::{BeginCloneRequest, ModsAck, RecipientEndpoint, RecipientIngestWorker};
pub use registry::{LiveSession, SessionRegistry};
pub use retry::RetryPolicy;
pub use store::ShardStore;
pub use types::{
    key_u64, u64_key, CloneBatch, CommitDecision, DocKey, Document, KeyRange, MigrationSession,
    MigrationState, MigrationStatus, RecipientState, RecipientStatus, SessionId, ShardId, XferEntry,
    XferOp,
};
pub use xfer_log::{TransferLog, XferBatch};
