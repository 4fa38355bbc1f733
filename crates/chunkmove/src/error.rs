//! Error taxonomy for migration operations.

use serde::Serialize;
use thiserror::Error;

use crate::types::{KeyRange, SessionId, ShardId};

pub type MigrationResult<T> = Result<T, MigrationError>;

/// Failures surfaced by the registry, donor, recipient and shard stores.
///
/// Only [`MigrationError::Transport`] is worth retrying. Everything else is
/// either a fail-fast rejection or a reason the session aborted.
#[derive(Debug, Error, Clone, PartialEq, Eq, Serialize)]
pub enum MigrationError {
    /// Another live session already covers part of the range, or the donor is busy.
    #[error("conflicting migration: {reason}")]
    ConflictingMigration { reason: String },

    #[error("shard {shard} is already the recipient of migration {active}")]
    RecipientBusy { shard: ShardId, active: SessionId },

    /// Call carried a session id other than the recipient's current one.
    #[error("stale migration session {received}, current session is {}", display_current(.current))]
    StaleMigrationSession {
        received: SessionId,
        current: Option<SessionId>,
    },

    #[error("transfer log for {session_id} exceeded {limit} entries")]
    TransferLogOverflow { session_id: SessionId, limit: usize },

    #[error("catalog epoch conflict on {collection}: expected {expected}, found {actual}")]
    CatalogEpochConflict {
        collection: String,
        expected: u64,
        actual: u64,
    },

    #[error("migration interrupted by operator")]
    OperatorInterrupted,

    #[error("{phase} exceeded its deadline after {elapsed_ms}ms")]
    Timeout { phase: String, elapsed_ms: u64 },

    #[error("shard {shard} does not own {range} of {collection}")]
    RangeNotOwned {
        shard: ShardId,
        collection: String,
        range: KeyRange,
    },

    #[error("structural change to {collection} blocked by migration {session_id}")]
    StructuralChangeBlocked {
        collection: String,
        session_id: SessionId,
    },

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("unknown migration session {0}")]
    UnknownSession(SessionId),

    /// Remote call failed before producing an answer.
    #[error("transport error: {0}")]
    Transport(String),
}

fn display_current(current: &Option<SessionId>) -> String {
    match current {
        Some(id) => id.to_string(),
        None => "none".to_string(),
    }
}

impl MigrationError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, MigrationError::Transport(_))
    }

    /// Short stable label for logs and reports.
    pub fn kind(&self) -> &'static str {
        match self {
            MigrationError::ConflictingMigration { .. } => "conflicting_migration",
            MigrationError::RecipientBusy { .. } => "recipient_busy",
            MigrationError::StaleMigrationSession { .. } => "stale_migration_session",
            MigrationError::TransferLogOverflow { .. } => "transfer_log_overflow",
            MigrationError::CatalogEpochConflict { .. } => "catalog_epoch_conflict",
            MigrationError::OperatorInterrupted => "operator_interrupted",
            MigrationError::Timeout { .. } => "timeout",
            MigrationError::RangeNotOwned { .. } => "range_not_owned",
            MigrationError::StructuralChangeBlocked { .. } => "structural_change_blocked",
            MigrationError::InvalidRequest(_) => "invalid_request",
            MigrationError::InvalidState(_) => "invalid_state",
            MigrationError::UnknownSession(_) => "unknown_session",
            MigrationError::Transport(_) => "transport",
        }
    }

    pub(crate) fn stale(received: &SessionId, current: Option<&SessionId>) -> Self {
        MigrationError::StaleMigrationSession {
            received: received.clone(),
            current: current.cloned(),
        }
    }
}

impl From<anyhow::Error> for MigrationError {
    fn from(err: anyhow::Error) -> Self {
        MigrationError::Transport(format!("{err:#}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sid(seq: u64) -> SessionId {
        SessionId {
            donor: 1,
            started_ms: 10,
            seq,
        }
    }

    #[test]
    fn only_transport_is_retryable() {
        assert!(MigrationError::Transport("reset".into()).is_retryable());
        assert!(!MigrationError::OperatorInterrupted.is_retryable());
        assert!(!MigrationError::stale(&sid(1), Some(&sid(2))).is_retryable());
    }

    #[test]
    fn stale_message_names_both_sessions() {
        let err = MigrationError::stale(&sid(1), Some(&sid(2)));
        assert_eq!(
            err.to_string(),
            "stale migration session m1-10-1, current session is m1-10-2"
        );
        let err = MigrationError::stale(&sid(1), None);
        assert!(err.to_string().ends_with("current session is none"));
        assert_eq!(err.kind(), "stale_migration_session");
    }

    #[test]
    fn anyhow_errors_become_transport() {
        let err: MigrationError = anyhow::anyhow!("connection refused").into();
        assert_eq!(err, MigrationError::Transport("connection refused".into()));
    }
}
