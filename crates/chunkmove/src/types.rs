//! Shared identifiers and data shapes for the range migration protocol.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::MigrationError;

/// Shard identifier used throughout the catalog, registry and stores.
pub type ShardId = u64;

/// Document primary key. Keys order bytewise.
pub type DocKey = Vec<u8>;

/// Encode a numeric `_id` as a big-endian key so numeric and byte order agree.
pub fn u64_key(id: u64) -> DocKey {
    id.to_be_bytes().to_vec()
}

/// Decode a key produced by [`u64_key`].
pub fn key_u64(key: &[u8]) -> Option<u64> {
    let bytes: [u8; 8] = key.try_into().ok()?;
    Some(u64::from_be_bytes(bytes))
}

pub(crate) fn now_unix_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis().min(u128::from(u64::MAX)) as u64)
        .unwrap_or(0)
}

/// Half-open key range `[start, end)`.
///
/// An empty `start` is the beginning of the keyspace and an empty `end` is
/// unbounded, so `KeyRange::full()` covers every key.
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct KeyRange {
    pub start: Vec<u8>,
    pub end: Vec<u8>,
}

impl KeyRange {
    pub fn new(start: impl Into<Vec<u8>>, end: impl Into<Vec<u8>>) -> Self {
        Self {
            start: start.into(),
            end: end.into(),
        }
    }

    pub fn full() -> Self {
        Self::default()
    }

    /// Range over numeric ids `[start, end)`.
    pub fn u64s(start: u64, end: u64) -> Self {
        Self::new(u64_key(start), u64_key(end))
    }

    /// Smallest range holding exactly `key`.
    pub fn point(key: &[u8]) -> Self {
        let mut end = key.to_vec();
        end.push(0);
        Self::new(key.to_vec(), end)
    }

    pub fn is_unbounded(&self) -> bool {
        self.end.is_empty()
    }

    pub fn is_empty(&self) -> bool {
        !self.end.is_empty() && self.start >= self.end
    }

    pub fn contains_key(&self, key: &[u8]) -> bool {
        key >= self.start.as_slice() && (self.end.is_empty() || key < self.end.as_slice())
    }

    pub fn overlaps(&self, other: &KeyRange) -> bool {
        if self.is_empty() || other.is_empty() {
            return false;
        }
        let left = other.end.is_empty() || self.start < other.end;
        let right = self.end.is_empty() || other.start < self.end;
        left && right
    }

    /// Whether `other` lies entirely inside this range.
    pub fn covers(&self, other: &KeyRange) -> bool {
        if other.is_empty() {
            return true;
        }
        if other.start < self.start {
            return false;
        }
        if self.end.is_empty() {
            return true;
        }
        !other.end.is_empty() && other.end <= self.end
    }

    /// Overlapping part of two ranges, if any.
    pub fn intersect(&self, other: &KeyRange) -> Option<KeyRange> {
        if !self.overlaps(other) {
            return None;
        }
        let start = self.start.clone().max(other.start.clone());
        let end = match (self.end.is_empty(), other.end.is_empty()) {
            (true, true) => Vec::new(),
            (true, false) => other.end.clone(),
            (false, true) => self.end.clone(),
            (false, false) => self.end.clone().min(other.end.clone()),
        };
        Some(KeyRange { start, end })
    }

    /// Parts of this range not covered by `other` (zero, one or two pieces).
    pub fn subtract(&self, other: &KeyRange) -> Vec<KeyRange> {
        if !self.overlaps(other) {
            return vec![self.clone()];
        }
        let mut out = Vec::with_capacity(2);
        if self.start < other.start {
            out.push(KeyRange::new(self.start.clone(), other.start.clone()));
        }
        if !other.end.is_empty() && (self.end.is_empty() || other.end < self.end) {
            out.push(KeyRange::new(other.end.clone(), self.end.clone()));
        }
        out
    }

    /// Whether `other` begins exactly where this range ends.
    pub fn adjoins(&self, other: &KeyRange) -> bool {
        !self.end.is_empty() && self.end == other.start
    }
}

impl fmt::Display for KeyRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        if self.start.is_empty() {
            write!(f, "-inf")?;
        } else {
            write_key(f, &self.start)?;
        }
        write!(f, ", ")?;
        if self.end.is_empty() {
            write!(f, "+inf")?;
        } else {
            write_key(f, &self.end)?;
        }
        write!(f, ")")
    }
}

fn write_key(f: &mut fmt::Formatter<'_>, key: &[u8]) -> fmt::Result {
    if let Some(id) = key_u64(key) {
        return write!(f, "{id}");
    }
    if key.iter().all(|b| b.is_ascii_graphic()) {
        return write!(f, "{}", String::from_utf8_lossy(key));
    }
    write!(f, "0x")?;
    for b in key {
        write!(f, "{b:02x}")?;
    }
    Ok(())
}

/// Identity of one migration attempt. Never reused.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SessionId {
    pub donor: ShardId,
    pub started_ms: u64,
    pub seq: u64,
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "m{}-{}-{}", self.donor, self.started_ms, self.seq)
    }
}

/// One document: key plus opaque full-document body.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Document {
    pub key: DocKey,
    pub body: Vec<u8>,
}

impl Document {
    pub fn new(key: impl Into<DocKey>, body: impl Into<Vec<u8>>) -> Self {
        Self {
            key: key.into(),
            body: body.into(),
        }
    }

    pub fn size_bytes(&self) -> usize {
        self.key.len() + self.body.len()
    }
}

/// Donor-side migration state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum MigrationState {
    Created,
    ClonePrep,
    Cloning,
    SteadyState,
    Committing,
    Committed,
    Aborted,
}

impl MigrationState {
    pub fn is_terminal(self) -> bool {
        matches!(self, MigrationState::Committed | MigrationState::Aborted)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            MigrationState::Created => "created",
            MigrationState::ClonePrep => "clone_prep",
            MigrationState::Cloning => "cloning",
            MigrationState::SteadyState => "steady_state",
            MigrationState::Committing => "committing",
            MigrationState::Committed => "committed",
            MigrationState::Aborted => "aborted",
        }
    }
}

impl fmt::Display for MigrationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Recipient-side mirror of the migration state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RecipientState {
    Idle,
    Cloning,
    Catchup,
    Committing,
    Steady,
    Aborted,
}

impl RecipientState {
    /// States in which the recipient is bound to an incoming session.
    pub fn is_live(self) -> bool {
        matches!(
            self,
            RecipientState::Cloning | RecipientState::Catchup | RecipientState::Committing
        )
    }
}

/// A migration attempt as the donor sees it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct MigrationSession {
    pub id: SessionId,
    pub collection: String,
    pub range: KeyRange,
    pub donor: ShardId,
    pub recipient: ShardId,
    pub state: MigrationState,
    pub clone_epoch: Option<u64>,
    pub created_unix_ms: u64,
}

/// Snapshot slice copied to the recipient.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloneBatch {
    pub session_id: SessionId,
    pub clone_epoch: u64,
    pub docs: Vec<Document>,
}

impl CloneBatch {
    pub fn size_bytes(&self) -> usize {
        self.docs.iter().map(Document::size_bytes).sum()
    }
}

/// A mutation captured by the transfer log. Upserts carry the full document.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum XferOp {
    Upsert { key: DocKey, body: Vec<u8> },
    Delete { key: DocKey },
}

impl XferOp {
    pub fn key(&self) -> &[u8] {
        match self {
            XferOp::Upsert { key, .. } | XferOp::Delete { key } => key,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct XferEntry {
    pub session_id: SessionId,
    pub seq: u64,
    pub op: XferOp,
}

/// Conditional ownership change submitted to the catalog.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitDecision {
    pub collection: String,
    pub range: KeyRange,
    pub from_owner: ShardId,
    pub to_owner: ShardId,
    pub expected_epoch: u64,
}

/// Observable progress of one migration, live or recently finished.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct MigrationStatus {
    pub session_id: SessionId,
    pub collection: String,
    pub range: KeyRange,
    pub donor: ShardId,
    pub recipient: ShardId,
    pub state: MigrationState,
    pub backlog: usize,
    pub last_error: Option<MigrationError>,
    pub clone_epoch: Option<u64>,
    pub cloned_docs: u64,
    pub cloned_bytes: u64,
    pub catchup_ops: u64,
    pub steady_ops: u64,
    pub created_unix_ms: u64,
    pub updated_unix_ms: u64,
}

impl MigrationStatus {
    pub fn session(&self) -> MigrationSession {
        MigrationSession {
            id: self.session_id.clone(),
            collection: self.collection.clone(),
            range: self.range.clone(),
            donor: self.donor,
            recipient: self.recipient,
            state: self.state,
            clone_epoch: self.clone_epoch,
            created_unix_ms: self.created_unix_ms,
        }
    }
}

/// Recipient progress report.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct RecipientStatus {
    pub shard: ShardId,
    pub state: RecipientState,
    pub session_id: Option<SessionId>,
    pub collection: Option<String>,
    pub range: Option<KeyRange>,
    pub donor: Option<ShardId>,
    pub cloned_docs: u64,
    pub cloned_bytes: u64,
    pub applied_ops: u64,
    pub last_applied_seq: u64,
    pub last_error: Option<MigrationError>,
}
