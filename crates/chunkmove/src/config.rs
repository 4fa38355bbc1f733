//! Tuning knobs for migrations.

use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};

/// Configuration shared by coordinators and recipient workers.
///
/// Durations are read and written as whole milliseconds under `*_ms` keys.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MigrationConfig {
    /// Maximum documents per clone batch.
    pub clone_batch_max_docs: usize,
    /// Soft byte cap per clone batch. A single oversized document still ships alone.
    pub clone_batch_max_bytes: usize,
    /// Transfer log bound. Exceeding it aborts the session.
    pub xfer_log_max_entries: usize,
    /// Entries shipped per transfer-mods call.
    pub xfer_batch_max_entries: usize,
    /// Longest the range may stay write-blocked for the final drain.
    #[serde(rename = "final_drain_window_ms", with = "duration_ms")]
    pub final_drain_window: Duration,
    /// Deadline for the whole cloning phase. Set to 0 to disable.
    #[serde(rename = "clone_timeout_ms", with = "duration_ms")]
    pub clone_timeout: Duration,
    /// Deadline for reaching a zero backlog before the final drain. Set to 0 to disable.
    #[serde(rename = "catchup_timeout_ms", with = "duration_ms")]
    pub catchup_timeout: Duration,
    /// Per-attempt deadline for the catalog commit and the recipient commit.
    /// Set to 0 to disable.
    #[serde(rename = "commit_timeout_ms", with = "duration_ms")]
    pub commit_timeout: Duration,
    /// Pause between drains while the backlog is still non-zero.
    #[serde(rename = "steady_poll_interval_ms", with = "duration_ms")]
    pub steady_poll_interval: Duration,
    /// Delay before the donor deletes a range it gave away.
    #[serde(rename = "range_deletion_delay_ms", with = "duration_ms")]
    pub range_deletion_delay: Duration,
    /// A recipient whose incoming session has been silent this long may be
    /// displaced by a new session. Set to 0 to never displace.
    #[serde(rename = "recipient_idle_timeout_ms", with = "duration_ms")]
    pub recipient_idle_timeout: Duration,
    /// Terminal sessions kept for status queries.
    pub status_history: usize,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            clone_batch_max_docs: 256,
            clone_batch_max_bytes: 1024 * 1024,
            xfer_log_max_entries: 100_000,
            xfer_batch_max_entries: 512,
            final_drain_window: Duration::from_secs(5),
            clone_timeout: Duration::ZERO,
            catchup_timeout: Duration::ZERO,
            commit_timeout: Duration::from_secs(30),
            steady_poll_interval: Duration::from_millis(10),
            range_deletion_delay: Duration::from_secs(1),
            recipient_idle_timeout: Duration::from_secs(60),
            status_history: 64,
        }
    }
}

impl MigrationConfig {
    pub fn from_json_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let data =
            fs::read(path).with_context(|| format!("read migration config {}", path.display()))?;
        let cfg: Self = serde_json::from_slice(&data)
            .with_context(|| format!("parse migration config {}", path.display()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(self.clone_batch_max_docs > 0, "clone_batch_max_docs must be > 0");
        anyhow::ensure!(self.clone_batch_max_bytes > 0, "clone_batch_max_bytes must be > 0");
        anyhow::ensure!(self.xfer_log_max_entries > 0, "xfer_log_max_entries must be > 0");
        anyhow::ensure!(
            self.xfer_batch_max_entries > 0,
            "xfer_batch_max_entries must be > 0"
        );
        anyhow::ensure!(
            !self.final_drain_window.is_zero(),
            "final_drain_window must be > 0"
        );
        Ok(())
    }
}

/// Turn a "0 disables" duration into an optional deadline length.
pub(crate) fn enabled(d: Duration) -> Option<Duration> {
    if d.is_zero() {
        None
    } else {
        Some(d)
    }
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis().min(u128::from(u64::MAX)) as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}
