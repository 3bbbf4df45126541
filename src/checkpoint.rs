//! Pre-compaction checkpoints and the recovery manifest.
//!
//! Just before the host compacts its in-memory context, a small snapshot of
//! the session (message count, identity, free-form metadata) is written to
//! `checkpoints/` and `COMPACTION_MANIFEST.json` is overwritten to point at
//! it. After a restart the manifest tells the host whether a recovery
//! window is still available.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tracing::{debug, info, warn};

use crate::action::{schema_supported, SCHEMA_VERSION};
use crate::store::CHECKPOINTS_DIR;

/// Checkpoints on disk are pruned down to this many, newest first.
pub const MAX_CHECKPOINTS: usize = 50;

/// Number of trailing messages recorded as recoverable in the manifest.
const RECOVERY_WINDOW_MESSAGES: u64 = 100;

pub(crate) const MANIFEST_FILE: &str = "COMPACTION_MANIFEST.json";

/// Snapshot payload supplied by the host at compaction time.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckpointData {
    /// When the checkpoint was taken, ISO-8601 UTC milliseconds.
    pub timestamp: String,
    /// Messages in the context being compacted.
    pub message_count: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<JsonValue>,
}

/// A persisted checkpoint: the host payload plus the minted id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub id: String,
    #[serde(flatten)]
    pub data: CheckpointData,
}

/// The single, overwritten recovery manifest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompactionManifest {
    pub schema_version: String,
    pub checkpoint: Checkpoint,
    #[serde(rename = "recoveryInfo")]
    pub recovery_info: RecoveryInfo,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecoveryInfo {
    pub original_message_range: MessageRange,
    pub compacted_at: String,
    pub can_recover: bool,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct MessageRange {
    pub start: u64,
    pub end: u64,
}

/// Writes and reads checkpoints under one storage directory.
pub struct CheckpointManager {
    storage_path: PathBuf,
}

impl CheckpointManager {
    pub fn new(storage_path: impl Into<PathBuf>) -> Self {
        Self {
            storage_path: storage_path.into(),
        }
    }

    fn checkpoints_dir(&self) -> PathBuf {
        self.storage_path.join(CHECKPOINTS_DIR)
    }

    fn manifest_path(&self) -> PathBuf {
        self.storage_path.join(MANIFEST_FILE)
    }

    /// Persist a checkpoint, point the manifest at it, and prune old ones.
    ///
    /// A manifest write failure is logged at warn and does not fail the
    /// call: the checkpoint file itself is already safe on disk.
    pub fn create_checkpoint(&self, data: CheckpointData) -> anyhow::Result<Checkpoint> {
        let dir = self.checkpoints_dir();
        std::fs::create_dir_all(&dir)?;

        let suffix: String = uuid::Uuid::new_v4().simple().to_string()[..6].to_string();
        let checkpoint = Checkpoint {
            id: format!(
                "checkpoint-{}-{}",
                chrono::Utc::now().timestamp_millis(),
                suffix
            ),
            data,
        };

        let path = dir.join(format!("{}.json", checkpoint.id));
        write_json_file(&path, &checkpoint)?;

        let manifest = CompactionManifest {
            schema_version: SCHEMA_VERSION.to_string(),
            checkpoint: checkpoint.clone(),
            recovery_info: RecoveryInfo {
                original_message_range: MessageRange {
                    start: checkpoint
                        .data
                        .message_count
                        .saturating_sub(RECOVERY_WINDOW_MESSAGES),
                    end: checkpoint.data.message_count,
                },
                compacted_at: checkpoint.data.timestamp.clone(),
                can_recover: true,
            },
        };
        if let Err(e) = self.write_manifest(&manifest) {
            warn!(checkpoint = %checkpoint.id, error = %e, "failed to update compaction manifest");
        }

        self.prune();

        info!(
            checkpoint = %checkpoint.id,
            messages = checkpoint.data.message_count,
            "checkpoint created"
        );
        Ok(checkpoint)
    }

    /// All checkpoints on disk, newest first. Unreadable files are skipped.
    pub fn list_checkpoints(&self) -> Vec<Checkpoint> {
        let mut checkpoints = Vec::new();
        let Ok(entries) = std::fs::read_dir(self.checkpoints_dir()) else {
            return checkpoints;
        };
        for entry in entries.flatten() {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if !name.starts_with("checkpoint-") || !name.ends_with(".json") {
                continue;
            }
            match std::fs::read_to_string(entry.path())
                .map_err(anyhow::Error::from)
                .and_then(|raw| Ok(serde_json::from_str::<Checkpoint>(&raw)?))
            {
                Ok(checkpoint) => checkpoints.push(checkpoint),
                Err(e) => {
                    warn!(file = %entry.path().display(), error = %e, "skipping unreadable checkpoint");
                }
            }
        }
        checkpoints.sort_by(|a, b| {
            b.data
                .timestamp
                .cmp(&a.data.timestamp)
                .then_with(|| b.id.cmp(&a.id))
        });
        checkpoints
    }

    pub fn get_last_checkpoint(&self) -> Option<Checkpoint> {
        self.list_checkpoints().into_iter().next()
    }

    pub fn get_manifest(&self) -> Option<CompactionManifest> {
        let raw = std::fs::read_to_string(self.manifest_path()).ok()?;
        let manifest: CompactionManifest = match serde_json::from_str(&raw) {
            Ok(manifest) => manifest,
            Err(e) => {
                warn!(error = %e, "compaction manifest is corrupt");
                return None;
            }
        };
        if !schema_supported(&manifest.schema_version) {
            warn!(
                version = %manifest.schema_version,
                "compaction manifest schema is not supported"
            );
            return None;
        }
        Some(manifest)
    }

    /// True when the manifest points at a recoverable checkpoint whose file
    /// still exists.
    pub fn can_recover(&self) -> bool {
        let Some(manifest) = self.get_manifest() else {
            return false;
        };
        if !manifest.recovery_info.can_recover {
            return false;
        }
        self.checkpoints_dir()
            .join(format!("{}.json", manifest.checkpoint.id))
            .exists()
    }

    /// Consume the recovery window: if the manifest references `id`, flip
    /// `canRecover` off. Returns whether anything changed.
    pub fn mark_recovered(&self, id: &str) -> anyhow::Result<bool> {
        let Some(mut manifest) = self.get_manifest() else {
            return Ok(false);
        };
        if manifest.checkpoint.id != id {
            debug!(
                requested = id,
                current = %manifest.checkpoint.id,
                "mark_recovered for a checkpoint the manifest no longer references"
            );
            return Ok(false);
        }
        manifest.recovery_info.can_recover = false;
        self.write_manifest(&manifest)?;
        info!(checkpoint = id, "recovery window consumed");
        Ok(true)
    }

    fn write_manifest(&self, manifest: &CompactionManifest) -> anyhow::Result<()> {
        write_json_file(&self.manifest_path(), manifest)
    }

    /// Delete the oldest checkpoints beyond [`MAX_CHECKPOINTS`].
    fn prune(&self) {
        let checkpoints = self.list_checkpoints();
        if checkpoints.len() <= MAX_CHECKPOINTS {
            return;
        }
        let excess = &checkpoints[MAX_CHECKPOINTS..];
        let dir = self.checkpoints_dir();
        let mut removed = 0usize;
        for checkpoint in excess {
            let path = dir.join(format!("{}.json", checkpoint.id));
            match std::fs::remove_file(&path) {
                Ok(()) => removed += 1,
                Err(e) => warn!(file = %path.display(), error = %e, "failed to prune checkpoint"),
            }
        }
        if removed > 0 {
            debug!(removed, kept = MAX_CHECKPOINTS, "pruned old checkpoints");
        }
    }
}

/// Write JSON through a temp file and rename, mode 0600.
fn write_json_file<T: Serialize>(path: &Path, value: &T) -> anyhow::Result<()> {
    let json = serde_json::to_string_pretty(value)?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, json)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&tmp, std::fs::Permissions::from_mode(0o600))?;
    }
    std::fs::rename(&tmp, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_data(message_count: u64, timestamp: &str) -> CheckpointData {
        CheckpointData {
            timestamp: timestamp.to_string(),
            message_count,
            session_id: Some("s-1".to_string()),
            reason: Some("pre-compaction".to_string()),
            metadata: None,
        }
    }

    #[test]
    fn checkpoint_and_manifest_roundtrip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let manager = CheckpointManager::new(dir.path());

        let checkpoint = manager
            .create_checkpoint(sample_data(250, "2030-01-01T12:00:00.000Z"))
            .expect("create checkpoint");
        assert!(checkpoint.id.starts_with("checkpoint-"));

        let manifest = manager.get_manifest().expect("manifest");
        assert_eq!(manifest.schema_version, SCHEMA_VERSION);
        assert_eq!(manifest.checkpoint.id, checkpoint.id);
        assert_eq!(manifest.recovery_info.original_message_range.start, 150);
        assert_eq!(manifest.recovery_info.original_message_range.end, 250);
        assert_eq!(
            manifest.recovery_info.compacted_at,
            "2030-01-01T12:00:00.000Z"
        );
        assert!(manifest.recovery_info.can_recover);

        let last = manager.get_last_checkpoint().expect("last checkpoint");
        assert_eq!(last.id, checkpoint.id);
        assert_eq!(last.data.session_id.as_deref(), Some("s-1"));
    }

    #[test]
    fn small_contexts_start_recovery_range_at_zero() {
        let dir = tempfile::tempdir().expect("tempdir");
        let manager = CheckpointManager::new(dir.path());
        manager
            .create_checkpoint(sample_data(40, "2030-01-01T12:00:00.000Z"))
            .expect("create checkpoint");
        let manifest = manager.get_manifest().expect("manifest");
        assert_eq!(manifest.recovery_info.original_message_range.start, 0);
        assert_eq!(manifest.recovery_info.original_message_range.end, 40);
    }

    #[test]
    fn manifest_is_overwritten_by_newer_checkpoints() {
        let dir = tempfile::tempdir().expect("tempdir");
        let manager = CheckpointManager::new(dir.path());
        manager
            .create_checkpoint(sample_data(10, "2030-01-01T01:00:00.000Z"))
            .expect("first");
        let second = manager
            .create_checkpoint(sample_data(20, "2030-01-01T02:00:00.000Z"))
            .expect("second");

        let manifest = manager.get_manifest().expect("manifest");
        assert_eq!(manifest.checkpoint.id, second.id);
        assert_eq!(manager.list_checkpoints().len(), 2);
    }

    #[test]
    fn can_recover_requires_manifest_flag_and_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let manager = CheckpointManager::new(dir.path());
        assert!(!manager.can_recover(), "empty storage has nothing to recover");

        let checkpoint = manager
            .create_checkpoint(sample_data(10, "2030-01-01T01:00:00.000Z"))
            .expect("create");
        assert!(manager.can_recover());

        // Deleting the checkpoint file invalidates recovery even though the
        // manifest still says yes.
        std::fs::remove_file(
            dir.path()
                .join(CHECKPOINTS_DIR)
                .join(format!("{}.json", checkpoint.id)),
        )
        .expect("remove");
        assert!(!manager.can_recover());
    }

    #[test]
    fn mark_recovered_flips_the_manifest_once() {
        let dir = tempfile::tempdir().expect("tempdir");
        let manager = CheckpointManager::new(dir.path());
        let checkpoint = manager
            .create_checkpoint(sample_data(10, "2030-01-01T01:00:00.000Z"))
            .expect("create");

        assert!(manager.mark_recovered(&checkpoint.id).expect("mark"));
        assert!(!manager.can_recover());
        let manifest = manager.get_manifest().expect("manifest");
        assert!(!manifest.recovery_info.can_recover);

        // A stale id is a no-op.
        assert!(!manager.mark_recovered("checkpoint-0-abc").expect("stale"));
    }

    #[test]
    fn pruning_keeps_the_newest_fifty() {
        let dir = tempfile::tempdir().expect("tempdir");
        let manager = CheckpointManager::new(dir.path());
        for i in 0..(MAX_CHECKPOINTS + 1) {
            manager
                .create_checkpoint(sample_data(
                    i as u64,
                    &format!("2030-01-01T00:{:02}:00.000Z", i % 60),
                ))
                .expect("create");
        }
        let remaining = std::fs::read_dir(dir.path().join(CHECKPOINTS_DIR))
            .expect("read dir")
            .flatten()
            .filter(|e| e.file_name().to_string_lossy().ends_with(".json"))
            .count();
        assert_eq!(remaining, MAX_CHECKPOINTS);
    }
}
