//! Boot-time health probe for the continuity storage directory.

use std::path::Path;

use serde::Serialize;
use tracing::debug;

use crate::integrity::IntegrityValidator;
use crate::store::{stream_files, MIN_FREE_SPACE_MB};

/// Result of a storage health probe.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageHealth {
    pub healthy: bool,
    pub writable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub free_space_mb: Option<u64>,
    pub stream_files: u64,
    pub chain_valid: bool,
    pub issues: Vec<String>,
}

/// Probe the storage directory: writability, free space, and chain state.
/// The chain validation is a full scan of the daily stream files.
pub fn check_storage(storage_path: &Path) -> StorageHealth {
    let mut issues = Vec::new();

    let writable = probe_writable(storage_path);
    if !writable {
        issues.push(format!(
            "storage path {} is not writable",
            storage_path.display()
        ));
    }

    let free_space_mb = fs2::available_space(storage_path)
        .ok()
        .map(|bytes| bytes / (1024 * 1024));
    if let Some(free) = free_space_mb {
        if free < MIN_FREE_SPACE_MB {
            issues.push(format!(
                "only {free} MB free, below the {MIN_FREE_SPACE_MB} MB floor"
            ));
        }
    }

    let files = stream_files(storage_path);
    let report = IntegrityValidator::new(storage_path).validate_stream();
    if !report.valid {
        issues.push(format!(
            "integrity validation found {} error(s)",
            report.errors.len()
        ));
    }

    debug!(
        writable,
        stream_files = files.len(),
        chain_valid = report.valid,
        "storage health probed"
    );

    StorageHealth {
        healthy: issues.is_empty(),
        writable,
        free_space_mb,
        stream_files: files.len() as u64,
        chain_valid: report.valid,
        issues,
    }
}

fn probe_writable(storage_path: &Path) -> bool {
    if std::fs::create_dir_all(storage_path).is_err() {
        return false;
    }
    let probe = storage_path.join(".health-probe");
    match std::fs::write(&probe, b"ok") {
        Ok(()) => {
            let _ = std::fs::remove_file(&probe);
            true
        }
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::{ActionEnvelope, ActionType, Severity};
    use crate::config::ContinuityConfig;
    use crate::store::ActionStore;

    #[tokio::test]
    async fn healthy_storage_reports_clean() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = ActionStore::new(ContinuityConfig {
            storage_path: dir.path().to_string_lossy().into_owned(),
            ..ContinuityConfig::default()
        });
        store.initialize().await.expect("initialize");
        assert!(
            store
                .append(ActionEnvelope::new(
                    ActionType::AgentStart,
                    Severity::Medium,
                    "openclaw",
                    "started"
                ))
                .await
        );

        let health = check_storage(dir.path());
        assert!(health.healthy, "issues: {:?}", health.issues);
        assert!(health.writable);
        assert!(health.chain_valid);
        assert_eq!(health.stream_files, 1);
    }

    #[tokio::test]
    async fn tampered_chain_degrades_health() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = ActionStore::new(ContinuityConfig {
            storage_path: dir.path().to_string_lossy().into_owned(),
            ..ContinuityConfig::default()
        });
        store.initialize().await.expect("initialize");
        for i in 0..2 {
            assert!(
                store
                    .append(ActionEnvelope::new(
                        ActionType::ToolCall,
                        Severity::Critical,
                        "openclaw",
                        format!("step {i}")
                    ))
                    .await
            );
        }
        let file = &stream_files(dir.path())[0];
        let content = std::fs::read_to_string(file).expect("read");
        std::fs::write(file, content.replace("step 0", "rewritten")).expect("write");

        let health = check_storage(dir.path());
        assert!(!health.healthy);
        assert!(!health.chain_valid);
        assert!(health.issues.iter().any(|i| i.contains("integrity")));
    }

    #[test]
    fn missing_directory_is_created_by_probe() {
        let dir = tempfile::tempdir().expect("tempdir");
        let nested = dir.path().join("not-yet-created");
        let health = check_storage(&nested);
        assert!(health.writable);
        assert_eq!(health.stream_files, 0);
        assert!(health.chain_valid);
    }
}
