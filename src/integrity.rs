//! Read-only verification of the on-disk action stream.
//!
//! The validator re-derives every chained entry's hash and confirms that
//! each `previous` link matches its predecessor, reporting tampering,
//! truncation, and unparseable lines without ever touching the files.

use std::path::PathBuf;

use serde::Serialize;
use tracing::debug;

use crate::action::{
    canonical_json, chain_hash, schema_supported, PersistedState, StreamHeader, GENESIS,
};
use crate::store::{parse_envelope_line, stream_files};

/// Scans the stream files under one storage directory.
pub struct IntegrityValidator {
    storage_path: PathBuf,
}

/// Outcome of a full stream scan.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IntegrityReport {
    pub valid: bool,
    pub total_checked: u64,
    pub errors: Vec<IntegrityIssue>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub first_action: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_action: Option<String>,
}

/// One defect found during validation.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IntegrityIssue {
    pub kind: IssueKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sequence: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    pub detail: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueKind {
    ChainBreak,
    HashMismatch,
    InvalidJson,
    UnreadableFile,
    UnsupportedSchema,
}

impl IssueKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            IssueKind::ChainBreak => "chain_break",
            IssueKind::HashMismatch => "hash_mismatch",
            IssueKind::InvalidJson => "invalid_json",
            IssueKind::UnreadableFile => "unreadable_file",
            IssueKind::UnsupportedSchema => "unsupported_schema",
        }
    }
}

impl IntegrityValidator {
    pub fn new(storage_path: impl Into<PathBuf>) -> Self {
        Self {
            storage_path: storage_path.into(),
        }
    }

    /// Walk every stream file in chronological order and certify the chain.
    ///
    /// Entries without an `_integrity` block are tolerated (they predate
    /// integrity checking or were written with it disabled) and do not
    /// advance the rolling hash. An unparseable final line of the newest
    /// file is treated as a torn write from a crash, not an error.
    pub fn validate_stream(&self) -> IntegrityReport {
        let files = stream_files(&self.storage_path);
        let mut report = IntegrityReport {
            valid: true,
            total_checked: 0,
            errors: Vec::new(),
            first_action: None,
            last_action: None,
        };
        let mut previous_hash: Option<String> = None;
        let last_file_idx = files.len().saturating_sub(1);

        for (file_idx, file) in files.iter().enumerate() {
            let content = match std::fs::read_to_string(file) {
                Ok(content) => content,
                Err(e) => {
                    report.errors.push(IntegrityIssue {
                        kind: IssueKind::UnreadableFile,
                        sequence: None,
                        file: Some(file.display().to_string()),
                        detail: e.to_string(),
                    });
                    continue;
                }
            };
            let lines: Vec<&str> = content.lines().collect();
            let last_line_idx = lines.len().saturating_sub(1);

            for (line_idx, line) in lines.iter().copied().enumerate() {
                if line.trim().is_empty() {
                    continue;
                }
                if line_idx == 0 {
                    if let Ok(header) = serde_json::from_str::<StreamHeader>(line) {
                        if !schema_supported(&header.schema_version) {
                            report.errors.push(IntegrityIssue {
                                kind: IssueKind::UnsupportedSchema,
                                sequence: None,
                                file: Some(file.display().to_string()),
                                detail: format!(
                                    "stream schema {} is not supported",
                                    header.schema_version
                                ),
                            });
                            break;
                        }
                        continue;
                    }
                }

                let Some(entry) = parse_envelope_line(line) else {
                    if file_idx == last_file_idx && line_idx == last_line_idx {
                        debug!(file = %file.display(), "ignoring torn final line");
                    } else {
                        report.errors.push(IntegrityIssue {
                            kind: IssueKind::InvalidJson,
                            sequence: None,
                            file: Some(file.display().to_string()),
                            detail: format!("line {} is not a valid action", line_idx + 1),
                        });
                    }
                    continue;
                };

                report.total_checked += 1;
                if report.first_action.is_none() {
                    report.first_action = Some(entry.timestamp.clone());
                }
                report.last_action = Some(entry.timestamp.clone());

                let Some(integrity) = &entry.integrity else {
                    continue;
                };

                let expected_previous = previous_hash.as_deref().unwrap_or(GENESIS);
                if integrity.previous != expected_previous {
                    report.errors.push(IntegrityIssue {
                        kind: IssueKind::ChainBreak,
                        sequence: Some(entry.sequence),
                        file: Some(file.display().to_string()),
                        detail: format!(
                            "previous is {} but the chain expects {}",
                            integrity.previous, expected_previous
                        ),
                    });
                }

                let recomputed = match canonical_json(&entry) {
                    Ok(canonical) => chain_hash(&canonical, &integrity.previous),
                    Err(e) => {
                        report.errors.push(IntegrityIssue {
                            kind: IssueKind::HashMismatch,
                            sequence: Some(entry.sequence),
                            file: Some(file.display().to_string()),
                            detail: format!("entry could not be re-canonicalized: {e}"),
                        });
                        continue;
                    }
                };
                if recomputed != integrity.hash {
                    report.errors.push(IntegrityIssue {
                        kind: IssueKind::HashMismatch,
                        sequence: Some(entry.sequence),
                        file: Some(file.display().to_string()),
                        detail: "stored hash does not match recomputed content".to_string(),
                    });
                }

                // Roll forward with the recomputed hash so a tampered entry
                // also surfaces as a chain break on its successor.
                previous_hash = Some(recomputed);
            }
        }

        report.valid = report.errors.is_empty();
        report
    }

    /// Hash of the most recent chained entry, scanning newest-first.
    pub fn last_hash(&self) -> Option<String> {
        self.tail_state().and_then(|state| state.last_hash)
    }

    /// Last persisted writer state as evidenced by the stream files: the
    /// newest entry's sequence and the newest chained entry's hash. Used to
    /// self-heal a missing `.state.json`.
    pub fn tail_state(&self) -> Option<PersistedState> {
        let mut sequence: Option<u64> = None;
        let mut last_hash: Option<String> = None;

        'files: for file in stream_files(&self.storage_path).into_iter().rev() {
            let Ok(content) = std::fs::read_to_string(&file) else {
                continue;
            };
            for line in content.lines().rev() {
                let Some(entry) = parse_envelope_line(line) else {
                    continue;
                };
                if sequence.is_none() {
                    sequence = Some(entry.sequence);
                }
                if last_hash.is_none() {
                    if let Some(integrity) = entry.integrity {
                        last_hash = Some(integrity.hash);
                    }
                }
                if sequence.is_some() && last_hash.is_some() {
                    break 'files;
                }
            }
        }

        sequence.map(|sequence| PersistedState {
            sequence,
            last_hash,
        })
    }
}
