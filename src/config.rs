//! Configuration surface for the continuity store.

use serde::Deserialize;
use std::path::PathBuf;

/// Configuration consumed by the store and the lifecycle adapter.
#[derive(Debug, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct ContinuityConfig {
    /// How much of the action flow is admitted to the stream.
    #[serde(default)]
    pub log_level: LogLevel,
    /// Root directory for all continuity artifacts. A leading `~` expands to
    /// the current user's home.
    #[serde(default = "default_storage_path")]
    pub storage_path: String,
    /// Attach an `_integrity` hash-chain block to every appended entry.
    #[serde(default = "default_true")]
    pub enable_integrity_check: bool,
    /// Advisory flag read by the adapter: refuse a critical tool call whose
    /// pre-execution append failed.
    #[serde(default)]
    pub block_on_persistence_failure: bool,
    /// Gap below which a fresh agent start is treated as a continuation.
    #[serde(default = "default_resume_threshold_minutes")]
    pub implicit_resume_threshold_minutes: u64,
}

impl Default for ContinuityConfig {
    fn default() -> Self {
        Self {
            log_level: LogLevel::default(),
            storage_path: default_storage_path(),
            enable_integrity_check: default_true(),
            block_on_persistence_failure: false,
            implicit_resume_threshold_minutes: default_resume_threshold_minutes(),
        }
    }
}

impl ContinuityConfig {
    /// Storage root with `~` expanded.
    pub fn resolved_storage_path(&self) -> PathBuf {
        PathBuf::from(shellexpand::tilde(&self.storage_path).into_owned())
    }
}

fn default_storage_path() -> String {
    "~/.continuity".to_string()
}

fn default_true() -> bool {
    true
}

fn default_resume_threshold_minutes() -> u64 {
    30
}

/// Admission policy for the action stream.
#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    /// Every append is a successful no-op.
    Off,
    /// Only entries the adapter classified as decisional.
    Judgment,
    /// Everything.
    #[default]
    Everything,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Off => "off",
            LogLevel::Judgment => "judgment",
            LogLevel::Everything => "everything",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "off" => Some(LogLevel::Off),
            "judgment" => Some(LogLevel::Judgment),
            "everything" => Some(LogLevel::Everything),
            _ => None,
        }
    }
}
