//! Durable append-only storage for the action stream.
//!
//! The [`ActionStore`] owns the current day's stream file and is the only
//! mutation path into it. Appends run inside a single async mutex so
//! sequence numbers and the hash chain advance linearly; every entry is
//! flushed and fsync'd before `append` reports success. When the primary
//! path fails (I/O error, disk exhaustion) the store latches into emergency
//! mode and diverts entries, unchained, to `EMERGENCY_RECOVERY.jsonl` until
//! the process restarts.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::action::{
    canonical_json, chain_hash, ActionEnvelope, ActionType, Integrity, PersistedState,
    StreamHeader, GENESIS,
};
use crate::config::{ContinuityConfig, LogLevel};
use crate::integrity::IntegrityValidator;

/// Free space below this latches emergency mode.
pub const MIN_FREE_SPACE_MB: u64 = 100;

/// Free space below this escalates the operator banner to CRITICAL.
pub const EMERGENCY_THRESHOLD_MB: u64 = 50;

pub(crate) const STREAM_PREFIX: &str = "action-stream-";
pub(crate) const STREAM_SUFFIX: &str = ".jsonl";
pub(crate) const STATE_FILE: &str = ".state.json";
pub(crate) const EMERGENCY_FILE: &str = "EMERGENCY_RECOVERY.jsonl";
pub(crate) const CHECKPOINTS_DIR: &str = "checkpoints";
const BACKUPS_DIR: &str = "backups";

/// The stream writer. One instance per storage directory per process.
pub struct ActionStore {
    config: ContinuityConfig,
    storage_path: PathBuf,
    inner: Mutex<WriterState>,
}

#[derive(Debug, Default)]
struct WriterState {
    initialized: bool,
    sequence: u64,
    last_hash: Option<String>,
    current_stream_path: Option<PathBuf>,
    emergency_mode: bool,
    last_action_time: Option<String>,
    free_space_override: Option<u64>,
}

/// Predicates for [`ActionStore::query_actions`]. All provided fields must
/// match. Timestamp comparisons are lexical, which is correct because every
/// timestamp is fixed-width UTC.
#[derive(Debug, Clone, Default)]
pub struct ActionQuery {
    pub action_type: Option<ActionType>,
    pub platform: Option<String>,
    pub since: Option<String>,
    pub until: Option<String>,
    pub limit: Option<usize>,
}

/// Snapshot of store-level counters.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreStats {
    pub total_actions: u64,
    pub stream_files: u64,
    pub storage_size_mb: f64,
    pub last_action_time: Option<String>,
}

impl ActionStore {
    pub fn new(config: ContinuityConfig) -> Self {
        let storage_path = config.resolved_storage_path();
        Self {
            config,
            storage_path,
            inner: Mutex::new(WriterState::default()),
        }
    }

    pub fn storage_path(&self) -> &Path {
        &self.storage_path
    }

    pub fn config(&self) -> &ContinuityConfig {
        &self.config
    }

    /// Prepare the storage directory and load writer state. Idempotent.
    ///
    /// If `.state.json` is missing or unreadable the sequence and last hash
    /// are reconstructed from the newest entries on disk, so a crashed
    /// process re-chains against what was actually written rather than
    /// restarting from genesis.
    pub async fn initialize(&self) -> anyhow::Result<()> {
        let mut state = self.inner.lock().await;
        if state.initialized {
            return Ok(());
        }

        tokio::fs::create_dir_all(&self.storage_path).await?;
        tokio::fs::create_dir_all(self.storage_path.join(CHECKPOINTS_DIR)).await?;
        tokio::fs::create_dir_all(self.storage_path.join(BACKUPS_DIR)).await?;

        let state_path = self.storage_path.join(STATE_FILE);
        let loaded = match tokio::fs::read_to_string(&state_path).await {
            Ok(raw) => match serde_json::from_str::<PersistedState>(&raw) {
                Ok(persisted) => Some(persisted),
                Err(e) => {
                    warn!(error = %e, "state file is corrupt; reconstructing from stream tail");
                    None
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => {
                warn!(error = %e, "state file unreadable; reconstructing from stream tail");
                None
            }
        };

        match loaded {
            Some(persisted) => {
                state.sequence = persisted.sequence;
                state.last_hash = persisted.last_hash;
            }
            None => {
                let validator = IntegrityValidator::new(&self.storage_path);
                if let Some(tail) = validator.tail_state() {
                    warn!(
                        sequence = tail.sequence,
                        "reconstructed writer state from stream tail"
                    );
                    state.sequence = tail.sequence;
                    state.last_hash = tail.last_hash;
                }
            }
        }

        let path = self.stream_path_for(Utc::now());
        self.ensure_header(&path).await?;
        state.current_stream_path = Some(path);
        state.initialized = true;

        info!(
            storage = %self.storage_path.display(),
            sequence = state.sequence,
            integrity = self.config.enable_integrity_check,
            "continuity store initialized"
        );
        Ok(())
    }

    /// Append one action durably. Never panics and never raises: the
    /// returned bool is the whole contract.
    ///
    /// The critical section is not cancellation safe. Dropping the future
    /// between sequence assignment and commit can leave a half-written line
    /// or a sequence hole; callers must poll it to completion.
    pub async fn append(&self, entry: ActionEnvelope) -> bool {
        self.append_at(entry, Utc::now()).await
    }

    async fn append_at(&self, mut entry: ActionEnvelope, now: DateTime<Utc>) -> bool {
        if self.config.log_level == LogLevel::Off {
            return true;
        }

        let mut state = self.inner.lock().await;
        if !state.initialized {
            error!(action_id = %entry.id, "append before initialize; action dropped");
            return false;
        }
        if state.emergency_mode {
            return self.append_emergency(&entry).await;
        }

        if let Some(free_mb) = self.free_space_mb(&state) {
            if free_mb < MIN_FREE_SPACE_MB {
                if free_mb < EMERGENCY_THRESHOLD_MB {
                    error!(
                        free_mb,
                        "CRITICAL: free space below emergency threshold; diverting to emergency log"
                    );
                } else {
                    warn!(free_mb, "free space below minimum; diverting to emergency log");
                }
                state.emergency_mode = true;
                return self.append_emergency(&entry).await;
            }
        }

        // Rotate when the wall clock has crossed a UTC day boundary.
        let path = self.stream_path_for(now);
        if state.current_stream_path.as_deref() != Some(path.as_path()) {
            if let Err(e) = self.ensure_header(&path).await {
                error!(error = %e, "failed to open daily stream file");
                if io_is_storage_wide(&e) {
                    state.emergency_mode = true;
                }
                return self.append_emergency(&entry).await;
            }
            state.current_stream_path = Some(path.clone());
        }

        entry.sequence = state.sequence + 1;

        let mut sealed_hash = None;
        if self.config.enable_integrity_check {
            let previous = state
                .last_hash
                .clone()
                .unwrap_or_else(|| GENESIS.to_string());
            let canonical = match canonical_json(&entry) {
                Ok(canonical) => canonical,
                Err(e) => {
                    error!(action_id = %entry.id, error = %e, "action not serializable; state unchanged");
                    return false;
                }
            };
            let hash = chain_hash(&canonical, &previous);
            entry.integrity = Some(Integrity {
                hash: hash.clone(),
                previous,
            });
            sealed_hash = Some(hash);
        }

        let line = match serde_json::to_string(&entry) {
            Ok(line) => line,
            Err(e) => {
                error!(action_id = %entry.id, error = %e, "action not serializable; state unchanged");
                return false;
            }
        };

        match append_line_durable(&path, &line).await {
            Ok(()) => {
                state.sequence = entry.sequence;
                if let Some(hash) = sealed_hash {
                    state.last_hash = Some(hash);
                }
                state.last_action_time = Some(entry.timestamp.clone());
                true
            }
            Err(e) => {
                error!(
                    sequence = entry.sequence,
                    error = %e,
                    "durable append failed; routing to emergency log"
                );
                if io_is_storage_wide(&e) {
                    state.emergency_mode = true;
                }
                // The emergency log receives the unsealed envelope.
                entry.sequence = 0;
                entry.integrity = None;
                self.append_emergency(&entry).await
            }
        }
    }

    /// Write an entry to the unchained emergency log. No sequence, no hash.
    async fn append_emergency(&self, entry: &ActionEnvelope) -> bool {
        let mut value = match serde_json::to_value(entry) {
            Ok(value) => value,
            Err(e) => {
                error!(action_id = %entry.id, error = %e, "emergency entry not serializable");
                return false;
            }
        };
        if let Some(obj) = value.as_object_mut() {
            obj.insert("_emergency".to_string(), serde_json::json!(true));
            obj.insert(
                "_emergency_timestamp".to_string(),
                serde_json::json!(crate::action::now_iso_millis()),
            );
        }
        let path = self.storage_path.join(EMERGENCY_FILE);
        match append_line_durable(&path, &value.to_string()).await {
            Ok(()) => {
                warn!(action_id = %entry.id, "action diverted to emergency log");
                true
            }
            Err(e) => {
                error!(action_id = %entry.id, error = %e, "emergency append failed; action lost");
                false
            }
        }
    }

    /// Up to `limit` most recent valid entries from the current UTC day, in
    /// forward order. Entries from previous days are not consulted; callers
    /// that must cross midnight use [`Self::query_actions`].
    pub fn get_recent_actions(&self, limit: usize) -> Vec<ActionEnvelope> {
        let path = self.stream_path_for(Utc::now());
        let content = match std::fs::read_to_string(&path) {
            Ok(content) => content,
            Err(_) => return Vec::new(),
        };
        let mut entries: Vec<ActionEnvelope> = content
            .lines()
            .filter_map(parse_envelope_line)
            .collect();
        if entries.len() > limit {
            entries.drain(..entries.len() - limit);
        }
        entries
    }

    /// Scan all stream files in chronological order, yielding entries that
    /// match every provided predicate.
    pub fn query_actions(&self, query: &ActionQuery) -> Vec<ActionEnvelope> {
        let limit = query.limit.unwrap_or(usize::MAX);
        let mut matched = Vec::new();
        'files: for file in stream_files(&self.storage_path) {
            let content = match std::fs::read_to_string(&file) {
                Ok(content) => content,
                Err(e) => {
                    warn!(file = %file.display(), error = %e, "stream file unreadable; skipped");
                    continue;
                }
            };
            for (idx, line) in content.lines().enumerate() {
                if idx == 0 {
                    if let Ok(header) = serde_json::from_str::<StreamHeader>(line) {
                        if !crate::action::schema_supported(&header.schema_version) {
                            warn!(
                                file = %file.display(),
                                version = %header.schema_version,
                                "unsupported stream schema; file skipped"
                            );
                            continue 'files;
                        }
                        continue;
                    }
                }
                let Some(entry) = parse_envelope_line(line) else {
                    continue;
                };
                if let Some(wanted) = &query.action_type {
                    if entry.action_type != *wanted {
                        continue;
                    }
                }
                if let Some(platform) = &query.platform {
                    if entry.platform != *platform {
                        continue;
                    }
                }
                if let Some(since) = &query.since {
                    if entry.timestamp.as_str() < since.as_str() {
                        continue;
                    }
                }
                if let Some(until) = &query.until {
                    if entry.timestamp.as_str() > until.as_str() {
                        continue;
                    }
                }
                matched.push(entry);
                if matched.len() >= limit {
                    break 'files;
                }
            }
        }
        matched
    }

    /// Timestamp of the most recent entry on disk, newest file first.
    pub fn last_action_time(&self) -> Option<String> {
        for file in stream_files(&self.storage_path).into_iter().rev() {
            let Ok(content) = std::fs::read_to_string(&file) else {
                continue;
            };
            for line in content.lines().rev() {
                if let Some(entry) = parse_envelope_line(line) {
                    return Some(entry.timestamp);
                }
            }
        }
        None
    }

    pub async fn stats(&self) -> StoreStats {
        let state = self.inner.lock().await;
        let files = stream_files(&self.storage_path);
        let size_bytes = dir_size_bytes(&self.storage_path);
        let last_action_time = state
            .last_action_time
            .clone()
            .or_else(|| self.last_action_time());
        StoreStats {
            total_actions: state.sequence,
            stream_files: files.len() as u64,
            storage_size_mb: size_bytes as f64 / (1024.0 * 1024.0),
            last_action_time,
        }
    }

    /// Persist `.state.json`. Called on graceful shutdown.
    pub async fn close(&self) {
        let state = self.inner.lock().await;
        if !state.initialized {
            return;
        }
        let persisted = PersistedState {
            sequence: state.sequence,
            last_hash: state.last_hash.clone(),
        };
        if let Err(e) = self.persist_state(&persisted).await {
            warn!(error = %e, "failed to persist writer state");
        } else {
            debug!(sequence = persisted.sequence, "writer state persisted");
        }
    }

    async fn persist_state(&self, persisted: &PersistedState) -> anyhow::Result<()> {
        let json = serde_json::to_string(persisted)?;
        let tmp = self.storage_path.join(".state.json.tmp");
        let target = self.storage_path.join(STATE_FILE);

        let mut opts = tokio::fs::OpenOptions::new();
        opts.write(true).create(true).truncate(true);
        #[cfg(unix)]
        opts.mode(0o600);
        let mut file = opts.open(&tmp).await?;
        file.write_all(json.as_bytes()).await?;
        file.sync_all().await?;
        drop(file);

        tokio::fs::rename(&tmp, &target).await?;
        Ok(())
    }

    fn stream_path_for(&self, now: DateTime<Utc>) -> PathBuf {
        self.storage_path.join(format!(
            "{}{}{}",
            STREAM_PREFIX,
            now.format("%Y-%m-%d"),
            STREAM_SUFFIX
        ))
    }

    /// Create the daily file with its header line if it does not exist yet.
    /// A concurrent creator winning the race is not an error.
    async fn ensure_header(&self, path: &Path) -> std::io::Result<()> {
        if tokio::fs::try_exists(path).await.unwrap_or(false) {
            return Ok(());
        }
        let header = StreamHeader::new(self.config.enable_integrity_check);
        let line = serde_json::to_string(&header)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;

        let mut opts = tokio::fs::OpenOptions::new();
        opts.write(true).create_new(true);
        #[cfg(unix)]
        opts.mode(0o600);
        match opts.open(path).await {
            Ok(mut file) => {
                file.write_all(line.as_bytes()).await?;
                file.write_all(b"\n").await?;
                file.sync_all().await?;
                debug!(file = %path.display(), "opened new daily stream file");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                debug!(file = %path.display(), "stream file created concurrently");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    fn free_space_mb(&self, state: &WriterState) -> Option<u64> {
        if let Some(mb) = state.free_space_override {
            return Some(mb);
        }
        // If the OS will not say, assume there is room.
        fs2::available_space(&self.storage_path)
            .ok()
            .map(|bytes| bytes / (1024 * 1024))
    }

    #[cfg(test)]
    pub(crate) async fn set_free_space_override(&self, mb: Option<u64>) {
        self.inner.lock().await.free_space_override = mb;
    }

    #[cfg(test)]
    pub(crate) async fn emergency_mode(&self) -> bool {
        self.inner.lock().await.emergency_mode
    }
}

/// One open→append→fsync→close cycle per entry.
async fn append_line_durable(path: &Path, line: &str) -> std::io::Result<()> {
    let mut opts = tokio::fs::OpenOptions::new();
    opts.append(true).create(true);
    #[cfg(unix)]
    opts.mode(0o600);
    let mut file = opts.open(path).await?;
    file.write_all(line.as_bytes()).await?;
    file.write_all(b"\n").await?;
    file.sync_all().await?;
    Ok(())
}

/// Failures that indicate the whole storage target is gone, not just one
/// write.
fn io_is_storage_wide(e: &std::io::Error) -> bool {
    matches!(
        e.kind(),
        std::io::ErrorKind::StorageFull
            | std::io::ErrorKind::ReadOnlyFilesystem
            | std::io::ErrorKind::PermissionDenied
            | std::io::ErrorKind::NotFound
    )
}

/// All daily stream files under `dir`, lexically sorted. Lexical order is
/// chronological because the date is zero-padded.
pub(crate) fn stream_files(dir: &Path) -> Vec<PathBuf> {
    let mut files = Vec::new();
    if let Ok(entries) = std::fs::read_dir(dir) {
        for entry in entries.flatten() {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name.starts_with(STREAM_PREFIX) && name.ends_with(STREAM_SUFFIX) {
                files.push(entry.path());
            }
        }
    }
    files.sort();
    files
}

/// Parse one stream line into an envelope. Headers, blank lines, and
/// malformed (possibly torn) lines yield `None`.
pub(crate) fn parse_envelope_line(line: &str) -> Option<ActionEnvelope> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    serde_json::from_str::<ActionEnvelope>(line).ok()
}

fn dir_size_bytes(dir: &Path) -> u64 {
    let mut total = 0;
    if let Ok(entries) = std::fs::read_dir(dir) {
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                total += dir_size_bytes(&path);
            } else if let Ok(meta) = entry.metadata() {
                total += meta.len();
            }
        }
    }
    total
}
