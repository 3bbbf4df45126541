//! The boundary between the host agent and the continuity store.
//!
//! The host delivers lifecycle events (boot, shutdown, agent start/end,
//! tool pre/post, message in/out, compaction pre/post) and this adapter
//! turns each into appends and checkpoint writes. Side-effecting actions
//! are recorded before they execute; a critical tool call whose append
//! failed can be refused outright when the host opted into blocking.

use std::sync::Arc;

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value as JsonValue;
use tracing::{error, info, warn};

use crate::action::{now_iso_millis, ActionEnvelope, ActionType, Severity};
use crate::checkpoint::{Checkpoint, CheckpointData, CheckpointManager};
use crate::config::{ContinuityConfig, LogLevel};
use crate::health;
use crate::restore::{RestoredContext, SessionRestorer};
use crate::store::ActionStore;

/// Tool-name substrings that mark a tool as critical.
pub const DEFAULT_CRITICAL_PATTERNS: &[&str] = &[
    "exec", "write", "edit", "delete", "deploy", "payment", "message", "browser",
];

/// Outgoing messages worth recording under the `judgment` level.
/// English-only word list; locale-bound.
static DECISIONAL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(decide|decision|conclude|conclusion|recommend|analysis|think|believe)\b")
        .expect("decisional regex compiles")
});

/// Verdict for a pending tool call.
#[derive(Debug, Clone)]
pub struct ToolGate {
    /// False only when the append failed, the tool is critical, and the
    /// host asked to block on persistence failure.
    pub proceed: bool,
    /// Id of the logged `tool_call` action, for correlating the result via
    /// `parentActionId`.
    pub action_id: Option<String>,
}

/// Long-lived adapter owned by the host.
pub struct ContinuityHooks {
    config: ContinuityConfig,
    store: Arc<ActionStore>,
    checkpoints: CheckpointManager,
    restorer: SessionRestorer,
    critical_patterns: Vec<String>,
}

impl ContinuityHooks {
    pub fn new(config: ContinuityConfig) -> Self {
        let store = Arc::new(ActionStore::new(config.clone()));
        let storage_path = store.storage_path().to_path_buf();
        Self {
            checkpoints: CheckpointManager::new(&storage_path),
            restorer: SessionRestorer::new(store.clone()),
            store,
            critical_patterns: DEFAULT_CRITICAL_PATTERNS
                .iter()
                .map(|p| p.to_string())
                .collect(),
            config,
        }
    }

    /// Replace the critical-tool pattern list.
    pub fn with_critical_patterns(mut self, patterns: Vec<String>) -> Self {
        self.critical_patterns = patterns
            .into_iter()
            .map(|p| p.to_lowercase())
            .collect();
        self
    }

    pub fn store(&self) -> Arc<ActionStore> {
        self.store.clone()
    }

    pub fn checkpoints(&self) -> &CheckpointManager {
        &self.checkpoints
    }

    pub fn restorer(&self) -> &SessionRestorer {
        &self.restorer
    }

    // =========================================================================
    // Process lifecycle
    // =========================================================================

    /// `boot.post`: bring the store up and report storage health.
    pub async fn on_boot(&self) -> anyhow::Result<()> {
        self.store.initialize().await?;
        let report = health::check_storage(self.store.storage_path());
        if report.healthy {
            info!(
                stream_files = report.stream_files,
                free_space_mb = report.free_space_mb,
                "continuity storage healthy"
            );
        } else {
            warn!(issues = ?report.issues, "continuity storage degraded");
        }
        Ok(())
    }

    /// `shutdown.pre`: persist writer state.
    pub async fn on_shutdown(&self) {
        self.store.close().await;
        info!("continuity store closed");
    }

    // =========================================================================
    // Agent lifecycle
    // =========================================================================

    /// Record an agent start. When `resumed_from` names a prior session its
    /// context is reconstructed and a `continuity_restore` action logged;
    /// otherwise a small gap since the last recorded action triggers an
    /// implicit restore. Returns whatever context the host should inject.
    pub async fn on_agent_start(
        &self,
        session_id: &str,
        platform: &str,
        resumed_from: Option<&str>,
    ) -> Option<RestoredContext> {
        let mut restored = None;

        if let Some(previous) = resumed_from {
            if let Some(context) = self.restorer.restore_context(previous) {
                let entry = ActionEnvelope::new(
                    ActionType::ContinuityRestore,
                    Severity::High,
                    platform,
                    format!("restored context from session {previous}"),
                )
                .with_session(session_id)
                .with_metadata(serde_json::json!({
                    "resumedFrom": previous,
                    "actionCount": context.action_count,
                    "activeWorkflows": context.active_workflows,
                }));
                self.store.append(entry).await;
                restored = Some(context);
            } else {
                warn!(
                    session_id,
                    resumed_from = previous,
                    "resume requested but no recorded actions found"
                );
            }
        } else {
            let decision = self
                .restorer
                .detect_implicit_resumption(self.config.implicit_resume_threshold_minutes);
            if decision.should_restore {
                let entry = ActionEnvelope::new(
                    ActionType::ContinuityImplicitRestore,
                    Severity::Medium,
                    platform,
                    format!(
                        "implicit resumption after a {:.1} minute gap",
                        decision.gap_minutes
                    ),
                )
                .with_session(session_id)
                .with_metadata(serde_json::json!({
                    "gapMinutes": decision.gap_minutes,
                    "thresholdMinutes": decision.threshold_minutes,
                }));
                self.store.append(entry).await;
            }
        }

        let entry = ActionEnvelope::new(
            ActionType::AgentStart,
            Severity::Medium,
            platform,
            "agent session started",
        )
        .with_session(session_id);
        self.store.append(entry).await;

        restored
    }

    pub async fn on_agent_end(&self, session_id: &str, platform: &str) {
        let entry = ActionEnvelope::new(
            ActionType::AgentEnd,
            Severity::Medium,
            platform,
            "agent session ended",
        )
        .with_session(session_id);
        self.store.append(entry).await;
    }

    pub async fn on_agent_error(&self, session_id: &str, platform: &str, message: &str) {
        let entry = ActionEnvelope::new(
            ActionType::AgentError,
            Severity::High,
            platform,
            truncate(message, 280),
        )
        .with_session(session_id);
        self.store.append(entry).await;
    }

    // =========================================================================
    // Tool lifecycle
    // =========================================================================

    /// Record a tool call before it runs and decide whether it may proceed.
    ///
    /// Critical tools are always recorded; everything else only under the
    /// `everything` level.
    pub async fn before_tool_call(
        &self,
        session_id: &str,
        platform: &str,
        tool_name: &str,
        params: Option<&JsonValue>,
    ) -> ToolGate {
        let critical = self.is_critical_tool(tool_name);
        if !critical && self.config.log_level != LogLevel::Everything {
            return ToolGate {
                proceed: true,
                action_id: None,
            };
        }

        let severity = if critical {
            Severity::Critical
        } else {
            Severity::Medium
        };
        let entry = ActionEnvelope::new(
            ActionType::ToolCall,
            severity,
            platform,
            format!("tool call: {tool_name}"),
        )
        .with_session(session_id)
        .with_tool(tool_name, params.cloned());
        let action_id = entry.id.clone();

        let persisted = self.store.append(entry).await;
        if !persisted && critical && self.config.block_on_persistence_failure {
            error!(
                tool = tool_name,
                "action log unavailable; blocking critical tool call"
            );
            return ToolGate {
                proceed: false,
                action_id: None,
            };
        }
        ToolGate {
            proceed: true,
            action_id: persisted.then_some(action_id),
        }
    }

    /// Record a tool result, correlated back to the logged call when the
    /// gate handed out an action id.
    pub async fn after_tool_call(
        &self,
        session_id: &str,
        platform: &str,
        tool_name: &str,
        parent_action_id: Option<&str>,
        summary: &str,
    ) {
        if parent_action_id.is_none() && self.config.log_level != LogLevel::Everything {
            return;
        }
        let mut entry = ActionEnvelope::new(
            ActionType::ToolResult,
            Severity::Low,
            platform,
            truncate(summary, 280),
        )
        .with_session(session_id)
        .with_tool(tool_name, None);
        if let Some(parent) = parent_action_id {
            entry = entry.with_parent(parent);
        }
        self.store.append(entry).await;
    }

    pub async fn on_tool_error(
        &self,
        session_id: &str,
        platform: &str,
        tool_name: &str,
        parent_action_id: Option<&str>,
        message: &str,
    ) {
        let mut entry = ActionEnvelope::new(
            ActionType::ToolError,
            Severity::High,
            platform,
            truncate(message, 280),
        )
        .with_session(session_id)
        .with_tool(tool_name, None);
        if let Some(parent) = parent_action_id {
            entry = entry.with_parent(parent);
        }
        self.store.append(entry).await;
    }

    // =========================================================================
    // Messages
    // =========================================================================

    pub async fn on_message_received(&self, session_id: &str, platform: &str, preview: &str) {
        // Incoming traffic is not decisional; only `everything` records it.
        if self.config.log_level != LogLevel::Everything {
            return;
        }
        let entry = ActionEnvelope::new(
            ActionType::MessageReceived,
            Severity::Low,
            platform,
            truncate(preview, 140),
        )
        .with_session(session_id);
        self.store.append(entry).await;
    }

    /// Record an outgoing message. Under `judgment` only messages matching
    /// the decisional heuristic are admitted.
    pub async fn on_message_sending(&self, session_id: &str, platform: &str, content: &str) {
        if self.config.log_level == LogLevel::Judgment && !is_decisional(content) {
            return;
        }
        let entry = ActionEnvelope::new(
            ActionType::MessageSending,
            Severity::Medium,
            platform,
            truncate(content, 140),
        )
        .with_session(session_id);
        self.store.append(entry).await;
    }

    /// Only failed sends are recorded; a clean `message_sent` is noise.
    pub async fn on_message_send_failed(
        &self,
        session_id: &str,
        platform: &str,
        error_message: &str,
    ) {
        let entry = ActionEnvelope::new(
            ActionType::MessageSendFailed,
            Severity::High,
            platform,
            truncate(error_message, 280),
        )
        .with_session(session_id);
        self.store.append(entry).await;
    }

    pub async fn on_response_error(&self, session_id: &str, platform: &str, message: &str) {
        let entry = ActionEnvelope::new(
            ActionType::ResponseError,
            Severity::High,
            platform,
            truncate(message, 280),
        )
        .with_session(session_id);
        self.store.append(entry).await;
    }

    // =========================================================================
    // Compaction
    // =========================================================================

    /// `before_compaction`: snapshot the session, then record the event.
    pub async fn before_compaction(
        &self,
        session_id: &str,
        platform: &str,
        message_count: u64,
    ) -> Option<Checkpoint> {
        let data = CheckpointData {
            timestamp: now_iso_millis(),
            message_count,
            session_id: Some(session_id.to_string()),
            reason: Some("pre-compaction".to_string()),
            metadata: None,
        };
        let checkpoint = match self.checkpoints.create_checkpoint(data) {
            Ok(checkpoint) => Some(checkpoint),
            Err(e) => {
                warn!(session_id, error = %e, "checkpoint creation failed");
                None
            }
        };

        let mut entry = ActionEnvelope::new(
            ActionType::Compaction,
            Severity::High,
            platform,
            format!("compacting context of {message_count} messages"),
        )
        .with_session(session_id);
        if let Some(checkpoint) = &checkpoint {
            entry = entry.with_metadata(serde_json::json!({"checkpointId": checkpoint.id}));
        }
        self.store.append(entry).await;

        checkpoint
    }

    pub async fn after_compaction(&self, session_id: &str, platform: &str, message_count: u64) {
        let entry = ActionEnvelope::new(
            ActionType::CompactionComplete,
            Severity::Medium,
            platform,
            format!("context compacted to {message_count} messages"),
        )
        .with_session(session_id);
        self.store.append(entry).await;
    }

    fn is_critical_tool(&self, tool_name: &str) -> bool {
        let tool = tool_name.to_lowercase();
        self.critical_patterns
            .iter()
            .any(|pattern| tool.contains(pattern.as_str()))
    }
}

fn is_decisional(content: &str) -> bool {
    DECISIONAL.is_match(content)
}

fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        text.to_string()
    } else {
        let cut: String = text.chars().take(max_chars).collect();
        format!("{cut}…")
    }
}
