//! Session restoration decisions from on-disk evidence.
//!
//! After a restart nothing in memory says whether the agent was mid-task.
//! The restorer answers that from the stream alone: how long ago was the
//! last recorded action, what did a named session do, and what is worth
//! telling a fresh context about it.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{Duration, Utc};
use serde::Serialize;
use tracing::{debug, info};

use crate::action::{format_iso_millis, parse_timestamp, ActionEnvelope, ActionType, Severity};
use crate::store::{ActionQuery, ActionStore};

/// How many recent actions a context restore considers.
const RESTORE_SCAN_LIMIT: usize = 100;

/// Maximum highlight strings in an activity summary.
const MAX_HIGHLIGHTS: usize = 5;

/// Read-only queries that decide whether and what to restore.
pub struct SessionRestorer {
    store: Arc<ActionStore>,
}

/// Verdict of [`SessionRestorer::detect_implicit_resumption`].
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResumptionDecision {
    pub should_restore: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_activity_time: Option<String>,
    /// Minutes since the last recorded action; infinite when the stream is
    /// empty.
    pub gap_minutes: f64,
    pub threshold_minutes: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recent_context: Option<ActivitySummary>,
}

/// What a named session was doing, reconstructed from its recorded actions.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RestoredContext {
    pub session_id: String,
    pub action_count: usize,
    pub summary: String,
    pub key_decisions: Vec<ActionEnvelope>,
    pub active_workflows: Vec<String>,
    /// Human-readable time since the session's last action.
    pub gap_description: String,
}

/// Compact cross-session activity digest.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivitySummary {
    pub action_count: usize,
    pub session_count: usize,
    pub highlights: Vec<String>,
}

impl SessionRestorer {
    pub fn new(store: Arc<ActionStore>) -> Self {
        Self { store }
    }

    /// Decide whether a fresh agent start should be treated as a
    /// continuation, purely from the age of the last recorded action.
    pub fn detect_implicit_resumption(&self, threshold_minutes: u64) -> ResumptionDecision {
        let Some(last) = self.store.last_action_time() else {
            return ResumptionDecision {
                should_restore: false,
                last_activity_time: None,
                gap_minutes: f64::INFINITY,
                threshold_minutes,
                recent_context: None,
            };
        };
        let Some(last_at) = parse_timestamp(&last) else {
            debug!(timestamp = %last, "last action timestamp unparseable; not resuming");
            return ResumptionDecision {
                should_restore: false,
                last_activity_time: Some(last),
                gap_minutes: f64::INFINITY,
                threshold_minutes,
                recent_context: None,
            };
        };

        let gap_minutes = (Utc::now() - last_at).num_milliseconds().max(0) as f64 / 60_000.0;
        if gap_minutes < threshold_minutes as f64 {
            info!(
                gap_minutes = format!("{gap_minutes:.1}"),
                threshold_minutes, "recent activity found; treating start as resumption"
            );
            ResumptionDecision {
                should_restore: true,
                last_activity_time: Some(last),
                gap_minutes,
                threshold_minutes,
                recent_context: Some(self.recent_activity_summary(1)),
            }
        } else {
            ResumptionDecision {
                should_restore: false,
                last_activity_time: Some(last),
                gap_minutes,
                threshold_minutes,
                recent_context: None,
            }
        }
    }

    /// Summarize what a session did: action histogram, notable decisions,
    /// inferred workflows, and how long ago it went quiet.
    pub fn restore_context(&self, session_id: &str) -> Option<RestoredContext> {
        let actions: Vec<ActionEnvelope> = self
            .store
            .get_recent_actions(RESTORE_SCAN_LIMIT)
            .into_iter()
            .filter(|a| a.session_id.as_deref() == Some(session_id))
            .collect();
        if actions.is_empty() {
            debug!(session_id, "no recorded actions for session");
            return None;
        }

        let mut histogram: HashMap<String, usize> = HashMap::new();
        let mut critical = 0usize;
        let mut high = 0usize;
        for action in &actions {
            *histogram
                .entry(action.action_type.as_str().to_string())
                .or_default() += 1;
            match action.severity {
                Severity::Critical => critical += 1,
                Severity::High => high += 1,
                _ => {}
            }
        }

        let key_decisions: Vec<ActionEnvelope> = actions
            .iter()
            .filter(|a| {
                a.severity.is_notable()
                    || matches!(&a.action_type, ActionType::Other(tag) if tag == "decision" || tag == "commit")
            })
            .cloned()
            .collect();

        let mut active_workflows: Vec<String> = Vec::new();
        for action in &actions {
            let workflow = action
                .metadata
                .as_ref()
                .and_then(|m| m.get("workflow"))
                .and_then(|w| w.as_str())
                .map(str::to_string)
                .or_else(|| {
                    action
                        .tool_name
                        .as_deref()
                        .and_then(workflow_for_tool)
                        .map(str::to_string)
                });
            if let Some(workflow) = workflow {
                if !active_workflows.contains(&workflow) {
                    active_workflows.push(workflow);
                }
            }
        }

        let first_at = actions.first().and_then(|a| parse_timestamp(&a.timestamp));
        let last_at = actions.last().and_then(|a| parse_timestamp(&a.timestamp));
        let span = match (first_at, last_at) {
            (Some(first), Some(last)) => humanize_duration(last - first),
            _ => "an unknown span".to_string(),
        };
        let gap_description = last_at
            .map(|last| humanize_gap(Utc::now() - last))
            .unwrap_or_else(|| "an unknown time ago".to_string());

        let mut top_types: Vec<(&String, &usize)> = histogram.iter().collect();
        top_types.sort_by(|a, b| b.1.cmp(a.1).then_with(|| a.0.cmp(b.0)));
        let type_note = top_types
            .iter()
            .take(3)
            .map(|(tag, count)| format!("{count} {tag}"))
            .collect::<Vec<_>>()
            .join(", ");

        let summary = format!(
            "{} actions over {} ({}); {} critical, {} high severity",
            actions.len(),
            span,
            type_note,
            critical,
            high
        );

        info!(
            session_id,
            actions = actions.len(),
            workflows = active_workflows.len(),
            "restored session context"
        );
        Some(RestoredContext {
            session_id: session_id.to_string(),
            action_count: actions.len(),
            summary,
            key_decisions,
            active_workflows,
            gap_description,
        })
    }

    /// Digest of everything recorded in the last `hours_back` hours.
    pub fn recent_activity_summary(&self, hours_back: u64) -> ActivitySummary {
        let since = Utc::now() - Duration::hours(hours_back.min(i64::MAX as u64) as i64);
        let actions = self.store.query_actions(&ActionQuery {
            since: Some(format_iso_millis(since)),
            ..ActionQuery::default()
        });

        let mut sessions: Vec<&str> = Vec::new();
        let mut highlights = Vec::new();
        for action in &actions {
            if let Some(session) = action.session_id.as_deref() {
                if !sessions.contains(&session) {
                    sessions.push(session);
                }
            }
            if highlights.len() >= MAX_HIGHLIGHTS {
                continue;
            }
            if action.severity == Severity::Critical {
                highlights.push(format!("critical: {}", action.description));
            } else if action.action_type == ActionType::AgentStart {
                highlights.push(format!("session started on {}", action.platform));
            }
        }

        ActivitySummary {
            action_count: actions.len(),
            session_count: sessions.len(),
            highlights,
        }
    }
}

/// Map a tool name onto the workflow it implies.
fn workflow_for_tool(tool: &str) -> Option<&'static str> {
    let tool = tool.to_lowercase();
    if tool.contains("write") || tool.contains("edit") {
        Some("file-operations")
    } else if tool.contains("exec") {
        Some("command-execution")
    } else if tool.contains("browser") {
        Some("web-browsing")
    } else if tool.contains("nodes") {
        Some("device-management")
    } else if tool.contains("message") {
        Some("messaging")
    } else {
        None
    }
}

fn humanize_gap(gap: chrono::Duration) -> String {
    if gap < Duration::minutes(1) {
        "moments ago".to_string()
    } else if gap < Duration::hours(1) {
        let minutes = gap.num_minutes();
        format!("{} minute{} ago", minutes, plural(minutes))
    } else if gap < Duration::days(1) {
        let hours = gap.num_hours();
        format!("{} hour{} ago", hours, plural(hours))
    } else {
        let days = gap.num_days();
        format!("{} day{} ago", days, plural(days))
    }
}

fn humanize_duration(span: chrono::Duration) -> String {
    if span < Duration::minutes(1) {
        "under a minute".to_string()
    } else if span < Duration::hours(1) {
        let minutes = span.num_minutes();
        format!("{} minute{}", minutes, plural(minutes))
    } else {
        let hours = span.num_hours();
        format!("{} hour{}", hours, plural(hours))
    }
}

fn plural(n: i64) -> &'static str {
    if n == 1 {
        ""
    } else {
        "s"
    }
}
