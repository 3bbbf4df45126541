//! Action envelopes and the hash chain they are sealed into.
//!
//! Every observable thing the agent does is captured as one
//! [`ActionEnvelope`], serialized as a single JSON line in the daily stream
//! file. The writer assigns a process-wide monotonic `sequence` and, when
//! integrity checking is enabled, an `_integrity` block linking the entry to
//! its predecessor by SHA-256.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};

/// Version stamped into stream headers and the compaction manifest.
pub const SCHEMA_VERSION: &str = "1.0.0";

/// `previous` value of the first chained entry.
pub const GENESIS: &str = "genesis";

/// A single recorded action.
///
/// Field order matters: the canonical serialization used for hashing is the
/// struct's declaration order, so reordering fields here invalidates every
/// previously written chain.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionEnvelope {
    /// Opaque unique identifier, minted at creation.
    pub id: String,
    /// Monotonic sequence number, assigned by the writer on append.
    #[serde(default)]
    pub sequence: u64,
    /// Creation time, ISO-8601 UTC with millisecond precision.
    ///
    /// Carried as a string so the exact bytes that were hashed survive a
    /// parse/re-serialize round trip.
    pub timestamp: String,
    #[serde(rename = "type")]
    pub action_type: ActionType,
    pub severity: Severity,
    /// Originating channel/platform tag.
    pub platform: String,
    pub description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_params: Option<JsonValue>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_action_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<JsonValue>,
    #[serde(rename = "_integrity", skip_serializing_if = "Option::is_none")]
    pub integrity: Option<Integrity>,
}

impl ActionEnvelope {
    /// Create a new envelope with a fresh id and the current time.
    pub fn new(
        action_type: ActionType,
        severity: Severity,
        platform: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            sequence: 0,
            timestamp: now_iso_millis(),
            action_type,
            severity,
            platform: platform.into(),
            description: description.into(),
            tool_name: None,
            tool_params: None,
            session_id: None,
            parent_action_id: None,
            metadata: None,
            integrity: None,
        }
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn with_tool(mut self, tool_name: impl Into<String>, params: Option<JsonValue>) -> Self {
        self.tool_name = Some(tool_name.into());
        self.tool_params = params;
        self
    }

    pub fn with_parent(mut self, parent_action_id: impl Into<String>) -> Self {
        self.parent_action_id = Some(parent_action_id.into());
        self
    }

    pub fn with_metadata(mut self, metadata: JsonValue) -> Self {
        self.metadata = Some(metadata);
        self
    }

    pub fn with_timestamp(mut self, timestamp: impl Into<String>) -> Self {
        self.timestamp = timestamp.into();
        self
    }
}

/// What kind of action was recorded.
///
/// The tag set is open: unknown tags round-trip unchanged through
/// `Other`, so a newer writer's entries survive an older reader.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ActionType {
    AgentStart,
    AgentEnd,
    AgentError,
    ToolCall,
    ToolResult,
    ToolError,
    MessageReceived,
    MessageSending,
    MessageSendFailed,
    ResponseError,
    Compaction,
    CompactionComplete,
    ContinuityRestore,
    ContinuityImplicitRestore,
    Other(String),
}

impl ActionType {
    pub fn as_str(&self) -> &str {
        match self {
            ActionType::AgentStart => "agent_start",
            ActionType::AgentEnd => "agent_end",
            ActionType::AgentError => "agent_error",
            ActionType::ToolCall => "tool_call",
            ActionType::ToolResult => "tool_result",
            ActionType::ToolError => "tool_error",
            ActionType::MessageReceived => "message_received",
            ActionType::MessageSending => "message_sending",
            ActionType::MessageSendFailed => "message_send_failed",
            ActionType::ResponseError => "response_error",
            ActionType::Compaction => "compaction",
            ActionType::CompactionComplete => "compaction_complete",
            ActionType::ContinuityRestore => "continuity_restore",
            ActionType::ContinuityImplicitRestore => "continuity_implicit_restore",
            ActionType::Other(tag) => tag,
        }
    }

    pub fn from_tag(tag: &str) -> Self {
        match tag {
            "agent_start" => ActionType::AgentStart,
            "agent_end" => ActionType::AgentEnd,
            "agent_error" => ActionType::AgentError,
            "tool_call" => ActionType::ToolCall,
            "tool_result" => ActionType::ToolResult,
            "tool_error" => ActionType::ToolError,
            "message_received" => ActionType::MessageReceived,
            "message_sending" => ActionType::MessageSending,
            "message_send_failed" => ActionType::MessageSendFailed,
            "response_error" => ActionType::ResponseError,
            "compaction" => ActionType::Compaction,
            "compaction_complete" => ActionType::CompactionComplete,
            "continuity_restore" => ActionType::ContinuityRestore,
            "continuity_implicit_restore" => ActionType::ContinuityImplicitRestore,
            other => ActionType::Other(other.to_string()),
        }
    }
}

impl Serialize for ActionType {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for ActionType {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let tag = String::deserialize(deserializer)?;
        Ok(ActionType::from_tag(&tag))
    }
}

/// How consequential an action is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Critical,
    High,
    Medium,
    Low,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Critical => "critical",
            Severity::High => "high",
            Severity::Medium => "medium",
            Severity::Low => "low",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "critical" => Some(Severity::Critical),
            "high" => Some(Severity::High),
            "medium" => Some(Severity::Medium),
            "low" => Some(Severity::Low),
            _ => None,
        }
    }

    /// Severities that mark an action as worth resurfacing on restore.
    pub fn is_notable(&self) -> bool {
        matches!(self, Severity::Critical | Severity::High)
    }
}

/// Hash-chain block attached to each entry when integrity is enabled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Integrity {
    pub hash: String,
    pub previous: String,
}

/// First line of every daily stream file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamHeader {
    #[serde(rename = "_header")]
    pub header: bool,
    pub schema_version: String,
    pub created: String,
    pub integrity_enabled: bool,
}

impl StreamHeader {
    pub fn new(integrity_enabled: bool) -> Self {
        Self {
            header: true,
            schema_version: SCHEMA_VERSION.to_string(),
            created: now_iso_millis(),
            integrity_enabled,
        }
    }
}

/// Contents of `.state.json`, rewritten on graceful shutdown.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedState {
    pub sequence: u64,
    #[serde(rename = "lastHash")]
    pub last_hash: Option<String>,
}

/// True when a reader built against this crate understands `version`.
///
/// Unknown minor/patch versions are tolerated; a different major version is
/// rejected.
pub fn schema_supported(version: &str) -> bool {
    version.split('.').next() == SCHEMA_VERSION.split('.').next()
}

/// Current time as ISO-8601 UTC with millisecond precision and trailing `Z`.
pub fn now_iso_millis() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub fn format_iso_millis(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Canonical serialization of an entry for hashing.
///
/// The canonical form is the entry minus its `_integrity` block, serialized
/// with struct fields in declaration order and map keys sorted. The writer
/// hashes these exact bytes and the validator reproduces them by parsing the
/// stored line and re-serializing through this same function.
pub fn canonical_json(entry: &ActionEnvelope) -> anyhow::Result<String> {
    let mut stripped = entry.clone();
    stripped.integrity = None;
    Ok(serde_json::to_string(&stripped)?)
}

/// SHA-256 over the canonical bytes concatenated with the previous hash,
/// hex-lowercase.
pub fn chain_hash(canonical: &str, previous: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    hasher.update(previous.as_bytes());
    hex::encode(hasher.finalize())
}
