//! Durable, tamper-evident action logging and session continuity for
//! long-running agents.
//!
//! Every side-effecting action an agent takes is appended, fsync'd, and
//! hash-chained to stable storage *before* it executes, so that after a
//! crash, restart, or context compaction the history can be inspected,
//! verified, and partially reconstructed. The pieces:
//!
//! - [`store::ActionStore`] — the append-only daily stream writer
//! - [`integrity::IntegrityValidator`] — read-only chain verification
//! - [`checkpoint::CheckpointManager`] — pre-compaction recovery snapshots
//! - [`restore::SessionRestorer`] — implicit-resumption and context queries
//! - [`hooks::ContinuityHooks`] — the adapter a host drives with its
//!   lifecycle events
//!
//! A host owns one [`hooks::ContinuityHooks`] for the life of the process:
//!
//! ```no_run
//! # async fn demo() -> anyhow::Result<()> {
//! use agent_continuity::{ContinuityConfig, ContinuityHooks};
//!
//! let hooks = ContinuityHooks::new(ContinuityConfig::default());
//! hooks.on_boot().await?;
//! let gate = hooks
//!     .before_tool_call("session-1", "openclaw", "write_file", None)
//!     .await;
//! if gate.proceed {
//!     // run the tool, then:
//!     hooks
//!         .after_tool_call(
//!             "session-1",
//!             "openclaw",
//!             "write_file",
//!             gate.action_id.as_deref(),
//!             "wrote 1 file",
//!         )
//!         .await;
//! }
//! hooks.on_shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod action;
pub mod checkpoint;
pub mod config;
pub mod health;
pub mod hooks;
pub mod integrity;
pub mod restore;
pub mod store;

pub use action::{
    ActionEnvelope, ActionType, Integrity, PersistedState, Severity, StreamHeader, GENESIS,
    SCHEMA_VERSION,
};
pub use checkpoint::{
    Checkpoint, CheckpointData, CheckpointManager, CompactionManifest, MessageRange, RecoveryInfo,
    MAX_CHECKPOINTS,
};
pub use config::{ContinuityConfig, LogLevel};
pub use health::{check_storage, StorageHealth};
pub use hooks::{ContinuityHooks, ToolGate, DEFAULT_CRITICAL_PATTERNS};
pub use integrity::{IntegrityIssue, IntegrityReport, IntegrityValidator, IssueKind};
pub use restore::{ActivitySummary, RestoredContext, ResumptionDecision, SessionRestorer};
pub use store::{
    ActionQuery, ActionStore, StoreStats, EMERGENCY_THRESHOLD_MB, MIN_FREE_SPACE_MB,
};
