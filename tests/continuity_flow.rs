//! End-to-end flows through the public API: a host boots, records actions,
//! restarts, and audits what survived.

use agent_continuity::{
    ActionEnvelope, ActionQuery, ActionStore, ActionType, CheckpointData, CheckpointManager,
    ContinuityConfig, ContinuityHooks, IntegrityValidator, IssueKind, PersistedState,
    SessionRestorer, Severity, GENESIS, MAX_CHECKPOINTS,
};
use chrono::{Duration, SecondsFormat, Utc};
use std::path::Path;
use std::sync::Arc;

fn config_for(dir: &Path) -> ContinuityConfig {
    ContinuityConfig {
        storage_path: dir.to_string_lossy().into_owned(),
        ..ContinuityConfig::default()
    }
}

fn tool_call(description: &str) -> ActionEnvelope {
    ActionEnvelope::new(
        ActionType::ToolCall,
        Severity::Critical,
        "openclaw",
        description,
    )
    .with_tool("write_file", None)
    .with_session("s-flow")
}

#[tokio::test]
async fn cold_start_produces_a_sealed_first_entry() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = ActionStore::new(config_for(dir.path()));
    store.initialize().await.expect("initialize");

    assert!(store.append(tool_call("first write")).await);
    store.close().await;

    // One daily file: a header line followed by the sealed entry.
    let today = Utc::now().format("%Y-%m-%d");
    let stream = dir.path().join(format!("action-stream-{today}.jsonl"));
    let content = std::fs::read_to_string(&stream).expect("stream file");
    let lines: Vec<&str> = content.lines().collect();
    assert_eq!(lines.len(), 2);

    let header: serde_json::Value = serde_json::from_str(lines[0]).expect("header json");
    assert_eq!(header["_header"], serde_json::json!(true));
    assert_eq!(header["schema_version"], serde_json::json!("1.0.0"));

    let entry: ActionEnvelope = serde_json::from_str(lines[1]).expect("entry json");
    assert_eq!(entry.sequence, 1);
    let integrity = entry.integrity.expect("integrity");
    assert_eq!(integrity.previous, GENESIS);
    assert_eq!(integrity.hash.len(), 64);
    assert!(integrity.hash.chars().all(|c| c.is_ascii_hexdigit()));

    let raw_state = std::fs::read_to_string(dir.path().join(".state.json")).expect("state");
    let state: PersistedState = serde_json::from_str(&raw_state).expect("state json");
    assert_eq!(state.sequence, 1);
    assert_eq!(state.last_hash, Some(integrity.hash));
}

#[tokio::test]
async fn chain_survives_a_clean_restart() {
    let dir = tempfile::tempdir().expect("tempdir");
    {
        let store = ActionStore::new(config_for(dir.path()));
        store.initialize().await.expect("initialize");
        for i in 0..3 {
            assert!(store.append(tool_call(&format!("write {i}"))).await);
        }
        store.close().await;
    }
    {
        let store = ActionStore::new(config_for(dir.path()));
        store.initialize().await.expect("re-initialize");
        assert!(store.append(tool_call("write 3")).await);
        store.close().await;
    }

    let report = IntegrityValidator::new(dir.path()).validate_stream();
    assert!(report.valid, "errors: {:?}", report.errors);
    assert_eq!(report.total_checked, 4);

    let store = ActionStore::new(config_for(dir.path()));
    let actions = store.query_actions(&ActionQuery::default());
    assert_eq!(actions.len(), 4);
    let third = actions[2].integrity.as_ref().expect("third");
    let fourth = actions[3].integrity.as_ref().expect("fourth");
    assert_eq!(fourth.previous, third.hash);
}

#[tokio::test]
async fn tampering_is_reported_with_sequence_numbers() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = ActionStore::new(config_for(dir.path()));
    store.initialize().await.expect("initialize");
    for i in 0..3 {
        assert!(store.append(tool_call(&format!("write {i}"))).await);
    }

    let today = Utc::now().format("%Y-%m-%d");
    let stream = dir.path().join(format!("action-stream-{today}.jsonl"));
    let content = std::fs::read_to_string(&stream).expect("read");
    std::fs::write(&stream, content.replace("write 1", "tampered")).expect("write");

    let report = IntegrityValidator::new(dir.path()).validate_stream();
    assert!(!report.valid);
    assert!(report
        .errors
        .iter()
        .any(|e| e.kind == IssueKind::HashMismatch && e.sequence == Some(2)));
    assert!(report
        .errors
        .iter()
        .any(|e| e.kind == IssueKind::ChainBreak && e.sequence == Some(3)));
}

#[tokio::test]
async fn checkpoints_prune_to_the_configured_cap() {
    let dir = tempfile::tempdir().expect("tempdir");
    let manager = CheckpointManager::new(dir.path());
    for i in 0..(MAX_CHECKPOINTS + 1) {
        let at = Utc::now() - Duration::minutes((MAX_CHECKPOINTS + 1 - i) as i64);
        manager
            .create_checkpoint(CheckpointData {
                timestamp: at.to_rfc3339_opts(SecondsFormat::Millis, true),
                message_count: i as u64,
                session_id: Some("s-1".to_string()),
                reason: None,
                metadata: None,
            })
            .expect("create checkpoint");
    }

    assert_eq!(manager.list_checkpoints().len(), MAX_CHECKPOINTS);
    let on_disk = std::fs::read_dir(dir.path().join("checkpoints"))
        .expect("read dir")
        .flatten()
        .filter(|e| e.file_name().to_string_lossy().ends_with(".json"))
        .count();
    assert_eq!(on_disk, MAX_CHECKPOINTS);

    // The manifest still points at the newest checkpoint and recovery holds.
    assert!(manager.can_recover());
    let last = manager.get_last_checkpoint().expect("last");
    assert_eq!(last.data.message_count, MAX_CHECKPOINTS as u64);
}

#[tokio::test]
async fn implicit_resumption_depends_on_the_threshold() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = Arc::new(ActionStore::new(config_for(dir.path())));
    store.initialize().await.expect("initialize");

    let ten_minutes_ago =
        (Utc::now() - Duration::minutes(10)).to_rfc3339_opts(SecondsFormat::Millis, true);
    assert!(
        store
            .append(tool_call("old work").with_timestamp(ten_minutes_ago))
            .await
    );

    let restorer = SessionRestorer::new(store.clone());
    let generous = restorer.detect_implicit_resumption(30);
    assert!(generous.should_restore);
    assert!(generous.gap_minutes > 9.0 && generous.gap_minutes < 11.0);

    let strict = restorer.detect_implicit_resumption(5);
    assert!(!strict.should_restore);
}

#[tokio::test]
async fn a_full_host_day_round_trips() {
    let dir = tempfile::tempdir().expect("tempdir");

    // Morning: boot, a session does real work, compaction, shutdown.
    {
        let hooks = ContinuityHooks::new(config_for(dir.path()));
        hooks.on_boot().await.expect("boot");
        hooks.on_agent_start("s-day", "openclaw", None).await;

        let gate = hooks
            .before_tool_call("s-day", "openclaw", "write_file", None)
            .await;
        assert!(gate.proceed);
        hooks
            .after_tool_call(
                "s-day",
                "openclaw",
                "write_file",
                gate.action_id.as_deref(),
                "wrote report.md",
            )
            .await;

        let checkpoint = hooks
            .before_compaction("s-day", "openclaw", 240)
            .await
            .expect("checkpoint");
        hooks.after_compaction("s-day", "openclaw", 24).await;
        assert!(hooks.checkpoints().can_recover());
        hooks.checkpoints().mark_recovered(&checkpoint.id).expect("mark");
        assert!(!hooks.checkpoints().can_recover());

        hooks.on_agent_end("s-day", "openclaw").await;
        hooks.on_shutdown().await;
    }

    // Evening: a new process restores the same session explicitly.
    {
        let hooks = ContinuityHooks::new(config_for(dir.path()));
        hooks.on_boot().await.expect("boot");
        let restored = hooks
            .on_agent_start("s-evening", "openclaw", Some("s-day"))
            .await
            .expect("restored context");
        assert!(restored.action_count >= 5);
        assert!(restored
            .active_workflows
            .contains(&"file-operations".to_string()));
        hooks.on_shutdown().await;
    }

    // The whole day's stream still verifies.
    let report = IntegrityValidator::new(dir.path()).validate_stream();
    assert!(report.valid, "errors: {:?}", report.errors);
    assert!(report.total_checked >= 7);
}
