//! 执行器集成测试：调用记录、分组门控、超时与取消

use std::sync::Arc;
use std::time::Duration;

use digit_mcp::config::AppConfig;
use digit_mcp::session::{EventPayload, TransportKind};
use digit_mcp::tools::{error_envelope, ok_envelope, FnTool, ToolExecutor, ToolGroup};
use digit_mcp::{Gateway, GatewayBuilder, GatewayError};
use serde_json::{json, Value};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

async fn gateway(dir: &TempDir) -> Gateway {
    let mut config = AppConfig::default();
    config.session.log_dir = dir.path().join("sessions");
    config.mirror.db_path = dir.path().join("mirror.db");
    GatewayBuilder::new(config)
        .with_tool(FnTool::new("tenant_list", "list tenants", ToolGroup::Mdms, |_| async {
            Ok(ok_envelope(json!(["pb", "pb.amritsar"])))
        }))
        .with_tool(FnTool::new("pgr_fail", "always fails", ToolGroup::Pgr, |_| async {
            Ok(error_envelope("service down"))
        }))
        .with_tool(FnTool::new("pgr_crash", "raises", ToolGroup::Pgr, |_| async {
            Err("connection refused".to_string())
        }))
        .with_tool(FnTool::new("slow", "sleeps", ToolGroup::Monitoring, |_| async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(ok_envelope(Value::Null))
        }))
        .build()
        .await
        .unwrap()
}

#[tokio::test]
async fn test_unknown_tool_records_nothing() {
    let dir = TempDir::new().unwrap();
    let gw = gateway(&dir).await;
    let s = gw.sessions.ensure_session(TransportKind::Stdio).await.unwrap();
    let err = gw.executor.execute(&s.id, "no_such_tool", json!({})).await.unwrap_err();
    assert!(matches!(err, GatewayError::UnknownTool(_)));
    assert!(gw.sessions.journal().read_events(&s.id).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_hidden_group_returns_error_envelope() {
    let dir = TempDir::new().unwrap();
    let gw = gateway(&dir).await;
    let s = gw.sessions.ensure_session(TransportKind::Stdio).await.unwrap();

    let outcome = gw.executor.execute(&s.id, "tenant_list", json!({})).await.unwrap();
    assert!(outcome.is_error);
    let v: Value = serde_json::from_str(&outcome.content).unwrap();
    assert_eq!(v["success"], false);
    assert!(v["error"].as_str().unwrap().contains("enable_tools"));

    let events = gw.sessions.journal().read_events(&s.id).await.unwrap();
    assert_eq!(events.len(), 2);
    assert_eq!(gw.sessions.session(&s.id).await.unwrap().error_count, 1);
}

#[tokio::test]
async fn test_enable_then_call_records_result() {
    let dir = TempDir::new().unwrap();
    let gw = gateway(&dir).await;
    let s = gw.sessions.ensure_session(TransportKind::Stdio).await.unwrap();

    let enabled = gw
        .executor
        .execute(&s.id, "enable_tools", json!({"enable": ["mdms"]}))
        .await
        .unwrap();
    assert!(!enabled.is_error);

    let outcome = gw.executor.execute(&s.id, "tenant_list", json!({})).await.unwrap();
    assert!(!outcome.is_error);

    let events = gw.sessions.journal().read_events(&s.id).await.unwrap();
    match &events.last().unwrap().payload {
        EventPayload::ToolResult { tool, call_seq, is_error, summary, .. } => {
            assert_eq!(tool, "tenant_list");
            assert_eq!(*call_seq, Some(outcome.seq));
            assert!(!is_error);
            assert!(summary.contains("pb.amritsar"));
        }
        other => panic!("unexpected payload {other:?}"),
    }
}

#[tokio::test]
async fn test_failure_envelope_counts_as_error() {
    let dir = TempDir::new().unwrap();
    let gw = gateway(&dir).await;
    let s = gw.sessions.ensure_session(TransportKind::Stdio).await.unwrap();
    gw.registry.enable_groups(["pgr"]);

    let outcome = gw.executor.execute(&s.id, "pgr_fail", json!({})).await.unwrap();
    assert!(outcome.is_error);
    let events = gw.sessions.journal().read_events(&s.id).await.unwrap();
    match &events[1].payload {
        EventPayload::ToolResult { error, .. } => assert_eq!(error.as_deref(), Some("service down")),
        other => panic!("unexpected payload {other:?}"),
    }
}

#[tokio::test]
async fn test_timeout_records_terminal_result() {
    let dir = TempDir::new().unwrap();
    let gw = gateway(&dir).await;
    gw.registry.enable_groups(["monitoring"]);
    let executor = ToolExecutor::new(Arc::clone(&gw.registry), Arc::clone(&gw.sessions), 30)
        .with_timeout(Duration::from_millis(50));
    let s = gw.sessions.ensure_session(TransportKind::Stdio).await.unwrap();

    let err = executor.execute(&s.id, "slow", json!({})).await.unwrap_err();
    assert!(matches!(err, GatewayError::ToolTimeout(_)));
    let events = gw.sessions.journal().read_events(&s.id).await.unwrap();
    assert_eq!(events.len(), 2);
    match &events[1].payload {
        EventPayload::ToolResult { is_error, .. } => assert!(*is_error),
        other => panic!("unexpected payload {other:?}"),
    }
}

#[tokio::test]
async fn test_cancel_records_terminal_result() {
    let dir = TempDir::new().unwrap();
    let gw = gateway(&dir).await;
    gw.registry.enable_groups(["monitoring"]);
    let s = gw.sessions.ensure_session(TransportKind::Stdio).await.unwrap();

    let token = CancellationToken::new();
    let cancel = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();
    });
    let err = gw
        .executor
        .execute_with_cancel(&s.id, "slow", json!({}), &token)
        .await
        .unwrap_err();
    assert!(matches!(err, GatewayError::Cancelled(_)));
    assert_eq!(gw.sessions.journal().read_events(&s.id).await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_nudge_hint_rendered_on_eighth_call() {
    let dir = TempDir::new().unwrap();
    let gw = gateway(&dir).await;
    let s = gw.sessions.ensure_session(TransportKind::Stdio).await.unwrap();

    let mut last = None;
    for _ in 0..8 {
        last = Some(gw.executor.execute(&s.id, "discover_tools", json!({})).await.unwrap());
    }
    let outcome = last.unwrap();
    assert!(outcome.hint.is_some());
    let rendered: Value = serde_json::from_str(&outcome.render()).unwrap();
    assert!(rendered["_hint"].as_str().unwrap().contains("session_checkpoint"));

    let cp = gw
        .executor
        .execute(&s.id, "session_checkpoint", json!({"summary": "surveyed groups"}))
        .await
        .unwrap();
    assert!(!cp.is_error);
    assert_eq!(gw.sessions.calls_since_checkpoint(&s.id).await, Some(0));
}

#[tokio::test]
async fn test_nudge_survives_failed_call_at_threshold() {
    let dir = TempDir::new().unwrap();
    let gw = gateway(&dir).await;
    gw.registry.enable_groups(["pgr"]);
    let s = gw.sessions.ensure_session(TransportKind::Stdio).await.unwrap();

    for _ in 0..7 {
        let outcome = gw.executor.execute(&s.id, "discover_tools", json!({})).await.unwrap();
        assert!(outcome.hint.is_none());
    }
    let err = gw.executor.execute(&s.id, "pgr_crash", json!({})).await.unwrap_err();
    assert!(matches!(err, GatewayError::ToolExecutionFailed(_)));

    let next = gw.executor.execute(&s.id, "discover_tools", json!({})).await.unwrap();
    assert!(next.hint.is_some());
    assert!(next.render().contains("session_checkpoint"));
    let after = gw.executor.execute(&s.id, "discover_tools", json!({})).await.unwrap();
    assert!(after.hint.is_none());
}

#[tokio::test]
async fn test_abandoned_call_still_gets_result() {
    let dir = TempDir::new().unwrap();
    let gw = gateway(&dir).await;
    gw.registry.enable_groups(["monitoring"]);
    let s = gw.sessions.ensure_session(TransportKind::Stdio).await.unwrap();

    let executor = Arc::clone(&gw.executor);
    let id = s.id.clone();
    let task = tokio::spawn(async move { executor.execute(&id, "slow", json!({})).await });
    tokio::time::sleep(Duration::from_millis(50)).await;
    task.abort();
    assert!(task.await.unwrap_err().is_cancelled());

    let mut events = Vec::new();
    for _ in 0..100 {
        events = gw.sessions.journal().read_events(&s.id).await.unwrap();
        if events.len() == 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(events.len(), 2);
    match &events[1].payload {
        EventPayload::ToolResult { tool, call_seq, is_error, error, .. } => {
            assert_eq!(tool, "slow");
            assert_eq!(*call_seq, Some(events[0].seq));
            assert!(*is_error);
            assert!(error.as_deref().unwrap().contains("abandoned"));
        }
        other => panic!("unexpected payload {other:?}"),
    }
    assert_eq!(gw.sessions.session(&s.id).await.unwrap().error_count, 1);
}
