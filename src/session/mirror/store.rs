//! 会话镜像：在 MirrorBackend 之上的表结构与读写
//!
//! - 会话 upsert 对计数器做累加（`tool_count = tool_count + excluded.tool_count`），多来源写入不会互相覆盖
//! - 事件按 (session_id, seq, event_type) insert-or-replace
//! - 消息按 (session_id, turn) insert-or-replace
//! - 读事件按 seq、类型序号排序，而不是写入完成顺序
//! - 外部上报（ingest）的会话增量与消息在同一事务内写入

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

use super::backend::{MirrorBackend, MirrorError, Row, SqlStatement};
use crate::session::types::{ConversationTurn, SessionEvent, SessionId, TransportKind};

const SCHEMA: [&str; 4] = [
    "CREATE TABLE IF NOT EXISTS sessions (
        id TEXT PRIMARY KEY,
        started_at TEXT,
        transport TEXT,
        environment TEXT,
        tool_count INTEGER NOT NULL DEFAULT 0,
        checkpoint_count INTEGER NOT NULL DEFAULT 0,
        error_count INTEGER NOT NULL DEFAULT 0,
        last_checkpoint_summary TEXT,
        user_name TEXT,
        user_purpose TEXT,
        updated_at TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS session_events (
        session_id TEXT NOT NULL,
        seq INTEGER NOT NULL,
        event_type TEXT NOT NULL,
        type_rank INTEGER NOT NULL,
        ts TEXT NOT NULL,
        tool TEXT,
        payload TEXT NOT NULL,
        PRIMARY KEY (session_id, seq, event_type)
    )",
    "CREATE TABLE IF NOT EXISTS session_messages (
        session_id TEXT NOT NULL,
        turn INTEGER NOT NULL,
        role TEXT NOT NULL,
        content TEXT NOT NULL,
        ts TEXT NOT NULL,
        PRIMARY KEY (session_id, turn)
    )",
    "CREATE INDEX IF NOT EXISTS idx_sessions_updated ON sessions(updated_at)",
];

/// 会话增量：计数器为增量，其余字段为 None 时保留原值
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionDelta {
    pub id: SessionId,
    pub started_at: Option<DateTime<Utc>>,
    pub transport: Option<TransportKind>,
    pub environment: Option<String>,
    pub tool_count: u64,
    pub checkpoint_count: u64,
    pub error_count: u64,
    pub last_checkpoint_summary: Option<String>,
    pub user_name: Option<String>,
    pub user_purpose: Option<String>,
}

impl SessionDelta {
    pub fn new(id: impl Into<SessionId>) -> Self {
        Self {
            id: id.into(),
            ..Default::default()
        }
    }
}

/// 镜像中的会话摘要
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MirroredSession {
    pub id: String,
    pub started_at: Option<String>,
    pub transport: Option<String>,
    pub environment: Option<String>,
    pub tool_count: i64,
    pub checkpoint_count: i64,
    pub error_count: i64,
    pub last_checkpoint_summary: Option<String>,
    pub user_name: Option<String>,
    pub user_purpose: Option<String>,
    pub updated_at: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MirroredEvent {
    pub session_id: String,
    pub seq: i64,
    pub event_type: String,
    pub ts: String,
    pub tool: Option<String>,
    pub payload: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MirroredMessage {
    pub session_id: String,
    pub turn: i64,
    pub role: String,
    pub content: String,
    pub ts: String,
}

/// 会话镜像存储
pub struct SessionMirror {
    backend: Arc<dyn MirrorBackend>,
}

impl SessionMirror {
    pub fn new(backend: Arc<dyn MirrorBackend>) -> Self {
        Self { backend }
    }

    /// 建表（幂等）
    pub async fn init_schema(&self) -> Result<(), MirrorError> {
        for stmt in SCHEMA {
            self.backend.execute(stmt, vec![]).await?;
        }
        Ok(())
    }

    pub async fn is_healthy(&self) -> bool {
        self.backend.is_healthy().await
    }

    async fn ensure_healthy(&self) -> Result<(), MirrorError> {
        if self.backend.is_healthy().await {
            Ok(())
        } else {
            Err(MirrorError::Unavailable("mirror database is unreachable".to_string()))
        }
    }

    /// 累加式 upsert
    pub async fn upsert_session(&self, delta: &SessionDelta) -> Result<(), MirrorError> {
        let stmt = session_upsert(delta);
        self.backend.execute(&stmt.sql, stmt.params).await?;
        Ok(())
    }

    pub async fn insert_event(&self, event: &SessionEvent) -> Result<(), MirrorError> {
        let payload = serde_json::to_string(&event.payload)
            .map_err(|e| MirrorError::Row(e.to_string()))?;
        let kind = event.kind();
        self.backend
            .execute(
                "INSERT OR REPLACE INTO session_events
                    (session_id, seq, event_type, type_rank, ts, tool, payload)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                vec![
                    event.session_id.clone().into(),
                    event.seq.into(),
                    kind.as_str().into(),
                    kind.rank().into(),
                    event.ts.to_rfc3339().into(),
                    event.payload.tool().into(),
                    payload.into(),
                ],
            )
            .await?;
        Ok(())
    }

    pub async fn upsert_message(&self, session_id: &str, turn: &ConversationTurn) -> Result<(), MirrorError> {
        let stmt = message_upsert(session_id, turn);
        self.backend.execute(&stmt.sql, stmt.params).await?;
        Ok(())
    }

    /// 会话增量加上若干消息，一并提交：失败时都不生效，客户端可以安全重试
    pub async fn ingest(&self, delta: &SessionDelta, messages: &[ConversationTurn]) -> Result<(), MirrorError> {
        self.ensure_healthy().await?;
        let mut statements = Vec::with_capacity(messages.len() + 1);
        statements.push(session_upsert(delta));
        statements.extend(messages.iter().map(|turn| message_upsert(&delta.id, turn)));
        self.backend.execute_batch(statements).await?;
        Ok(())
    }

    /// 最近更新的会话
    pub async fn list_sessions(&self, limit: u32) -> Result<Vec<MirroredSession>, MirrorError> {
        self.ensure_healthy().await?;
        let rows = self
            .backend
            .query(
                "SELECT * FROM sessions ORDER BY updated_at DESC LIMIT ?1",
                vec![i64::from(limit).into()],
            )
            .await?;
        rows.iter().map(session_from_row).collect()
    }

    pub async fn get_session(&self, session_id: &str) -> Result<Option<MirroredSession>, MirrorError> {
        self.ensure_healthy().await?;
        let rows = self
            .backend
            .query("SELECT * FROM sessions WHERE id = ?1", vec![session_id.into()])
            .await?;
        rows.first().map(session_from_row).transpose()
    }

    pub async fn list_events(&self, session_id: &str) -> Result<Vec<MirroredEvent>, MirrorError> {
        self.ensure_healthy().await?;
        let rows = self
            .backend
            .query(
                "SELECT session_id, seq, event_type, ts, tool, payload FROM session_events
                 WHERE session_id = ?1 ORDER BY seq ASC, type_rank ASC",
                vec![session_id.into()],
            )
            .await?;
        rows.iter()
            .map(|row| {
                let raw = text(row, "payload")?;
                Ok(MirroredEvent {
                    session_id: text(row, "session_id")?,
                    seq: int(row, "seq")?,
                    event_type: text(row, "event_type")?,
                    ts: text(row, "ts")?,
                    tool: opt_text(row, "tool"),
                    payload: serde_json::from_str(&raw).unwrap_or(Value::String(raw)),
                })
            })
            .collect()
    }

    pub async fn list_messages(&self, session_id: &str) -> Result<Vec<MirroredMessage>, MirrorError> {
        self.ensure_healthy().await?;
        let rows = self
            .backend
            .query(
                "SELECT session_id, turn, role, content, ts FROM session_messages
                 WHERE session_id = ?1 ORDER BY turn ASC",
                vec![session_id.into()],
            )
            .await?;
        rows.iter()
            .map(|row| {
                Ok(MirroredMessage {
                    session_id: text(row, "session_id")?,
                    turn: int(row, "turn")?,
                    role: text(row, "role")?,
                    content: text(row, "content")?,
                    ts: text(row, "ts")?,
                })
            })
            .collect()
    }
}

fn session_from_row(row: &Row) -> Result<MirroredSession, MirrorError> {
    Ok(MirroredSession {
        id: text(row, "id")?,
        started_at: opt_text(row, "started_at"),
        transport: opt_text(row, "transport"),
        environment: opt_text(row, "environment"),
        tool_count: int(row, "tool_count")?,
        checkpoint_count: int(row, "checkpoint_count")?,
        error_count: int(row, "error_count")?,
        last_checkpoint_summary: opt_text(row, "last_checkpoint_summary"),
        user_name: opt_text(row, "user_name"),
        user_purpose: opt_text(row, "user_purpose"),
        updated_at: text(row, "updated_at")?,
    })
}

fn session_upsert(delta: &SessionDelta) -> SqlStatement {
    SqlStatement::new(
        "INSERT INTO sessions (
            id, started_at, transport, environment,
            tool_count, checkpoint_count, error_count,
            last_checkpoint_summary, user_name, user_purpose, updated_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
        ON CONFLICT(id) DO UPDATE SET
            started_at = COALESCE(started_at, excluded.started_at),
            transport = COALESCE(excluded.transport, transport),
            environment = COALESCE(excluded.environment, environment),
            tool_count = tool_count + excluded.tool_count,
            checkpoint_count = checkpoint_count + excluded.checkpoint_count,
            error_count = error_count + excluded.error_count,
            last_checkpoint_summary = COALESCE(excluded.last_checkpoint_summary, last_checkpoint_summary),
            user_name = COALESCE(excluded.user_name, user_name),
            user_purpose = COALESCE(excluded.user_purpose, user_purpose),
            updated_at = excluded.updated_at",
        vec![
            delta.id.clone().into(),
            delta.started_at.map(|t| t.to_rfc3339()).into(),
            delta.transport.map(|t| t.as_str()).into(),
            delta.environment.clone().into(),
            delta.tool_count.into(),
            delta.checkpoint_count.into(),
            delta.error_count.into(),
            delta.last_checkpoint_summary.clone().into(),
            delta.user_name.clone().into(),
            delta.user_purpose.clone().into(),
            Utc::now().to_rfc3339().into(),
        ],
    )
}

fn message_upsert(session_id: &str, turn: &ConversationTurn) -> SqlStatement {
    let ts = turn.ts.unwrap_or_else(Utc::now).to_rfc3339();
    SqlStatement::new(
        "INSERT OR REPLACE INTO session_messages (session_id, turn, role, content, ts)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        vec![
            session_id.into(),
            i64::from(turn.turn).into(),
            turn.role.clone().into(),
            turn.content.clone().into(),
            ts.into(),
        ],
    )
}

fn text(row: &Row, col: &str) -> Result<String, MirrorError> {
    opt_text(row, col).ok_or_else(|| MirrorError::Row(format!("missing text column {col}")))
}

fn opt_text(row: &Row, col: &str) -> Option<String> {
    row.get(col).and_then(Value::as_str).map(str::to_string)
}

fn int(row: &Row, col: &str) -> Result<i64, MirrorError> {
    row.get(col)
        .and_then(Value::as_i64)
        .ok_or_else(|| MirrorError::Row(format!("missing integer column {col}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::mirror::backend::SqliteMirror;
    use crate::session::types::EventPayload;

    async fn mirror() -> SessionMirror {
        let mirror = SessionMirror::new(Arc::new(SqliteMirror::open_in_memory().unwrap()));
        mirror.init_schema().await.unwrap();
        mirror
    }

    #[tokio::test]
    async fn test_counters_accumulate() {
        let m = mirror().await;
        let mut delta = SessionDelta::new("s1");
        delta.transport = Some(TransportKind::Harness);
        delta.tool_count = 3;
        m.upsert_session(&delta).await.unwrap();
        delta.transport = None;
        m.upsert_session(&delta).await.unwrap();

        let s = m.get_session("s1").await.unwrap().unwrap();
        assert_eq!(s.tool_count, 6);
        assert_eq!(s.transport.as_deref(), Some("harness"));
    }

    #[tokio::test]
    async fn test_summary_kept_when_delta_has_none() {
        let m = mirror().await;
        let mut delta = SessionDelta::new("s1");
        delta.last_checkpoint_summary = Some("first pass".to_string());
        m.upsert_session(&delta).await.unwrap();
        m.upsert_session(&SessionDelta::new("s1")).await.unwrap();

        let s = m.get_session("s1").await.unwrap().unwrap();
        assert_eq!(s.last_checkpoint_summary.as_deref(), Some("first pass"));
        assert!(m.get_session("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_events_ordered_by_seq_then_type() {
        let m = mirror().await;
        let cp = SessionEvent::new("s1", 2, EventPayload::Checkpoint { summary: "cp".into(), messages: vec![] });
        let result = SessionEvent::new(
            "s1",
            1,
            EventPayload::ToolResult {
                tool: "t".into(),
                call_seq: Some(1),
                duration_ms: 5,
                is_error: false,
                summary: "ok".into(),
                error: None,
            },
        );
        let call = SessionEvent::new("s1", 1, EventPayload::ToolCall { tool: "t".into(), args: Value::Null });
        // 写入顺序与 seq 顺序相反
        m.insert_event(&cp).await.unwrap();
        m.insert_event(&result).await.unwrap();
        m.insert_event(&call).await.unwrap();
        // 重复写入同一自然键不产生新行
        m.insert_event(&call).await.unwrap();

        let events = m.list_events("s1").await.unwrap();
        let kinds: Vec<&str> = events.iter().map(|e| e.event_type.as_str()).collect();
        assert_eq!(kinds, vec!["tool_call", "tool_result", "checkpoint"]);
        assert_eq!(events[1].payload["summary"], "ok");
    }

    #[tokio::test]
    async fn test_message_upsert_replaces_turn() {
        let m = mirror().await;
        m.upsert_message("s1", &ConversationTurn::new(1, "user", "draft")).await.unwrap();
        m.upsert_message("s1", &ConversationTurn::new(1, "user", "final")).await.unwrap();
        m.upsert_message("s1", &ConversationTurn::new(2, "assistant", "reply")).await.unwrap();

        let msgs = m.list_messages("s1").await.unwrap();
        assert_eq!(msgs.len(), 2);
        assert_eq!(msgs[0].content, "final");
    }

    #[tokio::test]
    async fn test_ingest_writes_session_and_messages_together() {
        let m = mirror().await;
        let mut delta = SessionDelta::new("h1");
        delta.tool_count = 2;
        let turns = [ConversationTurn::new(1, "user", "hi"), ConversationTurn::new(2, "assistant", "hello")];
        m.ingest(&delta, &turns).await.unwrap();

        assert_eq!(m.get_session("h1").await.unwrap().unwrap().tool_count, 2);
        assert_eq!(m.list_messages("h1").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_failed_ingest_leaves_counters_untouched() {
        let m = mirror().await;
        let mut delta = SessionDelta::new("h1");
        delta.tool_count = 3;
        m.ingest(&delta, &[]).await.unwrap();

        m.backend.execute("DROP TABLE session_messages", vec![]).await.unwrap();
        let err = m
            .ingest(&delta, &[ConversationTurn::new(1, "user", "hi")])
            .await
            .unwrap_err();
        assert!(matches!(err, MirrorError::Sqlite(_)));
        assert_eq!(m.get_session("h1").await.unwrap().unwrap().tool_count, 3);
    }
}
