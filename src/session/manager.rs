//! 会话生命周期管理
//!
//! 唯一负责写会话/事件/消息的组件：
//! - 主日志（Journal）同步写入，失败返回给调用方
//! - 镜像（MirrorWriter）提交后不等待，失败只记日志
//! - seq 在任何异步写入开始之前分配，并与主日志追加在同一把锁内完成，日志内严格有序
//! - 自上次 checkpoint 以来的工具调用数达到阈值时返回提醒（仅建议，不阻塞）；
//!   到期那次调用没有结果可携带时，提醒顺延到下一次调用
//! - 外部会话 ID 在进程重启后从主日志恢复计数与 seq

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;
use tokio::sync::Mutex;

use crate::config::AppConfig;
use crate::core::GatewayError;
use crate::session::journal::Journal;
use crate::session::mirror::{MirrorOp, MirrorWriter, SessionDelta, SessionMirror};
use crate::session::redact::{default_redact_keys, Redactor};
use crate::session::types::{
    ConversationTurn, EventPayload, SessionEvent, SessionId, SessionRecord, TransportKind,
};
use crate::tools::envelope::truncate;

/// 会话管理器配置
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub log_dir: PathBuf,
    pub environment: String,
    /// 0 表示关闭提醒
    pub nudge_threshold: u32,
    pub redact_keys: Vec<String>,
    pub summary_max_chars: usize,
    pub mirror_queue_capacity: usize,
}

impl SessionSettings {
    pub fn new(log_dir: impl Into<PathBuf>) -> Self {
        Self {
            log_dir: log_dir.into(),
            environment: "dev".to_string(),
            nudge_threshold: 8,
            redact_keys: default_redact_keys(),
            summary_max_chars: 500,
            mirror_queue_capacity: 1024,
        }
    }

    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            log_dir: config.session.log_dir.clone(),
            environment: config.app.environment.clone(),
            nudge_threshold: config.session.nudge_threshold,
            redact_keys: config.session.redact_keys.clone(),
            summary_max_chars: config.session.summary_max_chars,
            mirror_queue_capacity: config.mirror.queue_capacity,
        }
    }
}

/// record_tool_call 的返回：分配的 seq 与可选的 checkpoint 提醒
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolCallTicket {
    pub seq: u64,
    pub nudge: Option<String>,
}

/// 一次工具调用的结果（写入 tool_result 事件）
#[derive(Debug, Clone, Copy)]
pub struct ToolResultEntry<'a> {
    pub tool: &'a str,
    /// 对应 tool_call 的 seq
    pub call_seq: Option<u64>,
    pub duration_ms: u64,
    pub is_error: bool,
    pub summary: &'a str,
    pub error_message: Option<&'a str>,
}

struct SessionState {
    record: SessionRecord,
    next_seq: u64,
    calls_since_checkpoint: u32,
    /// 已到期但还没有送达调用方的提醒
    nudge_pending: bool,
}

impl SessionState {
    fn new(record: SessionRecord) -> Self {
        Self {
            record,
            next_seq: 1,
            calls_since_checkpoint: 0,
            nudge_pending: false,
        }
    }

    /// 按主日志事件重放计数；record 的身份字段（started_at、transport 等）保持不变
    fn replay(mut record: SessionRecord, events: &[SessionEvent]) -> Self {
        record.tool_count = 0;
        record.checkpoint_count = 0;
        record.error_count = 0;
        let mut calls_since_checkpoint = 0;
        let mut next_seq = 1;
        for event in events {
            match &event.payload {
                EventPayload::ToolCall { .. } => {
                    record.tool_count += 1;
                    calls_since_checkpoint += 1;
                }
                EventPayload::ToolResult { is_error, .. } => {
                    if *is_error {
                        record.error_count += 1;
                    }
                }
                EventPayload::Checkpoint { summary, .. } => {
                    record.checkpoint_count += 1;
                    record.last_checkpoint_summary = Some(summary.clone());
                    calls_since_checkpoint = 0;
                }
            }
            next_seq = next_seq.max(event.seq + 1);
            record.updated_at = record.updated_at.max(event.ts);
        }
        Self {
            record,
            next_seq,
            calls_since_checkpoint,
            nudge_pending: false,
        }
    }

    fn assign_seq(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }
}

#[derive(Default)]
struct Sessions {
    by_id: HashMap<SessionId, SessionState>,
    /// 持久连接（stdio）下本进程的会话
    process_session: Option<SessionId>,
}

/// 会话生命周期管理器
pub struct SessionManager {
    settings: SessionSettings,
    journal: Journal,
    mirror: Arc<SessionMirror>,
    writer: MirrorWriter,
    redactor: Redactor,
    sessions: Mutex<Sessions>,
}

impl SessionManager {
    /// 打开主日志目录并启动镜像写入 worker
    pub async fn open(settings: SessionSettings, mirror: Arc<SessionMirror>) -> Result<Self, GatewayError> {
        let journal = Journal::open(&settings.log_dir).await?;
        let writer = MirrorWriter::spawn(Arc::clone(&mirror), settings.mirror_queue_capacity);
        let redactor = Redactor::new(&settings.redact_keys);
        Ok(Self {
            settings,
            journal,
            mirror,
            writer,
            redactor,
            sessions: Mutex::new(Sessions::default()),
        })
    }

    pub fn settings(&self) -> &SessionSettings {
        &self.settings
    }

    pub fn journal(&self) -> &Journal {
        &self.journal
    }

    pub fn mirror(&self) -> &Arc<SessionMirror> {
        &self.mirror
    }

    /// 按配置的敏感键脱敏（日志与审计共用）
    pub fn redact(&self, value: &Value) -> Value {
        self.redactor.redact_value(value)
    }

    /// 本进程会话（持久连接）：不存在则创建，存在则原样返回，不重置计数
    pub async fn ensure_session(&self, transport: TransportKind) -> Result<SessionRecord, GatewayError> {
        let mut sessions = self.sessions.lock().await;
        if let Some(id) = sessions.process_session.clone() {
            if let Some(state) = sessions.by_id.get(&id) {
                return Ok(state.record.clone());
            }
        }
        let id = format!("session_{}", uuid::Uuid::new_v4());
        let record = self.create_session(&mut sessions, id.clone(), transport).await?;
        sessions.process_session = Some(id);
        Ok(record)
    }

    /// 外部提供会话 ID（无状态 transport）：每个 ID 一个会话，重复调用不重置计数。
    /// 进程重启后从主日志恢复：索引中的会话快照加上事件重放出的计数与 seq，不再写新的创建记录
    pub async fn ensure_session_for(
        &self,
        transport: TransportKind,
        session_id: &str,
    ) -> Result<SessionRecord, GatewayError> {
        let mut sessions = self.sessions.lock().await;
        if let Some(state) = sessions.by_id.get(session_id) {
            return Ok(state.record.clone());
        }
        let events = self.journal.read_events(session_id).await?;
        let snapshot = match self.journal.latest_session(session_id).await? {
            Some(snapshot) => snapshot,
            None if events.is_empty() => {
                return self
                    .create_session(&mut sessions, session_id.to_string(), transport)
                    .await;
            }
            // 索引缺失但事件还在：补写创建记录，计数仍以事件为准
            None => {
                let record = SessionRecord::new(session_id.to_string(), transport, self.settings.environment.clone());
                self.journal.append_session(&record).await?;
                record
            }
        };
        let state = SessionState::replay(snapshot, &events);
        tracing::info!(
            session_id,
            events = events.len(),
            next_seq = state.next_seq,
            "session resumed from journal"
        );
        let record = state.record.clone();
        sessions.by_id.insert(session_id.to_string(), state);
        Ok(record)
    }

    async fn create_session(
        &self,
        sessions: &mut Sessions,
        id: SessionId,
        transport: TransportKind,
    ) -> Result<SessionRecord, GatewayError> {
        let record = SessionRecord::new(id.clone(), transport, self.settings.environment.clone());
        self.journal.append_session(&record).await?;
        tracing::info!(session_id = %id, transport = %transport, "session started");

        let mut delta = SessionDelta::new(id.clone());
        delta.started_at = Some(record.started_at);
        delta.transport = Some(transport);
        delta.environment = Some(record.environment.clone());
        self.writer.submit(MirrorOp::Session(delta));

        sessions.by_id.insert(id, SessionState::new(record.clone()));
        Ok(record)
    }

    /// 记录 tool_call：主日志写入成功后才增加计数
    pub async fn record_tool_call(
        &self,
        session_id: &str,
        tool: &str,
        args: &Value,
    ) -> Result<ToolCallTicket, GatewayError> {
        let args = self.redactor.redact_value(args);
        let mut sessions = self.sessions.lock().await;
        let state = sessions
            .by_id
            .get_mut(session_id)
            .ok_or_else(|| GatewayError::UnknownSession(session_id.to_string()))?;

        let seq = state.assign_seq();
        let event = SessionEvent::new(
            session_id,
            seq,
            EventPayload::ToolCall {
                tool: tool.to_string(),
                args,
            },
        );
        self.journal.append(&event).await?;

        state.record.tool_count += 1;
        state.record.updated_at = event.ts;
        state.calls_since_checkpoint += 1;
        let due = self.nudge_due(state.calls_since_checkpoint);
        let pending = std::mem::take(&mut state.nudge_pending);
        let nudge = (due || pending).then(|| nudge_message(state.calls_since_checkpoint));

        self.writer.submit(MirrorOp::Event(event));
        let mut delta = SessionDelta::new(session_id);
        delta.tool_count = 1;
        self.writer.submit(MirrorOp::Session(delta));

        if nudge.is_some() {
            tracing::debug!(session_id, calls = state.calls_since_checkpoint, "checkpoint nudge due");
        }
        Ok(ToolCallTicket { seq, nudge })
    }

    /// 记录 tool_result；is_error 时增加 error_count
    pub async fn record_tool_result(
        &self,
        session_id: &str,
        result: ToolResultEntry<'_>,
    ) -> Result<u64, GatewayError> {
        let ToolResultEntry {
            tool,
            call_seq,
            duration_ms,
            is_error,
            summary,
            error_message,
        } = result;
        let summary = truncate(&self.redactor.redact_text(summary), self.settings.summary_max_chars);
        let error = error_message.map(|e| self.redactor.redact_text(e));
        let mut sessions = self.sessions.lock().await;
        let state = sessions
            .by_id
            .get_mut(session_id)
            .ok_or_else(|| GatewayError::UnknownSession(session_id.to_string()))?;

        let seq = state.assign_seq();
        let event = SessionEvent::new(
            session_id,
            seq,
            EventPayload::ToolResult {
                tool: tool.to_string(),
                call_seq,
                duration_ms,
                is_error,
                summary,
                error,
            },
        );
        self.journal.append(&event).await?;

        state.record.updated_at = event.ts;
        if is_error {
            state.record.error_count += 1;
        }

        self.writer.submit(MirrorOp::Event(event));
        if is_error {
            let mut delta = SessionDelta::new(session_id);
            delta.error_count = 1;
            self.writer.submit(MirrorOp::Session(delta));
        }
        Ok(seq)
    }

    /// 记录 checkpoint，返回严格递增的 seq；重置「距上次 checkpoint 的调用数」
    pub async fn checkpoint(
        &self,
        session_id: &str,
        summary: &str,
        messages: Option<Vec<ConversationTurn>>,
    ) -> Result<u64, GatewayError> {
        let summary = self.redactor.redact_text(summary);
        let messages: Vec<ConversationTurn> = messages
            .unwrap_or_default()
            .into_iter()
            .map(|mut m| {
                m.content = self.redactor.redact_text(&m.content);
                m.ts.get_or_insert_with(Utc::now);
                m
            })
            .collect();

        let mut sessions = self.sessions.lock().await;
        let state = sessions
            .by_id
            .get_mut(session_id)
            .ok_or_else(|| GatewayError::UnknownSession(session_id.to_string()))?;

        let seq = state.assign_seq();
        let event = SessionEvent::new(
            session_id,
            seq,
            EventPayload::Checkpoint {
                summary: summary.clone(),
                messages: messages.clone(),
            },
        );
        self.journal.append(&event).await?;

        state.record.checkpoint_count += 1;
        state.record.last_checkpoint_summary = Some(summary.clone());
        state.record.updated_at = event.ts;
        state.calls_since_checkpoint = 0;
        state.nudge_pending = false;
        tracing::info!(session_id, seq, messages = messages.len(), "checkpoint recorded");

        self.writer.submit(MirrorOp::Event(event));
        let mut delta = SessionDelta::new(session_id);
        delta.checkpoint_count = 1;
        delta.last_checkpoint_summary = Some(summary);
        self.writer.submit(MirrorOp::Session(delta));
        for turn in messages {
            self.writer.submit(MirrorOp::Message {
                session_id: session_id.to_string(),
                turn,
            });
        }
        Ok(seq)
    }

    /// 提醒已随 ticket 发出，但这次调用没有返回结果（失败/超时/取消）：
    /// 留到该会话下一次 tool_call 再发
    pub async fn defer_nudge(&self, session_id: &str) {
        let mut sessions = self.sessions.lock().await;
        if let Some(state) = sessions.by_id.get_mut(session_id) {
            state.nudge_pending = true;
        }
    }

    /// 设置使用者信息；None 表示保持原值。新快照写入会话索引，重启后可恢复
    pub async fn set_user_context(
        &self,
        session_id: &str,
        user_name: Option<String>,
        user_purpose: Option<String>,
    ) -> Result<SessionRecord, GatewayError> {
        let mut sessions = self.sessions.lock().await;
        let state = sessions
            .by_id
            .get_mut(session_id)
            .ok_or_else(|| GatewayError::UnknownSession(session_id.to_string()))?;
        let mut record = state.record.clone();
        if user_name.is_some() {
            record.user_name = user_name.clone();
        }
        if user_purpose.is_some() {
            record.user_purpose = user_purpose.clone();
        }
        record.updated_at = Utc::now();
        self.journal.append_session(&record).await?;
        state.record = record;

        let mut delta = SessionDelta::new(session_id);
        delta.user_name = user_name;
        delta.user_purpose = user_purpose;
        self.writer.submit(MirrorOp::Session(delta));
        Ok(state.record.clone())
    }

    pub async fn session(&self, session_id: &str) -> Option<SessionRecord> {
        let sessions = self.sessions.lock().await;
        sessions.by_id.get(session_id).map(|s| s.record.clone())
    }

    pub async fn current_session_id(&self) -> Option<SessionId> {
        self.sessions.lock().await.process_session.clone()
    }

    pub async fn calls_since_checkpoint(&self, session_id: &str) -> Option<u32> {
        let sessions = self.sessions.lock().await;
        sessions.by_id.get(session_id).map(|s| s.calls_since_checkpoint)
    }

    /// 等待已提交的镜像写入处理完
    pub async fn flush_mirror(&self) {
        self.writer.flush().await;
    }

    /// 在阈值及其整数倍处提醒
    fn nudge_due(&self, calls: u32) -> bool {
        let threshold = self.settings.nudge_threshold;
        threshold != 0 && calls != 0 && calls % threshold == 0
    }
}

fn nudge_message(calls: u32) -> String {
    format!(
        "You have made {calls} tool calls since the last checkpoint. \
         Consider calling session_checkpoint with a short summary of progress so far."
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::mirror::SqliteMirror;
    use tempfile::TempDir;

    async fn manager(dir: &TempDir, threshold: u32) -> SessionManager {
        let mirror = Arc::new(SessionMirror::new(Arc::new(SqliteMirror::open_in_memory().unwrap())));
        mirror.init_schema().await.unwrap();
        let mut settings = SessionSettings::new(dir.path().join("sessions"));
        settings.nudge_threshold = threshold;
        SessionManager::open(settings, mirror).await.unwrap()
    }

    #[tokio::test]
    async fn test_unknown_session_rejected() {
        let dir = TempDir::new().unwrap();
        let m = manager(&dir, 8).await;
        let err = m
            .record_tool_call("nope", "tenant_list", &serde_json::json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::UnknownSession(_)));
    }

    #[tokio::test]
    async fn test_nudge_threshold_zero_disables() {
        let dir = TempDir::new().unwrap();
        let m = manager(&dir, 0).await;
        let s = m.ensure_session(TransportKind::Stdio).await.unwrap();
        for _ in 0..20 {
            let ticket = m.record_tool_call(&s.id, "t", &Value::Null).await.unwrap();
            assert!(ticket.nudge.is_none());
        }
    }

    #[tokio::test]
    async fn test_nudge_repeats_at_multiples() {
        let dir = TempDir::new().unwrap();
        let m = manager(&dir, 3).await;
        let s = m.ensure_session(TransportKind::Stdio).await.unwrap();
        let mut nudged = Vec::new();
        for i in 1..=7 {
            let ticket = m.record_tool_call(&s.id, "t", &Value::Null).await.unwrap();
            if ticket.nudge.is_some() {
                nudged.push(i);
            }
        }
        assert_eq!(nudged, vec![3, 6]);
    }

    #[tokio::test]
    async fn test_external_session_resumes_seq_from_journal() {
        let dir = TempDir::new().unwrap();
        {
            let m = manager(&dir, 8).await;
            m.ensure_session_for(TransportKind::Http, "ext-1").await.unwrap();
            m.record_tool_call("ext-1", "t", &Value::Null).await.unwrap();
            m.checkpoint("ext-1", "done", None).await.unwrap();
        }
        let m = manager(&dir, 8).await;
        m.ensure_session_for(TransportKind::Http, "ext-1").await.unwrap();
        let ticket = m.record_tool_call("ext-1", "t", &Value::Null).await.unwrap();
        assert_eq!(ticket.seq, 3);
    }

    #[tokio::test]
    async fn test_external_session_resumes_counters_from_journal() {
        let dir = TempDir::new().unwrap();
        let started_at = {
            let m = manager(&dir, 3).await;
            let record = m.ensure_session_for(TransportKind::Http, "ext-2").await.unwrap();
            m.set_user_context("ext-2", Some("asha".into()), None).await.unwrap();
            let call = m.record_tool_call("ext-2", "t", &Value::Null).await.unwrap();
            m.record_tool_result(
                "ext-2",
                ToolResultEntry {
                    tool: "t",
                    call_seq: Some(call.seq),
                    duration_ms: 1,
                    is_error: true,
                    summary: "boom",
                    error_message: Some("boom"),
                },
            )
            .await
            .unwrap();
            m.checkpoint("ext-2", "first pass", None).await.unwrap();
            m.record_tool_call("ext-2", "t", &Value::Null).await.unwrap();
            m.record_tool_call("ext-2", "t", &Value::Null).await.unwrap();
            record.started_at
        };

        let m = manager(&dir, 3).await;
        let record = m.ensure_session_for(TransportKind::Http, "ext-2").await.unwrap();
        assert_eq!(record.started_at, started_at);
        assert_eq!(record.tool_count, 3);
        assert_eq!(record.error_count, 1);
        assert_eq!(record.checkpoint_count, 1);
        assert_eq!(record.last_checkpoint_summary.as_deref(), Some("first pass"));
        assert_eq!(record.user_name.as_deref(), Some("asha"));
        assert_eq!(m.calls_since_checkpoint("ext-2").await, Some(2));

        // 重放后阈值计数接着算：第 3 次（自 checkpoint 起）提醒
        let ticket = m.record_tool_call("ext-2", "t", &Value::Null).await.unwrap();
        assert_eq!(ticket.seq, 6);
        assert!(ticket.nudge.is_some());

        let index = std::fs::read_to_string(dir.path().join("sessions").join("sessions.jsonl")).unwrap();
        let creations = index
            .lines()
            .filter(|l| l.contains("\"ext-2\"") && !l.contains("asha"))
            .count();
        assert_eq!(creations, 1);
    }

    #[tokio::test]
    async fn test_deferred_nudge_arrives_on_next_call() {
        let dir = TempDir::new().unwrap();
        let m = manager(&dir, 2).await;
        let s = m.ensure_session(TransportKind::Stdio).await.unwrap();
        m.record_tool_call(&s.id, "t", &Value::Null).await.unwrap();
        let due = m.record_tool_call(&s.id, "t", &Value::Null).await.unwrap();
        assert!(due.nudge.is_some());
        m.defer_nudge(&s.id).await;

        let next = m.record_tool_call(&s.id, "t", &Value::Null).await.unwrap();
        assert!(next.nudge.is_some());
        let after = m.record_tool_call(&s.id, "t", &Value::Null).await.unwrap();
        assert!(after.nudge.is_some(), "4 is a multiple of 2");
        let quiet = m.record_tool_call(&s.id, "t", &Value::Null).await.unwrap();
        assert!(quiet.nudge.is_none());
    }

    #[tokio::test]
    async fn test_checkpoint_clears_deferred_nudge() {
        let dir = TempDir::new().unwrap();
        let m = manager(&dir, 2).await;
        let s = m.ensure_session(TransportKind::Stdio).await.unwrap();
        m.record_tool_call(&s.id, "t", &Value::Null).await.unwrap();
        m.record_tool_call(&s.id, "t", &Value::Null).await.unwrap();
        m.defer_nudge(&s.id).await;
        m.checkpoint(&s.id, "saved", None).await.unwrap();

        let ticket = m.record_tool_call(&s.id, "t", &Value::Null).await.unwrap();
        assert!(ticket.nudge.is_none());
    }

    #[tokio::test]
    async fn test_user_context_keeps_unset_fields() {
        let dir = TempDir::new().unwrap();
        let m = manager(&dir, 8).await;
        let s = m.ensure_session(TransportKind::Stdio).await.unwrap();
        m.set_user_context(&s.id, Some("asha".into()), Some("set up tenant".into()))
            .await
            .unwrap();
        let record = m.set_user_context(&s.id, None, Some("debug PGR".into())).await.unwrap();
        assert_eq!(record.user_name.as_deref(), Some("asha"));
        assert_eq!(record.user_purpose.as_deref(), Some("debug PGR"));

        m.flush_mirror().await;
        let mirrored = m.mirror().get_session(&s.id).await.unwrap().unwrap();
        assert_eq!(mirrored.user_name.as_deref(), Some("asha"));
        assert_eq!(mirrored.user_purpose.as_deref(), Some("debug PGR"));
    }
}
