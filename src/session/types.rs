//! 会话、事件与消息的数据模型
//!
//! 事件只追加不修改；同一会话内 seq 单调不减，seq 相同时按 tool_call < tool_result < checkpoint 排序。
//! 消息按 (session_id, turn) upsert，后写覆盖先写（支持重试/流式转录）。

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// 会话 ID（不透明字符串）
pub type SessionId = String;

/// 接入方式：stdio 为持久连接（每进程一个会话），http 为无状态（每个外部会话 ID 一个会话）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    Stdio,
    Http,
    /// 离线测试工具通过 ingest 接口写入
    Harness,
}

impl TransportKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportKind::Stdio => "stdio",
            TransportKind::Http => "http",
            TransportKind::Harness => "harness",
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 会话记录，仅由 SessionManager 修改
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub id: SessionId,
    pub started_at: DateTime<Utc>,
    pub transport: TransportKind,
    pub environment: String,
    pub tool_count: u64,
    pub checkpoint_count: u64,
    pub error_count: u64,
    pub last_checkpoint_summary: Option<String>,
    pub user_name: Option<String>,
    pub user_purpose: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl SessionRecord {
    pub fn new(id: SessionId, transport: TransportKind, environment: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id,
            started_at: now,
            transport,
            environment: environment.into(),
            tool_count: 0,
            checkpoint_count: 0,
            error_count: 0,
            last_checkpoint_summary: None,
            user_name: None,
            user_purpose: None,
            updated_at: now,
        }
    }
}

/// 事件类型；声明顺序即同 seq 时的排序
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    ToolCall,
    ToolResult,
    Checkpoint,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::ToolCall => "tool_call",
            EventKind::ToolResult => "tool_result",
            EventKind::Checkpoint => "checkpoint",
        }
    }

    /// 同 seq 排序用的序号
    pub fn rank(&self) -> i64 {
        match self {
            EventKind::ToolCall => 0,
            EventKind::ToolResult => 1,
            EventKind::Checkpoint => 2,
        }
    }
}

/// 事件负载，按 type 区分
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventPayload {
    ToolCall {
        tool: String,
        args: Value,
    },
    ToolResult {
        tool: String,
        /// 对应 tool_call 的 seq
        call_seq: Option<u64>,
        duration_ms: u64,
        is_error: bool,
        summary: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    Checkpoint {
        summary: String,
        #[serde(default)]
        messages: Vec<ConversationTurn>,
    },
}

impl EventPayload {
    pub fn kind(&self) -> EventKind {
        match self {
            EventPayload::ToolCall { .. } => EventKind::ToolCall,
            EventPayload::ToolResult { .. } => EventKind::ToolResult,
            EventPayload::Checkpoint { .. } => EventKind::Checkpoint,
        }
    }

    pub fn tool(&self) -> Option<&str> {
        match self {
            EventPayload::ToolCall { tool, .. } | EventPayload::ToolResult { tool, .. } => Some(tool),
            EventPayload::Checkpoint { .. } => None,
        }
    }
}

/// 主日志中的一行
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionEvent {
    pub session_id: SessionId,
    pub seq: u64,
    pub ts: DateTime<Utc>,
    #[serde(flatten)]
    pub payload: EventPayload,
}

impl SessionEvent {
    pub fn new(session_id: impl Into<SessionId>, seq: u64, payload: EventPayload) -> Self {
        Self {
            session_id: session_id.into(),
            seq,
            ts: Utc::now(),
            payload,
        }
    }

    pub fn kind(&self) -> EventKind {
        self.payload.kind()
    }

    /// 规范排序键：(seq, 类型序号)
    pub fn sort_key(&self) -> (u64, EventKind) {
        (self.seq, self.kind())
    }
}

/// 一轮对话（可选记录）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub turn: u32,
    pub role: String,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ts: Option<DateTime<Utc>>,
}

impl ConversationTurn {
    pub fn new(turn: u32, role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            turn,
            role: role.into(),
            content: content.into(),
            ts: None,
        }
    }
}
