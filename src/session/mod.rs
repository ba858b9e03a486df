//! 会话层：生命周期管理、主日志（JSONL）、镜像库（SQLite）、脱敏
//!
//! 两层持久化保证不同：
//! - **主日志**：始终可用、仅追加、同步写入；失败返回给调用方
//! - **镜像**：可选的结构化副本，fire-and-forget；不可达时跳过，永远不影响主路径

pub mod journal;
pub mod manager;
pub mod mirror;
pub mod redact;
pub mod types;

pub use journal::Journal;
pub use manager::{SessionManager, SessionSettings, ToolCallTicket, ToolResultEntry};
pub use mirror::{
    DisabledMirror, MirrorBackend, MirrorError, MirroredEvent, MirroredMessage, MirroredSession, Row,
    SessionDelta, SessionMirror, SqlStatement, SqlValue, SqliteMirror,
};
pub use redact::{Redactor, MASK};
pub use types::{
    ConversationTurn, EventKind, EventPayload, SessionEvent, SessionId, SessionRecord,
    TransportKind,
};
