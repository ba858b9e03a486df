//! 主日志：按会话的 JSONL 追加文件
//!
//! 每个事件一行，写入后 fsync；写入失败以 `GatewayError::PrimaryLog` 返回给调用方。
//! 进程崩溃可能留下半行，读取时跳过无法解析的行。
//!
//! 目录布局：
//! - `sessions.jsonl`：会话索引，每个会话的创建记录及之后的使用者信息快照
//! - `events/<编码后的 ID>.jsonl`：会话事件；ID 中 `[a-z0-9_-]` 以外的字节一律编码为 `%xx`，
//!   不同 ID 不会落到同一文件

use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crate::core::GatewayError;
use crate::session::types::{SessionEvent, SessionRecord};

const SESSION_INDEX: &str = "sessions.jsonl";
const EVENTS_DIR: &str = "events";

/// 仅追加的事件日志，写入串行化
#[derive(Debug)]
pub struct Journal {
    dir: PathBuf,
    write_lock: Mutex<()>,
}

impl Journal {
    /// 打开日志目录；目录不存在时创建
    pub async fn open(dir: impl AsRef<Path>) -> Result<Self, GatewayError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(dir.join(EVENTS_DIR)).await?;
        Ok(Self {
            dir,
            write_lock: Mutex::new(()),
        })
    }

    /// 会话事件文件路径
    pub fn event_path(&self, session_id: &str) -> PathBuf {
        self.dir
            .join(EVENTS_DIR)
            .join(format!("{}.jsonl", encode_file_stem(session_id)))
    }

    /// 追加一个事件并落盘
    pub async fn append(&self, event: &SessionEvent) -> Result<(), GatewayError> {
        let line = serde_json::to_string(event)?;
        let path = self.event_path(&event.session_id);
        self.append_line(&path, &line).await
    }

    /// 在会话索引中追加会话快照（创建或使用者信息变化时）
    pub async fn append_session(&self, record: &SessionRecord) -> Result<(), GatewayError> {
        let line = serde_json::to_string(record)?;
        let path = self.dir.join(SESSION_INDEX);
        self.append_line(&path, &line).await
    }

    async fn append_line(&self, path: &Path, line: &str) -> Result<(), GatewayError> {
        let _guard = self.write_lock.lock().await;
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await?;
        let mut buf = String::with_capacity(line.len() + 1);
        buf.push_str(line);
        buf.push('\n');
        file.write_all(buf.as_bytes()).await?;
        file.flush().await?;
        file.sync_data().await?;
        Ok(())
    }

    /// 读取会话全部事件（按写入顺序）；文件不存在时返回空。
    /// 只返回 session_id 与请求一致的行
    pub async fn read_events(&self, session_id: &str) -> Result<Vec<SessionEvent>, GatewayError> {
        let events: Vec<SessionEvent> = read_lines(&self.event_path(session_id)).await?;
        Ok(events.into_iter().filter(|e| e.session_id == session_id).collect())
    }

    /// 会话索引中该会话最新的快照；从未创建过时返回 None
    pub async fn latest_session(&self, session_id: &str) -> Result<Option<SessionRecord>, GatewayError> {
        let records: Vec<SessionRecord> = read_lines(&self.dir.join(SESSION_INDEX)).await?;
        Ok(records.into_iter().rev().find(|r| r.id == session_id))
    }

    /// 日志中该会话已分配的最大 seq（用于进程重启后继续编号）
    pub async fn last_seq(&self, session_id: &str) -> Result<Option<u64>, GatewayError> {
        let events = self.read_events(session_id).await?;
        Ok(events.iter().map(|e| e.seq).max())
    }
}

/// 逐行解析 JSONL；跳过空行与无法解析的行（崩溃留下的半行）
async fn read_lines<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>, GatewayError> {
    let data = match fs::read_to_string(path).await {
        Ok(d) => d,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    let mut items = Vec::new();
    for (idx, line) in data.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<T>(line) {
            Ok(item) => items.push(item),
            Err(e) => {
                tracing::warn!(path = %path.display(), line = idx + 1, "skipping unreadable journal line: {}", e);
            }
        }
    }
    Ok(items)
}

/// 单射编码：`[a-z0-9_-]` 原样保留，其余字节（含大写、`.`、`/`、`%`）写成 `%xx`
fn encode_file_stem(session_id: &str) -> String {
    let mut out = String::with_capacity(session_id.len());
    for b in session_id.bytes() {
        if b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-' || b == b'_' {
            out.push(char::from(b));
        } else {
            out.push_str(&format!("%{b:02x}"));
        }
    }
    out
}
