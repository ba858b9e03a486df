//! 镜像写入队列
//!
//! 调用方只 `submit`，从不等待也看不到失败：有界 mpsc 队列 + 单个后台 worker。
//! 队列满时丢弃并告警；镜像不可达时跳过并记录 debug 日志；写入失败记录 warn 日志。
//! `flush` 是屏障：等待此前提交的写入全部处理完（用于关闭与测试）。

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};

use super::store::{SessionDelta, SessionMirror};
use crate::session::types::{ConversationTurn, SessionEvent, SessionId};

/// 一次镜像写入
#[derive(Debug)]
pub enum MirrorOp {
    Session(SessionDelta),
    Event(SessionEvent),
    Message {
        session_id: SessionId,
        turn: ConversationTurn,
    },
    Flush(oneshot::Sender<()>),
}

impl MirrorOp {
    fn label(&self) -> &'static str {
        match self {
            MirrorOp::Session(_) => "session",
            MirrorOp::Event(_) => "event",
            MirrorOp::Message { .. } => "message",
            MirrorOp::Flush(_) => "flush",
        }
    }
}

/// 后台镜像写入器（可克隆，共享同一队列）
#[derive(Clone)]
pub struct MirrorWriter {
    tx: mpsc::Sender<MirrorOp>,
}

impl MirrorWriter {
    /// 启动后台 worker；需要在 tokio runtime 中调用
    pub fn spawn(mirror: Arc<SessionMirror>, capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        tokio::spawn(run_worker(mirror, rx));
        Self { tx }
    }

    /// 提交写入，不等待结果
    pub fn submit(&self, op: MirrorOp) {
        let label = op.label();
        match self.tx.try_send(op) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!(op = label, "mirror queue full, dropping write");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                tracing::debug!(op = label, "mirror worker stopped, dropping write");
            }
        }
    }

    /// 等待此前提交的写入处理完毕
    pub async fn flush(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.tx.send(MirrorOp::Flush(done_tx)).await.is_err() {
            return;
        }
        let _ = done_rx.await;
    }
}

async fn run_worker(mirror: Arc<SessionMirror>, mut rx: mpsc::Receiver<MirrorOp>) {
    while let Some(op) = rx.recv().await {
        if let MirrorOp::Flush(done) = op {
            let _ = done.send(());
            continue;
        }
        let label = op.label();
        if !mirror.is_healthy().await {
            tracing::debug!(op = label, "mirror unreachable, skipping write");
            continue;
        }
        let result = match &op {
            MirrorOp::Session(delta) => mirror.upsert_session(delta).await,
            MirrorOp::Event(event) => mirror.insert_event(event).await,
            MirrorOp::Message { session_id, turn } => mirror.upsert_message(session_id, turn).await,
            MirrorOp::Flush(_) => Ok(()),
        };
        if let Err(e) = result {
            tracing::warn!(op = label, "mirror write failed: {}", e);
        }
    }
    tracing::debug!("mirror writer stopped");
}
