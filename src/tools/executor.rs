//! 工具执行器
//!
//! 持有 ToolRegistry、SessionManager 与全局超时。execute(session_id, tool_name, args)：
//! 1. 未注册的工具名返回 UnknownTool，不记录任何事件
//! 2. 记录 tool_call（主日志失败直接返回，工具不会被调用）
//! 3. 分组未启用时返回失败信封（工具存在，但由这里决定能否执行）
//! 4. 在超时与取消令牌下调用工具
//! 5. 无论成功、失败、超时还是取消，都记录终结的 tool_result；future 中途被丢弃时由守卫补记
//!
//! 每次调用输出结构化审计日志（JSON）。

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use crate::core::GatewayError;
use crate::session::{SessionManager, ToolCallTicket, ToolResultEntry};
use crate::tools::envelope::{error_envelope, truncate, ToolOutcome};
use crate::tools::ToolRegistry;

/// 一次调用的返回：信封原文、是否失败、可选的 checkpoint 提醒
#[derive(Debug, Clone, PartialEq)]
pub struct CallOutcome {
    pub content: String,
    pub is_error: bool,
    pub hint: Option<String>,
    /// tool_call 事件的 seq
    pub seq: u64,
}

impl CallOutcome {
    /// 带提醒的最终文本：信封是 JSON 对象时加 `_hint` 字段，否则追加到末尾
    pub fn render(&self) -> String {
        let Some(hint) = &self.hint else {
            return self.content.clone();
        };
        match serde_json::from_str::<Value>(&self.content) {
            Ok(Value::Object(mut obj)) => {
                obj.insert("_hint".to_string(), Value::String(hint.clone()));
                Value::Object(obj).to_string()
            }
            _ => format!("{}\n\n[hint] {}", self.content, hint),
        }
    }
}

enum RunResult {
    Envelope(String),
    NotEnabled(String),
    Failed(String),
    TimedOut,
    Cancelled,
}

/// 工具执行器：对每次调用施加超时并记录会话事件
pub struct ToolExecutor {
    registry: Arc<ToolRegistry>,
    sessions: Arc<SessionManager>,
    timeout: Duration,
}

impl ToolExecutor {
    pub fn new(registry: Arc<ToolRegistry>, sessions: Arc<SessionManager>, timeout_secs: u64) -> Self {
        Self {
            registry,
            sessions,
            timeout: Duration::from_secs(timeout_secs),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    pub async fn execute(&self, session_id: &str, tool_name: &str, args: Value) -> Result<CallOutcome, GatewayError> {
        self.execute_with_cancel(session_id, tool_name, args, &CancellationToken::new())
            .await
    }

    /// 执行工具；cancel 由 transport 持有（如客户端发送取消通知）
    pub async fn execute_with_cancel(
        &self,
        session_id: &str,
        tool_name: &str,
        args: Value,
        cancel: &CancellationToken,
    ) -> Result<CallOutcome, GatewayError> {
        let tool = self
            .registry
            .get(tool_name)
            .ok_or_else(|| GatewayError::UnknownTool(tool_name.to_string()))?;

        let args_preview = args_preview(&args, &self.sessions);
        let ticket = self.sessions.record_tool_call(session_id, tool_name, &args).await?;
        let start = Instant::now();
        let mut guard = PendingResult::new(&self.sessions, session_id, tool_name, &ticket, start);

        let run = if !self.registry.is_tool_enabled(tool_name) {
            RunResult::NotEnabled(format!(
                "Tool '{}' belongs to group '{}', which is not enabled. Call enable_tools with {{\"enable\": [\"{}\"]}} first.",
                tool_name,
                tool.group(),
                tool.group()
            ))
        } else {
            tokio::select! {
                r = timeout(self.timeout, tool.execute(args)) => match r {
                    Ok(Ok(envelope)) => RunResult::Envelope(envelope),
                    Ok(Err(e)) => RunResult::Failed(e),
                    Err(_) => RunResult::TimedOut,
                },
                _ = cancel.cancelled() => RunResult::Cancelled,
            }
        };

        let max_chars = self.sessions.settings().summary_max_chars;
        let (content, outcome) = match &run {
            RunResult::Envelope(envelope) => (envelope.clone(), ToolOutcome::inspect(envelope, max_chars)),
            RunResult::NotEnabled(msg) => (error_envelope(msg.clone()), ToolOutcome::Error { message: msg.clone() }),
            RunResult::Failed(e) => (error_envelope(e.clone()), ToolOutcome::Error { message: e.clone() }),
            RunResult::TimedOut => {
                let msg = format!("timed out after {} ms", self.timeout.as_millis());
                (error_envelope(msg.clone()), ToolOutcome::Error { message: msg })
            }
            RunResult::Cancelled => {
                let msg = "cancelled by client".to_string();
                (error_envelope(msg.clone()), ToolOutcome::Error { message: msg })
            }
        };
        let duration_ms = start.elapsed().as_millis() as u64;
        let is_error = outcome.is_error();
        let error_message = match &outcome {
            ToolOutcome::Error { message } => Some(message.as_str()),
            ToolOutcome::Ok { .. } => None,
        };

        let recorded = self
            .sessions
            .record_tool_result(
                session_id,
                ToolResultEntry {
                    tool: tool_name,
                    call_seq: Some(ticket.seq),
                    duration_ms,
                    is_error,
                    summary: outcome.summary(),
                    error_message,
                },
            )
            .await;
        guard.disarm();

        let label = match &run {
            RunResult::Envelope(_) if is_error => "error",
            RunResult::Envelope(_) => "ok",
            RunResult::NotEnabled(_) => "not_enabled",
            RunResult::Failed(_) => "failed",
            RunResult::TimedOut => "timeout",
            RunResult::Cancelled => "cancelled",
        };
        let audit = serde_json::json!({
            "event": "tool_audit",
            "session_id": session_id,
            "tool": tool_name,
            "group": tool.group().as_str(),
            "risk": tool.risk().as_str(),
            "seq": ticket.seq,
            "ok": !is_error,
            "outcome": label,
            "duration_ms": duration_ms,
            "args_preview": args_preview,
        });
        tracing::info!(audit = %audit.to_string(), "tool");

        recorded?;

        // 出错返回时提醒无处携带，顺延到下一次调用
        if ticket.nudge.is_some()
            && matches!(run, RunResult::Failed(_) | RunResult::TimedOut | RunResult::Cancelled)
        {
            self.sessions.defer_nudge(session_id).await;
        }

        match run {
            RunResult::Envelope(_) | RunResult::NotEnabled(_) => Ok(CallOutcome {
                content,
                is_error,
                hint: ticket.nudge,
                seq: ticket.seq,
            }),
            RunResult::Failed(e) => Err(GatewayError::ToolExecutionFailed(e)),
            RunResult::TimedOut => Err(GatewayError::ToolTimeout(tool_name.to_string())),
            RunResult::Cancelled => Err(GatewayError::Cancelled(tool_name.to_string())),
        }
    }
}

/// 未完成调用的守卫：若 execute 的 future 在记录 tool_result 之前被丢弃，补记一条失败结果，
/// 不留下没有结果的 tool_call
struct PendingResult {
    sessions: Arc<SessionManager>,
    session_id: String,
    tool: String,
    call_seq: u64,
    nudged: bool,
    start: Instant,
    armed: bool,
}

impl PendingResult {
    fn new(
        sessions: &Arc<SessionManager>,
        session_id: &str,
        tool: &str,
        ticket: &ToolCallTicket,
        start: Instant,
    ) -> Self {
        Self {
            sessions: Arc::clone(sessions),
            session_id: session_id.to_string(),
            tool: tool.to_string(),
            call_seq: ticket.seq,
            nudged: ticket.nudge.is_some(),
            start,
            armed: true,
        }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for PendingResult {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            tracing::warn!(tool = %self.tool, seq = self.call_seq, "tool call abandoned outside runtime, result not recorded");
            return;
        };
        let sessions = Arc::clone(&self.sessions);
        let session_id = std::mem::take(&mut self.session_id);
        let tool = std::mem::take(&mut self.tool);
        let call_seq = self.call_seq;
        let nudged = self.nudged;
        let duration_ms = self.start.elapsed().as_millis() as u64;
        handle.spawn(async move {
            let message = "tool call abandoned before completion";
            let entry = ToolResultEntry {
                tool: &tool,
                call_seq: Some(call_seq),
                duration_ms,
                is_error: true,
                summary: message,
                error_message: Some(message),
            };
            if let Err(e) = sessions.record_tool_result(&session_id, entry).await {
                tracing::warn!(tool = %tool, seq = call_seq, "failed to record abandoned tool call: {}", e);
            }
            if nudged {
                sessions.defer_nudge(&session_id).await;
            }
        });
    }
}

/// 审计日志用的参数预览（先脱敏再截断）
fn args_preview(args: &Value, sessions: &SessionManager) -> String {
    let redacted = sessions.redact(args);
    truncate(&redacted.to_string(), 200)
}
