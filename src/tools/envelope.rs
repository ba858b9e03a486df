//! 结果信封检查
//!
//! 工具返回的字符串是 `{"success": bool, "data"?: any, "error"?: string}` 信封，核心只需要
//! 「是否失败 + 简短摘要」，其余保持为不透明字符串，避免与各领域 schema 耦合。

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// 会话记录真正检查的部分
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ToolOutcome {
    Ok { summary: String },
    Error { message: String },
}

impl ToolOutcome {
    /// 从信封字符串提取结果；不是 JSON 对象或缺少 success 字段时视为成功，摘要取原文
    pub fn inspect(envelope: &str, max_chars: usize) -> Self {
        let parsed: Option<Value> = serde_json::from_str(envelope).ok();
        match parsed.as_ref().and_then(|v| v.as_object()) {
            Some(obj) if obj.get("success").and_then(Value::as_bool) == Some(false) => {
                let message = obj
                    .get("error")
                    .map(|e| match e {
                        Value::String(s) => s.clone(),
                        other => other.to_string(),
                    })
                    .unwrap_or_else(|| "tool reported failure".to_string());
                ToolOutcome::Error {
                    message: truncate(&message, max_chars),
                }
            }
            Some(obj) => {
                let summary = match obj.get("data") {
                    Some(data) => data.to_string(),
                    None => envelope.to_string(),
                };
                ToolOutcome::Ok {
                    summary: truncate(&summary, max_chars),
                }
            }
            None => ToolOutcome::Ok {
                summary: truncate(envelope, max_chars),
            },
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, ToolOutcome::Error { .. })
    }

    /// 写入 tool_result 的摘要文本
    pub fn summary(&self) -> &str {
        match self {
            ToolOutcome::Ok { summary } => summary,
            ToolOutcome::Error { message } => message,
        }
    }
}

/// 构造失败信封
pub fn error_envelope(message: impl Into<String>) -> String {
    serde_json::json!({ "success": false, "error": message.into() }).to_string()
}

/// 构造成功信封
pub fn ok_envelope(data: Value) -> String {
    serde_json::json!({ "success": true, "data": data }).to_string()
}

/// 按字符截断，超出部分以 "..." 结尾
pub fn truncate(s: &str, max_chars: usize) -> String {
    if s.chars().count() > max_chars {
        format!("{}...", s.chars().take(max_chars).collect::<String>())
    } else {
        s.to_string()
    }
}
