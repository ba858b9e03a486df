//! 内置元工具（core 分组，始终可见）
//!
//! - `discover_tools`：列出所有分组及其工具数、启用状态
//! - `enable_tools`：启用/禁用分组，触发 tools/list_changed
//! - `session_checkpoint`：记录 checkpoint
//! - `session_identify`：记录使用者姓名与目的
//!
//! 前两个工具持有注册表的 Weak 引用，由 [`install_discovery`] 通过 `Arc::new_cyclic` 安装。

use std::sync::{Arc, Weak};

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::Value;

use crate::core::GatewayError;
use crate::session::{ConversationTurn, SessionManager};
use crate::tools::envelope::{error_envelope, ok_envelope};
use crate::tools::group::{RiskLevel, ToolGroup};
use crate::tools::schema::{args_schema, empty_object_schema};
use crate::tools::{Tool, ToolRegistry};

pub const DISCOVER_TOOLS: &str = "discover_tools";
pub const ENABLE_TOOLS: &str = "enable_tools";
pub const SESSION_CHECKPOINT: &str = "session_checkpoint";
pub const SESSION_IDENTIFY: &str = "session_identify";

/// enable_tools 参数
#[derive(Debug, Default, Deserialize, JsonSchema)]
pub struct EnableToolsArgs {
    /// 要启用的分组名，如 ["mdms", "pgr"]
    #[serde(default)]
    pub enable: Vec<String>,
    /// 要禁用的分组名（core 不可禁用）
    #[serde(default)]
    pub disable: Vec<String>,
}

/// session_checkpoint 的对话条目
#[derive(Debug, Deserialize, JsonSchema)]
pub struct MessageArg {
    pub turn: u32,
    /// user / assistant
    pub role: String,
    pub content: String,
}

/// session_checkpoint 参数
#[derive(Debug, Deserialize, JsonSchema)]
pub struct CheckpointArgs {
    /// 到目前为止的进展摘要
    pub summary: String,
    /// 缺省为当前进程会话
    #[serde(default)]
    pub session_id: Option<String>,
    /// 可选：随 checkpoint 一起保存的对话
    #[serde(default)]
    pub messages: Option<Vec<MessageArg>>,
}

/// session_identify 参数
#[derive(Debug, Default, Deserialize, JsonSchema)]
pub struct IdentifyArgs {
    #[serde(default)]
    pub user_name: Option<String>,
    /// 本次会话的目的
    #[serde(default)]
    pub purpose: Option<String>,
    #[serde(default)]
    pub session_id: Option<String>,
}

fn parse_args<T: for<'de> Deserialize<'de>>(tool: &str, args: Value) -> Result<T, String> {
    let args = if args.is_null() { Value::Object(Default::default()) } else { args };
    serde_json::from_value(args).map_err(|e| format!("invalid arguments for {}: {}", tool, e))
}

/// 列出分组
pub struct DiscoverTool {
    registry: Weak<ToolRegistry>,
}

#[async_trait]
impl Tool for DiscoverTool {
    fn name(&self) -> &str {
        DISCOVER_TOOLS
    }

    fn description(&self) -> &str {
        "List all tool groups with their descriptions, tool counts and whether they are enabled. \
         Use enable_tools to make a group's tools visible."
    }

    fn group(&self) -> ToolGroup {
        ToolGroup::Core
    }

    fn parameters_schema(&self) -> Value {
        empty_object_schema()
    }

    async fn execute(&self, _args: Value) -> Result<String, String> {
        let registry = self
            .registry
            .upgrade()
            .ok_or_else(|| "tool registry has been dropped".to_string())?;
        let groups = registry.group_summaries();
        Ok(ok_envelope(serde_json::json!({
            "groups": groups,
            "active_groups": registry.active_groups(),
        })))
    }
}

/// 启用/禁用分组
pub struct EnableToolsTool {
    registry: Weak<ToolRegistry>,
}

#[async_trait]
impl Tool for EnableToolsTool {
    fn name(&self) -> &str {
        ENABLE_TOOLS
    }

    fn description(&self) -> &str {
        "Enable or disable tool groups. Args: {\"enable\": [group], \"disable\": [group]}. \
         The core group is always enabled. Unknown group names are ignored."
    }

    fn group(&self) -> ToolGroup {
        ToolGroup::Core
    }

    fn risk(&self) -> RiskLevel {
        RiskLevel::Write
    }

    fn parameters_schema(&self) -> Value {
        args_schema::<EnableToolsArgs>()
    }

    async fn execute(&self, args: Value) -> Result<String, String> {
        let args: EnableToolsArgs = match parse_args(ENABLE_TOOLS, args) {
            Ok(a) => a,
            Err(e) => return Ok(error_envelope(e)),
        };
        let registry = self
            .registry
            .upgrade()
            .ok_or_else(|| "tool registry has been dropped".to_string())?;

        let ignored: Vec<&String> = args
            .enable
            .iter()
            .chain(args.disable.iter())
            .filter(|name| ToolGroup::parse(name).is_none())
            .collect();
        let changed = registry.update_groups(&args.enable, &args.disable);

        Ok(ok_envelope(serde_json::json!({
            "changed": changed,
            "active_groups": registry.active_groups(),
            "ignored": ignored,
        })))
    }
}

/// 记录 checkpoint
pub struct CheckpointTool {
    sessions: Arc<SessionManager>,
}

impl CheckpointTool {
    pub fn new(sessions: Arc<SessionManager>) -> Self {
        Self { sessions }
    }
}

#[async_trait]
impl Tool for CheckpointTool {
    fn name(&self) -> &str {
        SESSION_CHECKPOINT
    }

    fn description(&self) -> &str {
        "Save a checkpoint of the current session: a short summary of progress so far, \
         optionally with the conversation turns to keep."
    }

    fn group(&self) -> ToolGroup {
        ToolGroup::Core
    }

    fn risk(&self) -> RiskLevel {
        RiskLevel::Write
    }

    fn parameters_schema(&self) -> Value {
        args_schema::<CheckpointArgs>()
    }

    async fn execute(&self, args: Value) -> Result<String, String> {
        let args: CheckpointArgs = match parse_args(SESSION_CHECKPOINT, args) {
            Ok(a) => a,
            Err(e) => return Ok(error_envelope(e)),
        };
        let Some(session_id) = resolve_session(&self.sessions, args.session_id).await else {
            return Ok(error_envelope("no active session; pass session_id"));
        };
        let messages = args.messages.map(|ms| {
            ms.into_iter()
                .map(|m| ConversationTurn::new(m.turn, m.role, m.content))
                .collect::<Vec<_>>()
        });
        match self.sessions.checkpoint(&session_id, &args.summary, messages).await {
            Ok(seq) => Ok(ok_envelope(serde_json::json!({
                "session_id": session_id,
                "seq": seq,
            }))),
            Err(e @ GatewayError::UnknownSession(_)) => Ok(error_envelope(e.to_string())),
            Err(e) => Err(e.to_string()),
        }
    }
}

/// 记录使用者信息
pub struct IdentifyTool {
    sessions: Arc<SessionManager>,
}

impl IdentifyTool {
    pub fn new(sessions: Arc<SessionManager>) -> Self {
        Self { sessions }
    }
}

#[async_trait]
impl Tool for IdentifyTool {
    fn name(&self) -> &str {
        SESSION_IDENTIFY
    }

    fn description(&self) -> &str {
        "Record who is using this session and what they are trying to do."
    }

    fn group(&self) -> ToolGroup {
        ToolGroup::Core
    }

    fn risk(&self) -> RiskLevel {
        RiskLevel::Write
    }

    fn parameters_schema(&self) -> Value {
        args_schema::<IdentifyArgs>()
    }

    async fn execute(&self, args: Value) -> Result<String, String> {
        let args: IdentifyArgs = match parse_args(SESSION_IDENTIFY, args) {
            Ok(a) => a,
            Err(e) => return Ok(error_envelope(e)),
        };
        if args.user_name.is_none() && args.purpose.is_none() {
            return Ok(error_envelope("provide user_name and/or purpose"));
        }
        let Some(session_id) = resolve_session(&self.sessions, args.session_id).await else {
            return Ok(error_envelope("no active session; pass session_id"));
        };
        match self
            .sessions
            .set_user_context(&session_id, args.user_name, args.purpose)
            .await
        {
            Ok(record) => Ok(ok_envelope(serde_json::json!({
                "session_id": record.id,
                "user_name": record.user_name,
                "purpose": record.user_purpose,
            }))),
            Err(e) => Ok(error_envelope(e.to_string())),
        }
    }
}

async fn resolve_session(sessions: &SessionManager, explicit: Option<String>) -> Option<String> {
    match explicit.filter(|s| !s.trim().is_empty()) {
        Some(id) => Some(id),
        None => sessions.current_session_id().await,
    }
}

/// 注册 session_checkpoint 与 session_identify
pub fn register_session_tools(
    registry: &mut ToolRegistry,
    sessions: &Arc<SessionManager>,
) -> Result<(), GatewayError> {
    registry.register(CheckpointTool::new(Arc::clone(sessions)))?;
    registry.register(IdentifyTool::new(Arc::clone(sessions)))?;
    Ok(())
}

/// 安装 discover_tools / enable_tools 并冻结注册表
pub fn install_discovery(mut registry: ToolRegistry) -> Result<Arc<ToolRegistry>, GatewayError> {
    for name in [DISCOVER_TOOLS, ENABLE_TOOLS] {
        if registry.contains(name) {
            return Err(GatewayError::DuplicateTool(name.to_string()));
        }
    }
    Ok(Arc::new_cyclic(|weak: &Weak<ToolRegistry>| {
        let meta: [Arc<dyn Tool>; 2] = [
            Arc::new(DiscoverTool { registry: weak.clone() }),
            Arc::new(EnableToolsTool { registry: weak.clone() }),
        ];
        for tool in meta {
            // 名称已检查
            if let Err(e) = registry.register_arc(tool) {
                tracing::error!("failed to install meta tool: {}", e);
            }
        }
        registry
    }))
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::tools::FnTool;

    fn registry_with_pgr() -> (Arc<ToolRegistry>, Arc<AtomicUsize>) {
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        let mut registry = ToolRegistry::with_listener(Arc::new(move || {
            c.fetch_add(1, Ordering::SeqCst);
        }));
        registry
            .register(FnTool::new("pgr_search", "search complaints", ToolGroup::Pgr, |_| async {
                Ok(ok_envelope(Value::Null))
            }))
            .unwrap();
        (install_discovery(registry).unwrap(), count)
    }

    #[tokio::test]
    async fn test_enable_tools_changes_active_set() {
        let (registry, count) = registry_with_pgr();
        let tool = registry.get(ENABLE_TOOLS).unwrap();
        let out = tool
            .execute(serde_json::json!({"enable": ["pgr", "nope"]}))
            .await
            .unwrap();
        let v: Value = serde_json::from_str(&out).unwrap();
        assert_eq!(v["success"], true);
        assert_eq!(v["data"]["changed"], true);
        assert_eq!(v["data"]["ignored"], serde_json::json!(["nope"]));
        assert!(registry.is_tool_enabled("pgr_search"));
        assert_eq!(count.load(Ordering::SeqCst), 1);

        let out = tool.execute(serde_json::json!({"enable": ["pgr"]})).await.unwrap();
        let v: Value = serde_json::from_str(&out).unwrap();
        assert_eq!(v["data"]["changed"], false);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_enable_and_disable_same_group_does_not_notify() {
        let (registry, count) = registry_with_pgr();
        let out = registry
            .get(ENABLE_TOOLS)
            .unwrap()
            .execute(serde_json::json!({"enable": ["pgr"], "disable": ["pgr"]}))
            .await
            .unwrap();
        let v: Value = serde_json::from_str(&out).unwrap();
        assert_eq!(v["data"]["changed"], false);
        assert_eq!(v["data"]["active_groups"], serde_json::json!(["core"]));
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_discover_reports_groups() {
        let (registry, _) = registry_with_pgr();
        let out = registry.get(DISCOVER_TOOLS).unwrap().execute(Value::Null).await.unwrap();
        let v: Value = serde_json::from_str(&out).unwrap();
        let groups = v["data"]["groups"].as_array().unwrap();
        assert_eq!(groups.len(), ToolGroup::ALL.len());
        let core = groups.iter().find(|g| g["group"] == "core").unwrap();
        assert_eq!(core["tool_count"], 2);
        assert_eq!(core["enabled"], true);
    }

    #[tokio::test]
    async fn test_bad_args_return_error_envelope() {
        let (registry, _) = registry_with_pgr();
        let out = registry
            .get(ENABLE_TOOLS)
            .unwrap()
            .execute(serde_json::json!({"enable": "pgr"}))
            .await
            .unwrap();
        let v: Value = serde_json::from_str(&out).unwrap();
        assert_eq!(v["success"], false);
    }

    #[test]
    fn test_install_rejects_name_collision() {
        let mut registry = ToolRegistry::new();
        registry
            .register(FnTool::new(DISCOVER_TOOLS, "x", ToolGroup::Core, |_| async { Ok(String::new()) }))
            .unwrap();
        assert!(matches!(
            install_discovery(registry),
            Err(GatewayError::DuplicateTool(name)) if name == DISCOVER_TOOLS
        ));
    }
}
