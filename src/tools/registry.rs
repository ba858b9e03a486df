//! 工具注册表（渐进式披露）
//!
//! 所有工具实现 Tool trait（name / description / group / execute），由 ToolRegistry 按名注册与查找。
//! 注册表同时维护「活跃分组」集合：可见工具 = 分组处于活跃集合中的工具。
//! 活跃集合变化时恰好通知一次监听者（transport 据此发出 tools/list_changed）；未变化时不通知也不写入。

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;

use crate::core::GatewayError;
use crate::tools::group::{RiskLevel, ToolGroup};

/// 工具 trait：名称、描述（供 LLM 理解）、所属分组、风险等级、参数 schema、异步执行（args 为 JSON）
///
/// `execute` 的 `Ok` 为结果信封 `{"success": bool, "data"?: any, "error"?: string}`，注册表不解析它；
/// `Err` 仅用于真正意外的失败，由 transport 转换为协议级错误。
#[async_trait]
pub trait Tool: Send + Sync {
    /// 工具名称，全局唯一
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// 所属分组，注册后不可变
    fn group(&self) -> ToolGroup;

    fn risk(&self) -> RiskLevel {
        RiskLevel::Read
    }

    /// 参数 JSON Schema，默认为无参数对象
    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {},
            "required": []
        })
    }

    async fn execute(&self, args: Value) -> Result<String, String>;
}

/// 活跃集合变化监听者：零参数回调，由构造方注入，至多一个
pub type ToolListListener = Arc<dyn Fn() + Send + Sync>;

/// 对外暴露的工具描述（tools/list 条目）
#[derive(Debug, Clone, Serialize)]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
    pub group: ToolGroup,
    pub risk: RiskLevel,
    pub input_schema: Value,
}

/// 单个分组概况（discover_tools 使用）
#[derive(Debug, Clone, Serialize)]
pub struct GroupSummary {
    pub group: ToolGroup,
    pub description: String,
    pub tool_count: usize,
    pub enabled: bool,
}

/// 工具注册表：按名称存储 Arc<dyn Tool>，并维护活跃分组
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
    /// 注册顺序，保证列表输出稳定
    order: Vec<String>,
    active: RwLock<BTreeSet<ToolGroup>>,
    listener: Option<ToolListListener>,
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
            order: Vec::new(),
            active: RwLock::new(BTreeSet::from([ToolGroup::Core])),
            listener: None,
        }
    }

    /// 带监听者创建：活跃集合每次净变化时调用一次
    pub fn with_listener(listener: ToolListListener) -> Self {
        Self {
            listener: Some(listener),
            ..Self::new()
        }
    }

    /// 注册工具；重名返回 DuplicateTool（启动期致命，调用方应中止初始化）
    pub fn register(&mut self, tool: impl Tool + 'static) -> Result<(), GatewayError> {
        self.register_arc(Arc::new(tool))
    }

    pub fn register_arc(&mut self, tool: Arc<dyn Tool>) -> Result<(), GatewayError> {
        let name = tool.name().to_string();
        if self.tools.contains_key(&name) {
            return Err(GatewayError::DuplicateTool(name));
        }
        tracing::debug!(tool = %name, group = %tool.group(), "tool registered");
        self.order.push(name.clone());
        self.tools.insert(name, tool);
        Ok(())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    /// 按名查找，无论分组是否可见（由调用逻辑决定能否执行，而非是否存在）
    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn all_tools(&self) -> Vec<Arc<dyn Tool>> {
        self.order
            .iter()
            .filter_map(|name| self.tools.get(name).cloned())
            .collect()
    }

    /// 当前可见工具（分组处于活跃集合中）
    pub fn enabled_tools(&self) -> Vec<Arc<dyn Tool>> {
        let active = self.read_active();
        self.order
            .iter()
            .filter_map(|name| self.tools.get(name))
            .filter(|tool| active.contains(&tool.group()))
            .cloned()
            .collect()
    }

    pub fn is_tool_enabled(&self, name: &str) -> bool {
        match self.tools.get(name) {
            Some(tool) => self.read_active().contains(&tool.group()),
            None => false,
        }
    }

    pub fn active_groups(&self) -> BTreeSet<ToolGroup> {
        self.read_active().clone()
    }

    pub fn is_group_enabled(&self, group: ToolGroup) -> bool {
        self.read_active().contains(&group)
    }

    /// 按名称启用分组；未知名称忽略。返回活跃集合是否发生变化
    pub fn enable_groups<I, S>(&self, names: I) -> bool
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let groups: Vec<ToolGroup> = parse_groups(names);
        self.enable(&groups)
    }

    /// 按名称禁用分组；未知名称忽略，core 永远不会被移除。返回活跃集合是否发生变化
    pub fn disable_groups<I, S>(&self, names: I) -> bool
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let groups: Vec<ToolGroup> = parse_groups(names);
        self.disable(&groups)
    }

    /// 一次请求同时启用与禁用：在同一次替换中计算，净变化时只通知一次。
    /// 同一分组同时出现在两侧时以禁用为准（core 除外）
    pub fn update_groups<I, J, S, T>(&self, enable: I, disable: J) -> bool
    where
        I: IntoIterator<Item = S>,
        J: IntoIterator<Item = T>,
        S: AsRef<str>,
        T: AsRef<str>,
    {
        let enable: Vec<ToolGroup> = parse_groups(enable);
        let disable: Vec<ToolGroup> = parse_groups(disable);
        self.apply(|active| {
            let mut next = active.clone();
            next.extend(enable.iter().copied());
            for g in disable.iter().filter(|g| !g.is_core()) {
                next.remove(g);
            }
            next
        })
    }

    pub fn enable(&self, groups: &[ToolGroup]) -> bool {
        self.apply(|active| {
            let mut next = active.clone();
            next.extend(groups.iter().copied());
            next
        })
    }

    pub fn disable(&self, groups: &[ToolGroup]) -> bool {
        self.apply(|active| {
            let mut next = active.clone();
            for g in groups.iter().filter(|g| !g.is_core()) {
                next.remove(g);
            }
            next
        })
    }

    /// 计算新集合，仅在不同时替换并通知；通知在释放写锁后进行
    fn apply(&self, compute: impl FnOnce(&BTreeSet<ToolGroup>) -> BTreeSet<ToolGroup>) -> bool {
        let changed = {
            let mut active = self.write_active();
            let next = compute(&active);
            if next == *active {
                false
            } else {
                tracing::info!(
                    from = ?active.iter().map(|g| g.as_str()).collect::<Vec<_>>(),
                    to = ?next.iter().map(|g| g.as_str()).collect::<Vec<_>>(),
                    "active tool groups changed"
                );
                *active = next;
                true
            }
        };
        if changed {
            if let Some(listener) = &self.listener {
                listener();
            }
        }
        changed
    }

    pub fn tool_names(&self) -> Vec<String> {
        self.order.clone()
    }

    /// 可见工具描述列表（tools/list 响应）
    pub fn tool_list(&self) -> Vec<ToolDescriptor> {
        self.enabled_tools()
            .iter()
            .map(|tool| ToolDescriptor {
                name: tool.name().to_string(),
                description: tool.description().to_string(),
                group: tool.group(),
                risk: tool.risk(),
                input_schema: tool.parameters_schema(),
            })
            .collect()
    }

    /// 动态生成可见工具的 schema JSON
    pub fn to_schema_json(&self) -> String {
        serde_json::to_string_pretty(&self.tool_list()).unwrap_or_else(|_| "[]".to_string())
    }

    /// 每个分组的工具数量与启用状态
    pub fn group_summaries(&self) -> Vec<GroupSummary> {
        let active = self.read_active();
        ToolGroup::ALL
            .iter()
            .map(|group| GroupSummary {
                group: *group,
                description: group.description().to_string(),
                tool_count: self.tools.values().filter(|t| t.group() == *group).count(),
                enabled: active.contains(group),
            })
            .collect()
    }

    fn read_active(&self) -> RwLockReadGuard<'_, BTreeSet<ToolGroup>> {
        self.active.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write_active(&self) -> RwLockWriteGuard<'_, BTreeSet<ToolGroup>> {
        self.active.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn parse_groups<I, S>(names: I) -> Vec<ToolGroup>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    names
        .into_iter()
        .filter_map(|name| {
            let parsed = ToolGroup::parse(name.as_ref());
            if parsed.is_none() {
                tracing::debug!(group = name.as_ref(), "ignoring unknown tool group");
            }
            parsed
        })
        .collect()
}
