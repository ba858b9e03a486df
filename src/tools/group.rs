//! 工具分组与风险等级
//!
//! 分组是封闭枚举：只有 `core` 常驻可见，其余按需由客户端启用（渐进式披露）。
//! 名称解析失败返回 None 而不是错误，客户端请求未来/已移除的分组不应被惩罚。

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// 工具分组
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolGroup {
    /// 常驻分组，永远不能被禁用
    Core,
    Mdms,
    Boundary,
    Masters,
    Employees,
    Localization,
    Pgr,
    Admin,
    Idgen,
    Location,
    Encryption,
    Docs,
    Monitoring,
    Tracing,
}

impl ToolGroup {
    pub const ALL: [ToolGroup; 14] = [
        ToolGroup::Core,
        ToolGroup::Mdms,
        ToolGroup::Boundary,
        ToolGroup::Masters,
        ToolGroup::Employees,
        ToolGroup::Localization,
        ToolGroup::Pgr,
        ToolGroup::Admin,
        ToolGroup::Idgen,
        ToolGroup::Location,
        ToolGroup::Encryption,
        ToolGroup::Docs,
        ToolGroup::Monitoring,
        ToolGroup::Tracing,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ToolGroup::Core => "core",
            ToolGroup::Mdms => "mdms",
            ToolGroup::Boundary => "boundary",
            ToolGroup::Masters => "masters",
            ToolGroup::Employees => "employees",
            ToolGroup::Localization => "localization",
            ToolGroup::Pgr => "pgr",
            ToolGroup::Admin => "admin",
            ToolGroup::Idgen => "idgen",
            ToolGroup::Location => "location",
            ToolGroup::Encryption => "encryption",
            ToolGroup::Docs => "docs",
            ToolGroup::Monitoring => "monitoring",
            ToolGroup::Tracing => "tracing",
        }
    }

    /// 分组说明（discover_tools 展示给客户端）
    pub fn description(&self) -> &'static str {
        match self {
            ToolGroup::Core => "Discovery, group switching, session checkpoints and health",
            ToolGroup::Mdms => "Master data search and record creation",
            ToolGroup::Boundary => "Administrative boundary hierarchies and entities",
            ToolGroup::Masters => "Department, designation and complaint-type masters",
            ToolGroup::Employees => "Employee (HRMS) lookup and onboarding",
            ToolGroup::Localization => "Localization message search and upsert",
            ToolGroup::Pgr => "Complaint (PGR) workflow operations",
            ToolGroup::Admin => "Tenant bootstrap and user administration",
            ToolGroup::Idgen => "ID generation formats",
            ToolGroup::Location => "Locality lookup",
            ToolGroup::Encryption => "Encrypt and decrypt values",
            ToolGroup::Docs => "Platform documentation search",
            ToolGroup::Monitoring => "Service, Kafka and database health checks",
            ToolGroup::Tracing => "Distributed trace queries",
        }
    }

    /// 宽松解析：忽略大小写与首尾空白，未知名称返回 None
    pub fn parse(name: &str) -> Option<Self> {
        let name = name.trim().to_ascii_lowercase();
        Self::ALL.into_iter().find(|g| g.as_str() == name)
    }

    pub fn is_core(&self) -> bool {
        matches!(self, ToolGroup::Core)
    }
}

impl fmt::Display for ToolGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ToolGroup {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s).ok_or_else(|| format!("Unknown tool group: {s}"))
    }
}

/// 工具风险等级：只读 / 写入
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    #[default]
    Read,
    Write,
}

impl RiskLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            RiskLevel::Read => "read",
            RiskLevel::Write => "write",
        }
    }
}
