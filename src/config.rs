//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `DIGIT_MCP__*` 覆盖（双下划线表示嵌套，如
//! `DIGIT_MCP__SESSION__NUDGE_THRESHOLD=12`）。

use std::path::PathBuf;

use serde::Deserialize;

use crate::session::redact::default_redact_keys;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub app: AppSection,
    pub session: SessionSection,
    pub mirror: MirrorSection,
    pub tools: ToolsSection,
    pub http: HttpSection,
}

/// [app] 段：应用名、运行环境标签（写入每个会话）
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppSection {
    pub name: Option<String>,
    pub environment: String,
}

impl Default for AppSection {
    fn default() -> Self {
        Self {
            name: None,
            environment: "dev".to_string(),
        }
    }
}

/// [session] 段：主日志目录、checkpoint 提醒阈值、脱敏键、摘要长度
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SessionSection {
    pub log_dir: PathBuf,
    /// 距上次 checkpoint 的工具调用数达到此值（及其整数倍）时提醒；0 关闭
    pub nudge_threshold: u32,
    /// 大小写不敏感的子串匹配
    pub redact_keys: Vec<String>,
    pub summary_max_chars: usize,
}

impl Default for SessionSection {
    fn default() -> Self {
        Self {
            log_dir: PathBuf::from("data/sessions"),
            nudge_threshold: 8,
            redact_keys: default_redact_keys(),
            summary_max_chars: 500,
        }
    }
}

/// [mirror] 段：SQLite 镜像
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MirrorSection {
    /// false 时使用始终不可达的镜像，所有写入被跳过
    pub enabled: bool,
    pub db_path: PathBuf,
    /// 后台写入队列容量，满时丢弃
    pub queue_capacity: usize,
}

impl Default for MirrorSection {
    fn default() -> Self {
        Self {
            enabled: true,
            db_path: PathBuf::from("data/mirror.db"),
            queue_capacity: 1024,
        }
    }
}

/// [tools] 段：工具超时、启动时启用的分组
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ToolsSection {
    /// 单次工具调用超时（秒）
    pub tool_timeout_secs: u64,
    /// core 始终启用，不必列出
    pub default_groups: Vec<String>,
}

impl Default for ToolsSection {
    fn default() -> Self {
        Self {
            tool_timeout_secs: 30,
            default_groups: vec!["core".to_string()],
        }
    }
}

/// [http] 段：会话查询/上报接口
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HttpSection {
    pub bind_addr: String,
}

impl Default for HttpSection {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:8765".to_string(),
        }
    }
}

/// 从 config 目录加载配置，环境变量 DIGIT_MCP__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 DIGIT_MCP__*（双下划线表示嵌套键，列表用逗号分隔）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("DIGIT_MCP")
            .prefix_separator("__")
            .separator("__")
            .list_separator(",")
            .with_list_parse_key("tools.default_groups")
            .with_list_parse_key("session.redact_keys")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}
