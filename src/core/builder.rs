//! 网关构建器：统一的初始化逻辑
//!
//! 所有接入方式（stdio / http / 测试）共享同一套装配顺序：
//! 镜像 → 会话管理器 → 注册表（领域工具 + 会话工具 + 元工具）→ 默认分组 → 执行器。

use std::path::PathBuf;
use std::sync::Arc;

use crate::config::AppConfig;
use crate::core::GatewayError;
use crate::session::{
    DisabledMirror, MirrorBackend, SessionManager, SessionMirror, SessionSettings, SqliteMirror,
};
use crate::tools::{
    install_discovery, register_session_tools, Tool, ToolExecutor, ToolListListener, ToolRegistry,
};

/// 装配完成的网关组件
pub struct Gateway {
    pub registry: Arc<ToolRegistry>,
    pub sessions: Arc<SessionManager>,
    pub executor: Arc<ToolExecutor>,
    pub mirror: Arc<SessionMirror>,
}

/// 网关构建器
pub struct GatewayBuilder {
    config: AppConfig,
    tools: Vec<Arc<dyn Tool>>,
    listener: Option<ToolListListener>,
    backend: Option<Arc<dyn MirrorBackend>>,
}

impl GatewayBuilder {
    pub fn new(config: AppConfig) -> Self {
        Self {
            config,
            tools: Vec::new(),
            listener: None,
            backend: None,
        }
    }

    /// 覆盖主日志目录（测试用）
    pub fn with_log_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.session.log_dir = dir.into();
        self
    }

    /// 活跃分组变化监听者（transport 发出 tools/list_changed）
    pub fn with_listener(mut self, listener: ToolListListener) -> Self {
        self.listener = Some(listener);
        self
    }

    /// 指定镜像后端；未指定时按 [mirror] 配置打开 SQLite
    pub fn with_mirror_backend(mut self, backend: Arc<dyn MirrorBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    /// 注册一个领域工具
    pub fn with_tool(mut self, tool: impl Tool + 'static) -> Self {
        self.tools.push(Arc::new(tool));
        self
    }

    /// 镜像打不开不算启动失败：退化为始终不可达的镜像
    fn open_backend(&self) -> Arc<dyn MirrorBackend> {
        if let Some(backend) = &self.backend {
            return Arc::clone(backend);
        }
        if !self.config.mirror.enabled {
            tracing::info!("mirror disabled by config");
            return Arc::new(DisabledMirror);
        }
        match SqliteMirror::open(&self.config.mirror.db_path) {
            Ok(mirror) => Arc::new(mirror),
            Err(e) => {
                tracing::warn!(path = %self.config.mirror.db_path.display(), "mirror unavailable, continuing without it: {}", e);
                Arc::new(DisabledMirror)
            }
        }
    }

    /// 取值为 0 会让每次调用立即超时、摘要为空，启动时拒绝
    fn validate(&self) -> Result<(), GatewayError> {
        if self.config.tools.tool_timeout_secs == 0 {
            return Err(GatewayError::ConfigError(
                "tools.tool_timeout_secs must be greater than 0".to_string(),
            ));
        }
        if self.config.session.summary_max_chars == 0 {
            return Err(GatewayError::ConfigError(
                "session.summary_max_chars must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }

    /// 装配；配置不合法、重名工具与主日志目录不可用是致命错误
    pub async fn build(self) -> Result<Gateway, GatewayError> {
        self.validate()?;
        let mirror = Arc::new(SessionMirror::new(self.open_backend()));
        if mirror.is_healthy().await {
            if let Err(e) = mirror.init_schema().await {
                tracing::warn!("mirror schema init failed: {}", e);
            }
        }

        let settings = SessionSettings::from_config(&self.config);
        let sessions = Arc::new(SessionManager::open(settings, Arc::clone(&mirror)).await?);

        let mut registry = match self.listener {
            Some(listener) => ToolRegistry::with_listener(listener),
            None => ToolRegistry::new(),
        };
        for tool in self.tools {
            registry.register_arc(tool)?;
        }
        register_session_tools(&mut registry, &sessions)?;
        let registry = install_discovery(registry)?;
        registry.enable_groups(&self.config.tools.default_groups);

        let executor = Arc::new(ToolExecutor::new(
            Arc::clone(&registry),
            Arc::clone(&sessions),
            self.config.tools.tool_timeout_secs,
        ));
        tracing::info!(
            tools = registry.all_tools().len(),
            active = ?registry.active_groups().iter().map(|g| g.as_str()).collect::<Vec<_>>(),
            "gateway ready"
        );

        Ok(Gateway {
            registry,
            sessions,
            executor,
            mirror,
        })
    }
}
