//! 网关错误类型
//!
//! 分类：启动期致命（重名工具、配置不合法）、客户端可恢复（未知工具/会话）、主日志失败（必须上抛）、
//! 工具执行失败（已记录 tool_result 后再返回给 transport）。镜像库错误不在此处，见 `session::mirror::MirrorError`。

use thiserror::Error;

/// 注册表、会话记录与工具执行过程中可能出现的错误
#[derive(Error, Debug)]
pub enum GatewayError {
    /// 启动期致命：工具名全局唯一
    #[error("Duplicate tool name: {0}")]
    DuplicateTool(String),

    #[error("Unknown tool: {0}")]
    UnknownTool(String),

    #[error("Unknown session: {0}")]
    UnknownSession(String),

    #[error("Tool execution failed: {0}")]
    ToolExecutionFailed(String),

    #[error("Tool timeout: {0}")]
    ToolTimeout(String),

    #[error("Tool call cancelled: {0}")]
    Cancelled(String),

    /// 主日志写入失败：持久性保证所在，必须让调用方看到
    #[error("Primary log write failed: {0}")]
    PrimaryLog(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// 启动期致命：配置值不合法
    #[error("Config error: {0}")]
    ConfigError(String),
}
