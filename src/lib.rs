//! digit-mcp - 平台能力网关：渐进式披露的工具注册表 + 可持久化的会话记录
//!
//! 模块划分：
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 错误类型与网关装配
//! - **http**: 会话查询与上报接口（feature `http`）
//! - **observability**: 日志初始化
//! - **session**: 会话生命周期、主日志、镜像库、脱敏
//! - **tools**: 工具注册表、分组、元工具与执行器

pub mod config;
pub mod core;
#[cfg(feature = "http")]
pub mod http;
pub mod observability;
pub mod session;
pub mod tools;

pub use crate::core::{Gateway, GatewayBuilder, GatewayError};
