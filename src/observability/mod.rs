//! 可观测性
//!
//! 日志写到 stderr：stdio transport 的 stdout 只承载协议消息。

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// 初始化全局 subscriber；RUST_LOG 覆盖默认的 info 级别。重复调用无副作用
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).with_target(false))
        .try_init();
}
