//! digit-mcp
//!
//! 入口：加载配置、初始化日志、装配网关，启动会话查询接口并在 Ctrl+C 时退出。
//! 用法：`digit-mcp [config.toml]`

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use digit_mcp::{
    config::load_config, observability, session::TransportKind, GatewayBuilder,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 日志：默认 info，可通过 RUST_LOG 覆盖；写 stderr
    observability::init();

    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let config = load_config(config_path).context("Failed to load config")?;
    let bind_addr = config.http.bind_addr.clone();

    let gateway = GatewayBuilder::new(config)
        .with_listener(Arc::new(|| {
            tracing::info!("tool list changed");
        }))
        .build()
        .await
        .context("Failed to build gateway")?;

    let session = gateway
        .sessions
        .ensure_session(TransportKind::Stdio)
        .await
        .context("Failed to start session")?;
    tracing::info!(session_id = %session.id, "process session ready");

    serve(&gateway, &bind_addr).await?;

    gateway.sessions.flush_mirror().await;
    tracing::info!("shutdown complete");
    Ok(())
}

#[cfg(feature = "http")]
async fn serve(gateway: &digit_mcp::Gateway, bind_addr: &str) -> anyhow::Result<()> {
    use digit_mcp::{http, session::Redactor};

    let redactor = Redactor::new(&gateway.sessions.settings().redact_keys);
    let app = http::router(http::ApiState::new(Arc::clone(&gateway.mirror), redactor));
    let listener = tokio::net::TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("Failed to bind {}", bind_addr))?;
    tracing::info!("session API listening on http://{}", bind_addr);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server failed")?;
    Ok(())
}

#[cfg(not(feature = "http"))]
async fn serve(_gateway: &digit_mcp::Gateway, _bind_addr: &str) -> anyhow::Result<()> {
    shutdown_signal().await;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!("failed to listen for Ctrl+C: {}", e);
    }
    tracing::info!("shutdown signal received");
}
