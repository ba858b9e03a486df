//! 会话查询与上报接口（axum）
//!
//! 只读路由从镜像库读取；镜像不可达时仍返回 200，body 中带 `error` 与空结果，调用方无需区分。
//! `POST /api/sessions/:id/ingest` 供离线测试工具上报会话：计数器累加，消息按 turn upsert，整体在一个事务内。

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};

use crate::session::{
    ConversationTurn, MirrorError, MirroredEvent, MirroredMessage, MirroredSession, Redactor,
    SessionDelta, SessionMirror, TransportKind,
};

const DEFAULT_LIST_LIMIT: u32 = 50;
const MAX_LIST_LIMIT: u32 = 500;

/// 路由共享状态
#[derive(Clone)]
pub struct ApiState {
    pub mirror: Arc<SessionMirror>,
    pub redactor: Arc<Redactor>,
}

impl ApiState {
    pub fn new(mirror: Arc<SessionMirror>, redactor: Redactor) -> Self {
        Self {
            mirror,
            redactor: Arc::new(redactor),
        }
    }
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/api/health", get(api_health))
        .route("/api/sessions", get(api_sessions_list))
        .route("/api/sessions/:id", get(api_session_get))
        .route("/api/sessions/:id/events", get(api_session_events))
        .route("/api/sessions/:id/messages", get(api_session_messages))
        .route("/api/sessions/:id/ingest", post(api_session_ingest))
        .with_state(state)
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    mirror_healthy: bool,
}

async fn api_health(State(state): State<ApiState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        mirror_healthy: state.mirror.is_healthy().await,
    })
}

#[derive(Debug, Deserialize)]
struct ListQuery {
    limit: Option<u32>,
}

#[derive(Debug, Serialize)]
struct SessionsResponse {
    sessions: Vec<MirroredSession>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

async fn api_sessions_list(
    State(state): State<ApiState>,
    Query(q): Query<ListQuery>,
) -> Json<SessionsResponse> {
    let limit = q.limit.unwrap_or(DEFAULT_LIST_LIMIT).clamp(1, MAX_LIST_LIMIT);
    let (sessions, error) = degrade(state.mirror.list_sessions(limit).await, "list sessions");
    Json(SessionsResponse { sessions, error })
}

#[derive(Debug, Serialize)]
struct SessionResponse {
    session: Option<MirroredSession>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

async fn api_session_get(State(state): State<ApiState>, Path(id): Path<String>) -> Json<SessionResponse> {
    let (session, error) = degrade(state.mirror.get_session(&id).await, "get session");
    Json(SessionResponse { session, error })
}

#[derive(Debug, Serialize)]
struct EventsResponse {
    events: Vec<MirroredEvent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

async fn api_session_events(State(state): State<ApiState>, Path(id): Path<String>) -> Json<EventsResponse> {
    let (events, error) = degrade(state.mirror.list_events(&id).await, "list events");
    Json(EventsResponse { events, error })
}

#[derive(Debug, Serialize)]
struct MessagesResponse {
    messages: Vec<MirroredMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

async fn api_session_messages(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> Json<MessagesResponse> {
    let (messages, error) = degrade(state.mirror.list_messages(&id).await, "list messages");
    Json(MessagesResponse { messages, error })
}

/// 上报内容：计数器为增量
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct IngestRequest {
    pub transport: Option<TransportKind>,
    pub environment: Option<String>,
    pub tool_count: u64,
    pub checkpoint_count: u64,
    pub error_count: u64,
    pub last_checkpoint_summary: Option<String>,
    pub user_name: Option<String>,
    pub user_purpose: Option<String>,
    pub messages: Vec<ConversationTurn>,
}

#[derive(Debug, Serialize)]
struct IngestResponse {
    accepted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

async fn api_session_ingest(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Json(body): Json<IngestRequest>,
) -> Json<IngestResponse> {
    let ((), error) = degrade(ingest(&state, &id, body).await, "ingest session");
    Json(IngestResponse {
        accepted: error.is_none(),
        error,
    })
}

/// 整个上报在一个事务内提交：返回 accepted=false 时什么都没写，重试不会重复累加
async fn ingest(state: &ApiState, id: &str, body: IngestRequest) -> Result<(), MirrorError> {
    let redactor = &state.redactor;
    let delta = SessionDelta {
        id: id.to_string(),
        started_at: None,
        transport: Some(body.transport.unwrap_or(TransportKind::Harness)),
        environment: body.environment,
        tool_count: body.tool_count,
        checkpoint_count: body.checkpoint_count,
        error_count: body.error_count,
        last_checkpoint_summary: body.last_checkpoint_summary.map(|s| redactor.redact_text(&s)),
        user_name: body.user_name,
        user_purpose: body.user_purpose,
    };
    let messages: Vec<ConversationTurn> = body
        .messages
        .into_iter()
        .map(|mut turn| {
            turn.content = redactor.redact_text(&turn.content);
            turn
        })
        .collect();
    state.mirror.ingest(&delta, &messages).await?;
    tracing::info!(session_id = %id, tool_count = delta.tool_count, "session ingested");
    Ok(())
}

/// 镜像错误降级为空结果 + error 字符串
fn degrade<T: Default>(result: Result<T, MirrorError>, op: &str) -> (T, Option<String>) {
    match result {
        Ok(v) => (v, None),
        Err(e) => {
            tracing::warn!(op, "mirror read failed: {}", e);
            (T::default(), Some(e.to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    use super::*;
    use crate::session::{DisabledMirror, SqliteMirror};

    async fn body_json(resp: axum::response::Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_health_reports_disabled_mirror() {
        let state = ApiState::new(Arc::new(SessionMirror::new(Arc::new(DisabledMirror))), Redactor::default());
        let resp = router(state)
            .oneshot(Request::get("/api/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let v = body_json(resp).await;
        assert_eq!(v["status"], "ok");
        assert_eq!(v["mirror_healthy"], false);
    }

    #[tokio::test]
    async fn test_limit_is_clamped() {
        let mirror = Arc::new(SessionMirror::new(Arc::new(SqliteMirror::open_in_memory().unwrap())));
        mirror.init_schema().await.unwrap();
        let state = ApiState::new(mirror, Redactor::default());
        let resp = router(state)
            .oneshot(Request::get("/api/sessions?limit=0").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let v = body_json(resp).await;
        assert_eq!(v["sessions"], serde_json::json!([]));
        assert!(v.get("error").is_none());
    }
}
