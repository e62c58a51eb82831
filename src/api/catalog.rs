// 只读查询接口：健康检查、数据库信息、模板列表、会话记忆、聊天记录与监控事件。
use super::errors::code_error_response;
use crate::auth::resolve_caller;
use crate::monitor::{EVENT_CHAT_MESSAGES, EVENT_CHAT_SESSIONS, EVENT_DATABASE_INFO};
use crate::state::AppState;
use crate::storage::run_blocking;
use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::response::Response;
use axum::{routing::get, Json, Router};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::sync::Arc;
use std::time::Instant;
use tracing::error;

const DEFAULT_EVENT_PAGE: usize = 100;
const DEFAULT_CHAT_PAGE: i64 = 100;
const MAX_CHAT_PAGE: i64 = 1000;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/health", get(health))
        .route("/api/database/info", get(database_info))
        .route("/api/templates", get(list_templates))
        .route("/api/sessions", get(list_sessions))
        .route("/api/sessions/{session_id}", get(session_memory))
        .route("/api/chat/sessions", get(list_chat_sessions))
        .route("/api/chat/{session_id}/messages", get(chat_messages))
        .route("/api/monitor/events", get(monitor_events))
}

#[derive(Debug, Deserialize)]
struct EventQuery {
    #[serde(default)]
    limit: Option<usize>,
    #[serde(default)]
    event: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatMessageQuery {
    #[serde(default)]
    limit: Option<i64>,
    #[serde(default)]
    keyword: Option<String>,
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

async fn database_info(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Value>, Response> {
    let started = Instant::now();
    let outcome = state.executor.database_info().await;
    let mut metadata = Map::new();
    if let Err(err) = &outcome {
        metadata.insert("error".to_string(), json!(err.to_string()));
    }
    state
        .monitor
        .record(EVENT_DATABASE_INFO, started.elapsed(), outcome.is_ok(), metadata);
    match outcome {
        Ok(info) => Ok(Json(json!(info))),
        Err(err) if err.is_connectivity() => Err(code_error_response(
            "WAREHOUSE_UNAVAILABLE",
            err.to_string(),
            None,
        )),
        Err(err) => {
            error!("读取数据库信息失败: {err}");
            Err(code_error_response("QUERY_FAILED", err.to_string(), None))
        }
    }
}

async fn list_templates(State(state): State<Arc<AppState>>) -> Result<Json<Value>, Response> {
    let templates = state.templates.list().await.map_err(storage_error)?;
    Ok(Json(json!({ "templates": templates })))
}

async fn list_sessions(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<Value>, Response> {
    let user_id = resolve_caller(&headers);
    let sessions = state.memory.sessions(&user_id).await.map_err(storage_error)?;
    Ok(Json(json!({ "user_id": user_id, "sessions": sessions })))
}

/// 按时间正序返回整个会话；不存在的会话返回空列表。
async fn session_memory(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(session_id): Path<String>,
) -> Result<Json<Value>, Response> {
    let user_id = resolve_caller(&headers);
    let entries = state
        .memory
        .session(&user_id, session_id.trim())
        .await
        .map_err(storage_error)?;
    Ok(Json(json!({ "session_id": session_id, "entries": entries })))
}

/// 按最近一条消息时间倒序。
async fn list_chat_sessions(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<Value>, Response> {
    let user_id = resolve_caller(&headers);
    let started = Instant::now();
    let owner = user_id.clone();
    let outcome = run_blocking(&state.storage, move |storage| {
        storage.list_chat_sessions(&owner)
    })
    .await;
    let mut metadata = Map::new();
    metadata.insert("user_id".to_string(), json!(user_id));
    state
        .monitor
        .record(EVENT_CHAT_SESSIONS, started.elapsed(), outcome.is_ok(), metadata);
    let sessions = outcome.map_err(storage_error)?;
    Ok(Json(json!({ "user_id": user_id, "sessions": sessions })))
}

/// 最近 `limit` 条（默认 100，上限 1000）按时间正序返回，`keyword` 为内容子串过滤。
async fn chat_messages(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(session_id): Path<String>,
    Query(query): Query<ChatMessageQuery>,
) -> Result<Json<Value>, Response> {
    let user_id = resolve_caller(&headers);
    let session_id = session_id.trim().to_string();
    let limit = query
        .limit
        .filter(|value| *value > 0)
        .unwrap_or(DEFAULT_CHAT_PAGE)
        .min(MAX_CHAT_PAGE);
    let started = Instant::now();
    let owner = (user_id.clone(), session_id.clone());
    let keyword = query.keyword.clone();
    let outcome = run_blocking(&state.storage, move |storage| {
        storage.load_chat_messages(&owner.0, &owner.1, Some(limit), keyword.as_deref())
    })
    .await;
    let mut metadata = Map::new();
    metadata.insert("user_id".to_string(), json!(user_id));
    metadata.insert("session_id".to_string(), json!(session_id));
    state
        .monitor
        .record(EVENT_CHAT_MESSAGES, started.elapsed(), outcome.is_ok(), metadata);
    let messages = outcome.map_err(storage_error)?;
    Ok(Json(json!({ "session_id": session_id, "messages": messages })))
}

async fn monitor_events(
    State(state): State<Arc<AppState>>,
    Query(query): Query<EventQuery>,
) -> Json<Value> {
    let limit = query.limit.unwrap_or(DEFAULT_EVENT_PAGE);
    let filter = query
        .event
        .as_deref()
        .map(str::trim)
        .filter(|value| !value.is_empty());
    let events: Vec<_> = state
        .monitor
        .recent(None)
        .into_iter()
        .filter(|item| filter.map_or(true, |name| item.event == name))
        .take(limit)
        .collect();
    Json(json!({ "events": events }))
}

fn storage_error(err: anyhow::Error) -> Response {
    error!("读取存储失败: {err}");
    code_error_response("STORAGE_ERROR", "storage is unavailable", None)
}
