// SQL 接口：REST 生成、分页执行、失败语句调试与生成进度查询。
use super::errors::code_error_response;
use crate::auth::resolve_caller;
use crate::monitor::{EVENT_DEBUG_SQL, EVENT_EXECUTE_SQL, EVENT_GENERATE_REST};
use crate::orchestrator::{BufferedSink, OrchestratorError};
use crate::schemas::{
    DebugSqlRequest, ExecuteSqlRequest, GenerateSqlRequest, GenerationRequest, ProgressEntry,
};
use crate::state::AppState;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::response::Response;
use axum::{routing::get, routing::post, Json, Router};
use serde_json::{json, Map, Value};
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/api/sql/generate", post(generate_sql))
        .route("/api/sql/execute", post(execute_sql))
        .route("/api/sql/debug", post(debug_sql))
        .route("/api/status/{request_id}", get(generation_status))
}

/// 业务失败返回 200 + `success=false`，只有请求格式错误与连接故障使用错误状态码。
async fn generate_sql(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    payload: Result<Json<GenerateSqlRequest>, JsonRejection>,
) -> Result<Json<Value>, Response> {
    let Json(payload) = payload.map_err(invalid_json)?;
    let user_id = resolve_caller(&headers);
    let request = GenerationRequest::normalize(&user_id, payload).ok_or_else(|| {
        code_error_response("INVALID_REQUEST", "query must not be empty", None)
    })?;

    match state
        .orchestrator
        .run(&request, &BufferedSink, EVENT_GENERATE_REST)
        .await
    {
        Ok(result) => {
            let mut body = serde_json::to_value(&result).unwrap_or_else(|_| json!({}));
            if let Value::Object(ref mut map) = body {
                map.insert("success".to_string(), json!(true));
            }
            Ok(Json(body))
        }
        Err(err) if err.is_transport() => Err(orchestrator_error_response(&err)),
        Err(err) => Ok(Json(json!({
            "success": false,
            "request_id": request.request_id,
            "error": err.to_payload(),
        }))),
    }
}

async fn execute_sql(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    payload: Result<Json<ExecuteSqlRequest>, JsonRejection>,
) -> Result<Json<Value>, Response> {
    let Json(request) = payload.map_err(invalid_json)?;
    let user_id = resolve_caller(&headers);
    let started = Instant::now();
    let mut metadata = Map::new();
    metadata.insert("user_id".to_string(), json!(user_id));
    metadata.insert("page".to_string(), json!(request.page));
    metadata.insert("page_size".to_string(), json!(request.page_size));

    let outcome = state.executor.execute(&request).await;
    let result = match outcome {
        Ok(result) => result,
        Err(err) => {
            metadata.insert("error".to_string(), json!(err.to_string()));
            state
                .monitor
                .record(EVENT_EXECUTE_SQL, started.elapsed(), false, metadata);
            warn!(
                target: "sqlpilot::audit",
                user_id = %user_id,
                success = false,
                "EXECUTE_SQL 连接失败: {err}"
            );
            return Err(code_error_response(
                "WAREHOUSE_UNAVAILABLE",
                err.to_string(),
                None,
            ));
        }
    };

    if let Some(error) = &result.error {
        metadata.insert("error".to_string(), json!(error));
    }
    state
        .monitor
        .record(EVENT_EXECUTE_SQL, started.elapsed(), result.success, metadata);
    info!(
        target: "sqlpilot::audit",
        user_id = %user_id,
        success = result.success,
        rows = result.row_count,
        error = result.error.as_deref().unwrap_or(""),
        "EXECUTE_SQL {}",
        request.sql.trim()
    );
    let body = serde_json::to_value(&result).unwrap_or_else(|_| json!({ "success": false }));
    Ok(Json(body))
}

/// 与生成接口相同：模型不可达为 503，其余失败为 200 + `success=false`。
async fn debug_sql(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    payload: Result<Json<DebugSqlRequest>, JsonRejection>,
) -> Result<Json<Value>, Response> {
    let Json(request) = payload.map_err(invalid_json)?;
    let sql = request.sql.trim();
    if sql.is_empty() {
        return Err(code_error_response(
            "INVALID_REQUEST",
            "sql must not be empty",
            None,
        ));
    }
    let started = Instant::now();
    let mut metadata = Map::new();
    metadata.insert("user_id".to_string(), json!(resolve_caller(&headers)));
    let outcome = state.orchestrator.debug(sql, request.error.trim()).await;
    if let Err(err) = &outcome {
        metadata.insert("error".to_string(), json!(err.code()));
    }
    state
        .monitor
        .record(EVENT_DEBUG_SQL, started.elapsed(), outcome.is_ok(), metadata);
    match outcome {
        Ok(advice) => {
            let mut body = serde_json::to_value(&advice).unwrap_or_else(|_| json!({}));
            if let Value::Object(ref mut map) = body {
                map.insert("success".to_string(), json!(true));
            }
            Ok(Json(body))
        }
        Err(err) if err.is_transport() => Err(orchestrator_error_response(&err)),
        Err(err) => {
            warn!("SQL 调试失败: {}, {}", err.code(), err.message());
            Ok(Json(json!({
                "success": false,
                "error": err.to_payload(),
            })))
        }
    }
}

/// 未知 ID 返回合成的 pending 条目，从不 404。
async fn generation_status(
    State(state): State<Arc<AppState>>,
    Path(request_id): Path<String>,
) -> Json<ProgressEntry> {
    Json(state.progress.get(request_id.trim()))
}

pub(crate) fn orchestrator_error_response(err: &OrchestratorError) -> Response {
    code_error_response(err.code(), err.message(), err.detail().cloned())
}

pub(crate) fn invalid_json(rejection: JsonRejection) -> Response {
    code_error_response("INVALID_JSON", rejection.body_text(), None)
}
