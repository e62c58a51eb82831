// 导出接口：查询结果与会话聊天记录下载为 Excel/Word/文本附件。
use super::errors::code_error_response;
use super::sql::invalid_json;
use crate::auth::resolve_caller;
use crate::executor::MAX_EXPORT_ROWS;
use crate::export::{
    build_table_document, content_disposition, default_export_name, sanitize_filename,
    sql_export_notes, ExportFormat,
};
use crate::monitor::{EVENT_CHAT_EXPORT, EVENT_EXPORT_SQL};
use crate::schemas::{ChatMessageRecord, ExecutionResult, ExportSqlRequest};
use crate::state::AppState;
use crate::storage::run_blocking;
use crate::validator;
use axum::body::Body;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::Response;
use axum::{routing::get, routing::post, Json, Router};
use chrono::{Local, SecondsFormat};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info};

const DEFAULT_EXPORT_ROWS: usize = 1000;
const CHAT_EXPORT_LIMIT: i64 = 1000;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/api/sql/export", post(export_sql))
        .route("/api/chat/{session_id}/export", get(export_chat))
}

#[derive(Debug, Deserialize)]
struct ChatExportQuery {
    #[serde(default)]
    format: Option<String>,
}

/// 导出前先做与执行相同的校验；结果超出上限时说明行里注明截断。
async fn export_sql(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    payload: Result<Json<ExportSqlRequest>, JsonRejection>,
) -> Result<Response, Response> {
    let Json(request) = payload.map_err(invalid_json)?;
    let format = ExportFormat::parse(request.format.as_deref(), ExportFormat::Excel)
        .filter(|format| *format != ExportFormat::Text)
        .ok_or_else(unsupported_format)?;
    if let Err(err) = validator::validate(&request.sql) {
        return Err(code_error_response(
            "INVALID_SQL",
            format!("invalid SQL: {}", err.reason()),
            None,
        ));
    }
    let limit = match request.limit {
        Some(value) if value > 0 => usize::try_from(value)
            .unwrap_or(MAX_EXPORT_ROWS)
            .min(MAX_EXPORT_ROWS),
        _ => DEFAULT_EXPORT_ROWS,
    };

    let user_id = resolve_caller(&headers);
    let started = Instant::now();
    let mut metadata = Map::new();
    metadata.insert("user_id".to_string(), json!(user_id));
    metadata.insert("format".to_string(), json!(format.extension()));
    metadata.insert("limit".to_string(), json!(limit));

    let result = match state.executor.export(&request.sql, limit).await {
        Ok(result) if result.success => result,
        Ok(result) => {
            let message = result.error.unwrap_or_default();
            metadata.insert("error".to_string(), json!(message));
            state
                .monitor
                .record(EVENT_EXPORT_SQL, started.elapsed(), false, metadata);
            return Err(code_error_response("QUERY_FAILED", message, None));
        }
        Err(err) => {
            error!("导出查询时数据仓库连接失败: {err}");
            metadata.insert("error".to_string(), json!(err.to_string()));
            state
                .monitor
                .record(EVENT_EXPORT_SQL, started.elapsed(), false, metadata);
            return Err(code_error_response(
                "WAREHOUSE_UNAVAILABLE",
                err.to_string(),
                None,
            ));
        }
    };

    let now = Local::now();
    let notes = sql_export_notes(&request.sql, result.row_count, result.has_more, now);
    let document = build_table_document(
        "SQL 查询结果导出",
        &notes,
        &result.columns,
        &stringify_rows(&result),
    );
    let base = request
        .filename
        .as_deref()
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(sanitize_filename)
        .unwrap_or_else(|| default_export_name("sql_result", now));
    let filename = with_extension(&base, format);

    metadata.insert("rows".to_string(), json!(result.row_count));
    state
        .monitor
        .record(EVENT_EXPORT_SQL, started.elapsed(), true, metadata);
    info!(
        target: "sqlpilot::audit",
        user_id = %user_id,
        rows = result.row_count,
        "EXPORT_SQL {}",
        request.sql.trim()
    );
    Ok(attachment(document, &filename, format))
}

/// 默认导出纯文本，每行 `[时间][角色] 内容`。
async fn export_chat(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(session_id): Path<String>,
    Query(query): Query<ChatExportQuery>,
) -> Result<Response, Response> {
    let format = ExportFormat::parse(query.format.as_deref(), ExportFormat::Text)
        .ok_or_else(unsupported_format)?;
    let user_id = resolve_caller(&headers);
    let session_id = session_id.trim().to_string();
    let started = Instant::now();
    let mut metadata = Map::new();
    metadata.insert("user_id".to_string(), json!(user_id));
    metadata.insert("session_id".to_string(), json!(session_id));

    let owner = (user_id.clone(), session_id.clone());
    let loaded = run_blocking(&state.storage, move |storage| {
        storage.load_chat_messages(&owner.0, &owner.1, Some(CHAT_EXPORT_LIMIT), None)
    })
    .await;
    let messages = match loaded {
        Ok(messages) => messages,
        Err(err) => {
            error!("读取聊天记录失败: {err}");
            state
                .monitor
                .record(EVENT_CHAT_EXPORT, started.elapsed(), false, metadata);
            return Err(code_error_response(
                "STORAGE_ERROR",
                "storage is unavailable",
                None,
            ));
        }
    };

    let body = match format {
        ExportFormat::Text => render_chat_text(&messages),
        ExportFormat::Excel | ExportFormat::Word => {
            let notes = vec![
                format!("会话：{session_id}"),
                format!("导出时间：{}", Local::now().format("%Y-%m-%d %H:%M:%S")),
                format!("消息数：{}", messages.len()),
            ];
            let columns = ["时间", "角色", "内容"].map(str::to_string);
            let rows: Vec<Vec<String>> = messages
                .iter()
                .map(|message| {
                    vec![
                        message
                            .created_at
                            .with_timezone(&Local)
                            .format("%Y-%m-%d %H:%M:%S")
                            .to_string(),
                        message.role.clone(),
                        message.content.clone(),
                    ]
                })
                .collect();
            build_table_document("对话导出", &notes, &columns, &rows)
        }
    };
    metadata.insert("messages".to_string(), json!(messages.len()));
    state
        .monitor
        .record(EVENT_CHAT_EXPORT, started.elapsed(), true, metadata);
    let filename = with_extension(&format!("chat_{}", sanitize_filename(&session_id)), format);
    Ok(attachment(body, &filename, format))
}

pub fn render_chat_text(messages: &[ChatMessageRecord]) -> String {
    let mut output = String::new();
    for message in messages {
        output.push_str(&format!(
            "[{}][{}] {}\n",
            message.created_at.to_rfc3339_opts(SecondsFormat::Secs, true),
            message.role,
            message.content
        ));
    }
    output
}

fn stringify_rows(result: &ExecutionResult) -> Vec<Vec<String>> {
    result
        .rows
        .iter()
        .map(|row| {
            row.iter()
                .map(|cell| match cell {
                    Value::Null => String::new(),
                    Value::String(text) => text.clone(),
                    other => other.to_string(),
                })
                .collect()
        })
        .collect()
}

fn with_extension(base: &str, format: ExportFormat) -> String {
    let suffix = format!(".{}", format.extension());
    if base.to_ascii_lowercase().ends_with(&suffix) {
        base.to_string()
    } else {
        format!("{base}{suffix}")
    }
}

fn attachment(body: String, filename: &str, format: ExportFormat) -> Response {
    let mut response = Response::new(Body::from(body));
    *response.status_mut() = StatusCode::OK;
    let headers = response.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static(format.content_type()),
    );
    if let Ok(value) = HeaderValue::from_str(&content_disposition(filename)) {
        headers.insert(header::CONTENT_DISPOSITION, value);
    }
    response
}

fn unsupported_format() -> Response {
    code_error_response("UNSUPPORTED_FORMAT", "unsupported export format", None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    #[test]
    fn chat_text_lines_carry_time_and_role() {
        let messages = vec![
            ChatMessageRecord {
                session_id: "s1".to_string(),
                role: "user".to_string(),
                content: "top stores".to_string(),
                created_at: Utc.with_ymd_and_hms(2024, 5, 6, 7, 8, 9).unwrap(),
            },
            ChatMessageRecord {
                session_id: "s1".to_string(),
                role: "assistant".to_string(),
                content: "SELECT 1".to_string(),
                created_at: Utc.with_ymd_and_hms(2024, 5, 6, 7, 8, 10).unwrap(),
            },
        ];
        assert_eq!(
            render_chat_text(&messages),
            "[2024-05-06T07:08:09Z][user] top stores\n[2024-05-06T07:08:10Z][assistant] SELECT 1\n"
        );
    }

    #[test]
    fn extension_is_not_doubled() {
        assert_eq!(with_extension("report", ExportFormat::Excel), "report.xls");
        assert_eq!(with_extension("report.XLS", ExportFormat::Excel), "report.XLS");
        assert_eq!(with_extension("report.xls", ExportFormat::Word), "report.xls.doc");
    }
}
