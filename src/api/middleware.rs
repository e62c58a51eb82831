// 通用中间件：API Key 校验、panic 兜底与 CORS 规则。
use super::errors::code_error_response;
use crate::auth;
use crate::config::Config;
use crate::state::AppState;
use axum::body::Body;
use axum::extract::State;
use axum::http::{Method, Request, StatusCode};
use axum::middleware::Next;
use axum::response::Response;
use futures::FutureExt;
use std::any::Any as StdAny;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tower_http::cors::{AllowHeaders, AllowMethods, AllowOrigin, Any, CorsLayer};
use tracing::{debug, error};

/// 未配置 API Key 时放行所有请求。
pub(crate) async fn api_key_guard(
    State(state): State<Arc<AppState>>,
    request: Request<Body>,
    next: Next,
) -> Result<Response, StatusCode> {
    if request.method() == Method::OPTIONS {
        return Ok(next.run(request).await);
    }
    if !auth::is_protected_path(request.uri().path()) {
        return Ok(next.run(request).await);
    }
    let Some(expected) = state.config.api_key() else {
        return Ok(next.run(request).await);
    };

    let provided = auth::extract_api_key(request.headers())
        .or_else(|| auth::extract_api_key_from_query(request.uri().query()));
    if provided.as_deref() == Some(expected.as_str()) {
        return Ok(next.run(request).await);
    }
    debug!("API Key 校验失败: {}", request.uri().path());
    Ok(code_error_response(
        "UNAUTHORIZED",
        "missing or invalid API key",
        None,
    ))
}

pub(crate) async fn panic_guard(request: Request<Body>, next: Next) -> Result<Response, StatusCode> {
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let result = AssertUnwindSafe(next.run(request)).catch_unwind().await;
    match result {
        Ok(response) => Ok(response),
        Err(panic) => {
            let detail = panic_message(panic.as_ref());
            error!("panic while handling {method} {path}: {detail}");
            Ok(code_error_response(
                "INTERNAL_ERROR",
                "internal server error",
                None,
            ))
        }
    }
}

fn panic_message(panic: &(dyn StdAny + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        return message.to_string();
    }
    if let Some(message) = panic.downcast_ref::<String>() {
        return message.clone();
    }
    "unknown panic".to_string()
}

pub(crate) fn build_cors(config: &Config) -> CorsLayer {
    let mut cors = CorsLayer::new();

    match config.cors.allow_origins.as_deref() {
        Some(origins) if origins.iter().any(|value| value == "*") => {
            cors = cors.allow_origin(Any);
        }
        Some(origins) => {
            let values = origins
                .iter()
                .filter_map(|value| value.parse().ok())
                .collect::<Vec<_>>();
            if !values.is_empty() {
                cors = cors.allow_origin(AllowOrigin::list(values));
            }
        }
        None => {
            cors = cors.allow_origin(Any);
        }
    }

    match config.cors.allow_methods.as_deref() {
        Some(methods) if methods.iter().any(|value| value == "*") => {
            cors = cors.allow_methods(Any);
        }
        Some(methods) => {
            let values = methods
                .iter()
                .filter_map(|value| value.parse().ok())
                .collect::<Vec<_>>();
            if !values.is_empty() {
                cors = cors.allow_methods(AllowMethods::list(values));
            }
        }
        None => {
            cors = cors.allow_methods(Any);
        }
    }

    match config.cors.allow_headers.as_deref() {
        Some(headers) if headers.iter().any(|value| value == "*") => {
            cors = cors.allow_headers(Any);
        }
        Some(headers) => {
            let values = headers
                .iter()
                .filter_map(|value| value.parse().ok())
                .collect::<Vec<_>>();
            if !values.is_empty() {
                cors = cors.allow_headers(AllowHeaders::list(values));
            }
        }
        None => {
            cors = cors.allow_headers(Any);
        }
    }

    // 任一项为通配时不能携带凭据，否则 tower-http 会直接 panic。
    let has_wildcard = [
        &config.cors.allow_origins,
        &config.cors.allow_methods,
        &config.cors.allow_headers,
    ]
    .iter()
    .any(|values| {
        values
            .as_deref()
            .map_or(true, |items| items.iter().any(|value| value == "*"))
    });
    if config.cors.allow_credentials.unwrap_or(false) && !has_wildcard {
        cors = cors.allow_credentials(true);
    }

    cors
}
