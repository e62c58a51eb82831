// API 路由汇总入口，按领域拆分以保持结构清晰。
pub mod catalog;
pub mod errors;
pub mod export;
pub mod generate_ws;
mod middleware;
pub mod sql;

use crate::state::AppState;
use axum::middleware::{from_fn, from_fn_with_state};
use axum::Router;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

/// 完整的应用路由，含鉴权、CORS、请求日志与 panic 兜底。
pub fn build_router(state: Arc<AppState>) -> Router {
    let cors = middleware::build_cors(&state.config);
    Router::new()
        .merge(sql::router())
        .merge(generate_ws::router())
        .merge(catalog::router())
        .merge(export::router())
        .layer(from_fn_with_state(state.clone(), middleware::api_key_guard))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .layer(from_fn(middleware::panic_guard))
        .with_state(state)
}
