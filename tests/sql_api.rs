mod common;

use axum::body::{to_bytes, Body};
use axum::http::{Request, StatusCode};
use axum::Router;
use common::{build_app, API_KEY, LLM_SQL};
use serde_json::{json, Value};
use tower::ServiceExt;

async fn call(router: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = router
        .clone()
        .oneshot(request)
        .await
        .expect("router response");
    let status = response.status();
    let body = to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("read body");
    let payload = if body.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&body).expect("json body")
    };
    (status, payload)
}

fn post_json(path: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(path)
        .header("content-type", "application/json")
        .header("x-user-id", "alice")
        .body(Body::from(body.to_string()))
        .expect("request")
}

fn get(path: &str) -> Request<Body> {
    Request::builder()
        .uri(path)
        .header("x-user-id", "alice")
        .body(Body::empty())
        .expect("request")
}

#[tokio::test]
async fn template_keywords_short_circuit_generation() {
    let app = build_app(|_| {});
    let (status, body) = call(
        &app.router,
        post_json(
            "/api/sql/generate",
            json!({ "query": "最近30天门店新增报表", "request_id": "tpl-1" }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], json!(true));
    assert_eq!(body["source"], json!("template"));
    assert_eq!(body["used_memory"], json!(false));
    assert_eq!(body["template_id"], json!("store_recent_activity"));
    let templates = app.state.templates.list().await.expect("templates");
    assert_eq!(body["sql"], json!(templates[0].sql));
    assert!(app.llm.prompts.lock().is_empty());

    let (_, progress) = call(&app.router, get("/api/status/tpl-1")).await;
    assert_eq!(progress["stage"], json!("completed"));
    assert_eq!(progress["done"], json!(true));
}

#[tokio::test]
async fn model_generation_uses_session_memory_on_follow_up() {
    let app = build_app(|_| {});
    let (_, first) = call(
        &app.router,
        post_json(
            "/api/sql/generate",
            json!({ "query": "list store codes", "session_id": "s1" }),
        ),
    )
    .await;
    assert_eq!(first["source"], json!("llm"));
    assert_eq!(first["sql"], json!(LLM_SQL));
    assert_eq!(first["used_memory"], json!(false));
    assert!(first["request_id"].as_str().is_some_and(|id| !id.is_empty()));

    let (_, second) = call(
        &app.router,
        post_json(
            "/api/sql/generate",
            json!({ "query": "only the northern ones", "session_id": "s1" }),
        ),
    )
    .await;
    assert_eq!(second["used_memory"], json!(true));
    let prompts = app.llm.prompts.lock();
    assert!(prompts[1].contains("1) USER: list store codes"));
    assert!(prompts[1].contains("Table: stores"));

    let (_, sessions) = call(&app.router, get("/api/sessions")).await;
    assert_eq!(sessions["sessions"][0]["session_id"], json!("s1"));
    let (_, history) = call(&app.router, get("/api/sessions/s1")).await;
    let entries = history["entries"].as_array().expect("entries");
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0]["query"], json!("list store codes"));
}

#[tokio::test]
async fn unresolved_intent_returns_hint_instead_of_sql() {
    let app = build_app(|_| {});
    let (status, body) = call(
        &app.router,
        post_json(
            "/api/sql/generate",
            json!({ "query": "daily refund totals", "request_id": "hint-1" }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["source"], json!("assistant_hint"));
    assert_eq!(body["sql"], json!(""));
    assert!(body["reasoning"].as_str().unwrap_or_default().contains("refunds"));
    let (_, progress) = call(&app.router, get("/api/status/hint-1")).await;
    assert_eq!(progress["success"], json!(true));
}

#[tokio::test]
async fn business_failure_is_200_and_transport_failure_is_503() {
    let app = build_app(|_| {});
    let (status, body) = call(
        &app.router,
        post_json(
            "/api/sql/generate",
            json!({ "query": "garbled request", "request_id": "fail-1" }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], json!(false));
    assert_eq!(body["error"]["code"], json!("GENERATION_FAILED"));
    let (_, progress) = call(&app.router, get("/api/status/fail-1")).await;
    assert_eq!(progress["stage"], json!("failed"));

    let (status, body) = call(
        &app.router,
        post_json(
            "/api/sql/generate",
            json!({ "query": "unreachable model", "request_id": "fail-2" }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["ok"], json!(false));
    assert_eq!(body["error"]["code"], json!("TRANSPORT_FAILURE"));
    let (_, progress) = call(&app.router, get("/api/status/fail-2")).await;
    assert_eq!(progress["done"], json!(true));
    assert_eq!(progress["success"], json!(false));

    let (_, events) = call(&app.router, get("/api/monitor/events?event=generate_rest")).await;
    let events = events["events"].as_array().expect("events");
    assert_eq!(events.len(), 2);
    assert!(events.iter().all(|item| item["success"] == json!(false)));
}

#[tokio::test]
async fn malformed_generate_requests_are_400() {
    let app = build_app(|_| {});
    let (status, body) = call(
        &app.router,
        post_json("/api/sql/generate", json!({ "query": "   " })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], json!("INVALID_REQUEST"));

    let request = Request::builder()
        .method("POST")
        .uri("/api/sql/generate")
        .header("content-type", "application/json")
        .body(Body::from("{not json"))
        .expect("request");
    let (status, body) = call(&app.router, request).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], json!("INVALID_JSON"));
}

#[tokio::test]
async fn stacked_statements_are_rejected_without_touching_warehouse() {
    let app = build_app(|_| {});
    let (status, body) = call(
        &app.router,
        post_json(
            "/api/sql/execute",
            json!({ "sql": "SELECT 1 FROM dual; DROP TABLE x;" }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], json!(false));
    let reason = body["error"].as_str().unwrap_or_default();
    assert!(
        reason == "stacked queries are not allowed" || reason == "query contains forbidden keywords",
        "unexpected reason: {reason}"
    );
    assert!(app.warehouse.executed.lock().is_empty());
}

#[tokio::test]
async fn pages_are_bounded_masked_and_disjoint() {
    let app = build_app(|_| {});
    let sql = "SELECT store_code, phone, area FROM stores ORDER BY store_code";
    let (_, first) = call(
        &app.router,
        post_json("/api/sql/execute", json!({ "sql": sql, "page": 1, "page_size": 3 })),
    )
    .await;
    assert_eq!(first["success"], json!(true));
    assert_eq!(first["row_count"], json!(3));
    assert_eq!(first["has_more"], json!(true));
    assert_eq!(
        first["columns"],
        json!(["门店编码(store_code)", "联系电话(phone)", "area"])
    );
    assert_eq!(first["masked_columns"], json!(["联系电话(phone)"]));
    for row in first["rows"].as_array().expect("rows") {
        assert_eq!(row[1], json!("***"));
        assert_eq!(row.as_array().map(Vec::len), Some(3));
    }
    assert_eq!(first["rows"][1][2], json!(null));

    let (_, last) = call(
        &app.router,
        post_json("/api/sql/execute", json!({ "sql": sql, "page": 3, "page_size": 3 })),
    )
    .await;
    assert_eq!(last["row_count"], json!(1));
    assert_eq!(last["has_more"], json!(false));
    assert_eq!(last["rows"][0][0], json!("S007"));

    let (_, second) = call(
        &app.router,
        post_json("/api/sql/execute", json!({ "sql": sql, "page": 2, "page_size": 3 })),
    )
    .await;
    let codes = |page: &Value| -> Vec<Value> {
        page["rows"]
            .as_array()
            .expect("rows")
            .iter()
            .map(|row| row[0].clone())
            .collect()
    };
    let first_codes = codes(&first);
    assert!(codes(&second).iter().all(|code| !first_codes.contains(code)));
}

#[tokio::test]
async fn page_size_is_clamped_to_configured_maximum() {
    let app = build_app(|_| {});
    let (_, body) = call(
        &app.router,
        post_json(
            "/api/sql/execute",
            json!({ "sql": "SELECT * FROM stores", "page": 0, "page_size": 500 }),
        ),
    )
    .await;
    assert_eq!(body["page"], json!(1));
    assert_eq!(body["page_size"], json!(5));
    assert_eq!(body["row_count"], json!(5));
    assert_eq!(body["has_more"], json!(true));
}

#[tokio::test]
async fn huge_page_number_is_rejected_before_the_warehouse() {
    let app = build_app(|_| {});
    let (status, body) = call(
        &app.router,
        post_json(
            "/api/sql/execute",
            json!({ "sql": "SELECT * FROM stores", "page": i64::MAX, "page_size": 3 }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], json!(false));
    assert_eq!(body["error"], json!("page out of range"));
    assert_eq!(body["page_size"], json!(3));
    assert!(app.warehouse.executed.lock().is_empty());
}

#[tokio::test]
async fn empty_result_is_successful() {
    let app = build_app(|_| {});
    let (_, body) = call(
        &app.router,
        post_json(
            "/api/sql/execute",
            json!({ "sql": "SELECT * FROM empty_table", "page_size": 50 }),
        ),
    )
    .await;
    assert_eq!(body["success"], json!(true));
    assert_eq!(body["row_count"], json!(0));
    assert_eq!(body["has_more"], json!(false));
}

#[tokio::test]
async fn engine_errors_are_captured_and_connectivity_is_503() {
    let app = build_app(|_| {});
    let (status, body) = call(
        &app.router,
        post_json("/api/sql/execute", json!({ "sql": "SELECT * FROM missing" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], json!(false));
    assert!(body["error"].as_str().unwrap_or_default().contains("does not exist"));

    let (status, body) = call(
        &app.router,
        post_json("/api/sql/execute", json!({ "sql": "SELECT * FROM offline" })),
    )
    .await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["error"]["code"], json!("WAREHOUSE_UNAVAILABLE"));
    assert_eq!(app.state.monitor.count("execute_sql"), 2);
}

#[tokio::test]
async fn unknown_request_id_polls_as_pending() {
    let app = build_app(|_| {});
    let (status, body) = call(&app.router, get("/api/status/never-seen")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["stage"], json!("pending"));
    assert_eq!(body["done"], json!(false));
    assert_eq!(body["request_id"], json!("never-seen"));
}

#[tokio::test]
async fn api_key_guards_api_routes_only() {
    let app = build_app(|config| config.security.api_key = Some(API_KEY.to_string()));
    let (status, body) = call(&app.router, get("/api/templates")).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"]["code"], json!("UNAUTHORIZED"));

    let request = Request::builder()
        .uri("/api/templates")
        .header("x-api-key", API_KEY)
        .body(Body::empty())
        .expect("request");
    let (status, body) = call(&app.router, request).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["templates"][0]["id"], json!("store_recent_activity"));

    let request = Request::builder()
        .uri(format!("/api/templates?api_key={API_KEY}"))
        .body(Body::empty())
        .expect("request");
    let (status, _) = call(&app.router, request).await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = call(&app.router, get("/health")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], json!("ok"));
}
