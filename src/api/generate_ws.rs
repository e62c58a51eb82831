// WebSocket 生成：一次连接只处理一个请求，按 progress/chunk 推送，以 complete 或 error 收尾后关闭。
use crate::auth::resolve_caller;
use crate::monitor::EVENT_GENERATE_WS;
use crate::orchestrator::FrameSink;
use crate::schemas::{GenerateSqlRequest, GenerationRequest, StreamFrame};
use crate::state::AppState;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::HeaderMap;
use axum::response::Response;
use axum::{routing::get, Router};
use futures::stream::SplitStream;
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};

const WS_FRAME_QUEUE_SIZE: usize = 256;
const WS_MAX_MESSAGE_BYTES: usize = 256 * 1024;
const WS_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/api/sql/generate/ws", get(generate_ws))
}

async fn generate_ws(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let user_id = resolve_caller(&headers);
    ws.max_message_size(WS_MAX_MESSAGE_BYTES)
        .on_upgrade(move |socket| handle_ws(socket, state, user_id))
}

async fn handle_ws(socket: WebSocket, state: Arc<AppState>, user_id: String) {
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (frame_tx, mut frame_rx) = mpsc::channel::<StreamFrame>(WS_FRAME_QUEUE_SIZE);

    let writer = tokio::spawn(async move {
        while let Some(frame) = frame_rx.recv().await {
            let terminal = frame.is_terminal();
            let text = match serde_json::to_string(&frame) {
                Ok(text) => text,
                Err(err) => {
                    warn!("序列化推送帧失败: {err}");
                    continue;
                }
            };
            if ws_sender.send(Message::Text(text.into())).await.is_err() {
                debug!("WebSocket 已断开，停止推送");
                return;
            }
            if terminal {
                break;
            }
        }
        let _ = ws_sender.send(Message::Close(None)).await;
    });

    match read_request(&mut ws_receiver, &user_id).await {
        Ok(request) => {
            // 客户端中途断开时推送静默失败，生成流程仍会走完并落库。
            let sink = FrameSink::new(frame_tx);
            let _ = state
                .orchestrator
                .run(&request, &sink, EVENT_GENERATE_WS)
                .await;
        }
        Err(message) => {
            let _ = frame_tx.send(StreamFrame::Error { message }).await;
        }
    }
    let _ = writer.await;
}

async fn read_request(
    receiver: &mut SplitStream<WebSocket>,
    user_id: &str,
) -> Result<GenerationRequest, String> {
    let first = tokio::time::timeout(WS_REQUEST_TIMEOUT, async {
        while let Some(message) = receiver.next().await {
            match message {
                Ok(Message::Text(text)) => return Some(Ok(text.as_str().to_string())),
                Ok(Message::Binary(_)) => {
                    return Some(Err("binary frames are not supported".to_string()))
                }
                Ok(Message::Close(_)) => return None,
                Ok(_) => continue,
                Err(err) => {
                    debug!("读取 WebSocket 消息失败: {err}");
                    return None;
                }
            }
        }
        None
    })
    .await
    .map_err(|_| "timed out waiting for the generation request".to_string())?;

    let text = first.ok_or_else(|| "connection closed before a request was sent".to_string())??;
    let payload: GenerateSqlRequest =
        serde_json::from_str(&text).map_err(|err| format!("invalid payload: {err}"))?;
    GenerationRequest::normalize(user_id, payload)
        .ok_or_else(|| "query must not be empty".to_string())
}
