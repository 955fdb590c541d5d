//! WebSocket 路由处理器

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::message::{WsClientMessage, WsServerMessage};
use crate::events::{EventFilter, EventSubscription};
use crate::server::AppState;

/// 升级 HTTP 连接为 WebSocket，推送更新事件
pub async fn handle_websocket(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let connection_id = Uuid::new_v4().to_string();
    info!("新的 WebSocket 连接: {}", connection_id);

    let (mut sender, mut receiver) = socket.split();
    if !send_message(&mut sender, &WsServerMessage::connected(connection_id.clone())).await {
        error!("发送连接成功消息失败");
        return;
    }

    let mut subscription = state.controller.subscribe(EventFilter::All);

    loop {
        tokio::select! {
            event = subscription.recv() => {
                let Some(event) = event else { break };
                if !send_message(&mut sender, &WsServerMessage::event(event)).await {
                    break;
                }
            }
            message = receiver.next() => {
                let text = match message {
                    Some(Ok(Message::Text(text))) => text,
                    Some(Ok(Message::Binary(data))) => match String::from_utf8(data) {
                        Ok(text) => text,
                        Err(_) => continue,
                    },
                    Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => {
                        debug!("收到心跳: {}", connection_id);
                        continue;
                    }
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                };

                let reply = handle_client_message(&state, &mut subscription, &connection_id, &text).await;
                if !send_message(&mut sender, &reply).await {
                    break;
                }
            }
        }
    }

    info!("WebSocket 连接已关闭: {}", connection_id);
}

async fn send_message(
    sender: &mut SplitSink<WebSocket, Message>,
    message: &WsServerMessage,
) -> bool {
    match serde_json::to_string(message) {
        Ok(json) => sender.send(Message::Text(json)).await.is_ok(),
        Err(e) => {
            error!("序列化消息失败: {}", e);
            true
        }
    }
}

/// 处理客户端消息
async fn handle_client_message(
    state: &AppState,
    subscription: &mut EventSubscription,
    connection_id: &str,
    text: &str,
) -> WsServerMessage {
    match serde_json::from_str::<WsClientMessage>(text) {
        Ok(WsClientMessage::Ping { timestamp }) => WsServerMessage::pong(Some(timestamp)),
        Ok(WsClientMessage::RequestSnapshot) => {
            debug!("收到状态快照请求: {}", connection_id);
            WsServerMessage::Snapshot {
                updates: state.controller.views().await,
                status: state.controller.status().await,
            }
        }
        Ok(WsClientMessage::Subscribe { filter }) => {
            debug!("切换订阅: {} -> {:?}", connection_id, filter);
            *subscription = state.controller.subscribe(filter);
            WsServerMessage::Subscribed { filter }
        }
        Err(e) => {
            warn!("解析客户端消息失败: {} - {}", connection_id, e);
            WsServerMessage::error("PARSE_ERROR", format!("消息解析失败: {}", e))
        }
    }
}
