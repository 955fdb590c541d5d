//! WebSocket 消息类型定义

use serde::{Deserialize, Serialize};

use crate::events::{EventFilter, UpdateEvent};
use crate::updater::{ControllerStatus, UpdateView};

/// 客户端发送给服务端的消息
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WsClientMessage {
    /// 心跳 Ping
    Ping {
        /// 客户端时间戳（毫秒）
        timestamp: i64,
    },
    /// 请求状态快照
    RequestSnapshot,
    /// 切换订阅过滤器：`all` / `status` / `progress`
    Subscribe { filter: EventFilter },
}

/// 服务端发送给客户端的消息
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WsServerMessage {
    Pong {
        timestamp: i64,
        /// 回显客户端时间戳（用于计算延迟）
        client_timestamp: Option<i64>,
    },
    /// 单个更新事件
    Event { timestamp: i64, event: UpdateEvent },
    /// 状态快照
    Snapshot {
        updates: Vec<UpdateView>,
        status: ControllerStatus,
    },
    Connected {
        connection_id: String,
        timestamp: i64,
    },
    Subscribed { filter: EventFilter },
    Error { code: String, message: String },
}

impl WsServerMessage {
    pub fn pong(client_timestamp: Option<i64>) -> Self {
        Self::Pong {
            timestamp: chrono::Utc::now().timestamp_millis(),
            client_timestamp,
        }
    }

    pub fn connected(connection_id: String) -> Self {
        Self::Connected {
            connection_id,
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }

    pub fn event(event: UpdateEvent) -> Self {
        Self::Event {
            timestamp: chrono::Utc::now().timestamp_millis(),
            event,
        }
    }

    pub fn error(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Error {
            code: code.into(),
            message: message.into(),
        }
    }
}
