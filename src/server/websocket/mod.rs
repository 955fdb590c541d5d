//! WebSocket 事件推送

pub mod handler;
pub mod message;

pub use handler::handle_websocket;
pub use message::{WsClientMessage, WsServerMessage};
