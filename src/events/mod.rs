//! 事件模块
//!
//! - `types.rs`: 更新事件类型和订阅过滤器
//! - `bus.rs`: 发布/订阅总线
//! - `throttle.rs`: 进度事件节流

mod bus;
mod throttle;
mod types;

pub use bus::*;
pub use throttle::*;
pub use types::*;
