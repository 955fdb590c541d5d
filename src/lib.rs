// OTA Updater Library
// 系统更新生命周期代理核心库

// 配置管理模块
pub mod config;

// 错误类型
pub mod error;

// 事件总线
pub mod events;

// 日志系统
pub mod logging;

// Web服务器模块
pub mod server;

// 更新生命周期（清单、下载、校验、安装、调度）
pub mod updater;

// 导出常用类型
pub use config::AppConfig;
pub use error::{IneligibleReason, UpdaterError, UpdaterResult};
pub use events::{EventBus, EventFilter, EventSubscription, UpdateEvent};
pub use server::AppState;
pub use updater::{
    CheckScheduler, CheckTrigger, ControllerOptions, ControllerPorts, PersistentStatus,
    TransientStatus, UpdateAction, UpdateController, UpdateRecord,
};
