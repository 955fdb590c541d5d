// 应用状态

use crate::config::AppConfig;
use crate::updater::UpdateController;
use std::sync::Arc;

/// 应用全局状态
#[derive(Clone)]
pub struct AppState {
    pub controller: UpdateController,
    /// 启动时加载的配置（只读）
    pub config: Arc<AppConfig>,
}

impl AppState {
    pub fn new(controller: UpdateController, config: AppConfig) -> Self {
        Self {
            controller,
            config: Arc::new(config),
        }
    }
}
