use anyhow::Context;
use ota_updater::{
    config::{AppConfig, JsonFileConfigStore, LogConfig},
    logging, server,
    updater::{
        CheckScheduler, CommandInstaller, ControllerOptions, ControllerPorts,
        HttpFetchTransport, LinuxDevicePolicy, UpdateController,
    },
    AppState,
};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

const CONFIG_PATH: &str = "config/app.toml";

/// 在完整加载配置之前先读取日志配置
async fn load_log_config() -> LogConfig {
    if let Ok(content) = tokio::fs::read_to_string(CONFIG_PATH).await {
        if let Ok(config) = toml::from_str::<toml::Value>(&content) {
            if let Some(log_table) = config.get("log") {
                if let Ok(log_config) = log_table.clone().try_into::<LogConfig>() {
                    return log_config;
                }
            }
        }
    }

    LogConfig::default()
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let log_config = load_log_config().await;
    let _log_guard = logging::init_logging(&log_config);

    info!("OTA Updater v{} 启动中...", env!("CARGO_PKG_VERSION"));

    let config = AppConfig::load_or_default(CONFIG_PATH).await;

    let config_store = JsonFileConfigStore::open(config.updater.preferences_path())
        .context("打开偏好设置失败")?;
    let ports = ControllerPorts {
        transport: Arc::new(HttpFetchTransport::new()?),
        installer: Arc::new(CommandInstaller::new(config.install.clone())),
        device: Arc::new(LinuxDevicePolicy::default()),
        config_store: Arc::new(config_store),
    };

    let controller = UpdateController::new(ControllerOptions::from_config(&config), ports).await;
    // 没有缓存时由调度器负责首次检查
    let cache_loaded = controller.restore().await.context("恢复更新状态失败")?;
    info!("更新控制器初始化完成: 清单缓存={}", cache_loaded);

    let shutdown = CancellationToken::new();
    let scheduler = CheckScheduler::new(controller.clone(), config.check.to_backoff_policy())
        .with_jitter(config.check.jitter_percent);
    let scheduler_handle = tokio::spawn(scheduler.run(shutdown.clone()));

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let app = server::build_router(AppState::new(controller.clone(), config));

    info!("服务器启动在: http://{}", addr);
    info!("API 基础路径: http://{}/api/v1", addr);
    info!("WebSocket: ws://{}/api/v1/ws", addr);
    info!("健康检查: http://{}/health", addr);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("绑定地址失败: {}", addr))?;

    let server = axum::serve(listener, app);

    tokio::select! {
        result = server => {
            if let Err(e) = result {
                error!("服务器错误: {}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("收到 Ctrl+C，开始优雅关闭...");
        }
    }

    shutdown.cancel();
    if let Err(e) = scheduler_handle.await {
        warn!("调度器退出异常: {}", e);
    }
    controller.shutdown().await;

    info!("OTA Updater 已退出");
    Ok(())
}
