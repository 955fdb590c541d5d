// 配置管理模块

pub mod mount_detector;
pub mod store;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;

pub use mount_detector::{MountDetector, MountPoint};
pub use store::{ConfigStore, JsonFileConfigStore, MemoryConfigStore, Preferences, RebootMarker};

use crate::updater::BackoffPolicy;

/// 应用配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// 服务器配置
    pub server: ServerConfig,
    /// 更新代理配置
    pub updater: UpdaterConfig,
    /// 检查更新配置
    #[serde(default)]
    pub check: CheckConfig,
    /// 安装配置
    #[serde(default)]
    pub install: InstallConfig,
    /// 🔥 日志配置
    #[serde(default)]
    pub log: LogConfig,
}

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// 是否启用日志文件持久化
    #[serde(default = "default_log_enabled")]
    pub enabled: bool,
    /// 日志文件保存目录
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
    /// 日志保留天数（默认 7 天）
    #[serde(default = "default_log_retention_days")]
    pub retention_days: u32,
    /// 日志级别（默认 info）
    #[serde(default = "default_log_level")]
    pub level: String,
    /// 单个日志文件最大大小（字节，默认 20MB）
    #[serde(default = "default_log_max_file_size")]
    pub max_file_size: u64,
}

fn default_log_enabled() -> bool {
    true
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("logs")
}

fn default_log_retention_days() -> u32 {
    7
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_max_file_size() -> u64 {
    20 * 1024 * 1024
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: default_log_enabled(),
            log_dir: default_log_dir(),
            retention_days: default_log_retention_days(),
            level: default_log_level(),
            max_file_size: default_log_max_file_size(),
        }
    }
}

/// 服务器配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// 监听地址
    pub host: String,
    /// 监听端口
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 18686,
        }
    }
}

/// 更新代理配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdaterConfig {
    /// 更新清单地址（为空时无法检查更新）
    #[serde(default)]
    pub manifest_url: String,
    /// 更新包下载目录
    pub download_dir: PathBuf,
    /// 数据目录（清单缓存、偏好设置）
    pub data_dir: PathBuf,
    /// 当前运行系统的构建时间（unix 秒），只有更新的包才可安装
    #[serde(default)]
    pub build_timestamp: i64,
    /// 允许安装不比当前系统新的更新包
    #[serde(default)]
    pub allow_downgrade: bool,
    /// 进度事件最小间隔（毫秒）
    #[serde(default = "default_progress_interval_ms")]
    pub progress_interval_ms: u64,
}

fn default_progress_interval_ms() -> u64 {
    500
}

impl Default for UpdaterConfig {
    fn default() -> Self {
        Self {
            manifest_url: String::new(),
            download_dir: PathBuf::from("data/updates"),
            data_dir: PathBuf::from("data"),
            build_timestamp: 0,
            allow_downgrade: false,
            progress_interval_ms: default_progress_interval_ms(),
        }
    }
}

impl UpdaterConfig {
    /// 最近一次成功获取的清单缓存
    pub fn cached_manifest_path(&self) -> PathBuf {
        self.data_dir.join("updates.json")
    }

    /// 偏好设置文件
    pub fn preferences_path(&self) -> PathBuf {
        self.data_dir.join("preferences.json")
    }

    pub fn progress_interval(&self) -> Duration {
        Duration::from_millis(self.progress_interval_ms)
    }
}

/// 自动检查更新间隔
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckInterval {
    Never,
    Daily,
    Weekly,
    Monthly,
}

impl CheckInterval {
    /// 对应的时长，`Never` 返回 None
    pub fn as_duration(&self) -> Option<Duration> {
        const DAY: u64 = 24 * 60 * 60;
        match self {
            CheckInterval::Never => None,
            CheckInterval::Daily => Some(Duration::from_secs(DAY)),
            CheckInterval::Weekly => Some(Duration::from_secs(7 * DAY)),
            CheckInterval::Monthly => Some(Duration::from_secs(30 * DAY)),
        }
    }

    /// 偏好设置中保存的序号（0..=3）
    pub fn index(&self) -> u8 {
        match self {
            CheckInterval::Never => 0,
            CheckInterval::Daily => 1,
            CheckInterval::Weekly => 2,
            CheckInterval::Monthly => 3,
        }
    }

    pub fn from_index(index: u8) -> Option<Self> {
        match index {
            0 => Some(CheckInterval::Never),
            1 => Some(CheckInterval::Daily),
            2 => Some(CheckInterval::Weekly),
            3 => Some(CheckInterval::Monthly),
            _ => None,
        }
    }
}

/// 检查更新配置
///
/// 后台检查失败时按指数退避重试，超过最大次数后回到正常间隔。
/// 手动检查从不自动重试。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckConfig {
    /// 默认检查间隔（可被偏好设置覆盖）
    #[serde(default = "default_check_interval")]
    pub interval: CheckInterval,
    /// 首次重试等待（秒）
    #[serde(default = "default_backoff_initial_secs")]
    pub backoff_initial_secs: u64,
    /// 退避倍数
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
    /// 单次等待上限（秒）
    #[serde(default = "default_backoff_max_secs")]
    pub backoff_max_secs: u64,
    /// 最大重试次数
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// 正常间隔的随机抖动比例
    #[serde(default = "default_jitter_percent")]
    pub jitter_percent: f64,
}

fn default_check_interval() -> CheckInterval {
    CheckInterval::Weekly
}

fn default_backoff_initial_secs() -> u64 {
    60
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_backoff_max_secs() -> u64 {
    3600
}

fn default_max_retries() -> u32 {
    5
}

fn default_jitter_percent() -> f64 {
    0.1
}

impl Default for CheckConfig {
    fn default() -> Self {
        Self {
            interval: default_check_interval(),
            backoff_initial_secs: default_backoff_initial_secs(),
            backoff_multiplier: default_backoff_multiplier(),
            backoff_max_secs: default_backoff_max_secs(),
            max_retries: default_max_retries(),
            jitter_percent: default_jitter_percent(),
        }
    }
}

impl CheckConfig {
    /// 转换为退避策略
    pub fn to_backoff_policy(&self) -> BackoffPolicy {
        BackoffPolicy {
            initial: Duration::from_secs(self.backoff_initial_secs),
            multiplier: self.backoff_multiplier,
            max: Duration::from_secs(self.backoff_max_secs),
            max_retries: self.max_retries,
        }
    }
}

/// 安装拓扑配置（auto 表示启动时探测设备）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TopologySetting {
    Auto,
    Seamless,
    Recovery,
    Unsupported,
}

/// 安装配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstallConfig {
    #[serde(default = "default_topology")]
    pub topology: TopologySetting,
    /// 充电时允许安装的最低电量
    #[serde(default = "default_battery_charging")]
    pub battery_ok_percentage_charging: u8,
    /// 未充电时允许安装的最低电量
    #[serde(default = "default_battery_discharging")]
    pub battery_ok_percentage_discharging: u8,
    /// 存在时禁止安装的覆盖挂载点
    #[serde(default = "default_overlay_mount_path")]
    pub overlay_mount_path: PathBuf,
    /// 恢复模式安装前复制更新包的目录（为空时直接使用下载文件）
    #[serde(default)]
    pub recovery_staging_dir: Option<PathBuf>,
    /// 无缝安装命令，`{file}` 替换为更新包路径
    #[serde(default)]
    pub seamless_command: Vec<String>,
    /// 取消无缝安装命令
    #[serde(default)]
    pub cancel_command: Vec<String>,
    /// 恢复模式安装命令，`{file}` 替换为更新包路径
    #[serde(default)]
    pub recovery_command: Vec<String>,
    /// 重启命令
    #[serde(default = "default_reboot_command")]
    pub reboot_command: Vec<String>,
}

fn default_topology() -> TopologySetting {
    TopologySetting::Auto
}

fn default_battery_charging() -> u8 {
    20
}

fn default_battery_discharging() -> u8 {
    30
}

fn default_overlay_mount_path() -> PathBuf {
    PathBuf::from("/mnt/scratch")
}

fn default_reboot_command() -> Vec<String> {
    vec!["reboot".to_string()]
}

impl Default for InstallConfig {
    fn default() -> Self {
        Self {
            topology: default_topology(),
            battery_ok_percentage_charging: default_battery_charging(),
            battery_ok_percentage_discharging: default_battery_discharging(),
            overlay_mount_path: default_overlay_mount_path(),
            recovery_staging_dir: None,
            seamless_command: Vec::new(),
            cancel_command: Vec::new(),
            recovery_command: Vec::new(),
            reboot_command: default_reboot_command(),
        }
    }
}

impl InstallConfig {
    /// 按充电状态返回所需最低电量
    pub fn required_battery(&self, charging: bool) -> u8 {
        if charging {
            self.battery_ok_percentage_charging
        } else {
            self.battery_ok_percentage_discharging
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            updater: UpdaterConfig::default(),
            check: CheckConfig::default(),
            install: InstallConfig::default(),
            log: LogConfig::default(),
        }
    }
}

impl AppConfig {
    /// 从文件加载配置
    pub async fn load_from_file(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path)
            .await
            .context("Failed to read config file")?;

        let config: AppConfig = toml::from_str(&content).context("Failed to parse config file")?;
        config.validate().context("配置文件验证失败")?;

        Ok(config)
    }

    /// 检查配置取值范围
    pub fn validate(&self) -> Result<()> {
        let url = self.updater.manifest_url.trim();
        if !url.is_empty() && !(url.starts_with("http://") || url.starts_with("https://")) {
            anyhow::bail!("清单地址必须是 http(s) URL: {}", url);
        }
        if self.install.battery_ok_percentage_charging > 100
            || self.install.battery_ok_percentage_discharging > 100
        {
            anyhow::bail!("电量阈值必须在 0-100 之间");
        }
        if self.check.backoff_multiplier < 1.0 {
            anyhow::bail!("退避倍数不能小于 1");
        }
        Ok(())
    }

    /// 保存配置到文件（先写临时文件再重命名）
    pub async fn save_to_file(&self, path: &str) -> Result<()> {
        self.validate().context("保存配置失败")?;

        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;

        if let Some(parent) = Path::new(path).parent() {
            fs::create_dir_all(parent)
                .await
                .context("Failed to create config directory")?;
        }

        let temp_path = format!("{}.tmp", path);
        fs::write(&temp_path, content)
            .await
            .context("Failed to write config file")?;
        fs::rename(&temp_path, path)
            .await
            .context("Failed to replace config file")?;

        tracing::info!("✓ 配置已保存: {}", path);
        Ok(())
    }

    /// 加载或创建默认配置
    pub async fn load_or_default(path: &str) -> Self {
        match Self::load_from_file(path).await {
            Ok(config) => {
                tracing::info!("配置文件加载成功: {}", path);
                config
            }
            Err(e) => {
                tracing::warn!("配置文件加载失败，使用默认配置: {:#}", e);
                let default_config = Self::default();

                if let Err(e) = default_config.save_to_file(path).await {
                    tracing::error!("保存默认配置失败: {:#}", e);
                }

                default_config
            }
        }
    }
}
