// 设备策略：电量、覆盖挂载、安装拓扑、启动 ID

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, info};

use super::record::PackageType;
use crate::config::MountDetector;

/// 电池状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BatteryState {
    pub percent: u8,
    pub charging: bool,
}

/// 设备安装拓扑，启动时确定一次
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstallTopology {
    /// A/B 双分区，后台安装
    Seamless,
    /// 重启进入恢复模式安装
    Recovery,
    Unsupported,
}

impl InstallTopology {
    /// 该拓扑能否安装此类型的包（未声明类型的包由拓扑决定）
    pub fn accepts(&self, package: Option<PackageType>) -> bool {
        matches!(
            (self, package),
            (InstallTopology::Seamless, None | Some(PackageType::Ab))
                | (InstallTopology::Recovery, None | Some(PackageType::Legacy))
        )
    }
}

/// 设备策略接口
#[async_trait]
pub trait DevicePolicy: Send + Sync {
    /// 电池状态，没有电池（如开发板）时返回 None
    async fn battery(&self) -> Option<BatteryState>;

    async fn is_overlay_mounted(&self, path: &Path) -> bool;

    async fn detect_topology(&self) -> InstallTopology;

    /// 当前启动的唯一 ID，用于判断是否已经重启
    async fn boot_id(&self) -> Option<String>;
}

/// 基于 sysfs/procfs 的 Linux 实现
#[derive(Debug, Clone)]
pub struct LinuxDevicePolicy {
    pub power_supply_dir: PathBuf,
    pub mounts_file: PathBuf,
    pub cmdline_file: PathBuf,
    pub boot_id_file: PathBuf,
    pub recovery_dir: PathBuf,
}

impl Default for LinuxDevicePolicy {
    fn default() -> Self {
        Self {
            power_supply_dir: PathBuf::from("/sys/class/power_supply"),
            mounts_file: PathBuf::from("/proc/mounts"),
            cmdline_file: PathBuf::from("/proc/cmdline"),
            boot_id_file: PathBuf::from("/proc/sys/kernel/random/boot_id"),
            recovery_dir: PathBuf::from("/cache/recovery"),
        }
    }
}

async fn read_trimmed(path: &Path) -> Option<String> {
    fs::read_to_string(path)
        .await
        .ok()
        .map(|s| s.trim().to_string())
}

#[async_trait]
impl DevicePolicy for LinuxDevicePolicy {
    async fn battery(&self) -> Option<BatteryState> {
        let mut entries = fs::read_dir(&self.power_supply_dir).await.ok()?;

        while let Ok(Some(entry)) = entries.next_entry().await {
            let dir = entry.path();
            if read_trimmed(&dir.join("type")).await.as_deref() != Some("Battery") {
                continue;
            }
            if read_trimmed(&dir.join("present")).await.as_deref() == Some("0") {
                continue;
            }
            let Some(percent) = read_trimmed(&dir.join("capacity"))
                .await
                .and_then(|s| s.parse::<u8>().ok())
            else {
                continue;
            };
            let status = read_trimmed(&dir.join("status")).await.unwrap_or_default();
            let charging = matches!(status.as_str(), "Charging" | "Full");

            debug!("电池状态: {:?} {}% {}", dir, percent, status);
            return Some(BatteryState {
                percent: percent.min(100),
                charging,
            });
        }

        None
    }

    async fn is_overlay_mounted(&self, path: &Path) -> bool {
        match fs::read_to_string(&self.mounts_file).await {
            Ok(content) => MountDetector::is_mounted_in(&MountDetector::parse_mounts(&content), path),
            Err(_) => false,
        }
    }

    async fn detect_topology(&self) -> InstallTopology {
        let cmdline = read_trimmed(&self.cmdline_file).await.unwrap_or_default();
        let topology = if cmdline.split_whitespace().any(|arg| {
            arg.starts_with("androidboot.slot_suffix=")
                || arg.starts_with("androidboot.slot=")
                || arg.starts_with("rauc.slot=")
        }) {
            InstallTopology::Seamless
        } else if fs::metadata(&self.recovery_dir).await.is_ok() {
            InstallTopology::Recovery
        } else {
            InstallTopology::Unsupported
        };

        info!("探测到安装拓扑: {:?}", topology);
        topology
    }

    async fn boot_id(&self) -> Option<String> {
        read_trimmed(&self.boot_id_file).await.filter(|s| !s.is_empty())
    }
}
