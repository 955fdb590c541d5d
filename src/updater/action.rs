// 用户操作
//
// 每个更新当前可执行的主操作由状态决定，与显示文本无关。

use serde::{Deserialize, Serialize};
use std::str::FromStr;

use super::record::{PersistentStatus, TransientStatus, UpdateRecord};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateAction {
    Download,
    Pause,
    Resume,
    Install,
    Info,
    Delete,
    CancelInstallation,
    Reboot,
    CheckUpdates,
}

impl UpdateAction {
    /// 是否需要指定更新 id
    pub fn needs_update_id(&self) -> bool {
        !matches!(
            self,
            UpdateAction::CheckUpdates | UpdateAction::CancelInstallation | UpdateAction::Reboot
        )
    }
}

impl FromStr for UpdateAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        serde_json::from_value(serde_json::Value::String(s.to_string()))
            .map_err(|_| format!("未知操作: {}", s))
    }
}

/// 计算主操作所需的全局状态
#[derive(Debug, Clone, Copy, Default)]
pub struct ActionContext {
    /// 是否有任意下载/校验/安装在进行
    pub busy: bool,
    /// 当前安装是否为可取消的无缝安装
    pub installing_seamless: bool,
    /// 该更新是否已安装完等待重启
    pub waiting_for_reboot: bool,
    /// 该更新能否在本设备安装
    pub can_install: bool,
}

/// 某个更新当前的主操作
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PrimaryAction {
    pub action: UpdateAction,
    pub enabled: bool,
    /// 是否可以删除本地文件
    pub can_delete: bool,
}

/// 根据记录状态决定主操作
pub fn primary_action(record: &UpdateRecord, ctx: &ActionContext) -> PrimaryAction {
    let transient = record.transient_status;
    let active = record.persistent_status == PersistentStatus::Incomplete
        || matches!(
            transient,
            TransientStatus::Starting | TransientStatus::Installing | TransientStatus::Verifying
        );

    let (action, enabled) = if active {
        match transient {
            TransientStatus::Starting | TransientStatus::Downloading => (UpdateAction::Pause, true),
            TransientStatus::Installing => {
                (UpdateAction::CancelInstallation, ctx.installing_seamless)
            }
            TransientStatus::Verifying => (UpdateAction::Install, false),
            _ => (UpdateAction::Resume, !ctx.busy),
        }
    } else if ctx.waiting_for_reboot || transient == TransientStatus::WaitingReboot {
        (UpdateAction::Reboot, true)
    } else if record.persistent_status == PersistentStatus::Verified {
        if ctx.can_install {
            (UpdateAction::Install, !ctx.busy)
        } else {
            (UpdateAction::Delete, !ctx.busy)
        }
    } else if !ctx.can_install {
        (UpdateAction::Info, !ctx.busy)
    } else {
        (UpdateAction::Download, !ctx.busy)
    };

    PrimaryAction {
        action,
        enabled,
        can_delete: can_delete(record),
    }
}

/// 有本地文件且不在下载/校验/安装中
pub fn can_delete(record: &UpdateRecord) -> bool {
    let has_footprint =
        record.persistent_status != PersistentStatus::Unknown || record.bytes_downloaded > 0;
    has_footprint
        && !matches!(
            record.transient_status,
            TransientStatus::Starting
                | TransientStatus::Downloading
                | TransientStatus::Verifying
                | TransientStatus::Installing
        )
}
