//! 更新代理错误类型
//!
//! 失败分为两类：
//! - 下载/校验/安装过程中的失败：只降级单个更新的状态，并通过事件通知观察者
//! - 准入控制和安装条件不满足：同步返回给调用方

use serde::Serialize;
use std::path::PathBuf;
use thiserror::Error;

use crate::updater::TransientStatus;

/// 不满足安装条件的具体原因
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum IneligibleReason {
    /// 更新包尚未通过校验
    NotVerified,
    /// 当前设备拓扑不支持该更新包（或版本不比当前系统新）
    UnsupportedPackage,
    /// 电量不足
    LowBattery { percent: u8, required: u8 },
    /// 存在冲突的临时文件系统覆盖挂载
    OverlayMounted { path: PathBuf },
}

impl std::fmt::Display for IneligibleReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IneligibleReason::NotVerified => write!(f, "更新包尚未校验"),
            IneligibleReason::UnsupportedPackage => write!(f, "当前设备无法安装该更新包"),
            IneligibleReason::LowBattery { percent, required } => {
                write!(f, "电量不足: {}% (至少需要 {}%)", percent, required)
            }
            IneligibleReason::OverlayMounted { path } => {
                write!(f, "检测到覆盖挂载: {}", path.display())
            }
        }
    }
}

/// 更新代理错误
#[derive(Debug, Error)]
pub enum UpdaterError {
    /// 下载过程中的网络/IO 错误，可通过手动恢复重试
    #[error("下载传输失败: {0}")]
    TransportFailure(String),

    /// 校验和不匹配，本地文件已丢弃
    #[error("校验和不匹配: 期望 {expected}, 实际 {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    /// 准入控制拒绝：已有下载/校验/安装在进行中
    #[error("已有任务在进行中: {0}")]
    AlreadyBusy(String),

    /// 不满足安装条件
    #[error("不满足安装条件: {0}")]
    InstallNotEligible(IneligibleReason),

    /// 外部安装器报告失败
    #[error("安装器失败: {0}")]
    InstallerFailure(String),

    /// 远端清单数据无效
    #[error("更新清单解析失败: {0}")]
    ManifestParseFailure(String),

    /// 更新不存在
    #[error("更新不存在: {0}")]
    UnknownUpdate(String),

    /// 操作与当前状态不符
    #[error("更新 {id} 当前状态为 {status:?}，无法执行该操作")]
    InvalidState { id: String, status: TransientStatus },

    /// 安装已交给恢复模式，无法取消
    #[error("当前安装无法取消")]
    InstallNotCancellable,

    /// 配置读写失败
    #[error("配置错误: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl UpdaterError {
    /// API 错误码（0 保留给成功）
    pub fn code(&self) -> i32 {
        match self {
            UpdaterError::TransportFailure(_) => 1001,
            UpdaterError::ChecksumMismatch { .. } => 1002,
            UpdaterError::AlreadyBusy(_) => 1003,
            UpdaterError::InstallNotEligible(_) => 1004,
            UpdaterError::InstallerFailure(_) => 1005,
            UpdaterError::ManifestParseFailure(_) => 1006,
            UpdaterError::UnknownUpdate(_) => 1007,
            UpdaterError::InvalidState { .. } => 1008,
            UpdaterError::InstallNotCancellable => 1009,
            UpdaterError::Config(_) => 1010,
            UpdaterError::Io(_) => 1011,
        }
    }

    /// 是否为调用方可以直接处理的同步拒绝（而非内部故障）
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            UpdaterError::AlreadyBusy(_)
                | UpdaterError::InstallNotEligible(_)
                | UpdaterError::UnknownUpdate(_)
                | UpdaterError::InvalidState { .. }
                | UpdaterError::InstallNotCancellable
        )
    }
}

pub type UpdaterResult<T> = std::result::Result<T, UpdaterError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes_are_distinct() {
        let errors = vec![
            UpdaterError::TransportFailure("x".into()),
            UpdaterError::ChecksumMismatch {
                expected: "a".into(),
                actual: "b".into(),
            },
            UpdaterError::AlreadyBusy("x".into()),
            UpdaterError::InstallNotEligible(IneligibleReason::NotVerified),
            UpdaterError::InstallerFailure("x".into()),
            UpdaterError::ManifestParseFailure("x".into()),
            UpdaterError::UnknownUpdate("x".into()),
            UpdaterError::InstallNotCancellable,
            UpdaterError::Config("x".into()),
        ];
        let mut codes: Vec<i32> = errors.iter().map(|e| e.code()).collect();
        codes.sort();
        codes.dedup();
        assert_eq!(codes.len(), errors.len());
    }

    #[test]
    fn test_low_battery_message() {
        let err = UpdaterError::InstallNotEligible(IneligibleReason::LowBattery {
            percent: 12,
            required: 30,
        });
        assert!(err.to_string().contains("12%"));
        assert!(err.is_rejection());
    }
}
