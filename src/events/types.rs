//! 更新事件类型定义

use serde::{Deserialize, Serialize};

use crate::updater::{PersistentStatus, TransientStatus};

/// 事件优先级
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum EventPriority {
    /// 进度更新，可合并
    Low = 0,
    /// 状态变更
    Medium = 1,
    /// 新增、移除、失败
    High = 2,
}

/// 失败类别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Transport,
    ChecksumMismatch,
    Installer,
}

/// 更新事件
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum UpdateEvent {
    /// 清单中出现新的更新
    Added { id: String },
    /// 更新从列表中移除
    Removed { id: String },
    /// 状态变更
    StatusChanged {
        id: String,
        transient: TransientStatus,
        persistent: PersistentStatus,
    },
    /// 下载进度
    DownloadProgress {
        id: String,
        bytes_downloaded: u64,
        expected_size: u64,
        percent: u8,
    },
    /// 安装进度
    InstallProgress {
        id: String,
        percent: u8,
        finalizing: bool,
    },
    /// 下载/校验/安装失败
    Failed {
        id: String,
        kind: FailureKind,
        message: String,
    },
}

impl UpdateEvent {
    pub fn id(&self) -> &str {
        match self {
            UpdateEvent::Added { id }
            | UpdateEvent::Removed { id }
            | UpdateEvent::StatusChanged { id, .. }
            | UpdateEvent::DownloadProgress { id, .. }
            | UpdateEvent::InstallProgress { id, .. }
            | UpdateEvent::Failed { id, .. } => id,
        }
    }

    pub fn priority(&self) -> EventPriority {
        match self {
            UpdateEvent::DownloadProgress { .. } | UpdateEvent::InstallProgress { .. } => {
                EventPriority::Low
            }
            UpdateEvent::StatusChanged { .. } => EventPriority::Medium,
            UpdateEvent::Added { .. } | UpdateEvent::Removed { .. } | UpdateEvent::Failed { .. } => {
                EventPriority::High
            }
        }
    }

    pub fn is_progress(&self) -> bool {
        self.priority() == EventPriority::Low
    }
}

/// 订阅过滤器
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventFilter {
    /// 全部事件
    #[default]
    All,
    /// 只接收状态类事件（不含进度）
    Status,
    /// 只接收进度事件
    Progress,
}

impl EventFilter {
    pub fn accepts(&self, event: &UpdateEvent) -> bool {
        match self {
            EventFilter::All => true,
            EventFilter::Status => !event.is_progress(),
            EventFilter::Progress => event.is_progress(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_serialization() {
        let event = UpdateEvent::StatusChanged {
            id: "a".to_string(),
            transient: TransientStatus::Downloading,
            persistent: PersistentStatus::Incomplete,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event_type"], "status_changed");
        assert_eq!(json["transient"], "DOWNLOADING");
        assert_eq!(json["persistent"], "INCOMPLETE");
    }

    #[test]
    fn test_filter() {
        let progress = UpdateEvent::DownloadProgress {
            id: "a".to_string(),
            bytes_downloaded: 10,
            expected_size: 100,
            percent: 10,
        };
        let failed = UpdateEvent::Failed {
            id: "a".to_string(),
            kind: FailureKind::Transport,
            message: "reset".to_string(),
        };

        assert!(EventFilter::All.accepts(&progress));
        assert!(!EventFilter::Status.accepts(&progress));
        assert!(EventFilter::Status.accepts(&failed));
        assert!(EventFilter::Progress.accepts(&progress));
        assert!(!EventFilter::Progress.accepts(&failed));
        assert_eq!(progress.id(), "a");
    }
}
