use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use super::manifest::ManifestEntry;

/// 持久状态（跨重启保存）
///
/// 顺序即生命周期方向：只能前进，回退只能通过显式重置。
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PersistentStatus {
    Unknown,
    Incomplete,
    Verified,
    Installed,
}

/// 内存中的实时状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransientStatus {
    Idle,
    Starting,
    Downloading,
    Paused,
    PausedError,
    Verifying,
    VerificationFailed,
    Verified,
    Installing,
    Installed,
    WaitingReboot,
}

impl TransientStatus {
    /// 占用下载通道的状态
    pub fn is_active_download(&self) -> bool {
        matches!(self, TransientStatus::Starting | TransientStatus::Downloading)
    }

    /// 下载已暂停（可恢复）
    pub fn is_paused(&self) -> bool {
        matches!(self, TransientStatus::Paused | TransientStatus::PausedError)
    }
}

/// 更新包类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PackageType {
    /// A/B 无缝更新包
    Ab,
    /// 恢复模式刷入包
    Legacy,
}

/// 单个更新包的记录
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateRecord {
    pub id: String,
    pub version: String,
    /// 构建时间（unix 秒）
    pub timestamp: i64,
    pub download_url: String,
    pub expected_size: u64,
    pub expected_checksum: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub package_type: Option<PackageType>,
    /// 本地下载文件
    pub local_file: PathBuf,
    /// 本地文件当前大小
    pub bytes_downloaded: u64,
    pub persistent_status: PersistentStatus,
    pub transient_status: TransientStatus,
    /// 安装进度 0-100
    pub install_progress: u8,
    /// A/B 安装后的优化阶段
    pub finalizing: bool,
    /// 是否仍出现在最新清单中
    pub available_online: bool,
    /// 最近一次失败原因
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl UpdateRecord {
    /// 根据清单条目创建记录，文件位于下载目录下
    pub fn from_entry(entry: &ManifestEntry, download_dir: &Path) -> Self {
        Self {
            id: entry.id.clone(),
            version: entry.version.clone(),
            timestamp: entry.timestamp,
            download_url: entry.url.clone(),
            expected_size: entry.size,
            expected_checksum: entry.checksum.clone(),
            package_type: entry.package_type,
            local_file: download_dir.join(entry.file_name()),
            bytes_downloaded: 0,
            persistent_status: PersistentStatus::Unknown,
            transient_status: TransientStatus::Idle,
            install_progress: 0,
            finalizing: false,
            available_online: true,
            last_error: None,
        }
    }

    /// 下载进度 0-100
    pub fn download_progress(&self) -> u8 {
        if self.expected_size == 0 {
            return 0;
        }
        let bytes = self.bytes_downloaded.min(self.expected_size);
        ((bytes as u128 * 100) / self.expected_size as u128) as u8
    }

    pub fn is_download_complete(&self) -> bool {
        self.expected_size > 0 && self.bytes_downloaded == self.expected_size
    }

    /// 从磁盘重新读取已下载大小
    pub fn refresh_bytes_from_disk(&mut self) {
        self.bytes_downloaded = std::fs::metadata(&self.local_file)
            .map(|m| m.len())
            .unwrap_or(0);
    }

    /// 根据持久状态恢复实时状态（进程重启后）
    pub fn restore_transient_status(&mut self) {
        self.transient_status = match self.persistent_status {
            PersistentStatus::Unknown => TransientStatus::Idle,
            PersistentStatus::Incomplete => TransientStatus::Paused,
            PersistentStatus::Verified => TransientStatus::Verified,
            PersistentStatus::Installed => TransientStatus::Installed,
        };
    }

    /// 清空下载进度，回到初始状态
    pub fn reset_download(&mut self) {
        self.bytes_downloaded = 0;
        self.persistent_status = PersistentStatus::Unknown;
        self.transient_status = TransientStatus::Idle;
        self.install_progress = 0;
        self.finalizing = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry() -> ManifestEntry {
        ManifestEntry {
            id: "aosp-14-0301".to_string(),
            version: "14.0".to_string(),
            timestamp: 1_709_251_200,
            url: "https://ota.example.org/aosp-14-0301.zip".to_string(),
            size: 1000,
            checksum: "0123456789abcdef0123456789abcdef".to_string(),
            filename: None,
            package_type: None,
        }
    }

    #[test]
    fn test_record_from_entry() {
        let record = UpdateRecord::from_entry(&entry(), Path::new("/data/ota"));
        assert_eq!(record.local_file, PathBuf::from("/data/ota/aosp-14-0301.zip"));
        assert_eq!(record.persistent_status, PersistentStatus::Unknown);
        assert_eq!(record.transient_status, TransientStatus::Idle);
        assert!(record.available_online);
    }

    #[test]
    fn test_download_progress() {
        let mut record = UpdateRecord::from_entry(&entry(), Path::new("/tmp"));
        assert_eq!(record.download_progress(), 0);

        record.bytes_downloaded = 250;
        assert_eq!(record.download_progress(), 25);

        record.bytes_downloaded = 1000;
        assert_eq!(record.download_progress(), 100);
        assert!(record.is_download_complete());
    }

    #[test]
    fn test_persistent_status_order() {
        assert!(PersistentStatus::Unknown < PersistentStatus::Incomplete);
        assert!(PersistentStatus::Incomplete < PersistentStatus::Verified);
        assert!(PersistentStatus::Verified < PersistentStatus::Installed);
    }

    #[test]
    fn test_restore_transient_status() {
        let mut record = UpdateRecord::from_entry(&entry(), Path::new("/tmp"));
        record.persistent_status = PersistentStatus::Incomplete;
        record.restore_transient_status();
        assert_eq!(record.transient_status, TransientStatus::Paused);

        record.persistent_status = PersistentStatus::Verified;
        record.restore_transient_status();
        assert_eq!(record.transient_status, TransientStatus::Verified);
    }

    #[test]
    fn test_reset_download() {
        let mut record = UpdateRecord::from_entry(&entry(), Path::new("/tmp"));
        record.bytes_downloaded = 600;
        record.persistent_status = PersistentStatus::Incomplete;
        record.transient_status = TransientStatus::PausedError;

        record.reset_download();
        assert_eq!(record.bytes_downloaded, 0);
        assert_eq!(record.persistent_status, PersistentStatus::Unknown);
        assert_eq!(record.transient_status, TransientStatus::Idle);
    }
}
