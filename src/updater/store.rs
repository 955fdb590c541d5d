//! 更新记录表
//!
//! 以 id 为键保存所有已知更新。所有修改都会通过事件总线通知订阅者；
//! 数据没有变化时不发事件，因此同一清单重复合并不会产生额外事件。
//!
//! 持久状态只能前进（UNKNOWN → INCOMPLETE → VERIFIED → INSTALLED），
//! 回退只能通过 `reset`（删除或校验失败）。

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use tracing::{debug, info, warn};

use super::manifest::ManifestEntry;
use super::record::{PersistentStatus, TransientStatus, UpdateRecord};
use crate::config::Preferences;
use crate::error::{UpdaterError, UpdaterResult};
use crate::events::{EventBus, UpdateEvent};

pub struct UpdateStore {
    records: HashMap<String, UpdateRecord>,
    download_dir: PathBuf,
    prefs: Preferences,
    events: EventBus,
}

impl UpdateStore {
    pub fn new(download_dir: impl Into<PathBuf>, prefs: Preferences, events: EventBus) -> Self {
        Self {
            records: HashMap::new(),
            download_dir: download_dir.into(),
            prefs,
            events,
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&UpdateRecord> {
        self.records.get(id)
    }

    pub(crate) fn get_mut(&mut self, id: &str) -> Option<&mut UpdateRecord> {
        self.records.get_mut(id)
    }

    pub fn require(&self, id: &str) -> UpdaterResult<&UpdateRecord> {
        self.records
            .get(id)
            .ok_or_else(|| UpdaterError::UnknownUpdate(id.to_string()))
    }

    /// 所有记录，按构建时间从新到旧
    pub fn all(&self) -> Vec<UpdateRecord> {
        let mut records: Vec<UpdateRecord> = self.records.values().cloned().collect();
        records.sort_by(|a, b| b.timestamp.cmp(&a.timestamp).then_with(|| a.id.cmp(&b.id)));
        records
    }

    /// 合并清单条目，返回是否发现了新更新
    ///
    /// 已存在的记录只更新版本、时间、下载地址和包类型；大小和校验和以首次出现为准，
    /// 本地进度和状态不受影响。
    pub fn upsert(&mut self, entries: &[ManifestEntry]) -> bool {
        let mut new_found = false;

        for entry in entries {
            if let Some(record) = self.records.get_mut(&entry.id) {
                if record.expected_size != entry.size
                    || !record.expected_checksum.eq_ignore_ascii_case(&entry.checksum)
                {
                    warn!(
                        "更新 {} 的大小或校验和在清单中发生变化，保留原值",
                        entry.id
                    );
                }
                record.version = entry.version.clone();
                record.timestamp = entry.timestamp;
                record.download_url = entry.url.clone();
                record.package_type = entry.package_type;
                continue;
            }

            let record = self.restore_record(entry);
            if record.persistent_status != PersistentStatus::Installed {
                new_found = true;
            }

            info!(
                "发现更新: id={}, version={}, status={:?}",
                record.id, record.version, record.persistent_status
            );
            self.records.insert(record.id.clone(), record);
            self.events.publish(UpdateEvent::Added {
                id: entry.id.clone(),
            });
        }

        new_found
    }

    /// 创建记录并恢复上次保存的状态，已下载大小以磁盘为准
    fn restore_record(&self, entry: &ManifestEntry) -> UpdateRecord {
        let mut record = UpdateRecord::from_entry(entry, &self.download_dir);
        record.refresh_bytes_from_disk();
        record.persistent_status = self
            .prefs
            .persistent_status(&record.id)
            .unwrap_or(PersistentStatus::Unknown);

        let file_exists = record.local_file.exists();
        let stale = match record.persistent_status {
            PersistentStatus::Incomplete | PersistentStatus::Verified => !file_exists,
            _ => false,
        };
        let oversized = record.bytes_downloaded > record.expected_size;

        if stale || oversized {
            warn!(
                "更新 {} 的本地文件缺失或大小异常，重置状态 (bytes={})",
                record.id, record.bytes_downloaded
            );
            if oversized {
                if let Err(e) = std::fs::remove_file(&record.local_file) {
                    warn!("删除异常文件失败: {:?}, 错误: {}", record.local_file, e);
                }
            }
            record.reset_download();
            if let Err(e) = self
                .prefs
                .set_persistent_status(&record.id, PersistentStatus::Unknown)
            {
                warn!("清除持久状态失败: {}", e);
            }
        }

        record.restore_transient_status();
        record
    }

    /// 标记在线状态：列出的 id 在线，其余离线；离线且无本地状态的记录被移除
    ///
    /// 返回被移除的 id
    pub fn mark_available_online(&mut self, ids: &[String]) -> Vec<String> {
        let online: HashSet<&str> = ids.iter().map(String::as_str).collect();
        let mut pruned = Vec::new();

        for record in self.records.values_mut() {
            record.available_online = online.contains(record.id.as_str());
            if !record.available_online
                && record.persistent_status == PersistentStatus::Unknown
                && !record.transient_status.is_active_download()
            {
                pruned.push(record.id.clone());
            }
        }

        for id in &pruned {
            if let Some(record) = self.records.remove(id) {
                if record.local_file.exists() {
                    if let Err(e) = std::fs::remove_file(&record.local_file) {
                        warn!("删除残留文件失败: {:?}, 错误: {}", record.local_file, e);
                    }
                }
                info!("更新已下线，移除记录: {}", id);
                self.events.publish(UpdateEvent::Removed { id: id.clone() });
            }
        }

        pruned
    }

    /// 从记录表中移除
    pub fn delete(&mut self, id: &str) -> bool {
        if self.records.remove(id).is_none() {
            return false;
        }
        if let Err(e) = self.prefs.set_persistent_status(id, PersistentStatus::Unknown) {
            warn!("清除持久状态失败: {}", e);
        }
        self.events.publish(UpdateEvent::Removed { id: id.to_string() });
        true
    }

    /// 只允许前进的持久状态修改
    pub fn set_persistent_status(
        &mut self,
        id: &str,
        status: PersistentStatus,
    ) -> UpdaterResult<()> {
        let transient = self.require(id)?.transient_status;
        self.transition(id, transient, Some(status))
    }

    /// 一次状态转换：修改实时状态（以及可选的持久状态），有变化时发一个事件
    pub fn transition(
        &mut self,
        id: &str,
        transient: TransientStatus,
        persistent: Option<PersistentStatus>,
    ) -> UpdaterResult<()> {
        let record = self
            .records
            .get_mut(id)
            .ok_or_else(|| UpdaterError::UnknownUpdate(id.to_string()))?;

        let mut changed = false;
        if let Some(persistent) = persistent {
            if persistent < record.persistent_status {
                warn!(
                    "拒绝持久状态回退: id={}, {:?} -> {:?}",
                    id, record.persistent_status, persistent
                );
            } else if persistent != record.persistent_status {
                self.prefs.set_persistent_status(id, persistent)?;
                record.persistent_status = persistent;
                changed = true;
            }
        }
        if record.transient_status != transient {
            record.transient_status = transient;
            changed = true;
        }

        if changed {
            debug!(
                "状态变更: id={}, transient={:?}, persistent={:?}",
                id, record.transient_status, record.persistent_status
            );
            self.events.publish(UpdateEvent::StatusChanged {
                id: id.to_string(),
                transient: record.transient_status,
                persistent: record.persistent_status,
            });
        }
        Ok(())
    }

    /// 显式重置：清空进度，回到 IDLE/UNKNOWN（或指定的实时状态）
    pub fn reset(&mut self, id: &str, transient: TransientStatus) -> UpdaterResult<()> {
        let record = self
            .records
            .get_mut(id)
            .ok_or_else(|| UpdaterError::UnknownUpdate(id.to_string()))?;

        self.prefs
            .set_persistent_status(id, PersistentStatus::Unknown)?;
        record.reset_download();
        record.transient_status = transient;

        self.events.publish(UpdateEvent::StatusChanged {
            id: id.to_string(),
            transient,
            persistent: PersistentStatus::Unknown,
        });
        Ok(())
    }
}
