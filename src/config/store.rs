// 键值配置存储
//
// 运行时偏好设置和每个更新的持久状态都通过 `ConfigStore` 读写，
// 具体存储格式只要求能跨重启保存。

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

use super::CheckInterval;
use crate::error::{UpdaterError, UpdaterResult};
use crate::updater::PersistentStatus;

pub const KEY_LAST_UPDATE_CHECK: &str = "last_update_check";
pub const KEY_CHECK_INTERVAL: &str = "auto_updates_check_interval";
pub const KEY_PERF_MODE: &str = "ab_perf_mode";
pub const KEY_HAS_SEEN_INFO_DIALOG: &str = "has_seen_info_dialog";
pub const KEY_UPDATE_RECOVERY: &str = "update_recovery";
pub const KEY_NEEDS_REBOOT_ID: &str = "needs_reboot_id";
pub const KEY_NEEDS_REBOOT_BOOT_ID: &str = "needs_reboot_boot_id";
const STATUS_KEY_PREFIX: &str = "update_status.";

/// 通用键值配置接口
pub trait ConfigStore: Send + Sync {
    fn get(&self, key: &str) -> Option<Value>;
    fn set(&self, key: &str, value: Value) -> UpdaterResult<()>;
    fn remove(&self, key: &str) -> UpdaterResult<()>;
}

/// 内存实现（测试和无持久化场景）
#[derive(Debug, Default)]
pub struct MemoryConfigStore {
    values: RwLock<BTreeMap<String, Value>>,
}

impl MemoryConfigStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ConfigStore for MemoryConfigStore {
    fn get(&self, key: &str) -> Option<Value> {
        self.values.read().get(key).cloned()
    }

    fn set(&self, key: &str, value: Value) -> UpdaterResult<()> {
        self.values.write().insert(key.to_string(), value);
        Ok(())
    }

    fn remove(&self, key: &str) -> UpdaterResult<()> {
        self.values.write().remove(key);
        Ok(())
    }
}

/// JSON 文件实现
///
/// 每次修改后整体写回：先写 `.tmp` 再原子重命名，防止写入中断导致文件损坏。
#[derive(Debug)]
pub struct JsonFileConfigStore {
    path: PathBuf,
    values: RwLock<BTreeMap<String, Value>>,
}

impl JsonFileConfigStore {
    /// 打开配置文件，文件不存在时从空配置开始
    pub fn open(path: impl Into<PathBuf>) -> UpdaterResult<Self> {
        let path = path.into();
        let values = match fs::read_to_string(&path) {
            Ok(content) => match serde_json::from_str::<BTreeMap<String, Value>>(&content) {
                Ok(values) => values,
                Err(e) => {
                    warn!("偏好设置文件损坏，已忽略: {:?}, 错误: {}", path, e);
                    BTreeMap::new()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(e.into()),
        };

        debug!("已加载偏好设置: {:?} ({} 项)", path, values.len());
        Ok(Self {
            path,
            values: RwLock::new(values),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn persist(&self, values: &BTreeMap<String, Value>) -> UpdaterResult<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }

        let temp_path = self.path.with_extension("json.tmp");
        let file = File::create(&temp_path)?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer_pretty(&mut writer, values)
            .map_err(|e| UpdaterError::Config(format!("序列化偏好设置失败: {}", e)))?;
        writer.flush()?;
        drop(writer);

        fs::rename(&temp_path, &self.path)?;
        Ok(())
    }
}

impl ConfigStore for JsonFileConfigStore {
    fn get(&self, key: &str) -> Option<Value> {
        self.values.read().get(key).cloned()
    }

    fn set(&self, key: &str, value: Value) -> UpdaterResult<()> {
        let mut values = self.values.write();
        if values.get(key) == Some(&value) {
            return Ok(());
        }
        values.insert(key.to_string(), value);
        self.persist(&values)
    }

    fn remove(&self, key: &str) -> UpdaterResult<()> {
        let mut values = self.values.write();
        if values.remove(key).is_some() {
            self.persist(&values)?;
        }
        Ok(())
    }
}

/// 安装成功后等待重启的标记
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RebootMarker {
    pub id: String,
    pub boot_id: String,
}

/// 类型化的偏好设置访问
#[derive(Clone)]
pub struct Preferences {
    store: Arc<dyn ConfigStore>,
}

impl Preferences {
    pub fn new(store: Arc<dyn ConfigStore>) -> Self {
        Self { store }
    }

    fn get_bool(&self, key: &str, default: bool) -> bool {
        self.store
            .get(key)
            .and_then(|v| v.as_bool())
            .unwrap_or(default)
    }

    fn get_string(&self, key: &str) -> Option<String> {
        self.store
            .get(key)
            .and_then(|v| v.as_str().map(str::to_string))
    }

    /// 上次成功检查更新的时间（毫秒时间戳）
    pub fn last_update_check(&self) -> Option<i64> {
        self.store.get(KEY_LAST_UPDATE_CHECK).and_then(|v| v.as_i64())
    }

    pub fn set_last_update_check(&self, millis: i64) -> UpdaterResult<()> {
        self.store.set(KEY_LAST_UPDATE_CHECK, Value::from(millis))
    }

    /// 自动检查间隔，未设置时使用配置文件中的默认值
    pub fn check_interval(&self, default: CheckInterval) -> CheckInterval {
        self.store
            .get(KEY_CHECK_INTERVAL)
            .and_then(|v| v.as_u64())
            .and_then(|i| u8::try_from(i).ok())
            .and_then(CheckInterval::from_index)
            .unwrap_or(default)
    }

    pub fn set_check_interval(&self, interval: CheckInterval) -> UpdaterResult<()> {
        self.store
            .set(KEY_CHECK_INTERVAL, Value::from(interval.index()))
    }

    pub fn performance_mode(&self) -> bool {
        self.get_bool(KEY_PERF_MODE, false)
    }

    pub fn set_performance_mode(&self, enabled: bool) -> UpdaterResult<()> {
        self.store.set(KEY_PERF_MODE, Value::from(enabled))
    }

    pub fn has_seen_info_dialog(&self) -> bool {
        self.get_bool(KEY_HAS_SEEN_INFO_DIALOG, false)
    }

    pub fn set_has_seen_info_dialog(&self, seen: bool) -> UpdaterResult<()> {
        self.store.set(KEY_HAS_SEEN_INFO_DIALOG, Value::from(seen))
    }

    /// 是否同时更新恢复分区
    pub fn recovery_update(&self) -> bool {
        self.get_bool(KEY_UPDATE_RECOVERY, false)
    }

    pub fn set_recovery_update(&self, enabled: bool) -> UpdaterResult<()> {
        self.store.set(KEY_UPDATE_RECOVERY, Value::from(enabled))
    }

    /// 读取某个更新持久化的状态
    pub fn persistent_status(&self, id: &str) -> Option<PersistentStatus> {
        self.store
            .get(&format!("{}{}", STATUS_KEY_PREFIX, id))
            .and_then(|v| serde_json::from_value(v).ok())
    }

    /// 保存持久状态，UNKNOWN 直接删除键
    pub fn set_persistent_status(&self, id: &str, status: PersistentStatus) -> UpdaterResult<()> {
        let key = format!("{}{}", STATUS_KEY_PREFIX, id);
        if status == PersistentStatus::Unknown {
            return self.store.remove(&key);
        }
        let value = serde_json::to_value(status)
            .map_err(|e| UpdaterError::Config(format!("序列化状态失败: {}", e)))?;
        self.store.set(&key, value)
    }

    pub fn reboot_marker(&self) -> Option<RebootMarker> {
        let id = self.get_string(KEY_NEEDS_REBOOT_ID)?;
        let boot_id = self.get_string(KEY_NEEDS_REBOOT_BOOT_ID)?;
        Some(RebootMarker { id, boot_id })
    }

    pub fn set_reboot_marker(&self, marker: &RebootMarker) -> UpdaterResult<()> {
        self.store
            .set(KEY_NEEDS_REBOOT_ID, Value::from(marker.id.clone()))?;
        self.store
            .set(KEY_NEEDS_REBOOT_BOOT_ID, Value::from(marker.boot_id.clone()))
    }

    pub fn clear_reboot_marker(&self) -> UpdaterResult<()> {
        self.store.remove(KEY_NEEDS_REBOOT_ID)?;
        self.store.remove(KEY_NEEDS_REBOOT_BOOT_ID)
    }
}
