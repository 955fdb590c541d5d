// 集成测试公共工具：内存传输、可控安装器、固定设备策略

#![allow(dead_code)]

use anyhow::Result;
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use ota_updater::config::{CheckInterval, InstallConfig, MemoryConfigStore};
use ota_updater::updater::{
    BatteryState, ControllerOptions, ControllerPorts, DevicePolicy, FetchResponse,
    FetchTransport, InstallTopology, Installer, ManifestEntry, SeamlessProgress,
    TransientStatus, UpdateController, UpdateRecord,
};
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::{mpsc, Notify};

pub const MANIFEST_URL: &str = "https://ota.example.org/updates.json";
pub const BUILD_TIMESTAMP: i64 = 1_700_000_000;

/// 测试用更新包内容
pub fn payload(len: usize, seed: u8) -> Vec<u8> {
    (0..len).map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed)).collect()
}

pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

pub fn entry(id: &str, timestamp: i64, data: &[u8]) -> ManifestEntry {
    ManifestEntry {
        id: id.to_string(),
        version: format!("v-{}", id),
        timestamp,
        url: format!("https://ota.example.org/{}.zip", id),
        size: data.len() as u64,
        checksum: sha256_hex(data),
        filename: None,
        package_type: None,
    }
}

/// 单个地址的传输行为
#[derive(Clone, Default)]
struct Resource {
    data: Vec<u8>,
    /// 从该偏移开始返回错误
    fail_at: Option<usize>,
    /// 从该偏移开始挂起，直到被取消
    hang_at: Option<usize>,
}

/// 内存传输
pub struct FakeTransport {
    resources: Mutex<HashMap<String, Resource>>,
    honor_range: AtomicBool,
    refuse: AtomicBool,
    chunk_size: usize,
    requests: Mutex<Vec<(String, u64)>>,
}

impl FakeTransport {
    pub fn new() -> Self {
        Self {
            resources: Mutex::new(HashMap::new()),
            honor_range: AtomicBool::new(true),
            refuse: AtomicBool::new(false),
            chunk_size: 64,
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn serve(&self, url: &str, data: Vec<u8>) {
        self.resources.lock().insert(
            url.to_string(),
            Resource {
                data,
                ..Resource::default()
            },
        );
    }

    /// 以 `{"response": [...]}` 格式提供清单
    pub fn serve_manifest(&self, entries: &[ManifestEntry]) {
        let body = serde_json::json!({ "response": entries });
        self.serve(MANIFEST_URL, serde_json::to_vec(&body).unwrap());
    }

    pub fn serve_raw_manifest(&self, body: &str) {
        self.serve(MANIFEST_URL, body.as_bytes().to_vec());
    }

    pub fn fail_at(&self, url: &str, offset: Option<usize>) {
        if let Some(resource) = self.resources.lock().get_mut(url) {
            resource.fail_at = offset;
        }
    }

    pub fn hang_at(&self, url: &str, offset: Option<usize>) {
        if let Some(resource) = self.resources.lock().get_mut(url) {
            resource.hang_at = offset;
        }
    }

    pub fn set_honor_range(&self, honor: bool) {
        self.honor_range.store(honor, Ordering::SeqCst);
    }

    /// 拒绝所有连接
    pub fn set_refuse(&self, refuse: bool) {
        self.refuse.store(refuse, Ordering::SeqCst);
    }

    pub fn requests(&self) -> Vec<(String, u64)> {
        self.requests.lock().clone()
    }

    pub fn requests_for(&self, url: &str) -> Vec<u64> {
        self.requests
            .lock()
            .iter()
            .filter(|(u, _)| u == url)
            .map(|(_, start)| *start)
            .collect()
    }
}

#[async_trait]
impl FetchTransport for FakeTransport {
    async fn open(&self, url: &str, range_start: u64) -> Result<FetchResponse> {
        self.requests.lock().push((url.to_string(), range_start));
        if self.refuse.load(Ordering::SeqCst) {
            anyhow::bail!("connection refused");
        }
        let resource = self
            .resources
            .lock()
            .get(url)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("404 Not Found: {}", url))?;

        let honor = self.honor_range.load(Ordering::SeqCst);
        let start = if honor { range_start as usize } else { 0 };

        let mut items: Vec<Result<Vec<u8>>> = Vec::new();
        let mut hang = false;
        let mut pos = start;
        while pos < resource.data.len() {
            if resource.hang_at.map_or(false, |at| pos >= at) {
                hang = true;
                break;
            }
            if resource.fail_at.map_or(false, |at| pos >= at) {
                items.push(Err(anyhow::anyhow!("connection reset")));
                break;
            }
            let mut end = (pos + self.chunk_size).min(resource.data.len());
            if let Some(at) = resource.hang_at.filter(|at| *at > pos) {
                end = end.min(at);
            }
            if let Some(at) = resource.fail_at.filter(|at| *at > pos) {
                end = end.min(at);
            }
            items.push(Ok(resource.data[pos..end].to_vec()));
            pos = end;
        }

        let body = if hang {
            stream::iter(items).chain(stream::pending()).boxed()
        } else {
            stream::iter(items).boxed()
        };

        Ok(FetchResponse {
            resumed: honor && range_start > 0,
            total_size: Some(resource.data.len() as u64),
            body,
        })
    }
}

/// 由测试驱动进度的安装器
#[derive(Default)]
pub struct FakeInstaller {
    seamless: Mutex<Option<mpsc::Sender<SeamlessProgress>>>,
    pub fail_trigger: AtomicBool,
    pub fail_recovery: AtomicBool,
    /// 为 true 时恢复模式安装一直等到 `release_recovery`
    pub hold_recovery: AtomicBool,
    recovery_release: Notify,
    pub seamless_paths: Mutex<Vec<PathBuf>>,
    pub recovery_paths: Mutex<Vec<PathBuf>>,
    pub cancels: AtomicUsize,
    pub reboots: AtomicUsize,
    pub performance_mode: Mutex<Option<bool>>,
}

impl FakeInstaller {
    /// 发送一条无缝安装进度
    pub async fn emit(&self, progress: SeamlessProgress) {
        let sender = self.seamless.lock().clone();
        if let Some(sender) = sender {
            sender.send(progress).await.unwrap();
        } else {
            panic!("没有正在进行的无缝安装");
        }
    }

    pub fn release_recovery(&self) {
        self.recovery_release.notify_one();
    }
}

#[async_trait]
impl Installer for FakeInstaller {
    async fn trigger_seamless_install(&self, path: &Path) -> Result<mpsc::Receiver<SeamlessProgress>> {
        if self.fail_trigger.load(Ordering::SeqCst) {
            anyhow::bail!("update_engine unavailable");
        }
        self.seamless_paths.lock().push(path.to_path_buf());
        let (tx, rx) = mpsc::channel(16);
        *self.seamless.lock() = Some(tx);
        Ok(rx)
    }

    async fn trigger_recovery_install(&self, path: &Path) -> Result<()> {
        if self.hold_recovery.load(Ordering::SeqCst) {
            self.recovery_release.notified().await;
        }
        if self.fail_recovery.load(Ordering::SeqCst) {
            anyhow::bail!("recovery command failed");
        }
        self.recovery_paths.lock().push(path.to_path_buf());
        Ok(())
    }

    async fn cancel_seamless_install(&self) -> Result<()> {
        self.cancels.fetch_add(1, Ordering::SeqCst);
        self.seamless.lock().take();
        Ok(())
    }

    async fn set_performance_mode(&self, enabled: bool) -> Result<()> {
        *self.performance_mode.lock() = Some(enabled);
        Ok(())
    }

    async fn reboot(&self) -> Result<()> {
        self.reboots.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// 固定设备状态
pub struct FakeDevice {
    pub topology: InstallTopology,
    pub battery: Mutex<Option<BatteryState>>,
    pub overlay: AtomicBool,
    pub boot_id: Mutex<String>,
}

impl FakeDevice {
    pub fn new(topology: InstallTopology, boot_id: &str) -> Self {
        Self {
            topology,
            battery: Mutex::new(Some(BatteryState {
                percent: 80,
                charging: false,
            })),
            overlay: AtomicBool::new(false),
            boot_id: Mutex::new(boot_id.to_string()),
        }
    }
}

#[async_trait]
impl DevicePolicy for FakeDevice {
    async fn battery(&self) -> Option<BatteryState> {
        *self.battery.lock()
    }

    async fn is_overlay_mounted(&self, _path: &Path) -> bool {
        self.overlay.load(Ordering::SeqCst)
    }

    async fn detect_topology(&self) -> InstallTopology {
        self.topology
    }

    async fn boot_id(&self) -> Option<String> {
        Some(self.boot_id.lock().clone())
    }
}

/// 一个完整的测试环境
pub struct Harness {
    pub dir: Arc<TempDir>,
    pub transport: Arc<FakeTransport>,
    pub installer: Arc<FakeInstaller>,
    pub device: Arc<FakeDevice>,
    pub store: Arc<MemoryConfigStore>,
    pub controller: UpdateController,
}

impl Harness {
    pub async fn new(topology: InstallTopology) -> Self {
        let dir = Arc::new(TempDir::new().unwrap());
        Self::build(
            dir,
            Arc::new(FakeTransport::new()),
            Arc::new(FakeDevice::new(topology, "boot-1")),
            Arc::new(MemoryConfigStore::new()),
        )
        .await
    }

    async fn build(
        dir: Arc<TempDir>,
        transport: Arc<FakeTransport>,
        device: Arc<FakeDevice>,
        store: Arc<MemoryConfigStore>,
    ) -> Self {
        let installer = Arc::new(FakeInstaller::default());
        let options = ControllerOptions {
            manifest_url: MANIFEST_URL.to_string(),
            download_dir: dir.path().join("updates"),
            cache_path: dir.path().join("data/updates.json"),
            progress_interval: Duration::ZERO,
            build_timestamp: BUILD_TIMESTAMP,
            allow_downgrade: false,
            default_check_interval: CheckInterval::Weekly,
            install: InstallConfig::default(),
        };
        let ports = ControllerPorts {
            transport: transport.clone(),
            installer: installer.clone(),
            device: device.clone(),
            config_store: store.clone(),
        };
        let controller = UpdateController::new(options, ports).await;
        Self {
            dir,
            transport,
            installer,
            device,
            store,
            controller,
        }
    }

    /// 模拟进程重启（可选设备重启）：保留磁盘文件、偏好设置和服务端数据
    pub async fn restart(self, boot_id: Option<&str>) -> Self {
        self.controller.shutdown().await;
        if let Some(boot_id) = boot_id {
            *self.device.boot_id.lock() = boot_id.to_string();
        }
        let harness = Self::build(self.dir, self.transport, self.device, self.store).await;
        harness.controller.restore().await.unwrap();
        harness
    }

    pub fn file_path(&self, id: &str) -> PathBuf {
        self.dir.path().join("updates").join(format!("{}.zip", id))
    }

    /// 提供清单和更新包，并执行一次手动检查
    pub async fn publish(&self, packages: &[(&str, i64, &[u8])]) -> Vec<ManifestEntry> {
        let entries: Vec<ManifestEntry> = packages
            .iter()
            .map(|(id, ts, data)| entry(id, *ts, data))
            .collect();
        for ((_, _, data), entry) in packages.iter().zip(&entries) {
            self.transport.serve(&entry.url, data.to_vec());
        }
        self.transport.serve_manifest(&entries);
        self.controller
            .check_for_updates(ota_updater::CheckTrigger::Manual)
            .await
            .unwrap();
        entries
    }

    pub async fn record(&self, id: &str) -> UpdateRecord {
        self.controller.get(id).await.expect("record exists")
    }

    /// 等待更新进入指定状态
    pub async fn wait_for(&self, id: &str, status: TransientStatus) -> UpdateRecord {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            if let Some(record) = self.controller.get(id).await {
                if record.transient_status == status {
                    return record;
                }
            }
            if tokio::time::Instant::now() > deadline {
                panic!(
                    "等待 {} 进入 {:?} 超时，当前: {:?}",
                    id,
                    status,
                    self.controller.get(id).await.map(|r| r.transient_status)
                );
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    /// 等待满足条件
    pub async fn wait_until<F>(&self, id: &str, what: &str, mut predicate: F) -> UpdateRecord
    where
        F: FnMut(&UpdateRecord) -> bool,
    {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            if let Some(record) = self.controller.get(id).await {
                if predicate(&record) {
                    return record;
                }
            }
            if tokio::time::Instant::now() > deadline {
                panic!("等待 {} 超时: {}", id, what);
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}
