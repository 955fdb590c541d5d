//! 更新生命周期控制器
//!
//! 所有状态修改都在同一把锁内串行执行：公开操作直接持锁修改，后台工作者
//! （下载、校验、安装）不持锁，只通过一个通道把结果报告给事件循环，由事件循环
//! 持锁应用。每个下载/校验会话有唯一编号，已被暂停或删除的会话发来的迟到报告会被忽略。
//!
//! 事件在持锁期间发布，所以同一更新的状态事件顺序与状态变化顺序一致。

use anyhow::Context;
use chrono::Utc;
use futures::StreamExt;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, Mutex, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::action::{primary_action, ActionContext, PrimaryAction, UpdateAction};
use super::admission::{AdmissionSlot, CheckCoordinator, PipelineStage};
use super::device::{DevicePolicy, InstallTopology};
use super::fetcher::{FetchEvent, FetchOutcome, FetchRequest, FetchTransport, Fetcher};
use super::installer::{InstallCoordinator, InstallSession, Installer, SeamlessProgress};
use super::manifest::{parse_manifest, ManifestCache, ManifestEntry};
use super::record::{PersistentStatus, TransientStatus, UpdateRecord};
use super::scheduler::CheckTrigger;
use super::store::UpdateStore;
use super::verifier::{Verifier, VerifyOutcome};
use crate::config::{
    AppConfig, CheckInterval, ConfigStore, InstallConfig, Preferences, RebootMarker,
    TopologySetting,
};
use crate::error::{UpdaterError, UpdaterResult};
use crate::events::{
    EventBus, EventFilter, EventSubscription, FailureKind, UpdateEvent,
};

/// 清单文件大小上限
const MAX_MANIFEST_SIZE: u64 = 16 * 1024 * 1024;

/// 控制器参数
#[derive(Debug, Clone)]
pub struct ControllerOptions {
    pub manifest_url: String,
    pub download_dir: PathBuf,
    pub cache_path: PathBuf,
    pub progress_interval: Duration,
    pub build_timestamp: i64,
    pub allow_downgrade: bool,
    pub default_check_interval: CheckInterval,
    pub install: InstallConfig,
}

impl ControllerOptions {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            manifest_url: config.updater.manifest_url.clone(),
            download_dir: config.updater.download_dir.clone(),
            cache_path: config.updater.cached_manifest_path(),
            progress_interval: config.updater.progress_interval(),
            build_timestamp: config.updater.build_timestamp,
            allow_downgrade: config.updater.allow_downgrade,
            default_check_interval: config.check.interval,
            install: config.install.clone(),
        }
    }
}

/// 控制器依赖的外部接口
pub struct ControllerPorts {
    pub transport: Arc<dyn FetchTransport>,
    pub installer: Arc<dyn Installer>,
    pub device: Arc<dyn DevicePolicy>,
    pub config_store: Arc<dyn ConfigStore>,
}

/// 工作者报告
enum WorkerReport {
    Fetch { session: u64, event: FetchEvent },
    FetchDone { session: u64, outcome: FetchOutcome },
    VerifyDone { session: u64, result: Result<VerifyOutcome, String> },
    Install { session: u64, progress: SeamlessProgress },
    RecoveryDone { session: u64, result: Result<(), String> },
}

/// 正在运行的下载或校验工作者
struct PipelineWorker {
    id: String,
    session: u64,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

struct ControllerState {
    store: UpdateStore,
    admission: AdmissionSlot,
    worker: Option<PipelineWorker>,
    install: Option<InstallSession>,
    next_session: u64,
}

impl ControllerState {
    fn next_session(&mut self) -> u64 {
        self.next_session += 1;
        self.next_session
    }

    fn worker_id(&self, session: u64) -> Option<String> {
        self.worker
            .as_ref()
            .filter(|w| w.session == session)
            .map(|w| w.id.clone())
    }

    fn take_worker(&mut self, session: u64) -> Option<PipelineWorker> {
        if self.worker.as_ref().map(|w| w.session) == Some(session) {
            self.worker.take()
        } else {
            None
        }
    }

    fn install_id(&self, session: u64) -> Option<String> {
        self.install
            .as_ref()
            .filter(|s| s.session == session)
            .map(|s| s.id.clone())
    }

    fn set_bytes(&mut self, id: &str, bytes: u64) {
        if let Some(record) = self.store.get_mut(id) {
            record.bytes_downloaded = bytes.min(record.expected_size);
        }
    }
}

/// 带派生字段的更新快照
#[derive(Debug, Clone, Serialize)]
pub struct UpdateView {
    #[serde(flatten)]
    pub record: UpdateRecord,
    pub download_progress: u8,
    pub can_install: bool,
    pub waiting_for_reboot: bool,
    pub primary_action: PrimaryAction,
}

/// 控制器整体状态
#[derive(Debug, Clone, Serialize)]
pub struct ControllerStatus {
    pub busy: bool,
    pub downloading: Option<String>,
    pub verifying: Option<String>,
    pub installing: Option<String>,
    pub installing_seamless: bool,
    pub checking: bool,
    pub topology: InstallTopology,
    pub last_update_check: Option<i64>,
    pub update_count: usize,
}

/// 运行时偏好设置
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UpdaterSettings {
    pub check_interval: CheckInterval,
    pub performance_mode: bool,
    pub recovery_update: bool,
    pub has_seen_info_dialog: bool,
}

/// 操作执行结果
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ActionOutcome {
    Done,
    Checked {
        new_updates: bool,
    },
    Info {
        can_install: bool,
        topology: InstallTopology,
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
}

struct ControllerInner {
    state: Mutex<ControllerState>,
    fetcher: Fetcher,
    coordinator: InstallCoordinator,
    prefs: Preferences,
    events: EventBus,
    cache: ManifestCache,
    manifest_url: String,
    default_check_interval: CheckInterval,
    reports: mpsc::UnboundedSender<WorkerReport>,
    checks: Arc<CheckCoordinator>,
    boot_id: String,
    settings_changed: Notify,
}

/// 更新生命周期控制器
#[derive(Clone)]
pub struct UpdateController {
    inner: Arc<ControllerInner>,
}

impl UpdateController {
    /// 创建控制器：确定安装拓扑、读取启动 ID、启动事件循环
    pub async fn new(options: ControllerOptions, ports: ControllerPorts) -> Self {
        let events = EventBus::new();
        let prefs = Preferences::new(ports.config_store);

        let topology = match options.install.topology {
            TopologySetting::Auto => ports.device.detect_topology().await,
            TopologySetting::Seamless => InstallTopology::Seamless,
            TopologySetting::Recovery => InstallTopology::Recovery,
            TopologySetting::Unsupported => InstallTopology::Unsupported,
        };
        let boot_id = ports
            .device
            .boot_id()
            .await
            .unwrap_or_else(|| "unknown".to_string());

        if let Err(e) = ports
            .installer
            .set_performance_mode(prefs.performance_mode())
            .await
        {
            warn!("同步性能模式失败: {:#}", e);
        }

        let coordinator = InstallCoordinator::new(
            topology,
            ports.installer,
            ports.device,
            options.install.clone(),
            options.build_timestamp,
            options.allow_downgrade,
        );

        let (tx, rx) = mpsc::unbounded_channel();
        let inner = Arc::new(ControllerInner {
            state: Mutex::new(ControllerState {
                store: UpdateStore::new(&options.download_dir, prefs.clone(), events.clone()),
                admission: AdmissionSlot::new(),
                worker: None,
                install: None,
                next_session: 0,
            }),
            fetcher: Fetcher::new(ports.transport, options.progress_interval),
            coordinator,
            prefs,
            events,
            cache: ManifestCache::new(options.cache_path),
            manifest_url: options.manifest_url,
            default_check_interval: options.default_check_interval,
            reports: tx,
            checks: Arc::new(CheckCoordinator::new()),
            boot_id,
            settings_changed: Notify::new(),
        });

        tokio::spawn(run_reactor(Arc::downgrade(&inner), rx));
        info!("更新控制器已启动: 拓扑={:?}", topology);

        Self { inner }
    }

    /// 进程启动后恢复状态：处理重启标记，加载缓存清单
    ///
    /// 返回是否加载到了缓存清单
    pub async fn restore(&self) -> UpdaterResult<bool> {
        if let Some(marker) = self.inner.prefs.reboot_marker() {
            if marker.boot_id != self.inner.boot_id {
                info!("设备已重启，清除等待重启标记: {}", marker.id);
                self.inner.prefs.clear_reboot_marker()?;
            }
        }

        match self.inner.cache.load().await {
            Some(entries) => {
                let new_found = self.reconcile_manifest(&entries).await;
                info!(
                    "已从缓存恢复 {} 个更新 (新更新: {})",
                    entries.len(),
                    new_found
                );
                Ok(true)
            }
            None => {
                info!("没有可用的清单缓存");
                Ok(false)
            }
        }
    }

    /// 订阅事件
    pub fn subscribe(&self, filter: EventFilter) -> EventSubscription {
        self.inner.events.subscribe(filter)
    }

    pub fn events(&self) -> &EventBus {
        &self.inner.events
    }

    pub fn topology(&self) -> InstallTopology {
        self.inner.coordinator.topology()
    }

    // ========== 清单 ==========

    /// 合并新获取的清单，返回是否发现新更新
    pub async fn reconcile_manifest(&self, entries: &[ManifestEntry]) -> bool {
        let mut state = self.inner.state.lock().await;
        let new_found = state.store.upsert(entries);
        let ids: Vec<String> = entries.iter().map(|e| e.id.clone()).collect();
        state.store.mark_available_online(&ids);
        self.inner.apply_reboot_marker(&mut state);
        new_found
    }

    /// 检查更新：下载清单到临时文件，解析成功后替换缓存并合并
    ///
    /// 获取或解析失败时缓存和记录表都保持不变
    pub async fn check_for_updates(&self, trigger: CheckTrigger) -> UpdaterResult<bool> {
        let _guard = self
            .inner
            .checks
            .try_acquire()
            .ok_or_else(|| UpdaterError::AlreadyBusy("正在检查更新".to_string()))?;

        if self.inner.manifest_url.trim().is_empty() {
            return Err(UpdaterError::Config("未配置更新清单地址".to_string()));
        }

        info!("开始检查更新: trigger={:?}", trigger);
        let temp_path = self.inner.cache.temp_path();
        let result = self.refresh_manifest(&temp_path).await;

        match &result {
            Ok(new_found) => info!("检查更新完成: 新更新={}", new_found),
            Err(e) => {
                warn!("检查更新失败: trigger={:?}, 错误: {}", trigger, e);
                if let Err(e) = tokio::fs::remove_file(&temp_path).await {
                    if e.kind() != std::io::ErrorKind::NotFound {
                        warn!("删除临时清单失败: {:?}, 错误: {}", temp_path, e);
                    }
                }
            }
        }
        result
    }

    async fn refresh_manifest(&self, temp_path: &Path) -> UpdaterResult<bool> {
        self.download_manifest(temp_path)
            .await
            .map_err(|e| UpdaterError::TransportFailure(format!("{:#}", e)))?;

        let content = tokio::fs::read(temp_path).await?;
        let entries = parse_manifest(&content)?;

        let new_found = self.reconcile_manifest(&entries).await;
        self.inner
            .prefs
            .set_last_update_check(Utc::now().timestamp_millis())?;
        self.inner.cache.replace_with(temp_path).await?;
        Ok(new_found)
    }

    async fn download_manifest(&self, temp_path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = temp_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .context("创建数据目录失败")?;
        }

        let response = self
            .inner
            .fetcher
            .transport()
            .open(&self.inner.manifest_url, 0)
            .await?;

        let mut file = tokio::fs::File::create(temp_path)
            .await
            .context("创建临时清单文件失败")?;
        let mut body = response.body;
        let mut total = 0u64;
        while let Some(chunk) = body.next().await {
            let chunk = chunk?;
            total += chunk.len() as u64;
            if total > MAX_MANIFEST_SIZE {
                anyhow::bail!("清单超过大小上限 {} bytes", MAX_MANIFEST_SIZE);
            }
            file.write_all(&chunk).await.context("写入临时清单失败")?;
        }
        file.flush().await.context("刷新临时清单失败")?;

        debug!("清单已下载: {:?} ({} bytes)", temp_path, total);
        Ok(())
    }

    // ========== 下载 ==========

    /// 开始下载；已暂停的更新等同于恢复
    pub async fn start_download(&self, id: &str) -> UpdaterResult<()> {
        let mut state = self.inner.state.lock().await;
        let record = state.store.require(id)?;
        let (transient, persistent) = (record.transient_status, record.persistent_status);

        if transient.is_paused() {
            return self.inner.resume_locked(&mut state, id);
        }

        let startable = matches!(
            transient,
            TransientStatus::Idle | TransientStatus::VerificationFailed
        ) && matches!(
            persistent,
            PersistentStatus::Unknown | PersistentStatus::Incomplete
        );
        if !startable {
            return Err(UpdaterError::InvalidState {
                id: id.to_string(),
                status: transient,
            });
        }

        state.admission.acquire_pipeline(id, PipelineStage::Download)?;
        if let Err(e) = state.store.transition(
            id,
            TransientStatus::Starting,
            Some(PersistentStatus::Incomplete),
        ) {
            state.admission.release_pipeline(id);
            return Err(e);
        }

        info!("开始下载更新: {}", id);
        self.inner.spawn_fetch(&mut state, id)
    }

    /// 从上次的位置恢复下载；文件已完整时直接校验
    pub async fn resume_download(&self, id: &str) -> UpdaterResult<()> {
        let mut state = self.inner.state.lock().await;
        self.inner.resume_locked(&mut state, id)
    }

    /// 暂停下载，保留部分文件
    pub async fn pause_download(&self, id: &str) -> UpdaterResult<()> {
        let mut state = self.inner.state.lock().await;
        let transient = state.store.require(id)?.transient_status;

        match transient {
            TransientStatus::Starting | TransientStatus::Downloading => {
                self.inner.stop_worker(&mut state, id).await;
                if let Some(record) = state.store.get_mut(id) {
                    record.refresh_bytes_from_disk();
                }
                state.store.transition(id, TransientStatus::Paused, None)?;
                info!("下载已暂停: {}", id);
                Ok(())
            }
            TransientStatus::Paused | TransientStatus::PausedError => Ok(()),
            status => Err(UpdaterError::InvalidState {
                id: id.to_string(),
                status,
            }),
        }
    }

    /// 取消下载：停止传输并删除部分文件，回到 IDLE/UNKNOWN
    pub async fn cancel_download(&self, id: &str) -> UpdaterResult<()> {
        let mut state = self.inner.state.lock().await;
        self.inner.discard_locked(&mut state, id, false).await
    }

    /// 删除更新：停止活动、删除本地文件、重置状态；已下线的记录同时移除
    pub async fn delete_update(&self, id: &str) -> UpdaterResult<()> {
        let mut state = self.inner.state.lock().await;
        self.inner.discard_locked(&mut state, id, true).await
    }

    // ========== 安装 ==========

    /// 开始安装已校验的更新
    pub async fn start_install(&self, id: &str) -> UpdaterResult<()> {
        let mut state = self.inner.state.lock().await;
        let record = state.store.require(id)?.clone();

        state.admission.ensure_idle(id)?;
        if record.persistent_status != PersistentStatus::Verified {
            return Err(UpdaterError::InstallNotEligible(
                crate::error::IneligibleReason::NotVerified,
            ));
        }
        // 取消安装后回到 IDLE，文件仍是已校验的
        if !matches!(
            record.transient_status,
            TransientStatus::Verified | TransientStatus::Idle
        ) {
            return Err(UpdaterError::InvalidState {
                id: id.to_string(),
                status: record.transient_status,
            });
        }

        self.inner
            .coordinator
            .check_eligibility(&record)
            .await
            .map_err(UpdaterError::InstallNotEligible)?;

        state.admission.acquire_install(id)?;
        let session = state.next_session();
        let topology = self.inner.coordinator.topology();
        state.install = Some(InstallSession {
            id: id.to_string(),
            topology,
            session,
        });
        if let Some(r) = state.store.get_mut(id) {
            r.install_progress = 0;
            r.finalizing = false;
            r.last_error = None;
        }
        state
            .store
            .transition(id, TransientStatus::Installing, None)?;

        info!("开始安装更新: id={}, 拓扑={:?}", id, topology);

        match topology {
            InstallTopology::Seamless => {
                let installer = self.inner.coordinator.installer();
                match installer.trigger_seamless_install(&record.local_file).await {
                    Ok(rx) => {
                        tokio::spawn(forward_install_progress(
                            session,
                            rx,
                            self.inner.reports.clone(),
                        ));
                        Ok(())
                    }
                    Err(e) => {
                        let message = format!("{:#}", e);
                        self.inner.fail_install(&mut state, id, &message);
                        Err(UpdaterError::InstallerFailure(message))
                    }
                }
            }
            InstallTopology::Recovery => {
                let inner = Arc::clone(&self.inner);
                tokio::spawn(async move {
                    let result = async {
                        let path = inner.coordinator.prepare_recovery_package(&record).await?;
                        inner
                            .coordinator
                            .installer()
                            .trigger_recovery_install(&path)
                            .await
                    }
                    .await
                    .map_err(|e| format!("{:#}", e));
                    let _ = inner
                        .reports
                        .send(WorkerReport::RecoveryDone { session, result });
                });
                Ok(())
            }
            InstallTopology::Unsupported => {
                let message = "当前设备不支持安装".to_string();
                self.inner.fail_install(&mut state, id, &message);
                Err(UpdaterError::InstallerFailure(message))
            }
        }
    }

    /// 取消安装，只对无缝安装有效；没有安装进行时什么也不做
    pub async fn cancel_install(&self) -> UpdaterResult<()> {
        let mut state = self.inner.state.lock().await;
        let Some(session) = state.install.clone() else {
            return Ok(());
        };
        if !session.is_seamless() {
            return Err(UpdaterError::InstallNotCancellable);
        }

        self.inner
            .coordinator
            .installer()
            .cancel_seamless_install()
            .await
            .map_err(|e| UpdaterError::InstallerFailure(format!("{:#}", e)))?;

        state.install = None;
        state.admission.release_install(&session.id);
        if let Some(r) = state.store.get_mut(&session.id) {
            r.install_progress = 0;
            r.finalizing = false;
        }
        state
            .store
            .transition(&session.id, TransientStatus::Idle, None)?;
        info!("安装已取消: {}", session.id);
        Ok(())
    }

    pub async fn reboot(&self) -> UpdaterResult<()> {
        info!("请求重启设备");
        self.inner
            .coordinator
            .installer()
            .reboot()
            .await
            .map_err(|e| UpdaterError::InstallerFailure(format!("{:#}", e)))
    }

    /// 按操作类型分发
    pub async fn perform(&self, action: UpdateAction, id: &str) -> UpdaterResult<ActionOutcome> {
        debug!("执行操作: {:?} id={}", action, id);
        match action {
            UpdateAction::Download => self.start_download(id).await?,
            UpdateAction::Pause => self.pause_download(id).await?,
            UpdateAction::Resume => self.resume_download(id).await?,
            UpdateAction::Install => self.start_install(id).await?,
            UpdateAction::Delete => self.delete_update(id).await?,
            UpdateAction::CancelInstallation => self.cancel_install().await?,
            UpdateAction::Reboot => self.reboot().await?,
            UpdateAction::CheckUpdates => {
                let new_updates = self.check_for_updates(CheckTrigger::Manual).await?;
                return Ok(ActionOutcome::Checked { new_updates });
            }
            UpdateAction::Info => {
                let record = self
                    .get(id)
                    .await
                    .ok_or_else(|| UpdaterError::UnknownUpdate(id.to_string()))?;
                let can_install = self.can_install(&record);
                let reason = (!can_install)
                    .then(|| crate::error::IneligibleReason::UnsupportedPackage.to_string());
                return Ok(ActionOutcome::Info {
                    can_install,
                    topology: self.topology(),
                    reason,
                });
            }
        }
        Ok(ActionOutcome::Done)
    }

    /// 停止正在进行的下载/校验（进程退出前调用）
    pub async fn shutdown(&self) {
        let mut state = self.inner.state.lock().await;
        let Some(worker) = state.worker.as_ref() else {
            return;
        };
        let id = worker.id.clone();
        info!("停止后台任务: {}", id);
        self.inner.stop_worker(&mut state, &id).await;
        if let Some(record) = state.store.get_mut(&id) {
            record.refresh_bytes_from_disk();
        }
        if let Err(e) = state.store.transition(&id, TransientStatus::Paused, None) {
            warn!("更新状态失败: {}", e);
        }
    }

    // ========== 查询 ==========

    pub async fn get(&self, id: &str) -> Option<UpdateRecord> {
        self.inner.state.lock().await.store.get(id).cloned()
    }

    /// 所有更新，从新到旧
    pub async fn all(&self) -> Vec<UpdateRecord> {
        self.inner.state.lock().await.store.all()
    }

    pub fn can_install(&self, record: &UpdateRecord) -> bool {
        self.inner.coordinator.can_install(record)
    }

    pub async fn has_active_downloads(&self) -> bool {
        self.inner.state.lock().await.admission.has_active_download()
    }

    /// `id` 为 None 时表示任意更新
    pub async fn is_verifying_update(&self, id: Option<&str>) -> bool {
        self.inner.state.lock().await.admission.is_verifying(id)
    }

    pub async fn is_installing_update(&self, id: Option<&str>) -> bool {
        self.inner.state.lock().await.admission.is_installing(id)
    }

    pub async fn is_installing_seamless(&self) -> bool {
        let state = self.inner.state.lock().await;
        state.install.as_ref().map_or(false, |s| s.is_seamless())
    }

    pub async fn is_busy(&self) -> bool {
        self.inner.state.lock().await.admission.is_busy()
    }

    pub fn is_waiting_for_reboot(&self, id: &str) -> bool {
        self.inner.is_waiting_for_reboot(id)
    }

    pub async fn view(&self, id: &str) -> Option<UpdateView> {
        let state = self.inner.state.lock().await;
        let record = state.store.get(id)?.clone();
        Some(self.inner.view_of(&state, record))
    }

    /// 所有更新的快照（含主操作）
    pub async fn views(&self) -> Vec<UpdateView> {
        let state = self.inner.state.lock().await;
        state
            .store
            .all()
            .into_iter()
            .map(|record| self.inner.view_of(&state, record))
            .collect()
    }

    pub async fn status(&self) -> ControllerStatus {
        let state = self.inner.state.lock().await;
        let (downloading, verifying) = match state.admission.pipeline() {
            Some((id, PipelineStage::Download)) => (Some(id.to_string()), None),
            Some((id, PipelineStage::Verify)) => (None, Some(id.to_string())),
            None => (None, None),
        };
        ControllerStatus {
            busy: state.admission.is_busy(),
            downloading,
            verifying,
            installing: state.admission.install_owner().map(str::to_string),
            installing_seamless: state.install.as_ref().map_or(false, |s| s.is_seamless()),
            checking: self.inner.checks.is_checking(),
            topology: self.topology(),
            last_update_check: self.inner.prefs.last_update_check(),
            update_count: state.store.len(),
        }
    }

    // ========== 设置 ==========

    pub fn settings(&self) -> UpdaterSettings {
        let prefs = &self.inner.prefs;
        UpdaterSettings {
            check_interval: self.check_interval(),
            performance_mode: prefs.performance_mode(),
            recovery_update: prefs.recovery_update(),
            has_seen_info_dialog: prefs.has_seen_info_dialog(),
        }
    }

    pub fn check_interval(&self) -> CheckInterval {
        self.inner
            .prefs
            .check_interval(self.inner.default_check_interval)
    }

    pub fn last_update_check(&self) -> Option<i64> {
        self.inner.prefs.last_update_check()
    }

    pub fn set_check_interval(&self, interval: CheckInterval) -> UpdaterResult<()> {
        self.inner.prefs.set_check_interval(interval)?;
        info!("自动检查间隔已设置为 {:?}", interval);
        self.inner.settings_changed.notify_one();
        Ok(())
    }

    /// 性能模式：保存并转交给安装器
    pub async fn set_performance_mode(&self, enabled: bool) -> UpdaterResult<()> {
        self.inner.prefs.set_performance_mode(enabled)?;
        self.inner
            .coordinator
            .installer()
            .set_performance_mode(enabled)
            .await
            .map_err(|e| UpdaterError::InstallerFailure(format!("{:#}", e)))
    }

    pub fn set_recovery_update(&self, enabled: bool) -> UpdaterResult<()> {
        self.inner.prefs.set_recovery_update(enabled)
    }

    pub fn set_has_seen_info_dialog(&self, seen: bool) -> UpdaterResult<()> {
        self.inner.prefs.set_has_seen_info_dialog(seen)
    }

    /// 等待检查间隔设置变化
    pub async fn settings_changed(&self) {
        self.inner.settings_changed.notified().await
    }
}

impl ControllerInner {
    fn is_waiting_for_reboot(&self, id: &str) -> bool {
        self.prefs
            .reboot_marker()
            .map_or(false, |m| m.id == id && m.boot_id == self.boot_id)
    }

    fn apply_reboot_marker(&self, state: &mut ControllerState) {
        let Some(marker) = self.prefs.reboot_marker() else {
            return;
        };
        if marker.boot_id != self.boot_id {
            return;
        }
        let Some(record) = state.store.get(&marker.id) else {
            return;
        };
        if matches!(
            record.transient_status,
            TransientStatus::Verified | TransientStatus::Installed
        ) {
            if let Err(e) = state
                .store
                .transition(&marker.id, TransientStatus::WaitingReboot, None)
            {
                warn!("恢复等待重启状态失败: {}", e);
            }
        }
    }

    fn view_of(&self, state: &ControllerState, record: UpdateRecord) -> UpdateView {
        let can_install = self.coordinator.can_install(&record);
        let waiting_for_reboot = self.is_waiting_for_reboot(&record.id);
        let ctx = ActionContext {
            busy: state.admission.is_busy(),
            installing_seamless: state.install.as_ref().map_or(false, |s| s.is_seamless()),
            waiting_for_reboot,
            can_install,
        };
        UpdateView {
            download_progress: record.download_progress(),
            can_install,
            waiting_for_reboot,
            primary_action: primary_action(&record, &ctx),
            record,
        }
    }

    fn resume_locked(self: &Arc<Self>, state: &mut ControllerState, id: &str) -> UpdaterResult<()> {
        let transient = state.store.require(id)?.transient_status;
        if !transient.is_paused() {
            return Err(UpdaterError::InvalidState {
                id: id.to_string(),
                status: transient,
            });
        }

        state.admission.acquire_pipeline(id, PipelineStage::Download)?;

        let complete = match state.store.get_mut(id) {
            Some(record) => {
                record.refresh_bytes_from_disk();
                record.last_error = None;
                record.is_download_complete()
            }
            None => false,
        };

        if complete {
            info!("文件已完整，直接校验: {}", id);
            state.admission.advance_to_verify(id);
            state.store.transition(
                id,
                TransientStatus::Verifying,
                Some(PersistentStatus::Incomplete),
            )?;
            return self.spawn_verify(state, id);
        }

        if let Err(e) = state.store.transition(
            id,
            TransientStatus::Starting,
            Some(PersistentStatus::Incomplete),
        ) {
            state.admission.release_pipeline(id);
            return Err(e);
        }
        info!("恢复下载: {}", id);
        self.spawn_fetch(state, id)
    }

    async fn discard_locked(
        &self,
        state: &mut ControllerState,
        id: &str,
        remove_offline: bool,
    ) -> UpdaterResult<()> {
        let record = state.store.require(id)?;
        if record.transient_status == TransientStatus::Installing {
            return Err(UpdaterError::InvalidState {
                id: id.to_string(),
                status: record.transient_status,
            });
        }
        let local_file = record.local_file.clone();

        self.stop_worker(state, id).await;

        match tokio::fs::remove_file(&local_file).await {
            Ok(()) => info!("已删除更新文件: {:?}", local_file),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!("删除更新文件失败: {:?}, 错误: {}", local_file, e),
        }

        state.store.reset(id, TransientStatus::Idle)?;
        if let Some(r) = state.store.get_mut(id) {
            r.last_error = None;
        }

        if self.prefs.reboot_marker().map_or(false, |m| m.id == id) {
            self.prefs.clear_reboot_marker()?;
        }

        let offline = state
            .store
            .get(id)
            .map_or(false, |r| !r.available_online);
        if remove_offline && offline {
            state.store.delete(id);
        }
        Ok(())
    }

    /// 停止该更新的下载/校验工作者并等待其退出
    async fn stop_worker(&self, state: &mut ControllerState, id: &str) {
        if state.worker.as_ref().map(|w| w.id.as_str()) != Some(id) {
            return;
        }
        if let Some(worker) = state.worker.take() {
            worker.cancel.cancel();
            if let Err(e) = worker.handle.await {
                error!("后台任务异常退出: id={}, 错误: {}", id, e);
            }
        }
        state.admission.release_pipeline(id);
    }

    fn spawn_fetch(self: &Arc<Self>, state: &mut ControllerState, id: &str) -> UpdaterResult<()> {
        let record = state.store.require(id)?;
        let request = FetchRequest {
            id: id.to_string(),
            url: record.download_url.clone(),
            dest: record.local_file.clone(),
            expected_size: record.expected_size,
        };

        let session = state.next_session();
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let fetcher = self.fetcher.clone();
        let tx = self.reports.clone();

        let handle = tokio::spawn(async move {
            let progress_tx = tx.clone();
            let outcome = fetcher
                .run(request, token, move |event| {
                    let _ = progress_tx.send(WorkerReport::Fetch { session, event });
                })
                .await;
            let _ = tx.send(WorkerReport::FetchDone { session, outcome });
        });

        state.worker = Some(PipelineWorker {
            id: id.to_string(),
            session,
            cancel,
            handle,
        });
        Ok(())
    }

    fn spawn_verify(self: &Arc<Self>, state: &mut ControllerState, id: &str) -> UpdaterResult<()> {
        let record = state.store.require(id)?;
        let path = record.local_file.clone();
        let checksum = record.expected_checksum.clone();

        let session = state.next_session();
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let tx = self.reports.clone();

        let handle = tokio::spawn(async move {
            let result = Verifier::verify(&path, &checksum, token)
                .await
                .map_err(|e| format!("{:#}", e));
            let _ = tx.send(WorkerReport::VerifyDone { session, result });
        });

        state.worker = Some(PipelineWorker {
            id: id.to_string(),
            session,
            cancel,
            handle,
        });
        Ok(())
    }

    fn fail_install(&self, state: &mut ControllerState, id: &str, message: &str) {
        error!("安装失败: id={}, 错误: {}", id, message);
        state.install = None;
        state.admission.release_install(id);
        if let Some(r) = state.store.get_mut(id) {
            r.last_error = Some(message.to_string());
            r.finalizing = false;
        }
        if let Err(e) = state.store.transition(id, TransientStatus::Verified, None) {
            warn!("更新状态失败: {}", e);
        }
        self.events.publish(UpdateEvent::Failed {
            id: id.to_string(),
            kind: FailureKind::Installer,
            message: message.to_string(),
        });
    }

    async fn apply_report(self: &Arc<Self>, report: WorkerReport) {
        let mut state = self.state.lock().await;
        let state = &mut *state;

        match report {
            WorkerReport::Fetch { session, event } => {
                let Some(id) = state.worker_id(session) else {
                    return;
                };
                self.on_fetch_event(state, &id, event);
            }
            WorkerReport::FetchDone { session, outcome } => {
                let Some(worker) = state.take_worker(session) else {
                    debug!("忽略过期的下载结果: session={}", session);
                    return;
                };
                self.on_fetch_done(state, worker, outcome);
            }
            WorkerReport::VerifyDone { session, result } => {
                let Some(worker) = state.take_worker(session) else {
                    debug!("忽略过期的校验结果: session={}", session);
                    return;
                };
                self.on_verify_done(state, &worker.id, result).await;
            }
            WorkerReport::Install { session, progress } => {
                let Some(id) = state.install_id(session) else {
                    return;
                };
                self.on_install_progress(state, &id, progress);
            }
            WorkerReport::RecoveryDone { session, result } => {
                let Some(id) = state.install_id(session) else {
                    return;
                };
                match result {
                    Ok(()) => {
                        info!("恢复模式已接收更新包: {}", id);
                        state.install = None;
                        state.admission.release_install(&id);
                        self.finish_install(state, &id, None);
                    }
                    Err(message) => self.fail_install(state, &id, &message),
                }
            }
        }
    }

    fn on_fetch_event(&self, state: &mut ControllerState, id: &str, event: FetchEvent) {
        match event {
            FetchEvent::Connected { resumed, offset } => {
                debug!("下载已连接: id={}, resumed={}, offset={}", id, resumed, offset);
                state.set_bytes(id, offset);
                if let Err(e) = state
                    .store
                    .transition(id, TransientStatus::Downloading, None)
                {
                    warn!("更新状态失败: {}", e);
                }
            }
            FetchEvent::Progress { bytes } => {
                state.set_bytes(id, bytes);
                if let Some(record) = state.store.get(id) {
                    self.events.publish(UpdateEvent::DownloadProgress {
                        id: id.to_string(),
                        bytes_downloaded: record.bytes_downloaded,
                        expected_size: record.expected_size,
                        percent: record.download_progress(),
                    });
                }
            }
        }
    }

    fn on_fetch_done(
        self: &Arc<Self>,
        state: &mut ControllerState,
        worker: PipelineWorker,
        outcome: FetchOutcome,
    ) {
        let id = worker.id;
        match outcome {
            FetchOutcome::Completed { bytes } => {
                state.set_bytes(&id, bytes);
                state.admission.advance_to_verify(&id);
                let verifying = state.store.transition(
                    &id,
                    TransientStatus::Verifying,
                    Some(PersistentStatus::Incomplete),
                );
                if let Err(e) = verifying.and_then(|_| self.spawn_verify(state, &id)) {
                    warn!("启动校验失败: id={}, 错误: {}", id, e);
                    state.admission.release_pipeline(&id);
                    let _ = state.store.transition(&id, TransientStatus::PausedError, None);
                }
            }
            FetchOutcome::Failed { bytes, error } => {
                state.set_bytes(&id, bytes);
                state.admission.release_pipeline(&id);
                if let Some(record) = state.store.get_mut(&id) {
                    record.last_error = Some(error.clone());
                }
                if let Err(e) = state
                    .store
                    .transition(&id, TransientStatus::PausedError, None)
                {
                    warn!("更新状态失败: {}", e);
                }
                self.events.publish(UpdateEvent::Failed {
                    id,
                    kind: FailureKind::Transport,
                    message: error,
                });
            }
            FetchOutcome::Cancelled { bytes } => {
                state.set_bytes(&id, bytes);
                state.admission.release_pipeline(&id);
                let _ = state.store.transition(&id, TransientStatus::Paused, None);
            }
        }
    }

    async fn on_verify_done(
        &self,
        state: &mut ControllerState,
        id: &str,
        result: Result<VerifyOutcome, String>,
    ) {
        state.admission.release_pipeline(id);

        let message = match result {
            Ok(VerifyOutcome::Match) => {
                info!("更新校验通过: {}", id);
                if let Err(e) = state.store.transition(
                    id,
                    TransientStatus::Verified,
                    Some(PersistentStatus::Verified),
                ) {
                    warn!("保存校验状态失败: {}", e);
                }
                return;
            }
            Ok(VerifyOutcome::Cancelled) => {
                let _ = state.store.transition(id, TransientStatus::Paused, None);
                return;
            }
            Ok(VerifyOutcome::Mismatch { expected, actual }) => {
                UpdaterError::ChecksumMismatch { expected, actual }.to_string()
            }
            Err(e) => e,
        };

        warn!("更新校验失败: id={}, {}", id, message);
        if let Some(record) = state.store.get(id) {
            let path = record.local_file.clone();
            if let Err(e) = tokio::fs::remove_file(&path).await {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!("删除校验失败的文件失败: {:?}, 错误: {}", path, e);
                }
            }
        }
        if let Err(e) = state.store.reset(id, TransientStatus::VerificationFailed) {
            warn!("重置状态失败: {}", e);
        }
        if let Some(record) = state.store.get_mut(id) {
            record.last_error = Some(message.clone());
        }
        self.events.publish(UpdateEvent::Failed {
            id: id.to_string(),
            kind: FailureKind::ChecksumMismatch,
            message,
        });
    }

    fn on_install_progress(&self, state: &mut ControllerState, id: &str, progress: SeamlessProgress) {
        match progress {
            SeamlessProgress::Progress { percent, finalizing } => {
                if let Some(record) = state.store.get_mut(id) {
                    record.install_progress = percent.min(100);
                    record.finalizing = finalizing;
                }
                self.events.publish(UpdateEvent::InstallProgress {
                    id: id.to_string(),
                    percent: percent.min(100),
                    finalizing,
                });
            }
            SeamlessProgress::Completed => {
                info!("无缝安装完成: {}", id);
                state.install = None;
                state.admission.release_install(id);
                self.finish_install(state, id, Some(PersistentStatus::Installed));
            }
            SeamlessProgress::Failed(message) => self.fail_install(state, id, &message),
        }
    }

    /// 安装完成：进入等待重启，并记录当前启动 ID
    fn finish_install(
        &self,
        state: &mut ControllerState,
        id: &str,
        persistent: Option<PersistentStatus>,
    ) {
        if let Some(record) = state.store.get_mut(id) {
            record.install_progress = 100;
            record.finalizing = false;
        }
        if let Err(e) = state
            .store
            .transition(id, TransientStatus::WaitingReboot, persistent)
        {
            warn!("更新状态失败: {}", e);
        }
        let marker = RebootMarker {
            id: id.to_string(),
            boot_id: self.boot_id.clone(),
        };
        if let Err(e) = self.prefs.set_reboot_marker(&marker) {
            warn!("保存重启标记失败: {}", e);
        }
    }
}

/// 事件循环：把工作者报告应用到状态上
async fn run_reactor(inner: Weak<ControllerInner>, mut rx: mpsc::UnboundedReceiver<WorkerReport>) {
    while let Some(report) = rx.recv().await {
        let Some(inner) = inner.upgrade() else {
            break;
        };
        inner.apply_report(report).await;
    }
    debug!("控制器事件循环已退出");
}

/// 把安装器的进度流转发到事件循环；流意外结束时报告失败
async fn forward_install_progress(
    session: u64,
    mut rx: mpsc::Receiver<SeamlessProgress>,
    tx: mpsc::UnboundedSender<WorkerReport>,
) {
    while let Some(progress) = rx.recv().await {
        let terminal = !matches!(progress, SeamlessProgress::Progress { .. });
        if tx.send(WorkerReport::Install { session, progress }).is_err() || terminal {
            return;
        }
    }
    let _ = tx.send(WorkerReport::Install {
        session,
        progress: SeamlessProgress::Failed("安装器意外结束".to_string()),
    });
}
