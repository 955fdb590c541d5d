//! 安装协调
//!
//! - `Installer`: 外部特权安装器接口（无缝安装 / 恢复模式安装 / 取消 / 重启）
//! - `CommandInstaller`: 通过配置的外部命令实现安装器
//! - `InstallCoordinator`: 安装路径选择、可安装判断和安装前置条件检查

use anyhow::{Context, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::device::{DevicePolicy, InstallTopology};
use super::record::{PersistentStatus, UpdateRecord};
use crate::config::InstallConfig;
use crate::error::IneligibleReason;

/// 无缝安装进度
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SeamlessProgress {
    Progress { percent: u8, finalizing: bool },
    Completed,
    Failed(String),
}

/// 外部安装器接口
#[async_trait]
pub trait Installer: Send + Sync {
    /// 开始后台无缝安装，返回进度流；流以 Completed 或 Failed 结束
    async fn trigger_seamless_install(&self, path: &Path) -> Result<mpsc::Receiver<SeamlessProgress>>;

    /// 把更新包交给恢复模式，成功返回即表示已接收
    async fn trigger_recovery_install(&self, path: &Path) -> Result<()>;

    async fn cancel_seamless_install(&self) -> Result<()>;

    async fn set_performance_mode(&self, enabled: bool) -> Result<()>;

    async fn reboot(&self) -> Result<()>;
}

/// 解析安装命令输出的一行进度
///
/// 支持 `progress <0-100>` 和 `finalizing <0-100>`，其余行忽略
pub fn parse_progress_line(line: &str) -> Option<SeamlessProgress> {
    let mut parts = line.split_whitespace();
    let kind = parts.next()?;
    let value: f64 = parts.next()?.trim_end_matches('%').parse().ok()?;
    let percent = value.clamp(0.0, 100.0) as u8;
    match kind {
        "progress" => Some(SeamlessProgress::Progress {
            percent,
            finalizing: false,
        }),
        "finalizing" => Some(SeamlessProgress::Progress {
            percent,
            finalizing: true,
        }),
        _ => None,
    }
}

/// 基于外部命令的安装器
pub struct CommandInstaller {
    config: InstallConfig,
    performance_mode: AtomicBool,
    running: Mutex<Option<CancellationToken>>,
}

impl CommandInstaller {
    pub fn new(config: InstallConfig) -> Self {
        Self {
            config,
            performance_mode: AtomicBool::new(false),
            running: Mutex::new(None),
        }
    }

    fn build_command(template: &[String], file: Option<&Path>) -> Result<Command> {
        let (program, args) = template.split_first().context("未配置安装命令")?;
        let file = file.map(|p| p.to_string_lossy().into_owned());
        let substitute = |s: &String| match &file {
            Some(f) => s.replace("{file}", f),
            None => s.clone(),
        };

        let mut command = Command::new(substitute(program));
        command.args(args.iter().map(substitute));
        Ok(command)
    }

    async fn run_to_completion(template: &[String], file: Option<&Path>) -> Result<()> {
        let mut command = Self::build_command(template, file)?;
        let status = command
            .status()
            .await
            .with_context(|| format!("启动命令失败: {:?}", template))?;
        if !status.success() {
            anyhow::bail!("命令退出状态异常: {}", status);
        }
        Ok(())
    }
}

#[async_trait]
impl Installer for CommandInstaller {
    async fn trigger_seamless_install(&self, path: &Path) -> Result<mpsc::Receiver<SeamlessProgress>> {
        let mut command = Self::build_command(&self.config.seamless_command, Some(path))?;
        command
            .env(
                "OTA_PERF_MODE",
                if self.performance_mode.load(Ordering::Relaxed) {
                    "1"
                } else {
                    "0"
                },
            )
            .stdout(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command.spawn().context("启动无缝安装命令失败")?;
        let stdout = child.stdout.take().context("无法读取安装命令输出")?;

        let token = CancellationToken::new();
        *self.running.lock() = Some(token.clone());

        let (tx, rx) = mpsc::channel(32);
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                tokio::select! {
                    _ = token.cancelled() => {
                        if let Err(e) = child.kill().await {
                            warn!("终止安装命令失败: {}", e);
                        }
                        let _ = tx.send(SeamlessProgress::Failed("安装已取消".to_string())).await;
                        return;
                    }
                    line = lines.next_line() => match line {
                        Ok(Some(line)) => {
                            if let Some(progress) = parse_progress_line(&line) {
                                let _ = tx.send(progress).await;
                            } else {
                                debug!("安装命令输出: {}", line);
                            }
                        }
                        _ => break,
                    },
                }
            }

            let result = match child.wait().await {
                Ok(status) if status.success() => SeamlessProgress::Completed,
                Ok(status) => SeamlessProgress::Failed(format!("安装命令退出状态异常: {}", status)),
                Err(e) => SeamlessProgress::Failed(format!("等待安装命令失败: {}", e)),
            };
            let _ = tx.send(result).await;
        });

        Ok(rx)
    }

    async fn trigger_recovery_install(&self, path: &Path) -> Result<()> {
        Self::run_to_completion(&self.config.recovery_command, Some(path)).await
    }

    async fn cancel_seamless_install(&self) -> Result<()> {
        if !self.config.cancel_command.is_empty() {
            Self::run_to_completion(&self.config.cancel_command, None).await?;
        }
        if let Some(token) = self.running.lock().take() {
            token.cancel();
        }
        Ok(())
    }

    async fn set_performance_mode(&self, enabled: bool) -> Result<()> {
        self.performance_mode.store(enabled, Ordering::Relaxed);
        Ok(())
    }

    async fn reboot(&self) -> Result<()> {
        Self::run_to_completion(&self.config.reboot_command, None).await
    }
}

/// 当前正在进行的安装
#[derive(Debug, Clone)]
pub struct InstallSession {
    pub id: String,
    pub topology: InstallTopology,
    pub session: u64,
}

impl InstallSession {
    pub fn is_seamless(&self) -> bool {
        self.topology == InstallTopology::Seamless
    }
}

/// 安装协调器
pub struct InstallCoordinator {
    topology: InstallTopology,
    installer: Arc<dyn Installer>,
    device: Arc<dyn DevicePolicy>,
    config: InstallConfig,
    build_timestamp: i64,
    allow_downgrade: bool,
}

impl InstallCoordinator {
    pub fn new(
        topology: InstallTopology,
        installer: Arc<dyn Installer>,
        device: Arc<dyn DevicePolicy>,
        config: InstallConfig,
        build_timestamp: i64,
        allow_downgrade: bool,
    ) -> Self {
        info!(
            "安装协调器就绪: 拓扑={:?}, 当前构建={}",
            topology, build_timestamp
        );
        Self {
            topology,
            installer,
            device,
            config,
            build_timestamp,
            allow_downgrade,
        }
    }

    pub fn topology(&self) -> InstallTopology {
        self.topology
    }

    pub fn installer(&self) -> &Arc<dyn Installer> {
        &self.installer
    }

    pub fn device(&self) -> &Arc<dyn DevicePolicy> {
        &self.device
    }

    /// 纯判断：拓扑接受该包类型，并且比当前系统新（除非允许降级）
    pub fn can_install(&self, record: &UpdateRecord) -> bool {
        self.topology.accepts(record.package_type)
            && (self.allow_downgrade || record.timestamp > self.build_timestamp)
    }

    /// 安装前置条件检查
    pub async fn check_eligibility(&self, record: &UpdateRecord) -> Result<(), IneligibleReason> {
        if record.persistent_status != PersistentStatus::Verified {
            return Err(IneligibleReason::NotVerified);
        }
        if !self.can_install(record) {
            return Err(IneligibleReason::UnsupportedPackage);
        }

        if let Some(battery) = self.device.battery().await {
            let required = self.config.required_battery(battery.charging);
            if battery.percent < required {
                return Err(IneligibleReason::LowBattery {
                    percent: battery.percent,
                    required,
                });
            }
        }

        let overlay = &self.config.overlay_mount_path;
        if self.device.is_overlay_mounted(overlay).await {
            return Err(IneligibleReason::OverlayMounted {
                path: overlay.clone(),
            });
        }

        Ok(())
    }

    /// 恢复模式安装使用的文件；配置了中转目录时先复制过去
    pub async fn prepare_recovery_package(&self, record: &UpdateRecord) -> Result<PathBuf> {
        let Some(staging_dir) = &self.config.recovery_staging_dir else {
            return Ok(record.local_file.clone());
        };

        tokio::fs::create_dir_all(staging_dir)
            .await
            .with_context(|| format!("创建中转目录失败: {:?}", staging_dir))?;
        let file_name = record
            .local_file
            .file_name()
            .context("更新包路径无文件名")?;
        let target = staging_dir.join(file_name);
        tokio::fs::copy(&record.local_file, &target)
            .await
            .with_context(|| format!("复制更新包到 {:?} 失败", target))?;

        info!("更新包已复制到恢复模式中转目录: {:?}", target);
        Ok(target)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::updater::device::BatteryState;
    use crate::updater::manifest::ManifestEntry;
    use crate::updater::record::PackageType;
    use tempfile::TempDir;

    struct FixedDevice {
        battery: Option<BatteryState>,
        overlay: bool,
    }

    #[async_trait]
    impl DevicePolicy for FixedDevice {
        async fn battery(&self) -> Option<BatteryState> {
            self.battery
        }
        async fn is_overlay_mounted(&self, _path: &Path) -> bool {
            self.overlay
        }
        async fn detect_topology(&self) -> InstallTopology {
            InstallTopology::Seamless
        }
        async fn boot_id(&self) -> Option<String> {
            None
        }
    }

    struct NoopInstaller;

    #[async_trait]
    impl Installer for NoopInstaller {
        async fn trigger_seamless_install(
            &self,
            _path: &Path,
        ) -> Result<mpsc::Receiver<SeamlessProgress>> {
            let (_tx, rx) = mpsc::channel(1);
            Ok(rx)
        }
        async fn trigger_recovery_install(&self, _path: &Path) -> Result<()> {
            Ok(())
        }
        async fn cancel_seamless_install(&self) -> Result<()> {
            Ok(())
        }
        async fn set_performance_mode(&self, _enabled: bool) -> Result<()> {
            Ok(())
        }
        async fn reboot(&self) -> Result<()> {
            Ok(())
        }
    }

    fn coordinator(
        topology: InstallTopology,
        battery: Option<BatteryState>,
        overlay: bool,
        config: InstallConfig,
    ) -> InstallCoordinator {
        InstallCoordinator::new(
            topology,
            Arc::new(NoopInstaller),
            Arc::new(FixedDevice { battery, overlay }),
            config,
            1_700_000_000,
            false,
        )
    }

    fn verified_record(dir: &Path) -> UpdateRecord {
        let entry = ManifestEntry {
            id: "a".to_string(),
            version: "2".to_string(),
            timestamp: 1_700_000_100,
            url: "https://ota.example.org/a.zip".to_string(),
            size: 4,
            checksum: "0".repeat(64),
            filename: None,
            package_type: Some(PackageType::Ab),
        };
        let mut record = UpdateRecord::from_entry(&entry, dir);
        record.persistent_status = PersistentStatus::Verified;
        record
    }

    fn battery(percent: u8, charging: bool) -> Option<BatteryState> {
        Some(BatteryState { percent, charging })
    }

    #[test]
    fn test_parse_progress_line() {
        assert_eq!(
            parse_progress_line("progress 42"),
            Some(SeamlessProgress::Progress {
                percent: 42,
                finalizing: false
            })
        );
        assert_eq!(
            parse_progress_line("finalizing 99.6%"),
            Some(SeamlessProgress::Progress {
                percent: 99,
                finalizing: true
            })
        );
        assert_eq!(parse_progress_line("progress 250"), Some(SeamlessProgress::Progress {
            percent: 100,
            finalizing: false
        }));
        assert_eq!(parse_progress_line("verifying payload"), None);
        assert_eq!(parse_progress_line(""), None);
    }

    #[test]
    fn test_can_install() {
        let dir = TempDir::new().unwrap();
        let mut record = verified_record(dir.path());
        let seamless = coordinator(InstallTopology::Seamless, None, false, InstallConfig::default());
        let recovery = coordinator(InstallTopology::Recovery, None, false, InstallConfig::default());

        assert!(seamless.can_install(&record));
        assert!(!recovery.can_install(&record));

        record.timestamp = 1_600_000_000;
        assert!(!seamless.can_install(&record));
    }

    #[tokio::test]
    async fn test_eligibility_battery_thresholds() {
        let dir = TempDir::new().unwrap();
        let record = verified_record(dir.path());
        let config = InstallConfig::default();

        let ok = coordinator(InstallTopology::Seamless, battery(25, true), false, config.clone());
        assert!(ok.check_eligibility(&record).await.is_ok());

        let low = coordinator(InstallTopology::Seamless, battery(25, false), false, config.clone());
        assert_eq!(
            low.check_eligibility(&record).await,
            Err(IneligibleReason::LowBattery {
                percent: 25,
                required: 30
            })
        );

        let no_battery = coordinator(InstallTopology::Seamless, None, false, config);
        assert!(no_battery.check_eligibility(&record).await.is_ok());
    }

    #[tokio::test]
    async fn test_eligibility_other_gates() {
        let dir = TempDir::new().unwrap();
        let mut record = verified_record(dir.path());
        let config = InstallConfig::default();

        let overlay = coordinator(InstallTopology::Seamless, battery(90, false), true, config.clone());
        assert!(matches!(
            overlay.check_eligibility(&record).await,
            Err(IneligibleReason::OverlayMounted { .. })
        ));

        let unsupported = coordinator(InstallTopology::Unsupported, None, false, config.clone());
        assert_eq!(
            unsupported.check_eligibility(&record).await,
            Err(IneligibleReason::UnsupportedPackage)
        );

        record.persistent_status = PersistentStatus::Incomplete;
        let ok = coordinator(InstallTopology::Seamless, None, false, config);
        assert_eq!(
            ok.check_eligibility(&record).await,
            Err(IneligibleReason::NotVerified)
        );
    }

    #[tokio::test]
    async fn test_prepare_recovery_package() {
        let dir = TempDir::new().unwrap();
        let record = verified_record(dir.path());
        std::fs::write(&record.local_file, b"data").unwrap();

        let direct = coordinator(InstallTopology::Recovery, None, false, InstallConfig::default());
        assert_eq!(
            direct.prepare_recovery_package(&record).await.unwrap(),
            record.local_file
        );

        let config = InstallConfig {
            recovery_staging_dir: Some(dir.path().join("staging")),
            ..InstallConfig::default()
        };
        let staged = coordinator(InstallTopology::Recovery, None, false, config);
        let target = staged.prepare_recovery_package(&record).await.unwrap();
        assert_eq!(target, dir.path().join("staging/a.zip"));
        assert_eq!(std::fs::read(target).unwrap(), b"data");
    }

    #[tokio::test]
    async fn test_command_installer_without_command_fails() {
        let installer = CommandInstaller::new(InstallConfig::default());
        assert!(installer
            .trigger_seamless_install(Path::new("/tmp/a.zip"))
            .await
            .is_err());
        assert!(installer
            .trigger_recovery_install(Path::new("/tmp/a.zip"))
            .await
            .is_err());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_command_installer_reports_progress() {
        let config = InstallConfig {
            seamless_command: vec![
                "sh".to_string(),
                "-c".to_string(),
                "echo progress 50; echo finalizing 10; echo done".to_string(),
            ],
            ..InstallConfig::default()
        };
        let installer = CommandInstaller::new(config);
        let mut rx = installer
            .trigger_seamless_install(Path::new("/tmp/a.zip"))
            .await
            .unwrap();

        let mut received = Vec::new();
        while let Some(progress) = rx.recv().await {
            received.push(progress);
        }
        assert_eq!(
            received,
            vec![
                SeamlessProgress::Progress {
                    percent: 50,
                    finalizing: false
                },
                SeamlessProgress::Progress {
                    percent: 10,
                    finalizing: true
                },
                SeamlessProgress::Completed,
            ]
        );
    }
}
