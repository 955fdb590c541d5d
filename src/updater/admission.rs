//! 准入控制
//!
//! 系统中同时最多只有一条"下载 + 校验"流水线和一个安装任务。
//! 任何活动进行中时，新的下载或安装请求立即被拒绝，不排队。
//!
//! 清单检查另有一个独立的原子锁，防止手动检查和后台检查同时进行。

use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

use crate::error::{UpdaterError, UpdaterResult};

/// 流水线当前阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStage {
    Download,
    Verify,
}

/// 下载/校验/安装的占用情况
///
/// 只在控制器锁内修改。
#[derive(Debug, Default)]
pub struct AdmissionSlot {
    pipeline: Option<(String, PipelineStage)>,
    install: Option<String>,
}

impl AdmissionSlot {
    pub fn new() -> Self {
        Self::default()
    }

    fn busy_reason(&self) -> Option<String> {
        if let Some((id, stage)) = &self.pipeline {
            let what = match stage {
                PipelineStage::Download => "正在下载",
                PipelineStage::Verify => "正在校验",
            };
            return Some(format!("{} {}", what, id));
        }
        self.install.as_ref().map(|id| format!("正在安装 {}", id))
    }

    /// 任何活动进行中时拒绝
    pub fn ensure_idle(&self, id: &str) -> UpdaterResult<()> {
        match self.busy_reason() {
            Some(reason) => {
                debug!("拒绝 {} 的请求: {}", id, reason);
                Err(UpdaterError::AlreadyBusy(reason))
            }
            None => Ok(()),
        }
    }

    /// 占用流水线
    pub fn acquire_pipeline(&mut self, id: &str, stage: PipelineStage) -> UpdaterResult<()> {
        self.ensure_idle(id)?;
        self.pipeline = Some((id.to_string(), stage));
        info!("流水线已分配: id={}, stage={:?}", id, stage);
        Ok(())
    }

    /// 下载完成后转入校验，不释放流水线
    pub fn advance_to_verify(&mut self, id: &str) {
        if let Some((owner, stage)) = &mut self.pipeline {
            if owner == id {
                *stage = PipelineStage::Verify;
            }
        }
    }

    pub fn release_pipeline(&mut self, id: &str) {
        if self.pipeline.as_ref().map(|(owner, _)| owner.as_str()) == Some(id) {
            self.pipeline = None;
            info!("流水线已释放: id={}", id);
        }
    }

    pub fn acquire_install(&mut self, id: &str) -> UpdaterResult<()> {
        self.ensure_idle(id)?;
        self.install = Some(id.to_string());
        info!("安装槽已分配: id={}", id);
        Ok(())
    }

    pub fn release_install(&mut self, id: &str) {
        if self.install.as_deref() == Some(id) {
            self.install = None;
            info!("安装槽已释放: id={}", id);
        }
    }

    pub fn pipeline(&self) -> Option<(&str, PipelineStage)> {
        self.pipeline
            .as_ref()
            .map(|(id, stage)| (id.as_str(), *stage))
    }

    pub fn install_owner(&self) -> Option<&str> {
        self.install.as_deref()
    }

    pub fn has_active_download(&self) -> bool {
        matches!(self.pipeline, Some((_, PipelineStage::Download)))
    }

    /// `id` 为 None 时检查是否有任意更新在校验
    pub fn is_verifying(&self, id: Option<&str>) -> bool {
        match &self.pipeline {
            Some((owner, PipelineStage::Verify)) => id.map_or(true, |id| owner == id),
            _ => false,
        }
    }

    pub fn is_installing(&self, id: Option<&str>) -> bool {
        match &self.install {
            Some(owner) => id.map_or(true, |id| owner == id),
            None => false,
        }
    }

    pub fn is_busy(&self) -> bool {
        self.pipeline.is_some() || self.install.is_some()
    }
}

/// 清单检查协调器
#[derive(Debug, Default)]
pub struct CheckCoordinator {
    checking: AtomicBool,
}

impl CheckCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// 尝试开始检查，已有检查进行中时返回 None
    pub fn try_acquire(self: &Arc<Self>) -> Option<CheckGuard> {
        self.checking
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| CheckGuard {
                coordinator: Arc::clone(self),
            })
    }

    pub fn is_checking(&self) -> bool {
        self.checking.load(Ordering::SeqCst)
    }
}

/// 检查守卫，销毁时自动释放
pub struct CheckGuard {
    coordinator: Arc<CheckCoordinator>,
}

impl Drop for CheckGuard {
    fn drop(&mut self) {
        self.coordinator.checking.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_download_rejected() {
        let mut slot = AdmissionSlot::new();
        slot.acquire_pipeline("a", PipelineStage::Download).unwrap();

        let err = slot
            .acquire_pipeline("b", PipelineStage::Download)
            .unwrap_err();
        assert!(matches!(err, UpdaterError::AlreadyBusy(_)));
        assert_eq!(slot.pipeline(), Some(("a", PipelineStage::Download)));
    }

    #[test]
    fn test_verify_blocks_download_and_install() {
        let mut slot = AdmissionSlot::new();
        slot.acquire_pipeline("a", PipelineStage::Download).unwrap();
        slot.advance_to_verify("a");

        assert!(slot.is_verifying(None));
        assert!(slot.is_verifying(Some("a")));
        assert!(!slot.is_verifying(Some("b")));
        assert!(!slot.has_active_download());
        assert!(slot.acquire_pipeline("b", PipelineStage::Download).is_err());
        assert!(slot.acquire_install("c").is_err());
    }

    #[test]
    fn test_install_blocks_download() {
        let mut slot = AdmissionSlot::new();
        slot.acquire_install("a").unwrap();
        assert!(slot.is_installing(Some("a")));
        assert!(slot.acquire_pipeline("b", PipelineStage::Download).is_err());

        slot.release_install("a");
        assert!(!slot.is_busy());
        slot.acquire_pipeline("b", PipelineStage::Download).unwrap();
    }

    #[test]
    fn test_release_by_non_owner_is_ignored() {
        let mut slot = AdmissionSlot::new();
        slot.acquire_pipeline("a", PipelineStage::Download).unwrap();
        slot.release_pipeline("b");
        assert!(slot.is_busy());
        slot.release_pipeline("a");
        assert!(!slot.is_busy());
    }

    #[test]
    fn test_check_guard() {
        let coordinator = Arc::new(CheckCoordinator::new());
        let guard = coordinator.try_acquire();
        assert!(guard.is_some());
        assert!(coordinator.try_acquire().is_none());
        assert!(coordinator.is_checking());

        drop(guard);
        assert!(!coordinator.is_checking());
        assert!(coordinator.try_acquire().is_some());
    }
}
