// 后台定时检查更新
//
// 按用户设置的间隔检查清单；失败时指数退避重试，超过最大次数后回到正常间隔。

use chrono::Utc;
use rand::Rng;
use serde::Serialize;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::controller::UpdateController;
use crate::error::UpdaterError;

/// 检查触发方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckTrigger {
    Manual,
    Background,
}

/// 指数退避策略
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    pub initial: Duration,
    pub multiplier: f64,
    pub max: Duration,
    pub max_retries: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(60),
            multiplier: 2.0,
            max: Duration::from_secs(3600),
            max_retries: 5,
        }
    }
}

impl BackoffPolicy {
    /// 第 `attempt` 次重试前的等待时间（从 1 开始），超过最大次数返回 None
    pub fn delay_for(&self, attempt: u32) -> Option<Duration> {
        if attempt == 0 || attempt > self.max_retries {
            return None;
        }
        let factor = self.multiplier.max(1.0).powi(attempt as i32 - 1);
        let secs = (self.initial.as_secs_f64() * factor).min(self.max.as_secs_f64());
        Some(Duration::from_secs_f64(secs))
    }
}

/// 距离下次到期还需等待多久
///
/// 从未检查过时立即到期；时钟回拨时按刚检查过处理。
pub fn time_until_due(interval: Duration, last_check_ms: Option<i64>, now_ms: i64) -> Duration {
    let Some(last) = last_check_ms else {
        return Duration::ZERO;
    };
    if last > now_ms {
        return interval;
    }
    let elapsed = Duration::from_millis((now_ms - last) as u64);
    interval.saturating_sub(elapsed)
}

/// 添加随机抖动（±10%）
fn add_jitter(interval: Duration, jitter_percent: f64) -> Duration {
    if interval.is_zero() || jitter_percent <= 0.0 {
        return interval;
    }
    let mut rng = rand::thread_rng();
    let jitter = 1.0 + rng.gen_range(-jitter_percent..jitter_percent);
    Duration::from_secs_f64(interval.as_secs_f64() * jitter)
}

/// 后台检查调度器
pub struct CheckScheduler {
    controller: UpdateController,
    backoff: BackoffPolicy,
    jitter_percent: f64,
}

impl CheckScheduler {
    pub fn new(controller: UpdateController, backoff: BackoffPolicy) -> Self {
        Self {
            controller,
            backoff,
            jitter_percent: 0.1,
        }
    }

    /// 设置抖动比例，0 表示不抖动
    pub fn with_jitter(mut self, jitter_percent: f64) -> Self {
        self.jitter_percent = jitter_percent.clamp(0.0, 0.5);
        self
    }

    /// 计算下一次等待时间，`None` 表示自动检查已关闭
    fn next_wait(&self, failures: u32, rest_full_interval: bool) -> Option<Duration> {
        if let Some(delay) = self.backoff.delay_for(failures) {
            return Some(delay);
        }
        let interval = self.controller.check_interval().as_duration()?;
        let wait = if rest_full_interval {
            interval
        } else {
            time_until_due(
                interval,
                self.controller.last_update_check(),
                Utc::now().timestamp_millis(),
            )
        };
        Some(add_jitter(wait, self.jitter_percent))
    }

    /// 运行直到 `shutdown` 被取消
    pub async fn run(self, shutdown: CancellationToken) {
        info!("后台检查调度器已启动");
        let mut failures = 0u32;
        let mut rest_full_interval = false;

        loop {
            let wait = self.next_wait(failures, rest_full_interval);
            rest_full_interval = false;

            match wait {
                None => {
                    debug!("自动检查已关闭，等待设置变化");
                    tokio::select! {
                        biased;
                        _ = shutdown.cancelled() => break,
                        _ = self.controller.settings_changed() => continue,
                    }
                }
                Some(wait) => {
                    debug!("下次检查更新: {:?} 后", wait);
                    tokio::select! {
                        biased;
                        _ = shutdown.cancelled() => break,
                        _ = self.controller.settings_changed() => {
                            debug!("检查间隔已变化，重新计算");
                            continue;
                        }
                        _ = tokio::time::sleep(wait) => {}
                    }
                }
            }

            match self
                .controller
                .check_for_updates(CheckTrigger::Background)
                .await
            {
                Ok(_) => failures = 0,
                Err(UpdaterError::AlreadyBusy(_)) => {
                    debug!("已有检查在进行中，稍后再试");
                    failures = failures.max(1);
                }
                Err(UpdaterError::Config(e)) => {
                    warn!("无法自动检查更新: {}", e);
                    failures = 0;
                    rest_full_interval = true;
                }
                Err(e) => {
                    failures += 1;
                    if self.backoff.delay_for(failures).is_none() {
                        warn!("后台检查连续失败 {} 次，回到正常间隔: {}", failures, e);
                        failures = 0;
                        rest_full_interval = true;
                    } else {
                        warn!("后台检查失败（第 {} 次）: {}", failures, e);
                    }
                }
            }
        }

        info!("后台检查调度器已停止");
    }
}
