//! 进度事件节流器
//!
//! 状态事件从不丢弃；进度事件按时间间隔合并，避免事件风暴

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// 默认节流间隔（毫秒）
pub const DEFAULT_THROTTLE_INTERVAL_MS: u64 = 500;

/// 进度事件节流器
///
/// 每个下载/安装会话持有一个。调用 `should_emit()` 返回 true 时才发布进度事件，
/// 最后一次进度用 `force_emit()` 保证送达。
#[derive(Debug)]
pub struct ProgressThrottler {
    origin: Instant,
    /// 上次发布距 origin 的纳秒数，`u64::MAX` 表示尚未发布
    last_emit_nanos: AtomicU64,
    interval_nanos: u64,
}

impl ProgressThrottler {
    pub fn new(interval: Duration) -> Self {
        Self {
            origin: Instant::now(),
            last_emit_nanos: AtomicU64::new(u64::MAX),
            interval_nanos: interval.as_nanos().min(u64::MAX as u128 - 1) as u64,
        }
    }

    pub fn with_millis(interval_ms: u64) -> Self {
        Self::new(Duration::from_millis(interval_ms))
    }

    /// 距离上次发布超过间隔时返回 true 并记录本次时间
    pub fn should_emit(&self) -> bool {
        let now = self.elapsed_nanos();
        let last = self.last_emit_nanos.load(Ordering::Relaxed);

        if last != u64::MAX && now.saturating_sub(last) < self.interval_nanos {
            return false;
        }

        // 被其他线程抢先更新时本次不发布
        self.last_emit_nanos
            .compare_exchange(last, now, Ordering::Relaxed, Ordering::Relaxed)
            .is_ok()
    }

    /// 强制发布（完成时的最后一次进度）
    pub fn force_emit(&self) -> bool {
        self.last_emit_nanos
            .store(self.elapsed_nanos(), Ordering::Relaxed);
        true
    }

    pub fn reset(&self) {
        self.last_emit_nanos.store(u64::MAX, Ordering::Relaxed);
    }

    fn elapsed_nanos(&self) -> u64 {
        self.origin.elapsed().as_nanos() as u64
    }
}

impl Default for ProgressThrottler {
    fn default() -> Self {
        Self::with_millis(DEFAULT_THROTTLE_INTERVAL_MS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_first_call_emits() {
        let throttler = ProgressThrottler::with_millis(100);
        assert!(throttler.should_emit());
        assert!(!throttler.should_emit());
    }

    #[test]
    fn test_emits_after_interval() {
        let throttler = ProgressThrottler::with_millis(30);
        assert!(throttler.should_emit());
        thread::sleep(Duration::from_millis(40));
        assert!(throttler.should_emit());
    }

    #[test]
    fn test_force_and_reset() {
        let throttler = ProgressThrottler::with_millis(10_000);
        assert!(throttler.should_emit());
        assert!(throttler.force_emit());
        assert!(!throttler.should_emit());

        throttler.reset();
        assert!(throttler.should_emit());
    }

    #[test]
    fn test_shared_across_threads() {
        let throttler = std::sync::Arc::new(ProgressThrottler::with_millis(10_000));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let t = throttler.clone();
                thread::spawn(move || t.should_emit())
            })
            .collect();
        let emitted = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|e| *e)
            .count();
        assert_eq!(emitted, 1);
    }
}
