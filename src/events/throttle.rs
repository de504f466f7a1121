//! 进度事件节流
//!
//! 进度事件发布频率很高，按固定时间间隔节流，关键节点用 `force_emit` 强制放行。

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// 默认节流间隔（毫秒）
pub const DEFAULT_THROTTLE_INTERVAL_MS: u64 = 200;

/// 时间节流器
///
/// 无锁实现：以创建时刻为基准记录上次放行的纳秒偏移，CAS 更新保证并发下
/// 同一窗口只放行一次。
#[derive(Debug)]
pub struct ProgressThrottler {
    /// 基准时刻
    epoch: Instant,
    /// 上次放行时间（相对 epoch 的纳秒数）
    last_emit_nanos: AtomicU64,
    /// 节流间隔（纳秒）
    interval_nanos: u64,
}

impl ProgressThrottler {
    pub fn new(interval: Duration) -> Self {
        Self {
            epoch: Instant::now(),
            last_emit_nanos: AtomicU64::new(0),
            interval_nanos: interval.as_nanos() as u64,
        }
    }

    /// 使用指定毫秒间隔创建
    pub fn with_millis(interval_ms: u64) -> Self {
        Self::new(Duration::from_millis(interval_ms))
    }

    /// 是否放行本次事件
    ///
    /// 距上次放行超过间隔时返回 true 并推进时间戳；CAS 失败说明被并发
    /// 调用抢先，本次不放行。首次调用总是放行。
    pub fn should_emit(&self) -> bool {
        let now = self.epoch.elapsed().as_nanos() as u64;
        let last = self.last_emit_nanos.load(Ordering::Relaxed);

        if last != 0 && now.saturating_sub(last) < self.interval_nanos {
            return false;
        }

        self.last_emit_nanos
            .compare_exchange(last, now.max(1), Ordering::Relaxed, Ordering::Relaxed)
            .is_ok()
    }

    /// 强制放行（用于最后一个分片或完成事件）
    pub fn force_emit(&self) {
        let now = self.epoch.elapsed().as_nanos() as u64;
        self.last_emit_nanos.store(now.max(1), Ordering::Relaxed);
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
    fn test_first_emit_allowed() {
        let throttler = ProgressThrottler::with_millis(1000);
        assert!(throttler.should_emit());
        assert!(!throttler.should_emit());
    }

    #[test]
    fn test_emit_after_interval() {
        let throttler = ProgressThrottler::with_millis(30);
        assert!(throttler.should_emit());
        thread::sleep(Duration::from_millis(50));
        assert!(throttler.should_emit());
    }

    #[test]
    fn test_force_emit_advances_window() {
        let throttler = ProgressThrottler::with_millis(1000);
        assert!(throttler.should_emit());
        throttler.force_emit();
        // force 之后窗口重新计时
        assert!(!throttler.should_emit());
    }
}
