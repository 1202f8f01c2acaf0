//! 时间源抽象。
//!
//! 代理黑名单窗口、重试退避都通过 [`Clock`] 取时间和等待，
//! 测试里换成 [`ManualClock`] 就能在不真正睡眠的情况下推进时间。

#[cfg(test)]
use std::sync::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
    fn sleep(&self, duration: Duration);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

/// 手动推进的时钟；`sleep` 直接把时间往前拨。
#[cfg(test)]
#[derive(Debug)]
pub struct ManualClock {
    base: Instant,
    offset: Mutex<Duration>,
}

#[cfg(test)]
impl ManualClock {
    pub fn new() -> Self {
        Self {
            base: Instant::now(),
            offset: Mutex::new(Duration::ZERO),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut offset = self.offset.lock().unwrap_or_else(|e| e.into_inner());
        *offset += by;
    }

    pub fn elapsed(&self) -> Duration {
        *self.offset.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.base + self.elapsed()
    }

    fn sleep(&self, duration: Duration) {
        self.advance(duration);
    }
}

const SLEEP_SLICE: Duration = Duration::from_millis(200);

/// 可被取消的等待：按 200ms 切片睡眠，期间发现取消标志立即返回 `false`。
pub fn sleep_cancellable(clock: &dyn Clock, duration: Duration, cancel: &Arc<AtomicBool>) -> bool {
    let mut remaining = duration;
    while !remaining.is_zero() {
        if cancel.load(Ordering::Relaxed) {
            return false;
        }
        let step = remaining.min(SLEEP_SLICE);
        clock.sleep(step);
        remaining -= step;
    }
    !cancel.load(Ordering::Relaxed)
}
