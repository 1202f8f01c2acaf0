//! 指数退避计算。

use std::time::Duration;

/// `base * 2^exponent`，上限 `max`；指数超过 20 时按 20 计算。
pub fn exponential(base: Duration, max: Duration, exponent: u32) -> Duration {
    let factor = 1u32.checked_shl(exponent.min(20)).unwrap_or(u32::MAX);
    base.checked_mul(factor).unwrap_or(max).min(max)
}

/// 第 `attempt` 次重试（从 0 计）前的等待时间，`min_ms`/`max_ms` 为毫秒。
pub fn retry_delay(min_ms: u64, max_ms: u64, attempt: u32) -> Duration {
    let min_ms = min_ms.max(1);
    let max_ms = max_ms.max(min_ms);
    exponential(
        Duration::from_millis(min_ms),
        Duration::from_millis(max_ms),
        attempt,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn doubles_until_capped() {
        let base = Duration::from_secs(30);
        let max = Duration::from_secs(600);
        assert_eq!(exponential(base, max, 0), Duration::from_secs(30));
        assert_eq!(exponential(base, max, 1), Duration::from_secs(60));
        assert_eq!(exponential(base, max, 4), Duration::from_secs(480));
        assert_eq!(exponential(base, max, 5), max);
        assert_eq!(exponential(base, max, 60), max);
    }

    #[test]
    fn retry_delay_respects_bounds() {
        assert_eq!(retry_delay(1000, 8000, 0), Duration::from_millis(1000));
        assert_eq!(retry_delay(1000, 8000, 2), Duration::from_millis(4000));
        assert_eq!(retry_delay(1000, 8000, 9), Duration::from_millis(8000));
        // max 小于 min 时以 min 为准
        assert_eq!(retry_delay(500, 100, 3), Duration::from_millis(500));
    }
}
