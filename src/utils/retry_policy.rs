// Copyright (c) 2025 Kirky.X
//
// Licensed under the MIT License
// See LICENSE file in the project root for full license information.

use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};
use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;

/// 工作单元重启策略
///
/// 连续失败按指数退避；短时间内密集崩溃时额外放大延迟；
/// 连续失败次数过多后进入长退避。
#[derive(Debug, Clone)]
pub struct RestartPolicy {
    /// 首次重启延迟
    pub initial: Duration,
    /// 退避乘数
    pub multiplier: f64,
    /// 最大退避时间
    pub max: Duration,
    /// 密集崩溃判定窗口
    pub cluster_window: Duration,
    /// 窗口内达到该次数视为密集崩溃
    pub cluster_threshold: usize,
    /// 密集崩溃时的额外乘数
    pub cooldown_multiplier: f64,
    /// 超过该连续失败次数后使用长退避
    pub max_consecutive: u32,
    /// 长退避时间
    pub long_backoff: Duration,
    /// 存活超过该时间视为稳定，清零连续失败计数
    pub stable_after: Duration,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(1),
            multiplier: 2.0,
            max: Duration::from_secs(120),
            cluster_window: Duration::from_secs(30),
            cluster_threshold: 3,
            cooldown_multiplier: 2.0,
            max_consecutive: 8,
            long_backoff: Duration::from_secs(300),
            stable_after: Duration::from_secs(60),
        }
    }
}

impl RestartPolicy {
    /// 计算第 `consecutive` 次连续失败的基础延迟
    pub fn base_delay(&self, consecutive: u32) -> Duration {
        let exponent = consecutive.saturating_sub(1).min(63) as i32;
        let secs = self.initial.as_secs_f64() * self.multiplier.powi(exponent);
        self.capped(secs)
    }

    /// 乘数取值是否可用：有限且不小于 1
    pub fn multipliers_valid(&self) -> bool {
        [self.multiplier, self.cooldown_multiplier]
            .iter()
            .all(|m| m.is_finite() && *m >= 1.0)
    }

    // 负数或非数值的结果按上限处理
    fn capped(&self, secs: f64) -> Duration {
        Duration::try_from_secs_f64(secs.min(self.max.as_secs_f64())).unwrap_or(self.max)
    }
}

/// 单个工作单元槽位的重启状态
#[derive(Debug, Clone)]
pub struct RestartTracker {
    policy: RestartPolicy,
    consecutive: u32,
    recent: VecDeque<Instant>,
}

impl RestartTracker {
    pub fn new(policy: RestartPolicy) -> Self {
        Self {
            policy,
            consecutive: 0,
            recent: VecDeque::new(),
        }
    }

    pub fn consecutive(&self) -> u32 {
        self.consecutive
    }

    /// 记录一次失败并返回重启前应等待的时间
    ///
    /// # 参数
    ///
    /// * `now` - 失败发生时间
    pub fn record_failure(&mut self, now: Instant) -> Duration {
        self.consecutive += 1;
        self.recent.push_back(now);
        while let Some(front) = self.recent.front() {
            if now.duration_since(*front) > self.policy.cluster_window {
                self.recent.pop_front();
            } else {
                break;
            }
        }

        if self.consecutive > self.policy.max_consecutive {
            return self.policy.long_backoff;
        }

        let base = self.policy.base_delay(self.consecutive);
        if self.recent.len() >= self.policy.cluster_threshold {
            self.policy
                .capped(base.as_secs_f64() * self.policy.cooldown_multiplier)
        } else {
            base
        }
    }

    /// 工作单元存活足够久后调用，清零连续失败计数
    pub fn record_stable(&mut self, uptime: Duration) {
        if uptime >= self.policy.stable_after {
            self.reset();
        }
    }

    pub fn reset(&mut self) {
        self.consecutive = 0;
        self.recent.clear();
    }
}

/// 共享存储操作的重试退避
///
/// # 参数
///
/// * `max_elapsed` - 放弃前的最长累计时间
pub fn store_backoff(max_elapsed: Duration) -> ExponentialBackoff {
    ExponentialBackoffBuilder::new()
        .with_initial_interval(Duration::from_millis(200))
        .with_max_interval(Duration::from_secs(5))
        .with_max_elapsed_time(Some(max_elapsed))
        .build()
}

/// 循环内存储错误的暂停退避，永不放弃
pub fn loop_backoff() -> ExponentialBackoff {
    ExponentialBackoffBuilder::new()
        .with_initial_interval(Duration::from_millis(200))
        .with_max_interval(Duration::from_secs(5))
        .with_max_elapsed_time(None)
        .build()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_delay_exponential_and_capped() {
        let policy = RestartPolicy::default();
        assert_eq!(policy.base_delay(1), Duration::from_secs(1));
        assert_eq!(policy.base_delay(2), Duration::from_secs(2));
        assert_eq!(policy.base_delay(3), Duration::from_secs(4));
        assert_eq!(policy.base_delay(20), Duration::from_secs(120));
    }

    #[test]
    fn test_clustered_crashes_cool_down() {
        let start = Instant::now();
        let mut tracker = RestartTracker::new(RestartPolicy::default());

        let d1 = tracker.record_failure(start);
        let d2 = tracker.record_failure(start + Duration::from_secs(1));
        let d3 = tracker.record_failure(start + Duration::from_secs(3));
        let d4 = tracker.record_failure(start + Duration::from_secs(11));

        assert_eq!(d1, Duration::from_secs(1));
        assert_eq!(d2, Duration::from_secs(2));
        assert_eq!(d3, Duration::from_secs(8));
        assert_eq!(d4, Duration::from_secs(16));
    }

    #[test]
    fn test_spread_out_failures_do_not_cool_down() {
        let start = Instant::now();
        let mut tracker = RestartTracker::new(RestartPolicy::default());

        tracker.record_failure(start);
        tracker.record_failure(start + Duration::from_secs(40));
        let third = tracker.record_failure(start + Duration::from_secs(80));
        assert_eq!(third, Duration::from_secs(4));
    }

    #[test]
    fn test_long_backoff_after_max_consecutive() {
        let start = Instant::now();
        let mut tracker = RestartTracker::new(RestartPolicy::default());

        let mut last = Duration::ZERO;
        for i in 0..9 {
            last = tracker.record_failure(start + Duration::from_secs(i * 100));
        }
        assert_eq!(tracker.consecutive(), 9);
        assert_eq!(last, Duration::from_secs(300));
    }

    #[test]
    fn test_stable_uptime_resets() {
        let start = Instant::now();
        let mut tracker = RestartTracker::new(RestartPolicy::default());
        tracker.record_failure(start);
        tracker.record_failure(start + Duration::from_secs(1));

        tracker.record_stable(Duration::from_secs(10));
        assert_eq!(tracker.consecutive(), 2);

        tracker.record_stable(Duration::from_secs(60));
        assert_eq!(tracker.consecutive(), 0);
        assert_eq!(
            tracker.record_failure(start + Duration::from_secs(200)),
            Duration::from_secs(1)
        );
    }

    #[test]
    fn test_bad_multipliers_never_panic() {
        let policy = RestartPolicy {
            multiplier: -2.0,
            cooldown_multiplier: f64::NAN,
            cluster_threshold: 1,
            ..RestartPolicy::default()
        };
        assert!(!policy.multipliers_valid());
        assert_eq!(policy.base_delay(2), Duration::from_secs(120));

        let mut tracker = RestartTracker::new(policy);
        assert_eq!(tracker.record_failure(Instant::now()), Duration::from_secs(120));
        assert!(RestartPolicy::default().multipliers_valid());
    }
}
