// Copyright (c) 2025 Kirky.X
//
// Licensed under the MIT License
// See LICENSE file in the project root for full license information.

use crate::config::settings::RetrySettings;
use chrono::{DateTime, Utc};
use std::time::Duration;

/// 重试策略配置
///
/// 指数退避加抖动，所有参数可调而非硬编码契约。
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// 最大尝试次数
    pub max_attempts: i32,
    /// 初始退避时间
    pub initial_backoff: Duration,
    /// 最大退避时间
    pub max_backoff: Duration,
    /// 退避乘数
    pub backoff_multiplier: f64,
    /// 抖动因子 (0.0-1.0)
    pub jitter_factor: f64,
    /// 是否启用抖动
    pub enable_jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(60),
            backoff_multiplier: 2.0,
            jitter_factor: 0.1,
            enable_jitter: true,
        }
    }
}

impl RetryPolicy {
    /// 从配置构造重试策略
    pub fn from_settings(settings: &RetrySettings) -> Self {
        Self {
            max_attempts: settings.max_attempts,
            initial_backoff: Duration::from_secs(settings.backoff_base_secs),
            max_backoff: Duration::from_secs(settings.backoff_max_secs),
            ..Self::default()
        }
    }

    /// 计算下次重试的退避时间
    ///
    /// # 参数
    ///
    /// * `attempt` - 已完成的尝试次数（从1开始）
    pub fn calculate_backoff(&self, attempt: i32) -> Duration {
        let backoff_secs = self.initial_backoff.as_secs_f64()
            * self.backoff_multiplier.powi(attempt.saturating_sub(1));

        let capped_backoff = backoff_secs.min(self.max_backoff.as_secs_f64());

        let final_backoff = if self.enable_jitter {
            let jitter_range = capped_backoff * self.jitter_factor;
            let jitter = if jitter_range > 0.0 {
                rand::random_range(-jitter_range..jitter_range)
            } else {
                0.0
            };
            (capped_backoff + jitter).max(0.0)
        } else {
            capped_backoff
        };

        Duration::from_secs_f64(final_backoff)
    }

    /// 计算下次重试时间
    pub fn next_retry_time(&self, attempt: i32, base_time: DateTime<Utc>) -> DateTime<Utc> {
        let backoff = self.calculate_backoff(attempt);
        base_time + chrono::Duration::milliseconds(backoff.as_millis() as i64)
    }

    /// 是否应该重试
    pub fn should_retry(&self, attempts_made: i32) -> bool {
        attempts_made < self.max_attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_calculate_backoff_exponential() {
        let mut policy = RetryPolicy::default();
        policy.enable_jitter = false; // 禁用抖动以获得精确值

        let backoff1 = policy.calculate_backoff(1);
        assert_eq!(backoff1, Duration::from_secs(1));

        let backoff2 = policy.calculate_backoff(2);
        assert_eq!(backoff2, Duration::from_secs(2)); // 1 * 2^1

        let backoff3 = policy.calculate_backoff(3);
        assert_eq!(backoff3, Duration::from_secs(4)); // 1 * 2^2
    }

    #[test]
    fn test_calculate_backoff_with_jitter() {
        let mut policy = RetryPolicy::default();
        policy.enable_jitter = true;
        policy.jitter_factor = 0.1;

        let backoff = policy.calculate_backoff(2);
        // 应该接近 2 秒，但有 ±10% 的抖动
        let expected = Duration::from_secs(2);
        let jitter_range = Duration::from_millis(200);

        assert!(backoff >= expected - jitter_range);
        assert!(backoff <= expected + jitter_range);
    }

    #[test]
    fn test_calculate_backoff_max_limit() {
        let mut policy = RetryPolicy::default();
        policy.max_backoff = Duration::from_secs(5);
        policy.enable_jitter = false;

        let backoff = policy.calculate_backoff(10);
        assert_eq!(backoff, Duration::from_secs(5)); // 被限制在最大值
    }

    #[test]
    fn test_should_retry() {
        let policy = RetryPolicy::default();

        assert!(policy.should_retry(0));
        assert!(policy.should_retry(1));
        assert!(policy.should_retry(2));
        assert!(!policy.should_retry(3)); // max_attempts = 3
        assert!(!policy.should_retry(4));
    }

    #[test]
    fn test_from_settings() {
        let settings = RetrySettings {
            max_attempts: 5,
            backoff_base_secs: 2,
            backoff_max_secs: 120,
        };
        let policy = RetryPolicy::from_settings(&settings);

        assert_eq!(policy.max_attempts, 5);
        assert_eq!(policy.initial_backoff, Duration::from_secs(2));
        assert_eq!(policy.max_backoff, Duration::from_secs(120));
    }
}
